//! Attaching the session's bearer credential to outgoing requests.
use http::{header::AUTHORIZATION, HeaderValue};

use crate::{
    error::{Error, Result},
    session::SessionState,
};
#[cfg(feature = "tonic")]
use crate::session::Session;

/// Helper function to ensure that a string is ASCII.
///
/// # Errors
/// Fails with `InvalidHeaderValue` if the string is not ASCII.
pub(crate) fn require_ascii(s: &str) -> Result<()> {
    if s.is_ascii() {
        Ok(())
    } else {
        Err(Error::InvalidHeaderValue)
    }
}

/// Build a sensitive `Bearer` authorization header for `token`.
/// Pass only the token, without the `Bearer` prefix.
///
/// # Errors
/// Fails if "Bearer {token}" is not a valid ASCII header value.
pub fn bearer_header(token: &str) -> Result<HeaderValue> {
    require_ascii(token)?;
    let mut header =
        HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_e| Error::InvalidHeaderValue)?;
    header.set_sensitive(true);
    Ok(header)
}

/// Attach the access token of `state` to `request`.
///
/// Requests are left untouched if the session is empty, or if they already
/// carry an `Authorization` header. The refresh token is never sent.
pub fn decorate(request: &mut reqwest::Request, state: &SessionState) {
    if let Some(header) = state.authorization_header() {
        request
            .headers_mut()
            .entry(AUTHORIZATION)
            .or_insert_with(|| HeaderValue::clone(header));
        tracing::trace!("Attached bearer credential to {} {}", request.method(), request.url());
    }
}

/// gRPC interceptor attaching the current session credential.
///
/// The interceptor does not insert the access token if the intercepted call
/// already has an `Authorization` header. Calls are sent without a credential
/// while the session is empty. No refresh happens on this path.
#[cfg(feature = "tonic")]
#[derive(Debug, Clone)]
pub struct SessionInterceptor {
    session: Session,
}

#[cfg(feature = "tonic")]
impl SessionInterceptor {
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self { session }
    }
}

#[cfg(feature = "tonic")]
impl tonic::service::Interceptor for SessionInterceptor {
    fn call(
        &mut self,
        request: tonic::Request<()>,
    ) -> std::result::Result<tonic::Request<()>, tonic::Status> {
        use std::str::FromStr;

        let state = self.session.get();
        let Some(header) = state.authorization_header() else {
            return Ok(request);
        };

        let mut request = request;
        let metadata = request.metadata_mut();
        if !metadata.contains_key(AUTHORIZATION.as_str()) {
            let header_str = header.to_str().map_err(|e| {
                tonic::Status::unauthenticated(format!("{}: {e}", Error::InvalidHeaderValue))
            })?;
            let mut value = tonic::metadata::MetadataValue::from_str(header_str).map_err(|e| {
                tonic::Status::unauthenticated(format!("{}: {e}", Error::InvalidHeaderValue))
            })?;
            value.set_sensitive(true);
            metadata.insert(AUTHORIZATION.as_str(), value);
        }
        Ok(request)
    }
}

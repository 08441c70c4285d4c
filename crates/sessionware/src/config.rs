use std::time::Duration;

use http::StatusCode;
use typed_builder::TypedBuilder;
use url::Url;

use crate::error::{Error, Result};

/// Configuration of a [`SessionClient`](crate::SessionClient).
///
/// The following configurations are available:
/// * `base_url`: Base URL of the API. Required. Paths are resolved relative to it.
/// * `login_path`: Path of the login endpoint. Default is `auth/login`.
/// * `refresh_path`: Path of the refresh endpoint. Default is `auth/refresh`.
/// * `auth_failure_status`: Status signalling that authentication is needed. Default is `401`.
/// * `event_capacity`: Session events buffered per subscriber. Default is 64.
/// * `timeout`: Timeout for every request, including token requests. Not set by default.
///
/// ```
/// let config = sessionware::SessionConfig::builder()
///     .base_url("https://api.example.com/api".parse().unwrap())
///     .refresh_path("auth/refresh-token")
///     .build();
/// assert_eq!(
///     config.refresh_url().unwrap().as_str(),
///     "https://api.example.com/api/auth/refresh-token"
/// );
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct SessionConfig {
    base_url: Url,
    #[builder(default = "auth/login".to_string(), setter(into))]
    login_path: String,
    #[builder(default = "auth/refresh".to_string(), setter(into))]
    refresh_path: String,
    #[builder(default = StatusCode::UNAUTHORIZED)]
    auth_failure_status: StatusCode,
    #[builder(default = 64)]
    event_capacity: usize,
    #[builder(default, setter(strip_option))]
    timeout: Option<Duration>,
}

impl SessionConfig {
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn auth_failure_status(&self) -> StatusCode {
        self.auth_failure_status
    }

    #[must_use]
    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Resolve `path` against the base URL, treating the base URL as a
    /// directory. Absolute URLs are returned unchanged.
    ///
    /// # Errors
    /// Fails with [`Error::InvalidUrl`] if the result is not a valid URL.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        base.join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidUrl(format!("{path}: {e}")))
    }

    /// # Errors
    /// See [`resolve`](Self::resolve).
    pub fn login_url(&self) -> Result<Url> {
        self.resolve(&self.login_path)
    }

    /// # Errors
    /// See [`resolve`](Self::resolve).
    pub fn refresh_url(&self) -> Result<Url> {
        self.resolve(&self.refresh_path)
    }
}

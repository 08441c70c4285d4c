use std::collections::BTreeSet;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Access token and refresh token of an authenticated session.
///
/// Both tokens are opaque bearer strings. A credential is always complete:
/// construction fails if either token is empty.
#[derive(Clone, PartialEq, Eq, veil::Redact)]
pub struct Credential {
    #[redact]
    access_token: String,
    #[redact]
    refresh_token: String,
}

impl Credential {
    /// Create a new credential.
    ///
    /// # Errors
    /// Fails with [`Error::IncompleteCredential`] if either token is empty.
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Result<Self> {
        let access_token = access_token.into();
        let refresh_token = refresh_token.into();
        if access_token.is_empty() || refresh_token.is_empty() {
            return Err(Error::IncompleteCredential);
        }
        Ok(Self {
            access_token,
            refresh_token,
        })
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    /// Returns a copy with the access token replaced. The refresh token is
    /// replaced as well if the backend rotated it.
    ///
    /// # Errors
    /// Fails with [`Error::IncompleteCredential`] if a replacement token is empty.
    pub fn renewed(&self, access_token: String, refresh_token: Option<String>) -> Result<Self> {
        Self::new(
            access_token,
            refresh_token.unwrap_or_else(|| self.refresh_token.clone()),
        )
    }
}

/// Identity claims projected from the payload of a JWT access token.
///
/// The signature is not verified, the backend remains the authority on
/// whether a token is valid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Claims {
    pub subject: Option<String>,
    pub roles: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
    pub issued_at: Option<i64>,
    pub expires_at: Option<i64>,
    /// Any other members of the payload.
    pub profile: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub: serde_json::Value,
    #[serde(default)]
    roles: serde_json::Value,
    #[serde(default)]
    authorities: serde_json::Value,
    #[serde(default)]
    permissions: serde_json::Value,
    #[serde(default)]
    exp: serde_json::Value,
    #[serde(default)]
    iat: serde_json::Value,
    #[serde(flatten)]
    profile: serde_json::Map<String, serde_json::Value>,
}

/// String members of a JSON array. `None` if `value` is not an array.
fn string_set(value: &serde_json::Value) -> Option<BTreeSet<String>> {
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(serde_json::Value::as_str)
            .map(ToString::to_string)
            .collect()
    })
}

fn subject(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Seconds since the Unix epoch. Fractional seconds are truncated.
#[allow(clippy::cast_possible_truncation)]
fn timestamp(value: &serde_json::Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
}

impl Claims {
    /// Decode the claims of a JWT access token.
    ///
    /// # Errors
    /// Fails with [`Error::InvalidClaims`] if the token is not a JWT or its payload
    /// is not a JSON object.
    pub fn from_access_token(token: &str) -> Result<Self> {
        let mut segments = token.split('.');
        let payload = match (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => return Err(Error::InvalidClaims("token is not a JWT".to_string())),
        };

        let decoded = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| Error::InvalidClaims(e.to_string()))?;
        let raw: RawClaims =
            serde_json::from_slice(&decoded).map_err(|e| Error::InvalidClaims(e.to_string()))?;

        Ok(Claims {
            roles: string_set(&raw.roles)
                .or_else(|| string_set(&raw.authorities))
                .unwrap_or_default(),
            permissions: string_set(&raw.permissions).unwrap_or_default(),
            issued_at: timestamp(&raw.iat),
            expires_at: timestamp(&raw.exp),
            subject: subject(raw.sub),
            profile: raw.profile,
        })
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Whether the token was expired at `now` (seconds since the Unix epoch).
    /// Tokens without an `exp` claim never expire.
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

#[cfg(test)]
pub(crate) fn jwt(payload: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{body}.c2lnbmF0dXJl")
}

use std::sync::Arc;

use http::StatusCode;

pub type Result<T> = std::result::Result<T, Error>;

const SESSION_EXPIRED: &str = "Session expired or invalid. Please log in again.";

#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    #[error("Token cannot be used as a header value. Must be ASCII.")]
    InvalidHeaderValue,
    #[error("Credential requires both a non-empty access token and refresh token")]
    IncompleteCredential,
    #[error("Failed to decode access token claims: {0}")]
    InvalidClaims(String),
    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),
    #[error("Request failed: {0}")]
    Network(#[from] Arc<reqwest::Error>),
    #[error("Server responded with {status}: {}", message.as_deref().unwrap_or("no message"))]
    Server {
        status: StatusCode,
        message: Option<String>,
    },
    #[error("Login rejected with {status}: {}", message.as_deref().unwrap_or("no message"))]
    LoginRejected {
        status: StatusCode,
        message: Option<String>,
    },
    #[error("Refresh token exchange failed: {0}")]
    AuthExchangeFailure(String),
    #[error("Request was rejected as unauthorized again after the session was refreshed")]
    AuthRetryExhausted,
    #[error("Session is unavailable, the session client was shut down")]
    SessionUnavailable,
    #[error("Request body cannot be replayed after an authentication failure")]
    NotReplayable,
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("Session store failed: {0}")]
    Store(String),
}

impl Error {
    /// Errors after which the caller has to authenticate again.
    #[must_use]
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            Error::AuthExchangeFailure(_) | Error::AuthRetryExhausted | Error::SessionUnavailable
        )
    }

    /// Text suitable for a user-facing notification.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            _ if self.is_session_error() => SESSION_EXPIRED.to_string(),
            Error::Network(_) => {
                "No response from server. Please check your network connection.".to_string()
            }
            Error::Server { status, message } => {
                let fallback = match *status {
                    StatusCode::FORBIDDEN => {
                        "You do not have permission to perform this action.".to_string()
                    }
                    StatusCode::NOT_FOUND => "The requested resource was not found.".to_string(),
                    s if s.is_server_error() => {
                        "A server error occurred. Please try again later.".to_string()
                    }
                    s => format!("Request failed with status {}", s.as_u16()),
                };
                message.clone().unwrap_or(fallback)
            }
            Error::LoginRejected { status, message } => match *status {
                StatusCode::UNAUTHORIZED => {
                    "Login failed. Please check your credentials.".to_string()
                }
                _ => message
                    .clone()
                    .unwrap_or_else(|| "Login failed. Please check your credentials.".to_string()),
            },
            other => other.to_string(),
        }
    }

    /// Builds a [`Error::Server`] from a non-success response, reading the
    /// `message` (or `error`) member of a JSON body when present.
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let message = response
            .bytes()
            .await
            .ok()
            .and_then(|body| error_message(&body));
        Error::Server { status, message }
    }
}

pub(crate) fn error_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    ["message", "error"]
        .iter()
        .find_map(|key| value.get(key).and_then(serde_json::Value::as_str))
        .map(ToString::to_string)
}

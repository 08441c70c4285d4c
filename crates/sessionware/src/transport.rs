use std::fmt;

use async_trait::async_trait;
use http::StatusCode;

/// Executes requests against the backend without any knowledge of the session.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send `request` and return the raw response.
    ///
    /// # Errors
    /// Fails only if no response was received.
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error>;
}

#[async_trait]
impl Transport for reqwest::Client {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error> {
        reqwest::Client::execute(self, request).await
    }
}

/// Coarse classification of a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    /// The backend asks for authentication. Handled by the refresh coordinator.
    AuthFailure,
    /// Any other failure status. Passed through to the caller.
    Failure,
}

impl ResponseClass {
    #[must_use]
    pub fn of(status: StatusCode, auth_failure_status: StatusCode) -> Self {
        if status == auth_failure_status {
            ResponseClass::AuthFailure
        } else if status.is_success() {
            ResponseClass::Success
        } else {
            // 1xx and 3xx that reach this point were not followed by the client.
            ResponseClass::Failure
        }
    }
}

//! Client side of the backend authentication service.
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    credential::Credential,
    error::{error_message, Error, Result},
};

/// Login form submitted to the authentication service.
#[derive(Clone, Serialize, veil::Redact)]
pub struct LoginRequest {
    pub email: String,
    #[redact]
    pub password: String,
}

impl LoginRequest {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// Result of a successful refresh-token exchange.
#[derive(Clone, PartialEq, Eq, veil::Redact)]
pub struct RefreshedTokens {
    #[redact]
    pub access_token: String,
    /// Set if the backend rotated the refresh token.
    #[redact]
    pub refresh_token: Option<String>,
}

/// The two operations of the authentication service the session relies on.
#[async_trait]
pub trait AuthService: Send + Sync + fmt::Debug {
    /// Exchange credentials for a new session.
    ///
    /// # Errors
    /// Fails with [`Error::LoginRejected`] if the service refuses the login.
    async fn login(&self, request: &LoginRequest) -> Result<Credential>;

    /// Exchange `refresh_token` for a new access token.
    ///
    /// # Errors
    /// Fails with [`Error::AuthExchangeFailure`] if the service rejects the
    /// refresh token or cannot be reached.
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(alias = "accessToken")]
    token: String,
    refresh_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshTokenRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// [`AuthService`] talking JSON over HTTP.
///
/// `POST {login_url}` takes `{"email", "password"}` and answers
/// `{"token", "refreshToken", "expiresIn"}`. `POST {refresh_url}` takes
/// `{"refreshToken"}` and answers `{"accessToken", "expiresIn"}`, optionally
/// with a rotated `refreshToken`.
#[derive(Debug, Clone)]
pub struct HttpAuthService {
    http_client: reqwest::Client,
    login_url: Url,
    refresh_url: Url,
}

impl HttpAuthService {
    #[must_use]
    pub fn new(http_client: reqwest::Client, login_url: Url, refresh_url: Url) -> Self {
        Self {
            http_client,
            login_url,
            refresh_url,
        }
    }
}

fn exchange_failure(e: impl fmt::Display) -> Error {
    Error::AuthExchangeFailure(e.to_string())
}

#[async_trait]
impl AuthService for HttpAuthService {
    async fn login(&self, request: &LoginRequest) -> Result<Credential> {
        let response = self
            .http_client
            .post(self.login_url.clone())
            .json(request)
            .send()
            .await
            .map_err(Arc::new)?;

        let status = response.status();
        let body = response.bytes().await.map_err(Arc::new)?;
        if !status.is_success() {
            tracing::debug!("Login for `{}` rejected with {status}", request.email);
            return Err(Error::LoginRejected {
                status,
                message: error_message(&body),
            });
        }

        let login: LoginResponse =
            serde_json::from_slice(&body).map_err(|e| Error::ParseError(e.to_string()))?;
        tracing::debug!("Logged in as `{}`", request.email);
        Credential::new(login.token, login.refresh_token)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens> {
        let response = self
            .http_client
            .post(self.refresh_url.clone())
            .json(&RefreshTokenRequest { refresh_token })
            .send()
            .await
            .map_err(exchange_failure)?;

        let status = response.status();
        let body = response.bytes().await.map_err(exchange_failure)?;
        if !status.is_success() {
            let reason = error_message(&body).unwrap_or_else(|| "no message".to_string());
            return Err(Error::AuthExchangeFailure(format!(
                "refresh endpoint responded with {status}: {reason}"
            )));
        }

        let refreshed: RefreshTokenResponse =
            serde_json::from_slice(&body).map_err(exchange_failure)?;
        if refreshed.access_token.is_empty() {
            return Err(exchange_failure("refresh endpoint returned an empty access token"));
        }
        Ok(RefreshedTokens {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token.filter(|t| !t.is_empty()),
        })
    }
}

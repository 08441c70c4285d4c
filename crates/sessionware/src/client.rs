use std::sync::Arc;

use http::header::AUTHORIZATION;

use crate::{
    auth_service::{AuthService, HttpAuthService, LoginRequest},
    config::SessionConfig,
    coordinator::RefreshCoordinator,
    decorator::decorate,
    error::{Error, Result},
    events::{LogoutReason, SessionEvents},
    session::{CredentialOrigin, Session, SessionState},
    store::{MemorySessionStore, SessionStore},
    transport::{ResponseClass, Transport},
};

/// Retries granted to a request after a successful refresh.
const MAX_AUTH_RETRIES: u32 = 1;

/// HTTP client that keeps an authenticated session against one backend.
///
/// Every request is sent with the current access token. If the backend
/// rejects it, the access token is renewed once for all concurrent callers
/// and the request is replayed. A session that cannot be renewed is cleared
/// and a [`LoggedOut`](crate::SessionEvent::LoggedOut) event is published.
///
/// Uses `Arc` internally for cheap cloning.
#[derive(Debug, Clone)]
pub struct SessionClient {
    config: Arc<SessionConfig>,
    session: Session,
    coordinator: RefreshCoordinator,
    auth_service: Arc<dyn AuthService>,
    transport: Arc<dyn Transport>,
    http_client: reqwest::Client,
}

fn build_http_client(config: &SessionConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = config.timeout() {
        builder = builder.timeout(timeout);
    }
    builder.build().map_err(Arc::new).map_err(Into::into)
}

impl SessionClient {
    /// Creates a new `SessionClient` with an in-memory session.
    ///
    /// # Errors
    /// Fails if the login or refresh URL cannot be resolved, or the HTTP
    /// client cannot be built.
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(MemorySessionStore::new()))
    }

    /// Creates a new `SessionClient`, restoring the session persisted in `store`.
    ///
    /// # Errors
    /// See [`new`](Self::new).
    pub fn with_store(config: SessionConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        let http_client = build_http_client(&config)?;
        let auth_service = HttpAuthService::new(
            http_client.clone(),
            config.login_url()?,
            config.refresh_url()?,
        );
        let session = Session::restore(store, SessionEvents::new(config.event_capacity()));
        let transport = Arc::new(http_client.clone());

        Ok(Self::assemble(
            config,
            session,
            transport,
            Arc::new(auth_service),
            http_client,
        ))
    }

    /// Creates a new `SessionClient` from custom parts.
    ///
    /// # Errors
    /// Fails if the HTTP client used for building requests cannot be built.
    pub fn from_parts(
        config: SessionConfig,
        session: Session,
        transport: Arc<dyn Transport>,
        auth_service: Arc<dyn AuthService>,
    ) -> Result<Self> {
        let http_client = build_http_client(&config)?;
        Ok(Self::assemble(
            config,
            session,
            transport,
            auth_service,
            http_client,
        ))
    }

    fn assemble(
        config: SessionConfig,
        session: Session,
        transport: Arc<dyn Transport>,
        auth_service: Arc<dyn AuthService>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            config: Arc::new(config),
            coordinator: RefreshCoordinator::new(session.clone(), auth_service.clone()),
            session,
            auth_service,
            transport,
            http_client,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The session shared by all clones of this client.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn events(&self) -> &SessionEvents {
        self.session.events()
    }

    /// Start building a `Request` to `path`, resolved against the base URL.
    ///
    /// The credential is attached when the request is passed to
    /// [`send`](Self::send) or [`send_builder`](Self::send_builder).
    /// Sending the builder directly bypasses the session.
    ///
    /// # Errors
    /// Fails if `path` cannot be resolved to a valid URL.
    pub fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let url = self.config.resolve(path)?;
        Ok(self.http_client.request(method, url))
    }

    /// Convenience method to make a `GET` request to a path.
    ///
    /// # Errors
    /// See [`request`](Self::request).
    pub fn get(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        self.request(reqwest::Method::GET, path)
    }

    /// Convenience method to make a `POST` request to a path.
    ///
    /// # Errors
    /// See [`request`](Self::request).
    pub fn post(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        self.request(reqwest::Method::POST, path)
    }

    /// Convenience method to make a `PUT` request to a path.
    ///
    /// # Errors
    /// See [`request`](Self::request).
    pub fn put(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        self.request(reqwest::Method::PUT, path)
    }

    /// Convenience method to make a `PATCH` request to a path.
    ///
    /// # Errors
    /// See [`request`](Self::request).
    pub fn patch(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        self.request(reqwest::Method::PATCH, path)
    }

    /// Convenience method to make a `DELETE` request to a path.
    ///
    /// # Errors
    /// See [`request`](Self::request).
    pub fn delete(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        self.request(reqwest::Method::DELETE, path)
    }

    /// Convenience method to make a `HEAD` request to a path.
    ///
    /// # Errors
    /// See [`request`](Self::request).
    pub fn head(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        self.request(reqwest::Method::HEAD, path)
    }

    /// Build and [`send`](Self::send) a request.
    ///
    /// # Errors
    /// See [`send`](Self::send).
    pub async fn send_builder(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let request = builder.build().map_err(Arc::new)?;
        self.send(request).await
    }

    /// Execute a `Request` with the current credential, renewing it once if
    /// the backend rejects it.
    ///
    /// An `Authorization` header already present on `request` is kept. Such a
    /// request never logs the session out.
    ///
    /// # Errors
    /// - [`Error::Network`] if no response was received. Never retried.
    /// - [`Error::Server`] for any failure status other than the configured
    ///   authentication failure status.
    /// - [`Error::AuthExchangeFailure`] if the credential could not be renewed.
    /// - [`Error::AuthRetryExhausted`] if the request was rejected again
    ///   after a successful renewal.
    /// - [`Error::NotReplayable`] if the request was rejected and its body
    ///   cannot be sent a second time.
    /// - [`Error::SessionUnavailable`] after [`shutdown`](Self::shutdown).
    pub async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let caller_authorized = request.headers().contains_key(AUTHORIZATION);
        let mut request = request;
        let mut state = self.session.get();
        let mut retries = 0;

        loop {
            let replay = request.try_clone();
            decorate(&mut request, &state);
            let sent_with = if caller_authorized {
                None
            } else {
                state.access_token().map(ToString::to_string)
            };

            let response = self.transport.execute(request).await.map_err(Arc::new)?;
            match ResponseClass::of(response.status(), self.config.auth_failure_status()) {
                ResponseClass::Success => return Ok(response),
                ResponseClass::Failure => return Err(Error::from_response(response).await),
                ResponseClass::AuthFailure => {}
            }

            if retries >= MAX_AUTH_RETRIES {
                tracing::warn!(
                    "Request to {} rejected again after renewing the session",
                    response.url()
                );
                if let Some(token) = &sent_with {
                    self.session
                        .clear_if_current(token, LogoutReason::RetryExhausted);
                }
                return Err(Error::AuthRetryExhausted);
            }
            let Some(replay) = replay else {
                tracing::debug!("Rejected request to {} cannot be replayed", response.url());
                return Err(Error::NotReplayable);
            };

            tracing::debug!("Request to {} rejected, renewing session", response.url());
            state = self.coordinator.recover(sent_with.as_deref()).await?;
            request = replay;
            retries += 1;
        }
    }

    /// Log in with `email` and `password`, replacing the current session.
    ///
    /// # Errors
    /// - [`Error::LoginRejected`] if the backend refuses the login.
    /// - [`Error::Network`] if the backend cannot be reached.
    pub async fn login(&self, email: &str, password: &str) -> Result<Arc<SessionState>> {
        let credential = self
            .auth_service
            .login(&LoginRequest::new(email, password))
            .await?;
        self.session.set(credential, CredentialOrigin::Login)
    }

    /// End the session on the user's request.
    /// Returns `false` if there was no session.
    pub fn logout(&self) -> bool {
        self.session.clear(LogoutReason::UserRequested)
    }

    /// Stop renewing the session. Callers waiting for a renewal fail with
    /// [`Error::SessionUnavailable`]. The session itself is kept.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}

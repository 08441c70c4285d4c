use std::sync::{Arc, Mutex, RwLock};

use http::HeaderValue;

use crate::{
    credential::{Claims, Credential},
    decorator::bearer_header,
    error::Result,
    events::{LogoutReason, SessionEvent, SessionEvents},
    store::SessionStore,
};

/// Immutable snapshot of the session.
///
/// Either empty, or holding a complete credential together with the
/// authorization header derived from it.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    credential: Option<Credential>,
    identity: Option<Arc<Claims>>,
    authorization: Option<Arc<HeaderValue>>,
}

impl SessionState {
    fn authenticated(credential: Credential, identity: Option<Claims>) -> Result<Self> {
        let authorization = bearer_header(credential.access_token())?;
        Ok(Self {
            credential: Some(credential),
            identity: identity.map(Arc::new),
            authorization: Some(Arc::new(authorization)),
        })
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.credential.is_some()
    }

    #[must_use]
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Claims of the access token. Absent for opaque (non-JWT) tokens.
    #[must_use]
    pub fn identity(&self) -> Option<&Arc<Claims>> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.credential.as_ref().map(Credential::access_token)
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.credential.as_ref().map(Credential::refresh_token)
    }

    /// The `Bearer` authorization header for the current access token.
    #[must_use]
    pub fn authorization_header(&self) -> Option<&Arc<HeaderValue>> {
        self.authorization.as_ref()
    }
}

/// How a credential entered the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOrigin {
    /// A full login. Publishes [`SessionEvent::LoggedIn`].
    Login,
    /// A refresh-token exchange. Publishes [`SessionEvent::CredentialChanged`].
    Refresh,
}

/// Owner of the current session.
///
/// Readers get a snapshot via [`Session::get`] which never waits on a
/// writer for longer than a pointer swap. Every change is persisted to the
/// [`SessionStore`] and announced on the [`SessionEvents`] bus, in the
/// order the changes were made.
///
/// Uses `Arc` internally for cheap cloning.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: RwLock<Arc<SessionState>>,
    /// Serializes writers across persisting, swapping and publishing.
    /// Never held by readers.
    writer: Mutex<()>,
    store: Arc<dyn SessionStore>,
    events: SessionEvents,
}

impl Session {
    /// Create an empty session. The store is not consulted.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, events: SessionEvents) -> Self {
        Self::with_state(SessionState::default(), store, events)
    }

    /// Create a session from the credential persisted in `store`.
    ///
    /// The session starts out empty if the store holds nothing, cannot be
    /// read, or holds an access token whose claims cannot be decoded.
    /// Nothing is published and nothing is written back to the store.
    #[must_use]
    pub fn restore(store: Arc<dyn SessionStore>, events: SessionEvents) -> Self {
        let state = match store.load() {
            Ok(Some(credential)) => match Claims::from_access_token(credential.access_token()) {
                Ok(claims) => SessionState::authenticated(credential, Some(claims))
                    .inspect_err(|e| tracing::warn!("Discarding persisted session: {e}"))
                    .unwrap_or_default(),
                Err(e) => {
                    tracing::warn!("Discarding persisted session: {e}");
                    SessionState::default()
                }
            },
            Ok(None) => SessionState::default(),
            Err(e) => {
                tracing::warn!("Failed to load persisted session: {e}");
                SessionState::default()
            }
        };
        if state.is_authenticated() {
            tracing::debug!("Restored persisted session");
        }
        Self::with_state(state, store, events)
    }

    fn with_state(state: SessionState, store: Arc<dyn SessionStore>, events: SessionEvents) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(Arc::new(state)),
                writer: Mutex::new(()),
                store,
                events,
            }),
        }
    }

    /// The last known session state.
    #[must_use]
    pub fn get(&self) -> Arc<SessionState> {
        self.inner.state.read().expect("Non-poisoned lock").clone()
    }

    #[must_use]
    pub fn events(&self) -> &SessionEvents {
        &self.inner.events
    }

    /// Replace the session with `credential`.
    ///
    /// Claims are re-derived from the new access token; opaque tokens yield
    /// no identity. The credential is persisted, then a [`SessionEvent`]
    /// matching `origin` is published. A failing store is logged; the
    /// in-memory session stays authoritative.
    ///
    /// # Errors
    /// Fails if the access token cannot be used as a header value. The session
    /// is left unchanged in that case.
    pub fn set(&self, credential: Credential, origin: CredentialOrigin) -> Result<Arc<SessionState>> {
        let identity = Claims::from_access_token(credential.access_token())
            .inspect_err(|e| tracing::debug!("Access token carries no readable claims: {e}"))
            .ok();
        let state = Arc::new(SessionState::authenticated(credential, identity)?);

        let _writer = self.inner.writer.lock().expect("Non-poisoned lock");
        if let Some(credential) = state.credential() {
            if let Err(e) = self.inner.store.save(credential) {
                tracing::warn!("Failed to persist session credential: {e}");
            }
        }
        self.swap(state.clone());

        let identity = state.identity().cloned();
        self.inner.events.publish(match origin {
            CredentialOrigin::Login => SessionEvent::LoggedIn { identity },
            CredentialOrigin::Refresh => SessionEvent::CredentialChanged { identity },
        });
        Ok(state)
    }

    /// Clear the session, erase the persisted credential and publish
    /// [`SessionEvent::LoggedOut`].
    ///
    /// Returns `false` without publishing if the session was already empty.
    pub fn clear(&self, reason: LogoutReason) -> bool {
        self.clear_matching(|_| true, reason)
    }

    /// Clear the session only if it still holds `access_token`.
    ///
    /// Protects a newer session, e.g. from a concurrent login, from being
    /// cleared because of a failure that happened with an older token.
    pub(crate) fn clear_if_current(&self, access_token: &str, reason: LogoutReason) -> bool {
        self.clear_matching(|state| state.access_token() == Some(access_token), reason)
    }

    fn clear_matching(&self, matches: impl Fn(&SessionState) -> bool, reason: LogoutReason) -> bool {
        let _writer = self.inner.writer.lock().expect("Non-poisoned lock");
        let current = self.get();
        if !current.is_authenticated() || !matches(&*current) {
            return false;
        }
        if let Err(e) = self.inner.store.erase() {
            tracing::warn!("Failed to erase persisted session credential: {e}");
        }
        self.swap(Arc::new(SessionState::default()));

        if reason.is_forced() {
            tracing::warn!("Session ended: {reason:?}");
        } else {
            tracing::debug!("Session ended: {reason:?}");
        }
        self.inner.events.publish(SessionEvent::LoggedOut { reason });
        true
    }

    /// Replace the snapshot. The state lock is held only for the swap.
    fn swap(&self, state: Arc<SessionState>) {
        *self.inner.state.write().expect("Non-poisoned lock") = state;
    }
}

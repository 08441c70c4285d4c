//! Single-flight recovery from authentication failures.
//!
//! The coordinator is either idle or refreshing. The first caller reporting
//! an authentication failure while idle starts the one refresh-token
//! exchange; every caller arriving while it is in flight queues behind it.
//! When the exchange resolves, all queued callers receive the same outcome.
use std::sync::{Arc, Mutex};

use tokio::{sync::oneshot, task::AbortHandle};

use crate::{
    auth_service::AuthService,
    error::{Error, Result},
    events::LogoutReason,
    session::{CredentialOrigin, Session, SessionState},
};

type RefreshOutcome = Result<Arc<SessionState>>;

/// A caller waiting for the in-flight exchange.
#[derive(Debug)]
struct PendingRequest {
    result_channel: oneshot::Sender<RefreshOutcome>,
}

/// The refreshing flag and the queue. Only ever mutated together.
#[derive(Debug, Default)]
struct RefreshState {
    refreshing: bool,
    pending: Vec<PendingRequest>,
    exchange: Option<AbortHandle>,
    shut_down: bool,
}

/// Coordinates refresh-token exchanges so that at most one is in flight.
///
/// The exchange runs on its own task. A caller that stops waiting does not
/// cancel it for the others, and every queued caller is resolved exactly
/// once, even if the exchange panics or the coordinator is shut down.
///
/// Uses `Arc` internally for cheap cloning.
#[derive(Debug, Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    session: Session,
    auth_service: Arc<dyn AuthService>,
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new(session: Session, auth_service: Arc<dyn AuthService>) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                auth_service,
                state: Mutex::new(RefreshState::default()),
            }),
        }
    }

    /// Whether an exchange is currently in flight.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.inner.state.lock().expect("Non-poisoned lock").refreshing
    }

    /// Number of callers waiting for the in-flight exchange.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.state.lock().expect("Non-poisoned lock").pending.len()
    }

    /// Recover from an authentication failure of a request that was sent
    /// with `rejected_token` (or without a credential).
    ///
    /// Joins the in-flight exchange or starts one. If the session already
    /// moved past `rejected_token`, the current session is returned without
    /// an exchange.
    ///
    /// # Errors
    /// - [`Error::AuthExchangeFailure`] if the exchange failed or no refresh
    ///   token was available. The session has been cleared.
    /// - [`Error::SessionUnavailable`] if the coordinator was shut down.
    pub async fn recover(&self, rejected_token: Option<&str>) -> Result<Arc<SessionState>> {
        let receiver = {
            let mut state = self.inner.state.lock().expect("Non-poisoned lock");
            if state.shut_down {
                return Err(Error::SessionUnavailable);
            }

            if !state.refreshing {
                let current = self.inner.session.get();
                if current.is_authenticated() && current.access_token() != rejected_token {
                    tracing::debug!("Session changed since the request was sent. Retrying with the current credential.");
                    return Ok(current);
                }
            }

            let (result_channel, receiver) = oneshot::channel();
            state.pending.push(PendingRequest { result_channel });

            if state.refreshing {
                tracing::debug!(
                    "Refresh already in flight. Queued behind it ({} waiting).",
                    state.pending.len()
                );
            } else {
                state.refreshing = true;
                let inner = self.inner.clone();
                let exchange = tokio::spawn(inner.run_exchange());
                state.exchange = Some(exchange.abort_handle());
            }
            receiver
        };

        receiver.await.unwrap_or(Err(Error::SessionUnavailable))
    }

    /// Stop accepting recoveries and fail every queued caller with
    /// [`Error::SessionUnavailable`]. An in-flight exchange is aborted.
    pub fn shutdown(&self) {
        let (exchange, pending) = {
            let mut state = self.inner.state.lock().expect("Non-poisoned lock");
            state.shut_down = true;
            state.refreshing = false;
            (state.exchange.take(), std::mem::take(&mut state.pending))
        };
        if let Some(exchange) = exchange {
            exchange.abort();
        }
        if !pending.is_empty() {
            tracing::debug!("Shutting down with {} queued callers", pending.len());
        }
        resolve(pending, &Err(Error::SessionUnavailable));
    }
}

impl Inner {
    async fn run_exchange(self: Arc<Self>) {
        let mut guard = ExchangeGuard {
            inner: self.as_ref(),
            settled: false,
        };
        let current = self.session.get();
        let outcome = self.exchange(&current).await.map_err(|e| match e {
            Error::AuthExchangeFailure(_) => e,
            other => Error::AuthExchangeFailure(other.to_string()),
        });
        guard.settle(outcome, &current);
    }

    async fn exchange(&self, current: &SessionState) -> RefreshOutcome {
        let Some(credential) = current.credential() else {
            return Err(Error::AuthExchangeFailure(
                "no refresh token available".to_string(),
            ));
        };

        tracing::debug!("Exchanging refresh token for a new access token");
        let refreshed = self.auth_service.refresh(credential.refresh_token()).await?;

        let latest = self.session.get();
        if latest.refresh_token() != Some(credential.refresh_token()) {
            tracing::debug!("Session changed during refresh. Discarding the exchanged token.");
            return if latest.is_authenticated() {
                Ok(latest)
            } else {
                Err(Error::AuthExchangeFailure(
                    "session ended during refresh".to_string(),
                ))
            };
        }

        if refreshed.refresh_token.is_some() {
            tracing::debug!("Refresh token was rotated");
        }
        let renewed = credential.renewed(refreshed.access_token, refreshed.refresh_token)?;
        self.session.set(renewed, CredentialOrigin::Refresh)
    }

    /// Back to idle. Returns the callers that were waiting.
    fn finish(&self) -> Vec<PendingRequest> {
        let mut state = self.state.lock().expect("Non-poisoned lock");
        state.refreshing = false;
        state.exchange = None;
        std::mem::take(&mut state.pending)
    }
}

/// Resolves the queue if the exchange task ends without settling, which
/// happens when it is aborted or panics.
struct ExchangeGuard<'a> {
    inner: &'a Inner,
    settled: bool,
}

impl ExchangeGuard<'_> {
    /// Resolve the queue with `outcome` of an exchange started from `exchanged`.
    ///
    /// A failure only ends the session it was started from. If another
    /// credential replaced it in the meantime, the queue is resumed with that one.
    fn settle(&mut self, outcome: RefreshOutcome, exchanged: &SessionState) {
        self.settled = true;
        let outcome = match outcome {
            Ok(state) => {
                tracing::debug!("Session refreshed");
                Ok(state)
            }
            Err(e) => {
                let latest = self.inner.session.get();
                if latest.is_authenticated() && latest.access_token() != exchanged.access_token() {
                    tracing::debug!("Refresh failed for a replaced session, resuming with the current one: {e}");
                    Ok(latest)
                } else {
                    tracing::warn!("Failed to refresh session: {e}");
                    if let Some(access_token) = exchanged.access_token() {
                        self.inner
                            .session
                            .clear_if_current(access_token, LogoutReason::SessionExpired);
                    }
                    Err(e)
                }
            }
        };
        let pending = self.inner.finish();
        tracing::debug!("Resuming {} queued callers", pending.len());
        resolve(pending, &outcome);
    }
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let pending = self.inner.finish();
            resolve(pending, &Err(Error::SessionUnavailable));
        }
    }
}

fn resolve(pending: Vec<PendingRequest>, outcome: &RefreshOutcome) {
    for request in pending {
        if request.result_channel.send(outcome.clone()).is_err() {
            tracing::trace!("Queued caller stopped waiting, discarding refresh outcome");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::{
        auth_service::{LoginRequest, RefreshedTokens},
        credential::Credential,
    };

    /// Scripted authentication service. Refreshes wait on `gate` when set.
    #[derive(Debug)]
    pub(crate) struct ScriptedAuthService {
        refresh_calls: AtomicUsize,
        refresh_outcome: Mutex<Result<RefreshedTokens>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedAuthService {
        pub(crate) fn renewing(access_token: &str, refresh_token: Option<&str>) -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                refresh_outcome: Mutex::new(Ok(RefreshedTokens {
                    access_token: access_token.to_string(),
                    refresh_token: refresh_token.map(ToString::to_string),
                })),
                gate: None,
            }
        }

        pub(crate) fn rejecting() -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                refresh_outcome: Mutex::new(Err(Error::AuthExchangeFailure(
                    "refresh endpoint responded with 403 Forbidden: Invalid refresh token"
                        .to_string(),
                ))),
                gate: None,
            }
        }

        pub(crate) fn gated(mut self) -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            self.gate = Some(gate.clone());
            (self, gate)
        }

        pub(crate) fn refresh_calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthService for ScriptedAuthService {
        async fn login(&self, request: &LoginRequest) -> Result<Credential> {
            Credential::new(format!("login-{}", request.email), "login-refresh")
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedTokens> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate open").forget();
            }
            self.refresh_outcome.lock().unwrap().clone()
        }
    }

    pub(crate) async fn wait_for_queue(coordinator: &RefreshCoordinator, len: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.queued() < len {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("callers did not queue up in time");
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::{test_support::*, *};
    use crate::{
        credential::Credential,
        events::{SessionEvent, SessionEventKind, SessionEvents},
        store::{MemorySessionStore, SessionStore},
    };

    fn logged_in_session(store: &Arc<MemorySessionStore>) -> Session {
        let session = Session::new(store.clone(), SessionEvents::default());
        session
            .set(Credential::new("A1", "R1").unwrap(), CredentialOrigin::Login)
            .unwrap();
        session
    }

    async fn recover_concurrently(
        coordinator: &RefreshCoordinator,
        callers: usize,
    ) -> Vec<tokio::task::JoinHandle<RefreshOutcome>> {
        let handles = (0..callers)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.recover(Some("A1")).await })
            })
            .collect::<Vec<_>>();
        wait_for_queue(coordinator, callers).await;
        handles
    }

    #[tokio::test]
    #[traced_test]
    async fn test_single_exchange_for_concurrent_failures() {
        let store = Arc::new(MemorySessionStore::new());
        let session = logged_in_session(&store);
        let mut events = session.events().subscribe();
        let (auth_service, gate) = ScriptedAuthService::renewing("A2", None).gated();
        let auth_service = Arc::new(auth_service);
        let coordinator = RefreshCoordinator::new(session.clone(), auth_service.clone());

        let handles = recover_concurrently(&coordinator, 5).await;
        assert!(coordinator.is_refreshing());
        gate.add_permits(1);

        for handle in handles {
            let state = handle.await.unwrap().unwrap();
            assert_eq!(state.access_token(), Some("A2"));
        }
        assert_eq!(auth_service.refresh_calls(), 1);
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.queued(), 0);
        assert_eq!(store.load().unwrap(), Some(Credential::new("A2", "R1").unwrap()));
        assert_eq!(
            events.recv().await.unwrap().kind(),
            SessionEventKind::CredentialChanged
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_exchange_fails_every_caller_and_logs_out_once() {
        let store = Arc::new(MemorySessionStore::new());
        let session = logged_in_session(&store);
        let mut events = session.events().subscribe();
        let (auth_service, gate) = ScriptedAuthService::rejecting().gated();
        let auth_service = Arc::new(auth_service);
        let coordinator = RefreshCoordinator::new(session.clone(), auth_service.clone());

        let handles = recover_concurrently(&coordinator, 3).await;
        gate.add_permits(1);

        for handle in handles {
            let error = handle.await.unwrap().unwrap_err();
            assert!(matches!(error, Error::AuthExchangeFailure(_)));
        }
        assert_eq!(auth_service.refresh_calls(), 1);
        assert!(!session.get().is_authenticated());
        assert_eq!(store.load().unwrap(), None);

        match events.recv().await.unwrap() {
            SessionEvent::LoggedOut { reason } => assert_eq!(reason, LogoutReason::SessionExpired),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_exchange_keeps_login_made_meanwhile() {
        let store = Arc::new(MemorySessionStore::new());
        let session = logged_in_session(&store);
        let (auth_service, gate) = ScriptedAuthService::rejecting().gated();
        let auth_service = Arc::new(auth_service);
        let coordinator = RefreshCoordinator::new(session.clone(), auth_service.clone());

        let handles = recover_concurrently(&coordinator, 2).await;
        let mut events = session.events().subscribe();
        session
            .set(Credential::new("B1", "RB").unwrap(), CredentialOrigin::Login)
            .unwrap();
        gate.add_permits(1);

        for handle in handles {
            let state = handle.await.unwrap().unwrap();
            assert_eq!(state.access_token(), Some("B1"));
        }
        assert_eq!(auth_service.refresh_calls(), 1);
        assert_eq!(session.get().access_token(), Some("B1"));
        assert_eq!(store.load().unwrap(), Some(Credential::new("B1", "RB").unwrap()));
        assert_eq!(events.recv().await.unwrap().kind(), SessionEventKind::LoggedIn);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_refresh_token_fails_without_exchange() {
        let session = Session::new(Arc::new(MemorySessionStore::new()), SessionEvents::default());
        let mut events = session.events().subscribe();
        let auth_service = Arc::new(ScriptedAuthService::renewing("A2", None));
        let coordinator = RefreshCoordinator::new(session, auth_service.clone());

        let error = coordinator.recover(None).await.unwrap_err();

        assert!(matches!(error, Error::AuthExchangeFailure(_)));
        assert_eq!(auth_service.refresh_calls(), 0);
        // There was no session to log out of.
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stale_rejection_reuses_current_session() {
        let session = Session::new(Arc::new(MemorySessionStore::new()), SessionEvents::default());
        session
            .set(Credential::new("A2", "R1").unwrap(), CredentialOrigin::Refresh)
            .unwrap();
        let auth_service = Arc::new(ScriptedAuthService::renewing("A3", None));
        let coordinator = RefreshCoordinator::new(session, auth_service.clone());

        let state = coordinator.recover(Some("A1")).await.unwrap();

        assert_eq!(state.access_token(), Some("A2"));
        assert_eq!(auth_service.refresh_calls(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_rotated_refresh_token_is_persisted() {
        let store = Arc::new(MemorySessionStore::new());
        let session = logged_in_session(&store);
        let auth_service = Arc::new(ScriptedAuthService::renewing("A2", Some("R2")));
        let coordinator = RefreshCoordinator::new(session.clone(), auth_service);

        let state = coordinator.recover(Some("A1")).await.unwrap();

        assert_eq!(state.refresh_token(), Some("R2"));
        assert_eq!(store.load().unwrap(), Some(Credential::new("A2", "R2").unwrap()));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_shutdown_resolves_queued_callers() {
        let store = Arc::new(MemorySessionStore::new());
        let session = logged_in_session(&store);
        let (auth_service, _gate) = ScriptedAuthService::renewing("A2", None).gated();
        let coordinator = RefreshCoordinator::new(session.clone(), Arc::new(auth_service));

        let handles = recover_concurrently(&coordinator, 2).await;
        coordinator.shutdown();

        for handle in handles {
            let error = handle.await.unwrap().unwrap_err();
            assert!(matches!(error, Error::SessionUnavailable));
        }
        assert!(matches!(
            coordinator.recover(Some("A1")).await,
            Err(Error::SessionUnavailable)
        ));
        assert!(!coordinator.is_refreshing());
        // Shutting down is not a logout.
        assert_eq!(session.get().access_token(), Some("A1"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_cancelled_caller_does_not_cancel_exchange() {
        let store = Arc::new(MemorySessionStore::new());
        let session = logged_in_session(&store);
        let (auth_service, gate) = ScriptedAuthService::renewing("A2", None).gated();
        let auth_service = Arc::new(auth_service);
        let coordinator = RefreshCoordinator::new(session.clone(), auth_service.clone());

        let mut handles = recover_concurrently(&coordinator, 2).await;
        let first = handles.remove(0);
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());
        gate.add_permits(1);

        let state = handles.remove(0).await.unwrap().unwrap();
        assert_eq!(state.access_token(), Some("A2"));
        assert_eq!(session.get().access_token(), Some("A2"));
        assert_eq!(auth_service.refresh_calls(), 1);
    }
}

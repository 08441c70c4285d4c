//! Publish/subscribe bus for session lifecycle events.
//!
//! Publishing never blocks: events go into a bounded broadcast channel and a
//! subscriber that falls behind loses the oldest events instead of stalling
//! the publisher. Every subscriber receives events in publication order.
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::credential::Claims;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    LoggedIn,
    CredentialChanged,
    LoggedOut,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// The user logged out.
    UserRequested,
    /// The refresh token was rejected, missing, or could not be exchanged.
    SessionExpired,
    /// A request was rejected again right after a successful refresh.
    RetryExhausted,
}

impl LogoutReason {
    /// Whether the logout was forced on the user rather than requested.
    #[must_use]
    pub fn is_forced(self) -> bool {
        !matches!(self, LogoutReason::UserRequested)
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A full login replaced the session.
    LoggedIn { identity: Option<Arc<Claims>> },
    /// The access token was replaced by a refresh.
    CredentialChanged { identity: Option<Arc<Claims>> },
    /// The session was cleared.
    LoggedOut { reason: LogoutReason },
}

impl SessionEvent {
    #[must_use]
    pub fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::LoggedIn { .. } => SessionEventKind::LoggedIn,
            SessionEvent::CredentialChanged { .. } => SessionEventKind::CredentialChanged,
            SessionEvent::LoggedOut { .. } => SessionEventKind::LoggedOut,
        }
    }

    /// `true` for a logout that was not requested by the user.
    #[must_use]
    pub fn is_forced_logout(&self) -> bool {
        matches!(self, SessionEvent::LoggedOut { reason } if reason.is_forced())
    }
}

/// Cheaply cloneable handle to the session event bus.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SessionEvents {
    /// Create a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Run `handler` for every event of `kind` on a background task.
    ///
    /// The task ends once every handle to the bus has been dropped, or when
    /// the returned handle is aborted.
    pub fn on<F>(&self, kind: SessionEventKind, handler: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(SessionEvent) + Send + 'static,
    {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.kind() == kind => handler(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Session event handler for {kind:?} lagged, skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Publish an event to all current subscribers. Returns the number of
    /// subscribers the event was delivered to.
    pub fn publish(&self, event: SessionEvent) -> usize {
        let kind = event.kind();
        if let Ok(receivers) = self.sender.send(event) {
            tracing::trace!("Published {kind:?} to {receivers} subscribers");
            receivers
        } else {
            tracing::trace!("Published {kind:?} without subscribers");
            0
        }
    }
}

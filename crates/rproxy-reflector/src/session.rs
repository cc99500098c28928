//! Tracking of the single active worker session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

/// The worker currently allowed to drive the reflector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Sequence number of this session; starts at 1.
    pub epoch: u64,
    /// Address the worker opened the session from, when known.
    pub worker_addr: Option<SocketAddr>,
}

/// Publishes the active session to everyone waiting on it.
pub struct SessionTracker {
    state: watch::Sender<Option<Session>>,
    last_epoch: AtomicU64,
}

impl SessionTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state,
            last_epoch: AtomicU64::new(0),
        }
    }

    /// Reserve the epoch for the next session.
    pub fn next_epoch(&self) -> u64 {
        self.last_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Make `session` the active one, replacing any previous session.
    pub fn publish(&self, session: Session) {
        self.state.send_replace(Some(session));
    }

    /// Clear the active session, returning it.
    pub fn clear(&self) -> Option<Session> {
        self.state.send_replace(None)
    }

    /// Clear the active session only if it still has `epoch`.
    pub fn clear_if(&self, epoch: u64) -> bool {
        self.state.send_if_modified(|state| {
            if state.as_ref().is_some_and(|s| s.epoch == epoch) {
                *state = None;
                true
            } else {
                false
            }
        })
    }

    pub fn current(&self) -> Option<Session> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.state.subscribe()
    }

    /// Wait until a session is active and return it. Does not poll.
    pub async fn wait_active(&self) -> Session {
        let mut rx = self.state.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(session) = current {
                return session;
            }
            if rx.changed().await.is_err() {
                // The sender lives in `self`, so this cannot happen while we
                // are borrowed; park rather than spin if it ever does.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once the active session is no longer `epoch`.
pub async fn superseded(sessions: &mut watch::Receiver<Option<Session>>, epoch: u64) {
    loop {
        let current = sessions.borrow_and_update().as_ref().map(|s| s.epoch);
        if current != Some(epoch) {
            return;
        }
        if sessions.changed().await.is_err() {
            return;
        }
    }
}

//! Session Store
//!
//! Authoritative, process-wide collection of sessions.
//!
//! # Design Philosophy
//!
//! Readers get cheap, consistent snapshots; writers go through a closure.
//!
//! ```text
//! RwLock<Arc<Vec<Arc<Session>>>>
//!        │         │
//!        │         └─ one Arc per session: a mutation clones only the
//!        │            session it touches (Arc::make_mut)
//!        └─ outer Arc: snapshot() is a pointer clone, a mutation clones
//!           the pointer vector only when a reader still holds it
//! ```
//!
//! Each mutation bumps a version counter and publishes it on a
//! `tokio::sync::watch` channel so observers (UI, CLI) can re-render.
//! Mutations are short and never await while holding the lock.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::messages::SessionId;
use crate::session::Session;

/// Shared session collection with copy-on-write snapshots
pub struct SessionStore {
    sessions: RwLock<Arc<Vec<Arc<Session>>>>,
    version: watch::Sender<u64>,
}

impl SessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            sessions: RwLock::new(Arc::new(Vec::new())),
            version,
        }
    }

    /// Create a store pre-populated with sessions
    pub fn with_sessions(sessions: Vec<Session>) -> Self {
        let store = Self::new();
        *store.sessions.write() = Arc::new(sessions.into_iter().map(Arc::new).collect());
        store
    }

    /// Consistent snapshot of every session
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<Session>>> {
        Arc::clone(&*self.sessions.read())
    }

    /// Snapshot of one session
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().iter().find(|s| &s.id == id).cloned()
    }

    /// Whether a session exists
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.get(id).is_some()
    }

    /// Number of sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether the store has no sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current mutation version
    #[must_use]
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Subscribe to mutation notifications
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Mutate the whole collection atomically
    pub fn update<R>(&self, f: impl FnOnce(&mut Vec<Arc<Session>>) -> R) -> R {
        let result = {
            let mut guard = self.sessions.write();
            f(Arc::make_mut(&mut *guard))
        };
        self.bump();
        result
    }

    /// Mutate one session atomically
    ///
    /// Returns `None` without notifying observers when the session does not
    /// exist (it may have been deleted while a job was still streaming).
    pub fn update_session<R>(&self, id: &SessionId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let result = {
            let mut guard = self.sessions.write();
            let sessions = Arc::make_mut(&mut *guard);
            let slot = sessions.iter_mut().find(|s| &s.id == id)?;
            f(Arc::make_mut(slot))
        };
        self.bump();
        Some(result)
    }

    /// Insert a session, replacing any with the same ID
    pub fn insert(&self, session: Session) {
        self.update(|sessions| {
            sessions.retain(|s| s.id != session.id);
            sessions.push(Arc::new(session));
        });
    }

    /// Remove a session
    pub fn remove(&self, id: &SessionId) -> bool {
        self.update(|sessions| {
            let before = sessions.len();
            sessions.retain(|s| &s.id != id);
            sessions.len() != before
        })
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
        tracing::trace!(version = *self.version.borrow(), "Session store updated");
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

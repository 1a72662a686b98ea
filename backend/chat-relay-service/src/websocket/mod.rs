use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub mod session;

pub use session::{
    ClientFrame, EnqueueOutcome, FrameSink, Session, SessionError, SessionHandle, SessionState,
    TransportError,
};

/// Live sessions keyed by user id.
///
/// At most one session per user: registering a second connection replaces
/// the first and shuts it down. Handles are cloned out of the map, so no
/// lock is held while callers enqueue onto them.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `handle`, returning the session it replaced (already told to
    /// shut down).
    pub fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let user_id = handle.user_id().to_string();
        let replaced = self.inner.write().insert(user_id.clone(), handle);

        if let Some(old) = &replaced {
            tracing::info!(
                user_id = %user_id,
                session_id = %old.session_id(),
                "replacing existing session"
            );
            old.shutdown();
        }

        replaced
    }

    /// Removes whatever session is registered for `user_id`
    pub fn unregister(&self, user_id: &str) -> Option<SessionHandle> {
        self.inner.write().remove(user_id)
    }

    /// Removes the entry for `user_id` only if it is still `session_id`.
    ///
    /// `on_removed` runs under the registry lock, so no newer session for
    /// the same user can register before it completes.
    pub fn unregister_session<F>(&self, user_id: &str, session_id: Uuid, on_removed: F) -> bool
    where
        F: FnOnce(),
    {
        let mut guard = self.inner.write();
        match guard.get(user_id) {
            Some(current) if current.session_id() == session_id => {
                guard.remove(user_id);
                on_removed();
                tracing::debug!(user_id, %session_id, remaining = guard.len(), "session unregistered");
                true
            }
            _ => false,
        }
    }

    /// Runs `f` on the session registered for `user_id`, under the registry
    /// lock. Returns false when no session is registered.
    ///
    /// Holding the lock orders `f` against [`unregister_session`](Self::unregister_session):
    /// either `f` sees the session and its `on_removed` runs afterwards, or
    /// `f` does not run at all.
    pub fn with_registered<F>(&self, user_id: &str, f: F) -> bool
    where
        F: FnOnce(&SessionHandle),
    {
        let guard = self.inner.write();
        match guard.get(user_id) {
            Some(handle) => {
                f(handle);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, user_id: &str) -> Option<SessionHandle> {
        self.inner.read().get(user_id).cloned()
    }

    /// Active sessions among `user_ids`
    pub fn sessions_for<'a, I>(&self, user_ids: I) -> Vec<SessionHandle>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let guard = self.inner.read();
        user_ids
            .into_iter()
            .filter_map(|id| guard.get(id))
            .filter(|handle| handle.is_active())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

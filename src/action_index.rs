use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::session::{Session, SessionId};

/// Maps an action name to the sessions currently running it, across all
/// clients.
///
/// An entry exists only while it holds at least one session; the removal
/// that empties a set also removes its key.
#[derive(Clone, Default)]
pub struct ActionIndex {
    inner: Arc<RwLock<HashMap<String, HashMap<SessionId, Session>>>>,
}

impl ActionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `session` under `action`, creating the set if needed.
    pub fn record(&self, action: &str, session: &Session) {
        self.inner
            .write()
            .entry(action.to_string())
            .or_default()
            .insert(session.id, session.clone());
    }

    /// Drop `id` from the set for `action`. Unknown names and ids are
    /// ignored.
    pub fn forget(&self, action: &str, id: SessionId) {
        let mut inner = self.inner.write();
        if let Some(set) = inner.get_mut(action) {
            set.remove(&id);
            if set.is_empty() {
                inner.remove(action);
            }
        }
    }

    /// Number of sessions currently running `action`.
    pub fn active_count(&self, action: &str) -> usize {
        self.inner.read().get(action).map_or(0, HashMap::len)
    }

    /// Copy of the sessions running `action` at this instant.
    ///
    /// Sessions recorded after the read lock is released are not part of
    /// the snapshot.
    pub fn snapshot(&self, action: &str) -> Vec<Session> {
        self.inner
            .read()
            .get(action)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn contains(&self, action: &str, id: SessionId) -> bool {
        self.inner
            .read()
            .get(action)
            .is_some_and(|set| set.contains_key(&id))
    }

    #[cfg(test)]
    fn actions(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

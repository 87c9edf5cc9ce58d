//! Session storage with sliding expiration.

use crate::session::Session;
use parking_lot::RwLock;
use scopesync_sync_protocol::SessionId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Keyed storage for sessions.
///
/// Handlers read a copy, mutate it and write it back only when the step
/// succeeds, so a failed step leaves the stored session untouched.
pub trait SessionStore: Send + Sync {
    /// Returns a copy of the session, refreshing its expiration.
    fn get(&self, id: &SessionId) -> Option<Session>;

    /// Stores the session, replacing any previous version.
    fn put(&self, session: Session);

    /// Removes the session.
    fn remove(&self, id: &SessionId) -> Option<Session>;

    /// Removes expired sessions and returns them.
    fn evict_expired(&self) -> Vec<Session>;

    /// Number of stored sessions.
    fn len(&self) -> usize;

    /// Returns true if no session is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    session: Session,
    touched: Instant,
}

/// In-process session store.
pub struct MemorySessionStore {
    ttl: Duration,
    entries: RwLock<HashMap<SessionId, Entry>>,
}

impl MemorySessionStore {
    /// Creates a store whose sessions expire `ttl` after last use.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn expired(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.touched) >= self.ttl
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, id: &SessionId) -> Option<Session> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let expired = self.expired(entries.get(id)?, now);
        if expired {
            if let Some(mut entry) = entries.remove(id) {
                tracing::debug!(session_id = %id, "session expired");
                entry.session.release_batches();
            }
            return None;
        }
        let entry = entries.get_mut(id)?;
        entry.touched = now;
        Some(entry.session.clone())
    }

    fn put(&self, session: Session) {
        self.entries.write().insert(
            session.id,
            Entry {
                session,
                touched: Instant::now(),
            },
        );
    }

    fn remove(&self, id: &SessionId) -> Option<Session> {
        self.entries.write().remove(id).map(|e| e.session)
    }

    fn evict_expired(&self) -> Vec<Session> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let ids: Vec<SessionId> = entries
            .iter()
            .filter(|(_, e)| self.expired(e, now))
            .map(|(id, _)| *id)
            .collect();
        ids.iter()
            .filter_map(|id| entries.remove(id))
            .map(|e| e.session)
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

impl std::fmt::Debug for MemorySessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySessionStore")
            .field("ttl", &self.ttl)
            .field("sessions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use scopesync_core::ScopeId;

    fn session() -> Session {
        Session::new(SessionId::new(), "s", ScopeId::new())
    }

    #[test]
    fn put_get_remove() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        let mut s = session();
        let id = s.id;
        store.put(s.clone());
        assert_eq!(store.len(), 1);

        s.state = SessionState::EnsuringScope;
        store.put(s);
        assert_eq!(store.get(&id).unwrap().state, SessionState::EnsuringScope);
        assert!(store.remove(&id).is_some());
        assert!(store.get(&id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn copies_do_not_alias() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        let s = session();
        let id = s.id;
        store.put(s);
        let mut copy = store.get(&id).unwrap();
        copy.state = SessionState::Ended;
        assert_eq!(store.get(&id).unwrap().state, SessionState::Idle);
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let store = MemorySessionStore::new(Duration::ZERO);
        let s = session();
        let id = s.id;
        store.put(s);
        assert!(store.get(&id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn evict_expired_removes_only_stale() {
        let store = MemorySessionStore::new(Duration::ZERO);
        store.put(session());
        store.put(session());
        assert_eq!(store.evict_expired().len(), 2);

        let store = MemorySessionStore::new(Duration::from_secs(60));
        store.put(session());
        assert!(store.evict_expired().is_empty());
        assert_eq!(store.len(), 1);
    }
}

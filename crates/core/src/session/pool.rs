use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rand::RngExt;

use crate::error::{Result, RtspError};
use crate::session::{DEFAULT_SESSION_TIMEOUT_SECS, Session};

/// Called with every session that leaves the pool.
pub type SessionRemovedFn = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

struct PoolInner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_sessions: RwLock<usize>,
    timeout_secs: RwLock<u32>,
    subscribers: Mutex<Vec<(u64, SessionRemovedFn)>>,
    next_subscriber: AtomicU64,
}

/// Thread-safe registry of active sessions.
///
/// Backed by `parking_lot::RwLock` for fast concurrent reads. Cloning is
/// cheap and every clone shares the same sessions. Removal, explicit or
/// through [`cleanup`](Self::cleanup), is announced to subscribers after the
/// pool lock is released.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new() -> Self {
        SessionPool {
            inner: Arc::new(PoolInner {
                sessions: RwLock::new(HashMap::new()),
                max_sessions: RwLock::new(0),
                timeout_secs: RwLock::new(DEFAULT_SESSION_TIMEOUT_SECS),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// Limit the number of concurrent sessions; 0 means unlimited.
    pub fn set_max_sessions(&self, max: usize) {
        *self.inner.max_sessions.write() = max;
    }

    pub fn max_sessions(&self) -> usize {
        *self.inner.max_sessions.read()
    }

    /// Timeout given to newly created sessions.
    pub fn set_session_timeout(&self, secs: u32) {
        *self.inner.timeout_secs.write() = secs;
    }

    /// Create and register a session with a fresh random ID.
    pub fn create(&self) -> Result<Arc<Session>> {
        let mut sessions = self.inner.sessions.write();
        let max = *self.inner.max_sessions.read();
        if max > 0 && sessions.len() >= max {
            tracing::warn!(max, "session limit reached");
            return Err(RtspError::SessionLimit(max));
        }

        let mut rng = rand::rng();
        let id = loop {
            let id = format!("{:016X}", rng.random::<u64>());
            if !sessions.contains_key(&id) {
                break id;
            }
        };

        let session = Arc::new(Session::new(&id, *self.inner.timeout_secs.read()));
        sessions.insert(id.clone(), session.clone());
        tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session created");
        Ok(session)
    }

    /// Look up a session by ID, refreshing its timeout.
    pub fn find(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.inner.sessions.read().get(id).cloned();
        if let Some(s) = &session {
            s.touch();
        }
        session
    }

    /// Remove a session. Returns `false` if it was not in the pool.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let removed = self.inner.sessions.write().remove(session.id());
        match removed {
            Some(s) => {
                tracing::debug!(session_id = %s.id(), "session removed");
                self.emit_removed(&s);
                true
            }
            None => false,
        }
    }

    /// Remove every session that expired at `now`. Returns the number
    /// removed.
    pub fn cleanup(&self, now: Instant) -> usize {
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.inner.sessions.write();
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.is_expired(now))
                .map(|s| s.id().to_string())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for s in &expired {
            tracing::info!(session_id = %s.id(), "session timed out");
            self.emit_removed(s);
        }
        expired.len()
    }

    pub fn n_sessions(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Register a session-removed callback. Returns an ID for
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, f: SessionRemovedFn) -> u64 {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, f));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.subscribers.lock().retain(|(sub, _)| *sub != id);
    }

    fn emit_removed(&self, session: &Arc<Session>) {
        let subscribers: Vec<SessionRemovedFn> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for f in subscribers {
            f(session);
        }
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn create_find_remove() {
        let pool = SessionPool::new();
        let s = pool.create().unwrap();
        assert_eq!(s.id().len(), 16);
        assert!(pool.find(s.id()).is_some());
        assert!(pool.remove(&s));
        assert!(!pool.remove(&s));
        assert!(pool.find(s.id()).is_none());
    }

    #[test]
    fn max_sessions_is_enforced() {
        let pool = SessionPool::new();
        pool.set_max_sessions(1);
        let _s = pool.create().unwrap();
        assert!(matches!(pool.create(), Err(RtspError::SessionLimit(1))));
    }

    #[test]
    fn removal_is_announced() {
        let pool = SessionPool::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s2 = seen.clone();
        let sub = pool.subscribe(Arc::new(move |s| s2.lock().push(s.id().to_string())));

        let a = pool.create().unwrap();
        pool.remove(&a);
        pool.unsubscribe(sub);
        let b = pool.create().unwrap();
        pool.remove(&b);

        assert_eq!(*seen.lock(), vec![a.id().to_string()]);
    }

    #[test]
    fn cleanup_removes_expired_sessions() {
        let pool = SessionPool::new();
        pool.set_session_timeout(1);
        let s = pool.create().unwrap();
        assert_eq!(pool.cleanup(Instant::now()), 0);
        assert_eq!(pool.cleanup(Instant::now() + Duration::from_secs(2)), 1);
        assert!(pool.find(s.id()).is_none());
    }
}

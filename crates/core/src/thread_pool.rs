use std::sync::Arc;

use parking_lot::Mutex;

struct PoolState {
    max: Option<usize>,
    active: usize,
}

/// Hands out one [`ThreadToken`] per prepared media.
///
/// Media processing in this crate is driven by the connection threads, so
/// a token does not own an OS thread. It accounts for one unit of media
/// work against the configured limit; acquisition fails once the limit is
/// reached, which clients report as 503 Service Unavailable.
#[derive(Clone)]
pub struct ThreadPool {
    state: Arc<Mutex<PoolState>>,
}

impl ThreadPool {
    /// `None` means unlimited.
    pub fn new(max: Option<usize>) -> Self {
        ThreadPool {
            state: Arc::new(Mutex::new(PoolState { max, active: 0 })),
        }
    }

    pub fn set_max_threads(&self, max: Option<usize>) {
        self.state.lock().max = max;
    }

    pub fn get_thread(&self) -> Option<ThreadToken> {
        let mut state = self.state.lock();
        if state.max.is_some_and(|max| state.active >= max) {
            tracing::warn!(active = state.active, "thread pool exhausted");
            return None;
        }
        state.active += 1;
        Some(ThreadToken {
            pool: self.state.clone(),
        })
    }

    /// Number of tokens currently handed out.
    pub fn active(&self) -> usize {
        self.state.lock().active
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new(None)
    }
}

/// One acquired slot of a [`ThreadPool`], released on drop.
pub struct ThreadToken {
    pool: Arc<Mutex<PoolState>>,
}

impl Drop for ThreadToken {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        state.active = state.active.saturating_sub(1);
    }
}

impl std::fmt::Debug for ThreadToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ThreadToken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_and_release() {
        let pool = ThreadPool::new(Some(1));
        let token = pool.get_thread().unwrap();
        assert!(pool.get_thread().is_none());
        assert_eq!(pool.active(), 1);
        drop(token);
        assert_eq!(pool.active(), 0);
        assert!(pool.get_thread().is_some());
    }
}

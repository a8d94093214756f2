//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! An RTSP session is a server-side state object created during SETUP and
//! destroyed by TEARDOWN (or timeout). It tracks:
//!
//! - A unique session ID (hex string, returned in the `Session` header).
//! - One [`SessionMedia`] per managed media path, each with its own RTSP
//!   state and per-stream transports.
//! - A timeout (default 60s, per RFC 2326 §12.37). Every request that
//!   resolves the session touches it; the [`SessionPool`] removes sessions
//!   that were not touched within their timeout.
//!
//! ## Session media lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! SETUP          -> Ready
//! PLAY           -> Playing
//! RECORD         -> Recording
//! PAUSE          -> Ready    (from Playing or Recording)
//! TEARDOWN       -> (released; session removed when no media remain)
//! timeout        -> (session removed by SessionPool::cleanup)
//! ```

pub mod media;
pub mod pool;
pub mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::media::Media;
pub use media::{RtspState, SessionMedia};
pub use pool::{SessionPool, SessionRemovedFn};
pub use transport::StreamTransport;

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u32 = 60;

/// Verdict of a session or session-media filter callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    /// Drop the item from the container.
    Remove,
    /// Leave it alone.
    Keep,
    /// Leave it and include a reference in the returned list.
    Ref,
}

/// A single RTSP session (RFC 2326 §3).
pub struct Session {
    id: String,
    timeout: AtomicU32,
    last_touched: Mutex<Instant>,
    medias: RwLock<Vec<Arc<SessionMedia>>>,
}

impl Session {
    pub fn new(id: &str, timeout_secs: u32) -> Self {
        Session {
            id: id.to_string(),
            timeout: AtomicU32::new(timeout_secs),
            last_touched: Mutex::new(Instant::now()),
            medias: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timeout(&self) -> u32 {
        self.timeout.load(Ordering::Relaxed)
    }

    pub fn set_timeout(&self, secs: u32) {
        self.timeout.store(secs, Ordering::Relaxed);
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"0000000000000001;timeout=60"`
    pub fn header(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout())
    }

    /// Reset the expiry clock.
    pub fn touch(&self) {
        *self.last_touched.lock() = Instant::now();
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        let deadline = *self.last_touched.lock() + Duration::from_secs(u64::from(self.timeout()));
        now >= deadline
    }

    /// Start managing `media` at `path`.
    pub fn manage_media(&self, path: &str, media: Arc<Media>) -> Arc<SessionMedia> {
        let sm = SessionMedia::new(path, media);
        self.medias.write().push(sm.clone());
        tracing::debug!(session_id = %self.id, path, "managing media");
        sm
    }

    /// Stop managing `sm` and unprepare its media. Returns whether the
    /// session still manages other media.
    pub fn release_media(&self, sm: &Arc<SessionMedia>) -> bool {
        let remaining = {
            let mut medias = self.medias.write();
            medias.retain(|m| !Arc::ptr_eq(m, sm));
            medias.len()
        };
        sm.media().unprepare();
        tracing::debug!(session_id = %self.id, path = %sm.path(), remaining, "released media");
        remaining > 0
    }

    /// The managed media whose path is the longest prefix of `path`, with
    /// the matched prefix length.
    pub fn get_media(&self, path: &str) -> Option<(Arc<SessionMedia>, usize)> {
        self.medias
            .read()
            .iter()
            .filter_map(|sm| sm.matches(path).map(|len| (sm.clone(), len)))
            .max_by_key(|(_, len)| *len)
    }

    pub fn medias(&self) -> Vec<Arc<SessionMedia>> {
        self.medias.read().clone()
    }

    pub fn n_medias(&self) -> usize {
        self.medias.read().len()
    }

    /// Run `func` over every managed media. `Remove` drops the media from
    /// the session, `Ref` collects it into the returned list.
    pub fn filter<F>(&self, mut func: F) -> Vec<Arc<SessionMedia>>
    where
        F: FnMut(&Arc<SessionMedia>) -> FilterResult,
    {
        let mut result = Vec::new();
        let mut removed = Vec::new();
        self.medias.write().retain(|sm| match func(sm) {
            FilterResult::Remove => {
                removed.push(sm.clone());
                false
            }
            FilterResult::Keep => true,
            FilterResult::Ref => {
                result.push(sm.clone());
                true
            }
        });
        for sm in removed {
            sm.media().unprepare();
        }
        result
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("timeout", &self.timeout())
            .field("medias", &self.n_medias())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaFactory, StreamConfig};
    use crate::protocol::RtspUrl;

    fn media(path: &str) -> Arc<Media> {
        let factory = MediaFactory::new().with_stream(StreamConfig::h264(96));
        factory
            .construct(&RtspUrl::parse(&format!("rtsp://h{path}")).unwrap())
            .unwrap()
    }

    #[test]
    fn header_carries_timeout() {
        let s = Session::new("00000000000000AB", 30);
        assert_eq!(s.header(), "00000000000000AB;timeout=30");
    }

    #[test]
    fn expiry_follows_last_touch() {
        let s = Session::new("A", 1);
        let now = Instant::now();
        assert!(!s.is_expired(now));
        assert!(s.is_expired(now + Duration::from_secs(2)));
    }

    #[test]
    fn get_media_prefers_longest_match() {
        let s = Session::new("A", 60);
        s.manage_media("/cam", media("/cam"));
        s.manage_media("/cam/hd", media("/cam/hd"));

        let (sm, matched) = s.get_media("/cam/hd/stream=0").unwrap();
        assert_eq!(sm.path(), "/cam/hd");
        assert_eq!(matched, 7);
        assert_eq!(s.get_media("/cam/stream=1").unwrap().0.path(), "/cam");
        assert!(s.get_media("/other").is_none());
    }

    #[test]
    fn release_reports_remaining_media() {
        let s = Session::new("A", 60);
        let a = s.manage_media("/a", media("/a"));
        let b = s.manage_media("/b", media("/b"));
        assert!(s.release_media(&a));
        assert!(!s.release_media(&b));
        assert_eq!(s.n_medias(), 0);
    }

    #[test]
    fn filter_collects_refs_and_removes() {
        let s = Session::new("A", 60);
        s.manage_media("/a", media("/a"));
        s.manage_media("/b", media("/b"));
        let refs = s.filter(|sm| {
            if sm.path() == "/a" {
                FilterResult::Remove
            } else {
                FilterResult::Ref
            }
        });
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].path(), "/b");
        assert_eq!(s.n_medias(), 1);
    }
}

use std::sync::Arc;

use parking_lot::Mutex;

use crate::media::{Media, MediaTarget, Stream};
use crate::protocol::{PortRange, Transport};
use crate::session::transport::StreamTransport;

/// RTSP state of one media inside a session (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RtspState {
    #[default]
    Init,
    Ready,
    Playing,
    Recording,
}

struct Inner {
    state: RtspState,
    transports: Vec<Option<Arc<StreamTransport>>>,
    next_channel: i32,
}

/// The binding of a session to one [`Media`] at one path.
///
/// Holds one optional [`StreamTransport`] slot per stream of the media and
/// the RTSP state that PLAY, PAUSE and RECORD move between.
pub struct SessionMedia {
    path: String,
    media: Arc<Media>,
    inner: Mutex<Inner>,
}

impl SessionMedia {
    pub fn new(path: &str, media: Arc<Media>) -> Arc<Self> {
        let n_streams = media.n_streams();
        Arc::new(SessionMedia {
            path: path.to_string(),
            media,
            inner: Mutex::new(Inner {
                state: RtspState::Init,
                transports: vec![None; n_streams],
                next_channel: 0,
            }),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn media(&self) -> &Arc<Media> {
        &self.media
    }

    /// Length of the prefix of `path` this media answers for, when `path`
    /// is the media path itself or a sub-resource of it.
    pub fn matches(&self, path: &str) -> Option<usize> {
        let len = self.path.len();
        let rest = path.strip_prefix(self.path.as_str())?;
        if rest.is_empty() || rest.starts_with('/') || self.path.ends_with('/') {
            Some(len)
        } else {
            None
        }
    }

    pub fn rtsp_state(&self) -> RtspState {
        self.inner.lock().state
    }

    pub fn set_rtsp_state(&self, state: RtspState) {
        let mut inner = self.inner.lock();
        if inner.state != state {
            tracing::debug!(path = %self.path, from = ?inner.state, to = ?state, "rtsp state");
        }
        inner.state = state;
    }

    /// Next free pair of interleaved channels for this media.
    pub fn alloc_channels(&self) -> PortRange {
        let mut inner = self.inner.lock();
        let range = PortRange::new(inner.next_channel, inner.next_channel + 1);
        inner.next_channel += 2;
        range
    }

    /// Binds `stream` to `transport`, replacing any earlier binding.
    pub fn set_transport(&self, stream: &Arc<Stream>, transport: Transport) -> Arc<StreamTransport> {
        let st = StreamTransport::new(stream.clone(), transport);
        let idx = stream.index() as usize;
        let mut inner = self.inner.lock();
        if inner.transports.len() <= idx {
            inner.transports.resize(idx + 1, None);
        }
        if let Some(old) = inner.transports[idx].replace(st.clone()) {
            old.set_active(false);
            old.clear_callbacks();
        }
        st
    }

    pub fn transport(&self, idx: usize) -> Option<Arc<StreamTransport>> {
        self.inner.lock().transports.get(idx).cloned().flatten()
    }

    pub fn transports(&self) -> Vec<Arc<StreamTransport>> {
        self.inner.lock().transports.iter().flatten().cloned().collect()
    }

    /// Moves the media and all configured transports towards `target`.
    pub fn set_state(&self, target: MediaTarget) -> bool {
        let transports = self.transports();
        let active = target == MediaTarget::Playing;
        for t in &transports {
            t.set_active(active);
            if target == MediaTarget::Null {
                t.clear_callbacks();
            }
        }
        self.media.set_target_state(target)
    }

    /// The `RTP-Info` value for this media (RFC 2326 §12.33), or `None` when
    /// no sending stream has a transport.
    pub fn rtp_info(&self) -> Option<String> {
        let infos: Vec<String> = self
            .transports()
            .iter()
            .filter(|t| t.stream().is_sender())
            .filter_map(|t| {
                let url = t.url()?;
                let (seq, rtptime) = t.stream().rtp_info();
                Some(format!("url={};seq={seq};rtptime={rtptime}", url.request_uri()))
            })
            .collect();
        (!infos.is_empty()).then(|| infos.join(", "))
    }
}

impl std::fmt::Debug for SessionMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMedia")
            .field("path", &self.path)
            .field("state", &self.rtsp_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaFactory, StreamConfig};
    use crate::protocol::RtspUrl;

    fn media() -> Arc<Media> {
        let factory = MediaFactory::new().with_stream(StreamConfig::h264(96));
        let url = RtspUrl::parse("rtsp://h/test").unwrap();
        factory.construct(&url).unwrap()
    }

    #[test]
    fn channel_pairs_are_consecutive() {
        let sm = SessionMedia::new("/test", media());
        assert_eq!(sm.alloc_channels(), PortRange::new(0, 1));
        assert_eq!(sm.alloc_channels(), PortRange::new(2, 3));
    }

    #[test]
    fn path_matching_respects_segments() {
        let sm = SessionMedia::new("/test", media());
        assert_eq!(sm.matches("/test"), Some(5));
        assert_eq!(sm.matches("/test/stream=0"), Some(5));
        assert_eq!(sm.matches("/testing"), None);
        assert_eq!(sm.matches("/other"), None);
    }

    #[test]
    fn rtp_info_lists_sending_streams() {
        let m = media();
        let sm = SessionMedia::new("/test", m.clone());
        assert!(sm.rtp_info().is_none());

        let st = sm.set_transport(&m.stream(0).unwrap(), Transport::default());
        st.set_url(Some(RtspUrl::parse("rtsp://h:8554/test/stream=0").unwrap()));
        let info = sm.rtp_info().unwrap();
        assert!(info.starts_with("url=rtsp://h:8554/test/stream=0;seq="));
        assert!(info.contains(";rtptime="));
    }
}

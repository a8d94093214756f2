use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::media::{
    Media, MediaSettings, MediaStatus, MulticastConfig, PublishClockMode, Seekable, Stream, StreamConfig,
    SuspendMode, TransportMode,
};
use crate::protocol::{LowerTransport, Profile, RtspUrl};

/// Builds [`Media`] for the URLs under one mount point.
///
/// Configured with consuming builder methods:
///
/// ```
/// use rtsp::media::{MediaFactory, StreamConfig};
///
/// let factory = MediaFactory::new()
///     .with_stream(StreamConfig::h264(96))
///     .shared(true);
/// assert!(factory.is_shared());
/// ```
pub struct MediaFactory {
    streams: Vec<StreamConfig>,
    settings: MediaSettings,
    protocols: Vec<LowerTransport>,
    profiles: Vec<Profile>,
    multicast: Option<MulticastConfig>,
    max_mcast_ttl: Option<u32>,
    clock_mode: PublishClockMode,
    srtp_key: Option<Vec<u8>>,
    cache: Mutex<HashMap<String, Arc<Media>>>,
}

impl MediaFactory {
    pub fn new() -> Self {
        MediaFactory {
            streams: Vec::new(),
            settings: MediaSettings::default(),
            protocols: vec![LowerTransport::Udp, LowerTransport::UdpMcast, LowerTransport::Tcp],
            profiles: vec![Profile::Avp],
            multicast: None,
            max_mcast_ttl: None,
            clock_mode: PublishClockMode::default(),
            srtp_key: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_stream(mut self, config: StreamConfig) -> Self {
        self.streams.push(config);
        self
    }

    pub fn transport_mode(mut self, mode: TransportMode) -> Self {
        self.settings.transport_mode = mode;
        self
    }

    /// Shared media are constructed once per URL and reused by every client.
    pub fn shared(mut self, shared: bool) -> Self {
        self.settings.shared = shared;
        self
    }

    pub fn stop_on_disconnect(mut self, stop: bool) -> Self {
        self.settings.stop_on_disconnect = stop;
        self
    }

    pub fn suspend_mode(mut self, mode: SuspendMode) -> Self {
        self.settings.suspend_mode = mode;
        self
    }

    pub fn seekable(mut self, seekable: Seekable) -> Self {
        self.settings.seekable = seekable;
        self
    }

    pub fn duration(mut self, secs: f64) -> Self {
        self.settings.duration = Some(secs);
        self
    }

    pub fn protocols(mut self, protocols: &[LowerTransport]) -> Self {
        self.protocols = protocols.to_vec();
        self
    }

    pub fn profiles(mut self, profiles: &[Profile]) -> Self {
        self.profiles = profiles.to_vec();
        self
    }

    pub fn multicast(mut self, config: MulticastConfig) -> Self {
        self.multicast = Some(config);
        self
    }

    pub fn max_mcast_ttl(mut self, ttl: u32) -> Self {
        self.max_mcast_ttl = Some(ttl);
        self
    }

    pub fn publish_clock_mode(mut self, mode: PublishClockMode) -> Self {
        self.clock_mode = mode;
        self
    }

    /// Master key announced to recording clients in `KeyMgmt`.
    pub fn srtp_key(mut self, key: Vec<u8>) -> Self {
        self.srtp_key = Some(key);
        self
    }

    pub fn is_shared(&self) -> bool {
        self.settings.shared
    }

    pub fn get_transport_mode(&self) -> TransportMode {
        self.settings.transport_mode
    }

    pub fn get_suspend_mode(&self) -> SuspendMode {
        self.settings.suspend_mode
    }

    fn configure_stream(&self, stream: &Stream) {
        stream.set_protocols(&self.protocols);
        stream.set_profiles(&self.profiles);
        stream.set_multicast(self.multicast.clone());
        if let Some(ttl) = self.max_mcast_ttl {
            stream.set_max_mcast_ttl(ttl);
        }
        stream.set_publish_clock_mode(self.clock_mode);
        stream.set_srtp_key(self.srtp_key.clone());
    }

    /// Media for `url`. Shared factories return the cached media while it
    /// is usable. Record-only media start without streams; they are created
    /// from the announced SDP.
    pub fn construct(&self, url: &RtspUrl) -> Option<Arc<Media>> {
        let key = url.request_uri();
        if self.settings.shared {
            if let Some(media) = self.cache.lock().get(&key) {
                if media.status() != MediaStatus::Error {
                    tracing::debug!(url = %key, "reusing shared media");
                    return Some(media.clone());
                }
            }
        }

        let record_only = self.settings.transport_mode.record && !self.settings.transport_mode.play;
        let streams: Vec<Arc<Stream>> = if record_only {
            Vec::new()
        } else {
            self.streams
                .iter()
                .enumerate()
                .map(|(idx, config)| Arc::new(Stream::new(idx as u32, config.clone())))
                .collect()
        };
        if streams.is_empty() && !record_only {
            tracing::warn!(url = %key, "factory has no streams configured");
            return None;
        }
        for stream in &streams {
            self.configure_stream(stream);
        }

        let media = Arc::new(Media::new(self.settings.clone(), streams));
        tracing::debug!(url = %key, shared = self.settings.shared, "media constructed");
        if self.settings.shared {
            self.cache.lock().insert(key, media.clone());
        }
        Some(media)
    }
}

impl Default for MediaFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MediaFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaFactory")
            .field("streams", &self.streams.len())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> RtspUrl {
        RtspUrl::parse("rtsp://localhost:8554/test").unwrap()
    }

    #[test]
    fn unshared_factories_build_fresh_media() {
        let factory = MediaFactory::new().with_stream(StreamConfig::h264(96));
        let a = factory.construct(&url()).unwrap();
        let b = factory.construct(&url()).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.n_streams(), 1);
    }

    #[test]
    fn shared_factories_reuse_media() {
        let factory = MediaFactory::new().with_stream(StreamConfig::h264(96)).shared(true);
        let a = factory.construct(&url()).unwrap();
        let b = factory.construct(&url()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn stream_settings_are_applied() {
        let factory = MediaFactory::new()
            .with_stream(StreamConfig::h264(96))
            .protocols(&[LowerTransport::Tcp])
            .srtp_key(vec![9; 30]);
        let media = factory.construct(&url()).unwrap();
        let stream = media.stream(0).unwrap();
        assert_eq!(stream.protocols(), vec![LowerTransport::Tcp]);
        assert!(stream.has_srtp_key());
    }

    #[test]
    fn empty_play_factory_fails_and_record_factory_starts_empty() {
        assert!(MediaFactory::new().construct(&url()).is_none());
        let record = MediaFactory::new().transport_mode(TransportMode::RECORD);
        assert_eq!(record.construct(&url()).unwrap().n_streams(), 0);
    }
}

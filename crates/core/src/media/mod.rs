//! Media objects served at a mount point.
//!
//! A [`Media`] groups the [`Stream`]s of one presentation (typically one
//! video and one audio stream). It is produced by a [`MediaFactory`] for a
//! URL, prepared before the first SETUP, and shared between sessions when
//! the factory marks it shared.
//!
//! ## Status transitions
//!
//! ```text
//! Unprepared --prepare--> Preparing --> Prepared <--suspend/unsuspend--> Suspended
//!     ^                                     |
//!     +---------------unprepare-------------+
//! any --fatal error--> Error
//! ```
//!
//! Media processing itself (the encoder or the RTP source) lives outside
//! this crate: applications push RTP packets through [`Stream::send_rtp`]
//! and drain recorded packets with [`Stream::pop_received`].

pub mod factory;
pub mod stream;

use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};

use crate::protocol::{RangeUnit, Sdp, SdpMedia, TimeRange, TimeValue};
use crate::session::StreamTransport;
use crate::thread_pool::ThreadToken;
pub use factory::MediaFactory;
pub use stream::{MulticastConfig, PublishClockMode, ReceivedPacket, Stream, StreamConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaStatus {
    #[default]
    Unprepared,
    Preparing,
    Prepared,
    Suspended,
    Error,
}

/// Directions a media supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportMode {
    pub play: bool,
    pub record: bool,
}

impl TransportMode {
    pub const PLAY: TransportMode = TransportMode {
        play: true,
        record: false,
    };
    pub const RECORD: TransportMode = TransportMode {
        play: false,
        record: true,
    };
}

impl Default for TransportMode {
    fn default() -> Self {
        Self::PLAY
    }
}

/// What suspending a prepared media does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuspendMode {
    /// Suspending is a no-op.
    #[default]
    None,
    /// Keep the position, stop delivery.
    Pause,
    /// Rewind to the start when resumed.
    Reset,
}

/// How far clients may seek.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Seekable {
    /// Live media.
    #[default]
    No,
    BeginningOnly,
    RandomAccess,
    /// Seekable up to this many seconds.
    UpTo(f64),
}

/// The state a session media asks its media to move towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaTarget {
    #[default]
    Null,
    Paused,
    Playing,
}

bitflags::bitflags! {
    /// Seek behaviour flags, combined with `|`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SeekFlags: u32 {
        const ACCURATE = 1 << 0;
        const KEY_UNIT = 1 << 1;
        const SNAP_BEFORE = 1 << 2;
        const SNAP_AFTER = 1 << 3;
        const TRICKMODE = 1 << 4;
    }
}

/// Playback parameters derived from a PLAY request, adjustable by hooks
/// before the seek.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayMode {
    pub range: Option<TimeRange>,
    pub flags: SeekFlags,
    pub rate: f64,
    /// Minimum interval between key frames in trick mode, in seconds.
    pub trickmode_interval: f64,
    pub rate_control: bool,
}

impl Default for PlayMode {
    fn default() -> Self {
        PlayMode {
            range: None,
            flags: SeekFlags::empty(),
            rate: 1.0,
            trickmode_interval: 0.0,
            rate_control: true,
        }
    }
}

/// Addressing details used when describing a media in SDP.
#[derive(Debug, Clone)]
pub struct SdpInfo {
    pub is_ipv6: bool,
    pub server_ip: String,
}

#[derive(Default)]
struct MediaState {
    status: MediaStatus,
    prepare_count: u32,
    thread: Option<ThreadToken>,
    target: MediaTarget,
    position: f64,
    rate: f64,
    applied_rate: f64,
    rate_control: bool,
}

/// Settings a [`MediaFactory`] hands to every media it constructs.
#[derive(Debug, Clone, Default)]
pub struct MediaSettings {
    pub transport_mode: TransportMode,
    pub shared: bool,
    pub stop_on_disconnect: bool,
    pub suspend_mode: SuspendMode,
    pub seekable: Seekable,
    /// Duration in seconds, `None` for live media.
    pub duration: Option<f64>,
}

/// One presentation made of one or more [`Stream`]s.
pub struct Media {
    settings: MediaSettings,
    streams: RwLock<Vec<Arc<Stream>>>,
    lock: ReentrantMutex<()>,
    state: Mutex<MediaState>,
}

impl Media {
    pub fn new(settings: MediaSettings, streams: Vec<Arc<Stream>>) -> Self {
        Media {
            settings,
            streams: RwLock::new(streams),
            lock: ReentrantMutex::new(()),
            state: Mutex::new(MediaState {
                rate: 1.0,
                applied_rate: 1.0,
                rate_control: true,
                ..MediaState::default()
            }),
        }
    }

    /// Serialize request handling on this media. The guard may be taken
    /// again by the same thread.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn status(&self) -> MediaStatus {
        self.state.lock().status
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.settings.transport_mode
    }

    pub fn is_shared(&self) -> bool {
        self.settings.shared
    }

    pub fn stop_on_disconnect(&self) -> bool {
        self.settings.stop_on_disconnect
    }

    pub fn suspend_mode(&self) -> SuspendMode {
        self.settings.suspend_mode
    }

    pub fn seekable(&self) -> Seekable {
        self.settings.seekable
    }

    pub fn duration(&self) -> Option<f64> {
        self.settings.duration
    }

    pub fn n_streams(&self) -> usize {
        self.streams.read().len()
    }

    pub fn stream(&self, idx: usize) -> Option<Arc<Stream>> {
        self.streams.read().get(idx).cloned()
    }

    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.streams.read().clone()
    }

    pub fn find_stream(&self, control: &str) -> Option<Arc<Stream>> {
        self.streams.read().iter().find(|s| s.has_control(control)).cloned()
    }

    /// Prepare the media for streaming, holding `thread` while prepared.
    /// Preparing an already prepared media only adds a reference.
    pub fn prepare(&self, thread: ThreadToken) -> bool {
        let mut state = self.state.lock();
        match state.status {
            MediaStatus::Prepared | MediaStatus::Suspended => {
                state.prepare_count += 1;
                return true;
            }
            MediaStatus::Error => return false,
            MediaStatus::Unprepared | MediaStatus::Preparing => {}
        }

        state.status = MediaStatus::Preparing;
        if self.streams.read().is_empty() {
            tracing::error!("media has no streams");
            state.status = MediaStatus::Error;
            return false;
        }
        state.status = MediaStatus::Prepared;
        state.prepare_count = 1;
        state.thread = Some(thread);
        state.position = 0.0;
        tracing::debug!(streams = self.n_streams(), "media prepared");
        true
    }

    /// Drop one prepare reference; the last one returns the media to
    /// `Unprepared` and releases its thread.
    pub fn unprepare(&self) -> bool {
        let mut state = self.state.lock();
        if !matches!(state.status, MediaStatus::Prepared | MediaStatus::Suspended) {
            return false;
        }
        state.prepare_count = state.prepare_count.saturating_sub(1);
        if state.prepare_count > 0 {
            return true;
        }
        state.status = MediaStatus::Unprepared;
        state.thread = None;
        state.target = MediaTarget::Null;
        tracing::debug!("media unprepared");
        true
    }

    pub fn suspend(&self) -> bool {
        let mut state = self.state.lock();
        if self.settings.suspend_mode == SuspendMode::None || state.status != MediaStatus::Prepared {
            return true;
        }
        state.status = MediaStatus::Suspended;
        tracing::debug!(mode = ?self.settings.suspend_mode, "media suspended");
        true
    }

    pub fn unsuspend(&self) -> bool {
        let mut state = self.state.lock();
        match state.status {
            MediaStatus::Suspended => {
                if self.settings.suspend_mode == SuspendMode::Reset {
                    state.position = 0.0;
                }
                state.status = MediaStatus::Prepared;
                tracing::debug!("media unsuspended");
                true
            }
            MediaStatus::Error => false,
            _ => true,
        }
    }

    /// Final wiring of the streams behind `transports`.
    pub fn complete_pipeline(&self, transports: &[Arc<StreamTransport>]) -> bool {
        for t in transports {
            if !t.stream().complete(t.transport()) {
                tracing::warn!(stream = t.stream().index(), "failed to complete stream");
                return false;
            }
        }
        true
    }

    pub fn set_target_state(&self, target: MediaTarget) -> bool {
        let mut state = self.state.lock();
        if target == MediaTarget::Playing && state.status != MediaStatus::Prepared {
            tracing::debug!(status = ?state.status, "cannot play media in this status");
            return false;
        }
        state.target = target;
        true
    }

    pub fn target_state(&self) -> MediaTarget {
        self.state.lock().target
    }

    pub fn set_rate_control(&self, enabled: bool) {
        self.state.lock().rate_control = enabled;
    }

    /// Seek to the start of `range` at `rate`. A live media accepts only
    /// ranges starting at the beginning or at `now`.
    pub fn seek(&self, range: Option<&TimeRange>, flags: SeekFlags, rate: f64, trickmode_interval: f64) -> bool {
        if rate == 0.0 {
            return false;
        }
        let start = match range.map(|r| r.min) {
            Some(TimeValue::Seconds(s)) => Some(s),
            _ => None,
        };
        let allowed = match (self.settings.seekable, start) {
            (_, None) => true,
            (Seekable::No | Seekable::BeginningOnly, Some(s)) => s == 0.0,
            (Seekable::RandomAccess, Some(s)) => self.settings.duration.is_none_or(|d| s <= d),
            (Seekable::UpTo(limit), Some(s)) => s <= limit,
        };
        if !allowed {
            tracing::debug!(?start, seekable = ?self.settings.seekable, "seek rejected");
            return false;
        }

        let mut state = self.state.lock();
        if let Some(s) = start {
            state.position = s;
        }
        if state.rate_control {
            state.rate = rate;
            state.applied_rate = 1.0;
        } else {
            state.rate = 1.0;
            state.applied_rate = rate;
        }
        tracing::debug!(
            position = state.position,
            rate,
            accurate = flags.contains(SeekFlags::ACCURATE),
            trickmode_interval,
            "media seeked"
        );
        true
    }

    /// `(rate, applied_rate)` of the current segment.
    pub fn rates(&self) -> Option<(f64, f64)> {
        let state = self.state.lock();
        match state.status {
            MediaStatus::Prepared | MediaStatus::Suspended => Some((state.rate, state.applied_rate)),
            _ => None,
        }
    }

    pub fn has_completed_sender(&self) -> bool {
        self.streams.read().iter().any(|s| s.is_sender() && s.is_complete())
    }

    /// The `Range` header value for the current position. Always npt.
    pub fn range_string(&self, _play: bool, _unit: RangeUnit) -> Option<String> {
        let state = self.state.lock();
        if !matches!(state.status, MediaStatus::Prepared | MediaStatus::Suspended) {
            return None;
        }
        let max = match self.settings.duration {
            Some(d) => TimeValue::Seconds(d),
            None => TimeValue::End,
        };
        Some(TimeRange::npt(TimeValue::Seconds(state.position), max).to_string())
    }

    /// Create receiver streams for every media section of an announced
    /// SDP. Only RECORD media accept this.
    pub fn handle_sdp(&self, sdp: &Sdp) -> bool {
        if !self.settings.transport_mode.record {
            return false;
        }
        let mut streams = self.streams.write();
        if !streams.is_empty() {
            tracing::warn!("media already has streams");
            return false;
        }
        for (idx, m) in sdp.medias.iter().enumerate() {
            let Some(pt) = m.formats.first() else {
                tracing::warn!(media = %m.media, "media section without formats");
                return false;
            };
            let Ok(payload_type) = pt.parse::<u8>() else {
                tracing::warn!(media = %m.media, pt = %pt, "bad payload type");
                return false;
            };
            let (encoding, clock_rate) = m.rtpmap(pt).unwrap_or_default();
            let mut config = StreamConfig::new(&m.media, &encoding, payload_type, clock_rate);
            config.fmtp = m
                .attributes
                .iter()
                .filter(|(k, _)| k == "fmtp")
                .filter_map(|(_, v)| v.as_deref())
                .find_map(|v| v.strip_prefix(pt.as_str()).map(|rest| rest.trim().to_string()));
            config.control = m.attribute("control").map(str::to_string);
            streams.push(Arc::new(Stream::receiver(idx as u32, config)));
        }
        tracing::debug!(streams = streams.len(), "streams created from sdp");
        !streams.is_empty()
    }

    /// Append one media section per stream to `sdp`.
    pub fn setup_sdp(&self, sdp: &mut Sdp, info: &SdpInfo) -> bool {
        let streams = self.streams.read();
        if streams.is_empty() {
            return false;
        }
        let family = if info.is_ipv6 { "IP6" } else { "IP4" };
        let any = if info.is_ipv6 { "::" } else { "0.0.0.0" };
        for stream in streams.iter() {
            let config = stream.config();
            let profile = stream.profiles().first().copied().unwrap_or_default();
            let pt = config.payload_type.to_string();
            let mut m = SdpMedia {
                media: config.media.clone(),
                port: 0,
                proto: format!("RTP/{}", profile.as_str()),
                formats: vec![pt.clone()],
                ..SdpMedia::default()
            };
            match stream.multicast_address() {
                Some(mcast) => {
                    m.port = u16::try_from(mcast.port.min).unwrap_or(0);
                    m.connection = Some(format!("IN {family} {}/{}", mcast.address, mcast.ttl));
                }
                None => m.connection = Some(format!("IN {family} {any}")),
            }
            m.add_attribute("rtpmap", Some(&format!("{pt} {}/{}", config.encoding, config.clock_rate)));
            if let Some(fmtp) = &config.fmtp {
                m.add_attribute("fmtp", Some(&format!("{pt} {fmtp}")));
            }
            m.add_attribute("control", Some(stream.control()));
            if stream.is_receiver() {
                m.add_attribute("recvonly", None);
            }
            sdp.medias.push(m);
        }
        if let Some(d) = self.settings.duration {
            sdp.add_attribute("range", Some(&format!("npt=0-{d}")));
        }
        true
    }
}

impl std::fmt::Debug for Media {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Media")
            .field("status", &self.status())
            .field("streams", &self.n_streams())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_pool::ThreadPool;

    fn media(settings: MediaSettings) -> Media {
        Media::new(settings, vec![Arc::new(Stream::new(0, StreamConfig::h264(96)))])
    }

    #[test]
    fn prepare_is_refcounted() {
        let pool = ThreadPool::new(Some(1));
        let m = media(MediaSettings::default());
        assert!(m.prepare(pool.get_thread().unwrap()));
        assert_eq!(m.status(), MediaStatus::Prepared);
        assert_eq!(pool.active(), 1);

        // Already prepared: the second token is simply dropped.
        assert!(m.prepare(ThreadPool::default().get_thread().unwrap()));
        assert!(m.unprepare());
        assert_eq!(m.status(), MediaStatus::Prepared);
        assert!(m.unprepare());
        assert_eq!(m.status(), MediaStatus::Unprepared);
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn suspend_modes() {
        let m = media(MediaSettings::default());
        m.prepare(ThreadPool::default().get_thread().unwrap());
        m.suspend();
        assert_eq!(m.status(), MediaStatus::Prepared);

        let m = media(MediaSettings {
            suspend_mode: SuspendMode::Pause,
            ..MediaSettings::default()
        });
        m.prepare(ThreadPool::default().get_thread().unwrap());
        m.suspend();
        assert_eq!(m.status(), MediaStatus::Suspended);
        assert!(!m.set_target_state(MediaTarget::Playing));
        assert!(m.unsuspend());
        assert!(m.set_target_state(MediaTarget::Playing));
    }

    #[test]
    fn live_media_only_seeks_to_start() {
        let m = media(MediaSettings::default());
        m.prepare(ThreadPool::default().get_thread().unwrap());
        let start = TimeRange::parse("npt=0-").unwrap();
        let later = TimeRange::parse("npt=10-").unwrap();
        assert!(m.seek(Some(&start), SeekFlags::ACCURATE, 1.0, 0.0));
        assert!(!m.seek(Some(&later), SeekFlags::ACCURATE, 1.0, 0.0));
        assert!(m.seek(None, SeekFlags::empty(), 2.0, 0.0));
        assert_eq!(m.rates(), Some((2.0, 1.0)));
        assert_eq!(m.range_string(true, RangeUnit::Npt).as_deref(), Some("npt=0-"));
    }

    #[test]
    fn seekable_media_tracks_position() {
        let m = media(MediaSettings {
            seekable: Seekable::RandomAccess,
            duration: Some(60.0),
            ..MediaSettings::default()
        });
        m.prepare(ThreadPool::default().get_thread().unwrap());
        let r = TimeRange::parse("npt=12.5-").unwrap();
        assert!(m.seek(Some(&r), SeekFlags::KEY_UNIT, 1.0, 0.0));
        assert_eq!(m.range_string(true, RangeUnit::Npt).as_deref(), Some("npt=12.5-60"));
        let r = TimeRange::parse("npt=61-").unwrap();
        assert!(!m.seek(Some(&r), SeekFlags::KEY_UNIT, 1.0, 0.0));
    }

    #[test]
    fn sdp_roundtrip_through_record_media() {
        let play = media(MediaSettings::default());
        let mut sdp = Sdp::default();
        assert!(play.setup_sdp(
            &mut sdp,
            &SdpInfo {
                is_ipv6: false,
                server_ip: "127.0.0.1".into()
            }
        ));
        assert_eq!(sdp.medias[0].attribute("control"), Some("stream=0"));
        assert_eq!(sdp.medias[0].attribute("fmtp"), Some("96 packetization-mode=1"));

        let record = Media::new(
            MediaSettings {
                transport_mode: TransportMode::RECORD,
                ..MediaSettings::default()
            },
            Vec::new(),
        );
        let announced = Sdp::parse(&sdp.to_string()).unwrap();
        assert!(record.handle_sdp(&announced));
        let stream = record.find_stream("stream=0").unwrap();
        assert!(stream.is_receiver());
        assert_eq!(stream.config().encoding, "H264");
        assert_eq!(stream.config().fmtp.as_deref(), Some("packetization-mode=1"));
        assert!(!play.handle_sdp(&announced));
    }
}

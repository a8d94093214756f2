use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::{Mutex, RwLock};
use rand::RngExt;

use crate::protocol::{LowerTransport, PortRange, Profile, Transport};
use crate::session::StreamTransport;
use crate::transport::UdpTransport;

/// Default MTU for outgoing RTP packets.
pub const DEFAULT_MTU: u32 = 1400;
/// Default upper bound for a client-requested multicast TTL.
pub const DEFAULT_MAX_MCAST_TTL: u32 = 255;
const RECEIVE_QUEUE_LIMIT: usize = 512;

/// Codec description of one elementary stream, used to build its SDP
/// media section and to check announced streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// SDP media type (`video`, `audio`, `application`).
    pub media: String,
    /// Encoding name as it appears in `a=rtpmap` (`H264`, `H265`, ...).
    pub encoding: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub fmtp: Option<String>,
    /// Control suffix; defaults to `stream=<index>`.
    pub control: Option<String>,
}

impl StreamConfig {
    pub fn new(media: &str, encoding: &str, payload_type: u8, clock_rate: u32) -> Self {
        StreamConfig {
            media: media.to_string(),
            encoding: encoding.to_string(),
            payload_type,
            clock_rate,
            fmtp: None,
            control: None,
        }
    }

    /// H.264 video at 90 kHz, non-interleaved packetization (RFC 6184).
    pub fn h264(payload_type: u8) -> Self {
        Self::new("video", "H264", payload_type, 90000).with_fmtp("packetization-mode=1")
    }

    /// H.265 video at 90 kHz (RFC 7798).
    pub fn h265(payload_type: u8) -> Self {
        Self::new("video", "H265", payload_type, 90000)
    }

    pub fn with_fmtp(mut self, fmtp: &str) -> Self {
        self.fmtp = Some(fmtp.to_string());
        self
    }

    pub fn with_control(mut self, control: &str) -> Self {
        self.control = Some(control.to_string());
        self
    }
}

/// How a stream publishes its clock in the SDP (RFC 7273).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishClockMode {
    None,
    #[default]
    Clock,
    /// Clock and offset; such streams cannot be paused.
    ClockAndOffset,
}

/// Server-side multicast group configuration of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastConfig {
    pub address: String,
    pub port: PortRange,
    pub ttl: u32,
}

/// A packet received from a client on one of the stream's channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedPacket {
    Rtp(Vec<u8>),
    Rtcp(Vec<u8>),
}

#[derive(Debug, Default)]
struct UdpSockets {
    v4: Option<(UdpTransport, UdpTransport)>,
    v6: Option<(UdpTransport, UdpTransport)>,
}

/// One elementary stream of a [`Media`](crate::media::Media).
///
/// A stream fans outgoing RTP/RTCP packets out to every active
/// [`StreamTransport`] and queues packets received from recording clients.
pub struct Stream {
    index: u32,
    config: StreamConfig,
    control: String,
    sender: bool,
    protocols: RwLock<Vec<LowerTransport>>,
    profiles: RwLock<Vec<Profile>>,
    mtu: AtomicU32,
    clock_mode: RwLock<PublishClockMode>,
    ssrc: u32,
    seqnum_base: u16,
    rtptime_base: u32,
    udp: Mutex<UdpSockets>,
    multicast: RwLock<Option<MulticastConfig>>,
    max_mcast_ttl: AtomicU32,
    mcast_clients: Mutex<Vec<(String, PortRange)>>,
    srtp_key: RwLock<Option<Vec<u8>>>,
    remote_key: RwLock<Option<Vec<u8>>>,
    transports: Mutex<Vec<Arc<StreamTransport>>>,
    complete: AtomicBool,
    last_sent: Mutex<Option<(u16, u32)>>,
    received: Mutex<VecDeque<ReceivedPacket>>,
}

impl Stream {
    /// A stream that sends media to PLAY clients.
    pub fn new(index: u32, config: StreamConfig) -> Self {
        Self::build(index, config, true)
    }

    /// A stream that receives media from a RECORD client.
    pub fn receiver(index: u32, config: StreamConfig) -> Self {
        Self::build(index, config, false)
    }

    fn build(index: u32, config: StreamConfig, sender: bool) -> Self {
        let mut rng = rand::rng();
        let control = config
            .control
            .clone()
            .unwrap_or_else(|| format!("stream={index}"));
        Stream {
            index,
            control,
            sender,
            protocols: RwLock::new(vec![
                LowerTransport::Udp,
                LowerTransport::UdpMcast,
                LowerTransport::Tcp,
            ]),
            profiles: RwLock::new(vec![Profile::Avp]),
            mtu: AtomicU32::new(DEFAULT_MTU),
            clock_mode: RwLock::new(PublishClockMode::default()),
            ssrc: rng.random(),
            seqnum_base: rng.random(),
            rtptime_base: rng.random(),
            udp: Mutex::new(UdpSockets::default()),
            multicast: RwLock::new(None),
            max_mcast_ttl: AtomicU32::new(DEFAULT_MAX_MCAST_TTL),
            mcast_clients: Mutex::new(Vec::new()),
            srtp_key: RwLock::new(None),
            remote_key: RwLock::new(None),
            transports: Mutex::new(Vec::new()),
            complete: AtomicBool::new(false),
            last_sent: Mutex::new(None),
            received: Mutex::new(VecDeque::new()),
            config,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn control(&self) -> &str {
        &self.control
    }

    pub fn has_control(&self, control: &str) -> bool {
        self.control == control
    }

    pub fn is_sender(&self) -> bool {
        self.sender
    }

    pub fn is_receiver(&self) -> bool {
        !self.sender
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn set_protocols(&self, protocols: &[LowerTransport]) {
        *self.protocols.write() = protocols.to_vec();
    }

    pub fn protocols(&self) -> Vec<LowerTransport> {
        self.protocols.read().clone()
    }

    pub fn set_profiles(&self, profiles: &[Profile]) {
        *self.profiles.write() = profiles.to_vec();
    }

    pub fn profiles(&self) -> Vec<Profile> {
        self.profiles.read().clone()
    }

    /// Whether a client transport uses a lower transport and profile this
    /// stream allows.
    pub fn is_transport_supported(&self, transport: &Transport) -> bool {
        if !self.protocols.read().contains(&transport.lower_transport) {
            tracing::debug!(stream = self.index, lower = ?transport.lower_transport, "lower transport not allowed");
            return false;
        }
        if !self.profiles.read().contains(&transport.profile) {
            tracing::debug!(stream = self.index, profile = ?transport.profile, "profile not allowed");
            return false;
        }
        true
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Relaxed)
    }

    pub fn set_mtu(&self, mtu: u32) {
        tracing::debug!(stream = self.index, mtu, "mtu changed");
        self.mtu.store(mtu, Ordering::Relaxed);
    }

    pub fn publish_clock_mode(&self) -> PublishClockMode {
        *self.clock_mode.read()
    }

    pub fn set_publish_clock_mode(&self, mode: PublishClockMode) {
        *self.clock_mode.write() = mode;
    }

    /// Bind the RTP/RTCP socket pair for one address family. Idempotent.
    pub fn allocate_udp_sockets(&self, ipv6: bool) -> bool {
        let mut udp = self.udp.lock();
        let slot = if ipv6 { &mut udp.v6 } else { &mut udp.v4 };
        if slot.is_some() {
            return true;
        }
        let addr = if ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        match UdpTransport::bind_pair(addr) {
            Ok(pair) => {
                if let Some(mcast) = self.multicast.read().as_ref() {
                    if let Err(e) = pair.0.set_multicast_ttl(mcast.ttl) {
                        tracing::warn!(stream = self.index, error = %e, "failed to set multicast ttl");
                    }
                }
                *slot = Some(pair);
                true
            }
            Err(e) => {
                tracing::error!(stream = self.index, error = %e, "failed to allocate udp ports");
                false
            }
        }
    }

    /// The local RTP/RTCP ports for the given family, or unset when no
    /// sockets were allocated.
    pub fn server_port(&self, ipv6: bool) -> PortRange {
        let udp = self.udp.lock();
        let pair = if ipv6 { &udp.v6 } else { &udp.v4 };
        match pair {
            Some((rtp, rtcp)) => match (rtp.local_port(), rtcp.local_port()) {
                (Ok(a), Ok(b)) => PortRange::new(i32::from(a), i32::from(b)),
                _ => PortRange::UNSET,
            },
            None => PortRange::UNSET,
        }
    }

    /// Send one packet from the stream's own UDP sockets.
    pub fn send_udp(&self, packet: &[u8], dest: &str, port: u16, rtp: bool) -> bool {
        let Ok(ip) = dest.parse::<IpAddr>() else {
            tracing::warn!(stream = self.index, dest, "unparsable udp destination");
            return false;
        };
        let udp = self.udp.lock();
        let pair = if ip.is_ipv6() { &udp.v6 } else { &udp.v4 };
        let Some((rtp_sock, rtcp_sock)) = pair else {
            return false;
        };
        let sock = if rtp { rtp_sock } else { rtcp_sock };
        match sock.send_to(packet, SocketAddr::new(ip, port)) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(stream = self.index, dest, port, error = %e, "udp send failed");
                false
            }
        }
    }

    pub fn set_multicast(&self, config: Option<MulticastConfig>) {
        *self.multicast.write() = config;
    }

    /// Server-chosen multicast group, if the stream has one configured.
    pub fn multicast_address(&self) -> Option<MulticastConfig> {
        self.multicast.read().clone()
    }

    pub fn set_max_mcast_ttl(&self, ttl: u32) {
        self.max_mcast_ttl.store(ttl, Ordering::Relaxed);
    }

    /// A client-requested TTL must lie within `1..=max_mcast_ttl`.
    pub fn verify_mcast_ttl(&self, ttl: u32) -> bool {
        ttl > 0 && ttl <= self.max_mcast_ttl.load(Ordering::Relaxed)
    }

    /// Register a multicast receiver group. Fails for non-multicast
    /// addresses.
    pub fn add_multicast_client_address(&self, dest: &str, ports: PortRange) -> bool {
        match dest.parse::<IpAddr>() {
            Ok(ip) if ip.is_multicast() => {
                let mut clients = self.mcast_clients.lock();
                if !clients.iter().any(|(d, p)| d == dest && *p == ports) {
                    clients.push((dest.to_string(), ports));
                }
                true
            }
            _ => {
                tracing::warn!(stream = self.index, dest, "not a multicast address");
                false
            }
        }
    }

    pub fn multicast_clients(&self) -> Vec<(String, PortRange)> {
        self.mcast_clients.lock().clone()
    }

    pub fn set_srtp_key(&self, key: Option<Vec<u8>>) {
        *self.srtp_key.write() = key;
    }

    pub fn has_srtp_key(&self) -> bool {
        self.srtp_key.read().is_some()
    }

    /// Key material a recording client sent in a `KeyMgmt` header.
    pub fn remote_key(&self) -> Option<Vec<u8>> {
        self.remote_key.read().clone()
    }

    /// Parse a `KeyMgmt` header (RFC 4567 §3.3). Only `prot=mikey` is
    /// understood; its base64 `data` is kept as the remote key.
    pub fn handle_keymgmt(&self, keymgmt: &str) -> bool {
        for spec in keymgmt.split(',') {
            let mut prot = None;
            let mut data = None;
            for param in spec.split(';').map(str::trim) {
                match param.split_once('=') {
                    Some(("prot", v)) => prot = Some(v.trim_matches('"')),
                    Some(("data", v)) => data = Some(v.trim_matches('"')),
                    _ => {}
                }
            }
            if prot != Some("mikey") {
                continue;
            }
            let Some(data) = data else {
                return false;
            };
            return match BASE64.decode(data) {
                Ok(key) if !key.is_empty() => {
                    *self.remote_key.write() = Some(key);
                    true
                }
                _ => {
                    tracing::warn!(stream = self.index, "invalid keymgmt data");
                    false
                }
            };
        }
        tracing::warn!(stream = self.index, "no supported key management protocol");
        false
    }

    /// The `KeyMgmt` value announcing this stream's key at `location`, or
    /// `None` without SRTP.
    pub fn make_keymgmt(&self, location: &str) -> Option<String> {
        let key = self.srtp_key.read();
        let key = key.as_ref()?;
        Some(format!(
            "prot=mikey; uri=\"{location}\"; data=\"{}\"",
            BASE64.encode(key)
        ))
    }

    /// Finish wiring for `transport`: UDP transports need their sockets.
    pub fn complete(&self, transport: &Transport) -> bool {
        let ok = match transport.lower_transport {
            LowerTransport::Tcp => true,
            LowerTransport::Udp | LowerTransport::UdpMcast => {
                let ipv6 = transport
                    .destination
                    .as_deref()
                    .and_then(|d| d.parse::<IpAddr>().ok())
                    .is_some_and(|ip| ip.is_ipv6());
                self.allocate_udp_sockets(ipv6)
            }
        };
        if ok {
            self.complete.store(true, Ordering::SeqCst);
        }
        ok
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn add_transport(&self, transport: &Arc<StreamTransport>) -> bool {
        let mut transports = self.transports.lock();
        if !transports.iter().any(|t| Arc::ptr_eq(t, transport)) {
            transports.push(transport.clone());
            tracing::debug!(stream = self.index, transports = transports.len(), "transport added");
        }
        true
    }

    pub fn remove_transport(&self, transport: &Arc<StreamTransport>) {
        let mut transports = self.transports.lock();
        transports.retain(|t| !Arc::ptr_eq(t, transport));
        tracing::debug!(stream = self.index, transports = transports.len(), "transport removed");
    }

    pub fn n_transports(&self) -> usize {
        self.transports.lock().len()
    }

    /// Deliver one RTP packet to every active transport that is not
    /// blocked. Returns the number of transports that took it.
    pub fn send_rtp(&self, packet: &[u8]) -> usize {
        if let Some(seq_ts) = rtp_seq_and_timestamp(packet) {
            *self.last_sent.lock() = Some(seq_ts);
        }
        self.fan_out(packet, true)
    }

    pub fn send_rtcp(&self, packet: &[u8]) -> usize {
        self.fan_out(packet, false)
    }

    fn fan_out(&self, packet: &[u8], rtp: bool) -> usize {
        let transports = self.transports.lock().clone();
        transports
            .iter()
            .filter(|t| {
                if t.check_back_pressure(rtp) {
                    tracing::trace!(stream = self.index, "transport busy, dropping packet");
                    return false;
                }
                true
            })
            .filter(|t| if rtp { t.send_rtp(packet) } else { t.send_rtcp(packet) })
            .count()
    }

    /// `(seq, rtptime)` for the `RTP-Info` header: the values the next
    /// packet continues from.
    pub fn rtp_info(&self) -> (u16, u32) {
        match *self.last_sent.lock() {
            Some((seq, ts)) => (seq.wrapping_add(1), ts),
            None => (self.seqnum_base, self.rtptime_base),
        }
    }

    /// RTP from a recording client. Only receiving streams accept it.
    pub fn recv_rtp(&self, payload: Vec<u8>) -> bool {
        if self.sender {
            return false;
        }
        self.enqueue(ReceivedPacket::Rtp(payload));
        true
    }

    /// RTCP (receiver or sender reports) from the client.
    pub fn recv_rtcp(&self, payload: Vec<u8>) -> bool {
        self.enqueue(ReceivedPacket::Rtcp(payload));
        true
    }

    fn enqueue(&self, packet: ReceivedPacket) {
        let mut received = self.received.lock();
        if received.len() >= RECEIVE_QUEUE_LIMIT {
            received.pop_front();
            tracing::trace!(stream = self.index, "receive queue full, dropped oldest");
        }
        received.push_back(packet);
    }

    pub fn pop_received(&self) -> Option<ReceivedPacket> {
        self.received.lock().pop_front()
    }
}

/// Sequence number and timestamp from an RTP fixed header (RFC 3550 §5.1).
fn rtp_seq_and_timestamp(packet: &[u8]) -> Option<(u16, u32)> {
    if packet.len() < 12 || packet[0] >> 6 != 2 {
        return None;
    }
    let seq = u16::from_be_bytes([packet[2], packet[3]]);
    let ts = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
    Some((seq, ts))
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("index", &self.index)
            .field("control", &self.control)
            .field("encoding", &self.config.encoding)
            .field("sender", &self.sender)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp(seq: u16, ts: u32) -> Vec<u8> {
        let mut p = vec![0x80, 96];
        p.extend_from_slice(&seq.to_be_bytes());
        p.extend_from_slice(&ts.to_be_bytes());
        p.extend_from_slice(&[0, 0, 0, 1, 0xAA]);
        p
    }

    #[test]
    fn control_defaults_to_index() {
        let s = Stream::new(2, StreamConfig::h264(96));
        assert_eq!(s.control(), "stream=2");
        let s = Stream::new(0, StreamConfig::h264(96).with_control("video"));
        assert!(s.has_control("video"));
    }

    #[test]
    fn transport_support_checks_lower_and_profile() {
        let s = Stream::new(0, StreamConfig::h264(96));
        s.set_protocols(&[LowerTransport::Tcp]);
        let tcp = Transport::parse("RTP/AVP/TCP;interleaved=0-1").unwrap();
        let udp = Transport::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        let savp = Transport::parse("RTP/SAVP/TCP;interleaved=0-1").unwrap();
        assert!(s.is_transport_supported(&tcp));
        assert!(!s.is_transport_supported(&udp));
        assert!(!s.is_transport_supported(&savp));
    }

    #[test]
    fn rtp_info_follows_sent_packets() {
        let s = Stream::new(0, StreamConfig::h264(96));
        assert_eq!(s.rtp_info(), (s.seqnum_base, s.rtptime_base));
        assert_eq!(s.send_rtp(&rtp(100, 9000)), 0);
        assert_eq!(s.rtp_info(), (101, 9000));
    }

    #[test]
    fn keymgmt_roundtrips_through_base64() {
        let sender = Stream::new(0, StreamConfig::h264(96));
        assert!(sender.make_keymgmt("rtsp://h/x/stream=0").is_none());
        sender.set_srtp_key(Some(vec![1, 2, 3, 4]));
        let header = sender.make_keymgmt("rtsp://h/x/stream=0").unwrap();
        assert_eq!(header, "prot=mikey; uri=\"rtsp://h/x/stream=0\"; data=\"AQIDBA==\"");

        let receiver = Stream::receiver(0, StreamConfig::h264(96));
        assert!(receiver.handle_keymgmt(&header));
        assert_eq!(receiver.remote_key(), Some(vec![1, 2, 3, 4]));
        assert!(!receiver.handle_keymgmt("prot=other; data=\"AQ==\""));
        assert!(!receiver.handle_keymgmt("prot=mikey; data=\"!!\""));
    }

    #[test]
    fn receivers_queue_rtp() {
        let s = Stream::receiver(0, StreamConfig::h264(96));
        assert!(s.recv_rtp(vec![1]));
        assert!(s.recv_rtcp(vec![2]));
        assert_eq!(s.pop_received(), Some(ReceivedPacket::Rtp(vec![1])));
        assert_eq!(s.pop_received(), Some(ReceivedPacket::Rtcp(vec![2])));

        let sender = Stream::new(0, StreamConfig::h264(96));
        assert!(!sender.recv_rtp(vec![1]));
    }

    #[test]
    fn mcast_ttl_and_addresses() {
        let s = Stream::new(0, StreamConfig::h264(96));
        s.set_max_mcast_ttl(16);
        assert!(s.verify_mcast_ttl(16));
        assert!(!s.verify_mcast_ttl(17));
        assert!(!s.verify_mcast_ttl(0));
        assert!(s.add_multicast_client_address("224.2.0.1", PortRange::new(5000, 5001)));
        assert!(!s.add_multicast_client_address("10.0.0.1", PortRange::new(5000, 5001)));
        assert_eq!(s.multicast_clients().len(), 1);
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::media::Stream;
use crate::protocol::{LowerTransport, RtspUrl, Transport};

/// Sends one RTP or RTCP packet on an interleaved channel. Returns `false`
/// when the packet could not be queued.
pub type SendDataFn = Box<dyn Fn(&[u8], u8) -> bool + Send + Sync>;
/// Whether the given interleaved channel still has a message in flight.
pub type BackPressureFn = Box<dyn Fn(u8) -> bool + Send + Sync>;
pub type NotifyFn = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    send_rtp: Option<SendDataFn>,
    send_rtcp: Option<SendDataFn>,
    back_pressure: Option<BackPressureFn>,
    keep_alive: Option<NotifyFn>,
    message_sent: Option<NotifyFn>,
}

/// Binds one [`Stream`] to the transport a client negotiated in SETUP.
///
/// For interleaved transports the owning client installs send callbacks
/// that frame packets onto its control connection; UDP transports send
/// through the stream's own sockets.
pub struct StreamTransport {
    stream: Arc<Stream>,
    transport: Transport,
    url: Mutex<Option<RtspUrl>>,
    active: AtomicBool,
    remote_addr: Mutex<Option<String>>,
    callbacks: RwLock<Callbacks>,
}

impl StreamTransport {
    pub fn new(stream: Arc<Stream>, transport: Transport) -> Arc<Self> {
        Arc::new(StreamTransport {
            stream,
            transport,
            url: Mutex::new(None),
            active: AtomicBool::new(false),
            remote_addr: Mutex::new(None),
            callbacks: RwLock::new(Callbacks::default()),
        })
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn is_interleaved(&self) -> bool {
        self.transport.lower_transport == LowerTransport::Tcp
    }

    pub fn set_url(&self, url: Option<RtspUrl>) {
        *self.url.lock() = url;
    }

    pub fn url(&self) -> Option<RtspUrl> {
        self.url.lock().clone()
    }

    /// Starts or stops delivery from the stream to this transport.
    pub fn set_active(self: &Arc<Self>, active: bool) -> bool {
        if self.active.swap(active, Ordering::SeqCst) == active {
            return true;
        }
        if active {
            self.stream.add_transport(self)
        } else {
            self.stream.remove_transport(self);
            true
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_callbacks(&self, send_rtp: SendDataFn, send_rtcp: SendDataFn) {
        let mut cbs = self.callbacks.write();
        cbs.send_rtp = Some(send_rtp);
        cbs.send_rtcp = Some(send_rtcp);
    }

    pub fn set_back_pressure_callback(&self, f: BackPressureFn) {
        self.callbacks.write().back_pressure = Some(f);
    }

    pub fn set_keepalive(&self, f: NotifyFn) {
        self.callbacks.write().keep_alive = Some(f);
    }

    pub fn set_message_sent(&self, f: NotifyFn) {
        self.callbacks.write().message_sent = Some(f);
    }

    /// Drops every installed callback, detaching the transport from its
    /// client.
    pub fn clear_callbacks(&self) {
        *self.callbacks.write() = Callbacks::default();
    }

    /// Source address attached to received interleaved data, cached on
    /// first use.
    pub fn remote_addr(&self) -> Option<String> {
        self.remote_addr.lock().clone()
    }

    pub(crate) fn remote_addr_or_insert(&self, make: impl FnOnce() -> Option<String>) {
        let mut addr = self.remote_addr.lock();
        if addr.is_none() {
            *addr = make();
        }
    }

    pub fn send_rtp(&self, packet: &[u8]) -> bool {
        self.send(packet, true)
    }

    pub fn send_rtcp(&self, packet: &[u8]) -> bool {
        self.send(packet, false)
    }

    fn send(&self, packet: &[u8], rtp: bool) -> bool {
        let cbs = self.callbacks.read();
        let cb = if rtp { &cbs.send_rtp } else { &cbs.send_rtcp };
        if let Some(cb) = cb {
            let channel = if rtp {
                self.transport.interleaved.min
            } else {
                self.transport.interleaved.max
            };
            return cb(packet, channel as u8);
        }
        drop(cbs);

        match self.transport.lower_transport {
            LowerTransport::Tcp => false,
            LowerTransport::Udp | LowerTransport::UdpMcast => {
                let (dest, ports) = match self.transport.lower_transport {
                    LowerTransport::UdpMcast => (&self.transport.destination, self.transport.port),
                    _ => (&self.transport.destination, self.transport.client_port),
                };
                let port = if rtp { ports.min } else { ports.max };
                match (dest, u16::try_from(port)) {
                    (Some(dest), Ok(port)) => self.stream.send_udp(packet, dest, port, rtp),
                    _ => false,
                }
            }
        }
    }

    /// Whether the channel carrying RTP (or RTCP) is still busy.
    pub fn check_back_pressure(&self, rtp: bool) -> bool {
        let channel = if rtp {
            self.transport.interleaved.min
        } else {
            self.transport.interleaved.max
        };
        match &self.callbacks.read().back_pressure {
            Some(cb) => cb(channel as u8),
            None => false,
        }
    }

    pub fn keep_alive(&self) {
        if let Some(cb) = &self.callbacks.read().keep_alive {
            cb();
        }
    }

    pub fn message_sent(&self) {
        if let Some(cb) = &self.callbacks.read().message_sent {
            cb();
        }
    }

    /// Hands data received on an interleaved channel to the stream.
    pub fn recv_data(&self, channel: u8, payload: Vec<u8>) -> bool {
        if i32::from(channel) == self.transport.interleaved.min {
            self.stream.recv_rtp(payload)
        } else if i32::from(channel) == self.transport.interleaved.max {
            self.keep_alive();
            self.stream.recv_rtcp(payload)
        } else {
            false
        }
    }
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("stream", &self.stream.index())
            .field("transport", &self.transport.as_text())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StreamConfig;
    use crate::protocol::PortRange;

    #[test]
    fn interleaved_send_uses_channel_pair() {
        let stream = Arc::new(Stream::new(0, StreamConfig::h264(96)));
        let transport = Transport {
            lower_transport: LowerTransport::Tcp,
            interleaved: PortRange::new(4, 5),
            ..Transport::default()
        };
        let st = StreamTransport::new(stream, transport);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (seen.clone(), seen.clone());
        st.set_callbacks(
            Box::new(move |_, ch| {
                a.lock().push(ch);
                true
            }),
            Box::new(move |_, ch| {
                b.lock().push(ch);
                true
            }),
        );
        assert!(st.send_rtp(&[0x80]));
        assert!(st.send_rtcp(&[0x81]));
        assert_eq!(*seen.lock(), vec![4, 5]);

        st.clear_callbacks();
        assert!(!st.send_rtp(&[0x80]));
    }

    #[test]
    fn rtcp_on_interleaved_channel_keeps_alive() {
        let stream = Arc::new(Stream::new(0, StreamConfig::h264(96)));
        let transport = Transport {
            lower_transport: LowerTransport::Tcp,
            interleaved: PortRange::new(0, 1),
            ..Transport::default()
        };
        let st = StreamTransport::new(stream.clone(), transport);
        let touched = Arc::new(AtomicBool::new(false));
        let t = touched.clone();
        st.set_keepalive(Box::new(move || t.store(true, Ordering::SeqCst)));

        assert!(st.recv_data(1, vec![0x81, 0xC9, 0, 1]));
        assert!(touched.load(Ordering::SeqCst));
        assert!(!st.recv_data(7, vec![0]));
    }
}

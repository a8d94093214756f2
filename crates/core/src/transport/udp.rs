use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::error::{Result, RtspError};

const PORT_PAIR_ATTEMPTS: usize = 16;

/// One UDP socket of an RTP/RTCP pair.
///
/// Address-only: it does not know about
/// sessions or streams. The owning [`Stream`](crate::media::Stream) decides
/// where packets go.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral UDP socket on `addr`.
    pub fn bind(addr: IpAddr) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(addr, 0))?;
        Ok(Self { socket })
    }

    /// Bind an (RTP, RTCP) pair on consecutive ports with an even RTP port
    /// (RFC 3550 §11).
    pub fn bind_pair(addr: IpAddr) -> Result<(Self, Self)> {
        for _ in 0..PORT_PAIR_ATTEMPTS {
            let rtp = UdpSocket::bind(SocketAddr::new(addr, 0))?;
            let port = rtp.local_addr()?.port();
            if port % 2 != 0 || port == u16::MAX {
                continue;
            }
            if let Ok(rtcp) = UdpSocket::bind(SocketAddr::new(addr, port + 1)) {
                tracing::trace!(rtp_port = port, rtcp_port = port + 1, "allocated server ports");
                return Ok((Self { socket: rtp }, Self { socket: rtcp }));
            }
        }
        Err(RtspError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "no free RTP/RTCP port pair",
        )))
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Multicast TTL for outgoing packets.
    pub fn set_multicast_ttl(&self, ttl: u32) -> Result<()> {
        self.socket.set_multicast_ttl_v4(ttl)?;
        Ok(())
    }

    /// Send raw bytes to a specific socket address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr)?)
    }
}

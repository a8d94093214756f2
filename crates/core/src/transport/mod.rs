//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): the control connections. One thread per client
//!   reads and frames RTSP messages, interleaved `$` data and the halves
//!   of RTSP-over-HTTP tunnels, and drives the client's control timer.
//!
//! - **UDP** ([`udp`]): the RTP/RTCP socket pairs streams allocate for
//!   unicast and multicast delivery.

pub mod tcp;
pub mod udp;

pub use tcp::{TcpConnection, TcpWatch};
pub use udp::UdpTransport;

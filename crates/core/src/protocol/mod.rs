//! RTSP protocol types (RFC 2326, RFC 7826).
//!
//! This module holds the wire-level vocabulary the client state machine
//! works with: methods and versions, status codes, requests and responses,
//! the interleaved-data framing, and the structured headers the server
//! interprets (`Transport`, `Range`), plus URLs and SDP.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! Key differences from HTTP:
//! - Stateful: sessions persist across requests (RFC 2326 §3).
//! - Different methods: OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, ...
//! - Session header carries a server-assigned ID (RFC 2326 §12.37).
//! - RTP and RTCP may share the TCP connection as `$`-framed data
//!   (RFC 2326 §10.12).

pub mod headers;
pub mod message;
pub mod method;
pub mod range;
pub mod request;
pub mod response;
pub mod sdp;
pub mod status;
pub mod transport;
pub mod url;

pub use headers::Headers;
pub use message::{MessageReader, RtspMessage};
pub use method::{Method, Version};
pub use range::{RangeUnit, TimeRange, TimeValue};
pub use request::RtspRequest;
pub use response::{RtspResponse, SERVER_AGENT};
pub use sdp::{Sdp, SdpMedia};
pub use status::StatusCode;
pub use transport::{LowerTransport, PortRange, Profile, Transport};
pub use url::RtspUrl;

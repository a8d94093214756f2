use crate::error::{ParseErrorKind, Result, RtspError};
use crate::protocol::headers::Headers;
use crate::protocol::method::Version;
use crate::protocol::request::{RtspRequest, finish, parse_headers};
use crate::protocol::status::StatusCode;

/// An RTSP response (RFC 2326 §7).
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Uses a builder pattern: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize).
/// `Content-Length` is computed automatically when a body is present.
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub struct RtspResponse {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Server identification string stamped on every outgoing response
/// per RFC 2326 §12.36.
pub const SERVER_AGENT: &str = "rtsp-rs/0.2";

impl RtspResponse {
    pub fn new(status: StatusCode) -> Self {
        RtspResponse {
            version: Version::V1_0,
            status,
            reason: status.reason().to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// 200 OK (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// A response to `request`: echoes its version, `CSeq` and `Session`.
    pub fn for_request(status: StatusCode, request: &RtspRequest) -> Self {
        let mut response = Self::new(status);
        response.version = request.version;
        if let Some(cseq) = request.cseq() {
            response.headers.add("CSeq", cseq);
        }
        if let Some(session) = request.get_header("Session") {
            response.headers.add("Session", session);
        }
        response
    }

    /// Parse a status line and headers, as sent by an RTSP client answering
    /// a server-initiated request.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines();
        let status_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or(RtspError::parse(ParseErrorKind::EmptyRequest))?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts
            .next()
            .and_then(Version::parse)
            .ok_or(RtspError::parse(ParseErrorKind::InvalidStatusLine))?;
        let status = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .map(StatusCode::new)
            .ok_or(RtspError::parse(ParseErrorKind::InvalidStatusLine))?;
        let reason = parts.next().unwrap_or_default().trim().to_string();

        Ok(RtspResponse {
            version,
            status,
            reason,
            headers: parse_headers(lines)?,
            body: Vec::new(),
        })
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically
    /// (RFC 2326 §12.14).
    pub fn serialize(&self) -> Vec<u8> {
        let mut head = format!("{} {} {}\r\n", self.version, self.status.as_u16(), self.reason);
        self.headers.write_to(&mut head);
        finish(head, &self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Method;

    #[test]
    fn serialize_no_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "1")
            .add_header("Public", "OPTIONS");
        let s = String::from_utf8(resp.serialize()).unwrap();
        assert!(s.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(s.contains("Public: OPTIONS\r\n"));
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn serialize_with_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "2")
            .with_body("v=0\r\n");
        let s = String::from_utf8(resp.serialize()).unwrap();
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("v=0\r\n"));
    }

    #[test]
    fn for_request_copies_cseq_session_and_version() {
        let mut req = RtspRequest::new(Method::Play, "rtsp://h/test")
            .add_header("CSeq", "7")
            .add_header("Session", "ABCD");
        req.version = Version::V2_0;
        let resp = RtspResponse::for_request(StatusCode::NOT_FOUND, &req);
        assert_eq!(resp.get_header("CSeq"), Some("7"));
        assert_eq!(resp.get_header("Session"), Some("ABCD"));
        let s = String::from_utf8(resp.serialize()).unwrap();
        assert!(s.starts_with("RTSP/2.0 404 Not Found\r\n"));
    }

    #[test]
    fn parse_status_line() {
        let resp = RtspResponse::parse("RTSP/1.0 451 Parameter Not Understood\r\nCSeq: 3\r\n\r\n").unwrap();
        assert_eq!(resp.status, StatusCode::PARAMETER_NOT_UNDERSTOOD);
        assert_eq!(resp.reason, "Parameter Not Understood");
        assert!(RtspResponse::parse("RTSP/1.0 abc\r\n\r\n").is_err());
    }
}

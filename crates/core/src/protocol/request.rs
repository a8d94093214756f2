use crate::error::{ParseErrorKind, Result, RtspError};
use crate::protocol::headers::Headers;
use crate::protocol::method::{Method, Version};

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2.
#[derive(Debug, Clone, PartialEq)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, etc.).
    pub method: Method,
    /// Request-URI (e.g. `rtsp://host:port/stream/stream=0`), or `*`.
    pub uri: String,
    /// Protocol version from the request line.
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RtspRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        RtspRequest {
            method,
            uri: uri.into(),
            version: Version::V1_0,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Parse the request line and headers of an RTSP (or tunnel HTTP)
    /// request. The body, if any, is attached by the caller.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines();

        let request_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or(RtspError::parse(ParseErrorKind::EmptyRequest))?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(RtspError::parse(ParseErrorKind::InvalidRequestLine));
        }

        let Ok(method) = parts[0].parse::<Method>();
        let version = Version::parse(parts[2])
            .ok_or(RtspError::parse(ParseErrorKind::InvalidRequestLine))?;

        Ok(RtspRequest {
            method,
            uri: parts[1].to_string(),
            version,
            headers: parse_headers(lines)?,
            body: Vec::new(),
        })
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn get_header_n(&self, name: &str, n: usize) -> Option<&str> {
        self.headers.get_n(name, n)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Serialize to the wire format, with `Content-Length` when a body is
    /// present.
    pub fn serialize(&self) -> Vec<u8> {
        let mut head = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        self.headers.write_to(&mut head);
        finish(head, &self.body)
    }
}

pub(crate) fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let colon_pos = line
            .find(':')
            .ok_or(RtspError::parse(ParseErrorKind::InvalidHeader))?;
        headers.add(line[..colon_pos].trim(), line[colon_pos + 1..].trim());
    }
    Ok(headers)
}

pub(crate) fn finish(mut head: String, body: &[u8]) -> Vec<u8> {
    if !body.is_empty() {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");
    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options_request() {
        let raw = "OPTIONS rtsp://localhost:8554/test RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, Method::Options);
        assert_eq!(req.uri, "rtsp://localhost:8554/test");
        assert_eq!(req.version, Version::V1_0);
        assert_eq!(req.cseq(), Some("1"));
    }

    #[test]
    fn parse_setup_with_transport() {
        let raw = "SETUP rtsp://localhost:8554/test/stream=0 RTSP/2.0\r\n\
                   CSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=8000-8001\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, Method::Setup);
        assert_eq!(req.version, Version::V2_0);
        assert_eq!(
            req.get_header("Transport"),
            Some("RTP/AVP;unicast;client_port=8000-8001")
        );
    }

    #[test]
    fn parse_empty_request() {
        assert!(RtspRequest::parse("").is_err());
    }

    #[test]
    fn parse_invalid_request_line() {
        assert!(RtspRequest::parse("JUST_A_METHOD\r\n\r\n").is_err());
        assert!(RtspRequest::parse("OPTIONS * SIP/2.0\r\n\r\n").is_err());
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let raw = "OPTIONS rtsp://localhost RTSP/1.0\r\ncseq: 42\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.get_header("CSeq"), Some("42"));
        assert_eq!(req.get_header("CSEQ"), Some("42"));
    }

    #[test]
    fn serialize_with_body() {
        let req = RtspRequest::new(Method::SetParameter, "rtsp://h/test")
            .add_header("CSeq", "9")
            .with_body("a: b\r\n");
        let wire = String::from_utf8(req.serialize()).unwrap();
        assert!(wire.starts_with("SET_PARAMETER rtsp://h/test RTSP/1.0\r\nCSeq: 9\r\n"));
        assert!(wire.ends_with("Content-Length: 6\r\n\r\na: b\r\n"));
    }
}

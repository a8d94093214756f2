use crate::error::{ParseErrorKind, Result, RtspError};
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;

/// Any message carried on an RTSP control connection.
#[derive(Debug, Clone, PartialEq)]
pub enum RtspMessage {
    Request(RtspRequest),
    Response(RtspResponse),
    /// Interleaved binary data (RFC 2326 §10.12): `$`, channel, u16 length.
    Data { channel: u8, payload: Vec<u8> },
}

impl RtspMessage {
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            RtspMessage::Request(req) => req.serialize(),
            RtspMessage::Response(resp) => resp.serialize(),
            RtspMessage::Data { channel, payload } => {
                let mut out = Vec::with_capacity(payload.len() + 4);
                out.push(b'$');
                out.push(*channel);
                out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                out.extend_from_slice(payload);
                out
            }
        }
    }
}

impl From<RtspRequest> for RtspMessage {
    fn from(req: RtspRequest) -> Self {
        RtspMessage::Request(req)
    }
}

impl From<RtspResponse> for RtspMessage {
    fn from(resp: RtspResponse) -> Self {
        RtspMessage::Response(resp)
    }
}

/// Incremental framer for bytes read off a control connection.
///
/// Feed raw bytes with [`feed`](Self::feed) and pull complete messages with
/// [`next_message`](Self::next_message). A message whose head cannot be
/// parsed is discarded up to its blank line so the stream can resynchronize.
#[derive(Debug)]
pub struct MessageReader {
    buf: Vec<u8>,
    content_length_limit: u32,
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new(u32::MAX)
    }
}

impl MessageReader {
    pub fn new(content_length_limit: u32) -> Self {
        MessageReader {
            buf: Vec::new(),
            content_length_limit,
        }
    }

    pub fn set_content_length_limit(&mut self, limit: u32) {
        self.content_length_limit = limit;
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet framed.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn next_message(&mut self) -> Result<Option<RtspMessage>> {
        // stray line breaks between messages
        let skip = self.buf.iter().take_while(|&&b| b == b'\r' || b == b'\n').count();
        self.buf.drain(..skip);

        if self.buf.is_empty() {
            return Ok(None);
        }

        if self.buf[0] == b'$' {
            if self.buf.len() < 4 {
                return Ok(None);
            }
            let channel = self.buf[1];
            let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
            if self.buf.len() < 4 + len {
                return Ok(None);
            }
            let payload = self.buf[4..4 + len].to_vec();
            self.buf.drain(..4 + len);
            return Ok(Some(RtspMessage::Data { channel, payload }));
        }

        let Some((head_len, total_head)) = find_head_end(&self.buf) else {
            return Ok(None);
        };

        let parsed = std::str::from_utf8(&self.buf[..head_len])
            .map_err(|_| RtspError::parse(ParseErrorKind::InvalidHeader))
            .and_then(|head| {
                if head.starts_with("RTSP/") {
                    RtspResponse::parse(head).map(RtspMessage::Response)
                } else {
                    RtspRequest::parse(head).map(RtspMessage::Request)
                }
            });

        let mut message = match parsed {
            Ok(message) => message,
            Err(e) => {
                self.buf.drain(..total_head);
                return Err(e);
            }
        };

        let content_length = match content_length(&message) {
            Ok(len) => len,
            Err(e) => {
                self.buf.drain(..total_head);
                return Err(e);
            }
        };

        if content_length > self.content_length_limit as usize {
            self.buf.drain(..total_head);
            return Err(RtspError::parse(ParseErrorKind::ContentTooLarge));
        }

        if self.buf.len() < total_head + content_length {
            return Ok(None);
        }

        let body = self.buf[total_head..total_head + content_length].to_vec();
        self.buf.drain(..total_head + content_length);

        match &mut message {
            RtspMessage::Request(req) => req.body = body,
            RtspMessage::Response(resp) => resp.body = body,
            RtspMessage::Data { .. } => {}
        }
        Ok(Some(message))
    }
}

/// Length of the head (without the blank line) and of the head including
/// its terminating blank line.
fn find_head_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, p + 4));
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, p + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn content_length(message: &RtspMessage) -> Result<usize> {
    let value = match message {
        // a tunnel POST body is the base64 RTSP stream itself
        RtspMessage::Request(req) if req.version.is_http() => None,
        RtspMessage::Request(req) => req.get_header("Content-Length"),
        RtspMessage::Response(resp) => resp.get_header("Content-Length"),
        RtspMessage::Data { .. } => None,
    };
    match value {
        None => Ok(0),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| RtspError::parse(ParseErrorKind::InvalidContentLength)),
    }
}

//! Error types for the RTSP server library.

use std::fmt;

/// Errors that can occur in the RTSP server library.
///
/// Request handling never surfaces these to the peer directly: the client
/// state machine maps failures onto RTSP status codes. These errors cover
/// the API surface around it.
///
/// - **Protocol**: [`Parse`](Self::Parse) for malformed messages and headers.
/// - **Transport**: [`Io`](Self::Io), [`NotConnected`](Self::NotConnected),
///   [`Tunnel`](Self::Tunnel).
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`SessionLimit`](Self::SessionLimit).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
/// - **Client**: [`SendConflict`](Self::SendConflict).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No session with the given ID exists in the [`SessionPool`](crate::session::SessionPool).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session pool reached its configured maximum.
    #[error("session limit of {0} reached")]
    SessionLimit(usize),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP message or one of its structured headers.
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// No mount registered at the requested path.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// A single-message and a batched send function cannot both be installed.
    #[error("a {0} send function is already installed")]
    SendConflict(&'static str),

    /// The client has no connection or watch to send through.
    #[error("client is not connected")]
    NotConnected,

    /// HTTP tunnel setup failed.
    #[error("tunnel error: {0}")]
    Tunnel(String),
}

impl RtspError {
    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        RtspError::Parse { kind }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no start line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// Status line did not have the expected `Version Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a number.
    InvalidContentLength,
    /// The body exceeds the connection's content length limit.
    ContentTooLarge,
    /// Malformed `rtsp://` URL.
    InvalidUrl,
    /// Malformed `Transport` header.
    InvalidTransport,
    /// Malformed `Range` header.
    InvalidRange,
    /// Malformed SDP body.
    InvalidSdp,
    /// Malformed base64 in a tunnelled POST body.
    InvalidBase64,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
            Self::ContentTooLarge => write!(f, "content length exceeds limit"),
            Self::InvalidUrl => write!(f, "invalid url"),
            Self::InvalidTransport => write!(f, "invalid transport"),
            Self::InvalidRange => write!(f, "invalid range"),
            Self::InvalidSdp => write!(f, "invalid sdp"),
            Self::InvalidBase64 => write!(f, "invalid base64"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;

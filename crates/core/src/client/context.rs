use std::sync::Arc;

use crate::media::{Media, MediaFactory, Stream};
use crate::protocol::{Method, RtspRequest, RtspResponse, RtspUrl, StatusCode, Version};
use crate::session::{Session, SessionMedia, StreamTransport};

/// Everything known about the request being handled.
///
/// Handlers fill in the optional fields as they resolve them, so hooks and
/// [`Auth`](crate::auth::Auth) checks see as much context as is available
/// at the point they run. `response` is the response under construction;
/// hooks such as
/// [`adjust_play_response`](super::ClientHooks::adjust_play_response) may add
/// headers to it.
#[derive(Debug)]
pub struct RequestContext {
    pub request: RtspRequest,
    pub method: Method,
    pub version: Version,
    /// Sanitized request URL, `None` for `*`.
    pub uri: Option<RtspUrl>,
    pub session: Option<Arc<Session>>,
    pub session_media: Option<Arc<SessionMedia>>,
    pub media: Option<Arc<Media>>,
    pub stream: Option<Arc<Stream>>,
    pub transport: Option<Arc<StreamTransport>>,
    pub factory: Option<Arc<MediaFactory>>,
    pub response: RtspResponse,
    /// The session was created by this request and goes away if the
    /// request fails.
    pub(crate) created_session: bool,
}

impl RequestContext {
    pub fn new(request: RtspRequest) -> Self {
        let response = RtspResponse::for_request(StatusCode::OK, &request);
        RequestContext {
            method: request.method.clone(),
            version: request.version,
            request,
            uri: None,
            session: None,
            session_media: None,
            media: None,
            stream: None,
            transport: None,
            factory: None,
            response,
            created_session: false,
        }
    }

    /// Start a fresh response to the request with `status`.
    pub(crate) fn init_response(&mut self, status: StatusCode) {
        self.response = RtspResponse::for_request(status, &self.request);
    }
}

/// Why a request handler stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reject {
    /// Answer with a generic response carrying this status.
    Status(StatusCode),
    /// A response was already sent (by an auth check).
    Answered,
}

impl From<StatusCode> for Reject {
    fn from(code: StatusCode) -> Self {
        Reject::Status(code)
    }
}

pub(crate) type Handled = Result<(), Reject>;

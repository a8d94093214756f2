use std::sync::Arc;

use crate::client::RequestContext;
use crate::media::{Media, PlayMode};
use crate::protocol::{RtspMessage, RtspRequest, RtspResponse, RtspUrl, Sdp, StatusCode};
use crate::session::Session;

/// Application extension points of a [`Client`](super::Client).
///
/// Every method has a default, so implementors override only what they
/// need. A client runs its hooks in registration order.
///
/// The `pre_*` methods run before a request takes effect. The first hook
/// returning a non-2xx status vetoes the request and that status is sent
/// to the peer. The notification methods named after a method run after
/// its response was sent.
#[allow(unused_variables)]
pub trait ClientHooks: Send + Sync {
    fn pre_options(&self, ctx: &RequestContext) -> StatusCode {
        StatusCode::OK
    }

    fn pre_describe(&self, ctx: &RequestContext) -> StatusCode {
        StatusCode::OK
    }

    fn pre_setup(&self, ctx: &RequestContext) -> StatusCode {
        StatusCode::OK
    }

    fn pre_play(&self, ctx: &RequestContext) -> StatusCode {
        StatusCode::OK
    }

    fn pre_pause(&self, ctx: &RequestContext) -> StatusCode {
        StatusCode::OK
    }

    fn pre_teardown(&self, ctx: &RequestContext) -> StatusCode {
        StatusCode::OK
    }

    fn pre_get_parameter(&self, ctx: &RequestContext) -> StatusCode {
        StatusCode::OK
    }

    fn pre_set_parameter(&self, ctx: &RequestContext) -> StatusCode {
        StatusCode::OK
    }

    fn pre_announce(&self, ctx: &RequestContext) -> StatusCode {
        StatusCode::OK
    }

    fn pre_record(&self, ctx: &RequestContext) -> StatusCode {
        StatusCode::OK
    }

    fn options_request(&self, ctx: &RequestContext) {}

    fn describe_request(&self, ctx: &RequestContext) {}

    fn setup_request(&self, ctx: &RequestContext) {}

    fn play_request(&self, ctx: &RequestContext) {}

    fn pause_request(&self, ctx: &RequestContext) {}

    /// Runs before the session media is torn down.
    fn teardown_request(&self, ctx: &RequestContext) {}

    fn get_parameter_request(&self, ctx: &RequestContext) {}

    fn set_parameter_request(&self, ctx: &RequestContext) {}

    fn announce_request(&self, ctx: &RequestContext) {}

    fn record_request(&self, ctx: &RequestContext) {}

    /// A session was created by a SETUP on this client.
    fn new_session(&self, session: &Arc<Session>) {}

    /// Decide which of the `Require` options are supported. `None` leaves
    /// the decision to the next hook; with no decision every option is
    /// unsupported. `Some("")` accepts them all, any other string is sent
    /// back in the `Unsupported` header.
    fn check_requirements(&self, ctx: &RequestContext, required: &[String]) -> Option<String> {
        None
    }

    /// Rewrite the status of a generic error response.
    fn adjust_error_code(&self, ctx: &RequestContext, code: StatusCode) -> StatusCode {
        code
    }

    /// Inspect or change the seek derived from a PLAY request.
    fn adjust_play_mode(&self, ctx: &RequestContext, mode: &mut PlayMode) -> StatusCode {
        StatusCode::OK
    }

    /// Add headers to a successful PLAY response.
    fn adjust_play_response(&self, ctx: &mut RequestContext) -> StatusCode {
        StatusCode::OK
    }

    /// Answer a GET_PARAMETER with a body. `None` leaves it to the next
    /// hook; unanswered requests get 451.
    fn params_get(&self, ctx: &RequestContext) -> Option<RtspResponse> {
        None
    }

    /// Answer a SET_PARAMETER with a body, like
    /// [`params_get`](Self::params_get).
    fn params_set(&self, ctx: &RequestContext) -> Option<RtspResponse> {
        None
    }

    /// Configure `media` from an announced SDP. `None` uses
    /// [`Media::handle_sdp`] followed by preparing the media.
    fn handle_sdp(&self, ctx: &RequestContext, media: &Arc<Media>, sdp: &Sdp) -> Option<bool> {
        None
    }

    /// Map a request URL to the path used for mount and session lookups.
    fn make_path_from_uri(&self, uri: &RtspUrl) -> Option<String> {
        None
    }

    /// A response from the peer to a server-initiated request.
    fn handle_response(&self, session: Option<&Arc<Session>>, response: &RtspResponse) {}

    /// Last chance to modify an outgoing message.
    fn send_message(&self, message: &mut RtspMessage) {}

    /// Adjust the HTTP response that opens a tunnel.
    fn tunnel_http_response(&self, request: &RtspRequest, response: &mut RtspResponse) {}

    /// The connection closed and no session kept the client alive.
    fn closed(&self) {}
}

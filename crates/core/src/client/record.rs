use crate::client::context::Handled;
use crate::client::{Client, RequestContext};
use crate::media::MediaTarget;
use crate::protocol::{Sdp, StatusCode};
use crate::session::RtspState;

impl Client {
    pub(super) fn handle_announce(&self, ctx: &mut RequestContext) -> Handled {
        let Some(uri) = ctx.uri.clone() else {
            return Err(StatusCode::BAD_REQUEST.into());
        };
        self.pre_check(ctx, |h, c| h.pre_announce(c))?;

        let content_type = ctx.request.get_header("Content-Type").unwrap_or_default();
        if !content_type.trim().eq_ignore_ascii_case("application/sdp") {
            tracing::warn!(content_type, "ANNOUNCE without SDP");
            return Err(StatusCode::BAD_REQUEST.into());
        }
        if ctx.request.body.is_empty() {
            tracing::warn!("ANNOUNCE with empty body");
            return Err(StatusCode::BAD_REQUEST.into());
        }
        let sdp = match std::str::from_utf8(&ctx.request.body)
            .ok()
            .and_then(|text| Sdp::parse(text).ok())
        {
            Some(sdp) => sdp,
            None => {
                tracing::warn!("could not parse announced SDP");
                return Err(StatusCode::BAD_REQUEST.into());
            }
        };

        let path = self.make_path(&uri);
        let (media, _) = self.find_media(ctx, &path)?;
        if !media.transport_mode().record {
            tracing::warn!(path = %path, "media cannot record");
            return Err(StatusCode::METHOD_NOT_ALLOWED.into());
        }
        let _guard = media.lock();

        let handled = match self.hooks.iter().find_map(|h| h.handle_sdp(ctx, &media, &sdp)) {
            Some(handled) => handled,
            None => {
                media.handle_sdp(&sdp)
                    && self
                        .thread_pool
                        .get_thread()
                        .is_some_and(|thread| media.prepare(thread))
            }
        };
        if !handled {
            tracing::warn!(path = %path, "could not configure media from SDP");
            return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE.into());
        }

        ctx.init_response(StatusCode::OK);
        let base = uri.request_uri();
        for stream in media.streams() {
            let location = format!("{base}/{}", stream.control());
            if let Some(keymgmt) = stream.make_keymgmt(&location) {
                ctx.response.headers.add("KeyMgmt", keymgmt);
            }
        }

        media.suspend();
        self.send_message_inner(ctx.session.as_ref(), ctx.response.clone().into(), false);
        self.notify(|h| h.announce_request(ctx));
        Ok(())
    }

    pub(super) fn handle_record(&self, ctx: &mut RequestContext) -> Handled {
        let (session, sm, _) = self.aggregate_media(ctx)?;
        let media = sm.media().clone();
        let _guard = media.lock();

        self.pre_check(ctx, |h, c| h.pre_record(c))?;

        if !media.transport_mode().record {
            tracing::warn!("media does not support RECORD");
            return Err(StatusCode::METHOD_NOT_ALLOWED.into());
        }
        if !matches!(sm.rtsp_state(), RtspState::Playing | RtspState::Ready) {
            tracing::warn!(state = ?sm.rtsp_state(), "RECORD in wrong state");
            return Err(StatusCode::METHOD_NOT_VALID_IN_THIS_STATE.into());
        }

        if !media.complete_pipeline(&sm.transports()) {
            tracing::warn!("could not complete pipeline");
            return Err(StatusCode::METHOD_NOT_VALID_IN_THIS_STATE.into());
        }
        if !media.unsuspend() {
            tracing::warn!("could not unsuspend media");
            return Err(StatusCode::SERVICE_UNAVAILABLE.into());
        }

        ctx.init_response(StatusCode::OK);
        self.send_message_inner(Some(&session), ctx.response.clone().into(), false);
        sm.set_state(MediaTarget::Playing);
        sm.set_rtsp_state(RtspState::Recording);
        self.notify(|h| h.record_request(ctx));
        Ok(())
    }
}

use std::sync::Arc;

use rand::RngExt;

use crate::auth::AuthCheck;
use crate::client::context::{Handled, Reject};
use crate::client::{Client, RequestContext};
use crate::media::{Media, MediaTarget, PublishClockMode, SdpInfo};
use crate::protocol::{RtspResponse, Sdp, StatusCode, Version};
use crate::session::{RtspState, Session, SessionMedia};

const PUBLIC_METHODS: &[&str] = &[
    "OPTIONS",
    "DESCRIBE",
    "ANNOUNCE",
    "GET_PARAMETER",
    "PAUSE",
    "PLAY",
    "RECORD",
    "SETUP",
    "SET_PARAMETER",
    "TEARDOWN",
];

impl Client {
    pub(super) fn handle_options(&self, ctx: &mut RequestContext) -> Handled {
        let public = PUBLIC_METHODS
            .iter()
            .filter(|m| ctx.version != Version::V2_0 || !matches!(**m, "ANNOUNCE" | "RECORD"))
            .copied()
            .collect::<Vec<_>>()
            .join(", ");

        ctx.init_response(StatusCode::OK);
        ctx.response.headers.add("Public", public);

        self.pre_check(ctx, |h, c| h.pre_options(c))?;
        self.send_message_inner(ctx.session.as_ref(), ctx.response.clone().into(), false);
        self.notify(|h| h.options_request(ctx));
        Ok(())
    }

    pub(super) fn handle_describe(&self, ctx: &mut RequestContext) -> Handled {
        let Some(uri) = ctx.uri.clone() else {
            return Err(StatusCode::BAD_REQUEST.into());
        };
        self.pre_check(ctx, |h, c| h.pre_describe(c))?;

        let path = self.make_path(&uri);
        let (media, _) = self.find_media(ctx, &path)?;
        if !media.transport_mode().play {
            tracing::warn!(path = %path, "media cannot be played");
            return Err(StatusCode::METHOD_NOT_ALLOWED.into());
        }

        let Some(sdp) = self.create_sdp(&media) else {
            tracing::error!(path = %path, "could not create SDP");
            return Err(StatusCode::INTERNAL_SERVER_ERROR.into());
        };
        media.suspend();

        let mut base = uri.clone();
        base.abspath = path.split_once('?').map_or(path.as_str(), |(p, _)| p).to_string();
        base.query = None;
        let mut content_base = base.request_uri();
        if !content_base.ends_with('/') {
            content_base.push('/');
        }

        ctx.init_response(StatusCode::OK);
        ctx.response.headers.add("Content-Type", "application/sdp");
        ctx.response.headers.add("Content-Base", content_base);
        ctx.response.body = sdp.to_string().into_bytes();

        self.send_message_inner(ctx.session.as_ref(), ctx.response.clone().into(), false);
        self.notify(|h| h.describe_request(ctx));
        Ok(())
    }

    fn create_sdp(&self, media: &Arc<Media>) -> Option<Sdp> {
        let (server_ip, is_ipv6) = {
            let state = self.state.lock();
            (state.server_ip.clone()?, state.is_ipv6)
        };
        let family = if is_ipv6 { "IP6" } else { "IP4" };
        let mut sdp = Sdp {
            origin: format!("- {} 1 IN {family} {server_ip}", rand::rng().random::<u64>()),
            session_name: "Session streamed with rtsp-rs".to_string(),
            information: Some("rtsp-server".to_string()),
            times: vec!["0 0".to_string()],
            ..Sdp::default()
        };
        sdp.add_attribute("tool", Some("rtsp-rs"));
        sdp.add_attribute("type", Some("broadcast"));
        sdp.add_attribute("control", Some("*"));

        let info = SdpInfo { is_ipv6, server_ip };
        media.setup_sdp(&mut sdp, &info).then_some(sdp)
    }

    /// The media for `path`, constructed through the matching factory or
    /// taken from the cache of the previous DESCRIBE. Returns the media and
    /// the length of the matched mount path.
    pub(super) fn find_media(
        &self,
        ctx: &mut RequestContext,
        path: &str,
    ) -> Result<(Arc<Media>, usize), Reject> {
        let Some((factory, matched)) = self.mounts.match_path(path) else {
            tracing::warn!(path = %path, "no factory for path");
            return Err(StatusCode::NOT_FOUND.into());
        };
        ctx.factory = Some(factory.clone());

        self.check_auth(ctx, AuthCheck::MediaFactoryAccess)?;
        self.check_auth(ctx, AuthCheck::MediaFactoryConstruct)?;

        let prefix = &path[..matched];
        let cached = {
            let state = self.state.lock();
            match (&state.cached_path, &state.cached_media) {
                (Some(p), Some(m)) if p == prefix => Some(m.clone()),
                _ => None,
            }
        };

        let media = match cached {
            Some(media) => {
                tracing::debug!(path = prefix, "reusing cached media");
                media
            }
            None => {
                self.clean_cached_media(true);

                let Some(mut url) = ctx.uri.clone() else {
                    return Err(StatusCode::BAD_REQUEST.into());
                };
                url.abspath = prefix.to_string();
                let Some(media) = factory.construct(&url) else {
                    tracing::warn!(path = prefix, "factory could not construct media");
                    return Err(StatusCode::BAD_REQUEST.into());
                };

                if !media.transport_mode().record {
                    let Some(thread) = self.thread_pool.get_thread() else {
                        return Err(StatusCode::SERVICE_UNAVAILABLE.into());
                    };
                    if !media.prepare(thread) {
                        tracing::warn!(path = prefix, "could not prepare media");
                        return Err(StatusCode::SERVICE_UNAVAILABLE.into());
                    }
                }

                let mut state = self.state.lock();
                state.cached_path = Some(prefix.to_string());
                state.cached_media = Some(media.clone());
                media
            }
        };

        ctx.media = Some(media.clone());
        Ok((media, matched))
    }

    /// Resolve a request that must address a whole session media.
    pub(super) fn aggregate_media(
        &self,
        ctx: &mut RequestContext,
    ) -> Result<(Arc<Session>, Arc<SessionMedia>, String), Reject> {
        let Some(session) = ctx.session.clone() else {
            tracing::warn!(method = %ctx.method, "no session");
            return Err(StatusCode::SESSION_NOT_FOUND.into());
        };
        let Some(uri) = ctx.uri.clone() else {
            return Err(StatusCode::BAD_REQUEST.into());
        };
        let path = self.make_path(&uri);
        let Some((sm, matched)) = session.get_media(&path) else {
            tracing::warn!(path = %path, "session has no media for path");
            return Err(StatusCode::NOT_FOUND.into());
        };
        if matched != path.len() {
            tracing::warn!(path = %path, "operation only allowed on the aggregate url");
            return Err(StatusCode::ONLY_AGGREGATE_OPERATION_ALLOWED.into());
        }
        ctx.session_media = Some(sm.clone());
        ctx.media = Some(sm.media().clone());
        Ok((session, sm, path))
    }

    pub(super) fn handle_pause(&self, ctx: &mut RequestContext) -> Handled {
        let (session, sm, _) = self.aggregate_media(ctx)?;
        let media = sm.media().clone();
        let _guard = media.lock();

        if media
            .streams()
            .iter()
            .any(|s| s.publish_clock_mode() == PublishClockMode::ClockAndOffset)
        {
            tracing::warn!("cannot pause media publishing a clock offset");
            return Err(StatusCode::BAD_REQUEST.into());
        }

        self.pre_check(ctx, |h, c| h.pre_pause(c))?;

        if !matches!(sm.rtsp_state(), RtspState::Playing | RtspState::Recording) {
            tracing::warn!(state = ?sm.rtsp_state(), "PAUSE in wrong state");
            return Err(StatusCode::METHOD_NOT_VALID_IN_THIS_STATE.into());
        }

        sm.set_state(MediaTarget::Paused);
        ctx.init_response(StatusCode::OK);
        self.send_message_inner(Some(&session), ctx.response.clone().into(), false);
        sm.set_rtsp_state(RtspState::Ready);
        self.notify(|h| h.pause_request(ctx));
        Ok(())
    }

    pub(super) fn handle_teardown(&self, ctx: &mut RequestContext) -> Handled {
        let (session, sm, _) = self.aggregate_media(ctx)?;
        let media = sm.media().clone();
        let guard = media.lock();

        self.pre_check(ctx, |h, c| h.pre_teardown(c))?;

        let transports = sm.transports();
        self.notify(|h| h.teardown_request(ctx));
        sm.set_state(MediaTarget::Null);
        let keep_session = session.release_media(&sm);
        drop(guard);

        ctx.init_response(StatusCode::OK);
        self.send_message_inner(Some(&session), ctx.response.clone().into(), true);

        if !keep_session {
            self.pool.remove(&session);
        }

        let mut channels = Vec::new();
        {
            let mut state = self.state.lock();
            for t in transports.iter().filter(|t| t.is_interleaved()) {
                let interleaved = t.transport().interleaved;
                for ch in [interleaved.min, interleaved.max] {
                    if let Ok(ch) = u8::try_from(ch) {
                        state.transports.remove(&ch);
                        channels.push(ch);
                    }
                }
            }
        }
        for ch in channels {
            self.remove_data_seq(ch);
        }
        Ok(())
    }

    pub(super) fn handle_get_parameter(&self, ctx: &mut RequestContext) -> Handled {
        self.pre_check(ctx, |h, c| h.pre_get_parameter(c))?;

        if is_empty_body(&ctx.request.body) {
            if ctx.version == Version::V2_0 {
                tracing::warn!("GET_PARAMETER without body in RTSP 2.0");
                return Err(StatusCode::BAD_REQUEST.into());
            }
            // keep-alive
            self.send_generic_response(ctx, StatusCode::OK);
        } else {
            let response = self
                .hooks
                .iter()
                .find_map(|h| h.params_get(ctx))
                .unwrap_or_else(|| RtspResponse::for_request(StatusCode::PARAMETER_NOT_UNDERSTOOD, &ctx.request));
            ctx.response = response;
            self.send_message_inner(ctx.session.as_ref(), ctx.response.clone().into(), false);
        }

        self.notify(|h| h.get_parameter_request(ctx));
        Ok(())
    }

    pub(super) fn handle_set_parameter(&self, ctx: &mut RequestContext) -> Handled {
        self.pre_check(ctx, |h, c| h.pre_set_parameter(c))?;

        if is_empty_body(&ctx.request.body) {
            self.send_generic_response(ctx, StatusCode::OK);
        } else {
            let response = self
                .hooks
                .iter()
                .find_map(|h| h.params_set(ctx))
                .unwrap_or_else(|| RtspResponse::for_request(StatusCode::PARAMETER_NOT_UNDERSTOOD, &ctx.request));
            ctx.response = response;
            self.send_message_inner(ctx.session.as_ref(), ctx.response.clone().into(), false);
        }

        self.notify(|h| h.set_parameter_request(ctx));
        Ok(())
    }
}

fn is_empty_body(body: &[u8]) -> bool {
    body.first().is_none_or(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nul_body_counts_as_empty() {
        assert!(is_empty_body(b""));
        assert!(is_empty_body(b"\0"));
        assert!(!is_empty_body(b"position\r\n"));
    }
}

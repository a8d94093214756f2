use rtsp_types::headers::SeekStyle;

use crate::client::context::{Handled, Reject};
use crate::client::{Client, RequestContext};
use crate::media::{MediaTarget, PlayMode, SeekFlags};
use crate::protocol::{RangeUnit, StatusCode, TimeRange};
use crate::session::RtspState;

impl Client {
    pub(super) fn handle_play(&self, ctx: &mut RequestContext) -> Handled {
        let (session, sm, _) = self.aggregate_media(ctx)?;
        let media = sm.media().clone();
        let _guard = media.lock();

        self.pre_check(ctx, |h, c| h.pre_play(c))?;

        if !media.transport_mode().play {
            tracing::warn!("media does not support PLAY");
            return Err(StatusCode::METHOD_NOT_ALLOWED.into());
        }
        if !matches!(sm.rtsp_state(), RtspState::Playing | RtspState::Ready) {
            tracing::warn!(state = ?sm.rtsp_state(), "PLAY in wrong state");
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

        let seek_style = self.setup_play_mode(ctx)?;

        let rtp_info = if media.has_completed_sender() {
            match sm.rtp_info() {
                Some(info) => Some(info),
                None => {
                    tracing::error!("no RTP-Info for completed media");
                    return Err(StatusCode::INTERNAL_SERVER_ERROR.into());
                }
            }
        } else {
            None
        };

        ctx.init_response(StatusCode::OK);
        if let Some(info) = rtp_info {
            ctx.response.headers.add("RTP-Info", info);
        }
        if let Some(style) = seek_style {
            ctx.response.headers.add("Seek-Style", style);
        }
        if let Some(range) = media.range_string(true, RangeUnit::Npt) {
            ctx.response.headers.add("Range", range);
        }

        if media.has_completed_sender() {
            let Some((rate, applied_rate)) = media.rates() else {
                tracing::error!("no rates for playing media");
                return Err(StatusCode::INTERNAL_SERVER_ERROR.into());
            };
            if ctx.request.get_header("Scale").is_some() || applied_rate != 1.0 {
                ctx.response.headers.add("Scale", format!("{applied_rate:.3}"));
            }
            if ctx.request.get_header("Speed").is_some() || rate != 1.0 {
                ctx.response.headers.add("Speed", format!("{rate:.3}"));
            }
        }

        let mut code = StatusCode::OK;
        for h in &self.hooks {
            code = h.adjust_play_response(ctx);
            if code != StatusCode::OK {
                break;
            }
        }
        if code != StatusCode::OK {
            tracing::debug!(status = code.as_u16(), "play response rejected by hook");
            return Err(code.into());
        }

        self.send_message_inner(Some(&session), ctx.response.clone().into(), false);
        sm.set_state(MediaTarget::Playing);
        sm.set_rtsp_state(RtspState::Playing);
        self.notify(|h| h.play_request(ctx));
        Ok(())
    }

    /// Seek the media as the `Range`, `Seek-Style`, `Scale` and `Speed`
    /// headers ask. Returns the `Seek-Style` to echo.
    fn setup_play_mode(&self, ctx: &RequestContext) -> Result<Option<String>, Reject> {
        let mut mode = PlayMode::default();

        if let Some(value) = ctx.request.get_header("Range") {
            match TimeRange::parse(value) {
                Ok(range) => mode.range = Some(range),
                Err(e) => {
                    tracing::warn!(range = value, error = %e, "invalid Range");
                    return Err(StatusCode::BAD_REQUEST.into());
                }
            }
        }

        let seek_style = ctx.request.get_header("Seek-Style").map(str::to_string);
        match seek_style.as_deref() {
            Some(style) => match seek_style_flags(style) {
                Some(flags) => mode.flags |= flags,
                None => tracing::debug!(style, "unknown Seek-Style"),
            },
            None => {
                mode.flags |= match &mode.range {
                    Some(r) if !r.is_open_start() && !r.is_open_end() => SeekFlags::KEY_UNIT,
                    _ => SeekFlags::ACCURATE,
                };
            }
        }

        if let Some(value) = ctx.request.get_header("Scale") {
            let scale = match value.trim().parse::<f64>() {
                Ok(scale) if scale != 0.0 => scale,
                _ => {
                    tracing::warn!(scale = value, "invalid Scale");
                    return Err(StatusCode::BAD_REQUEST.into());
                }
            };
            mode.rate *= scale;
            if scale.abs() != 1.0 {
                mode.flags |= SeekFlags::TRICKMODE;
            }
        }

        if let Some(value) = ctx.request.get_header("Speed") {
            let speed = match value.trim().parse::<f64>() {
                Ok(speed) if speed > 0.0 => speed,
                _ => {
                    tracing::warn!(speed = value, "invalid Speed");
                    return Err(StatusCode::BAD_REQUEST.into());
                }
            };
            mode.rate *= speed;
        }

        for h in &self.hooks {
            let code = h.adjust_play_mode(ctx, &mut mode);
            if code != StatusCode::OK {
                tracing::debug!(status = code.as_u16(), "play mode rejected by hook");
                return Err(code.into());
            }
        }

        let Some(media) = &ctx.media else {
            return Err(StatusCode::INTERNAL_SERVER_ERROR.into());
        };
        media.set_rate_control(mode.rate_control);
        if !media.seek(mode.range.as_ref(), mode.flags, mode.rate, mode.trickmode_interval) {
            tracing::warn!(rate = mode.rate, "seek failed");
            return Err(StatusCode::SERVICE_UNAVAILABLE.into());
        }
        Ok(seek_style)
    }
}

fn seek_style_flags(style: &str) -> Option<SeekFlags> {
    match style.trim().parse::<SeekStyle>().ok()? {
        SeekStyle::Rap => Some(SeekFlags::ACCURATE),
        SeekStyle::CoRap => Some(SeekFlags::KEY_UNIT),
        SeekStyle::FirstPrior => Some(SeekFlags::KEY_UNIT | SeekFlags::SNAP_BEFORE),
        SeekStyle::Next => Some(SeekFlags::KEY_UNIT | SeekFlags::SNAP_AFTER),
        SeekStyle::Extension(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_styles_map_to_flags() {
        assert_eq!(seek_style_flags("RAP"), Some(SeekFlags::ACCURATE));
        let prior = seek_style_flags("First-Prior").unwrap();
        assert!(prior.contains(SeekFlags::KEY_UNIT) && prior.contains(SeekFlags::SNAP_BEFORE));
        assert_eq!(seek_style_flags(" Next "), Some(SeekFlags::KEY_UNIT | SeekFlags::SNAP_AFTER));
        assert_eq!(seek_style_flags("Whatever"), None);
        assert_eq!(SeekFlags::default(), SeekFlags::empty());
    }
}

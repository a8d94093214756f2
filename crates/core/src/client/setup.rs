use std::sync::Arc;

use crate::auth::AuthCheck;
use crate::client::context::{Handled, Reject};
use crate::client::{Client, RequestContext};
use crate::media::{Media, Seekable, Stream};
use crate::protocol::{LowerTransport, PortRange, RangeUnit, StatusCode, Transport, Version};
use crate::session::{RtspState, Session, SessionMedia, StreamTransport};

/// What a SETUP request resolved to before its transport is negotiated.
struct SetupTarget<'a> {
    session: &'a Arc<Session>,
    media: &'a Arc<Media>,
    stream: &'a Arc<Stream>,
    /// Session media path, without the stream control part.
    path: &'a str,
    /// Set when the session already manages the media.
    sessmedia: Option<Arc<SessionMedia>>,
}

impl Client {
    pub(super) fn handle_setup(&self, ctx: &mut RequestContext) -> Handled {
        let Some(uri) = ctx.uri.clone() else {
            return Err(StatusCode::BAD_REQUEST.into());
        };
        let path = self.make_path(&uri);

        let Some(transport_header) = ctx.request.get_header("Transport").map(str::to_string) else {
            tracing::warn!("SETUP without Transport header");
            return Err(StatusCode::UNSUPPORTED_TRANSPORT.into());
        };
        let pipelined_id = if ctx.version == Version::V2_0 {
            ctx.request.get_header("Pipelined-Requests").map(str::to_string)
        } else {
            None
        };

        let existing = match &ctx.session {
            Some(session) => session.get_media(&path),
            None => None,
        };
        let (media, matched, sessmedia) = match existing {
            Some((sm, matched)) => (sm.media().clone(), matched, Some(sm)),
            None => {
                let (media, matched) = self.find_media(ctx, &path)?;
                media.suspend();
                (media, matched, None)
            }
        };
        let _guard = media.lock();

        let (stream, newpath) = if matched == path.len() {
            if media.n_streams() != 1 {
                tracing::warn!(path = %path, "aggregate SETUP on media with several streams");
                return Err(StatusCode::NOT_FOUND.into());
            }
            match media.stream(0) {
                Some(stream) => (stream, path.clone()),
                None => return Err(StatusCode::NOT_FOUND.into()),
            }
        } else {
            let control = if matched == 1 && path.starts_with('/') {
                path.get(1..)
            } else {
                path.get(matched + 1..)
            };
            let Some(stream) = control.and_then(|c| media.find_stream(c)) else {
                tracing::warn!(path = %path, "no stream for control path");
                return Err(StatusCode::NOT_FOUND.into());
            };
            (stream, path[..matched].to_string())
        };

        ctx.stream = Some(stream.clone());
        ctx.media = Some(media.clone());
        self.pre_check(ctx, |h, c| h.pre_setup(c))?;

        let session = match ctx.session.clone() {
            Some(session) => session,
            None => {
                let session = match self.pool.create() {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::warn!(error = %e, "could not create session");
                        return Err(StatusCode::SERVICE_UNAVAILABLE.into());
                    }
                };
                self.state.lock().pipelined.clear();
                self.watch_session(&session);
                ctx.created_session = true;
                ctx.session = Some(session.clone());
                self.notify(|h| h.new_session(&session));
                session
            }
        };

        {
            let mut state = self.state.lock();
            if let Some(id) = &pipelined_id {
                state.pipelined.insert(id.clone(), session.id().to_string());
            }
            state.had_session = true;
            state.ctrl_timer = None;
        }

        let created_media = sessmedia.is_none();
        let target = SetupTarget {
            session: &session,
            media: &media,
            stream: &stream,
            path: &newpath,
            sessmedia,
        };
        let result = self.setup_stream(ctx, target, &transport_header);
        if result.is_err() && created_media && !ctx.created_session {
            if let Some(sm) = ctx.session_media.take() {
                session.release_media(&sm);
            }
        }
        result?;

        self.notify(|h| h.setup_request(ctx));
        Ok(())
    }

    fn setup_stream(&self, ctx: &mut RequestContext, target: SetupTarget<'_>, transport_header: &str) -> Handled {
        let SetupTarget {
            session,
            media,
            stream,
            path,
            sessmedia,
        } = target;
        self.configure_client_media(ctx, media, stream)?;

        let Some(mut transport) = parse_transport(transport_header, stream) else {
            tracing::warn!(transport = transport_header, "no supported transport");
            return Err(StatusCode::UNSUPPORTED_TRANSPORT.into());
        };
        let mode = media.transport_mode();
        if (transport.mode_play && !mode.play) || (transport.mode_record && !mode.record) {
            tracing::warn!("transport mode not supported by media");
            return Err(StatusCode::UNSUPPORTED_TRANSPORT.into());
        }

        if let Some(keymgmt) = ctx.request.get_header("KeyMgmt") {
            if !stream.handle_keymgmt(keymgmt) {
                tracing::warn!("invalid KeyMgmt");
                return Err(StatusCode::KEY_MANAGEMENT_FAILURE.into());
            }
        }

        if let Some(accept) = ctx.request.get_header("Accept-Ranges") {
            let supported = accept
                .split(',')
                .map(str::trim)
                .any(|unit| RangeUnit::from_token(unit).is_some());
            if !supported {
                tracing::warn!(accept_ranges = accept, "no supported range unit");
                return Err(StatusCode::NOT_IMPLEMENTED.into());
            }
        }

        let sm = match sessmedia {
            Some(sm) => sm,
            None => {
                let sm = session.manage_media(path, media.clone());
                // the session owns the prepared media now
                self.clean_cached_media(false);
                sm
            }
        };
        ctx.session_media = Some(sm.clone());

        if !self.configure_client_transport(ctx, &sm, stream, &mut transport) {
            tracing::warn!("could not configure transport");
            return Err(StatusCode::UNSUPPORTED_TRANSPORT.into());
        }

        let st = sm.set_transport(stream, transport.clone());
        ctx.transport = Some(st.clone());
        st.set_url(ctx.uri.clone());
        let weak_session = Arc::downgrade(session);
        st.set_keepalive(Box::new(move || {
            if let Some(session) = weak_session.upgrade() {
                session.touch();
            }
        }));

        if transport.lower_transport == LowerTransport::Tcp {
            self.install_interleaved(&st, transport.interleaved);
        }

        let server_transport = self.make_server_transport(media, stream, &transport);
        ctx.init_response(StatusCode::OK);
        ctx.response.headers.add("Transport", server_transport.as_text());
        if let Some(id) = ctx.request.get_header("Pipelined-Requests").map(str::to_string) {
            ctx.response.headers.add("Pipelined-Requests", id);
        }
        if ctx.version == Version::V2_0 {
            ctx.response
                .headers
                .add("Media-Properties", media_properties(media.seekable()));
        }

        self.send_message_inner(Some(session), ctx.response.clone().into(), false);

        if sm.rtsp_state() == RtspState::Init {
            sm.set_rtsp_state(RtspState::Ready);
        }
        Ok(())
    }

    /// Apply the `Blocksize` header to the stream.
    fn configure_client_media(&self, ctx: &RequestContext, media: &Arc<Media>, stream: &Arc<Stream>) -> Handled {
        if !stream.is_sender() {
            return Ok(());
        }
        let Some(value) = ctx.request.get_header("Blocksize") else {
            return Ok(());
        };
        let Ok(blocksize) = value.trim().parse::<u64>() else {
            tracing::warn!(blocksize = value, "invalid Blocksize");
            return Err(StatusCode::BAD_REQUEST.into());
        };
        if media.is_shared() {
            tracing::debug!("ignoring Blocksize on shared media");
        } else {
            stream.set_mtu(u32::try_from(blocksize).unwrap_or(u32::MAX));
        }
        Ok(())
    }

    /// Fill in the addresses and channels of `ct` the server decides.
    fn configure_client_transport(
        &self,
        ctx: &RequestContext,
        sm: &Arc<SessionMedia>,
        stream: &Arc<Stream>,
        ct: &mut Transport,
    ) -> bool {
        let (connection, is_ipv6) = {
            let state = self.state.lock();
            (state.connection.clone(), state.is_ipv6)
        };
        let Some(connection) = connection else {
            return false;
        };

        if matches!(ct.lower_transport, LowerTransport::Udp | LowerTransport::UdpMcast)
            && !stream.allocate_udp_sockets(is_ipv6)
        {
            tracing::warn!(stream = stream.index(), "could not allocate UDP sockets");
            return false;
        }

        match ct.lower_transport {
            LowerTransport::UdpMcast => {
                let use_client_settings = ct.destination.is_some()
                    && self
                        .auth
                        .as_ref()
                        .is_none_or(|auth| auth.check(ctx, AuthCheck::TransportClientSettings).is_ok());

                if use_client_settings {
                    if !ct.port.is_set() {
                        tracing::warn!("multicast client settings without port");
                        return false;
                    }
                    if ct.ttl > 0 && !stream.verify_mcast_ttl(ct.ttl) {
                        tracing::warn!(ttl = ct.ttl, "multicast ttl out of range");
                        return false;
                    }
                } else {
                    let Some(mcast) = stream.multicast_address() else {
                        tracing::warn!(stream = stream.index(), "no multicast address");
                        return false;
                    };
                    ct.destination = Some(mcast.address);
                    ct.port = mcast.port;
                    ct.ttl = mcast.ttl;
                }

                let Some(dest) = ct.destination.clone() else {
                    return false;
                };
                if !stream.add_multicast_client_address(&dest, ct.port) {
                    tracing::warn!(destination = %dest, "could not join multicast group");
                    return false;
                }
            }
            LowerTransport::Udp => {
                ct.destination = Some(connection.peer_ip());
            }
            LowerTransport::Tcp => {
                ct.destination = Some(connection.peer_ip());
                let peer_port = i32::from(connection.peer_port());
                let local_port = i32::from(connection.local_port());
                ct.client_port = PortRange::new(peer_port, peer_port);
                ct.server_port = PortRange::new(local_port, local_port);

                if !ct.interleaved.is_set() {
                    ct.interleaved = sm.alloc_channels();
                }
                let state = self.state.lock();
                let in_use = |range: &PortRange| {
                    [range.min, range.max].iter().any(|ch| {
                        u8::try_from(*ch).is_ok_and(|ch| state.transports.contains_key(&ch))
                    })
                };
                while in_use(&ct.interleaved) {
                    ct.interleaved = sm.alloc_channels();
                    if ct.interleaved.max > 255 {
                        tracing::warn!("no free interleaved channels");
                        return false;
                    }
                }
                if !(0..=255).contains(&ct.interleaved.min) || !(0..=255).contains(&ct.interleaved.max) {
                    tracing::warn!(interleaved = %ct.interleaved, "invalid interleaved channels");
                    return false;
                }
            }
        }
        true
    }

    /// Route the interleaved channels of `st` through this connection.
    fn install_interleaved(&self, st: &Arc<StreamTransport>, channels: PortRange) {
        let send = |this: std::sync::Weak<Client>| -> crate::session::transport::SendDataFn {
            Box::new(move |data: &[u8], channel: u8| {
                this.upgrade().is_some_and(|client| client.do_send_data(data, channel))
            })
        };
        st.set_callbacks(send(self.this.clone()), send(self.this.clone()));
        let this = self.this.clone();
        st.set_back_pressure_callback(Box::new(move |channel| {
            this.upgrade().is_some_and(|client| client.check_back_pressure(channel))
        }));

        let mut added = Vec::new();
        {
            let mut state = self.state.lock();
            for ch in [channels.min, channels.max] {
                if let Ok(ch) = u8::try_from(ch) {
                    state.transports.insert(ch, Arc::downgrade(st));
                    added.push(ch);
                }
            }
        }
        for ch in added {
            self.add_data_seq(ch);
        }
    }

    fn make_server_transport(&self, media: &Arc<Media>, stream: &Arc<Stream>, ct: &Transport) -> Transport {
        let is_ipv6 = self.state.lock().is_ipv6;
        let mut st = Transport {
            profile: ct.profile,
            lower_transport: ct.lower_transport,
            mode_play: ct.mode_play,
            mode_record: ct.mode_record,
            ..Transport::default()
        };

        match ct.lower_transport {
            LowerTransport::Udp => {
                st.client_port = ct.client_port;
                st.server_port = stream.server_port(is_ipv6);
            }
            LowerTransport::UdpMcast => {
                st.port = ct.port;
                st.destination = ct.destination.clone();
                st.ttl = ct.ttl;
            }
            LowerTransport::Tcp => {
                st.interleaved = ct.interleaved;
                st.client_port = ct.client_port;
                st.server_port = ct.server_port;
            }
        }

        if media.transport_mode().play {
            st.ssrc = Some(stream.ssrc());
        }
        st
    }
}

/// The first transport of a comma separated `Transport` header that parses
/// and that `stream` supports.
fn parse_transport(header: &str, stream: &Stream) -> Option<Transport> {
    header
        .split(',')
        .map(str::trim)
        .filter(|spec| !spec.is_empty())
        .filter_map(|spec| match Transport::parse(spec) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::debug!(transport = spec, error = %e, "skipping transport");
                None
            }
        })
        .find(|t| stream.is_transport_supported(t))
}

fn media_properties(seekable: Seekable) -> String {
    match seekable {
        Seekable::No => "No-Seeking,Time-Progressing,Time-Duration=0.0".to_string(),
        Seekable::BeginningOnly => "Beginning-Only".to_string(),
        Seekable::RandomAccess => "Random-Access".to_string(),
        Seekable::UpTo(limit) => format!("Random-Access={limit:.6}, Unlimited, Immutable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StreamConfig;

    #[test]
    fn first_supported_transport_wins() {
        let stream = Stream::new(0, StreamConfig::h264(96));
        let t = parse_transport(
            "RAW/RAW/UDP;unicast, RTP/AVP/TCP;unicast;interleaved=4-5, RTP/AVP;unicast;client_port=9000-9001",
            &stream,
        )
        .unwrap();
        assert_eq!(t.lower_transport, LowerTransport::Tcp);
        assert_eq!(t.interleaved, PortRange::new(4, 5));
    }

    #[test]
    fn media_properties_follow_seekability() {
        assert_eq!(media_properties(Seekable::RandomAccess), "Random-Access");
        assert_eq!(
            media_properties(Seekable::UpTo(12.5)),
            "Random-Access=12.500000, Unlimited, Immutable"
        );
    }
}

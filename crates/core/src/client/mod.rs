//! Per-connection RTSP request handling.
//!
//! A [`Client`] is created for every accepted control connection. The
//! connection layer frames incoming bytes into [`RtspMessage`]s and hands
//! them to [`Client::handle_message`]; the client resolves the session,
//! media and stream each request addresses, runs the method handler and
//! answers with exactly one response through the installed send function.
//!
//! ## Session watching
//!
//! A client watches every session it created or saw in a request. While it
//! watches at least one session it is subscribed to the pool's removal
//! notifications, which keep it alive. When the last watched session goes
//! away the post-session timeout decides whether the connection closes.
//!
//! ## Locking
//!
//! Locks are taken in the order watch, send, state, tunnel registry, and
//! never the other way around. Hooks and pool notifications run without
//! the state lock held.

mod context;
mod handlers;
mod hooks;
mod play;
mod record;
mod send;
mod setup;
mod tunnel;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::auth::{Auth, AuthCheck};
use crate::connection::{Connection, Watch};
use crate::error::{Result, RtspError};
use crate::media::{Media, MediaTarget};
use crate::mount::MountPoints;
use crate::protocol::{
    LowerTransport, Method, RtspMessage, RtspRequest, RtspResponse, RtspUrl, StatusCode, Version,
};
use crate::session::{FilterResult, Session, SessionMedia, SessionPool, StreamTransport};
use crate::thread_pool::ThreadPool;
use crate::tunnel::TunnelRegistry;

pub use context::RequestContext;
pub use hooks::ClientHooks;
pub use send::{SendFunc, SendMessagesFunc};

use context::{Handled, Reject};
use send::SendState;

/// Control-timer ticks (seconds) a connection may stay idle before it is
/// closed.
pub const RTSP_CTRL_TIMEOUT_TICKS: u32 = 60;

/// Per-client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seconds the connection stays open after its last session is gone:
    /// 0 closes at once, a negative value keeps it open.
    pub post_session_timeout: i32,
    /// On close, stop TCP and stop-on-disconnect media of the watched
    /// sessions. When false that happens as soon as a session is unwatched.
    pub drop_backlog: bool,
    /// Largest request body accepted by the connection.
    pub content_length_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            post_session_timeout: -1,
            drop_backlog: true,
            content_length_limit: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TunnelState {
    #[default]
    Unknown,
    Get,
    Post,
}

struct ClientState {
    sessions: Vec<Arc<Session>>,
    sessions_cookie: u64,
    session_removed_id: Option<u64>,
    /// Media found for the last DESCRIBE or ANNOUNCE, until a SETUP takes it.
    cached_path: Option<String>,
    cached_media: Option<Arc<Media>>,
    /// Interleaved channel to transport.
    transports: HashMap<u8, Weak<StreamTransport>>,
    tstate: TunnelState,
    /// `Pipelined-Requests` id to session id.
    pipelined: HashMap<String, String>,
    ctrl_timer: Option<u32>,
    had_session: bool,
    server_ip: Option<String>,
    is_ipv6: bool,
    connection: Option<Arc<dyn Connection>>,
    tunnel_owner: Option<Arc<Client>>,
    rtsp_version: Version,
    post_session_timeout: i32,
    drop_backlog: bool,
    content_length_limit: u32,
}

/// The server side of one RTSP control connection.
pub struct Client {
    this: Weak<Client>,
    pool: SessionPool,
    mounts: MountPoints,
    auth: Option<Arc<dyn Auth>>,
    thread_pool: ThreadPool,
    tunnels: TunnelRegistry,
    hooks: Vec<Arc<dyn ClientHooks>>,
    watch: Mutex<Option<Arc<dyn Watch>>>,
    send: Mutex<SendState>,
    state: Mutex<ClientState>,
    close_pending: AtomicBool,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        pool: SessionPool,
        mounts: MountPoints,
        auth: Option<Arc<dyn Auth>>,
        thread_pool: ThreadPool,
        tunnels: TunnelRegistry,
        hooks: Vec<Arc<dyn ClientHooks>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Client {
            this: this.clone(),
            pool,
            mounts,
            auth,
            thread_pool,
            tunnels,
            hooks,
            watch: Mutex::new(None),
            send: Mutex::new(SendState::default()),
            state: Mutex::new(ClientState {
                sessions: Vec::new(),
                sessions_cookie: 0,
                session_removed_id: None,
                cached_path: None,
                cached_media: None,
                transports: HashMap::new(),
                tstate: TunnelState::Unknown,
                pipelined: HashMap::new(),
                ctrl_timer: None,
                had_session: false,
                server_ip: None,
                is_ipv6: false,
                connection: None,
                tunnel_owner: None,
                rtsp_version: Version::V1_0,
                post_session_timeout: config.post_session_timeout,
                drop_backlog: config.drop_backlog,
                content_length_limit: config.content_length_limit,
            }),
            close_pending: AtomicBool::new(false),
        })
    }

    pub fn session_pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn mount_points(&self) -> &MountPoints {
        &self.mounts
    }

    pub fn post_session_timeout(&self) -> i32 {
        self.state.lock().post_session_timeout
    }

    pub fn set_post_session_timeout(&self, secs: i32) {
        self.state.lock().post_session_timeout = secs;
    }

    pub fn drop_backlog(&self) -> bool {
        self.state.lock().drop_backlog
    }

    pub fn set_drop_backlog(&self, drop: bool) {
        self.state.lock().drop_backlog = drop;
    }

    pub fn content_length_limit(&self) -> u32 {
        self.state.lock().content_length_limit
    }

    pub fn set_content_length_limit(&self, limit: u32) {
        let mut state = self.state.lock();
        state.content_length_limit = limit;
        if let Some(conn) = &state.connection {
            conn.set_content_length_limit(limit);
        }
    }

    /// Protocol version of the last OPTIONS request.
    pub fn rtsp_version(&self) -> Version {
        self.state.lock().rtsp_version
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.state.lock().connection.clone()
    }

    /// The local address clients connected to, used for relative URLs and
    /// SDP origins.
    pub fn server_ip(&self) -> Option<String> {
        self.state.lock().server_ip.clone()
    }

    /// Take over `connection`: its local address becomes the server IP.
    pub fn set_connection(&self, connection: Arc<dyn Connection>) {
        let mut state = self.state.lock();
        connection.set_content_length_limit(state.content_length_limit);
        let ip = connection.local_ip();
        state.is_ipv6 = ip.contains(':');
        tracing::debug!(
            server_ip = %ip,
            peer = %connection.peer_ip(),
            peer_port = connection.peer_port(),
            "client connection set"
        );
        state.server_ip = Some(ip);
        state.connection = Some(connection);
    }

    /// Start dispatching through `watch`. Outgoing messages are queued on
    /// it and the control timer starts counting.
    pub fn attach(&self, watch: Arc<dyn Watch>) -> Result<()> {
        let mut slot = self.watch.lock();
        if self.state.lock().connection.is_none() {
            return Err(RtspError::NotConnected);
        }
        let queue = watch.clone();
        self.replace_sender(send::Sender::Batched(Box::new(move |messages, _close| {
            queue.send_messages(messages)
        })));
        *slot = Some(watch);
        self.state.lock().ctrl_timer = Some(0);
        tracing::debug!("client attached");
        Ok(())
    }

    /// One control-timer interval (one second). Closes the client when a
    /// send failed or the idle or post-session timeout expired.
    pub fn tick(&self) {
        if self.close_pending.swap(false, Ordering::SeqCst) {
            tracing::debug!("closing client after failed send");
            self.close();
            return;
        }

        let expired = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(count) = state.ctrl_timer.as_mut() else {
                return;
            };
            *count += 1;
            let count = *count;
            let expired = count > RTSP_CTRL_TIMEOUT_TICKS
                || (state.had_session && i64::from(count) > i64::from(state.post_session_timeout));
            if expired {
                state.ctrl_timer = None;
            }
            expired
        };
        if expired {
            tracing::debug!("control connection timeout expired");
            self.close();
        }
    }

    /// Flush and close the connection and tear the watch down.
    pub fn close(&self) {
        let watch = {
            let mut slot = self.watch.lock();
            if let Some(watch) = slot.as_ref() {
                watch.set_flushing(true);
            }
            let connection = self.state.lock().connection.clone();
            if let Some(conn) = connection {
                if let Some(id) = conn.tunnel_id() {
                    self.tunnels.remove(&id);
                }
                if let Err(e) = conn.flush() {
                    tracing::debug!(error = %e, "flush on close failed");
                }
                conn.close();
            }
            slot.take()
        };
        if let Some(watch) = watch {
            self.destroy_watch(watch);
        }
        self.clean_cached_media(true);
    }

    fn destroy_watch(&self, watch: Arc<dyn Watch>) {
        drop(watch);
        self.replace_sender(send::Sender::None);
        self.state.lock().ctrl_timer = None;
        self.watch_destroyed();
    }

    fn watch_destroyed(&self) {
        let mut closed = true;
        self.session_filter(|session| self.cleanup_session(session, &mut closed));
        tracing::info!(closed, "client watch destroyed");
        if closed {
            self.notify(|h| h.closed());
        }
    }

    fn cleanup_session(&self, session: &Arc<Session>, closed: &mut bool) -> FilterResult {
        if self.drop_backlog() {
            session.filter(|sm| filter_session_media(sm, closed));
        }
        if *closed {
            FilterResult::Remove
        } else {
            FilterResult::Keep
        }
    }

    /// Watch `session`: its removal from the pool is reported to this
    /// client. Watching a session twice has no effect.
    pub fn watch_session(&self, session: &Arc<Session>) {
        let mut state = self.state.lock();
        self.watch_locked(&mut state, session);
    }

    fn watch_locked(&self, state: &mut ClientState, session: &Arc<Session>) {
        if state.sessions.iter().any(|s| Arc::ptr_eq(s, session)) {
            return;
        }
        if state.sessions.is_empty() {
            if let Some(client) = self.this.upgrade() {
                let id = self
                    .pool
                    .subscribe(Arc::new(move |removed: &Arc<Session>| client.session_removed(removed)));
                state.session_removed_id = Some(id);
            }
        }
        tracing::debug!(session_id = %session.id(), "watching session");
        state.sessions.insert(0, session.clone());
        state.sessions_cookie += 1;
    }

    pub fn unwatch_session(&self, session: &Arc<Session>) {
        let mut state = self.state.lock();
        self.unwatch_locked(&mut state, session);
    }

    fn unwatch_locked(&self, state: &mut ClientState, session: &Arc<Session>) {
        let Some(pos) = state.sessions.iter().position(|s| Arc::ptr_eq(s, session)) else {
            return;
        };
        tracing::debug!(session_id = %session.id(), "unwatching session");
        state.sessions.remove(pos);
        state.sessions_cookie += 1;
        if state.sessions.is_empty() {
            if let Some(id) = state.session_removed_id.take() {
                self.pool.unsubscribe(id);
            }
        }
        if !state.drop_backlog {
            let mut closed = true;
            session.filter(|sm| filter_session_media(sm, &mut closed));
        }
    }

    fn session_removed(&self, session: &Arc<Session>) {
        let close = {
            let mut state = self.state.lock();
            self.unwatch_locked(&mut state, session);
            if !state.sessions.is_empty() || state.ctrl_timer.is_some() {
                false
            } else if state.post_session_timeout > 0 {
                tracing::debug!(
                    timeout = state.post_session_timeout,
                    "last session removed, arming post-session timer"
                );
                state.ctrl_timer = Some(0);
                false
            } else {
                state.post_session_timeout == 0
            }
        };
        if close {
            tracing::debug!("last session removed, closing client");
            self.close();
        }
    }

    /// Run `func` over the watched sessions. `Remove` unwatches a session,
    /// `Ref` collects it into the result. `func` runs without the client
    /// lock and sees each session once, even when the list changes meanwhile.
    pub fn session_filter<F>(&self, mut func: F) -> Vec<Arc<Session>>
    where
        F: FnMut(&Arc<Session>) -> FilterResult,
    {
        let mut result = Vec::new();
        let mut visited: Vec<Arc<Session>> = Vec::new();
        let mut state = self.state.lock();
        'restart: loop {
            let mut cookie = state.sessions_cookie;
            let sessions = state.sessions.clone();
            for session in sessions {
                if visited.iter().any(|v| Arc::ptr_eq(v, &session)) {
                    continue;
                }
                visited.push(session.clone());
                let res = MutexGuard::unlocked(&mut state, || func(&session));
                let changed = cookie != state.sessions_cookie;
                match res {
                    FilterResult::Remove => {
                        self.unwatch_locked(&mut state, &session);
                        cookie = state.sessions_cookie;
                    }
                    FilterResult::Ref => result.push(session),
                    FilterResult::Keep => {}
                }
                if changed {
                    continue 'restart;
                }
            }
            break;
        }
        result
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.state.lock().sessions.clone()
    }

    pub fn n_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Process one message received on the connection.
    pub fn handle_message(&self, message: RtspMessage) {
        if let Some(count) = self.state.lock().ctrl_timer.as_mut() {
            *count = 0;
        }
        match message {
            RtspMessage::Request(request) => self.handle_request(request),
            RtspMessage::Response(response) => self.handle_response(response),
            RtspMessage::Data { channel, payload } => self.handle_data(channel, payload),
        }
        if self.close_pending.swap(false, Ordering::SeqCst) {
            self.close();
        }
    }

    fn handle_request(&self, request: RtspRequest) {
        tracing::debug!(method = %request.method, uri = %request.uri, version = %request.version, "request");
        let mut ctx = RequestContext::new(request);
        if let Err(reject) = self.process_request(&mut ctx) {
            let created = if ctx.created_session {
                ctx.session.take()
            } else {
                None
            };
            if let Reject::Status(code) = reject {
                tracing::debug!(method = %ctx.method, status = code.as_u16(), "request failed");
                self.send_generic_response(&mut ctx, code);
            }
            if let Some(session) = created {
                tracing::debug!(session_id = %session.id(), "dropping session of failed request");
                for sm in session.medias() {
                    session.release_media(&sm);
                }
                self.pool.remove(&session);
            }
        }
    }

    fn process_request(&self, ctx: &mut RequestContext) -> Handled {
        if !matches!(ctx.version, Version::V1_0 | Version::V2_0) {
            tracing::warn!(version = %ctx.version, "unsupported protocol version");
            return Err(StatusCode::VERSION_NOT_SUPPORTED.into());
        }

        ctx.uri = self.resolve_uri(&ctx.request.uri)?;

        if let Some(session) = self.resolve_session(ctx)? {
            self.watch_session(&session);
            ctx.session = Some(session);
        }

        self.check_auth(ctx, AuthCheck::Url)?;
        self.check_requirements(ctx)?;

        let method = ctx.method.clone();
        match method {
            Method::Options => {
                self.state.lock().rtsp_version = ctx.version;
                self.handle_options(ctx)
            }
            Method::Describe => self.handle_describe(ctx),
            Method::Setup => self.handle_setup(ctx),
            Method::Play => self.handle_play(ctx),
            Method::Pause => self.handle_pause(ctx),
            Method::Teardown => self.handle_teardown(ctx),
            Method::GetParameter => self.handle_get_parameter(ctx),
            Method::SetParameter => self.handle_set_parameter(ctx),
            Method::Announce | Method::Record if ctx.version.major() >= 2 => {
                tracing::warn!(method = %method, "method not allowed in RTSP 2.0");
                Err(StatusCode::BAD_REQUEST.into())
            }
            Method::Announce => self.handle_announce(ctx),
            Method::Record => self.handle_record(ctx),
            Method::Redirect => {
                tracing::warn!("REDIRECT not implemented");
                Err(StatusCode::NOT_IMPLEMENTED.into())
            }
            Method::Get | Method::Post | Method::Invalid(_) => {
                tracing::warn!(method = %method, "unhandled method");
                Err(StatusCode::BAD_REQUEST.into())
            }
        }
    }

    /// `*` has no URL. A bare absolute path is resolved against the server
    /// IP.
    fn resolve_uri(&self, uri: &str) -> std::result::Result<Option<RtspUrl>, Reject> {
        if uri == "*" {
            return Ok(None);
        }
        if let Ok(url) = RtspUrl::parse(uri) {
            return Ok(Some(url.sanitized()));
        }
        if !uri.starts_with('/') {
            tracing::warn!(uri, "invalid request url");
            return Err(StatusCode::BAD_REQUEST.into());
        }
        let (server_ip, is_ipv6) = {
            let state = self.state.lock();
            (state.server_ip.clone(), state.is_ipv6)
        };
        let Some(ip) = server_ip else {
            tracing::warn!(uri, "relative url without server address");
            return Err(StatusCode::BAD_REQUEST.into());
        };
        let absolute = if is_ipv6 {
            format!("rtsp://[{ip}]{uri}")
        } else {
            format!("rtsp://{ip}{uri}")
        };
        match RtspUrl::parse(&absolute) {
            Ok(url) => Ok(Some(url.sanitized())),
            Err(_) => {
                tracing::warn!(uri = %absolute, "invalid request url");
                Err(StatusCode::BAD_REQUEST.into())
            }
        }
    }

    fn resolve_session(&self, ctx: &RequestContext) -> std::result::Result<Option<Arc<Session>>, Reject> {
        let pipelined = ctx
            .request
            .get_header("Pipelined-Requests")
            .and_then(|id| self.state.lock().pipelined.get(id).cloned());
        let id = match pipelined {
            Some(id) => id,
            None => match ctx.request.get_header("Session") {
                Some(value) => session_id(value).to_string(),
                None => return Ok(None),
            },
        };
        match self.pool.find(&id) {
            Some(session) => Ok(Some(session)),
            None => {
                tracing::warn!(session_id = %id, "session not found");
                Err(StatusCode::SESSION_NOT_FOUND.into())
            }
        }
    }

    fn check_requirements(&self, ctx: &RequestContext) -> Handled {
        let required: Vec<String> = ctx
            .request
            .headers
            .get_all("Require")
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|option| !option.is_empty())
            .map(str::to_string)
            .collect();
        if required.is_empty() {
            return Ok(());
        }

        let unsupported = self
            .hooks
            .iter()
            .find_map(|h| h.check_requirements(ctx, &required))
            .unwrap_or_else(|| required.join(", "));
        if unsupported.is_empty() {
            return Ok(());
        }

        tracing::warn!(unsupported = %unsupported, "unsupported requirements");
        let response = RtspResponse::for_request(StatusCode::OPTION_NOT_SUPPORTED, &ctx.request)
            .add_header("Unsupported", &unsupported);
        self.send_message_inner(None, response.into(), false);
        Err(Reject::Answered)
    }

    fn check_auth(&self, ctx: &RequestContext, check: AuthCheck) -> Handled {
        let Some(auth) = &self.auth else {
            return Ok(());
        };
        match auth.check(ctx, check) {
            Ok(()) => Ok(()),
            Err(response) => {
                tracing::debug!(?check, status = response.status.as_u16(), "auth check failed");
                self.send_message_inner(ctx.session.as_ref(), response.into(), false);
                Err(Reject::Answered)
            }
        }
    }

    /// Send the bare status `code`, after `adjust_error_code`.
    fn send_generic_response(&self, ctx: &mut RequestContext, code: StatusCode) {
        let code = self.hooks.iter().fold(code, |code, h| h.adjust_error_code(ctx, code));
        ctx.init_response(code);
        self.send_message_inner(ctx.session.as_ref(), ctx.response.clone().into(), false);
    }

    /// Run a `pre_*` hook over every registered hook. The first non-2xx
    /// status wins, otherwise the highest 2xx. Anything but 200 rejects.
    fn pre_check<F>(&self, ctx: &RequestContext, hook: F) -> Handled
    where
        F: Fn(&dyn ClientHooks, &RequestContext) -> StatusCode,
    {
        let mut result = StatusCode::OK;
        for h in &self.hooks {
            let code = hook(h.as_ref(), ctx);
            if !code.is_success() {
                result = code;
                break;
            }
            if code.as_u16() > result.as_u16() {
                result = code;
            }
        }
        if result == StatusCode::OK {
            Ok(())
        } else {
            tracing::debug!(method = %ctx.method, status = result.as_u16(), "request vetoed by hook");
            Err(result.into())
        }
    }

    fn notify<F: Fn(&dyn ClientHooks)>(&self, f: F) {
        for h in &self.hooks {
            f(h.as_ref());
        }
    }

    fn make_path(&self, uri: &RtspUrl) -> String {
        self.hooks
            .iter()
            .find_map(|h| h.make_path_from_uri(uri))
            .unwrap_or_else(|| self.mounts.make_path(uri))
    }

    fn handle_response(&self, response: RtspResponse) {
        tracing::debug!(status = response.status.as_u16(), "response from peer");
        let session = match response.get_header("Session") {
            Some(value) => {
                let id = session_id(value);
                match self.pool.find(id) {
                    Some(session) => {
                        self.watch_session(&session);
                        Some(session)
                    }
                    None => {
                        tracing::warn!(session_id = id, "response for unknown session");
                        return;
                    }
                }
            }
            None => None,
        };
        self.notify(|h| h.handle_response(session.as_ref(), &response));
    }

    fn handle_data(&self, channel: u8, payload: Vec<u8>) {
        if payload.is_empty() {
            tracing::debug!(channel, "ignoring empty data message");
            return;
        }
        let transport = self
            .state
            .lock()
            .transports
            .get(&channel)
            .and_then(Weak::upgrade);
        let Some(transport) = transport else {
            tracing::debug!(channel, "data on unknown channel, dropping");
            return;
        };
        transport.remote_addr_or_insert(|| {
            let t = transport.transport();
            t.destination
                .as_ref()
                .map(|dest| format!("{dest}:{}", t.client_port.min))
        });
        if !transport.recv_data(channel, payload) {
            tracing::debug!(channel, "stream refused interleaved data");
        }
    }

    fn transport_for_channel(&self, channel: u8) -> Option<Arc<StreamTransport>> {
        self.state.lock().transports.get(&channel).and_then(Weak::upgrade)
    }

    fn clean_cached_media(&self, unprepare: bool) {
        let media = {
            let mut state = self.state.lock();
            state.cached_path = None;
            state.cached_media.take()
        };
        if let Some(media) = media {
            if unprepare {
                media.unprepare();
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Client")
            .field("server_ip", &state.server_ip)
            .field("sessions", &state.sessions.len())
            .field("transports", &state.transports.len())
            .field("tunnel", &state.tstate)
            .finish()
    }
}

/// The session id of a `Session` header, without its parameters.
fn session_id(header: &str) -> &str {
    header.split_once(';').map_or(header, |(id, _)| id).trim()
}

/// Stop media that cannot outlive the control connection: anything
/// interleaved, or media configured to stop on disconnect. UDP media keep
/// streaming and clear `closed`.
fn filter_session_media(sm: &Arc<SessionMedia>, closed: &mut bool) -> FilterResult {
    let all_udp = sm.transports().iter().all(|t| {
        matches!(
            t.transport().lower_transport,
            LowerTransport::Udp | LowerTransport::UdpMcast
        )
    });
    if !all_udp || sm.media().stop_on_disconnect() {
        sm.set_state(MediaTarget::Null);
        FilterResult::Remove
    } else {
        *closed = false;
        FilterResult::Keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_header_parameters_are_ignored() {
        assert_eq!(session_id("12345678;timeout=60"), "12345678");
        assert_eq!(session_id(" abc "), "abc");
    }

    #[test]
    fn session_filter_visits_each_session_once() {
        let pool = SessionPool::new();
        let client = Client::new(
            ClientConfig::default(),
            pool.clone(),
            MountPoints::new(),
            None,
            ThreadPool::default(),
            TunnelRegistry::new(),
            Vec::new(),
        );
        let a = pool.create().unwrap();
        let b = pool.create().unwrap();
        client.watch_session(&a);
        client.watch_session(&b);

        let mut seen = 0;
        let kept = client.session_filter(|s| {
            seen += 1;
            if Arc::ptr_eq(s, &a) {
                FilterResult::Remove
            } else {
                FilterResult::Ref
            }
        });
        assert_eq!(seen, 2);
        assert_eq!(kept.len(), 1);
        assert!(Arc::ptr_eq(&kept[0], &b));
        assert_eq!(client.n_sessions(), 1);
    }

    #[test]
    fn removing_last_session_arms_post_session_timer() {
        let pool = SessionPool::new();
        let client = Client::new(
            ClientConfig {
                post_session_timeout: 5,
                ..ClientConfig::default()
            },
            pool.clone(),
            MountPoints::new(),
            None,
            ThreadPool::default(),
            TunnelRegistry::new(),
            Vec::new(),
        );
        let session = pool.create().unwrap();
        client.watch_session(&session);
        assert!(pool.remove(&session));
        assert_eq!(client.n_sessions(), 0);
        // post-session timer armed: closes after more than 5 ticks
        assert_eq!(client.state.lock().ctrl_timer, Some(0));
    }
}

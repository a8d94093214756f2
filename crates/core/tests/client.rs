//! Client state machine tests driven through an in-memory connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use rtsp::client::{Client, ClientConfig, ClientHooks, RequestContext};
use rtsp::connection::{Connection, Watch};
use rtsp::media::{MediaFactory, StreamConfig};
use rtsp::protocol::{Method, RtspMessage, RtspRequest, RtspResponse, StatusCode, Version};
use rtsp::session::{RtspState, SessionPool};
use rtsp::{MountPoints, Result, RtspError, ThreadPool, TunnelRegistry};

#[derive(Default)]
struct MockConnection {
    tunnel_id: Mutex<Option<String>>,
    tunnelled: Mutex<Option<Arc<dyn Connection>>>,
    closed: AtomicBool,
}

impl MockConnection {
    fn with_tunnel_id(id: &str) -> Self {
        let conn = MockConnection::default();
        *conn.tunnel_id.lock() = Some(id.to_string());
        conn
    }
}

impl Connection for MockConnection {
    fn tunnel_id(&self) -> Option<String> {
        self.tunnel_id.lock().clone()
    }

    fn local_ip(&self) -> String {
        "127.0.0.1".to_string()
    }

    fn peer_ip(&self) -> String {
        "127.0.0.1".to_string()
    }

    fn peer_port(&self) -> u16 {
        40000
    }

    fn local_port(&self) -> u16 {
        8554
    }

    fn set_content_length_limit(&self, _limit: u32) {}

    fn write(&self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn do_tunnel(&self, other: Arc<dyn Connection>) -> Result<()> {
        *self.tunnelled.lock() = Some(other);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingWatch {
    messages: Mutex<Vec<RtspMessage>>,
    resets: AtomicU32,
}

impl Watch for RecordingWatch {
    fn send_messages(&self, messages: &[RtspMessage]) -> Result<u32> {
        self.messages.lock().extend(messages.iter().cloned());
        Ok(0)
    }

    fn set_flushing(&self, _flushing: bool) {}

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    client: Arc<Client>,
    pool: SessionPool,
    conn: Arc<MockConnection>,
    watch: Arc<RecordingWatch>,
}

fn two_stream_mounts() -> MountPoints {
    let mounts = MountPoints::new();
    mounts.add_factory(
        "/test",
        MediaFactory::new()
            .with_stream(StreamConfig::h264(96))
            .with_stream(StreamConfig::new("audio", "PCMA", 8, 8000)),
    );
    mounts
}

fn fixture_with(config: ClientConfig, mounts: MountPoints, hooks: Vec<Arc<dyn ClientHooks>>) -> Fixture {
    let pool = SessionPool::new();
    let client = Client::new(
        config,
        pool.clone(),
        mounts,
        None,
        ThreadPool::default(),
        TunnelRegistry::new(),
        hooks,
    );
    let conn = Arc::new(MockConnection::default());
    let watch = Arc::new(RecordingWatch::default());
    client.set_connection(conn.clone());
    client.attach(watch.clone()).unwrap();
    Fixture {
        client,
        pool,
        conn,
        watch,
    }
}

fn fixture() -> Fixture {
    fixture_with(ClientConfig::default(), two_stream_mounts(), Vec::new())
}

impl Fixture {
    fn request(&self, method: Method, uri: &str, headers: &[(&str, &str)]) -> RtspResponse {
        let mut req = RtspRequest::new(method, uri).add_header("CSeq", "1");
        for (name, value) in headers {
            req = req.add_header(name, value);
        }
        self.send(req)
    }

    fn send(&self, req: RtspRequest) -> RtspResponse {
        self.client.handle_message(req.into());
        match self.watch.messages.lock().pop() {
            Some(RtspMessage::Response(resp)) => resp,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    fn setup(&self, uri: &str, transport: &str, session: Option<&str>) -> RtspResponse {
        let mut headers = vec![("Transport", transport)];
        if let Some(id) = session {
            headers.push(("Session", id));
        }
        self.request(Method::Setup, uri, &headers)
    }
}

fn session_id(resp: &RtspResponse) -> String {
    let header = resp.get_header("Session").expect("Session header");
    header.split(';').next().unwrap().to_string()
}

const URL: &str = "rtsp://127.0.0.1:8554/test";
const TCP_0_1: &str = "RTP/AVP/TCP;unicast;interleaved=0-1";

#[test]
fn options_lists_methods() {
    let f = fixture();
    let resp = f.request(Method::Options, "*", &[]);
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.get_header("CSeq"), Some("1"));
    assert_eq!(resp.get_header("Server"), Some("rtsp-rs/0.2"));
    let public = resp.get_header("Public").unwrap();
    assert!(public.contains("SETUP") && public.contains("RECORD"));
}

#[test]
fn unsupported_version_is_rejected() {
    let f = fixture();
    let mut req = RtspRequest::new(Method::Options, "*").add_header("CSeq", "3");
    req.version = Version::V1_1;
    let resp = f.send(req);
    assert_eq!(resp.status, StatusCode::VERSION_NOT_SUPPORTED);
}

#[test]
fn unknown_session_is_454() {
    let f = fixture();
    let resp = f.request(Method::Play, URL, &[("Session", "DOESNOTEXIST")]);
    assert_eq!(resp.status, StatusCode::SESSION_NOT_FOUND);
}

#[test]
fn unsupported_requirements_are_listed() {
    let f = fixture();
    let resp = f.request(Method::Options, "*", &[("Require", "foo, bar")]);
    assert_eq!(resp.status, StatusCode::OPTION_NOT_SUPPORTED);
    assert_eq!(resp.get_header("Unsupported"), Some("foo, bar"));
}

#[test]
fn describe_returns_sdp() {
    let f = fixture();
    let resp = f.request(Method::Describe, URL, &[]);
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.get_header("Content-Type"), Some("application/sdp"));
    assert_eq!(resp.get_header("Content-Base"), Some("rtsp://127.0.0.1:8554/test/"));
    let body = String::from_utf8(resp.body).unwrap();
    assert!(body.contains("a=control:*"));
    assert!(body.contains("m=video"));
    assert!(body.contains("m=audio"));
}

#[test]
fn relative_url_resolves_against_server_ip() {
    let f = fixture();
    let resp = f.request(Method::Describe, "/test", &[]);
    assert_eq!(resp.status, StatusCode::OK);
    assert!(resp.get_header("Content-Base").unwrap().starts_with("rtsp://127.0.0.1:"));
}

#[test]
fn describe_of_unknown_mount_is_404() {
    let f = fixture();
    let resp = f.request(Method::Describe, "rtsp://127.0.0.1:8554/nothing", &[]);
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

#[test]
fn setup_play_pause_teardown() {
    let f = fixture();

    let resp = f.setup(&format!("{URL}/stream=0"), TCP_0_1, None);
    assert_eq!(resp.status, StatusCode::OK);
    assert!(resp.get_header("Transport").unwrap().contains("interleaved=0-1"));
    assert!(resp.get_header("Session").unwrap().ends_with(";timeout=60"));
    let id = session_id(&resp);
    assert_eq!(f.client.n_sessions(), 1);

    let session = f.pool.find(&id).unwrap();
    let sm = session.medias()[0].clone();
    assert_eq!(sm.rtsp_state(), RtspState::Ready);

    let resp = f.request(Method::Play, URL, &[("Session", &id)]);
    assert_eq!(resp.status, StatusCode::OK);
    assert!(
        resp.get_header("RTP-Info")
            .unwrap()
            .starts_with("url=rtsp://127.0.0.1:8554/test/stream=0;seq=")
    );
    assert!(resp.get_header("Range").unwrap().starts_with("npt="));
    assert_eq!(sm.rtsp_state(), RtspState::Playing);

    let resp = f.request(Method::Pause, URL, &[("Session", &id)]);
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(sm.rtsp_state(), RtspState::Ready);

    let resp = f.request(Method::Play, URL, &[("Session", &id), ("Scale", "2.0")]);
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(sm.rtsp_state(), RtspState::Playing);

    let resp = f.request(Method::Teardown, URL, &[("Session", &id)]);
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.get_header("Connection"), Some("close"));
    assert_eq!(f.pool.n_sessions(), 0);
    assert_eq!(f.client.n_sessions(), 0);
    assert!(f.conn.closed.load(Ordering::SeqCst));
}

#[test]
fn pause_before_play_is_455() {
    let f = fixture();
    let id = session_id(&f.setup(&format!("{URL}/stream=0"), TCP_0_1, None));
    let resp = f.request(Method::Pause, URL, &[("Session", &id)]);
    assert_eq!(resp.status, StatusCode::METHOD_NOT_VALID_IN_THIS_STATE);
}

#[test]
fn stream_level_teardown_is_459() {
    let f = fixture();
    let id = session_id(&f.setup(&format!("{URL}/stream=0"), TCP_0_1, None));
    let resp = f.request(Method::Teardown, &format!("{URL}/stream=0"), &[("Session", &id)]);
    assert_eq!(resp.status, StatusCode::ONLY_AGGREGATE_OPERATION_ALLOWED);
    assert_eq!(f.pool.n_sessions(), 1);
}

#[test]
fn setup_without_transport_is_461() {
    let f = fixture();
    let resp = f.request(Method::Setup, &format!("{URL}/stream=0"), &[]);
    assert_eq!(resp.status, StatusCode::UNSUPPORTED_TRANSPORT);
}

#[test]
fn failed_setup_drops_the_new_session() {
    let f = fixture();
    let resp = f.setup(&format!("{URL}/stream=0"), TCP_0_1, None);
    let id = session_id(&resp);
    assert_eq!(f.pool.n_sessions(), 1);

    // unknown stream on a fresh session
    let resp = f.setup(&format!("{URL}/stream=7"), TCP_0_1, None);
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
    assert_eq!(f.pool.n_sessions(), 1);

    // unparseable Blocksize after the session was created
    let resp = f.request(
        Method::Setup,
        &format!("{URL}/stream=0"),
        &[("Transport", TCP_0_1), ("Blocksize", "big")],
    );
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(f.pool.n_sessions(), 1);
    assert!(f.pool.find(&id).is_some());
}

#[test]
fn interleaved_channels_stay_disjoint() {
    let f = fixture();
    let id = session_id(&f.setup(&format!("{URL}/stream=0"), TCP_0_1, None));
    let resp = f.setup(&format!("{URL}/stream=1"), TCP_0_1, Some(&id));
    assert_eq!(resp.status, StatusCode::OK);
    assert!(resp.get_header("Transport").unwrap().contains("interleaved=2-3"));
}

#[test]
fn watching_a_session_twice_has_no_effect() {
    let f = fixture();
    let session = f.pool.create().unwrap();
    f.client.watch_session(&session);
    f.client.watch_session(&session);
    assert_eq!(f.client.n_sessions(), 1);
    f.client.unwatch_session(&session);
    assert_eq!(f.client.n_sessions(), 0);
}

#[test]
fn zero_post_session_timeout_closes_with_last_session() {
    let f = fixture_with(
        ClientConfig {
            post_session_timeout: 0,
            ..ClientConfig::default()
        },
        two_stream_mounts(),
        Vec::new(),
    );
    let id = session_id(&f.setup(&format!("{URL}/stream=0"), TCP_0_1, None));
    assert!(!f.conn.closed.load(Ordering::SeqCst));

    let session = f.pool.find(&id).unwrap();
    f.pool.remove(&session);
    assert!(f.conn.closed.load(Ordering::SeqCst));
}

#[test]
fn idle_connection_times_out() {
    let f = fixture();
    for _ in 0..60 {
        f.client.tick();
    }
    assert!(!f.conn.closed.load(Ordering::SeqCst));
    f.client.tick();
    assert!(f.conn.closed.load(Ordering::SeqCst));
}

#[test]
fn parameters_without_handler_are_451() {
    let f = fixture();
    let resp = f.request(Method::GetParameter, URL, &[]);
    assert_eq!(resp.status, StatusCode::OK);

    let req = RtspRequest::new(Method::GetParameter, URL)
        .add_header("CSeq", "2")
        .with_body("position\r\n");
    assert_eq!(f.send(req).status, StatusCode::PARAMETER_NOT_UNDERSTOOD);

    let req = RtspRequest::new(Method::SetParameter, URL)
        .add_header("CSeq", "3")
        .with_body("barparam: barstuff\r\n");
    assert_eq!(f.send(req).status, StatusCode::PARAMETER_NOT_UNDERSTOOD);
}

#[test]
fn interleaved_back_pressure() {
    let f = fixture();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let sink = sent.clone();
    f.client
        .set_send_messages_func(Box::new(move |messages: &[RtspMessage], _close| {
            let data = messages.iter().any(|m| matches!(m, RtspMessage::Data { .. }));
            sink.lock().extend(messages.iter().cloned());
            Ok(if data { 7 } else { 0 })
        }))
        .unwrap();

    f.client.handle_message(
        RtspRequest::new(Method::Setup, format!("{URL}/stream=0"))
            .add_header("CSeq", "1")
            .add_header("Transport", TCP_0_1)
            .into(),
    );
    let id = match sent.lock().last() {
        Some(RtspMessage::Response(resp)) => session_id(resp),
        other => panic!("expected SETUP response, got {other:?}"),
    };

    let session = f.pool.find(&id).unwrap();
    let transport = session.medias()[0].transport(0).unwrap();

    assert!(transport.send_rtp(b"rtp"));
    assert!(f.client.check_back_pressure(0));
    assert!(transport.check_back_pressure(true));
    assert!(!transport.send_rtp(b"blocked"));
    assert!(!f.client.check_back_pressure(1));

    f.client.message_sent(7);
    assert!(!f.client.check_back_pressure(0));
    assert!(transport.send_rtp(b"again"));

    let frames = sent
        .lock()
        .iter()
        .filter(|m| matches!(m, RtspMessage::Data { channel: 0, .. }))
        .count();
    assert_eq!(frames, 2);
}

#[test]
fn single_and_batched_send_functions_conflict() {
    let client = Client::new(
        ClientConfig::default(),
        SessionPool::new(),
        MountPoints::new(),
        None,
        ThreadPool::default(),
        TunnelRegistry::new(),
        Vec::new(),
    );
    client.set_send_func(Box::new(|_, _| true)).unwrap();
    let err = client.set_send_messages_func(Box::new(|_, _| Ok(0))).unwrap_err();
    assert!(matches!(err, RtspError::SendConflict(_)));
}

#[test]
fn attach_requires_connection() {
    let client = Client::new(
        ClientConfig::default(),
        SessionPool::new(),
        MountPoints::new(),
        None,
        ThreadPool::default(),
        TunnelRegistry::new(),
        Vec::new(),
    );
    let err = client.attach(Arc::new(RecordingWatch::default())).unwrap_err();
    assert!(matches!(err, RtspError::NotConnected));
}

struct Veto {
    closed: AtomicU32,
}

impl ClientHooks for Veto {
    fn pre_describe(&self, _ctx: &RequestContext) -> StatusCode {
        StatusCode::FORBIDDEN
    }

    fn closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn hooks_veto_and_observe_close() {
    let veto = Arc::new(Veto {
        closed: AtomicU32::new(0),
    });
    let f = fixture_with(ClientConfig::default(), two_stream_mounts(), vec![veto.clone()]);
    let resp = f.request(Method::Describe, URL, &[]);
    assert_eq!(resp.status, StatusCode::FORBIDDEN);

    f.client.close();
    f.client.close();
    assert_eq!(veto.closed.load(Ordering::SeqCst), 1);
}

fn tunnel_client(tunnels: &TunnelRegistry, id: &str) -> (Arc<Client>, Arc<MockConnection>, Arc<RecordingWatch>) {
    let client = Client::new(
        ClientConfig::default(),
        SessionPool::new(),
        MountPoints::new(),
        None,
        ThreadPool::default(),
        tunnels.clone(),
        Vec::new(),
    );
    let conn = Arc::new(MockConnection::with_tunnel_id(id));
    let watch = Arc::new(RecordingWatch::default());
    client.set_connection(conn.clone());
    client.attach(watch.clone()).unwrap();
    (client, conn, watch)
}

#[test]
fn tunnel_halves_are_joined() {
    let tunnels = TunnelRegistry::new();
    let (get, get_conn, get_watch) = tunnel_client(&tunnels, "cookie");
    let (post, _post_conn, _) = tunnel_client(&tunnels, "cookie");

    assert_eq!(get.tunnel_get(), StatusCode::OK);
    assert!(tunnels.contains("cookie"));

    post.tunnel_post().unwrap();
    assert!(!tunnels.contains("cookie"));
    assert!(Arc::ptr_eq(&post.tunnel_owner().unwrap(), &get));
    assert!(get_conn.tunnelled.lock().is_some());
    assert!(get_watch.resets.load(Ordering::SeqCst) >= 1);

    // the POST half went away; a new one may join
    get.tunnel_lost();
    assert!(tunnels.contains("cookie"));
}

#[test]
fn tunnel_halves_need_different_methods() {
    let tunnels = TunnelRegistry::new();
    let (first, _, _) = tunnel_client(&tunnels, "same");
    let (second, _, _) = tunnel_client(&tunnels, "same");

    assert_eq!(first.tunnel_get(), StatusCode::OK);
    assert_eq!(second.tunnel_get(), StatusCode::BAD_REQUEST);
}

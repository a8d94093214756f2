use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;

use crate::client::Client;
use crate::connection::{Connection, Watch};
use crate::error::{ParseErrorKind, Result, RtspError};
use crate::protocol::{Method, MessageReader, RtspMessage, RtspRequest, RtspResponse, StatusCode, Version};
use crate::server::Shared;

/// Interval of the client control timer and of session pool cleanup.
const TICK: Duration = Duration::from_secs(1);

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
/// Expired sessions are swept from the pool once per [`TICK`].
pub(crate) fn accept_loop(listener: TcpListener, shared: Arc<Shared>, running: Arc<AtomicBool>) {
    let mut last_cleanup = Instant::now();
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let s = shared.clone();
                let r = running.clone();
                thread::spawn(move || {
                    ConnectionLoop::handle(stream, s, r);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }

        if last_cleanup.elapsed() >= TICK {
            let removed = shared.pool.cleanup(Instant::now());
            if removed > 0 {
                tracing::debug!(removed, "expired sessions removed");
            }
            last_cleanup = Instant::now();
        }
    }
    tracing::debug!("accept loop exited");
}

/// A control connection accepted by the server.
///
/// Writes go straight to the socket. The POST half of an HTTP tunnel
/// writes through the GET half it was joined with, since responses travel
/// on the GET connection.
pub struct TcpConnection {
    writer: Mutex<TcpStream>,
    local: SocketAddr,
    peer: SocketAddr,
    tunnel_id: Mutex<Option<String>>,
    post: AtomicBool,
    tunnel: Mutex<Option<Arc<dyn Connection>>>,
    content_length_limit: AtomicU32,
    closed: AtomicBool,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Result<Self> {
        Ok(TcpConnection {
            local: stream.local_addr()?,
            peer: stream.peer_addr()?,
            writer: Mutex::new(stream),
            tunnel_id: Mutex::new(None),
            post: AtomicBool::new(false),
            tunnel: Mutex::new(None),
            content_length_limit: AtomicU32::new(u32::MAX),
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn set_tunnel_id(&self, id: &str) {
        *self.tunnel_id.lock() = Some(id.to_string());
    }

    /// Mark this connection as the POST half of a tunnel.
    pub fn set_post(&self, post: bool) {
        self.post.store(post, Ordering::SeqCst);
    }

    pub fn content_length_limit(&self) -> u32 {
        self.content_length_limit.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for TcpConnection {
    fn tunnel_id(&self) -> Option<String> {
        self.tunnel_id.lock().clone()
    }

    fn local_ip(&self) -> String {
        self.local.ip().to_string()
    }

    fn peer_ip(&self) -> String {
        self.peer.ip().to_string()
    }

    fn peer_port(&self) -> u16 {
        self.peer.port()
    }

    fn local_port(&self) -> u16 {
        self.local.port()
    }

    fn set_content_length_limit(&self, limit: u32) {
        self.content_length_limit.store(limit, Ordering::Relaxed);
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if self.post.load(Ordering::SeqCst) {
            let tunnel = self.tunnel.lock().clone();
            if let Some(get_half) = tunnel {
                return get_half.write(data);
            }
        }
        self.writer.lock().write_all(data)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.writer.lock().shutdown(Shutdown::Both) {
            tracing::debug!(peer = %self.peer, error = %e, "shutdown failed");
        }
        let tunnel = self.tunnel.lock().take();
        if let Some(other) = tunnel {
            other.close();
        }
    }

    fn do_tunnel(&self, other: Arc<dyn Connection>) -> Result<()> {
        let mut tunnel = self.tunnel.lock();
        if tunnel.is_some() {
            return Err(RtspError::Tunnel("connection already tunnelled".to_string()));
        }
        tracing::debug!(peer = %self.peer, other = %other.peer_ip(), "tunnel joined");
        *tunnel = Some(other);
        Ok(())
    }
}

/// Writes messages to the connection as soon as they are queued.
pub struct TcpWatch {
    conn: Arc<TcpConnection>,
    flushing: AtomicBool,
}

impl TcpWatch {
    pub fn new(conn: Arc<TcpConnection>) -> Self {
        TcpWatch {
            conn,
            flushing: AtomicBool::new(false),
        }
    }
}

impl Watch for TcpWatch {
    fn send_messages(&self, messages: &[RtspMessage]) -> Result<u32> {
        if self.flushing.load(Ordering::SeqCst) {
            return Ok(0);
        }
        for message in messages {
            self.conn.write(&message.serialize())?;
        }
        Ok(0)
    }

    fn set_flushing(&self, flushing: bool) {
        self.flushing.store(flushing, Ordering::SeqCst);
    }

    fn reset(&self) {
        tracing::trace!(peer = %self.conn.peer_addr(), "watch reset");
    }
}

/// Reads one control connection and feeds its messages to a [`Client`].
struct ConnectionLoop {
    stream: TcpStream,
    conn: Arc<TcpConnection>,
    client: Arc<Client>,
    reader: MessageReader,
    /// Base64 text of a tunnel POST, not yet decoded.
    post_body: Option<Vec<u8>>,
    peer_addr: SocketAddr,
}

impl ConnectionLoop {
    /// Entry point: set up a connection and run its read loop.
    fn handle(stream: TcpStream, shared: Arc<Shared>, running: Arc<AtomicBool>) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        tracing::info!(%peer_addr, "client connected");

        let conn = match stream.try_clone().map_err(RtspError::from).and_then(TcpConnection::new) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "could not set up connection");
                return;
            }
        };
        if let Err(e) = stream.set_read_timeout(Some(TICK)) {
            tracing::warn!(%peer_addr, error = %e, "could not set read timeout");
            return;
        }

        let client = shared.new_client();
        client.set_connection(conn.clone());
        if let Err(e) = client.attach(Arc::new(TcpWatch::new(conn.clone()))) {
            tracing::warn!(%peer_addr, error = %e, "could not attach client");
            return;
        }

        let mut lp = ConnectionLoop {
            stream,
            reader: MessageReader::new(conn.content_length_limit()),
            conn,
            client,
            post_body: None,
            peer_addr,
        };

        let reason = lp.run(&running);
        match lp.client.tunnel_owner() {
            Some(owner) => owner.tunnel_lost(),
            None => lp.client.close(),
        }

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// Read loop. Returns the reason for exiting.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        let mut buf = [0u8; 4096];
        let mut last_tick = Instant::now();
        while running.load(Ordering::SeqCst) {
            if self.conn.is_closed() {
                return "closed by server";
            }

            match self.stream.read(&mut buf) {
                Ok(0) => return "connection closed by client",
                Ok(n) => {
                    if let Err(reason) = self.receive(&buf[..n]) {
                        return reason;
                    }
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(_) => return "read error",
            }

            if last_tick.elapsed() >= TICK {
                self.client.tick();
                last_tick = Instant::now();
            }
        }

        "server shutting down"
    }

    fn receive(&mut self, data: &[u8]) -> std::result::Result<(), &'static str> {
        match &mut self.post_body {
            Some(pending) => {
                pending.extend(data.iter().copied().filter(|b| !b.is_ascii_whitespace()));
                self.decode_post_body()?;
            }
            None => self.reader.feed(data),
        }
        self.dispatch()
    }

    /// Decode the complete base64 quads of the tunnel POST body into the
    /// message reader.
    fn decode_post_body(&mut self) -> std::result::Result<(), &'static str> {
        let Some(pending) = &mut self.post_body else {
            return Ok(());
        };
        let complete = pending.len() / 4 * 4;
        if complete == 0 {
            return Ok(());
        }
        let chunk: Vec<u8> = pending.drain(..complete).collect();
        match BASE64.decode(&chunk) {
            Ok(decoded) => {
                self.reader.feed(&decoded);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer_addr, error = %e, "invalid base64 in tunnel");
                Err("invalid tunnel data")
            }
        }
    }

    fn dispatch(&mut self) -> std::result::Result<(), &'static str> {
        loop {
            self.reader.set_content_length_limit(self.conn.content_length_limit());
            match self.reader.next_message() {
                Ok(None) => return Ok(()),
                Ok(Some(RtspMessage::Request(req))) if req.version.is_http() => {
                    self.handle_http(req)?;
                }
                Ok(Some(message)) => {
                    let target = self.client.tunnel_owner().unwrap_or_else(|| self.client.clone());
                    target.handle_message(message);
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    let status = match e {
                        RtspError::Parse {
                            kind: ParseErrorKind::ContentTooLarge,
                        } => StatusCode::REQUEST_ENTITY_TOO_LARGE,
                        _ => StatusCode::BAD_REQUEST,
                    };
                    self.client.send_message(None, RtspResponse::new(status).into());
                }
            }
        }
    }

    /// One half of an RTSP-over-HTTP tunnel, identified by its
    /// `x-sessioncookie`.
    fn handle_http(&mut self, req: RtspRequest) -> std::result::Result<(), &'static str> {
        let cookie = req.get_header("x-sessioncookie").map(str::to_string);
        match (&req.method, cookie) {
            (Method::Get, Some(cookie)) => {
                tracing::debug!(peer = %self.peer_addr, tunnel_id = %cookie, "tunnel GET");
                self.conn.set_tunnel_id(&cookie);
                let code = self.client.tunnel_get();
                let mut response = http_response(code);
                if code == StatusCode::OK {
                    response.headers.add("Content-Type", "application/x-rtsp-tunnelled");
                    response.headers.add("Cache-Control", "no-cache");
                    response.headers.add("Pragma", "no-cache");
                }
                self.client.tunnel_http_response(&req, &mut response);
                if self.conn.write(&response.serialize()).is_err() {
                    return Err("write error");
                }
                if code != StatusCode::OK {
                    return Err("tunnel refused");
                }
                Ok(())
            }
            (Method::Post, Some(cookie)) => {
                tracing::debug!(peer = %self.peer_addr, tunnel_id = %cookie, "tunnel POST");
                self.conn.set_tunnel_id(&cookie);
                self.conn.set_post(true);
                if let Err(e) = self.client.tunnel_post() {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "tunnel refused");
                    return Err("tunnel refused");
                }
                let pending = self.reader.take_pending();
                self.post_body = Some(pending.into_iter().filter(|b| !b.is_ascii_whitespace()).collect());
                self.decode_post_body()
            }
            _ => {
                tracing::warn!(peer = %self.peer_addr, method = %req.method, "unsupported HTTP request");
                let response = http_response(StatusCode::BAD_REQUEST);
                let _ = self.conn.write(&response.serialize());
                Err("bad HTTP request")
            }
        }
    }
}

fn http_response(code: StatusCode) -> RtspResponse {
    let mut response = RtspResponse::new(code);
    response.version = Version::Http1_0;
    response
}

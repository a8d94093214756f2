use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::RwLock;

use crate::auth::Auth;
use crate::client::{Client, ClientConfig, ClientHooks};
use crate::error::{Result, RtspError};
use crate::mount::MountPoints;
use crate::session::{DEFAULT_SESSION_TIMEOUT_SECS, SessionPool};
use crate::thread_pool::ThreadPool;
use crate::transport::tcp;
use crate::tunnel::TunnelRegistry;

/// Server-level configuration handed to every accepted client.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Timeout of new sessions, in seconds.
    pub session_timeout: u32,
    /// Maximum number of concurrent sessions; 0 means unlimited.
    pub max_sessions: usize,
    /// Maximum number of prepared media; `None` means unlimited.
    pub max_threads: Option<usize>,
    /// See [`ClientConfig::post_session_timeout`].
    pub post_session_timeout: i32,
    /// See [`ClientConfig::drop_backlog`].
    pub drop_backlog: bool,
    /// Largest request body accepted.
    pub content_length_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            session_timeout: DEFAULT_SESSION_TIMEOUT_SECS,
            max_sessions: 0,
            max_threads: None,
            post_session_timeout: client.post_session_timeout,
            drop_backlog: client.drop_backlog,
            content_length_limit: client.content_length_limit,
        }
    }
}

/// State shared by the accept loop and every connection.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) pool: SessionPool,
    pub(crate) mounts: MountPoints,
    pub(crate) thread_pool: ThreadPool,
    pub(crate) tunnels: TunnelRegistry,
    auth: RwLock<Option<Arc<dyn Auth>>>,
    hooks: RwLock<Vec<Arc<dyn ClientHooks>>>,
}

impl Shared {
    pub(crate) fn new_client(&self) -> Arc<Client> {
        Client::new(
            ClientConfig {
                post_session_timeout: self.config.post_session_timeout,
                drop_backlog: self.config.drop_backlog,
                content_length_limit: self.config.content_length_limit,
            },
            self.pool.clone(),
            self.mounts.clone(),
            self.auth.read().clone(),
            self.thread_pool.clone(),
            self.tunnels.clone(),
            self.hooks.read().clone(),
        )
    }
}

/// High-level RTSP server orchestrator.
///
/// Owns the session pool, mount points and tunnel registry, and accepts
/// control connections on a background thread. Each connection gets its
/// own [`Client`] driven by [`transport::tcp`](crate::transport::tcp).
pub struct Server {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    bind_addr: String,
    local_addr: Option<SocketAddr>,
}

impl Server {
    pub fn new(bind_addr: &str) -> Self {
        Self::with_config(bind_addr, ServerConfig::default())
    }

    pub fn with_config(bind_addr: &str, config: ServerConfig) -> Self {
        let pool = SessionPool::new();
        pool.set_session_timeout(config.session_timeout);
        pool.set_max_sessions(config.max_sessions);
        Self {
            shared: Arc::new(Shared {
                pool,
                mounts: MountPoints::new(),
                thread_pool: ThreadPool::new(config.max_threads),
                tunnels: TunnelRegistry::new(),
                auth: RwLock::new(None),
                hooks: RwLock::new(Vec::new()),
                config,
            }),
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
            local_addr: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let shared = self.shared.clone();

        tracing::info!(addr = %local_addr, "RTSP server listening");

        thread::spawn(move || {
            tcp::accept_loop(listener, shared, running);
        });

        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(RtspError::NotStarted)
    }

    pub fn mounts(&self) -> &MountPoints {
        &self.shared.mounts
    }

    pub fn session_pool(&self) -> &SessionPool {
        &self.shared.pool
    }

    pub fn thread_pool(&self) -> &ThreadPool {
        &self.shared.thread_pool
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Authentication for clients accepted from now on.
    pub fn set_auth(&self, auth: Option<Arc<dyn Auth>>) {
        *self.shared.auth.write() = auth;
    }

    /// Register hooks for clients accepted from now on.
    pub fn add_hooks(&self, hooks: Arc<dyn ClientHooks>) {
        self.shared.hooks.write().push(hooks);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

pub mod auth;
pub mod client;
pub mod connection;
pub mod error;
pub mod media;
pub mod mount;
pub mod protocol;
pub mod server;
pub mod session;
pub mod thread_pool;
pub mod transport;
pub mod tunnel;

pub use auth::{Auth, AuthCheck, BasicAuth};
pub use client::{Client, ClientConfig, ClientHooks, RequestContext};
pub use connection::{Connection, Watch};
pub use error::{Result, RtspError};
pub use media::{Media, MediaFactory, StreamConfig};
pub use mount::MountPoints;
pub use server::{Server, ServerConfig};
pub use session::{Session, SessionPool};
pub use thread_pool::ThreadPool;
pub use tunnel::TunnelRegistry;

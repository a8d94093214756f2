//! The seams between a [`Client`](crate::client::Client) and the socket
//! that carries its messages.
//!
//! [`Connection`] describes the socket itself: addresses, tunnel identity,
//! raw writes and closing. [`Watch`] is the event source attached to it,
//! queueing outgoing messages. The TCP server provides both in
//! [`transport::tcp`](crate::transport::tcp); tests substitute their own.

use std::sync::Arc;

use crate::error::Result;
use crate::protocol::RtspMessage;

pub trait Connection: Send + Sync {
    /// The `x-sessioncookie` of an HTTP tunnel, once known.
    fn tunnel_id(&self) -> Option<String>;

    /// Local IP address the client connected to.
    fn local_ip(&self) -> String;

    /// Remote IP address, used as the destination of unicast transports.
    fn peer_ip(&self) -> String;

    /// Remote TCP port.
    fn peer_port(&self) -> u16;

    /// Local TCP port.
    fn local_port(&self) -> u16;

    /// Largest accepted request body.
    fn set_content_length_limit(&self, limit: u32);

    fn write(&self, data: &[u8]) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn close(&self);

    /// Merge the other half of an HTTP tunnel into this connection: from
    /// now on this connection also reads what `other` receives.
    fn do_tunnel(&self, other: Arc<dyn Connection>) -> Result<()>;
}

/// Outgoing message queue attached to a [`Connection`].
pub trait Watch: Send + Sync {
    /// Queue `messages`. Returns 0 when they were written immediately,
    /// otherwise an id later passed to
    /// [`Client::message_sent`](crate::client::Client::message_sent).
    fn send_messages(&self, messages: &[RtspMessage]) -> Result<u32>;

    /// While flushing, queued and new messages are discarded.
    fn set_flushing(&self, flushing: bool);

    /// Drop everything still queued.
    fn reset(&self);
}

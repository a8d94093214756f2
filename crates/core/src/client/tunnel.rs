use std::sync::Arc;

use crate::client::{Client, TunnelState};
use crate::error::{Result, RtspError};
use crate::protocol::{RtspRequest, RtspResponse, StatusCode};

impl Client {
    /// The HTTP GET half of a tunnel arrived on this connection.
    pub fn tunnel_get(&self) -> StatusCode {
        self.state.lock().tstate = TunnelState::Get;
        self.tunnel_complete()
    }

    /// The HTTP POST half of a tunnel arrived on this connection.
    pub fn tunnel_post(&self) -> Result<()> {
        self.state.lock().tstate = TunnelState::Post;
        let code = self.tunnel_complete();
        if code == StatusCode::OK {
            Ok(())
        } else {
            Err(RtspError::Tunnel(format!("tunnel setup failed with {code}")))
        }
    }

    /// Register this half of a tunnel, or join it with the other half
    /// registered under the same cookie.
    fn tunnel_complete(&self) -> StatusCode {
        let (connection, tstate) = {
            let state = self.state.lock();
            (state.connection.clone(), state.tstate)
        };
        let Some(connection) = connection else {
            return StatusCode::SERVICE_UNAVAILABLE;
        };
        let Some(tunnel_id) = connection.tunnel_id() else {
            tracing::warn!("tunnel request without session cookie");
            return StatusCode::SERVICE_UNAVAILABLE;
        };

        let Some(other) = self.tunnels.remove(&tunnel_id) else {
            tracing::debug!(tunnel_id = %tunnel_id, "first half of tunnel, waiting for the other");
            return match self.this.upgrade() {
                Some(this) if self.tunnels.insert(&tunnel_id, this.clone()) => StatusCode::OK,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
        };

        {
            let other_watch = other.watch.lock();
            let Some(other_watch) = other_watch.as_ref() else {
                tracing::warn!(tunnel_id = %tunnel_id, "tunnel owner has no watch");
                return StatusCode::SERVICE_UNAVAILABLE;
            };
            let (other_connection, other_tstate) = {
                let state = other.state.lock();
                (state.connection.clone(), state.tstate)
            };
            if other_tstate == tstate {
                tracing::warn!(tunnel_id = %tunnel_id, ?tstate, "both tunnel halves use the same method");
                return StatusCode::BAD_REQUEST;
            }
            let Some(other_connection) = other_connection else {
                return StatusCode::SERVICE_UNAVAILABLE;
            };
            if let Err(e) = other_connection.do_tunnel(connection) {
                tracing::warn!(tunnel_id = %tunnel_id, error = %e, "could not join tunnel");
                return StatusCode::SERVICE_UNAVAILABLE;
            }
            other_watch.reset();
            if let Some(watch) = self.watch.lock().as_ref() {
                watch.reset();
            }
        }

        tracing::info!(tunnel_id = %tunnel_id, "tunnel established");
        let watch = self.watch.lock().take();
        if let Some(watch) = watch {
            self.destroy_watch(watch);
        }
        self.state.lock().tunnel_owner = Some(other);
        StatusCode::OK
    }

    /// The connection of a tunnel half closed while the tunnel lives on.
    /// Registers the client again so a new half can join it.
    pub fn tunnel_lost(&self) {
        if self.watch.lock().is_none() {
            return;
        }
        let Some(connection) = self.connection() else {
            return;
        };
        let Some(tunnel_id) = connection.tunnel_id() else {
            return;
        };
        if self.tunnels.contains(&tunnel_id) {
            return;
        }
        tracing::info!(tunnel_id = %tunnel_id, "tunnel half lost, waiting for a new one");
        if let Some(this) = self.this.upgrade() {
            self.tunnels.insert(&tunnel_id, this);
        }
    }

    /// The client that took over this connection's requests when it became
    /// the second half of a tunnel.
    pub fn tunnel_owner(&self) -> Option<Arc<Client>> {
        self.state.lock().tunnel_owner.clone()
    }

    /// Let hooks adjust the HTTP response opening a tunnel.
    pub fn tunnel_http_response(&self, request: &RtspRequest, response: &mut RtspResponse) {
        for h in &self.hooks {
            h.tunnel_http_response(request, response);
        }
    }
}

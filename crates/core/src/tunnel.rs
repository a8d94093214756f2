use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::Client;

/// Process-wide map from HTTP tunnel id to the client that owns the first
/// half of a GET/POST pair.
///
/// One instance is created by the [`Server`](crate::Server) and handed to
/// every client it accepts, so tests can run independent registries.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<Mutex<HashMap<String, Arc<Client>>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` under `id`. Fails if the id is taken.
    pub fn insert(&self, id: &str, client: Arc<Client>) -> bool {
        let mut tunnels = self.tunnels.lock();
        if tunnels.contains_key(id) {
            tracing::warn!(tunnel_id = id, "tunnel id already registered");
            return false;
        }
        tunnels.insert(id.to_string(), client);
        tracing::debug!(tunnel_id = id, tunnels = tunnels.len(), "tunnel registered");
        true
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Client>> {
        let removed = self.tunnels.lock().remove(id);
        if removed.is_some() {
            tracing::debug!(tunnel_id = id, "tunnel unregistered");
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tunnels.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tunnels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.lock().is_empty()
    }
}

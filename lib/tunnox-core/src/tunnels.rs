//! Tunnel registry — the C7/C9 counterpart of the control-connection
//! registry (C4), indexing live `TunnelConnection`s by `tunnelID` so the
//! broker can find "the peer's tunnel connection has appeared" (spec §4.7)
//! without polling the control registry. Grounded on the same
//! `dashmap`-per-index shape as `registry::ControlRegistry`.

use std::sync::Arc;

use dashmap::DashMap;
use tunnox_types::CoreError;

use crate::connection::TunnelConnection;

pub struct TunnelRegistry {
    by_tunnel_id: DashMap<String, Vec<Arc<TunnelConnection>>>,
    max_tunnels: usize,
}

impl TunnelRegistry {
    pub fn new(max_tunnels: usize) -> Self {
        TunnelRegistry {
            by_tunnel_id: DashMap::new(),
            max_tunnels,
        }
    }

    /// Registers one side of a tunnel. A `tunnelID` may hold up to two
    /// entries — one per side (spec §3: "a tunnel is the pair of two such
    /// connections, one per side"). Returns `true` when this call is the one
    /// that brought the tunnel to two sides — the broker uses that to decide
    /// which same-node side drives the splice (`connection::SpliceRole`).
    pub fn register(&self, conn: Arc<TunnelConnection>) -> Result<bool, CoreError> {
        let mut sides = self.by_tunnel_id.entry(conn.tunnel_id.clone()).or_default();
        if sides.len() >= 2 {
            return Err(CoreError::resource_exhausted(format!(
                "tunnel {} already has two connected sides",
                conn.tunnel_id
            )));
        }
        if sides.is_empty() && self.by_tunnel_id.len() >= self.max_tunnels {
            drop(sides);
            self.by_tunnel_id.remove_if(&conn.tunnel_id, |_, v| v.is_empty());
            return Err(CoreError::quota_exceeded("tunnel registry is full"));
        }
        sides.push(conn);
        Ok(sides.len() == 2)
    }

    /// The other side of `tunnel_id`, if it has already registered —
    /// the same-node pairing check the broker polls while waiting for
    /// `TUNNEL_READY` (spec §4.7).
    pub fn peer_side(&self, tunnel_id: &str, own_conn_id: &str) -> Option<Arc<TunnelConnection>> {
        self.by_tunnel_id
            .get(tunnel_id)
            .and_then(|sides| sides.iter().find(|c| c.conn_id != own_conn_id).cloned())
    }

    pub fn sides(&self, tunnel_id: &str) -> Vec<Arc<TunnelConnection>> {
        self.by_tunnel_id.get(tunnel_id).map(|e| e.clone()).unwrap_or_default()
    }

    /// Every side of every tunnel currently registered, used by the
    /// resume/migration manager's periodic capture sweep (spec §4.10).
    pub fn all_sides(&self) -> Vec<Arc<TunnelConnection>> {
        self.by_tunnel_id.iter().flat_map(|e| e.value().clone()).collect()
    }

    pub fn remove_side(&self, tunnel_id: &str, conn_id: &str) {
        if let Some(mut sides) = self.by_tunnel_id.get_mut(tunnel_id) {
            sides.retain(|c| c.conn_id != conn_id);
        }
        self.by_tunnel_id.remove_if(tunnel_id, |_, v| v.is_empty());
    }

    pub fn remove_tunnel(&self, tunnel_id: &str) {
        self.by_tunnel_id.remove(tunnel_id);
    }

    pub fn len(&self) -> usize {
        self.by_tunnel_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tunnel_id.is_empty()
    }
}

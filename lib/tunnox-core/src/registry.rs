//! Control-connection registry (C4, spec §4.4). Indexes authenticated
//! control connections by `connID` and `clientID`, evicting a superseded
//! peer when a client reconnects. Grounded on the teacher's `entity`
//! world-index pattern (one authoritative map, looked up by a small key),
//! rebuilt around `dashmap` so reads and writes don't serialize behind one
//! global lock the way a single `RwLock<HashMap<..>>` would (spec §5:
//! "lock hold time is O(1) and mutations that require I/O are scheduled
//! out-of-lock").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};
use tunnox_types::CoreError;

use crate::connection::ControlConnection;

pub struct ControlRegistry {
    by_conn_id: DashMap<String, Arc<ControlConnection>>,
    by_client_id: DashMap<i64, Arc<ControlConnection>>,
    max_connections: usize,
    count: AtomicUsize,
}

impl ControlRegistry {
    pub fn new(max_connections: usize) -> Self {
        ControlRegistry {
            by_conn_id: DashMap::new(),
            by_client_id: DashMap::new(),
            max_connections,
            count: AtomicUsize::new(0),
        }
    }

    /// Inserts `conn` by `connID`, and by `clientID` when authenticated.
    /// If a prior connection already holds that `clientID`, it is evicted:
    /// removed from both indices here (inside the insert, so the registry
    /// is never observed holding two entries for one client — spec §8),
    /// with its stream closed on a detached task (spec §9: "the close of
    /// the old stream happens outside the lock").
    pub fn register(&self, conn: Arc<ControlConnection>) -> Result<(), CoreError> {
        if self.count.load(Ordering::Acquire) >= self.max_connections && !self.by_conn_id.contains_key(&conn.conn_id) {
            return Err(CoreError::quota_exceeded("control connection registry is full"));
        }

        let evicted = if let Some(client_id) = conn.client_id() {
            self.by_client_id.insert(client_id, conn.clone())
        } else {
            None
        };

        let replaced = self.by_conn_id.insert(conn.conn_id.clone(), conn.clone());
        if replaced.is_none() {
            self.count.fetch_add(1, Ordering::AcqRel);
        }

        if let Some(old) = evicted.filter(|old| old.conn_id != conn.conn_id) {
            self.evict(old);
        }

        Ok(())
    }

    /// Atomically moves a connection's identity from unauthenticated to
    /// `clientID`/`userID`, evicting any prior holder of that `clientID`
    /// (spec §4.4, §9 "Superseding control connections").
    pub fn update_auth(&self, conn: &Arc<ControlConnection>, client_id: i64, user_id: Option<i64>) {
        conn.mark_authenticated(client_id, user_id);
        if let Some(old) = self.by_client_id.insert(client_id, conn.clone()) {
            if old.conn_id != conn.conn_id {
                self.evict(old);
            }
        }
    }

    fn evict(&self, old: Arc<ControlConnection>) {
        self.by_conn_id.remove(&old.conn_id);
        self.count.fetch_sub(1, Ordering::AcqRel);
        info!(conn_id = %old.conn_id, "evicting superseded control connection");
        tokio::spawn(async move {
            old.sink.close().await;
        });
    }

    pub fn get_by_conn_id(&self, conn_id: &str) -> Option<Arc<ControlConnection>> {
        self.by_conn_id.get(conn_id).map(|e| e.clone())
    }

    pub fn get_by_client_id(&self, client_id: i64) -> Option<Arc<ControlConnection>> {
        self.by_client_id.get(&client_id).map(|e| e.clone())
    }

    pub fn list_all(&self) -> Vec<Arc<ControlConnection>> {
        self.by_conn_id.iter().map(|e| e.value().clone()).collect()
    }

    pub fn list_authenticated(&self) -> Vec<Arc<ControlConnection>> {
        self.by_client_id.iter().map(|e| e.value().clone()).collect()
    }

    /// Removes and closes connections idle past `timeout_secs` (spec §4.9,
    /// default heartbeat timeout 60s, swept every 15s by the session
    /// manager).
    pub fn cleanup_stale(&self, timeout_secs: i64, now_unix: i64) -> usize {
        let stale: Vec<Arc<ControlConnection>> = self
            .by_conn_id
            .iter()
            .filter(|e| e.value().is_idle_since(now_unix, timeout_secs))
            .map(|e| e.value().clone())
            .collect();

        for conn in &stale {
            self.remove(&conn.conn_id);
            debug!(conn_id = %conn.conn_id, "cleaning up stale control connection");
        }
        stale.len()
    }

    /// Unconditional removal, used on stream close and by `cleanup_stale`.
    /// Does not close the stream — the caller already knows it is gone.
    pub fn remove(&self, conn_id: &str) {
        if let Some((_, conn)) = self.by_conn_id.remove(conn_id) {
            self.count.fetch_sub(1, Ordering::AcqRel);
            if let Some(client_id) = conn.client_id() {
                self.by_client_id.remove_if(&client_id, |_, v| v.conn_id == conn_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSink;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tunnox_types::TransferPacket;

    struct NoopSink {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ConnectionSink for NoopSink {
        async fn send(&self, _packet: TransferPacket) -> Result<(), CoreError> {
            Ok(())
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn remote_addr(&self) -> String {
            "127.0.0.1:0".into()
        }
    }

    fn conn(conn_id: &str) -> (Arc<ControlConnection>, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(NoopSink { closed: closed.clone() });
        let conn = Arc::new(ControlConnection::new(conn_id.to_string(), "127.0.0.1:1".into(), "tcp".into(), sink));
        (conn, closed)
    }

    #[tokio::test]
    async fn registering_same_client_twice_evicts_the_first() {
        let registry = ControlRegistry::new(100);

        let (first, first_closed) = conn("conn-a");
        first.mark_authenticated(42, None);
        registry.register(first.clone()).unwrap();

        let (second, _) = conn("conn-b");
        second.mark_authenticated(42, None);
        registry.register(second.clone()).unwrap();

        tokio::task::yield_now().await;

        assert!(registry.get_by_conn_id("conn-a").is_none());
        assert_eq!(registry.get_by_client_id(42).unwrap().conn_id, "conn-b");
        assert!(first_closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn registering_the_same_connection_twice_is_idempotent() {
        let registry = ControlRegistry::new(100);
        let (first, _) = conn("conn-a");
        first.mark_authenticated(7, None);

        registry.register(first.clone()).unwrap();
        registry.register(first.clone()).unwrap();

        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn quota_exceeded_rejects_new_registrations() {
        let registry = ControlRegistry::new(1);
        let (first, _) = conn("conn-a");
        registry.register(first).unwrap();

        let (second, _) = conn("conn-b");
        assert!(registry.register(second).is_err());
    }
}

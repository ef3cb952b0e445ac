//! Tunnel-state store (C3, spec §3, §4.3). Signed, TTL-bound `TunnelState`
//! snapshots serialised through the injected `Kv`. Grounded on the
//! teacher's habit (`flux::crypto`) of keeping signing as a thin function
//! over raw bytes rather than a stateful object.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use tunnox_common::crypto::hmac_sha256;
use tunnox_common::encoding;
use tunnox_common::time::timestamp_secs;
use tunnox_types::{CoreError, TunnelState};

use crate::contracts::Kv;

/// Fallback signing secret (spec §4.3: "missing secret falls back to a
/// fixed compile-time constant with a warning ... unsafe in production").
/// Never used when `TunnelStateStore::new` is given an explicit secret.
const INSECURE_DEV_SECRET: &[u8] = b"tunnox-dev-insecure-default-signing-secret";

pub fn tunnel_state_key(tunnel_id: &str) -> String {
    format!("tunnel:state:{tunnel_id}")
}

pub struct TunnelStateStore {
    kv: Arc<dyn Kv>,
    secret: Vec<u8>,
    ttl: Duration,
}

impl TunnelStateStore {
    /// `secret = None` is only acceptable for single-node development; spec
    /// §4.3 requires cluster deployments to refuse to start without one.
    /// Callers running in cluster mode must pass `Some(secret)` or reject
    /// startup themselves — this constructor only logs the warning.
    pub fn new(kv: Arc<dyn Kv>, secret: Option<Vec<u8>>, ttl: Duration) -> Self {
        let secret = secret.unwrap_or_else(|| {
            warn!("tunnel-state signing secret not configured; falling back to an insecure development default");
            INSECURE_DEV_SECRET.to_vec()
        });
        TunnelStateStore { kv, secret, ttl }
    }

    fn sign(&self, state: &TunnelState) -> String {
        let tag = hmac_sha256(&self.secret, state.canonical_fields().as_bytes());
        encoding::encode(&tag)
    }

    /// Sets `updatedAt`, (re)computes the signature, and stores the
    /// serialised snapshot with a 5-minute TTL (spec §4.3).
    pub async fn save(&self, mut state: TunnelState) -> Result<(), CoreError> {
        state.updated_at = timestamp_secs();
        state.signature = self.sign(&state);

        let bytes = serde_json::to_vec(&state).map_err(|e| CoreError::internal(e.to_string()))?;
        self.kv.set(&tunnel_state_key(&state.tunnel_id), bytes, Some(self.ttl)).await
    }

    /// Loads and verifies the signature, rejecting tampered or expired
    /// state with `ErrStateTampered` / a not-found (the KV's TTL already
    /// enforces `ErrStateExpired` by simply not returning the key).
    pub async fn load(&self, tunnel_id: &str) -> Result<TunnelState, CoreError> {
        let bytes = self
            .kv
            .get(&tunnel_state_key(tunnel_id))
            .await?
            .ok_or_else(|| CoreError::state_expired(format!("no tunnel state for {tunnel_id}")))?;

        let state: TunnelState = serde_json::from_slice(&bytes).map_err(|e| CoreError::internal(e.to_string()))?;

        let expected = self.sign(&state);
        if expected != state.signature {
            return Err(CoreError::state_tampered(format!(
                "signature mismatch for tunnel state {tunnel_id}"
            )));
        }

        Ok(state)
    }

    /// Best-effort (spec §4.3); a `Kv` error here is logged by the caller,
    /// not propagated as a hard failure.
    pub async fn delete(&self, tunnel_id: &str) -> Result<(), CoreError> {
        self.kv.delete(&tunnel_state_key(tunnel_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::Kv;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MemKv(Mutex<HashMap<String, Vec<u8>>>);

    #[async_trait]
    impl Kv for MemKv {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
            Ok(self.0.lock().get(key).cloned())
        }
        async fn set(&self, key: &str, value: Vec<u8>, _ttl: Option<Duration>) -> Result<(), CoreError> {
            self.0.lock().insert(key.to_string(), value);
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<(), CoreError> {
            self.0.lock().remove(key);
            Ok(())
        }
        async fn exists(&self, key: &str) -> Result<bool, CoreError> {
            Ok(self.0.lock().contains_key(key))
        }
    }

    fn sample_state() -> TunnelState {
        TunnelState {
            tunnel_id: "tun_1".into(),
            mapping_id: Some("map_1".into()),
            listen_client_id: 10_000_001,
            target_client_id: 10_000_002,
            last_seq_num: 3,
            last_ack_num: 2,
            next_expected_seq: 3,
            buffered_packets: vec![],
            created_at: 0,
            updated_at: 0,
            signature: String::new(),
        }
    }

    #[tokio::test]
    async fn save_then_load_roundtrips_ignoring_signature() {
        let kv = Arc::new(MemKv(Mutex::new(HashMap::new())));
        let store = TunnelStateStore::new(kv, Some(b"test-secret".to_vec()), Duration::from_secs(300));

        let original = sample_state();
        store.save(original.clone()).await.unwrap();
        let loaded = store.load("tun_1").await.unwrap();

        assert_eq!(loaded.tunnel_id, original.tunnel_id);
        assert_eq!(loaded.last_seq_num, original.last_seq_num);
    }

    #[tokio::test]
    async fn tampered_bytes_fail_signature_check() {
        let kv = Arc::new(MemKv(Mutex::new(HashMap::new())));
        let store = TunnelStateStore::new(kv.clone(), Some(b"test-secret".to_vec()), Duration::from_secs(300));

        store.save(sample_state()).await.unwrap();

        let mut raw: TunnelState = serde_json::from_slice(&kv.get(&tunnel_state_key("tun_1")).await.unwrap().unwrap()).unwrap();
        raw.last_seq_num = 999;
        let tampered = serde_json::to_vec(&raw).unwrap();
        kv.set(&tunnel_state_key("tun_1"), tampered, None).await.unwrap();

        let err = store.load("tun_1").await.unwrap_err();
        assert_eq!(err.code, tunnox_types::ErrorCode::StateTampered);
    }

    #[tokio::test]
    async fn missing_state_is_state_expired() {
        let kv = Arc::new(MemKv(Mutex::new(HashMap::new())));
        let store = TunnelStateStore::new(kv, Some(b"test-secret".to_vec()), Duration::from_secs(300));
        let err = store.load("missing").await.unwrap_err();
        assert_eq!(err.code, tunnox_types::ErrorCode::StateExpired);
    }
}

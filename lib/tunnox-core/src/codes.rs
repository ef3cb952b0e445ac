//! Connection-code store, backing `CONNECTION_CODE_{GENERATE|LIST|ACTIVATE}`
//! (spec §4.6). A code generated on one node may be activated by a client
//! connected to a different node in the cluster, so codes live in the
//! injected `Kv` rather than in-process state — the same reasoning as the
//! tunnel-state store (`state.rs`), whose key-prefix style this follows.

use std::sync::Arc;
use std::time::Duration;

use tunnox_types::{ConnectionCode, CoreError, CONNECTION_CODE_TTL_SECS};

use crate::contracts::Kv;

fn code_key(code: &str) -> String {
    format!("tunnox:code:{code}")
}

fn owner_index_key(owner_client_id: i64) -> String {
    format!("tunnox:code:owner:{owner_client_id}")
}

/// Generates an 8-character alphanumeric code, avoiding characters that are
/// easy to mis-key when read aloud or copied by hand (`0`/`O`, `1`/`I`/`l`).
fn random_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut bytes = [0u8; 8];
    tunnox_common::crypto::random_bytes(&mut bytes);
    bytes.iter().map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char).collect()
}

pub struct ConnectionCodeStore {
    kv: Arc<dyn Kv>,
}

impl ConnectionCodeStore {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        ConnectionCodeStore { kv }
    }

    /// Mints a fresh code for `owner_client_id` and records it in that
    /// client's owner index so `list` can enumerate it later.
    pub async fn generate(&self, owner_client_id: i64, protocol: String, target_host: String, target_port: u16) -> Result<ConnectionCode, CoreError> {
        let now = tunnox_common::time::timestamp_secs();
        let code = ConnectionCode {
            code: random_code(),
            owner_client_id,
            protocol,
            target_host,
            target_port,
            created_at: now,
            expires_at: now + CONNECTION_CODE_TTL_SECS,
            activated: false,
        };

        let ttl = Duration::from_secs(CONNECTION_CODE_TTL_SECS as u64);
        let bytes = serde_json::to_vec(&code).map_err(|e| CoreError::internal(e.to_string()))?;
        self.kv.set(&code_key(&code.code), bytes, Some(ttl)).await?;
        self.add_to_owner_index(owner_client_id, &code.code, ttl).await?;

        Ok(code)
    }

    /// Lists the codes `owner_client_id` has generated that have not yet
    /// expired. The owner index may briefly outlive an expired code's own
    /// `Kv` entry — such entries are filtered out here rather than treated
    /// as an error.
    pub async fn list(&self, owner_client_id: i64) -> Result<Vec<ConnectionCode>, CoreError> {
        let codes = self.read_owner_index(owner_client_id).await?;
        let mut out = Vec::with_capacity(codes.len());
        for code in codes {
            if let Some(bytes) = self.kv.get(&code_key(&code)).await? {
                let parsed: ConnectionCode = serde_json::from_slice(&bytes).map_err(|e| CoreError::internal(e.to_string()))?;
                if !parsed.is_expired(tunnox_common::time::timestamp_secs()) && !parsed.activated {
                    out.push(parsed);
                }
            }
        }
        Ok(out)
    }

    /// Redeems `code`, marking it activated so a second activation attempt
    /// fails. Returns the owner so the caller can materialize a `PortMapping`
    /// pairing the owner (listener) with the activating client (target).
    pub async fn activate(&self, code: &str) -> Result<ConnectionCode, CoreError> {
        let bytes = self
            .kv
            .get(&code_key(code))
            .await?
            .ok_or_else(|| CoreError::invalid_param(format!("no such connection code {code}")))?;
        let mut parsed: ConnectionCode = serde_json::from_slice(&bytes).map_err(|e| CoreError::internal(e.to_string()))?;

        if parsed.activated {
            return Err(CoreError::invalid_param("connection code has already been activated"));
        }
        if parsed.is_expired(tunnox_common::time::timestamp_secs()) {
            return Err(CoreError::invalid_param("connection code has expired"));
        }

        parsed.activated = true;
        let remaining = (parsed.expires_at - tunnox_common::time::timestamp_secs()).max(1) as u64;
        let out = serde_json::to_vec(&parsed).map_err(|e| CoreError::internal(e.to_string()))?;
        self.kv.set(&code_key(code), out, Some(Duration::from_secs(remaining))).await?;

        Ok(parsed)
    }

    /// Read-modify-write against the owner index. Two codes generated by the
    /// same client at the same instant can race here and drop one from the
    /// list; accepted for a reference implementation rather than introducing
    /// a compare-and-swap primitive the `Kv` trait does not otherwise need.
    async fn add_to_owner_index(&self, owner_client_id: i64, code: &str, ttl: Duration) -> Result<(), CoreError> {
        let mut codes = self.read_owner_index(owner_client_id).await?;
        codes.push(code.to_string());
        let bytes = serde_json::to_vec(&codes).map_err(|e| CoreError::internal(e.to_string()))?;
        self.kv.set(&owner_index_key(owner_client_id), bytes, Some(ttl)).await
    }

    async fn read_owner_index(&self, owner_client_id: i64) -> Result<Vec<String>, CoreError> {
        match self.kv.get(&owner_index_key(owner_client_id)).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| CoreError::internal(e.to_string())),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
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

    fn store() -> ConnectionCodeStore {
        ConnectionCodeStore::new(Arc::new(MemKv::default()))
    }

    #[tokio::test]
    async fn generated_code_is_listed_for_its_owner() {
        let store = store();
        let code = store.generate(10_000_001, "tcp".into(), "127.0.0.1".into(), 22).await.unwrap();

        let listed = store.list(10_000_001).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].code, code.code);
    }

    #[tokio::test]
    async fn activating_twice_fails_the_second_time() {
        let store = store();
        let code = store.generate(10_000_001, "tcp".into(), "127.0.0.1".into(), 22).await.unwrap();

        store.activate(&code.code).await.unwrap();
        let err = store.activate(&code.code).await.unwrap_err();
        assert_eq!(err.code, tunnox_types::ErrorCode::InvalidParam);
    }

    #[tokio::test]
    async fn unknown_code_is_rejected() {
        let store = store();
        let err = store.activate("NOSUCHCODE").await.unwrap_err();
        assert_eq!(err.code, tunnox_types::ErrorCode::InvalidParam);
    }

    #[tokio::test]
    async fn activated_code_no_longer_appears_in_the_listing() {
        let store = store();
        let code = store.generate(10_000_001, "tcp".into(), "127.0.0.1".into(), 22).await.unwrap();
        store.activate(&code.code).await.unwrap();

        let listed = store.list(10_000_001).await.unwrap();
        assert!(listed.is_empty());
    }
}

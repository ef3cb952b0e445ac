//! In-memory `Kv` (`tunnox_core::contracts::Kv`). Grounded on the same
//! `DashMap`-backed pattern `tunnox-core` itself uses for its registries
//! (`registry.rs`, `tunnels.rs`) rather than reaching for an external store —
//! a single-node reference deployment has no need for one, and every real
//! deployment is expected to swap this crate's `Kv` for its own (Redis,
//! etcd, ...).

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tunnox_common::time::timestamp_secs;
use tunnox_types::CoreError;

use tunnox_core::contracts::Kv;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }
}

/// Expiry is checked lazily on read rather than swept by a background task —
/// an expired entry that's never read again just sits there until the map is
/// dropped. Fine for a reference implementation; a real `Kv` behind Redis or
/// etcd gets this for free from the backing store.
#[derive(Default)]
pub struct InMemoryKv {
    entries: DashMap<String, Entry>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        InMemoryKv::default()
    }
}

#[async_trait]
impl Kv for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let now = timestamp_secs();
        let hit = self.entries.get(key).map(|entry| (entry.value.clone(), entry.is_expired(now)));
        match hit {
            Some((value, false)) => Ok(Some(value)),
            Some((_, true)) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CoreError> {
        let expires_at = ttl.map(|d| timestamp_secs() + d.as_secs() as i64);
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CoreError> {
        Ok(self.get(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let kv = InMemoryKv::new();
        kv.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(kv.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let kv = InMemoryKv::new();
        kv.set("k", b"v".to_vec(), Some(Duration::from_secs(0))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_removes_the_entry() {
        let kv = InMemoryKv::new();
        kv.set("k", b"v".to_vec(), None).await.unwrap();
        kv.delete("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}

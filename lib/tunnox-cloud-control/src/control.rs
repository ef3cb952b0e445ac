//! In-memory reference `CloudControl` (`tunnox_core::contracts::CloudControl`).
//! Owns the client-credential and port-mapping tables a real deployment
//! would keep in its own database, plus resume-token validation — which
//! delegates to `tunnox_core::resume::decode_token` and the same
//! `TunnelStateStore` the core's own resume manager writes through, since
//! §6 makes validating a resume token the cloud-control plane's job (the
//! core only issues them).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;
use tunnox_common::crypto::{decrypt_secret, encrypt_secret, random_encryption_key, SECRET_KEY_SIZE};
use tunnox_common::ids::random_id_with_retry;
use tunnox_common::time::timestamp_secs;
use tunnox_types::{
    CoreError, MappingStatus, PortMapping, ANONYMOUS_CREDENTIAL_TTL_SECS, CLIENT_ID_GENERATION_RETRIES, CLIENT_ID_MAX_EXCLUSIVE,
    CLIENT_ID_MIN,
};

use tunnox_core::contracts::{AnonymousBootstrap, ClientConfig, ClientSummary, CloudControl};
use tunnox_core::resume::decode_token;
use tunnox_core::state::TunnelStateStore;

struct ClientRecord {
    secret_key_encrypted: Vec<u8>,
    legacy_plaintext_mode: bool,
    expires_at: Option<i64>,
    online: bool,
    last_node_id: Option<String>,
}

/// An in-memory cloud-control plane for a single node (or, with a shared
/// `Arc`, a single process standing in for a cluster during development).
/// Every table here is what a production deployment is expected to persist
/// durably instead — client credentials, port mappings — none of it
/// survives a restart.
pub struct InMemoryCloudControl {
    clients: DashMap<i64, ClientRecord>,
    mappings: DashMap<String, PortMapping>,
    encryption_key: [u8; SECRET_KEY_SIZE],
    state_store: Arc<TunnelStateStore>,
    resume_secret: Vec<u8>,
}

impl InMemoryCloudControl {
    /// `resume_secret` must be the same secret the node's `ResumeManager`
    /// signs tokens with, and `state_store` must be backed by the same `Kv`
    /// it saves `TunnelState` snapshots into — this crate only validates,
    /// it never captures a tunnel's state itself.
    pub fn new(state_store: Arc<TunnelStateStore>, resume_secret: Vec<u8>) -> Self {
        InMemoryCloudControl {
            clients: DashMap::new(),
            mappings: DashMap::new(),
            encryption_key: random_encryption_key(),
            state_store,
            resume_secret,
        }
    }

    /// Registers a known client with a plaintext secret, encrypting it at
    /// rest under this instance's key. Used by operator tooling (`util`) and
    /// by tests; a production deployment's equivalent is whatever issues
    /// credentials out of band (a provisioning API, an admin CLI).
    pub fn register_client(&self, client_id: i64, plaintext_secret: &[u8], legacy_plaintext_mode: bool, expires_at: Option<i64>) {
        self.clients.insert(
            client_id,
            ClientRecord {
                secret_key_encrypted: encrypt_secret(&self.encryption_key, plaintext_secret),
                legacy_plaintext_mode,
                expires_at,
                online: false,
                last_node_id: None,
            },
        );
    }

    fn mapping_id_taken(&self, candidate: i64) -> bool {
        self.mappings.contains_key(&format!("map_{candidate}"))
    }
}

#[async_trait]
impl CloudControl for InMemoryCloudControl {
    async fn authenticate(&self, client_id: i64, plaintext_secret: &[u8]) -> Result<bool, CoreError> {
        let Some(record) = self.clients.get(&client_id) else {
            return Ok(false);
        };
        let decrypted = decrypt_secret(&self.encryption_key, &record.secret_key_encrypted).map_err(|_| CoreError::internal("stored client secret could not be decrypted"))?;
        Ok(decrypted == plaintext_secret)
    }

    async fn get_client(&self, client_id: i64) -> Result<Option<ClientSummary>, CoreError> {
        Ok(self.clients.get(&client_id).map(|record| ClientSummary {
            id: client_id,
            online: record.online,
            last_node_id: record.last_node_id.clone(),
        }))
    }

    async fn get_client_config(&self, client_id: i64) -> Result<Option<ClientConfig>, CoreError> {
        let Some(record) = self.clients.get(&client_id) else {
            return Ok(None);
        };
        let secret_key = decrypt_secret(&self.encryption_key, &record.secret_key_encrypted).map_err(|_| CoreError::internal("stored client secret could not be decrypted"))?;
        Ok(Some(ClientConfig {
            secret_key,
            legacy_plaintext_mode: record.legacy_plaintext_mode,
            expires_at: record.expires_at,
        }))
    }

    /// §3/§9: an 8-digit id drawn uniformly from `[10^7, 10^8)`, retried up
    /// to `CLIENT_ID_GENERATION_RETRIES` times on collision — the "known
    /// quadratic failure mode" the spec calls out explicitly, left as-is
    /// rather than switched to a larger id space this crate's reference
    /// scale doesn't need.
    async fn generate_anonymous_credentials(&self) -> Result<AnonymousBootstrap, CoreError> {
        let client_id = random_id_with_retry(CLIENT_ID_MIN, CLIENT_ID_MAX_EXCLUSIVE, CLIENT_ID_GENERATION_RETRIES, |candidate| {
            self.clients.contains_key(&candidate)
        })
        .ok_or_else(|| CoreError::resource_exhausted("client id space exhausted; could not allocate a fresh anonymous id"))?;

        let secret = tunnox_common::crypto::random_secret();
        let expires_at = Some(timestamp_secs() + ANONYMOUS_CREDENTIAL_TTL_SECS);

        self.clients.insert(
            client_id,
            ClientRecord {
                secret_key_encrypted: encrypt_secret(&self.encryption_key, &secret),
                legacy_plaintext_mode: false,
                expires_at,
                online: false,
                last_node_id: None,
            },
        );

        Ok(AnonymousBootstrap {
            client_id,
            secret_key_plaintext: secret.to_vec(),
            expires_at,
        })
    }

    async fn get_port_mapping(&self, mapping_id: &str) -> Result<Option<PortMapping>, CoreError> {
        Ok(self.mappings.get(mapping_id).map(|entry| entry.clone()))
    }

    async fn get_client_port_mappings(&self, client_id: i64) -> Result<Vec<PortMapping>, CoreError> {
        Ok(self
            .mappings
            .iter()
            .filter(|entry| entry.authorizes(client_id))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn delete_port_mapping(&self, client_id: i64, mapping_id: &str) -> Result<(), CoreError> {
        let authorized = self.mappings.get(mapping_id).map(|entry| entry.authorizes(client_id)).unwrap_or(false);
        if !authorized {
            return Err(CoreError::mapping_not_found(format!("no mapping {mapping_id} for client {client_id}")));
        }
        self.mappings.remove(mapping_id);
        Ok(())
    }

    async fn create_port_mapping(
        &self,
        listen_client_id: i64,
        target_client_id: i64,
        protocol: &str,
        target_host: &str,
        target_port: u16,
    ) -> Result<PortMapping, CoreError> {
        let mapping_id = random_id_with_retry(0, i64::MAX, CLIENT_ID_GENERATION_RETRIES, |candidate| self.mapping_id_taken(candidate))
            .map(|n| format!("map_{n}"))
            .ok_or_else(|| CoreError::resource_exhausted("mapping id space exhausted"))?;

        let mut secret_bytes = [0u8; SECRET_KEY_SIZE];
        tunnox_common::crypto::random_bytes(&mut secret_bytes);

        let mapping = PortMapping {
            id: mapping_id.clone(),
            secret_key: tunnox_common::encoding::encode(&secret_bytes),
            listen_client_id,
            target_client_id,
            protocol: protocol.to_string(),
            target_host: target_host.to_string(),
            target_port,
            status: MappingStatus::Active,
            expires_at: None,
        };

        self.mappings.insert(mapping_id, mapping.clone());
        Ok(mapping)
    }

    async fn connect_client(
        &self,
        client_id: i64,
        node_id: &str,
        conn_id: &str,
        remote_ip: &str,
        protocol: &str,
        version: &str,
    ) -> Result<(), CoreError> {
        info!(client_id, node_id, conn_id, remote_ip, protocol, version, "client authenticated and connected");
        if let Some(mut record) = self.clients.get_mut(&client_id) {
            record.online = true;
            record.last_node_id = Some(node_id.to_string());
        }
        Ok(())
    }

    async fn validate_tunnel_resume_token(&self, token: &str) -> Result<tunnox_types::TunnelState, CoreError> {
        let claims = decode_token(token, &self.resume_secret)?;
        self.state_store.load(&claims.tunnel_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use std::time::Duration;
    use tunnox_core::resume::ResumeManager;

    fn cloud_control() -> (InMemoryCloudControl, Arc<TunnelStateStore>) {
        let kv = Arc::new(InMemoryKv::new());
        let state_store = Arc::new(TunnelStateStore::new(kv, Some(b"state-secret".to_vec()), Duration::from_secs(300)));
        let cc = InMemoryCloudControl::new(state_store.clone(), b"resume-secret".to_vec());
        (cc, state_store)
    }

    #[tokio::test]
    async fn registered_client_authenticates_with_the_right_secret() {
        let (cc, _) = cloud_control();
        cc.register_client(10_000_001, b"s3cret", false, None);

        assert!(cc.authenticate(10_000_001, b"s3cret").await.unwrap());
        assert!(!cc.authenticate(10_000_001, b"wrong").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_client_does_not_authenticate() {
        let (cc, _) = cloud_control();
        assert!(!cc.authenticate(99, b"anything").await.unwrap());
    }

    #[tokio::test]
    async fn anonymous_bootstrap_mints_a_usable_client() {
        let (cc, _) = cloud_control();
        let bootstrap = cc.generate_anonymous_credentials().await.unwrap();

        assert!(bootstrap.client_id >= CLIENT_ID_MIN && bootstrap.client_id < CLIENT_ID_MAX_EXCLUSIVE);
        assert!(cc.authenticate(bootstrap.client_id, &bootstrap.secret_key_plaintext).await.unwrap());
    }

    #[tokio::test]
    async fn create_then_get_port_mapping_roundtrips() {
        let (cc, _) = cloud_control();
        let mapping = cc.create_port_mapping(10_000_001, 10_000_002, "tcp", "127.0.0.1", 22).await.unwrap();

        let fetched = cc.get_port_mapping(&mapping.id).await.unwrap().unwrap();
        assert_eq!(fetched.listen_client_id, 10_000_001);
        assert_eq!(fetched.target_client_id, 10_000_002);

        let listed = cc.get_client_port_mappings(10_000_001).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn delete_port_mapping_rejects_an_unauthorized_client() {
        let (cc, _) = cloud_control();
        let mapping = cc.create_port_mapping(10_000_001, 10_000_002, "tcp", "127.0.0.1", 22).await.unwrap();

        let err = cc.delete_port_mapping(10_000_003, &mapping.id).await.unwrap_err();
        assert_eq!(err.code, tunnox_types::ErrorCode::MappingNotFound);
        assert!(cc.get_port_mapping(&mapping.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn validate_tunnel_resume_token_loads_the_captured_state() {
        let (cc, state_store) = cloud_control();
        let resume = ResumeManager::new(state_store, Some(b"resume-secret".to_vec()), Default::default());

        let conn = {
            struct NoopSink;
            #[async_trait::async_trait]
            impl tunnox_core::connection::ConnectionSink for NoopSink {
                async fn send(&self, _packet: tunnox_types::TransferPacket) -> Result<(), CoreError> {
                    Ok(())
                }
                async fn close(&self) {}
                fn remote_addr(&self) -> String {
                    "127.0.0.1:0".into()
                }
            }
            Arc::new(tunnox_core::connection::TunnelConnection::new(
                "tun-1".into(),
                "conn-a".into(),
                Some("map-1".into()),
                10_000_001,
                10_000_002,
                true,
                Arc::new(NoopSink),
            ))
        };

        let token = resume.suspend(&conn).await.unwrap();
        let state = cc.validate_tunnel_resume_token(&token).await.unwrap();
        assert_eq!(state.tunnel_id, "tun-1");
    }

    #[tokio::test]
    async fn tampered_resume_token_is_rejected() {
        let (cc, _) = cloud_control();
        assert!(cc.validate_tunnel_resume_token("not-a-real-token").await.is_err());
    }
}

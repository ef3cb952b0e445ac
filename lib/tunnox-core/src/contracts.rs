//! External interfaces the core consumes but does not implement (spec §6,
//! §1 "Out of scope"): storage, the cross-node broker, the cloud-control
//! plane, and the pre-auth policy hooks added in `SPEC_FULL.md` §C. Concrete
//! implementations live outside this crate — `tunnox-cloud-control` ships an
//! in-memory reference, and a production deployment is expected to bring its
//! own.

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tunnox_types::{CoreError, PortMapping, TunnelState};

/// A namespaced, TTL-aware key/value store. The tunnel-state store (C3) and
/// the connection-code handlers build their own key prefixes on top of this;
/// `Kv` itself knows nothing about Tunnox's data model.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;
    async fn exists(&self, key: &str) -> Result<bool, CoreError>;
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub source_node_id: String,
    pub published_at_unix: i64,
}

/// The cross-node pub/sub rendez-vous point used by the bridge adapter (C8).
/// §1 Non-goals: no arbitrary fan-out and no exactly-once delivery — a
/// `Broker` is allowed to drop a publish if a subscriber's channel is full
/// (§4.8, bounded at 100 messages).
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), CoreError>;
    async fn subscribe(&self, topic: &str) -> Result<tokio::sync::mpsc::Receiver<InboundMessage>, CoreError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), CoreError>;
    async fn ping(&self) -> Result<(), CoreError>;
}

#[derive(Debug, Clone)]
pub struct ClientSummary {
    pub id: i64,
    pub online: bool,
    pub last_node_id: Option<String>,
}

/// Plaintext (already decrypted) per-client auth material, as the challenge
/// authenticator (C5) needs it. `tunnox-cloud-control` owns the at-rest
/// encryption of `secret_key`; the core never touches ciphertext.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub secret_key: Vec<u8>,
    pub legacy_plaintext_mode: bool,
    pub expires_at: Option<i64>,
}

/// A freshly minted anonymous identity (§4.5 phase "anonymous bootstrap").
/// `secret_key_plaintext` is only ever handed to the client once, in the
/// bootstrap response body.
#[derive(Debug, Clone)]
pub struct AnonymousBootstrap {
    pub client_id: i64,
    pub secret_key_plaintext: Vec<u8>,
    pub expires_at: Option<i64>,
}

/// §6 external interface: the cloud-control plane. Two additions beyond the
/// method list the spec names:
/// - `delete_port_mapping`, needed because `MAPPING_DELETE` (§4.6) is a
///   required command route with nowhere else to land;
/// - `create_port_mapping`, needed because `CONNECTION_CODE_ACTIVATE` (§4.6)
///   materializes a brand new mapping pairing the code's owner with the
///   activating client, and nothing short of the cloud-control plane can
///   durably own that mapping afterwards.
/// See `DESIGN.md` for both notes.
#[async_trait]
pub trait CloudControl: Send + Sync {
    async fn authenticate(&self, client_id: i64, plaintext_secret: &[u8]) -> Result<bool, CoreError>;
    async fn get_client(&self, client_id: i64) -> Result<Option<ClientSummary>, CoreError>;
    async fn get_client_config(&self, client_id: i64) -> Result<Option<ClientConfig>, CoreError>;
    async fn generate_anonymous_credentials(&self) -> Result<AnonymousBootstrap, CoreError>;
    async fn get_port_mapping(&self, mapping_id: &str) -> Result<Option<PortMapping>, CoreError>;
    async fn get_client_port_mappings(&self, client_id: i64) -> Result<Vec<PortMapping>, CoreError>;
    async fn delete_port_mapping(&self, client_id: i64, mapping_id: &str) -> Result<(), CoreError>;
    async fn create_port_mapping(
        &self,
        listen_client_id: i64,
        target_client_id: i64,
        protocol: &str,
        target_host: &str,
        target_port: u16,
    ) -> Result<PortMapping, CoreError>;
    async fn connect_client(
        &self,
        client_id: i64,
        node_id: &str,
        conn_id: &str,
        remote_ip: &str,
        protocol: &str,
        version: &str,
    ) -> Result<(), CoreError>;
    async fn validate_tunnel_resume_token(&self, token: &str) -> Result<TunnelState, CoreError>;
}

/// Pre-flight IP reputation check (`SPEC_FULL.md` §C). A no-op implementation
/// that always allows is a valid `IpPolicy`.
#[async_trait]
pub trait IpPolicy: Send + Sync {
    async fn is_allowed(&self, ip: IpAddr) -> bool;
}

/// Tracks repeated handshake failures per source IP (spec §8 scenario 3:
/// "the sixth handshake attempt from the same IP ... is rejected with
/// Unauthorized('Access denied: too many failed attempts') irrespective of
/// whether the credentials supplied would otherwise have been valid").
#[async_trait]
pub trait BruteForceGuard: Send + Sync {
    async fn is_blocked(&self, ip: IpAddr) -> bool;
    async fn record_failure(&self, ip: IpAddr);
    async fn record_success(&self, ip: IpAddr);
}

/// Rate-limits anonymous-bootstrap issuance per source IP, independent of
/// the brute-force guard (which tracks failed credential checks, not
/// bootstrap volume).
#[async_trait]
pub trait AnonymousRateLimiter: Send + Sync {
    async fn allow(&self, ip: IpAddr) -> bool;
}

/// Resolves a node ID (as published in a `tunnox.tunnel_ready` message, see
/// `bridge.rs`) to a dialable `TunnelBridge` gRPC address. Needed to complete
/// the cross-node path (§4.7/§4.8) but not named as its own component in the
/// spec's external-interface list; a thin addition alongside `CloudControl`
/// rather than a method on it, since node addressing is cluster topology,
/// not client/mapping data.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn grpc_address(&self, node_id: &str) -> Result<String, CoreError>;
}

//! Entities of spec §3 that are pure data — persisted, passed across crate
//! boundaries, or read from the KV — as opposed to the runtime connection
//! objects (`ControlConnection`/`TunnelConnection`) that own live streams
//! and live in `tunnox-core`.

use serde::{Deserialize, Serialize};

/// §3: `id` is chosen uniformly at random in `[10^7, 10^8)`.
pub const CLIENT_ID_MIN: i64 = 10_000_000;
pub const CLIENT_ID_MAX_EXCLUSIVE: i64 = 100_000_000;
pub const CLIENT_ID_GENERATION_RETRIES: u32 = 100;

/// Anonymous credentials expire 30 days after issue unless bound to a user.
pub const ANONYMOUS_CREDENTIAL_TTL_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub id: i64,
    /// The secret, at rest, encrypted under a server-held key. The core
    /// never sees the plaintext after the bootstrap response that reveals
    /// it exactly once (§4.5).
    pub secret_key_encrypted: Vec<u8>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

impl ClientCredentials {
    pub fn is_expired(&self, now_unix: i64) -> bool {
        matches!(self.expires_at, Some(exp) if now_unix >= exp)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    Active,
    Disabled,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub id: String,
    pub secret_key: String,
    pub listen_client_id: i64,
    pub target_client_id: i64,
    pub protocol: String,
    pub target_host: String,
    pub target_port: u16,
    pub status: MappingStatus,
    pub expires_at: Option<i64>,
}

impl PortMapping {
    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.status != MappingStatus::Active || matches!(self.expires_at, Some(exp) if now_unix >= exp)
    }

    /// §3 invariant: a `TUNNEL_OPEN` is authorized iff the requesting client
    /// is `listenClientID` or `targetClientID`.
    pub fn authorizes(&self, client_id: i64) -> bool {
        client_id == self.listen_client_id || client_id == self.target_client_id
    }

    pub fn peer_of(&self, client_id: i64) -> Option<i64> {
        if client_id == self.listen_client_id {
            Some(self.target_client_id)
        } else if client_id == self.target_client_id {
            Some(self.listen_client_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedPacket {
    pub seq_num: u64,
    pub data: Vec<u8>,
    pub sent_at_unix: i64,
    pub retry_count: u32,
}

/// Persisted snapshot of §3 `TunnelState`. `signature` is computed by
/// `tunnox-core::state` over every other field, `|`-delimited, and excluded
/// from its own input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelState {
    pub tunnel_id: String,
    pub mapping_id: Option<String>,
    pub listen_client_id: i64,
    pub target_client_id: i64,
    pub last_seq_num: u64,
    pub last_ack_num: u64,
    pub next_expected_seq: u64,
    pub buffered_packets: Vec<BufferedPacket>,
    pub created_at: i64,
    pub updated_at: i64,
    pub signature: String,
}

impl TunnelState {
    /// Canonical `|`-delimited field list the HMAC is computed over,
    /// excluding `signature` itself (§3).
    pub fn canonical_fields(&self) -> String {
        let buffered: String = self
            .buffered_packets
            .iter()
            .map(|p| format!("{}:{}:{}", p.seq_num, p.data.len(), p.sent_at_unix))
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.tunnel_id,
            self.mapping_id.as_deref().unwrap_or(""),
            self.listen_client_id,
            self.target_client_id,
            self.last_seq_num,
            self.last_ack_num,
            self.next_expected_seq,
            buffered,
            self.created_at,
            self.updated_at,
        )
    }
}

pub const TUNNEL_STATE_TTL_SECS: i64 = 5 * 60;
pub const RESUME_TOKEN_DEFAULT_TTL_SECS: i64 = 30;

/// §3 `ResumeToken` is an opaque signed string; this is the claim set it
/// decodes to once validated, not the wire representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeTokenClaims {
    pub tunnel_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

pub const CONNECTION_CODE_TTL_SECS: i64 = 10 * 60;

/// §4.6 `CONNECTION_CODE_*`: a short-lived, single-activation code a
/// listening client hands out of band to whoever should be allowed to
/// connect to the service it is about to expose. Activation turns this into
/// a `PortMapping` pairing `owner_client_id` (the listener) with the
/// activating client (the target).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionCode {
    pub code: String,
    pub owner_client_id: i64,
    pub protocol: String,
    pub target_host: String,
    pub target_port: u16,
    pub created_at: i64,
    pub expires_at: i64,
    pub activated: bool,
}

impl ConnectionCode {
    pub fn is_expired(&self, now_unix: i64) -> bool {
        now_unix >= self.expires_at
    }
}

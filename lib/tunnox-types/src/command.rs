//! Command codes and their typed JSON bodies (spec §4.6, Design Notes:
//! "Specify each command's body shape as a tagged variant; implement with a
//! typed schema per command code").

use serde::{Deserialize, Serialize};

/// `commandType` values. Handshake runs before a connection is authenticated
/// and is dispatched directly by the authenticator (C5), not through the
/// general command dispatcher (C6) — it is listed here because its body
/// still travels inside a `CommandPacket`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum CommandType {
    Handshake = 0,
    ConnectionCodeGenerate = 10,
    ConnectionCodeList = 11,
    ConnectionCodeActivate = 12,
    MappingList = 20,
    MappingGet = 21,
    MappingDelete = 22,
    ConfigGet = 30,
    TunnelOpenRequest = 40,
    TunnelOpenReady = 41,
    Socks5DynamicTunnelRequest = 42,
}

impl CommandType {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => CommandType::Handshake,
            10 => CommandType::ConnectionCodeGenerate,
            11 => CommandType::ConnectionCodeList,
            12 => CommandType::ConnectionCodeActivate,
            20 => CommandType::MappingList,
            21 => CommandType::MappingGet,
            22 => CommandType::MappingDelete,
            30 => CommandType::ConfigGet,
            40 => CommandType::TunnelOpenRequest,
            41 => CommandType::TunnelOpenReady,
            42 => CommandType::Socks5DynamicTunnelRequest,
            _ => return None,
        })
    }
}

/// §4.5 handshake request body. A single struct covers all three phases
/// (anonymous bootstrap, phase one, phase two) per the canonical decision
/// table in `SPEC_FULL.md` §D.1 — the phase is inferred from which optional
/// fields are present, exactly as the Go original's overlapping decision
/// tree did, but decided by one function instead of scattered checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub client_id: i64,
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_response: Option<String>,
    pub protocol: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HandshakeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub need_response: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    pub fn bootstrapped(client_id: i64, secret_key: String) -> Self {
        HandshakeResponse {
            success: true,
            client_id: Some(client_id),
            secret_key: Some(secret_key),
            ..Default::default()
        }
    }

    pub fn need_response(challenge: String) -> Self {
        HandshakeResponse {
            success: false,
            need_response: Some(true),
            challenge: Some(challenge),
            ..Default::default()
        }
    }

    pub fn authenticated() -> Self {
        HandshakeResponse {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        HandshakeResponse {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// §4.7 `TUNNEL_OPEN` request body, covering all three authorization paths
/// plus the SOCKS5 dynamic-target variant in one struct (the paths differ
/// only in which optional fields are populated).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOpenRequest {
    pub tunnel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(default)]
    pub sequence_numbers_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOpenReady {
    pub tunnel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenericResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenericResponse {
    pub fn ok() -> Self {
        GenericResponse {
            success: true,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        GenericResponse {
            success: false,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingRole {
    Listener,
    Target,
}

/// §4.6 `CONFIG_GET` response body, made precise per `SPEC_FULL.md` §C.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSummary {
    pub id: String,
    pub role: MappingRole,
    pub protocol: String,
    pub target_host: String,
    pub target_port: u16,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigGetResponse {
    pub mappings: Vec<MappingSummary>,
}

/// `CONNECTION_CODE_GENERATE` request body: the listening client describes
/// the local service it is about to expose. `CONNECTION_CODE_ACTIVATE`
/// later pairs this with an activating client to create the `PortMapping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionCodeGenerateRequest {
    pub protocol: String,
    pub target_host: String,
    pub target_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionCodeGenerateResponse {
    pub code: String,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionCodeActivateRequest {
    pub code: String,
}

/// `CONNECTION_CODE_ACTIVATE` response: the freshly created mapping's id and
/// secret, so the activating client can open tunnels against it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionCodeActivateResponse {
    pub mapping_id: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionCodeSummary {
    pub code: String,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConnectionCodeListResponse {
    pub codes: Vec<ConnectionCodeSummary>,
}

/// Shared request shape for `MAPPING_GET` and `MAPPING_DELETE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingIdRequest {
    pub mapping_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MappingListResponse {
    pub mappings: Vec<MappingSummary>,
}

/// `TUNNEL_OPEN_REQUEST` response: acknowledges authorization and hands back
/// the resume token while the framed channel is still being read, before the
/// connection switches to streaming mode on a follow-up `TUNNEL_OPEN_READY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOpenResponse {
    pub tunnel_id: String,
    pub resume_token: String,
}

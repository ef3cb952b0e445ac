use thiserror::Error;

/// Error taxonomy from the error-handling design (spec §7). Carried as a
/// code, not a type hierarchy, so it round-trips cleanly into a response
/// packet's `error` string and into log fields.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    InvalidParam,
    InvalidPacket,
    Unauthorized,
    CredentialsExpired,
    ClientNotFound,
    MappingNotFound,
    MappingUnauthorized,
    ClientOffline,
    NetworkError,
    Timeout,
    QuotaExceeded,
    ResourceExhausted,
    StateTampered,
    StateExpired,
    Internal,
    NotConfigured,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidParam => "InvalidParam",
            ErrorCode::InvalidPacket => "InvalidPacket",
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::CredentialsExpired => "CredentialsExpired",
            ErrorCode::ClientNotFound => "ClientNotFound",
            ErrorCode::MappingNotFound => "MappingNotFound",
            ErrorCode::MappingUnauthorized => "MappingUnauthorized",
            ErrorCode::ClientOffline => "ClientOffline",
            ErrorCode::NetworkError => "NetworkError",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::QuotaExceeded => "QuotaExceeded",
            ErrorCode::ResourceExhausted => "ResourceExhausted",
            ErrorCode::StateTampered => "StateTampered",
            ErrorCode::StateExpired => "StateExpired",
            ErrorCode::Internal => "Internal",
            ErrorCode::NotConfigured => "NotConfigured",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged, loggable error. Every crate in the workspace converts its own
/// error enum into this at its public boundary.
#[derive(Debug, Error, Clone)]
#[error("{code}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        CoreError {
            code,
            message: message.into(),
        }
    }
}

macro_rules! ctor {
    ($name:ident, $code:ident) => {
        pub fn $name(message: impl Into<String>) -> CoreError {
            CoreError::new(ErrorCode::$code, message)
        }
    };
}

impl CoreError {
    ctor!(invalid_param, InvalidParam);
    ctor!(invalid_packet, InvalidPacket);
    ctor!(unauthorized, Unauthorized);
    ctor!(credentials_expired, CredentialsExpired);
    ctor!(client_not_found, ClientNotFound);
    ctor!(mapping_not_found, MappingNotFound);
    ctor!(mapping_unauthorized, MappingUnauthorized);
    ctor!(client_offline, ClientOffline);
    ctor!(network_error, NetworkError);
    ctor!(timeout, Timeout);
    ctor!(quota_exceeded, QuotaExceeded);
    ctor!(resource_exhausted, ResourceExhausted);
    ctor!(state_tampered, StateTampered);
    ctor!(state_expired, StateExpired);
    ctor!(internal, Internal);
    ctor!(not_configured, NotConfigured);
}

/// Errors specific to the framed packet codec (C1).
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown packet code {0}")]
    UnknownCode(u8),
    #[error("packet payload exceeds maximum frame size ({0} bytes)")]
    PayloadTooLarge(u32),
    #[error("command packet body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("sequence numbers required but missing on this packet")]
    MissingSequenceNumbers,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<WireError> for CoreError {
    fn from(err: WireError) -> Self {
        CoreError::invalid_packet(err.to_string())
    }
}

//! `TransferPacket` — the wire-level unit of §3/§4.1. One byte of type
//! (low 6 bits = code, high 2 bits = flags), then whatever the codec (C1,
//! `tunnox-core::codec`) frames around it.

use serde::{Deserialize, Serialize};

use crate::error::WireError;

pub const FLAG_COMPRESSED: u8 = 0b0100_0000;
pub const FLAG_SEQUENCED: u8 = 0b1000_0000;
const CODE_MASK: u8 = 0b0011_1111;

/// The low-6-bit packet code. `Data` carries an opaque tunnel byte payload;
/// `Command` carries a JSON [`CommandPacket`]; the rest are control frames
/// exchanged on a tunnel connection (mirrors the teacher's `net::frame::Category`,
/// generalized from a fixed 4-variant enum to the command/data split this
/// protocol needs).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum PacketCode {
    Data = 0,
    Command = 1,
    Keepalive = 2,
    TunnelOpened = 3,
    TunnelClosed = 4,
}

impl PacketCode {
    #[inline]
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        Ok(match value & CODE_MASK {
            0 => PacketCode::Data,
            1 => PacketCode::Command,
            2 => PacketCode::Keepalive,
            3 => PacketCode::TunnelOpened,
            4 => PacketCode::TunnelClosed,
            other => return Err(WireError::UnknownCode(other)),
        })
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// `commandPacket` of §3. Body is carried as a JSON string rather than a
/// nested `serde_json::Value` so that unknown command types still round-trip
/// without a schema (deserialized lazily per command type, see
/// `tunnox-types::command`).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommandPacket {
    pub command_type: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command_id: String,
    pub body: String,
}

impl CommandPacket {
    /// A request: dispatched by `command_type`, answered by mirroring
    /// `request_id` into the response's `command_id` (spec §4.6).
    pub fn request(command_type: u16, request_id: impl Into<String>, body: impl Into<String>) -> Self {
        CommandPacket {
            command_type,
            request_id: request_id.into(),
            command_id: String::new(),
            body: body.into(),
        }
    }

    /// A response to a prior request, or an unsolicited server→client push.
    pub fn response(command_type: u16, command_id: impl Into<String>, body: impl Into<String>) -> Self {
        CommandPacket {
            command_type,
            request_id: String::new(),
            command_id: command_id.into(),
            body: body.into(),
        }
    }

    pub fn is_request(&self) -> bool {
        !self.request_id.is_empty() && self.command_id.is_empty()
    }

    pub fn is_response(&self) -> bool {
        !self.command_id.is_empty()
    }
}

/// Invariant (§3): either `payload` or `commandPacket` is set, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data(Vec<u8>),
    Command(CommandPacket),
}

impl Payload {
    pub fn code(&self) -> PacketCode {
        match self {
            Payload::Data(_) => PacketCode::Data,
            Payload::Command(_) => PacketCode::Command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPacket {
    pub code: PacketCode,
    pub compressed: bool,
    /// Present only when the tunnel negotiated sequence numbers (§3).
    pub seq_num: Option<u64>,
    pub ack_num: Option<u64>,
    pub payload: Payload,
}

impl TransferPacket {
    pub fn data(data: Vec<u8>) -> Self {
        TransferPacket {
            code: PacketCode::Data,
            compressed: false,
            seq_num: None,
            ack_num: None,
            payload: Payload::Data(data),
        }
    }

    pub fn sequenced_data(data: Vec<u8>, seq_num: u64, ack_num: u64) -> Self {
        TransferPacket {
            code: PacketCode::Data,
            compressed: false,
            seq_num: Some(seq_num),
            ack_num: Some(ack_num),
            payload: Payload::Data(data),
        }
    }

    pub fn command(cmd: CommandPacket) -> Self {
        TransferPacket {
            code: PacketCode::Command,
            compressed: false,
            seq_num: None,
            ack_num: None,
            payload: Payload::Command(cmd),
        }
    }

    pub fn control(code: PacketCode) -> Self {
        debug_assert!(!matches!(code, PacketCode::Data | PacketCode::Command));
        TransferPacket {
            code,
            compressed: false,
            seq_num: None,
            ack_num: None,
            payload: Payload::Data(Vec::new()),
        }
    }

    #[inline]
    pub fn type_byte(&self) -> u8 {
        let mut byte = self.code.as_u8();
        if self.compressed {
            byte |= FLAG_COMPRESSED;
        }
        if self.seq_num.is_some() {
            byte |= FLAG_SEQUENCED;
        }
        byte
    }

    pub fn as_command(&self) -> Option<&CommandPacket> {
        match &self.payload {
            Payload::Command(cmd) => Some(cmd),
            Payload::Data(_) => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Data(data) => Some(data),
            Payload::Command(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_byte_encodes_code_and_flags() {
        let pkt = TransferPacket::sequenced_data(vec![1, 2, 3], 5, 2);
        let byte = pkt.type_byte();
        assert_eq!(byte & CODE_MASK, PacketCode::Data as u8);
        assert_eq!(byte & FLAG_SEQUENCED, FLAG_SEQUENCED);
        assert_eq!(byte & FLAG_COMPRESSED, 0);
    }

    #[test]
    fn command_request_response_roundtrip_markers() {
        let req = CommandPacket::request(7, "req-1", "{}");
        assert!(req.is_request());
        assert!(!req.is_response());

        let resp = CommandPacket::response(7, "req-1", "{}");
        assert!(resp.is_response());
        assert!(!resp.is_request());
    }

    #[test]
    fn unknown_code_rejected() {
        assert!(PacketCode::from_u8(63).is_err());
    }
}

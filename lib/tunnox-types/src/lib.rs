//! Shared wire format and data-model types for the Tunnox session layer.
//!
//! This crate has no I/O and no concurrency of its own — it exists so that
//! `tunnox-core`, `tunnox-cloud-control`, and `services/tunnox-node` agree on
//! one definition of a packet, a command body, and a persisted entity.

pub mod command;
pub mod error;
pub mod model;
pub mod packet;

pub use command::*;
pub use error::{CoreError, ErrorCode, WireError};
pub use model::*;
pub use packet::{CommandPacket, PacketCode, Payload, TransferPacket, FLAG_COMPRESSED, FLAG_SEQUENCED};

//! Send/receive buffers for sequenced tunnel data (C2, spec §3 "BufferedPacket").

mod receive;
mod send;

pub use receive::ReceiveBuffer;
pub use send::SendBuffer;

//! Ambient infrastructure shared by every crate in the Tunnox workspace:
//! clocks, HMAC signing, id generation, base64 encoding, and logging setup.
//! None of this is session-layer logic — see `tunnox-core` for that.

pub mod crypto;
pub mod encoding;
pub mod ids;
pub mod logging;
pub mod time;

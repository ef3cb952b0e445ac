//! Base64 helpers, split out the way the teacher's `flux::session` module
//! leaned on a dedicated `encoding::base64` path for serde (de)serializers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}

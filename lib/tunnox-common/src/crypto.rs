//! HMAC signing/verification and random-byte generation shared by the
//! authenticator (C5) and the tunnel-state store (C3). Where the teacher's
//! `flux::crypto` reached for `libsodium-sys` and a ChaCha20-Poly1305 AEAD
//! over FFI, this workspace uses the RustCrypto crates the rest of its
//! ecosystem (`hmac`, `sha2`, `chacha20poly1305`) already speaks — the spec
//! is explicit that the challenge-response MAC is HMAC-SHA256 (§4.5, §8),
//! so that's what gets used rather than an AEAD tag.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const HMAC_TAG_SIZE: usize = 32;
pub const SECRET_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// `HMAC-SHA256(secret, message)`, used both for the challenge-response
/// handshake (§4.5) and for `TunnelState` signatures (§3, §4.3).
pub fn hmac_sha256(secret: &[u8], message: &[u8]) -> [u8; HMAC_TAG_SIZE] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(message);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; HMAC_TAG_SIZE];
    out.copy_from_slice(&tag);
    out
}

/// Constant-time comparison of two HMAC tags (spec §4.5, §8: "uses
/// constant-time comparison; timing variance < measurable noise").
pub fn verify_hmac_sha256(secret: &[u8], message: &[u8], tag: &[u8]) -> bool {
    let expected = hmac_sha256(secret, message);
    expected.ct_eq(tag).into()
}

/// Fills `out` with cryptographically secure random bytes, used for
/// handshake challenges and fresh secrets.
pub fn random_bytes(out: &mut [u8]) {
    rand::thread_rng().fill_bytes(out);
}

pub fn random_secret() -> [u8; SECRET_KEY_SIZE] {
    let mut secret = [0u8; SECRET_KEY_SIZE];
    random_bytes(&mut secret);
    secret
}

/// Encrypts a client secret for storage at rest (`ClientCredentials.secret_key_encrypted`,
/// §3). The nonce is prepended to the ciphertext so `decrypt_secret` is self
/// contained given only the encryption key.
pub fn encrypt_secret(encryption_key: &[u8; SECRET_KEY_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(encryption_key.into());
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    random_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("chacha20poly1305 encryption over an in-memory buffer cannot fail");
    let mut out = nonce_bytes.to_vec();
    out.append(&mut ciphertext);
    out
}

#[derive(Debug, thiserror::Error)]
#[error("failed to decrypt stored secret")]
pub struct DecryptError;

pub fn decrypt_secret(encryption_key: &[u8; SECRET_KEY_SIZE], stored: &[u8]) -> Result<Vec<u8>, DecryptError> {
    if stored.len() < NONCE_SIZE {
        return Err(DecryptError);
    }
    let (nonce_bytes, ciphertext) = stored.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(encryption_key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| DecryptError)
}

/// Generates a fresh at-rest encryption key (e.g. for a node's local secret
/// store, or in tests).
pub fn random_encryption_key() -> [u8; SECRET_KEY_SIZE] {
    random_secret()
}

//! `FMPK` envelope: AES-256-GCM with a key fingerprint in the header.
//!
//! ```text
//! "FMPK" | version (1) | key-id (8) | nonce (12) | ciphertext || tag (16)
//! ```
//!
//! The key-id is the first 8 bytes of SHA-256 over the raw key. It lets a wrong
//! key be told apart from a tampered ciphertext without trial decryption. The
//! 13 header bytes are bound as associated data, so editing them also fails
//! authentication.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::DecryptionFailure;
use crate::package::KeyMaterial;

pub const MAGIC: &[u8; 4] = b"FMPK";
pub const VERSION: u8 = 1;
pub const KEY_LEN: usize = 32;
const KEY_ID_LEN: usize = 8;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 4 + 1 + KEY_ID_LEN;

/// Raw 256-bit key, wiped on drop.
pub struct SymmetricKey(Zeroizing<[u8; KEY_LEN]>);

impl SymmetricKey {
    pub fn from_material(material: &KeyMaterial) -> Result<Self, DecryptionFailure> {
        let text = material.expose().trim();
        let raw = Zeroizing::new(
            STANDARD.decode(text).or_else(|_| URL_SAFE.decode(text)).map_err(|_| DecryptionFailure::BadKey("key material is not base64"))?,
        );
        let bytes: [u8; KEY_LEN] = raw.as_slice().try_into().map_err(|_| DecryptionFailure::BadKey("key must decode to 32 bytes"))?;
        Ok(Self(Zeroizing::new(bytes)))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self { Self(Zeroizing::new(bytes)) }

    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(key.as_slice());
        Self(Zeroizing::new(bytes))
    }

    pub fn to_material(&self) -> KeyMaterial { KeyMaterial::new(STANDARD.encode(self.0.as_slice())) }

    pub fn key_id(&self) -> [u8; KEY_ID_LEN] {
        let digest = Sha256::digest(self.0.as_slice());
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&digest[..KEY_ID_LEN]);
        id
    }

    /// Hex key-id, safe to log.
    pub fn fingerprint(&self) -> String { hex::encode(self.key_id()) }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(self.0.as_slice().into())
    }
}

fn header(key_id: &[u8; KEY_ID_LEN]) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[..4].copy_from_slice(MAGIC);
    h[4] = VERSION;
    h[5..].copy_from_slice(key_id);
    h
}

/// Encrypts `plaintext` under a fresh random nonce.
pub fn seal(plaintext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, DecryptionFailure> {
    let head = header(&key.key_id());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ct = key.cipher()
        .encrypt(&nonce, Payload { msg: plaintext, aad: &head })
        .map_err(|_| DecryptionFailure::BadKey("encryption failed"))?;
    let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ct.len());
    out.extend_from_slice(&head);
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Authenticates and decrypts an envelope. Plaintext is only returned when the tag verifies.
pub fn open(envelope: &[u8], key: &SymmetricKey) -> Result<Zeroizing<Vec<u8>>, DecryptionFailure> {
    if envelope.len() < HEADER_LEN + NONCE_LEN + TAG_LEN {
        return Err(DecryptionFailure::Tampered("envelope truncated"));
    }
    let (head, rest) = envelope.split_at(HEADER_LEN);
    if &head[..4] != MAGIC {
        return Err(DecryptionFailure::Tampered("unknown envelope magic"));
    }
    if head[4] != VERSION {
        return Err(DecryptionFailure::Tampered("unsupported envelope version"));
    }
    if head[5..] != key.key_id() {
        return Err(DecryptionFailure::BadKey("key does not match envelope key-id"));
    }
    let (nonce, ct) = rest.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ct, aad: head })
        .map(Zeroizing::new)
        .map_err(|_| DecryptionFailure::Tampered("authentication tag mismatch"))
}

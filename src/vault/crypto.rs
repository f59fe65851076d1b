//! AES-256-GCM encryption for tokens at rest
//!
//! Ciphertexts are stored as one opaque string:
//! `base64(nonce):base64(tag):base64(ciphertext)`, with a fresh random
//! 96-bit nonce per call and a 128-bit authentication tag.

use crate::{Result, SyncError};
use aes_gcm::{
    aead::{AeadInPlace, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt;

/// Length of the encryption key in bytes
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SEPARATOR: char = ':';

/// Generate a new random 256-bit encryption key
pub fn generate_key() -> [u8; KEY_LEN] {
    use rand::RngCore;
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Base64 encoding of a key, the form kept in the environment
pub fn encode_key(key: &[u8; KEY_LEN]) -> String {
    STANDARD.encode(key)
}

/// Decode a base64 key; anything but exactly 32 bytes is a configuration error
pub fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| SyncError::Config("Encryption key is not valid base64".to_string()))?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
        SyncError::Config(format!(
            "Encryption key must be {} bytes, got {}",
            KEY_LEN,
            bytes.len()
        ))
    })
}

/// Authenticated symmetric cipher for stored tokens
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, b"", &mut buffer)
            .map_err(|_| SyncError::Decryption("encryption failed".to_string()))?;

        Ok(format!(
            "{}{sep}{}{sep}{}",
            STANDARD.encode(nonce),
            STANDARD.encode(tag),
            STANDARD.encode(&buffer),
            sep = SEPARATOR
        ))
    }

    /// Fails with [`SyncError::Decryption`] on malformed input, a wrong key,
    /// or any tampering with nonce, tag or ciphertext.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let mut parts = encoded.split(SEPARATOR);
        let (Some(nonce), Some(tag), Some(ciphertext), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SyncError::Decryption(
                "expected nonce:tag:ciphertext".to_string(),
            ));
        };

        let nonce = decode_part(nonce, "nonce")?;
        let tag = decode_part(tag, "tag")?;
        let mut buffer = decode_part(ciphertext, "ciphertext")?;

        if nonce.len() != NONCE_LEN {
            return Err(SyncError::Decryption(format!(
                "nonce must be {} bytes",
                NONCE_LEN
            )));
        }
        if tag.len() != TAG_LEN {
            return Err(SyncError::Decryption(format!("tag must be {} bytes", TAG_LEN)));
        }

        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                b"",
                &mut buffer,
                Tag::from_slice(&tag),
            )
            .map_err(|_| SyncError::Decryption("authentication failed".to_string()))?;

        String::from_utf8(buffer)
            .map_err(|_| SyncError::Decryption("plaintext is not UTF-8".to_string()))
    }
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

fn decode_part(part: &str, name: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(part)
        .map_err(|_| SyncError::Decryption(format!("{} is not valid base64", name)))
}

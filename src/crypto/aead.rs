use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose;
use base64::Engine;
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};

/// Nonce length in bytes (96 bits, fresh random per seal).
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// Smallest possible sealed blob: nonce + tag around an empty plaintext.
pub const MIN_BLOB_LEN: usize = NONCE_LEN + TAG_LEN;

/// AES-256-GCM sealed-blob primitives. Layout is `nonce ‖ ciphertext ‖ tag`.
pub struct Sealed;

impl Sealed {
    /// Seal plaintext under a 256-bit key.
    pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::AuthFail)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Open a sealed blob. The tag is verified before any plaintext is returned.
    pub fn open(key: &[u8; 32], blob: &[u8]) -> CryptoResult<Vec<u8>> {
        if blob.len() < MIN_BLOB_LEN {
            return Err(CryptoError::MalformedBlob);
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::AuthFail)
    }

    /// Seal a string and return the blob base64-encoded for TEXT columns.
    pub fn seal_string(key: &[u8; 32], plaintext: &str) -> CryptoResult<String> {
        let blob = Self::seal(key, plaintext.as_bytes())?;
        Ok(general_purpose::STANDARD.encode(blob))
    }

    /// Open a base64-encoded blob back into a string.
    pub fn open_string(key: &[u8; 32], encoded: &str) -> CryptoResult<String> {
        let blob = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| CryptoError::MalformedBlob)?;
        let plaintext = Self::open(key, &blob)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::MalformedBlob)
    }

    /// Generate a random 256-bit key.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Generate a random 32-byte salt.
    pub fn generate_salt() -> [u8; 32] {
        Self::generate_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = Sealed::generate_key();
        let data = b"correct horse battery staple";

        let blob = Sealed::seal(&key, data).unwrap();
        assert!(blob.len() >= MIN_BLOB_LEN);
        let opened = Sealed::open(&key, &blob).unwrap();
        assert_eq!(data.as_slice(), opened.as_slice());
    }

    #[test]
    fn nonce_is_fresh_per_seal() {
        let key = Sealed::generate_key();
        let a = Sealed::seal(&key, b"x").unwrap();
        let b = Sealed::seal(&key, b"x").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tamper_fails_auth() {
        let key = Sealed::generate_key();
        let mut blob = Sealed::seal(&key, b"payload").unwrap();
        blob[NONCE_LEN + 2] ^= 1;
        assert!(matches!(
            Sealed::open(&key, &blob),
            Err(CryptoError::AuthFail)
        ));
    }

    #[test]
    fn wrong_key_fails_auth() {
        let blob = Sealed::seal(&Sealed::generate_key(), b"payload").unwrap();
        assert!(matches!(
            Sealed::open(&Sealed::generate_key(), &blob),
            Err(CryptoError::AuthFail)
        ));
    }

    #[test]
    fn short_blob_is_malformed() {
        let key = Sealed::generate_key();
        assert!(matches!(
            Sealed::open(&key, &[0u8; MIN_BLOB_LEN - 1]),
            Err(CryptoError::MalformedBlob)
        ));
    }

    #[test]
    fn string_roundtrip() {
        let key = Sealed::generate_key();
        let encoded = Sealed::seal_string(&key, "s3cret").unwrap();
        assert_ne!(encoded, "s3cret");
        assert_eq!(Sealed::open_string(&key, &encoded).unwrap(), "s3cret");
    }
}

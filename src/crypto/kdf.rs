use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};

/// Subkey-derivation parameters, persisted next to every master-password
/// entry so old rows stay decryptable if defaults ever move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: "pbkdf2-hmac-sha256".to_string(),
            iterations: 100_000,
        }
    }
}

/// Hash a passphrase into an Argon2id PHC string used as the verification tag.
pub fn hash_passphrase(passphrase: &str, salt: &[u8; 32]) -> CryptoResult<String> {
    let salt = SaltString::encode_b64(salt).map_err(|e| CryptoError::KdfFail(e.to_string()))?;

    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| CryptoError::KdfFail(e.to_string()))?;

    Ok(hash.to_string())
}

/// Verify a passphrase against a stored PHC string.
///
/// The argon2 verifier compares tags in constant time; the boolean result
/// carries no timing information about how close the guess was.
pub fn verify_passphrase(passphrase: &str, verification_tag: &str) -> CryptoResult<bool> {
    let parsed = PasswordHash::new(verification_tag)
        .map_err(|e| CryptoError::KdfFail(e.to_string()))?;

    Ok(Argon2::default()
        .verify_password(passphrase.as_bytes(), &parsed)
        .is_ok())
}

/// Derive a 32-byte subkey from a passphrase with PBKDF2-HMAC-SHA256.
pub fn derive_subkey(
    passphrase: &str,
    salt: &[u8; 32],
    params: &KdfParams,
) -> CryptoResult<[u8; 32]> {
    if params.algorithm != "pbkdf2-hmac-sha256" {
        return Err(CryptoError::KdfFail(format!(
            "unsupported kdf algorithm: {}",
            params.algorithm
        )));
    }
    if params.iterations < 1 {
        return Err(CryptoError::KdfFail("iteration count must be >= 1".into()));
    }

    let mut key = [0u8; 32];
    pbkdf2::pbkdf2::<hmac::Hmac<sha2::Sha256>>(
        passphrase.as_bytes(),
        salt,
        params.iterations,
        &mut key,
    )
    .map_err(|e| CryptoError::KdfFail(e.to_string()))?;

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Sealed;

    #[test]
    fn passphrase_verification_roundtrip() {
        let salt = Sealed::generate_salt();
        let tag = hash_passphrase("hunter2hunter2", &salt).unwrap();

        assert!(verify_passphrase("hunter2hunter2", &tag).unwrap());
        assert!(!verify_passphrase("hunter3hunter3", &tag).unwrap());
    }

    #[test]
    fn subkey_is_deterministic_per_salt() {
        let params = KdfParams::default();
        let salt = [7u8; 32];

        let a = derive_subkey("pw", &salt, &params).unwrap();
        let b = derive_subkey("pw", &salt, &params).unwrap();
        assert_eq!(a, b);

        let other_salt = [8u8; 32];
        let c = derive_subkey("pw", &other_salt, &params).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let params = KdfParams {
            algorithm: "scrypt".to_string(),
            iterations: 1,
        };
        assert!(matches!(
            derive_subkey("pw", &[0u8; 32], &params),
            Err(CryptoError::KdfFail(_))
        ));
    }
}

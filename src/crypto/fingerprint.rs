use base64::engine::general_purpose;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Fingerprint public-key bytes in the OpenSSH `SHA256:<b64>` display form.
///
/// Accepts either raw key bytes or an authorized_keys-style line; for the
/// latter the base64 body is decoded first so the fingerprint is stable
/// regardless of the comment field.
pub fn fingerprint_public_key(public_key: &[u8]) -> String {
    let material = decode_openssh_line(public_key).unwrap_or_else(|| public_key.to_vec());

    let digest = Sha256::digest(&material);
    let encoded = general_purpose::STANDARD_NO_PAD.encode(digest);
    format!("SHA256:{}", encoded)
}

fn decode_openssh_line(bytes: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut parts = text.split_whitespace();
    let key_type = parts.next()?;
    if !key_type.starts_with("ssh-") && !key_type.starts_with("ecdsa-") {
        return None;
    }
    let body = parts.next()?;
    general_purpose::STANDARD.decode(body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        let a = fingerprint_public_key(b"some key material");
        let b = fingerprint_public_key(b"some key material");
        assert_eq!(a, b);
        assert!(a.starts_with("SHA256:"));
    }

    #[test]
    fn openssh_line_ignores_comment() {
        let with_comment = b"ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBase64Base64Base64B user@host";
        let without = b"ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBase64Base64Base64B";
        assert_eq!(
            fingerprint_public_key(with_comment),
            fingerprint_public_key(without)
        );
    }

    #[test]
    fn different_keys_differ() {
        assert_ne!(
            fingerprint_public_key(b"key one"),
            fingerprint_public_key(b"key two")
        );
    }
}

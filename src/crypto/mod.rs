pub mod aead;
pub mod fingerprint;
pub mod kdf;

pub use aead::Sealed;
pub use fingerprint::fingerprint_public_key;
pub use kdf::{derive_subkey, hash_passphrase, verify_passphrase, KdfParams};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{self, KdfParams, Sealed};
use crate::error::{AuthError, AuthResult, CryptoError};
use crate::keys::cache::{DeviceKey, KeyCache};

/// Per-device master password row: random salt, Argon2id verification tag
/// and the subkey-derivation parameters used for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterPasswordEntry {
    pub device_id: String,
    pub salt: [u8; 32],
    pub verification_tag: String,
    pub kdf_params: KdfParams,
    pub auto_unlock: bool,
    pub created_at: DateTime<Utc>,
    pub last_verified_at: Option<DateTime<Utc>>,
}

/// Per-device encryption key row. `encrypted_key` is the random 32-byte
/// device key sealed under the passphrase-derived master key; the raw key
/// never touches disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeyEntry {
    pub device_id: String,
    pub salt: [u8; 32],
    pub encrypted_key: Vec<u8>,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
}

/// The master → device-key hierarchy for one process.
///
/// Level 1 is the user passphrase (never stored), level 2 the derived
/// master key (exists only on the stack during unlock/rotate), level 3 the
/// random device encryption key cached in [`KeyCache`] while unlocked.
pub struct KeyHierarchy {
    current_device_id: String,
    cache: Arc<KeyCache>,
}

impl KeyHierarchy {
    pub fn new(current_device_id: String, cache: Arc<KeyCache>) -> Self {
        Self {
            current_device_id,
            cache,
        }
    }

    pub fn current_device_id(&self) -> &str {
        &self.current_device_id
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    /// First-time setup for the current device: derive the verification tag,
    /// generate a fresh device key and seal it under the master key. The
    /// device key is loaded into the cache (setup implies unlocked).
    pub async fn create(
        &self,
        passphrase: &str,
    ) -> AuthResult<(MasterPasswordEntry, DeviceKeyEntry)> {
        let salt = Sealed::generate_salt();
        let kdf_params = KdfParams::default();

        let (verification_tag, master_key) = {
            let passphrase = passphrase.to_string();
            let params = kdf_params.clone();
            run_kdf(move || {
                let tag = crypto::hash_passphrase(&passphrase, &salt)?;
                let master = Zeroizing::new(crypto::derive_subkey(&passphrase, &salt, &params)?);
                Ok((tag, master))
            })
            .await?
        };

        let device_key_bytes = Zeroizing::new(Sealed::generate_key());
        let encrypted_key = Sealed::seal(&master_key, device_key_bytes.as_ref())?;

        let now = Utc::now();
        let password_entry = MasterPasswordEntry {
            device_id: self.current_device_id.clone(),
            salt,
            verification_tag,
            kdf_params,
            auto_unlock: false,
            created_at: now,
            last_verified_at: Some(now),
        };
        let key_entry = DeviceKeyEntry {
            device_id: self.current_device_id.clone(),
            salt,
            encrypted_key,
            key_version: 1,
            created_at: now,
        };

        self.cache
            .insert(
                self.current_device_id.clone(),
                DeviceKey::new(*device_key_bytes),
            )
            .await;

        Ok((password_entry, key_entry))
    }

    /// Verify a passphrase against a stored entry and, on success, open the
    /// sealed device key into the cache.
    pub async fn unlock(
        &self,
        passphrase: &str,
        password_entry: &MasterPasswordEntry,
        key_entry: &DeviceKeyEntry,
    ) -> AuthResult<()> {
        let master_key = {
            let passphrase = passphrase.to_string();
            let tag = password_entry.verification_tag.clone();
            let salt = key_entry.salt;
            let params = password_entry.kdf_params.clone();
            run_kdf(move || {
                if !crypto::verify_passphrase(&passphrase, &tag)? {
                    return Err(AuthError::InvalidPassphrase);
                }
                Ok(Zeroizing::new(crypto::derive_subkey(
                    &passphrase,
                    &salt,
                    &params,
                )?))
            })
            .await?
        };

        let device_key = self.open_device_key(&master_key, key_entry)?;
        self.cache
            .insert(key_entry.device_id.clone(), device_key)
            .await;

        Ok(())
    }

    /// Load a raw device key obtained from the OS keystore (auto-unlock).
    pub async fn unlock_with_raw_key(&self, device_id: String, key: [u8; 32]) {
        self.cache.insert(device_id, DeviceKey::new(key)).await;
    }

    /// Cross-device federation: verify a foreign device's passphrase, open
    /// its stored device key and add it to the cache so ciphertext from that
    /// device becomes readable.
    pub async fn add_device_key(
        &self,
        device_id: &str,
        passphrase: &str,
        password_entry: &MasterPasswordEntry,
        key_entry: &DeviceKeyEntry,
    ) -> AuthResult<()> {
        if key_entry.device_id != device_id {
            return Err(AuthError::Validation(format!(
                "key entry belongs to device {}, not {}",
                key_entry.device_id, device_id
            )));
        }
        self.unlock(passphrase, password_entry, key_entry).await
    }

    /// Rotate the passphrase: verify the old one, open the device key, then
    /// re-seal the same key under a freshly derived master key. Record
    /// ciphertext is untouched (the device key itself does not change), so
    /// `key_version` is preserved.
    pub async fn change_passphrase(
        &self,
        old_passphrase: &str,
        new_passphrase: &str,
        password_entry: &MasterPasswordEntry,
        key_entry: &DeviceKeyEntry,
    ) -> AuthResult<(MasterPasswordEntry, DeviceKeyEntry)> {
        let old_master = {
            let passphrase = old_passphrase.to_string();
            let tag = password_entry.verification_tag.clone();
            let salt = key_entry.salt;
            let params = password_entry.kdf_params.clone();
            run_kdf(move || {
                if !crypto::verify_passphrase(&passphrase, &tag)? {
                    return Err(AuthError::InvalidPassphrase);
                }
                Ok(Zeroizing::new(crypto::derive_subkey(
                    &passphrase,
                    &salt,
                    &params,
                )?))
            })
            .await?
        };
        let device_key = self.open_device_key(&old_master, key_entry)?;

        let new_salt = Sealed::generate_salt();
        let kdf_params = KdfParams::default();
        let (verification_tag, new_master) = {
            let passphrase = new_passphrase.to_string();
            let params = kdf_params.clone();
            run_kdf(move || {
                let tag = crypto::hash_passphrase(&passphrase, &new_salt)?;
                let master = Zeroizing::new(crypto::derive_subkey(
                    &passphrase,
                    &new_salt,
                    &params,
                )?);
                Ok((tag, master))
            })
            .await?
        };
        let encrypted_key = Sealed::seal(&new_master, device_key.bytes())?;

        let now = Utc::now();
        let new_password_entry = MasterPasswordEntry {
            device_id: password_entry.device_id.clone(),
            salt: new_salt,
            verification_tag,
            kdf_params,
            auto_unlock: password_entry.auto_unlock,
            created_at: password_entry.created_at,
            last_verified_at: Some(now),
        };
        let new_key_entry = DeviceKeyEntry {
            device_id: key_entry.device_id.clone(),
            salt: new_salt,
            encrypted_key,
            key_version: key_entry.key_version,
            created_at: key_entry.created_at,
        };

        self.cache
            .insert(key_entry.device_id.clone(), device_key)
            .await;

        Ok((new_password_entry, new_key_entry))
    }

    /// Wipe every cached key.
    pub async fn lock(&self) {
        self.cache.clear().await;
    }

    fn open_device_key(
        &self,
        master_key: &[u8; 32],
        key_entry: &DeviceKeyEntry,
    ) -> AuthResult<DeviceKey> {
        let opened = Sealed::open(master_key, &key_entry.encrypted_key).map_err(|e| match e {
            // A failed tag over the sealed key means the passphrase-derived
            // key is wrong even though the verification tag matched; treat
            // as an invalid passphrase rather than data corruption.
            CryptoError::AuthFail => AuthError::InvalidPassphrase,
            other => AuthError::Crypto(other),
        })?;

        if opened.len() != 32 {
            return Err(AuthError::Crypto(CryptoError::MalformedBlob));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&opened);
        Ok(DeviceKey::new(bytes))
    }
}

/// Run a memory-hard derivation on the blocking pool; pure crypto is
/// synchronous and never occupies an async worker.
async fn run_kdf<T, F>(f: F) -> AuthResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AuthResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuthError::Validation(format!("kdf worker failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy() -> KeyHierarchy {
        KeyHierarchy::new("dev-a".to_string(), Arc::new(KeyCache::new()))
    }

    #[tokio::test]
    async fn setup_then_lock_then_unlock() {
        let h = hierarchy();
        let (pw, key) = h.create("Str0ngPassphrase").await.unwrap();
        assert!(h.cache().contains("dev-a").await);

        h.lock().await;
        assert!(h.cache().is_empty().await);

        h.unlock("Str0ngPassphrase", &pw, &key).await.unwrap();
        assert!(h.cache().contains("dev-a").await);
    }

    #[tokio::test]
    async fn wrong_passphrase_is_rejected() {
        let h = hierarchy();
        let (pw, key) = h.create("Str0ngPassphrase").await.unwrap();
        h.lock().await;

        let err = h.unlock("WrongPassphrase1", &pw, &key).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidPassphrase));
        assert!(h.cache().is_empty().await);
    }

    #[tokio::test]
    async fn change_passphrase_keeps_device_key() {
        let h = hierarchy();
        let (pw, key) = h.create("OldPassphrase11").await.unwrap();
        let original = h.cache().get("dev-a").await.unwrap();

        let (new_pw, new_key) = h
            .change_passphrase("OldPassphrase11", "NewPassphrase22", &pw, &key)
            .await
            .unwrap();

        // Old passphrase no longer verifies, new one does, and the device
        // key bytes are identical so existing ciphertext stays readable.
        h.lock().await;
        assert!(matches!(
            h.unlock("OldPassphrase11", &new_pw, &new_key).await,
            Err(AuthError::InvalidPassphrase)
        ));
        h.unlock("NewPassphrase22", &new_pw, &new_key).await.unwrap();
        let reloaded = h.cache().get("dev-a").await.unwrap();
        assert_eq!(original.bytes(), reloaded.bytes());
        assert_eq!(new_key.key_version, key.key_version);
    }

    #[tokio::test]
    async fn foreign_device_key_federation() {
        let device_a = KeyHierarchy::new("dev-a".to_string(), Arc::new(KeyCache::new()));
        let (pw_a, key_a) = device_a.create("DeviceAPassw0rd").await.unwrap();

        // Device B gets A's rows (as sync would deliver them) and unlocks
        // them with A's passphrase.
        let device_b = KeyHierarchy::new("dev-b".to_string(), Arc::new(KeyCache::new()));
        device_b.create("DeviceBPassw0rd").await.unwrap();
        assert!(!device_b.cache().contains("dev-a").await);

        device_b
            .add_device_key("dev-a", "DeviceAPassw0rd", &pw_a, &key_a)
            .await
            .unwrap();
        assert!(device_b.cache().contains("dev-a").await);

        let a_key = device_a.cache().get("dev-a").await.unwrap();
        let b_copy = device_b.cache().get("dev-a").await.unwrap();
        assert_eq!(a_key.bytes(), b_copy.bytes());
    }

    #[tokio::test]
    async fn mismatched_entry_device_is_rejected() {
        let h = hierarchy();
        let (pw, key) = h.create("Str0ngPassphrase").await.unwrap();
        let err = h
            .add_device_key("dev-z", "Str0ngPassphrase", &pw, &key)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }
}

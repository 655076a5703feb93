use std::sync::Arc;

use base64::engine::general_purpose;
use base64::Engine;

use crate::crypto::Sealed;
use crate::error::{AuthError, CryptoError, VaultResult};
use crate::keys::KeyCache;
use crate::vault::models::{AuthPayload, ExternalDatabaseConfig, SshKey, SshProfile};

/// Transparent field encryption for secret columns.
///
/// Wire layout (base64 in TEXT columns):
///
/// ```text
/// [u8 device_id_len][device_id][u32le key_version][nonce ‖ ciphertext ‖ tag]
/// ```
///
/// The header names the device key required to open the blob, so a record
/// replicated from another device fails with `UnknownDeviceKey` instead of
/// being mistaken for corruption.
pub struct SecretCodec {
    cache: Arc<KeyCache>,
    device_id: String,
    key_version: u32,
}

impl SecretCodec {
    pub fn new(cache: Arc<KeyCache>, device_id: String, key_version: u32) -> Self {
        Self {
            cache,
            device_id,
            key_version,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Seal a field under the current device key.
    pub async fn seal_field(&self, plaintext: &str) -> VaultResult<String> {
        let key = match self.cache.get(&self.device_id).await {
            Some(key) => key,
            None => return Err(self.missing_key_error(&self.device_id).await),
        };

        let blob = Sealed::seal(key.bytes(), plaintext.as_bytes())?;

        let mut framed = Vec::with_capacity(1 + self.device_id.len() + 4 + blob.len());
        framed.push(self.device_id.len() as u8);
        framed.extend_from_slice(self.device_id.as_bytes());
        framed.extend_from_slice(&self.key_version.to_le_bytes());
        framed.extend_from_slice(&blob);

        Ok(general_purpose::STANDARD.encode(framed))
    }

    /// Open a field sealed by any device whose key is in the cache.
    pub async fn open_field(&self, encoded: &str) -> VaultResult<String> {
        let framed = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| CryptoError::MalformedBlob)?;

        let (device_id, _key_version, blob) = Self::split_header(&framed)?;

        let key = match self.cache.get(&device_id).await {
            Some(key) => key,
            None => return Err(self.missing_key_error(&device_id).await),
        };

        let plaintext = Sealed::open(key.bytes(), blob)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::MalformedBlob.into())
    }

    /// Device id named in a sealed field's header, without opening it.
    pub fn sealed_by(encoded: &str) -> VaultResult<String> {
        let framed = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| CryptoError::MalformedBlob)?;
        let (device_id, _, _) = Self::split_header(&framed)?;
        Ok(device_id)
    }

    fn split_header(framed: &[u8]) -> VaultResult<(String, u32, &[u8])> {
        if framed.is_empty() {
            return Err(CryptoError::MalformedBlob.into());
        }
        let id_len = framed[0] as usize;
        if framed.len() < 1 + id_len + 4 {
            return Err(CryptoError::MalformedBlob.into());
        }
        let device_id = std::str::from_utf8(&framed[1..1 + id_len])
            .map_err(|_| CryptoError::MalformedBlob)?
            .to_string();
        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(&framed[1 + id_len..1 + id_len + 4]);
        let key_version = u32::from_le_bytes(version_bytes);
        Ok((device_id, key_version, &framed[1 + id_len + 4..]))
    }

    /// Distinguish "vault is locked" from "this one device is missing".
    async fn missing_key_error(&self, device_id: &str) -> crate::error::VaultError {
        if self.cache.is_empty().await {
            AuthError::Locked.into()
        } else {
            AuthError::UnknownDeviceKey(device_id.to_string()).into()
        }
    }

    // Entity policies: each entity declares which of its fields are secret.

    pub async fn seal_profile(&self, profile: &mut SshProfile) -> VaultResult<()> {
        if let AuthPayload::Password { password } = &mut profile.auth {
            *password = self.seal_field(password).await?;
        }
        if let Some(proxy) = &mut profile.proxy {
            if let Some(password) = &mut proxy.password {
                *password = self.seal_field(password).await?;
            }
        }
        Ok(())
    }

    pub async fn open_profile(&self, profile: &mut SshProfile) -> VaultResult<()> {
        if let AuthPayload::Password { password } = &mut profile.auth {
            *password = self.open_field(password).await?;
        }
        if let Some(proxy) = &mut profile.proxy {
            if let Some(password) = &mut proxy.password {
                *password = self.open_field(password).await?;
            }
        }
        Ok(())
    }

    pub async fn seal_key(&self, key: &mut SshKey) -> VaultResult<()> {
        key.private_key = self.seal_field(&key.private_key).await?;
        if let Some(passphrase) = &mut key.passphrase {
            *passphrase = self.seal_field(passphrase).await?;
        }
        Ok(())
    }

    pub async fn open_key(&self, key: &mut SshKey) -> VaultResult<()> {
        key.private_key = self.open_field(&key.private_key).await?;
        if let Some(passphrase) = &mut key.passphrase {
            *passphrase = self.open_field(passphrase).await?;
        }
        Ok(())
    }

    pub async fn seal_external_db(&self, config: &mut ExternalDatabaseConfig) -> VaultResult<()> {
        config.connection = self.seal_field(&config.connection).await?;
        Ok(())
    }

    pub async fn open_external_db(&self, config: &mut ExternalDatabaseConfig) -> VaultResult<()> {
        config.connection = self.open_field(&config.connection).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use crate::keys::DeviceKey;

    async fn codec_with_key(device_id: &str) -> SecretCodec {
        let cache = Arc::new(KeyCache::new());
        cache
            .insert(device_id.to_string(), DeviceKey::new([9u8; 32]))
            .await;
        SecretCodec::new(cache, device_id.to_string(), 1)
    }

    #[tokio::test]
    async fn field_roundtrip_with_header() {
        let codec = codec_with_key("dev-a").await;
        let sealed = codec.seal_field("s3cret").await.unwrap();

        assert_ne!(sealed, "s3cret");
        assert_eq!(SecretCodec::sealed_by(&sealed).unwrap(), "dev-a");
        assert_eq!(codec.open_field(&sealed).await.unwrap(), "s3cret");
    }

    #[tokio::test]
    async fn foreign_device_header_surfaces_unknown_device_key() {
        let codec_a = codec_with_key("dev-a").await;
        let sealed = codec_a.seal_field("s3cret").await.unwrap();

        // Device B has its own key loaded but not A's.
        let codec_b = codec_with_key("dev-b").await;
        let err = codec_b.open_field(&sealed).await.unwrap_err();
        match err {
            VaultError::Auth(AuthError::UnknownDeviceKey(id)) => assert_eq!(id, "dev-a"),
            other => panic!("expected UnknownDeviceKey, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_cache_surfaces_locked() {
        let codec = codec_with_key("dev-a").await;
        let sealed = codec.seal_field("s3cret").await.unwrap();

        let locked = SecretCodec::new(Arc::new(KeyCache::new()), "dev-a".to_string(), 1);
        let err = locked.open_field(&sealed).await.unwrap_err();
        assert!(matches!(err, VaultError::Auth(AuthError::Locked)));
    }

    #[tokio::test]
    async fn profile_policy_seals_auth_and_proxy() {
        use crate::vault::models::{ProxyConfig, ProxyType};

        let codec = codec_with_key("dev-a").await;
        let mut profile = SshProfile::new(
            "dev-a".into(),
            "prod".into(),
            "10.0.0.1".into(),
            22,
            "root".into(),
        );
        profile.set_authentication(AuthPayload::Password {
            password: "s3cret".into(),
        });
        profile.proxy = Some(ProxyConfig {
            proxy_type: ProxyType::Socks5,
            host: "proxy".into(),
            port: 1080,
            username: Some("u".into()),
            password: Some("proxy-pw".into()),
        });

        codec.seal_profile(&mut profile).await.unwrap();
        match &profile.auth {
            AuthPayload::Password { password } => {
                assert_ne!(password, "s3cret");
                // base64(header + nonce + ct + tag) is comfortably past the
                // 28-byte floor for the AEAD blob alone.
                assert!(password.len() >= 28);
            }
            other => panic!("unexpected payload {:?}", other),
        }

        codec.open_profile(&mut profile).await.unwrap();
        match &profile.auth {
            AuthPayload::Password { password } => assert_eq!(password, "s3cret"),
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(
            profile.proxy.as_ref().unwrap().password.as_deref(),
            Some("proxy-pw")
        );
    }
}

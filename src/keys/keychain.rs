use base64::engine::general_purpose;
use base64::Engine;
use keyring::Entry;

use crate::error::{AuthError, AuthResult};

/// OS keystore wrapper used by the auto-unlock flow. Stores the raw device
/// key (base64) under `service`/`device-key:<device_id>` so the next start
/// can skip passphrase entry when the user opted in.
pub struct KeystoreManager {
    service: String,
}

impl KeystoreManager {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, device_id: &str) -> AuthResult<Entry> {
        Entry::new(&self.service, &format!("device-key:{}", device_id))
            .map_err(|e| AuthError::KeystoreUnavailable(e.to_string()))
    }

    /// Probe whether a keystore backend is usable on this machine.
    pub fn is_available(&self) -> bool {
        match Entry::new(&self.service, "availability-probe") {
            Ok(entry) => match entry.set_password("probe") {
                Ok(()) => {
                    let _ = entry.delete_password();
                    true
                }
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    pub fn store_device_key(&self, device_id: &str, key: &[u8; 32]) -> AuthResult<()> {
        let encoded = general_purpose::STANDARD.encode(key);
        self.entry(device_id)?
            .set_password(&encoded)
            .map_err(|e| AuthError::KeystoreUnavailable(e.to_string()))
    }

    pub fn get_device_key(&self, device_id: &str) -> AuthResult<Option<[u8; 32]>> {
        let entry = self.entry(device_id)?;
        let encoded = match entry.get_password() {
            Ok(value) => value,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(AuthError::KeystoreUnavailable(e.to_string())),
        };

        let decoded = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthError::KeystoreUnavailable(format!("corrupt entry: {}", e)))?;
        if decoded.len() != 32 {
            log::warn!(
                "keystore entry for device {} has invalid length {}",
                device_id,
                decoded.len()
            );
            return Ok(None);
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded);
        Ok(Some(key))
    }

    pub fn delete_device_key(&self, device_id: &str) -> AuthResult<()> {
        match self.entry(device_id)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AuthError::KeystoreUnavailable(e.to_string())),
        }
    }
}

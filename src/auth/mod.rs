use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{AuthError, AuthResult};
use crate::events::{Event, EventBus, LockReason, Topic};
use crate::keys::{KeyCache, KeyHierarchy, KeystoreManager};
use crate::vault::models::Device;
use crate::vault::VaultStore;

const KEYSTORE_SERVICE: &str = "kerminal";
const WATCHDOG_TICK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthState {
    Uninitialized,
    Initialized,
    Unlocked,
    Locked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub state: AuthState,
    pub device_id: Option<String>,
    pub auto_unlock_enabled: bool,
    pub keystore_available: bool,
    pub session_expires_at: Option<DateTime<Utc>>,
    pub loaded_device_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupOptions {
    pub auto_unlock: bool,
    pub auto_lock_timeout_minutes: Option<u32>,
}

/// Orchestrates setup, unlock, lock and passphrase rotation over the key
/// hierarchy, the vault and the OS keystore. One instance per process,
/// handed to the other services by reference.
pub struct AuthSession {
    store: Arc<VaultStore>,
    cache: Arc<KeyCache>,
    keystore: KeystoreManager,
    bus: EventBus,
    unlocked_at: RwLock<Option<DateTime<Utc>>>,
    last_activity: RwLock<DateTime<Utc>>,
    timeout_minutes: RwLock<Option<u32>>,
}

impl AuthSession {
    pub fn new(store: Arc<VaultStore>, bus: EventBus) -> Self {
        let cache = store.key_cache().clone();
        Self {
            store,
            cache,
            keystore: KeystoreManager::new(KEYSTORE_SERVICE),
            bus,
            unlocked_at: RwLock::new(None),
            last_activity: RwLock::new(Utc::now()),
            timeout_minutes: RwLock::new(None),
        }
    }

    async fn hierarchy(&self) -> AuthResult<KeyHierarchy> {
        let device_id = self
            .store
            .current_device_id()
            .await
            .map_err(|_| AuthError::NotInitialized)?;
        Ok(KeyHierarchy::new(device_id, self.cache.clone()))
    }

    /// First-time setup: registers the device, derives and persists the
    /// verification tag and the sealed device key, and unlocks the session.
    pub async fn setup(
        &self,
        passphrase: &str,
        device_name: &str,
        options: SetupOptions,
    ) -> AuthResult<Device> {
        validate_passphrase(passphrase)?;
        if device_name.trim().is_empty() {
            return Err(AuthError::Validation("device name cannot be empty".into()));
        }

        if let Ok(device_id) = self.store.current_device_id().await {
            if self
                .store
                .get_master_password_entry(&device_id)
                .await
                .map_err(|e| AuthError::Validation(e.to_string()))?
                .is_some()
            {
                return Err(AuthError::Validation(
                    "master password is already set up".into(),
                ));
            }
        }

        let device = Device::new(device_name.trim().to_string());
        self.store
            .register_device(&device)
            .await
            .map_err(|e| AuthError::Validation(e.to_string()))?;

        let hierarchy = KeyHierarchy::new(device.device_id.clone(), self.cache.clone());
        let (mut password_entry, key_entry) = hierarchy.create(passphrase).await?;

        let use_keystore = options.auto_unlock && self.keystore.is_available();
        password_entry.auto_unlock = use_keystore;

        self.store
            .save_master_password_entry(&password_entry)
            .await
            .map_err(|e| AuthError::Validation(e.to_string()))?;
        self.store
            .save_device_key_entry(&key_entry)
            .await
            .map_err(|e| AuthError::Validation(e.to_string()))?;

        if use_keystore {
            if let Some(key) = self.cache.get(&device.device_id).await {
                if let Err(e) = self.keystore.store_device_key(&device.device_id, key.bytes()) {
                    log::warn!("failed to store device key in keystore: {}", e);
                }
            }
        }

        *self.timeout_minutes.write().await = options.auto_lock_timeout_minutes;
        self.mark_unlocked().await;

        self.bus.publish(
            &Topic::AuthSession,
            Event::SessionSetup {
                device_id: device.device_id.clone(),
            },
        );
        self.bus.publish(
            &Topic::AuthSession,
            Event::SessionUnlocked {
                via_auto_unlock: false,
            },
        );

        log::info!("auth session set up for device {}", device.device_id);
        Ok(device)
    }

    /// Verify a passphrase and unlock. The verification tag comparison is
    /// constant-time inside the argon2 verifier.
    pub async fn verify(&self, passphrase: &str) -> AuthResult<()> {
        let hierarchy = self.hierarchy().await?;
        let device_id = hierarchy.current_device_id().to_string();

        let password_entry = self
            .store
            .get_master_password_entry(&device_id)
            .await
            .map_err(|e| AuthError::Validation(e.to_string()))?
            .ok_or(AuthError::NotInitialized)?;
        let key_entry = self
            .store
            .get_device_key_entry(&device_id)
            .await
            .map_err(|e| AuthError::Validation(e.to_string()))?
            .ok_or(AuthError::NotInitialized)?;

        hierarchy
            .unlock(passphrase, &password_entry, &key_entry)
            .await?;

        if let Err(e) = self.store.touch_master_password_verified(&device_id).await {
            log::warn!("failed to update last_verified_at: {}", e);
        }

        self.mark_unlocked().await;
        self.bus.publish(
            &Topic::AuthSession,
            Event::SessionUnlocked {
                via_auto_unlock: false,
            },
        );
        Ok(())
    }

    /// Attempt keystore-based unlock. Returns `Ok(false)` (never an error)
    /// when auto-unlock is disabled or the keystore has nothing usable.
    pub async fn try_auto_unlock(&self) -> bool {
        let result = self.try_auto_unlock_inner().await;
        match &result {
            Ok(true) => {
                self.bus.publish(
                    &Topic::AuthSession,
                    Event::AutoUnlockAttempted {
                        ok: true,
                        error: None,
                    },
                );
                self.bus.publish(
                    &Topic::AuthSession,
                    Event::SessionUnlocked {
                        via_auto_unlock: true,
                    },
                );
            }
            Ok(false) => {
                self.bus.publish(
                    &Topic::AuthSession,
                    Event::AutoUnlockAttempted {
                        ok: false,
                        error: None,
                    },
                );
            }
            Err(e) => {
                log::debug!("auto-unlock failed: {}", e);
                self.bus.publish(
                    &Topic::AuthSession,
                    Event::AutoUnlockAttempted {
                        ok: false,
                        error: Some(e.to_string()),
                    },
                );
            }
        }
        matches!(result, Ok(true))
    }

    async fn try_auto_unlock_inner(&self) -> AuthResult<bool> {
        let hierarchy = self.hierarchy().await?;
        let device_id = hierarchy.current_device_id().to_string();

        let entry = self
            .store
            .get_master_password_entry(&device_id)
            .await
            .map_err(|e| AuthError::Validation(e.to_string()))?
            .ok_or(AuthError::NotInitialized)?;
        if !entry.auto_unlock {
            return Ok(false);
        }

        let Some(key) = self.keystore.get_device_key(&device_id)? else {
            return Ok(false);
        };

        hierarchy.unlock_with_raw_key(device_id, key).await;
        self.mark_unlocked().await;
        Ok(true)
    }

    /// Wipe all cached keys and arm the next unlock prompt.
    pub async fn lock(&self, reason: LockReason) {
        self.cache.clear().await;
        *self.unlocked_at.write().await = None;

        self.bus
            .publish(&Topic::AuthSession, Event::SessionLocked { reason });
        log::info!("auth session locked ({:?})", reason);
    }

    /// Rotate the passphrase. The new verification tag and the re-sealed
    /// device key are written in a single transaction; on any failure the
    /// old passphrase remains valid.
    pub async fn change_passphrase(&self, old: &str, new: &str) -> AuthResult<()> {
        validate_passphrase(new)?;

        let hierarchy = self.hierarchy().await?;
        let device_id = hierarchy.current_device_id().to_string();

        let password_entry = self
            .store
            .get_master_password_entry(&device_id)
            .await
            .map_err(|e| AuthError::Validation(e.to_string()))?
            .ok_or(AuthError::NotInitialized)?;
        let key_entry = self
            .store
            .get_device_key_entry(&device_id)
            .await
            .map_err(|e| AuthError::Validation(e.to_string()))?
            .ok_or(AuthError::NotInitialized)?;

        let (new_password_entry, new_key_entry) = hierarchy
            .change_passphrase(old, new, &password_entry, &key_entry)
            .await?;

        self.store
            .replace_master_entries(&new_password_entry, &new_key_entry)
            .await
            .map_err(|e| AuthError::Validation(e.to_string()))?;

        // Keystore copy of the device key is still valid (the key itself
        // did not rotate), nothing to refresh there.
        self.mark_unlocked().await;
        log::info!("master passphrase rotated for device {}", device_id);
        Ok(())
    }

    /// Cross-device federation: unlock a foreign device's stored key
    /// with that device's passphrase so its ciphertext becomes readable.
    pub async fn add_device_key(&self, device_id: &str, passphrase: &str) -> AuthResult<()> {
        let hierarchy = self.hierarchy().await?;

        let password_entry = self
            .store
            .get_master_password_entry(device_id)
            .await
            .map_err(|e| AuthError::Validation(e.to_string()))?
            .ok_or_else(|| AuthError::UnknownDeviceKey(device_id.to_string()))?;
        let key_entry = self
            .store
            .get_device_key_entry(device_id)
            .await
            .map_err(|e| AuthError::Validation(e.to_string()))?
            .ok_or_else(|| AuthError::UnknownDeviceKey(device_id.to_string()))?;

        hierarchy
            .add_device_key(device_id, passphrase, &password_entry, &key_entry)
            .await?;

        if let Err(e) = self.store.touch_device_last_seen(device_id).await {
            log::debug!("failed to touch device {}: {}", device_id, e);
        }
        log::info!("loaded device key for foreign device {}", device_id);
        Ok(())
    }

    pub async fn get_status(&self) -> AuthStatus {
        let device_id = self.store.current_device_id().await.ok();
        let entry = match &device_id {
            Some(id) => self.store.get_master_password_entry(id).await.ok().flatten(),
            None => None,
        };

        let unlocked = match &device_id {
            Some(id) => self.cache.contains(id).await,
            None => false,
        };

        let state = match (&device_id, &entry, unlocked) {
            (None, _, _) | (_, None, _) => AuthState::Uninitialized,
            (Some(_), Some(_), true) => AuthState::Unlocked,
            (Some(_), Some(_), false) => AuthState::Locked,
        };

        let session_expires_at = match (*self.unlocked_at.read().await, *self.timeout_minutes.read().await)
        {
            (Some(_), Some(minutes)) => {
                let last = *self.last_activity.read().await;
                Some(last + chrono::Duration::minutes(minutes as i64))
            }
            _ => None,
        };

        AuthStatus {
            state,
            device_id,
            auto_unlock_enabled: entry.map(|e| e.auto_unlock).unwrap_or(false),
            keystore_available: self.keystore.is_available(),
            session_expires_at,
            loaded_device_count: self.cache.len().await,
        }
    }

    pub async fn is_unlocked(&self) -> bool {
        match self.store.current_device_id().await {
            Ok(device_id) => self.cache.contains(&device_id).await,
            Err(_) => false,
        }
    }

    /// Reset the idle timer. Called by every vault access and terminal
    /// creation so an active user is never locked out mid-session.
    pub async fn touch_activity(&self) {
        *self.last_activity.write().await = Utc::now();
    }

    pub async fn set_auto_lock_timeout(&self, minutes: Option<u32>) {
        *self.timeout_minutes.write().await = minutes;
    }

    pub async fn set_auto_unlock(&self, enabled: bool) -> AuthResult<()> {
        let device_id = self
            .store
            .current_device_id()
            .await
            .map_err(|_| AuthError::NotInitialized)?;

        if enabled {
            if !self.keystore.is_available() {
                return Err(AuthError::KeystoreUnavailable(
                    "no usable keystore backend".into(),
                ));
            }
            let key = self
                .cache
                .get(&device_id)
                .await
                .ok_or(AuthError::Locked)?;
            self.keystore.store_device_key(&device_id, key.bytes())?;
        } else if let Err(e) = self.keystore.delete_device_key(&device_id) {
            log::warn!("failed to remove device key from keystore: {}", e);
        }

        self.store
            .set_auto_unlock(&device_id, enabled)
            .await
            .map_err(|e| AuthError::Validation(e.to_string()))?;
        Ok(())
    }

    /// Spawn the idle watchdog. Checks the activity clock periodically and
    /// locks the session once the configured timeout elapses.
    pub fn start_timeout_watchdog(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_TICK);
            loop {
                ticker.tick().await;

                let Some(minutes) = *session.timeout_minutes.read().await else {
                    continue;
                };
                if session.unlocked_at.read().await.is_none() {
                    continue;
                }

                let idle = Utc::now() - *session.last_activity.read().await;
                if idle > chrono::Duration::minutes(minutes as i64) {
                    session.lock(LockReason::Timeout).await;
                }
            }
        });
    }

    async fn mark_unlocked(&self) {
        *self.unlocked_at.write().await = Some(Utc::now());
        self.touch_activity().await;
    }
}

/// Minimal strength gate, mirrored in the front-end validation.
fn validate_passphrase(passphrase: &str) -> AuthResult<()> {
    if passphrase.len() < 8 {
        return Err(AuthError::Validation(
            "passphrase must be at least 8 characters".into(),
        ));
    }
    if passphrase.len() > 128 {
        return Err(AuthError::Validation(
            "passphrase must be at most 128 characters".into(),
        ));
    }

    const COMMON: &[&str] = &["password", "12345678", "qwerty", "letmein", "admin123"];
    let lowered = passphrase.to_lowercase();
    if COMMON.iter().any(|common| lowered.contains(common)) {
        return Err(AuthError::Validation("passphrase is too common".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::models::{AuthPayload, SshProfile};

    async fn fresh_session() -> Arc<AuthSession> {
        let cache = Arc::new(KeyCache::new());
        let store = Arc::new(
            VaultStore::open("sqlite::memory:", cache)
                .await
                .unwrap(),
        );
        Arc::new(AuthSession::new(store, EventBus::new()))
    }

    #[tokio::test]
    async fn setup_unlock_cycle() {
        let session = fresh_session().await;
        let bus_sub = session.bus.subscribe(Topic::AuthSession);

        session
            .setup(
                "correct horse battery staple",
                "laptop-1",
                SetupOptions {
                    auto_unlock: false,
                    auto_lock_timeout_minutes: None,
                },
            )
            .await
            .unwrap();
        assert!(session.is_unlocked().await);
        assert!(matches!(
            bus_sub.recv().await.unwrap(),
            Event::SessionSetup { .. }
        ));
        assert!(matches!(
            bus_sub.recv().await.unwrap(),
            Event::SessionUnlocked {
                via_auto_unlock: false
            }
        ));

        session.lock(LockReason::Manual).await;
        assert!(!session.is_unlocked().await);
        match bus_sub.recv().await.unwrap() {
            Event::SessionLocked { reason } => assert_eq!(reason, LockReason::Manual),
            other => panic!("unexpected event {:?}", other),
        }

        assert!(matches!(
            session.verify("wrong passphrase").await,
            Err(AuthError::InvalidPassphrase)
        ));
        assert!(!session.is_unlocked().await);

        session.verify("correct horse battery staple").await.unwrap();
        assert!(session.is_unlocked().await);
    }

    #[tokio::test]
    async fn setup_twice_is_rejected() {
        let session = fresh_session().await;
        let options = SetupOptions {
            auto_unlock: false,
            auto_lock_timeout_minutes: None,
        };
        session
            .setup("correct horse battery staple", "laptop-1", options.clone())
            .await
            .unwrap();
        assert!(matches!(
            session
                .setup("another passphrase here", "laptop-1", options)
                .await,
            Err(AuthError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn change_passphrase_round_trip() {
        let session = fresh_session().await;
        session
            .setup(
                "original passphrase",
                "laptop-1",
                SetupOptions {
                    auto_unlock: false,
                    auto_lock_timeout_minutes: None,
                },
            )
            .await
            .unwrap();

        session
            .change_passphrase("original passphrase", "replacement passphrase")
            .await
            .unwrap();

        session.lock(LockReason::Manual).await;
        assert!(matches!(
            session.verify("original passphrase").await,
            Err(AuthError::InvalidPassphrase)
        ));
        session.verify("replacement passphrase").await.unwrap();
    }

    #[tokio::test]
    async fn weak_passphrases_rejected() {
        let session = fresh_session().await;
        let options = SetupOptions {
            auto_unlock: false,
            auto_lock_timeout_minutes: None,
        };
        assert!(matches!(
            session.setup("short", "laptop", options.clone()).await,
            Err(AuthError::Validation(_))
        ));
        assert!(matches!(
            session.setup("password123", "laptop", options).await,
            Err(AuthError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn locked_vault_rejects_decrypt() {
        let session = fresh_session().await;
        session
            .setup(
                "correct horse battery staple",
                "laptop-1",
                SetupOptions {
                    auto_unlock: false,
                    auto_lock_timeout_minutes: None,
                },
            )
            .await
            .unwrap();

        let store = session.store.clone();
        let device_id = store.current_device_id().await.unwrap();
        let mut profile =
            SshProfile::new(device_id, "prod".into(), "10.0.0.1".into(), 22, "root".into());
        profile.set_authentication(AuthPayload::Password {
            password: "s3cret".into(),
        });
        store.save_ssh_profile(&mut profile).await.unwrap();

        session.lock(LockReason::Manual).await;
        let err = store.get_ssh_profile(&profile.base.id).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::VaultError::Auth(AuthError::Locked)
        ));
    }
}

//! Kerminal core: the multi-session terminal multiplexer, the encrypted
//! credential vault and the cross-device sync engine behind the Kerminal
//! terminal workstation. Front-ends layer command dispatch and rendering on
//! top of [`Workstation`] and subscribe to the [`events::EventBus`] for
//! terminal output, auth and sync notifications.

pub mod auth;
pub mod crypto;
pub mod error;
pub mod events;
pub mod keys;
pub mod session;
pub mod ssh;
pub mod sync;
pub mod vault;

use std::sync::Arc;

use crate::auth::AuthSession;
use crate::error::AppResult;
use crate::events::EventBus;
use crate::keys::KeyCache;
use crate::session::SessionManager;
use crate::ssh::ConnectionPool;
use crate::sync::scheduler::AutoSyncScheduler;
use crate::sync::SyncService;
use crate::vault::{VaultService, VaultStore};

/// Everything a process needs, wired once at startup. Components never
/// reach for globals — they receive their collaborators here by reference.
pub struct Workstation {
    pub bus: EventBus,
    pub store: Arc<VaultStore>,
    pub auth: Arc<AuthSession>,
    pub vault: Arc<VaultService>,
    pub sessions: Arc<SessionManager>,
    pub sync: Arc<SyncService>,
    pub scheduler: Arc<AutoSyncScheduler>,
}

impl Workstation {
    /// Open (or create) the vault at `vault_url` and assemble the service
    /// graph. Background workers (auto-lock watchdog, pool eviction,
    /// auto-sync scheduler) are started here.
    pub async fn open(vault_url: &str) -> AppResult<Self> {
        let bus = EventBus::new();
        let cache = Arc::new(KeyCache::new());
        let store = Arc::new(VaultStore::open(vault_url, cache).await?);

        let auth = Arc::new(AuthSession::new(store.clone(), bus.clone()));
        auth.start_timeout_watchdog();

        let vault = Arc::new(VaultService::new(store.clone(), auth.clone()));

        let pool = Arc::new(ConnectionPool::new(store.clone()));
        pool.start_eviction_task();
        let sessions = Arc::new(SessionManager::new(store.clone(), pool, bus.clone()));

        let sync = Arc::new(SyncService::new(store.clone(), bus.clone()));
        let scheduler = Arc::new(AutoSyncScheduler::new(sync.clone()));
        scheduler.clone().start();

        Ok(Self {
            bus,
            store,
            auth,
            vault,
            sessions,
            sync,
            scheduler,
        })
    }

    /// Graceful shutdown: stop the scheduler, cancel running syncs at their
    /// next batch boundary, close every terminal and wipe cached keys.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        self.sync.shutdown();

        let terminals = self.sessions.list_terminals();
        for terminal in terminals {
            if let Err(e) = self.sessions.close_terminal(&terminal.id).await {
                log::debug!("closing terminal {} on shutdown: {}", terminal.id, e);
            }
        }

        self.auth.lock(crate::events::LockReason::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SetupOptions;
    use crate::error::{AuthError, VaultError};
    use crate::vault::models::ssh::CreateSshProfileRequest;
    use crate::vault::models::AuthPayload;

    async fn workstation() -> Workstation {
        Workstation::open("sqlite::memory:").await.unwrap()
    }

    fn profile_request(name: &str, password: &str) -> CreateSshProfileRequest {
        CreateSshProfileRequest {
            name: name.into(),
            host: "10.0.0.1".into(),
            port: Some(22),
            username: "root".into(),
            group_id: None,
            auth: AuthPayload::Password {
                password: password.into(),
            },
            timeout_secs: None,
            keep_alive: None,
            compression: None,
            proxy: None,
            jump_hosts: None,
            working_dir: None,
            startup_command: None,
            env: None,
            color: None,
        }
    }

    #[tokio::test]
    async fn end_to_end_profile_roundtrip() {
        let workstation = workstation().await;
        workstation
            .auth
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

        let profile = workstation
            .vault
            .create_ssh_profile(profile_request("prod", "s3cret"))
            .await
            .unwrap();

        let loaded = workstation
            .vault
            .get_ssh_profile(&profile.base.id)
            .await
            .unwrap();
        match &loaded.auth {
            AuthPayload::Password { password } => assert_eq!(password, "s3cret"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn cross_device_decryption_flow() {
        // Device A writes a profile.
        let device_a = workstation().await;
        device_a
            .auth
            .setup(
                "passphrase of device A",
                "desktop-a",
                SetupOptions {
                    auto_unlock: false,
                    auto_lock_timeout_minutes: None,
                },
            )
            .await
            .unwrap();
        let profile = device_a
            .vault
            .create_ssh_profile(profile_request("prod", "s3cret"))
            .await
            .unwrap();
        let device_a_id = device_a.store.current_device_id().await.unwrap();

        // Device B receives A's row verbatim (as sync would deliver it).
        let device_b = workstation().await;
        device_b
            .auth
            .setup(
                "passphrase of device B",
                "laptop-b",
                SetupOptions {
                    auto_unlock: false,
                    auto_lock_timeout_minutes: None,
                },
            )
            .await
            .unwrap();

        let documents = device_a.store.fetch_documents("SshProfile").await.unwrap();
        for document in documents {
            device_b.store.apply_document(document).await.unwrap();
        }

        // B cannot open A's ciphertext yet.
        let err = device_b
            .vault
            .get_ssh_profile(&profile.base.id)
            .await
            .unwrap_err();
        match err {
            VaultError::Auth(AuthError::UnknownDeviceKey(device)) => {
                assert_eq!(device, device_a_id)
            }
            other => panic!("expected UnknownDeviceKey, got {:?}", other),
        }

        // Federation: B imports A's auth rows and unlocks them with A's
        // passphrase, after which the profile decrypts.
        let pw_entry = device_a
            .store
            .get_master_password_entry(&device_a_id)
            .await
            .unwrap()
            .unwrap();
        let key_entry = device_a
            .store
            .get_device_key_entry(&device_a_id)
            .await
            .unwrap()
            .unwrap();
        device_b
            .store
            .save_master_password_entry(&pw_entry)
            .await
            .unwrap();
        device_b.store.save_device_key_entry(&key_entry).await.unwrap();

        device_b
            .auth
            .add_device_key(&device_a_id, "passphrase of device A")
            .await
            .unwrap();

        let loaded = device_b
            .vault
            .get_ssh_profile(&profile.base.id)
            .await
            .unwrap();
        match &loaded.auth {
            AuthPayload::Password { password } => assert_eq!(password, "s3cret"),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}

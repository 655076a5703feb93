pub mod engine;
pub mod providers;
pub mod remote;
pub mod resolver;
pub mod scheduler;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};
use crate::events::EventBus;
use crate::sync::engine::SyncEngine;
use crate::sync::remote::{create_remote, RemoteStore};
use crate::vault::models::base::{checksum_of_value, SyncStatus};
use crate::vault::models::{
    ConflictRecord, ConflictResolutionChoice, DatabaseType, ExternalDatabaseConfig, SyncDirection,
    SyncDocument, SyncLog, SyncSettings,
};
use crate::vault::VaultStore;

const SYNC_RETRY_ATTEMPTS: u32 = 3;

/// Per-database status summary for the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSyncStatus {
    pub database_id: String,
    pub name: String,
    pub db_type: DatabaseType,
    pub connected: bool,
    pub auto_sync: bool,
    pub direction: SyncDirection,
    pub last_completed_sync: Option<DateTime<Utc>>,
}

/// The sync operation surface: external database management, connection
/// lifecycle, on-demand and scheduled replication, conflict resolution.
pub struct SyncService {
    store: Arc<VaultStore>,
    engine: SyncEngine,
    remotes: DashMap<String, Arc<Mutex<Box<dyn RemoteStore>>>>,
    run_locks: DashMap<String, Arc<Mutex<()>>>,
    cancel: CancellationToken,
}

impl SyncService {
    pub fn new(store: Arc<VaultStore>, bus: EventBus) -> Self {
        Self {
            engine: SyncEngine::new(store.clone(), bus),
            store,
            remotes: DashMap::new(),
            run_locks: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<VaultStore> {
        &self.store
    }

    /// Cancellation signal honored at batch boundaries by running passes.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // ---- external database management ----

    pub async fn add_external_database(
        &self,
        name: String,
        db_type: DatabaseType,
        connection: String,
        settings: Option<SyncSettings>,
    ) -> SyncResult<ExternalDatabaseConfig> {
        let device_id = self
            .store
            .current_device_id()
            .await
            .map_err(SyncError::Vault)?;

        let mut config = ExternalDatabaseConfig::new(device_id, name, db_type, connection);
        if let Some(settings) = settings {
            config.sync_settings = settings;
        }
        self.store.save_external_database(&mut config).await?;
        Ok(config)
    }

    pub async fn update_external_database(
        &self,
        database_id: &str,
        name: Option<String>,
        connection: Option<String>,
        settings: Option<SyncSettings>,
    ) -> SyncResult<ExternalDatabaseConfig> {
        let mut config = self.store.get_external_database(database_id).await?;
        if let Some(name) = name {
            config.name = name;
        }
        if let Some(connection) = connection {
            config.connection = connection;
        }
        if let Some(settings) = settings {
            config.sync_settings = settings;
        }
        config.base.touch();
        self.store.save_external_database(&mut config).await?;

        // A changed connection invalidates any live handle.
        self.disconnect_from_database(database_id).await?;
        Ok(config)
    }

    pub async fn delete_external_database(&self, database_id: &str) -> SyncResult<()> {
        self.disconnect_from_database(database_id).await?;
        self.store.delete_external_database(database_id).await?;
        Ok(())
    }

    /// Round-trip connectivity probe without keeping the connection.
    pub async fn test_connection(&self, database_id: &str) -> SyncResult<()> {
        let config = self.store.get_external_database(database_id).await?;
        let mut remote = create_remote(&config);
        remote.connect().await?;
        remote.ping().await?;
        remote.disconnect().await
    }

    pub async fn connect_to_database(&self, database_id: &str) -> SyncResult<()> {
        if self.remotes.contains_key(database_id) {
            return Ok(());
        }

        let config = self.store.get_external_database(database_id).await?;
        let mut remote = create_remote(&config);
        remote.connect().await?;

        self.remotes
            .insert(database_id.to_string(), Arc::new(Mutex::new(remote)));
        log::info!("connected to external database {}", config.name);
        Ok(())
    }

    pub async fn disconnect_from_database(&self, database_id: &str) -> SyncResult<()> {
        if let Some((_, remote)) = self.remotes.remove(database_id) {
            let mut remote = remote.lock().await;
            remote.disconnect().await?;
        }
        Ok(())
    }

    // ---- replication ----

    /// Run one sync pass now. Runs against the same database are
    /// serialized; different databases proceed in parallel.
    pub async fn sync_now(
        &self,
        database_id: &str,
        direction: Option<SyncDirection>,
    ) -> SyncResult<SyncLog> {
        self.connect_to_database(database_id).await?;

        let run_lock = self
            .run_locks
            .entry(database_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _running = run_lock.lock().await;

        let config = self.store.get_external_database(database_id).await?;
        let direction = direction.unwrap_or(config.sync_settings.direction);

        let remote = self
            .remotes
            .get(database_id)
            .map(|r| r.clone())
            .ok_or_else(|| SyncError::RemoteUnavailable(database_id.to_string()))?;
        let remote = remote.lock().await;

        // Transient transport failures get a bounded retry with exponential
        // backoff; anything else (conflicts, cancellation) returns as-is.
        let mut delay = std::time::Duration::from_millis(500);
        let mut log = self
            .engine
            .run(remote.as_ref(), &config, direction, &self.cancel)
            .await?;
        for attempt in 1..SYNC_RETRY_ATTEMPTS {
            if log.status != crate::vault::models::SyncRunStatus::Failed {
                break;
            }
            log::info!(
                "sync of {} failed, retrying (attempt {} of {})",
                config.name,
                attempt + 1,
                SYNC_RETRY_ATTEMPTS
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
            log = self
                .engine
                .run(remote.as_ref(), &config, direction, &self.cancel)
                .await?;
        }
        Ok(log)
    }

    pub async fn enable_auto_sync(&self, database_id: &str) -> SyncResult<()> {
        self.set_auto_sync(database_id, true).await
    }

    pub async fn disable_auto_sync(&self, database_id: &str) -> SyncResult<()> {
        self.set_auto_sync(database_id, false).await
    }

    async fn set_auto_sync(&self, database_id: &str, enabled: bool) -> SyncResult<()> {
        let config = self.store.get_external_database_raw(database_id).await?;
        let mut config =
            config.ok_or_else(|| SyncError::RemoteUnavailable(database_id.to_string()))?;
        config.sync_settings.auto_sync = enabled;
        self.store
            .update_sync_settings(database_id, &config.sync_settings)
            .await?;
        Ok(())
    }

    pub async fn get_sync_status(&self) -> SyncResult<Vec<DatabaseSyncStatus>> {
        let configs = self.store.list_external_databases().await?;
        let mut statuses = Vec::with_capacity(configs.len());

        for config in configs {
            let last = self.store.last_completed_sync(&config.base.id).await?;
            statuses.push(DatabaseSyncStatus {
                connected: self.remotes.contains_key(&config.base.id),
                database_id: config.base.id.clone(),
                name: config.name,
                db_type: config.db_type,
                auto_sync: config.sync_settings.auto_sync,
                direction: config.sync_settings.direction,
                last_completed_sync: last,
            });
        }
        Ok(statuses)
    }

    pub async fn get_sync_logs(
        &self,
        database_id: Option<&str>,
        limit: Option<u32>,
    ) -> SyncResult<Vec<SyncLog>> {
        Ok(self.store.list_sync_logs(database_id, limit).await?)
    }

    pub async fn get_unresolved_conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        Ok(self.store.list_unresolved_conflicts().await?)
    }

    /// Resolve a held conflict by picking a side. Picking local bumps its
    /// version past the remote snapshot so the next pass propagates it;
    /// picking remote applies the remote snapshot immediately.
    pub async fn resolve_conflict(&self, conflict_id: &str, use_local: bool) -> SyncResult<()> {
        let conflict = self.store.get_conflict(conflict_id).await?;
        if conflict.resolved {
            return Ok(());
        }

        let local: SyncDocument = serde_json::from_value(conflict.local_snapshot.clone())?;
        let remote: SyncDocument = serde_json::from_value(conflict.remote_snapshot.clone())?;

        if use_local {
            let mut winner = local;
            winner.version = winner.version.max(remote.version) + 1;
            winner.updated_at = Utc::now();
            patch_payload_base(&mut winner);

            let entity = winner.entity_type.clone();
            let id = winner.id.clone();
            self.store.apply_document(winner).await?;
            self.store
                .set_record_sync_status(&entity, &id, SyncStatus::Pending)
                .await?;
        } else {
            self.store.apply_document(remote).await?;
        }

        self.store
            .mark_conflict_resolved(
                conflict_id,
                if use_local {
                    ConflictResolutionChoice::UseLocal
                } else {
                    ConflictResolutionChoice::UseRemote
                },
            )
            .await?;
        Ok(())
    }
}

/// Keep the embedded record's base fields consistent with the document
/// header after a version/timestamp bump, and refresh the checksum.
fn patch_payload_base(doc: &mut SyncDocument) {
    if let Some(map) = doc.payload.as_object_mut() {
        map.insert("version".to_string(), serde_json::json!(doc.version));
        map.insert(
            "updatedAt".to_string(),
            serde_json::to_value(doc.updated_at).unwrap_or_default(),
        );
    }
    doc.checksum = checksum_of_value(doc.payload.clone());
    if let Some(map) = doc.payload.as_object_mut() {
        map.insert("checksum".to_string(), serde_json::json!(doc.checksum));
    }
}

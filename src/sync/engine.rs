use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};
use crate::events::{Event, EventBus, Topic};
use crate::sync::remote::RemoteStore;
use crate::sync::resolver::{self, MergeAction, Winner};
use crate::vault::models::base::SyncStatus;
use crate::vault::models::{
    ConflictRecord, ConflictStrategy, DeleteMarker, ExternalDatabaseConfig, SyncDirection,
    SyncDocument, SyncLog, SyncRunStatus,
};
use crate::vault::store::sync::SYNCED_ENTITIES;
use crate::vault::VaultStore;

#[derive(Debug, Default, Clone)]
struct PassStats {
    records_synced: u64,
    conflicts_resolved: u64,
    conflicts_pending: u64,
}

impl PassStats {
    fn merge(&mut self, other: PassStats) {
        self.records_synced += other.records_synced;
        self.conflicts_resolved += other.conflicts_resolved;
        self.conflicts_pending += other.conflicts_pending;
    }
}

/// The replication engine: pushes, pulls and merges documents between the
/// local vault and one remote, detecting and resolving conflicts per the
/// configured strategy. Delete markers are exchanged first so a replica
/// that missed a delete does not resurrect the record.
pub struct SyncEngine {
    store: Arc<VaultStore>,
    bus: EventBus,
}

impl SyncEngine {
    pub fn new(store: Arc<VaultStore>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Run one sync pass. The log row is written up front and finalized on
    /// every exit path — sync history is never dropped.
    pub async fn run(
        &self,
        remote: &dyn RemoteStore,
        config: &ExternalDatabaseConfig,
        direction: SyncDirection,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncLog> {
        let device_id = self
            .store
            .current_device_id()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        let mut log = SyncLog::start(config.base.id.clone(), device_id, direction);
        self.store.save_sync_log(&log).await?;

        self.bus.publish(
            &Topic::Sync,
            Event::SyncStarted {
                database_id: config.base.id.clone(),
                direction: direction.to_string(),
            },
        );

        let strategy = config.sync_settings.strategy;
        let result = self
            .run_inner(remote, config, direction, strategy, cancel)
            .await;

        log.completed_at = Some(Utc::now());
        let ok = match result {
            Ok(stats) => {
                log.status = SyncRunStatus::Completed;
                log.records_synced = stats.records_synced;
                log.conflicts_resolved = stats.conflicts_resolved;
                log.conflicts_pending = stats.conflicts_pending;
                true
            }
            Err(SyncError::Cancelled) => {
                log.status = SyncRunStatus::Cancelled;
                log.error_message = Some("cancelled".to_string());
                false
            }
            Err(e) => {
                log.status = SyncRunStatus::Failed;
                log.error_message = Some(e.to_string());
                false
            }
        };
        self.store.save_sync_log(&log).await?;

        self.bus.publish(
            &Topic::Sync,
            Event::SyncCompleted {
                database_id: config.base.id.clone(),
                ok,
                records_synced: log.records_synced,
                conflicts_resolved: log.conflicts_resolved,
                conflicts_pending: log.conflicts_pending,
            },
        );

        Ok(log)
    }

    async fn run_inner(
        &self,
        remote: &dyn RemoteStore,
        config: &ExternalDatabaseConfig,
        direction: SyncDirection,
        strategy: ConflictStrategy,
        cancel: &CancellationToken,
    ) -> SyncResult<PassStats> {
        remote.ensure_schema().await?;

        let local_markers = self.store.list_delete_markers(None).await?;
        let remote_markers = remote.fetch_delete_markers(None).await?;

        let mut stats = PassStats::default();
        for entity in SYNCED_ENTITIES {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let entity_stats = match direction {
                SyncDirection::Push => {
                    self.push_entity(remote, config, entity, strategy, &local_markers, cancel)
                        .await?
                }
                SyncDirection::Pull => {
                    self.pull_entity(remote, config, entity, strategy, &remote_markers, cancel)
                        .await?
                }
                SyncDirection::Bidirectional => {
                    self.merge_entity(
                        remote,
                        config,
                        entity,
                        strategy,
                        &local_markers,
                        &remote_markers,
                        cancel,
                    )
                    .await?
                }
            };

            self.bus.publish(
                &Topic::Sync,
                Event::SyncProgress {
                    database_id: config.base.id.clone(),
                    entity: entity.to_string(),
                    processed: entity_stats.records_synced,
                },
            );
            stats.merge(entity_stats);
        }

        Ok(stats)
    }

    /// Local → remote: only records flagged pending/failed are considered.
    async fn push_entity(
        &self,
        remote: &dyn RemoteStore,
        config: &ExternalDatabaseConfig,
        entity: &str,
        strategy: ConflictStrategy,
        local_markers: &[DeleteMarker],
        cancel: &CancellationToken,
    ) -> SyncResult<PassStats> {
        let mut stats = PassStats::default();
        let mut remote_map = to_map(remote.fetch_documents(entity).await?);

        self.push_markers(remote, entity, local_markers, &mut remote_map)
            .await?;

        for local in self.store.fetch_documents(entity).await? {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if !matches!(local.sync_status, SyncStatus::Pending | SyncStatus::Failed) {
                continue;
            }

            match remote_map.get(&local.id) {
                None => {
                    self.propagate_local(remote, entity, &local).await?;
                    stats.records_synced += 1;
                }
                Some(remote_doc) if remote_doc.version < local.version => {
                    self.propagate_local(remote, entity, &local).await?;
                    stats.records_synced += 1;
                }
                Some(remote_doc) if remote_doc.version > local.version => {
                    self.handle_conflict(remote, config, strategy, &local, remote_doc, &mut stats)
                        .await?;
                }
                Some(_) => {
                    // Same version on both sides: reconcile the flag.
                    self.store
                        .set_record_sync_status(entity, &local.id, SyncStatus::Synced)
                        .await?;
                    stats.records_synced += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Remote → local: higher remote versions overwrite, inserts create
    /// records (secret fields stay sealed under their origin device key).
    async fn pull_entity(
        &self,
        remote: &dyn RemoteStore,
        config: &ExternalDatabaseConfig,
        entity: &str,
        strategy: ConflictStrategy,
        remote_markers: &[DeleteMarker],
        cancel: &CancellationToken,
    ) -> SyncResult<PassStats> {
        let mut stats = PassStats::default();
        let mut local_map = to_map(self.store.fetch_documents(entity).await?);

        self.apply_remote_markers(entity, remote_markers, &mut local_map)
            .await?;

        for remote_doc in remote.fetch_documents(entity).await? {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            match local_map.get(&remote_doc.id) {
                None => {
                    if self.locally_deleted_after(entity, &remote_doc).await? {
                        continue;
                    }
                    self.store.apply_document(remote_doc).await?;
                    stats.records_synced += 1;
                }
                Some(local) if local.version < remote_doc.version => {
                    self.store.apply_document(remote_doc).await?;
                    stats.records_synced += 1;
                }
                Some(local) if local.version > remote_doc.version => {
                    self.handle_conflict(remote, config, strategy, local, &remote_doc, &mut stats)
                        .await?;
                }
                Some(local) => {
                    self.store
                        .set_record_sync_status(entity, &local.id, SyncStatus::Synced)
                        .await?;
                    stats.records_synced += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Full merge pass over the union of both sides.
    #[allow(clippy::too_many_arguments)]
    async fn merge_entity(
        &self,
        remote: &dyn RemoteStore,
        config: &ExternalDatabaseConfig,
        entity: &str,
        strategy: ConflictStrategy,
        local_markers: &[DeleteMarker],
        remote_markers: &[DeleteMarker],
        cancel: &CancellationToken,
    ) -> SyncResult<PassStats> {
        let mut stats = PassStats::default();
        let mut local_map = to_map(self.store.fetch_documents(entity).await?);
        let mut remote_map = to_map(remote.fetch_documents(entity).await?);

        self.apply_remote_markers(entity, remote_markers, &mut local_map)
            .await?;
        self.push_markers(remote, entity, local_markers, &mut remote_map)
            .await?;

        let mut ids: Vec<String> = local_map.keys().cloned().collect();
        for id in remote_map.keys() {
            if !local_map.contains_key(id) {
                ids.push(id.clone());
            }
        }

        for id in ids {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            match (local_map.get(&id), remote_map.get(&id)) {
                (Some(local), None) => {
                    self.propagate_local(remote, entity, local).await?;
                    stats.records_synced += 1;
                }
                (None, Some(remote_doc)) => {
                    if self.locally_deleted_after(entity, remote_doc).await? {
                        continue;
                    }
                    self.store.apply_document(remote_doc.clone()).await?;
                    stats.records_synced += 1;
                }
                (Some(local), Some(remote_doc)) => match resolver::decide(local, remote_doc) {
                    MergeAction::AlreadySynced => {
                        if local.sync_status != SyncStatus::Synced {
                            self.store
                                .set_record_sync_status(entity, &id, SyncStatus::Synced)
                                .await?;
                        }
                    }
                    MergeAction::PropagateLocal => {
                        self.propagate_local(remote, entity, local).await?;
                        stats.records_synced += 1;
                    }
                    MergeAction::PropagateRemote => {
                        self.store.apply_document(remote_doc.clone()).await?;
                        stats.records_synced += 1;
                    }
                    MergeAction::Conflict => {
                        self.handle_conflict(
                            remote, config, strategy, local, remote_doc, &mut stats,
                        )
                        .await?;
                    }
                },
                (None, None) => {}
            }
        }
        Ok(stats)
    }

    async fn propagate_local(
        &self,
        remote: &dyn RemoteStore,
        entity: &str,
        local: &SyncDocument,
    ) -> SyncResult<()> {
        let mut outbound = local.clone();
        outbound.sync_status = SyncStatus::Synced;
        remote.upsert_document(&outbound).await?;
        self.store
            .set_record_sync_status(entity, &local.id, SyncStatus::Synced)
            .await?;
        Ok(())
    }

    async fn handle_conflict(
        &self,
        remote: &dyn RemoteStore,
        config: &ExternalDatabaseConfig,
        strategy: ConflictStrategy,
        local: &SyncDocument,
        remote_doc: &SyncDocument,
        stats: &mut PassStats,
    ) -> SyncResult<()> {
        match resolver::pick_winner(strategy, local, remote_doc) {
            Winner::Local => {
                // Overwrite the remote copy; both replicas now hold the
                // local payload at the same version, so the next merge
                // sees them as equal.
                self.propagate_local(remote, &local.entity_type, local)
                    .await?;
                stats.conflicts_resolved += 1;
                stats.records_synced += 1;
            }
            Winner::Remote => {
                self.store.apply_document(remote_doc.clone()).await?;
                stats.conflicts_resolved += 1;
                stats.records_synced += 1;
            }
            Winner::Manual => {
                let conflict = ConflictRecord::new(
                    config.base.id.clone(),
                    local.entity_type.clone(),
                    local.id.clone(),
                    serde_json::to_value(local)?,
                    serde_json::to_value(remote_doc)?,
                );
                self.store.save_conflict(&conflict).await?;
                self.store
                    .set_record_sync_status(&local.entity_type, &local.id, SyncStatus::Conflicting)
                    .await?;
                stats.conflicts_pending += 1;
                log::info!(
                    "conflict on {} {} held for manual resolution",
                    local.entity_type,
                    local.id
                );
            }
        }
        Ok(())
    }

    /// Replay the remote's delete markers against local records. A marker
    /// only wins over a record that was not modified after the delete.
    async fn apply_remote_markers(
        &self,
        entity: &str,
        remote_markers: &[DeleteMarker],
        local_map: &mut HashMap<String, SyncDocument>,
    ) -> SyncResult<()> {
        for marker in remote_markers.iter().filter(|m| m.entity_type == entity) {
            match local_map.get(&marker.record_id) {
                Some(local) if local.updated_at <= marker.deleted_at => {
                    self.store.apply_delete_marker(marker).await?;
                    local_map.remove(&marker.record_id);
                }
                Some(_) => {
                    // Record was rewritten after the delete; it survives.
                }
                None => {
                    self.store.insert_delete_marker(marker).await?;
                }
            }
        }
        Ok(())
    }

    /// Mirror local delete markers to the remote and delete the documents
    /// they point at, unless the remote copy is newer than the delete.
    async fn push_markers(
        &self,
        remote: &dyn RemoteStore,
        entity: &str,
        local_markers: &[DeleteMarker],
        remote_map: &mut HashMap<String, SyncDocument>,
    ) -> SyncResult<()> {
        for marker in local_markers.iter().filter(|m| m.entity_type == entity) {
            remote.upsert_delete_marker(marker).await?;
            if let Some(remote_doc) = remote_map.get(&marker.record_id) {
                if remote_doc.updated_at <= marker.deleted_at {
                    remote.delete_document(entity, &marker.record_id).await?;
                    remote_map.remove(&marker.record_id);
                }
            }
        }
        Ok(())
    }

    async fn locally_deleted_after(
        &self,
        entity: &str,
        remote_doc: &SyncDocument,
    ) -> SyncResult<bool> {
        let markers = self.store.list_delete_markers(None).await?;
        Ok(markers.iter().any(|m| {
            m.entity_type == entity
                && m.record_id == remote_doc.id
                && m.deleted_at >= remote_doc.updated_at
        }))
    }
}

fn to_map(documents: Vec<SyncDocument>) -> HashMap<String, SyncDocument> {
    documents
        .into_iter()
        .map(|doc| (doc.id.clone(), doc))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::MemoryRemote;
    use crate::vault::models::{DatabaseType, SavedCommand};
    use crate::vault::store::test_support::unlocked_store_for;

    struct Fixture {
        store_a: Arc<VaultStore>,
        store_b: Arc<VaultStore>,
        engine_a: SyncEngine,
        engine_b: SyncEngine,
        remote: MemoryRemote,
        config: ExternalDatabaseConfig,
        cancel: CancellationToken,
    }

    async fn fixture(strategy: ConflictStrategy) -> Fixture {
        let store_a = Arc::new(unlocked_store_for("dev-a").await);
        let store_b = Arc::new(unlocked_store_for("dev-b").await);

        let mut config = ExternalDatabaseConfig::new(
            "dev-a".into(),
            "shared".into(),
            DatabaseType::Postgres,
            "postgres://unused".into(),
        );
        config.sync_settings.strategy = strategy;

        Fixture {
            engine_a: SyncEngine::new(store_a.clone(), EventBus::new()),
            engine_b: SyncEngine::new(store_b.clone(), EventBus::new()),
            store_a,
            store_b,
            remote: MemoryRemote::new(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    impl Fixture {
        async fn sync_a(&self, direction: SyncDirection) -> SyncLog {
            self.engine_a
                .run(&self.remote, &self.config, direction, &self.cancel)
                .await
                .unwrap()
        }

        async fn sync_b(&self, direction: SyncDirection) -> SyncLog {
            self.engine_b
                .run(&self.remote, &self.config, direction, &self.cancel)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn push_then_pull_replicates_and_reconciles() {
        let fixture = fixture(ConflictStrategy::LastWriteWins).await;

        let mut command = SavedCommand::new("dev-a".into(), "disk".into(), "df -h".into());
        fixture.store_a.save_saved_command(&mut command).await.unwrap();

        let log = fixture.sync_a(SyncDirection::Push).await;
        assert_eq!(log.status, SyncRunStatus::Completed);
        assert_eq!(log.records_synced, 1);
        assert!(fixture.remote.document("SavedCommand", &command.base.id).is_some());

        // Local side reconciled to synced.
        let local = fixture
            .store_a
            .get_saved_command(&command.base.id)
            .await
            .unwrap();
        assert_eq!(local.base.sync_status, SyncStatus::Synced);

        let log = fixture.sync_b(SyncDirection::Pull).await;
        assert_eq!(log.records_synced, 1);
        let replica = fixture
            .store_b
            .get_saved_command(&command.base.id)
            .await
            .unwrap();
        assert_eq!(replica.command, "df -h");
        assert_eq!(replica.base.version, command.base.version);
        assert_eq!(replica.base.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn bidirectional_conflict_last_write_wins_converges_to_newer_side() {
        let fixture = fixture(ConflictStrategy::LastWriteWins).await;

        // Reach a synced state of the record on both devices.
        let mut command = SavedCommand::new("dev-a".into(), "svc".into(), "systemctl status".into());
        fixture.store_a.save_saved_command(&mut command).await.unwrap();
        fixture.sync_a(SyncDirection::Bidirectional).await;
        fixture.sync_b(SyncDirection::Bidirectional).await;

        // Both sides edit: A first, B later in wall time.
        let mut on_a = fixture
            .store_a
            .get_saved_command(&command.base.id)
            .await
            .unwrap();
        on_a.command = "edit from A".into();
        on_a.base.touch();
        fixture.store_a.save_saved_command(&mut on_a).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let mut on_b = fixture
            .store_b
            .get_saved_command(&command.base.id)
            .await
            .unwrap();
        on_b.command = "edit from B".into();
        on_b.base.touch();
        fixture.store_b.save_saved_command(&mut on_b).await.unwrap();
        assert_eq!(on_a.base.version, on_b.base.version);

        // A reaches the remote first, then B's pass detects the conflict.
        fixture.sync_a(SyncDirection::Bidirectional).await;
        let log = fixture.sync_b(SyncDirection::Bidirectional).await;
        assert_eq!(log.conflicts_resolved, 1);
        assert_eq!(log.conflicts_pending, 0);

        // A's next pass converges it to B's payload too.
        let log = fixture.sync_a(SyncDirection::Bidirectional).await;
        assert_eq!(log.conflicts_resolved, 1);

        let final_a = fixture
            .store_a
            .get_saved_command(&command.base.id)
            .await
            .unwrap();
        let final_b = fixture
            .store_b
            .get_saved_command(&command.base.id)
            .await
            .unwrap();
        assert_eq!(final_a.command, "edit from B");
        assert_eq!(final_b.command, "edit from B");
        assert_eq!(final_a.base.checksum, final_b.base.checksum);
    }

    #[tokio::test]
    async fn manual_strategy_holds_both_snapshots_and_mutates_nothing() {
        let fixture = fixture(ConflictStrategy::Manual).await;

        let mut command = SavedCommand::new("dev-a".into(), "svc".into(), "uptime".into());
        fixture.store_a.save_saved_command(&mut command).await.unwrap();
        fixture.sync_a(SyncDirection::Bidirectional).await;
        fixture.sync_b(SyncDirection::Bidirectional).await;

        let mut on_a = fixture
            .store_a
            .get_saved_command(&command.base.id)
            .await
            .unwrap();
        on_a.command = "A version".into();
        on_a.base.touch();
        fixture.store_a.save_saved_command(&mut on_a).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let mut on_b = fixture
            .store_b
            .get_saved_command(&command.base.id)
            .await
            .unwrap();
        on_b.command = "B version".into();
        on_b.base.touch();
        fixture.store_b.save_saved_command(&mut on_b).await.unwrap();

        fixture.sync_a(SyncDirection::Bidirectional).await;
        let log = fixture.sync_b(SyncDirection::Bidirectional).await;
        assert_eq!(log.conflicts_pending, 1);
        assert_eq!(log.conflicts_resolved, 0);

        // Neither side was overwritten.
        let still_a = fixture
            .store_a
            .get_saved_command(&command.base.id)
            .await
            .unwrap();
        let still_b = fixture
            .store_b
            .get_saved_command(&command.base.id)
            .await
            .unwrap();
        assert_eq!(still_a.command, "A version");
        assert_eq!(still_b.command, "B version");

        let conflicts = fixture.store_b.list_unresolved_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].entity_id, command.base.id);
        assert!(conflicts[0].local_snapshot.to_string().contains("B version"));
        assert!(conflicts[0].remote_snapshot.to_string().contains("A version"));

        // The local record is flagged so the UI can surface it.
        assert_eq!(still_b.base.sync_status, SyncStatus::Conflicting);
    }

    #[tokio::test]
    async fn deletes_replicate_via_markers_instead_of_resurrecting() {
        let fixture = fixture(ConflictStrategy::LastWriteWins).await;

        let mut command = SavedCommand::new("dev-a".into(), "tmp".into(), "mktemp".into());
        fixture.store_a.save_saved_command(&mut command).await.unwrap();
        fixture.sync_a(SyncDirection::Bidirectional).await;
        fixture.sync_b(SyncDirection::Bidirectional).await;

        fixture
            .store_a
            .delete_saved_command(&command.base.id)
            .await
            .unwrap();
        fixture.sync_a(SyncDirection::Bidirectional).await;
        assert!(fixture.remote.document("SavedCommand", &command.base.id).is_none());

        // B still holds the record until its next pass replays the marker.
        assert!(fixture
            .store_b
            .get_saved_command(&command.base.id)
            .await
            .is_ok());
        fixture.sync_b(SyncDirection::Bidirectional).await;
        assert!(fixture
            .store_b
            .get_saved_command(&command.base.id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn cancelled_run_is_logged_as_cancelled() {
        let fixture = fixture(ConflictStrategy::LastWriteWins).await;
        fixture.cancel.cancel();

        let log = fixture
            .engine_a
            .run(
                &fixture.remote,
                &fixture.config,
                SyncDirection::Bidirectional,
                &fixture.cancel,
            )
            .await
            .unwrap();
        assert_eq!(log.status, SyncRunStatus::Cancelled);
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{SyncError, SyncResult};
use crate::vault::models::{DatabaseType, DeleteMarker, ExternalDatabaseConfig, SyncDocument};

/// Remote collection/table names, one per replicated entity type.
pub fn remote_table(entity_type: &str) -> SyncResult<&'static str> {
    match entity_type {
        "SshProfile" => Ok("ssh_profiles"),
        "SshGroup" => Ok("ssh_groups"),
        "SshKey" => Ok("ssh_keys"),
        "SavedCommand" => Ok("saved_commands"),
        "SavedCommandGroup" => Ok("saved_command_groups"),
        other => Err(SyncError::SchemaMismatch(format!(
            "unknown entity type {}",
            other
        ))),
    }
}

pub const DELETE_MARKER_TABLE: &str = "kerminal_delete_markers";

/// A replication target. The engine only reads and writes documents; the
/// provider owns connection state and schema. Secret fields arrive sealed
/// and are stored sealed — a remote never holds plaintext.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn connect(&mut self) -> SyncResult<()>;
    async fn disconnect(&mut self) -> SyncResult<()>;
    fn is_connected(&self) -> bool;

    /// Cheap liveness round-trip.
    async fn ping(&self) -> SyncResult<()>;

    /// Create the per-entity tables/collections if missing. Idempotent.
    async fn ensure_schema(&self) -> SyncResult<()>;

    async fn fetch_documents(&self, entity_type: &str) -> SyncResult<Vec<SyncDocument>>;
    async fn upsert_document(&self, doc: &SyncDocument) -> SyncResult<()>;
    async fn delete_document(&self, entity_type: &str, id: &str) -> SyncResult<()>;

    async fn fetch_delete_markers(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<DeleteMarker>>;
    async fn upsert_delete_marker(&self, marker: &DeleteMarker) -> SyncResult<()>;

    fn provider_type(&self) -> DatabaseType;
}

/// Build the provider for a config whose connection descriptor has already
/// been opened by the vault.
pub fn create_remote(config: &ExternalDatabaseConfig) -> Box<dyn RemoteStore> {
    match config.db_type {
        DatabaseType::Mysql => Box::new(crate::sync::providers::mysql::MysqlRemote::new(
            config.connection.clone(),
        )),
        DatabaseType::Postgres => Box::new(crate::sync::providers::postgres::PostgresRemote::new(
            config.connection.clone(),
        )),
        DatabaseType::Mongodb => Box::new(crate::sync::providers::mongodb::MongoRemote::new(
            config.connection.clone(),
        )),
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};

use crate::error::{SyncError, SyncResult};
use crate::sync::remote::{remote_table, RemoteStore, DELETE_MARKER_TABLE};
use crate::vault::models::base::SyncStatus;
use crate::vault::models::{DatabaseType, DeleteMarker, SyncDocument};
use crate::vault::store::sync::SYNCED_ENTITIES;

/// MySQL replication target. One table per entity: base-record columns as
/// real columns plus the entity payload as a JSON document.
pub struct MysqlRemote {
    url: String,
    pool: Option<MySqlPool>,
}

impl MysqlRemote {
    pub fn new(url: String) -> Self {
        Self { url, pool: None }
    }

    fn pool(&self) -> SyncResult<&MySqlPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| SyncError::RemoteUnavailable("mysql: not connected".into()))
    }
}

#[async_trait]
impl RemoteStore for MysqlRemote {
    async fn connect(&mut self) -> SyncResult<()> {
        if self.pool.is_some() {
            return Ok(());
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(3)
            .connect(&self.url)
            .await
            .map_err(|e| SyncError::RemoteUnavailable(format!("mysql: {}", e)))?;
        self.pool = Some(pool);
        self.ensure_schema().await
    }

    async fn disconnect(&mut self) -> SyncResult<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pool.is_some()
    }

    async fn ping(&self) -> SyncResult<()> {
        sqlx::query("SELECT 1")
            .execute(self.pool()?)
            .await
            .map_err(|e| SyncError::RemoteUnavailable(format!("mysql: {}", e)))?;
        Ok(())
    }

    async fn ensure_schema(&self) -> SyncResult<()> {
        let pool = self.pool()?;
        for entity in SYNCED_ENTITIES {
            let table = remote_table(entity)?;
            sqlx::query(&format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    id VARCHAR(64) PRIMARY KEY,
                    entity_type VARCHAR(64) NOT NULL,
                    created_at DATETIME(3) NOT NULL,
                    updated_at DATETIME(3) NOT NULL,
                    device_id VARCHAR(64) NOT NULL,
                    version BIGINT NOT NULL,
                    sync_status VARCHAR(16) NOT NULL,
                    checksum VARCHAR(64) NOT NULL,
                    payload LONGTEXT NOT NULL
                )"#,
                table
            ))
            .execute(pool)
            .await
            .map_err(|e| SyncError::Transport(format!("mysql schema: {}", e)))?;
        }

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                id VARCHAR(64) PRIMARY KEY,
                entity_type VARCHAR(64) NOT NULL,
                record_id VARCHAR(64) NOT NULL,
                device_id VARCHAR(64) NOT NULL,
                deleted_at DATETIME(3) NOT NULL
            )"#,
            DELETE_MARKER_TABLE
        ))
        .execute(pool)
        .await
        .map_err(|e| SyncError::Transport(format!("mysql schema: {}", e)))?;
        Ok(())
    }

    async fn fetch_documents(&self, entity_type: &str) -> SyncResult<Vec<SyncDocument>> {
        let table = remote_table(entity_type)?;
        let rows = sqlx::query(&format!("SELECT * FROM {}", table))
            .fetch_all(self.pool()?)
            .await
            .map_err(|e| SyncError::Transport(format!("mysql: {}", e)))?;

        rows.iter()
            .map(|row| {
                Ok(SyncDocument {
                    id: row.get("id"),
                    entity_type: row.get("entity_type"),
                    created_at: row.get::<DateTime<Utc>, _>("created_at"),
                    updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
                    device_id: row.get("device_id"),
                    version: row.get::<i64, _>("version") as u64,
                    sync_status: row
                        .get::<String, _>("sync_status")
                        .parse::<SyncStatus>()
                        .unwrap_or(SyncStatus::Synced),
                    checksum: row.get("checksum"),
                    payload: serde_json::from_str(&row.get::<String, _>("payload"))?,
                })
            })
            .collect()
    }

    async fn upsert_document(&self, doc: &SyncDocument) -> SyncResult<()> {
        let table = remote_table(&doc.entity_type)?;
        sqlx::query(&format!(
            r#"INSERT INTO {} (id, entity_type, created_at, updated_at, device_id,
                               version, sync_status, checksum, payload)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON DUPLICATE KEY UPDATE
                   updated_at = VALUES(updated_at),
                   device_id = VALUES(device_id),
                   version = VALUES(version),
                   sync_status = VALUES(sync_status),
                   checksum = VALUES(checksum),
                   payload = VALUES(payload)"#,
            table
        ))
        .bind(&doc.id)
        .bind(&doc.entity_type)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .bind(&doc.device_id)
        .bind(doc.version as i64)
        .bind(SyncStatus::Synced.to_string())
        .bind(&doc.checksum)
        .bind(doc.payload.to_string())
        .execute(self.pool()?)
        .await
        .map_err(|e| SyncError::Transport(format!("mysql: {}", e)))?;
        Ok(())
    }

    async fn delete_document(&self, entity_type: &str, id: &str) -> SyncResult<()> {
        let table = remote_table(entity_type)?;
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?", table))
            .bind(id)
            .execute(self.pool()?)
            .await
            .map_err(|e| SyncError::Transport(format!("mysql: {}", e)))?;
        Ok(())
    }

    async fn fetch_delete_markers(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<DeleteMarker>> {
        let pool = self.pool()?;
        let rows = match since {
            Some(since) => sqlx::query(&format!(
                "SELECT * FROM {} WHERE deleted_at > ?",
                DELETE_MARKER_TABLE
            ))
            .bind(since)
            .fetch_all(pool)
            .await,
            None => sqlx::query(&format!("SELECT * FROM {}", DELETE_MARKER_TABLE))
                .fetch_all(pool)
                .await,
        }
        .map_err(|e| SyncError::Transport(format!("mysql: {}", e)))?;

        Ok(rows
            .iter()
            .map(|row| DeleteMarker {
                id: row.get("id"),
                entity_type: row.get("entity_type"),
                record_id: row.get("record_id"),
                device_id: row.get("device_id"),
                deleted_at: row.get::<DateTime<Utc>, _>("deleted_at"),
            })
            .collect())
    }

    async fn upsert_delete_marker(&self, marker: &DeleteMarker) -> SyncResult<()> {
        sqlx::query(&format!(
            r#"INSERT INTO {} (id, entity_type, record_id, device_id, deleted_at)
               VALUES (?, ?, ?, ?, ?)
               ON DUPLICATE KEY UPDATE deleted_at = VALUES(deleted_at)"#,
            DELETE_MARKER_TABLE
        ))
        .bind(&marker.id)
        .bind(&marker.entity_type)
        .bind(&marker.record_id)
        .bind(&marker.device_id)
        .bind(marker.deleted_at)
        .execute(self.pool()?)
        .await
        .map_err(|e| SyncError::Transport(format!("mysql: {}", e)))?;
        Ok(())
    }

    fn provider_type(&self) -> DatabaseType {
        DatabaseType::Mysql
    }
}

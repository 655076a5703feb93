use sqlx::Row;

use crate::error::{VaultError, VaultResult};
use crate::vault::models::base::Record;
use crate::vault::models::{SavedCommand, SavedCommandGroup};
use crate::vault::store::ssh::base_from_row;
use crate::vault::store::VaultStore;

impl VaultStore {
    // ---- saved commands ----

    pub async fn save_saved_command(&self, command: &mut SavedCommand) -> VaultResult<()> {
        self.prepare_save(command).await?;
        Self::finalize_checksum(command);
        self.write_command_row(command).await
    }

    pub async fn apply_remote_saved_command(&self, command: &SavedCommand) -> VaultResult<()> {
        let mut replicated = command.clone();
        replicated.base.sync_status = crate::vault::models::SyncStatus::Synced;
        self.write_command_row(&replicated).await
    }

    pub async fn get_saved_command(&self, id: &str) -> VaultResult<SavedCommand> {
        let row = sqlx::query("SELECT * FROM saved_commands WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;
        row.map(|r| command_from_row(&r))
            .transpose()?
            .ok_or_else(|| VaultError::NotFound(format!("saved command {}", id)))
    }

    pub async fn list_saved_commands(&self) -> VaultResult<Vec<SavedCommand>> {
        let rows = sqlx::query("SELECT * FROM saved_commands ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;
        rows.iter().map(command_from_row).collect()
    }

    pub async fn delete_saved_command(&self, id: &str) -> VaultResult<()> {
        let result = sqlx::query("DELETE FROM saved_commands WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(VaultError::NotFound(format!("saved command {}", id)));
        }
        self.record_delete_marker(SavedCommand::entity_type(), id)
            .await
    }

    /// Usage tracking bumps the counter without a version bump; counters are
    /// device-local telemetry, not synced content worth a conflict.
    pub async fn increment_command_usage(&self, id: &str) -> VaultResult<()> {
        let result = sqlx::query("UPDATE saved_commands SET use_count = use_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(VaultError::NotFound(format!("saved command {}", id)));
        }
        Ok(())
    }

    pub async fn toggle_command_favorite(&self, id: &str) -> VaultResult<SavedCommand> {
        let mut command = self.get_saved_command(id).await?;
        command.favorite = !command.favorite;
        command.base.touch();
        self.save_saved_command(&mut command).await?;
        Ok(command)
    }

    async fn write_command_row(&self, command: &SavedCommand) -> VaultResult<()> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO saved_commands (
                id, name, command, description, tags, favorite, use_count, group_id,
                created_at, updated_at, device_id, version, sync_status, checksum
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&command.base.id)
        .bind(&command.name)
        .bind(&command.command)
        .bind(&command.description)
        .bind(serde_json::to_string(&command.tags)?)
        .bind(command.favorite)
        .bind(command.use_count as i64)
        .bind(&command.group_id)
        .bind(command.base.created_at)
        .bind(command.base.updated_at)
        .bind(&command.base.device_id)
        .bind(command.base.version as i64)
        .bind(command.base.sync_status.to_string())
        .bind(&command.base.checksum)
        .execute(&self.pool)
        .await
        .map_err(|e| VaultError::Query(e.to_string()))?;
        Ok(())
    }

    // ---- saved command groups ----

    pub async fn save_saved_command_group(
        &self,
        group: &mut SavedCommandGroup,
    ) -> VaultResult<()> {
        self.prepare_save(group).await?;
        Self::finalize_checksum(group);
        self.write_command_group_row(group).await
    }

    pub async fn apply_remote_saved_command_group(
        &self,
        group: &SavedCommandGroup,
    ) -> VaultResult<()> {
        let mut replicated = group.clone();
        replicated.base.sync_status = crate::vault::models::SyncStatus::Synced;
        self.write_command_group_row(&replicated).await
    }

    pub async fn get_saved_command_group(&self, id: &str) -> VaultResult<SavedCommandGroup> {
        let row = sqlx::query("SELECT * FROM saved_command_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;
        row.map(|r| command_group_from_row(&r))
            .transpose()?
            .ok_or_else(|| VaultError::NotFound(format!("saved command group {}", id)))
    }

    pub async fn list_saved_command_groups(&self) -> VaultResult<Vec<SavedCommandGroup>> {
        let rows = sqlx::query("SELECT * FROM saved_command_groups ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;
        rows.iter().map(command_group_from_row).collect()
    }

    pub async fn delete_saved_command_group(&self, id: &str) -> VaultResult<()> {
        sqlx::query("UPDATE saved_commands SET group_id = NULL WHERE group_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;

        let result = sqlx::query("DELETE FROM saved_command_groups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(VaultError::NotFound(format!("saved command group {}", id)));
        }
        self.record_delete_marker(SavedCommandGroup::entity_type(), id)
            .await
    }

    async fn write_command_group_row(&self, group: &SavedCommandGroup) -> VaultResult<()> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO saved_command_groups (
                id, name, description, color,
                created_at, updated_at, device_id, version, sync_status, checksum
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&group.base.id)
        .bind(&group.name)
        .bind(&group.description)
        .bind(&group.color)
        .bind(group.base.created_at)
        .bind(group.base.updated_at)
        .bind(&group.base.device_id)
        .bind(group.base.version as i64)
        .bind(group.base.sync_status.to_string())
        .bind(&group.base.checksum)
        .execute(&self.pool)
        .await
        .map_err(|e| VaultError::Query(e.to_string()))?;
        Ok(())
    }
}

fn command_from_row(row: &sqlx::sqlite::SqliteRow) -> VaultResult<SavedCommand> {
    Ok(SavedCommand {
        base: base_from_row(row)?,
        name: row.get("name"),
        command: row.get("command"),
        description: row.get("description"),
        tags: serde_json::from_str(&row.get::<String, _>("tags"))?,
        favorite: row.get("favorite"),
        use_count: row.get::<i64, _>("use_count") as u64,
        group_id: row.get("group_id"),
    })
}

fn command_group_from_row(row: &sqlx::sqlite::SqliteRow) -> VaultResult<SavedCommandGroup> {
    Ok(SavedCommandGroup {
        base: base_from_row(row)?,
        name: row.get("name"),
        description: row.get("description"),
        color: row.get("color"),
    })
}

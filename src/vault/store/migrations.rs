use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{VaultError, VaultResult};

/// One schema step. Steps are idempotent (`IF NOT EXISTS` / additive) and
/// each runs inside its own transaction together with the version bump.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "base schema",
        sql: &[
            r#"CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                os TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                is_current INTEGER NOT NULL DEFAULT 0
            )"#,
            r#"CREATE TABLE IF NOT EXISTS master_passwords (
                device_id TEXT PRIMARY KEY,
                salt TEXT NOT NULL,
                verification_tag TEXT NOT NULL,
                kdf_params TEXT NOT NULL,
                auto_unlock INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_verified_at TEXT
            )"#,
            r#"CREATE TABLE IF NOT EXISTS device_keys (
                device_id TEXT PRIMARY KEY,
                salt TEXT NOT NULL,
                encrypted_key TEXT NOT NULL,
                key_version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS ssh_profiles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                group_id TEXT,
                auth_method TEXT NOT NULL,
                auth TEXT NOT NULL,
                timeout_secs INTEGER,
                keep_alive INTEGER NOT NULL DEFAULT 1,
                compression INTEGER NOT NULL DEFAULT 0,
                proxy TEXT,
                jump_hosts TEXT NOT NULL DEFAULT '[]',
                working_dir TEXT,
                startup_command TEXT,
                env TEXT,
                color TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                device_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                sync_status TEXT NOT NULL,
                checksum TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_ssh_profiles_group ON ssh_profiles(group_id)",
            "CREATE INDEX IF NOT EXISTS idx_ssh_profiles_host ON ssh_profiles(host)",
            r#"CREATE TABLE IF NOT EXISTS ssh_groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                color TEXT,
                default_auth_method TEXT,
                expanded INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                device_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                sync_status TEXT NOT NULL,
                checksum TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS ssh_keys (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                key_type TEXT NOT NULL,
                private_key TEXT NOT NULL,
                public_key TEXT,
                passphrase TEXT,
                fingerprint TEXT NOT NULL,
                last_used_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                device_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                sync_status TEXT NOT NULL,
                checksum TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_ssh_keys_fingerprint ON ssh_keys(fingerprint)",
            r#"CREATE TABLE IF NOT EXISTS saved_commands (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                command TEXT NOT NULL,
                description TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                favorite INTEGER NOT NULL DEFAULT 0,
                use_count INTEGER NOT NULL DEFAULT 0,
                group_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                device_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                sync_status TEXT NOT NULL,
                checksum TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS saved_command_groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                color TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                device_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                sync_status TEXT NOT NULL,
                checksum TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS external_databases (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                db_type TEXT NOT NULL,
                connection TEXT NOT NULL,
                sync_settings TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                device_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                sync_status TEXT NOT NULL,
                checksum TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS sync_logs (
                id TEXT PRIMARY KEY,
                database_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                records_synced INTEGER NOT NULL DEFAULT 0,
                conflicts_resolved INTEGER NOT NULL DEFAULT 0,
                conflicts_pending INTEGER NOT NULL DEFAULT 0,
                error_message TEXT
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_sync_logs_database ON sync_logs(database_id, started_at)",
            r#"CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                database_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                local_snapshot TEXT NOT NULL,
                remote_snapshot TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolution TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            )"#,
            r#"CREATE TABLE IF NOT EXISTS delete_markers (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                record_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                deleted_at TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_delete_markers_record ON delete_markers(entity_type, record_id)",
            r#"CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"#,
        ],
    },
];

/// Run every pending migration. The schema version lives in
/// `schema_migrations(version, applied_at)`; each step is applied at most
/// once, inside a transaction, in ascending version order.
pub async fn apply_migrations(pool: &SqlitePool) -> VaultResult<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await
    .map_err(|e| VaultError::MigrationFailed(e.to_string()))?;

    let current = schema_version(pool)
        .await
        .map_err(|e| VaultError::MigrationFailed(e.to_string()))?;

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }

        log::info!(
            "applying vault migration {}: {}",
            migration.version,
            migration.description
        );

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| VaultError::MigrationFailed(e.to_string()))?;

        for statement in migration.sql {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    VaultError::MigrationFailed(format!(
                        "migration {} failed: {}",
                        migration.version, e
                    ))
                })?;
        }

        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
            .bind(migration.version as i64)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| VaultError::MigrationFailed(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| VaultError::MigrationFailed(e.to_string()))?;
    }

    Ok(())
}

/// Current schema version, 0 when no migration has run.
pub async fn schema_version(pool: &SqlitePool) -> VaultResult<u32> {
    let row: Option<(Option<i64>,)> = sqlx::query_as("SELECT MAX(version) FROM schema_migrations")
        .fetch_optional(pool)
        .await
        .map_err(|e| VaultError::Query(e.to_string()))?;
    Ok(row.and_then(|(v,)| v).unwrap_or(0) as u32)
}

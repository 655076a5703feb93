mod auth;
mod command;
pub mod migrations;
mod ssh;
pub mod sync;

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::error::{VaultError, VaultResult};
use crate::keys::KeyCache;
use crate::vault::models::base::{Record, SyncStatus};
use crate::vault::secret::SecretCodec;

/// Key version stamped into secret-field headers. Bumped if the device key
/// is ever rotated (passphrase rotation re-seals the key, not the records).
const CURRENT_KEY_VERSION: u32 = 1;

/// The local vault: a SQLite store with transparent field encryption.
///
/// A single connection serializes all access; every write that touches more
/// than one row goes through a transaction.
pub struct VaultStore {
    pool: SqlitePool,
    cache: Arc<KeyCache>,
    current_device: RwLock<Option<String>>,
}

impl VaultStore {
    /// Open (or create) a vault at `url` (e.g. `sqlite:///path/to/vault.db`
    /// or `sqlite::memory:`) and bring the schema up to date.
    pub async fn open(url: &str, cache: Arc<KeyCache>) -> VaultResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| VaultError::Query(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;

        migrations::apply_migrations(&pool).await?;

        let store = Self {
            pool,
            cache,
            current_device: RwLock::new(None),
        };

        if let Some(device) = store.get_current_device().await? {
            *store.current_device.write().await = Some(device.device_id);
        }

        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn key_cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    pub async fn schema_version(&self) -> VaultResult<u32> {
        migrations::schema_version(&self.pool).await
    }

    /// Apply any pending schema migrations and return the resulting
    /// version. Already runs at open; exposed for explicit upgrades.
    pub async fn migrate(&self) -> VaultResult<u32> {
        migrations::apply_migrations(&self.pool).await?;
        self.schema_version().await
    }

    /// Device id all new records are stamped with.
    pub async fn current_device_id(&self) -> VaultResult<String> {
        self.current_device
            .read()
            .await
            .clone()
            .ok_or_else(|| VaultError::ConstraintViolation("no device registered".into()))
    }

    pub(crate) async fn set_current_device_id(&self, device_id: String) {
        *self.current_device.write().await = Some(device_id);
    }

    /// Field-encryption codec bound to the current device.
    pub async fn codec(&self) -> VaultResult<SecretCodec> {
        let device_id = self.current_device_id().await?;
        Ok(SecretCodec::new(
            self.cache.clone(),
            device_id,
            CURRENT_KEY_VERSION,
        ))
    }

    /// Run `f` inside a transaction; any error rolls every statement back.
    pub async fn transaction<T, F>(&self, f: F) -> VaultResult<T>
    where
        F: for<'t> FnOnce(
            &'t mut sqlx::Transaction<'static, sqlx::Sqlite>,
        ) -> BoxFuture<'t, VaultResult<T>>,
        T: Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;

        match f(&mut tx).await {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|e| VaultError::Query(e.to_string()))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    log::warn!("rollback failed: {}", rollback);
                }
                Err(err)
            }
        }
    }

    /// Shared pre-write bookkeeping for syncable records: device-id
    /// constraint, optimistic version check + increment, pending status.
    /// The checksum is computed by the caller after secret fields are
    /// sealed, so it covers the exact bytes that land in the row.
    pub(crate) async fn prepare_save<T: Record>(&self, record: &mut T) -> VaultResult<()> {
        if record.base().device_id.trim().is_empty() {
            return Err(VaultError::ConstraintViolation(
                "record has no device id".into(),
            ));
        }

        let stored = self
            .stored_version(T::table_name(), &record.base().id)
            .await?;

        let base = record.base_mut();
        match stored {
            Some(stored) if base.version < stored => {
                return Err(VaultError::VersionConflict {
                    entity: T::entity_type(),
                    id: base.id.clone(),
                    stored,
                    written: base.version,
                });
            }
            Some(stored) => base.version = stored + 1,
            None => base.version += 1,
        }
        base.sync_status = SyncStatus::Pending;
        Ok(())
    }

    pub(crate) fn finalize_checksum<T: Record>(record: &mut T) {
        let checksum = record.compute_checksum();
        record.base_mut().checksum = checksum;
    }

    async fn stored_version(&self, table: &'static str, id: &str) -> VaultResult<Option<u64>> {
        let row: Option<(i64,)> =
            sqlx::query_as(&format!("SELECT version FROM {} WHERE id = ?", table))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| VaultError::Query(e.to_string()))?;
        Ok(row.map(|(v,)| v as u64))
    }

    /// Reject a profile write whose jump-host references would create a
    /// cycle. Walks the stored profile graph with the pending write patched
    /// in, depth-first with a visited set per path.
    pub(crate) async fn assert_jump_chain_acyclic(
        &self,
        profile_id: &str,
        jump_hosts: &[String],
    ) -> VaultResult<()> {
        if jump_hosts.is_empty() {
            return Ok(());
        }

        let mut graph: HashMap<String, Vec<String>> = self.jump_host_graph().await?;
        graph.insert(profile_id.to_string(), jump_hosts.to_vec());

        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        if Self::has_cycle(profile_id, &graph, &mut visiting, &mut done) {
            return Err(VaultError::ConstraintViolation(format!(
                "jump host chain of profile {} contains a cycle",
                profile_id
            )));
        }
        Ok(())
    }

    async fn jump_host_graph(&self) -> VaultResult<HashMap<String, Vec<String>>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT id, jump_hosts FROM ssh_profiles")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;

        let mut graph = HashMap::with_capacity(rows.len());
        for (id, jump_hosts) in rows {
            let hops: Vec<String> = serde_json::from_str(&jump_hosts).unwrap_or_default();
            graph.insert(id, hops);
        }
        Ok(graph)
    }

    fn has_cycle(
        node: &str,
        graph: &HashMap<String, Vec<String>>,
        visiting: &mut HashSet<String>,
        done: &mut HashSet<String>,
    ) -> bool {
        if done.contains(node) {
            return false;
        }
        if !visiting.insert(node.to_string()) {
            return true;
        }
        if let Some(next) = graph.get(node) {
            for hop in next {
                if Self::has_cycle(hop, graph, visiting, done) {
                    return true;
                }
            }
        }
        visiting.remove(node);
        done.insert(node.to_string());
        false
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::keys::DeviceKey;
    use crate::vault::models::Device;

    /// In-memory vault with a registered device and a loaded device key.
    pub async fn unlocked_store() -> VaultStore {
        unlocked_store_for("dev-test").await
    }

    pub async fn unlocked_store_for(device_id: &str) -> VaultStore {
        let cache = Arc::new(KeyCache::new());
        let mut key = [42u8; 32];
        key[0] = device_id.len() as u8;
        cache
            .insert(device_id.to_string(), DeviceKey::new(key))
            .await;

        let store = VaultStore::open("sqlite::memory:", cache).await.unwrap();
        let mut device = Device::new(format!("{}-host", device_id));
        device.device_id = device_id.into();
        store.register_device(&device).await.unwrap();
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_runs_migrations() {
        let store = VaultStore::open("sqlite::memory:", Arc::new(KeyCache::new()))
            .await
            .unwrap();
        assert!(store.schema_version().await.unwrap() >= 1);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = VaultStore::open("sqlite::memory:", Arc::new(KeyCache::new()))
            .await
            .unwrap();
        migrations::apply_migrations(store.pool()).await.unwrap();
        migrations::apply_migrations(store.pool()).await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let store = VaultStore::open("sqlite::memory:", Arc::new(KeyCache::new()))
            .await
            .unwrap();

        let result: VaultResult<()> = store
            .transaction(|tx| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO app_settings (key, value) VALUES ('k', 'v')")
                        .execute(&mut **tx)
                        .await
                        .map_err(|e| VaultError::Query(e.to_string()))?;
                    Err(VaultError::ConstraintViolation("boom".into()))
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.get_setting("k").await.unwrap(), None);

        store
            .transaction(|tx| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO app_settings (key, value) VALUES ('k', 'v')")
                        .execute(&mut **tx)
                        .await
                        .map_err(|e| VaultError::Query(e.to_string()))?;
                    Ok(())
                })
            })
            .await
            .unwrap();
        assert_eq!(store.get_setting("k").await.unwrap(), Some("v".into()));
    }

    #[test]
    fn cycle_detection() {
        let mut graph = HashMap::new();
        graph.insert("a".to_string(), vec!["b".to_string()]);
        graph.insert("b".to_string(), vec!["c".to_string()]);
        graph.insert("c".to_string(), vec![]);

        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        assert!(!VaultStore::has_cycle("a", &graph, &mut visiting, &mut done));

        graph.insert("c".to_string(), vec!["a".to_string()]);
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        assert!(VaultStore::has_cycle("a", &graph, &mut visiting, &mut done));
    }
}

use base64::engine::general_purpose;
use base64::Engine;
use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::error::{VaultError, VaultResult};
use crate::keys::{DeviceKeyEntry, MasterPasswordEntry};
use crate::vault::models::Device;
use crate::vault::store::VaultStore;

fn encode_salt(salt: &[u8; 32]) -> String {
    general_purpose::STANDARD.encode(salt)
}

fn decode_salt(encoded: &str) -> VaultResult<[u8; 32]> {
    let bytes = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| VaultError::Query(format!("corrupt salt column: {}", e)))?;
    if bytes.len() != 32 {
        return Err(VaultError::Query("corrupt salt column: bad length".into()));
    }
    let mut salt = [0u8; 32];
    salt.copy_from_slice(&bytes);
    Ok(salt)
}

impl VaultStore {
    // ---- devices ----

    pub async fn register_device(&self, device: &Device) -> VaultResult<()> {
        if device.is_current {
            // Only one row may carry the current flag.
            sqlx::query("UPDATE devices SET is_current = 0")
                .execute(&self.pool)
                .await
                .map_err(|e| VaultError::Query(e.to_string()))?;
        }

        sqlx::query(
            r#"INSERT OR REPLACE INTO devices
               (device_id, name, os, created_at, last_seen, is_current)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&device.device_id)
        .bind(&device.name)
        .bind(&device.os)
        .bind(device.created_at)
        .bind(device.last_seen)
        .bind(device.is_current)
        .execute(&self.pool)
        .await
        .map_err(|e| VaultError::Query(e.to_string()))?;

        if device.is_current {
            self.set_current_device_id(device.device_id.clone()).await;
        }
        Ok(())
    }

    pub async fn get_device(&self, device_id: &str) -> VaultResult<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;
        row.map(|r| device_from_row(&r)).transpose()
    }

    pub async fn get_current_device(&self) -> VaultResult<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE is_current = 1 LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;
        row.map(|r| device_from_row(&r)).transpose()
    }

    pub async fn list_devices(&self) -> VaultResult<Vec<Device>> {
        let rows = sqlx::query("SELECT * FROM devices ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;
        rows.iter().map(device_from_row).collect()
    }

    pub async fn touch_device_last_seen(&self, device_id: &str) -> VaultResult<()> {
        sqlx::query("UPDATE devices SET last_seen = ? WHERE device_id = ?")
            .bind(Utc::now())
            .bind(device_id)
            .execute(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;
        Ok(())
    }

    // ---- master password entries ----

    pub async fn save_master_password_entry(&self, entry: &MasterPasswordEntry) -> VaultResult<()> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO master_passwords
               (device_id, salt, verification_tag, kdf_params, auto_unlock,
                created_at, last_verified_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&entry.device_id)
        .bind(encode_salt(&entry.salt))
        .bind(&entry.verification_tag)
        .bind(serde_json::to_string(&entry.kdf_params)?)
        .bind(entry.auto_unlock)
        .bind(entry.created_at)
        .bind(entry.last_verified_at)
        .execute(&self.pool)
        .await
        .map_err(|e| VaultError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn get_master_password_entry(
        &self,
        device_id: &str,
    ) -> VaultResult<Option<MasterPasswordEntry>> {
        let row = sqlx::query("SELECT * FROM master_passwords WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;

        row.map(|r| {
            Ok(MasterPasswordEntry {
                device_id: r.get("device_id"),
                salt: decode_salt(&r.get::<String, _>("salt"))?,
                verification_tag: r.get("verification_tag"),
                kdf_params: serde_json::from_str(&r.get::<String, _>("kdf_params"))?,
                auto_unlock: r.get("auto_unlock"),
                created_at: r.get::<DateTime<Utc>, _>("created_at"),
                last_verified_at: r.get::<Option<DateTime<Utc>>, _>("last_verified_at"),
            })
        })
        .transpose()
    }

    pub async fn touch_master_password_verified(&self, device_id: &str) -> VaultResult<()> {
        sqlx::query("UPDATE master_passwords SET last_verified_at = ? WHERE device_id = ?")
            .bind(Utc::now())
            .bind(device_id)
            .execute(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn set_auto_unlock(&self, device_id: &str, enabled: bool) -> VaultResult<()> {
        sqlx::query("UPDATE master_passwords SET auto_unlock = ? WHERE device_id = ?")
            .bind(enabled)
            .bind(device_id)
            .execute(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;
        Ok(())
    }

    // ---- device key entries ----

    pub async fn save_device_key_entry(&self, entry: &DeviceKeyEntry) -> VaultResult<()> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO device_keys
               (device_id, salt, encrypted_key, key_version, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&entry.device_id)
        .bind(encode_salt(&entry.salt))
        .bind(general_purpose::STANDARD.encode(&entry.encrypted_key))
        .bind(entry.key_version as i64)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| VaultError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn get_device_key_entry(
        &self,
        device_id: &str,
    ) -> VaultResult<Option<DeviceKeyEntry>> {
        let row = sqlx::query("SELECT * FROM device_keys WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;

        row.map(|r| {
            let encrypted_key = general_purpose::STANDARD
                .decode(r.get::<String, _>("encrypted_key"))
                .map_err(|e| VaultError::Query(format!("corrupt key column: {}", e)))?;
            Ok(DeviceKeyEntry {
                device_id: r.get("device_id"),
                salt: decode_salt(&r.get::<String, _>("salt"))?,
                encrypted_key,
                key_version: r.get::<i64, _>("key_version") as u32,
                created_at: r.get::<DateTime<Utc>, _>("created_at"),
            })
        })
        .transpose()
    }

    /// Replace the master-password and device-key rows for one device in a
    /// single transaction. Used by passphrase rotation: either both rows
    /// move forward or neither does.
    pub async fn replace_master_entries(
        &self,
        password_entry: &MasterPasswordEntry,
        key_entry: &DeviceKeyEntry,
    ) -> VaultResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| VaultError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT OR REPLACE INTO master_passwords
               (device_id, salt, verification_tag, kdf_params, auto_unlock,
                created_at, last_verified_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&password_entry.device_id)
        .bind(encode_salt(&password_entry.salt))
        .bind(&password_entry.verification_tag)
        .bind(serde_json::to_string(&password_entry.kdf_params)?)
        .bind(password_entry.auto_unlock)
        .bind(password_entry.created_at)
        .bind(password_entry.last_verified_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| VaultError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT OR REPLACE INTO device_keys
               (device_id, salt, encrypted_key, key_version, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&key_entry.device_id)
        .bind(encode_salt(&key_entry.salt))
        .bind(general_purpose::STANDARD.encode(&key_entry.encrypted_key))
        .bind(key_entry.key_version as i64)
        .bind(key_entry.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| VaultError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| VaultError::Query(e.to_string()))
    }
}

fn device_from_row(row: &sqlx::sqlite::SqliteRow) -> VaultResult<Device> {
    Ok(Device {
        device_id: row.get("device_id"),
        name: row.get("name"),
        os: row.get("os"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        last_seen: row.get::<DateTime<Utc>, _>("last_seen"),
        is_current: row.get("is_current"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyCache;
    use std::sync::Arc;

    #[tokio::test]
    async fn device_registration_roundtrip() {
        let store = VaultStore::open("sqlite::memory:", Arc::new(KeyCache::new()))
            .await
            .unwrap();

        let device = Device::new("laptop-1".into());
        store.register_device(&device).await.unwrap();

        let loaded = store.get_current_device().await.unwrap().unwrap();
        assert_eq!(loaded.device_id, device.device_id);
        assert_eq!(loaded.name, "laptop-1");
        assert_eq!(
            store.current_device_id().await.unwrap(),
            device.device_id
        );
    }

    #[tokio::test]
    async fn master_entries_roundtrip() {
        use crate::keys::{KeyCache, KeyHierarchy};

        let cache = Arc::new(KeyCache::new());
        let store = VaultStore::open("sqlite::memory:", cache.clone())
            .await
            .unwrap();

        let hierarchy = KeyHierarchy::new("dev-a".into(), cache);
        let (pw, key) = hierarchy.create("Sup3rSecret!").await.unwrap();

        store.save_master_password_entry(&pw).await.unwrap();
        store.save_device_key_entry(&key).await.unwrap();

        let loaded_pw = store
            .get_master_password_entry("dev-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded_pw.salt, pw.salt);
        assert_eq!(loaded_pw.verification_tag, pw.verification_tag);

        let loaded_key = store.get_device_key_entry("dev-a").await.unwrap().unwrap();
        assert_eq!(loaded_key.encrypted_key, key.encrypted_key);
        assert_eq!(loaded_key.key_version, 1);
    }
}

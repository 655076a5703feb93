use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Replication state of a record relative to the configured remotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
    Conflicting,
    LocalOnly,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflicting => "conflicting",
            SyncStatus::LocalOnly => "local-only",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            "conflicting" => Ok(SyncStatus::Conflicting),
            "local-only" => Ok(SyncStatus::LocalOnly),
            other => Err(format!("unknown sync status: {}", other)),
        }
    }
}

/// Common metadata carried by every persisted, syncable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub device_id: String,
    pub version: u64,
    pub sync_status: SyncStatus,
    pub checksum: String,
}

impl BaseRecord {
    pub fn new(device_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            device_id,
            version: 0,
            sync_status: SyncStatus::Pending,
            checksum: String::new(),
        }
    }

    /// Mark a mutation: bump the timestamp and flag the record for sync.
    /// The store owns the version increment and checksum on save.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.sync_status = SyncStatus::Pending;
    }
}

/// A persisted vault entity. The checksum covers the serialized record with
/// the volatile fields (`syncStatus`, `checksum`) blanked, so it is a pure
/// function of post-save content.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn table_name() -> &'static str;
    fn entity_type() -> &'static str;
    fn base(&self) -> &BaseRecord;
    fn base_mut(&mut self) -> &mut BaseRecord;

    fn compute_checksum(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or_default();
        checksum_of_value(value)
    }
}

/// Checksum over a serialized record with its volatile fields blanked.
/// Shared by typed records and the document-level sync paths so both sides
/// of a merge agree on what "same content" means.
pub fn checksum_of_value(mut value: serde_json::Value) -> String {
    if let Some(map) = value.as_object_mut() {
        map.remove("syncStatus");
        map.remove("checksum");
    }
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Implement [`Record`] for a struct with a `base: BaseRecord` field.
#[macro_export]
macro_rules! impl_record {
    ($model:ty, $table:expr, $entity:expr) => {
        impl $crate::vault::models::base::Record for $model {
            fn table_name() -> &'static str {
                $table
            }

            fn entity_type() -> &'static str {
                $entity
            }

            fn base(&self) -> &$crate::vault::models::base::BaseRecord {
                &self.base
            }

            fn base_mut(&mut self) -> &mut $crate::vault::models::base::BaseRecord {
                &mut self.base
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impl_record;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Widget {
        #[serde(flatten)]
        base: BaseRecord,
        name: String,
    }

    impl_record!(Widget, "widgets", "Widget");

    #[test]
    fn checksum_ignores_volatile_fields() {
        let mut widget = Widget {
            base: BaseRecord::new("dev-a".into()),
            name: "w".into(),
        };
        let before = widget.compute_checksum();

        widget.base.sync_status = SyncStatus::Synced;
        widget.base.checksum = "anything".into();
        assert_eq!(widget.compute_checksum(), before);

        widget.name = "x".into();
        assert_ne!(widget.compute_checksum(), before);
    }

    #[test]
    fn sync_status_roundtrips_through_text() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::Syncing,
            SyncStatus::Synced,
            SyncStatus::Failed,
            SyncStatus::Conflicting,
            SyncStatus::LocalOnly,
        ] {
            let text = status.to_string();
            assert_eq!(text.parse::<SyncStatus>().unwrap(), status);
        }
    }
}

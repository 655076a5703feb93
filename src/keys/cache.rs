use std::collections::HashMap;

use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A 32-byte device encryption key held in memory. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DeviceKey {
    bytes: [u8; 32],
}

impl DeviceKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceKey([REDACTED])")
    }
}

/// Process-wide cache of unlocked device keys, `device_id → key`.
///
/// Shared-lock reads, exclusive-lock writes. Entries are wiped on lock,
/// session timeout and process exit (zeroize on drop).
pub struct KeyCache {
    keys: RwLock<HashMap<String, DeviceKey>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, device_id: String, key: DeviceKey) {
        let mut keys = self.keys.write().await;
        keys.insert(device_id, key);
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceKey> {
        let keys = self.keys.read().await;
        keys.get(device_id).cloned()
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        let keys = self.keys.read().await;
        keys.contains_key(device_id)
    }

    pub async fn remove(&self, device_id: &str) {
        let mut keys = self.keys.write().await;
        keys.remove(device_id);
    }

    /// Wipe every entry. Key material zeroizes as the map drops its values.
    pub async fn clear(&self) {
        let mut keys = self.keys.write().await;
        keys.clear();
    }

    pub async fn loaded_device_ids(&self) -> Vec<String> {
        let keys = self.keys.read().await;
        keys.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        let keys = self.keys.read().await;
        keys.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_get_clear() {
        let cache = KeyCache::new();
        cache
            .insert("dev-a".into(), DeviceKey::new([1u8; 32]))
            .await;

        assert!(cache.contains("dev-a").await);
        assert_eq!(cache.get("dev-a").await.unwrap().bytes(), &[1u8; 32]);

        cache.clear().await;
        assert!(cache.is_empty().await);
        assert!(cache.get("dev-a").await.is_none());
    }

    #[test]
    fn debug_redacts_key_material() {
        let key = DeviceKey::new([0xAB; 32]);
        assert_eq!(format!("{:?}", key), "DeviceKey([REDACTED])");
    }
}

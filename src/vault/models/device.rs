use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A device known to the vault — the local one plus every peer whose
/// records have been pulled in by sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub os: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_current: bool,
}

impl Device {
    pub fn new(name: String) -> Self {
        let now = Utc::now();
        Self {
            device_id: Uuid::new_v4().to_string(),
            name,
            os: describe_os(),
            created_at: now,
            last_seen: now,
            is_current: true,
        }
    }

    pub fn touch_last_seen(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// OS descriptor like `linux 6.8 (Ubuntu 24.04)`, best effort.
fn describe_os() -> String {
    let name = sysinfo::System::name().unwrap_or_else(|| std::env::consts::OS.to_string());
    match sysinfo::System::os_version() {
        Some(version) => format!("{} {}", name, version),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_device_is_current_with_os_descriptor() {
        let device = Device::new("laptop-1".into());
        assert!(device.is_current);
        assert!(!device.os.is_empty());
        assert!(!device.device_id.is_empty());
    }
}

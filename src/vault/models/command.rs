use serde::{Deserialize, Serialize};

use crate::impl_record;
use crate::vault::models::base::BaseRecord;

/// A reusable shell command snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedCommand {
    #[serde(flatten)]
    pub base: BaseRecord,

    pub name: String,
    pub command: String,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub favorite: bool,
    pub use_count: u64,
    pub group_id: Option<String>,
}

impl SavedCommand {
    pub fn new(device_id: String, name: String, command: String) -> Self {
        Self {
            base: BaseRecord::new(device_id),
            name,
            command,
            description: None,
            tags: Vec::new(),
            favorite: false,
            use_count: 0,
            group_id: None,
        }
    }
}

impl_record!(SavedCommand, "saved_commands", "SavedCommand");

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedCommandGroup {
    #[serde(flatten)]
    pub base: BaseRecord,

    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
}

impl SavedCommandGroup {
    pub fn new(device_id: String, name: String) -> Self {
        Self {
            base: BaseRecord::new(device_id),
            name,
            description: None,
            color: None,
        }
    }
}

impl_record!(SavedCommandGroup, "saved_command_groups", "SavedCommandGroup");

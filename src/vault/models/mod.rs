pub mod base;
pub mod command;
pub mod device;
pub mod ssh;
pub mod sync;

pub use base::{BaseRecord, Record, SyncStatus};
pub use command::{SavedCommand, SavedCommandGroup};
pub use device::Device;
pub use ssh::{
    AuthMethod, AuthPayload, KeyType, ProxyConfig, ProxyType, SshGroup, SshKey, SshProfile,
};
pub use sync::{
    ConflictRecord, ConflictResolutionChoice, ConflictStrategy, DatabaseType, DeleteMarker,
    ExternalDatabaseConfig, SyncDirection, SyncDocument, SyncLog, SyncRunStatus, SyncSettings,
};

pub mod models;
pub mod secret;
pub mod service;
pub mod store;

pub use secret::SecretCodec;
pub use service::VaultService;
pub use store::VaultStore;

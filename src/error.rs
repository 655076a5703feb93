use thiserror::Error;

/// Failures of the sealed-blob primitives. Non-recoverable at this layer.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("authentication tag mismatch")]
    AuthFail,

    #[error("encrypted blob too short or malformed")]
    MalformedBlob,

    #[error("key derivation failed: {0}")]
    KdfFail(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Auth session and key-hierarchy errors.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("master password has not been set up")]
    NotInitialized,

    #[error("invalid master passphrase")]
    InvalidPassphrase,

    #[error("session is locked")]
    Locked,

    #[error("no encryption key loaded for device {0}")]
    UnknownDeviceKey(String),

    #[error("OS keystore unavailable: {0}")]
    KeystoreUnavailable(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Vault store errors.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("version conflict on {entity} {id}: stored {stored}, write carried {written}")]
    VersionConflict {
        entity: &'static str,
        id: String,
        stored: u64,
        written: u64,
    },

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("migration failed: {0}")]
    MigrationFailed(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Terminal session errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to spawn terminal: {0}")]
    SpawnFailed(String),

    #[error("session {0} is already closed")]
    AlreadyClosed(String),

    #[error("write to closed session {0}")]
    WriteAfterClose(String),

    #[error("scrollback overflow")]
    BufferOverflow,

    #[error("session not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// SSH transport stack errors, one variant per connection stage.
#[derive(Error, Debug)]
pub enum SshError {
    #[error("dns resolution failed for {0}")]
    Dns(String),

    #[error("tcp connect failed: {0}")]
    Connect(String),

    #[error("proxy handshake failed: {0}")]
    ProxyHandshake(String),

    #[error("ssh handshake failed: {0}")]
    SshHandshake(String),

    #[error("ssh authentication failed: {0}")]
    Auth(String),

    #[error("jump host chain contains a cycle at profile {0}")]
    JumpChainCycle(String),

    #[error("failed to decrypt ssh key material: {0}")]
    KeyDecryption(String),

    #[error("ssh channel closed")]
    ChannelClosed,

    #[error("ssh config error: {0}")]
    Config(String),

    #[error("operation timed out")]
    Timeout,
}

/// Sync engine errors.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote database unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("conflict on {entity} {id}")]
    Conflict { entity: String, id: String },

    #[error("remote schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("sync cancelled")]
    Cancelled,

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Top-level error for the operation surface.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
pub type AuthResult<T> = Result<T, AuthError>;
pub type VaultResult<T> = Result<T, VaultError>;
pub type SessionResult<T> = Result<T, SessionError>;
pub type SshResult<T> = Result<T, SshError>;
pub type SyncResult<T> = Result<T, SyncError>;
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Stable machine-readable code for front-end dispatch.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Crypto(CryptoError::AuthFail) => "crypto/auth-fail",
            AppError::Crypto(CryptoError::MalformedBlob) => "crypto/malformed-blob",
            AppError::Crypto(_) => "crypto/kdf-fail",
            AppError::Auth(AuthError::NotInitialized) => "auth/not-initialized",
            AppError::Auth(AuthError::InvalidPassphrase) => "auth/invalid-passphrase",
            AppError::Auth(AuthError::Locked) => "auth/locked",
            AppError::Auth(AuthError::UnknownDeviceKey(_)) => "auth/unknown-device-key",
            AppError::Auth(_) => "auth/error",
            AppError::Vault(VaultError::NotFound(_)) => "vault/not-found",
            AppError::Vault(VaultError::VersionConflict { .. }) => "vault/version-conflict",
            AppError::Vault(_) => "vault/error",
            AppError::Session(SessionError::SpawnFailed(_)) => "session/spawn-failed",
            AppError::Session(SessionError::NotFound(_)) => "session/not-found",
            AppError::Session(_) => "session/error",
            AppError::Ssh(SshError::JumpChainCycle(_)) => "ssh/jump-chain-cycle",
            AppError::Ssh(SshError::Auth(_)) => "ssh/auth",
            AppError::Ssh(_) => "ssh/error",
            AppError::Sync(SyncError::Conflict { .. }) => "sync/conflict",
            AppError::Sync(SyncError::Cancelled) => "sync/cancelled",
            AppError::Sync(_) => "sync/error",
            AppError::Internal(_) => "internal",
        }
    }
}

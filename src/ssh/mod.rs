pub mod config;
pub mod pool;
pub mod proxy;

pub use config::{parse_ssh_config, resolve_host, SshConfigHost};
pub use pool::{ChannelExit, ChannelSink, ConnectionPool, PooledTransport};

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use russh::client::{self, DisconnectReason, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use russh_keys::key::PublicKey;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{SshError, SshResult};
use crate::ssh::proxy::{self, proxy_signature};
use crate::vault::models::{AuthPayload, SshProfile};
use crate::vault::VaultStore;

const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const EVICTION_TICK: Duration = Duration::from_secs(60);

/// Terminal-side notification that a channel or its transport went away.
#[derive(Debug, Clone)]
pub struct ChannelExit {
    pub exit_code: Option<i32>,
    pub reason: String,
}

/// Output/exit routes for one channel multiplexed over a shared transport.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    pub data: mpsc::UnboundedSender<Vec<u8>>,
    pub exit: mpsc::UnboundedSender<ChannelExit>,
}

/// Client handler for one SSH transport. Routes incoming bytes to the
/// session that owns each channel; several terminals can share the
/// transport without seeing each other's output.
#[derive(Clone)]
pub struct ClientHandler {
    sinks: Arc<DashMap<ChannelId, ChannelSink>>,
}

impl ClientHandler {
    fn new() -> Self {
        Self {
            sinks: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(sink) = self.sinks.get(&channel) {
            let _ = sink.data.send(data.to_vec());
        }
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        _code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(sink) = self.sinks.get(&channel) {
            let _ = sink.data.send(data.to_vec());
        }
        Ok(())
    }

    async fn exit_status(
        &mut self,
        channel: ChannelId,
        exit_status: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(sink) = self.sinks.get(&channel) {
            let _ = sink.exit.send(ChannelExit {
                exit_code: Some(exit_status as i32),
                reason: "exited".to_string(),
            });
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some((_, sink)) = self.sinks.remove(&channel) {
            let _ = sink.exit.send(ChannelExit {
                exit_code: Some(0),
                reason: "remote-closed".to_string(),
            });
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some((_, sink)) = self.sinks.remove(&channel) {
            let _ = sink.exit.send(ChannelExit {
                exit_code: None,
                reason: "channel-closed".to_string(),
            });
        }
        Ok(())
    }

    async fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        let description = match &reason {
            DisconnectReason::ReceivedDisconnect(_) => "server-disconnect".to_string(),
            DisconnectReason::Error(e) => format!("transport-error: {}", e),
        };

        for entry in self.sinks.iter() {
            let _ = entry.value().exit.send(ChannelExit {
                exit_code: Some(1),
                reason: description.clone(),
            });
        }
        self.sinks.clear();

        match reason {
            DisconnectReason::ReceivedDisconnect(_) => Ok(()),
            DisconnectReason::Error(e) => Err(e),
        }
    }
}

/// Cache key for a reusable transport. Two profiles share a transport only
/// when every connection-relevant dimension matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    host: String,
    port: u16,
    username: String,
    auth_fingerprint: String,
    proxy_signature: String,
    jump_signature: String,
}

impl PoolKey {
    fn for_profile(profile: &SshProfile, jump_signature: String) -> Self {
        let auth_fingerprint = match &profile.auth {
            AuthPayload::Password { .. } => format!("password:{}", profile.username),
            AuthPayload::KeyReference { key_id } => format!("key:{}", key_id),
            AuthPayload::KeyFile { path } => format!("keyfile:{}", path),
            AuthPayload::Agent {} => "agent".to_string(),
            AuthPayload::None {} => "none".to_string(),
        };

        Self {
            host: profile.host.clone(),
            port: profile.port,
            username: profile.username.clone(),
            auth_fingerprint,
            proxy_signature: proxy_signature(&profile.proxy),
            jump_signature,
        }
    }
}

/// A live, authenticated SSH transport shared by any number of channels.
pub struct PooledTransport {
    handle: Arc<Handle<ClientHandler>>,
    sinks: Arc<DashMap<ChannelId, ChannelSink>>,
    last_used: Mutex<Instant>,
    live_channels: AtomicUsize,
}

impl std::fmt::Debug for PooledTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledTransport")
            .field("sinks", &self.sinks)
            .field("last_used", &self.last_used)
            .field("live_channels", &self.live_channels)
            .finish()
    }
}

impl PooledTransport {
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub fn live_channels(&self) -> usize {
        self.live_channels.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|last_used| last_used.elapsed())
            .unwrap_or_default()
    }

    /// Open an interactive channel and register the caller's output routes.
    pub async fn open_channel(&self, sink: ChannelSink) -> SshResult<Channel<Msg>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|_| SshError::ChannelClosed)?;

        self.sinks.insert(channel.id(), sink);
        self.live_channels.fetch_add(1, Ordering::Relaxed);
        self.touch();
        Ok(channel)
    }

    /// Open a raw round-trip channel for latency probing; closed right away.
    pub async fn ping(&self) -> SshResult<Duration> {
        let start = Instant::now();
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|_| SshError::ChannelClosed)?;
        let elapsed = start.elapsed();
        let _ = channel.close().await;
        Ok(elapsed)
    }

    /// Drop the caller's routes after its channel is gone.
    pub fn release_channel(&self, id: ChannelId) {
        self.sinks.remove(&id);
        self.live_channels.fetch_sub(1, Ordering::Relaxed);
        self.touch();
    }
}

/// SSH transport pool with jump-host chaining and idle eviction.
pub struct ConnectionPool {
    store: Arc<VaultStore>,
    transports: DashMap<PoolKey, Arc<PooledTransport>>,
    idle_ttl: Duration,
}

impl ConnectionPool {
    pub fn new(store: Arc<VaultStore>) -> Self {
        Self::with_idle_ttl(store, DEFAULT_IDLE_TTL)
    }

    pub fn with_idle_ttl(store: Arc<VaultStore>, idle_ttl: Duration) -> Self {
        Self {
            store,
            transports: DashMap::new(),
            idle_ttl,
        }
    }

    /// Resolve a profile's jump chain and return an authenticated transport
    /// for it, reusing cached hops wherever possible.
    pub async fn acquire(&self, profile: &SshProfile) -> SshResult<Arc<PooledTransport>> {
        let chain = self.resolve_jump_chain(profile).await?;
        self.acquire_with_chain(&chain, profile).await
    }

    /// Same as [`acquire`], but with an explicit pre-resolved hop list
    /// (used by ssh-config sessions whose hops are not stored profiles).
    pub async fn acquire_with_chain(
        &self,
        chain: &[SshProfile],
        target: &SshProfile,
    ) -> SshResult<Arc<PooledTransport>> {
        let mut previous: Option<Arc<PooledTransport>> = None;
        let mut signature = String::new();

        for hop in chain {
            signature.push_str(&format!("{}@{}:{}/", hop.username, hop.host, hop.port));
            previous = Some(
                self.acquire_single(hop, previous.clone(), signature.clone())
                    .await?,
            );
        }

        self.acquire_single(target, previous, signature).await
    }

    async fn acquire_single(
        &self,
        profile: &SshProfile,
        previous: Option<Arc<PooledTransport>>,
        jump_signature: String,
    ) -> SshResult<Arc<PooledTransport>> {
        let key = PoolKey::for_profile(profile, jump_signature);

        if let Some(existing) = self.transports.get(&key) {
            if !existing.is_closed() {
                existing.touch();
                return Ok(existing.clone());
            }
            drop(existing);
            self.transports.remove(&key);
        }

        let transport = Arc::new(self.open_transport(profile, previous).await?);
        self.transports.insert(key, transport.clone());
        Ok(transport)
    }

    /// Expand a profile's jump-host references depth-first into the ordered
    /// hop list. A reference cycle fails with `JumpChainCycle` before any
    /// transport is opened.
    pub async fn resolve_jump_chain(&self, profile: &SshProfile) -> SshResult<Vec<SshProfile>> {
        let mut chain = Vec::new();
        let mut visiting = HashSet::new();
        visiting.insert(profile.base.id.clone());

        for hop_id in &profile.jump_hosts {
            self.expand_hop(hop_id, &mut chain, &mut visiting).await?;
        }
        Ok(chain)
    }

    fn expand_hop<'a>(
        &'a self,
        profile_id: &'a str,
        chain: &'a mut Vec<SshProfile>,
        visiting: &'a mut HashSet<String>,
    ) -> futures::future::BoxFuture<'a, SshResult<()>> {
        Box::pin(async move {
            if !visiting.insert(profile_id.to_string()) {
                return Err(SshError::JumpChainCycle(profile_id.to_string()));
            }

            let hop = self
                .store
                .get_ssh_profile(profile_id)
                .await
                .map_err(|e| match e {
                    crate::error::VaultError::NotFound(_) => {
                        SshError::Config(format!("jump host profile {} not found", profile_id))
                    }
                    other => SshError::KeyDecryption(other.to_string()),
                })?;

            for nested in &hop.jump_hosts {
                self.expand_hop(nested, chain, visiting).await?;
            }
            chain.push(hop);
            Ok(())
        })
    }

    async fn open_transport(
        &self,
        profile: &SshProfile,
        previous: Option<Arc<PooledTransport>>,
    ) -> SshResult<PooledTransport> {
        let connect_timeout = profile
            .timeout_secs
            .map(|t| Duration::from_secs(t as u64))
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: profile.keep_alive.then(|| Duration::from_secs(15)),
            keepalive_max: 10,
            ..Default::default()
        });

        let handler = ClientHandler::new();
        let sinks = handler.sinks.clone();

        let handshake = async {
            match previous {
                // Tunnel through the previous hop's transport.
                Some(previous_transport) => {
                    let channel = previous_transport
                        .handle
                        .channel_open_direct_tcpip(
                            profile.host.clone(),
                            profile.port as u32,
                            "127.0.0.1",
                            0,
                        )
                        .await
                        .map_err(|e| {
                            SshError::Connect(format!(
                                "forward to {}:{} failed: {}",
                                profile.host, profile.port, e
                            ))
                        })?;

                    client::connect_stream(config, channel.into_stream(), handler)
                        .await
                        .map_err(|e| SshError::SshHandshake(e.to_string()))
                }
                None => {
                    let stream = self.open_stream(profile, connect_timeout).await?;
                    client::connect_stream(config, stream, handler)
                        .await
                        .map_err(|e| SshError::SshHandshake(e.to_string()))
                }
            }
        };

        // The SSH handshake gets its own deadline, independent of the TCP
        // connect timeout already applied inside open_stream.
        let mut handle = match tokio::time::timeout(connect_timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => return Err(SshError::Timeout),
        };

        self.authenticate(&mut handle, profile).await?;
        log::debug!(
            "opened ssh transport to {} ({} hop(s) deep)",
            profile.endpoint(),
            profile.jump_hosts.len()
        );

        Ok(PooledTransport {
            handle: Arc::new(handle),
            sinks,
            last_used: Mutex::new(Instant::now()),
            live_channels: AtomicUsize::new(0),
        })
    }

    async fn open_stream(
        &self,
        profile: &SshProfile,
        connect_timeout: Duration,
    ) -> SshResult<TcpStream> {
        if let Some(proxy) = &profile.proxy {
            return proxy::connect_via_proxy(proxy, &profile.host, profile.port).await;
        }

        let mut addrs = tokio::net::lookup_host((profile.host.as_str(), profile.port))
            .await
            .map_err(|e| SshError::Dns(format!("{}: {}", profile.host, e)))?;
        let addr = addrs
            .next()
            .ok_or_else(|| SshError::Dns(format!("no addresses for {}", profile.host)))?;

        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(SshError::Connect(format!("{}: {}", addr, e))),
            Err(_) => Err(SshError::Timeout),
        }
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<ClientHandler>,
        profile: &SshProfile,
    ) -> SshResult<()> {
        let username = &profile.username;

        let authenticated = match &profile.auth {
            AuthPayload::Password { password } => handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| SshError::Auth(e.to_string()))?,
            AuthPayload::KeyReference { key_id } => {
                let key = self
                    .store
                    .get_ssh_key(key_id)
                    .await
                    .map_err(|e| SshError::KeyDecryption(e.to_string()))?;

                let key_pair = russh_keys::decode_secret_key(
                    &key.private_key,
                    key.passphrase.as_deref(),
                )
                .map_err(|e| SshError::KeyDecryption(e.to_string()))?;

                let ok = handle
                    .authenticate_publickey(username, Arc::new(key_pair))
                    .await
                    .map_err(|e| SshError::Auth(e.to_string()))?;

                if ok {
                    if let Err(e) = self.store.mark_ssh_key_used(key_id).await {
                        log::warn!("failed to mark ssh key {} used: {}", key_id, e);
                    }
                }
                ok
            }
            AuthPayload::KeyFile { path } => {
                let key_pair = russh_keys::load_secret_key(path, None)
                    .map_err(|e| SshError::KeyDecryption(format!("{}: {}", path, e)))?;
                handle
                    .authenticate_publickey(username, Arc::new(key_pair))
                    .await
                    .map_err(|e| SshError::Auth(e.to_string()))?
            }
            AuthPayload::Agent {} => authenticate_via_agent(handle, username).await?,
            AuthPayload::None {} => handle
                .authenticate_none(username)
                .await
                .map_err(|e| SshError::Auth(e.to_string()))?,
        };

        if !authenticated {
            return Err(SshError::Auth(format!(
                "authentication failed for {}",
                profile.endpoint()
            )));
        }
        Ok(())
    }

    /// Drop transports with no live channels that have been idle past the
    /// TTL, and any transport whose connection already died.
    pub fn evict_idle(&self) {
        let ttl = self.idle_ttl;
        self.transports.retain(|_, transport| {
            if transport.is_closed() {
                return false;
            }
            transport.live_channels() > 0 || transport.idle_for() < ttl
        });
    }

    /// Drop everything immediately.
    pub fn clear(&self) {
        self.transports.clear();
    }

    pub fn size(&self) -> usize {
        self.transports.len()
    }

    /// Periodic idle eviction in the background.
    pub fn start_eviction_task(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_TICK);
            loop {
                ticker.tick().await;
                pool.evict_idle();
            }
        });
    }
}

/// Try every identity offered by the local SSH agent.
async fn authenticate_via_agent(
    handle: &mut Handle<ClientHandler>,
    username: &str,
) -> SshResult<bool> {
    let mut agent = russh_keys::agent::client::AgentClient::connect_env()
        .await
        .map_err(|e| SshError::Auth(format!("ssh-agent unavailable: {}", e)))?;

    let identities = agent
        .request_identities()
        .await
        .map_err(|e| SshError::Auth(format!("ssh-agent identities: {}", e)))?;

    let mut current_agent = agent;
    for identity in identities {
        let (returned_agent, result) = handle
            .authenticate_future(username, identity, current_agent)
            .await;
        current_agent = returned_agent;
        match result {
            Ok(true) => return Ok(true),
            Ok(false) => continue,
            Err(e) => {
                log::debug!("agent identity rejected: {}", e);
                continue;
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::store::test_support::unlocked_store;

    #[tokio::test]
    async fn jump_chain_cycle_fails_before_connecting() {
        let store = Arc::new(unlocked_store().await);

        // Build a -> b -> a without going through save (which would reject
        // the cycle) by writing replicated rows.
        let mut a = SshProfile::new("dev-test".into(), "a".into(), "a.example".into(), 22, "u".into());
        let mut b = SshProfile::new("dev-test".into(), "b".into(), "b.example".into(), 22, "u".into());
        a.jump_hosts = vec![b.base.id.clone()];
        b.jump_hosts = vec![a.base.id.clone()];
        store.apply_remote_ssh_profile(&a).await.unwrap();
        store.apply_remote_ssh_profile(&b).await.unwrap();

        let pool = ConnectionPool::new(store);
        let err = pool.resolve_jump_chain(&a).await.unwrap_err();
        assert!(matches!(err, SshError::JumpChainCycle(_)));
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn jump_chain_orders_hops_innermost_first() {
        let store = Arc::new(unlocked_store().await);

        let mut bastion = SshProfile::new(
            "dev-test".into(),
            "bastion".into(),
            "bastion.example".into(),
            22,
            "u".into(),
        );
        store.save_ssh_profile(&mut bastion).await.unwrap();

        let mut inner = SshProfile::new(
            "dev-test".into(),
            "inner".into(),
            "inner.example".into(),
            22,
            "u".into(),
        );
        inner.jump_hosts = vec![bastion.base.id.clone()];
        store.save_ssh_profile(&mut inner).await.unwrap();

        let mut edge = SshProfile::new(
            "dev-test".into(),
            "edge".into(),
            "edge.example".into(),
            22,
            "u".into(),
        );
        edge.jump_hosts = vec![inner.base.id.clone()];
        store.save_ssh_profile(&mut edge).await.unwrap();

        let pool = ConnectionPool::new(store);
        let chain = pool.resolve_jump_chain(&edge).await.unwrap();
        let hosts: Vec<&str> = chain.iter().map(|p| p.host.as_str()).collect();
        assert_eq!(hosts, vec!["bastion.example", "inner.example"]);
    }

    #[tokio::test]
    async fn unresolvable_host_is_a_dns_error() {
        let store = Arc::new(unlocked_store().await);
        let pool = ConnectionPool::new(store);

        let profile = SshProfile::new(
            "dev-test".into(),
            "ghost".into(),
            "definitely-not-a-real-host.invalid".into(),
            22,
            "u".into(),
        );
        let err = pool.acquire(&profile).await.unwrap_err();
        assert!(matches!(err, SshError::Dns(_) | SshError::Connect(_)));
    }
}

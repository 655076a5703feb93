use std::sync::Arc;
use std::time::Duration;

use russh::client::Msg;
use russh::{Channel, ChannelId, Pty};
use tokio::sync::mpsc;

use crate::error::{SessionError, SessionResult, SshError};
use crate::ssh::pool::{ChannelExit, ChannelSink, ConnectionPool, PooledTransport};
use crate::vault::models::SshProfile;

/// Cadence of the round-trip latency probe.
pub const LATENCY_PROBE_INTERVAL: Duration = Duration::from_secs(5);
/// A probe that takes longer than this marks the session errored.
pub const LATENCY_PROBE_DEADLINE: Duration = Duration::from_secs(10);

/// An interactive shell over a pooled SSH transport. Closing the session
/// releases only its channel — the transport stays cached for the next one.
pub struct SshSession {
    channel: Channel<Msg>,
    channel_id: ChannelId,
    transport: Arc<PooledTransport>,
}

impl SshSession {
    /// Open a channel on the profile's (possibly jump-chained, possibly
    /// proxied) transport, request a PTY and an interactive shell, then
    /// type the startup command if the profile carries one.
    pub async fn connect(
        pool: &ConnectionPool,
        profile: &SshProfile,
        cols: u16,
        rows: u16,
        output: mpsc::UnboundedSender<Vec<u8>>,
        exit: mpsc::UnboundedSender<ChannelExit>,
    ) -> SessionResult<Self> {
        let transport = pool.acquire(profile).await?;
        Self::open_shell(transport, profile, cols, rows, output, exit).await
    }

    /// Same, over an explicit pre-resolved hop chain (ssh-config entries).
    pub async fn connect_with_chain(
        pool: &ConnectionPool,
        chain: &[SshProfile],
        profile: &SshProfile,
        cols: u16,
        rows: u16,
        output: mpsc::UnboundedSender<Vec<u8>>,
        exit: mpsc::UnboundedSender<ChannelExit>,
    ) -> SessionResult<Self> {
        let transport = pool.acquire_with_chain(chain, profile).await?;
        Self::open_shell(transport, profile, cols, rows, output, exit).await
    }

    async fn open_shell(
        transport: Arc<PooledTransport>,
        profile: &SshProfile,
        cols: u16,
        rows: u16,
        output: mpsc::UnboundedSender<Vec<u8>>,
        exit: mpsc::UnboundedSender<ChannelExit>,
    ) -> SessionResult<Self> {
        let channel = transport
            .open_channel(ChannelSink {
                data: output,
                exit,
            })
            .await?;
        let channel_id = channel.id();

        channel
            .request_pty(
                false,
                "xterm-256color",
                cols as u32,
                rows as u32,
                0,
                0,
                &[(Pty::TTY_OP_ISPEED, 38400), (Pty::TTY_OP_OSPEED, 38400)],
            )
            .await
            .map_err(|e| SshError::SshHandshake(format!("request_pty: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::SshHandshake(format!("request_shell: {}", e)))?;

        let session = Self {
            channel,
            channel_id,
            transport,
        };

        // Working directory, environment and startup command are typed into
        // the interactive shell rather than exec'd, so the shell survives
        // the command finishing.
        let mut startup: Vec<String> = Vec::new();
        if let Some(env) = &profile.env {
            for (key, value) in env {
                let escaped = value.replace('\'', "'\\''");
                startup.push(format!("export {}='{}'", key, escaped));
            }
        }
        if let Some(working_dir) = &profile.working_dir {
            if !working_dir.is_empty() {
                startup.push(format!("cd \"{}\"", working_dir));
            }
        }
        if let Some(command) = &profile.startup_command {
            if !command.is_empty() {
                startup.push(command.clone());
            }
        }
        if !startup.is_empty() {
            let mut line = startup.join(" && ");
            line.push('\n');
            session
                .channel
                .data(line.as_bytes())
                .await
                .map_err(|_| SshError::ChannelClosed)?;
        }

        Ok(session)
    }

    /// Ordered write of typed input into the channel.
    pub async fn write(&mut self, data: &[u8]) -> SessionResult<()> {
        self.channel
            .data(data)
            .await
            .map_err(|_| SessionError::Ssh(SshError::ChannelClosed))
    }

    /// Propagate a resize with the SSH `window-change` request.
    pub async fn resize(&mut self, cols: u16, rows: u16) -> SessionResult<()> {
        self.channel
            .window_change(cols as u32, rows as u32, 0, 0)
            .await
            .map_err(|_| SessionError::Ssh(SshError::ChannelClosed))
    }

    /// Close this channel and release its routes. The transport remains in
    /// the pool for reuse.
    pub async fn close(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
        self.transport.release_channel(self.channel_id);
    }

    /// Handle for the latency probe task.
    pub fn transport(&self) -> Arc<PooledTransport> {
        self.transport.clone()
    }
}

use std::collections::HashMap;
use std::io::{Read, Write};

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{SessionError, SessionResult};
use crate::ssh::pool::ChannelExit;

const READ_CHUNK: usize = 8192;

/// Spawn parameters for a local shell.
#[derive(Debug, Clone, Default)]
pub struct LocalSpawnConfig {
    pub shell: Option<String>,
    pub working_dir: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

/// A local pseudo-terminal running a child shell.
pub struct LocalSession {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    cancel: CancellationToken,
}

impl LocalSession {
    /// Allocate a PTY pair and start the shell. On failure nothing is left
    /// behind — the caller never sees a half-spawned session.
    pub fn spawn(
        config: &LocalSpawnConfig,
        cols: u16,
        rows: u16,
        output: mpsc::UnboundedSender<Vec<u8>>,
        exit: mpsc::UnboundedSender<ChannelExit>,
    ) -> SessionResult<Self> {
        let pty_system = portable_pty::native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let shell = config
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(default_shell);

        let mut cmd = CommandBuilder::new(&shell);
        if shell.contains("zsh") || shell.contains("bash") {
            cmd.arg("-l");
        }
        if let Some(working_dir) = &config.working_dir {
            cmd.cwd(working_dir);
        }

        // Inherit the parent environment, then pin terminal basics and
        // apply per-session overrides on top.
        for (key, value) in std::env::vars() {
            cmd.env(&key, &value);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        if let Some(env) = &config.env {
            for (key, value) in env {
                cmd.env(key, value);
            }
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let cancel = CancellationToken::new();
        start_reader(reader, output, exit, cancel.clone());

        Ok(Self {
            master: pair.master,
            child,
            writer,
            cancel,
        })
    }

    /// Ordered write into the child's stdin.
    pub fn write(&mut self, data: &[u8]) -> SessionResult<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> SessionResult<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))
    }

    /// Cancel the reader, hang up the child and reap it.
    pub fn close(&mut self) {
        self.cancel.cancel();
        if let Err(e) = self.child.kill() {
            log::debug!("kill child: {}", e);
        }
        if let Err(e) = self.child.wait() {
            log::debug!("wait child: {}", e);
        }
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = self.child.kill();
    }
}

/// Dedicated blocking reader draining the PTY in fixed-size chunks. The
/// loop ends on EOF, read error or cancellation; EOF and errors emit an
/// exit notification so the reader never dies silently.
fn start_reader(
    mut reader: Box<dyn Read + Send>,
    output: mpsc::UnboundedSender<Vec<u8>>,
    exit: mpsc::UnboundedSender<ChannelExit>,
    cancel: CancellationToken,
) {
    tokio::task::spawn_blocking(move || {
        let mut buffer = [0u8; READ_CHUNK];
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match reader.read(&mut buffer) {
                Ok(0) => {
                    let _ = exit.send(ChannelExit {
                        exit_code: Some(0),
                        reason: "eof".to_string(),
                    });
                    break;
                }
                Ok(n) => {
                    if output.send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if !cancel.is_cancelled() {
                        log::debug!("pty read error: {}", e);
                        let _ = exit.send(ChannelExit {
                            exit_code: None,
                            reason: format!("read-error: {}", e),
                        });
                    }
                    break;
                }
            }
        }
    });
}

fn default_shell() -> String {
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        for candidate in ["/bin/zsh", "/usr/bin/zsh", "/bin/bash", "/usr/bin/bash"] {
            if std::path::Path::new(candidate).exists() {
                return candidate.to_string();
            }
        }
        "/bin/sh".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_echo_and_read_back() {
        let (output_tx, mut output_rx) = mpsc::unbounded_channel();
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();

        let config = LocalSpawnConfig {
            shell: Some("/bin/sh".into()),
            ..Default::default()
        };
        let mut session = LocalSession::spawn(&config, 80, 24, output_tx, exit_tx).unwrap();

        session.write(b"echo kerminal-$((20+3))\n").unwrap();

        // Collect output until the marker shows up.
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(std::time::Duration::from_millis(500), output_rx.recv())
                .await
            {
                Ok(Some(chunk)) => {
                    collected.extend_from_slice(&chunk);
                    if String::from_utf8_lossy(&collected).contains("kerminal-23") {
                        break;
                    }
                }
                _ => {}
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("kerminal-23"));

        session.close();
    }

    #[test]
    fn bad_shell_fails_spawn() {
        let (output_tx, _output_rx) = mpsc::unbounded_channel();
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();

        let config = LocalSpawnConfig {
            shell: Some("/nonexistent/shell-binary".into()),
            ..Default::default()
        };
        let result = LocalSession::spawn(&config, 80, 24, output_tx, exit_tx);
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }
}

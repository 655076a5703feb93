use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{SshError, SshResult};

/// One resolved `Host` entry from an OpenSSH config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfigHost {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub user: Option<String>,
    pub identity_file: Option<String>,
    pub proxy_jump: Option<String>,
}

/// Parse `~/.ssh/config` (or an explicit path) into host entries. Pattern
/// entries (`*`, `?`) are skipped — only concrete hosts are listed.
pub async fn parse_ssh_config(config_path: Option<PathBuf>) -> SshResult<Vec<SshConfigHost>> {
    let path = match config_path {
        Some(path) => path,
        None => {
            let home = dirs::home_dir()
                .ok_or_else(|| SshError::Config("could not determine home directory".into()))?;
            home.join(".ssh").join("config")
        }
    };

    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| SshError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    Ok(parse_config_content(&content))
}

/// Find one host entry by its `Host` alias.
pub async fn resolve_host(
    host_name: &str,
    config_path: Option<PathBuf>,
) -> SshResult<SshConfigHost> {
    let hosts = parse_ssh_config(config_path).await?;
    hosts
        .into_iter()
        .find(|host| host.name == host_name)
        .ok_or_else(|| SshError::Config(format!("no ssh config entry for host {}", host_name)))
}

fn parse_config_content(content: &str) -> Vec<SshConfigHost> {
    let mut hosts = Vec::new();
    let mut current: Option<SshConfigHost> = None;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut parts = trimmed.splitn(2, char::is_whitespace);
        let keyword = match parts.next() {
            Some(keyword) => keyword.to_lowercase(),
            None => continue,
        };
        let value = match parts.next() {
            Some(value) => value.trim(),
            None => continue,
        };

        match keyword.as_str() {
            "host" => {
                if let Some(host) = current.take() {
                    hosts.push(host);
                }
                // First concrete (non-pattern) alias wins.
                current = value
                    .split_whitespace()
                    .find(|pattern| !pattern.contains('*') && !pattern.contains('?'))
                    .map(|alias| SshConfigHost {
                        name: alias.to_string(),
                        hostname: alias.to_string(),
                        port: 22,
                        user: None,
                        identity_file: None,
                        proxy_jump: None,
                    });
            }
            "hostname" => {
                if let Some(host) = &mut current {
                    host.hostname = value.to_string();
                }
            }
            "port" => {
                if let Some(host) = &mut current {
                    if let Ok(port) = value.parse() {
                        host.port = port;
                    }
                }
            }
            "user" => {
                if let Some(host) = &mut current {
                    host.user = Some(value.to_string());
                }
            }
            "identityfile" => {
                if let Some(host) = &mut current {
                    host.identity_file = Some(expand_tilde(value));
                }
            }
            "proxyjump" => {
                if let Some(host) = &mut current {
                    host.proxy_jump = Some(value.to_string());
                }
            }
            _ => {}
        }
    }

    if let Some(host) = current {
        hosts.push(host);
    }
    hosts
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# work hosts
Host bastion
    HostName bastion.corp.example
    Port 2222
    User ops

Host edge
    HostName edge.corp.example
    User deploy
    IdentityFile ~/.ssh/id_edge
    ProxyJump bastion

Host *
    ServerAliveInterval 60
"#;

    #[test]
    fn parses_concrete_hosts_only() {
        let hosts = parse_config_content(SAMPLE);
        assert_eq!(hosts.len(), 2);

        assert_eq!(hosts[0].name, "bastion");
        assert_eq!(hosts[0].hostname, "bastion.corp.example");
        assert_eq!(hosts[0].port, 2222);
        assert_eq!(hosts[0].user.as_deref(), Some("ops"));

        assert_eq!(hosts[1].name, "edge");
        assert_eq!(hosts[1].proxy_jump.as_deref(), Some("bastion"));
        assert!(hosts[1].identity_file.as_deref().unwrap().ends_with("id_edge"));
    }

    #[test]
    fn hostname_defaults_to_alias() {
        let hosts = parse_config_content("Host plain\n    User me\n");
        assert_eq!(hosts[0].hostname, "plain");
        assert_eq!(hosts[0].port, 22);
    }

    #[test]
    fn comments_and_blanks_ignored() {
        let hosts = parse_config_content("# nothing\n\n   \n");
        assert!(hosts.is_empty());
    }
}

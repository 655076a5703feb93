use std::net::Ipv4Addr;
use std::time::Duration;

use base64::engine::general_purpose;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{SshError, SshResult};
use crate::vault::models::{ProxyConfig, ProxyType};

const PROXY_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Connect through a proxy and run the handshake for the configured
/// protocol. The returned stream is ready for the SSH handshake.
pub async fn connect_via_proxy(
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
) -> SshResult<TcpStream> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| SshError::Connect(format!("proxy {}:{}: {}", proxy.host, proxy.port, e)))?;

    let handshake = async {
        match proxy.proxy_type {
            ProxyType::Http => http_connect(&mut stream, proxy, target_host, target_port).await,
            ProxyType::Socks4 => socks4_connect(&mut stream, proxy, target_host, target_port).await,
            ProxyType::Socks5 => socks5_connect(&mut stream, proxy, target_host, target_port).await,
        }
    };

    match tokio::time::timeout(PROXY_HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Ok(())) => Ok(stream),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(SshError::Timeout),
    }
}

/// HTTP CONNECT tunnel, with optional basic auth.
async fn http_connect(
    stream: &mut TcpStream,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> SshResult<()> {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = host,
        port = port
    );
    if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
        let credentials = general_purpose::STANDARD.encode(format!("{}:{}", username, password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", credentials));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| SshError::ProxyHandshake(e.to_string()))?;

    // Read the status line + headers up to the blank line.
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 8192 {
            return Err(SshError::ProxyHandshake(
                "oversized CONNECT response".into(),
            ));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| SshError::ProxyHandshake(e.to_string()))?;
        if n == 0 {
            return Err(SshError::ProxyHandshake(
                "proxy closed connection during CONNECT".into(),
            ));
        }
        response.push(byte[0]);
    }

    let status_line = response
        .split(|&b| b == b'\r')
        .next()
        .map(|line| String::from_utf8_lossy(line).to_string())
        .unwrap_or_default();

    if !status_line.contains(" 200") {
        return Err(SshError::ProxyHandshake(format!(
            "CONNECT rejected: {}",
            status_line
        )));
    }
    Ok(())
}

/// SOCKS4 CONNECT. The protocol is IPv4-only, so the target is resolved
/// here and the first A record used.
async fn socks4_connect(
    stream: &mut TcpStream,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> SshResult<()> {
    let addr = resolve_ipv4(host, port).await?;

    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&addr.octets());
    if let Some(username) = &proxy.username {
        request.extend_from_slice(username.as_bytes());
    }
    request.push(0x00);

    stream
        .write_all(&request)
        .await
        .map_err(|e| SshError::ProxyHandshake(e.to_string()))?;

    let mut reply = [0u8; 8];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| SshError::ProxyHandshake(e.to_string()))?;

    if reply[1] != 0x5A {
        return Err(SshError::ProxyHandshake(format!(
            "socks4 request rejected (code {:#04x})",
            reply[1]
        )));
    }
    Ok(())
}

/// SOCKS5 CONNECT with domain addressing and optional username/password
/// auth (RFC 1928 / RFC 1929).
async fn socks5_connect(
    stream: &mut TcpStream,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> SshResult<()> {
    let wants_auth = proxy.username.is_some() && proxy.password.is_some();
    let greeting: &[u8] = if wants_auth {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream
        .write_all(greeting)
        .await
        .map_err(|e| SshError::ProxyHandshake(e.to_string()))?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(|e| SshError::ProxyHandshake(e.to_string()))?;
    if choice[0] != 0x05 {
        return Err(SshError::ProxyHandshake("not a socks5 proxy".into()));
    }

    match choice[1] {
        0x00 => {}
        0x02 => {
            let (Some(username), Some(password)) = (&proxy.username, &proxy.password) else {
                return Err(SshError::ProxyHandshake(
                    "proxy requires credentials".into(),
                ));
            };
            if username.len() > 255 || password.len() > 255 {
                return Err(SshError::ProxyHandshake("credentials too long".into()));
            }

            let mut auth = vec![0x01, username.len() as u8];
            auth.extend_from_slice(username.as_bytes());
            auth.push(password.len() as u8);
            auth.extend_from_slice(password.as_bytes());
            stream
                .write_all(&auth)
                .await
                .map_err(|e| SshError::ProxyHandshake(e.to_string()))?;

            let mut status = [0u8; 2];
            stream
                .read_exact(&mut status)
                .await
                .map_err(|e| SshError::ProxyHandshake(e.to_string()))?;
            if status[1] != 0x00 {
                return Err(SshError::ProxyHandshake("socks5 auth rejected".into()));
            }
        }
        0xFF => {
            return Err(SshError::ProxyHandshake(
                "no acceptable socks5 auth method".into(),
            ))
        }
        other => {
            return Err(SshError::ProxyHandshake(format!(
                "unsupported socks5 auth method {:#04x}",
                other
            )))
        }
    }

    if host.len() > 255 {
        return Err(SshError::ProxyHandshake("target hostname too long".into()));
    }
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream
        .write_all(&request)
        .await
        .map_err(|e| SshError::ProxyHandshake(e.to_string()))?;

    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| SshError::ProxyHandshake(e.to_string()))?;
    if reply[1] != 0x00 {
        return Err(SshError::ProxyHandshake(format!(
            "socks5 connect rejected (code {:#04x})",
            reply[1]
        )));
    }

    // Drain the bound address in the reply.
    let addr_len = match reply[3] {
        0x01 => 4,
        0x03 => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| SshError::ProxyHandshake(e.to_string()))?;
            len[0] as usize
        }
        0x04 => 16,
        other => {
            return Err(SshError::ProxyHandshake(format!(
                "bad socks5 address type {:#04x}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(|e| SshError::ProxyHandshake(e.to_string()))?;

    Ok(())
}

async fn resolve_ipv4(host: &str, port: u16) -> SshResult<Ipv4Addr> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SshError::Dns(format!("{}: {}", host, e)))?;
    for addr in addrs {
        if let std::net::IpAddr::V4(v4) = addr.ip() {
            return Ok(v4);
        }
    }
    Err(SshError::Dns(format!("no IPv4 address for {}", host)))
}

/// Stable signature of a proxy config for pool keying. Excludes the
/// password so rotation does not split the pool.
pub fn proxy_signature(proxy: &Option<ProxyConfig>) -> String {
    match proxy {
        Some(proxy) => format!(
            "{:?}://{}@{}:{}",
            proxy.proxy_type,
            proxy.username.as_deref().unwrap_or(""),
            proxy.host,
            proxy.port
        ),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn socks5_proxy(username: Option<&str>, password: Option<&str>) -> ProxyConfig {
        ProxyConfig {
            proxy_type: ProxyType::Socks5,
            host: "127.0.0.1".into(),
            port: 0,
            username: username.map(String::from),
            password: password.map(String::from),
        }
    }

    #[tokio::test]
    async fn socks5_anonymous_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            socket.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            socket.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            socket.read_exact(&mut rest).await.unwrap();

            socket
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let mut proxy = socks5_proxy(None, None);
        proxy.port = addr.port();
        connect_via_proxy(&proxy, "target.example", 22).await.unwrap();
    }

    #[tokio::test]
    async fn socks5_rejection_is_a_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            socket.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            socket.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            socket.read_exact(&mut rest).await.unwrap();

            // 0x05 = connection refused
            socket
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let mut proxy = socks5_proxy(None, None);
        proxy.port = addr.port();
        let err = connect_via_proxy(&proxy, "target.example", 22)
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::ProxyHandshake(_)));
    }

    #[tokio::test]
    async fn http_connect_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = vec![0u8; 1024];
            let n = socket.read(&mut buffer).await.unwrap();
            let request = String::from_utf8_lossy(&buffer[..n]).to_string();
            assert!(request.starts_with("CONNECT target.example:22 HTTP/1.1"));
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
        });

        let proxy = ProxyConfig {
            proxy_type: ProxyType::Http,
            host: "127.0.0.1".into(),
            port: addr.port(),
            username: None,
            password: None,
        };
        connect_via_proxy(&proxy, "target.example", 22).await.unwrap();
    }

    #[test]
    fn signature_excludes_password() {
        let mut a = socks5_proxy(Some("u"), Some("old"));
        let b = socks5_proxy(Some("u"), Some("new"));
        a.port = 1080;
        let mut b = b;
        b.port = 1080;
        assert_eq!(proxy_signature(&Some(a)), proxy_signature(&Some(b)));
    }
}

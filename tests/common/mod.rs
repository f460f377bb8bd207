//! Shared test fixtures: an in-process SOCKS5 proxy, a tiny HTTP server and
//! a client factory whose "clients" are those proxies.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use proxyspeed::client::{ClientAdapter, ClientError, ClientFactory};
use proxyspeed::node::{NodeConfig, Protocol};

// ---------------------------------------------------------------------------
// SOCKS5
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyBehaviour {
    /// CONNECT to the requested target and relay bytes.
    Relay,
    /// Accept connections and never answer.
    Hang,
}

async fn read_target(s: &mut TcpStream) -> std::io::Result<(String, u16)> {
    let mut head = [0u8; 4];
    s.read_exact(&mut head).await?;
    let host = match head[3] {
        0x01 => {
            let mut b = [0u8; 4];
            s.read_exact(&mut b).await?;
            Ipv4Addr::from(b).to_string()
        }
        0x03 => {
            let len = s.read_u8().await? as usize;
            let mut b = vec![0u8; len];
            s.read_exact(&mut b).await?;
            String::from_utf8_lossy(&b).into_owned()
        }
        0x04 => {
            let mut b = [0u8; 16];
            s.read_exact(&mut b).await?;
            Ipv6Addr::from(b).to_string()
        }
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad atyp {}", other),
            ))
        }
    };
    let port = s.read_u16().await?;
    Ok((host, port))
}

async fn relay(mut client: TcpStream) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[0x05, 0x00]).await?;

    let (host, port) = read_target(&mut client).await?;
    match TcpStream::connect((host.as_str(), port)).await {
        Ok(mut upstream) => {
            client.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
            let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        }
        Err(_) => {
            client.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
        }
    }
    Ok(())
}

/// Serve SOCKS5 on `listener` until the returned handle is aborted.
/// Aborting also drops every open connection.
pub fn serve_socks(listener: TcpListener, behaviour: ProxyBehaviour) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut conns = JoinSet::new();
        while let Ok((stream, _)) = listener.accept().await {
            match behaviour {
                ProxyBehaviour::Relay => {
                    conns.spawn(async move {
                        let _ = relay(stream).await;
                    });
                }
                ProxyBehaviour::Hang => {
                    conns.spawn(async move {
                        let _held = stream;
                        std::future::pending::<()>().await;
                    });
                }
            }
        }
    })
}

pub async fn spawn_socks_proxy(behaviour: ProxyBehaviour) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (addr, serve_socks(listener, behaviour))
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Body size for a plain `GET /`.
pub const DEFAULT_BODY: usize = 256 * 1024;

async fn serve_http_conn(mut s: TcpStream) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = s.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or("/").to_string();
    let content_length: usize = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0);

    if method == "POST" {
        let mut remaining = content_length.saturating_sub(buf.len() - header_end);
        while remaining > 0 {
            let n = s.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            remaining = remaining.saturating_sub(n);
        }
        s.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
        return Ok(());
    }

    if path == "/missing" {
        s.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
        return Ok(());
    }

    let size = path
        .strip_prefix("/bytes/")
        .and_then(|n| n.parse().ok())
        .unwrap_or(DEFAULT_BODY);
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        size
    );
    s.write_all(header.as_bytes()).await?;
    let block = vec![0u8; 16 * 1024];
    let mut left = size;
    while left > 0 {
        let n = left.min(block.len());
        s.write_all(&block[..n]).await?;
        left -= n;
    }
    s.flush().await?;
    Ok(())
}

/// Minimal HTTP/1.1 server: `GET /bytes/<n>`, `GET /missing` (404), and
/// `POST` (body discarded).
pub async fn spawn_http_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut conns = JoinSet::new();
        while let Ok((stream, _)) = listener.accept().await {
            conns.spawn(async move {
                let _ = serve_http_conn(stream).await;
            });
        }
    });
    (addr, handle)
}

/// A local port nothing listens on.
pub async fn closed_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    l.local_addr().unwrap().port()
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Node whose fake client behaves according to `server`:
/// `hang*` hangs, `broken*` never starts, `panic*` relays but panics the
/// first time it is stopped, anything else relays.
pub fn node(server: &str, port: u16) -> NodeConfig {
    NodeConfig {
        protocol: Protocol::Shadowsocks,
        server: server.to_string(),
        server_port: port,
        password: "pw".to_string(),
        method: "aes-128-gcm".to_string(),
        params: BTreeMap::new(),
        group: "test".to_string(),
        remarks: format!("{} {}", server, port),
    }
}

// ---------------------------------------------------------------------------
// Fake clients
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeStats {
    /// Ports with a live fake client.
    pub running: Mutex<HashSet<u16>>,
    pub max_running: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    /// Starts on a port that already had a live client.
    pub double_binds: AtomicUsize,
}

impl FakeStats {
    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }
}

#[derive(Clone, Default)]
pub struct FakeFactory {
    pub stats: Arc<FakeStats>,
}

impl ClientFactory for FakeFactory {
    fn create(&self, node: &NodeConfig) -> Box<dyn ClientAdapter> {
        Box::new(FakeClient {
            server: node.server.clone(),
            stats: self.stats.clone(),
            proxy: None,
            port: None,
        })
    }
}

pub struct FakeClient {
    server: String,
    stats: Arc<FakeStats>,
    proxy: Option<JoinHandle<()>>,
    port: Option<u16>,
}

#[async_trait]
impl ClientAdapter for FakeClient {
    async fn start(&mut self, _node: &NodeConfig, local_port: u16, _timeout: Duration) -> Result<(), ClientError> {
        if let Some(port) = self.port {
            return Err(ClientError::AlreadyRunning(port));
        }
        if self.server.starts_with("broken") {
            return Err(ClientError::StartFailed("fake client refuses to start".into()));
        }
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port))
            .await
            .map_err(|_| ClientError::PortConflict(local_port))?;
        let behaviour = if self.server.starts_with("hang") {
            ProxyBehaviour::Hang
        } else {
            ProxyBehaviour::Relay
        };

        {
            let mut running = self.stats.running.lock().unwrap();
            if !running.insert(local_port) {
                self.stats.double_binds.fetch_add(1, Ordering::SeqCst);
            }
            self.stats.max_running.fetch_max(running.len(), Ordering::SeqCst);
        }
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        self.proxy = Some(serve_socks(listener, behaviour));
        self.port = Some(local_port);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(proxy) = self.proxy.take() {
            proxy.abort();
            let _ = proxy.await;
        }
        if let Some(port) = self.port.take() {
            self.stats.running.lock().unwrap().remove(&port);
            self.stats.stops.fetch_add(1, Ordering::SeqCst);
            if self.server.starts_with("panic") {
                panic!("fake client crashed while stopping");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.port.is_some()
    }
}

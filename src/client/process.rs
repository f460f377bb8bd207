//! Client adapter backed by a real child process.
//!
//! The translated configuration is written to the work directory, the client
//! binary is spawned with `kill_on_drop`, and readiness is decided by
//! polling the local port until it accepts a TCP connection. Where the OS
//! shows socket ownership, a listener held by some other process is a port
//! conflict rather than readiness.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::translate::{client_args, client_config};
use super::{ClientAdapter, ClientError, ClientFactory, ClientKind};
use crate::config::ClientsConfig;
use crate::context::Platform;
use crate::node::NodeConfig;
use crate::ports::{BindProbe, PortProbe};

const READY_POLL: Duration = Duration::from_millis(100);
const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// ProcessClient
// ---------------------------------------------------------------------------

pub struct ProcessClient {
    kind: ClientKind,
    binary: PathBuf,
    work_dir: PathBuf,
    debug_output: bool,
    stop_grace: Duration,
    child: Option<Child>,
    port: Option<u16>,
    config_path: Option<PathBuf>,
}

impl ProcessClient {
    pub fn new(kind: ClientKind, binary: PathBuf, work_dir: PathBuf, stop_grace: Duration) -> Self {
        Self {
            kind,
            binary,
            work_dir,
            debug_output: false,
            stop_grace,
            child: None,
            port: None,
            config_path: None,
        }
    }

    pub fn with_debug_output(mut self, debug_output: bool) -> Self {
        self.debug_output = debug_output;
        self
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    /// PID of the running client, if any.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    async fn write_config(&self, node: &NodeConfig, local_port: u16) -> Result<PathBuf, ClientError> {
        let cfg = client_config(self.kind, node, local_port)?;
        let body = serde_json::to_vec_pretty(&cfg).map_err(|e| ClientError::Config(e.to_string()))?;

        tokio::fs::create_dir_all(&self.work_dir).await.map_err(|e| {
            ClientError::StartFailed(format!("cannot create {}: {}", self.work_dir.display(), e))
        })?;
        let path = self
            .work_dir
            .join(format!("{}-{}-{}.json", self.kind, local_port, Uuid::new_v4().simple()));
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| ClientError::StartFailed(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(path)
    }

    fn spawn(&self, config_path: &Path) -> Result<Child, ClientError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(client_args(self.kind, &config_path.to_string_lossy()))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.debug_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        cmd.spawn().map_err(|e| {
            ClientError::StartFailed(format!("failed to spawn {}: {}", self.binary.display(), e))
        })
    }

    async fn wait_ready(&mut self, local_port: u16, timeout: Duration) -> Result<(), ClientError> {
        let deadline = Instant::now() + timeout;
        let addr = (Ipv4Addr::LOCALHOST, local_port);

        loop {
            if let Some(child) = self.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        // Somebody else answering on our port means we lost a bind race.
                        if port_accepts(addr).await {
                            return Err(ClientError::PortConflict(local_port));
                        }
                        return Err(ClientError::StartFailed(format!(
                            "{} exited early with {}",
                            self.kind, status
                        )));
                    }
                    Ok(None) => {}
                    Err(e) => return Err(ClientError::StartFailed(format!("cannot poll client: {}", e))),
                }
            }

            if port_accepts(addr).await {
                let pid = self.child.as_ref().and_then(|c| c.id());
                if let Some(pid) = pid {
                    if listener_owned_by(pid, local_port) == Some(false) {
                        warn!(kind = %self.kind, local_port, pid, "port answered by another process");
                        return Err(ClientError::PortConflict(local_port));
                    }
                }
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(ClientError::StartFailed(format!(
                    "local port {} not reachable within {:?}",
                    local_port, timeout
                )));
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }
}

async fn port_accepts(addr: (Ipv4Addr, u16)) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Whether the socket listening on `port` is held by process `pid`. `None`
/// when no listener can be found or the platform does not expose it.
#[cfg(target_os = "linux")]
fn listener_owned_by(pid: u32, port: u16) -> Option<bool> {
    let mut sockets = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(content) = std::fs::read_to_string(table) else {
            continue;
        };
        for line in content.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // 0A is TCP_LISTEN
            if fields.len() < 10 || fields[3] != "0A" || fields[9] == "0" {
                continue;
            }
            let local_port = fields[1]
                .rsplit(':')
                .next()
                .and_then(|p| u16::from_str_radix(p, 16).ok());
            if local_port == Some(port) {
                sockets.push(format!("socket:[{}]", fields[9]));
            }
        }
    }
    if sockets.is_empty() {
        return None;
    }

    let fds = std::fs::read_dir(format!("/proc/{}/fd", pid)).ok()?;
    let owned = fds
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| std::fs::read_link(entry.path()).ok())
        .any(|target| target.to_str().is_some_and(|t| sockets.iter().any(|s| s == t)));
    Some(owned)
}

#[cfg(not(target_os = "linux"))]
fn listener_owned_by(_pid: u32, _port: u16) -> Option<bool> {
    None
}

#[async_trait]
impl ClientAdapter for ProcessClient {
    async fn start(
        &mut self,
        node: &NodeConfig,
        local_port: u16,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        if self.child.is_some() {
            return Err(ClientError::AlreadyRunning(self.port.unwrap_or(local_port)));
        }
        if !BindProbe.is_free(local_port) {
            return Err(ClientError::PortConflict(local_port));
        }

        let config_path = self.write_config(node, local_port).await?;
        let child = match self.spawn(&config_path) {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_file(&config_path).await;
                return Err(e);
            }
        };

        info!(
            kind = %self.kind,
            pid = child.id(),
            server = %node.server,
            server_port = node.server_port,
            local_port,
            "client started"
        );
        self.child = Some(child);
        self.port = Some(local_port);
        self.config_path = Some(config_path);

        match self.wait_ready(local_port, timeout).await {
            Ok(()) => {
                debug!(kind = %self.kind, local_port, "client ready");
                Ok(())
            }
            Err(e) => {
                warn!(kind = %self.kind, local_port, error = %e, "client not ready, stopping");
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            terminate_child(&mut child, self.stop_grace).await;
            debug!(kind = %self.kind, port = ?self.port, "client stopped");
        }
        if let Some(path) = self.config_path.take() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %e, "could not remove client config");
            }
        }
        self.port = None;
    }

    fn is_running(&self) -> bool {
        self.child.is_some()
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. The child is always reaped.
async fn terminate_child(child: &mut Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(exit_code = status.code(), "client had already exited");
        return;
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain signal delivery to a pid we own and have not reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    let grace = Duration::ZERO;

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "client exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for client after SIGTERM");
            let _ = child.kill().await;
        }
        Err(_) => {
            warn!("client did not exit within grace period, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill client");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

pub struct ProcessClientFactory {
    clients: ClientsConfig,
    platform: Platform,
    stop_grace: Duration,
}

impl ProcessClientFactory {
    pub fn new(clients: ClientsConfig, platform: Platform, stop_grace: Duration) -> Self {
        Self {
            clients,
            platform,
            stop_grace,
        }
    }

    /// Binary for `kind`, with the platform's executable suffix when the
    /// configured path has no extension.
    pub fn binary(&self, kind: ClientKind) -> PathBuf {
        let path = self.clients.binary(kind);
        let suffix = self.platform.exe_suffix();
        if suffix.is_empty() || path.extension().is_some() {
            return path.to_path_buf();
        }
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Client binaries the given nodes need that cannot be found, one entry
    /// per kind.
    pub fn missing_binaries(&self, nodes: &[NodeConfig]) -> Vec<(ClientKind, PathBuf)> {
        let mut checked: Vec<ClientKind> = Vec::new();
        let mut missing = Vec::new();
        for node in nodes {
            let kind = ClientKind::from(node.protocol);
            if checked.contains(&kind) {
                continue;
            }
            checked.push(kind);
            let binary = self.binary(kind);
            if !binary_available(&binary) {
                missing.push((kind, binary));
            }
        }
        missing
    }
}

/// Whether `binary` exists. Bare names are looked up on `PATH`.
pub fn binary_available(binary: &Path) -> bool {
    if binary.components().count() > 1 {
        return binary.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file()))
        .unwrap_or(false)
}

impl ClientFactory for ProcessClientFactory {
    fn create(&self, node: &NodeConfig) -> Box<dyn ClientAdapter> {
        let kind = ClientKind::from(node.protocol);
        Box::new(
            ProcessClient::new(kind, self.binary(kind), self.clients.work_dir.clone(), self.stop_grace)
                .with_debug_output(self.clients.debug_output),
        )
    }
}

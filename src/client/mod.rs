//! Local proxy clients: one external executable per node under test.
//!
//! A [`ClientAdapter`] owns at most one child process. The runner starts it
//! on a leased local port, runs a strategy through the SOCKS5 endpoint it
//! exposes, and stops it on every exit path.

pub mod process;
pub mod translate;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::node::{NodeConfig, Protocol};

pub use process::{binary_available, ProcessClient, ProcessClientFactory};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The process did not launch, exited early, or never opened its port.
    #[error("client failed to start: {0}")]
    StartFailed(String),

    #[error("local port {0} is already in use")]
    PortConflict(u16),

    #[error("client is already running on port {0}")]
    AlreadyRunning(u16),

    #[error("cannot build client configuration: {0}")]
    Config(String),
}

/// Which client executable drives a node. Chosen once per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ClientKind {
    Shadowsocks,
    ShadowsocksR,
    V2Ray,
    Trojan,
}

impl From<Protocol> for ClientKind {
    fn from(p: Protocol) -> Self {
        match p {
            Protocol::Shadowsocks => ClientKind::Shadowsocks,
            Protocol::ShadowsocksR => ClientKind::ShadowsocksR,
            Protocol::V2Ray => ClientKind::V2Ray,
            Protocol::Trojan => ClientKind::Trojan,
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKind::Shadowsocks => write!(f, "shadowsocks"),
            ClientKind::ShadowsocksR => write!(f, "shadowsocksr"),
            ClientKind::V2Ray => write!(f, "v2ray"),
            ClientKind::Trojan => write!(f, "trojan"),
        }
    }
}

/// Start/stop contract every client implementation honours.
#[async_trait]
pub trait ClientAdapter: Send {
    /// Launch the client for `node` on `local_port` and wait until the port
    /// accepts connections, at most `timeout`.
    async fn start(
        &mut self,
        node: &NodeConfig,
        local_port: u16,
        timeout: Duration,
    ) -> Result<(), ClientError>;

    /// Terminate the client. Does nothing when nothing is running.
    async fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Builds a fresh adapter for each job.
pub trait ClientFactory: Send + Sync {
    fn create(&self, node: &NodeConfig) -> Box<dyn ClientAdapter>;
}

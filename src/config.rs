//! TOML configuration.
//!
//! Layered the same way for every entry point: an explicit path, then the
//! `PROXYSPEED_CONFIG` environment variable, then `./proxyspeed.toml`, then
//! compiled-in defaults. Every section is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::ClientKind;

pub const CONFIG_ENV: &str = "PROXYSPEED_CONFIG";
const LOCAL_CONFIG: &str = "proxyspeed.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub clients: ClientsConfig,
    #[serde(default)]
    pub ping: PingConfig,
    #[serde(default)]
    pub throughput: ThroughputConfig,
    #[serde(default)]
    pub web_page: WebPageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration. An explicitly requested file must load;
    /// the implicit locations fall through to defaults on error.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "{} set but file could not be loaded, trying fallback",
                    CONFIG_ENV
                ),
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %local.display(),
                    error = %e,
                    "local config file exists but could not be loaded, using defaults"
                ),
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Maximum nodes tested at once.
    pub concurrency: usize,
    /// How long a client gets to open its local port.
    pub start_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL when stopping a client.
    pub stop_grace_ms: u64,
    /// Upper bound on one node's strategy run.
    pub node_deadline_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 4)
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            start_timeout_ms: 10_000,
            stop_grace_ms: 3_000,
            node_deadline_ms: 60_000,
            retry_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub range_start: u16,
    /// Inclusive.
    pub range_end: u16,
    pub max_probe_attempts: usize,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: 10870,
            range_end: 11869,
            max_probe_attempts: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientsConfig {
    pub shadowsocks: PathBuf,
    pub shadowsocksr: PathBuf,
    pub v2ray: PathBuf,
    pub trojan: PathBuf,
    /// Where generated client configuration files are written.
    pub work_dir: PathBuf,
    /// Let client stdout/stderr through instead of discarding it.
    pub debug_output: bool,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            shadowsocks: PathBuf::from("ss-local"),
            shadowsocksr: PathBuf::from("ssr-local"),
            v2ray: PathBuf::from("v2ray"),
            trojan: PathBuf::from("trojan-go"),
            work_dir: std::env::temp_dir().join("proxyspeed"),
            debug_output: false,
        }
    }
}

impl ClientsConfig {
    pub fn binary(&self, kind: ClientKind) -> &Path {
        match kind {
            ClientKind::Shadowsocks => &self.shadowsocks,
            ClientKind::ShadowsocksR => &self.shadowsocksr,
            ClientKind::V2Ray => &self.v2ray,
            ClientKind::Trojan => &self.trojan,
        }
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    pub target_host: String,
    pub target_port: u16,
    pub count: u32,
    pub attempt_timeout_ms: u64,
    pub interval_ms: u64,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            target_host: "www.google.com".to_string(),
            target_port: 80,
            count: 4,
            attempt_timeout_ms: 3_000,
            interval_ms: 100,
        }
    }
}

impl PingConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThroughputConfig {
    pub download_url: String,
    /// Parallel download streams.
    pub connections: u32,
    pub duration_ms: u64,
    pub sample_interval_ms: u64,
    /// Timeout for establishing each request (headers received).
    pub request_timeout_ms: u64,
    pub upload_url: Option<String>,
    pub upload_bytes: u64,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            download_url: "http://speed.cloudflare.com/__down?bytes=104857600".to_string(),
            connections: 1,
            duration_ms: 10_000,
            sample_interval_ms: 250,
            request_timeout_ms: 5_000,
            upload_url: None,
            upload_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebPageConfig {
    /// Fetched in order, one after another.
    pub urls: Vec<String>,
    pub request_timeout_ms: u64,
}

impl Default for WebPageConfig {
    fn default() -> Self {
        Self {
            urls: vec![
                "https://www.google.com/".to_string(),
                "https://www.youtube.com/".to_string(),
                "https://www.github.com/".to_string(),
                "https://www.wikipedia.org/".to_string(),
            ],
            request_timeout_ms: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

//! Measurement strategies run through a client's local SOCKS5 endpoint.

pub mod socks;
pub mod tcp_ping;
pub mod throughput;
pub mod web_page;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{BenchConfig, PingConfig, ThroughputConfig, WebPageConfig};
use crate::node::NodeConfig;
use crate::record::{PingStats, ThroughputStats, WebPageStats};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// No attempt succeeded.
    #[error("network error: {0}")]
    Network(String),
}

/// Raw measurements; the runner turns them into a record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyOutput {
    pub ping: Option<PingStats>,
    pub throughput: Option<ThroughputStats>,
    pub web_page: Option<WebPageStats>,
    pub http_codes: Vec<u16>,
}

impl StrategyOutput {
    fn merge(mut self, other: StrategyOutput) -> Self {
        self.ping = self.ping.or(other.ping);
        self.throughput = self.throughput.or(other.throughput);
        self.web_page = self.web_page.or(other.web_page);
        self.http_codes.extend(other.http_codes);
        self
    }
}

/// Which test to run, as picked on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestMode {
    TcpPing,
    Throughput,
    WebPageSimulation,
    Combined,
}

impl FromStr for TestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp-ping" | "ping" | "pingonly" => Ok(TestMode::TcpPing),
            "throughput" | "speed" => Ok(TestMode::Throughput),
            "wps" | "web-page-simulation" => Ok(TestMode::WebPageSimulation),
            "combined" | "default" | "all" => Ok(TestMode::Combined),
            "stream" => Err("stream mode (streaming-service unlock checks) is not supported".to_string()),
            other => Err(format!(
                "unknown test mode '{}' (expected tcp-ping, throughput, wps or combined)",
                other
            )),
        }
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestMode::TcpPing => write!(f, "tcp-ping"),
            TestMode::Throughput => write!(f, "throughput"),
            TestMode::WebPageSimulation => write!(f, "wps"),
            TestMode::Combined => write!(f, "combined"),
        }
    }
}

/// A strategy together with its settings.
#[derive(Debug, Clone)]
pub enum TestStrategy {
    TcpPing(PingConfig),
    Throughput(ThroughputConfig),
    WebPageSimulation(WebPageConfig),
    Combined(PingConfig, ThroughputConfig),
}

impl TestStrategy {
    pub fn from_mode(mode: TestMode, cfg: &BenchConfig) -> Self {
        match mode {
            TestMode::TcpPing => TestStrategy::TcpPing(cfg.ping.clone()),
            TestMode::Throughput => TestStrategy::Throughput(cfg.throughput.clone()),
            TestMode::WebPageSimulation => TestStrategy::WebPageSimulation(cfg.web_page.clone()),
            TestMode::Combined => TestStrategy::Combined(cfg.ping.clone(), cfg.throughput.clone()),
        }
    }

    pub fn mode(&self) -> TestMode {
        match self {
            TestStrategy::TcpPing(_) => TestMode::TcpPing,
            TestStrategy::Throughput(_) => TestMode::Throughput,
            TestStrategy::WebPageSimulation(_) => TestMode::WebPageSimulation,
            TestStrategy::Combined(..) => TestMode::Combined,
        }
    }

    /// Run against `endpoint`, abandoning whatever is outstanding once
    /// `deadline` passes.
    pub async fn run(
        &self,
        endpoint: SocketAddr,
        node: &NodeConfig,
        deadline: Duration,
    ) -> Result<StrategyOutput, StrategyError> {
        debug!(mode = %self.mode(), node = %node.id(), %endpoint, "strategy start");
        match tokio::time::timeout(deadline, self.run_inner(endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(StrategyError::Timeout(deadline)),
        }
    }

    async fn run_inner(&self, endpoint: SocketAddr) -> Result<StrategyOutput, StrategyError> {
        match self {
            TestStrategy::TcpPing(cfg) => tcp_ping::run(endpoint, cfg).await,
            TestStrategy::Throughput(cfg) => throughput::run(endpoint, cfg).await,
            TestStrategy::WebPageSimulation(cfg) => web_page::run(endpoint, cfg).await,
            TestStrategy::Combined(ping_cfg, tp_cfg) => {
                let ping = tcp_ping::run(endpoint, ping_cfg).await;
                if let Err(e) = &ping {
                    warn!(error = %e, "ping phase failed, continuing with throughput");
                }
                let speed = throughput::run(endpoint, tp_cfg).await;
                match (ping, speed) {
                    (Ok(p), Ok(s)) => Ok(p.merge(s)),
                    (Ok(p), Err(_)) => Ok(p),
                    (Err(_), Ok(s)) => Ok(s),
                    (Err(pe), Err(se)) => Err(StrategyError::Network(format!("ping: {}; throughput: {}", pe, se))),
                }
            }
        }
    }
}

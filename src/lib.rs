//! proxyspeed -- benchmark proxy nodes through their own local clients.
//!
//! Each node gets a local proxy client on a leased port; latency and
//! throughput are measured through the client's SOCKS5 endpoint, and the
//! per-node records are sorted and exported at the end of the run.

pub mod client;
pub mod config;
pub mod context;
pub mod node;
pub mod orchestrator;
pub mod ports;
pub mod record;
pub mod runner;
pub mod strategy;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientKind, ProcessClientFactory};
use crate::config::BenchConfig;
use crate::context::RunContext;
use crate::node::NodeConfig;
use crate::orchestrator::{Exporter, FilterSpec, Orchestrator, RunOutcome, SortSpec};
use crate::ports::PortAllocator;
use crate::strategy::{TestMode, TestStrategy};

/// How the results of a run are measured and presented.
#[derive(Debug, Clone, Default)]
pub struct BenchOptions {
    pub mode: Option<TestMode>,
    pub sort: SortSpec,
    pub filter: FilterSpec,
}

/// Client executables `nodes` need that are not installed where `cfg`
/// points.
pub fn missing_clients(cfg: &BenchConfig, nodes: &[NodeConfig]) -> Vec<(ClientKind, PathBuf)> {
    let ctx = RunContext::from_config(cfg);
    ProcessClientFactory::new(cfg.clients.clone(), ctx.platform, ctx.timeouts.client_stop_grace)
        .missing_binaries(nodes)
}

/// Benchmark `nodes` with the real client executables from `cfg`.
pub async fn run_bench(
    cfg: &BenchConfig,
    nodes: Vec<NodeConfig>,
    options: BenchOptions,
    exporter: &mut dyn Exporter,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    let ctx = RunContext::from_config(cfg);
    let mode = options.mode.unwrap_or(TestMode::Combined);

    tracing::info!(
        platform = ?ctx.platform,
        ports = %format!("{}-{}", cfg.ports.range_start, cfg.ports.range_end),
        work_dir = %cfg.clients.work_dir.display(),
        "Initializing run"
    );

    let ports = Arc::new(PortAllocator::new(
        cfg.ports.range_start..=cfg.ports.range_end,
        cfg.ports.max_probe_attempts,
    ));
    let clients = Arc::new(ProcessClientFactory::new(
        cfg.clients.clone(),
        ctx.platform,
        ctx.timeouts.client_stop_grace,
    ));

    let mut orchestrator = Orchestrator::new(ctx, ports, clients, TestStrategy::from_mode(mode, cfg))
        .with_sort(options.sort)
        .with_filter(options.filter);
    let outcome = orchestrator.run(nodes, exporter, cancel).await?;
    Ok(outcome)
}

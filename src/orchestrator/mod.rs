//! Test orchestration: schedules node runners under a concurrency cap,
//! collects one record per node, and hands the sorted report to an exporter.
//!
//! A run moves through `Idle -> Scheduling -> Running -> Aggregating -> Done`.
//! Scheduling is greedy: a finished runner immediately frees its slot for the
//! next pending node. Cancelling the run token stops new spawns, makes
//! in-flight runners abandon their strategy and stop their client, and turns
//! every node that never started into a `Timeout` record.

pub mod export;
pub mod sort;
pub mod store;

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::client::ClientFactory;
use crate::context::RunContext;
use crate::node::NodeConfig;
use crate::ports::PortAllocator;
use crate::record::{MeasurementRecord, RecordStatus};
use crate::runner::{run_node, TestJob};
use crate::strategy::TestStrategy;

pub use export::Exporter;
pub use sort::{FilterSpec, SortSpec};
pub use store::{ReportEntry, ResultStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Scheduling,
    Running,
    Aggregating,
    Done,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("orchestrator already ran (state {0:?})")]
    AlreadyRun(RunState),

    #[error("export failed: {0}")]
    Export(String),
}

/// What a finished run leaves behind.
#[derive(Debug)]
pub struct RunOutcome {
    /// Every tested node, in completion order.
    pub store: ResultStore,
    /// Sorted and filtered view handed to the exporter.
    pub report: Vec<ReportEntry>,
    pub cancelled: bool,
}

pub struct Orchestrator {
    ctx: Arc<RunContext>,
    ports: Arc<PortAllocator>,
    clients: Arc<dyn ClientFactory>,
    strategy: Arc<TestStrategy>,
    sort: SortSpec,
    filter: FilterSpec,
    history: Vec<RunState>,
}

impl Orchestrator {
    pub fn new(
        ctx: RunContext,
        ports: Arc<PortAllocator>,
        clients: Arc<dyn ClientFactory>,
        strategy: TestStrategy,
    ) -> Self {
        Self {
            ctx: Arc::new(ctx),
            ports,
            clients,
            strategy: Arc::new(strategy),
            sort: SortSpec::None,
            filter: FilterSpec::default(),
            history: vec![RunState::Idle],
        }
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filter = filter;
        self
    }

    pub fn state(&self) -> RunState {
        self.history.last().copied().unwrap_or(RunState::Idle)
    }

    /// Every state entered so far, oldest first.
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state(), to = ?next, "run state");
        self.history.push(next);
    }

    fn spawn_runner(
        &self,
        set: &mut JoinSet<(NodeConfig, MeasurementRecord)>,
        node: NodeConfig,
        cancel: &CancellationToken,
    ) {
        let span = info_span!("node", node = %node.id(), label = %node.label());
        let job = TestJob::new(node, self.strategy.clone());
        let mut adapter = self.clients.create(&job.node);
        let ports = self.ports.clone();
        let ctx = self.ctx.clone();
        let cancel = cancel.clone();

        set.spawn(
            async move {
                let started_at = Utc::now();
                let result =
                    AssertUnwindSafe(run_node(&job, adapter.as_mut(), &ports, &ctx, &cancel))
                        .catch_unwind()
                        .await;
                let record = match result {
                    Ok(record) => record,
                    Err(_) => {
                        error!("node runner panicked");
                        adapter.stop().await;
                        MeasurementRecord::failed(RecordStatus::InternalError, "node runner panicked", started_at)
                    }
                };
                (job.node, record)
            }
            .instrument(span),
        );
    }

    /// Test every node and export the report. Can be called once.
    pub async fn run(
        &mut self,
        nodes: Vec<NodeConfig>,
        exporter: &mut dyn Exporter,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, OrchestratorError> {
        if self.state() != RunState::Idle {
            return Err(OrchestratorError::AlreadyRun(self.state()));
        }

        // --- Scheduling ---
        self.transition(RunState::Scheduling);
        let limit = self.ctx.concurrency;
        if limit == 0 {
            return Err(OrchestratorError::InvalidConcurrency);
        }

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(nodes.len());
        for node in nodes {
            if seen.insert(node.id()) {
                unique.push(node);
            } else {
                warn!(node = %node.id(), label = %node.label(), "duplicate node skipped");
            }
        }
        info!(nodes = unique.len(), concurrency = limit, mode = %self.strategy.mode(), "starting run");

        // --- Running ---
        self.transition(RunState::Running);
        let mut store = ResultStore::new();
        let mut pending: VecDeque<NodeConfig> = unique.iter().cloned().collect();
        let mut set = JoinSet::new();

        loop {
            while set.len() < limit && !cancel.is_cancelled() {
                let Some(node) = pending.pop_front() else { break };
                self.spawn_runner(&mut set, node, &cancel);
            }

            match set.join_next().await {
                Some(Ok((node, record))) => {
                    debug!(node = %node.id(), status = %record.status, done = store.len() + 1, "runner finished");
                    if let Err(e) = store.insert(node, record) {
                        error!(error = %e, "runner produced a second record");
                    }
                }
                Some(Err(e)) => error!(error = %e, "runner task lost"),
                None => break,
            }
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            warn!(skipped = pending.len(), completed = store.len(), "run cancelled");
        }
        for node in unique {
            if store.contains(&node.id()) {
                continue;
            }
            let (status, message) = if cancelled {
                (RecordStatus::Timeout, "cancelled before start")
            } else {
                (RecordStatus::InternalError, "runner task lost")
            };
            let record = MeasurementRecord::failed(status, message, Utc::now());
            if let Err(e) = store.insert(node, record) {
                error!(error = %e, "could not record skipped node");
            }
        }

        // --- Aggregating ---
        self.transition(RunState::Aggregating);
        let report = sort::report_view(store.entries(), self.sort, &self.filter);
        info!(
            tested = store.len(),
            reported = report.len(),
            ok = store.iter().filter(|e| e.record.status.is_success()).count(),
            sort = %self.sort,
            "run complete"
        );
        exporter
            .export(&report)
            .map_err(|e| OrchestratorError::Export(format!("{:#}", e)))?;

        self.transition(RunState::Done);
        Ok(RunOutcome {
            store,
            report,
            cancelled,
        })
    }
}

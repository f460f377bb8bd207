//! Drives a single node through start -> test -> stop.
//!
//! Every failure inside a run becomes a status-tagged record. The client is
//! stopped and the port lease dropped on every path out of [`run_node`].

use std::net::{Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ClientAdapter, ClientError};
use crate::context::RunContext;
use crate::node::NodeConfig;
use crate::ports::{PortAllocator, PortLease};
use crate::record::{MeasurementRecord, RecordStatus};
use crate::strategy::{StrategyError, StrategyOutput, TestStrategy};

/// One node bound to the strategy it will be measured with.
#[derive(Debug, Clone)]
pub struct TestJob {
    pub node: NodeConfig,
    pub strategy: Arc<TestStrategy>,
}

impl TestJob {
    pub fn new(node: NodeConfig, strategy: Arc<TestStrategy>) -> Self {
        Self { node, strategy }
    }
}

enum Outcome {
    Finished(Result<StrategyOutput, StrategyError>),
    Cancelled,
    Panicked(String),
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Lease a port and start the client, retrying with a fresh port on
/// conflicts and start failures.
async fn start_client(
    job: &TestJob,
    adapter: &mut dyn ClientAdapter,
    ports: &Arc<PortAllocator>,
    ctx: &RunContext,
    cancel: &CancellationToken,
) -> Result<PortLease, (RecordStatus, String)> {
    let attempts = ctx.retry.attempts();
    let mut last_err: Option<ClientError> = None;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err((RecordStatus::Timeout, "run cancelled before client start".to_string()));
        }

        let lease = ports
            .lease()
            .map_err(|e| (RecordStatus::PortsExhausted, e.to_string()))?;
        let port = lease.port();

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = AssertUnwindSafe(adapter.start(&job.node, port, ctx.timeouts.client_start)).catch_unwind() => Some(r),
        };

        let started = match started {
            None => None,
            Some(Ok(r)) => Some(r),
            Some(Err(payload)) => {
                let msg = panic_message(payload.as_ref());
                error!(port, panic = %msg, "client start panicked");
                adapter.stop().await;
                return Err((RecordStatus::InternalError, format!("client start panicked: {}", msg)));
            }
        };

        match started {
            None => {
                adapter.stop().await;
                return Err((RecordStatus::Timeout, "run cancelled while starting client".to_string()));
            }
            Some(Ok(())) => {
                debug!(port, attempt, "client up");
                return Ok(lease);
            }
            Some(Err(e @ ClientError::AlreadyRunning(_))) => {
                error!(port, error = %e, "client adapter reused across jobs");
                adapter.stop().await;
                return Err((RecordStatus::InternalError, e.to_string()));
            }
            Some(Err(e @ ClientError::Config(_))) => {
                warn!(error = %e, "node cannot be translated for its client");
                return Err((RecordStatus::ClientStartFailed, e.to_string()));
            }
            Some(Err(e)) => {
                warn!(port, attempt, attempts, error = %e, "client start failed");
                // A half-started client must not outlive its port.
                adapter.stop().await;
                drop(lease);
                last_err = Some(e);
                if attempt < attempts {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(ctx.retry.backoff) => {}
                    }
                }
            }
        }
    }

    let status = match last_err {
        Some(ClientError::PortConflict(_)) => RecordStatus::PortConflict,
        _ => RecordStatus::ClientStartFailed,
    };
    let detail = last_err.map(|e| e.to_string()).unwrap_or_default();
    Err((status, format!("gave up after {} attempts: {}", attempts, detail)))
}

/// Run one job to completion and produce its record.
pub async fn run_node(
    job: &TestJob,
    adapter: &mut dyn ClientAdapter,
    ports: &Arc<PortAllocator>,
    ctx: &RunContext,
    cancel: &CancellationToken,
) -> MeasurementRecord {
    let started_at = Utc::now();

    let lease = match start_client(job, adapter, ports, ctx, cancel).await {
        Ok(lease) => lease,
        Err((status, message)) => {
            info!(status = %status, %message, "node not tested");
            return MeasurementRecord::failed(status, message, started_at);
        }
    };
    let port = lease.port();
    let endpoint = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    // A finished measurement wins over a cancel that lands in the same poll.
    let outcome = tokio::select! {
        biased;
        r = AssertUnwindSafe(job.strategy.run(endpoint, &job.node, ctx.timeouts.node_deadline)).catch_unwind() => {
            match r {
                Ok(result) => Outcome::Finished(result),
                Err(payload) => Outcome::Panicked(panic_message(payload.as_ref())),
            }
        }
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    adapter.stop().await;
    drop(lease);

    let mut record = MeasurementRecord::succeeded(started_at);
    record.local_port = Some(port);

    match outcome {
        Outcome::Finished(Ok(out)) => {
            record.ping = out.ping;
            record.throughput = out.throughput;
            record.web_page = out.web_page;
            record.http_codes = out.http_codes;
        }
        Outcome::Finished(Err(e)) => {
            record.status = match e {
                StrategyError::Timeout(_) => RecordStatus::Timeout,
                StrategyError::Network(_) => RecordStatus::NetworkError,
            };
            record.message = Some(e.to_string());
        }
        Outcome::Cancelled => {
            record.status = RecordStatus::Timeout;
            record.message = Some("run cancelled during test".to_string());
        }
        Outcome::Panicked(msg) => {
            error!(panic = %msg, "strategy panicked");
            record.status = RecordStatus::InternalError;
            record.message = Some(format!("strategy panicked: {}", msg));
        }
    }
    record.finished_at = Utc::now();

    info!(
        status = %record.status,
        ping_ms = ?record.latency_ms(),
        download_bps = ?record.download_bps(),
        "node finished"
    );
    record
}

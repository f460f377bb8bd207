//! Latency through the proxy: time to establish a tunnel to a fixed target.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::{socks, StrategyError, StrategyOutput};
use crate::config::PingConfig;
use crate::record::PingStats;

pub async fn run(endpoint: SocketAddr, cfg: &PingConfig) -> Result<StrategyOutput, StrategyError> {
    let count = cfg.count.max(1);
    let mut samples = Vec::with_capacity(count as usize);

    for attempt in 0..count {
        if attempt > 0 && cfg.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(cfg.interval_ms)).await;
        }

        let start = Instant::now();
        let result = tokio::time::timeout(
            cfg.attempt_timeout(),
            socks::connect(endpoint, &cfg.target_host, cfg.target_port),
        )
        .await;

        match result {
            Ok(Ok(_stream)) => {
                let ms = start.elapsed().as_secs_f64() * 1000.0;
                debug!(attempt, rtt_ms = ms, "ping ok");
                samples.push(Some(ms));
            }
            Ok(Err(e)) => {
                debug!(attempt, error = %e, "ping failed");
                samples.push(None);
            }
            Err(_) => {
                debug!(attempt, "ping timed out");
                samples.push(None);
            }
        }
    }

    match PingStats::from_samples(samples) {
        Some(stats) => Ok(StrategyOutput {
            ping: Some(stats),
            ..Default::default()
        }),
        None => Err(StrategyError::Network(format!(
            "all {} ping attempts to {}:{} failed",
            count, cfg.target_host, cfg.target_port
        ))),
    }
}

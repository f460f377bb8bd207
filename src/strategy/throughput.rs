//! Download (and optional upload) throughput through the proxy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{StrategyError, StrategyOutput};
use crate::config::ThroughputConfig;
use crate::record::ThroughputStats;

/// HTTP client that sends everything through the local SOCKS5 endpoint,
/// resolving names on the proxy side.
pub(crate) fn proxied_client(endpoint: SocketAddr, connect_timeout: Duration) -> Result<Client, StrategyError> {
    let proxy = reqwest::Proxy::all(format!("socks5h://{}", endpoint))
        .map_err(|e| StrategyError::Network(format!("bad proxy endpoint: {}", e)))?;
    Client::builder()
        .no_proxy()
        .proxy(proxy)
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| StrategyError::Network(format!("cannot build HTTP client: {}", e)))
}

struct StreamOutcome {
    status: Option<u16>,
    bytes: u64,
    error: Option<String>,
}

async fn download_stream(
    client: &Client,
    url: &str,
    counter: Arc<AtomicU64>,
    until: Instant,
    request_timeout: Duration,
) -> StreamOutcome {
    let mut outcome = StreamOutcome {
        status: None,
        bytes: 0,
        error: None,
    };

    let mut resp = match tokio::time::timeout(request_timeout, client.get(url).send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            outcome.error = Some(e.to_string());
            return outcome;
        }
        Err(_) => {
            outcome.error = Some(format!("no response within {:?}", request_timeout));
            return outcome;
        }
    };

    outcome.status = Some(resp.status().as_u16());
    if !resp.status().is_success() {
        outcome.error = Some(format!("HTTP {}", resp.status()));
        return outcome;
    }

    loop {
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        // A stalled body ends the stream rather than holding the whole test.
        match tokio::time::timeout(remaining.min(request_timeout), resp.chunk()).await {
            Ok(Ok(Some(chunk))) => {
                outcome.bytes += chunk.len() as u64;
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                if outcome.bytes == 0 {
                    outcome.error = Some(e.to_string());
                }
                break;
            }
            Err(_) => break,
        }
    }
    outcome
}

async fn upload(client: &Client, url: &str, bytes: u64, limit: Duration) -> Result<f64, String> {
    let body = vec![0u8; bytes as usize];
    let start = Instant::now();
    let resp = tokio::time::timeout(limit, client.post(url).body(body).send())
        .await
        .map_err(|_| format!("upload did not finish within {:?}", limit))?
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("HTTP {}", resp.status()));
    }
    let secs = start.elapsed().as_secs_f64();
    if secs <= 0.0 {
        return Err("upload finished instantly".to_string());
    }
    Ok(bytes as f64 / secs)
}

pub async fn run(endpoint: SocketAddr, cfg: &ThroughputConfig) -> Result<StrategyOutput, StrategyError> {
    let request_timeout = Duration::from_millis(cfg.request_timeout_ms);
    let duration = Duration::from_millis(cfg.duration_ms);
    let sample_every = Duration::from_millis(cfg.sample_interval_ms.max(10));
    let connections = cfg.connections.max(1);
    let client = proxied_client(endpoint, request_timeout)?;

    let counter = Arc::new(AtomicU64::new(0));
    let started = Instant::now();
    let until = started + duration;

    let streams = join_all((0..connections).map(|_| {
        download_stream(&client, &cfg.download_url, counter.clone(), until, request_timeout)
    }));
    tokio::pin!(streams);

    let mut ticker = tokio::time::interval_at(started + sample_every, sample_every);
    let mut samples = Vec::new();
    let (mut last_bytes, mut last_at) = (0u64, started);

    let outcomes = loop {
        tokio::select! {
            outcomes = &mut streams => break outcomes,
            at = ticker.tick() => {
                let now_bytes = counter.load(Ordering::Relaxed);
                let secs = (at - last_at).as_secs_f64();
                if secs > 0.0 {
                    samples.push((now_bytes - last_bytes) as f64 / secs);
                }
                last_bytes = now_bytes;
                last_at = at;
            }
        }
    };

    let elapsed = started.elapsed().as_secs_f64();
    let total_bytes = counter.load(Ordering::Relaxed);
    let http_codes: Vec<u16> = outcomes.iter().filter_map(|o| o.status).collect();
    let failed = outcomes.iter().filter(|o| o.bytes == 0).count() as u32;

    if total_bytes == 0 {
        let reason = outcomes
            .iter()
            .find_map(|o| o.error.clone())
            .unwrap_or_else(|| "no data received".to_string());
        return Err(StrategyError::Network(format!("download failed: {}", reason)));
    }

    for o in outcomes.iter().filter(|o| o.error.is_some()) {
        debug!(error = ?o.error, "download stream failed");
    }

    let avg = if elapsed > 0.0 { total_bytes as f64 / elapsed } else { 0.0 };
    let max = samples.iter().copied().fold(avg, f64::max);

    let upload_bps = match cfg.upload_url.as_deref() {
        Some(url) => match upload(&client, url, cfg.upload_bytes, duration + request_timeout).await {
            Ok(bps) => Some(bps),
            Err(e) => {
                warn!(error = %e, "upload phase failed");
                None
            }
        },
        None => None,
    };

    Ok(StrategyOutput {
        throughput: Some(ThroughputStats {
            avg_download_bps: avg,
            max_download_bps: max,
            total_bytes,
            duration_secs: elapsed,
            samples_bps: samples,
            connections,
            failed_connections: failed,
            upload_bps,
        }),
        http_codes,
        ..Default::default()
    })
}

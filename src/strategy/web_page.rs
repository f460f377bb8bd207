//! Simulated page load: an ordered list of resources fetched one by one.

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::Client;
use tokio::time::Instant;
use tracing::debug;

use super::throughput::proxied_client;
use super::{StrategyError, StrategyOutput};
use crate::config::WebPageConfig;
use crate::record::{ResourceTiming, WebPageStats};

async fn fetch(client: &Client, url: &str) -> Result<u16, reqwest::Error> {
    let resp = client.get(url).send().await?;
    let status = resp.status().as_u16();
    resp.bytes().await?;
    Ok(status)
}

pub async fn run(endpoint: SocketAddr, cfg: &WebPageConfig) -> Result<StrategyOutput, StrategyError> {
    if cfg.urls.is_empty() {
        return Err(StrategyError::Network("no page resources configured".to_string()));
    }

    let per_request = Duration::from_millis(cfg.request_timeout_ms);
    let client = proxied_client(endpoint, per_request)?;
    let started = Instant::now();
    let mut resources = Vec::with_capacity(cfg.urls.len());
    let mut http_codes = Vec::new();

    for url in &cfg.urls {
        let t0 = Instant::now();
        let timing = match tokio::time::timeout(per_request, fetch(&client, url)).await {
            Ok(Ok(status)) => {
                http_codes.push(status);
                ResourceTiming {
                    url: url.clone(),
                    latency_ms: Some(t0.elapsed().as_secs_f64() * 1000.0),
                    status_code: Some(status),
                }
            }
            Ok(Err(e)) => {
                debug!(%url, error = %e, "resource failed");
                ResourceTiming {
                    url: url.clone(),
                    latency_ms: None,
                    status_code: e.status().map(|s| s.as_u16()),
                }
            }
            Err(_) => {
                debug!(%url, "resource timed out");
                ResourceTiming {
                    url: url.clone(),
                    latency_ms: None,
                    status_code: None,
                }
            }
        };
        resources.push(timing);
    }

    let stats = WebPageStats {
        total_ms: started.elapsed().as_secs_f64() * 1000.0,
        resources,
    };
    if stats.success_count() == 0 {
        return Err(StrategyError::Network(format!(
            "none of {} page resources loaded",
            stats.resources.len()
        )));
    }

    Ok(StrategyOutput {
        web_page: Some(stats),
        http_codes,
        ..Default::default()
    })
}

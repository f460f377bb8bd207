//! Per-node measurement records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one node test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    ClientStartFailed,
    PortConflict,
    Timeout,
    NetworkError,
    PortsExhausted,
    InternalError,
}

impl RecordStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RecordStatus::Success)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordStatus::Success => "OK",
            RecordStatus::ClientStartFailed => "CLIENT FAIL",
            RecordStatus::PortConflict => "PORT CONFLICT",
            RecordStatus::Timeout => "TIMEOUT",
            RecordStatus::NetworkError => "NET ERROR",
            RecordStatus::PortsExhausted => "NO PORT",
            RecordStatus::InternalError => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// Latency statistics over a series of connection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingStats {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    /// Fraction of failed attempts, 0.0 ..= 1.0.
    pub loss_rate: f64,
    /// One entry per attempt, `None` for a failed attempt.
    pub samples_ms: Vec<Option<f64>>,
}

impl PingStats {
    /// Summarise per-attempt results. `None` when no attempt succeeded.
    pub fn from_samples(samples_ms: Vec<Option<f64>>) -> Option<Self> {
        let ok: Vec<f64> = samples_ms.iter().flatten().copied().collect();
        if ok.is_empty() {
            return None;
        }
        let min_ms = ok.iter().copied().fold(f64::INFINITY, f64::min);
        let max_ms = ok.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg_ms = ok.iter().sum::<f64>() / ok.len() as f64;
        let loss_rate = 1.0 - ok.len() as f64 / samples_ms.len() as f64;
        Some(Self {
            min_ms,
            avg_ms,
            max_ms,
            loss_rate,
            samples_ms,
        })
    }
}

/// Download/upload throughput statistics, in bytes per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputStats {
    pub avg_download_bps: f64,
    pub max_download_bps: f64,
    pub total_bytes: u64,
    pub duration_secs: f64,
    /// Speed sampled at a fixed interval during the download.
    pub samples_bps: Vec<f64>,
    pub connections: u32,
    pub failed_connections: u32,
    #[serde(default)]
    pub upload_bps: Option<f64>,
}

/// Timing of one resource fetched during a page simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTiming {
    pub url: String,
    pub latency_ms: Option<f64>,
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebPageStats {
    pub total_ms: f64,
    pub resources: Vec<ResourceTiming>,
}

impl WebPageStats {
    pub fn success_count(&self) -> usize {
        self.resources.iter().filter(|r| r.latency_ms.is_some()).count()
    }
}

/// Everything measured for one node. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub status: RecordStatus,
    #[serde(default)]
    pub ping: Option<PingStats>,
    #[serde(default)]
    pub throughput: Option<ThroughputStats>,
    #[serde(default)]
    pub web_page: Option<WebPageStats>,
    #[serde(default)]
    pub http_codes: Vec<u16>,
    /// Diagnostic text, passed through verbatim.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub local_port: Option<u16>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl MeasurementRecord {
    /// Successful record with no measurements filled in yet.
    pub fn succeeded(started_at: DateTime<Utc>) -> Self {
        Self {
            status: RecordStatus::Success,
            ping: None,
            throughput: None,
            web_page: None,
            http_codes: Vec::new(),
            message: None,
            local_port: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Record with no measurements, e.g. for a node that never got a client.
    pub fn failed(
        status: RecordStatus,
        message: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            message: Some(message.into()),
            ..Self::succeeded(started_at)
        }
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.ping.as_ref().map(|p| p.avg_ms)
    }

    pub fn download_bps(&self) -> Option<f64> {
        self.throughput.as_ref().map(|t| t.avg_download_bps)
    }
}

/// Human readable byte rate, e.g. `12.34 MB/s`.
pub fn format_speed(bps: f64) -> String {
    if bps >= 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} GB/s", bps / 1024.0 / 1024.0 / 1024.0)
    } else if bps >= 1024.0 * 1024.0 {
        format!("{:.2} MB/s", bps / 1024.0 / 1024.0)
    } else if bps >= 1024.0 {
        format!("{:.2} KB/s", bps / 1024.0)
    } else {
        format!("{:.0} B/s", bps)
    }
}

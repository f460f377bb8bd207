//! Ordering and filtering of the report view. Records are never modified.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::store::ReportEntry;

/// Report ordering. Nodes without the sorted metric always go last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortSpec {
    /// Completion order.
    #[default]
    None,
    /// Download speed, fastest first.
    Speed,
    /// Download speed, slowest first.
    ReverseSpeed,
    /// Latency, lowest first.
    Ping,
    /// Latency, highest first.
    ReversePing,
}

impl FromStr for SortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(SortSpec::None),
            "speed" => Ok(SortSpec::Speed),
            "rspeed" => Ok(SortSpec::ReverseSpeed),
            "ping" => Ok(SortSpec::Ping),
            "rping" => Ok(SortSpec::ReversePing),
            other => Err(format!("unknown sort method '{}' (expected speed, rspeed, ping or rping)", other)),
        }
    }
}

impl fmt::Display for SortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SortSpec::None => "none",
            SortSpec::Speed => "speed",
            SortSpec::ReverseSpeed => "rspeed",
            SortSpec::Ping => "ping",
            SortSpec::ReversePing => "rping",
        };
        f.write_str(s)
    }
}

fn compare_metric(a: Option<f64>, b: Option<f64>, descending: bool) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) if descending => y.total_cmp(&x),
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl SortSpec {
    fn metric(&self, entry: &ReportEntry) -> Option<f64> {
        match self {
            SortSpec::None => None,
            SortSpec::Speed | SortSpec::ReverseSpeed => entry.record.download_bps(),
            SortSpec::Ping | SortSpec::ReversePing => entry.record.latency_ms(),
        }
    }

    /// Stable sort in place; ties keep their current order.
    pub fn sort(&self, entries: &mut [ReportEntry]) {
        if *self == SortSpec::None {
            return;
        }
        let descending = matches!(self, SortSpec::Speed | SortSpec::ReversePing);
        entries.sort_by(|a, b| compare_metric(self.metric(a), self.metric(b), descending));
    }
}

/// Which entries make it into the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub only_success: bool,
    pub max_latency_ms: Option<f64>,
    pub min_download_bps: Option<f64>,
}

impl FilterSpec {
    pub fn keep(&self, entry: &ReportEntry) -> bool {
        let rec = &entry.record;
        if self.only_success && !rec.status.is_success() {
            return false;
        }
        if let Some(max) = self.max_latency_ms {
            if rec.latency_ms().map_or(true, |ms| ms > max) {
                return false;
            }
        }
        if let Some(min) = self.min_download_bps {
            if rec.download_bps().map_or(true, |bps| bps < min) {
                return false;
            }
        }
        true
    }
}

/// Filtered, sorted copy of `entries`.
pub fn report_view(entries: &[ReportEntry], sort: SortSpec, filter: &FilterSpec) -> Vec<ReportEntry> {
    let mut view: Vec<ReportEntry> = entries.iter().filter(|e| filter.keep(e)).cloned().collect();
    sort.sort(&mut view);
    view
}

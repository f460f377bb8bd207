//! Report sinks.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::info;

use super::store::ReportEntry;
use crate::record::format_speed;

/// Receives the ordered report at the end of a run.
pub trait Exporter: Send {
    fn export(&mut self, entries: &[ReportEntry]) -> Result<()>;
}

/// Fans one report out to several exporters, stopping at the first error.
impl Exporter for Vec<Box<dyn Exporter>> {
    fn export(&mut self, entries: &[ReportEntry]) -> Result<()> {
        for exporter in self.iter_mut() {
            exporter.export(entries)?;
        }
        Ok(())
    }
}

/// Pretty JSON list of `{ node, record }` objects.
#[derive(Debug, Clone)]
pub struct JsonExporter {
    path: PathBuf,
}

impl JsonExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/<local timestamp>.json`
    pub fn timestamped(dir: impl AsRef<Path>) -> Self {
        let name = format!("{}.json", Local::now().format("%Y-%m-%d-%H-%M-%S"));
        Self::new(dir.as_ref().join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Exporter for JsonExporter {
    fn export(&mut self, entries: &[ReportEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create results directory {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write results to {}", self.path.display()))?;
        info!(path = %self.path.display(), entries = entries.len(), "results saved");
        Ok(())
    }
}

/// Read a report previously written by [`JsonExporter`].
pub fn load_report(path: impl AsRef<Path>) -> Result<Vec<ReportEntry>> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a result file", path.display()))
}

/// Fixed-width table on a writer, stdout by default.
pub struct ConsoleExporter {
    out: Box<dyn Write + Send>,
}

impl ConsoleExporter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }
}

impl Default for ConsoleExporter {
    fn default() -> Self {
        Self::stdout()
    }
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let cut: String = s.chars().take(width.saturating_sub(1)).collect();
        format!("{}~", cut)
    }
}

impl Exporter for ConsoleExporter {
    fn export(&mut self, entries: &[ReportEntry]) -> Result<()> {
        let out = &mut self.out;
        writeln!(out)?;
        writeln!(
            out,
            "{:<16} | {:<28} | {:<13} | {:>9} | {:>6} | {:>12}",
            "Group", "Remarks", "Status", "Ping", "Loss", "Speed"
        )?;
        writeln!(out, "{:-<16}-|-{:-<28}-|-{:-<13}-|-{:->9}-|-{:->6}-|-{:->12}", "", "", "", "", "", "")?;

        for e in entries {
            let rec = &e.record;
            let ping = rec
                .ping
                .as_ref()
                .map(|p| format!("{:.1}ms", p.avg_ms))
                .unwrap_or_else(|| "-".into());
            let loss = rec
                .ping
                .as_ref()
                .map(|p| format!("{:.0}%", p.loss_rate * 100.0))
                .unwrap_or_else(|| "-".into());
            let speed = rec.download_bps().map(format_speed).unwrap_or_else(|| "-".into());
            writeln!(
                out,
                "{:<16} | {:<28} | {:<13} | {:>9} | {:>6} | {:>12}",
                truncate(&e.node.group, 16),
                truncate(&e.node.label(), 28),
                rec.status.to_string(),
                ping,
                loss,
                speed
            )?;
        }

        let ok = entries.iter().filter(|e| e.record.status.is_success()).count();
        writeln!(out, "\n{} of {} nodes OK", ok, entries.len())?;
        out.flush()?;
        Ok(())
    }
}

/// Keeps the last report in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryExporter {
    pub entries: Vec<ReportEntry>,
    pub calls: usize,
}

impl Exporter for MemoryExporter {
    fn export(&mut self, entries: &[ReportEntry]) -> Result<()> {
        self.entries = entries.to_vec();
        self.calls += 1;
        Ok(())
    }
}

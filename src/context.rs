//! Run-scoped settings shared by the orchestrator and every node runner.

use std::time::Duration;

use serde::Serialize;

use crate::config::BenchConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Platform {
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Other
        }
    }

    /// Suffix appended to client binary names.
    pub fn exe_suffix(&self) -> &'static str {
        match self {
            Platform::Windows => ".exe",
            _ => "",
        }
    }
}

/// Bounded retry: `max_attempts` tries in total with a fixed pause between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub client_start: Duration,
    pub client_stop_grace: Duration,
    pub node_deadline: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            client_start: Duration::from_secs(10),
            client_stop_grace: Duration::from_secs(3),
            node_deadline: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub platform: Platform,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub concurrency: usize,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            platform: Platform::detect(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            concurrency: crate::config::default_concurrency(),
        }
    }
}

impl RunContext {
    pub fn from_config(cfg: &BenchConfig) -> Self {
        let run = &cfg.run;
        Self {
            platform: Platform::detect(),
            timeouts: Timeouts {
                client_start: Duration::from_millis(run.start_timeout_ms),
                client_stop_grace: Duration::from_millis(run.stop_grace_ms),
                node_deadline: Duration::from_millis(run.node_deadline_ms),
            },
            retry: RetryPolicy {
                max_attempts: run.retry_attempts,
                backoff: Duration::from_millis(run.retry_backoff_ms),
            },
            concurrency: run.concurrency,
        }
    }
}

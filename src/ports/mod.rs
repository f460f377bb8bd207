//! Local listening port allocation for proxy clients.
//!
//! Ports are leased from a fixed range. A candidate is handed out only if it
//! is not leased to another client and a bind on `127.0.0.1` succeeds at
//! probe time. The probe listener is dropped straight away, so a foreign
//! process can still grab the port before the client binds it; the client
//! adapter reports that as a port conflict and the runner retries.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("no free local port after {attempts} probe attempts in {start}-{end}")]
    Exhausted { attempts: usize, start: u16, end: u16 },
}

/// Decides whether a candidate port is free right now.
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding the port on the loopback interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindProbe;

impl PortProbe for BindProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}

struct AllocatorState {
    leased: HashSet<u16>,
    cursor: u16,
}

pub struct PortAllocator {
    range: RangeInclusive<u16>,
    max_probe_attempts: usize,
    probe: Box<dyn PortProbe>,
    state: Mutex<AllocatorState>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>, max_probe_attempts: usize) -> Self {
        Self::with_probe(range, max_probe_attempts, Box::new(BindProbe))
    }

    pub fn with_probe(
        range: RangeInclusive<u16>,
        max_probe_attempts: usize,
        probe: Box<dyn PortProbe>,
    ) -> Self {
        // Random starting point so two runs on one host do not walk the
        // range in lockstep.
        let cursor = if range.is_empty() {
            *range.start()
        } else {
            rand::thread_rng().gen_range(range.clone())
        };
        Self {
            range,
            max_probe_attempts: max_probe_attempts.max(1),
            probe,
            state: Mutex::new(AllocatorState {
                leased: HashSet::new(),
                cursor,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        // The state is a plain set; a panic elsewhere cannot leave it torn.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand out a free port and mark it leased.
    pub fn acquire(&self) -> Result<u16, PortError> {
        let (start, end) = (*self.range.start(), *self.range.end());
        let mut state = self.lock();

        if !self.range.is_empty() {
            for _ in 0..self.max_probe_attempts {
                let candidate = state.cursor;
                state.cursor = if candidate >= end { start } else { candidate + 1 };

                if state.leased.contains(&candidate) {
                    continue;
                }
                if self.probe.is_free(candidate) {
                    state.leased.insert(candidate);
                    debug!(port = candidate, leased = state.leased.len(), "port acquired");
                    return Ok(candidate);
                }
                debug!(port = candidate, "port busy, probing next");
            }
        }

        warn!(start, end, attempts = self.max_probe_attempts, "port range exhausted");
        Err(PortError::Exhausted {
            attempts: self.max_probe_attempts,
            start,
            end,
        })
    }

    /// Return a port to the pool. Releasing an unleased port is a no-op.
    pub fn release(&self, port: u16) {
        if self.lock().leased.remove(&port) {
            debug!(port, "port released");
        }
    }

    /// Acquire a port that is released when the lease drops.
    pub fn lease(self: &Arc<Self>) -> Result<PortLease, PortError> {
        let port = self.acquire()?;
        Ok(PortLease {
            allocator: Arc::clone(self),
            port,
        })
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.lock().leased.contains(&port)
    }

    pub fn leased_count(&self) -> usize {
        self.lock().leased.len()
    }
}

/// A leased port, returned to its allocator on drop.
pub struct PortLease {
    allocator: Arc<PortAllocator>,
    port: u16,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease").field("port", &self.port).finish()
    }
}

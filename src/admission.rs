// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Admission building blocks: stream-name sanitization, the serialized
//! startup gate, and the fixed-size worker pool.
//!
//! The gate is a single-permit semaphore held across a new stream's first
//! grab, with a configured minimum spacing between consecutive entries.
//! Without it, a herd of starts would race through codec init and spike
//! file descriptors and memory.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::{GatewayError, Result};

pub const MAX_NAME_LEN: usize = 64;

/// Sanitize a requested stream name: every character outside
/// `[A-Za-z0-9_-]` becomes `_`, the result is capped at 64 chars.
pub fn sanitize_name(raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Err(GatewayError::InvalidStreamName(raw.to_string()));
    }
    let name: String = raw
        .chars()
        .take(MAX_NAME_LEN)
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    Ok(name)
}

/// Relative playlist path published for a sanitized stream name.
pub fn playlist_path(name: &str) -> String {
    format!("/hls/{name}/stream.m3u8")
}

struct GateInner {
    sem: Arc<Semaphore>,
    spacing: Duration,
    last_entry: Mutex<Option<Instant>>,
}

/// Single-permit gate serializing first-grab attempts.
#[derive(Clone)]
pub struct StartupGate {
    inner: Arc<GateInner>,
}

/// Held across the first grab; dropping it releases the gate.
pub struct StartupTicket {
    _permit: OwnedSemaphorePermit,
}

impl StartupGate {
    pub fn new(spacing: Duration) -> Self {
        Self {
            inner: Arc::new(GateInner {
                sem: Arc::new(Semaphore::new(1)),
                spacing,
                last_entry: Mutex::new(None),
            }),
        }
    }

    /// Wait for the permit, then for the configured spacing since the
    /// previous entry. The spacing sleep happens while holding the permit
    /// so queued starts cannot bunch up.
    pub async fn enter(&self) -> StartupTicket {
        let permit = self
            .inner
            .sem
            .clone()
            .acquire_owned()
            .await
            .expect("startup gate semaphore is never closed");

        let wait = {
            let last = self.inner.last_entry.lock();
            last.and_then(|at| self.inner.spacing.checked_sub(at.elapsed()))
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
        *self.inner.last_entry.lock() = Some(Instant::now());

        StartupTicket { _permit: permit }
    }
}

/// Fixed-size pool bounding concurrently running pipeline workers.
#[derive(Clone)]
pub struct WorkerPool {
    sem: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self { sem: Arc::new(Semaphore::new(size)), size }
    }

    /// Wait for a free worker slot. Fairness comes from the semaphore's
    /// FIFO queue; capacity pressure is surfaced earlier, at admission.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.sem
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore is never closed")
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn active(&self) -> usize {
        self.size - self.sem.available_permits()
    }
}

// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-stream supervisor: runs the pipeline inside an auto-reconnect
//! wrapper and drives the lifecycle
//! `QUEUED → STARTING → RUNNING → RECONNECTING → STOPPED`.
//!
//! Reconnects are unbounded here; a camera may come back minutes later.
//! The health scanner owns the budget that eventually declares a stream
//! dead (see `health.rs`).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::gateway::Shared;
use crate::pipeline::{self, PipelineEnd};
use crate::registry::{StreamEntry, StreamState};

/// Linear-capped backoff: `min(base × attempt, cap)`.
pub fn reconnect_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.max(1)).min(cap)
}

/// Worker task body for one stream. Holds a pool slot for its entire
/// lifetime; `serialize_first_grab` is true only for freshly admitted
/// streams (recycles skip the startup gate).
pub(crate) async fn run_worker(
    shared: Arc<Shared>,
    entry: Arc<StreamEntry>,
    serialize_first_grab: bool,
) {
    // Stream stays QUEUED until a pool slot frees up.
    let _slot = shared.pool.acquire().await;

    let mut first_run = serialize_first_grab;
    let mut attempt: u32 = 0;

    loop {
        if entry.stop_requested() || shared.is_shutting_down() {
            break;
        }

        let ticket = if first_run {
            let ticket = shared.gate.enter().await;
            // The gate wait can be long under a start herd; honor a stop
            // that arrived meanwhile.
            if entry.stop_requested() || shared.is_shutting_down() {
                break;
            }
            Some(ticket)
        } else {
            None
        };
        first_run = false;

        entry.set_state(if attempt == 0 { StreamState::Starting } else { StreamState::Reconnecting });

        let outcome = pipeline::run(
            &entry,
            &shared.factory,
            &shared.config,
            shared.shutdown_flag(),
            ticket,
        )
        .await;

        match outcome.end {
            PipelineEnd::Stopped | PipelineEnd::Shutdown => break,
            PipelineEnd::Fault(e) => {
                if entry.stop_requested() || shared.is_shutting_down() {
                    break;
                }
                if outcome.produced_frames {
                    // A productive run resets the backoff ladder.
                    attempt = 0;
                }
                attempt += 1;
                entry.reconnect_attempts.store(attempt, Ordering::Relaxed);
                entry.set_state(StreamState::Reconnecting);

                let delay = reconnect_delay(
                    shared.config.reconnect_base(),
                    shared.config.reconnect_cap(),
                    attempt,
                );
                warn!(
                    stream = entry.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Pipeline faulted, reconnecting"
                );

                // Back off, but wake immediately on stop.
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = entry.stop_notify.notified() => {}
                }
            }
        }
    }

    // Terminal exit: release resources and disk. `finalize` is idempotent
    // with the stop/shutdown paths that may run concurrently.
    shared.finalize(&entry).await;
    info!(stream = entry.name, "Stream worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_and_capped() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(60);
        assert_eq!(reconnect_delay(base, cap, 0), Duration::from_secs(5));
        assert_eq!(reconnect_delay(base, cap, 1), Duration::from_secs(5));
        assert_eq!(reconnect_delay(base, cap, 3), Duration::from_secs(15));
        assert_eq!(reconnect_delay(base, cap, 12), Duration::from_secs(60));
        assert_eq!(reconnect_delay(base, cap, 1000), Duration::from_secs(60));
    }
}

// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Health scanner and memory governor.
//!
//! The scanner watches `last_frame_at` across all registered streams: a
//! stream whose pipeline is up but frameless for the configured timeout
//! gets recycled (worker aborted and resubmitted), and a bounded number
//! of recycles finalizes it as dead. The supervisor's own reconnect loop
//! stays unbounded; only the scanner retires streams.
//!
//! The governor watches process/system memory and, as a last resort,
//! evicts the oldest streams rather than letting the whole process die.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::gateway::Shared;
use crate::registry::StreamState;
use crate::stats::SystemMonitor;

/// Memory watermark above which a warning is emitted.
const MEMORY_WARN_PERCENT: f64 = 85.0;
/// Memory watermark above which the oldest streams are evicted.
const MEMORY_EVICT_PERCENT: f64 = 95.0;
/// How many streams one emergency eviction stops.
const EVICTION_BATCH: usize = 5;

pub(crate) fn spawn_health_scanner(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(
            shared.config.health.check_interval_ms,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick

        // read_frames as of the previous scan, per stream name.
        let mut prior_reads: HashMap<String, u64> = HashMap::new();

        loop {
            ticker.tick().await;
            if shared.is_shutting_down() {
                break;
            }
            scan_once(&shared, &mut prior_reads).await;
        }
    })
}

async fn scan_once(shared: &Arc<Shared>, prior_reads: &mut HashMap<String, u64>) {
    let timeout = shared.config.stream_timeout();
    let max_recycles = shared.config.health.max_recycles;

    let entries = shared.registry.all();
    let mut seen: HashMap<String, u64> = HashMap::with_capacity(entries.len());

    for entry in entries {
        let reads = entry.stats.read_frames.load(Ordering::Relaxed);
        seen.insert(entry.name.clone(), reads);

        match entry.state() {
            // Not yet scheduled, or already going away.
            StreamState::Queued | StreamState::Stopped | StreamState::Failed => continue,
            _ => {}
        }
        if entry.stop_requested() {
            continue;
        }

        // Any frame since the prior scan clears the recycle ledger.
        if prior_reads.get(&entry.name).is_some_and(|prev| reads > *prev) {
            entry.recycles.store(0, Ordering::SeqCst);
        }

        if entry.last_frame_age() <= timeout {
            continue;
        }

        let recycles = entry.recycles.fetch_add(1, Ordering::SeqCst) + 1;
        if recycles >= max_recycles {
            warn!(
                stream = entry.name,
                recycles, "Recycle budget exhausted, finalizing stream as dead"
            );
            shared.dead_streams.fetch_add(1, Ordering::Relaxed);
            shared.stop_stream(&entry).await;
            continue;
        }

        warn!(
            stream = entry.name,
            recycles,
            idle_secs = entry.last_frame_age().as_secs(),
            "No frames within timeout, recycling pipeline"
        );
        entry.abort_worker();
        entry.reset_last_frame();
        entry.set_state(StreamState::Reconnecting);
        shared.spawn_worker(&entry, false);
    }

    *prior_reads = seen;
}

pub(crate) fn spawn_memory_monitor(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = SystemMonitor::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(
            shared.config.health.memory_interval_ms,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if shared.is_shutting_down() {
                break;
            }

            let (memory, _cpu) = monitor.sample();
            if memory.used_percent > MEMORY_EVICT_PERCENT {
                warn!(
                    used_percent = format!("{:.1}", memory.used_percent),
                    "Memory critical, evicting oldest streams"
                );
                shared.evict_oldest(EVICTION_BATCH).await;
            } else if memory.used_percent > MEMORY_WARN_PERCENT {
                warn!(
                    used_percent = format!("{:.1}", memory.used_percent),
                    used_mb = memory.used_mb,
                    max_mb = memory.max_mb,
                    "Memory high"
                );
            } else {
                info!(
                    used_percent = format!("{:.1}", memory.used_percent),
                    "Memory check"
                );
            }
        }
    })
}

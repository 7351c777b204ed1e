// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! The stream gateway: public library surface for the HTTP layer.
//!
//! `start` registers a stream and returns its playlist path synchronously;
//! the playlist URL is observable before the worker has grabbed a single
//! frame. `stop` is idempotent and bounded: cooperative stop, a short
//! wait, then cleanup regardless.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::admission::{playlist_path, sanitize_name, StartupGate, WorkerPool};
use crate::codec::{stream_dir, CodecFactory};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::health;
use crate::registry::{
    InsertError, Registry, StreamEntry, StreamState, StreamStatsSnapshot, StreamStatus,
};
use crate::stats::{self, CsvSnapshot, PoolStats, SystemMonitor, SystemStats};
use crate::supervisor;

/// How long `stop` waits for the worker to exit voluntarily.
const STOP_WAIT: Duration = Duration::from_secs(3);
/// Grace period for draining all workers at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// State shared by the gateway surface, the workers and the monitors.
pub(crate) struct Shared {
    pub config: Config,
    pub factory: Arc<dyn CodecFactory>,
    pub registry: Registry,
    pub gate: StartupGate,
    pub pool: WorkerPool,
    shutting_down: AtomicBool,
    pub dead_streams: AtomicU64,
    queue_counter: AtomicU64,
    monitor: Mutex<SystemMonitor>,
}

impl Shared {
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn shutdown_flag(&self) -> &AtomicBool {
        &self.shutting_down
    }

    /// Spawn (or respawn, for health recycles) the worker task for `entry`.
    pub fn spawn_worker(self: &Arc<Self>, entry: &Arc<StreamEntry>, serialize_first_grab: bool) {
        let shared = self.clone();
        let task_entry = entry.clone();
        let handle = tokio::spawn(async move {
            supervisor::run_worker(shared, task_entry, serialize_first_grab).await;
        });
        entry.attach_worker(handle);
    }

    /// Cooperative stop with a bounded wait, then cleanup regardless.
    pub async fn stop_stream(&self, entry: &Arc<StreamEntry>) {
        entry.request_stop();

        if let Some(mut handle) = entry.take_worker() {
            match tokio::time::timeout(STOP_WAIT, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(stream = entry.name, "Worker did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        self.finalize(entry).await;
    }

    /// Terminal cleanup: mark stopped, unregister, delete the segment
    /// directory. Idempotent; the first caller logs the final stats.
    pub async fn finalize(&self, entry: &Arc<StreamEntry>) {
        entry.set_state(StreamState::Stopped);
        let first = self.registry.remove_entry(entry);

        if let Err(e) = tokio::fs::remove_dir_all(&entry.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(stream = entry.name, error = %e, "Failed to delete segment directory");
            }
        }

        if first {
            let stats = entry.stats_snapshot();
            info!(
                stream = entry.name,
                read = stats.read_frames,
                encoded = stats.encoded_frames,
                skipped = stats.skipped_frames,
                errors = stats.errors,
                "Stream finalized"
            );
        }
    }

    /// Emergency eviction: stop the `count` oldest streams by start time.
    pub async fn evict_oldest(&self, count: usize) {
        let mut entries = self.registry.all();
        entries.sort_by_key(|e| e.started_at);
        for entry in entries.into_iter().take(count) {
            warn!(stream = entry.name, "Evicting stream under memory pressure");
            self.dead_streams.fetch_add(1, Ordering::Relaxed);
            self.stop_stream(&entry).await;
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            active: self.pool.active(),
            total: self.pool.size(),
            queue_size: self.registry.count_in_state(StreamState::Queued),
        }
    }

    pub fn csv_snapshot(&self, monitor: &mut SystemMonitor) -> CsvSnapshot {
        let (memory, cpu) = monitor.sample();
        let pool = self.pool_stats();

        let mut read = 0u64;
        let mut encoded = 0u64;
        let mut errors = 0u64;
        for entry in self.registry.all() {
            read += entry.stats.read_frames.load(Ordering::Relaxed);
            encoded += entry.stats.encoded_frames.load(Ordering::Relaxed);
            errors += entry.stats.errors.load(Ordering::Relaxed);
        }

        CsvSnapshot {
            timestamp: Utc::now(),
            active_streams: self.registry.len(),
            worker_threads: pool.total,
            active_threads: pool.active,
            queue_size: pool.queue_size,
            memory,
            cpu,
            total_read_frames: read,
            total_encoded_frames: encoded,
            total_errors: errors,
            dead_streams: self.dead_streams.load(Ordering::Relaxed),
        }
    }
}

/// The video-ingest gateway. Cheap to clone via its inner `Arc`.
pub struct StreamGateway {
    shared: Arc<Shared>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamGateway {
    /// Build a gateway. Creates the HLS root directory; must be called
    /// inside a tokio runtime (workers are spawned from `start`).
    pub fn new(config: Config, factory: Arc<dyn CodecFactory>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.hls.root)?;

        let gate = StartupGate::new(config.startup_delay());
        let pool = WorkerPool::new(config.limits.worker_threads);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                factory,
                registry: Registry::new(),
                gate,
                pool,
                shutting_down: AtomicBool::new(false),
                dead_streams: AtomicU64::new(0),
                queue_counter: AtomicU64::new(0),
                monitor: Mutex::new(SystemMonitor::new()),
            }),
            monitors: Mutex::new(Vec::new()),
        })
    }

    /// Begin producing a live HLS playlist for `rtsp_url` under
    /// `stream_name`. Registration is synchronous: the returned path is
    /// already published when this returns, even though the worker has
    /// yet to connect. Starting an already-registered name returns the
    /// existing path unchanged.
    pub fn start(&self, rtsp_url: &str, stream_name: &str) -> Result<String> {
        if self.shared.is_shutting_down() {
            return Err(GatewayError::ShuttingDown);
        }
        if rtsp_url.trim().is_empty() {
            return Err(GatewayError::InvalidUrl);
        }
        let name = sanitize_name(stream_name)?;

        let playlist = playlist_path(&name);
        let dir: PathBuf = stream_dir(&self.shared.config.hls.root, &name);
        let entry = StreamEntry::new(
            name.clone(),
            rtsp_url.to_string(),
            playlist.clone(),
            dir,
            self.shared.queue_counter.fetch_add(1, Ordering::Relaxed),
        );

        match self.shared.registry.try_insert(entry.clone(), self.shared.config.limits.max_streams)
        {
            Ok(()) => {}
            Err(InsertError::Exists(existing)) => {
                return Ok(existing.playlist_path.clone());
            }
            Err(InsertError::Full { active, max }) => {
                return Err(GatewayError::CapacityExceeded { active, max });
            }
        }

        if let Err(e) = std::fs::create_dir_all(&entry.dir) {
            self.shared.registry.remove_entry(&entry);
            return Err(e.into());
        }

        self.shared.spawn_worker(&entry, true);
        info!(stream = name, url = rtsp_url, playlist, "Stream admitted");
        Ok(playlist)
    }

    /// Stop a stream. No-ops if the name is unknown or already stopped.
    pub async fn stop(&self, stream_name: &str) {
        let Ok(name) = sanitize_name(stream_name) else {
            return;
        };
        let Some(entry) = self.shared.registry.get(&name) else {
            return;
        };
        info!(stream = name, "Stop requested");
        self.shared.stop_stream(&entry).await;
    }

    pub fn status(&self, stream_name: &str) -> StreamStatus {
        let Ok(name) = sanitize_name(stream_name) else {
            return StreamStatus::NotFound;
        };
        match self.shared.registry.get(&name) {
            Some(entry) => StreamStatus::from(entry.state()),
            None => StreamStatus::NotFound,
        }
    }

    pub fn stats(&self, stream_name: &str) -> Option<StreamStatsSnapshot> {
        let name = sanitize_name(stream_name).ok()?;
        Some(self.shared.registry.get(&name)?.stats_snapshot())
    }

    pub fn system_stats(&self) -> SystemStats {
        let (memory, cpu) = self.shared.monitor.lock().sample();
        let pool = self.shared.pool_stats();
        SystemStats {
            active_streams: self.shared.registry.len(),
            queue_size: pool.queue_size,
            pool,
            memory,
            cpu,
        }
    }

    /// Spawn the health scanner, memory governor and CSV logger.
    pub fn spawn_monitors(&self) {
        let mut monitors = self.monitors.lock();
        monitors.push(health::spawn_health_scanner(self.shared.clone()));
        monitors.push(health::spawn_memory_monitor(self.shared.clone()));
        monitors.push(stats::spawn_csv_logger(self.shared.clone()));
    }

    /// Graceful shutdown: monitors first, then all streams, drained with
    /// a bounded grace period and forced afterwards.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        info!("Gateway shutting down");

        for handle in self.monitors.lock().drain(..) {
            handle.abort();
        }

        let entries = self.shared.registry.all();
        for entry in &entries {
            entry.request_stop();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for entry in entries {
            if let Some(mut handle) = entry.take_worker() {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                    warn!(stream = entry.name, "Forcing worker down at shutdown");
                    handle.abort();
                }
            }
            self.shared.finalize(&entry).await;
        }
        info!("Gateway shutdown complete");
    }

    /// Root directory the HLS playlists and segments are written under.
    pub fn hls_root(&self) -> &std::path::Path {
        &self.shared.config.hls.root
    }

    /// One row per registered stream, for listings.
    pub fn list(&self) -> Vec<StreamSummary> {
        let mut rows: Vec<StreamSummary> = self
            .shared
            .registry
            .all()
            .into_iter()
            .map(|e| StreamSummary {
                name: e.name.clone(),
                state: e.state(),
                playlist: e.playlist_path.clone(),
                url: e.rtsp_url.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    #[doc(hidden)]
    pub fn active_streams(&self) -> usize {
        self.shared.registry.len()
    }
}

/// Listing row returned by [`StreamGateway::list`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamSummary {
    pub name: String,
    pub state: StreamState,
    pub playlist: String,
    pub url: String,
}

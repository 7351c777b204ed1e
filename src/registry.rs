// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Stream registry: the shared map from stream name to its live entry.
//!
//! Each value is owned by exactly one worker task; the supervisor, health
//! scanner and HTTP layer observe it through the map. All counters are
//! plain atomics so readers never contend with the frame loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Internal lifecycle state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    Queued,
    Starting,
    Running,
    Reconnecting,
    Stopped,
    Failed,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamState::Queued => "QUEUED",
            StreamState::Starting => "STARTING",
            StreamState::Running => "RUNNING",
            StreamState::Reconnecting => "RECONNECTING",
            StreamState::Stopped => "STOPPED",
            StreamState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Coarse status reported by the library surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    NotFound,
    Starting,
    Running,
    Stopped,
}

impl From<StreamState> for StreamStatus {
    fn from(state: StreamState) -> Self {
        match state {
            StreamState::Queued | StreamState::Starting | StreamState::Reconnecting => {
                StreamStatus::Starting
            }
            StreamState::Running => StreamStatus::Running,
            StreamState::Stopped | StreamState::Failed => StreamStatus::Stopped,
        }
    }
}

/// Monotonic per-stream counters. Cumulative across reconnects.
#[derive(Default)]
pub struct StreamStats {
    pub read_frames: AtomicU64,
    pub encoded_frames: AtomicU64,
    pub skipped_frames: AtomicU64,
    pub errors: AtomicU64,
    pub ignored_errors: AtomicU64,
    pub start_attempts: AtomicU64,
    /// Frame rates in milli-fps so they fit an atomic.
    source_fps_milli: AtomicU64,
    current_fps_milli: AtomicU64,
    resolution: Mutex<(u32, u32)>,
    source_codec: Mutex<Option<String>>,
}

impl StreamStats {
    pub fn set_source_fps(&self, fps: f64) {
        self.source_fps_milli.store((fps * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn source_fps(&self) -> f64 {
        self.source_fps_milli.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn set_current_fps(&self, fps: f64) {
        self.current_fps_milli.store((fps * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn current_fps(&self) -> f64 {
        self.current_fps_milli.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn set_resolution(&self, width: u32, height: u32) {
        *self.resolution.lock() = (width, height);
    }

    pub fn set_source_codec(&self, codec: Option<String>) {
        *self.source_codec.lock() = codec;
    }
}

/// Serializable snapshot of one stream's stats.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatsSnapshot {
    pub read_frames: u64,
    pub encoded_frames: u64,
    pub skipped_frames: u64,
    pub errors: u64,
    pub ignored_errors: u64,
    pub start_attempts: u64,
    pub source_fps: f64,
    pub current_fps: f64,
    pub resolution: String,
    pub source_codec: Option<String>,
    pub start_time: DateTime<Utc>,
}

/// One registered stream. Created at admission, removed at finalization.
pub struct StreamEntry {
    pub name: String,
    pub rtsp_url: String,
    pub playlist_path: String,
    pub dir: PathBuf,
    pub queue_position: u64,
    pub start_time: DateTime<Utc>,
    pub started_at: Instant,
    pub stats: StreamStats,

    state: Mutex<StreamState>,
    stop_requested: AtomicBool,
    pub stop_notify: Notify,
    last_frame_at: Mutex<Instant>,
    pub reconnect_attempts: AtomicU32,
    pub recycles: AtomicU32,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamEntry {
    pub fn new(
        name: String,
        rtsp_url: String,
        playlist_path: String,
        dir: PathBuf,
        queue_position: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            rtsp_url,
            playlist_path,
            dir,
            queue_position,
            start_time: Utc::now(),
            started_at: Instant::now(),
            stats: StreamStats::default(),
            state: Mutex::new(StreamState::Queued),
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            last_frame_at: Mutex::new(Instant::now()),
            reconnect_attempts: AtomicU32::new(0),
            recycles: AtomicU32::new(0),
            worker: Mutex::new(None),
        })
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: StreamState) {
        *self.state.lock() = state;
    }

    /// Cooperative stop flag; set exactly once, observed at loop heads.
    /// `notify_one` stores a permit, so a backoff sleep that starts after
    /// the stop still wakes immediately.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Advance the liveness timestamp; called only for valid frames.
    pub fn touch_frame(&self) {
        *self.last_frame_at.lock() = Instant::now();
    }

    pub fn last_frame_age(&self) -> Duration {
        self.last_frame_at.lock().elapsed()
    }

    /// Reset liveness after a health recycle so the next scan does not
    /// immediately re-trigger.
    pub fn reset_last_frame(&self) {
        *self.last_frame_at.lock() = Instant::now();
    }

    pub fn attach_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock() = Some(handle);
    }

    pub fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().take()
    }

    pub fn abort_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }

    pub fn stats_snapshot(&self) -> StreamStatsSnapshot {
        let (w, h) = *self.stats.resolution.lock();
        StreamStatsSnapshot {
            read_frames: self.stats.read_frames.load(Ordering::Relaxed),
            encoded_frames: self.stats.encoded_frames.load(Ordering::Relaxed),
            skipped_frames: self.stats.skipped_frames.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            ignored_errors: self.stats.ignored_errors.load(Ordering::Relaxed),
            start_attempts: self.stats.start_attempts.load(Ordering::Relaxed),
            source_fps: self.stats.source_fps(),
            current_fps: self.stats.current_fps(),
            resolution: format!("{w}x{h}"),
            source_codec: self.stats.source_codec.lock().clone(),
            start_time: self.start_time,
        }
    }
}

/// Why an admission-time insert was refused.
pub enum InsertError {
    /// The name is already registered; carries the live entry.
    Exists(Arc<StreamEntry>),
    Full { active: usize, max: usize },
}

/// Name → entry map. Values are per-key owned; the map itself is only
/// locked for insert/remove/lookup.
#[derive(Default)]
pub struct Registry {
    streams: RwLock<HashMap<String, Arc<StreamEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry` unless the name is taken or the capacity limit is
    /// reached. Both checks happen under the same write lock so two
    /// racing admits cannot both squeeze past the limit.
    pub fn try_insert(&self, entry: Arc<StreamEntry>, max: usize) -> Result<(), InsertError> {
        let mut map = self.streams.write();
        if let Some(existing) = map.get(&entry.name) {
            return Err(InsertError::Exists(existing.clone()));
        }
        if map.len() >= max {
            return Err(InsertError::Full { active: map.len(), max });
        }
        map.insert(entry.name.clone(), entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<StreamEntry>> {
        self.streams.read().get(name).cloned()
    }

    /// Remove the entry for `name`, but only if it is still the same
    /// entry (a replacement registered after a stop must survive).
    /// Returns whether this call removed it.
    pub fn remove_entry(&self, entry: &Arc<StreamEntry>) -> bool {
        let mut map = self.streams.write();
        if let Some(current) = map.get(&entry.name) {
            if Arc::ptr_eq(current, entry) {
                map.remove(&entry.name);
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }

    pub fn all(&self) -> Vec<Arc<StreamEntry>> {
        self.streams.read().values().cloned().collect()
    }

    pub fn count_in_state(&self, state: StreamState) -> usize {
        self.streams.read().values().filter(|e| e.state() == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> Arc<StreamEntry> {
        StreamEntry::new(
            name.to_string(),
            format!("rtsp://cam/{name}"),
            format!("/hls/{name}/stream.m3u8"),
            PathBuf::from(format!("/tmp/hls/{name}")),
            0,
        )
    }

    #[tokio::test]
    async fn insert_is_exclusive_per_name() {
        let reg = Registry::new();
        let first = entry("cam_1");
        assert!(reg.try_insert(first.clone(), 10).is_ok());

        let dup = entry("cam_1");
        match reg.try_insert(dup, 10) {
            Err(InsertError::Exists(existing)) => assert!(Arc::ptr_eq(&existing, &first)),
            _ => panic!("expected Exists"),
        }
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn insert_enforces_capacity() {
        let reg = Registry::new();
        assert!(reg.try_insert(entry("cam_1"), 2).is_ok());
        assert!(reg.try_insert(entry("cam_2"), 2).is_ok());
        match reg.try_insert(entry("cam_3"), 2) {
            Err(InsertError::Full { active, max }) => {
                assert_eq!(active, 2);
                assert_eq!(max, 2);
            }
            _ => panic!("expected Full"),
        }
    }

    #[tokio::test]
    async fn remove_only_matches_same_entry() {
        let reg = Registry::new();
        let old = entry("cam_1");
        assert!(reg.try_insert(old.clone(), 10).is_ok());
        reg.remove_entry(&old);
        assert!(reg.is_empty());

        // A stale handle must not remove a replacement registration.
        let replacement = entry("cam_1");
        assert!(reg.try_insert(replacement.clone(), 10).is_ok());
        reg.remove_entry(&old);
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn status_mapping() {
        let e = entry("cam_1");
        assert_eq!(StreamStatus::from(e.state()), StreamStatus::Starting);
        e.set_state(StreamState::Running);
        assert_eq!(StreamStatus::from(e.state()), StreamStatus::Running);
        e.set_state(StreamState::Reconnecting);
        assert_eq!(StreamStatus::from(e.state()), StreamStatus::Starting);
        e.set_state(StreamState::Stopped);
        assert_eq!(StreamStatus::from(e.state()), StreamStatus::Stopped);
    }

    #[tokio::test]
    async fn stats_snapshot_reads_atomics() {
        let e = entry("cam_1");
        e.stats.read_frames.store(250, Ordering::Relaxed);
        e.stats.encoded_frames.store(83, Ordering::Relaxed);
        e.stats.set_source_fps(25.0);
        e.stats.set_resolution(1920, 1080);
        let snap = e.stats_snapshot();
        assert_eq!(snap.read_frames, 250);
        assert_eq!(snap.encoded_frames, 83);
        assert_eq!(snap.source_fps, 25.0);
        assert_eq!(snap.resolution, "1920x1080");
    }
}

// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! System-wide stats: sysinfo sampling, the JSON system snapshot served
//! by the API, and the periodic CSV append. Counters feed reporting only;
//! no control decision reads them.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::gateway::Shared;

/// Frozen CSV header; consumers parse rows positionally.
pub const CSV_HEADER: &str = "Timestamp,ActiveStreams,WorkerThreads,ActiveThreads,QueueSize,\
UsedMemoryMB,MaxMemoryMB,MemoryUsagePercent,\
SystemCPULoad,ProcessCPULoad,TotalReadFrames,TotalEncodedFrames,\
TotalErrors,DeadStreams";

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub total: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryStats {
    pub used_mb: u64,
    pub max_mb: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CpuStats {
    pub system_load: f64,
    pub process_load: f64,
}

/// Snapshot returned by `StreamGateway::system_stats` and the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub active_streams: usize,
    pub queue_size: usize,
    pub pool: PoolStats,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
}

/// One CSV row worth of data.
#[derive(Debug, Clone)]
pub struct CsvSnapshot {
    pub timestamp: DateTime<Utc>,
    pub active_streams: usize,
    pub worker_threads: usize,
    pub active_threads: usize,
    pub queue_size: usize,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    pub total_read_frames: u64,
    pub total_encoded_frames: u64,
    pub total_errors: u64,
    pub dead_streams: u64,
}

impl CsvSnapshot {
    /// Render the row in `CSV_HEADER` order: exactly 14 fields.
    pub fn format_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{:.1},{:.1},{:.1},{},{},{},{}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.active_streams,
            self.worker_threads,
            self.active_threads,
            self.queue_size,
            self.memory.used_mb,
            self.memory.max_mb,
            self.memory.used_percent,
            self.cpu.system_load,
            self.cpu.process_load,
            self.total_read_frames,
            self.total_encoded_frames,
            self.total_errors,
            self.dead_streams,
        )
    }
}

/// Wraps a persistent `sysinfo::System`; CPU load needs successive
/// refreshes on the same instance to produce deltas.
pub struct SystemMonitor {
    sys: System,
    pid: Option<Pid>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self { sys: System::new(), pid: sysinfo::get_current_pid().ok() }
    }

    pub fn sample(&mut self) -> (MemoryStats, CpuStats) {
        self.sys.refresh_memory();
        self.sys.refresh_cpu_usage();
        if let Some(pid) = self.pid {
            self.sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        }

        let total = self.sys.total_memory();
        let used = self.sys.used_memory();
        let process = self.pid.and_then(|pid| self.sys.process(pid));

        let memory = MemoryStats {
            used_mb: process.map(|p| p.memory() / (1024 * 1024)).unwrap_or(0),
            max_mb: total / (1024 * 1024),
            used_percent: if total > 0 { used as f64 * 100.0 / total as f64 } else { 0.0 },
        };
        let cpu = CpuStats {
            system_load: self.sys.global_cpu_usage() as f64,
            process_load: process.map(|p| p.cpu_usage() as f64).unwrap_or(0.0),
        };
        (memory, cpu)
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Append `row` to the CSV at `path`, writing the header first when the
/// file is new or empty.
pub async fn append_csv_row(path: &Path, row: &str) -> std::io::Result<()> {
    let needs_header = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len() == 0,
        Err(_) => true,
    };

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    if needs_header {
        file.write_all(CSV_HEADER.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    file.write_all(row.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

/// Periodic CSV metrics task.
pub(crate) fn spawn_csv_logger(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = SystemMonitor::new();
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(shared.config.metrics.csv_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the first row has a
        // full interval of CPU deltas behind it.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if shared.is_shutting_down() {
                break;
            }

            let snapshot = shared.csv_snapshot(&mut monitor);
            let row = snapshot.format_row();
            let path = shared.config.metrics.csv_path.clone();
            match append_csv_row(&path, &row).await {
                Ok(()) => info!(path = %path.display(), "Metrics row appended"),
                Err(e) => error!(path = %path.display(), error = %e, "CSV append failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> CsvSnapshot {
        CsvSnapshot {
            timestamp: Utc::now(),
            active_streams: 12,
            worker_threads: 64,
            active_threads: 12,
            queue_size: 0,
            memory: MemoryStats { used_mb: 512, max_mb: 16384, used_percent: 42.337 },
            cpu: CpuStats { system_load: 31.25, process_load: 12.5 },
            total_read_frames: 123_456,
            total_encoded_frames: 41_152,
            total_errors: 7,
            dead_streams: 1,
        }
    }

    #[test]
    fn header_has_fourteen_columns() {
        assert_eq!(CSV_HEADER.split(',').count(), 14);
        assert!(CSV_HEADER.starts_with("Timestamp,"));
        assert!(CSV_HEADER.ends_with(",DeadStreams"));
    }

    #[test]
    fn row_matches_header_shape() {
        let row = sample_snapshot().format_row();
        assert_eq!(row.split(',').count(), 14);
        assert!(row.contains("42.3"));
        assert!(row.ends_with(",1"));
    }

    #[tokio::test]
    async fn csv_file_gets_header_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics.csv");

        let row = sample_snapshot().format_row();
        append_csv_row(&path, &row).await.expect("first append");
        append_csv_row(&path, &row).await.expect("second append");

        let content = tokio::fs::read_to_string(&path).await.expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], lines[2]);
    }
}

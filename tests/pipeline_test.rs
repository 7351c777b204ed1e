// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Pipeline-level tests with the mock codec: the frame-skip law, stall
//! detection, encoder failure, fallback candidates and error tolerance.
//!
//! Run with: `cargo test`

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::Instant;

use vidgate::codec::mock::{MockCodecFactory, MockScript};
use vidgate::codec::{CodecError, CodecFactory};
use vidgate::config::Config;
use vidgate::pipeline::{self, PipelineEnd};
use vidgate::registry::{StreamEntry, StreamState};
use vidgate::StreamGateway;

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

fn test_config(root: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.hls.root = root.join("hls");
    cfg.limits.startup_delay_ms = 10;
    cfg.metrics.csv_path = root.join("metrics.csv");
    cfg.health.check_interval_ms = 3_600_000;
    cfg.health.memory_interval_ms = 3_600_000;
    cfg.metrics.csv_interval_ms = 3_600_000;
    cfg
}

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

async fn wait_for_state(gw: &StreamGateway, name: &str, state: StreamState, max_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(max_ms);
    while Instant::now() < deadline {
        if gw.list().iter().any(|s| s.name == name && s.state == state) {
            return true;
        }
        settle(100).await;
    }
    false
}

/// Bare entry + output dir for driving `pipeline::run` directly.
fn make_entry(root: &Path, name: &str, url: &str) -> Arc<StreamEntry> {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).expect("create stream dir");
    StreamEntry::new(
        name.to_string(),
        url.to_string(),
        format!("/hls/{name}/stream.m3u8"),
        dir,
        0,
    )
}

#[tokio::test(start_paused = true)]
async fn frame_skip_law_holds() {
    let dir = tmp_dir();
    let factory = MockCodecFactory::new();
    factory.script("mock/cam25", MockScript::default().fps(25.0));
    let gw = StreamGateway::new(test_config(dir.path()), factory).expect("gateway");

    gw.start("rtsp://mock/cam25", "cam_25").expect("start");
    assert!(wait_for_state(&gw, "cam_25", StreamState::Running, 10_000).await);

    // Warm-up, then observe a ~12 s window.
    settle(2_000).await;
    settle(12_000).await;

    let stats = gw.stats("cam_25").expect("stats");
    assert!(stats.read_frames > 200, "paced reads at ~25 fps: {}", stats.read_frames);
    // skip = round(25/10) = 3, so encoded ≈ read / 3.
    let expected = stats.read_frames as f64 / 3.0;
    let diff = (stats.encoded_frames as f64 - expected).abs();
    assert!(
        diff <= 2.0,
        "skip law violated: read={} encoded={} expected≈{expected:.1}",
        stats.read_frames,
        stats.encoded_frames
    );
    assert_eq!(
        stats.read_frames,
        stats.encoded_frames + stats.skipped_frames,
        "every read frame is either encoded or skipped"
    );

    gw.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn five_hundred_nulls_stall_the_run() {
    let dir = tmp_dir();
    let factory = MockCodecFactory::new();
    // One connect-proof frame, then nulls forever.
    factory.script("mock/stall", MockScript::default().frames(1));

    let entry = make_entry(dir.path(), "cam_stall", "rtsp://mock/stall");
    let cfg = test_config(dir.path());
    let shutdown = AtomicBool::new(false);
    let factory_dyn: Arc<dyn CodecFactory> = factory;

    let outcome = pipeline::run(&entry, &factory_dyn, &cfg, &shutdown, None).await;

    assert!(
        matches!(outcome.end, PipelineEnd::Fault(CodecError::Stalled(n)) if n == 500),
        "expected stall fault, got {:?}",
        outcome.end
    );
    assert!(!outcome.produced_frames, "loop never saw a usable frame");
    assert_eq!(entry.stats_snapshot().read_frames, 0);
}

#[tokio::test(start_paused = true)]
async fn continuous_decoder_noise_times_out() {
    let dir = tmp_dir();
    let factory = MockCodecFactory::new();
    // One connect-proof frame, then every grab is swallowed decoder
    // noise; with no successful encode the run must fault on the
    // silence limit rather than spin forever.
    factory.script("mock/noise_storm", MockScript::default().transient_after(1));

    let entry = make_entry(dir.path(), "cam_storm", "rtsp://mock/noise_storm");
    let cfg = test_config(dir.path());
    let shutdown = AtomicBool::new(false);
    let factory_dyn: Arc<dyn CodecFactory> = factory;

    let outcome = pipeline::run(&entry, &factory_dyn, &cfg, &shutdown, None).await;

    assert!(
        matches!(outcome.end, PipelineEnd::Fault(CodecError::EncodeTimeout(_))),
        "expected encode-silence fault, got {:?}",
        outcome.end
    );
    assert!(!outcome.produced_frames, "no usable frame ever reached the loop");

    let stats = entry.stats_snapshot();
    assert_eq!(stats.read_frames, 0);
    assert!(stats.ignored_errors > 100, "noise tallied throughout: {}", stats.ignored_errors);
    assert_eq!(stats.encoded_frames, 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_stream_enters_reconnecting() {
    let dir = tmp_dir();
    let factory = MockCodecFactory::new();
    factory.script("mock/flaky", MockScript::default().frames(1));
    let gw = StreamGateway::new(test_config(dir.path()), factory).expect("gateway");

    gw.start("rtsp://mock/flaky", "cam_flaky").expect("start");

    // The run exits after the null-frame budget and the supervisor backs
    // off in RECONNECTING before its next attempt.
    assert!(
        wait_for_state(&gw, "cam_flaky", StreamState::Reconnecting, 120_000).await,
        "stream never entered RECONNECTING"
    );

    gw.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn encoder_failure_faults_the_run() {
    let dir = tmp_dir();
    let factory = MockCodecFactory::new();
    // Matches the recorder via the output directory path.
    factory.script("cam_enc", MockScript::default().encode_fail_after(3));
    let gw = StreamGateway::new(test_config(dir.path()), factory).expect("gateway");

    gw.start("rtsp://mock/ok", "cam_enc").expect("start");
    assert!(wait_for_state(&gw, "cam_enc", StreamState::Running, 10_000).await);
    assert!(
        wait_for_state(&gw, "cam_enc", StreamState::Reconnecting, 120_000).await,
        "encoder failure did not fault the run"
    );

    let stats = gw.stats("cam_enc").expect("stats");
    assert!(stats.errors >= 20, "consecutive encode errors counted: {}", stats.errors);
    assert_eq!(stats.encoded_frames, 3);

    gw.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn fallback_candidates_are_tried() {
    let dir = tmp_dir();
    let factory = MockCodecFactory::new();
    let counters = factory.counters();
    // The URL as given always refuses; the vendor-path candidates use the
    // default script and connect.
    factory.script("mock/primary", MockScript::default().connect_failures(u32::MAX));
    let gw = StreamGateway::new(test_config(dir.path()), factory).expect("gateway");

    gw.start("rtsp://mock/primary", "cam_fb").expect("start");
    assert!(
        wait_for_state(&gw, "cam_fb", StreamState::Running, 30_000).await,
        "fallback candidate never connected"
    );

    let stats = gw.stats("cam_fb").expect("stats");
    assert!(stats.start_attempts >= 2, "multiple candidates tried");
    let events = counters.events();
    assert!(
        events.iter().any(|e| e.kind == "grabber_ready" && e.url != "rtsp://mock/primary"),
        "connected via a fallback URL"
    );

    gw.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_codec_noise_is_swallowed() {
    let dir = tmp_dir();
    let factory = MockCodecFactory::new();
    let counters = factory.counters();
    // Every 40th grab raises "no frame!"; the stream must keep running.
    factory.script("mock/noisy", MockScript::default().fps(30.0).transient_every(40));
    let gw = StreamGateway::new(test_config(dir.path()), factory).expect("gateway");

    gw.start("rtsp://mock/noisy", "cam_noisy").expect("start");
    assert!(wait_for_state(&gw, "cam_noisy", StreamState::Running, 10_000).await);

    settle(25_000).await;

    let stats = gw.stats("cam_noisy").expect("stats");
    assert!(stats.ignored_errors > 0, "transient errors tallied");
    assert!(stats.errors > 0);
    assert!(
        gw.list().iter().any(|s| s.name == "cam_noisy" && s.state == StreamState::Running),
        "stream still RUNNING despite noise"
    );
    let target = 10.0;
    let deviation = (stats.current_fps - target).abs() / target;
    assert!(
        deviation <= 0.2,
        "output fps {:.2} deviates more than 20% from target",
        stats.current_fps
    );
    assert!(counters.frames_alive() <= 1, "at most the in-flight frame is held");

    gw.stop("cam_noisy").await;
    assert_eq!(counters.frames_alive(), 0, "no leaked frames after stop");

    gw.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stats_stay_cumulative_across_reconnects() {
    let dir = tmp_dir();
    let factory = MockCodecFactory::new();
    // Connection drops after every 100 grabs; supervisor reconnects.
    factory.script("mock/dropper", MockScript::default().fps(25.0).fatal_after(100));
    let mut cfg = test_config(dir.path());
    cfg.reconnect.base_delay_ms = 200;
    let gw = StreamGateway::new(cfg, factory).expect("gateway");

    gw.start("rtsp://mock/dropper", "cam_drop").expect("start");
    assert!(wait_for_state(&gw, "cam_drop", StreamState::Running, 10_000).await);

    settle(30_000).await;

    let stats = gw.stats("cam_drop").expect("stats");
    assert!(
        stats.read_frames > 150,
        "counters survived reconnects: read={}",
        stats.read_frames
    );
    assert!(stats.errors >= 1, "each drop recorded as an error");
    assert!(stats.start_attempts >= 2, "reconnect re-opened the source");

    gw.shutdown().await;
}

// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-stream pipeline: moves decoded frames from the camera to disk as a
//! sliding-window HLS playlist at the target output rate.
//!
//! One run of [`run`] owns exactly one grabber/recorder pair. Reads are
//! paced to the source cadence, output frames are skip-selected to the
//! target fps, and every grabbed frame is released before the next read
//! on every control path. The loop never reconnects itself; it reports an
//! exit reason and the supervisor decides what happens next.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::admission::StartupTicket;
use crate::codec::{candidate_urls, CodecError, CodecFactory, Grabber, GrabberOptions, Recorder, RecorderOptions};
use crate::config::Config;
use crate::registry::{StreamEntry, StreamState};

/// Null frames tolerated before the run is declared stalled.
const NULL_FRAME_LIMIT: u32 = 500;
/// Consecutive encode errors before the encoder is declared dead.
const MAX_CONSECUTIVE_ENCODE_ERRORS: u32 = 20;
/// A run with no successful encode for this long is faulted.
const ENCODE_SILENCE_LIMIT: Duration = Duration::from_secs(180);
/// Candidate-list connect cycles before giving up on this run.
const CONNECT_CYCLES: u32 = 3;
/// Null frames tolerated while waiting for the connect-proof frame.
const FIRST_FRAME_ATTEMPTS: u32 = 25;
/// Cadence of the per-stream fps/stats log line.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);
/// Pause after a swallowed transient decode error.
const TRANSIENT_ERROR_PAUSE: Duration = Duration::from_millis(10);

/// Why a pipeline run ended.
#[derive(Debug)]
pub enum PipelineEnd {
    /// `stop_requested` was observed; terminal.
    Stopped,
    /// Service shutdown; terminal.
    Shutdown,
    /// Connect, stall or encode fault; the supervisor may reconnect.
    Fault(CodecError),
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub end: PipelineEnd,
    /// Whether this run delivered at least one valid frame. Resets the
    /// supervisor's backoff.
    pub produced_frames: bool,
}

/// Source rate clamped to a sane band; 25 fps when the camera does not
/// advertise one.
pub fn effective_source_fps(advertised: Option<f64>) -> f64 {
    advertised.filter(|f| f.is_finite() && *f > 0.0).unwrap_or(25.0).clamp(1.0, 60.0)
}

/// Every `skip_ratio`-th read frame is encoded.
pub fn skip_ratio(source_fps: f64, target_fps: u32) -> u64 {
    ((source_fps / target_fps.max(1) as f64).round() as u64).max(1)
}

/// Adaptive pause after a null frame: starts at 5 ms, grows with the
/// stretch, capped at 50 ms.
fn null_frame_pause(null_count: u32) -> Duration {
    Duration::from_millis((5 + null_count as u64 / 10).min(50))
}

/// One full pipeline run: connect (serialized through the startup ticket,
/// if any), open the recorder, pump frames, then release everything.
pub async fn run(
    entry: &Arc<StreamEntry>,
    factory: &Arc<dyn CodecFactory>,
    cfg: &Config,
    shutting_down: &AtomicBool,
    ticket: Option<StartupTicket>,
) -> PipelineOutcome {
    let grabber_opts = GrabberOptions::default();

    let mut grabber = match connect(entry, factory, &grabber_opts).await {
        Ok(g) => g,
        Err(e) => {
            drop(ticket);
            entry.stats.errors.fetch_add(1, Ordering::Relaxed);
            return PipelineOutcome { end: PipelineEnd::Fault(e), produced_frames: false };
        }
    };
    // First grab is done; let the next queued stream through the gate.
    drop(ticket);

    let (width, height) = (grabber.width(), grabber.height());
    let source_fps = effective_source_fps(grabber.source_fps());
    entry.stats.set_source_fps(source_fps);
    entry.stats.set_resolution(width, height);
    entry.stats.set_source_codec(grabber.codec_name());

    let recorder_opts = RecorderOptions::new(
        cfg.hls.target_fps,
        cfg.hls.segment_seconds,
        cfg.hls.playlist_window,
    );
    let mut recorder = match factory.create_hls(&entry.dir, width, height, &recorder_opts).await {
        Ok(r) => r,
        Err(e) => {
            grabber.close().await;
            entry.stats.errors.fetch_add(1, Ordering::Relaxed);
            return PipelineOutcome { end: PipelineEnd::Fault(e), produced_frames: false };
        }
    };

    // The connect-proof frame has been grabbed and released; the stream
    // is live from the caller's point of view.
    entry.set_state(StreamState::Running);
    info!(
        stream = entry.name,
        width,
        height,
        source_fps,
        target_fps = cfg.hls.target_fps,
        skip = skip_ratio(source_fps, cfg.hls.target_fps),
        "Pipeline connected"
    );

    let (end, produced_frames) = frame_loop(
        entry,
        grabber.as_mut(),
        recorder.as_mut(),
        source_fps,
        cfg.hls.target_fps,
        shutting_down,
    )
    .await;

    // Teardown order is fixed: recorder first so the playlist flushes,
    // then the grabber.
    recorder.close().await;
    grabber.close().await;

    debug!(stream = entry.name, end = ?end, "Pipeline run finished");
    PipelineOutcome { end, produced_frames }
}

/// Try the candidate URLs in up to `CONNECT_CYCLES` rounds with linear
/// backoff between rounds. A grabber counts as connected only after it
/// produced one non-empty frame, which is released immediately.
async fn connect(
    entry: &Arc<StreamEntry>,
    factory: &Arc<dyn CodecFactory>,
    opts: &GrabberOptions,
) -> Result<Box<dyn Grabber>, CodecError> {
    let candidates = candidate_urls(&entry.rtsp_url);
    let mut last_error = CodecError::Connect("no candidates".into());

    for cycle in 1..=CONNECT_CYCLES {
        for url in &candidates {
            if entry.stop_requested() {
                return Err(CodecError::Connect("stop requested during connect".into()));
            }
            entry.stats.start_attempts.fetch_add(1, Ordering::Relaxed);

            let mut grabber = match factory.open_rtsp(url, opts).await {
                Ok(g) => g,
                Err(e) => {
                    debug!(stream = entry.name, url, error = %e, "Candidate open failed");
                    last_error = e;
                    continue;
                }
            };

            if await_first_frame(grabber.as_mut()).await {
                if url != &entry.rtsp_url {
                    info!(stream = entry.name, url, "Connected via fallback candidate");
                }
                return Ok(grabber);
            }

            warn!(stream = entry.name, url, "No usable first frame, trying next candidate");
            grabber.close().await;
            last_error = CodecError::Connect(format!("no first frame from {url}"));
        }
        // Linear backoff between candidate cycles.
        sleep(Duration::from_secs(cycle as u64)).await;
    }

    Err(last_error)
}

/// Wait for the connect-proof frame and release it on the spot.
async fn await_first_frame(grabber: &mut dyn Grabber) -> bool {
    for _ in 0..FIRST_FRAME_ATTEMPTS {
        match grabber.grab().await {
            Ok(Some(frame)) => {
                let valid = frame.is_valid();
                drop(frame);
                if valid {
                    return true;
                }
            }
            Ok(None) => {}
            Err(e) if e.is_transient() => {}
            Err(_) => return false,
        }
    }
    false
}

async fn frame_loop(
    entry: &Arc<StreamEntry>,
    grabber: &mut dyn Grabber,
    recorder: &mut dyn Recorder,
    source_fps: f64,
    target_fps: u32,
    shutting_down: &AtomicBool,
) -> (PipelineEnd, bool) {
    let read_interval = Duration::from_secs_f64(1.0 / source_fps);
    let skip = skip_ratio(source_fps, target_fps);

    let mut frame_counter: u64 = 0;
    let mut null_frames: u32 = 0;
    let mut consecutive_encode_errors: u32 = 0;
    let mut last_read: Option<Instant> = None;
    let mut last_encode_ok = Instant::now();
    let mut window_start = Instant::now();
    let mut window_encoded: u64 = 0;
    let mut produced = false;

    loop {
        if entry.stop_requested() {
            return (PipelineEnd::Stopped, produced);
        }
        if shutting_down.load(Ordering::SeqCst) {
            return (PipelineEnd::Shutdown, produced);
        }

        // Checked at the loop head so null-frame and transient-error
        // stretches cannot dodge it.
        if last_encode_ok.elapsed() >= ENCODE_SILENCE_LIMIT {
            entry.stats.errors.fetch_add(1, Ordering::Relaxed);
            return (
                PipelineEnd::Fault(CodecError::EncodeTimeout(ENCODE_SILENCE_LIMIT)),
                produced,
            );
        }

        if window_start.elapsed() >= STATS_LOG_INTERVAL {
            let fps = window_encoded as f64 / window_start.elapsed().as_secs_f64();
            entry.stats.set_current_fps(fps);
            info!(
                stream = entry.name,
                current_fps = format!("{fps:.1}"),
                read = entry.stats.read_frames.load(Ordering::Relaxed),
                encoded = entry.stats.encoded_frames.load(Ordering::Relaxed),
                skipped = entry.stats.skipped_frames.load(Ordering::Relaxed),
                ignored_errors = entry.stats.ignored_errors.load(Ordering::Relaxed),
                "Stream stats"
            );
            window_start = Instant::now();
            window_encoded = 0;
        }

        // Pace reads to the source cadence so the reader does not gallop
        // ahead when the network momentarily buffers.
        if let Some(prev) = last_read {
            if let Some(remaining) = read_interval.checked_sub(prev.elapsed()) {
                sleep(remaining).await;
            }
        }
        last_read = Some(Instant::now());

        match grabber.grab().await {
            Ok(Some(frame)) => {
                null_frames = 0;
                // Local slot is emptied on release so no path can touch
                // the frame twice.
                let mut slot = Some(frame);

                if !slot.as_ref().is_some_and(|f| f.is_valid()) {
                    drop(slot.take());
                    continue;
                }

                entry.touch_frame();
                entry.stats.read_frames.fetch_add(1, Ordering::Relaxed);
                frame_counter += 1;
                produced = true;

                if frame_counter % skip == 0 {
                    let frame = slot.as_ref().expect("frame present until released");
                    match recorder.record(frame).await {
                        Ok(()) => {
                            entry.stats.encoded_frames.fetch_add(1, Ordering::Relaxed);
                            consecutive_encode_errors = 0;
                            last_encode_ok = Instant::now();
                            window_encoded += 1;
                        }
                        Err(e) => {
                            entry.stats.errors.fetch_add(1, Ordering::Relaxed);
                            consecutive_encode_errors += 1;
                            warn!(
                                stream = entry.name,
                                consecutive = consecutive_encode_errors,
                                error = %e,
                                "Encode failed"
                            );
                            if consecutive_encode_errors >= MAX_CONSECUTIVE_ENCODE_ERRORS {
                                drop(slot.take());
                                return (
                                    PipelineEnd::Fault(CodecError::EncoderFailed(
                                        consecutive_encode_errors,
                                    )),
                                    produced,
                                );
                            }
                        }
                    }
                } else {
                    entry.stats.skipped_frames.fetch_add(1, Ordering::Relaxed);
                }

                drop(slot.take());
            }
            Ok(None) => {
                null_frames += 1;
                if null_frames >= NULL_FRAME_LIMIT {
                    entry.stats.errors.fetch_add(1, Ordering::Relaxed);
                    return (PipelineEnd::Fault(CodecError::Stalled(null_frames)), produced);
                }
                sleep(null_frame_pause(null_frames)).await;
                continue;
            }
            Err(e) if e.is_transient() => {
                // Decoder noise on a lossy link; count it and move on.
                entry.stats.errors.fetch_add(1, Ordering::Relaxed);
                entry.stats.ignored_errors.fetch_add(1, Ordering::Relaxed);
                sleep(TRANSIENT_ERROR_PAUSE).await;
                continue;
            }
            Err(e) => {
                entry.stats.errors.fetch_add(1, Ordering::Relaxed);
                return (PipelineEnd::Fault(e), produced);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_fps_clamped_and_defaulted() {
        assert_eq!(effective_source_fps(None), 25.0);
        assert_eq!(effective_source_fps(Some(0.0)), 25.0);
        assert_eq!(effective_source_fps(Some(f64::NAN)), 25.0);
        assert_eq!(effective_source_fps(Some(90.0)), 60.0);
        assert_eq!(effective_source_fps(Some(0.5)), 1.0);
        assert_eq!(effective_source_fps(Some(25.0)), 25.0);
    }

    #[test]
    fn skip_ratio_rounds_half_away_from_zero() {
        assert_eq!(skip_ratio(25.0, 10), 3); // 2.5 rounds up
        assert_eq!(skip_ratio(25.0, 8), 3);
        assert_eq!(skip_ratio(30.0, 10), 3);
        assert_eq!(skip_ratio(10.0, 10), 1);
        assert_eq!(skip_ratio(8.0, 10), 1); // never below 1
        assert_eq!(skip_ratio(60.0, 10), 6);
    }

    #[test]
    fn null_pause_grows_and_caps() {
        assert_eq!(null_frame_pause(1), Duration::from_millis(5));
        assert_eq!(null_frame_pause(100), Duration::from_millis(15));
        assert_eq!(null_frame_pause(450), Duration::from_millis(50));
        assert_eq!(null_frame_pause(499), Duration::from_millis(50));
    }
}

// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Scriptable mock codec factory.
//!
//! Used by the integration suites (and handy for local runs without
//! cameras): per-URL scripts control connect failures, frame supply,
//! null-frame stretches and injected codec errors, while shared counters
//! track every allocated frame, grabber and recorder so tests can assert
//! that nothing leaks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{CodecError, CodecFactory, Frame, Grabber, GrabberOptions, Recorder, RecorderOptions};

static PIXELS: &[u8] = &[0u8; 64];

/// Timeline event recorded by the mock, for ordering assertions.
#[derive(Debug, Clone)]
pub struct MockEvent {
    pub kind: &'static str,
    pub url: String,
    pub at: Instant,
}

/// Shared allocation counters across all mock grabbers/recorders.
#[derive(Default)]
pub struct MockCounters {
    frames_created: AtomicU64,
    frames_alive: AtomicI64,
    grabbers_open: AtomicI64,
    recorders_open: AtomicI64,
    frames_recorded: AtomicU64,
    events: Mutex<Vec<MockEvent>>,
}

impl MockCounters {
    pub fn frames_created(&self) -> u64 {
        self.frames_created.load(Ordering::SeqCst)
    }

    /// Frames allocated but not yet released.
    pub fn frames_alive(&self) -> i64 {
        self.frames_alive.load(Ordering::SeqCst)
    }

    pub fn grabbers_open(&self) -> i64 {
        self.grabbers_open.load(Ordering::SeqCst)
    }

    pub fn recorders_open(&self) -> i64 {
        self.recorders_open.load(Ordering::SeqCst)
    }

    pub fn frames_recorded(&self) -> u64 {
        self.frames_recorded.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.events.lock().clone()
    }

    fn push_event(&self, kind: &'static str, url: &str) {
        self.events.lock().push(MockEvent { kind, url: url.to_string(), at: Instant::now() });
    }
}

/// Behavior of one mocked RTSP source.
#[derive(Clone)]
pub struct MockScript {
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
    pub codec: &'static str,
    /// Frames delivered before the grabber returns nulls forever.
    /// `None` = endless supply.
    pub frames_before_null: Option<u64>,
    /// Virtual time each grab takes (source cadence).
    pub grab_delay: Duration,
    /// `open_rtsp` fails this many times before succeeding.
    pub connect_failures: u32,
    /// Every Nth grab yields a transient decode error ("no frame!").
    pub transient_every: Option<u64>,
    /// Every grab after this many calls yields a transient decode error.
    pub transient_after_grabs: Option<u64>,
    /// Grabs fail fatally (connection lost) after this many calls.
    pub fatal_after_grabs: Option<u64>,
    /// Recorder fails every record call after this many successes.
    pub encode_fail_after: Option<u64>,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: Some(25.0),
            codec: "h264",
            frames_before_null: None,
            grab_delay: Duration::from_millis(5),
            connect_failures: 0,
            transient_every: None,
            transient_after_grabs: None,
            fatal_after_grabs: None,
            encode_fail_after: None,
        }
    }
}

impl MockScript {
    pub fn frames(mut self, n: u64) -> Self {
        self.frames_before_null = Some(n);
        self
    }

    pub fn fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    pub fn no_fps(mut self) -> Self {
        self.fps = None;
        self
    }

    pub fn dims(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn grab_delay(mut self, d: Duration) -> Self {
        self.grab_delay = d;
        self
    }

    pub fn connect_failures(mut self, n: u32) -> Self {
        self.connect_failures = n;
        self
    }

    pub fn transient_every(mut self, n: u64) -> Self {
        self.transient_every = Some(n);
        self
    }

    pub fn transient_after(mut self, n: u64) -> Self {
        self.transient_after_grabs = Some(n);
        self
    }

    pub fn fatal_after(mut self, n: u64) -> Self {
        self.fatal_after_grabs = Some(n);
        self
    }

    pub fn encode_fail_after(mut self, n: u64) -> Self {
        self.encode_fail_after = Some(n);
        self
    }
}

pub struct MockCodecFactory {
    counters: Arc<MockCounters>,
    scripts: Mutex<Vec<(String, MockScript)>>,
    connect_attempts: Mutex<HashMap<String, u32>>,
}

impl MockCodecFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: Arc::new(MockCounters::default()),
            scripts: Mutex::new(Vec::new()),
            connect_attempts: Mutex::new(HashMap::new()),
        })
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        self.counters.clone()
    }

    /// Register a script for URLs containing `url_part`. First match wins;
    /// unmatched URLs get `MockScript::default()`.
    pub fn script(&self, url_part: &str, script: MockScript) {
        self.scripts.lock().push((url_part.to_string(), script));
    }

    fn script_for(&self, url: &str) -> MockScript {
        self.scripts
            .lock()
            .iter()
            .find(|(part, _)| url.contains(part.as_str()))
            .map(|(_, s)| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CodecFactory for MockCodecFactory {
    async fn open_rtsp(
        &self,
        url: &str,
        _opts: &GrabberOptions,
    ) -> Result<Box<dyn Grabber>, CodecError> {
        self.counters.push_event("grabber_open", url);
        let script = self.script_for(url);

        let attempt = {
            let mut attempts = self.connect_attempts.lock();
            let counter = attempts.entry(url.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        if attempt <= script.connect_failures {
            return Err(CodecError::Connect(format!("mock refused ({url}, attempt {attempt})")));
        }

        self.counters.grabbers_open.fetch_add(1, Ordering::SeqCst);
        self.counters.push_event("grabber_ready", url);
        Ok(Box::new(MockGrabber {
            url: url.to_string(),
            script,
            counters: self.counters.clone(),
            grabs: 0,
            delivered: 0,
            closed: false,
        }))
    }

    async fn create_hls(
        &self,
        dir: &Path,
        _width: u32,
        _height: u32,
        _opts: &RecorderOptions,
    ) -> Result<Box<dyn Recorder>, CodecError> {
        // Simulate the muxer's on-disk footprint so stop-side cleanup has
        // something real to delete.
        std::fs::write(dir.join("stream.m3u8"), "#EXTM3U\n")
            .map_err(|e| CodecError::Encode(format!("mock playlist: {e}")))?;

        self.counters.recorders_open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockRecorder {
            script: self.script_for(&dir.display().to_string()),
            counters: self.counters.clone(),
            recorded: 0,
            closed: false,
        }))
    }
}

pub struct MockGrabber {
    url: String,
    script: MockScript,
    counters: Arc<MockCounters>,
    grabs: u64,
    delivered: u64,
    closed: bool,
}

#[async_trait]
impl Grabber for MockGrabber {
    async fn grab(&mut self) -> Result<Option<Frame>, CodecError> {
        tokio::time::sleep(self.script.grab_delay).await;
        self.grabs += 1;

        if let Some(limit) = self.script.fatal_after_grabs {
            if self.grabs > limit {
                return Err(CodecError::ConnectionLost("mock connection lost".into()));
            }
        }
        if let Some(every) = self.script.transient_every {
            if every > 0 && self.grabs % every == 0 {
                return Err(CodecError::Decode("no frame!".into()));
            }
        }
        if let Some(limit) = self.script.transient_after_grabs {
            if self.grabs > limit {
                return Err(CodecError::Decode("no frame!".into()));
            }
        }
        if let Some(limit) = self.script.frames_before_null {
            if self.delivered >= limit {
                return Ok(None);
            }
        }

        self.delivered += 1;
        if self.delivered == 1 {
            self.counters.push_event("first_frame", &self.url);
        }
        self.counters.frames_created.fetch_add(1, Ordering::SeqCst);
        self.counters.frames_alive.fetch_add(1, Ordering::SeqCst);
        let alive = self.counters.clone();
        Ok(Some(Frame::with_release(
            Bytes::from_static(PIXELS),
            self.script.width,
            self.script.height,
            move || {
                alive.frames_alive.fetch_sub(1, Ordering::SeqCst);
            },
        )))
    }

    fn source_fps(&self) -> Option<f64> {
        self.script.fps
    }

    fn width(&self) -> u32 {
        self.script.width
    }

    fn height(&self) -> u32 {
        self.script.height
    }

    fn codec_name(&self) -> Option<String> {
        Some(self.script.codec.to_string())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.grabbers_open.fetch_sub(1, Ordering::SeqCst);
            self.counters.push_event("grabber_closed", &self.url);
        }
    }
}

impl Drop for MockGrabber {
    fn drop(&mut self) {
        if !self.closed {
            self.counters.grabbers_open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct MockRecorder {
    script: MockScript,
    counters: Arc<MockCounters>,
    recorded: u64,
    closed: bool,
}

#[async_trait]
impl Recorder for MockRecorder {
    async fn record(&mut self, _frame: &Frame) -> Result<(), CodecError> {
        if let Some(limit) = self.script.encode_fail_after {
            if self.recorded >= limit {
                return Err(CodecError::Encode("mock encoder failure".into()));
            }
        }
        self.recorded += 1;
        self.counters.frames_recorded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.recorders_open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockRecorder {
    fn drop(&mut self) {
        if !self.closed {
            self.counters.recorders_open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

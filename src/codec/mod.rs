// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Codec adapters: the seam between the stream pipeline and the media
//! library. The pipeline only ever sees [`Grabber`], [`Recorder`] and
//! [`Frame`]; everything GStreamer-specific (pipeline strings, option
//! tuning, error-message classification) stays behind this boundary.

pub mod gst;
pub mod mock;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A single decoded video frame. Owns its pixel payload.
///
/// The optional release hook lets mock codecs track outstanding buffers;
/// it fires exactly once, on drop.
pub struct Frame {
    data: Bytes,
    width: u32,
    height: u32,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Frame {
    pub fn new(data: Bytes, width: u32, height: u32) -> Self {
        Self { data, width, height, release: None }
    }

    pub fn with_release(
        data: Bytes,
        width: u32,
        height: u32,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self { data, width, height, release: Some(Box::new(release)) }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// A frame is usable only if it carries pixels and sane dimensions.
    pub fn is_valid(&self) -> bool {
        !self.data.is_empty() && self.width > 0 && self.height > 0
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("bytes", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Stream stalled: no usable frame after {0} reads")]
    Stalled(u32),

    #[error("Encoder failed: {0} consecutive encode errors")]
    EncoderFailed(u32),

    #[error("Encoding timeout: no successful encode for {0:?}")]
    EncodeTimeout(Duration),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

impl CodecError {
    /// Transient codec noise is counted and swallowed by the pipeline;
    /// everything else ends the current run and triggers a reconnect.
    pub fn is_transient(&self) -> bool {
        match self {
            CodecError::Decode(msg) => is_transient_message(msg),
            _ => false,
        }
    }
}

/// Substring patterns the FFmpeg/GStreamer decoders emit for recoverable
/// corruption on lossy RTSP links. Substring matching lives only here.
const TRANSIENT_PATTERNS: &[&str] = &[
    "no frame",
    "missing picture",
    "Could not find reference",
    "error while decoding MB",
    "corrupted frame",
    "bytestream",
];

pub(crate) fn is_transient_message(msg: &str) -> bool {
    TRANSIENT_PATTERNS.iter().any(|p| msg.contains(p))
}

/// Tuning applied when opening an RTSP source.
#[derive(Debug, Clone)]
pub struct GrabberOptions {
    /// Prefer TCP transport; falls back to UDP if the server refuses.
    pub prefer_tcp: bool,
    /// Jitter/reorder buffer in milliseconds.
    pub latency_ms: u32,
    /// Socket timeout for reads.
    pub socket_timeout: Duration,
    /// How long `grab` waits for a sample before reporting a null frame.
    pub read_timeout: Duration,
}

impl Default for GrabberOptions {
    fn default() -> Self {
        Self {
            prefer_tcp: true,
            latency_ms: 2_000,
            socket_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_millis(200),
        }
    }
}

/// Tuning applied when creating an HLS recorder.
#[derive(Debug, Clone)]
pub struct RecorderOptions {
    /// Constant output frame rate.
    pub fps: u32,
    /// Segment duration in seconds.
    pub segment_seconds: u32,
    /// Sliding-window playlist length in segments.
    pub playlist_window: u32,
    /// x264 quantizer, roughly CRF.
    pub quantizer: u32,
}

impl RecorderOptions {
    pub fn new(fps: u32, segment_seconds: u32, playlist_window: u32) -> Self {
        Self { fps, segment_seconds, playlist_window, quantizer: 24 }
    }

    /// Closed GOP of two seconds at the output rate.
    pub fn gop(&self) -> u32 {
        self.fps * 2
    }
}

/// Live decoder pulling RTSP packets and emitting decoded frames.
#[async_trait]
pub trait Grabber: Send {
    /// Next decoded frame. `Ok(None)` means no data arrived within the
    /// read timeout (a "null frame" in pipeline terms).
    async fn grab(&mut self) -> std::result::Result<Option<Frame>, CodecError>;

    /// Frame rate advertised by the source, if known.
    fn source_fps(&self) -> Option<f64>;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn codec_name(&self) -> Option<String>;

    /// Stop and release the native decoder. Idempotent.
    async fn close(&mut self);
}

/// HLS muxer taking frames and writing `.ts` segments plus the playlist.
#[async_trait]
pub trait Recorder: Send {
    async fn record(&mut self, frame: &Frame) -> std::result::Result<(), CodecError>;

    /// Flush, finalize the playlist, and release the encoder. Idempotent.
    async fn close(&mut self);
}

/// Factory the gateway is constructed with; swapped for a mock in tests.
#[async_trait]
pub trait CodecFactory: Send + Sync {
    /// Open an RTSP source. The grabber is "connected" only once a first
    /// non-empty frame has been grabbed and released by the caller.
    async fn open_rtsp(
        &self,
        url: &str,
        opts: &GrabberOptions,
    ) -> std::result::Result<Box<dyn Grabber>, CodecError>;

    /// Create an HLS recorder writing `stream.m3u8` + `s<N>.ts` under `dir`.
    async fn create_hls(
        &self,
        dir: &Path,
        width: u32,
        height: u32,
        opts: &RecorderOptions,
    ) -> std::result::Result<Box<dyn Recorder>, CodecError>;
}

/// Ordered connection candidates for an RTSP source: the URL as given,
/// then the common vendor paths. Duplicates are skipped.
pub fn candidate_urls(url: &str) -> Vec<String> {
    let base = url.trim_end_matches('/');
    let root = match base.find("://").map(|i| i + 3) {
        // Strip any path after host[:port] to build vendor-path variants.
        Some(scheme_end) => match base[scheme_end..].find('/') {
            Some(slash) => &base[..scheme_end + slash],
            None => base,
        },
        None => base,
    };

    let mut candidates = vec![url.to_string()];
    for path in ["/Streaming/Channels/101", "/live"] {
        let candidate = format!("{root}{path}");
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}

/// Clamp a source resolution to at most 720p, preserving aspect ratio and
/// forcing even dimensions (required by the H.264 encoder).
pub fn output_resolution(width: u32, height: u32) -> (u32, u32) {
    let (mut w, mut h) = (width, height);
    if h > 720 {
        w = ((width as u64 * 720) / height as u64) as u32;
        h = 720;
    }
    (w & !1, h & !1)
}

/// Where a stream's playlist and segments live on disk.
pub fn stream_dir(hls_root: &Path, name: &str) -> PathBuf {
    hls_root.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_patterns_match() {
        assert!(is_transient_message("[h264] no frame!"));
        assert!(is_transient_message("error while decoding MB 12 34"));
        assert!(is_transient_message("Could not find reference with POC 6"));
        assert!(is_transient_message("bytestream overread"));
        assert!(!is_transient_message("Connection refused"));
        assert!(!is_transient_message("End of file"));
    }

    #[test]
    fn transient_classification() {
        assert!(CodecError::Decode("corrupted frame detected".into()).is_transient());
        assert!(!CodecError::Decode("hard failure".into()).is_transient());
        assert!(!CodecError::Connect("no frame".into()).is_transient());
        assert!(!CodecError::Stalled(500).is_transient());
    }

    #[test]
    fn candidates_from_plain_host() {
        let c = candidate_urls("rtsp://10.0.0.7:554");
        assert_eq!(
            c,
            vec![
                "rtsp://10.0.0.7:554",
                "rtsp://10.0.0.7:554/Streaming/Channels/101",
                "rtsp://10.0.0.7:554/live",
            ]
        );
    }

    #[test]
    fn candidates_keep_original_first_and_dedup() {
        let c = candidate_urls("rtsp://cam.local/live");
        assert_eq!(c[0], "rtsp://cam.local/live");
        assert_eq!(c.len(), 2, "vendor path equal to the original is skipped");
        assert!(c.contains(&"rtsp://cam.local/Streaming/Channels/101".to_string()));
    }

    #[test]
    fn resolution_clamped_to_720p_even() {
        assert_eq!(output_resolution(1920, 1080), (1280, 720));
        assert_eq!(output_resolution(2560, 1440), (1280, 720));
        assert_eq!(output_resolution(1280, 720), (1280, 720));
        assert_eq!(output_resolution(640, 480), (640, 480));
        // Odd source dims are forced even.
        assert_eq!(output_resolution(641, 481), (640, 480));
        // Aspect preserved for portrait-ish sources.
        assert_eq!(output_resolution(1080, 1920), (404, 720));
    }

    #[test]
    fn invalid_frames_detected() {
        let empty = Frame::new(Bytes::new(), 640, 480);
        assert!(!empty.is_valid());
        let flat = Frame::new(Bytes::from_static(&[0u8; 16]), 0, 480);
        assert!(!flat.is_valid());
        let ok = Frame::new(Bytes::from_static(&[0u8; 16]), 4, 4);
        assert!(ok.is_valid());
    }

    #[test]
    fn release_hook_fires_once_on_drop() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let frame = Frame::with_release(Bytes::from_static(&[1, 2, 3]), 1, 1, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(frame);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

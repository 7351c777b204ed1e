//! GStreamer-backed codec adapters.
//!
//! Grabber pipeline:
//!   rtspsrc → decodebin → videoconvert → appsink (RGB)
//!
//! Recorder pipeline:
//!   appsrc → videoconvert → videoscale → x264enc → h264parse →
//!   splitmuxsink (mpegtsmux), playlist kept by `hls::PlaylistWriter`
//!
//! The appsink forwards decoded frames through a bounded async channel;
//! every option string is built here and nowhere else.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    is_transient_message, output_resolution, CodecError, CodecFactory, Frame, Grabber,
    GrabberOptions, Recorder, RecorderOptions,
};
use crate::hls::{self, PlaylistWriter};

/// Raw decoded frame as delivered by the appsink callback.
struct RawSample {
    data: Bytes,
    width: u32,
    height: u32,
}

/// Caps-derived properties of the connected source.
#[derive(Default, Clone)]
struct SourceInfo {
    width: u32,
    height: u32,
    fps: Option<f64>,
    codec: Option<String>,
}

pub struct GstCodecFactory;

impl GstCodecFactory {
    pub fn new() -> crate::error::Result<Self> {
        gst::init().map_err(|e| CodecError::Connect(format!("gst::init: {e}")))?;
        Ok(Self)
    }
}

/// Grabber pipeline description for one RTSP candidate URL.
fn grabber_pipeline(url: &str, opts: &GrabberOptions) -> String {
    let protocols = if opts.prefer_tcp { "tcp+udp-mcast+udp" } else { "udp+udp-mcast+tcp" };
    format!(
        "rtspsrc name=src location={url} protocols={protocols} \
         latency={latency} tcp-timeout={tcp_timeout} do-retransmission=true ! \
         decodebin name=dec ! videoconvert ! video/x-raw,format=RGB ! \
         appsink name=sink emit-signals=true max-buffers=2 drop=true sync=false",
        url = url,
        protocols = protocols,
        latency = opts.latency_ms,
        tcp_timeout = opts.socket_timeout.as_micros(),
    )
}

/// Recorder pipeline description writing `s%d.ts` segments. The playlist
/// itself is maintained by [`crate::hls::PlaylistWriter`], fed from
/// fragment-closed messages.
fn recorder_pipeline(
    dir: &Path,
    width: u32,
    height: u32,
    start_index: u64,
    opts: &RecorderOptions,
) -> String {
    let (out_w, out_h) = output_resolution(width, height);
    format!(
        "appsrc name=src is-live=true format=time block=true \
         caps=video/x-raw,format=RGB,width={width},height={height},framerate={fps}/1 ! \
         videoconvert ! videoscale ! video/x-raw,width={out_w},height={out_h} ! \
         x264enc speed-preset=ultrafast tune=zerolatency threads=1 \
         key-int-max={gop} pass=qual quantizer={quantizer} ! \
         h264parse ! \
         splitmuxsink name=sink muxer-factory=mpegtsmux location={segments} \
         max-size-time={segment_ns} start-index={start_index} send-keyframe-requests=true",
        width = width,
        height = height,
        fps = opts.fps,
        out_w = out_w,
        out_h = out_h,
        gop = opts.gop(),
        quantizer = opts.quantizer,
        segments = dir.join("s%d.ts").display(),
        segment_ns = opts.segment_seconds as u64 * 1_000_000_000,
        start_index = start_index,
    )
}

#[async_trait]
impl CodecFactory for GstCodecFactory {
    async fn open_rtsp(
        &self,
        url: &str,
        opts: &GrabberOptions,
    ) -> Result<Box<dyn Grabber>, CodecError> {
        let grabber = GstGrabber::open(url, opts)?;
        Ok(Box::new(grabber))
    }

    async fn create_hls(
        &self,
        dir: &Path,
        width: u32,
        height: u32,
        opts: &RecorderOptions,
    ) -> Result<Box<dyn Recorder>, CodecError> {
        let recorder = GstRecorder::create(dir, width, height, opts)?;
        Ok(Box::new(recorder))
    }
}

pub struct GstGrabber {
    pipeline: gst::Pipeline,
    rx: mpsc::Receiver<RawSample>,
    info: Arc<Mutex<SourceInfo>>,
    /// Last fatal error reported on the bus, consumed by `grab`.
    bus_error: Arc<Mutex<Option<String>>>,
    read_timeout: std::time::Duration,
    closed: bool,
}

impl GstGrabber {
    fn open(url: &str, opts: &GrabberOptions) -> Result<Self, CodecError> {
        let description = grabber_pipeline(url, opts);
        debug!(pipeline = description, "Opening RTSP grabber");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| CodecError::Connect(format!("parse_launch: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CodecError::Connect("Not a pipeline".into()))?;

        let appsink: gst_app::AppSink = pipeline
            .by_name("sink")
            .ok_or_else(|| CodecError::Connect("appsink not found".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CodecError::Connect("Cast to AppSink failed".into()))?;

        let (tx, rx) = mpsc::channel::<RawSample>(2);
        let info = Arc::new(Mutex::new(SourceInfo::default()));

        let info_cb = info.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buf = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buf.map_readable().map_err(|_| gst::FlowError::Error)?;

                    let (mut width, mut height) = (0u32, 0u32);
                    if let Some(caps) = sample.caps() {
                        if let Some(s) = caps.structure(0) {
                            width = s.get::<i32>("width").unwrap_or(0).max(0) as u32;
                            height = s.get::<i32>("height").unwrap_or(0).max(0) as u32;
                            let mut inf = info_cb.lock();
                            inf.width = width;
                            inf.height = height;
                            if inf.fps.is_none() {
                                if let Ok(fr) = s.get::<gst::Fraction>("framerate") {
                                    if fr.denom() > 0 && fr.numer() > 0 {
                                        inf.fps = Some(fr.numer() as f64 / fr.denom() as f64);
                                    }
                                }
                            }
                        }
                    }

                    let raw = RawSample {
                        data: Bytes::copy_from_slice(map.as_slice()),
                        width,
                        height,
                    };
                    // Non-blocking send; drop if the pipeline is not keeping up.
                    let _ = tx.try_send(raw);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        // Record fatal bus errors for grab() to surface. A sync handler
        // fires on the posting thread, so no GLib main loop is needed.
        let bus_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        if let Some(bus) = pipeline.bus() {
            let slot = bus_error.clone();
            bus.set_sync_handler(move |_, msg| {
                if let gst::MessageView::Error(err) = msg.view() {
                    let text = err.error().to_string();
                    slot.lock().get_or_insert(text);
                }
                gst::BusSyncReply::Drop
            });
        }

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CodecError::Connect(format!("set_state Playing: {e}")))?;

        info!(url, "RTSP grabber pipeline started");

        Ok(GstGrabber {
            pipeline,
            rx,
            info,
            bus_error,
            read_timeout: opts.read_timeout,
            closed: false,
        })
    }
}

#[async_trait]
impl Grabber for GstGrabber {
    async fn grab(&mut self) -> Result<Option<Frame>, CodecError> {
        if let Some(text) = self.bus_error.lock().take() {
            return Err(classify_bus_error(&text));
        }

        match tokio::time::timeout(self.read_timeout, self.rx.recv()).await {
            Ok(Some(raw)) => Ok(Some(Frame::new(raw.data, raw.width, raw.height))),
            // Channel closed: the pipeline tore down underneath us.
            Ok(None) => Err(CodecError::ConnectionLost("decode channel closed".into())),
            // Nothing within the read timeout: a null frame.
            Err(_) => Ok(None),
        }
    }

    fn source_fps(&self) -> Option<f64> {
        self.info.lock().fps
    }

    fn width(&self) -> u32 {
        self.info.lock().width
    }

    fn height(&self) -> u32 {
        self.info.lock().height
    }

    fn codec_name(&self) -> Option<String> {
        if let Some(cached) = self.info.lock().codec.clone() {
            return Some(cached);
        }
        // Read the negotiated caps on the decoder's sink pad lazily; they
        // are only available once the source has connected.
        let dec = self.pipeline.by_name("dec")?;
        let pad = dec.static_pad("sink")?;
        let caps = pad.current_caps()?;
        let name = caps.structure(0)?.name();
        let codec = name.strip_prefix("video/x-").unwrap_or(name.as_str()).to_string();
        self.info.lock().codec = Some(codec.clone());
        Some(codec)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.pipeline.set_state(gst::State::Null);
        self.rx.close();
        debug!("RTSP grabber pipeline stopped");
    }
}

impl Drop for GstGrabber {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}

fn classify_bus_error(text: &str) -> CodecError {
    if is_transient_message(text) {
        CodecError::Decode(text.to_string())
    } else if text.contains("Could not connect") || text.contains("refused") {
        CodecError::Connect(text.to_string())
    } else {
        CodecError::ConnectionLost(text.to_string())
    }
}

/// A finished `.ts` fragment reported by splitmuxsink.
struct ClosedFragment {
    index: u64,
    /// Pipeline running time at close, nanoseconds.
    running_time: u64,
}

pub struct GstRecorder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    playlist: PlaylistWriter,
    /// Fragments closed by the muxer since the last drain.
    closed_fragments: Arc<Mutex<Vec<ClosedFragment>>>,
    /// Fatal error posted on the recorder bus, surfaced by `record`.
    bus_error: Arc<Mutex<Option<String>>>,
    eos_seen: Arc<AtomicBool>,
    /// Running time at which the previously drained fragment closed.
    prev_running_time: u64,
    frame_duration: gst::ClockTime,
    frames_pushed: u64,
    closed: bool,
}

impl GstRecorder {
    fn create(
        dir: &Path,
        width: u32,
        height: u32,
        opts: &RecorderOptions,
    ) -> Result<Self, CodecError> {
        // Continue segment numbering across reconnects and mark the seam.
        let start_index = hls::last_segment_index(dir).map(|i| i + 1).unwrap_or(0);
        let playlist =
            PlaylistWriter::new(dir, opts.segment_seconds, opts.playlist_window, start_index > 0);

        let description = recorder_pipeline(dir, width, height, start_index, opts);
        debug!(pipeline = description, "Creating HLS recorder");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| CodecError::Encode(format!("parse_launch: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CodecError::Encode("Not a pipeline".into()))?;

        let appsrc: gst_app::AppSrc = pipeline
            .by_name("src")
            .ok_or_else(|| CodecError::Encode("appsrc not found".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| CodecError::Encode("Cast to AppSrc failed".into()))?;

        let closed_fragments: Arc<Mutex<Vec<ClosedFragment>>> = Arc::new(Mutex::new(Vec::new()));
        let bus_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let eos_seen = Arc::new(AtomicBool::new(false));
        if let Some(bus) = pipeline.bus() {
            let fragments = closed_fragments.clone();
            let error_slot = bus_error.clone();
            let eos = eos_seen.clone();
            bus.set_sync_handler(move |_, msg| {
                match msg.view() {
                    gst::MessageView::Element(element) => {
                        if let Some(s) = element.structure() {
                            if s.name() == "splitmuxsink-fragment-closed" {
                                let location = s.get::<String>("location").unwrap_or_default();
                                let running_time = s.get::<u64>("running-time").unwrap_or(0);
                                if let Some(index) = fragment_index(&location) {
                                    fragments.lock().push(ClosedFragment { index, running_time });
                                }
                            }
                        }
                    }
                    gst::MessageView::Error(err) => {
                        let text = err.error().to_string();
                        error_slot.lock().get_or_insert(text);
                    }
                    gst::MessageView::Eos(_) => {
                        eos.store(true, Ordering::SeqCst);
                    }
                    _ => {}
                }
                gst::BusSyncReply::Drop
            });
        }

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CodecError::Encode(format!("set_state Playing: {e}")))?;

        info!(dir = %dir.display(), fps = opts.fps, start_index, "HLS recorder started");

        Ok(GstRecorder {
            pipeline,
            appsrc,
            playlist,
            closed_fragments,
            bus_error,
            eos_seen,
            prev_running_time: 0,
            frame_duration: gst::ClockTime::SECOND / opts.fps as u64,
            frames_pushed: 0,
            closed: false,
        })
    }

    /// Fold any fragments the muxer finished into the playlist.
    fn drain_fragments(&mut self) -> Result<(), CodecError> {
        let fragments: Vec<ClosedFragment> = self.closed_fragments.lock().drain(..).collect();
        for fragment in fragments {
            let duration =
                fragment.running_time.saturating_sub(self.prev_running_time) as f64 / 1e9;
            self.prev_running_time = fragment.running_time;
            self.playlist
                .push_segment(fragment.index, duration)
                .map_err(|e| CodecError::Encode(format!("playlist update: {e}")))?;
        }
        Ok(())
    }
}

/// Segment index parsed from a splitmuxsink fragment location.
fn fragment_index(location: &str) -> Option<u64> {
    let name = Path::new(location).file_name()?.to_str()?;
    name.strip_prefix('s')?.strip_suffix(".ts")?.parse().ok()
}

#[async_trait]
impl Recorder for GstRecorder {
    async fn record(&mut self, frame: &Frame) -> Result<(), CodecError> {
        if let Some(text) = self.bus_error.lock().take() {
            return Err(CodecError::Encode(text));
        }

        let mut buffer = gst::Buffer::from_slice(frame.data().clone());
        {
            let buffer = buffer.get_mut().expect("freshly created buffer is writable");
            buffer.set_pts(self.frame_duration * self.frames_pushed);
            buffer.set_duration(self.frame_duration);
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| CodecError::Encode(format!("push_buffer: {e:?}")))?;
        self.frames_pushed += 1;

        self.drain_fragments()
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let _ = self.appsrc.end_of_stream();
        // Give the muxer a moment to flush the final segment; EOS is
        // observed through the sync handler since it drops bus messages.
        let flush_deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while !self.eos_seen.load(Ordering::SeqCst) && tokio::time::Instant::now() < flush_deadline
        {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        if let Err(e) = self.drain_fragments() {
            warn!(error = %e, "Final playlist update failed");
        }
        if self.pipeline.set_state(gst::State::Null).is_err() {
            warn!("HLS recorder did not reach Null state cleanly");
        }
        debug!(frames = self.frames_pushed, "HLS recorder stopped");
    }
}

impl Drop for GstRecorder {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn grabber_options_rendered() {
        let opts = GrabberOptions {
            prefer_tcp: true,
            latency_ms: 2_000,
            socket_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_millis(200),
        };
        let p = grabber_pipeline("rtsp://cam/live", &opts);
        assert!(p.contains("location=rtsp://cam/live"));
        assert!(p.contains("protocols=tcp+udp-mcast+udp"));
        assert!(p.contains("latency=2000"));
        assert!(p.contains("tcp-timeout=60000000"));
        assert!(p.contains("format=RGB"));
    }

    #[test]
    fn recorder_options_rendered() {
        let opts = RecorderOptions::new(10, 4, 3);
        let p = recorder_pipeline(Path::new("/tmp/hls/cam_1"), 1920, 1080, 7, &opts);
        assert!(p.contains("framerate=10/1"));
        assert!(p.contains("width=1280,height=720"), "downscaled to 720p: {p}");
        assert!(p.contains("key-int-max=20"));
        assert!(p.contains("speed-preset=ultrafast tune=zerolatency threads=1"));
        assert!(p.contains("muxer-factory=mpegtsmux"));
        assert!(p.contains("location=/tmp/hls/cam_1/s%d.ts"));
        assert!(p.contains("max-size-time=4000000000"));
        assert!(p.contains("start-index=7"));
    }

    #[test]
    fn fragment_locations_parsed() {
        assert_eq!(fragment_index("/var/hls/cam_1/s0.ts"), Some(0));
        assert_eq!(fragment_index("/var/hls/cam_1/s17.ts"), Some(17));
        assert_eq!(fragment_index("/var/hls/cam_1/stream.m3u8"), None);
        assert_eq!(fragment_index("seg_001.ts"), None);
    }

    #[test]
    fn bus_errors_classified() {
        assert!(matches!(classify_bus_error("no frame!"), CodecError::Decode(_)));
        assert!(matches!(
            classify_bus_error("Could not connect to server"),
            CodecError::Connect(_)
        ));
        assert!(matches!(
            classify_bus_error("Unhandled stream error"),
            CodecError::ConnectionLost(_)
        ));
    }
}

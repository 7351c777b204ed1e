//! HLS playlist generation and sliding-window maintenance.
//!
//! The recorder writes raw `.ts` segments; this module owns the
//! `stream.m3u8` text and the retention of segment files. The playlist is
//! a live sliding window: old entries fall off, their segment files are
//! deleted, and a `#EXT-X-DISCONTINUITY` marks the first segment written
//! after a grabber reconnect.

use std::collections::VecDeque;
use std::fmt::Write as FmtWrite;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

pub const PLAYLIST_NAME: &str = "stream.m3u8";

/// Name of segment `index` on disk.
pub fn segment_file(index: u64) -> String {
    format!("s{index}.ts")
}

/// Highest existing segment index under `dir`, if any. Used to continue
/// numbering when a recorder is recreated after a reconnect.
pub fn last_segment_index(dir: &Path) -> Option<u64> {
    let entries = fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name();
            let name = name.to_str()?;
            name.strip_prefix('s')?.strip_suffix(".ts")?.parse::<u64>().ok()
        })
        .max()
}

#[derive(Debug, Clone)]
struct SegmentEntry {
    index: u64,
    duration: f64,
    started_at: DateTime<Utc>,
    discontinuity: bool,
}

/// Maintains one stream's live playlist and its segment window.
pub struct PlaylistWriter {
    dir: PathBuf,
    target_duration: u32,
    window: usize,
    segments: VecDeque<SegmentEntry>,
    /// Marks the next pushed segment with a discontinuity tag.
    pending_discontinuity: bool,
}

impl PlaylistWriter {
    /// `discontinuity` is set when this writer continues an existing
    /// playlist after a reconnect.
    pub fn new(dir: &Path, target_duration: u32, window: u32, discontinuity: bool) -> Self {
        Self {
            dir: dir.to_path_buf(),
            target_duration,
            window: window.max(1) as usize,
            segments: VecDeque::new(),
            pending_discontinuity: discontinuity,
        }
    }

    /// Record a finished segment, evict anything past the window, and
    /// rewrite the playlist.
    pub fn push_segment(&mut self, index: u64, duration: f64) -> io::Result<()> {
        let duration = if duration > 0.0 { duration } else { self.target_duration as f64 };
        self.segments.push_back(SegmentEntry {
            index,
            duration,
            started_at: Utc::now(),
            discontinuity: std::mem::take(&mut self.pending_discontinuity),
        });

        while self.segments.len() > self.window {
            let evicted = self.segments.pop_front().expect("window overflow implies an entry");
            let path = self.dir.join(segment_file(evicted.index));
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to delete old segment");
                }
            }
        }

        self.write_playlist()
    }

    /// Render and atomically replace `stream.m3u8`.
    fn write_playlist(&self) -> io::Result<()> {
        let rendered = self.render();
        let tmp = self.dir.join(format!("{PLAYLIST_NAME}.tmp"));
        fs::write(&tmp, rendered)?;
        fs::rename(&tmp, self.dir.join(PLAYLIST_NAME))
    }

    fn render(&self) -> String {
        let first_seq = self.segments.front().map(|s| s.index).unwrap_or(0);

        let mut m3u8 = String::with_capacity(1024);
        writeln!(m3u8, "#EXTM3U").unwrap();
        writeln!(m3u8, "#EXT-X-VERSION:3").unwrap();
        writeln!(m3u8, "#EXT-X-TARGETDURATION:{}", self.target_duration).unwrap();
        writeln!(m3u8, "#EXT-X-MEDIA-SEQUENCE:{}", first_seq).unwrap();

        for seg in &self.segments {
            if seg.discontinuity {
                writeln!(m3u8, "#EXT-X-DISCONTINUITY").unwrap();
            }
            writeln!(
                m3u8,
                "#EXT-X-PROGRAM-DATE-TIME:{}",
                seg.started_at.format("%Y-%m-%dT%H:%M:%S%.3fZ")
            )
            .unwrap();
            writeln!(m3u8, "#EXTINF:{:.3},", seg.duration).unwrap();
            writeln!(m3u8, "{}", segment_file(seg.index)).unwrap();
        }
        m3u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tmp_dir() -> TempDir {
        tempfile::tempdir().expect("create tempdir")
    }

    #[test]
    fn segment_naming() {
        assert_eq!(segment_file(0), "s0.ts");
        assert_eq!(segment_file(42), "s42.ts");
    }

    #[test]
    fn playlist_contains_required_tags() {
        let dir = tmp_dir();
        let mut w = PlaylistWriter::new(dir.path(), 4, 3, false);
        w.push_segment(0, 4.0).expect("push");
        w.push_segment(1, 3.987).expect("push");

        let playlist = fs::read_to_string(dir.path().join(PLAYLIST_NAME)).expect("read");
        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("#EXT-X-VERSION:3"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:4"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0"));
        assert!(playlist.contains("#EXT-X-PROGRAM-DATE-TIME:"));
        assert!(playlist.contains("#EXTINF:4.000,\ns0.ts"));
        assert!(playlist.contains("#EXTINF:3.987,\ns1.ts"));
        assert!(!playlist.contains("#EXT-X-ENDLIST"), "live playlist never ends");
    }

    #[test]
    fn window_slides_and_deletes_segments() {
        let dir = tmp_dir();
        let mut w = PlaylistWriter::new(dir.path(), 4, 2, false);

        for i in 0..4u64 {
            fs::write(dir.path().join(segment_file(i)), b"ts").expect("segment");
            w.push_segment(i, 4.0).expect("push");
        }

        let playlist = fs::read_to_string(dir.path().join(PLAYLIST_NAME)).expect("read");
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:2"));
        assert!(!playlist.contains("\ns0.ts"));
        assert!(!playlist.contains("\ns1.ts"));
        assert!(playlist.contains("\ns2.ts"));
        assert!(playlist.contains("\ns3.ts"));

        assert!(!dir.path().join("s0.ts").exists(), "evicted segment deleted");
        assert!(!dir.path().join("s1.ts").exists());
        assert!(dir.path().join("s2.ts").exists());
    }

    #[test]
    fn discontinuity_marks_first_segment_after_reconnect() {
        let dir = tmp_dir();
        let mut w = PlaylistWriter::new(dir.path(), 4, 3, true);
        w.push_segment(5, 4.0).expect("push");
        w.push_segment(6, 4.0).expect("push");

        let playlist = fs::read_to_string(dir.path().join(PLAYLIST_NAME)).expect("read");
        let disc_pos = playlist.find("#EXT-X-DISCONTINUITY").expect("discontinuity present");
        let s5_pos = playlist.find("s5.ts").unwrap();
        let s6_pos = playlist.find("s6.ts").unwrap();
        assert!(disc_pos < s5_pos, "tag precedes the first new segment");
        assert_eq!(playlist.matches("#EXT-X-DISCONTINUITY").count(), 1);
        assert!(s5_pos < s6_pos);
    }

    #[test]
    fn resume_index_scanning() {
        let dir = tmp_dir();
        assert_eq!(last_segment_index(dir.path()), None);
        fs::write(dir.path().join("s3.ts"), b"x").unwrap();
        fs::write(dir.path().join("s11.ts"), b"x").unwrap();
        fs::write(dir.path().join("stream.m3u8"), b"x").unwrap();
        assert_eq!(last_segment_index(dir.path()), Some(11));
    }
}

//! Live playlist state and rendering
//!
//! The playlist is a pure function of the current segment window; it is
//! regenerated on every request and never persisted. `#EXT-X-ENDLIST` is
//! never emitted — these are live playlists only.

use std::collections::VecDeque;
use std::fmt::Write;
use std::time::SystemTime;

use crate::registry::StreamKey;

/// A closed media segment in the window
#[derive(Debug, Clone)]
pub struct Segment {
    pub stream_key: StreamKey,
    /// Monotonic from 0 within a publishing session, no gaps
    pub sequence: u64,
    /// Seconds, strictly positive
    pub duration: f64,
    /// Storage path of the segment bytes
    pub path: String,
    pub byte_size: usize,
    pub created_at: SystemTime,
    pub available: bool,
}

/// Sliding playlist window for one stream
#[derive(Debug)]
pub struct Playlist {
    stream_key: StreamKey,
    /// Nominal segment seconds; floor for the advertised target duration
    nominal_duration_secs: f64,
    max_segments: usize,
    segments: VecDeque<Segment>,
    has_init: bool,
}

impl Playlist {
    pub fn new(stream_key: StreamKey, nominal_duration_secs: f64, max_segments: usize) -> Self {
        Self {
            stream_key,
            nominal_duration_secs,
            max_segments: max_segments.max(1),
            segments: VecDeque::new(),
            has_init: false,
        }
    }

    pub fn stream_key(&self) -> &StreamKey {
        &self.stream_key
    }

    pub fn set_has_init(&mut self) {
        self.has_init = true;
    }

    pub fn has_init(&self) -> bool {
        self.has_init
    }

    /// Append a closed segment; returns the evicted segment once the window
    /// overflows.
    pub fn push(&mut self, segment: Segment) -> Option<Segment> {
        self.segments.push_back(segment);
        if self.segments.len() > self.max_segments {
            self.segments.pop_front()
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Sequence number of the oldest segment in the window (0 when empty)
    pub fn media_sequence(&self) -> u64 {
        self.segments.front().map(|s| s.sequence).unwrap_or(0)
    }

    /// `ceil` of the longest segment in the window, floored at the nominal
    /// duration so the advertised bound never understates
    pub fn target_duration(&self) -> u64 {
        let max = self
            .segments
            .iter()
            .map(|s| s.duration)
            .fold(self.nominal_duration_secs, f64::max);
        max.ceil() as u64
    }

    /// Whether a sequence number is inside the current window
    pub fn contains(&self, sequence: u64) -> bool {
        self.segments.iter().any(|s| s.sequence == sequence)
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    /// Render the media playlist text.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(128 + self.segments.len() * 48);
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:7\n");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", self.target_duration());
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence());
        if self.has_init {
            out.push_str("#EXT-X-MAP:URI=\"init.mp4\"\n");
        }
        for segment in &self.segments {
            let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration);
            let _ = writeln!(out, "segment_{}.m4s", segment.sequence);
        }
        out
    }
}

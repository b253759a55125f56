//! HLS output: playlist state and the per-stream segmentation worker
//!
//! One worker per live stream subscribes to the registry's frame feed,
//! groups frames into keyframe-aligned segments on a fixed tick, muxes them
//! to fMP4, writes the bytes to storage, and maintains the live-edge
//! playlist window. Playback reads go through storage (segments) or a
//! lock-protected playlist snapshot.

pub mod playlist;
pub mod segmenter;

pub use playlist::{Playlist, Segment};
pub use segmenter::{Segmenter, SegmenterConfig};

use crate::registry::StreamKey;

/// Storage path of a stream's init segment
pub fn init_path(key: &StreamKey) -> String {
    format!("{key}/init.mp4")
}

/// Storage path of one media segment
pub fn segment_path(key: &StreamKey, sequence: u64) -> String {
    format!("{key}/segment_{sequence}.m4s")
}

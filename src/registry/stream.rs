//! Per-stream state: lifecycle, codec info, running stats

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use crate::media::{AacConfig, AvcConfig};

/// Stream lifecycle state
///
/// ```text
/// Idle ──► Connecting ──► Live ──► Stopping ──► Stopped
///              │                                   │
///              └──────────── (reuse) ◄─────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Live,
    Stopping,
    Stopped,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Connecting => "connecting",
            StreamState::Live => "live",
            StreamState::Stopping => "stopping",
            StreamState::Stopped => "stopped",
        }
    }
}

/// Video codec info, set once per publishing session from the AVC sequence
/// header and cleared on stop
#[derive(Debug, Clone)]
pub struct VideoCodecInfo {
    pub avc: AvcConfig,
    /// Display dimensions, learned from onMetaData when present
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
}

/// Audio codec info from the AAC sequence header
#[derive(Debug, Clone)]
pub struct AudioCodecInfo {
    pub aac: AacConfig,
}

/// Running stream statistics, updated lock-free on the publish path
#[derive(Debug, Default)]
pub struct StreamStats {
    pub bytes_received: AtomicU64,
    pub frames_received: AtomicU64,
    pub keyframes: AtomicU64,
    pub frames_dropped: AtomicU64,
    /// Milliseconds since registry epoch of the last received frame
    pub last_frame_ms: AtomicU64,
    // Drop-rate window, reset every 10 s
    pub window_started_ms: AtomicU64,
    pub window_frames: AtomicU64,
    pub window_dropped: AtomicU64,
}

impl StreamStats {
    pub fn bytes(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

/// Mutable (non-atomic) stream fields, guarded by the entry lock
#[derive(Debug)]
pub struct StreamMeta {
    pub state: StreamState,
    pub publisher_addr: Option<SocketAddr>,
    pub started_at: Option<SystemTime>,
    pub stopped_at: Option<SystemTime>,
    pub started_instant: Option<Instant>,
    pub video_codec: Option<VideoCodecInfo>,
    pub audio_codec: Option<AudioCodecInfo>,
}

impl StreamMeta {
    pub fn new() -> Self {
        Self {
            state: StreamState::Idle,
            publisher_addr: None,
            started_at: None,
            stopped_at: None,
            started_instant: None,
            video_codec: None,
            audio_codec: None,
        }
    }
}

impl Default for StreamMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of a stream, handed to the HTTP API
#[derive(Debug, Clone)]
pub struct StreamSnapshot {
    pub key: super::frame::StreamKey,
    pub state: StreamState,
    pub publisher_addr: Option<SocketAddr>,
    pub started_at: Option<SystemTime>,
    pub uptime_secs: Option<u64>,
    pub viewers: usize,
    pub video_codec: Option<VideoCodecInfo>,
    pub audio_codec: Option<AudioCodecInfo>,
    pub bytes_received: u64,
    pub frames_received: u64,
    pub keyframes: u64,
    pub frames_dropped: u64,
}

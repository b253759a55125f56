//! Per-stream segmentation workers
//!
//! Each live stream gets one worker task that owns all of its segmentation
//! state; nothing here is shared except the playlist, which sits behind a
//! read-write lock for HTTP snapshot reads. The worker selects over the
//! frame feed, a closing tick, and shutdown:
//!
//! - frames accumulate into the current segment buffer;
//! - a tick closes the buffer if (and only if) it holds a keyframe;
//! - shutdown finalizes once more, then releases the subscriber.
//!
//! A closed buffer is trimmed to its first keyframe, so every emitted
//! segment opens with an IDR carrying SPS+PPS (the parser injected them),
//! muxed to fMP4, written to storage, and appended to the sliding window.
//! The evicted segment's bytes are deleted from storage in the background.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use super::playlist::{Playlist, Segment};
use super::{init_path, segment_path};
use crate::mux::Fmp4Muxer;
use crate::registry::{MediaFrame, RegistryError, StreamKey, StreamRegistry};
use crate::storage::Storage;

/// Consecutive muxer failures tolerated before the stream is stopped
const MAX_MUX_FAILURES: u32 = 3;

/// Segmentation tuning
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Closing-tick period; also the nominal segment duration
    pub segment_duration: Duration,
    /// Sliding-window size
    pub max_segments: usize,
    /// Frame-feed subscriber buffer
    pub subscriber_buffer: usize,
    /// Frame rate assumed when PTS deltas are unusable
    pub nominal_frame_rate: f64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            segment_duration: Duration::from_secs(2),
            max_segments: 10,
            subscriber_buffer: 1000,
            nominal_frame_rate: 30.0,
        }
    }
}

struct WorkerEntry {
    shutdown: Option<oneshot::Sender<()>>,
    playlist: Arc<RwLock<Playlist>>,
    join: tokio::task::JoinHandle<()>,
}

/// Manages one segmentation worker per live stream
pub struct Segmenter {
    storage: Arc<dyn Storage>,
    registry: Arc<StreamRegistry>,
    config: SegmenterConfig,
    workers: Mutex<HashMap<StreamKey, WorkerEntry>>,
}

impl Segmenter {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<StreamRegistry>,
        config: SegmenterConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Start segmentation for a stream. Fails when already segmenting or the
    /// stream cannot be subscribed.
    pub fn start(&self, key: &StreamKey) -> Result<(), RegistryError> {
        let mut workers = self.workers.lock().unwrap();
        if workers.contains_key(key) {
            return Err(RegistryError::AlreadyLive(key.clone()));
        }

        let subscriber = self
            .registry
            .subscribe(key, self.config.subscriber_buffer)?;

        let playlist = Arc::new(RwLock::new(Playlist::new(
            key.clone(),
            self.config.segment_duration.as_secs_f64(),
            self.config.max_segments,
        )));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = SegmentWorker::new(
            key.clone(),
            self.config.clone(),
            Arc::clone(&self.storage),
            Arc::clone(&self.registry),
            Arc::clone(&playlist),
        );
        let join = tokio::spawn(worker.run(subscriber, shutdown_rx));

        workers.insert(
            key.clone(),
            WorkerEntry {
                shutdown: Some(shutdown_tx),
                playlist,
                join,
            },
        );

        tracing::info!(stream = %key, "segmentation started");
        Ok(())
    }

    /// Stop segmentation, letting the worker finalize a last segment.
    /// Idempotent: stopping an unknown stream is a no-op.
    pub async fn stop(&self, key: &StreamKey) {
        let entry = {
            let mut workers = self.workers.lock().unwrap();
            workers.remove(key)
        };

        let Some(mut entry) = entry else { return };
        if let Some(tx) = entry.shutdown.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(Duration::from_secs(5), &mut entry.join)
            .await
            .is_err()
        {
            tracing::warn!(stream = %key, "segmentation worker did not exit in time");
            entry.join.abort();
        }
        tracing::info!(stream = %key, "segmentation stopped");
    }

    /// Current playlist text; `None` until the first segment exists.
    pub fn playlist_text(&self, key: &StreamKey) -> Option<String> {
        let workers = self.workers.lock().unwrap();
        let playlist = workers.get(key)?.playlist.read().unwrap();
        if playlist.is_empty() {
            return None;
        }
        Some(playlist.render())
    }

    /// Whether a sequence number is inside the live window.
    pub fn segment_in_window(&self, key: &StreamKey, sequence: u64) -> bool {
        let workers = self.workers.lock().unwrap();
        workers
            .get(key)
            .map(|e| e.playlist.read().unwrap().contains(sequence))
            .unwrap_or(false)
    }

    /// Whether this stream is currently being segmented.
    pub fn is_active(&self, key: &StreamKey) -> bool {
        self.workers.lock().unwrap().contains_key(key)
    }
}

/// All per-stream segmentation state; single-owner, no internal locking
struct SegmentWorker {
    key: StreamKey,
    config: SegmenterConfig,
    storage: Arc<dyn Storage>,
    registry: Arc<StreamRegistry>,
    playlist: Arc<RwLock<Playlist>>,

    buffer: Vec<MediaFrame>,
    has_keyframe: bool,
    first_pts: Option<u32>,
    last_pts: Option<u32>,

    next_sequence: u64,
    init_written: bool,
    mux_failures: u32,
    muxer: Fmp4Muxer,
}

impl SegmentWorker {
    fn new(
        key: StreamKey,
        config: SegmenterConfig,
        storage: Arc<dyn Storage>,
        registry: Arc<StreamRegistry>,
        playlist: Arc<RwLock<Playlist>>,
    ) -> Self {
        Self {
            key,
            config,
            storage,
            registry,
            playlist,
            buffer: Vec::new(),
            has_keyframe: false,
            first_pts: None,
            last_pts: None,
            next_sequence: 0,
            init_written: false,
            mux_failures: 0,
            muxer: Fmp4Muxer::new(),
        }
    }

    async fn run(
        mut self,
        mut subscriber: crate::registry::SubscriberHandle,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.config.segment_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                frame = subscriber.recv() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => break, // stream stopped; drain is complete
                },
                _ = ticker.tick() => self.on_tick().await,
                _ = &mut shutdown => break,
            }
        }

        // Final flush if a keyframe is buffered
        self.on_tick().await;
        subscriber.cleanup();
        tracing::debug!(stream = %self.key, "segmentation worker exited");
    }

    /// Buffer a frame. Audio is dropped here; segmentation is video-only.
    fn on_frame(&mut self, frame: MediaFrame) {
        if !frame.is_video() {
            return;
        }
        if frame.is_keyframe {
            self.has_keyframe = true;
        }
        if self.first_pts.is_none() {
            self.first_pts = Some(frame.pts);
        }
        self.last_pts = Some(frame.pts);
        self.buffer.push(frame);
    }

    /// Attempt to finalize the current buffer. Without a keyframe the buffer
    /// keeps accumulating until the next tick.
    async fn on_tick(&mut self) {
        if self.buffer.is_empty() || !self.has_keyframe {
            return;
        }

        // Segments must open with a random-access point: drop any frames
        // that precede the first keyframe in the buffer.
        let Some(head) = self.buffer.iter().position(|f| f.is_keyframe) else {
            return;
        };
        if head > 0 {
            tracing::debug!(
                stream = %self.key,
                trimmed = head,
                "dropped pre-keyframe frames at segment boundary"
            );
            self.buffer.drain(..head);
            self.first_pts = self.buffer.first().map(|f| f.pts);
        }

        let frames = std::mem::take(&mut self.buffer);
        let duration = self.segment_duration_secs(frames.len());
        let sequence = self.next_sequence;

        let bytes = match self
            .muxer
            .media_segment(sequence as u32, &frames, self.config.nominal_frame_rate)
        {
            Ok(bytes) => {
                self.mux_failures = 0;
                bytes
            }
            Err(e) => {
                self.mux_failures += 1;
                tracing::warn!(
                    stream = %self.key,
                    error = %e,
                    consecutive = self.mux_failures,
                    "muxer failed, segment discarded"
                );
                if self.mux_failures >= MAX_MUX_FAILURES {
                    tracing::error!(stream = %self.key, "sustained muxer failure, stopping stream");
                    self.registry.set_stopped(&self.key);
                }
                self.reset_buffer();
                return;
            }
        };

        let path = segment_path(&self.key, sequence);
        if let Err(e) = self.storage.put(&path, bytes.clone()).await {
            tracing::warn!(stream = %self.key, path, error = %e, "segment write failed, discarded");
            self.reset_buffer();
            return;
        }

        // First successful segment also yields the init segment, synthesized
        // from the keyframe that opens it.
        if !self.init_written {
            self.write_init_segment(&frames).await;
        }

        let segment = Segment {
            stream_key: self.key.clone(),
            sequence,
            duration,
            path,
            byte_size: bytes.len(),
            created_at: SystemTime::now(),
            available: true,
        };

        let evicted = self.playlist.write().unwrap().push(segment);
        if let Some(old) = evicted {
            let storage = Arc::clone(&self.storage);
            tokio::spawn(async move {
                if let Err(e) = storage.delete(&old.path).await {
                    tracing::warn!(path = %old.path, error = %e, "evicted segment delete failed");
                }
            });
        }

        self.next_sequence += 1;
        tracing::info!(
            stream = %self.key,
            sequence,
            frames = frames.len(),
            duration_secs = format!("{duration:.3}"),
            bytes = bytes.len(),
            "segment closed"
        );

        self.reset_buffer();
    }

    async fn write_init_segment(&mut self, frames: &[MediaFrame]) {
        let Some(snapshot) = self.registry.get(&self.key) else {
            return;
        };
        let Some(video) = snapshot.video_codec else {
            tracing::warn!(stream = %self.key, "no codec config yet, init segment deferred");
            return;
        };

        let Some(keyframe) = frames.iter().find(|f| f.is_keyframe) else {
            return;
        };
        let dims = video.width.zip(video.height);

        match self.muxer.init_segment(&video.avc, &keyframe.payload, dims) {
            Ok(bytes) => {
                let path = init_path(&self.key);
                match self.storage.put(&path, bytes).await {
                    Ok(()) => {
                        self.init_written = true;
                        self.playlist.write().unwrap().set_has_init();
                        tracing::info!(stream = %self.key, "init segment written");
                    }
                    Err(e) => {
                        tracing::warn!(stream = %self.key, error = %e, "init segment write failed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(stream = %self.key, error = %e, "init segment mux failed");
            }
        }
    }

    /// Segment duration in seconds: PTS-derived when timestamps are usable,
    /// otherwise frame count over the nominal rate. Never zero or negative.
    fn segment_duration_secs(&self, frame_count: usize) -> f64 {
        let target = self.config.segment_duration.as_secs_f64();
        if let (Some(first), Some(last)) = (self.first_pts, self.last_pts) {
            let delta_ms = last.wrapping_sub(first) as f64;
            // A wrapped or frozen clock produces absurd deltas; fall back
            if delta_ms > 0.0 && delta_ms < 60_000.0 {
                return (delta_ms / 1000.0).clamp(0.5 * target, 2.0 * target);
            }
        }
        (frame_count.max(1) as f64) / self.config.nominal_frame_rate
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
        self.has_keyframe = false;
        self.first_pts = None;
        self.last_pts = None;
    }
}

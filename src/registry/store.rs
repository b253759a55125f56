//! Stream registry implementation
//!
//! Lock discipline: the stream map and each entry's subscriber list sit
//! behind `std::sync::RwLock`s held only for short, await-free critical
//! sections. The publish path takes shared locks and updates stats through
//! atomics, so concurrent publishers on different streams never contend.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Instant, SystemTime};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::error::RegistryError;
use super::frame::{MediaFrame, StreamKey};
use super::stream::{
    AudioCodecInfo, StreamMeta, StreamSnapshot, StreamState, StreamStats, VideoCodecInfo,
};

/// Drop-rate observation window
const DROP_WINDOW_MS: u64 = 10_000;

/// Dropped-frame percentage that triggers the backpressure warning
const DROP_WARN_PERCENT: u64 = 5;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<MediaFrame>,
}

struct StreamEntry {
    key: StreamKey,
    meta: RwLock<StreamMeta>,
    stats: StreamStats,
    subscribers: RwLock<Vec<Subscriber>>,
}

struct Inner {
    streams: RwLock<HashMap<StreamKey, Arc<StreamEntry>>>,
    epoch: Instant,
    next_subscriber_id: AtomicU64,
    max_viewers_per_stream: usize,
}

/// Handle owned by a subscriber
///
/// The handle is the sole owner of its cleanup: dropping it (or calling
/// [`SubscriberHandle::cleanup`]) deregisters the channel exactly once. The
/// registry keeps only a weak back-reference, so an abandoned handle cannot
/// keep a stream alive.
pub struct SubscriberHandle {
    rx: mpsc::Receiver<MediaFrame>,
    cleanup: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriberHandle {
    /// Receive the next frame in publish order; `None` once the stream has
    /// stopped and the buffer is drained.
    pub async fn recv(&mut self) -> Option<MediaFrame> {
        self.rx.recv().await
    }

    /// Deregister from the stream. Safe to omit: dropping the handle does
    /// the same thing.
    pub fn cleanup(mut self) {
        self.run_cleanup();
    }

    fn run_cleanup(&mut self) {
        if let Some(f) = self.cleanup.take() {
            f();
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.run_cleanup();
    }
}

/// Central registry for all active streams
pub struct StreamRegistry {
    inner: Arc<Inner>,
}

impl StreamRegistry {
    pub fn new(max_viewers_per_stream: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                streams: RwLock::new(HashMap::new()),
                epoch: Instant::now(),
                next_subscriber_id: AtomicU64::new(1),
                max_viewers_per_stream,
            }),
        }
    }

    /// Register a publisher for a stream key.
    ///
    /// Rejects when the key is already held by a connecting or live
    /// publisher; a stopped entry is reused with fresh state. This is the
    /// arbitration point that guarantees at most one live publisher per key.
    pub fn create(&self, key: &StreamKey, publisher_addr: SocketAddr) -> Result<(), RegistryError> {
        let mut streams = self.inner.streams.write().unwrap();

        if let Some(entry) = streams.get(key) {
            let mut meta = entry.meta.write().unwrap();
            match meta.state {
                StreamState::Connecting | StreamState::Live | StreamState::Stopping => {
                    return Err(RegistryError::AlreadyLive(key.clone()));
                }
                StreamState::Idle | StreamState::Stopped => {
                    *meta = StreamMeta::new();
                    meta.state = StreamState::Connecting;
                    meta.publisher_addr = Some(publisher_addr);
                    reset_stats(&entry.stats);
                    tracing::info!(stream = %key, peer = %publisher_addr, "publisher reclaimed stream");
                    return Ok(());
                }
            }
        }

        let entry = Arc::new(StreamEntry {
            key: key.clone(),
            meta: RwLock::new(StreamMeta::new()),
            stats: StreamStats::default(),
            subscribers: RwLock::new(Vec::new()),
        });
        {
            let mut meta = entry.meta.write().unwrap();
            meta.state = StreamState::Connecting;
            meta.publisher_addr = Some(publisher_addr);
        }
        streams.insert(key.clone(), entry);

        tracing::info!(stream = %key, peer = %publisher_addr, "publisher registered");
        Ok(())
    }

    /// Transition `Connecting → Live`.
    pub fn set_live(&self, key: &StreamKey) -> Result<(), RegistryError> {
        let entry = self.entry(key)?;
        let mut meta = entry.meta.write().unwrap();
        if meta.state != StreamState::Connecting {
            return Err(RegistryError::NotLive(key.clone()));
        }
        meta.state = StreamState::Live;
        meta.started_at = Some(SystemTime::now());
        meta.started_instant = Some(Instant::now());
        tracing::info!(stream = %key, "stream live");
        Ok(())
    }

    /// Stop a stream: close every subscriber channel exactly once, clear
    /// codec info, and drop the entry once nothing references it.
    ///
    /// Idempotent; the second call on a stopped or unknown stream is a no-op.
    pub fn set_stopped(&self, key: &StreamKey) {
        let entry = {
            let streams = self.inner.streams.read().unwrap();
            match streams.get(key) {
                Some(e) => Arc::clone(e),
                None => return,
            }
        };

        let drained = {
            let mut meta = entry.meta.write().unwrap();
            if meta.state == StreamState::Stopped {
                return;
            }
            meta.state = StreamState::Stopping;

            // Dropping the senders closes each channel; subscribers drain
            // buffered frames and then see end-of-stream.
            let drained: Vec<Subscriber> = entry.subscribers.write().unwrap().drain(..).collect();

            meta.state = StreamState::Stopped;
            meta.stopped_at = Some(SystemTime::now());
            meta.video_codec = None;
            meta.audio_codec = None;
            drained
        };

        tracing::info!(stream = %key, subscribers = drained.len(), "stream stopped");
        self.remove_if_defunct(key);
    }

    /// Record video codec info once per publishing session.
    pub fn set_video_codec(&self, key: &StreamKey, info: VideoCodecInfo) -> Result<(), RegistryError> {
        let entry = self.entry(key)?;
        let mut meta = entry.meta.write().unwrap();
        if meta.video_codec.is_none() {
            tracing::info!(
                stream = %key,
                profile = info.avc.profile_name(),
                level = %info.avc.level_string(),
                sps = info.avc.sps.len(),
                pps = info.avc.pps.len(),
                "video codec configured"
            );
            meta.video_codec = Some(info);
        }
        Ok(())
    }

    /// Record audio codec info once per publishing session.
    pub fn set_audio_codec(&self, key: &StreamKey, info: AudioCodecInfo) -> Result<(), RegistryError> {
        let entry = self.entry(key)?;
        let mut meta = entry.meta.write().unwrap();
        if meta.audio_codec.is_none() {
            meta.audio_codec = Some(info);
        }
        Ok(())
    }

    /// Attach display metadata (from onMetaData) to the video codec info.
    pub fn set_video_dimensions(&self, key: &StreamKey, width: u32, height: u32, frame_rate: Option<f64>) {
        if let Ok(entry) = self.entry(key) {
            let mut meta = entry.meta.write().unwrap();
            if let Some(info) = meta.video_codec.as_mut() {
                info.width = Some(width);
                info.height = Some(height);
                if frame_rate.is_some() {
                    info.frame_rate = frame_rate;
                }
            }
        }
    }

    /// Fan a frame out to every subscriber without blocking.
    ///
    /// A full subscriber channel drops the frame for that subscriber and
    /// increments the stream's dropped-frame counter; ingest never waits.
    pub fn publish_frame(&self, frame: MediaFrame) -> Result<(), RegistryError> {
        let entry = self.entry(&frame.stream_key)?;

        {
            let meta = entry.meta.read().unwrap();
            if meta.state != StreamState::Live {
                return Err(RegistryError::NotLive(frame.stream_key.clone()));
            }
        }

        let stats = &entry.stats;
        stats.bytes_received.fetch_add(frame.payload.len() as u64, Ordering::Relaxed);
        stats.frames_received.fetch_add(1, Ordering::Relaxed);
        if frame.is_keyframe {
            stats.keyframes.fetch_add(1, Ordering::Relaxed);
        }
        let now_ms = self.inner.epoch.elapsed().as_millis() as u64;
        stats.last_frame_ms.store(now_ms, Ordering::Relaxed);
        self.observe_drop_window(&entry, now_ms);
        stats.window_frames.fetch_add(1, Ordering::Relaxed);

        let subscribers = entry.subscribers.read().unwrap();
        for sub in subscribers.iter() {
            match sub.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    stats.window_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => {
                    // Receiver gone without cleanup yet; the handle's drop
                    // will deregister it shortly.
                }
            }
        }

        Ok(())
    }

    /// Register a new subscriber on a connecting or live stream.
    ///
    /// The returned handle yields frames in publish order and owns its own
    /// deregistration.
    pub fn subscribe(
        &self,
        key: &StreamKey,
        buffer_size: usize,
    ) -> Result<SubscriberHandle, RegistryError> {
        let entry = self.entry(key)?;

        {
            let meta = entry.meta.read().unwrap();
            if !matches!(meta.state, StreamState::Connecting | StreamState::Live) {
                return Err(RegistryError::NotLive(key.clone()));
            }
        }

        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer_size.max(1));

        {
            let mut subscribers = entry.subscribers.write().unwrap();
            if subscribers.len() >= self.inner.max_viewers_per_stream {
                return Err(RegistryError::TooManyViewers(key.clone()));
            }
            subscribers.push(Subscriber { id, tx });
        }

        tracing::debug!(stream = %key, subscriber = id, "subscriber added");

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let cleanup_key = key.clone();
        let cleanup = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                deregister(&inner, &cleanup_key, id);
            }
        });

        Ok(SubscriberHandle {
            rx,
            cleanup: Some(cleanup),
        })
    }

    /// Read-only snapshot of one stream.
    pub fn get(&self, key: &StreamKey) -> Option<StreamSnapshot> {
        let streams = self.inner.streams.read().unwrap();
        streams.get(key).map(|e| snapshot(e))
    }

    /// Snapshots of every live stream.
    pub fn list_live(&self) -> Vec<StreamSnapshot> {
        let streams = self.inner.streams.read().unwrap();
        streams
            .values()
            .filter(|e| e.meta.read().unwrap().state == StreamState::Live)
            .map(|e| snapshot(e))
            .collect()
    }

    pub fn stream_count(&self) -> usize {
        self.inner.streams.read().unwrap().len()
    }

    fn entry(&self, key: &StreamKey) -> Result<Arc<StreamEntry>, RegistryError> {
        let streams = self.inner.streams.read().unwrap();
        streams
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownStream(key.clone()))
    }

    fn remove_if_defunct(&self, key: &StreamKey) {
        let mut streams = self.inner.streams.write().unwrap();
        let defunct = streams.get(key).is_some_and(|e| {
            e.meta.read().unwrap().state == StreamState::Stopped
                && e.subscribers.read().unwrap().is_empty()
        });
        if defunct {
            streams.remove(key);
            tracing::debug!(stream = %key, "stream entry removed");
        }
    }

    /// Roll the 10 s drop-rate window and warn when the sustained drop rate
    /// crosses the threshold.
    fn observe_drop_window(&self, entry: &StreamEntry, now_ms: u64) {
        let stats = &entry.stats;
        let started = stats.window_started_ms.load(Ordering::Relaxed);

        if started == 0 {
            stats
                .window_started_ms
                .compare_exchange(0, now_ms.max(1), Ordering::Relaxed, Ordering::Relaxed)
                .ok();
            return;
        }

        if now_ms.saturating_sub(started) < DROP_WINDOW_MS {
            return;
        }

        if stats
            .window_started_ms
            .compare_exchange(started, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let frames = stats.window_frames.swap(0, Ordering::Relaxed);
            let dropped = stats.window_dropped.swap(0, Ordering::Relaxed);
            let total = frames + dropped;
            if total > 0 && dropped * 100 > total * DROP_WARN_PERCENT {
                tracing::warn!(
                    stream = %entry.key,
                    dropped,
                    delivered = frames,
                    "sustained drop rate above {DROP_WARN_PERCENT}% over 10s window"
                );
            }
        }
    }
}

fn deregister(inner: &Inner, key: &StreamKey, id: u64) {
    let entry = {
        let streams = inner.streams.read().unwrap();
        match streams.get(key) {
            Some(e) => Arc::clone(e),
            None => return,
        }
    };

    {
        let mut subscribers = entry.subscribers.write().unwrap();
        subscribers.retain(|s| s.id != id);
    }
    tracing::debug!(stream = %key, subscriber = id, "subscriber removed");

    let defunct = entry.meta.read().unwrap().state == StreamState::Stopped
        && entry.subscribers.read().unwrap().is_empty();
    if defunct {
        inner.streams.write().unwrap().remove(key);
    }
}

fn reset_stats(stats: &StreamStats) {
    stats.bytes_received.store(0, Ordering::Relaxed);
    stats.frames_received.store(0, Ordering::Relaxed);
    stats.keyframes.store(0, Ordering::Relaxed);
    stats.frames_dropped.store(0, Ordering::Relaxed);
    stats.last_frame_ms.store(0, Ordering::Relaxed);
    stats.window_started_ms.store(0, Ordering::Relaxed);
    stats.window_frames.store(0, Ordering::Relaxed);
    stats.window_dropped.store(0, Ordering::Relaxed);
}

fn snapshot(entry: &StreamEntry) -> StreamSnapshot {
    let meta = entry.meta.read().unwrap();
    let viewers = entry.subscribers.read().unwrap().len();
    StreamSnapshot {
        key: entry.key.clone(),
        state: meta.state,
        publisher_addr: meta.publisher_addr,
        started_at: meta.started_at,
        uptime_secs: meta.started_instant.map(|t| t.elapsed().as_secs()),
        viewers,
        video_codec: meta.video_codec.clone(),
        audio_codec: meta.audio_codec.clone(),
        bytes_received: entry.stats.bytes(),
        frames_received: entry.stats.frames(),
        keyframes: entry.stats.keyframes.load(Ordering::Relaxed),
        frames_dropped: entry.stats.dropped(),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn key(s: &str) -> StreamKey {
        StreamKey::parse(s).unwrap()
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn video_frame(k: &StreamKey, pts: u32, keyframe: bool) -> MediaFrame {
        MediaFrame::video(k.clone(), pts, Bytes::from_static(&[0, 0, 0, 1, 0x65]), keyframe)
    }

    #[tokio::test]
    async fn test_create_rejects_second_publisher() {
        let registry = StreamRegistry::new(10);
        let k = key("live1");

        registry.create(&k, addr()).unwrap();
        let second = registry.create(&k, addr());
        assert!(matches!(second, Err(RegistryError::AlreadyLive(_))));

        // Still rejected once live
        registry.set_live(&k).unwrap();
        assert!(matches!(
            registry.create(&k, addr()),
            Err(RegistryError::AlreadyLive(_))
        ));
    }

    #[tokio::test]
    async fn test_stopped_stream_key_is_reusable() {
        let registry = StreamRegistry::new(10);
        let k = key("live1");

        registry.create(&k, addr()).unwrap();
        registry.set_live(&k).unwrap();
        registry.set_stopped(&k);

        // Entry was removed entirely; a new publisher may claim the key
        registry.create(&k, addr()).unwrap();
        registry.set_live(&k).unwrap();
    }

    #[tokio::test]
    async fn test_publish_order_preserved() {
        let registry = StreamRegistry::new(10);
        let k = key("live1");
        registry.create(&k, addr()).unwrap();
        let mut sub = registry.subscribe(&k, 16).unwrap();
        registry.set_live(&k).unwrap();

        for pts in [0u32, 33, 66, 99] {
            registry.publish_frame(video_frame(&k, pts, pts == 0)).unwrap();
        }

        for expected in [0u32, 33, 66, 99] {
            let frame = sub.recv().await.unwrap();
            assert_eq!(frame.pts, expected);
        }
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_and_counts() {
        let registry = StreamRegistry::new(10);
        let k = key("live1");
        registry.create(&k, addr()).unwrap();
        let _sub = registry.subscribe(&k, 2).unwrap();
        registry.set_live(&k).unwrap();

        // Buffer holds 2; the rest drop, publish keeps succeeding
        for pts in 0..5u32 {
            registry.publish_frame(video_frame(&k, pts, false)).unwrap();
        }

        let snap = registry.get(&k).unwrap();
        assert_eq!(snap.frames_received, 5);
        assert_eq!(snap.frames_dropped, 3);
    }

    #[tokio::test]
    async fn test_stop_closes_subscriber_channels() {
        let registry = StreamRegistry::new(10);
        let k = key("live1");
        registry.create(&k, addr()).unwrap();
        let mut sub = registry.subscribe(&k, 16).unwrap();
        registry.set_live(&k).unwrap();

        registry.publish_frame(video_frame(&k, 0, true)).unwrap();
        registry.set_stopped(&k);

        // Buffered frame still drains, then the channel reports closed
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let registry = StreamRegistry::new(10);
        let k = key("live1");
        registry.create(&k, addr()).unwrap();
        registry.set_live(&k).unwrap();

        registry.set_stopped(&k);
        registry.set_stopped(&k);
        registry.set_stopped(&key("never-existed"));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_stream() {
        let registry = StreamRegistry::new(10);
        let k = key("ghost");
        let err = registry.publish_frame(video_frame(&k, 0, false)).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownStream(_)));
    }

    #[tokio::test]
    async fn test_publish_to_connecting_stream_rejected() {
        let registry = StreamRegistry::new(10);
        let k = key("live1");
        registry.create(&k, addr()).unwrap();
        let err = registry.publish_frame(video_frame(&k, 0, false)).unwrap_err();
        assert!(matches!(err, RegistryError::NotLive(_)));
    }

    #[tokio::test]
    async fn test_subscriber_cleanup_removes_handle() {
        let registry = StreamRegistry::new(10);
        let k = key("live1");
        registry.create(&k, addr()).unwrap();
        registry.set_live(&k).unwrap();

        let sub = registry.subscribe(&k, 16).unwrap();
        assert_eq!(registry.get(&k).unwrap().viewers, 1);

        sub.cleanup();
        assert_eq!(registry.get(&k).unwrap().viewers, 0);
    }

    #[tokio::test]
    async fn test_dropping_handle_cleans_up() {
        let registry = StreamRegistry::new(10);
        let k = key("live1");
        registry.create(&k, addr()).unwrap();
        registry.set_live(&k).unwrap();

        {
            let _sub = registry.subscribe(&k, 16).unwrap();
            assert_eq!(registry.get(&k).unwrap().viewers, 1);
        }
        assert_eq!(registry.get(&k).unwrap().viewers, 0);
    }

    #[tokio::test]
    async fn test_viewer_limit() {
        let registry = StreamRegistry::new(2);
        let k = key("live1");
        registry.create(&k, addr()).unwrap();
        registry.set_live(&k).unwrap();

        let _a = registry.subscribe(&k, 4).unwrap();
        let _b = registry.subscribe(&k, 4).unwrap();
        assert!(matches!(
            registry.subscribe(&k, 4),
            Err(RegistryError::TooManyViewers(_))
        ));
    }

    #[tokio::test]
    async fn test_list_live_filters_states() {
        let registry = StreamRegistry::new(10);
        let a = key("a");
        let b = key("b");
        registry.create(&a, addr()).unwrap();
        registry.create(&b, addr()).unwrap();
        registry.set_live(&a).unwrap();

        let live = registry.list_live();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].key, a);
    }

    #[tokio::test]
    async fn test_codec_info_set_once_and_cleared_on_stop() {
        use crate::media::AvcConfig;

        let registry = StreamRegistry::new(10);
        let k = key("live1");
        registry.create(&k, addr()).unwrap();
        registry.set_live(&k).unwrap();

        let avc = AvcConfig::parse(Bytes::from_static(&[
            0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x04, 0x67, 0x64, 0x00, 0x1F, 0x01, 0x00,
            0x03, 0x68, 0xEF, 0x38,
        ]))
        .unwrap();

        registry
            .set_video_codec(
                &k,
                VideoCodecInfo {
                    avc: avc.clone(),
                    width: None,
                    height: None,
                    frame_rate: None,
                },
            )
            .unwrap();

        // Second set is ignored
        let mut other = avc.clone();
        other.profile = 66;
        registry
            .set_video_codec(
                &k,
                VideoCodecInfo {
                    avc: other,
                    width: None,
                    height: None,
                    frame_rate: None,
                },
            )
            .unwrap();

        let snap = registry.get(&k).unwrap();
        assert_eq!(snap.video_codec.as_ref().unwrap().avc.profile, 100);

        // Keep a subscriber so the entry survives the stop, then verify the
        // codec info was cleared
        let _sub = registry.subscribe(&k, 4).unwrap();
        registry.set_stopped(&k);
        let snap = registry.get(&k).unwrap();
        assert!(snap.video_codec.is_none());
    }
}

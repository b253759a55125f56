//! Stream registry and pub/sub fan-out
//!
//! The registry is the authoritative map of active streams. Publishers
//! (RTMP connections) push parsed frames in; subscribers (segmentation
//! workers) receive them over bounded per-subscriber channels. Sends never
//! block: a full subscriber channel drops the frame and bumps the stream's
//! dropped-frame counter, so a slow consumer can never stall ingest.
//!
//! ```text
//!                    Arc<StreamRegistry>
//!               ┌────────────────────────────┐
//!               │ streams: RwLock<HashMap<   │
//!               │   StreamKey, Arc<Entry> >> │
//!               │ Entry { state, stats,      │
//!               │         subscribers }      │
//!               └─────────────┬──────────────┘
//!                             │
//!        publish_frame ──────►│────► try_send ──► [segmenter]
//!                             │────► try_send ──► [future consumers]
//! ```

pub mod error;
pub mod frame;
pub mod store;
pub mod stream;

pub use error::RegistryError;
pub use frame::{CodecTag, FrameKind, MediaFrame, StreamKey};
pub use store::{StreamRegistry, SubscriberHandle};
pub use stream::{AudioCodecInfo, StreamSnapshot, StreamState, VideoCodecInfo};

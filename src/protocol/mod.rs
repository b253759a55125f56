//! RTMP wire protocol
//!
//! Server-side implementation of the pieces an ingest endpoint needs: the
//! plain (non-digest) handshake, chunk-stream framing with configurable
//! chunk sizes, and AMF0 command/control message codecs.

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;

pub use chunk::{ChunkReader, ChunkWriter, RawMessage};
pub use handshake::server_handshake;
pub use message::{ConnectParams, PublishParams, RtmpMessage};

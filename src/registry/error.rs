//! Registry error types

use thiserror::Error;

use super::frame::StreamKey;

/// Error type for registry operations
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("unknown stream: {0}")]
    UnknownStream(StreamKey),

    #[error("stream already live: {0}")]
    AlreadyLive(StreamKey),

    #[error("stream not live: {0}")]
    NotLive(StreamKey),

    #[error("viewer limit reached for stream: {0}")]
    TooManyViewers(StreamKey),

    #[error("invalid stream key: {0:?}")]
    InvalidKey(String),
}

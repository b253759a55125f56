//! Crate-wide error types
//!
//! Each subsystem defines its own error enum; the crate-level [`Error`]
//! aggregates them so `?` works across layer boundaries. Frame-level media
//! errors are recoverable (the frame is dropped and counted); protocol and
//! auth errors are fatal to the connection that raised them, never to the
//! server.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("media: {0}")]
    Media(#[from] MediaError),

    #[error("amf: {0}")]
    Amf(#[from] AmfError),

    #[error("registry: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    #[error("mux: {0}")]
    Mux(#[from] MuxError),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Publish-token validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unknown token")]
    UnknownToken,

    #[error("token expired")]
    Expired,

    #[error("token already used")]
    AlreadyUsed,

    #[error("token bound to a different stream")]
    WrongStream,

    #[error("token bound to a different publisher address")]
    WrongPublisher,

    #[error("publish token required")]
    TokenRequired,

    #[error("secure token generation unavailable")]
    TokenGeneration,
}

/// RTMP wire-protocol failures, fatal to the connection
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported RTMP version {0}")]
    UnsupportedVersion(u8),

    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    #[error("malformed chunk header: {0}")]
    MalformedChunk(&'static str),

    #[error("chunk size {0} out of range")]
    ChunkSizeOutOfRange(u32),

    #[error("message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),

    #[error("unexpected command {0:?}")]
    UnexpectedCommand(String),

    #[error("publish rejected: {0}")]
    PublishRejected(String),

    #[error("connection closed by peer")]
    ConnectionClosed,
}

/// Codec-layer failures
///
/// Frame-level variants (`TruncatedNalu`, `EmptyFrame`) drop only the frame
/// in question; `UnsupportedCodec` and `MalformedConfig` end the publishing
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("unsupported video codec id {0}")]
    UnsupportedCodec(u8),

    #[error("malformed AVC decoder configuration")]
    MalformedConfig,

    #[error("invalid NAL length size {0}")]
    InvalidNalLengthSize(u8),

    #[error("NAL unit length overruns buffer")]
    TruncatedNalu,

    #[error("tag carries no payload")]
    EmptyFrame,

    #[error("invalid AVC packet type {0}")]
    InvalidPacketType(u8),
}

/// AMF0 decode/encode failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AmfError {
    #[error("unexpected end of AMF data")]
    UnexpectedEof,

    #[error("unknown AMF0 marker 0x{0:02x}")]
    UnknownMarker(u8),

    #[error("invalid UTF-8 in AMF string")]
    InvalidUtf8,

    #[error("malformed object terminator")]
    InvalidObjectEnd,

    #[error("nesting deeper than supported")]
    NestingTooDeep,
}

/// Muxer failures; the affected segment is discarded
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("no frames to mux")]
    NoFrames,

    #[error("no codec configuration available")]
    MissingConfig,

    #[error("frame list contains no video slices")]
    NoVideoSamples,
}

/// Storage backend failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_display() {
        assert_eq!(AuthError::AlreadyUsed.to_string(), "token already used");
        assert_eq!(AuthError::Expired.to_string(), "token expired");
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = MediaError::TruncatedNalu.into();
        assert!(matches!(err, Error::Media(MediaError::TruncatedNalu)));
    }
}

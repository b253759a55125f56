//! Stream identity and the frame type flowing through fan-out

use bytes::Bytes;

use super::error::RegistryError;

/// Validated stream key
///
/// Opaque printable bytes; `?` and `/` are excluded because the key appears
/// both in RTMP publishing names (where `?` starts the token query) and in
/// HTTP paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey(String);

impl StreamKey {
    /// Validate and wrap a raw key.
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        if raw.is_empty() || raw.len() > 256 {
            return Err(RegistryError::InvalidKey(raw.to_string()));
        }
        let ok = raw
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b'?' && b != b'/');
        if !ok {
            return Err(RegistryError::InvalidKey(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Media kind of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Video,
    Audio,
}

/// Codec carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecTag {
    H264,
    Aac,
}

impl CodecTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecTag::H264 => "h264",
            CodecTag::Aac => "aac",
        }
    }
}

/// A single parsed media frame
///
/// Video payloads are Annex-B after bitstream repair; IDR frames carry a
/// leading SPS+PPS pair. Cloning is cheap: the payload is reference-counted.
/// Frames are immutable once published.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub stream_key: StreamKey,
    pub kind: FrameKind,
    /// Presentation timestamp in milliseconds, source domain (u32 wrapping)
    pub pts: u32,
    pub payload: Bytes,
    /// IDR flag; always false for audio
    pub is_keyframe: bool,
    pub codec: CodecTag,
}

impl MediaFrame {
    pub fn video(stream_key: StreamKey, pts: u32, payload: Bytes, is_keyframe: bool) -> Self {
        Self {
            stream_key,
            kind: FrameKind::Video,
            pts,
            payload,
            is_keyframe,
            codec: CodecTag::H264,
        }
    }

    pub fn audio(stream_key: StreamKey, pts: u32, payload: Bytes) -> Self {
        Self {
            stream_key,
            kind: FrameKind::Audio,
            pts,
            payload,
            is_keyframe: false,
            codec: CodecTag::Aac,
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind == FrameKind::Video
    }
}

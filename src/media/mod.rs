//! Media parsing: FLV tag layer and codec bitstreams
//!
//! Everything in this module is a pure function over byte buffers; no I/O.
//! The RTMP layer hands in raw message payloads, the registry receives
//! repaired Annex-B video frames and raw AAC audio frames.

pub mod aac;
pub mod flv;
pub mod h264;

pub use aac::AacConfig;
pub use flv::{AudioTag, AvcPacketType, VideoFrameType, VideoTag};
pub use h264::{
    annex_b_with_parameter_sets, avcc_to_annex_b, split_annex_b, AvcConfig, NalUnitType,
};

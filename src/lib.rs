//! streamgate: live video ingest and delivery
//!
//! Publishers push H.264/AAC over RTMP; viewers pull HLS playlists and fMP4
//! segments over HTTP. The pipeline:
//!
//! ```text
//! RTMP conn → FLV/AVC parser → registry fan-out → segmenter → muxer → storage
//!                                                      │
//! HTTP /live/{key}/index.m3u8  ◄── playlist snapshot ──┘
//! HTTP /live/{key}/segment_N.m4s ◄── storage
//! ```
//!
//! Publishers are admitted with short-lived single-use tokens minted by the
//! control API. The ingest path never blocks on slow consumers: subscriber
//! channels are bounded and drops are counted against the stream.

pub mod amf;
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod hls;
pub mod media;
pub mod mux;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};

//! Container muxing
//!
//! The segmenter treats muxing as a pure function: an ordered Annex-B frame
//! list in, container bytes out, with frame order preserved. The fMP4
//! implementation builds CMAF-style output in process — an init segment
//! (`ftyp` + `moov`, with SPS/PPS in `avcC`) and media segments
//! (`styp` + `moof` + `mdat`).

pub mod fmp4;

pub use fmp4::Fmp4Muxer;

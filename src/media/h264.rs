//! H.264/AVC bitstream handling
//!
//! RTMP delivers H.264 in AVCC packaging: NAL units prefixed with a
//! fixed-size big-endian length, with SPS/PPS delivered out-of-band in an
//! AVCDecoderConfigurationRecord. HLS segments need Annex-B packaging with
//! parameter sets in-band at every random-access point, so this module owns
//! the repair pipeline: config parsing, AVCC→Annex-B conversion, and SPS/PPS
//! injection ahead of IDR frames.
//!
//! AVCDecoderConfigurationRecord layout:
//! ```text
//! configurationVersion (1) | AVCProfileIndication (1) | profile_compatibility (1)
//! | AVCLevelIndication (1) | 0b111111xx lengthSizeMinusOne (2 low bits)
//! | 0b111xxxxx numSPS (5 low bits) | { u16 spsLength | spsNALUnit }*
//! | numPPS (1) | { u16 ppsLength | ppsNALUnit }*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MediaError;

/// 4-byte Annex-B start code, used for every emitted NAL unit
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit types that matter to the segmentation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IDR slice
    Slice = 1,
    /// IDR slice (random-access point)
    Idr = 5,
    /// Supplemental enhancement information
    Sei = 6,
    /// Sequence parameter set
    Sps = 7,
    /// Picture parameter set
    Pps = 8,
    /// Access unit delimiter
    Aud = 9,
}

impl NalUnitType {
    pub fn from_header(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NalUnitType::Slice),
            5 => Some(NalUnitType::Idr),
            6 => Some(NalUnitType::Sei),
            7 => Some(NalUnitType::Sps),
            8 => Some(NalUnitType::Pps),
            9 => Some(NalUnitType::Aud),
            _ => None,
        }
    }

    pub fn is_slice(&self) -> bool {
        matches!(self, NalUnitType::Slice | NalUnitType::Idr)
    }
}

/// Parsed AVCDecoderConfigurationRecord
#[derive(Debug, Clone)]
pub struct AvcConfig {
    /// AVC profile indication (66 = Baseline, 77 = Main, 100 = High)
    pub profile: u8,
    /// Profile compatibility flags
    pub compatibility: u8,
    /// AVC level indication (31 = level 3.1)
    pub level: u8,
    /// Length of the AVCC NAL length prefix: 1, 2, or 4 bytes
    pub nal_length_size: u8,
    /// Sequence parameter sets, each without a start code
    pub sps: Vec<Bytes>,
    /// Picture parameter sets, each without a start code
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    /// Parse the record carried in an AVC sequence-header tag.
    pub fn parse(data: Bytes) -> Result<Self, MediaError> {
        let mut data = data;
        if data.len() < 7 {
            return Err(MediaError::MalformedConfig);
        }

        let version = data.get_u8();
        if version != 1 {
            return Err(MediaError::MalformedConfig);
        }

        let profile = data.get_u8();
        let compatibility = data.get_u8();
        let level = data.get_u8();

        let nal_length_size = (data.get_u8() & 0x03) + 1;
        if !matches!(nal_length_size, 1 | 2 | 4) {
            return Err(MediaError::InvalidNalLengthSize(nal_length_size));
        }

        let num_sps = (data.get_u8() & 0x1F) as usize;
        let mut sps = Vec::with_capacity(num_sps);
        for _ in 0..num_sps {
            sps.push(read_parameter_set(&mut data)?);
        }

        if data.is_empty() {
            return Err(MediaError::MalformedConfig);
        }
        let num_pps = data.get_u8() as usize;
        let mut pps = Vec::with_capacity(num_pps);
        for _ in 0..num_pps {
            pps.push(read_parameter_set(&mut data)?);
        }

        Ok(Self {
            profile,
            compatibility,
            level,
            nal_length_size,
            sps,
            pps,
        })
    }

    /// Human-readable profile name, used in logs and the streams API
    pub fn profile_name(&self) -> &'static str {
        match self.profile {
            66 => "Baseline",
            77 => "Main",
            88 => "Extended",
            100 => "High",
            110 => "High 10",
            122 => "High 4:2:2",
            244 => "High 4:4:4",
            _ => "Unknown",
        }
    }

    /// Level as "major.minor" (31 → "3.1")
    pub fn level_string(&self) -> String {
        format!("{}.{}", self.level / 10, self.level % 10)
    }
}

fn read_parameter_set(data: &mut Bytes) -> Result<Bytes, MediaError> {
    if data.len() < 2 {
        return Err(MediaError::MalformedConfig);
    }
    let len = data.get_u16() as usize;
    if data.len() < len {
        return Err(MediaError::MalformedConfig);
    }
    Ok(data.copy_to_bytes(len))
}

/// Convert an AVCC NAL unit sequence to Annex-B.
///
/// Each NAL unit is prefixed with a 4-byte start code. Zero-length NAL units
/// are skipped; a declared length that overruns the buffer fails the whole
/// frame with [`MediaError::TruncatedNalu`].
pub fn avcc_to_annex_b(data: &[u8], nal_length_size: u8) -> Result<Bytes, MediaError> {
    let prefix = nal_length_size as usize;
    let mut out = BytesMut::with_capacity(data.len() + 16);
    let mut offset = 0;
    let mut nal_count = 0usize;

    while offset < data.len() {
        if offset + prefix > data.len() {
            return Err(MediaError::TruncatedNalu);
        }

        let mut len = 0usize;
        for &b in &data[offset..offset + prefix] {
            len = (len << 8) | b as usize;
        }
        offset += prefix;

        if len == 0 {
            continue;
        }
        if offset + len > data.len() {
            return Err(MediaError::TruncatedNalu);
        }

        out.put_slice(&START_CODE);
        out.put_slice(&data[offset..offset + len]);
        offset += len;
        nal_count += 1;
    }

    if nal_count == 0 {
        return Err(MediaError::EmptyFrame);
    }

    Ok(out.freeze())
}

/// Prepend SPS and PPS (each with a 4-byte start code) to an Annex-B frame.
///
/// Applied to IDR frames so every segment opens with a self-contained
/// random-access unit.
pub fn annex_b_with_parameter_sets(config: &AvcConfig, frame: &[u8]) -> Bytes {
    let overhead: usize = config
        .sps
        .iter()
        .chain(config.pps.iter())
        .map(|ps| START_CODE.len() + ps.len())
        .sum();

    let mut out = BytesMut::with_capacity(overhead + frame.len());
    for sps in &config.sps {
        out.put_slice(&START_CODE);
        out.put_slice(sps);
    }
    for pps in &config.pps {
        out.put_slice(&START_CODE);
        out.put_slice(pps);
    }
    out.put_slice(frame);
    out.freeze()
}

/// Split an Annex-B stream into NAL units, handling 3- and 4-byte start codes.
///
/// Used by the muxer to re-package slices and by tests asserting segment
/// random-access structure.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                starts.push((i, i + 3));
                i += 3;
                continue;
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push((i, i + 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &(_, begin)) in starts.iter().enumerate() {
        let end = starts
            .get(idx + 1)
            .map(|&(code_start, _)| code_start)
            .unwrap_or(data.len());
        if begin < end {
            nals.push(&data[begin..end]);
        }
    }
    nals
}

//! Fragmented-MP4 (CMAF) box writer
//!
//! Output structure:
//!
//! ```text
//! Init segment:   ftyp | moov ( mvhd trak(tkhd mdia(mdhd hdlr minf(vmhd
//!                 dinf stbl(stsd(avc1(avcC)) stts stsc stsz stco)))) mvex(trex) )
//! Media segment:  styp | moof ( mfhd traf(tfhd tfdt trun) ) | mdat
//! ```
//!
//! Sample data in `mdat` is AVCC (4-byte length prefixes) holding only slice
//! NAL units; parameter sets live in the init segment's `avcC` box. DTS is
//! taken equal to PTS — composition offsets were already folded in upstream
//! and the ingest path does not reorder.

use bytes::Bytes;

use crate::error::MuxError;
use crate::media::h264::{split_annex_b, NalUnitType};
use crate::media::AvcConfig;
use crate::registry::MediaFrame;

/// Movie and media timescale (90 kHz, millisecond PTS scales by 90)
const TIMESCALE: u32 = 90_000;

/// Ticks per millisecond at [`TIMESCALE`]
const TICKS_PER_MS: u64 = TIMESCALE as u64 / 1000;

const TRACK_ID: u32 = 1;

/// Sample flags: sync sample, depends on nothing
const FLAGS_SYNC: u32 = 0x0200_0000;
/// Sample flags: non-sync, depends on another sample
const FLAGS_NON_SYNC: u32 = 0x0101_0000;

/// In-process fMP4 muxer
#[derive(Debug, Clone, Default)]
pub struct Fmp4Muxer;

struct Sample {
    data: Vec<u8>,
    duration_ticks: u32,
    is_sync: bool,
}

impl Fmp4Muxer {
    pub fn new() -> Self {
        Self
    }

    /// Build the initialization segment from codec configuration.
    ///
    /// `init_frame` is the Annex-B keyframe that opens the first segment; it
    /// supplies SPS/PPS when the configuration record carries none.
    pub fn init_segment(
        &self,
        config: &AvcConfig,
        init_frame: &[u8],
        dimensions: Option<(u32, u32)>,
    ) -> Result<Bytes, MuxError> {
        let (sps, pps) = parameter_sets(config, init_frame)?;
        let (width, height) = dimensions.unwrap_or((0, 0));

        let mut out = Vec::with_capacity(1024);
        write_ftyp(&mut out);
        boxed(&mut out, b"moov", |moov| {
            write_mvhd(moov);
            boxed(moov, b"trak", |trak| {
                write_tkhd(trak, width, height);
                boxed(trak, b"mdia", |mdia| {
                    write_mdhd(mdia);
                    write_hdlr(mdia);
                    boxed(mdia, b"minf", |minf| {
                        write_vmhd(minf);
                        write_dinf(minf);
                        boxed(minf, b"stbl", |stbl| {
                            write_stsd(stbl, config, &sps, &pps, width, height);
                            for fourcc in [b"stts", b"stsc", b"stco"] {
                                write_empty_table(stbl, fourcc);
                            }
                            write_empty_stsz(stbl);
                        });
                    });
                });
            });
            boxed(moov, b"mvex", write_trex);
        });

        Ok(Bytes::from(out))
    }

    /// Build one media segment from an ordered Annex-B frame list.
    ///
    /// Frame order is preserved; per-sample durations come from PTS deltas
    /// with `frame_rate_hint` covering the final sample and any non-monotonic
    /// gaps.
    pub fn media_segment(
        &self,
        sequence_number: u32,
        frames: &[MediaFrame],
        frame_rate_hint: f64,
    ) -> Result<Bytes, MuxError> {
        if frames.is_empty() {
            return Err(MuxError::NoFrames);
        }

        let default_ms = if frame_rate_hint > 0.0 {
            (1000.0 / frame_rate_hint).round() as u64
        } else {
            33
        };

        let mut samples = Vec::with_capacity(frames.len());
        for (idx, frame) in frames.iter().enumerate() {
            let data = slices_to_avcc(&frame.payload);
            if data.is_empty() {
                continue;
            }

            let duration_ms = frames
                .get(idx + 1)
                .map(|next| next.pts.wrapping_sub(frame.pts) as u64)
                .filter(|&d| d > 0 && d < 10_000)
                .unwrap_or(default_ms);

            samples.push(Sample {
                data,
                duration_ticks: (duration_ms * TICKS_PER_MS) as u32,
                is_sync: frame.is_keyframe,
            });
        }

        if samples.is_empty() {
            return Err(MuxError::NoVideoSamples);
        }

        let base_dts = frames[0].pts as u64 * TICKS_PER_MS;

        let mut out = Vec::with_capacity(
            samples.iter().map(|s| s.data.len()).sum::<usize>() + 512,
        );
        write_styp(&mut out);

        let moof_start = out.len();
        let mut data_offset_pos = 0usize;
        boxed(&mut out, b"moof", |moof| {
            boxed(moof, b"mfhd", |b| {
                b.extend_from_slice(&[0, 0, 0, 0]);
                b.extend_from_slice(&sequence_number.to_be_bytes());
            });
            boxed(moof, b"traf", |traf| {
                boxed(traf, b"tfhd", |b| {
                    // default-base-is-moof
                    b.extend_from_slice(&[0, 0x02, 0x00, 0x00]);
                    b.extend_from_slice(&TRACK_ID.to_be_bytes());
                });
                boxed(traf, b"tfdt", |b| {
                    b.push(1); // 64-bit decode time
                    b.extend_from_slice(&[0, 0, 0]);
                    b.extend_from_slice(&base_dts.to_be_bytes());
                });
                // boxed() writes in place, so this position is absolute
                data_offset_pos = write_trun(traf, &samples);
            });
        });

        // data_offset: from the start of moof to the first mdat payload byte
        let moof_len = out.len() - moof_start;
        let data_offset = (moof_len + 8) as u32;
        out[data_offset_pos..data_offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());

        boxed(&mut out, b"mdat", |mdat| {
            for sample in &samples {
                mdat.extend_from_slice(&sample.data);
            }
        });

        Ok(Bytes::from(out))
    }
}

/// Extract SPS/PPS lists from the config, falling back to the init frame.
fn parameter_sets(
    config: &AvcConfig,
    init_frame: &[u8],
) -> Result<(Vec<Bytes>, Vec<Bytes>), MuxError> {
    if !config.sps.is_empty() && !config.pps.is_empty() {
        return Ok((config.sps.clone(), config.pps.clone()));
    }

    let mut sps = Vec::new();
    let mut pps = Vec::new();
    for nal in split_annex_b(init_frame) {
        match NalUnitType::from_header(nal[0]) {
            Some(NalUnitType::Sps) => sps.push(Bytes::copy_from_slice(nal)),
            Some(NalUnitType::Pps) => pps.push(Bytes::copy_from_slice(nal)),
            _ => {}
        }
    }

    if sps.is_empty() || pps.is_empty() {
        return Err(MuxError::MissingConfig);
    }
    Ok((sps, pps))
}

/// Re-package an Annex-B frame's slice NALs as length-prefixed sample data.
fn slices_to_avcc(annex_b: &[u8]) -> Vec<u8> {
    let nals = split_annex_b(annex_b);
    let mut out = Vec::with_capacity(annex_b.len());
    for nal in nals {
        let keep = NalUnitType::from_header(nal[0])
            .map(|t| t.is_slice())
            .unwrap_or(false);
        if keep {
            out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            out.extend_from_slice(nal);
        }
    }
    out
}

/// Write a box: 4-byte size placeholder, fourcc, body, then backfill size.
/// Returns nothing; positions inside the closure are relative to `buf`.
fn boxed(buf: &mut Vec<u8>, fourcc: &[u8; 4], body: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.extend_from_slice(&[0, 0, 0, 0]);
    buf.extend_from_slice(fourcc);
    body(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn write_ftyp(buf: &mut Vec<u8>) {
    boxed(buf, b"ftyp", |b| {
        b.extend_from_slice(b"isom"); // major brand
        b.extend_from_slice(&0u32.to_be_bytes());
        for brand in [b"isom", b"iso6", b"cmfc", b"cmfv", b"avc1", b"mp41"] {
            b.extend_from_slice(brand);
        }
    });
}

fn write_styp(buf: &mut Vec<u8>) {
    boxed(buf, b"styp", |b| {
        b.extend_from_slice(b"cmfv");
        b.extend_from_slice(&0u32.to_be_bytes());
        for brand in [b"msdh", b"msix", b"cmfc", b"cmfv"] {
            b.extend_from_slice(brand);
        }
    });
}

const IDENTITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

fn write_mvhd(buf: &mut Vec<u8>) {
    boxed(buf, b"mvhd", |b| {
        b.extend_from_slice(&[0, 0, 0, 0]); // version + flags
        b.extend_from_slice(&0u32.to_be_bytes()); // creation time
        b.extend_from_slice(&0u32.to_be_bytes()); // modification time
        b.extend_from_slice(&TIMESCALE.to_be_bytes());
        b.extend_from_slice(&0u32.to_be_bytes()); // duration unknown (live)
        b.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
        b.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
        b.extend_from_slice(&[0; 10]); // reserved
        for m in IDENTITY_MATRIX {
            b.extend_from_slice(&m.to_be_bytes());
        }
        b.extend_from_slice(&[0; 24]); // pre_defined
        b.extend_from_slice(&(TRACK_ID + 1).to_be_bytes()); // next track id
    });
}

fn write_tkhd(buf: &mut Vec<u8>, width: u32, height: u32) {
    boxed(buf, b"tkhd", |b| {
        b.extend_from_slice(&[0, 0, 0, 3]); // enabled + in movie
        b.extend_from_slice(&0u32.to_be_bytes());
        b.extend_from_slice(&0u32.to_be_bytes());
        b.extend_from_slice(&TRACK_ID.to_be_bytes());
        b.extend_from_slice(&0u32.to_be_bytes()); // reserved
        b.extend_from_slice(&0u32.to_be_bytes()); // duration
        b.extend_from_slice(&[0; 8]); // reserved
        b.extend_from_slice(&0u16.to_be_bytes()); // layer
        b.extend_from_slice(&0u16.to_be_bytes()); // alternate group
        b.extend_from_slice(&0u16.to_be_bytes()); // volume (video)
        b.extend_from_slice(&0u16.to_be_bytes()); // reserved
        for m in IDENTITY_MATRIX {
            b.extend_from_slice(&m.to_be_bytes());
        }
        b.extend_from_slice(&(width << 16).to_be_bytes()); // 16.16 fixed
        b.extend_from_slice(&(height << 16).to_be_bytes());
    });
}

fn write_mdhd(buf: &mut Vec<u8>) {
    boxed(buf, b"mdhd", |b| {
        b.extend_from_slice(&[0, 0, 0, 0]);
        b.extend_from_slice(&0u32.to_be_bytes());
        b.extend_from_slice(&0u32.to_be_bytes());
        b.extend_from_slice(&TIMESCALE.to_be_bytes());
        b.extend_from_slice(&0u32.to_be_bytes());
        b.extend_from_slice(&0x55C4u16.to_be_bytes()); // language "und"
        b.extend_from_slice(&0u16.to_be_bytes());
    });
}

fn write_hdlr(buf: &mut Vec<u8>) {
    boxed(buf, b"hdlr", |b| {
        b.extend_from_slice(&[0, 0, 0, 0]);
        b.extend_from_slice(&0u32.to_be_bytes());
        b.extend_from_slice(b"vide");
        b.extend_from_slice(&[0; 12]);
        b.extend_from_slice(b"VideoHandler\0");
    });
}

fn write_vmhd(buf: &mut Vec<u8>) {
    boxed(buf, b"vmhd", |b| {
        b.extend_from_slice(&[0, 0, 0, 1]);
        b.extend_from_slice(&[0; 8]); // graphics mode + opcolor
    });
}

fn write_dinf(buf: &mut Vec<u8>) {
    boxed(buf, b"dinf", |dinf| {
        boxed(dinf, b"dref", |b| {
            b.extend_from_slice(&[0, 0, 0, 0]);
            b.extend_from_slice(&1u32.to_be_bytes()); // entry count
            boxed(b, b"url ", |u| {
                u.extend_from_slice(&[0, 0, 0, 1]); // self-contained
            });
        });
    });
}

fn write_stsd(
    buf: &mut Vec<u8>,
    config: &AvcConfig,
    sps: &[Bytes],
    pps: &[Bytes],
    width: u32,
    height: u32,
) {
    boxed(buf, b"stsd", |stsd| {
        stsd.extend_from_slice(&[0, 0, 0, 0]);
        stsd.extend_from_slice(&1u32.to_be_bytes()); // entry count
        boxed(stsd, b"avc1", |avc1| {
            avc1.extend_from_slice(&[0; 6]); // reserved
            avc1.extend_from_slice(&1u16.to_be_bytes()); // data ref index
            avc1.extend_from_slice(&[0; 16]); // pre_defined + reserved
            avc1.extend_from_slice(&(width as u16).to_be_bytes());
            avc1.extend_from_slice(&(height as u16).to_be_bytes());
            avc1.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi
            avc1.extend_from_slice(&0x0048_0000u32.to_be_bytes());
            avc1.extend_from_slice(&0u32.to_be_bytes()); // reserved
            avc1.extend_from_slice(&1u16.to_be_bytes()); // frame count
            avc1.extend_from_slice(&[0; 32]); // compressor name
            avc1.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
            avc1.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined
            boxed(avc1, b"avcC", |b| {
                b.push(1); // configuration version
                b.push(config.profile);
                b.push(config.compatibility);
                b.push(config.level);
                b.push(0xFC | 0x03); // reserved | length_size_minus_one = 3
                b.push(0xE0 | (sps.len() as u8 & 0x1F));
                for s in sps {
                    b.extend_from_slice(&(s.len() as u16).to_be_bytes());
                    b.extend_from_slice(s);
                }
                b.push(pps.len() as u8);
                for p in pps {
                    b.extend_from_slice(&(p.len() as u16).to_be_bytes());
                    b.extend_from_slice(p);
                }
            });
        });
    });
}

fn write_empty_table(buf: &mut Vec<u8>, fourcc: &[u8; 4]) {
    boxed(buf, fourcc, |b| {
        b.extend_from_slice(&[0, 0, 0, 0]);
        b.extend_from_slice(&0u32.to_be_bytes()); // entry count
    });
}

fn write_empty_stsz(buf: &mut Vec<u8>) {
    boxed(buf, b"stsz", |b| {
        b.extend_from_slice(&[0, 0, 0, 0]);
        b.extend_from_slice(&0u32.to_be_bytes()); // sample size
        b.extend_from_slice(&0u32.to_be_bytes()); // sample count
    });
}

fn write_trex(buf: &mut Vec<u8>) {
    boxed(buf, b"trex", |b| {
        b.extend_from_slice(&[0, 0, 0, 0]);
        b.extend_from_slice(&TRACK_ID.to_be_bytes());
        b.extend_from_slice(&1u32.to_be_bytes()); // default sample description
        b.extend_from_slice(&0u32.to_be_bytes()); // default duration
        b.extend_from_slice(&0u32.to_be_bytes()); // default size
        b.extend_from_slice(&0u32.to_be_bytes()); // default flags
    });
}

/// Write the trun box; returns the byte position of the data_offset field
/// (relative to `buf`) so the caller can patch it once moof size is known.
fn write_trun(buf: &mut Vec<u8>, samples: &[Sample]) -> usize {
    let mut pos = 0usize;
    boxed(buf, b"trun", |b| {
        b.push(0);
        // data-offset + duration + size + flags per sample
        b.extend_from_slice(&[0x00, 0x07, 0x01]);
        b.extend_from_slice(&(samples.len() as u32).to_be_bytes());
        pos = b.len();
        b.extend_from_slice(&0u32.to_be_bytes()); // data_offset placeholder

        for sample in samples {
            b.extend_from_slice(&sample.duration_ticks.to_be_bytes());
            b.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
            let flags = if sample.is_sync { FLAGS_SYNC } else { FLAGS_NON_SYNC };
            b.extend_from_slice(&flags.to_be_bytes());
        }
    });
    pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StreamKey;

    const CONFIG: &[u8] = &[
        0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x04, 0x67, 0x64, 0x00, 0x1F, 0x01, 0x00,
        0x03, 0x68, 0xEF, 0x38,
    ];

    fn config() -> AvcConfig {
        AvcConfig::parse(Bytes::from_static(CONFIG)).unwrap()
    }

    fn key() -> StreamKey {
        StreamKey::parse("live1").unwrap()
    }

    fn idr_frame(pts: u32) -> MediaFrame {
        // SPS + PPS + IDR, as produced by parameter-set injection
        let payload: &[u8] = &[
            0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1F, //
            0, 0, 0, 1, 0x68, 0xEF, 0x38, //
            0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00,
        ];
        MediaFrame::video(key(), pts, Bytes::copy_from_slice(payload), true)
    }

    fn inter_frame(pts: u32) -> MediaFrame {
        let payload: &[u8] = &[0, 0, 0, 1, 0x41, 0x9A, 0x00];
        MediaFrame::video(key(), pts, Bytes::copy_from_slice(payload), false)
    }

    /// Walk top-level boxes, returning (fourcc, payload range) pairs.
    fn walk(data: &[u8]) -> Vec<(String, usize, usize)> {
        let mut boxes = Vec::new();
        let mut offset = 0;
        while offset + 8 <= data.len() {
            let size =
                u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
                    as usize;
            let fourcc = String::from_utf8_lossy(&data[offset + 4..offset + 8]).into_owned();
            assert!(size >= 8 && offset + size <= data.len(), "bad box size");
            boxes.push((fourcc, offset, size));
            offset += size;
        }
        assert_eq!(offset, data.len(), "trailing bytes after last box");
        boxes
    }

    #[test]
    fn test_init_segment_is_ftyp_then_moov() {
        let muxer = Fmp4Muxer::new();
        let init = muxer
            .init_segment(&config(), &[], Some((1280, 720)))
            .unwrap();

        let boxes = walk(&init);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].0, "ftyp");
        assert_eq!(boxes[1].0, "moov");
    }

    #[test]
    fn test_init_segment_embeds_parameter_sets() {
        let muxer = Fmp4Muxer::new();
        let init = muxer.init_segment(&config(), &[], None).unwrap();

        // The avcC payload carries the SPS and PPS bodies verbatim
        let sps: &[u8] = &[0x67, 0x64, 0x00, 0x1F];
        let pps: &[u8] = &[0x68, 0xEF, 0x38];
        assert!(init.windows(sps.len()).any(|w| w == sps));
        assert!(init.windows(pps.len()).any(|w| w == pps));
    }

    #[test]
    fn test_init_falls_back_to_frame_parameter_sets() {
        let muxer = Fmp4Muxer::new();
        let bare = AvcConfig {
            profile: 100,
            compatibility: 0,
            level: 31,
            nal_length_size: 4,
            sps: vec![],
            pps: vec![],
        };
        let frame = idr_frame(0);
        let init = muxer.init_segment(&bare, &frame.payload, None).unwrap();
        assert!(!init.is_empty());

        // With neither source available the muxer refuses
        let err = muxer.init_segment(&bare, &[], None).unwrap_err();
        assert!(matches!(err, MuxError::MissingConfig));
    }

    #[test]
    fn test_media_segment_structure() {
        let muxer = Fmp4Muxer::new();
        let frames = vec![idr_frame(0), inter_frame(33), inter_frame(66)];
        let segment = muxer.media_segment(1, &frames, 30.0).unwrap();

        let boxes = walk(&segment);
        let names: Vec<&str> = boxes.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(names, vec!["styp", "moof", "mdat"]);
    }

    #[test]
    fn test_media_segment_data_offset_points_into_mdat() {
        let muxer = Fmp4Muxer::new();
        let frames = vec![idr_frame(0), inter_frame(33)];
        let segment = muxer.media_segment(1, &frames, 30.0).unwrap();

        let boxes = walk(&segment);
        let (_, moof_start, _) = boxes[1];

        // data_offset lives 8 bytes into the trun sample table header; find
        // it by scanning for the trun fourcc
        let trun_pos = segment
            .windows(4)
            .position(|w| w == b"trun")
            .unwrap();
        let data_offset = u32::from_be_bytes([
            segment[trun_pos + 12],
            segment[trun_pos + 13],
            segment[trun_pos + 14],
            segment[trun_pos + 15],
        ]) as usize;

        // First payload byte: 4-byte length prefix of the IDR NAL
        let first = &segment[moof_start + data_offset..moof_start + data_offset + 8];
        assert_eq!(&first[..4], &4u32.to_be_bytes()); // IDR body is 4 bytes
        assert_eq!(first[4], 0x65);
    }

    #[test]
    fn test_media_segment_strips_parameter_sets_from_samples() {
        let muxer = Fmp4Muxer::new();
        let frames = vec![idr_frame(0)];
        let segment = muxer.media_segment(0, &frames, 30.0).unwrap();

        let boxes = walk(&segment);
        let (_, mdat_start, mdat_size) = boxes[2];
        let payload = &segment[mdat_start + 8..mdat_start + mdat_size];

        // Only the IDR slice survives as a sample
        assert_eq!(&payload[..4], &4u32.to_be_bytes());
        assert_eq!(payload[4], 0x65);
        assert_eq!(payload.len(), 8);
    }

    #[test]
    fn test_media_segment_preserves_frame_order() {
        let muxer = Fmp4Muxer::new();
        let mut frames = vec![idr_frame(0)];
        for i in 1..5u32 {
            let payload = vec![0, 0, 0, 1, 0x41, i as u8];
            frames.push(MediaFrame::video(key(), i * 33, Bytes::from(payload), false));
        }
        let segment = muxer.media_segment(2, &frames, 30.0).unwrap();

        let boxes = walk(&segment);
        let (_, mdat_start, mdat_size) = boxes[2];
        let mut payload = &segment[mdat_start + 8..mdat_start + mdat_size];

        // First the IDR, then inter frames tagged 1..=4 in order
        let mut markers = Vec::new();
        while payload.len() >= 4 {
            let len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
            markers.push(payload[4 + len - 1]);
            payload = &payload[4 + len..];
        }
        assert_eq!(markers.len(), 5);
        assert_eq!(&markers[1..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_frame_list_rejected() {
        let muxer = Fmp4Muxer::new();
        assert!(matches!(
            muxer.media_segment(0, &[], 30.0),
            Err(MuxError::NoFrames)
        ));
    }

    #[test]
    fn test_audio_only_list_has_no_samples() {
        let muxer = Fmp4Muxer::new();
        let frames = vec![MediaFrame::audio(key(), 0, Bytes::from_static(&[0xFF]))];
        assert!(matches!(
            muxer.media_segment(0, &frames, 30.0),
            Err(MuxError::NoVideoSamples)
        ));
    }
}

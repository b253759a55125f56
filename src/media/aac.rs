//! AAC AudioSpecificConfig parsing
//!
//! The AAC sequence header carries an MPEG-4 AudioSpecificConfig:
//!
//! ```text
//! audioObjectType (5 bits) | samplingFrequencyIndex (4 bits)
//! | channelConfiguration (4 bits) | ...
//! ```
//!
//! Only the leading fields are decoded; they populate the stream's audio
//! codec info for the API. Audio frames themselves pass through the registry
//! untouched.

use bytes::Bytes;

use crate::error::MediaError;

/// Sampling frequencies by index, per ISO/IEC 14496-3
const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Parsed AudioSpecificConfig
#[derive(Debug, Clone)]
pub struct AacConfig {
    /// Audio object type (2 = AAC-LC)
    pub object_type: u8,
    /// Sampling frequency in Hz
    pub sample_rate: u32,
    /// Channel configuration (1 = mono, 2 = stereo)
    pub channels: u8,
}

impl AacConfig {
    pub fn parse(data: Bytes) -> Result<Self, MediaError> {
        if data.len() < 2 {
            return Err(MediaError::MalformedConfig);
        }

        let object_type = data[0] >> 3;
        let freq_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
        let channels = (data[1] >> 3) & 0x0F;

        let sample_rate = SAMPLE_RATES
            .get(freq_index as usize)
            .copied()
            .ok_or(MediaError::MalformedConfig)?;

        Ok(Self {
            object_type,
            sample_rate,
            channels,
        })
    }

    pub fn profile_name(&self) -> &'static str {
        match self.object_type {
            1 => "AAC Main",
            2 => "AAC-LC",
            5 => "HE-AAC",
            29 => "HE-AACv2",
            _ => "AAC",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aac_lc_44100_stereo() {
        // 0x12 0x10 = object type 2, freq index 4 (44100), 2 channels
        let config = AacConfig::parse(Bytes::from_static(&[0x12, 0x10])).unwrap();
        assert_eq!(config.object_type, 2);
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channels, 2);
        assert_eq!(config.profile_name(), "AAC-LC");
    }

    #[test]
    fn test_parse_aac_lc_48000_mono() {
        // object type 2, freq index 3 (48000), 1 channel
        let config = AacConfig::parse(Bytes::from_static(&[0x11, 0x88])).unwrap();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.channels, 1);
    }

    #[test]
    fn test_invalid_frequency_index() {
        // freq index 14 is reserved
        let result = AacConfig::parse(Bytes::from_static(&[0x17, 0x10]));
        assert_eq!(result.unwrap_err(), MediaError::MalformedConfig);
    }

    #[test]
    fn test_truncated_config() {
        assert_eq!(
            AacConfig::parse(Bytes::from_static(&[0x12])).unwrap_err(),
            MediaError::MalformedConfig
        );
    }
}

//! MPEG-2/4 AAC capability handling.
//!
//! Six-byte structure: object type bitmask, a 12-bit sampling frequency
//! mask spread over the second octet and the high nibble of the third,
//! channel count bits, then the VBR flag and a 23-bit peak bitrate.

use super::{best_bit, bit_value, invalid, BitTable, CapabilityField, CodecCapabilities, SelectPolicy};
use crate::{Error, ErrorKind, Result};

/// MPEG-2 AAC Low Complexity.
pub const OBJECT_TYPE_MPEG2_LC: u8 = 1 << 7;
/// MPEG-4 AAC Low Complexity.
pub const OBJECT_TYPE_MPEG4_LC: u8 = 1 << 6;
/// MPEG-4 AAC Long Term Prediction.
pub const OBJECT_TYPE_MPEG4_LTP: u8 = 1 << 5;
/// MPEG-4 AAC Scalable.
pub const OBJECT_TYPE_MPEG4_SCA: u8 = 1 << 4;

/// Object types the bundled encoder can actually produce.
pub const ENCODER_OBJECT_TYPES: u8 = OBJECT_TYPE_MPEG2_LC | OBJECT_TYPE_MPEG4_LC;

/// One channel.
pub const CHANNELS_1: u8 = 1 << 1;
/// Two channels.
pub const CHANNELS_2: u8 = 1 << 0;

/// 8 kHz sampling.
pub const SAMPLING_FREQ_8000: u16 = 1 << 11;
/// 11.025 kHz sampling.
pub const SAMPLING_FREQ_11025: u16 = 1 << 10;
/// 12 kHz sampling.
pub const SAMPLING_FREQ_12000: u16 = 1 << 9;
/// 16 kHz sampling.
pub const SAMPLING_FREQ_16000: u16 = 1 << 8;
/// 22.05 kHz sampling.
pub const SAMPLING_FREQ_22050: u16 = 1 << 7;
/// 24 kHz sampling.
pub const SAMPLING_FREQ_24000: u16 = 1 << 6;
/// 32 kHz sampling.
pub const SAMPLING_FREQ_32000: u16 = 1 << 5;
/// 44.1 kHz sampling.
pub const SAMPLING_FREQ_44100: u16 = 1 << 4;
/// 48 kHz sampling.
pub const SAMPLING_FREQ_48000: u16 = 1 << 3;
/// 64 kHz sampling.
pub const SAMPLING_FREQ_64000: u16 = 1 << 2;
/// 88.2 kHz sampling.
pub const SAMPLING_FREQ_88200: u16 = 1 << 1;
/// 96 kHz sampling.
pub const SAMPLING_FREQ_96000: u16 = 1 << 0;

const OBJECT_TYPES: &BitTable<u8> = &[
    (OBJECT_TYPE_MPEG2_LC as u16, 0),
    (OBJECT_TYPE_MPEG4_LC as u16, 1),
    (OBJECT_TYPE_MPEG4_LTP as u16, 2),
    (OBJECT_TYPE_MPEG4_SCA as u16, 3),
];

const CHANNEL_COUNTS: &BitTable<u8> = &[(CHANNELS_1 as u16, 1), (CHANNELS_2 as u16, 2)];

const SAMPLING_FREQS: &BitTable<u32> = &[
    (SAMPLING_FREQ_8000, 8000),
    (SAMPLING_FREQ_11025, 11025),
    (SAMPLING_FREQ_12000, 12000),
    (SAMPLING_FREQ_16000, 16000),
    (SAMPLING_FREQ_22050, 22050),
    (SAMPLING_FREQ_24000, 24000),
    (SAMPLING_FREQ_32000, 32000),
    (SAMPLING_FREQ_44100, 44100),
    (SAMPLING_FREQ_48000, 48000),
    (SAMPLING_FREQ_64000, 64000),
    (SAMPLING_FREQ_88200, 88200),
    (SAMPLING_FREQ_96000, 96000),
];

/// AAC capability structure.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    /// Object type bitmask.
    pub object_type: u8,
    /// Sampling frequency bitmask (12 bits).
    pub frequency: u16,
    /// Channel count bitmask.
    pub channels: u8,
    /// Variable bitrate support.
    pub vbr: bool,
    /// Peak bitrate in bits per second (23 bits).
    pub bitrate: u32,
}

impl Capabilities {
    /// Everything the AAC codec supports.
    pub fn full() -> Self {
        Self {
            object_type: ENCODER_OBJECT_TYPES,
            frequency: SAMPLING_FREQ_8000
                | SAMPLING_FREQ_11025
                | SAMPLING_FREQ_12000
                | SAMPLING_FREQ_16000
                | SAMPLING_FREQ_22050
                | SAMPLING_FREQ_24000
                | SAMPLING_FREQ_32000
                | SAMPLING_FREQ_44100
                | SAMPLING_FREQ_48000
                | SAMPLING_FREQ_64000
                | SAMPLING_FREQ_88200
                | SAMPLING_FREQ_96000,
            channels: CHANNELS_1 | CHANNELS_2,
            vbr: true,
            bitrate: 320_000,
        }
    }
}

impl CodecCapabilities for Capabilities {
    const SIZE: usize = 6;

    fn from_bytes(blob: &[u8]) -> Result<Self> {
        if blob.len() != Self::SIZE {
            return Err(invalid(CapabilityField::Size));
        }
        Ok(Self {
            object_type: blob[0],
            // 12-bit mask: eight high bits, then the high nibble
            frequency: u16::from(blob[1]) << 4 | u16::from(blob[2] >> 4),
            channels: (blob[2] >> 2) & 0x03,
            vbr: blob[3] & 0x80 != 0,
            bitrate: u32::from(blob[3] & 0x7F) << 16 | u32::from(blob[4]) << 8 | u32::from(blob[5]),
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        vec![
            self.object_type,
            (self.frequency >> 4) as u8,
            ((self.frequency as u8 & 0x0F) << 4) | ((self.channels & 0x03) << 2),
            (u8::from(self.vbr) << 7) | ((self.bitrate >> 16) as u8 & 0x7F),
            (self.bitrate >> 8) as u8,
            self.bitrate as u8,
        ]
    }

    fn intersect(&self, peer: &Self) -> Self {
        Self {
            object_type: self.object_type & peer.object_type,
            frequency: self.frequency & peer.frequency,
            channels: self.channels & peer.channels,
            vbr: self.vbr && peer.vbr,
            // the bitrate is a cap, not a bitmask
            bitrate: self.bitrate.min(peer.bitrate),
        }
    }

    fn check(&self) -> Result<()> {
        if bit_value(self.object_type as u16, OBJECT_TYPES).is_none()
            || self.object_type & ENCODER_OBJECT_TYPES == 0
        {
            return Err(invalid(CapabilityField::ObjectType));
        }
        if bit_value(self.frequency, SAMPLING_FREQS).is_none() {
            return Err(invalid(CapabilityField::Rate));
        }
        if bit_value(self.channels as u16, CHANNEL_COUNTS).is_none() {
            return Err(invalid(CapabilityField::ChannelMode));
        }
        Ok(())
    }

    fn select(&self, policy: &SelectPolicy) -> Result<Self> {
        let mut config = self.clone();

        let usable = self.object_type & ENCODER_OBJECT_TYPES;
        if usable == 0 {
            return Err(Error::with_message(
                ErrorKind::CodecNotSupported,
                "no mutually supported AAC object type",
            ));
        }
        config.object_type = best_bit(usable as u16, OBJECT_TYPES).unwrap().0 as u8;

        config.channels = if policy.force_mono {
            CHANNELS_1
        } else {
            best_bit(self.channels as u16, CHANNEL_COUNTS)
                .ok_or_else(|| invalid(CapabilityField::ChannelMode))?
                .0 as u8
        };
        if self.channels & config.channels == 0 {
            return Err(invalid(CapabilityField::ChannelMode));
        }

        config.frequency = if policy.force_44100 && self.frequency & SAMPLING_FREQ_44100 != 0 {
            SAMPLING_FREQ_44100
        } else {
            best_bit(self.frequency, SAMPLING_FREQS).ok_or_else(|| invalid(CapabilityField::Rate))?.0
        };

        config.vbr = self.vbr && policy.aac_vbr;
        config.bitrate = self.bitrate.min(policy.aac_bitrate);

        Ok(config)
    }

    fn channels(&self) -> Option<u8> {
        bit_value(self.channels as u16, CHANNEL_COUNTS)
    }

    fn sample_rate(&self) -> Option<u32> {
        bit_value(self.frequency, SAMPLING_FREQS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip_spreads_frequency_mask() {
        let caps = Capabilities::full();
        let blob = caps.to_bytes();
        assert_eq!(blob[1], 0xFF);
        assert_eq!(blob[2] & 0xF0, 0xF0);
        assert_eq!(Capabilities::from_bytes(&blob).unwrap(), caps);
    }

    #[test]
    fn intersection_is_commutative_and_idempotent() {
        let ours = Capabilities::full();
        let peer = Capabilities {
            object_type: OBJECT_TYPE_MPEG2_LC | OBJECT_TYPE_MPEG4_LC,
            frequency: SAMPLING_FREQ_44100 | SAMPLING_FREQ_48000,
            channels: CHANNELS_2,
            vbr: false,
            bitrate: 160_000,
        };
        assert_eq!(ours.intersect(&peer), peer.intersect(&ours));
        assert_eq!(peer.intersect(&peer), peer);
        // bitrate clamps to the minimum
        assert_eq!(ours.intersect(&peer).bitrate, 160_000);
    }

    #[test]
    fn select_prefers_mpeg4_lc() {
        let config = Capabilities::full().select(&SelectPolicy::default()).unwrap();
        assert_eq!(config.object_type, OBJECT_TYPE_MPEG4_LC);
        assert_eq!(config.sample_rate(), Some(96000));
        assert_eq!(config.channels(), Some(2));
        assert_eq!(config.bitrate, 220_000);
        config.check().unwrap();
    }

    #[test]
    fn select_rejects_ltp_only_peer() {
        let peer = Capabilities { object_type: OBJECT_TYPE_MPEG4_LTP, ..Capabilities::full() };
        // peer offers only LTP, which the encoder cannot produce
        let err = peer.select(&SelectPolicy::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CodecNotSupported);
    }

    #[test]
    fn check_rejects_unsupported_object_type() {
        let mut config = Capabilities::full().select(&SelectPolicy::default()).unwrap();
        config.object_type = OBJECT_TYPE_MPEG4_SCA;
        assert_eq!(
            config.check().unwrap_err().kind,
            crate::ErrorKind::InvalidConfiguration(CapabilityField::ObjectType)
        );
    }
}

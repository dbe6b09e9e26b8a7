//! LDAC capability handling.
//!
//! Sony vendor codec. The blob holds a sampling frequency mask and a
//! channel mode mask; encoder quality is negotiated in-band and does not
//! appear in the capabilities.

use super::{
    best_bit, bit_value, invalid, read_vendor_info, write_vendor_info, BitTable, CapabilityField,
    CodecCapabilities, CodecId, SelectPolicy,
};
use crate::Result;

/// Mono channel mode.
pub const CHANNEL_MODE_MONO: u8 = 1 << 2;
/// Dual channel mode.
pub const CHANNEL_MODE_DUAL: u8 = 1 << 1;
/// Stereo channel mode.
pub const CHANNEL_MODE_STEREO: u8 = 1 << 0;

/// 44.1 kHz sampling.
pub const SAMPLING_FREQ_44100: u8 = 1 << 5;
/// 48 kHz sampling.
pub const SAMPLING_FREQ_48000: u8 = 1 << 4;
/// 88.2 kHz sampling.
pub const SAMPLING_FREQ_88200: u8 = 1 << 3;
/// 96 kHz sampling.
pub const SAMPLING_FREQ_96000: u8 = 1 << 2;
/// 176.4 kHz sampling.
pub const SAMPLING_FREQ_176400: u8 = 1 << 1;
/// 192 kHz sampling.
pub const SAMPLING_FREQ_192000: u8 = 1 << 0;

const CHANNEL_MODES: &BitTable<u8> = &[
    (CHANNEL_MODE_MONO as u16, 1),
    (CHANNEL_MODE_DUAL as u16, 2),
    (CHANNEL_MODE_STEREO as u16, 2),
];

const SAMPLING_FREQS: &BitTable<u32> = &[
    (SAMPLING_FREQ_44100 as u16, 44100),
    (SAMPLING_FREQ_48000 as u16, 48000),
    (SAMPLING_FREQ_88200 as u16, 88200),
    (SAMPLING_FREQ_96000 as u16, 96000),
    (SAMPLING_FREQ_176400 as u16, 176400),
    (SAMPLING_FREQ_192000 as u16, 192000),
];

/// LDAC capability structure.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    /// Sampling frequency bitmask.
    pub frequency: u8,
    /// Channel mode bitmask.
    pub channel_mode: u8,
}

impl Capabilities {
    /// Everything the LDAC codec supports.
    pub fn full() -> Self {
        Self {
            frequency: SAMPLING_FREQ_44100
                | SAMPLING_FREQ_48000
                | SAMPLING_FREQ_88200
                | SAMPLING_FREQ_96000,
            channel_mode: CHANNEL_MODE_MONO | CHANNEL_MODE_DUAL | CHANNEL_MODE_STEREO,
        }
    }
}

impl CodecCapabilities for Capabilities {
    const SIZE: usize = 8;

    fn from_bytes(blob: &[u8]) -> Result<Self> {
        let payload = read_vendor_info(CodecId::LDAC, blob)?;
        if payload.len() != 2 {
            return Err(invalid(CapabilityField::Size));
        }
        Ok(Self { frequency: payload[0] & 0x3F, channel_mode: payload[1] & 0x07 })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(Self::SIZE);
        write_vendor_info(CodecId::LDAC, &mut blob);
        blob.push(self.frequency & 0x3F);
        blob.push(self.channel_mode & 0x07);
        blob
    }

    fn intersect(&self, peer: &Self) -> Self {
        Self { frequency: self.frequency & peer.frequency, channel_mode: self.channel_mode & peer.channel_mode }
    }

    fn check(&self) -> Result<()> {
        if bit_value(self.frequency as u16, SAMPLING_FREQS).is_none() {
            return Err(invalid(CapabilityField::Rate));
        }
        if bit_value(self.channel_mode as u16, CHANNEL_MODES).is_none() {
            return Err(invalid(CapabilityField::ChannelMode));
        }
        Ok(())
    }

    fn select(&self, policy: &SelectPolicy) -> Result<Self> {
        let channel_mode = if policy.force_mono {
            CHANNEL_MODE_MONO
        } else {
            best_bit(self.channel_mode as u16, CHANNEL_MODES)
                .ok_or_else(|| invalid(CapabilityField::ChannelMode))?
                .0 as u8
        };
        if self.channel_mode & channel_mode == 0 {
            return Err(invalid(CapabilityField::ChannelMode));
        }
        let frequency = if policy.force_44100 && self.frequency & SAMPLING_FREQ_44100 != 0 {
            SAMPLING_FREQ_44100
        } else {
            best_bit(self.frequency as u16, SAMPLING_FREQS).ok_or_else(|| invalid(CapabilityField::Rate))?.0 as u8
        };
        Ok(Self { frequency, channel_mode })
    }

    fn channels(&self) -> Option<u8> {
        bit_value(self.channel_mode as u16, CHANNEL_MODES)
    }

    fn sample_rate(&self) -> Option<u32> {
        bit_value(self.frequency as u16, SAMPLING_FREQS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        let caps = Capabilities::full();
        let blob = caps.to_bytes();
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..6], &[0x2D, 0x01, 0x00, 0x00, 0xAA, 0x00]);
        assert_eq!(Capabilities::from_bytes(&blob).unwrap(), caps);
    }

    #[test]
    fn select_prefers_stereo_96k() {
        let config = Capabilities::full().select(&SelectPolicy::default()).unwrap();
        assert_eq!(config.channel_mode, CHANNEL_MODE_STEREO);
        assert_eq!(config.sample_rate(), Some(96000));
        config.check().unwrap();
    }

    #[test]
    fn intersection_is_commutative_and_idempotent() {
        let ours = Capabilities::full();
        let peer = Capabilities { frequency: SAMPLING_FREQ_96000, channel_mode: CHANNEL_MODE_STEREO };
        assert_eq!(ours.intersect(&peer), peer.intersect(&ours));
        assert_eq!(peer.intersect(&peer), peer);
    }
}

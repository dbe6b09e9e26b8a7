//! MPEG-1/2 audio (layers I-III) capability handling.
//!
//! Four-byte structure: layer, CRC and channel mode in the first octet,
//! media payload format and sampling frequency in the second, then the
//! VBR flag and a 15-bit bitrate index mask whose bytes are swapped on the
//! wire.

use super::{best_bit, bit_value, invalid, BitTable, CapabilityField, CodecCapabilities, SelectPolicy};
use crate::Result;

/// Layer I (MP1).
pub const LAYER_MP1: u8 = 1 << 2;
/// Layer II (MP2).
pub const LAYER_MP2: u8 = 1 << 1;
/// Layer III (MP3).
pub const LAYER_MP3: u8 = 1 << 0;

/// Mono channel mode.
pub const CHANNEL_MODE_MONO: u8 = 1 << 3;
/// Dual channel mode.
pub const CHANNEL_MODE_DUAL: u8 = 1 << 2;
/// Stereo channel mode.
pub const CHANNEL_MODE_STEREO: u8 = 1 << 1;
/// Joint stereo channel mode.
pub const CHANNEL_MODE_JOINT: u8 = 1 << 0;

/// 16 kHz sampling.
pub const SAMPLING_FREQ_16000: u8 = 1 << 5;
/// 22.05 kHz sampling.
pub const SAMPLING_FREQ_22050: u8 = 1 << 4;
/// 24 kHz sampling.
pub const SAMPLING_FREQ_24000: u8 = 1 << 3;
/// 32 kHz sampling.
pub const SAMPLING_FREQ_32000: u8 = 1 << 2;
/// 44.1 kHz sampling.
pub const SAMPLING_FREQ_44100: u8 = 1 << 1;
/// 48 kHz sampling.
pub const SAMPLING_FREQ_48000: u8 = 1 << 0;

const LAYERS: &BitTable<u8> = &[(LAYER_MP1 as u16, 1), (LAYER_MP2 as u16, 2), (LAYER_MP3 as u16, 3)];

const CHANNEL_MODES: &BitTable<u8> = &[
    (CHANNEL_MODE_MONO as u16, 1),
    (CHANNEL_MODE_DUAL as u16, 2),
    (CHANNEL_MODE_STEREO as u16, 2),
    (CHANNEL_MODE_JOINT as u16, 2),
];

const SAMPLING_FREQS: &BitTable<u32> = &[
    (SAMPLING_FREQ_16000 as u16, 16000),
    (SAMPLING_FREQ_22050 as u16, 22050),
    (SAMPLING_FREQ_24000 as u16, 24000),
    (SAMPLING_FREQ_32000 as u16, 32000),
    (SAMPLING_FREQ_44100 as u16, 44100),
    (SAMPLING_FREQ_48000 as u16, 48000),
];

/// MPEG audio capability structure.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    /// Layer bitmask.
    pub layer: u8,
    /// Frame CRC protection.
    pub crc: bool,
    /// Channel mode bitmask.
    pub channel_mode: u8,
    /// Media payload format 2 (RFC 3119) support.
    pub mpf2: bool,
    /// Sampling frequency bitmask.
    pub frequency: u8,
    /// Variable bitrate support.
    pub vbr: bool,
    /// Bitrate index bitmask (15 bits).
    pub bitrate: u16,
}

impl Capabilities {
    /// Everything the MPEG audio codec supports.
    pub fn full() -> Self {
        Self {
            layer: LAYER_MP1 | LAYER_MP2 | LAYER_MP3,
            crc: true,
            channel_mode: CHANNEL_MODE_MONO | CHANNEL_MODE_DUAL | CHANNEL_MODE_STEREO | CHANNEL_MODE_JOINT,
            mpf2: true,
            frequency: SAMPLING_FREQ_16000
                | SAMPLING_FREQ_22050
                | SAMPLING_FREQ_24000
                | SAMPLING_FREQ_32000
                | SAMPLING_FREQ_44100
                | SAMPLING_FREQ_48000,
            vbr: true,
            bitrate: 0x7FFF,
        }
    }

    /// Selected layer of a single-valued configuration.
    pub fn layer_number(&self) -> Option<u8> {
        bit_value(self.layer as u16, LAYERS)
    }
}

impl CodecCapabilities for Capabilities {
    const SIZE: usize = 4;

    fn from_bytes(blob: &[u8]) -> Result<Self> {
        if blob.len() != Self::SIZE {
            return Err(invalid(CapabilityField::Size));
        }
        Ok(Self {
            channel_mode: blob[0] & 0x0F,
            crc: blob[0] & 0x10 != 0,
            layer: blob[0] >> 5,
            frequency: blob[1] & 0x3F,
            mpf2: blob[1] & 0x40 != 0,
            vbr: blob[2] & 0x80 != 0,
            // 15-bit bitrate index mask, high bits first on the wire
            bitrate: u16::from(blob[2] & 0x7F) << 8 | u16::from(blob[3]),
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        vec![
            (self.layer << 5) | (u8::from(self.crc) << 4) | (self.channel_mode & 0x0F),
            (u8::from(self.mpf2) << 6) | (self.frequency & 0x3F),
            (u8::from(self.vbr) << 7) | ((self.bitrate >> 8) as u8 & 0x7F),
            self.bitrate as u8,
        ]
    }

    fn intersect(&self, peer: &Self) -> Self {
        Self {
            layer: self.layer & peer.layer,
            crc: self.crc && peer.crc,
            channel_mode: self.channel_mode & peer.channel_mode,
            mpf2: self.mpf2 && peer.mpf2,
            frequency: self.frequency & peer.frequency,
            vbr: self.vbr && peer.vbr,
            bitrate: self.bitrate & peer.bitrate,
        }
    }

    fn check(&self) -> Result<()> {
        if self.layer_number().is_none() {
            return Err(invalid(CapabilityField::MpegLayer));
        }
        if bit_value(self.channel_mode as u16, CHANNEL_MODES).is_none() {
            return Err(invalid(CapabilityField::ChannelMode));
        }
        if bit_value(self.frequency as u16, SAMPLING_FREQS).is_none() {
            return Err(invalid(CapabilityField::Rate));
        }
        Ok(())
    }

    fn select(&self, policy: &SelectPolicy) -> Result<Self> {
        let mut config = self.clone();

        config.layer = best_bit(self.layer as u16, LAYERS).ok_or_else(|| invalid(CapabilityField::MpegLayer))?.0 as u8;

        config.channel_mode = if policy.force_mono {
            CHANNEL_MODE_MONO
        } else {
            best_bit(self.channel_mode as u16, CHANNEL_MODES)
                .ok_or_else(|| invalid(CapabilityField::ChannelMode))?
                .0 as u8
        };
        if self.channel_mode & config.channel_mode == 0 {
            return Err(invalid(CapabilityField::ChannelMode));
        }

        config.frequency = if policy.force_44100 && self.frequency & SAMPLING_FREQ_44100 != 0 {
            SAMPLING_FREQ_44100
        } else {
            best_bit(self.frequency as u16, SAMPLING_FREQS).ok_or_else(|| invalid(CapabilityField::Rate))?.0 as u8
        };

        // CRC costs bits per frame, MPF-2 breaks some decoders
        config.crc = false;
        config.mpf2 = false;

        // the bitrate index mask may remain multi-valued; the encoder picks
        // the highest index it can sustain
        if config.bitrate == 0 {
            config.bitrate = self.bitrate;
        }

        Ok(config)
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
    fn byte_round_trip_swaps_bitrate() {
        let caps = Capabilities::full();
        let blob = caps.to_bytes();
        assert_eq!(blob[2] & 0x7F, 0x7F);
        assert_eq!(blob[3], 0xFF);
        assert_eq!(Capabilities::from_bytes(&blob).unwrap(), caps);
    }

    #[test]
    fn intersection_is_commutative_and_idempotent() {
        let mut peer = Capabilities::full();
        peer.layer = LAYER_MP3;
        peer.vbr = false;
        peer.bitrate = 0x00FF;
        let ours = Capabilities::full();
        assert_eq!(ours.intersect(&peer), peer.intersect(&ours));
        assert_eq!(peer.intersect(&peer), peer);
    }

    #[test]
    fn select_prefers_layer_three_and_disables_crc() {
        let config = Capabilities::full().select(&SelectPolicy::default()).unwrap();
        assert_eq!(config.layer_number(), Some(3));
        assert!(!config.crc);
        assert!(!config.mpf2);
        assert_eq!(config.sample_rate(), Some(48000));
        config.check().unwrap();
    }

    #[test]
    fn check_rejects_invalid_layer() {
        let mut config = Capabilities::full().select(&SelectPolicy::default()).unwrap();
        config.layer = LAYER_MP1 | LAYER_MP3;
        assert_eq!(
            config.check().unwrap_err().kind,
            crate::ErrorKind::InvalidConfiguration(CapabilityField::MpegLayer)
        );
        config.layer = 0;
        assert!(config.check().is_err());
    }
}

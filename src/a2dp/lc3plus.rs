//! LC3plus capability handling.
//!
//! Fraunhofer vendor codec. The blob holds a frame duration mask, a channel
//! count mask and a 16-bit sampling frequency mask that is big-endian on
//! the wire, unlike every other multi-byte capability field.

use super::{
    best_bit, bit_value, invalid, read_vendor_info, write_vendor_info, BitTable, CapabilityField,
    CodecCapabilities, CodecId, SelectPolicy,
};
use crate::Result;

/// 2.5 ms frame duration.
pub const FRAME_DURATION_025: u8 = 1 << 2;
/// 5 ms frame duration.
pub const FRAME_DURATION_050: u8 = 1 << 1;
/// 10 ms frame duration.
pub const FRAME_DURATION_100: u8 = 1 << 0;

/// One channel.
pub const CHANNELS_1: u8 = 1 << 1;
/// Two channels.
pub const CHANNELS_2: u8 = 1 << 0;

/// 48 kHz sampling.
pub const SAMPLING_FREQ_48000: u16 = 1 << 1;
/// 96 kHz sampling.
pub const SAMPLING_FREQ_96000: u16 = 1 << 0;

const FRAME_DURATIONS: &BitTable<u8> = &[
    // tenths of a millisecond
    (FRAME_DURATION_025 as u16, 25),
    (FRAME_DURATION_050 as u16, 50),
    (FRAME_DURATION_100 as u16, 100),
];

const CHANNEL_COUNTS: &BitTable<u8> = &[(CHANNELS_1 as u16, 1), (CHANNELS_2 as u16, 2)];

const SAMPLING_FREQS: &BitTable<u32> = &[(SAMPLING_FREQ_48000, 48000), (SAMPLING_FREQ_96000, 96000)];

/// LC3plus capability structure.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    /// Frame duration bitmask.
    pub frame_duration: u8,
    /// Channel count bitmask.
    pub channels: u8,
    /// Sampling frequency bitmask (16 bits, big-endian on the wire).
    pub frequency: u16,
}

impl Capabilities {
    /// Everything the LC3plus codec supports.
    pub fn full() -> Self {
        Self {
            frame_duration: FRAME_DURATION_025 | FRAME_DURATION_050 | FRAME_DURATION_100,
            channels: CHANNELS_1 | CHANNELS_2,
            frequency: SAMPLING_FREQ_48000 | SAMPLING_FREQ_96000,
        }
    }

    /// Frame duration of a single-valued configuration in tenths of a
    /// millisecond.
    pub fn frame_duration_dms(&self) -> Option<u8> {
        bit_value(self.frame_duration as u16, FRAME_DURATIONS)
    }
}

impl CodecCapabilities for Capabilities {
    const SIZE: usize = 10;

    fn from_bytes(blob: &[u8]) -> Result<Self> {
        let payload = read_vendor_info(CodecId::LC3PLUS, blob)?;
        if payload.len() != 4 {
            return Err(invalid(CapabilityField::Size));
        }
        Ok(Self {
            frame_duration: payload[0] & 0x07,
            channels: payload[1] & 0x03,
            frequency: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(Self::SIZE);
        write_vendor_info(CodecId::LC3PLUS, &mut blob);
        blob.push(self.frame_duration & 0x07);
        blob.push(self.channels & 0x03);
        blob.extend_from_slice(&self.frequency.to_be_bytes());
        blob
    }

    fn intersect(&self, peer: &Self) -> Self {
        Self {
            frame_duration: self.frame_duration & peer.frame_duration,
            channels: self.channels & peer.channels,
            frequency: self.frequency & peer.frequency,
        }
    }

    fn check(&self) -> Result<()> {
        if self.frame_duration_dms().is_none() {
            return Err(invalid(CapabilityField::FrameDuration));
        }
        if bit_value(self.channels as u16, CHANNEL_COUNTS).is_none() {
            return Err(invalid(CapabilityField::ChannelMode));
        }
        if bit_value(self.frequency, SAMPLING_FREQS).is_none() {
            return Err(invalid(CapabilityField::Rate));
        }
        Ok(())
    }

    fn select(&self, policy: &SelectPolicy) -> Result<Self> {
        let frame_duration = best_bit(self.frame_duration as u16, FRAME_DURATIONS)
            .ok_or_else(|| invalid(CapabilityField::FrameDuration))?
            .0 as u8;
        let channels = if policy.force_mono {
            CHANNELS_1
        } else {
            best_bit(self.channels as u16, CHANNEL_COUNTS)
                .ok_or_else(|| invalid(CapabilityField::ChannelMode))?
                .0 as u8
        };
        if self.channels & channels == 0 {
            return Err(invalid(CapabilityField::ChannelMode));
        }
        // 44.1 kHz does not exist for LC3plus; force_44100 falls through
        let frequency =
            best_bit(self.frequency, SAMPLING_FREQS).ok_or_else(|| invalid(CapabilityField::Rate))?.0;
        Ok(Self { frame_duration, channels, frequency })
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
    fn byte_round_trip_big_endian_frequency() {
        let caps = Capabilities { frequency: SAMPLING_FREQ_48000, ..Capabilities::full() };
        let blob = caps.to_bytes();
        assert_eq!(blob.len(), 10);
        // 16-bit sampling rate mask is big-endian
        assert_eq!(&blob[8..], &[0x00, 0x02]);
        assert_eq!(Capabilities::from_bytes(&blob).unwrap(), caps);
    }

    #[test]
    fn select_prefers_ten_ms_frames() {
        let config = Capabilities::full().select(&SelectPolicy::default()).unwrap();
        assert_eq!(config.frame_duration_dms(), Some(100));
        assert_eq!(config.sample_rate(), Some(96000));
        config.check().unwrap();
    }

    #[test]
    fn check_rejects_unenumerated_frame_duration() {
        let mut config = Capabilities::full().select(&SelectPolicy::default()).unwrap();
        config.frame_duration = 0x08;
        assert_eq!(
            config.check().unwrap_err().kind,
            crate::ErrorKind::InvalidConfiguration(CapabilityField::FrameDuration)
        );
    }

    #[test]
    fn intersection_is_commutative_and_idempotent() {
        let ours = Capabilities::full();
        let peer = Capabilities {
            frame_duration: FRAME_DURATION_100,
            channels: CHANNELS_2,
            frequency: SAMPLING_FREQ_48000,
        };
        assert_eq!(ours.intersect(&peer), peer.intersect(&ours));
        assert_eq!(peer.intersect(&peer), peer);
    }
}

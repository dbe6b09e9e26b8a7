//! aptX and aptX HD capability handling.
//!
//! Vendor codecs: the blob starts with the little-endian company and codec
//! ids, followed by a single octet sharing sampling frequency and channel
//! mode. aptX HD appends four reserved octets.

use super::{
    best_bit, bit_value, invalid, read_vendor_info, write_vendor_info, BitTable, CapabilityField,
    CodecCapabilities, CodecId, SelectPolicy,
};
use crate::Result;

/// Mono channel mode.
pub const CHANNEL_MODE_MONO: u8 = 1 << 0;
/// Stereo channel mode.
pub const CHANNEL_MODE_STEREO: u8 = 1 << 1;

/// 16 kHz sampling.
pub const SAMPLING_FREQ_16000: u8 = 1 << 3;
/// 32 kHz sampling.
pub const SAMPLING_FREQ_32000: u8 = 1 << 2;
/// 44.1 kHz sampling.
pub const SAMPLING_FREQ_44100: u8 = 1 << 1;
/// 48 kHz sampling.
pub const SAMPLING_FREQ_48000: u8 = 1 << 0;

const CHANNEL_MODES: &BitTable<u8> = &[(CHANNEL_MODE_MONO as u16, 1), (CHANNEL_MODE_STEREO as u16, 2)];

const SAMPLING_FREQS: &BitTable<u32> = &[
    (SAMPLING_FREQ_16000 as u16, 16000),
    (SAMPLING_FREQ_32000 as u16, 32000),
    (SAMPLING_FREQ_44100 as u16, 44100),
    (SAMPLING_FREQ_48000 as u16, 48000),
];

/// aptX capability structure.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    /// Channel mode bitmask.
    pub channel_mode: u8,
    /// Sampling frequency bitmask.
    pub frequency: u8,
}

impl Capabilities {
    /// Everything the aptX codec supports.
    pub fn full() -> Self {
        Self {
            channel_mode: CHANNEL_MODE_STEREO,
            frequency: SAMPLING_FREQ_16000 | SAMPLING_FREQ_32000 | SAMPLING_FREQ_44100 | SAMPLING_FREQ_48000,
        }
    }

    fn pack(&self) -> u8 {
        (self.frequency << 4) | (self.channel_mode & 0x0F)
    }

    fn unpack(byte: u8) -> Self {
        Self { channel_mode: byte & 0x0F, frequency: byte >> 4 }
    }

    fn intersect_fields(&self, peer: &Self) -> Self {
        Self { channel_mode: self.channel_mode & peer.channel_mode, frequency: self.frequency & peer.frequency }
    }

    fn check_fields(&self) -> Result<()> {
        if bit_value(self.frequency as u16, SAMPLING_FREQS).is_none() {
            return Err(invalid(CapabilityField::Rate));
        }
        if bit_value(self.channel_mode as u16, CHANNEL_MODES).is_none() {
            return Err(invalid(CapabilityField::ChannelMode));
        }
        Ok(())
    }

    fn select_fields(&self, policy: &SelectPolicy) -> Result<Self> {
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
        Ok(Self { channel_mode, frequency })
    }
}

impl CodecCapabilities for Capabilities {
    const SIZE: usize = 7;

    fn from_bytes(blob: &[u8]) -> Result<Self> {
        let payload = read_vendor_info(CodecId::APTX, blob)?;
        if payload.len() != 1 {
            return Err(invalid(CapabilityField::Size));
        }
        Ok(Self::unpack(payload[0]))
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(Self::SIZE);
        write_vendor_info(CodecId::APTX, &mut blob);
        blob.push(self.pack());
        blob
    }

    fn intersect(&self, peer: &Self) -> Self {
        self.intersect_fields(peer)
    }

    fn check(&self) -> Result<()> {
        self.check_fields()
    }

    fn select(&self, policy: &SelectPolicy) -> Result<Self> {
        self.select_fields(policy)
    }

    fn channels(&self) -> Option<u8> {
        bit_value(self.channel_mode as u16, CHANNEL_MODES)
    }

    fn sample_rate(&self) -> Option<u32> {
        bit_value(self.frequency as u16, SAMPLING_FREQS)
    }
}

/// aptX HD capability structure: the aptX octet plus four reserved octets.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HdCapabilities {
    /// The aptX fields.
    pub aptx: Capabilities,
}

impl HdCapabilities {
    /// Everything the aptX HD codec supports.
    pub fn full() -> Self {
        Self { aptx: Capabilities::full() }
    }
}

impl CodecCapabilities for HdCapabilities {
    const SIZE: usize = 11;

    fn from_bytes(blob: &[u8]) -> Result<Self> {
        let payload = read_vendor_info(CodecId::APTX_HD, blob)?;
        if payload.len() != 5 {
            return Err(invalid(CapabilityField::Size));
        }
        Ok(Self { aptx: Capabilities::unpack(payload[0]) })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(Self::SIZE);
        write_vendor_info(CodecId::APTX_HD, &mut blob);
        blob.push(self.aptx.pack());
        blob.extend_from_slice(&[0; 4]);
        blob
    }

    fn intersect(&self, peer: &Self) -> Self {
        Self { aptx: self.aptx.intersect_fields(&peer.aptx) }
    }

    fn check(&self) -> Result<()> {
        self.aptx.check_fields()
    }

    fn select(&self, policy: &SelectPolicy) -> Result<Self> {
        Ok(Self { aptx: self.aptx.select_fields(policy)? })
    }

    fn channels(&self) -> Option<u8> {
        self.aptx.channels()
    }

    fn sample_rate(&self) -> Option<u32> {
        self.aptx.sample_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip_with_vendor_prefix() {
        let caps = Capabilities::full();
        let blob = caps.to_bytes();
        assert_eq!(blob.len(), 7);
        assert_eq!(&blob[..6], &[0x4F, 0x00, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(Capabilities::from_bytes(&blob).unwrap(), caps);

        let hd = HdCapabilities::full();
        let blob = hd.to_bytes();
        assert_eq!(blob.len(), 11);
        assert_eq!(&blob[..6], &[0xD7, 0x00, 0x00, 0x00, 0x24, 0x00]);
        assert_eq!(HdCapabilities::from_bytes(&blob).unwrap(), hd);
    }

    #[test]
    fn select_prefers_stereo_48k() {
        let config = Capabilities::full().select(&SelectPolicy::default()).unwrap();
        assert_eq!(config.channels(), Some(2));
        assert_eq!(config.sample_rate(), Some(48000));
        config.check().unwrap();
    }

    #[test]
    fn intersection_is_commutative() {
        let ours = Capabilities::full();
        let peer = Capabilities { channel_mode: CHANNEL_MODE_STEREO, frequency: SAMPLING_FREQ_44100 };
        assert_eq!(ours.intersect(&peer), peer.intersect(&ours));
        assert_eq!(peer.intersect(&peer), peer);
    }

    #[test]
    fn force_mono_fails_for_stereo_only_codec() {
        let policy = SelectPolicy { force_mono: true, ..SelectPolicy::default() };
        assert!(Capabilities::full().select(&policy).is_err());
    }
}

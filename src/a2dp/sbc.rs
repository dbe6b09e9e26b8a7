//! SBC capability handling.
//!
//! The capability structure is four bytes: sampling frequency and channel
//! mode share the first octet, block length, subband count and allocation
//! method the second, followed by the minimum and maximum bitpool.

use super::{
    best_bit, bit_value, invalid, BitTable, CapabilityField, CodecCapabilities, SelectPolicy,
};
use crate::{Result, SbcQuality};

/// Mono channel mode.
pub const CHANNEL_MODE_MONO: u8 = 1 << 3;
/// Dual channel mode.
pub const CHANNEL_MODE_DUAL: u8 = 1 << 2;
/// Stereo channel mode.
pub const CHANNEL_MODE_STEREO: u8 = 1 << 1;
/// Joint stereo channel mode.
pub const CHANNEL_MODE_JOINT: u8 = 1 << 0;

/// 16 kHz sampling.
pub const SAMPLING_FREQ_16000: u8 = 1 << 3;
/// 32 kHz sampling.
pub const SAMPLING_FREQ_32000: u8 = 1 << 2;
/// 44.1 kHz sampling.
pub const SAMPLING_FREQ_44100: u8 = 1 << 1;
/// 48 kHz sampling.
pub const SAMPLING_FREQ_48000: u8 = 1 << 0;

/// 4 blocks.
pub const BLOCK_LENGTH_4: u8 = 1 << 3;
/// 8 blocks.
pub const BLOCK_LENGTH_8: u8 = 1 << 2;
/// 12 blocks.
pub const BLOCK_LENGTH_12: u8 = 1 << 1;
/// 16 blocks.
pub const BLOCK_LENGTH_16: u8 = 1 << 0;

/// 4 subbands.
pub const SUBBANDS_4: u8 = 1 << 1;
/// 8 subbands.
pub const SUBBANDS_8: u8 = 1 << 0;

/// SNR bit allocation.
pub const ALLOCATION_SNR: u8 = 1 << 1;
/// Loudness bit allocation.
pub const ALLOCATION_LOUDNESS: u8 = 1 << 0;

/// Smallest bitpool value permitted by the A2DP specification.
pub const MIN_BITPOOL: u8 = 2;
/// Largest bitpool value permitted by the A2DP specification.
pub const MAX_BITPOOL: u8 = 250;

pub(crate) const CHANNEL_MODES: &BitTable<u8> = &[
    (CHANNEL_MODE_MONO as u16, 1),
    (CHANNEL_MODE_DUAL as u16, 2),
    (CHANNEL_MODE_STEREO as u16, 2),
    (CHANNEL_MODE_JOINT as u16, 2),
];

pub(crate) const SAMPLING_FREQS: &BitTable<u32> = &[
    (SAMPLING_FREQ_16000 as u16, 16000),
    (SAMPLING_FREQ_32000 as u16, 32000),
    (SAMPLING_FREQ_44100 as u16, 44100),
    (SAMPLING_FREQ_48000 as u16, 48000),
];

const BLOCK_LENGTHS: &BitTable<u8> = &[
    (BLOCK_LENGTH_4 as u16, 4),
    (BLOCK_LENGTH_8 as u16, 8),
    (BLOCK_LENGTH_12 as u16, 12),
    (BLOCK_LENGTH_16 as u16, 16),
];

const SUBBAND_COUNTS: &BitTable<u8> = &[(SUBBANDS_4 as u16, 4), (SUBBANDS_8 as u16, 8)];

/// SBC capability structure.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    /// Channel mode bitmask.
    pub channel_mode: u8,
    /// Sampling frequency bitmask.
    pub frequency: u8,
    /// Block length bitmask.
    pub block_length: u8,
    /// Subband count bitmask.
    pub subbands: u8,
    /// Allocation method bitmask.
    pub allocation: u8,
    /// Minimum supported bitpool.
    pub min_bitpool: u8,
    /// Maximum supported bitpool.
    pub max_bitpool: u8,
}

impl Capabilities {
    /// Everything the SBC encoder and decoder support.
    pub fn full() -> Self {
        Self {
            channel_mode: CHANNEL_MODE_MONO | CHANNEL_MODE_DUAL | CHANNEL_MODE_STEREO | CHANNEL_MODE_JOINT,
            frequency: SAMPLING_FREQ_16000 | SAMPLING_FREQ_32000 | SAMPLING_FREQ_44100 | SAMPLING_FREQ_48000,
            block_length: BLOCK_LENGTH_4 | BLOCK_LENGTH_8 | BLOCK_LENGTH_12 | BLOCK_LENGTH_16,
            subbands: SUBBANDS_4 | SUBBANDS_8,
            allocation: ALLOCATION_SNR | ALLOCATION_LOUDNESS,
            min_bitpool: MIN_BITPOOL,
            max_bitpool: MAX_BITPOOL,
        }
    }

    /// Block count of a single-valued configuration.
    pub fn block_count(&self) -> Option<u8> {
        bit_value(self.block_length as u16, BLOCK_LENGTHS)
    }

    /// Subband count of a single-valued configuration.
    pub fn subband_count(&self) -> Option<u8> {
        bit_value(self.subbands as u16, SUBBAND_COUNTS)
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
            frequency: blob[0] >> 4,
            allocation: blob[1] & 0x03,
            subbands: (blob[1] >> 2) & 0x03,
            block_length: blob[1] >> 4,
            min_bitpool: blob[2],
            max_bitpool: blob[3],
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        vec![
            (self.frequency << 4) | (self.channel_mode & 0x0F),
            (self.block_length << 4) | ((self.subbands & 0x03) << 2) | (self.allocation & 0x03),
            self.min_bitpool,
            self.max_bitpool,
        ]
    }

    fn intersect(&self, peer: &Self) -> Self {
        Self {
            channel_mode: self.channel_mode & peer.channel_mode,
            frequency: self.frequency & peer.frequency,
            block_length: self.block_length & peer.block_length,
            subbands: self.subbands & peer.subbands,
            allocation: self.allocation & peer.allocation,
            // the bitpool pair is a range, not a bitmask
            min_bitpool: self.min_bitpool.max(peer.min_bitpool),
            max_bitpool: self.max_bitpool.min(peer.max_bitpool),
        }
    }

    fn check(&self) -> Result<()> {
        if bit_value(self.frequency as u16, SAMPLING_FREQS).is_none() {
            return Err(invalid(CapabilityField::Rate));
        }
        if bit_value(self.channel_mode as u16, CHANNEL_MODES).is_none() {
            return Err(invalid(CapabilityField::ChannelMode));
        }
        if self.block_count().is_none() {
            return Err(invalid(CapabilityField::BlockLength));
        }
        if self.subband_count().is_none() {
            return Err(invalid(CapabilityField::SubBands));
        }
        if self.allocation != ALLOCATION_SNR && self.allocation != ALLOCATION_LOUDNESS {
            return Err(invalid(CapabilityField::AllocationMethod));
        }
        if self.min_bitpool < MIN_BITPOOL
            || self.max_bitpool > MAX_BITPOOL
            || self.min_bitpool > self.max_bitpool
        {
            return Err(invalid(CapabilityField::BitPoolRange));
        }
        Ok(())
    }

    fn select(&self, policy: &SelectPolicy) -> Result<Self> {
        let mut config = self.clone();

        // SBC XQ wants dual channel with 16 blocks and loudness over 8
        // subbands; when the peer cannot do all of that, fall back to the
        // plain high-quality selection.
        let xq = policy.sbc_quality == SbcQuality::Xq
            && !policy.force_mono
            && self.channel_mode & CHANNEL_MODE_DUAL != 0
            && self.block_length & BLOCK_LENGTH_16 != 0
            && self.subbands & SUBBANDS_8 != 0
            && self.allocation & ALLOCATION_LOUDNESS != 0;

        config.channel_mode = if policy.force_mono {
            CHANNEL_MODE_MONO
        } else if xq {
            CHANNEL_MODE_DUAL
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
            best_bit(self.frequency as u16, SAMPLING_FREQS)
                .ok_or_else(|| invalid(CapabilityField::Rate))?
                .0 as u8
        };

        config.block_length = if xq {
            BLOCK_LENGTH_16
        } else {
            best_bit(self.block_length as u16, BLOCK_LENGTHS)
                .ok_or_else(|| invalid(CapabilityField::BlockLength))?
                .0 as u8
        };
        config.subbands = if xq {
            SUBBANDS_8
        } else {
            best_bit(self.subbands as u16, SUBBAND_COUNTS).ok_or_else(|| invalid(CapabilityField::SubBands))?.0
                as u8
        };
        // loudness saves bits over SNR; prefer it whenever available
        config.allocation = if self.allocation & ALLOCATION_LOUDNESS != 0 {
            ALLOCATION_LOUDNESS
        } else if self.allocation & ALLOCATION_SNR != 0 {
            ALLOCATION_SNR
        } else {
            return Err(invalid(CapabilityField::AllocationMethod));
        };

        config.min_bitpool = self.min_bitpool.max(MIN_BITPOOL);
        config.max_bitpool = self.max_bitpool.min(MAX_BITPOOL);
        if config.min_bitpool > config.max_bitpool {
            return Err(invalid(CapabilityField::BitPoolRange));
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

    fn cd_quality_peer() -> Capabilities {
        Capabilities {
            channel_mode: CHANNEL_MODE_MONO | CHANNEL_MODE_DUAL | CHANNEL_MODE_STEREO,
            frequency: SAMPLING_FREQ_16000 | SAMPLING_FREQ_44100 | SAMPLING_FREQ_48000,
            block_length: BLOCK_LENGTH_4 | BLOCK_LENGTH_8,
            subbands: SUBBANDS_4 | SUBBANDS_8,
            allocation: ALLOCATION_SNR | ALLOCATION_LOUDNESS,
            min_bitpool: 42,
            max_bitpool: 255,
        }
    }

    #[test]
    fn byte_round_trip() {
        let caps = Capabilities::full();
        assert_eq!(Capabilities::from_bytes(&caps.to_bytes()).unwrap(), caps);
        assert!(Capabilities::from_bytes(&[0x00; 3]).is_err());
    }

    #[test]
    fn intersection_is_commutative_and_idempotent() {
        let ours = Capabilities::full();
        let theirs = cd_quality_peer();
        assert_eq!(ours.intersect(&theirs), theirs.intersect(&ours));
        assert_eq!(theirs.intersect(&theirs), theirs);
    }

    #[test]
    fn select_cd_quality() {
        let caps = Capabilities::full().intersect(&cd_quality_peer());
        let config = caps.select(&SelectPolicy::default()).unwrap();
        assert_eq!(config.sample_rate(), Some(48000));
        assert_eq!(config.channel_mode, CHANNEL_MODE_STEREO);
        assert_eq!(config.block_count(), Some(8));
        assert_eq!(config.subband_count(), Some(8));
        assert_eq!(config.allocation, ALLOCATION_LOUDNESS);
        assert_eq!((config.min_bitpool, config.max_bitpool), (42, 250));
        config.check().unwrap();
    }

    #[test]
    fn select_xq_forces_dual_channel_44100() {
        let mut peer = cd_quality_peer();
        peer.block_length |= BLOCK_LENGTH_16;
        let caps = Capabilities::full().intersect(&peer);
        let policy =
            SelectPolicy { force_44100: true, sbc_quality: SbcQuality::Xq, ..SelectPolicy::default() };
        let config = caps.select(&policy).unwrap();
        assert_eq!(config.sample_rate(), Some(44100));
        assert_eq!(config.channel_mode, CHANNEL_MODE_DUAL);
        assert_eq!(config.block_count(), Some(16));
        assert_eq!(config.subband_count(), Some(8));
        assert_eq!(config.allocation, ALLOCATION_LOUDNESS);
        config.check().unwrap();
    }

    #[test]
    fn select_xq_downgrades_without_dual_channel() {
        let mut peer = cd_quality_peer();
        peer.block_length |= BLOCK_LENGTH_16;
        peer.channel_mode = CHANNEL_MODE_STEREO | CHANNEL_MODE_MONO;
        let caps = Capabilities::full().intersect(&peer);
        let policy = SelectPolicy { sbc_quality: SbcQuality::Xq, ..SelectPolicy::default() };
        let config = caps.select(&policy).unwrap();
        assert_eq!(config.channel_mode, CHANNEL_MODE_STEREO);
        config.check().unwrap();
    }

    #[test]
    fn select_xq_downgrades_without_sixteen_blocks() {
        // cd_quality_peer offers 4 and 8 blocks only: the whole XQ gate
        // falls through to plain high-quality selection
        let caps = Capabilities::full().intersect(&cd_quality_peer());
        let policy = SelectPolicy { sbc_quality: SbcQuality::Xq, ..SelectPolicy::default() };
        let config = caps.select(&policy).unwrap();
        assert_eq!(config.channel_mode, CHANNEL_MODE_STEREO);
        assert_eq!(config.block_count(), Some(8));
        assert_eq!(config.sample_rate(), Some(48000));
        config.check().unwrap();
    }

    #[test]
    fn select_force_mono() {
        let caps = Capabilities::full().intersect(&cd_quality_peer());
        let policy = SelectPolicy { force_mono: true, ..SelectPolicy::default() };
        let config = caps.select(&policy).unwrap();
        assert_eq!(config.channels(), Some(1));
        config.check().unwrap();
    }

    #[test]
    fn select_of_any_overlap_passes_check() {
        // joint-stereo only peer at a single rate
        let peer = Capabilities {
            channel_mode: CHANNEL_MODE_JOINT,
            frequency: SAMPLING_FREQ_32000,
            block_length: BLOCK_LENGTH_16,
            subbands: SUBBANDS_8,
            allocation: ALLOCATION_SNR,
            min_bitpool: 18,
            max_bitpool: 35,
        };
        let config = Capabilities::full().intersect(&peer).select(&SelectPolicy::default()).unwrap();
        config.check().unwrap();
        assert_eq!(config.sample_rate(), Some(32000));
        assert_eq!(config.allocation, ALLOCATION_SNR);
    }

    #[test]
    fn check_rejects_multi_valued_and_bad_ranges() {
        let mut config = Capabilities::full().intersect(&cd_quality_peer()).select(&SelectPolicy::default()).unwrap();
        config.frequency = SAMPLING_FREQ_44100 | SAMPLING_FREQ_48000;
        assert_eq!(config.check().unwrap_err().kind, crate::ErrorKind::InvalidConfiguration(CapabilityField::Rate));

        let mut config = Capabilities::full().select(&SelectPolicy::default()).unwrap();
        config.allocation = 0;
        assert_eq!(
            config.check().unwrap_err().kind,
            crate::ErrorKind::InvalidConfiguration(CapabilityField::AllocationMethod)
        );

        let mut config = Capabilities::full().select(&SelectPolicy::default()).unwrap();
        config.min_bitpool = 100;
        config.max_bitpool = 50;
        assert_eq!(
            config.check().unwrap_err().kind,
            crate::ErrorKind::InvalidConfiguration(CapabilityField::BitPoolRange)
        );
    }

    #[test]
    fn empty_overlap_fails_selection() {
        let mut ours = Capabilities::full();
        ours.frequency = SAMPLING_FREQ_48000;
        let mut peer = Capabilities::full();
        peer.frequency = SAMPLING_FREQ_16000;
        let caps = ours.intersect(&peer);
        assert!(caps.select(&SelectPolicy::default()).is_err());
    }
}

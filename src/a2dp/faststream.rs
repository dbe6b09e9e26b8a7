//! FastStream capability handling.
//!
//! FastStream is a CSR vendor codec carrying SBC-framed music together with
//! an optional voice backchannel in the opposite direction. The blob holds
//! a direction mask and separate sampling frequency masks for the music and
//! voice streams.

use super::{
    best_bit, bit_value, invalid, read_vendor_info, write_vendor_info, BitTable, CapabilityField,
    CodecCapabilities, CodecId, SelectPolicy,
};
use crate::Result;

/// Music stream (towards the remote sink) supported.
pub const DIRECTION_MUSIC: u8 = 1 << 0;
/// Voice backchannel (towards us) supported.
pub const DIRECTION_VOICE: u8 = 1 << 1;

/// 48 kHz music sampling.
pub const SAMPLING_FREQ_MUSIC_48000: u8 = 1 << 0;
/// 44.1 kHz music sampling.
pub const SAMPLING_FREQ_MUSIC_44100: u8 = 1 << 1;

/// 16 kHz voice sampling.
pub const SAMPLING_FREQ_VOICE_16000: u8 = 1 << 1;

const MUSIC_FREQS: &BitTable<u32> =
    &[(SAMPLING_FREQ_MUSIC_44100 as u16, 44100), (SAMPLING_FREQ_MUSIC_48000 as u16, 48000)];

const VOICE_FREQS: &BitTable<u32> = &[(SAMPLING_FREQ_VOICE_16000 as u16, 16000)];

/// FastStream capability structure.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    /// Direction bitmask.
    pub direction: u8,
    /// Music sampling frequency bitmask.
    pub frequency_music: u8,
    /// Voice sampling frequency bitmask.
    pub frequency_voice: u8,
}

impl Capabilities {
    /// Everything the FastStream codec supports.
    pub fn full() -> Self {
        Self {
            direction: DIRECTION_MUSIC | DIRECTION_VOICE,
            frequency_music: SAMPLING_FREQ_MUSIC_44100 | SAMPLING_FREQ_MUSIC_48000,
            frequency_voice: SAMPLING_FREQ_VOICE_16000,
        }
    }

    /// Whether the voice backchannel is enabled.
    pub fn has_voice(&self) -> bool {
        self.direction & DIRECTION_VOICE != 0
    }

    /// Voice backchannel sampling rate of a single-valued configuration.
    pub fn voice_sample_rate(&self) -> Option<u32> {
        bit_value(self.frequency_voice as u16, VOICE_FREQS)
    }
}

impl CodecCapabilities for Capabilities {
    const SIZE: usize = 8;

    fn from_bytes(blob: &[u8]) -> Result<Self> {
        let payload = read_vendor_info(CodecId::FASTSTREAM, blob)?;
        if payload.len() != 2 {
            return Err(invalid(CapabilityField::Size));
        }
        Ok(Self {
            direction: payload[0],
            frequency_music: payload[1] & 0x0F,
            frequency_voice: payload[1] >> 4,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(Self::SIZE);
        write_vendor_info(CodecId::FASTSTREAM, &mut blob);
        blob.push(self.direction);
        blob.push((self.frequency_voice << 4) | (self.frequency_music & 0x0F));
        blob
    }

    fn intersect(&self, peer: &Self) -> Self {
        Self {
            direction: self.direction & peer.direction,
            frequency_music: self.frequency_music & peer.frequency_music,
            frequency_voice: self.frequency_voice & peer.frequency_voice,
        }
    }

    fn check(&self) -> Result<()> {
        if self.direction == 0 || self.direction & !(DIRECTION_MUSIC | DIRECTION_VOICE) != 0 {
            return Err(invalid(CapabilityField::Directions));
        }
        if self.direction & DIRECTION_MUSIC != 0 && bit_value(self.frequency_music as u16, MUSIC_FREQS).is_none()
        {
            return Err(invalid(CapabilityField::MusicRate));
        }
        if self.direction & DIRECTION_VOICE != 0 && self.voice_sample_rate().is_none() {
            return Err(invalid(CapabilityField::VoiceRate));
        }
        Ok(())
    }

    fn select(&self, policy: &SelectPolicy) -> Result<Self> {
        if self.direction == 0 {
            return Err(invalid(CapabilityField::Directions));
        }
        let mut config = self.clone();

        if self.direction & DIRECTION_MUSIC != 0 {
            config.frequency_music = if policy.force_44100 && self.frequency_music & SAMPLING_FREQ_MUSIC_44100 != 0
            {
                SAMPLING_FREQ_MUSIC_44100
            } else {
                best_bit(self.frequency_music as u16, MUSIC_FREQS)
                    .ok_or_else(|| invalid(CapabilityField::MusicRate))?
                    .0 as u8
            };
        } else {
            config.frequency_music = 0;
        }

        if self.direction & DIRECTION_VOICE != 0 {
            config.frequency_voice = best_bit(self.frequency_voice as u16, VOICE_FREQS)
                .ok_or_else(|| invalid(CapabilityField::VoiceRate))?
                .0 as u8;
        } else {
            config.frequency_voice = 0;
        }

        Ok(config)
    }

    fn channels(&self) -> Option<u8> {
        // FastStream music is always two channels, voice one
        if self.direction & DIRECTION_MUSIC != 0 {
            Some(2)
        } else {
            Some(1)
        }
    }

    fn sample_rate(&self) -> Option<u32> {
        bit_value(self.frequency_music as u16, MUSIC_FREQS)
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
        assert_eq!(&blob[..6], &[0x0A, 0x00, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(Capabilities::from_bytes(&blob).unwrap(), caps);
    }

    #[test]
    fn zero_direction_fails_check() {
        let mut config = Capabilities::full();
        config.direction = 0;
        assert_eq!(
            config.check().unwrap_err().kind,
            crate::ErrorKind::InvalidConfiguration(CapabilityField::Directions)
        );
        assert!(config.select(&SelectPolicy::default()).is_err());
    }

    #[test]
    fn select_keeps_voice_backchannel() {
        let config = Capabilities::full().select(&SelectPolicy::default()).unwrap();
        assert!(config.has_voice());
        assert_eq!(config.sample_rate(), Some(48000));
        assert_eq!(config.voice_sample_rate(), Some(16000));
        config.check().unwrap();
    }

    #[test]
    fn music_only_peer_drops_voice_rate() {
        let peer = Capabilities { direction: DIRECTION_MUSIC, ..Capabilities::full() };
        let caps = Capabilities::full().intersect(&peer);
        let config = caps.select(&SelectPolicy::default()).unwrap();
        assert!(!config.has_voice());
        assert_eq!(config.frequency_voice, 0);
        config.check().unwrap();
    }

    #[test]
    fn intersection_is_commutative_and_idempotent() {
        let ours = Capabilities::full();
        let peer = Capabilities {
            direction: DIRECTION_MUSIC,
            frequency_music: SAMPLING_FREQ_MUSIC_48000,
            frequency_voice: 0,
        };
        assert_eq!(ours.intersect(&peer), peer.intersect(&ours));
        assert_eq!(peer.intersect(&peer), peer);
    }
}

//! A2DP codec capability engine.
//!
//! Remote and local stream end-points advertise bit-packed capability blobs
//! per the A2DP specification and the Bluetooth SIG codec annexes. This
//! module implements the negotiation pipeline over them: capability
//! [intersection](Capability::intersect), best-value
//! [selection](Capability::select) and configuration
//! [validation](Capability::check).
//!
//! Blobs are little-endian over the wire; the individual codec modules
//! handle the documented multi-byte field swaps (AAC 12-bit sampling rate,
//! MPEG 15-bit bitrate, LC3plus 16-bit big-endian sampling rate).

use std::fmt;
use strum::Display;

use crate::{Config, Error, ErrorKind, Result, SbcQuality};

pub mod aac;
pub mod aptx;
pub mod faststream;
#[cfg(feature = "lc3plus")]
#[cfg_attr(docsrs, doc(cfg(feature = "lc3plus")))]
pub mod lc3plus;
#[cfg(feature = "ldac")]
#[cfg_attr(docsrs, doc(cfg(feature = "ldac")))]
pub mod ldac;
pub mod mpeg;
pub mod sbc;

/// Numeric value of the unknown codec sentinel.
pub const CODEC_ID_UNKNOWN: u32 = 0xFFFF_FFFF;

/// A2DP codec identifier.
///
/// Standard codecs use the one-byte id from the A2DP specification; vendor
/// codecs are identified by the Bluetooth company id together with the
/// vendor-assigned codec id.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CodecId {
    /// SBC, the mandatory A2DP codec.
    Sbc,
    /// MPEG-1/2 audio (layers I-III).
    Mpeg12,
    /// MPEG-2/4 AAC.
    Mpeg24,
    /// ATRAC family.
    Atrac,
    /// Vendor-specific codec.
    Vendor {
        /// Bluetooth company id.
        vendor: u16,
        /// Vendor-assigned codec id.
        codec: u16,
    },
    /// Unknown codec; the numeric sentinel `0xFFFFFFFF`.
    Unknown,
}

impl CodecId {
    /// Codec id byte of the standard codecs in capability blobs.
    pub const SBC: u8 = 0x00;
    /// See [CodecId::SBC].
    pub const MPEG12: u8 = 0x01;
    /// See [CodecId::SBC].
    pub const MPEG24: u8 = 0x02;
    /// See [CodecId::SBC].
    pub const ATRAC: u8 = 0x04;
    /// Codec id byte announcing a vendor codec.
    pub const VENDOR: u8 = 0xFF;

    /// Creates a vendor codec id.
    pub const fn vendor(vendor: u16, codec: u16) -> Self {
        Self::Vendor { vendor, codec }
    }

    /// aptX (APT Licensing).
    pub const APTX: Self = Self::vendor(0x004F, 0x0001);
    /// aptX HD (Qualcomm).
    pub const APTX_HD: Self = Self::vendor(0x00D7, 0x0024);
    /// FastStream (CSR).
    pub const FASTSTREAM: Self = Self::vendor(0x000A, 0x0001);
    /// LDAC (Sony).
    pub const LDAC: Self = Self::vendor(0x012D, 0x00AA);
    /// LC3plus (Fraunhofer IIS).
    pub const LC3PLUS: Self = Self::vendor(0x08A9, 0x0001);

    /// Parses a codec name, accepting the aliases in common use.
    ///
    /// Unknown names map to [CodecId::Unknown].
    pub fn from_canonical(name: &str) -> Self {
        let squashed: String = name.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        match squashed.to_ascii_lowercase().as_str() {
            "sbc" => Self::Sbc,
            "mp3" | "mpeg" | "mpeg12" => Self::Mpeg12,
            "aac" | "mpeg24" => Self::Mpeg24,
            "atrac" => Self::Atrac,
            "aptx" => Self::APTX,
            "aptxhd" => Self::APTX_HD,
            "faststream" => Self::FASTSTREAM,
            "ldac" => Self::LDAC,
            "lc3plus" => Self::LC3PLUS,
            _ => Self::Unknown,
        }
    }

    /// Canonical codec name, or [None] for codecs without one.
    pub fn canonical_name(&self) -> Option<&'static str> {
        Some(match *self {
            Self::Sbc => "SBC",
            Self::Mpeg12 => "MP3",
            Self::Mpeg24 => "AAC",
            Self::Atrac => "ATRAC",
            Self::APTX => "aptX",
            Self::APTX_HD => "aptX-HD",
            Self::FASTSTREAM => "FastStream",
            Self::LDAC => "LDAC",
            Self::LC3PLUS => "LC3plus",
            _ => return None,
        })
    }

    /// The codec id byte used in capability blobs.
    pub fn capability_byte(&self) -> u8 {
        match self {
            Self::Sbc => Self::SBC,
            Self::Mpeg12 => Self::MPEG12,
            Self::Mpeg24 => Self::MPEG24,
            Self::Atrac => Self::ATRAC,
            Self::Vendor { .. } => Self::VENDOR,
            Self::Unknown => 0xFF,
        }
    }

    /// Packed numeric representation; [CODEC_ID_UNKNOWN] for the sentinel.
    pub fn to_u32(&self) -> u32 {
        match *self {
            Self::Sbc => Self::SBC as u32,
            Self::Mpeg12 => Self::MPEG12 as u32,
            Self::Mpeg24 => Self::MPEG24 as u32,
            Self::Atrac => Self::ATRAC as u32,
            Self::Vendor { vendor, codec } => (vendor as u32) << 16 | codec as u32 | 0x8000_0000,
            Self::Unknown => CODEC_ID_UNKNOWN,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.canonical_name() {
            Some(name) => f.write_str(name),
            None => match self {
                Self::Vendor { vendor, codec } => write!(f, "<{vendor:04X}:{codec:04X}>"),
                _ => write!(f, "<{:08X}>", self.to_u32()),
            },
        }
    }
}

/// Capability field rejected by configuration validation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CapabilityField {
    /// Blob length differs from the codec structure size.
    Size,
    /// Channel mode.
    ChannelMode,
    /// Sampling rate.
    Rate,
    /// SBC subband count.
    SubBands,
    /// SBC block length.
    BlockLength,
    /// SBC allocation method.
    AllocationMethod,
    /// MPEG audio layer.
    MpegLayer,
    /// AAC object type.
    ObjectType,
    /// FastStream direction mask.
    Directions,
    /// FastStream voice sampling rate.
    VoiceRate,
    /// FastStream music sampling rate.
    MusicRate,
    /// LC3plus frame duration.
    FrameDuration,
    /// SBC bitpool range.
    BitPoolRange,
}

pub(crate) fn invalid(field: CapabilityField) -> Error {
    Error::new(ErrorKind::InvalidConfiguration(field))
}

/// Stream direction as seen from the daemon.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Display)]
pub enum StreamDirection {
    /// We encode and send towards the remote sink.
    #[strum(serialize = "source")]
    Source,
    /// The remote encodes and we decode.
    #[strum(serialize = "sink")]
    Sink,
}

/// Configuration selection policy derived from the daemon [Config].
#[derive(Clone, Copy, Debug)]
pub struct SelectPolicy {
    /// Restrict to a single channel.
    pub force_mono: bool,
    /// Restrict to 44.1 kHz.
    pub force_44100: bool,
    /// SBC quality knob.
    pub sbc_quality: SbcQuality,
    /// AAC bitrate cap in bits per second.
    pub aac_bitrate: u32,
    /// Permit variable bitrate AAC.
    pub aac_vbr: bool,
}

impl SelectPolicy {
    /// Builds the policy from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            force_mono: config.force_mono,
            force_44100: config.force_44100,
            sbc_quality: config.sbc_quality,
            aac_bitrate: config.aac_bitrate,
            aac_vbr: config.aac_vbr,
        }
    }
}

impl Default for SelectPolicy {
    fn default() -> Self {
        Self {
            force_mono: false,
            force_44100: false,
            sbc_quality: SbcQuality::High,
            aac_bitrate: 220_000,
            aac_vbr: true,
        }
    }
}

/// Ordered mapping from capability bit to semantic value.
///
/// Tables list mono before multi-channel modes and lower before higher
/// sampling rates, so picking the best value scans from the end.
pub(crate) type BitTable<T> = [(u16, T)];

/// Invokes `f` for every enabled (bit, value) pair of `mask`.
pub(crate) fn foreach_bit<T: Copy>(mask: u16, table: &BitTable<T>, mut f: impl FnMut(u16, T)) {
    for &(bit, value) in table {
        if mask & bit != 0 {
            f(bit, value);
        }
    }
}

/// Best enabled (bit, value) pair of `mask`, scanning from the table end.
pub(crate) fn best_bit<T: Copy>(mask: u16, table: &BitTable<T>) -> Option<(u16, T)> {
    table.iter().rev().find(|(bit, _)| mask & bit != 0).copied()
}

/// Value of a single-valued mask, [None] when the mask has extra bits or
/// is not a member of the table.
pub(crate) fn bit_value<T: Copy>(mask: u16, table: &BitTable<T>) -> Option<T> {
    let mut matched = None;
    let mut count = 0;
    foreach_bit(mask, table, |bit, value| {
        count += 1;
        matched = Some((bit, value));
    });
    match matched {
        Some((bit, value)) if count == 1 && bit == mask => Some(value),
        _ => None,
    }
}

/// Vendor codec capability prefix: company id and vendor codec id, both
/// little-endian over the wire. The company id occupies four bytes per the
/// A2DP vendor-specific codec annex.
pub(crate) fn write_vendor_info(id: CodecId, out: &mut Vec<u8>) {
    if let CodecId::Vendor { vendor, codec } = id {
        out.extend_from_slice(&(vendor as u32).to_le_bytes());
        out.extend_from_slice(&codec.to_le_bytes());
    }
}

/// Parses and verifies the vendor capability prefix, returning the payload.
pub(crate) fn read_vendor_info(id: CodecId, blob: &[u8]) -> Result<&[u8]> {
    let CodecId::Vendor { vendor, codec } = id else {
        return Ok(blob);
    };
    if blob.len() < 6 {
        return Err(invalid(CapabilityField::Size));
    }
    let blob_vendor = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
    let blob_codec = u16::from_le_bytes([blob[4], blob[5]]);
    if blob_vendor != vendor as u32 || blob_codec != codec {
        return Err(Error::new(ErrorKind::CodecNotSupported));
    }
    Ok(&blob[6..])
}

/// Capability blob of any supported codec.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Capability {
    /// SBC.
    Sbc(sbc::Capabilities),
    /// MPEG-1/2 audio.
    Mpeg(mpeg::Capabilities),
    /// MPEG-2/4 AAC.
    Aac(aac::Capabilities),
    /// aptX.
    Aptx(aptx::Capabilities),
    /// aptX HD.
    AptxHd(aptx::HdCapabilities),
    /// FastStream.
    FastStream(faststream::Capabilities),
    /// LDAC.
    #[cfg(feature = "ldac")]
    Ldac(ldac::Capabilities),
    /// LC3plus.
    #[cfg(feature = "lc3plus")]
    Lc3plus(lc3plus::Capabilities),
}

macro_rules! for_each_capability {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Capability::Sbc($inner) => $body,
            Capability::Mpeg($inner) => $body,
            Capability::Aac($inner) => $body,
            Capability::Aptx($inner) => $body,
            Capability::AptxHd($inner) => $body,
            Capability::FastStream($inner) => $body,
            #[cfg(feature = "ldac")]
            Capability::Ldac($inner) => $body,
            #[cfg(feature = "lc3plus")]
            Capability::Lc3plus($inner) => $body,
        }
    };
}

impl Capability {
    /// Parses a capability blob for the specified codec.
    pub fn parse(codec: CodecId, blob: &[u8]) -> Result<Self> {
        Ok(match codec {
            CodecId::Sbc => Self::Sbc(sbc::Capabilities::from_bytes(blob)?),
            CodecId::Mpeg12 => Self::Mpeg(mpeg::Capabilities::from_bytes(blob)?),
            CodecId::Mpeg24 => Self::Aac(aac::Capabilities::from_bytes(blob)?),
            CodecId::APTX => Self::Aptx(aptx::Capabilities::from_bytes(blob)?),
            CodecId::APTX_HD => Self::AptxHd(aptx::HdCapabilities::from_bytes(blob)?),
            CodecId::FASTSTREAM => Self::FastStream(faststream::Capabilities::from_bytes(blob)?),
            #[cfg(feature = "ldac")]
            CodecId::LDAC => Self::Ldac(ldac::Capabilities::from_bytes(blob)?),
            #[cfg(feature = "lc3plus")]
            CodecId::LC3PLUS => Self::Lc3plus(lc3plus::Capabilities::from_bytes(blob)?),
            _ => return Err(Error::new(ErrorKind::CodecNotSupported)),
        })
    }

    /// The codec this capability belongs to.
    pub fn codec_id(&self) -> CodecId {
        match self {
            Self::Sbc(_) => CodecId::Sbc,
            Self::Mpeg(_) => CodecId::Mpeg12,
            Self::Aac(_) => CodecId::Mpeg24,
            Self::Aptx(_) => CodecId::APTX,
            Self::AptxHd(_) => CodecId::APTX_HD,
            Self::FastStream(_) => CodecId::FASTSTREAM,
            #[cfg(feature = "ldac")]
            Self::Ldac(_) => CodecId::LDAC,
            #[cfg(feature = "lc3plus")]
            Self::Lc3plus(_) => CodecId::LC3PLUS,
        }
    }

    /// Serializes the capability to its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        for_each_capability!(self, c => c.to_bytes())
    }

    /// Intersects with peer capabilities of the same codec.
    pub fn intersect(&self, peer: &Self) -> Result<Self> {
        Ok(match (self, peer) {
            (Self::Sbc(a), Self::Sbc(b)) => Self::Sbc(a.intersect(b)),
            (Self::Mpeg(a), Self::Mpeg(b)) => Self::Mpeg(a.intersect(b)),
            (Self::Aac(a), Self::Aac(b)) => Self::Aac(a.intersect(b)),
            (Self::Aptx(a), Self::Aptx(b)) => Self::Aptx(a.intersect(b)),
            (Self::AptxHd(a), Self::AptxHd(b)) => Self::AptxHd(a.intersect(b)),
            (Self::FastStream(a), Self::FastStream(b)) => Self::FastStream(a.intersect(b)),
            #[cfg(feature = "ldac")]
            (Self::Ldac(a), Self::Ldac(b)) => Self::Ldac(a.intersect(b)),
            #[cfg(feature = "lc3plus")]
            (Self::Lc3plus(a), Self::Lc3plus(b)) => Self::Lc3plus(a.intersect(b)),
            _ => return Err(Error::new(ErrorKind::CodecNotSupported)),
        })
    }

    /// Validates a single-valued configuration blob.
    pub fn check(&self) -> Result<()> {
        for_each_capability!(self, c => c.check())
    }

    /// Selects a single-valued configuration out of (already intersected)
    /// capabilities.
    pub fn select(&self, policy: &SelectPolicy) -> Result<Self> {
        Ok(match self {
            Self::Sbc(c) => Self::Sbc(c.select(policy)?),
            Self::Mpeg(c) => Self::Mpeg(c.select(policy)?),
            Self::Aac(c) => Self::Aac(c.select(policy)?),
            Self::Aptx(c) => Self::Aptx(c.select(policy)?),
            Self::AptxHd(c) => Self::AptxHd(c.select(policy)?),
            Self::FastStream(c) => Self::FastStream(c.select(policy)?),
            #[cfg(feature = "ldac")]
            Self::Ldac(c) => Self::Ldac(c.select(policy)?),
            #[cfg(feature = "lc3plus")]
            Self::Lc3plus(c) => Self::Lc3plus(c.select(policy)?),
        })
    }

    /// Channel count of a selected configuration.
    pub fn channels(&self) -> Option<u8> {
        for_each_capability!(self, c => c.channels())
    }

    /// Sampling rate of a selected configuration.
    pub fn sample_rate(&self) -> Option<u32> {
        for_each_capability!(self, c => c.sample_rate())
    }

    /// Length of the codec-specific RTP media payload header, or [None]
    /// when the codec does not use RTP framing at all.
    pub fn rtp_codec_header_len(&self) -> Option<usize> {
        match self {
            Self::Sbc(_) => Some(1),
            Self::Mpeg(_) => Some(4),
            Self::Aac(_) => Some(0),
            // aptX family and FastStream send bare codec frames
            Self::Aptx(_) | Self::AptxHd(_) | Self::FastStream(_) => None,
            #[cfg(feature = "ldac")]
            Self::Ldac(_) => Some(1),
            #[cfg(feature = "lc3plus")]
            Self::Lc3plus(_) => Some(1),
        }
    }

    /// Whether the codec carries a voice backchannel besides the main
    /// stream.
    pub fn has_backchannel(&self) -> bool {
        match self {
            Self::FastStream(c) => c.has_voice(),
            _ => false,
        }
    }
}

/// Common interface of per-codec capability structures.
pub trait CodecCapabilities: Sized + Clone {
    /// Wire size of the capability structure in bytes.
    const SIZE: usize;

    /// Parses the wire representation.
    fn from_bytes(blob: &[u8]) -> Result<Self>;

    /// Serializes to the wire representation.
    fn to_bytes(&self) -> Vec<u8>;

    /// Bitwise intersection with peer capabilities; non-bitmask fields use
    /// per-field treatment.
    fn intersect(&self, peer: &Self) -> Self;

    /// Validates this value as a single-valued configuration.
    fn check(&self) -> Result<()>;

    /// Selects a single-valued configuration out of this capability set.
    fn select(&self, policy: &SelectPolicy) -> Result<Self>;

    /// Channel count of a single-valued configuration.
    fn channels(&self) -> Option<u8>;

    /// Sampling rate of a single-valued configuration.
    fn sample_rate(&self) -> Option<u32>;
}

/// Local stream end-point advertised to the Bluetooth service.
#[derive(Clone, Debug)]
pub struct LocalSep {
    /// Codec of this end-point.
    pub codec: CodecId,
    /// Direction of the main stream.
    pub direction: StreamDirection,
    /// Full capabilities advertised to peers.
    pub capabilities: Capability,
    /// Whether the end-point supports delay reporting.
    pub delay_reporting: bool,
}

/// The set of end-points to advertise under the given configuration.
///
/// Optional codecs compiled out by crate features are omitted.
pub fn local_seps(config: &Config) -> Vec<LocalSep> {
    let mut seps = Vec::new();
    let mut push = |codec, direction, capabilities| {
        seps.push(LocalSep { codec, direction, capabilities, delay_reporting: true })
    };

    for direction in [StreamDirection::Source, StreamDirection::Sink] {
        let enabled = match direction {
            StreamDirection::Source => config.profiles.a2dp_source,
            StreamDirection::Sink => config.profiles.a2dp_sink,
        };
        if !enabled {
            continue;
        }

        push(CodecId::Sbc, direction, Capability::Sbc(sbc::Capabilities::full()));
        push(CodecId::Mpeg12, direction, Capability::Mpeg(mpeg::Capabilities::full()));
        push(CodecId::Mpeg24, direction, Capability::Aac(aac::Capabilities::full()));
        push(CodecId::APTX, direction, Capability::Aptx(aptx::Capabilities::full()));
        push(CodecId::APTX_HD, direction, Capability::AptxHd(aptx::HdCapabilities::full()));
        #[cfg(feature = "ldac")]
        push(CodecId::LDAC, direction, Capability::Ldac(ldac::Capabilities::full()));
        #[cfg(feature = "lc3plus")]
        push(CodecId::LC3PLUS, direction, Capability::Lc3plus(lc3plus::Capabilities::full()));
    }

    // FastStream is inherently bidirectional; advertise it once as source.
    if config.profiles.a2dp_source {
        push(
            CodecId::FASTSTREAM,
            StreamDirection::Source,
            Capability::FastStream(faststream::Capabilities::full()),
        );
    }

    seps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_id_string_round_trip() {
        let all = [
            CodecId::Sbc,
            CodecId::Mpeg12,
            CodecId::Mpeg24,
            CodecId::Atrac,
            CodecId::APTX,
            CodecId::APTX_HD,
            CodecId::FASTSTREAM,
            CodecId::LDAC,
            CodecId::LC3PLUS,
        ];
        for codec in all {
            let name = codec.canonical_name().unwrap();
            assert_eq!(CodecId::from_canonical(name), codec, "round trip of {name}");
            // canonicalization is idempotent
            assert_eq!(CodecId::from_canonical(name).canonical_name().unwrap(), name);
        }
    }

    #[test]
    fn codec_id_aliases() {
        assert_eq!(CodecId::from_canonical("apt-x"), CodecId::vendor(0x004F, 0x0001));
        assert_eq!(CodecId::vendor(0x004F, 0x0001).canonical_name(), Some("aptX"));
        assert_eq!(CodecId::from_canonical("apt-X HD"), CodecId::APTX_HD);
        assert_eq!(CodecId::from_canonical("mp3"), CodecId::Mpeg12);
    }

    #[test]
    fn unknown_codec_is_sentinel() {
        let unknown = CodecId::from_canonical("frobnicate");
        assert_eq!(unknown, CodecId::Unknown);
        assert_eq!(unknown.to_u32(), CODEC_ID_UNKNOWN);
        assert_eq!(unknown.canonical_name(), None);
    }

    #[test]
    fn vendor_info_round_trip() {
        let mut blob = Vec::new();
        write_vendor_info(CodecId::APTX, &mut blob);
        blob.push(0xAB);
        assert_eq!(blob.len(), 7);
        // little-endian company id
        assert_eq!(&blob[..4], &[0x4F, 0x00, 0x00, 0x00]);
        assert_eq!(read_vendor_info(CodecId::APTX, &blob).unwrap(), &[0xAB]);
        assert_eq!(
            read_vendor_info(CodecId::APTX_HD, &blob).unwrap_err().kind,
            ErrorKind::CodecNotSupported
        );
    }

    #[test]
    fn best_bit_scans_from_table_end() {
        const TABLE: &BitTable<u32> = &[(0x8, 16000), (0x4, 32000), (0x2, 44100), (0x1, 48000)];
        assert_eq!(best_bit(0x8 | 0x2, TABLE), Some((0x2, 44100)));
        assert_eq!(best_bit(0xF, TABLE), Some((0x1, 48000)));
        assert_eq!(best_bit(0, TABLE), None);
    }

    #[test]
    fn local_seps_follow_profile_config() {
        let config = Config::default();
        let seps = local_seps(&config);
        assert!(seps.iter().any(|s| s.codec == CodecId::Sbc && s.direction == StreamDirection::Source));
        assert!(seps.iter().any(|s| s.codec == CodecId::Sbc && s.direction == StreamDirection::Sink));
        assert!(seps.iter().any(|s| s.codec == CodecId::FASTSTREAM));

        let mut config = Config::default();
        config.profiles.a2dp_source = false;
        let seps = local_seps(&config);
        assert!(seps.iter().all(|s| s.direction == StreamDirection::Sink));
        assert!(!seps.iter().any(|s| s.codec == CodecId::FASTSTREAM));
    }
}

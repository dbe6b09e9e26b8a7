//! Codec abstraction.
//!
//! Third-party codec libraries are consumed through the narrow
//! [StreamCodec] contract: encode a block of interleaved PCM samples into
//! codec frames, decode frames back into a block, and answer frame-size
//! queries so the workers can size their buffers. Implementations register
//! with the [CodecRegistry] keyed by A2DP codec id; builds without a
//! library for some codec simply do not register it and the transport
//! reports [CodecNotSupported](crate::ErrorKind::CodecNotSupported).

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use std::{collections::HashMap, sync::Arc};
use strum::{Display, EnumString};

use crate::{a2dp::Capability, a2dp::CodecId, Error, ErrorKind, Result};

pub mod msbc;

/// Voice codec of an HFP/HSP synchronous link.
///
/// Ids match the HFP codec-negotiation values exchanged over `AT+BAC`.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString,
    FromPrimitive, ToPrimitive,
)]
#[repr(u8)]
pub enum HfpCodec {
    /// Narrow-band, companded by the controller.
    #[default]
    #[strum(serialize = "CVSD")]
    Cvsd = 1,
    /// Wideband speech over transparent eSCO.
    #[strum(serialize = "mSBC")]
    Msbc = 2,
    /// Super-wideband speech.
    #[strum(serialize = "LC3-SWB")]
    Lc3Swb = 3,
}

impl HfpCodec {
    /// Codec id as exchanged in the `AT+BAC`/`+BCS` handshake.
    pub fn id(&self) -> u8 {
        *self as u8
    }

    /// Codec for a negotiation id.
    pub fn from_id(id: u8) -> Option<Self> {
        Self::from_u8(id)
    }

    /// Voice sampling rate in frames per second.
    pub fn sample_rate(&self) -> u32 {
        match self {
            Self::Cvsd => 8000,
            Self::Msbc => 16000,
            Self::Lc3Swb => 32000,
        }
    }

    /// Whether the link requires the transparent eSCO voice setting.
    pub fn is_transparent(&self) -> bool {
        !matches!(self, Self::Cvsd)
    }
}

/// Result of one encode pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EncodeInfo {
    /// Interleaved PCM samples consumed.
    pub consumed_samples: usize,
    /// Encoded bytes produced.
    pub produced_bytes: usize,
    /// Number of complete codec frames produced.
    pub frames: usize,
}

/// Result of one decode pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DecodeInfo {
    /// Encoded bytes consumed.
    pub consumed_bytes: usize,
    /// Interleaved PCM samples produced.
    pub produced_samples: usize,
}

/// Uniform frame-to-frame codec contract.
///
/// A codec handle is owned by the worker that created it and is not shared
/// between directions.
pub trait StreamCodec: Send {
    /// Interleaved PCM samples per codec frame.
    fn frame_samples(&self) -> usize;

    /// Upper bound of an encoded frame in bytes.
    fn frame_max_bytes(&self) -> usize;

    /// Encodes full frames out of `pcm` into `out`.
    ///
    /// Trailing samples short of a frame are left unconsumed.
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<EncodeInfo>;

    /// Decodes frames from `data` into `pcm`.
    ///
    /// Partial codec state is retained across calls; trailing bytes short
    /// of a frame are left unconsumed.
    fn decode(&mut self, data: &[u8], pcm: &mut [i16]) -> Result<DecodeInfo>;

    /// Drops internal codec state, as on a stream flush.
    fn reset(&mut self) {}

    /// Produces concealment output for one lost frame.
    ///
    /// The default writes silence, which is the right thing for SBC;
    /// codecs with native packet-loss concealment override this.
    fn conceal(&mut self, pcm: &mut [i16]) -> usize {
        let n = self.frame_samples().min(pcm.len());
        pcm[..n].fill(0);
        n
    }
}

/// PCM passthrough "codec".
///
/// Used for transparent links, most prominently CVSD voice over SCO where
/// the controller does the companding and the host sees plain S16LE
/// frames.
pub struct PcmPassthrough {
    frame_samples: usize,
}

impl PcmPassthrough {
    /// Creates a passthrough handle moving `frame_samples` samples per
    /// pass.
    pub fn new(frame_samples: usize) -> Self {
        Self { frame_samples }
    }
}

impl StreamCodec for PcmPassthrough {
    fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    fn frame_max_bytes(&self) -> usize {
        self.frame_samples * 2
    }

    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<EncodeInfo> {
        let frames = (pcm.len() / self.frame_samples).min(out.len() / self.frame_max_bytes());
        let samples = frames * self.frame_samples;
        for (sample, chunk) in pcm[..samples].iter().zip(out.chunks_exact_mut(2)) {
            chunk.copy_from_slice(&sample.to_le_bytes());
        }
        Ok(EncodeInfo { consumed_samples: samples, produced_bytes: samples * 2, frames })
    }

    fn decode(&mut self, data: &[u8], pcm: &mut [i16]) -> Result<DecodeInfo> {
        let samples = (data.len() / 2).min(pcm.len());
        for (chunk, sample) in data[..samples * 2].chunks_exact(2).zip(pcm.iter_mut()) {
            *sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        }
        Ok(DecodeInfo { consumed_bytes: samples * 2, produced_samples: samples })
    }
}

/// Factory producing a codec handle for a selected configuration.
pub type CodecFactory = Arc<dyn Fn(&Capability) -> Result<Box<dyn StreamCodec>> + Send + Sync>;

/// Factory producing one encoder and one decoder handle for a voice codec.
pub type HfpCodecFactory =
    Arc<dyn Fn() -> Result<(Box<dyn StreamCodec>, Box<dyn StreamCodec>)> + Send + Sync>;

/// Registry binding codec libraries to A2DP codec ids.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    factories: HashMap<CodecId, CodecFactory>,
    hfp_factories: HashMap<HfpCodec, HfpCodecFactory>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CodecRegistry").field("codecs", &self.factories.keys().collect::<Vec<_>>()).finish()
    }
}

impl CodecRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a codec factory, replacing any previous binding.
    pub fn register(
        &mut self, codec: CodecId,
        factory: impl Fn(&Capability) -> Result<Box<dyn StreamCodec>> + Send + Sync + 'static,
    ) {
        log::debug!("Registering codec backend for {codec}");
        self.factories.insert(codec, Arc::new(factory));
    }

    /// Whether a backend is bound for the codec.
    pub fn supports(&self, codec: CodecId) -> bool {
        self.factories.contains_key(&codec)
    }

    /// Creates a codec handle for the selected configuration.
    pub fn create(&self, config: &Capability) -> Result<Box<dyn StreamCodec>> {
        let codec = config.codec_id();
        let factory = self.factories.get(&codec).ok_or_else(|| {
            Error::with_message(ErrorKind::CodecNotSupported, format!("no backend for {codec}"))
        })?;
        factory(config)
    }

    /// Registers a voice codec backend.
    pub fn register_hfp(
        &mut self, codec: HfpCodec,
        factory: impl Fn() -> Result<(Box<dyn StreamCodec>, Box<dyn StreamCodec>)> + Send + Sync + 'static,
    ) {
        log::debug!("Registering voice codec backend for {codec}");
        self.hfp_factories.insert(codec, Arc::new(factory));
    }

    /// Whether a backend is bound for the voice codec.
    ///
    /// CVSD is always supported: the controller does the companding.
    pub fn supports_hfp(&self, codec: HfpCodec) -> bool {
        codec == HfpCodec::Cvsd || self.hfp_factories.contains_key(&codec)
    }

    /// Creates the encoder and decoder pair for a wideband voice codec.
    pub fn create_hfp_pair(
        &self, codec: HfpCodec,
    ) -> Result<(Box<dyn StreamCodec>, Box<dyn StreamCodec>)> {
        let factory = self.hfp_factories.get(&codec).ok_or_else(|| {
            Error::with_message(ErrorKind::CodecNotSupported, format!("no backend for {codec}"))
        })?;
        factory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a2dp::sbc;

    #[test]
    fn hfp_codec_negotiation_ids() {
        assert_eq!(HfpCodec::from_id(1), Some(HfpCodec::Cvsd));
        assert_eq!(HfpCodec::from_id(2), Some(HfpCodec::Msbc));
        assert_eq!(HfpCodec::from_id(9), None);
        assert_eq!(HfpCodec::Lc3Swb.id(), 3);
        assert_eq!(HfpCodec::from_id(HfpCodec::Msbc.id()), Some(HfpCodec::Msbc));
    }

    #[test]
    fn passthrough_round_trip() {
        let mut codec = PcmPassthrough::new(4);
        let pcm = [100i16, -100, 2000, -32768, 7];
        let mut out = [0u8; 16];
        let info = codec.encode(&pcm, &mut out).unwrap();
        // the trailing sample short of a frame stays unconsumed
        assert_eq!(info, EncodeInfo { consumed_samples: 4, produced_bytes: 8, frames: 1 });

        let mut decoded = [0i16; 8];
        let info = codec.decode(&out[..8], &mut decoded).unwrap();
        assert_eq!(info.produced_samples, 4);
        assert_eq!(&decoded[..4], &pcm[..4]);
    }

    #[test]
    fn conceal_writes_silence() {
        let mut codec = PcmPassthrough::new(8);
        let mut pcm = [1234i16; 8];
        assert_eq!(codec.conceal(&mut pcm), 8);
        assert!(pcm.iter().all(|&s| s == 0));
    }

    #[test]
    fn registry_dispatches_by_codec() {
        let mut registry = CodecRegistry::new();
        assert!(!registry.supports(CodecId::Sbc));
        registry.register(CodecId::Sbc, |_config| Ok(Box::new(PcmPassthrough::new(128))));
        assert!(registry.supports(CodecId::Sbc));

        let config = crate::a2dp::Capability::Sbc(sbc::Capabilities::full());
        let codec = registry.create(&config).unwrap();
        assert_eq!(codec.frame_samples(), 128);

        let config = crate::a2dp::Capability::Aptx(crate::a2dp::aptx::Capabilities::full());
        match registry.create(&config) {
            Err(e) => assert_eq!(e.kind, ErrorKind::CodecNotSupported),
            Ok(_) => panic!("expected CodecNotSupported error"),
        }
    }
}

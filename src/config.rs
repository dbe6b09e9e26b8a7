//! Daemon configuration.

use std::{path::PathBuf, time::Duration};
use strum::{Display, EnumString};

/// SBC encoder quality policy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString)]
pub enum SbcQuality {
    /// Bitpool capped for low-bandwidth links.
    #[strum(serialize = "low")]
    Low,
    /// Middle-quality bitpool cap.
    #[strum(serialize = "medium")]
    Medium,
    /// A2DP recommended high-quality settings.
    #[default]
    #[strum(serialize = "high")]
    High,
    /// SBC XQ: dual-channel near-transparent encoding.
    ///
    /// Requires dual channel mode, 16 blocks, 8 subbands and loudness
    /// allocation; falls back to [SbcQuality::High] when the peer cannot
    /// do all of that.
    #[strum(serialize = "xq")]
    Xq,
}

/// Bluetooth profiles handled by the daemon.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ProfileSet {
    /// A2DP source (we stream towards the remote sink).
    pub a2dp_source: bool,
    /// A2DP sink (the remote streams towards us).
    pub a2dp_sink: bool,
    /// HFP audio gateway role.
    pub hfp_ag: bool,
    /// HFP hands-free role.
    pub hfp_hf: bool,
    /// HSP audio gateway role.
    pub hsp_ag: bool,
    /// HSP headset role.
    pub hsp_hs: bool,
    /// BLE-MIDI peripheral.
    pub midi: bool,
}

impl Default for ProfileSet {
    fn default() -> Self {
        Self {
            a2dp_source: true,
            a2dp_sink: true,
            hfp_ag: cfg!(feature = "hfp"),
            hfp_hf: cfg!(feature = "hfp"),
            hsp_ag: cfg!(feature = "hfp"),
            hsp_hs: cfg!(feature = "hfp"),
            midi: cfg!(feature = "midi"),
        }
    }
}

/// Immutable daemon configuration.
///
/// Constructed once at startup and shared by reference. Tests that need
/// different knobs construct a replacement value.
#[derive(Clone, Debug)]
pub struct Config {
    /// Profiles to register with the Bluetooth service.
    pub profiles: ProfileSet,
    /// Adapters to serve; empty serves every controller that appears.
    pub adapter_filter: Vec<String>,
    /// SBC encoder quality.
    pub sbc_quality: SbcQuality,
    /// Restrict every A2DP configuration to a single channel.
    pub force_mono: bool,
    /// Restrict every A2DP configuration to 44.1 kHz.
    pub force_44100: bool,
    /// AAC encoder bitrate in bits per second.
    pub aac_bitrate: u32,
    /// Prefer variable bitrate AAC when the peer supports it.
    pub aac_vbr: bool,
    /// Keep transports acquired for this long after the last client
    /// disconnects.
    pub keep_alive: Option<Duration>,
    /// Directory for per-device persistent state.
    pub storage_root: PathBuf,
    /// Apple-specific AT feature bits announced over HFP (XAPL).
    pub xapl_features: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profiles: ProfileSet::default(),
            adapter_filter: Vec::new(),
            sbc_quality: SbcQuality::default(),
            force_mono: false,
            force_44100: false,
            aac_bitrate: 220_000,
            aac_vbr: true,
            keep_alive: None,
            storage_root: PathBuf::from("/var/lib/blaudio"),
            // battery + dock-state reporting
            xapl_features: 0x02 | 0x04,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbc_quality_from_string() {
        assert_eq!("xq".parse::<SbcQuality>().unwrap(), SbcQuality::Xq);
        assert_eq!(SbcQuality::High.to_string(), "high");
        assert!("ultra".parse::<SbcQuality>().is_err());
    }
}

//! Client-facing PCM halves of a transport.
//!
//! Each transport owns one PCM per direction: the main stream and, for
//! codecs with a voice backchannel, a second one. A PCM carries the sample
//! geometry negotiated for the link, per-channel volume, delay bookkeeping
//! and the file descriptor of the client FIFO. Workers receive control
//! signals over a bounded channel and exchange audio with the client
//! through the FIFO.

use std::{
    collections::HashMap,
    fmt,
    os::unix::io::{AsRawFd, RawFd},
    sync::Mutex,
};
use strum::{Display, EnumString};
use tokio::{
    io::{unix::AsyncFd, ReadBuf},
    sync::mpsc,
};

use crate::{
    a2dp::CodecId,
    asrsync::Decimillis,
    sock::{self, OwnedFd},
    Error, ErrorKind, Result,
};

/// Highest supported channel count.
pub const MAX_CHANNELS: usize = 8;

/// Sample format of the client byte stream.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Display, EnumString)]
pub enum SampleFormat {
    /// Unsigned 8-bit.
    #[strum(serialize = "U8")]
    U8,
    /// Signed 16-bit little-endian.
    #[default]
    #[strum(serialize = "S16_LE")]
    S16Le,
    /// Signed 24-bit little-endian in a 32-bit container.
    #[strum(serialize = "S24_LE")]
    S24Le,
    /// Signed 32-bit little-endian.
    #[strum(serialize = "S32_LE")]
    S32Le,
}

impl SampleFormat {
    /// Bytes per sample in the client stream.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16Le => 2,
            Self::S24Le | Self::S32Le => 4,
        }
    }
}

/// Speaker position of one channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Display, EnumString)]
pub enum ChannelPosition {
    /// Mono.
    #[strum(serialize = "MONO")]
    Mono,
    /// Front left.
    #[strum(serialize = "FL")]
    FrontLeft,
    /// Front right.
    #[strum(serialize = "FR")]
    FrontRight,
    /// Front center.
    #[strum(serialize = "FC")]
    FrontCenter,
    /// Rear left.
    #[strum(serialize = "RL")]
    RearLeft,
    /// Rear right.
    #[strum(serialize = "RR")]
    RearRight,
    /// Side left.
    #[strum(serialize = "SL")]
    SideLeft,
    /// Side right.
    #[strum(serialize = "SR")]
    SideRight,
}

/// Standard channel map for the given channel count.
pub fn default_channel_map(channels: u8) -> Vec<ChannelPosition> {
    use ChannelPosition::*;
    match channels {
        1 => vec![Mono],
        2 => vec![FrontLeft, FrontRight],
        _ => [FrontLeft, FrontRight, FrontCenter, RearLeft, RearRight, SideLeft, SideRight]
            .into_iter()
            .take(channels as usize)
            .collect(),
    }
}

/// Per-channel volume state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelVolume {
    /// Level in decibels relative to full scale.
    pub level_db: f64,
    /// Mute applied by in-process scaling.
    pub soft_mute: bool,
    /// Mute applied by the remote device.
    pub hw_mute: bool,
}

impl Default for ChannelVolume {
    fn default() -> Self {
        Self { level_db: 0.0, soft_mute: false, hw_mute: false }
    }
}

impl ChannelVolume {
    /// Linear amplitude scale for this channel; zero when muted.
    pub fn scale(&self) -> f64 {
        if self.soft_mute || self.hw_mute {
            0.0
        } else {
            10f64.powf(self.level_db / 20.0)
        }
    }
}

/// Scales interleaved S16 samples by the per-channel volume.
pub fn scale_samples(samples: &mut [i16], volumes: &[ChannelVolume]) {
    let channels = volumes.len();
    if channels == 0 || volumes.iter().all(|v| v.scale() == 1.0) {
        return;
    }
    let scales: Vec<f64> = volumes.iter().map(|v| v.scale()).collect();
    for (i, sample) in samples.iter_mut().enumerate() {
        let scaled = f64::from(*sample) * scales[i % channels];
        *sample = scaled.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
    }
}

/// Control signal delivered to the streaming worker of a PCM.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum PcmSignal {
    /// A client opened the PCM.
    Open = 0x01,
    /// The client closed the PCM; the worker keeps running but discards
    /// output.
    Close = 0x02,
    /// Pause moving audio.
    Pause = 0x03,
    /// Resume after pause; re-anchors the rate synchronizer.
    Resume = 0x04,
    /// Wake the worker so it observes changed settings.
    Sync = 0x05,
    /// Flush codec state.
    Drop = 0x06,
}

/// Mutable per-PCM fields, guarded by the PCM mutex.
#[derive(Debug)]
struct PcmState {
    volumes: Vec<ChannelVolume>,
    soft_volume: bool,
    active: bool,
    client_delay_dms: Decimillis,
    codec_delay_dms: Decimillis,
    processing_delay_dms: Decimillis,
    fifo: Option<OwnedFd>,
}

/// One direction of a transport as seen by the host-audio client.
pub struct Pcm {
    /// Sample format of the client stream.
    pub format: SampleFormat,
    /// Channel count.
    pub channels: u8,
    /// Channel layout; `channel_map[0..channels]` entries are unique.
    pub channel_map: Vec<ChannelPosition>,
    /// Sampling rate in frames per second.
    pub rate: u32,
    state: Mutex<PcmState>,
    signal_tx: mpsc::Sender<PcmSignal>,
    signal_rx: Mutex<Option<mpsc::Receiver<PcmSignal>>>,
}

impl fmt::Debug for Pcm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pcm")
            .field("format", &self.format)
            .field("channels", &self.channels)
            .field("rate", &self.rate)
            .finish_non_exhaustive()
    }
}

impl Pcm {
    /// Creates a PCM with the given sample geometry and the standard
    /// channel map.
    pub fn new(format: SampleFormat, channels: u8, rate: u32) -> Result<Self> {
        Self::with_channel_map(format, channels, default_channel_map(channels), rate)
    }

    /// Creates a PCM with an explicit channel map.
    pub fn with_channel_map(
        format: SampleFormat, channels: u8, channel_map: Vec<ChannelPosition>, rate: u32,
    ) -> Result<Self> {
        if channels == 0 || channels as usize > MAX_CHANNELS {
            return Err(Error::with_message(
                ErrorKind::InvalidArguments,
                format!("unsupported channel count: {channels}"),
            ));
        }
        if channel_map.len() != channels as usize {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "channel map length mismatch"));
        }
        for (i, position) in channel_map.iter().enumerate() {
            if channel_map[..i].contains(position) {
                return Err(Error::with_message(
                    ErrorKind::InvalidArguments,
                    format!("duplicate channel position: {position}"),
                ));
            }
        }

        let (signal_tx, signal_rx) = mpsc::channel(16);
        Ok(Self {
            format,
            channels,
            channel_map,
            rate,
            state: Mutex::new(PcmState {
                volumes: vec![ChannelVolume::default(); channels as usize],
                soft_volume: true,
                active: false,
                client_delay_dms: 0,
                codec_delay_dms: 0,
                processing_delay_dms: 0,
                fifo: None,
            }),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        })
    }

    /// Sends a control signal to the worker.
    ///
    /// Signals are dropped with a warning when the worker is not draining
    /// its channel; only [PcmSignal::Sync] is safe to lose.
    pub fn signal(&self, signal: PcmSignal) {
        if let Err(err) = self.signal_tx.try_send(signal) {
            log::warn!("Dropping PCM signal {signal:?}: {err}");
        }
    }

    /// Takes the worker end of the signal channel.
    ///
    /// Exactly one worker per direction may take it.
    pub fn take_signal_rx(&self) -> Option<mpsc::Receiver<PcmSignal>> {
        self.signal_rx.lock().unwrap().take()
    }

    /// Attaches the client FIFO and marks the PCM active.
    pub fn attach_client(&self, fifo: OwnedFd) {
        let mut state = self.state.lock().unwrap();
        state.fifo = Some(fifo);
        state.active = true;
        drop(state);
        self.signal(PcmSignal::Open);
    }

    /// Detaches the client FIFO, returning it for closing.
    pub fn detach_client(&self) -> Option<OwnedFd> {
        let mut state = self.state.lock().unwrap();
        state.active = false;
        let fifo = state.fifo.take();
        drop(state);
        self.signal(PcmSignal::Close);
        fifo
    }

    /// Takes the FIFO for the worker, wrapping it for async I/O.
    pub fn take_client_stream(&self) -> Result<Option<FifoStream>> {
        let mut state = self.state.lock().unwrap();
        match state.fifo.take() {
            Some(fd) => Ok(Some(FifoStream::new(fd)?)),
            None => Ok(None),
        }
    }

    /// Whether a client is attached and consuming.
    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    /// Marks the PCM inactive, as after a client-side EPIPE.
    pub fn set_inactive(&self) {
        self.state.lock().unwrap().active = false;
    }

    /// Per-channel volumes.
    pub fn volumes(&self) -> Vec<ChannelVolume> {
        self.state.lock().unwrap().volumes.clone()
    }

    /// Updates the volume of one channel.
    pub fn set_volume(&self, channel: usize, volume: ChannelVolume) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let slot = state
            .volumes
            .get_mut(channel)
            .ok_or_else(|| Error::with_message(ErrorKind::InvalidArguments, "channel out of range"))?;
        *slot = volume;
        Ok(())
    }

    /// Updates all channel volumes at once.
    pub fn set_volumes(&self, volumes: &[ChannelVolume]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if volumes.len() != state.volumes.len() {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "volume count mismatch"));
        }
        state.volumes.copy_from_slice(volumes);
        Ok(())
    }

    /// Whether scaling is applied in-process.
    ///
    /// When disabled only mute is applied locally; the level is forwarded
    /// to the remote device.
    pub fn soft_volume(&self) -> bool {
        self.state.lock().unwrap().soft_volume
    }

    /// Switches between in-process scaling and pass-through volume.
    pub fn set_soft_volume(&self, soft: bool) {
        self.state.lock().unwrap().soft_volume = soft;
        self.signal(PcmSignal::Sync);
    }

    /// The volumes a worker should apply while scaling, honoring the
    /// soft-volume flag.
    pub fn effective_volumes(&self) -> Vec<ChannelVolume> {
        let state = self.state.lock().unwrap();
        if state.soft_volume {
            state.volumes.clone()
        } else {
            // only mute is applied in-process
            state
                .volumes
                .iter()
                .map(|v| ChannelVolume { level_db: 0.0, ..*v })
                .collect()
        }
    }

    /// Client-requested extra delay in decimilliseconds.
    pub fn client_delay_dms(&self) -> Decimillis {
        self.state.lock().unwrap().client_delay_dms
    }

    /// Sets the client-requested extra delay.
    pub fn set_client_delay_dms(&self, dms: Decimillis) {
        self.state.lock().unwrap().client_delay_dms = dms;
        self.signal(PcmSignal::Sync);
    }

    /// Sets the codec-introduced delay.
    pub fn set_codec_delay_dms(&self, dms: Decimillis) {
        self.state.lock().unwrap().codec_delay_dms = dms;
    }

    /// Updates the rolling processing-delay estimate from the worker.
    pub fn report_processing_delay_dms(&self, dms: Decimillis) {
        let mut state = self.state.lock().unwrap();
        // exponential smoothing over worker reports
        state.processing_delay_dms = (state.processing_delay_dms * 7 + dms) / 8;
    }

    /// Total delay of this PCM in decimilliseconds.
    pub fn delay_dms(&self) -> Decimillis {
        let state = self.state.lock().unwrap();
        state.client_delay_dms + state.codec_delay_dms + state.processing_delay_dms
    }
}

/// Client FIFO wrapped for async I/O.
///
/// Reads return [WouldBlock](std::io::ErrorKind::WouldBlock)-free short
/// counts; writes complete only once the client has drained enough of the
/// pipe, which is the backpressure the decoder relies on.
pub struct FifoStream {
    fd: AsyncFd<OwnedFd>,
}

impl fmt::Debug for FifoStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FifoStream").field("fd", &self.fd.get_ref().as_raw_fd()).finish()
    }
}

impl FifoStream {
    #[cfg(test)]
    pub(crate) fn new_for_tests(fd: OwnedFd) -> Self {
        Self::new(fd).unwrap()
    }

    fn new(fd: OwnedFd) -> Result<Self> {
        sock::set_nonblocking(&fd).map_err(Error::from)?;
        Ok(Self { fd: AsyncFd::new(fd).map_err(Error::from)? })
    }

    /// Raw descriptor, for diagnostics.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }

    /// Reads available bytes, waiting for at least one.
    ///
    /// Returns zero at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut buf = ReadBuf::new(buf);
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| sock::read(inner.get_ref(), &mut buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Writes the whole buffer, waiting for pipe space as needed.
    pub async fn write_all(&self, mut buf: &[u8]) -> std::io::Result<()> {
        while !buf.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| sock::write(inner.get_ref(), buf)) {
                Ok(Ok(n)) => buf = &buf[n..],
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

/// Client-delay adjustments keyed by codec, in decimilliseconds.
///
/// Loaded from per-device storage; missing entries mean zero adjustment.
pub type DelayAdjustments = HashMap<CodecId, Decimillis>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_geometry() {
        assert!(Pcm::new(SampleFormat::S16Le, 0, 48000).is_err());
        assert!(Pcm::new(SampleFormat::S16Le, 9, 48000).is_err());
        let map = vec![ChannelPosition::FrontLeft, ChannelPosition::FrontLeft];
        assert!(Pcm::with_channel_map(SampleFormat::S16Le, 2, map, 48000).is_err());
        assert!(Pcm::new(SampleFormat::S16Le, 2, 44100).is_ok());
    }

    #[test]
    fn volume_scale_factors() {
        let mut v = ChannelVolume::default();
        assert_eq!(v.scale(), 1.0);
        v.level_db = -6.0206;
        assert!((v.scale() - 0.5).abs() < 1e-4);
        v.soft_mute = true;
        assert_eq!(v.scale(), 0.0);
    }

    #[test]
    fn sink_side_scaling_halves_left_and_mutes_right() {
        let volumes = [
            ChannelVolume { level_db: -6.0206, ..ChannelVolume::default() },
            ChannelVolume { soft_mute: true, ..ChannelVolume::default() },
        ];
        // sixteen full-scale-ish samples, interleaved stereo
        let mut samples = [16384i16; 16];
        scale_samples(&mut samples, &volumes);
        for pair in samples.chunks_exact(2) {
            assert!((pair[0] - 8192).abs() <= 1, "left: {}", pair[0]);
            assert_eq!(pair[1], 0, "right muted");
        }
    }

    #[test]
    fn soft_volume_off_applies_only_mute() {
        let pcm = Pcm::new(SampleFormat::S16Le, 2, 48000).unwrap();
        pcm.set_volume(0, ChannelVolume { level_db: -12.0, ..ChannelVolume::default() }).unwrap();
        pcm.set_volume(1, ChannelVolume { soft_mute: true, ..ChannelVolume::default() }).unwrap();
        pcm.set_soft_volume(false);
        let effective = pcm.effective_volumes();
        assert_eq!(effective[0].level_db, 0.0);
        assert!(effective[1].soft_mute);
    }

    #[test]
    fn delay_components_accumulate() {
        let pcm = Pcm::new(SampleFormat::S16Le, 2, 48000).unwrap();
        pcm.set_client_delay_dms(100);
        pcm.set_codec_delay_dms(35);
        for _ in 0..32 {
            pcm.report_processing_delay_dms(16);
        }
        let delay = pcm.delay_dms();
        assert!(delay >= 100 + 35 + 14, "delay: {delay}");
    }

    #[test]
    fn signal_channel_delivers_in_order() {
        let pcm = Pcm::new(SampleFormat::S16Le, 1, 8000).unwrap();
        let mut rx = pcm.take_signal_rx().unwrap();
        assert!(pcm.take_signal_rx().is_none());
        pcm.signal(PcmSignal::Open);
        pcm.signal(PcmSignal::Pause);
        assert_eq!(rx.try_recv().unwrap(), PcmSignal::Open);
        assert_eq!(rx.try_recv().unwrap(), PcmSignal::Pause);
        assert!(rx.try_recv().is_err());
    }
}

//! SCO voice worker: duplex speaker and microphone paths.

use std::sync::Arc;
use tokio::sync::mpsc;

use super::{shutdown_pair, BtStream, ShutdownToken, StreamParams, WorkerHandle};
use crate::{
    asrsync::{duration_to_dms, RateSync},
    codec::{msbc, StreamCodec},
    ffb::FrameBuffer,
    pcm::{scale_samples, FifoStream, Pcm, PcmSignal},
    Error, ErrorKind,
};

/// Framing applied on the synchronous link.
pub enum ScoFraming {
    /// Transparent 16-bit samples; the controller runs CVSD itself.
    Cvsd,
    /// mSBC frames wrapped in H2 headers, transparent voice setting.
    Msbc {
        /// Wideband speech encoder handle.
        encoder: Box<dyn StreamCodec>,
        /// Wideband speech decoder handle.
        decoder: Box<dyn StreamCodec>,
    },
}

impl std::fmt::Debug for ScoFraming {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Cvsd => f.write_str("Cvsd"),
            Self::Msbc { .. } => f.write_str("Msbc"),
        }
    }
}

/// Spawns the duplex worker of a SCO transport.
///
/// `speaker` carries audio towards the remote device, `mic` carries the
/// return path. A single loop serves both directions, mirroring the
/// synchronous nature of the link.
pub fn spawn_sco_worker(
    params: StreamParams, speaker: Arc<Pcm>, mic: Arc<Pcm>, bt: Arc<BtStream>, framing: ScoFraming,
    fault_tx: mpsc::UnboundedSender<Error>,
) -> WorkerHandle {
    let (shutdown, token) = shutdown_pair();
    let join = tokio::spawn(async move {
        if let Err(err) = run(params, speaker, mic, bt, framing, token).await {
            log::error!("SCO worker failed: {err}");
            let _ = fault_tx.send(err);
        }
    });
    WorkerHandle::new("sco", shutdown, join)
}

async fn client_read(fifo: &Option<FifoStream>, buf: &mut [u8]) -> std::io::Result<usize> {
    match fifo {
        Some(fifo) => fifo.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn run(
    params: StreamParams, speaker: Arc<Pcm>, mic: Arc<Pcm>, bt: Arc<BtStream>, mut framing: ScoFraming,
    mut token: ShutdownToken,
) -> crate::Result<()> {
    let mut spk_signal_rx = speaker
        .take_signal_rx()
        .ok_or_else(|| Error::with_message(ErrorKind::Failed, "speaker signal channel already taken"))?;
    let mut mic_signal_rx = mic
        .take_signal_rx()
        .ok_or_else(|| Error::with_message(ErrorKind::Failed, "microphone signal channel already taken"))?;

    let mut spk_fifo = speaker.take_client_stream()?;
    let mut mic_fifo = mic.take_client_stream()?;

    let mtu_write = params.mtu_write.max(24);
    let mut rate_sync = RateSync::new(params.rate);
    let mut h2 = msbc::H2Sequence::default();

    // reassembly buffer for the H2 sliding scan on the receive side
    let mut rx_stream: FrameBuffer<u8> = FrameBuffer::new(msbc::PACKET_LEN * 8);
    let mut spk_pcm: FrameBuffer<i16> = FrameBuffer::new(msbc::FRAME_SAMPLES * 8);
    let mut scratch = vec![0u8; spk_pcm.blen_in()];
    let mut datagram = vec![0u8; params.mtu_read.max(msbc::PACKET_LEN)];

    log::debug!("Starting SCO worker: {framing:?}, rate {} Hz, MTU {mtu_write}", params.rate);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            signal = spk_signal_rx.recv() => match signal {
                Some(PcmSignal::Open) => {
                    if let Some(stream) = speaker.take_client_stream()? {
                        spk_fifo = Some(stream);
                    }
                    rate_sync.reset();
                }
                Some(PcmSignal::Close) => {
                    spk_fifo = None;
                    spk_pcm.rewind();
                }
                Some(PcmSignal::Drop) => {
                    if let ScoFraming::Msbc { encoder, .. } = &mut framing {
                        encoder.reset();
                    }
                    spk_pcm.rewind();
                    h2.reset();
                }
                Some(_) => {}
                None => break,
            },

            signal = mic_signal_rx.recv() => match signal {
                Some(PcmSignal::Open) => {
                    if let Some(stream) = mic.take_client_stream()? {
                        mic_fifo = Some(stream);
                    }
                }
                Some(PcmSignal::Close) => mic_fifo = None,
                Some(PcmSignal::Drop) => {
                    if let ScoFraming::Msbc { decoder, .. } = &mut framing {
                        decoder.reset();
                    }
                    rx_stream.rewind();
                }
                Some(_) => {}
                None => break,
            },

            read = client_read(&spk_fifo, &mut scratch[..spk_pcm.blen_in()]) => {
                let n = match read {
                    Ok(0) => {
                        spk_fifo = None;
                        speaker.set_inactive();
                        continue;
                    }
                    Ok(n) => n,
                    Err(err) => {
                        let err = Error::from(err);
                        if err.kind == ErrorKind::ClientDisconnected {
                            spk_fifo = None;
                            speaker.set_inactive();
                            continue;
                        }
                        return Err(err);
                    }
                };

                let free = spk_pcm.free_mut();
                let samples = (n / 2).min(free.len());
                for (chunk, slot) in scratch[..samples * 2].chunks_exact(2).zip(free.iter_mut()) {
                    *slot = i16::from_le_bytes([chunk[0], chunk[1]]);
                }
                spk_pcm.seek(samples);

                let frames = transmit(&mut framing, &mut spk_pcm, &mut h2, mtu_write, &bt).await?;
                if frames > 0 {
                    let report = rate_sync.sync(frames).await;
                    speaker.report_processing_delay_dms(duration_to_dms(report.busy));
                }
            }

            received = bt.recv(&mut datagram[..]) => {
                let n = match received {
                    Ok(0) => return Err(Error::new(ErrorKind::LinkLost)),
                    Ok(n) => n,
                    Err(err) => return Err(Error::from(err)),
                };

                // the microphone FIFO write may block; stay cancellable
                let delivered = tokio::select! {
                    _ = token.cancelled() => break,
                    delivered = receive(&mut framing, &datagram[..n], &mut rx_stream, &mic, &mic_fifo) => {
                        delivered
                    }
                };
                match delivered {
                    Ok(()) => {}
                    Err(err) if err.kind == ErrorKind::ClientDisconnected => {
                        mic_fifo = None;
                        mic.set_inactive();
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }

    log::debug!("SCO worker terminated");
    Ok(())
}

/// Sends buffered speaker samples over the link.
///
/// Returns the number of PCM frames consumed.
async fn transmit(
    framing: &mut ScoFraming, spk_pcm: &mut FrameBuffer<i16>, h2: &mut msbc::H2Sequence,
    mtu_write: usize, bt: &BtStream,
) -> crate::Result<usize> {
    let mut frames = 0;

    match framing {
        ScoFraming::Cvsd => {
            // transparent S16 samples sliced to the transmission MTU
            let samples_per_packet = (mtu_write / 2).max(1);
            while spk_pcm.len_out() >= samples_per_packet {
                let mut packet = Vec::with_capacity(samples_per_packet * 2);
                for sample in &spk_pcm.data()[..samples_per_packet] {
                    packet.extend_from_slice(&sample.to_le_bytes());
                }
                bt.send(&packet).await.map_err(Error::from)?;
                spk_pcm.shift(samples_per_packet);
                frames += samples_per_packet;
            }
        }
        ScoFraming::Msbc { encoder, .. } => {
            while spk_pcm.len_out() >= encoder.frame_samples() {
                let mut frame = vec![0u8; encoder.frame_max_bytes()];
                let info = encoder.encode(spk_pcm.data(), &mut frame)?;
                if info.frames == 0 {
                    break;
                }
                spk_pcm.shift(info.consumed_samples);
                frames += info.consumed_samples;

                let mut packet = Vec::with_capacity(msbc::PACKET_LEN);
                packet.extend_from_slice(&h2.next_header());
                packet.extend_from_slice(&frame[..info.produced_bytes]);
                packet.push(0);
                // SCO routing may require MTU-sized writes
                for chunk in packet.chunks(mtu_write) {
                    bt.send(chunk).await.map_err(Error::from)?;
                }
            }
        }
    }

    Ok(frames)
}

/// Delivers received link data to the microphone client.
async fn receive(
    framing: &mut ScoFraming, data: &[u8], rx_stream: &mut FrameBuffer<u8>, mic: &Arc<Pcm>,
    mic_fifo: &Option<FifoStream>,
) -> crate::Result<()> {
    let mut pcm = vec![0i16; msbc::FRAME_SAMPLES.max(data.len() / 2)];
    let mut out = Vec::new();

    match framing {
        ScoFraming::Cvsd => {
            let samples = data.len() / 2;
            for (chunk, slot) in data[..samples * 2].chunks_exact(2).zip(pcm.iter_mut()) {
                *slot = i16::from_le_bytes([chunk[0], chunk[1]]);
            }
            append_scaled(&mut out, &mut pcm[..samples], mic);
        }
        ScoFraming::Msbc { decoder, .. } => {
            if rx_stream.len_in() < data.len() {
                log::warn!("mSBC reassembly overrun, dropping {} bytes", rx_stream.len_out());
                rx_stream.rewind();
            }
            rx_stream.extend_from_slice(data);

            loop {
                let Some(offset) = msbc::find_h2_header(rx_stream.data()) else {
                    // keep one byte: it may be the first half of a header
                    let drop = rx_stream.len_out().saturating_sub(1);
                    rx_stream.shift(drop);
                    break;
                };
                if rx_stream.len_out() - offset < 2 + msbc::FRAME_LEN {
                    rx_stream.shift(offset);
                    break;
                }
                rx_stream.shift(offset + 2);
                let info = match decoder.decode(&rx_stream.data()[..msbc::FRAME_LEN], &mut pcm) {
                    Ok(info) => info,
                    Err(err) => {
                        log::warn!("mSBC decode error, resynchronizing: {err}");
                        decoder.reset();
                        rx_stream.shift(1);
                        continue;
                    }
                };
                rx_stream.shift(msbc::FRAME_LEN);
                append_scaled(&mut out, &mut pcm[..info.produced_samples], mic);
            }
        }
    }

    if out.is_empty() || !mic.is_active() {
        return Ok(());
    }
    if let Some(fifo) = mic_fifo {
        fifo.write_all(&out).await.map_err(Error::from)?;
    }
    Ok(())
}

fn append_scaled(out: &mut Vec<u8>, samples: &mut [i16], mic: &Arc<Pcm>) {
    scale_samples(samples, &mic.effective_volumes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::SampleFormat;
    use crate::sock;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn params() -> StreamParams {
        StreamParams {
            rate: 8000,
            channels: 1,
            mtu_write: 48,
            mtu_read: 48,
            rtp_clock_rate: 8000,
            rtp_codec_header_len: None,
        }
    }

    #[tokio::test]
    async fn cvsd_microphone_path_is_transparent() {
        let (bt_local, bt_remote) = sock::socketpair(libc::SOCK_SEQPACKET).unwrap();
        let bt = BtStream::new(bt_local).unwrap();
        let remote = BtStream::new(bt_remote).unwrap();

        let speaker = Arc::new(Pcm::new(SampleFormat::S16Le, 1, 8000).unwrap());
        let mic = Arc::new(Pcm::new(SampleFormat::S16Le, 1, 8000).unwrap());
        let (mic_rx, mic_tx) = sock::pipe().unwrap();
        mic.attach_client(mic_tx);

        let (fault_tx, _fault_rx) = mpsc::unbounded_channel();
        let handle =
            spawn_sco_worker(params(), speaker, mic.clone(), bt, ScoFraming::Cvsd, fault_tx);

        let samples = [100i16, -100, 200, -200];
        let mut packet = Vec::new();
        for s in samples {
            packet.extend_from_slice(&s.to_le_bytes());
        }
        remote.send(&packet).await.unwrap();

        let client = FifoStream::new_for_tests(mic_rx);
        let mut buf = [0u8; 32];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap().unwrap();
        let decoded: Vec<i16> =
            buf[..n].chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
        assert_eq!(decoded, samples);

        handle.stop().await;
    }

    #[tokio::test]
    async fn cvsd_speaker_path_slices_to_mtu() {
        let (bt_local, bt_remote) = sock::socketpair(libc::SOCK_SEQPACKET).unwrap();
        let bt = BtStream::new(bt_local).unwrap();
        let remote = BtStream::new(bt_remote).unwrap();

        let speaker = Arc::new(Pcm::new(SampleFormat::S16Le, 1, 8000).unwrap());
        let mic = Arc::new(Pcm::new(SampleFormat::S16Le, 1, 8000).unwrap());
        let (spk_rx, spk_tx) = sock::pipe().unwrap();
        speaker.attach_client(spk_rx);

        let (fault_tx, _fault_rx) = mpsc::unbounded_channel();
        let handle = spawn_sco_worker(params(), speaker.clone(), mic, bt, ScoFraming::Cvsd, fault_tx);

        // 48 samples: two full 24-sample (48-byte) packets
        let client = FifoStream::new_for_tests(spk_tx);
        let mut payload = Vec::new();
        for i in 0..48i16 {
            payload.extend_from_slice(&i.to_le_bytes());
        }
        client.write_all(&payload).await.unwrap();

        for _ in 0..2 {
            let mut buf = [0u8; 64];
            let n = tokio::time::timeout(Duration::from_secs(2), remote.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, 48);
        }

        handle.stop().await;
    }
}

//! A2DP sink worker: Bluetooth to client FIFO.

use std::sync::Arc;
use tokio::sync::mpsc;

use super::{shutdown_pair, BtStream, ShutdownToken, StreamParams, WorkerHandle};
use crate::{
    asrsync::{duration_to_dms, RateSync},
    codec::StreamCodec,
    ffb::FrameBuffer,
    pcm::{scale_samples, FifoStream, Pcm, PcmSignal},
    rtp, Error, ErrorKind,
};

/// Spawns the decoder worker for a transport direction.
///
/// Reads Bluetooth datagrams regardless of whether a client is connected,
/// so the remote encoder never observes a link-level stall; decoded audio
/// is dropped while the client is absent.
pub fn spawn_decoder(
    params: StreamParams, pcm: Arc<Pcm>, bt: Arc<BtStream>, codec: Box<dyn StreamCodec>,
    fault_tx: mpsc::UnboundedSender<Error>,
) -> WorkerHandle {
    let (shutdown, token) = shutdown_pair();
    let join = tokio::spawn(async move {
        if let Err(err) = run(params, pcm, bt, codec, token).await {
            log::error!("Decoder worker failed: {err}");
            let _ = fault_tx.send(err);
        }
    });
    WorkerHandle::new("decoder", shutdown, join)
}

async fn run(
    params: StreamParams, pcm: Arc<Pcm>, bt: Arc<BtStream>, mut codec: Box<dyn StreamCodec>,
    mut token: ShutdownToken,
) -> crate::Result<()> {
    let mut signal_rx = pcm
        .take_signal_rx()
        .ok_or_else(|| Error::with_message(ErrorKind::Failed, "PCM signal channel already taken"))?;

    let frame_samples = codec.frame_samples();
    let mut datagram = vec![0u8; params.mtu_read.max(rtp::HEADER_LEN + codec.frame_max_bytes())];
    let mut pcm_buf: FrameBuffer<i16> = FrameBuffer::new(frame_samples.max(1) * 16);
    let mut out = Vec::with_capacity(pcm_buf.capacity() * 2);

    let mut rate_sync = RateSync::new(params.rate);
    let mut rtp_state = rtp::State::new(params.rtp_clock_rate, params.rate);

    let mut fifo = pcm.take_client_stream()?;
    let mut paused = false;

    log::debug!("Starting decoder: rate {} Hz, MTU {}", params.rate, params.mtu_read);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            signal = signal_rx.recv() => match signal {
                Some(PcmSignal::Open) => {
                    if let Some(stream) = pcm.take_client_stream()? {
                        fifo = Some(stream);
                    }
                    rate_sync.reset();
                    // re-anchor on the next packet instead of reporting the
                    // frames lost while nobody listened
                    rtp_state.desync();
                }
                Some(PcmSignal::Close) => fifo = None,
                Some(PcmSignal::Pause) => paused = true,
                Some(PcmSignal::Resume) => {
                    paused = false;
                    rate_sync.reset();
                }
                Some(PcmSignal::Drop) => {
                    codec.reset();
                    pcm_buf.rewind();
                }
                Some(PcmSignal::Sync) => {}
                None => break,
            },

            received = bt.recv(&mut datagram[..]) => {
                let n = match received {
                    Ok(0) => return Err(Error::new(ErrorKind::LinkLost)),
                    Ok(n) => n,
                    Err(err) => return Err(Error::from(err)),
                };

                let payload = match params.rtp_codec_header_len {
                    Some(codec_header_len) => {
                        let header = match rtp::Header::parse(&datagram[..n]) {
                            Ok(header) => header,
                            Err(err) => {
                                log::debug!("Dropping malformed RTP packet: {err}");
                                continue;
                            }
                        };
                        let Some(payload) = rtp::get_payload(&datagram[..n], &header, codec_header_len)
                        else {
                            log::debug!("Dropping RTP packet with payload type {}", header.payload_type);
                            continue;
                        };
                        let Some(report) = rtp_state.sync_stream(&header) else {
                            continue;
                        };
                        // conceal detected gaps before decoding the payload
                        for _ in 0..report.missing {
                            let produced = codec.conceal(pcm_buf.free_mut());
                            pcm_buf.seek(produced);
                        }
                        payload
                    }
                    None => &datagram[..n],
                };

                match codec.decode(payload, pcm_buf.free_mut()) {
                    Ok(info) => pcm_buf.seek(info.produced_samples),
                    Err(err) => {
                        log::warn!("Decode error, resetting codec: {err}");
                        codec.reset();
                        continue;
                    }
                }

                if fifo.is_none() || paused || !pcm.is_active() {
                    // no consumer: drop output and force re-anchoring
                    pcm_buf.rewind();
                    rtp_state.desync();
                    continue;
                }

                let samples = pcm_buf.len_out();
                if samples == 0 {
                    continue;
                }

                let mut block = pcm_buf.data().to_vec();
                scale_samples(&mut block, &pcm.effective_volumes());

                out.clear();
                for sample in &block {
                    out.extend_from_slice(&sample.to_le_bytes());
                }

                // the blocking write is the backpressure point; keep it
                // responsive to shutdown
                let written = match &fifo {
                    Some(stream) => tokio::select! {
                        _ = token.cancelled() => break,
                        written = stream.write_all(&out) => written,
                    },
                    None => Ok(()),
                };
                if let Err(err) = written {
                    let err = Error::from(err);
                    if err.kind == ErrorKind::ClientDisconnected {
                        log::debug!("Client FIFO closed while writing");
                        fifo = None;
                        pcm.set_inactive();
                        pcm_buf.rewind();
                        rtp_state.desync();
                        continue;
                    }
                    return Err(err);
                }
                pcm_buf.shift(samples);

                let report = rate_sync.sync(samples / params.channels as usize).await;
                pcm.report_processing_delay_dms(duration_to_dms(report.busy));
            }
        }
    }

    log::debug!("Decoder terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PcmPassthrough;
    use crate::pcm::SampleFormat;
    use crate::sock;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn params() -> StreamParams {
        StreamParams {
            rate: 48000,
            channels: 2,
            mtu_write: 672,
            mtu_read: 672,
            rtp_clock_rate: 48000,
            rtp_codec_header_len: Some(1),
        }
    }

    fn rtp_packet(sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; rtp::HEADER_LEN + 1 + payload.len()];
        let header = rtp::Header {
            payload_type: rtp::PAYLOAD_TYPE_MEDIA,
            sequence,
            timestamp: sequence as u32 * 4,
            ..Default::default()
        };
        header.write(&mut packet);
        packet[rtp::HEADER_LEN] = 1;
        packet[rtp::HEADER_LEN + 1..].copy_from_slice(payload);
        packet
    }

    #[tokio::test]
    async fn decodes_into_client_fifo() {
        let (bt_local, bt_remote) = sock::socketpair(libc::SOCK_SEQPACKET).unwrap();
        let bt = BtStream::new(bt_local).unwrap();
        let remote = BtStream::new(bt_remote).unwrap();

        let (fifo_rx, fifo_tx) = sock::pipe().unwrap();
        let pcm = Arc::new(Pcm::new(SampleFormat::S16Le, 2, 48000).unwrap());
        pcm.attach_client(fifo_tx);

        let (fault_tx, _fault_rx) = mpsc::unbounded_channel();
        let handle =
            spawn_decoder(params(), pcm.clone(), bt, Box::new(PcmPassthrough::new(4)), fault_tx);

        // two stereo frames of known samples
        let samples = [1000i16, -1000, 2000, -2000];
        let mut payload = Vec::new();
        for s in samples {
            payload.extend_from_slice(&s.to_le_bytes());
        }
        remote.send(&rtp_packet(1, &payload)).await.unwrap();

        let client = FifoStream::new_for_tests(fifo_rx);
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 8);
        let decoded: Vec<i16> =
            buf[..n].chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
        assert_eq!(decoded, samples);

        handle.stop().await;
    }

    #[tokio::test]
    async fn absent_client_discards_audio() {
        let (bt_local, bt_remote) = sock::socketpair(libc::SOCK_SEQPACKET).unwrap();
        let bt = BtStream::new(bt_local).unwrap();
        let remote = BtStream::new(bt_remote).unwrap();

        let pcm = Arc::new(Pcm::new(SampleFormat::S16Le, 2, 48000).unwrap());
        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
        let handle =
            spawn_decoder(params(), pcm.clone(), bt, Box::new(PcmPassthrough::new(4)), fault_tx);

        // the decoder must keep draining the socket without a client
        for sequence in 1..=8u16 {
            remote.send(&rtp_packet(sequence, &[0u8; 8])).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fault_rx.try_recv().is_err());

        handle.stop().await;
    }
}

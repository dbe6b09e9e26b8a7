//! A2DP source worker: client FIFO to Bluetooth.

use std::sync::Arc;
use tokio::sync::mpsc;

use super::{shutdown_pair, BtStream, ShutdownToken, StreamParams, WorkerHandle};
use crate::{
    asrsync::{duration_to_dms, RateSync},
    codec::StreamCodec,
    ffb::FrameBuffer,
    pcm::{FifoStream, Pcm, PcmSignal},
    rtp, Error, ErrorKind,
};

/// Spawns the encoder worker for a transport direction.
///
/// Reads PCM from the client FIFO, encodes full codec frames, packetizes
/// them within the write MTU and paces itself to the sampling rate. Fatal
/// errors are reported on `fault_tx`; the owning transport reacts by
/// aborting.
pub fn spawn_encoder(
    params: StreamParams, pcm: Arc<Pcm>, bt: Arc<BtStream>, codec: Box<dyn StreamCodec>,
    fault_tx: mpsc::UnboundedSender<Error>,
) -> WorkerHandle {
    let (shutdown, token) = shutdown_pair();
    let join = tokio::spawn(async move {
        if let Err(err) = run(params, pcm, bt, codec, token).await {
            log::error!("Encoder worker failed: {err}");
            let _ = fault_tx.send(err);
        }
    });
    WorkerHandle::new("encoder", shutdown, join)
}

async fn client_read(fifo: &Option<FifoStream>, buf: &mut [u8]) -> std::io::Result<usize> {
    match fifo {
        Some(fifo) => fifo.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn run(
    params: StreamParams, pcm: Arc<Pcm>, bt: Arc<BtStream>, mut codec: Box<dyn StreamCodec>,
    mut token: ShutdownToken,
) -> crate::Result<()> {
    let mut signal_rx = pcm
        .take_signal_rx()
        .ok_or_else(|| Error::with_message(ErrorKind::Failed, "PCM signal channel already taken"))?;

    let frame_samples = codec.frame_samples();
    // room for a few batches so a slow pass never stalls the FIFO
    let mut pcm_buf: FrameBuffer<i16> = FrameBuffer::new(frame_samples.max(1) * 8);
    let mut bt_buf: FrameBuffer<u8> = FrameBuffer::new(params.mtu_write.max(codec.frame_max_bytes()));
    let mut scratch = vec![0u8; pcm_buf.blen_in()];

    let mut rate_sync = RateSync::new(params.rate);
    let mut rtp_state = rtp::State::new(params.rtp_clock_rate, params.rate);
    let mut packet = vec![0u8; params.mtu_write.max(rtp::HEADER_LEN + codec.frame_max_bytes())];

    let mut fifo = pcm.take_client_stream()?;
    let mut paused = false;
    let mut delay_reported = false;

    log::debug!("Starting encoder: rate {} Hz, MTU {}", params.rate, params.mtu_write);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            signal = signal_rx.recv() => match signal {
                Some(PcmSignal::Open) => {
                    if let Some(stream) = pcm.take_client_stream()? {
                        fifo = Some(stream);
                    }
                    rate_sync.reset();
                    delay_reported = false;
                }
                Some(PcmSignal::Close) => {
                    fifo = None;
                    pcm_buf.rewind();
                }
                Some(PcmSignal::Pause) => paused = true,
                Some(PcmSignal::Resume) => {
                    paused = false;
                    rate_sync.reset();
                }
                Some(PcmSignal::Drop) => {
                    codec.reset();
                    pcm_buf.rewind();
                    bt_buf.rewind();
                }
                Some(PcmSignal::Sync) => {}
                None => break,
            },

            read = client_read(&fifo, &mut scratch[..pcm_buf.blen_in()]) => {
                let n = match read {
                    Ok(0) => {
                        log::debug!("Client FIFO closed");
                        fifo = None;
                        pcm.set_inactive();
                        continue;
                    }
                    Ok(n) => n,
                    Err(err) => {
                        let err = Error::from(err);
                        if err.kind == ErrorKind::ClientDisconnected {
                            fifo = None;
                            pcm.set_inactive();
                            continue;
                        }
                        return Err(err);
                    }
                };
                if paused {
                    continue;
                }

                // commit whole samples into the PCM buffer
                let free = pcm_buf.free_mut();
                let samples = (n / 2).min(free.len());
                for (chunk, slot) in scratch[..samples * 2].chunks_exact(2).zip(free.iter_mut()) {
                    *slot = i16::from_le_bytes([chunk[0], chunk[1]]);
                }
                pcm_buf.seek(samples);

                let frames = process(
                    &params, &mut *codec, &mut pcm_buf, &mut bt_buf, &mut rtp_state, &mut packet, &bt,
                )
                .await?;

                if frames > 0 {
                    let report = rate_sync.sync(frames / params.channels as usize).await;
                    if !delay_reported {
                        // seed the delay estimate right after the first batch
                        pcm.report_processing_delay_dms(report.since_origin_dms);
                        delay_reported = true;
                    } else {
                        pcm.report_processing_delay_dms(duration_to_dms(report.busy));
                    }
                }
            }
        }
    }

    log::debug!("Encoder terminated");
    Ok(())
}

/// Encodes buffered PCM and sends MTU-sized packets.
///
/// Returns the number of PCM samples consumed.
async fn process(
    params: &StreamParams, codec: &mut dyn StreamCodec, pcm_buf: &mut FrameBuffer<i16>,
    bt_buf: &mut FrameBuffer<u8>, rtp_state: &mut rtp::State, packet: &mut [u8], bt: &BtStream,
) -> crate::Result<usize> {
    let mut consumed_total = 0;

    while pcm_buf.len_out() >= codec.frame_samples() {
        let payload_cap = match params.rtp_codec_header_len {
            Some(hdr) => params.mtu_write.saturating_sub(rtp::HEADER_LEN + hdr),
            None => params.mtu_write,
        };

        // accumulate frames until another one would overflow the packet
        let mut frames = 0;
        let mut consumed = 0;
        bt_buf.rewind();
        while pcm_buf.len_out() >= codec.frame_samples()
            && bt_buf.blen_out() + codec.frame_max_bytes() <= payload_cap.max(codec.frame_max_bytes())
        {
            let info = codec.encode(pcm_buf.data(), bt_buf.free_mut())?;
            if info.frames == 0 {
                break;
            }
            bt_buf.seek(info.produced_bytes);
            pcm_buf.shift(info.consumed_samples);
            consumed += info.consumed_samples;
            frames += info.frames;
            if bt_buf.blen_out() >= payload_cap {
                break;
            }
        }
        if frames == 0 {
            break;
        }
        consumed_total += consumed;

        match params.rtp_codec_header_len {
            Some(codec_header_len) => {
                send_rtp(rtp_state, bt_buf.data(), frames, codec_header_len, payload_cap, packet, bt)
                    .await?;
            }
            None => {
                bt.send(bt_buf.data()).await.map_err(Error::from)?;
            }
        }
        rtp_state.update(consumed / params.channels as usize);
    }

    Ok(consumed_total)
}

/// Sends an encoded payload as one RTP packet, fragmenting when it exceeds
/// the MTU. Fragments share the timestamp; the marker bit is set only on
/// the final fragment.
async fn send_rtp(
    rtp_state: &mut rtp::State, payload: &[u8], frames: usize, codec_header_len: usize, payload_cap: usize,
    packet: &mut [u8], bt: &BtStream,
) -> crate::Result<()> {
    let cap = payload_cap.max(1);
    let fragments = payload.chunks(cap).collect::<Vec<_>>();
    let last = fragments.len() - 1;

    for (i, fragment) in fragments.iter().enumerate() {
        let mut header = rtp::Header {
            payload_type: rtp::PAYLOAD_TYPE_MEDIA,
            marker: i == last && fragments.len() > 1,
            ..Default::default()
        };
        rtp_state.new_frame(&mut header);
        header.write(packet);

        let mut off = rtp::HEADER_LEN;
        if codec_header_len > 0 {
            // SBC-style media header: frame count in the low nibble
            packet[off..off + codec_header_len].fill(0);
            packet[off] = (frames.min(0x0F)) as u8;
            off += codec_header_len;
        }
        packet[off..off + fragment.len()].copy_from_slice(fragment);
        bt.send(&packet[..off + fragment.len()]).await.map_err(Error::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PcmPassthrough;
    use crate::sock;

    fn params(mtu_write: usize) -> StreamParams {
        StreamParams {
            rate: 48000,
            channels: 2,
            mtu_write,
            mtu_read: mtu_write,
            rtp_clock_rate: 48000,
            rtp_codec_header_len: Some(1),
        }
    }

    #[tokio::test]
    async fn process_emits_rtp_packets_within_mtu() {
        let (a, b) = sock::socketpair(libc::SOCK_SEQPACKET).unwrap();
        let bt = BtStream::new(a).unwrap();
        let peer = BtStream::new(b).unwrap();

        let params = params(64);
        let mut codec = PcmPassthrough::new(8);
        let mut pcm_buf: FrameBuffer<i16> = FrameBuffer::new(64);
        let mut bt_buf: FrameBuffer<u8> = FrameBuffer::new(256);
        let mut rtp_state = rtp::State::new(48000, 48000);
        let mut packet = vec![0u8; 256];

        pcm_buf.extend_from_slice(&[100i16; 16]);
        let consumed = process(
            &params, &mut codec, &mut pcm_buf, &mut bt_buf, &mut rtp_state, &mut packet, &bt,
        )
        .await
        .unwrap();
        assert_eq!(consumed, 16);
        assert!(pcm_buf.is_empty());

        let mut buf = [0u8; 256];
        let n = peer.recv(&mut buf).await.unwrap();
        assert!(n <= 64, "packet exceeds MTU: {n}");
        let header = rtp::Header::parse(&buf[..n]).unwrap();
        assert_eq!(header.payload_type, rtp::PAYLOAD_TYPE_MEDIA);
        assert_eq!(header.sequence, 1);
        assert_eq!(header.timestamp, 0);
    }

    #[tokio::test]
    async fn oversized_payload_fragments_with_shared_timestamp() {
        let (a, b) = sock::socketpair(libc::SOCK_SEQPACKET).unwrap();
        let bt = BtStream::new(a).unwrap();
        let peer = BtStream::new(b).unwrap();

        let mut rtp_state = rtp::State::new(48000, 48000);
        rtp_state.update(480);
        let payload = vec![0x5Au8; 100];
        let mut packet = vec![0u8; 256];
        // cap of 40 forces three fragments
        send_rtp(&mut rtp_state, &payload, 1, 0, 40, &mut packet, &bt).await.unwrap();

        let mut headers = Vec::new();
        let mut total = 0;
        for _ in 0..3 {
            let mut buf = [0u8; 256];
            let n = peer.recv(&mut buf).await.unwrap();
            headers.push(rtp::Header::parse(&buf[..n]).unwrap());
            total += n - rtp::HEADER_LEN;
        }
        assert_eq!(total, 100);
        // strictly incrementing sequence numbers
        assert_eq!(headers[1].sequence, headers[0].sequence + 1);
        assert_eq!(headers[2].sequence, headers[1].sequence + 1);
        // constant timestamp across fragments
        assert!(headers.iter().all(|h| h.timestamp == headers[0].timestamp));
        // marker only on the final fragment
        assert_eq!(headers.iter().map(|h| h.marker).collect::<Vec<_>>(), [false, false, true]);
    }

    #[tokio::test]
    async fn partial_frame_remains_buffered() {
        let (a, _b) = sock::socketpair(libc::SOCK_SEQPACKET).unwrap();
        let bt = BtStream::new(a).unwrap();

        let params = params(672);
        let mut codec = PcmPassthrough::new(8);
        let mut pcm_buf: FrameBuffer<i16> = FrameBuffer::new(64);
        let mut bt_buf: FrameBuffer<u8> = FrameBuffer::new(672);
        let mut rtp_state = rtp::State::new(48000, 48000);
        let mut packet = vec![0u8; 672];

        // five samples short of a frame stay for the next pass
        pcm_buf.extend_from_slice(&[7i16; 8 + 5]);
        let consumed = process(
            &params, &mut codec, &mut pcm_buf, &mut bt_buf, &mut rtp_state, &mut packet, &bt,
        )
        .await
        .unwrap();
        assert_eq!(consumed, 8);
        assert_eq!(pcm_buf.len_out(), 5);
    }
}

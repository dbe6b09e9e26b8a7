//! RTP framing for A2DP media packets.
//!
//! A2DP carries codec frames in RTP datagrams over L2CAP. The 12-byte
//! header is followed by optional CSRC entries and a codec-specific media
//! payload header. Sequence numbers and timestamps are big-endian on the
//! wire.

use crate::{Error, ErrorKind, InternalErrorKind, Result};

/// Size of the fixed RTP header in bytes.
pub const HEADER_LEN: usize = 12;

/// RTP protocol version emitted and accepted.
pub const VERSION: u8 = 2;

/// Dynamic payload type used for A2DP media packets.
pub const PAYLOAD_TYPE_MEDIA: u8 = 96;

/// Decoded RTP header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Header {
    /// Padding flag.
    pub padding: bool,
    /// Extension flag.
    pub extension: bool,
    /// Number of CSRC entries following the fixed header.
    pub csrc_count: u8,
    /// Marker bit; set on the final fragment of a fragmented payload.
    pub marker: bool,
    /// Payload type.
    pub payload_type: u8,
    /// Sequence number.
    pub sequence: u16,
    /// Timestamp in codec clock units.
    pub timestamp: u32,
    /// Synchronization source.
    pub ssrc: u32,
}

impl Header {
    /// Parses the fixed header from the beginning of an RTP packet.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::with_message(
                ErrorKind::Internal(InternalErrorKind::InvalidValue),
                format!("RTP packet too short: {} bytes", buf.len()),
            ));
        }
        if buf[0] >> 6 != VERSION {
            return Err(Error::with_message(
                ErrorKind::Internal(InternalErrorKind::InvalidValue),
                format!("unsupported RTP version: {}", buf[0] >> 6),
            ));
        }
        Ok(Self {
            padding: buf[0] & 0x20 != 0,
            extension: buf[0] & 0x10 != 0,
            csrc_count: buf[0] & 0x0F,
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7F,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Writes the fixed header into the beginning of `buf`.
    ///
    /// # Panics
    /// Panics when `buf` is shorter than [HEADER_LEN].
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = (VERSION << 6)
            | (u8::from(self.padding) << 5)
            | (u8::from(self.extension) << 4)
            | (self.csrc_count & 0x0F);
        buf[1] = (u8::from(self.marker) << 7) | (self.payload_type & 0x7F);
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
    }

    /// Offset of the media payload: fixed header, CSRC list and the
    /// codec-specific media header.
    pub fn payload_offset(&self, codec_header_len: usize) -> usize {
        HEADER_LEN + self.csrc_count as usize * 4 + codec_header_len
    }
}

/// Returns the media payload of an RTP packet, past the CSRC list and the
/// codec-specific header.
///
/// Returns [None] for packets whose payload type does not match.
pub fn get_payload<'a>(buf: &'a [u8], header: &Header, codec_header_len: usize) -> Option<&'a [u8]> {
    if header.payload_type != PAYLOAD_TYPE_MEDIA {
        return None;
    }
    buf.get(header.payload_offset(codec_header_len)..)
}

/// Report of one in-sequence observation on the decoder side.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StreamReport {
    /// Number of RTP frames lost before this one.
    pub missing: u16,
    /// Timestamp distance to the previous packet in codec clock units.
    ///
    /// Larger than one packet duration when frames were lost.
    pub timestamp_advance: u32,
}

/// Per-stream RTP bookkeeping.
///
/// The encoder side owns the authoritative sequence and timestamp counters;
/// the decoder side tracks the remote counters and detects gaps.
#[derive(Debug)]
pub struct State {
    sequence: u16,
    timestamp: u32,
    /// Codec clock ticks per second.
    clock_rate: u32,
    /// PCM frames per second.
    pcm_rate: u32,
    /// Fractional tick remainder carried between updates.
    tick_frac: u64,
    synced: bool,
    remote_sequence: u16,
    remote_timestamp: u32,
    missing_total: u64,
}

impl State {
    /// Creates RTP state for a stream whose codec clock runs at
    /// `clock_rate` ticks per second over PCM at `pcm_rate` frames per
    /// second.
    pub fn new(clock_rate: u32, pcm_rate: u32) -> Self {
        Self {
            sequence: 0,
            timestamp: 0,
            clock_rate,
            pcm_rate,
            tick_frac: 0,
            synced: false,
            remote_sequence: 0,
            remote_timestamp: 0,
            missing_total: 0,
        }
    }

    /// Current local sequence number.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Current local timestamp in codec clock units.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Total number of frames reported missing since stream start.
    pub fn missing_total(&self) -> u64 {
        self.missing_total
    }

    /// Begins a new outgoing frame: advances the sequence counter and
    /// stamps `header` with the current counters.
    pub fn new_frame(&mut self, header: &mut Header) {
        self.sequence = self.sequence.wrapping_add(1);
        header.sequence = self.sequence;
        header.timestamp = self.timestamp;
    }

    /// Advances the local timestamp by `pcm_frames` frames worth of codec
    /// clock ticks.
    pub fn update(&mut self, pcm_frames: usize) {
        let ticks = pcm_frames as u64 * self.clock_rate as u64 + self.tick_frac;
        self.timestamp = self.timestamp.wrapping_add((ticks / self.pcm_rate as u64) as u32);
        self.tick_frac = ticks % self.pcm_rate as u64;
    }

    /// Marks the decoder side unsynchronized.
    ///
    /// The next observation re-anchors without reporting a gap; used when
    /// decoded audio was discarded while no client was connected.
    pub fn desync(&mut self) {
        self.synced = false;
    }

    /// Synchronizes the decoder side with an incoming header.
    ///
    /// Returns the number of frames missed since the previous packet, or
    /// [None] for duplicates and reordered packets, which are dropped.
    pub fn sync_stream(&mut self, header: &Header) -> Option<StreamReport> {
        if !self.synced {
            self.synced = true;
            self.remote_sequence = header.sequence;
            self.remote_timestamp = header.timestamp;
            return Some(StreamReport::default());
        }

        let delta = header.sequence.wrapping_sub(self.remote_sequence) as i16;
        if delta <= 0 {
            log::debug!("Dropping duplicate/reordered RTP frame: {} (delta {})", header.sequence, delta);
            return None;
        }

        let missing = (delta - 1) as u16;
        if missing > 0 {
            log::warn!(
                "Missing RTP frames: {} (sequence {} -> {})",
                missing,
                self.remote_sequence,
                header.sequence
            );
            self.missing_total += u64::from(missing);
        }

        let timestamp_advance = header.timestamp.wrapping_sub(self.remote_timestamp);
        self.remote_sequence = header.sequence;
        self.remote_timestamp = header.timestamp;
        Some(StreamReport { missing, timestamp_advance })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_with_sequence(sequence: u16) -> Header {
        Header { payload_type: PAYLOAD_TYPE_MEDIA, sequence, timestamp: sequence as u32 * 128, ..Default::default() }
    }

    #[test]
    fn header_round_trip() {
        let hdr = Header {
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: true,
            payload_type: PAYLOAD_TYPE_MEDIA,
            sequence: 0xBEEF,
            timestamp: 0xDEAD_F00D,
            ssrc: 1,
        };
        let mut buf = [0u8; HEADER_LEN];
        hdr.write(&mut buf);
        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[1], 0x80 | PAYLOAD_TYPE_MEDIA);
        // big-endian on the wire
        assert_eq!(&buf[2..4], &[0xBE, 0xEF]);
        assert_eq!(&buf[4..8], &[0xDE, 0xAD, 0xF0, 0x0D]);
        assert_eq!(Header::parse(&buf).unwrap(), hdr);
    }

    #[test]
    fn parse_rejects_bad_version() {
        let buf = [0u8; HEADER_LEN];
        assert!(Header::parse(&buf).is_err());
        assert!(Header::parse(&buf[..4]).is_err());
    }

    #[test]
    fn payload_skips_csrc_and_codec_header() {
        let mut buf = vec![0u8; HEADER_LEN + 4 + 1 + 2];
        let hdr = Header { csrc_count: 1, payload_type: PAYLOAD_TYPE_MEDIA, ..Default::default() };
        hdr.write(&mut buf);
        buf[HEADER_LEN + 4 + 1..].copy_from_slice(&[0x11, 0x22]);
        assert_eq!(get_payload(&buf, &hdr, 1).unwrap(), &[0x11, 0x22]);
    }

    #[test]
    fn payload_of_unknown_type_is_none() {
        let buf = vec![0u8; HEADER_LEN];
        let hdr = Header { payload_type: 0x0D, ..Default::default() };
        assert!(get_payload(&buf, &hdr, 0).is_none());
    }

    #[test]
    fn encoder_counters_advance() {
        let mut state = State::new(44100, 44100);
        let mut hdr = Header::default();
        state.new_frame(&mut hdr);
        assert_eq!(hdr.sequence, 1);
        assert_eq!(hdr.timestamp, 0);
        state.update(128);
        state.new_frame(&mut hdr);
        assert_eq!(hdr.sequence, 2);
        assert_eq!(hdr.timestamp, 128);
    }

    #[test]
    fn timestamp_clock_scaling_accumulates_fractions() {
        // 8 kHz codec clock over 48 kHz PCM: one tick per six frames
        let mut state = State::new(8000, 48000);
        for _ in 0..6 {
            state.update(1);
        }
        assert_eq!(state.timestamp(), 1);
    }

    #[test]
    fn resync_reports_gaps_and_drops_reordered() {
        let mut state = State::new(16000, 16000);
        let mut reports = Vec::new();
        for sequence in [100u16, 101, 103, 102, 104] {
            reports.push(state.sync_stream(&header_with_sequence(sequence)).map(|r| r.missing));
        }
        assert_eq!(reports, [Some(0), Some(0), Some(1), None, Some(0)]);
        assert_eq!(reports.iter().filter(|r| r.is_some()).count(), 4);
        assert_eq!(state.missing_total(), 1);
    }

    #[test]
    fn desync_reanchors_without_gap_report() {
        let mut state = State::new(16000, 16000);
        assert_eq!(state.sync_stream(&header_with_sequence(10)).unwrap().missing, 0);
        state.desync();
        // large jump after desync is not a loss
        assert_eq!(state.sync_stream(&header_with_sequence(500)).unwrap().missing, 0);
    }

    #[test]
    fn sequence_wraps_around() {
        let mut state = State::new(16000, 16000);
        assert!(state.sync_stream(&header_with_sequence(u16::MAX)).is_some());
        let report = state.sync_stream(&header_with_sequence(0)).unwrap();
        assert_eq!(report.missing, 0);
    }
}

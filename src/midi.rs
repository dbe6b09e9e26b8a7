//! BLE-MIDI packet codec.
//!
//! MIDI messages travel over the GATT characteristic in packets bounded by
//! the ATT MTU. Each packet opens with a header octet carrying the high
//! six bits of the 13-bit millisecond timestamp; every message is preceded
//! by a timestamp octet with the low seven bits. Consecutive messages with
//! the same status elide the status byte (running status), and system
//! exclusive data may span packets until the end-of-exclusive byte.

use std::fmt;
use uuid::{uuid, Uuid};

/// UUID of the BLE-MIDI data I/O characteristic.
pub const CHARACTERISTIC_UUID: Uuid = uuid!("7772e5db-3868-4112-a1a9-f2669d106bf3");

/// UUID of the BLE-MIDI service.
pub const SERVICE_UUID: Uuid = uuid!("03b80e5a-ede8-4b33-a751-6ce34ec4c700");

/// Timestamps are thirteen bits of milliseconds.
pub const TIMESTAMP_MASK: u16 = 0x1FFF;

const SYSEX_START: u8 = 0xF0;
const SYSEX_END: u8 = 0xF7;

/// Errors of the packet encoder.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EncodeError {
    /// The message does not fit the remaining packet space; transmit the
    /// packet and start a new one.
    PacketFull,
    /// Not a valid MIDI message.
    InvalidMessage,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::PacketFull => f.write_str("BLE-MIDI packet full"),
            Self::InvalidMessage => f.write_str("invalid MIDI message"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// One decoded MIDI event with its absolute 13-bit timestamp.
#[derive(Clone, custom_debug::Debug, Eq, PartialEq)]
pub struct MidiEvent {
    /// Milliseconds, thirteen bits.
    pub timestamp_ms: u16,
    /// Complete MIDI message including the status byte.
    #[debug(format = "{:02x?}")]
    pub message: Vec<u8>,
}

/// Bytes of a channel or system-common message following the status byte.
fn message_data_len(status: u8) -> Option<usize> {
    match status {
        0x80..=0xBF | 0xE0..=0xEF => Some(2),
        0xC0..=0xDF => Some(1),
        0xF1 | 0xF3 => Some(1),
        0xF2 => Some(2),
        0xF6 | 0xF8..=0xFF => Some(0),
        _ => None,
    }
}

/// MTU-bounded BLE-MIDI packet encoder.
#[derive(Debug)]
pub struct Encoder {
    mtu: usize,
    packet: Vec<u8>,
    running_status: Option<u8>,
}

impl Encoder {
    /// Creates an encoder for packets up to `mtu` bytes, as reported by
    /// the ATT MTU of the GATT link.
    pub fn new(mtu: usize) -> Self {
        Self { mtu: mtu.max(5), packet: Vec::new(), running_status: None }
    }

    /// Whether a packet has been started.
    pub fn is_empty(&self) -> bool {
        self.packet.is_empty()
    }

    /// Appends one complete MIDI message with its timestamp.
    ///
    /// [EncodeError::PacketFull] means the current packet must be
    /// transmitted with [take_packet](Self::take_packet) before retrying.
    pub fn add(&mut self, timestamp_ms: u16, message: &[u8]) -> Result<(), EncodeError> {
        let status = *message.first().ok_or(EncodeError::InvalidMessage)?;
        if status & 0x80 == 0 {
            return Err(EncodeError::InvalidMessage);
        }
        if status == SYSEX_START {
            return self.add_sysex(timestamp_ms, message);
        }
        let data_len = message_data_len(status).ok_or(EncodeError::InvalidMessage)?;
        if message.len() != 1 + data_len {
            return Err(EncodeError::InvalidMessage);
        }

        let timestamp_ms = timestamp_ms & TIMESTAMP_MASK;
        let elide = self.running_status == Some(status) && status < 0xF0;
        let needed = 1 + usize::from(!elide) + data_len + if self.packet.is_empty() { 1 } else { 0 };
        if self.packet.len() + needed > self.mtu {
            return Err(EncodeError::PacketFull);
        }

        if self.packet.is_empty() {
            self.packet.push(0x80 | ((timestamp_ms >> 7) as u8 & 0x3F));
        }
        self.packet.push(0x80 | (timestamp_ms as u8 & 0x7F));
        if !elide {
            self.packet.push(status);
        }
        self.packet.extend_from_slice(&message[1..]);
        if status < 0xF0 {
            self.running_status = Some(status);
        } else {
            self.running_status = None;
        }
        Ok(())
    }

    fn add_sysex(&mut self, timestamp_ms: u16, message: &[u8]) -> Result<(), EncodeError> {
        if message.last() != Some(&SYSEX_END) {
            return Err(EncodeError::InvalidMessage);
        }
        let timestamp_ms = timestamp_ms & TIMESTAMP_MASK;
        // start byte, payload, then a timestamped end byte
        let needed = 1 + 1 + (message.len() - 2) + 1 + 1 + if self.packet.is_empty() { 1 } else { 0 };
        if self.packet.len() + needed > self.mtu {
            return Err(EncodeError::PacketFull);
        }

        if self.packet.is_empty() {
            self.packet.push(0x80 | ((timestamp_ms >> 7) as u8 & 0x3F));
        }
        self.packet.push(0x80 | (timestamp_ms as u8 & 0x7F));
        self.packet.push(SYSEX_START);
        self.packet.extend_from_slice(&message[1..message.len() - 1]);
        self.packet.push(0x80 | (timestamp_ms as u8 & 0x7F));
        self.packet.push(SYSEX_END);
        self.running_status = None;
        Ok(())
    }

    /// Takes the finished packet, leaving the encoder ready for the next.
    pub fn take_packet(&mut self) -> Vec<u8> {
        self.running_status = None;
        std::mem::take(&mut self.packet)
    }
}

/// BLE-MIDI packet decoder.
///
/// System exclusive data is buffered across packets until the
/// end-of-exclusive byte arrives.
#[derive(Debug, Default)]
pub struct Decoder {
    running_status: Option<u8>,
    sysex: Option<Vec<u8>>,
}

impl Decoder {
    /// Creates a decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one packet into timestamped events.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<MidiEvent>, EncodeError> {
        if packet.len() < 2 || packet[0] & 0xC0 != 0x80 {
            return Err(EncodeError::InvalidMessage);
        }
        let mut ts_high = u16::from(packet[0] & 0x3F);
        let mut last_ts_low: Option<u16> = None;
        let mut events = Vec::new();
        let mut i = 1;

        // system exclusive continued from the previous packet
        if let Some(sysex) = &mut self.sysex {
            while i < packet.len() && packet[i] & 0x80 == 0 {
                sysex.push(packet[i]);
                i += 1;
            }
        }

        let mut timestamp = |low: u16, last: &mut Option<u16>, high: &mut u16| -> u16 {
            if let Some(previous) = *last {
                // low timestamp wrapped within the packet
                if low < previous {
                    *high = (*high + 1) & 0x3F;
                }
            }
            *last = Some(low);
            ((*high << 7) | low) & TIMESTAMP_MASK
        };

        while i < packet.len() {
            if packet[i] & 0x80 == 0 {
                return Err(EncodeError::InvalidMessage);
            }
            let ts = timestamp(u16::from(packet[i] & 0x7F), &mut last_ts_low, &mut ts_high);
            i += 1;
            if i >= packet.len() {
                break;
            }

            let status = if packet[i] & 0x80 != 0 {
                let status = packet[i];
                i += 1;
                status
            } else {
                self.running_status.ok_or(EncodeError::InvalidMessage)?
            };

            match status {
                SYSEX_START => {
                    let mut data = vec![SYSEX_START];
                    while i < packet.len() && packet[i] & 0x80 == 0 {
                        data.push(packet[i]);
                        i += 1;
                    }
                    self.sysex = Some(data);
                    self.running_status = None;
                }
                SYSEX_END => {
                    let mut data = self.sysex.take().ok_or(EncodeError::InvalidMessage)?;
                    data.push(SYSEX_END);
                    events.push(MidiEvent { timestamp_ms: ts, message: data });
                }
                status => {
                    let data_len = message_data_len(status).ok_or(EncodeError::InvalidMessage)?;
                    if i + data_len > packet.len() {
                        return Err(EncodeError::InvalidMessage);
                    }
                    let mut message = vec![status];
                    message.extend_from_slice(&packet[i..i + data_len]);
                    i += data_len;
                    events.push(MidiEvent { timestamp_ms: ts, message });
                    if status < 0xF0 {
                        self.running_status = Some(status);
                    }
                }
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_with_running_status() {
        let mut encoder = Encoder::new(64);
        encoder.add(0x123, &[0x90, 60, 100]).unwrap();
        encoder.add(0x124, &[0x90, 64, 100]).unwrap();
        encoder.add(0x125, &[0x80, 60, 0]).unwrap();
        let packet = encoder.take_packet();

        // header + (ts status d d) + (ts d d) + (ts status d d): running
        // status elides the second note-on status byte
        assert_eq!(packet.len(), 1 + 4 + 3 + 4);
        assert_eq!(packet[0], 0x80 | 0x02);

        let mut decoder = Decoder::new();
        let events = decoder.decode(&packet).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], MidiEvent { timestamp_ms: 0x123, message: vec![0x90, 60, 100] });
        assert_eq!(events[1], MidiEvent { timestamp_ms: 0x124, message: vec![0x90, 64, 100] });
        assert_eq!(events[2], MidiEvent { timestamp_ms: 0x125, message: vec![0x80, 60, 0] });
    }

    #[test]
    fn mtu_overflow_signals_new_packet() {
        let mut encoder = Encoder::new(8);
        encoder.add(0, &[0x90, 60, 100]).unwrap();
        // header(1) + 4 bytes used; another 3-byte run does not fit in 8
        assert_eq!(encoder.add(0, &[0x91, 61, 100]), Err(EncodeError::PacketFull));
        let packet = encoder.take_packet();
        assert_eq!(packet.len(), 5);
        // retry after draining succeeds
        encoder.add(0, &[0x91, 61, 100]).unwrap();
    }

    #[test]
    fn sysex_crosses_packet_boundary() {
        let mut decoder = Decoder::new();
        // F0 03 04 ... continued
        let first = [0x80, 0x80, 0xF0, 0x03, 0x04];
        assert!(decoder.decode(&first).unwrap().is_empty());
        // ... 05 06, then timestamped F7
        let second = [0x80, 0x05, 0x06, 0x81, 0xF7];
        let events = decoder.decode(&second).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, vec![0xF0, 0x03, 0x04, 0x05, 0x06, 0xF7]);
        assert_eq!(events[0].timestamp_ms, 1);
    }

    #[test]
    fn sysex_encodes_with_explicit_boundaries() {
        let mut encoder = Encoder::new(32);
        encoder.add(0x40, &[0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7]).unwrap();
        let packet = encoder.take_packet();
        let mut decoder = Decoder::new();
        let events = decoder.decode(&packet).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, vec![0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7]);
        assert_eq!(events[0].timestamp_ms, 0x40);
    }

    #[test]
    fn timestamp_low_wrap_increments_high_bits() {
        let mut encoder = Encoder::new(64);
        encoder.add(0x7F, &[0x90, 60, 100]).unwrap();
        let mut packet = encoder.take_packet();
        // append a second run whose low timestamp wrapped to zero
        packet.extend_from_slice(&[0x80, 0x91, 61, 100]);
        let mut decoder = Decoder::new();
        let events = decoder.decode(&packet).unwrap();
        assert_eq!(events[0].timestamp_ms, 0x7F);
        assert_eq!(events[1].timestamp_ms, 0x80);
    }

    #[test]
    fn rejects_malformed_input() {
        let mut decoder = Decoder::new();
        assert!(decoder.decode(&[0x00, 0x80]).is_err());
        assert!(decoder.decode(&[0x80, 0x80, 0x12]).is_err());
        let mut encoder = Encoder::new(64);
        assert_eq!(encoder.add(0, &[0x60]), Err(EncodeError::InvalidMessage));
        assert_eq!(encoder.add(0, &[0x90, 60]), Err(EncodeError::InvalidMessage));
        assert_eq!(encoder.add(0, &[0xF0, 0x01]), Err(EncodeError::InvalidMessage));
    }
}

//! Overbridge MIDI wire format: 4-byte packets (header nibble plus three
//! data bytes) stamped with a wallclock microsecond reading when queued
//! on a ring.

use byteorder::{ByteOrder, LittleEndian};

pub const SYSEX_CONT: u8 = 0x04;
pub const SYSEX_END_1: u8 = 0x05;
pub const SYSEX_END_2: u8 = 0x06;
pub const SYSEX_END_3: u8 = 0x07;
pub const NOTE_OFF: u8 = 0x08;
pub const NOTE_ON: u8 = 0x09;
pub const POLY_PRESSURE: u8 = 0x0a;
pub const CONTROL_CHANGE: u8 = 0x0b;
pub const PROGRAM_CHANGE: u8 = 0x0c;
pub const CHANNEL_PRESSURE: u8 = 0x0d;
pub const PITCH_BEND: u8 = 0x0e;
pub const SINGLE_BYTE: u8 = 0x0f;

pub const PACKET_DATA_BYTES: usize = 3;

/// On-ring record: 8-byte LE timestamp, header byte, 3 data bytes.
pub const EVENT_BYTES: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub time: u64,
    pub header: u8,
    pub data: [u8; PACKET_DATA_BYTES],
}

impl MidiEvent {
    /// Builds a packet, zero-padding past the payload.
    pub fn new(time: u64, header: u8, payload: &[u8]) -> Self {
        let mut data = [0_u8; PACKET_DATA_BYTES];
        let n = payload.len().min(PACKET_DATA_BYTES);
        data[..n].copy_from_slice(&payload[..n]);
        Self { time, header, data }
    }

    pub fn encode(&self, out: &mut [u8; EVENT_BYTES]) {
        LittleEndian::write_u64(&mut out[..8], self.time);
        out[8] = self.header;
        out[9..].copy_from_slice(&self.data);
    }

    pub fn decode(buf: &[u8; EVENT_BYTES]) -> Self {
        let mut data = [0_u8; PACKET_DATA_BYTES];
        data.copy_from_slice(&buf[9..]);
        Self {
            time: LittleEndian::read_u64(&buf[..8]),
            header: buf[8],
            data,
        }
    }
}

/// Payload length of a device packet and whether it completes a message
/// that should be handed to the host.
pub fn classify(header: u8) -> Option<(usize, bool)> {
    match header {
        SYSEX_CONT => Some((3, false)),
        SYSEX_END_1 => Some((1, true)),
        SYSEX_END_2 => Some((2, true)),
        SYSEX_END_3 => Some((3, true)),
        PROGRAM_CHANGE | CHANNEL_PRESSURE => Some((2, true)),
        NOTE_OFF | NOTE_ON | POLY_PRESSURE | CONTROL_CHANGE | PITCH_BEND => Some((3, true)),
        SINGLE_BYTE => Some((1, true)),
        _ => None,
    }
}

/// Packet header for a non-SysEx host message, by status byte and size.
pub fn header_for(status: u8, size: usize) -> Option<u8> {
    match size {
        1 => (0xf8..=0xfc).contains(&status).then_some(SINGLE_BYTE),
        2 => match status & 0xf0 {
            0xc0 => Some(PROGRAM_CHANGE),
            0xd0 => Some(CHANNEL_PRESSURE),
            _ => None,
        },
        3 => match status & 0xf0 {
            0x80 => Some(NOTE_OFF),
            0x90 => Some(NOTE_ON),
            0xa0 => Some(POLY_PRESSURE),
            0xb0 => Some(CONTROL_CHANGE),
            0xe0 => Some(PITCH_BEND),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let event = MidiEvent::new(123_456_789, NOTE_ON, &[0x90, 0x3c, 0x7f]);
        let mut buf = [0_u8; EVENT_BYTES];
        event.encode(&mut buf);
        assert_eq!(MidiEvent::decode(&buf), event);
    }

    #[test]
    fn short_payload_is_zero_padded() {
        let event = MidiEvent::new(0, SYSEX_END_1, &[0xf7]);
        assert_eq!(event.data, [0xf7, 0x00, 0x00]);
    }

    #[test]
    fn channel_messages_map_both_ways() {
        for (status, size) in [
            (0x80_u8, 3_usize),
            (0x90, 3),
            (0xa0, 3),
            (0xb0, 3),
            (0xe0, 3),
            (0xc0, 2),
            (0xd0, 2),
            (0xf8, 1),
        ] {
            let header = header_for(status, size).unwrap();
            let (len, send) = classify(header).unwrap();
            assert_eq!(len, size);
            assert!(send);
        }
    }

    #[test]
    fn unknown_headers_are_rejected() {
        assert!(classify(0x00).is_none());
        assert!(classify(0x03).is_none());
        assert!(header_for(0xf0, 3).is_none());
        assert!(header_for(0x40, 3).is_none());
    }

    #[test]
    fn sysex_continuation_does_not_send() {
        let (len, send) = classify(SYSEX_CONT).unwrap();
        assert_eq!(len, 3);
        assert!(!send);
    }
}

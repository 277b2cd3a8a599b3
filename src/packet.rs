//! USB-MIDI class packet codec
//!
//! Every packet on the wire is four bytes: a Code Index Number (CIN) followed
//! by three MIDI bytes, zero-filled when unused. Cable number is always 0, so
//! the first byte is the bare CIN.

use crate::error::CodecError;
use crate::midi::{MidiMessage, SYSEX_END, SYSEX_START};

/// SysEx starts or continues (3 bytes)
pub const CIN_SYSEX_CONTINUE: u8 = 0x4;
/// SysEx ends with 1 byte
pub const CIN_SYSEX_END_1: u8 = 0x5;
/// SysEx ends with 2 bytes
pub const CIN_SYSEX_END_2: u8 = 0x6;
/// SysEx ends with 3 bytes
pub const CIN_SYSEX_END_3: u8 = 0x7;

/// Roland GS reset
pub const GS_RESET: [u8; 11] = [
    0xF0, 0x41, 0x10, 0x42, 0x12, 0x40, 0x00, 0x7F, 0x00, 0x41, 0xF7,
];

/// Universal real-time master volume, full scale
pub const MASTER_VOLUME: [u8; 8] = [0xF0, 0x7F, 0x7F, 0x04, 0x01, 0x00, 0x7F, 0xF7];

/// One four-byte USB-MIDI event packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbMidiPacket {
    pub cin: u8,
    pub payload: [u8; 3],
}

impl UsbMidiPacket {
    pub const SIZE: usize = 4;

    pub const fn new(cin: u8, payload: [u8; 3]) -> Self {
        Self {
            cin: cin & 0x0F,
            payload,
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        [self.cin, self.payload[0], self.payload[1], self.payload[2]]
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self::new(bytes[0], [bytes[1], bytes[2], bytes[3]])
    }

    /// Number of meaningful payload bytes for a SysEx packet
    fn sysex_len(&self) -> Option<usize> {
        match self.cin {
            CIN_SYSEX_CONTINUE | CIN_SYSEX_END_3 => Some(3),
            CIN_SYSEX_END_2 => Some(2),
            CIN_SYSEX_END_1 => Some(1),
            _ => None,
        }
    }
}

/// Flatten packets to the bytes of a bulk transfer
pub fn to_wire(packets: &[UsbMidiPacket]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(packets.len() * UsbMidiPacket::SIZE);
    for packet in packets {
        wire.extend_from_slice(&packet.to_bytes());
    }
    wire
}

/// Split bulk-transfer bytes back into packets; a trailing partial packet is dropped
pub fn from_wire(bytes: &[u8]) -> Vec<UsbMidiPacket> {
    bytes
        .chunks_exact(UsbMidiPacket::SIZE)
        .map(|c| UsbMidiPacket::from_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Encode a live channel/system event; CIN is the status byte's high nibble.
///
/// Callers filter real-time bytes (>= 0xF8) before reaching this point.
pub fn encode_live_event(msg: &MidiMessage) -> UsbMidiPacket {
    debug_assert!(
        !msg.is_realtime(),
        "real-time byte {:02X} must be filtered before encoding",
        msg.status
    );
    UsbMidiPacket::new(msg.high_nibble(), msg.to_bytes())
}

/// Inverse of [`encode_live_event`]
pub fn decode_live_event(packet: &UsbMidiPacket) -> MidiMessage {
    MidiMessage::new(packet.payload[0], packet.payload[1], packet.payload[2])
}

/// A complete SysEx message, `F0 ... F7`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysExPayload(Vec<u8>);

impl SysExPayload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, CodecError> {
        let bytes = bytes.into();
        if bytes.len() < 2 {
            return Err(CodecError::TooShort(bytes.len()));
        }
        if bytes[0] != SYSEX_START {
            return Err(CodecError::MissingStart(bytes[0]));
        }
        let last = bytes[bytes.len() - 1];
        if last != SYSEX_END {
            return Err(CodecError::MissingEnd(last));
        }
        if let Some(pos) = bytes[..bytes.len() - 1].iter().position(|&b| b == SYSEX_END) {
            return Err(CodecError::EarlyEnd(pos));
        }
        Ok(Self(bytes))
    }

    /// Roland GS reset
    pub fn gs_reset() -> Self {
        Self(GS_RESET.to_vec())
    }

    /// Universal master volume at full scale
    pub fn master_volume() -> Self {
        Self(MASTER_VOLUME.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lazily encode into packets. Each call starts a fresh sequence.
    pub fn packets(&self) -> SysExPackets<'_> {
        SysExPackets {
            chunks: self.0.chunks(3),
        }
    }
}

/// Iterator returned by [`SysExPayload::packets`]
#[derive(Debug, Clone)]
pub struct SysExPackets<'a> {
    chunks: std::slice::Chunks<'a, u8>,
}

impl Iterator for SysExPackets<'_> {
    type Item = UsbMidiPacket;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunks.next()?;
        let ends = chunk.last() == Some(&SYSEX_END);
        let cin = match (chunk.len(), ends) {
            (3, false) => CIN_SYSEX_CONTINUE,
            (3, true) => CIN_SYSEX_END_3,
            (2, _) => CIN_SYSEX_END_2,
            _ => CIN_SYSEX_END_1,
        };
        let mut payload = [0u8; 3];
        payload[..chunk.len()].copy_from_slice(chunk);
        Some(UsbMidiPacket::new(cin, payload))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for SysExPackets<'_> {}

/// Encode a SysEx message into its packet sequence
pub fn encode_sysex(payload: &SysExPayload) -> SysExPackets<'_> {
    payload.packets()
}

/// Reassemble SysEx bytes from packets; `None` if a non-SysEx CIN is present
pub fn decode_sysex(packets: &[UsbMidiPacket]) -> Option<Vec<u8>> {
    let mut bytes = Vec::with_capacity(packets.len() * 3);
    for packet in packets {
        let len = packet.sysex_len()?;
        bytes.extend_from_slice(&packet.payload[..len]);
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_live_event_uses_high_nibble() {
        let packet = encode_live_event(&MidiMessage::new(0x93, 60, 100));
        assert_eq!(packet.to_bytes(), [0x09, 0x93, 60, 100]);

        let packet = encode_live_event(&MidiMessage::new(0xC1, 5, 0));
        assert_eq!(packet.to_bytes(), [0x0C, 0xC1, 5, 0]);
    }

    #[test]
    fn test_gs_reset_packets() {
        let payload = SysExPayload::new(GS_RESET.to_vec()).unwrap();
        let packets: Vec<_> = payload.packets().collect();

        assert_eq!(packets.len(), 4);
        assert_eq!(packets[0].to_bytes(), [0x04, 0xF0, 0x41, 0x10]);
        assert_eq!(packets[1].to_bytes(), [0x04, 0x42, 0x12, 0x40]);
        assert_eq!(packets[2].to_bytes(), [0x04, 0x00, 0x7F, 0x00]);
        assert_eq!(packets[3].to_bytes(), [0x06, 0x41, 0xF7, 0x00]);
    }

    #[test]
    fn test_master_volume_packets() {
        let payload = SysExPayload::new(MASTER_VOLUME.to_vec()).unwrap();
        let packets: Vec<_> = encode_sysex(&payload).collect();

        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].to_bytes(), [0x04, 0xF0, 0x7F, 0x7F]);
        assert_eq!(packets[1].to_bytes(), [0x04, 0x04, 0x01, 0x00]);
        // 8 = 3 + 3 + 2, so the tail is a two-byte end packet
        assert_eq!(packets[2].to_bytes(), [0x06, 0x7F, 0xF7, 0x00]);
    }

    #[test]
    fn test_builtin_payloads_are_valid() {
        assert_eq!(SysExPayload::new(GS_RESET.to_vec()), Ok(SysExPayload::gs_reset()));
        assert_eq!(
            SysExPayload::new(MASTER_VOLUME.to_vec()),
            Ok(SysExPayload::master_volume())
        );
    }

    #[test]
    fn test_three_byte_tail() {
        let payload = SysExPayload::new(vec![0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7]).unwrap();
        let packets: Vec<_> = payload.packets().collect();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].to_bytes(), [0x04, 0xF0, 0x7E, 0x7F]);
        assert_eq!(packets[1].to_bytes(), [0x07, 0x06, 0x01, 0xF7]);
    }

    #[test]
    fn test_single_byte_tail() {
        // 10 bytes: three full chunks then a lone F7
        let payload =
            SysExPayload::new(vec![0xF0, 0x7E, 0x7F, 0x09, 0x01, 0x00, 0x01, 0x02, 0x03, 0xF7])
                .unwrap();
        let packets: Vec<_> = payload.packets().collect();
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[3].to_bytes(), [0x05, 0xF7, 0x00, 0x00]);
    }

    #[test]
    fn test_shortest_sysex() {
        let payload = SysExPayload::new(vec![0xF0, 0xF7]).unwrap();
        let packets: Vec<_> = payload.packets().collect();
        assert_eq!(packets, vec![UsbMidiPacket::new(0x06, [0xF0, 0xF7, 0x00])]);
    }

    #[test]
    fn test_packets_restartable() {
        let payload = SysExPayload::new(GS_RESET.to_vec()).unwrap();
        let first: Vec<_> = payload.packets().collect();
        let second: Vec<_> = payload.packets().collect();
        assert_eq!(first, second);
        assert_eq!(payload.packets().len(), 4);
    }

    #[test]
    fn test_malformed_sysex_rejected() {
        assert_eq!(SysExPayload::new(vec![0xF0]), Err(CodecError::TooShort(1)));
        assert_eq!(
            SysExPayload::new(vec![0x90, 0xF7]),
            Err(CodecError::MissingStart(0x90))
        );
        assert_eq!(
            SysExPayload::new(vec![0xF0, 0x41, 0x10]),
            Err(CodecError::MissingEnd(0x10))
        );
        assert_eq!(
            SysExPayload::new(vec![0xF0, 0xF7, 0x10, 0xF7]),
            Err(CodecError::EarlyEnd(1))
        );
    }

    #[test]
    fn test_wire_flattening() {
        let payload = SysExPayload::new(MASTER_VOLUME.to_vec()).unwrap();
        let packets: Vec<_> = payload.packets().collect();
        let wire = to_wire(&packets);
        assert_eq!(wire.len(), 12);
        assert_eq!(&wire[..4], &[0x04, 0xF0, 0x7F, 0x7F]);
        assert_eq!(from_wire(&wire), packets);
    }

    #[test]
    fn test_decode_sysex_rejects_live_packets() {
        let live = encode_live_event(&MidiMessage::new(0x90, 1, 2));
        assert_eq!(decode_sysex(&[live]), None);
    }

    proptest! {
        #[test]
        fn prop_live_event_round_trip(status in 0x80u8..0xF8, d1 in 0u8..0x80, d2 in 0u8..0x80) {
            let msg = MidiMessage::new(status, d1, d2);
            let packet = encode_live_event(&msg);
            prop_assert_eq!(packet.cin, status >> 4);
            prop_assert_eq!(packet.payload, [status, d1, d2]);
            prop_assert_eq!(decode_live_event(&packet), msg);
        }

        #[test]
        fn prop_sysex_round_trip(body in proptest::collection::vec(0u8..0x80, 0..64)) {
            let mut bytes = vec![SYSEX_START];
            bytes.extend(&body);
            bytes.push(SYSEX_END);
            let payload = SysExPayload::new(bytes.clone()).unwrap();

            let packets: Vec<_> = payload.packets().collect();
            prop_assert_eq!(packets.len(), bytes.len().div_ceil(3));
            let (last, init) = packets.split_last().unwrap();
            prop_assert!(init.iter().all(|p| p.cin == CIN_SYSEX_CONTINUE));
            prop_assert!(matches!(last.cin, CIN_SYSEX_END_1 | CIN_SYSEX_END_2 | CIN_SYSEX_END_3));
            prop_assert_eq!(decode_sysex(&packets), Some(bytes));
        }
    }
}

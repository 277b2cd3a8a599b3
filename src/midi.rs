//! MIDI message types
//!
//! Provides the raw three-byte live event carried from an input port to the
//! synthesizer, plus status-byte classification and hex formatting.

use std::fmt;

/// First status byte of the real-time range (timing clock, active sensing, ...)
pub const REALTIME_START: u8 = 0xF8;

/// SysEx start byte
pub const SYSEX_START: u8 = 0xF0;

/// SysEx end byte (EOX)
pub const SYSEX_END: u8 = 0xF7;

/// A live MIDI event as delivered by an input port
///
/// Messages shorter than three bytes (program change, channel pressure, ...)
/// are zero-padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MidiMessage {
    pub status: u8,
    pub data1: u8,
    pub data2: u8,
}

/// Message class derived from the status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    NoteOff,
    NoteOn,
    PolyPressure,
    ControlChange,
    ProgramChange,
    ChannelPressure,
    PitchBend,
    /// 0xF0-0xF7: SysEx framing, song position, tune request, ...
    SystemCommon,
    /// 0xF8-0xFF: timing clock, start/stop, active sensing, reset
    RealTime,
    /// Status byte below 0x80 (running status or a stray data byte)
    Data,
}

impl MidiMessage {
    pub const fn new(status: u8, data1: u8, data2: u8) -> Self {
        Self { status, data1, data2 }
    }

    /// Build a message from raw port bytes, zero-padding missing data bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let (&status, rest) = data.split_first()?;
        Some(Self {
            status,
            data1: rest.first().copied().unwrap_or(0),
            data2: rest.get(1).copied().unwrap_or(0),
        })
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        [self.status, self.data1, self.data2]
    }

    /// High nibble of the status byte
    pub fn high_nibble(&self) -> u8 {
        (self.status >> 4) & 0x0F
    }

    pub fn kind(&self) -> MessageKind {
        match self.status {
            0x00..=0x7F => MessageKind::Data,
            0x80..=0x8F => MessageKind::NoteOff,
            0x90..=0x9F => MessageKind::NoteOn,
            0xA0..=0xAF => MessageKind::PolyPressure,
            0xB0..=0xBF => MessageKind::ControlChange,
            0xC0..=0xCF => MessageKind::ProgramChange,
            0xD0..=0xDF => MessageKind::ChannelPressure,
            0xE0..=0xEF => MessageKind::PitchBend,
            0xF0..=0xF7 => MessageKind::SystemCommon,
            0xF8..=0xFF => MessageKind::RealTime,
        }
    }

    /// Real-time bytes (clock, active sensing, ...) are never forwarded
    pub fn is_realtime(&self) -> bool {
        self.status >= REALTIME_START
    }

    /// Whether the event may be handed to the live-event encoder
    pub fn is_forwardable(&self) -> bool {
        !self.is_realtime() && self.status & 0x80 != 0
    }

    /// Channel (0-15) for channel voice messages
    pub fn channel(&self) -> Option<u8> {
        match self.kind() {
            MessageKind::SystemCommon | MessageKind::RealTime | MessageKind::Data => None,
            _ => Some(self.status & 0x0F),
        }
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ch = self.channel().map(|c| c + 1).unwrap_or(0);
        match self.kind() {
            MessageKind::NoteOff => write!(f, "NoteOff ch:{} n:{} v:{}", ch, self.data1, self.data2),
            MessageKind::NoteOn => write!(f, "NoteOn ch:{} n:{} v:{}", ch, self.data1, self.data2),
            MessageKind::PolyPressure => {
                write!(f, "PolyPressure ch:{} n:{} p:{}", ch, self.data1, self.data2)
            }
            MessageKind::ControlChange => {
                write!(f, "CC ch:{} cc:{} v:{}", ch, self.data1, self.data2)
            }
            MessageKind::ProgramChange => write!(f, "ProgramChange ch:{} p:{}", ch, self.data1),
            MessageKind::ChannelPressure => {
                write!(f, "ChannelPressure ch:{} p:{}", ch, self.data1)
            }
            MessageKind::PitchBend => {
                let value = ((self.data2 as u16 & 0x7F) << 7) | (self.data1 as u16 & 0x7F);
                write!(f, "PitchBend ch:{} v:{}", ch, value)
            }
            _ => write!(f, "{}", format_hex(&self.to_bytes())),
        }
    }
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_pads_short_messages() {
        let msg = MidiMessage::from_bytes(&[0xC3, 12]).unwrap();
        assert_eq!(msg, MidiMessage::new(0xC3, 12, 0));
        assert_eq!(msg.kind(), MessageKind::ProgramChange);
        assert_eq!(msg.channel(), Some(3));

        assert!(MidiMessage::from_bytes(&[]).is_none());
    }

    #[test]
    fn test_realtime_classification() {
        assert!(MidiMessage::new(0xF8, 0, 0).is_realtime());
        assert!(MidiMessage::new(0xFE, 0, 0).is_realtime());
        assert!(!MidiMessage::new(0xF8, 0, 0).is_forwardable());
        assert!(MidiMessage::new(0xF2, 0x10, 0x20).is_forwardable());
        assert!(!MidiMessage::new(0x40, 0x10, 0x20).is_forwardable());
    }

    #[test]
    fn test_display() {
        let msg = MidiMessage::new(0x90, 60, 100);
        assert_eq!(msg.to_string(), "NoteOn ch:1 n:60 v:100");

        let pb = MidiMessage::new(0xE0, 0x00, 0x40);
        assert_eq!(pb.to_string(), "PitchBend ch:1 v:8192");
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0xF0, 0x41, 0xF7]), "F0 41 F7");
    }
}

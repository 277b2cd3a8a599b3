//! Error taxonomy for the bridge
//!
//! Session-fatal failures (`BridgeError`) are kept apart from the absorbable
//! steady-state `WriteFailure` so the forwarding loop can never escalate a
//! transient bulk-write error by accident.

use std::fmt;
use thiserror::Error;

/// Step of the claim sequence that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStage {
    Enumerate,
    Configuration,
    ClaimInterface,
    AltSetting,
}

impl fmt::Display for ClaimStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimStage::Enumerate => write!(f, "interface enumeration"),
            ClaimStage::Configuration => write!(f, "set configuration"),
            ClaimStage::ClaimInterface => write!(f, "claim interface"),
            ClaimStage::AltSetting => write!(f, "select alternate setting"),
        }
    }
}

/// Failures that end a connection attempt
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("device {vendor_id:04x}:{product_id:04x} not found")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("claim failed at {stage}: {source}")]
    ClaimFailure {
        stage: ClaimStage,
        #[source]
        source: rusb::Error,
    },

    #[error("initialization failed sending {command}: {source}")]
    InitFailure {
        command: &'static str,
        #[source]
        source: WriteFailure,
    },

    #[error("failed to open MIDI input '{id}': {reason}")]
    InputOpenFailure { id: String, reason: String },

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("failed to start forwarding thread: {0}")]
    Thread(#[from] std::io::Error),
}

impl BridgeError {
    /// Short label used in status reports
    pub fn label(&self) -> &'static str {
        match self {
            BridgeError::DeviceNotFound { .. } => "DeviceNotFound",
            BridgeError::ClaimFailure { .. } => "ClaimFailure",
            BridgeError::InitFailure { .. } => "InitFailure",
            BridgeError::InputOpenFailure { .. } => "InputOpenFailure",
            BridgeError::Usb(_) => "UsbError",
            BridgeError::Thread(_) => "ThreadError",
        }
    }
}

/// A bulk write that did not complete
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteFailure {
    #[error("bulk write failed: {0}")]
    Usb(rusb::Error),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("device session already released")]
    Released,
}

impl WriteFailure {
    /// The device is gone; retrying on this session is pointless
    pub fn is_device_lost(&self) -> bool {
        matches!(self, WriteFailure::Usb(rusb::Error::NoDevice) | WriteFailure::Released)
    }
}

/// Malformed SysEx handed to the codec
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("SysEx must be at least 2 bytes, got {0}")]
    TooShort(usize),

    #[error("SysEx must start with F0, got {0:02X}")]
    MissingStart(u8),

    #[error("SysEx must end with F7, got {0:02X}")]
    MissingEnd(u8),

    #[error("unexpected F7 at offset {0} before end of SysEx")]
    EarlyEnd(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_labels_and_messages() {
        let err = BridgeError::DeviceNotFound {
            vendor_id: 0x0582,
            product_id: 0x000c,
        };
        assert_eq!(err.label(), "DeviceNotFound");
        assert_eq!(err.to_string(), "device 0582:000c not found");

        let err = BridgeError::ClaimFailure {
            stage: ClaimStage::AltSetting,
            source: rusb::Error::Busy,
        };
        assert!(err.to_string().contains("select alternate setting"));
    }

    #[test]
    fn test_device_lost() {
        assert!(WriteFailure::Usb(rusb::Error::NoDevice).is_device_lost());
        assert!(WriteFailure::Released.is_device_lost());
        assert!(!WriteFailure::Usb(rusb::Error::Timeout).is_device_lost());
    }
}

//! SC-D70 bridge
//!
//! Forwards live MIDI from a host input port to a Roland SC-D70 through the
//! synthesizer's raw USB-MIDI bulk endpoint. The device is claimed directly,
//! initialized with a GS reset and master volume, then fed USB-MIDI packets
//! from a dedicated forwarding thread while a supervisor handles reconnection.

pub mod cli;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod input;
pub mod midi;
pub mod observer;
pub mod packet;
pub mod paths;
pub mod prefs;
pub mod session;
pub mod supervisor;
pub mod usb;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use error::{BridgeError, WriteFailure};
pub use observer::{ConnectionState, StatusObserver};
pub use supervisor::{Command, StatusReport, Supervisor};

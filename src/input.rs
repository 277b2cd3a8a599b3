//! MIDI input sources
//!
//! The forwarding loop consumes a polled `InputSource`. The midir-backed
//! source adapts midir's callback delivery into a bounded buffer that the
//! loop drains; when the buffer is full new events are dropped and counted.

use crossbeam::channel::{self, Receiver, TrySendError};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiInputPort};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::error::BridgeError;
use crate::midi::{format_hex, MidiMessage};

const CLIENT_NAME: &str = "SC-D70-Bridge";

/// One enumerable MIDI port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
}

/// Enumerates and opens input ports
pub trait InputProvider: Send + Sync {
    fn list(&self) -> Vec<InputInfo>;

    /// Open the port with the given id, buffering up to `buffer` events
    fn open(&self, id: &str, buffer: usize) -> Result<Box<dyn InputSource>, BridgeError>;
}

/// A polled stream of live MIDI events
pub trait InputSource: Send {
    fn name(&self) -> &str;

    /// Whether at least one event is pending
    fn poll(&mut self) -> bool;

    /// Take up to `max` pending events in arrival order
    fn read(&mut self, max: usize) -> Vec<MidiMessage>;

    fn close(&mut self);
}

/// Pick the input to use: the preferred id when still present, else the first input
pub fn choose_input<'a>(inputs: &'a [InputInfo], preferred: Option<&str>) -> Option<&'a InputInfo> {
    let candidates = || inputs.iter().filter(|info| info.is_input);
    preferred
        .and_then(|id| candidates().find(|info| info.id == id))
        .or_else(|| candidates().next())
}

/// midir-backed provider
#[derive(Debug, Default, Clone, Copy)]
pub struct MidirProvider;

impl MidirProvider {
    pub fn new() -> Self {
        Self
    }

    /// Find a port by exact id. Choosing a substitute is left to `choose_input`.
    fn find_port(midi_in: &MidiInput, id: &str) -> Option<(MidiInputPort, String)> {
        let port = port_with_id(midi_in.ports(), id, MidiInputPort::id)?;
        let name = midi_in.port_name(&port).unwrap_or_else(|_| id.to_string());
        debug!("Found port '{}' for id '{}'", name, id);
        Some((port, name))
    }
}

/// The port whose id equals `id`; ids are never matched partially
fn port_with_id<P>(ports: Vec<P>, id: &str, port_id: impl Fn(&P) -> String) -> Option<P> {
    ports.into_iter().find(|port| port_id(port) == id)
}

impl InputProvider for MidirProvider {
    fn list(&self) -> Vec<InputInfo> {
        let midi_in = match MidiInput::new(&format!("{CLIENT_NAME}-Scanner")) {
            Ok(midi_in) => midi_in,
            Err(e) => {
                warn!("Error getting MIDI inputs: {}", e);
                return Vec::new();
            },
        };

        midi_in
            .ports()
            .iter()
            .filter_map(|port| {
                let name = midi_in.port_name(port).ok()?;
                Some(InputInfo {
                    id: port.id(),
                    name,
                    is_input: true,
                })
            })
            .collect()
    }

    fn open(&self, id: &str, buffer: usize) -> Result<Box<dyn InputSource>, BridgeError> {
        let open_failure = |reason: String| BridgeError::InputOpenFailure {
            id: id.to_string(),
            reason,
        };

        let mut midi_in = MidiInput::new(&format!("{CLIENT_NAME}-Input"))
            .map_err(|e| open_failure(e.to_string()))?;
        // SysEx from the controller is not forwarded; clock and active
        // sensing are dropped by the forwarding loop's filter.
        midi_in.ignore(Ignore::Sysex);

        let (port, name) =
            Self::find_port(&midi_in, id).ok_or_else(|| open_failure("port not found".into()))?;

        let (tx, rx) = channel::bounded(buffer);
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_cb = Arc::clone(&dropped);

        let connection = midi_in
            .connect(
                &port,
                CLIENT_NAME,
                move |_timestamp, data, _| {
                    let Some(msg) = MidiMessage::from_bytes(data) else {
                        return;
                    };
                    trace!("MIDI RX {}", format_hex(data));
                    if let Err(TrySendError::Full(_)) = tx.try_send(msg) {
                        dropped_cb.fetch_add(1, Ordering::Relaxed);
                    }
                },
                (),
            )
            .map_err(|e| open_failure(e.to_string()))?;

        info!("MIDI input opened: '{}' (buffer {} events)", name, buffer);
        Ok(Box::new(MidirSource {
            name,
            connection: Some(connection),
            rx,
            dropped,
        }))
    }
}

/// Events from one midir input connection
pub struct MidirSource {
    name: String,
    connection: Option<MidiInputConnection<()>>,
    rx: Receiver<MidiMessage>,
    dropped: Arc<AtomicU64>,
}

impl MidirSource {
    /// Events discarded because the buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl InputSource for MidirSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self) -> bool {
        !self.rx.is_empty()
    }

    fn read(&mut self, max: usize) -> Vec<MidiMessage> {
        self.rx.try_iter().take(max).collect()
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            let dropped = self.dropped();
            if dropped > 0 {
                warn!("MIDI input '{}' dropped {} events on overflow", self.name, dropped);
            }
            debug!("MIDI input closed: '{}'", self.name);
        }
    }
}

impl Drop for MidirSource {
    fn drop(&mut self) {
        self.close();
    }
}

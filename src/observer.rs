//! Status reporting
//!
//! The supervisor and the forwarding loop report connection state changes and
//! heartbeats to a `StatusObserver`. Front ends render these; the core never
//! depends on how.

use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Connection lifecycle of the device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Claiming,
    Initializing,
    Running,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Claiming => "Claiming",
            ConnectionState::Initializing => "Initializing",
            ConnectionState::Running => "Running",
            ConnectionState::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Receiver of status reports; called from both control and loop threads
pub trait StatusObserver: Send + Sync {
    fn on_state_changed(&self, state: ConnectionState, detail: &str);

    /// Events successfully forwarded during the last heartbeat interval
    fn on_heartbeat(&self, event_count: u64);
}

/// Logs every report through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StatusObserver for TracingObserver {
    fn on_state_changed(&self, state: ConnectionState, detail: &str) {
        match state {
            ConnectionState::Error => warn!("Status: {} ({})", state, detail),
            _ if detail.is_empty() => info!("Status: {}", state),
            _ => info!("Status: {} ({})", state, detail),
        }
    }

    fn on_heartbeat(&self, event_count: u64) {
        info!(
            "Bridge heartbeat: processed {} MIDI events in last interval",
            event_count
        );
    }
}

/// Status report forwarded to a front end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    StateChanged {
        state: ConnectionState,
        detail: String,
    },
    Heartbeat {
        event_count: u64,
    },
}

/// Forwards reports over a channel to the control context
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusObserver for ChannelObserver {
    fn on_state_changed(&self, state: ConnectionState, detail: &str) {
        // Receiver gone means the front end is shutting down
        let _ = self.tx.send(StatusEvent::StateChanged {
            state,
            detail: detail.to_string(),
        });
    }

    fn on_heartbeat(&self, event_count: u64) {
        let _ = self.tx.send(StatusEvent::Heartbeat { event_count });
    }
}

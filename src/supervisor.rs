//! Session supervisor
//!
//! Drives one connection attempt at a time through
//! Connecting -> Claiming -> Initializing -> Running, tears it down on stop or
//! failure, and retries with linear backoff while the user wants the bridge up.
//! All methods run on the control context; the forwarding loop is the only
//! other thread and talks back through the observer and `LoopHandle`.

use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{BridgeError, WriteFailure};
use crate::forwarder::{ForwarderSettings, ForwardingLoop, LoopHandle, StatsSnapshot};
use crate::input::{choose_input, InputInfo, InputProvider, InputSource};
use crate::observer::{ConnectionState, StatusObserver};
use crate::packet::{SysExPayload, UsbMidiPacket};
use crate::prefs::PreferenceStore;
use crate::session::DeviceSession;
use crate::usb::UsbBackend;

/// Requests from a front end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Reconnect,
    SelectInput(String),
}

/// Snapshot for status displays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: ConnectionState,
    pub detail: String,
    pub input: Option<InputInfo>,
    pub stats: Option<StatsSnapshot>,
    pub retry_attempt: u32,
}

#[derive(Debug, Default)]
struct RetryState {
    attempt: u32,
    next_at: Option<Instant>,
}

pub struct Supervisor {
    config: AppConfig,
    backend: Arc<dyn UsbBackend>,
    inputs: Arc<dyn InputProvider>,
    observer: Arc<dyn StatusObserver>,
    prefs: Box<dyn PreferenceStore>,
    state: ConnectionState,
    detail: String,
    session: Option<Arc<DeviceSession>>,
    forwarding: Option<LoopHandle>,
    selected_input: Option<String>,
    active_input: Option<InputInfo>,
    /// Set by start/reconnect, cleared by stop; gates automatic retries
    wants_running: bool,
    retry: RetryState,
}

impl Supervisor {
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn UsbBackend>,
        inputs: Arc<dyn InputProvider>,
        observer: Arc<dyn StatusObserver>,
        prefs: Box<dyn PreferenceStore>,
    ) -> Self {
        let selected_input = prefs.load().selected_input;
        if let Some(id) = &selected_input {
            debug!("Saved MIDI input: {}", id);
        }
        Self {
            config,
            backend,
            inputs,
            observer,
            prefs,
            state: ConnectionState::Disconnected,
            detail: String::new(),
            session: None,
            forwarding: None,
            selected_input,
            active_input: None,
            wants_running: false,
            retry: RetryState::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn selected_input(&self) -> Option<&str> {
        self.selected_input.as_deref()
    }

    pub fn active_input(&self) -> Option<&InputInfo> {
        self.active_input.as_ref()
    }

    pub fn list_inputs(&self) -> Vec<InputInfo> {
        self.inputs.list()
    }

    /// Counters of the running loop, if any
    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.forwarding.as_ref().map(LoopHandle::stats)
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.state,
            detail: self.detail.clone(),
            input: self.active_input.clone(),
            stats: self.stats(),
            retry_attempt: self.retry.attempt,
        }
    }

    pub fn handle(&mut self, command: Command) -> Result<(), BridgeError> {
        debug!("Command: {:?}", command);
        match command {
            Command::Start => self.start(),
            Command::Stop => {
                self.stop();
                Ok(())
            },
            Command::Reconnect => self.reconnect(),
            Command::SelectInput(id) => self.select_input(&id),
        }
    }

    /// Bring the bridge up. A no-op when already running.
    pub fn start(&mut self) -> Result<(), BridgeError> {
        self.wants_running = true;
        // A loop that already died is not running, even before the next tick
        self.check_loop();
        if self.state == ConnectionState::Running {
            debug!("Bridge already running");
            return Ok(());
        }
        self.teardown();
        self.retry = RetryState::default();
        self.connect()
    }

    /// Stop forwarding and release the device. Safe to call in any state.
    pub fn stop(&mut self) {
        self.wants_running = false;
        self.retry = RetryState::default();
        self.teardown();
        self.set_state(ConnectionState::Disconnected, "stopped");
    }

    /// Full stop, settle delay, then start
    pub fn reconnect(&mut self) -> Result<(), BridgeError> {
        info!("Reconnecting");
        self.teardown();
        self.set_state(ConnectionState::Disconnected, "reconnecting");
        thread::sleep(self.config.timing.reconnect_delay());
        self.wants_running = true;
        self.retry = RetryState::default();
        self.connect()
    }

    /// Persist a new input choice and reconnect with it
    pub fn select_input(&mut self, id: &str) -> Result<(), BridgeError> {
        let Some(info) = self.inputs.list().into_iter().find(|info| info.id == id) else {
            return Err(BridgeError::InputOpenFailure {
                id: id.to_string(),
                reason: "no such input".to_string(),
            });
        };

        info!("Selected MIDI input: {} ({})", info.name, info.id);
        self.selected_input = Some(info.id);
        let mut prefs = self.prefs.load();
        prefs.selected_input = self.selected_input.clone();
        if let Err(e) = self.prefs.save(&prefs) {
            warn!("Failed to save input selection: {:#}", e);
        }
        self.reconnect()
    }

    /// Periodic housekeeping: surface loop faults and run scheduled retries
    pub fn tick(&mut self) {
        self.check_loop();

        if !self.wants_running || !self.config.supervisor.auto_reconnect {
            return;
        }
        if !matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Error
        ) {
            return;
        }

        match self.retry.next_at {
            Some(at) if Instant::now() >= at => {
                self.retry.next_at = None;
                self.retry.attempt += 1;
                info!("Reconnect attempt #{}", self.retry.attempt);
                self.teardown();
                // Failure already reported and rescheduled
                let _ = self.connect();
            },
            Some(_) => {},
            None => self.schedule_retry(),
        }
    }

    /// Stop and release everything; used on shutdown
    pub fn shutdown(&mut self) {
        if self.session.is_some() || self.forwarding.is_some() {
            self.stop();
        }
    }

    fn check_loop(&mut self) {
        if self.state != ConnectionState::Running {
            return;
        }
        let fault = self
            .forwarding
            .as_mut()
            .and_then(LoopHandle::exit)
            .filter(|exit| exit.is_fault())
            .cloned();
        if let Some(exit) = fault {
            warn!("Bridge loop failed: {}", exit);
            self.enter_error(&format!("forwarding stopped: {}", exit));
        }
    }

    fn connect(&mut self) -> Result<(), BridgeError> {
        match self.try_connect() {
            Ok(()) => {
                self.retry = RetryState::default();
                Ok(())
            },
            Err(e) => {
                let detail = format!("{}: {}", e.label(), e);
                match e {
                    BridgeError::DeviceNotFound { .. } => {
                        self.teardown();
                        self.set_state(ConnectionState::Disconnected, &detail);
                    },
                    _ => self.enter_error(&detail),
                }
                self.schedule_retry();
                Err(e)
            },
        }
    }

    fn try_connect(&mut self) -> Result<(), BridgeError> {
        self.set_state(ConnectionState::Connecting, "");
        let session = Arc::new(DeviceSession::open(
            self.backend.as_ref(),
            &self.config.device,
        )?);
        self.session = Some(Arc::clone(&session));

        self.set_state(ConnectionState::Claiming, "");
        session.claim()?;

        self.set_state(ConnectionState::Initializing, "");
        self.initialize(&session)?;

        let input = self.open_input()?;
        let input_name = input.name().to_string();
        let settings = ForwarderSettings::from(&self.config);
        let handle = ForwardingLoop::new(input, session, Arc::clone(&self.observer), settings)
            .spawn()?;
        self.forwarding = Some(handle);

        self.set_state(ConnectionState::Running, &input_name);
        Ok(())
    }

    /// GS reset, settle, master volume
    fn initialize(&self, session: &DeviceSession) -> Result<(), BridgeError> {
        let timeout = self.config.timing.init_write_timeout();
        let send = |command: &'static str, payload: SysExPayload| {
            let packets: Vec<UsbMidiPacket> = payload.packets().collect();
            session
                .write_packets(&packets, timeout)
                .map_err(|source: WriteFailure| BridgeError::InitFailure { command, source })?;
            debug!("Sent {} ({} packets)", command, packets.len());
            Ok::<(), BridgeError>(())
        };

        send("GS reset", SysExPayload::gs_reset())?;
        thread::sleep(self.config.timing.init_settle());
        send("master volume", SysExPayload::master_volume())?;
        info!("Synthesizer initialized");
        Ok(())
    }

    fn open_input(&mut self) -> Result<Box<dyn InputSource>, BridgeError> {
        let inputs = self.inputs.list();
        let preferred = self.selected_input.as_deref();
        let chosen = choose_input(&inputs, preferred)
            .cloned()
            .ok_or_else(|| BridgeError::InputOpenFailure {
                id: preferred.unwrap_or("<none>").to_string(),
                reason: "no MIDI inputs available".to_string(),
            })?;

        if let Some(id) = preferred.filter(|id| *id != chosen.id) {
            warn!(
                "MIDI input '{}' not available, using '{}' instead",
                id, chosen.name
            );
        }

        let source = self
            .inputs
            .open(&chosen.id, self.config.forwarding.input_buffer)?;
        self.active_input = Some(chosen);
        Ok(source)
    }

    fn enter_error(&mut self, detail: &str) {
        self.teardown();
        self.set_state(ConnectionState::Error, detail);
    }

    /// Stop the loop (bounded) and release the device
    fn teardown(&mut self) {
        if let Some(handle) = self.forwarding.take() {
            match handle.stop(self.config.timing.stop_join_timeout()) {
                Some(exit) => debug!("Bridge loop ended: {}", exit),
                None => warn!("Bridge loop abandoned"),
            }
        }
        if let Some(session) = self.session.take() {
            session.release();
        }
        self.active_input = None;
    }

    fn schedule_retry(&mut self) {
        if !self.wants_running || !self.config.supervisor.auto_reconnect {
            return;
        }
        let delay = self.config.supervisor.retry_delay(self.retry.attempt + 1);
        debug!("Next reconnect attempt in {:?}", delay);
        self.retry.next_at = Some(Instant::now() + delay);
    }

    fn set_state(&mut self, state: ConnectionState, detail: &str) {
        if self.state != state {
            debug!("State {} -> {}", self.state, state);
        }
        self.state = state;
        self.detail = detail.to_string();
        self.observer.on_state_changed(state, detail);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.teardown();
    }
}

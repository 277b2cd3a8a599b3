//! Test doubles for the USB and MIDI input seams

use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::BridgeError;
use crate::input::{InputInfo, InputProvider, InputSource};
use crate::midi::MidiMessage;
use crate::observer::{ConnectionState, StatusObserver};
use crate::usb::{UsbBackend, UsbDevice};

/// Observable state shared by every handle a `MockBackend` hands out
#[derive(Debug, Default)]
pub struct MockUsbState {
    pub interfaces: u8,
    pub kernel_drivers: Vec<u8>,
    pub detach_fails: Vec<u8>,
    pub detached: Vec<u8>,
    pub reattached: Vec<u8>,
    pub configured: bool,
    pub claimed: Vec<u8>,
    pub alt_setting: Option<(u8, u8)>,
    pub fail_configuration: Option<rusb::Error>,
    pub fail_alt_setting: Option<rusb::Error>,
    /// Consumed one per write, before `fail_all_writes`
    pub write_errors: VecDeque<rusb::Error>,
    pub fail_all_writes: Option<rusb::Error>,
    pub short_write: Option<usize>,
    pub writes: Vec<(u8, Vec<u8>, Duration)>,
    pub opens: usize,
    pub open_handles: usize,
    pub max_open_handles: usize,
}

#[derive(Debug, Clone)]
pub struct MockUsb(Arc<Mutex<MockUsbState>>);

impl MockUsb {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(MockUsbState {
            interfaces: 3,
            ..Default::default()
        })))
    }

    pub fn state(&self) -> MutexGuard<'_, MockUsbState> {
        self.0.lock()
    }

    /// Wire bytes of every write, concatenated
    pub fn written_bytes(&self) -> Vec<u8> {
        self.state()
            .writes
            .iter()
            .flat_map(|(_, bytes, _)| bytes.iter().copied())
            .collect()
    }
}

pub struct MockBackend {
    usb: MockUsb,
    present: AtomicBool,
}

impl MockBackend {
    pub fn present(usb: MockUsb) -> Self {
        Self {
            usb,
            present: AtomicBool::new(true),
        }
    }

    pub fn absent() -> Self {
        Self {
            usb: MockUsb::new(),
            present: AtomicBool::new(false),
        }
    }

    /// Plug or unplug the device
    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }

    pub fn usb(&self) -> &MockUsb {
        &self.usb
    }
}

impl UsbBackend for MockBackend {
    fn open(&self, _vendor_id: u16, _product_id: u16) -> rusb::Result<Option<Box<dyn UsbDevice>>> {
        if !self.present.load(Ordering::SeqCst) {
            return Ok(None);
        }
        {
            let mut state = self.usb.state();
            state.opens += 1;
            state.open_handles += 1;
            state.max_open_handles = state.max_open_handles.max(state.open_handles);
        }
        Ok(Some(Box::new(MockDevice {
            usb: self.usb.clone(),
        })))
    }
}

struct MockDevice {
    usb: MockUsb,
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.usb.state().open_handles -= 1;
    }
}

impl UsbDevice for MockDevice {
    fn interface_count(&self) -> rusb::Result<u8> {
        Ok(self.usb.state().interfaces)
    }

    fn kernel_driver_active(&self, iface: u8) -> rusb::Result<bool> {
        Ok(self.usb.state().kernel_drivers.contains(&iface))
    }

    fn detach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()> {
        let mut state = self.usb.state();
        if state.detach_fails.contains(&iface) {
            return Err(rusb::Error::NotSupported);
        }
        state.kernel_drivers.retain(|&i| i != iface);
        state.detached.push(iface);
        Ok(())
    }

    fn attach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()> {
        let mut state = self.usb.state();
        state.kernel_drivers.push(iface);
        state.reattached.push(iface);
        Ok(())
    }

    fn set_configuration(&mut self) -> rusb::Result<()> {
        let mut state = self.usb.state();
        if let Some(e) = state.fail_configuration {
            return Err(e);
        }
        state.configured = true;
        Ok(())
    }

    fn claim_interface(&mut self, iface: u8) -> rusb::Result<()> {
        let mut state = self.usb.state();
        if state.claimed.contains(&iface) {
            return Err(rusb::Error::Busy);
        }
        state.claimed.push(iface);
        Ok(())
    }

    fn release_interface(&mut self, iface: u8) -> rusb::Result<()> {
        self.usb.state().claimed.retain(|&i| i != iface);
        Ok(())
    }

    fn set_alternate_setting(&mut self, iface: u8, alt: u8) -> rusb::Result<()> {
        let mut state = self.usb.state();
        if let Some(e) = state.fail_alt_setting {
            return Err(e);
        }
        state.alt_setting = Some((iface, alt));
        Ok(())
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        let mut state = self.usb.state();
        if let Some(e) = state.write_errors.pop_front() {
            return Err(e);
        }
        if let Some(e) = state.fail_all_writes {
            return Err(e);
        }
        state.writes.push((endpoint, data.to_vec(), timeout));
        Ok(state.short_write.unwrap_or(data.len()))
    }
}

/// Events queued by a test, drained by the forwarding loop
#[derive(Debug, Clone, Default)]
pub struct ScriptedInput {
    pending: Arc<Mutex<VecDeque<MidiMessage>>>,
    closed: Arc<AtomicBool>,
    read_delay: Arc<Mutex<Duration>>,
    reading: Arc<AtomicBool>,
}

impl ScriptedInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, events: impl IntoIterator<Item = MidiMessage>) {
        self.pending.lock().extend(events);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_drained(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Make every `read` block for `delay` before returning
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    /// Whether a reader is currently inside `read`
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }
}

impl InputSource for ScriptedInput {
    fn name(&self) -> &str {
        "scripted"
    }

    fn poll(&mut self) -> bool {
        !self.pending.lock().is_empty()
    }

    fn read(&mut self, max: usize) -> Vec<MidiMessage> {
        self.reading.store(true, Ordering::SeqCst);
        let delay = *self.read_delay.lock();
        std::thread::sleep(delay);
        self.reading.store(false, Ordering::SeqCst);
        let mut pending = self.pending.lock();
        let n = max.min(pending.len());
        pending.drain(..n).collect()
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Provider exposing a fixed port list; every opened port shares one `ScriptedInput`
pub struct MockInputs {
    pub ports: Mutex<Vec<InputInfo>>,
    pub input: ScriptedInput,
    pub fail_open: AtomicBool,
    pub opened: Mutex<Vec<String>>,
}

impl MockInputs {
    pub fn new(ids: &[&str]) -> Self {
        Self {
            ports: Mutex::new(
                ids.iter()
                    .map(|id| InputInfo {
                        id: id.to_string(),
                        name: format!("Keyboard {id}"),
                        is_input: true,
                    })
                    .collect(),
            ),
            input: ScriptedInput::new(),
            fail_open: AtomicBool::new(false),
            opened: Mutex::new(Vec::new()),
        }
    }
}

impl InputProvider for MockInputs {
    fn list(&self) -> Vec<InputInfo> {
        self.ports.lock().clone()
    }

    fn open(&self, id: &str, _buffer: usize) -> Result<Box<dyn InputSource>, BridgeError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(BridgeError::InputOpenFailure {
                id: id.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        self.opened.lock().push(id.to_string());
        Ok(Box::new(self.input.clone()))
    }
}

/// Records every report it receives
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub states: Mutex<Vec<(ConnectionState, String)>>,
    pub heartbeats: Mutex<Vec<u64>>,
}

impl RecordingObserver {
    pub fn states(&self) -> Vec<ConnectionState> {
        self.states.lock().iter().map(|(s, _)| *s).collect()
    }

    pub fn last_detail(&self) -> Option<String> {
        self.states.lock().last().map(|(_, d)| d.clone())
    }
}

impl StatusObserver for RecordingObserver {
    fn on_state_changed(&self, state: ConnectionState, detail: &str) {
        self.states.lock().push((state, detail.to_string()));
    }

    fn on_heartbeat(&self, event_count: u64) {
        self.heartbeats.lock().push(event_count);
    }
}

/// Spin until `cond` holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

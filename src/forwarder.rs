//! Forwarding loop: input port -> USB-MIDI packets -> device
//!
//! Runs on a dedicated OS thread. Each iteration drains everything the input
//! has pending, drops real-time bytes, encodes the rest and writes the batch
//! in one bulk transfer. A failed write drops that batch only; the loop keeps
//! going unless the device is gone or failures persist.

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::AppConfig;
use crate::error::WriteFailure;
use crate::input::InputSource;
use crate::midi::MidiMessage;
use crate::observer::StatusObserver;
use crate::packet::{encode_live_event, UsbMidiPacket};
use crate::session::DeviceSession;

/// Cooperative stop signal checked at the top of every iteration
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters written by the loop, read by the control context
#[derive(Debug, Default)]
pub struct LoopStats {
    forwarded: AtomicU64,
    filtered: AtomicU64,
    batches: AtomicU64,
    write_failures: AtomicU64,
    consecutive_failures: AtomicU32,
    interval_events: AtomicU64,
}

/// Point-in-time copy of [`LoopStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub forwarded: u64,
    pub filtered: u64,
    pub batches: u64,
    pub write_failures: u64,
    pub consecutive_failures: u32,
}

impl LoopStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    fn record_success(&self, events: u64) {
        self.forwarded.fetch_add(events, Ordering::Relaxed);
        self.interval_events.fetch_add(events, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Returns the length of the current failure streak
    fn record_failure(&self) -> u32 {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn take_interval(&self) -> u64 {
        self.interval_events.swap(0, Ordering::Relaxed)
    }
}

/// Why the loop returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Cancellation was requested
    Stopped,
    /// The device went away underneath the session
    DeviceLost(WriteFailure),
    /// Write failures hit the configured streak limit
    TooManyFailures(u32),
}

impl LoopExit {
    /// Whether the supervisor should treat the exit as a session error
    pub fn is_fault(&self) -> bool {
        !matches!(self, LoopExit::Stopped)
    }
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopExit::Stopped => write!(f, "stopped"),
            LoopExit::DeviceLost(e) => write!(f, "device lost: {}", e),
            LoopExit::TooManyFailures(n) => write!(f, "{} consecutive write failures", n),
        }
    }
}

/// Tunables of one loop instance
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub read_chunk: usize,
    pub max_batch_events: usize,
    pub write_timeout: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// 0 disables escalation
    pub max_consecutive_write_failures: u32,
}

impl From<&AppConfig> for ForwarderSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            read_chunk: config.forwarding.read_chunk,
            max_batch_events: config.forwarding.max_batch_events,
            write_timeout: config.timing.forward_write_timeout(),
            poll_interval: config.timing.poll_interval(),
            heartbeat_interval: config.timing.heartbeat_interval(),
            max_consecutive_write_failures: config.forwarding.max_consecutive_write_failures,
        }
    }
}

/// Drop real-time bytes and encode the rest, preserving order.
///
/// Returns the packets and the number of events filtered out.
pub fn encode_batch(events: &[MidiMessage]) -> (Vec<UsbMidiPacket>, usize) {
    let packets: Vec<_> = events
        .iter()
        .filter(|msg| msg.is_forwardable())
        .map(encode_live_event)
        .collect();
    let filtered = events.len() - packets.len();
    (packets, filtered)
}

pub struct ForwardingLoop {
    input: Box<dyn InputSource>,
    session: Arc<DeviceSession>,
    observer: Arc<dyn StatusObserver>,
    stats: Arc<LoopStats>,
    token: CancellationToken,
    settings: ForwarderSettings,
}

impl ForwardingLoop {
    pub fn new(
        input: Box<dyn InputSource>,
        session: Arc<DeviceSession>,
        observer: Arc<dyn StatusObserver>,
        settings: ForwarderSettings,
    ) -> Self {
        Self {
            input,
            session,
            observer,
            stats: Arc::new(LoopStats::default()),
            token: CancellationToken::new(),
            settings,
        }
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        Arc::clone(&self.stats)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run the loop on a new thread
    pub fn spawn(self) -> std::io::Result<LoopHandle> {
        let token = self.token();
        let stats = self.stats();
        let (exit_tx, exit_rx) = channel::bounded(1);

        let join = thread::Builder::new()
            .name("midi-forward".to_string())
            .spawn(move || {
                let exit = self.run();
                // Nobody listening means the loop was abandoned after a stop timeout
                let _ = exit_tx.send(exit);
            })?;

        Ok(LoopHandle {
            token,
            stats,
            join: Some(join),
            exit_rx,
            exit: None,
        })
    }

    /// Run the loop on the current thread until cancelled or faulted
    pub fn run(mut self) -> LoopExit {
        info!("Bridge loop entered (input: {})", self.input.name());
        let mut last_heartbeat = Instant::now();

        let exit = loop {
            if self.token.is_cancelled() {
                break LoopExit::Stopped;
            }

            let pending = self.input.poll();
            if pending {
                let events = self.drain();
                if let Err(exit) = self.forward(&events) {
                    break exit;
                }
            }

            if last_heartbeat.elapsed() >= self.settings.heartbeat_interval {
                self.observer.on_heartbeat(self.stats.take_interval());
                last_heartbeat = Instant::now();
            }

            if !pending {
                thread::sleep(self.settings.poll_interval);
            }
        };

        self.input.close();
        info!("Bridge loop exited: {}", exit);
        exit
    }

    /// Collect everything currently pending, up to the batch limit
    fn drain(&mut self) -> Vec<MidiMessage> {
        let limit = self.settings.max_batch_events;
        let mut batch = Vec::new();
        while batch.len() < limit && self.input.poll() {
            let want = self.settings.read_chunk.min(limit - batch.len());
            let events = self.input.read(want);
            if events.is_empty() {
                break;
            }
            batch.extend(events);
        }
        batch
    }

    fn forward(&mut self, events: &[MidiMessage]) -> Result<(), LoopExit> {
        let (packets, filtered) = encode_batch(events);
        if filtered > 0 {
            self.stats.filtered.fetch_add(filtered as u64, Ordering::Relaxed);
            trace!("Filtered {} real-time events", filtered);
        }
        if packets.is_empty() {
            return Ok(());
        }

        match self
            .session
            .write_packets(&packets, self.settings.write_timeout)
        {
            Ok(()) => {
                trace!("Forwarded {} events", packets.len());
                self.stats.record_success(packets.len() as u64);
                Ok(())
            },
            Err(failure) => {
                let streak = self.stats.record_failure();
                if streak == 1 || streak % 100 == 0 {
                    warn!(
                        "USB write error, dropped {} events (streak {}): {}",
                        packets.len(),
                        streak,
                        failure
                    );
                }

                if failure.is_device_lost() {
                    return Err(LoopExit::DeviceLost(failure));
                }
                let limit = self.settings.max_consecutive_write_failures;
                if limit > 0 && streak >= limit {
                    return Err(LoopExit::TooManyFailures(streak));
                }
                Ok(())
            },
        }
    }
}

/// Control-side handle on a running loop thread
pub struct LoopHandle {
    token: CancellationToken,
    stats: Arc<LoopStats>,
    join: Option<JoinHandle<()>>,
    exit_rx: Receiver<LoopExit>,
    exit: Option<LoopExit>,
}

impl LoopHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The loop's exit reason, if it has already returned
    pub fn exit(&mut self) -> Option<&LoopExit> {
        if self.exit.is_none() {
            self.exit = self.exit_rx.try_recv().ok();
            if self.exit.is_some() {
                self.reap();
            }
        }
        self.exit.as_ref()
    }

    /// Signal the loop and wait up to `timeout` for it to return.
    ///
    /// On timeout the thread is abandoned; it exits at its next iteration check.
    pub fn stop(mut self, timeout: Duration) -> Option<LoopExit> {
        self.token.cancel();
        if self.exit.is_none() {
            match self.exit_rx.recv_timeout(timeout) {
                Ok(exit) => self.exit = Some(exit),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Bridge loop did not stop within {:?}, abandoning it", timeout);
                    return None;
                },
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Bridge loop thread ended without reporting");
                },
            }
        }
        self.reap();
        self.exit.take()
    }

    fn reap(&mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("Bridge loop thread panicked");
            } else {
                debug!("Bridge loop thread joined");
            }
        }
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

//! Device session: sole owner of the open SC-D70 handle
//!
//! Claiming detaches OS drivers, activates the configuration and selects the
//! MIDI interface's alternate setting. After claiming, the session is shared
//! behind an `Arc`: the forwarding loop only writes, the supervisor releases.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::DeviceConfig;
use crate::error::{BridgeError, ClaimStage, WriteFailure};
use crate::midi::format_hex;
use crate::packet::{to_wire, UsbMidiPacket};
use crate::usb::{UsbBackend, UsbDevice};

struct Claimed {
    device: Box<dyn UsbDevice>,
    detached: Vec<u8>,
    claimed_iface: Option<u8>,
}

/// Exclusive ownership of one claimed device
pub struct DeviceSession {
    config: DeviceConfig,
    inner: RwLock<Option<Claimed>>,
    bytes_written: AtomicUsize,
}

impl DeviceSession {
    /// Locate the device by its fixed identifiers
    pub fn open(backend: &dyn UsbBackend, config: &DeviceConfig) -> Result<Self, BridgeError> {
        debug!(
            "Looking for device {:04x}:{:04x}",
            config.vendor_id, config.product_id
        );
        let device = backend
            .open(config.vendor_id, config.product_id)?
            .ok_or(BridgeError::DeviceNotFound {
                vendor_id: config.vendor_id,
                product_id: config.product_id,
            })?;

        info!(
            "Device {:04x}:{:04x} opened",
            config.vendor_id, config.product_id
        );
        Ok(Self {
            config: config.clone(),
            inner: RwLock::new(Some(Claimed {
                device,
                detached: Vec::new(),
                claimed_iface: None,
            })),
            bytes_written: AtomicUsize::new(0),
        })
    }

    /// Take ownership of the MIDI interface
    ///
    /// Driver detachment is best-effort per interface; configuration, claim
    /// and alternate setting failures abort the attempt.
    pub fn claim(&self) -> Result<(), BridgeError> {
        let mut guard = self.inner.write();
        let claimed = guard.as_mut().ok_or(BridgeError::ClaimFailure {
            stage: ClaimStage::ClaimInterface,
            source: rusb::Error::NoDevice,
        })?;

        let count = claimed
            .device
            .interface_count()
            .map_err(|source| BridgeError::ClaimFailure {
                stage: ClaimStage::Enumerate,
                source,
            })?;

        for iface in 0..count {
            match claimed.device.kernel_driver_active(iface) {
                Ok(true) => match claimed.device.detach_kernel_driver(iface) {
                    Ok(()) => {
                        debug!("Detached kernel driver from interface {}", iface);
                        claimed.detached.push(iface);
                    },
                    Err(e) => debug!("Could not detach driver from interface {}: {}", iface, e),
                },
                Ok(false) => {},
                Err(e) => trace!("Kernel driver query unsupported on interface {}: {}", iface, e),
            }
        }

        claimed
            .device
            .set_configuration()
            .map_err(claim_error(ClaimStage::Configuration))?;

        let iface = self.config.midi_interface;
        claimed
            .device
            .claim_interface(iface)
            .map_err(claim_error(ClaimStage::ClaimInterface))?;
        claimed.claimed_iface = Some(iface);

        claimed
            .device
            .set_alternate_setting(iface, self.config.alt_setting)
            .map_err(claim_error(ClaimStage::AltSetting))?;

        info!(
            "Interface {} claimed (alt setting {})",
            iface, self.config.alt_setting
        );
        Ok(())
    }

    /// Bulk-write packets to the MIDI-out endpoint
    pub fn write_packets(
        &self,
        packets: &[UsbMidiPacket],
        timeout: Duration,
    ) -> Result<(), WriteFailure> {
        let wire = to_wire(packets);
        let guard = self.inner.read();
        let claimed = guard.as_ref().ok_or(WriteFailure::Released)?;

        trace!("USB TX {} bytes: {}", wire.len(), format_hex(&wire));
        let written = claimed
            .device
            .write_bulk(self.config.endpoint_out, &wire, timeout)
            .map_err(WriteFailure::Usb)?;
        self.bytes_written.fetch_add(written, Ordering::Relaxed);

        if written != wire.len() {
            return Err(WriteFailure::ShortWrite {
                written,
                expected: wire.len(),
            });
        }
        Ok(())
    }

    /// Release the interface and hand detached interfaces back to the OS.
    ///
    /// Idempotent; tolerates a partially claimed or already vanished device.
    pub fn release(&self) {
        let Some(mut claimed) = self.inner.write().take() else {
            trace!("Device session already released");
            return;
        };

        if let Some(iface) = claimed.claimed_iface.take() {
            if let Err(e) = claimed.device.release_interface(iface) {
                debug!("Release of interface {} failed: {}", iface, e);
            }
        }

        for iface in claimed.detached.drain(..) {
            if let Err(e) = claimed.device.attach_kernel_driver(iface) {
                debug!("Re-attach of kernel driver on interface {} failed: {}", iface, e);
            }
        }

        drop(claimed);
        info!("Device session released");
    }

    pub fn is_released(&self) -> bool {
        self.inner.read().is_none()
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

fn claim_error(stage: ClaimStage) -> impl FnOnce(rusb::Error) -> BridgeError {
    move |source| BridgeError::ClaimFailure { stage, source }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if !self.is_released() {
            warn!("Device session dropped without release, releasing now");
            self.release();
        }
    }
}

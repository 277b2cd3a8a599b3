//! USB access layer
//!
//! `UsbBackend` and `UsbDevice` are the seam between the device session and
//! libusb, so the session logic can run against a scripted device in tests.

use std::time::Duration;
use tracing::debug;

/// Opens devices by vendor/product id
pub trait UsbBackend: Send + Sync {
    /// `Ok(None)` when no matching device is attached
    fn open(&self, vendor_id: u16, product_id: u16) -> rusb::Result<Option<Box<dyn UsbDevice>>>;
}

/// An open device handle
///
/// Mutating operations take `&mut self`; bulk writes only need `&self` so
/// the forwarding loop can write while the session keeps ownership.
pub trait UsbDevice: Send + Sync {
    /// Number of interfaces exposed by the first configuration
    fn interface_count(&self) -> rusb::Result<u8>;

    fn kernel_driver_active(&self, iface: u8) -> rusb::Result<bool>;

    fn detach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()>;

    fn attach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()>;

    /// Activate the device's first configuration
    fn set_configuration(&mut self) -> rusb::Result<()>;

    fn claim_interface(&mut self, iface: u8) -> rusb::Result<()>;

    fn release_interface(&mut self, iface: u8) -> rusb::Result<()>;

    fn set_alternate_setting(&mut self, iface: u8, alt: u8) -> rusb::Result<()>;

    /// Returns the number of bytes written
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;
}

/// Summary of an attached device, for `--list-devices`
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// libusb-backed implementation using the global context
#[derive(Debug, Default, Clone, Copy)]
pub struct RusbBackend;

impl RusbBackend {
    pub fn new() -> Self {
        Self
    }

    /// List every attached USB device
    pub fn list_devices(&self) -> rusb::Result<Vec<DeviceSummary>> {
        let mut summaries = Vec::new();
        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    debug!("Skipping device without descriptor: {}", e);
                    continue;
                },
            };
            summaries.push(DeviceSummary {
                bus: device.bus_number(),
                address: device.address(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
            });
        }
        Ok(summaries)
    }
}

impl UsbBackend for RusbBackend {
    fn open(&self, vendor_id: u16, product_id: u16) -> rusb::Result<Option<Box<dyn UsbDevice>>> {
        Ok(rusb::open_device_with_vid_pid(vendor_id, product_id)
            .map(|handle| Box::new(RusbDevice { handle }) as Box<dyn UsbDevice>))
    }
}

struct RusbDevice {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
}

impl UsbDevice for RusbDevice {
    fn interface_count(&self) -> rusb::Result<u8> {
        let config = self.handle.device().config_descriptor(0)?;
        Ok(config.num_interfaces())
    }

    fn kernel_driver_active(&self, iface: u8) -> rusb::Result<bool> {
        self.handle.kernel_driver_active(iface)
    }

    fn detach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()> {
        self.handle.detach_kernel_driver(iface)
    }

    fn attach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()> {
        self.handle.attach_kernel_driver(iface)
    }

    fn set_configuration(&mut self) -> rusb::Result<()> {
        let number = self.handle.device().config_descriptor(0)?.number();
        self.handle.set_active_configuration(number)
    }

    fn claim_interface(&mut self, iface: u8) -> rusb::Result<()> {
        self.handle.claim_interface(iface)
    }

    fn release_interface(&mut self, iface: u8) -> rusb::Result<()> {
        self.handle.release_interface(iface)
    }

    fn set_alternate_setting(&mut self, iface: u8, alt: u8) -> rusb::Result<()> {
        self.handle.set_alternate_setting(iface, alt)
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, data, timeout)
    }
}

//! DLPC900-class DMD pattern projector.
//!
//! Split the way the wire stack layers: [`codec`] turns frames into the
//! firmware's compressed image format, [`protocol`] turns commands into
//! HID reports, and [`session`] sequences both over a [`Transport`].

pub mod codec;
pub mod protocol;
pub mod session;

pub use codec::{DMD_HEIGHT, DMD_WIDTH};
pub use session::{ProjectorConfig, ProjectorSession, SessionState};

use crate::error::Result;
use protocol::Report;

/// USB vendor ID of the DLPC900 controller.
pub const VENDOR_ID: u16 = 0x0451;
/// USB product ID of the DLPC900 controller.
pub const PRODUCT_ID: u16 = 0xC900;

#[cfg(feature = "usb")]
const ENDPOINT_OUT: u8 = 0x01;
#[cfg(feature = "usb")]
const ENDPOINT_IN: u8 = 0x81;

/// Raw report exchange with the controller.
///
/// The session owns one of these boxed; tests substitute an in-memory
/// double, hardware uses [`UsbTransport`].
pub trait Transport: Send {
    /// Send one 64-byte report to the device.
    fn write_report(&mut self, report: &Report) -> Result<()>;

    /// Receive one 64-byte report from the device, blocking until it
    /// arrives or the transport times out.
    fn read_report(&mut self) -> Result<Report>;
}

#[cfg(feature = "usb")]
mod usb {
    use std::time::Duration;

    use crate::error::{Error, Result};
    use crate::protocols::dlp6500::protocol::{Report, REPORT_LEN};

    use super::{Transport, ENDPOINT_IN, ENDPOINT_OUT, PRODUCT_ID, VENDOR_ID};

    // Image uploads push megabytes through 64-byte reports; the write
    // timeout has to cover a slow hub, reads are short status replies.
    const WRITE_TIMEOUT: Duration = Duration::from_secs(60);
    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    /// USB HID transport to a physical controller.
    pub struct UsbTransport {
        handle: rusb::DeviceHandle<rusb::GlobalContext>,
    }

    impl UsbTransport {
        /// Open the first controller found on the bus.
        pub fn open() -> Result<Self> {
            let handle = rusb::open_device_with_vid_pid(VENDOR_ID, PRODUCT_ID)
                .ok_or_else(|| {
                    Error::connection(format!(
                        "no USB device with VID {:04x} PID {:04x}",
                        VENDOR_ID, PRODUCT_ID
                    ))
                })?;
            Self::claim(handle)
        }

        /// Open the controller at a specific bus position.
        pub fn open_at(bus: u8, address: u8) -> Result<Self> {
            let devices = rusb::devices().map_err(usb_err)?;
            for device in devices.iter() {
                if device.bus_number() != bus || device.address() != address {
                    continue;
                }
                let desc = device.device_descriptor().map_err(usb_err)?;
                if desc.vendor_id() != VENDOR_ID || desc.product_id() != PRODUCT_ID {
                    return Err(Error::connection(format!(
                        "device at bus {} address {} is {:04x}:{:04x}, not a DLPC900",
                        bus,
                        address,
                        desc.vendor_id(),
                        desc.product_id()
                    )));
                }
                let handle = device.open().map_err(usb_err)?;
                return Self::claim(handle);
            }
            Err(Error::connection(format!(
                "no USB device at bus {} address {}",
                bus, address
            )))
        }

        fn claim(mut handle: rusb::DeviceHandle<rusb::GlobalContext>) -> Result<Self> {
            if handle.kernel_driver_active(0).unwrap_or(false) {
                handle.detach_kernel_driver(0).map_err(usb_err)?;
            }
            handle.claim_interface(0).map_err(usb_err)?;
            Ok(UsbTransport { handle })
        }
    }

    impl Transport for UsbTransport {
        fn write_report(&mut self, report: &Report) -> Result<()> {
            let n = self
                .handle
                .write_interrupt(ENDPOINT_OUT, report, WRITE_TIMEOUT)
                .map_err(usb_err)?;
            if n != REPORT_LEN {
                return Err(Error::io(format!(
                    "short USB write: {} of {} bytes",
                    n, REPORT_LEN
                )));
            }
            Ok(())
        }

        fn read_report(&mut self) -> Result<Report> {
            let mut buf: Report = [0; REPORT_LEN];
            self.handle
                .read_interrupt(ENDPOINT_IN, &mut buf, READ_TIMEOUT)
                .map_err(usb_err)?;
            Ok(buf)
        }
    }

    fn usb_err(err: rusb::Error) -> Error {
        match err {
            rusb::Error::NoDevice | rusb::Error::NotFound | rusb::Error::Access => {
                Error::connection(err.to_string())
            }
            other => Error::io(other.to_string()),
        }
    }
}

#[cfg(feature = "usb")]
pub use usb::UsbTransport;

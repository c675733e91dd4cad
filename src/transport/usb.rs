//! CBA4 over libusb.
//!
//! The instrument enumerates as a vendor-specific device with one bulk OUT and
//! one bulk IN endpoint. Every transfer is a single packet of at most 64 bytes.

use rusb::{Context, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Transport;
use crate::error::TransportError;

/// West Mountain Radio vendor ID.
pub const VENDOR_ID: u16 = 0x2405;
/// CBA4 product ID.
pub const PRODUCT_ID: u16 = 0x0005;

const INTERFACE: u8 = 0;
const ENDPOINT_OUT: u8 = 0x01;
const ENDPOINT_IN: u8 = 0x81;
const PACKET_SIZE: usize = 64;
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// An attached CBA4, as seen on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// USB bus number.
    pub bus: u8,
    /// Address on the bus.
    pub address: u8,
}

fn map_usb_error(err: rusb::Error, timeout: Duration) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        rusb::Error::NoDevice => TransportError::DeviceDisconnected,
        other => TransportError::TransferError(other.to_string()),
    }
}

fn is_cba4(device: &rusb::Device<Context>) -> bool {
    device
        .device_descriptor()
        .map(|d| d.vendor_id() == VENDOR_ID && d.product_id() == PRODUCT_ID)
        .unwrap_or(false)
}

fn attached() -> Result<Vec<rusb::Device<Context>>, TransportError> {
    let context = Context::new().map_err(|e| TransportError::OpenFailed(e.to_string()))?;
    let devices = context
        .devices()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
    Ok(devices.iter().filter(is_cba4).collect())
}

/// List attached CBA4 instruments in enumeration order.
///
/// The position in this list is the index accepted by [`UsbTransport::open_index`].
pub fn scan() -> Result<Vec<DeviceInfo>, TransportError> {
    let found: Vec<DeviceInfo> = attached()?
        .iter()
        .map(|device| DeviceInfo {
            bus: device.bus_number(),
            address: device.address(),
        })
        .collect();
    debug!(count = found.len(), "scanned for CBA4 devices");
    Ok(found)
}

/// Open bulk channel to one CBA4.
pub struct UsbTransport {
    handle: Option<DeviceHandle<Context>>,
    label: String,
}

impl std::fmt::Debug for UsbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbTransport")
            .field("label", &self.label)
            .field("open", &self.handle.is_some())
            .finish()
    }
}

impl UsbTransport {
    /// Open the `index`-th attached CBA4 (0 for the first one).
    pub fn open_index(index: usize) -> Result<Self, TransportError> {
        let device = attached()?
            .into_iter()
            .nth(index)
            .ok_or_else(|| TransportError::DeviceNotFound(format!("no device at index {index}")))?;
        Self::claim(device)
    }

    fn claim(device: rusb::Device<Context>) -> Result<Self, TransportError> {
        let label = format!("CBA4 at bus {} address {}", device.bus_number(), device.address());
        let mut handle = device
            .open()
            .map_err(|e| TransportError::OpenFailed(format!("{label}: {e}")))?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            // Not supported on every platform
            debug!(error = %e, "kernel driver auto-detach unavailable");
        }
        handle
            .claim_interface(INTERFACE)
            .map_err(|e| TransportError::OpenFailed(format!("{label}: claim interface: {e}")))?;
        info!(device = %label, "claimed USB interface");
        Ok(Self {
            handle: Some(handle),
            label,
        })
    }

    fn handle(&self) -> Result<&DeviceHandle<Context>, TransportError> {
        self.handle.as_ref().ok_or(TransportError::DeviceDisconnected)
    }
}

impl Transport for UsbTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > PACKET_SIZE {
            return Err(TransportError::TransferError(format!(
                "{} byte frame exceeds {} byte packet",
                frame.len(),
                PACKET_SIZE
            )));
        }
        let written = self
            .handle()?
            .write_bulk(ENDPOINT_OUT, frame, WRITE_TIMEOUT)
            .map_err(|e| map_usb_error(e, WRITE_TIMEOUT))?;
        if written != frame.len() {
            return Err(TransportError::TransferError(format!(
                "short write: {} of {} bytes",
                written,
                frame.len()
            )));
        }
        Ok(())
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        // Reads must cover a whole packet or libusb reports an overflow
        let mut buf = vec![0u8; max_len.max(PACKET_SIZE)];
        let read = self
            .handle()?
            .read_bulk(ENDPOINT_IN, &mut buf, timeout)
            .map_err(|e| map_usb_error(e, timeout))?;
        buf.truncate(read.min(max_len));
        Ok(buf)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.release_interface(INTERFACE) {
                warn!(device = %self.label, error = %e, "failed to release USB interface");
            }
            info!(device = %self.label, "released USB interface");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_libusb_errors() {
        let timeout = Duration::from_millis(250);
        assert_eq!(
            map_usb_error(rusb::Error::Timeout, timeout),
            TransportError::Timeout { timeout_ms: 250 }
        );
        assert_eq!(
            map_usb_error(rusb::Error::NoDevice, timeout),
            TransportError::DeviceDisconnected
        );
        assert!(map_usb_error(rusb::Error::Pipe, timeout).is_transient());
    }
}

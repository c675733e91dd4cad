//! Byte transports underneath the protocol engine.
//!
//! A [`Transport`] moves whole frames to and from the instrument. It knows
//! nothing about opcodes or checksums; framing lives in
//! [`FrameCodec`](crate::protocol::FrameCodec).
//!
//! Implementations:
//! - [`MockTransport`]: scripted replies for unit tests
//! - [`SimulatedCba4`]: behavioural model of the instrument
//! - `UsbTransport`: real hardware over libusb (requires the `usb` feature)

pub mod mock;
pub mod simulator;
#[cfg(feature = "usb")]
pub mod usb;

pub use mock::{MockHandle, MockTransport, Reply};
pub use simulator::{SimHandle, SimulatedCba4};
#[cfg(feature = "usb")]
pub use usb::{scan, DeviceInfo, UsbTransport};

use std::time::Duration;
use tracing::debug;

use crate::error::TransportError;

/// Upper bound on frames discarded by one [`Transport::drain`] call.
pub const MAX_DRAIN_FRAMES: usize = 8;

/// How long [`Transport::drain`] waits for each stale frame.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(5);

/// Frame-level byte channel to one instrument.
///
/// Calls block. The driver never issues more than one exchange at a time, so
/// implementations do not need internal locking beyond what `Send` requires.
pub trait Transport: Send {
    /// Write one complete frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Read one frame of at most `max_len` bytes, waiting up to `timeout`.
    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Release the device. Further calls fail with `DeviceDisconnected`.
    fn close(&mut self) -> Result<(), TransportError>;

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;

    /// Discard frames left over from an earlier, abandoned exchange.
    ///
    /// Returns the number of frames thrown away. Stops at the first timeout.
    fn drain(&mut self, max_len: usize) -> Result<usize, TransportError> {
        let mut discarded = 0;
        while discarded < MAX_DRAIN_FRAMES {
            match self.receive(max_len, DRAIN_TIMEOUT) {
                Ok(stale) => {
                    debug!(bytes = stale.len(), "discarded stale frame");
                    discarded += 1;
                }
                Err(TransportError::Timeout { .. }) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(discarded)
    }

    /// Short human readable description, used in logs.
    fn describe(&self) -> String;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).receive(max_len, timeout)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn drain(&mut self, max_len: usize) -> Result<usize, TransportError> {
        (**self).drain(max_len)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

//! # rust_cba
//!
//! Host-side driver for the CBA4 programmable DC load (battery analyzer).
//! The instrument is a USB device speaking a small fixed-size binary protocol;
//! this crate turns that into a typed, blocking API with retry, state tracking
//! and a watchdog keepalive.
//!
//! ## Crate Structure
//!
//! - **`transport`**: the [`Transport`](transport::Transport) seam over raw
//!   packets, with a libusb backend (feature `usb`), a scripted mock and a
//!   simulated instrument.
//! - **`protocol`**: frame layout, checksum schemes, the frame codec and the
//!   retrying request/response engine.
//! - **`controller`**: the load state machine (`Idle`, `Running`, `Faulted`,
//!   `Disconnected`) on top of the engine.
//! - **`measurement`**: SI-unit readings decoded from status replies.
//! - **`hardware`**: the [`Cba4`] session type, its async wrapper and the
//!   capability traits they implement.
//! - **`config`**: figment-based configuration (TOML file plus environment).
//! - **`logging`**: tracing-subscriber setup.
//! - **`error`** and **`error_recovery`**: error taxonomy and retry policy.
//!
//! ## Example
//!
//! ```rust
//! use rust_cba::{Cba4, DeviceState, DriverConfig};
//! use rust_cba::transport::SimulatedCba4;
//!
//! # fn main() -> rust_cba::DeviceResult<()> {
//! let (sim, _handle) = SimulatedCba4::new();
//! let cba = Cba4::with_transport(Box::new(sim), &DriverConfig::default())?;
//!
//! cba.start_load(0.5)?;
//! assert_eq!(cba.state(), DeviceState::Running);
//! let reading = cba.read_measurement()?;
//! assert!(reading.current() >= 0.0);
//! cba.stop_load()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod logging;
pub mod measurement;
pub mod protocol;
pub mod transport;

pub use config::DriverConfig;
pub use controller::{DeviceState, LoadController, MAX_LOAD_AMPS};
pub use error::{DeviceError, DeviceResult, ProtocolError, TransportError};
pub use error_recovery::RetryPolicy;
pub use hardware::{AsyncCba4, Cba4, LoadControl, Readable};
pub use measurement::{Measurement, StatusFlags};
pub use protocol::Checksum;

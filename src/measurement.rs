//! Measurement model: raw wire integers to physical units.
//!
//! The CBA4 reports every electrical quantity as an unsigned fixed-point
//! integer. Conversions here are pure functions with no I/O, so they can be
//! checked against tables of raw/physical pairs without a device.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::StatusReport;

/// Fixed-point scale of a raw wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireScale {
    /// Thousandths of the SI unit (mV, mA).
    Milli,
    /// Millionths of the SI unit (µV, µA). Used by the CBA4 status frame.
    Micro,
}

impl WireScale {
    /// Raw counts per SI unit.
    pub const fn counts_per_unit(self) -> f64 {
        match self {
            WireScale::Milli => 1_000.0,
            WireScale::Micro => 1_000_000.0,
        }
    }

    /// Convert a raw wire count to the SI unit.
    pub fn to_si(self, raw: u32) -> f64 {
        f64::from(raw) / self.counts_per_unit()
    }

    /// Convert an SI value to the nearest raw wire count.
    ///
    /// Returns `None` for negative, non-finite or unrepresentable values.
    pub fn from_si(self, value: f64) -> Option<u32> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let counts = (value * self.counts_per_unit()).round();
        if counts > f64::from(u32::MAX) {
            return None;
        }
        Some(counts as u32)
    }
}

/// Power dissipated by the load, in watts.
pub fn power(volts: f64, amps: f64) -> f64 {
    volts * amps
}

/// Instrument status bits carried in every status reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusFlags {
    /// The load is drawing current.
    pub running: bool,
    /// Current is being limited to stay inside the power envelope.
    pub power_limited: bool,
    /// The test was aborted because the heatsink got too hot.
    pub high_temp: bool,
}

impl StatusFlags {
    /// Bit set while the load is drawing current.
    pub const RUNNING: u8 = 0x02;
    /// Bit set while the instrument is power limiting.
    pub const POWER_LIMITED: u8 = 0x10;
    /// Bit set after an over-temperature abort.
    pub const HIGH_TEMP: u8 = 0x20;

    /// Decode the status byte of a reply frame.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            running: bits & Self::RUNNING != 0,
            power_limited: bits & Self::POWER_LIMITED != 0,
            high_temp: bits & Self::HIGH_TEMP != 0,
        }
    }

    /// Encode back into a status byte.
    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.running {
            bits |= Self::RUNNING;
        }
        if self.power_limited {
            bits |= Self::POWER_LIMITED;
        }
        if self.high_temp {
            bits |= Self::HIGH_TEMP;
        }
        bits
    }
}

/// One reading taken from the instrument.
///
/// Built fresh from each successful status reply and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    voltage: f64,
    current: f64,
    power: f64,
    set_current: f64,
    flags: StatusFlags,
    timestamp: DateTime<Utc>,
}

impl Measurement {
    /// Build a measurement from already converted values.
    pub fn new(voltage: f64, current: f64, set_current: f64, flags: StatusFlags) -> Self {
        Self::at(voltage, current, set_current, flags, Utc::now())
    }

    /// Build a measurement with an explicit timestamp.
    pub fn at(
        voltage: f64,
        current: f64,
        set_current: f64,
        flags: StatusFlags,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            voltage,
            current,
            power: power(voltage, current),
            set_current,
            flags,
            timestamp,
        }
    }

    /// Convert a decoded status reply.
    ///
    /// The set-point is only meaningful while running; it reads as zero otherwise.
    pub fn from_report(report: &StatusReport, timestamp: DateTime<Utc>) -> Self {
        let flags = report.flags;
        let set_current = if flags.running {
            WireScale::Micro.to_si(report.set_current_ua)
        } else {
            0.0
        };
        Self::at(
            WireScale::Micro.to_si(report.voltage_uv),
            WireScale::Micro.to_si(report.measured_current_ua),
            set_current,
            flags,
            timestamp,
        )
    }

    /// Terminal voltage in volts.
    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    /// Measured load current in amps.
    ///
    /// The instrument's feedback is 10 bits over its whole 40 A range, so this
    /// is good for spotting gross errors (blown fuse, power limiting) rather
    /// than precise work.
    pub fn current(&self) -> f64 {
        self.current
    }

    /// Power in watts, derived from voltage and current.
    pub fn power(&self) -> f64 {
        self.power
    }

    /// Requested load current in amps, zero when no test is running.
    pub fn set_current(&self) -> f64 {
        self.set_current
    }

    /// Status bits reported with this reading.
    pub fn flags(&self) -> StatusFlags {
        self.flags
    }

    /// When the reading was taken.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

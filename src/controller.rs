//! Load control state machine.
//!
//! [`LoadController`] owns the protocol engine and the instrument's logical
//! state, and decides which operations are allowed in which state:
//!
//! ```text
//!            start_load                 stop_load
//!   Idle ─────────────────▶ Running ─────────────────▶ Idle
//!    │  ▲                     │  (cutoff reached) ──▶ Idle
//!    │  │ stop_load ok        │  (HIGH_TEMP)      ──▶ Faulted
//!    │  └──────────── Faulted ◀── start/stop command failed
//!    │
//!    └── any fatal transport error ──▶ Disconnected (terminal)
//! ```
//!
//! Every failure path that leaves the load state uncertain ends in `Faulted`.
//! From there only `stop_load` is accepted.

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{DeviceError, DeviceResult, ProtocolError};
use crate::measurement::{Measurement, WireScale};
use crate::protocol::{Command, Opcode, ProtocolEngine, ResponseFrame, StatusReport};
use crate::transport::Transport;

/// Largest load current the instrument accepts, in amps.
pub const MAX_LOAD_AMPS: f64 = 40.0;

/// Logical operating state of the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Connected, no load applied.
    Idle,
    /// Drawing the requested load.
    Running,
    /// A load command failed or the instrument aborted; the load may still be
    /// applied. Only `stop_load` is accepted.
    Faulted,
    /// The session is over.
    Disconnected,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceState::Idle => "idle",
            DeviceState::Running => "running",
            DeviceState::Faulted => "faulted",
            DeviceState::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// State machine driving one instrument through a [`ProtocolEngine`].
pub struct LoadController<T: Transport> {
    engine: ProtocolEngine<T>,
    state: DeviceState,
    serial_number: Option<u32>,
}

impl<T: Transport> LoadController<T> {
    /// Wrap an engine. The controller starts `Idle`.
    pub fn new(engine: ProtocolEngine<T>) -> Self {
        Self {
            engine,
            state: DeviceState::Idle,
            serial_number: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Serial number read by the last successful [`identify`](Self::identify).
    pub fn serial_number(&self) -> Option<u32> {
        self.serial_number
    }

    /// The underlying engine.
    pub fn engine(&self) -> &ProtocolEngine<T> {
        &self.engine
    }

    /// Read the instrument's serial number.
    #[instrument(skip(self))]
    pub fn identify(&mut self) -> DeviceResult<u32> {
        let frame = self.exchange(&Command::Identify)?;
        let identity = self.interpret(Opcode::Identify, frame.identity())?;
        debug!(serial_number = identity.serial_number, "identified instrument");
        self.serial_number = Some(identity.serial_number);
        Ok(identity.serial_number)
    }

    /// Start drawing `amps` of constant current.
    pub fn start_load(&mut self, amps: f64) -> DeviceResult<()> {
        self.start("start_load", amps, None)
    }

    /// Start drawing `amps`, stopping on its own once the terminal voltage
    /// falls below `cutoff_volts`.
    pub fn start_load_with_cutoff(&mut self, amps: f64, cutoff_volts: f64) -> DeviceResult<()> {
        self.start("start_load_with_cutoff", amps, Some(cutoff_volts))
    }

    #[instrument(skip(self))]
    fn start(&mut self, operation: &'static str, amps: f64, cutoff_volts: Option<f64>) -> DeviceResult<()> {
        match self.state {
            DeviceState::Idle => {}
            DeviceState::Running => {
                return Err(DeviceError::InvalidStateTransition {
                    from: self.state,
                    operation,
                })
            }
            DeviceState::Faulted => return Err(DeviceError::Faulted { operation }),
            DeviceState::Disconnected => return Err(DeviceError::Disconnected),
        }

        let load_ua = encode_amps(amps)?;
        let cutoff_uv = cutoff_volts.map(encode_volts).transpose()?;

        let report = match self.exchange(&Command::start(load_ua, cutoff_uv)) {
            Ok(frame) => self.interpret(Opcode::Status, frame.status_report()),
            Err(err) => Err(err),
        };
        let report = match report {
            Ok(report) => report,
            Err(err) => {
                if self.state != DeviceState::Disconnected {
                    warn!(error = %err, "start command failed, load state unknown");
                    self.transition(DeviceState::Faulted);
                }
                return Err(err);
            }
        };

        if report.flags.high_temp {
            warn!("instrument refused load: over temperature");
            self.transition(DeviceState::Faulted);
            return Err(DeviceError::Faulted { operation });
        }
        info!(amps, ?cutoff_volts, "load started");
        self.transition(DeviceState::Running);
        Ok(())
    }

    /// Stop drawing current.
    ///
    /// Always sends the stop command, whatever the state, so it doubles as
    /// the recovery path out of `Faulted`. A failed stop leaves the controller
    /// `Faulted`.
    #[instrument(skip(self))]
    pub fn stop_load(&mut self) -> DeviceResult<()> {
        if self.state == DeviceState::Disconnected {
            return Err(DeviceError::Disconnected);
        }
        match self.exchange(&Command::stop()) {
            Ok(_) => {
                info!("load stopped");
                self.transition(DeviceState::Idle);
                Ok(())
            }
            Err(err) => {
                if self.state != DeviceState::Disconnected {
                    error!(error = %err, "stop command failed, load may still be applied");
                    self.transition(DeviceState::Faulted);
                }
                Err(err)
            }
        }
    }

    /// Poll the instrument and convert its status reply.
    ///
    /// Allowed while `Idle` or `Running`. A failed read does not change the
    /// state unless the device disconnected. Status bits reported while
    /// running are applied: an over-temperature abort faults the controller,
    /// a run ended by the cutoff returns it to `Idle`.
    #[instrument(skip(self))]
    pub fn read_measurement(&mut self) -> DeviceResult<Measurement> {
        match self.state {
            DeviceState::Idle | DeviceState::Running => {}
            DeviceState::Faulted => {
                return Err(DeviceError::Faulted {
                    operation: "read_measurement",
                })
            }
            DeviceState::Disconnected => return Err(DeviceError::Disconnected),
        }
        let frame = self.exchange(&Command::poll())?;
        let report = self.interpret(Opcode::Status, frame.status_report())?;
        self.observe(&report);
        Ok(Measurement::from_report(&report, Utc::now()))
    }

    /// Feed the instrument's watchdog.
    ///
    /// Sends a status poll while `Running`; does nothing in other states.
    pub fn keepalive(&mut self) -> DeviceResult<()> {
        if self.state != DeviceState::Running {
            return Ok(());
        }
        let frame = self.exchange(&Command::poll())?;
        let report = self.interpret(Opcode::Status, frame.status_report())?;
        self.observe(&report);
        Ok(())
    }

    /// End the session.
    ///
    /// Sends a best-effort stop whatever the state, releases the transport
    /// and moves to `Disconnected`. Calling it again does nothing.
    #[instrument(skip(self))]
    pub fn close(&mut self) {
        if self.state == DeviceState::Disconnected {
            return;
        }
        if let Err(err) = self.exchange(&Command::stop()) {
            warn!(error = %err, "stop on close failed");
        }
        if let Err(err) = self.engine.close_transport() {
            warn!(error = %err, "failed to close transport");
        }
        self.transition(DeviceState::Disconnected);
        info!("session closed");
    }

    /// Run one exchange; a fatal error moves to `Disconnected`.
    fn exchange(&mut self, command: &Command) -> DeviceResult<ResponseFrame> {
        if self.state == DeviceState::Disconnected {
            return Err(DeviceError::Disconnected);
        }
        self.engine.execute(command).map_err(|err| {
            if err.is_fatal() {
                error!(error = %err, "instrument disconnected");
                self.transition(DeviceState::Disconnected);
            }
            err
        })
    }

    fn interpret<R>(&self, opcode: Opcode, parsed: Result<R, ProtocolError>) -> DeviceResult<R> {
        parsed.map_err(|err| DeviceError::CommandFailed {
            opcode,
            attempts: self.engine.last_exchange().map_or(1, |r| r.attempts),
            last_error: err.into(),
        })
    }

    fn observe(&mut self, report: &StatusReport) {
        if self.state != DeviceState::Running {
            return;
        }
        if report.flags.high_temp {
            warn!("instrument aborted the run: over temperature");
            self.transition(DeviceState::Faulted);
        } else if !report.flags.running {
            info!("instrument ended the run, cutoff voltage reached");
            self.transition(DeviceState::Idle);
        }
    }

    fn transition(&mut self, to: DeviceState) {
        if self.state == to {
            return;
        }
        match to {
            DeviceState::Faulted | DeviceState::Disconnected => {
                error!(from = %self.state, to = %to, "state transition")
            }
            _ => info!(from = %self.state, to = %to, "state transition"),
        }
        self.state = to;
    }
}

fn encode_amps(amps: f64) -> DeviceResult<u32> {
    if !amps.is_finite() || !(0.0..=MAX_LOAD_AMPS).contains(&amps) {
        return Err(DeviceError::InvalidParameter(format!(
            "load current {amps} A outside 0..={MAX_LOAD_AMPS} A"
        )));
    }
    WireScale::Micro
        .from_si(amps)
        .ok_or_else(|| DeviceError::InvalidParameter(format!("load current {amps} A not encodable")))
}

fn encode_volts(volts: f64) -> DeviceResult<u32> {
    WireScale::Micro
        .from_si(volts)
        .ok_or_else(|| DeviceError::InvalidParameter(format!("cutoff voltage {volts} V not encodable")))
}

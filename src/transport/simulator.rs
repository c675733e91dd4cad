//! Behavioural model of a CBA4 for tests and demos.
//!
//! The simulated instrument sits behind a battery modelled as an ideal source
//! with internal resistance. It decodes commands with the same
//! [`FrameCodec`] the driver uses and answers with well-formed replies, so the
//! whole driver stack can be exercised without hardware.
//!
//! Modelled behaviour:
//! - constant-current load, limited by a power envelope (`POWER_LIMITED`)
//! - terminal voltage sag `V = Vsrc - I * R`
//! - optional low-voltage cutoff that ends the run
//! - optional watchdog that stops the load when commands stop arriving
//! - injected faults: over-temperature, dropped or truncated replies, unplug

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::Transport;
use crate::error::TransportError;
use crate::measurement::{StatusFlags, WireScale};
use crate::protocol::{Checksum, Command, FrameCodec, Identity, Opcode, StatusReport, StatusRequest};

/// Serial number reported when none is configured.
pub const DEFAULT_SERIAL: u32 = 0x0000_0A11;

#[derive(Debug)]
struct SimState {
    codec: FrameCodec,
    serial_number: u32,
    source_volts: f64,
    internal_ohms: f64,
    power_limit_watts: f64,
    watchdog: Option<Duration>,

    running: bool,
    set_current_ua: u32,
    cutoff_uv: Option<u32>,
    high_temp: bool,
    last_command: Option<Instant>,

    outbox: VecDeque<Vec<u8>>,
    commands: Vec<Command>,
    drop_replies: usize,
    corrupt_replies: usize,
    connected: bool,
}

impl SimState {
    fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            serial_number: DEFAULT_SERIAL,
            source_volts: 12.0,
            internal_ohms: 0.05,
            power_limit_watts: 150.0,
            watchdog: None,
            running: false,
            set_current_ua: 0,
            cutoff_uv: None,
            high_temp: false,
            last_command: None,
            outbox: VecDeque::new(),
            commands: Vec::new(),
            drop_replies: 0,
            corrupt_replies: 0,
            connected: true,
        }
    }

    /// Current the load actually draws, in amps.
    fn drawn_amps(&self) -> (f64, bool) {
        if !self.running {
            return (0.0, false);
        }
        let requested = WireScale::Micro.to_si(self.set_current_ua);
        // Largest current the envelope allows at the sagged terminal voltage
        let v = self.source_volts;
        let r = self.internal_ohms;
        let p = self.power_limit_watts;
        let limit = if r > 0.0 {
            let disc = v * v - 4.0 * r * p;
            if disc >= 0.0 {
                (v - disc.sqrt()) / (2.0 * r)
            } else {
                v / (2.0 * r)
            }
        } else if v > 0.0 {
            p / v
        } else {
            requested
        };
        if requested > limit {
            (limit, true)
        } else {
            (requested, false)
        }
    }

    fn terminal_volts(&self, amps: f64) -> f64 {
        (self.source_volts - amps * self.internal_ohms).max(0.0)
    }

    fn check_watchdog(&mut self, now: Instant) {
        if let (Some(limit), Some(last)) = (self.watchdog, self.last_command) {
            if self.running && now.duration_since(last) > limit {
                debug!("simulated watchdog expired, load stopped");
                self.running = false;
            }
        }
        self.last_command = Some(now);
    }

    fn apply(&mut self, request: StatusRequest) {
        if request.control & StatusRequest::APPLY == 0 {
            return;
        }
        self.high_temp = false;
        if request.control & StatusRequest::RUN != 0 {
            self.running = true;
            self.set_current_ua = request.load_ua;
            self.cutoff_uv = (request.control & StatusRequest::VSTOP != 0).then_some(request.cutoff_uv);
        } else {
            self.running = false;
            self.set_current_ua = 0;
            self.cutoff_uv = None;
        }
    }

    fn report(&mut self) -> StatusReport {
        let (mut amps, mut limited) = self.drawn_amps();
        let volts = self.terminal_volts(amps);
        if let Some(cutoff) = self.cutoff_uv {
            if self.running && volts < WireScale::Micro.to_si(cutoff) {
                debug!(volts, "simulated cutoff reached, load stopped");
                self.running = false;
                amps = 0.0;
                limited = false;
            }
        }
        let volts = self.terminal_volts(amps);
        StatusReport {
            flags: StatusFlags {
                running: self.running,
                power_limited: limited,
                high_temp: self.high_temp,
            },
            set_current_ua: self.set_current_ua,
            measured_current_ua: WireScale::Micro.from_si(amps).unwrap_or(0),
            voltage_uv: WireScale::Micro.from_si(volts).unwrap_or(0),
        }
    }

    fn handle(&mut self, command: Command) -> Option<Vec<u8>> {
        self.check_watchdog(Instant::now());
        self.commands.push(command);
        let (status, payload) = match command {
            Command::Identify => (
                0,
                Identity {
                    serial_number: self.serial_number,
                }
                .to_payload(),
            ),
            Command::Status(request) => {
                self.apply(request);
                let report = self.report();
                (report.flags.bits(), report.to_payload())
            }
        };
        self.codec
            .encode_response(command.opcode(), status, &payload)
            .ok()
    }
}

/// Simulated instrument implementing [`Transport`].
#[derive(Debug)]
pub struct SimulatedCba4 {
    state: Arc<Mutex<SimState>>,
}

/// Control and inspection handle for a [`SimulatedCba4`].
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedCba4 {
    /// Simulated instrument speaking the unchecked CBA4 framing.
    pub fn new() -> (Self, SimHandle) {
        Self::with_checksum(Checksum::None)
    }

    /// Simulated instrument using `checksum` on every frame.
    pub fn with_checksum(checksum: Checksum) -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState::new(FrameCodec::new(checksum))));
        (
            Self {
                state: Arc::clone(&state),
            },
            SimHandle { state },
        )
    }
}

impl Transport for SimulatedCba4 {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::DeviceDisconnected);
        }
        let command = match state.codec.decode_command(frame) {
            Ok(command) => command,
            Err(err) => {
                // The instrument ignores frames it cannot parse
                debug!(error = %err, "simulator ignored command frame");
                return Ok(());
            }
        };
        trace!(?command, "simulator received command");
        let Some(mut reply) = state.handle(command) else {
            return Ok(());
        };
        if state.drop_replies > 0 {
            state.drop_replies -= 1;
            return Ok(());
        }
        if state.corrupt_replies > 0 {
            state.corrupt_replies -= 1;
            reply.truncate(reply.len() / 2);
        }
        state.outbox.push_back(reply);
        Ok(())
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::DeviceDisconnected);
        }
        match state.outbox.pop_front() {
            Some(mut frame) => {
                frame.truncate(max_len);
                Ok(frame)
            }
            None => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.state.lock().connected = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().connected
    }

    fn describe(&self) -> String {
        format!("simulated CBA4 #{}", self.state.lock().serial_number)
    }
}

impl SimHandle {
    /// Change the reported serial number.
    pub fn set_serial_number(&self, serial_number: u32) {
        self.state.lock().serial_number = serial_number;
    }

    /// Open-circuit voltage of the simulated battery.
    pub fn set_source_voltage(&self, volts: f64) {
        self.state.lock().source_volts = volts;
    }

    /// Internal resistance of the simulated battery.
    pub fn set_internal_resistance(&self, ohms: f64) {
        self.state.lock().internal_ohms = ohms;
    }

    /// Power the simulated load can dissipate before limiting.
    pub fn set_power_limit(&self, watts: f64) {
        self.state.lock().power_limit_watts = watts;
    }

    /// Stop the load when no command arrives for longer than `timeout`.
    pub fn enable_watchdog(&self, timeout: Duration) {
        self.state.lock().watchdog = Some(timeout);
    }

    /// Trip the over-temperature protection: the load stops and `HIGH_TEMP`
    /// is reported until the next applied setting.
    pub fn overheat(&self) {
        let mut state = self.state.lock();
        state.high_temp = true;
        state.running = false;
    }

    /// Swallow the replies to the next `count` commands.
    pub fn drop_next_replies(&self, count: usize) {
        self.state.lock().drop_replies = count;
    }

    /// Truncate the replies to the next `count` commands.
    pub fn corrupt_next_replies(&self, count: usize) {
        self.state.lock().corrupt_replies = count;
    }

    /// Simulate the USB cable being pulled.
    pub fn unplug(&self) {
        self.state.lock().connected = false;
    }

    /// Whether the simulated load is drawing current.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Commands decoded so far, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    /// Number of status commands that changed nothing (polls and keepalives).
    pub fn poll_count(&self) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| **c == Command::poll())
            .count()
    }

    /// Number of identify commands seen.
    pub fn identify_count(&self) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.opcode() == Opcode::Identify)
            .count()
    }
}

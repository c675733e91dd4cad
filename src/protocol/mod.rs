//! CBA4 wire protocol.
//!
//! Protocol Overview:
//! - Transport: USB, vendor 0x2405 / product 0x0005, 64-byte packets
//! - Strict request/response, one command in flight
//! - Commands: `C` (0x43) identify, `S` (0x53) status/set
//! - Replies echo the opcode in lower case (`c`, `s`) followed by a status byte
//! - Multi-byte fields are little-endian u32 in micro-units (µA, µV)
//!
//! # Status command layout
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | opcode `0x53` |
//! | 1 | control flags (APPLY 0x01, RUN 0x02, VSTOP 0x40) |
//! | 2 | reserved |
//! | 3..7 | load set-point, µA |
//! | 7..12 | fan, LED1, LED2, IO TRIS, IO PORT |
//! | 12..16 | cutoff voltage, µV |
//!
//! # Status reply layout
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | echo `0x73` |
//! | 1 | status flags (RUNNING 0x02, POWER_LIMITED 0x10, HIGH_TEMP 0x20) |
//! | 3..7 | active set-point, µA |
//! | 16..20 | measured current, µA |
//! | 20..24 | measured voltage, µV |
//!
//! Frames may carry a trailing checksum, see [`Checksum`].

pub mod checksum;
pub mod codec;
pub mod engine;

pub use checksum::Checksum;
pub use codec::FrameCodec;
pub use engine::{ExchangeReport, ProtocolEngine};

use serde::Serialize;
use std::fmt;

use crate::error::ProtocolError;
use crate::measurement::StatusFlags;

/// Bit that turns a command opcode into its reply echo (ASCII lower case).
pub const ECHO_BIT: u8 = 0x20;

/// Payload bytes in every reply frame (64-byte packet minus opcode and status).
pub const REPLY_PAYLOAD_LEN: usize = 62;

/// Command opcodes understood by the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Opcode {
    /// Read the configuration block, which carries the serial number.
    Identify = 0x43,
    /// Report status, optionally applying new load settings.
    Status = 0x53,
}

impl Opcode {
    /// Every opcode, for table lookups.
    pub const ALL: [Opcode; 2] = [Opcode::Identify, Opcode::Status];

    /// Command byte on the wire.
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Byte that opens the reply to this command.
    pub const fn echo(self) -> u8 {
        self as u8 | ECHO_BIT
    }

    /// Look up a command byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.byte() == byte)
    }

    /// Look up a reply echo byte.
    pub fn from_echo(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.echo() == byte)
    }

    /// Command payload size, excluding opcode and checksum.
    pub const fn payload_len(self) -> usize {
        match self {
            Opcode::Identify => 0,
            Opcode::Status => 15,
        }
    }

    /// Reply payload size, excluding echo, status byte and checksum.
    pub const fn reply_payload_len(self) -> usize {
        match self {
            Opcode::Identify | Opcode::Status => REPLY_PAYLOAD_LEN,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Opcode::Identify => "identify",
            Opcode::Status => "status",
        };
        write!(f, "{}", label)
    }
}

/// Settings carried by a status command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusRequest {
    /// Control flags, see the `APPLY`, `RUN` and `VSTOP` constants.
    pub control: u8,
    /// Load set-point in µA.
    pub load_ua: u32,
    /// Low-voltage cutoff in µV, honoured when `VSTOP` is set.
    pub cutoff_uv: u32,
}

impl StatusRequest {
    /// Write the settings in this frame.
    pub const APPLY: u8 = 0x01;
    /// Draw the load.
    pub const RUN: u8 = 0x02;
    /// Stop automatically when the voltage drops below the cutoff.
    pub const VSTOP: u8 = 0x40;

    /// Report only. Also serves as the watchdog keepalive.
    pub const fn poll() -> Self {
        Self {
            control: 0,
            load_ua: 0,
            cutoff_uv: 0,
        }
    }

    /// Start drawing `load_ua`, optionally stopping below `cutoff_uv`.
    pub const fn start(load_ua: u32, cutoff_uv: Option<u32>) -> Self {
        match cutoff_uv {
            Some(cutoff_uv) => Self {
                control: Self::APPLY | Self::RUN | Self::VSTOP,
                load_ua,
                cutoff_uv,
            },
            None => Self {
                control: Self::APPLY | Self::RUN,
                load_ua,
                cutoff_uv: 0,
            },
        }
    }

    /// Stop drawing current.
    pub const fn stop() -> Self {
        Self {
            control: Self::APPLY,
            load_ua: 0,
            cutoff_uv: 0,
        }
    }

    fn to_payload(self) -> [u8; 15] {
        let mut payload = [0u8; 15];
        payload[0] = self.control;
        // payload[1] reserved
        payload[2..6].copy_from_slice(&self.load_ua.to_le_bytes());
        // payload[6..11]: fan, LED1, LED2, IO TRIS, IO PORT left at zero
        payload[11..15].copy_from_slice(&self.cutoff_uv.to_le_bytes());
        payload
    }

    fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != Opcode::Status.payload_len() {
            return Err(ProtocolError::malformed(format!(
                "status payload is {} bytes, expected {}",
                payload.len(),
                Opcode::Status.payload_len()
            )));
        }
        Ok(Self {
            control: payload[0],
            load_ua: read_u32_le(payload, 2),
            cutoff_uv: read_u32_le(payload, 11),
        })
    }
}

/// A command for the instrument.
///
/// Each variant has a statically known payload shape, so a command can always
/// be encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Read the configuration block.
    Identify,
    /// Read status and optionally apply load settings.
    Status(StatusRequest),
}

impl Command {
    /// Status poll that changes nothing.
    pub const fn poll() -> Self {
        Command::Status(StatusRequest::poll())
    }

    /// Start a constant-current load.
    pub const fn start(load_ua: u32, cutoff_uv: Option<u32>) -> Self {
        Command::Status(StatusRequest::start(load_ua, cutoff_uv))
    }

    /// Stop the load.
    pub const fn stop() -> Self {
        Command::Status(StatusRequest::stop())
    }

    /// Opcode of this command.
    pub const fn opcode(&self) -> Opcode {
        match self {
            Command::Identify => Opcode::Identify,
            Command::Status(_) => Opcode::Status,
        }
    }

    /// Fixed-size payload bytes, excluding opcode and checksum.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Command::Identify => Vec::new(),
            Command::Status(request) => request.to_payload().to_vec(),
        }
    }

    pub(crate) fn from_parts(opcode: Opcode, payload: &[u8]) -> Result<Self, ProtocolError> {
        match opcode {
            Opcode::Identify if payload.is_empty() => Ok(Command::Identify),
            Opcode::Identify => Err(ProtocolError::malformed(format!(
                "identify carries {} payload bytes, expected none",
                payload.len()
            ))),
            Opcode::Status => StatusRequest::from_payload(payload).map(Command::Status),
        }
    }
}

/// A validated reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    opcode: Opcode,
    status: u8,
    payload: Vec<u8>,
    checksum: Vec<u8>,
}

impl ResponseFrame {
    pub(crate) fn new(opcode: Opcode, status: u8, payload: Vec<u8>, checksum: Vec<u8>) -> Self {
        Self {
            opcode,
            status,
            payload,
            checksum,
        }
    }

    /// Opcode of the command this frame answers.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Status byte.
    pub fn status(&self) -> u8 {
        self.status
    }

    /// Payload bytes following the status byte.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Trailing checksum bytes, empty for unchecked frames.
    pub fn checksum(&self) -> &[u8] {
        &self.checksum
    }

    /// Read a little-endian u32 at an offset of the full frame.
    fn frame_u32(&self, frame_offset: usize) -> u32 {
        read_u32_le(&self.payload, frame_offset - 2)
    }

    /// Interpret a status reply.
    pub fn status_report(&self) -> Result<StatusReport, ProtocolError> {
        self.expect(Opcode::Status)?;
        Ok(StatusReport {
            flags: StatusFlags::from_bits(self.status),
            set_current_ua: self.frame_u32(3),
            measured_current_ua: self.frame_u32(16),
            voltage_uv: self.frame_u32(20),
        })
    }

    /// Interpret an identify reply.
    pub fn identity(&self) -> Result<Identity, ProtocolError> {
        self.expect(Opcode::Identify)?;
        Ok(Identity {
            serial_number: self.frame_u32(4),
        })
    }

    fn expect(&self, opcode: Opcode) -> Result<(), ProtocolError> {
        if self.opcode == opcode {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedOpcode {
                expected: Some(opcode.echo()),
                actual: self.opcode.echo(),
            })
        }
    }
}

/// Raw fields of a status reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// Decoded status byte.
    pub flags: StatusFlags,
    /// Active set-point, µA.
    pub set_current_ua: u32,
    /// Measured current, µA.
    pub measured_current_ua: u32,
    /// Measured voltage, µV.
    pub voltage_uv: u32,
}

impl StatusReport {
    /// Lay the report out as a reply payload (frame offsets 2..64).
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = vec![0u8; REPLY_PAYLOAD_LEN];
        write_u32_le(&mut payload, 3 - 2, self.set_current_ua);
        write_u32_le(&mut payload, 16 - 2, self.measured_current_ua);
        write_u32_le(&mut payload, 20 - 2, self.voltage_uv);
        payload
    }
}

/// Fields of an identify reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// Serial number printed on the bottom of the unit.
    pub serial_number: u32,
}

impl Identity {
    /// Lay the identity out as a reply payload (frame offsets 2..64).
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = vec![0u8; REPLY_PAYLOAD_LEN];
        write_u32_le(&mut payload, 4 - 2, self.serial_number);
        payload
    }
}

fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    if let Some(src) = bytes.get(offset..offset + 4) {
        word.copy_from_slice(src);
    }
    u32::from_le_bytes(word)
}

fn write_u32_le(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

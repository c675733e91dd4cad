//! Frame integrity schemes.
//!
//! The checksum, when present, is appended after the payload and computed over
//! every preceding byte of the frame.

use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::ProtocolError;

const CRC16_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Trailing integrity check appended to every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checksum {
    /// No trailing bytes. This is what CBA4 firmware speaks.
    #[default]
    None,
    /// Wrapping sum of all bytes, one byte.
    Sum8,
    /// XOR of all bytes, one byte.
    Xor8,
    /// CRC-16/MODBUS, two bytes little-endian.
    Crc16Modbus,
}

impl Checksum {
    /// Number of trailing bytes.
    pub const fn width(self) -> usize {
        match self {
            Checksum::None => 0,
            Checksum::Sum8 | Checksum::Xor8 => 1,
            Checksum::Crc16Modbus => 2,
        }
    }

    /// Compute the trailing bytes for `data`.
    pub fn compute(self, data: &[u8]) -> Vec<u8> {
        match self {
            Checksum::None => Vec::new(),
            Checksum::Sum8 => vec![data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))],
            Checksum::Xor8 => vec![data.iter().fold(0u8, |acc, &b| acc ^ b)],
            Checksum::Crc16Modbus => CRC16_MODBUS.checksum(data).to_le_bytes().to_vec(),
        }
    }

    /// Check the trailing bytes of a complete frame.
    pub fn verify(self, frame: &[u8]) -> Result<(), ProtocolError> {
        let width = self.width();
        if frame.len() < width {
            return Err(ProtocolError::malformed(format!(
                "frame too short for checksum: {} bytes, need at least {}",
                frame.len(),
                width
            )));
        }
        let (body, carried) = frame.split_at(frame.len() - width);
        let computed = self.compute(body);
        if computed != carried {
            trace!(?computed, ?carried, "checksum mismatch");
            return Err(ProtocolError::ChecksumMismatch {
                expected: computed,
                actual: carried.to_vec(),
            });
        }
        Ok(())
    }
}

//! Frame encoding and decoding.
//!
//! Command frame: `[opcode][payload][checksum]`
//! Reply frame:   `[echo][status][payload][checksum]`
//!
//! Every field has a fixed size per opcode, so both directions are pure
//! functions of the command and the configured [`Checksum`]. Decoding either
//! yields a complete [`ResponseFrame`] or an error, never partial state.

use tracing::instrument;

use super::{Checksum, Command, Opcode, ResponseFrame};
use crate::error::ProtocolError;

/// Encoder/decoder for CBA4 frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCodec {
    checksum: Checksum,
}

impl FrameCodec {
    /// Create a codec using `checksum` in both directions.
    pub const fn new(checksum: Checksum) -> Self {
        Self { checksum }
    }

    /// Integrity scheme in use.
    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    /// Size of an encoded command frame.
    pub const fn command_len(&self, opcode: Opcode) -> usize {
        1 + opcode.payload_len() + self.checksum.width()
    }

    /// Size of a reply frame for `opcode`.
    pub const fn response_len(&self, opcode: Opcode) -> usize {
        2 + opcode.reply_payload_len() + self.checksum.width()
    }

    /// Largest reply frame this codec can produce or accept.
    pub fn max_response_len(&self) -> usize {
        Opcode::ALL
            .into_iter()
            .map(|op| self.response_len(op))
            .max()
            .unwrap_or_default()
    }

    /// Serialize a command.
    pub fn encode(&self, command: &Command) -> Vec<u8> {
        let opcode = command.opcode();
        let mut frame = Vec::with_capacity(self.command_len(opcode));
        frame.push(opcode.byte());
        frame.extend_from_slice(&command.payload());
        self.seal(frame)
    }

    /// Serialize a reply, as the instrument would send it.
    ///
    /// A short payload is zero padded to the opcode's fixed size.
    pub fn encode_response(
        &self,
        opcode: Opcode,
        status: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let size = opcode.reply_payload_len();
        if payload.len() > size {
            return Err(ProtocolError::malformed(format!(
                "{} reply payload is {} bytes, limit {}",
                opcode,
                payload.len(),
                size
            )));
        }
        let mut frame = Vec::with_capacity(self.response_len(opcode));
        frame.push(opcode.echo());
        frame.push(status);
        frame.extend_from_slice(payload);
        frame.resize(2 + size, 0);
        Ok(self.seal(frame))
    }

    /// Validate and deserialize a reply.
    ///
    /// Checks run in a fixed order: minimum size, the expected size of a known
    /// opcode, the checksum, and finally that the opcode is known at all. A
    /// single corrupted byte in a checksummed frame therefore always reports
    /// `ChecksumMismatch`.
    #[instrument(level = "trace", skip(self, bytes), fields(len = bytes.len()), err)]
    pub fn decode(&self, bytes: &[u8]) -> Result<ResponseFrame, ProtocolError> {
        let width = self.checksum.width();
        if bytes.len() < 2 + width {
            return Err(ProtocolError::malformed(format!(
                "reply too short: {} bytes",
                bytes.len()
            )));
        }

        let opcode = Opcode::from_echo(bytes[0]);
        if let Some(op) = opcode {
            let expected = self.response_len(op);
            if bytes.len() != expected {
                return Err(ProtocolError::malformed(format!(
                    "{} reply is {} bytes, expected {}",
                    op,
                    bytes.len(),
                    expected
                )));
            }
        }

        self.checksum.verify(bytes)?;

        let opcode = opcode.ok_or(ProtocolError::UnexpectedOpcode {
            expected: None,
            actual: bytes[0],
        })?;
        let body_end = bytes.len() - width;
        Ok(ResponseFrame::new(
            opcode,
            bytes[1],
            bytes[2..body_end].to_vec(),
            bytes[body_end..].to_vec(),
        ))
    }

    /// Validate and deserialize a command, as the instrument would.
    pub fn decode_command(&self, bytes: &[u8]) -> Result<Command, ProtocolError> {
        let first = *bytes
            .first()
            .ok_or_else(|| ProtocolError::malformed("empty command frame"))?;
        let opcode = Opcode::from_byte(first).ok_or(ProtocolError::UnexpectedOpcode {
            expected: None,
            actual: first,
        })?;
        let expected = self.command_len(opcode);
        if bytes.len() != expected {
            return Err(ProtocolError::malformed(format!(
                "{} command is {} bytes, expected {}",
                opcode,
                bytes.len(),
                expected
            )));
        }
        self.checksum.verify(bytes)?;
        let body_end = bytes.len() - self.checksum.width();
        Command::from_parts(opcode, &bytes[1..body_end])
    }

    fn seal(&self, mut frame: Vec<u8>) -> Vec<u8> {
        let trailer = self.checksum.compute(&frame);
        frame.extend_from_slice(&trailer);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Identity, StatusReport, StatusRequest};

    const SCHEMES: [Checksum; 4] = [
        Checksum::None,
        Checksum::Sum8,
        Checksum::Xor8,
        Checksum::Crc16Modbus,
    ];

    fn sample_commands() -> Vec<Command> {
        vec![
            Command::Identify,
            Command::poll(),
            Command::start(1_000_000, None),
            Command::start(150_000, Some(10_500_000)),
            Command::stop(),
        ]
    }

    #[test]
    fn cba4_frames_are_bit_exact() {
        let codec = FrameCodec::default();
        assert_eq!(codec.encode(&Command::Identify), vec![0x43]);

        // Same bytes the vendor host software sends for a 0.15 A start
        let frame = codec.encode(&Command::start(150_000, None));
        assert_eq!(
            frame,
            vec![0x53, 0x03, 0x00, 0xF0, 0x49, 0x02, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(codec.encode(&Command::stop())[..2], [0x53, 0x01]);
        assert_eq!(codec.response_len(Opcode::Status), 64);
    }

    #[test]
    fn encoded_length_is_fixed_per_opcode() {
        for scheme in SCHEMES {
            let codec = FrameCodec::new(scheme);
            for command in sample_commands() {
                assert_eq!(
                    codec.encode(&command).len(),
                    codec.command_len(command.opcode()),
                    "{scheme:?} {command:?}"
                );
            }
        }
    }

    #[test]
    fn echo_frame_decodes_to_matching_opcode() {
        for scheme in SCHEMES {
            let codec = FrameCodec::new(scheme);
            for command in sample_commands() {
                let opcode = command.opcode();
                let reply = codec.encode_response(opcode, 0x02, &[0xAA, 0x55]).unwrap();
                let frame = codec.decode(&reply).unwrap();
                assert_eq!(frame.opcode(), opcode);
                assert_eq!(frame.status(), 0x02);
                assert_eq!(&frame.payload()[..2], &[0xAA, 0x55]);
                assert_eq!(frame.checksum().len(), scheme.width());
            }
        }
    }

    #[test]
    fn any_single_byte_mutation_is_a_checksum_mismatch() {
        for scheme in [Checksum::Sum8, Checksum::Xor8, Checksum::Crc16Modbus] {
            let codec = FrameCodec::new(scheme);
            let report = StatusReport {
                set_current_ua: 1_000_000,
                measured_current_ua: 990_000,
                voltage_uv: 12_000_000,
                ..Default::default()
            };
            let reply = codec
                .encode_response(Opcode::Status, 0x02, &report.to_payload())
                .unwrap();
            for index in 0..reply.len() {
                for flip in [0x01u8, 0x80, 0xFF] {
                    let mut corrupt = reply.clone();
                    corrupt[index] ^= flip;
                    let result = codec.decode(&corrupt);
                    assert!(
                        matches!(result, Err(ProtocolError::ChecksumMismatch { .. })),
                        "{scheme:?} byte {index} flip {flip:#04x}: {result:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn unchecked_frames_still_reject_bad_opcodes_and_sizes() {
        let codec = FrameCodec::default();
        let reply = codec
            .encode_response(Opcode::Status, 0, &Identity { serial_number: 7 }.to_payload())
            .unwrap();

        let mut bad_opcode = reply.clone();
        bad_opcode[0] = 0x99;
        assert_eq!(
            codec.decode(&bad_opcode),
            Err(ProtocolError::UnexpectedOpcode {
                expected: None,
                actual: 0x99
            })
        );

        assert!(matches!(
            codec.decode(&reply[..40]),
            Err(ProtocolError::MalformedFrame { .. })
        ));
        assert!(matches!(
            codec.decode(&[0x73]),
            Err(ProtocolError::MalformedFrame { .. })
        ));

        let mut long = reply;
        long.push(0);
        assert!(matches!(
            codec.decode(&long),
            Err(ProtocolError::MalformedFrame { .. })
        ));
    }

    #[test]
    fn oversized_reply_payload_is_rejected() {
        let codec = FrameCodec::default();
        let payload = vec![0u8; 63];
        assert!(codec.encode_response(Opcode::Status, 0, &payload).is_err());
    }

    #[test]
    fn commands_decode_back() {
        for scheme in SCHEMES {
            let codec = FrameCodec::new(scheme);
            for command in sample_commands() {
                let decoded = codec.decode_command(&codec.encode(&command)).unwrap();
                assert_eq!(decoded, command);
            }
        }
        let codec = FrameCodec::new(Checksum::Sum8);
        let mut frame = codec.encode(&Command::Status(StatusRequest::start(5, None)));
        frame[3] ^= 0x10;
        assert!(matches!(
            codec.decode_command(&frame),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
        assert!(codec.decode_command(&[]).is_err());
    }
}

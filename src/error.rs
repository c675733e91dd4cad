//! Error types for the CBA4 driver.
//!
//! Errors are layered the same way the driver is:
//!
//! - **`TransportError`**: raised by a [`Transport`](crate::transport::Transport)
//!   implementation while moving bytes to and from the instrument.
//! - **`ProtocolError`**: raised by the [`FrameCodec`](crate::protocol::FrameCodec)
//!   when a frame fails length, checksum or opcode validation.
//! - **`ExchangeError`**: the cause of one failed request/response exchange,
//!   either a transport or a protocol failure. The protocol engine retries these
//!   when they are transient.
//! - **`DeviceError`**: what callers of the public driver operations see. Retry
//!   exhaustion, state machine refusals and disconnects all end up here.
//!
//! Transient failures never leak to the caller directly: the engine either
//! recovers from them or wraps the last one in [`DeviceError::CommandFailed`].

use crate::controller::DeviceState;
use crate::protocol::Opcode;
use thiserror::Error;

/// Errors produced by the byte transport underneath the protocol engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No frame arrived within the allotted time.
    #[error("Timeout after {timeout_ms}ms")]
    Timeout {
        /// The timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The device is gone (unplugged, or the handle was closed).
    #[error("Device disconnected")]
    DeviceDisconnected,

    /// A USB transfer failed for a reason other than timeout or disconnect.
    #[error("USB transfer failed: {0}")]
    TransferError(String),

    /// No matching instrument was found while opening a session.
    #[error("No CBA4 found: {0}")]
    DeviceNotFound(String),

    /// The instrument was found but could not be opened or claimed.
    #[error("Failed to open device: {0}")]
    OpenFailed(String),
}

impl TransportError {
    /// Returns true if resending the same command may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. } | TransportError::TransferError(_)
        )
    }
}

/// Errors produced while validating and decoding frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The trailing checksum does not match the frame contents.
    #[error("Checksum mismatch: computed {expected:02X?}, frame carries {actual:02X?}")]
    ChecksumMismatch {
        /// Checksum computed over the received frame body.
        expected: Vec<u8>,
        /// Checksum bytes carried by the frame.
        actual: Vec<u8>,
    },

    /// The frame has the wrong size or an impossible layout.
    #[error("Malformed frame: {reason}")]
    MalformedFrame {
        /// Human readable description of the violation.
        reason: String,
    },

    /// The frame starts with an opcode that is unknown or not the one awaited.
    #[error("Unexpected opcode 0x{actual:02X}{}", expected_suffix(.expected))]
    UnexpectedOpcode {
        /// The opcode byte that was awaited, if a specific one was.
        expected: Option<u8>,
        /// The opcode byte that was received.
        actual: u8,
    },
}

fn expected_suffix(expected: &Option<u8>) -> String {
    expected
        .map(|byte| format!(" (expected 0x{byte:02X})"))
        .unwrap_or_default()
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedFrame {
            reason: reason.into(),
        }
    }
}

/// Cause of a single failed request/response exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// The transport failed to move the bytes.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The bytes arrived but did not form the awaited response.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ExchangeError {
    /// Returns true if resending the same command may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Transport(err) => err.is_transient(),
            ExchangeError::Protocol(_) => true,
        }
    }
}

/// Convenience alias for results of public driver operations.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors surfaced by the public driver operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The command could not be completed within the retry budget.
    #[error("{opcode} command failed after {attempts} attempt(s): {last_error}")]
    CommandFailed {
        /// Opcode of the command that failed.
        opcode: Opcode,
        /// Number of attempts made, including the first one.
        attempts: u32,
        /// The failure observed on the final attempt.
        last_error: ExchangeError,
    },

    /// The operation is not valid in the current state.
    #[error("Cannot {operation} while {from}")]
    InvalidStateTransition {
        /// State the controller was in.
        from: DeviceState,
        /// The refused operation.
        operation: &'static str,
    },

    /// The controller is faulted and only accepts `stop_load`.
    #[error("Device is faulted, {operation} refused; call stop_load to recover")]
    Faulted {
        /// The refused operation.
        operation: &'static str,
    },

    /// The session is over: the device disconnected or was closed.
    #[error("Device disconnected")]
    Disconnected,

    /// A caller supplied value is out of range for the instrument.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A non-retryable transport failure, typically while opening.
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// The worker running a blocking operation for the async facade died.
    #[error("Worker task failed: {0}")]
    TaskFailed(String),
}

impl DeviceError {
    /// Returns true if the session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeviceError::Disconnected | DeviceError::Transport(TransportError::DeviceDisconnected)
        )
    }
}

impl From<TransportError> for DeviceError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::DeviceDisconnected => DeviceError::Disconnected,
            other => DeviceError::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transport_errors() {
        assert!(TransportError::Timeout { timeout_ms: 5 }.is_transient());
        assert!(TransportError::TransferError("stall".into()).is_transient());
        assert!(!TransportError::DeviceDisconnected.is_transient());
        assert!(!TransportError::DeviceNotFound("none".into()).is_transient());
    }

    #[test]
    fn protocol_failures_are_always_transient() {
        let err: ExchangeError = ProtocolError::malformed("short").into();
        assert!(err.is_transient());
        let err: ExchangeError = TransportError::DeviceDisconnected.into();
        assert!(!err.is_transient());
    }

    #[test]
    fn disconnect_converts_to_device_disconnected() {
        let err: DeviceError = TransportError::DeviceDisconnected.into();
        assert_eq!(err, DeviceError::Disconnected);
        assert!(err.is_fatal());

        let err: DeviceError = TransportError::OpenFailed("busy".into()).into();
        assert!(matches!(err, DeviceError::Transport(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn messages_name_the_failure() {
        let err = DeviceError::CommandFailed {
            opcode: Opcode::Status,
            attempts: 4,
            last_error: TransportError::Timeout { timeout_ms: 1000 }.into(),
        };
        assert_eq!(
            err.to_string(),
            "status command failed after 4 attempt(s): Timeout after 1000ms"
        );

        let err = ProtocolError::UnexpectedOpcode {
            expected: Some(0x73),
            actual: 0x63,
        };
        assert_eq!(err.to_string(), "Unexpected opcode 0x63 (expected 0x73)");

        let err = DeviceError::InvalidStateTransition {
            from: DeviceState::Running,
            operation: "start_load",
        };
        assert_eq!(err.to_string(), "Cannot start_load while running");
    }
}

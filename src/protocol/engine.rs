//! Request/response engine with bounded retries.
//!
//! The engine owns the transport and runs one exchange at a time: encode,
//! send, wait for the reply, decode, check that it echoes the command. A
//! transient failure (timeout, transfer error, corrupt or mismatched reply)
//! is retried after the policy's backoff, with stale input drained first. A
//! disconnect ends the exchange immediately.
//!
//! An exchange that gives up may still get its reply later. Every status
//! reply carries the same echo, so such a frame would pass as the answer to
//! the next command; after any failed exchange the next one drains the IN
//! pipe before it sends.
//!
//! Retries resend the exact same frame, so every command must be idempotent.
//! Identify and status are: a status command carries the complete load
//! setting, not a delta.

use std::thread;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

use super::{Command, FrameCodec, Opcode, ResponseFrame};
use crate::error::{DeviceError, DeviceResult, ExchangeError, ProtocolError, TransportError};
use crate::error_recovery::RetryPolicy;
use crate::transport::Transport;

/// Outcome of the most recent exchange, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeReport {
    /// Command that was exchanged.
    pub opcode: Opcode,
    /// Attempts used, including the first.
    pub attempts: u32,
    /// Whether a valid reply was eventually received.
    pub succeeded: bool,
}

struct PendingRequest {
    opcode: Opcode,
    frame: Vec<u8>,
    reply_len: usize,
    attempt: u32,
}

/// Serializes commands over a [`Transport`].
#[derive(Debug)]
pub struct ProtocolEngine<T: Transport> {
    transport: T,
    codec: FrameCodec,
    policy: RetryPolicy,
    last_exchange: Option<ExchangeReport>,
    needs_drain: bool,
}

impl<T: Transport> ProtocolEngine<T> {
    /// Create an engine over `transport`.
    pub fn new(transport: T, codec: FrameCodec, policy: RetryPolicy) -> Self {
        Self {
            transport,
            codec,
            policy,
            last_exchange: None,
            needs_drain: false,
        }
    }

    /// Run one exchange with the configured timeout and retry count.
    pub fn execute(&mut self, command: &Command) -> DeviceResult<ResponseFrame> {
        let timeout = self.policy.timeout;
        let retries = self.policy.max_retries;
        self.execute_with(command, timeout, retries)
    }

    /// Run one exchange with an explicit timeout and retry count.
    ///
    /// Makes at most `max_retries + 1` attempts. On exhaustion the error
    /// carries the failure seen on the final attempt.
    #[instrument(skip(self, command), fields(opcode = %command.opcode()))]
    pub fn execute_with(
        &mut self,
        command: &Command,
        timeout: Duration,
        max_retries: u32,
    ) -> DeviceResult<ResponseFrame> {
        let opcode = command.opcode();
        let mut request = PendingRequest {
            opcode,
            frame: self.codec.encode(command),
            reply_len: self.codec.response_len(opcode),
            attempt: 0,
        };
        let budget = max_retries.saturating_add(1);

        if self.needs_drain {
            self.discard_stale(opcode, 0)?;
            self.needs_drain = false;
        }

        loop {
            request.attempt += 1;
            let failure = match self.attempt(&request, timeout) {
                Ok(frame) => {
                    self.record(opcode, request.attempt, true);
                    if request.attempt > 1 {
                        debug!(attempts = request.attempt, "exchange recovered after retry");
                    }
                    return Ok(frame);
                }
                Err(err) => err,
            };

            if !failure.is_transient() {
                self.record(opcode, request.attempt, false);
                return Err(match failure {
                    ExchangeError::Transport(err) => DeviceError::from(err),
                    protocol => DeviceError::CommandFailed {
                        opcode,
                        attempts: request.attempt,
                        last_error: protocol,
                    },
                });
            }

            if request.attempt >= budget {
                self.record(opcode, request.attempt, false);
                warn!(attempts = request.attempt, error = %failure, "exchange failed, retries exhausted");
                return Err(DeviceError::CommandFailed {
                    opcode,
                    attempts: request.attempt,
                    last_error: failure,
                });
            }

            warn!(
                attempt = request.attempt,
                max_attempts = budget,
                error = %failure,
                "exchange failed, retrying"
            );
            if !self.policy.backoff_delay.is_zero() {
                thread::sleep(self.policy.backoff_delay);
            }
            self.discard_stale(opcode, request.attempt)?;
        }
    }

    fn discard_stale(&mut self, opcode: Opcode, attempts: u32) -> DeviceResult<()> {
        match self.transport.drain(self.codec.max_response_len()) {
            Ok(0) => {}
            Ok(discarded) => debug!(discarded, "drained stale frames"),
            Err(TransportError::DeviceDisconnected) => {
                self.record(opcode, attempts, false);
                return Err(DeviceError::Disconnected);
            }
            Err(err) => trace!(error = %err, "drain failed, sending anyway"),
        }
        Ok(())
    }

    fn attempt(&mut self, request: &PendingRequest, timeout: Duration) -> Result<ResponseFrame, ExchangeError> {
        trace!(attempt = request.attempt, frame = ?request.frame, "sending");
        self.transport.send(&request.frame)?;
        let bytes = self.transport.receive(request.reply_len, timeout)?;
        let frame = self.codec.decode(&bytes)?;
        if frame.opcode() != request.opcode {
            return Err(ProtocolError::UnexpectedOpcode {
                expected: Some(request.opcode.echo()),
                actual: frame.opcode().echo(),
            }
            .into());
        }
        Ok(frame)
    }

    fn record(&mut self, opcode: Opcode, attempts: u32, succeeded: bool) {
        self.needs_drain |= !succeeded;
        self.last_exchange = Some(ExchangeReport {
            opcode,
            attempts,
            succeeded,
        });
    }

    /// Outcome of the most recent exchange, if any.
    pub fn last_exchange(&self) -> Option<ExchangeReport> {
        self.last_exchange
    }

    /// Retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Codec in use.
    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Close the transport. Idempotent.
    pub fn close_transport(&mut self) -> Result<(), TransportError> {
        if self.transport.is_open() {
            self.transport.close()
        } else {
            Ok(())
        }
    }
}

//! Scripted transport for unit tests.
//!
//! Each `send` consumes the next [`Reply`] from the script and queues whatever
//! it describes for later `receive` calls. An empty queue reads as a timeout,
//! returned immediately so tests do not sleep.
//!
//! # Example
//!
//! ```rust
//! use rust_cba::transport::{MockTransport, Reply, Transport};
//! use std::time::Duration;
//!
//! let (mut mock, handle) = MockTransport::new();
//! handle.push(Reply::Frame(vec![0x73, 0x00]));
//! mock.send(&[0x53]).unwrap();
//! assert_eq!(mock.receive(64, Duration::from_millis(10)).unwrap(), vec![0x73, 0x00]);
//! assert_eq!(handle.writes(), vec![vec![0x53]]);
//! ```

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::Transport;
use crate::error::TransportError;

/// What the fake device does in response to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Answer with these bytes.
    Frame(Vec<u8>),
    /// Never answer.
    Silence,
    /// Answer after the host has given up: the first read times out and the
    /// frame is left waiting for the next one.
    Late(Vec<u8>),
    /// The read fails with this error.
    Fail(TransportError),
    /// The write itself fails with this error.
    SendFail(TransportError),
}

#[derive(Debug)]
enum Inbound {
    Frame(Vec<u8>),
    Timeout,
    Error(TransportError),
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<Reply>,
    inbox: VecDeque<Inbound>,
    writes: Vec<Vec<u8>>,
    receives: usize,
    closed: bool,
}

/// Transport whose device side is a script.
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Test-side view of a [`MockTransport`], usable after the transport has been
/// moved into a driver.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a transport with an empty script, plus its handle.
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockHandle { state },
        )
    }

    /// Create a transport with a prepared script.
    pub fn with_script(replies: impl IntoIterator<Item = Reply>) -> (Self, MockHandle) {
        let (mock, handle) = Self::new();
        for reply in replies {
            handle.push(reply);
        }
        (mock, handle)
    }
}

impl Transport for MockTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::DeviceDisconnected);
        }
        state.writes.push(frame.to_vec());
        match state.script.pop_front().unwrap_or(Reply::Silence) {
            Reply::Frame(bytes) => state.inbox.push_back(Inbound::Frame(bytes)),
            Reply::Silence => {}
            Reply::Late(bytes) => {
                state.inbox.push_back(Inbound::Timeout);
                state.inbox.push_back(Inbound::Frame(bytes));
            }
            Reply::Fail(err) => state.inbox.push_back(Inbound::Error(err)),
            Reply::SendFail(err) => return Err(err),
        }
        Ok(())
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::DeviceDisconnected);
        }
        state.receives += 1;
        let timed_out = TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        };
        match state.inbox.pop_front() {
            Some(Inbound::Frame(mut bytes)) => {
                bytes.truncate(max_len);
                Ok(bytes)
            }
            Some(Inbound::Error(err)) => Err(err),
            Some(Inbound::Timeout) | None => Err(timed_out),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.state.lock().closed = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.state.lock().closed
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

impl MockHandle {
    /// Append a reply to the script.
    pub fn push(&self, reply: Reply) {
        self.state.lock().script.push_back(reply);
    }

    /// Every frame written so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    /// Number of frames written so far.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    /// Number of `receive` calls so far, including those that failed.
    pub fn receive_count(&self) -> usize {
        self.state.lock().receives
    }

    /// Script entries not yet consumed.
    pub fn remaining(&self) -> usize {
        self.state.lock().script.len()
    }

    /// Whether the transport was closed, by the driver or by [`unplug`](Self::unplug).
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Simulate the device going away.
    pub fn unplug(&self) {
        self.state.lock().closed = true;
    }
}

//! Scripted transport for testing drivers without hardware.
//!
//! Every clone of a [`MockTransport`] shares the same state, so a test keeps
//! one handle for scripting and inspection while the driver owns another.
//! It provides:
//! - Queued responses, returned in order by `read_response`
//! - Standing replies triggered by a written command (e.g. `*IDN?`)
//! - A write log for verifying exactly what reached the "instrument"
//! - Controllable failure injection

use super::{Connector, Transport};
use crate::address::ResourceDescriptor;
use crate::error::{DriverError, DriverResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    responses: VecDeque<Vec<u8>>,
    replies: Vec<(String, Vec<u8>)>,
    written: Vec<Vec<u8>>,
    timeout: Duration,
    fail_next: bool,
    closed: bool,
    close_count: usize,
}

/// Mock instrument transport.
///
/// # Example
///
/// ```
/// use lab_instruments::transport::MockTransport;
///
/// let mock = MockTransport::new("GPIB0::12::INSTR");
/// mock.reply_to("*IDN?", "ACME,Model1,SN1,1.0");
/// mock.push_response("1.5");
/// assert!(mock.written().is_empty());
/// ```
#[derive(Clone)]
pub struct MockTransport {
    resource_name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Open mock with a 3 s timeout and nothing scripted.
    pub fn new(resource_name: impl Into<String>) -> Self {
        let state = MockState {
            timeout: Duration::from_secs(3),
            ..MockState::default()
        };
        Self {
            resource_name: resource_name.into(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a response for the next read.
    pub fn push_response(&self, response: impl Into<Vec<u8>>) {
        self.state().responses.push_back(response.into());
    }

    /// Answers `response` every time a message equal to `command` is written.
    pub fn reply_to(&self, command: impl Into<String>, response: impl Into<Vec<u8>>) {
        self.state().replies.push((command.into(), response.into()));
    }

    /// Makes the next write or read fail with an I/O error.
    pub fn inject_next_failure(&self) {
        self.state().fail_next = true;
    }

    /// Messages written so far, terminators stripped.
    pub fn written(&self) -> Vec<String> {
        self.state()
            .written
            .iter()
            .map(|w| String::from_utf8_lossy(w).trim_end().to_string())
            .collect()
    }

    /// Raw bytes written so far.
    pub fn written_bytes(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    /// Forgets the write log.
    pub fn clear_written(&self) {
        self.state().written.clear();
    }

    /// Responses queued but not read yet.
    pub fn pending_responses(&self) -> usize {
        self.state().responses.len()
    }

    /// True once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// How many times `close` has been called on any clone.
    pub fn close_count(&self) -> usize {
        self.state().close_count
    }

    fn check(&self, state: &mut MockState) -> DriverResult<()> {
        if state.closed {
            return Err(DriverError::NotConnected(self.resource_name.clone()));
        }
        if std::mem::take(&mut state.fail_next) {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "Injected failure").into());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    async fn write_bytes(&mut self, data: &[u8]) -> DriverResult<()> {
        let mut state = self.state();
        self.check(&mut state)?;
        state.written.push(data.to_vec());

        let message = String::from_utf8_lossy(data);
        let message = message.trim_end();
        let reply = state
            .replies
            .iter()
            .find(|(command, _)| command == message)
            .map(|(_, reply)| reply.clone());
        if let Some(reply) = reply {
            state.responses.push_back(reply);
        }
        Ok(())
    }

    async fn read_response(&mut self) -> DriverResult<Vec<u8>> {
        let mut state = self.state();
        self.check(&mut state)?;
        let timeout = state.timeout;
        state.responses.pop_front().ok_or(DriverError::Timeout {
            operation: format!("read from {}", self.resource_name),
            timeout,
        })
    }

    fn timeout(&self) -> Duration {
        self.state().timeout
    }

    async fn set_timeout(&mut self, timeout: Duration) -> DriverResult<()> {
        self.state().timeout = timeout;
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        let mut state = self.state();
        state.closed = true;
        state.close_count += 1;
        Ok(())
    }
}

/// Connector handing out pre-registered [`MockTransport`]s by address.
#[derive(Clone, Default)]
pub struct MockConnector {
    transports: Arc<Mutex<HashMap<String, MockTransport>>>,
    connects: Arc<Mutex<Vec<String>>>,
}

impl MockConnector {
    /// Connector with no transports registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `transport` under its resource name and returns a handle to it.
    pub fn register(&self, transport: MockTransport) -> MockTransport {
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(transport.resource_name.clone(), transport.clone());
        transport
    }

    /// Addresses connected so far, in order.
    pub fn connects(&self) -> Vec<String> {
        self.connects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        descriptor: &ResourceDescriptor,
        timeout: Duration,
    ) -> DriverResult<Box<dyn Transport>> {
        let addr = descriptor.addr().to_string();
        self.connects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(addr.clone());

        let transport = self
            .transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .cloned()
            .ok_or_else(|| {
                DriverError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no instrument at {addr}"),
                ))
            })?;

        {
            let mut state = transport.state();
            state.closed = false;
            state.timeout = timeout;
        }
        Ok(Box::new(transport))
    }
}

//! VISA transport for GPIB/USB/Ethernet/PXI instruments.
//!
//! Wraps the visa-rs crate. VISA calls block, so every operation runs on
//! Tokio's blocking pool with the session behind an `Arc<Mutex<_>>`.

use super::Transport;
use crate::block::{parse_header, starts_block, BlockHeader};
use crate::error::{DriverError, DriverResult};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use visa_rs::attribute::{AttrTmoValue, HasAttribute};
use visa_rs::prelude::*;

const READ_CHUNK: usize = 4096;

/// Transport backed by a VISA session.
pub struct VisaTransport {
    resource_name: String,
    instrument: Option<Arc<Mutex<Instrument>>>,
    timeout: Duration,
}

impl VisaTransport {
    /// Opens `resource_name` through the default resource manager.
    pub async fn open(resource_name: &str, timeout: Duration) -> DriverResult<Self> {
        let name = resource_name.to_string();
        let instrument = tokio::task::spawn_blocking(move || -> DriverResult<Instrument> {
            let rm = DefaultRM::new()?;
            let c_name = CString::new(name.clone()).map_err(|e| {
                DriverError::Configuration(format!("invalid resource name '{name}': {e}"))
            })?;
            let instr = rm.open(&c_name.into(), AccessMode::NO_LOCK, timeout)?;
            apply_timeout(&instr, timeout)?;
            Ok(instr)
        })
        .await
        .map_err(|e| DriverError::Io(std::io::Error::other(format!("VISA open task failed: {e}"))))??;

        debug!(
            resource = resource_name,
            timeout_ms = timeout.as_millis() as u64,
            "VISA resource opened"
        );

        Ok(Self {
            resource_name: resource_name.to_string(),
            instrument: Some(Arc::new(Mutex::new(instrument))),
            timeout,
        })
    }

    fn instrument(&self) -> DriverResult<Arc<Mutex<Instrument>>> {
        self.instrument
            .clone()
            .ok_or_else(|| DriverError::NotConnected(self.resource_name.clone()))
    }

    async fn blocking<T, F>(&self, op: F) -> DriverResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Instrument) -> DriverResult<T> + Send + 'static,
    {
        let instrument = self.instrument()?;
        tokio::task::spawn_blocking(move || {
            let mut guard = instrument.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut guard)
        })
        .await
        .map_err(|e| DriverError::Io(std::io::Error::other(format!("VISA I/O task failed: {e}"))))?
    }
}

fn apply_timeout(instr: &Instrument, timeout: Duration) -> DriverResult<()> {
    let ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1);
    let attr = AttrTmoValue::new_checked(ms)
        .ok_or_else(|| DriverError::Configuration(format!("invalid VISA timeout {ms}ms")))?;
    instr.set_attr(attr)?;
    Ok(())
}

fn message_complete(buf: &[u8]) -> DriverResult<bool> {
    if starts_block(buf) {
        let digits = BlockHeader::digit_count(buf)?;
        if digits == 0 {
            return Ok(buf.ends_with(b"\n"));
        }
        if buf.len() < 2 + digits {
            return Ok(false);
        }
        let header = parse_header(buf)?;
        let needed = header.header_len + header.data_len.unwrap_or(0);
        return Ok(buf.len() >= needed);
    }
    Ok(buf.ends_with(b"\n"))
}

#[async_trait]
impl Transport for VisaTransport {
    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    async fn write_bytes(&mut self, data: &[u8]) -> DriverResult<()> {
        let data = data.to_vec();
        self.blocking(move |instr| {
            instr.write_all(&data)?;
            Ok(())
        })
        .await
    }

    async fn read_response(&mut self) -> DriverResult<Vec<u8>> {
        let mut response = self
            .blocking(|instr| {
                let mut response = Vec::new();
                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    let n = instr.read(&mut chunk)?;
                    response.extend_from_slice(&chunk[..n]);
                    if n < READ_CHUNK || message_complete(&response)? {
                        break;
                    }
                }
                Ok(response)
            })
            .await?;

        if !starts_block(&response) {
            while matches!(response.last(), Some(b'\n' | b'\r')) {
                response.pop();
            }
        } else if let Ok(header) = parse_header(&response) {
            if let Some(len) = header.data_len {
                response.truncate(header.header_len + len);
            }
        }
        Ok(response)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn set_timeout(&mut self, timeout: Duration) -> DriverResult<()> {
        self.blocking(move |instr| apply_timeout(instr, timeout)).await?;
        self.timeout = timeout;
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        // Dropping the last reference closes the VISA session.
        if self.instrument.take().is_some() {
            debug!(resource = %self.resource_name, "VISA resource closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_complete() {
        assert!(message_complete(b"1.0\n").unwrap());
        assert!(!message_complete(b"1.0").unwrap());
        assert!(!message_complete(b"#14\x00\x01").unwrap());
        assert!(message_complete(b"#14\x00\x01\x02\x03").unwrap());
        assert!(message_complete(b"#hashtag\n").unwrap());
        assert!(!message_complete(b"#hashtag").unwrap());
    }
}

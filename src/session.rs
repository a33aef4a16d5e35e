//! Message-based session over a [`Transport`].
//!
//! `MessageSession` adds what instrument drivers actually speak on top of raw
//! bytes: terminated text messages, comma separated ASCII values and
//! IEEE-488.2 binary blocks. Every call is logged against the span of the
//! owning driver:
//!
//! ```text
//! << FREQ?          outgoing message
//! >> 1.0E+06        text response
//! >> <2000 results> value responses
//! ```
//!
//! Transport failures are logged at `error` together with the request and
//! returned unchanged.

use crate::block::{decode_block, encode_block, BinaryFormat};
use crate::error::{DriverError, DriverResult};
use crate::transport::Transport;
use std::time::Duration;
use tracing::{debug, error, Span};

const WRITE_TERMINATION: &str = "\n";
const SEPARATOR: &str = ",";

/// Logged message exchange with one instrument.
pub struct MessageSession {
    transport: Box<dyn Transport>,
    span: Span,
}

impl MessageSession {
    /// Session over `transport`, logging under `span`.
    pub fn new(transport: Box<dyn Transport>, span: Span) -> Self {
        Self { transport, span }
    }

    /// Resource string of the transport.
    pub fn resource_name(&self) -> &str {
        self.transport.resource_name()
    }

    /// Current I/O timeout.
    pub fn timeout(&self) -> Duration {
        self.transport.timeout()
    }

    /// Span of the owning driver; events about this instrument attach here.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Sets the I/O timeout in seconds.
    pub async fn set_timeout_secs(&mut self, seconds: f64) -> DriverResult<()> {
        let timeout = timeout_from_secs(seconds)?;
        self.transport.set_timeout(timeout).await
    }

    /// Sends `message` with a newline terminator.
    pub async fn write(&mut self, message: &str) -> DriverResult<()> {
        self.log_out(message);
        let result = self.send(message.as_bytes()).await;
        self.on_failure(message, result)
    }

    /// Sends `message` and returns the trimmed text reply.
    pub async fn query(&mut self, message: &str) -> DriverResult<String> {
        self.log_out(message);
        let result = self.exchange(message).await;
        let raw = self.on_failure(message, result)?;
        let response = String::from_utf8_lossy(&raw).into_owned();
        debug!(parent: &self.span, resource = %self.resource_name(), ">> {}", response);
        Ok(response)
    }

    /// Queries and parses a comma separated list of numbers.
    pub async fn query_ascii_values(&mut self, message: &str) -> DriverResult<Vec<f64>> {
        self.log_out(message);
        let result = self.exchange(message).await;
        let raw = self.on_failure(message, result)?;
        let values = parse_ascii_values(&String::from_utf8_lossy(&raw))?;
        self.log_results(values.len());
        Ok(values)
    }

    /// Queries and decodes an IEEE-488.2 binary block.
    pub async fn query_binary_values(
        &mut self,
        message: &str,
        format: BinaryFormat,
    ) -> DriverResult<Vec<f64>> {
        self.log_out(message);
        let result = self.exchange(message).await;
        let raw = self.on_failure(message, result)?;
        let start = raw
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(raw.len());
        let values = decode_block(&raw[start..], format.datatype, format.big_endian)?;
        self.log_results(values.len());
        Ok(values)
    }

    /// Writes `message` followed by `values` separated by commas.
    pub async fn write_ascii_values(&mut self, message: &str, values: &[f64]) -> DriverResult<()> {
        let log_msg = format!("{message}<{} values>", values.len());
        self.log_out(&log_msg);
        let joined = values
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(SEPARATOR);
        let result = self.send(format!("{message}{joined}").as_bytes()).await;
        self.on_failure(&log_msg, result)
    }

    /// Writes `message` followed by `values` as a definite-length binary block.
    pub async fn write_binary_values(
        &mut self,
        message: &str,
        values: &[f64],
        format: BinaryFormat,
    ) -> DriverResult<()> {
        let (block, header) = encode_block(values, format.datatype, format.big_endian)?;
        let log_msg = format!("{message}{header}<DATABLOCK>");
        self.log_out(&log_msg);
        let mut data = Vec::with_capacity(message.len() + block.len());
        data.extend_from_slice(message.as_bytes());
        data.extend_from_slice(&block);
        let result = self.send(&data).await;
        self.on_failure(&log_msg, result)
    }

    /// Closes the underlying transport.
    pub async fn close(&mut self) -> DriverResult<()> {
        debug!(parent: &self.span, resource = %self.resource_name(), "Closing session");
        self.transport.close().await
    }

    async fn send(&mut self, data: &[u8]) -> DriverResult<()> {
        let mut out = Vec::with_capacity(data.len() + WRITE_TERMINATION.len());
        out.extend_from_slice(data);
        out.extend_from_slice(WRITE_TERMINATION.as_bytes());
        self.transport.write_bytes(&out).await
    }

    async fn exchange(&mut self, message: &str) -> DriverResult<Vec<u8>> {
        self.send(message.as_bytes()).await?;
        self.transport.read_response().await
    }

    fn log_out(&self, message: &str) {
        debug!(parent: &self.span, resource = %self.resource_name(), "<< {}", message);
    }

    fn log_results(&self, count: usize) {
        debug!(parent: &self.span, resource = %self.resource_name(), ">> <{} results>", count);
    }

    fn on_failure<T>(&self, message: &str, result: DriverResult<T>) -> DriverResult<T> {
        if let Err(e) = &result {
            error!(
                parent: &self.span,
                resource = %self.resource_name(),
                error = %e,
                "<< {}",
                message
            );
        }
        result
    }
}

/// Converts a timeout in seconds to the transport's millisecond resolution.
pub fn timeout_from_secs(seconds: f64) -> DriverResult<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(DriverError::Configuration(format!(
            "timeout must be a positive number of seconds, got {seconds}"
        )));
    }
    Ok(Duration::from_millis((seconds * 1000.0).round() as u64))
}

fn parse_ascii_values(response: &str) -> DriverResult<Vec<f64>> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(SEPARATOR)
        .map(|field| {
            let field = field.trim();
            field
                .parse::<f64>()
                .map_err(|_| DriverError::parse(format!("'{field}' is not a number")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockDataType;
    use crate::transport::MockTransport;
    use tracing_test::traced_test;

    fn session(mock: &MockTransport) -> MessageSession {
        MessageSession::new(Box::new(mock.clone()), tracing::info_span!("session"))
    }

    #[tokio::test]
    async fn test_write_appends_terminator() {
        let mock = MockTransport::new("GPIB0::3::INSTR");
        let mut s = session(&mock);
        s.write("*RST").await.unwrap();
        assert_eq!(mock.written_bytes(), vec![b"*RST\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_query_ascii_values() {
        let mock = MockTransport::new("GPIB0::3::INSTR");
        mock.push_response("1.5, -2e-3,4");
        let mut s = session(&mock);
        let values = s.query_ascii_values("TRAC?").await.unwrap();
        assert_eq!(values, vec![1.5, -0.002, 4.0]);
    }

    #[tokio::test]
    async fn test_query_ascii_values_rejects_text() {
        let mock = MockTransport::new("GPIB0::3::INSTR");
        mock.push_response("SIN");
        let mut s = session(&mock);
        let err = s.query_ascii_values("FUNC?").await.unwrap_err();
        assert!(matches!(err, DriverError::Parse(_)));
    }

    #[tokio::test]
    async fn test_binary_values_both_ways() {
        let mock = MockTransport::new("GPIB0::3::INSTR");
        let mut s = session(&mock);
        let format = BinaryFormat::new(BlockDataType::I16, true);

        s.write_binary_values("DATA:DAC VOLATILE,", &[1.0, -1.0], format)
            .await
            .unwrap();
        assert_eq!(
            mock.written_bytes()[0],
            b"DATA:DAC VOLATILE,#14\x00\x01\xff\xff\n".to_vec()
        );

        mock.push_response(b"#14\x00\x02\x00\x03".to_vec());
        let values = s.query_binary_values("CURV?", format).await.unwrap();
        assert_eq!(values, vec![2.0, 3.0]);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_failures_are_logged_and_returned() {
        let mock = MockTransport::new("GPIB0::3::INSTR");
        let mut s = session(&mock);
        let err = s.query("VOLT?").await.unwrap_err();
        assert!(err.is_transport());
        assert!(logs_contain("<< VOLT?"));
    }

    #[test]
    fn test_timeout_conversion() {
        assert_eq!(timeout_from_secs(3.0).unwrap(), Duration::from_millis(3000));
        assert_eq!(timeout_from_secs(0.25).unwrap(), Duration::from_millis(250));
        assert!(timeout_from_secs(0.0).is_err());
    }
}

//! Raw TCP socket transport (`TCPIP0::host::port::SOCKET`).
//!
//! Most LAN instruments expose SCPI on a plain socket (port 5025 for Keysight,
//! 5555 for Rigol, ...). Responses are newline terminated, except binary
//! blocks which are length-prefixed.

use super::Transport;
use crate::block::{parse_header, BlockHeader};
use crate::error::{DriverError, DriverResult};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

const READ_TERMINATOR: u8 = b'\n';

/// Transport over a raw TCP socket.
pub struct SocketTransport {
    resource_name: String,
    stream: Option<BufReader<TcpStream>>,
    timeout: Duration,
}

impl SocketTransport {
    /// Connects to `host:port`, failing after `timeout`.
    pub async fn connect(
        resource_name: &str,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> DriverResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| DriverError::Timeout {
                operation: format!("connect to {host}:{port}"),
                timeout,
            })??;
        stream.set_nodelay(true)?;

        debug!(resource = resource_name, "Socket transport connected");

        Ok(Self {
            resource_name: resource_name.to_string(),
            stream: Some(BufReader::new(stream)),
            timeout,
        })
    }

    fn stream(&mut self) -> DriverResult<&mut BufReader<TcpStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| DriverError::NotConnected(self.resource_name.clone()))
    }

    async fn with_timeout<T>(
        timeout: Duration,
        operation: &str,
        fut: impl Future<Output = DriverResult<T>>,
    ) -> DriverResult<T> {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| DriverError::Timeout {
                operation: operation.to_string(),
                timeout,
            })?
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    async fn write_bytes(&mut self, data: &[u8]) -> DriverResult<()> {
        let timeout = self.timeout;
        let stream = self.stream()?.get_mut();
        Self::with_timeout(timeout, "socket write", async {
            stream.write_all(data).await?;
            stream.flush().await?;
            Ok(())
        })
        .await
    }

    async fn read_response(&mut self) -> DriverResult<Vec<u8>> {
        let timeout = self.timeout;
        let stream = self.stream()?;
        Self::with_timeout(timeout, "socket read", read_message(stream)).await
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn set_timeout(&mut self, timeout: Duration) -> DriverResult<()> {
        self.timeout = timeout;
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.get_mut().shutdown().await?;
            debug!(resource = %self.resource_name, "Socket transport closed");
        }
        Ok(())
    }
}

async fn read_message(stream: &mut BufReader<TcpStream>) -> DriverResult<Vec<u8>> {
    // A terminator left behind by a previous block response is not a message.
    let first = loop {
        match peek(stream).await? {
            Some(READ_TERMINATOR) => stream.consume(1),
            Some(b) => break b,
            None => return Err(closed_by_instrument()),
        }
    };
    if first != b'#' {
        return read_line(stream, Vec::new()).await;
    }

    stream.consume(1);
    match peek(stream).await? {
        Some(d) if d.is_ascii_digit() => read_block(stream).await,
        _ => read_line(stream, vec![b'#']).await,
    }
}

async fn peek(stream: &mut BufReader<TcpStream>) -> DriverResult<Option<u8>> {
    Ok(stream.fill_buf().await?.first().copied())
}

fn closed_by_instrument() -> DriverError {
    std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed by instrument",
    )
    .into()
}

/// Reads up to the terminator, appending to `line`.
async fn read_line(stream: &mut BufReader<TcpStream>, mut line: Vec<u8>) -> DriverResult<Vec<u8>> {
    stream.read_until(READ_TERMINATOR, &mut line).await?;
    if line.last() == Some(&READ_TERMINATOR) {
        line.pop();
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

/// Reads a block whose `#` was already consumed. The payload is read
/// incrementally, so a bogus length field cannot force a large allocation.
async fn read_block(stream: &mut BufReader<TcpStream>) -> DriverResult<Vec<u8>> {
    let mut block = vec![b'#', 0];
    stream.read_exact(&mut block[1..]).await?;
    let digits = BlockHeader::digit_count(&block)?;
    if digits == 0 {
        return read_line(stream, block).await;
    }

    let mut len_field = vec![0u8; digits];
    stream.read_exact(&mut len_field).await?;
    block.extend_from_slice(&len_field);
    let data_len = parse_header(&block)?.data_len.unwrap_or(0);

    let start = block.len();
    (&mut *stream)
        .take(data_len as u64)
        .read_to_end(&mut block)
        .await?;
    let received = block.len() - start;
    if received < data_len {
        return Err(DriverError::Block(format!(
            "header declares {data_len} bytes but the instrument sent {received}"
        )));
    }

    if stream.buffer().first() == Some(&READ_TERMINATOR) {
        stream.consume(1);
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Loop-back peer that sends `reply` once and hangs up.
    async fn serve_once(reply: &'static [u8]) -> SocketTransport {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(reply).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        let resource = format!("TCPIP0::127.0.0.1::{port}::SOCKET");
        SocketTransport::connect(&resource, "127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_text_reply_starting_with_hash() {
        let mut transport = serve_once(b"#hashtag\r\n").await;
        assert_eq!(transport.read_response().await.unwrap(), b"#hashtag".to_vec());
    }

    #[tokio::test]
    async fn test_block_reply_skips_trailing_terminator() {
        let mut transport = serve_once(b"#13\x01\n\x02\n1.5\n").await;
        assert_eq!(transport.read_response().await.unwrap(), b"#13\x01\n\x02".to_vec());
        assert_eq!(transport.read_response().await.unwrap(), b"1.5".to_vec());
    }

    #[tokio::test]
    async fn test_oversized_block_header_is_rejected() {
        let mut transport = serve_once(b"#9999999999\x01\x02\n").await;
        let err = transport.read_response().await.unwrap_err();
        assert!(matches!(err, DriverError::Block(_)), "{err}");
    }
}

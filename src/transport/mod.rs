//! Low-level instrument transports.
//!
//! A [`Transport`] moves raw bytes to and from one instrument and knows where
//! a response ends. Everything message-shaped (terminators, ASCII value lists,
//! binary blocks, logging) lives one layer up in [`crate::session`].
//!
//! Transports are opened by a [`Connector`] from a parsed
//! [`ResourceDescriptor`]. The [`DefaultConnector`] handles:
//! - `TCPIP[n]::host::port::SOCKET` through [`SocketTransport`]
//! - every other VISA resource through `VisaTransport` (feature `instrument_visa`)
//!
//! Vendor resources (ATS, ZI, OTHER) have no generic transport; their drivers
//! talk to the vendor API directly.

use crate::address::ResourceDescriptor;
use crate::error::{DriverError, DriverResult};
use async_trait::async_trait;
use std::time::Duration;

pub mod mock;
pub mod socket;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use mock::{MockConnector, MockTransport};
pub use socket::SocketTransport;
#[cfg(feature = "instrument_visa")]
pub use visa::VisaTransport;

/// Raw byte channel to a single instrument.
///
/// A transport is exclusively owned by one driver, which opens it once and
/// closes it once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resource string the transport was opened with.
    fn resource_name(&self) -> &str;

    /// Sends `data` as-is; the caller appends any write terminator.
    async fn write_bytes(&mut self, data: &[u8]) -> DriverResult<()>;

    /// Reads one complete response without its trailing terminator.
    ///
    /// A response starting with `#` and a length digit is read as an
    /// IEEE-488.2 block, so the payload may contain terminator bytes.
    async fn read_response(&mut self) -> DriverResult<Vec<u8>>;

    /// Current I/O timeout.
    fn timeout(&self) -> Duration;

    /// Changes the I/O timeout.
    async fn set_timeout(&mut self, timeout: Duration) -> DriverResult<()>;

    /// Releases the underlying handle. Further I/O fails with `NotConnected`.
    async fn close(&mut self) -> DriverResult<()>;
}

/// Opens transports for parsed resource descriptors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a transport for `descriptor`, failing after `timeout`.
    async fn connect(
        &self,
        descriptor: &ResourceDescriptor,
        timeout: Duration,
    ) -> DriverResult<Box<dyn Transport>>;
}

/// Connector used outside of tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        descriptor: &ResourceDescriptor,
        timeout: Duration,
    ) -> DriverResult<Box<dyn Transport>> {
        if let Some((host, port)) = descriptor.socket_endpoint() {
            let transport = SocketTransport::connect(descriptor.addr(), &host, port, timeout).await?;
            return Ok(Box::new(transport));
        }

        match descriptor {
            ResourceDescriptor::Visa { addr } | ResourceDescriptor::Pxi { addr, .. } => {
                open_visa(addr, timeout).await
            }
            other => Err(DriverError::Unsupported(format!(
                "{} resources have no generic transport ({})",
                other.kind(),
                other.addr()
            ))),
        }
    }
}

#[cfg(feature = "instrument_visa")]
async fn open_visa(addr: &str, timeout: Duration) -> DriverResult<Box<dyn Transport>> {
    let transport = VisaTransport::open(addr, timeout).await?;
    Ok(Box::new(transport))
}

#[cfg(not(feature = "instrument_visa"))]
async fn open_visa(_addr: &str, _timeout: Duration) -> DriverResult<Box<dyn Transport>> {
    Err(DriverError::FeatureNotEnabled("instrument_visa".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::parse_resource_name;

    #[tokio::test]
    async fn test_vendor_resources_have_no_generic_transport() {
        let desc = parse_resource_name("ZI::HDAWG::DEV8123");
        let err = DefaultConnector
            .connect(&desc, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DriverError::Unsupported(_)));
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_visa_requires_feature() {
        let desc = parse_resource_name("GPIB0::12::INSTR");
        let err = DefaultConnector
            .connect(&desc, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DriverError::FeatureNotEnabled(_)));
    }
}

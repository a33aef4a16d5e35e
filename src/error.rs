//! Custom error types for the instrument layer.
//!
//! `DriverError` is the single error type returned by every driver, transport
//! and manager operation. Transport failures are logged where they happen and
//! then propagated unchanged through this enum. Instrument-reported errors are
//! not errors in this sense: they are collected by [`crate::driver::Driver::errors`]
//! and returned as data.
//!
//! By using `#[from]`, `DriverError` can be created from the underlying I/O and
//! configuration errors with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Error of every driver, transport and manager operation.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An instrument did not answer in time.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// What was attempted.
        operation: String,
        /// Limit that expired.
        timeout: Duration,
    },

    /// The transport was already closed.
    #[error("Transport for '{0}' is not open")]
    NotConnected(String),

    /// A command template could not be filled.
    #[error("Cannot format command template '{template}': {source}")]
    Template {
        /// The template text.
        template: String,
        /// Formatter failure, usually a missing field.
        #[source]
        source: strfmt::FmtError,
    },

    /// A reply did not have the expected form.
    #[error("Cannot parse instrument response: {0}")]
    Parse(String),

    /// A binary block was malformed or truncated.
    #[error("Malformed IEEE-488.2 block: {0}")]
    Block(String),

    /// A value does not fit the quantity.
    #[error("Invalid value for quantity '{quantity}': {reason}")]
    InvalidValue {
        /// Quantity name.
        quantity: String,
        /// Why the value was refused.
        reason: String,
    },

    /// No factory is registered under this name.
    #[error("Unknown driver '{0}'")]
    UnknownDriver(String),

    /// No record has this name.
    #[error("Unknown instrument '{0}'")]
    UnknownInstrument(String),

    /// The `*IDN?` reply was unusable.
    #[error("Identification of '{addr}' failed: {reason}")]
    Identification {
        /// Instrument address.
        addr: String,
        /// What was wrong with the reply.
        reason: String,
    },

    /// The driver or transport cannot do this.
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// A vendor SDK call failed.
    #[error("Vendor API error: {0}")]
    Vendor(String),

    /// The configuration could not be read.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The configuration was read but is invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Needs a cargo feature this build lacks.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// The VISA library reported an error.
    #[cfg(feature = "instrument_visa")]
    #[error("VISA error: {0}")]
    Visa(#[from] visa_rs::Error),
}

impl DriverError {
    /// Builds a [`DriverError::Parse`] from anything printable.
    pub fn parse(reason: impl Into<String>) -> Self {
        DriverError::Parse(reason.into())
    }

    /// True for failures raised by the transport itself (I/O, timeouts, closed handles).
    pub fn is_transport(&self) -> bool {
        match self {
            DriverError::Io(_) | DriverError::Timeout { .. } | DriverError::NotConnected(_) => {
                true
            }
            #[cfg(feature = "instrument_visa")]
            DriverError::Visa(_) => true,
            _ => false,
        }
    }
}

//! Quantity-based laboratory instrument drivers.
//!
//! Instruments are described by records (name, address, driver) and opened
//! through the [`manager::DriverManager`], which keeps one driver instance per
//! instrument. A driver exposes named, typed [`quantity::Quantity`] values;
//! SCPI drivers read and write them through command templates, vendor-API
//! drivers override the hooks of [`driver::Driver`].
//!
//! Transport plumbing (VISA, raw sockets) sits behind [`transport::Transport`],
//! and [`block`] encodes IEEE-488.2 definite-length blocks for waveform
//! transfers.

pub mod address;
pub mod block;
pub mod catalog;
pub mod config;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod manager;
pub mod quantity;
pub mod registry;
pub mod scpi;
pub mod session;
pub mod transport;

pub use address::{parse_resource_name, ResourceDescriptor};
pub use driver::{Driver, DriverArgs, DriverConfig, InstrumentError};
pub use error::{DriverError, DriverResult};
pub use manager::{DriverManager, OpenOptions, SharedDriver};
pub use quantity::{CommandContext, Quantity, QuantityKind, QuantityValue};

//! Concrete instrument drivers.
//!
//! SCPI models wrap [`ScpiDriver`](crate::scpi::ScpiDriver) and only add what
//! their command set cannot express as a template. Vendor-API instruments
//! implement [`Driver`](crate::driver::Driver) directly.

pub mod dc_source;
pub mod generic;
pub mod oscilloscope;
pub mod waveform_generator;

pub use dc_source::{ApiResult, DcSource, VoltageApi};
pub use generic::generic_scpi;
pub use oscilloscope::Oscilloscope;
pub use waveform_generator::WaveformGenerator;

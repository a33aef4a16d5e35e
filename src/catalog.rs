//! Instrument records and the lookup used to resolve them by name.

use crate::driver::DriverConfig;
use crate::quantity::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One configured instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRecord {
    /// Unique instrument name.
    pub name: String,
    /// Connection address, see [`crate::address::parse_resource_name`].
    pub address: String,
    /// Registry name of the driver.
    pub driver: String,
    /// I/O timeout in seconds; the configuration default when absent.
    #[serde(default)]
    pub timeout_s: Option<f64>,
    /// Init profile replacing the driver default.
    #[serde(default)]
    pub config: Option<DriverConfig>,
    /// Extra quantities, used by drivers such as `GenericScpi`.
    #[serde(default)]
    pub quantities: Vec<Quantity>,
}

impl InstrumentRecord {
    /// Record with no timeout, profile or extra quantities.
    pub fn new(name: impl Into<String>, address: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            driver: driver.into(),
            timeout_s: None,
            config: None,
            quantities: Vec::new(),
        }
    }
}

/// Read-only source of instrument records.
pub trait InstrumentLookup: Send + Sync {
    /// Record for `name`, if configured.
    fn instrument_by_name(&self, name: &str) -> Option<InstrumentRecord>;

    /// All known instrument names.
    fn instrument_names(&self) -> Vec<String>;
}

/// In-memory lookup table.
#[derive(Debug, Clone, Default)]
pub struct InstrumentTable {
    records: HashMap<String, InstrumentRecord>,
}

impl InstrumentTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `record`, replacing any record with the same name.
    pub fn insert(&mut self, record: InstrumentRecord) {
        self.records.insert(record.name.clone(), record);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, record: InstrumentRecord) -> Self {
        self.insert(record);
        self
    }
}

impl FromIterator<InstrumentRecord> for InstrumentTable {
    fn from_iter<I: IntoIterator<Item = InstrumentRecord>>(iter: I) -> Self {
        let mut table = Self::new();
        for record in iter {
            table.insert(record);
        }
        table
    }
}

impl InstrumentLookup for InstrumentTable {
    fn instrument_by_name(&self, name: &str) -> Option<InstrumentRecord> {
        self.records.get(name).cloned()
    }

    fn instrument_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lookup() {
        let table: InstrumentTable = [
            InstrumentRecord::new("awg1", "GPIB0::10::INSTR", "WaveformGenerator"),
            InstrumentRecord::new("dso", "GPIB0::7::INSTR", "Oscilloscope"),
        ]
        .into_iter()
        .collect();

        assert_eq!(table.instrument_names(), vec!["awg1", "dso"]);
        assert_eq!(table.instrument_by_name("dso").unwrap().driver, "Oscilloscope");
        assert!(table.instrument_by_name("psu").is_none());
    }
}

//! Driver registry.
//!
//! Maps a driver name, as stored in instrument records, to the factory that
//! builds it. Drivers are registered explicitly at startup; there is no
//! loading by name at run time.

use crate::driver::{Driver, DriverArgs};
use crate::drivers::{generic_scpi, Oscilloscope, WaveformGenerator};
use crate::error::{DriverError, DriverResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds an unopened driver from its arguments.
pub type DriverFactory = Arc<dyn Fn(DriverArgs) -> DriverResult<Box<dyn Driver>> + Send + Sync>;

/// Driver factories by name.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver that needs nothing beyond its arguments.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("WaveformGenerator", Arc::new(WaveformGenerator::build));
        registry.register("Oscilloscope", Arc::new(Oscilloscope::build));
        registry.register("GenericScpi", Arc::new(generic_scpi));
        registry
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, factory: DriverFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// True if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds an unopened `name` driver.
    pub fn build(&self, name: &str, args: DriverArgs) -> DriverResult<Box<dyn Driver>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| DriverError::UnknownDriver(name.to_string()))?;
        debug!(parent: &args.span, driver = name, "Loading driver");
        factory(args)
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::parse_resource_name;
    use crate::drivers::{ApiResult, DcSource, VoltageApi};
    use crate::transport::MockConnector;
    use async_trait::async_trait;

    struct NullApi;

    #[async_trait]
    impl VoltageApi for NullApi {
        async fn open(&mut self, _addr: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn set_voltage(&mut self, _volts: f64, _channel: usize) -> ApiResult<()> {
            Ok(())
        }
    }

    fn args() -> DriverArgs {
        DriverArgs::new(parse_resource_name("GPIB0::1::INSTR"), Arc::new(MockConnector::new()))
    }

    #[test]
    fn test_builtin_names() {
        let registry = DriverRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["GenericScpi", "Oscilloscope", "WaveformGenerator"]);
        let driver = registry.build("WaveformGenerator", args()).unwrap();
        assert!(driver.core().has_quantity("Frequency"));
    }

    #[test]
    fn test_unknown_driver() {
        let registry = DriverRegistry::with_builtin();
        assert!(matches!(
            registry.build("Keysight33500B", args()),
            Err(DriverError::UnknownDriver(_))
        ));
    }

    #[test]
    fn test_register_vendor_driver() {
        let mut registry = DriverRegistry::with_builtin();
        registry.register("DCSource", DcSource::factory(|| Box::new(NullApi)));
        assert!(registry.contains("DCSource"));
        let driver = registry.build("DCSource", args()).unwrap();
        assert_eq!(driver.model(), Some("PG_DC"));
    }
}

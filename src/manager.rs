//! Driver manager.
//!
//! Resolves instrument names to records, builds and opens the matching
//! driver, and keeps one shared instance per instrument name. The manager is
//! the only place drivers are closed.

use crate::address::parse_resource_name;
use crate::catalog::{InstrumentLookup, InstrumentRecord};
use crate::config::{DefaultsConfig, LabConfig};
use crate::driver::{Driver, DriverArgs, DriverConfig};
use crate::error::{DriverError, DriverResult};
use crate::registry::DriverRegistry;
use crate::transport::{Connector, DefaultConnector};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn};

/// Open driver shared between callers; the mutex serializes access to the
/// instrument.
pub type SharedDriver = Arc<Mutex<Box<dyn Driver>>>;

/// What to open: a name resolved through the lookup, or a full record.
#[derive(Debug, Clone)]
pub enum InstrumentRef {
    /// Name resolved through the manager's lookup.
    Name(String),
    /// Record used as given.
    Record(InstrumentRecord),
}

impl From<&str> for InstrumentRef {
    fn from(name: &str) -> Self {
        InstrumentRef::Name(name.to_string())
    }
}

impl From<String> for InstrumentRef {
    fn from(name: String) -> Self {
        InstrumentRef::Name(name)
    }
}

impl From<InstrumentRecord> for InstrumentRef {
    fn from(record: InstrumentRecord) -> Self {
        InstrumentRef::Record(record)
    }
}

/// Caller overrides applied on top of the instrument record.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// I/O timeout in seconds.
    pub timeout_s: Option<f64>,
    /// Error queue query.
    pub error_command: Option<String>,
    /// Init profile replacing the record's.
    pub profile: Option<DriverConfig>,
}

impl OpenOptions {
    /// Sets the timeout in seconds.
    pub fn timeout(mut self, seconds: f64) -> Self {
        self.timeout_s = Some(seconds);
        self
    }

    /// Sets the error queue query.
    pub fn error_command(mut self, command: impl Into<String>) -> Self {
        self.error_command = Some(command.into());
        self
    }

    /// Sets the init profile.
    pub fn profile(mut self, profile: DriverConfig) -> Self {
        self.profile = Some(profile);
        self
    }
}

/// Opens instruments by name and keeps one shared driver per name.
///
/// Closing is explicit: [`close`](Self::close) and
/// [`close_all`](Self::close_all) run each driver's close hook. Dropping the
/// manager does not, since closing is async. It only releases the manager's
/// references; a transport is released once the last [`SharedDriver`] clone
/// is gone, and vendor close hooks never run on that path. A manager dropped
/// with instruments still open logs a warning.
pub struct DriverManager {
    registry: DriverRegistry,
    lookup: Arc<dyn InstrumentLookup>,
    connector: Arc<dyn Connector>,
    defaults: DefaultsConfig,
    instruments: IndexMap<String, SharedDriver>,
}

impl DriverManager {
    /// Manager over `lookup` with the default connector and defaults.
    pub fn new(registry: DriverRegistry, lookup: Arc<dyn InstrumentLookup>) -> Self {
        Self {
            registry,
            lookup,
            connector: Arc::new(DefaultConnector),
            defaults: DefaultsConfig::default(),
            instruments: IndexMap::new(),
        }
    }

    /// Manager over the instruments and defaults of `config`, with the
    /// built-in drivers.
    pub fn from_config(config: &LabConfig) -> Self {
        Self::new(DriverRegistry::with_builtin(), Arc::new(config.clone()))
            .with_defaults(config.defaults.clone())
    }

    /// Replaces the transport connector.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replaces the fallback timeout and error command.
    pub fn with_defaults(mut self, defaults: DefaultsConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Registry, to add drivers.
    pub fn registry_mut(&mut self) -> &mut DriverRegistry {
        &mut self.registry
    }

    /// Opens an instrument, or returns the instance already open under its
    /// name. A driver whose open fails is not kept.
    pub async fn open(
        &mut self,
        instrument: impl Into<InstrumentRef>,
        options: OpenOptions,
    ) -> DriverResult<SharedDriver> {
        let record = match instrument.into() {
            InstrumentRef::Name(name) => self
                .lookup
                .instrument_by_name(&name)
                .ok_or(DriverError::UnknownInstrument(name))?,
            InstrumentRef::Record(record) => record,
        };

        if let Some(driver) = self.instruments.get(&record.name) {
            return Ok(driver.clone());
        }

        let driver = self.open_resource(&record, options).await?;
        let shared: SharedDriver = Arc::new(Mutex::new(driver));
        self.instruments.insert(record.name, shared.clone());
        Ok(shared)
    }

    async fn open_resource(
        &self,
        record: &InstrumentRecord,
        options: OpenOptions,
    ) -> DriverResult<Box<dyn Driver>> {
        let descriptor = parse_resource_name(&record.address);
        let span = info_span!("instrument", name = %record.name, addr = %record.address);
        let timeout_s = options
            .timeout_s
            .or(record.timeout_s)
            .unwrap_or(self.defaults.timeout_s);
        let error_command = options
            .error_command
            .unwrap_or_else(|| self.defaults.error_command.clone());

        let mut args = DriverArgs::new(descriptor, self.connector.clone())
            .with_span(span.clone())
            .with_timeout(timeout_s)
            .with_error_command(error_command)
            .with_quantities(record.quantities.clone());
        if let Some(profile) = options.profile.or_else(|| record.config.clone()) {
            args = args.with_profile(profile);
        }

        let mut driver = self.registry.build(&record.driver, args)?;
        driver.perform_open().await?;
        info!(
            parent: &span,
            driver = %record.driver,
            model = driver.model().unwrap_or("unknown"),
            "Instrument ready"
        );
        Ok(driver)
    }

    /// The open instance for `name`, if any.
    pub fn get(&self, name: &str) -> Option<SharedDriver> {
        self.instruments.get(name).cloned()
    }

    /// True if `name` is open.
    pub fn is_open(&self, name: &str) -> bool {
        self.instruments.contains_key(name)
    }

    /// Names of open instruments, in the order they were opened.
    pub fn open_names(&self) -> Vec<String> {
        self.instruments.keys().cloned().collect()
    }

    /// Closes and forgets `name`. Returns `false` if it was not open.
    pub async fn close(&mut self, name: &str) -> DriverResult<bool> {
        let Some(driver) = self.instruments.shift_remove(name) else {
            return Ok(false);
        };
        let mut driver = driver.lock().await;
        driver.perform_close().await?;
        Ok(true)
    }

    /// Closes every open instrument. Failures are logged and the remaining
    /// instruments are still closed; the first failure is returned.
    pub async fn close_all(&mut self) -> DriverResult<()> {
        let mut first_error = None;
        for (name, driver) in self.instruments.drain(..) {
            let mut driver = driver.lock().await;
            if let Err(e) = driver.perform_close().await {
                error!(instrument = %name, error = %e, "Failed to close instrument");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for DriverManager {
    fn drop(&mut self) {
        if !self.instruments.is_empty() {
            warn!(
                open = ?self.open_names(),
                "Driver manager dropped without close_all(); close hooks were skipped"
            );
        }
    }
}

impl std::fmt::Debug for DriverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverManager")
            .field("registry", &self.registry)
            .field("open", &self.open_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InstrumentTable;
    use crate::transport::{MockConnector, MockTransport, Transport};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn manager(connector: &MockConnector) -> DriverManager {
        let table = InstrumentTable::new()
            .with(InstrumentRecord::new("awg1", "GPIB0::10::INSTR", "WaveformGenerator"))
            .with(InstrumentRecord::new("awg2", "GPIB0::11::INSTR", "WaveformGenerator"))
            .with(InstrumentRecord::new("bad", "GPIB0::12::INSTR", "NoSuchDriver"));
        DriverManager::new(DriverRegistry::with_builtin(), Arc::new(table))
            .with_connector(Arc::new(connector.clone()))
    }

    fn instrument(connector: &MockConnector, addr: &str) -> MockTransport {
        let mock = connector.register(MockTransport::new(addr));
        mock.reply_to("*IDN?", "Agilent Technologies,33522B,0,1.0");
        mock
    }

    #[tokio::test]
    async fn test_open_is_memoized_by_name() {
        let connector = MockConnector::new();
        instrument(&connector, "GPIB0::10::INSTR");
        instrument(&connector, "GPIB0::11::INSTR");
        let mut m = manager(&connector);

        let a = m.open("awg1", OpenOptions::default()).await.unwrap();
        let b = m.open("awg1", OpenOptions::default()).await.unwrap();
        let c = m.open("awg2", OpenOptions::default()).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(connector.connects(), vec!["GPIB0::10::INSTR", "GPIB0::11::INSTR"]);
        assert!(Arc::ptr_eq(&m.get("awg1").unwrap(), &a));
        assert!(m.get("dso").is_none());
    }

    #[tokio::test]
    async fn test_failed_open_is_not_cached() {
        let connector = MockConnector::new();
        let mut m = manager(&connector);

        let err = m.open("awg1", OpenOptions::default()).await.err().unwrap();
        assert!(err.is_transport());
        assert!(!m.is_open("awg1"));

        let err = m.open("bad", OpenOptions::default()).await.err().unwrap();
        assert!(matches!(err, DriverError::UnknownDriver(_)));

        let err = m.open("nobody", OpenOptions::default()).await.err().unwrap();
        assert!(matches!(err, DriverError::UnknownInstrument(_)));
    }

    #[tokio::test]
    async fn test_close_all_closes_every_handle() {
        let connector = MockConnector::new();
        let t1 = instrument(&connector, "GPIB0::10::INSTR");
        let t2 = instrument(&connector, "GPIB0::11::INSTR");
        let mut m = manager(&connector);
        m.open("awg1", OpenOptions::default()).await.unwrap();
        m.open("awg2", OpenOptions::default().timeout(1.5)).await.unwrap();
        assert_eq!(Transport::timeout(&t2), Duration::from_millis(1500));

        assert!(m.close("awg1").await.unwrap());
        assert!(!m.close("awg1").await.unwrap());
        m.close_all().await.unwrap();

        assert!(t1.is_closed() && t2.is_closed());
        assert!(m.open_names().is_empty());
    }

    #[traced_test]
    #[tokio::test]
    async fn test_drop_leaves_shared_driver_to_caller() {
        let connector = MockConnector::new();
        let t1 = instrument(&connector, "GPIB0::10::INSTR");
        let mut m = manager(&connector);
        let held = m.open("awg1", OpenOptions::default()).await.unwrap();

        drop(m);
        assert!(logs_contain("dropped without close_all()"));
        assert!(!t1.is_closed());

        held.lock().await.perform_close().await.unwrap();
        assert!(t1.is_closed());
    }
}

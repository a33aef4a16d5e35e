//! Lab configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/lab.toml`)
//! 2. environment variables prefixed with `LABCTL_`, nested keys split on `__`
//!
//! ```text
//! LABCTL_LOGGING__LEVEL=debug
//! LABCTL_DEFAULTS__TIMEOUT_S=10
//! ```
//!
//! # Example
//!
//! ```no_run
//! use lab_instruments::config::LabConfig;
//!
//! let config = LabConfig::load_from("config/lab.toml")?;
//! for instrument in &config.instruments {
//!     println!("{} -> {} ({})", instrument.name, instrument.address, instrument.driver);
//! }
//! # Ok::<(), lab_instruments::error::DriverError>(())
//! ```

use crate::catalog::{InstrumentLookup, InstrumentRecord};
use crate::driver::{DEFAULT_ERROR_COMMAND, DEFAULT_TIMEOUT_S};
use crate::error::{DriverError, DriverResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use indexmap::IndexMap;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/lab.toml";

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabConfig {
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Fallbacks for per-instrument settings.
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Configured instruments, in file order.
    #[serde(default)]
    pub instruments: Vec<InstrumentRecord>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

/// Values applied to instruments that do not set their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// I/O timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_s: f64,
    /// Error queue query; empty disables error checking.
    #[serde(default = "default_error_command")]
    pub error_command: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            timeout_s: default_timeout(),
            error_command: default_error_command(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT_S
}

fn default_error_command() -> String {
    DEFAULT_ERROR_COMMAND.to_string()
}

impl LabConfig {
    /// Loads [`DEFAULT_CONFIG_PATH`].
    pub fn load() -> DriverResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads and validates the configuration at `path`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DriverResult<Self> {
        let mut config: Self = Figment::from(Serialized::defaults(LabConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABCTL_").split("__"))
            .extract()?;

        config.restore_profile_order(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Figment stores tables as sorted maps, so init profiles come out in
    /// key order. Profiles are applied in the order the file declares them,
    /// which is recovered by reading the file a second time.
    fn restore_profile_order(&mut self, path: &Path) -> DriverResult<()> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let declared: DeclaredProfiles = toml::from_str(&text)
            .map_err(|e| DriverError::Configuration(format!("{}: {e}", path.display())))?;

        for entry in declared.instruments {
            let Some(order) = entry.config else { continue };
            let Some(record) = self.instruments.iter_mut().find(|r| r.name == entry.name) else {
                continue;
            };
            if let Some(profile) = record.config.as_mut() {
                profile.sort_by_cached_key(|key, _| {
                    order.get_index_of(key).unwrap_or(order.len())
                });
            }
        }
        Ok(())
    }

    /// Checks:
    /// - log level is one of trace, debug, info, warn, error
    /// - default and per-instrument timeouts are positive
    /// - instrument names are unique and non-empty
    /// - every instrument has an address and a driver
    /// - declared quantity names are unique per instrument
    pub fn validate(&self) -> DriverResult<()> {
        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(DriverError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            )));
        }
        check_timeout("defaults", self.defaults.timeout_s)?;

        let mut names = HashSet::new();
        for instrument in &self.instruments {
            if instrument.name.is_empty() {
                return Err(DriverError::Configuration(
                    "instrument name cannot be empty".to_string(),
                ));
            }
            if !names.insert(instrument.name.as_str()) {
                return Err(DriverError::Configuration(format!(
                    "duplicate instrument name '{}'",
                    instrument.name
                )));
            }
            self.validate_instrument(instrument)?;
        }
        Ok(())
    }

    fn validate_instrument(&self, instrument: &InstrumentRecord) -> DriverResult<()> {
        if instrument.address.trim().is_empty() {
            return Err(DriverError::Configuration(format!(
                "instrument '{}': 'address' cannot be empty",
                instrument.name
            )));
        }
        if instrument.driver.trim().is_empty() {
            return Err(DriverError::Configuration(format!(
                "instrument '{}': 'driver' cannot be empty",
                instrument.name
            )));
        }
        if let Some(timeout) = instrument.timeout_s {
            check_timeout(&instrument.name, timeout)?;
        }
        let mut quantities = HashSet::new();
        for quantity in &instrument.quantities {
            if !quantities.insert(quantity.name.as_str()) {
                return Err(DriverError::Configuration(format!(
                    "instrument '{}': duplicate quantity '{}'",
                    instrument.name, quantity.name
                )));
            }
        }
        Ok(())
    }

    /// Timeout for `record`, falling back to the configured default.
    pub fn timeout_for(&self, record: &InstrumentRecord) -> f64 {
        record.timeout_s.unwrap_or(self.defaults.timeout_s)
    }
}

/// Only the profile keys of each instrument, in file order.
#[derive(Deserialize)]
struct DeclaredProfiles {
    #[serde(default)]
    instruments: Vec<DeclaredProfile>,
}

#[derive(Deserialize)]
struct DeclaredProfile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: Option<IndexMap<String, IgnoredAny>>,
}

fn check_timeout(owner: &str, timeout_s: f64) -> DriverResult<()> {
    if timeout_s.is_finite() && timeout_s > 0.0 {
        Ok(())
    } else {
        Err(DriverError::Configuration(format!(
            "{owner}: timeout_s must be positive, got {timeout_s}"
        )))
    }
}

impl InstrumentLookup for LabConfig {
    fn instrument_by_name(&self, name: &str) -> Option<InstrumentRecord> {
        self.instruments.iter().find(|i| i.name == name).cloned()
    }

    fn instrument_names(&self) -> Vec<String> {
        self.instruments.iter().map(|i| i.name.clone()).collect()
    }
}

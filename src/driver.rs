//! Driver core and the `Driver` trait.
//!
//! Every driver owns a [`DriverCore`]: the parsed address, the identified
//! model, the quantity table and (once opened) the message session. The
//! quantity table is cloned from a [`DriverTemplate`] when the driver is
//! built and never grows afterwards.
//!
//! The [`Driver`] trait splits into hooks and a provided facade:
//!
//! - hooks: `perform_open`, `perform_close`, `perform_get_value`,
//!   `perform_set_value`, `errors`. Drivers override them to talk to a vendor
//!   API or to intercept particular quantity names, and fall back to the
//!   default templated behaviour for everything else.
//! - facade: `get_value`, `set_value`, `init`, `get_index`, `get_cmd_option`,
//!   `query`, `write`, `check_errors_and_log`. These resolve names and route
//!   through the hooks.

use crate::address::ResourceDescriptor;
use crate::error::DriverResult;
use crate::quantity::{CommandContext, Quantity, QuantityValue, TemplateValue};
use crate::session::MessageSession;
use crate::transport::Connector;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info_span, Span};

/// Timeout applied when an instrument record does not set one.
pub const DEFAULT_TIMEOUT_S: f64 = 3.0;

/// SCPI error queue query.
pub const DEFAULT_ERROR_COMMAND: &str = "SYST:ERR?";

/// One entry of an init profile.
///
/// In TOML either `Frequency = 1e6` or `Amplitude = { value = 0.5, ch = 2 }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigEntry {
    /// Value plus template fields such as `ch`.
    WithContext {
        /// Value to write.
        value: QuantityValue,
        /// Extra template fields.
        #[serde(flatten)]
        context: BTreeMap<String, TemplateValue>,
    },
    /// Bare value.
    Value(QuantityValue),
}

impl ConfigEntry {
    /// Value to write.
    pub fn value(&self) -> &QuantityValue {
        match self {
            ConfigEntry::WithContext { value, .. } | ConfigEntry::Value(value) => value,
        }
    }

    /// Template fields as a command context; empty for a bare value.
    pub fn context(&self) -> CommandContext {
        match self {
            ConfigEntry::WithContext { context, .. } => CommandContext::from_fields(context.clone()),
            ConfigEntry::Value(_) => CommandContext::new(),
        }
    }
}

impl From<QuantityValue> for ConfigEntry {
    fn from(value: QuantityValue) -> Self {
        ConfigEntry::Value(value)
    }
}

/// Ordered map of quantity name to the value applied by [`Driver::init`].
pub type DriverConfig = IndexMap<String, ConfigEntry>;

/// Immutable description of a driver model.
///
/// Templates live in statics and are cloned into every driver instance, so
/// two instruments of the same model never share cached values.
#[derive(Debug, Clone, Default)]
pub struct DriverTemplate {
    /// Quantities every instance starts with.
    pub quantities: Vec<Quantity>,
    /// Profile applied by `init(None)`.
    pub config: DriverConfig,
    /// Models confirmed to work with the driver.
    pub supported_models: Vec<String>,
}

impl DriverTemplate {
    /// Template with `quantities`, no profile and no model list.
    pub fn new(quantities: Vec<Quantity>) -> Self {
        Self {
            quantities,
            ..Self::default()
        }
    }

    /// Sets the default init profile.
    pub fn with_config<I, K>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, ConfigEntry)>,
        K: Into<String>,
    {
        self.config = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self
    }

    /// Sets the models confirmed to work.
    pub fn with_supported_models(mut self, models: &[&str]) -> Self {
        self.supported_models = models.iter().map(ToString::to_string).collect();
        self
    }
}

/// Everything a driver factory needs to build a driver.
#[derive(Clone)]
pub struct DriverArgs {
    /// Parsed instrument address.
    pub descriptor: ResourceDescriptor,
    /// I/O timeout in seconds.
    pub timeout_s: f64,
    /// Opens transports for SCPI drivers.
    pub connector: Arc<dyn Connector>,
    /// Span every event of this instrument is attached to.
    pub span: Span,
    /// Init profile replacing the model default.
    pub profile: Option<DriverConfig>,
    /// Quantities declared by the instrument record.
    pub quantities: Vec<Quantity>,
    /// Error queue query; empty disables error checking.
    pub error_command: String,
}

impl DriverArgs {
    /// Defaults for everything but the address and connector.
    pub fn new(descriptor: ResourceDescriptor, connector: Arc<dyn Connector>) -> Self {
        let span = info_span!("instrument", addr = %descriptor.addr());
        Self {
            descriptor,
            timeout_s: DEFAULT_TIMEOUT_S,
            connector,
            span,
            profile: None,
            quantities: Vec::new(),
            error_command: DEFAULT_ERROR_COMMAND.to_string(),
        }
    }

    /// Sets the I/O timeout in seconds.
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_s = seconds;
        self
    }

    /// Replaces the instrument span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Replaces the model's default init profile.
    pub fn with_profile(mut self, profile: DriverConfig) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Adds record-declared quantities.
    pub fn with_quantities(mut self, quantities: Vec<Quantity>) -> Self {
        self.quantities = quantities;
        self
    }

    /// Sets the error queue query.
    pub fn with_error_command(mut self, command: impl Into<String>) -> Self {
        self.error_command = command.into();
        self
    }
}

impl fmt::Debug for DriverArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverArgs")
            .field("descriptor", &self.descriptor)
            .field("timeout_s", &self.timeout_s)
            .field("quantities", &self.quantities.len())
            .field("error_command", &self.error_command)
            .finish_non_exhaustive()
    }
}

/// Entry of an instrument's error queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstrumentError {
    /// Instrument error code; 0 means the queue is empty.
    pub code: i64,
    /// Message reported with the code.
    pub message: String,
}

impl fmt::Display for InstrumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {}", self.code, self.message)
    }
}

/// State shared by every driver.
pub struct DriverCore {
    /// Address the driver was opened with.
    pub addr: String,
    /// Parsed form of `addr`.
    pub descriptor: ResourceDescriptor,
    /// Model reported on open, or fixed by the driver.
    pub model: Option<String>,
    quantities: IndexMap<String, Quantity>,
    /// Open message session; `None` until opened and after close.
    pub session: Option<MessageSession>,
    /// Profile applied by `init(None)`.
    pub config: DriverConfig,
    /// Span of this instrument.
    pub span: Span,
}

impl DriverCore {
    /// Core with the template's quantities followed by the record's.
    pub fn new(args: &DriverArgs, template: &DriverTemplate) -> Self {
        let quantities = template
            .quantities
            .iter()
            .chain(&args.quantities)
            .map(|q| (q.name.clone(), q.clone()))
            .collect();
        Self {
            addr: args.descriptor.addr().to_string(),
            descriptor: args.descriptor.clone(),
            model: None,
            quantities,
            session: None,
            config: args
                .profile
                .clone()
                .unwrap_or_else(|| template.config.clone()),
            span: args.span.clone(),
        }
    }

    /// Quantity `name`, if declared.
    pub fn quantity(&self, name: &str) -> Option<&Quantity> {
        self.quantities.get(name)
    }

    /// True if `name` is declared.
    pub fn has_quantity(&self, name: &str) -> bool {
        self.quantities.contains_key(name)
    }

    /// Quantities in declaration order.
    pub fn quantities(&self) -> impl Iterator<Item = &Quantity> {
        self.quantities.values()
    }

    /// True while a session is held.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Templated read through the open session, or the cache.
    pub async fn get_quantity(
        &mut self,
        name: &str,
        ctx: &CommandContext,
    ) -> DriverResult<Option<QuantityValue>> {
        let Some(quantity) = self.quantities.get_mut(name) else {
            return Ok(None);
        };
        quantity.get_value(self.session.as_mut(), ctx).await
    }

    /// Templated write through the open session; the cache is always updated.
    pub async fn set_quantity(
        &mut self,
        name: &str,
        value: QuantityValue,
        ctx: &CommandContext,
    ) -> DriverResult<()> {
        let Some(quantity) = self.quantities.get_mut(name) else {
            return Ok(());
        };
        quantity.set_value(self.session.as_mut(), value, ctx).await
    }

    /// Updates the cache without touching the instrument.
    pub async fn store(&mut self, name: &str, value: QuantityValue) -> DriverResult<()> {
        let Some(quantity) = self.quantities.get_mut(name) else {
            return Ok(());
        };
        quantity.set_value(None, value, &CommandContext::new()).await
    }
}

impl fmt::Debug for DriverCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverCore")
            .field("addr", &self.addr)
            .field("model", &self.model)
            .field("quantities", &self.quantities.keys().collect::<Vec<_>>())
            .field("open", &self.is_open())
            .finish()
    }
}

/// An instrument driver.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Shared driver state.
    fn core(&self) -> &DriverCore;

    /// Mutable access to the shared state.
    fn core_mut(&mut self) -> &mut DriverCore;

    /// Acquires the hardware handle.
    async fn perform_open(&mut self) -> DriverResult<()> {
        Ok(())
    }

    /// Releases the hardware handle.
    async fn perform_close(&mut self) -> DriverResult<()> {
        Ok(())
    }

    /// Read hook; the default reads through the quantity's template.
    async fn perform_get_value(
        &mut self,
        name: &str,
        ctx: &CommandContext,
    ) -> DriverResult<Option<QuantityValue>> {
        self.core_mut().get_quantity(name, ctx).await
    }

    /// Write hook; override to intercept specific quantities.
    async fn perform_set_value(
        &mut self,
        name: &str,
        value: QuantityValue,
        ctx: &CommandContext,
    ) -> DriverResult<()> {
        self.core_mut().set_quantity(name, value, ctx).await
    }

    /// Drains the instrument error queue. Drivers without one report nothing.
    async fn errors(&mut self) -> DriverResult<Vec<InstrumentError>> {
        Ok(Vec::new())
    }

    /// Instrument address.
    fn addr(&self) -> &str {
        &self.core().addr
    }

    /// Instrument model, once known.
    fn model(&self) -> Option<&str> {
        self.core().model.as_deref()
    }

    /// Reads quantity `name`; `Ok(None)` if the driver has no such quantity.
    async fn get_value(
        &mut self,
        name: &str,
        ctx: &CommandContext,
    ) -> DriverResult<Option<QuantityValue>> {
        if !self.core().has_quantity(name) {
            return Ok(None);
        }
        self.perform_get_value(name, ctx).await
    }

    /// Writes quantity `name`; unknown names are ignored.
    async fn set_value(
        &mut self,
        name: &str,
        value: QuantityValue,
        ctx: &CommandContext,
    ) -> DriverResult<()> {
        if !self.core().has_quantity(name) {
            return Ok(());
        }
        self.perform_set_value(name, value, ctx).await
    }

    /// Applies `cfg`, or the driver's own profile, entry by entry.
    async fn init(&mut self, cfg: Option<DriverConfig>) -> DriverResult<()> {
        let cfg = match cfg {
            Some(cfg) => cfg,
            None => self.core().config.clone(),
        };
        for (name, entry) in cfg {
            let ctx = entry.context();
            let value = match entry {
                ConfigEntry::WithContext { value, .. } | ConfigEntry::Value(value) => value,
            };
            self.set_value(&name, value, &ctx).await?;
        }
        Ok(())
    }

    /// Reads an Option quantity and returns the position of its label.
    async fn get_index(&mut self, name: &str, ctx: &CommandContext) -> DriverResult<Option<usize>> {
        if self.get_value(name, ctx).await?.is_none() {
            return Ok(None);
        }
        Ok(self.core().quantity(name).and_then(Quantity::index))
    }

    /// Reads an Option quantity and returns its instrument code.
    async fn get_cmd_option(
        &mut self,
        name: &str,
        ctx: &CommandContext,
    ) -> DriverResult<Option<String>> {
        if self.get_value(name, ctx).await?.is_none() {
            return Ok(None);
        }
        Ok(self
            .core()
            .quantity(name)
            .and_then(Quantity::cmd_option)
            .map(str::to_string))
    }

    /// Raw query; `Ok(None)` when the driver is not open.
    async fn query(&mut self, message: &str, check_errors: bool) -> DriverResult<Option<String>> {
        let Some(session) = self.core_mut().session.as_mut() else {
            return Ok(None);
        };
        let response = session.query(message).await?;
        if check_errors {
            self.check_errors_and_log(message).await?;
        }
        Ok(Some(response))
    }

    /// Raw write; returns `false` when the driver is not open.
    async fn write(&mut self, message: &str, check_errors: bool) -> DriverResult<bool> {
        let Some(session) = self.core_mut().session.as_mut() else {
            return Ok(false);
        };
        session.write(message).await?;
        if check_errors {
            self.check_errors_and_log(message).await?;
        }
        Ok(true)
    }

    /// Drains the error queue and logs every entry against `message`.
    async fn check_errors_and_log(&mut self, message: &str) -> DriverResult<Vec<InstrumentError>> {
        let errors = self.errors().await?;
        let core = self.core();
        for e in &errors {
            error!(parent: &core.span, addr = %core.addr, "<< {}", message);
            error!(parent: &core.span, addr = %core.addr, ">> {}", e);
        }
        Ok(errors)
    }
}

//! Multi-channel DC voltage source driven through a vendor API.
//!
//! The source is addressed by its IP and has no SCPI interface. Only
//! `Offset` reaches the hardware; the vendor API numbers channels from zero
//! while quantities use 1-based channels.

use crate::driver::{Driver, DriverArgs, DriverCore, DriverTemplate};
use crate::error::{DriverError, DriverResult};
use crate::quantity::{CommandContext, Quantity, QuantityValue};
use crate::registry::DriverFactory;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing::info;

/// Output voltage quantity.
pub const OFFSET: &str = "Offset";
/// Model name reported by the driver.
pub const MODEL: &str = "PG_DC";

/// Quantities of the DC source.
pub static TEMPLATE: Lazy<DriverTemplate> = Lazy::new(|| {
    DriverTemplate::new(vec![Quantity::real(OFFSET)
        .with_value(0.0)
        .with_unit("V")
        .with_ch(1)])
    .with_supported_models(&[MODEL])
});

/// Result of a vendor SDK call; the SDK's own error type is kept opaque.
pub type ApiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Vendor API of the DC source.
#[async_trait]
pub trait VoltageApi: Send + Sync {
    /// Connects to the source at `addr`.
    async fn open(&mut self, addr: &str) -> ApiResult<()>;

    /// Sets `channel` (0-based) to `volts`.
    async fn set_voltage(&mut self, volts: f64, channel: usize) -> ApiResult<()>;

    /// Releases the connection.
    async fn close(&mut self) -> ApiResult<()> {
        Ok(())
    }
}

/// DC source driver.
pub struct DcSource {
    core: DriverCore,
    api: Box<dyn VoltageApi>,
    open: bool,
}

impl DcSource {
    /// Driver talking to the source through `api`.
    pub fn new(args: DriverArgs, api: Box<dyn VoltageApi>) -> Self {
        let mut core = DriverCore::new(&args, &TEMPLATE);
        core.model = Some(MODEL.to_string());
        Self {
            core,
            api,
            open: false,
        }
    }

    /// Registry factory building a fresh API handle per instrument.
    pub fn factory<F>(make_api: F) -> DriverFactory
    where
        F: Fn() -> Box<dyn VoltageApi> + Send + Sync + 'static,
    {
        Arc::new(move |args: DriverArgs| -> DriverResult<Box<dyn Driver>> {
            Ok(Box::new(DcSource::new(args, make_api())))
        })
    }

    /// Caches the offset, then forwards it to the API when open. A channel
    /// below 1 is rejected before caching, so the cache is left unchanged.
    async fn set_offset(&mut self, value: QuantityValue, ctx: &CommandContext) -> DriverResult<()> {
        let ch = ctx
            .ch()
            .or_else(|| self.core.quantity(OFFSET).and_then(|q| q.ch))
            .unwrap_or(1);
        let channel = usize::try_from(ch - 1).map_err(|_| DriverError::InvalidValue {
            quantity: OFFSET.to_string(),
            reason: format!("channels start at 1, got {ch}"),
        })?;

        self.core.store(OFFSET, value).await?;
        if !self.open {
            return Ok(());
        }
        let volts = self
            .core
            .quantity(OFFSET)
            .and_then(|q| q.value.as_ref())
            .and_then(QuantityValue::as_f64)
            .unwrap_or_default();

        info!(parent: &self.core.span, addr = %self.core.addr, ch, volts, "Set voltage");
        self.api
            .set_voltage(volts, channel)
            .await
            .map_err(|e| self.vendor_error("set_voltage", e))
    }

    fn vendor_error(&self, call: &str, e: Box<dyn std::error::Error + Send + Sync>) -> DriverError {
        DriverError::Vendor(format!("{call} on {}: {e}", self.core.addr))
    }
}

#[async_trait]
impl Driver for DcSource {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    async fn perform_open(&mut self) -> DriverResult<()> {
        if self.open {
            return Ok(());
        }
        self.api
            .open(&self.core.addr)
            .await
            .map_err(|e| self.vendor_error("open", e))?;
        self.open = true;
        Ok(())
    }

    async fn perform_close(&mut self) -> DriverResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.api.close().await.map_err(|e| self.vendor_error("close", e))
    }

    async fn perform_set_value(
        &mut self,
        name: &str,
        value: QuantityValue,
        ctx: &CommandContext,
    ) -> DriverResult<()> {
        if name == OFFSET {
            return self.set_offset(value, ctx).await;
        }
        self.core.set_quantity(name, value, ctx).await
    }
}

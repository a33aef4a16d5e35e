//! Two-channel function/arbitrary waveform generator (Keysight 33500 series
//! command set).

use crate::block::{BinaryFormat, BlockDataType};
use crate::driver::{ConfigEntry, Driver, DriverArgs, DriverCore, DriverTemplate, InstrumentError};
use crate::error::{DriverError, DriverResult};
use crate::quantity::{CommandContext, Quantity, QuantityValue};
use crate::scpi::ScpiDriver;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use tracing::debug;

/// Name of the quantity written as a binary block.
pub const ARBITRARY_DATA: &str = "Arbitrary Data";

/// Quantities and default profile of the generator.
pub static TEMPLATE: Lazy<DriverTemplate> = Lazy::new(|| {
    DriverTemplate::new(vec![
        Quantity::real("Frequency")
            .with_unit("Hz")
            .with_ch(1)
            .with_get_cmd("SOUR{ch}:FREQ?")
            .with_set_cmd("SOUR{ch}:FREQ {value}"),
        Quantity::real("Amplitude")
            .with_unit("V")
            .with_ch(1)
            .with_get_cmd("SOUR{ch}:VOLT?")
            .with_set_cmd("SOUR{ch}:VOLT {value}"),
        Quantity::real("Offset")
            .with_value(0.0)
            .with_unit("V")
            .with_ch(1)
            .with_get_cmd("SOUR{ch}:VOLT:OFFS?")
            .with_set_cmd("SOUR{ch}:VOLT:OFFS {value}"),
        Quantity::real("Phase")
            .with_unit("deg")
            .with_ch(1)
            .with_get_cmd("SOUR{ch}:PHAS?")
            .with_set_cmd("SOUR{ch}:PHAS {value}"),
        Quantity::option(
            "Waveform",
            &[
                ("Sine", "SIN"),
                ("Square", "SQU"),
                ("Triangle", "TRI"),
                ("Ramp", "RAMP"),
                ("Pulse", "PULS"),
                ("Noise", "NOIS"),
                ("DC", "DC"),
                ("Arbitrary", "ARB"),
            ],
        )
        .with_ch(1)
        .with_get_cmd("SOUR{ch}:FUNC?")
        .with_set_cmd("SOUR{ch}:FUNC {option}"),
        Quantity::bool("Output")
            .with_ch(1)
            .with_get_cmd("OUTP{ch}?")
            .with_set_cmd("OUTP{ch} {value}"),
        Quantity::integer("Burst Cycles")
            .with_ch(1)
            .with_get_cmd("SOUR{ch}:BURS:NCYC?")
            .with_set_cmd("SOUR{ch}:BURS:NCYC {value}"),
        Quantity::string("Display Text")
            .with_get_cmd("DISP:TEXT?")
            .with_set_cmd("DISP:TEXT \"{value}\""),
        Quantity::vector(ARBITRARY_DATA)
            .with_unit("V")
            .with_ch(1)
            .with_set_cmd("SOUR{ch}:DATA:ARB {segment},"),
    ])
    .with_config([
        ("Output", ConfigEntry::Value(false.into())),
        ("Waveform", ConfigEntry::Value("Sine".into())),
        ("Amplitude", ConfigEntry::Value(0.1.into())),
        ("Offset", ConfigEntry::Value(0.0.into())),
    ])
    .with_supported_models(&["33522B", "33622A", "33512B", "33611A"])
});

/// Waveform generator driver.
///
/// Everything is templated except `Arbitrary Data`, which is uploaded as a
/// little-endian float block into the segment named by the `segment` context
/// field (default `ARB1`).
pub struct WaveformGenerator {
    scpi: ScpiDriver,
}

impl WaveformGenerator {
    /// Generator with the default template.
    pub fn new(args: DriverArgs) -> Self {
        Self {
            scpi: ScpiDriver::new(args, &TEMPLATE),
        }
    }

    /// Registry factory.
    pub fn build(args: DriverArgs) -> DriverResult<Box<dyn Driver>> {
        Ok(Box::new(Self::new(args)))
    }

    async fn upload(&mut self, value: QuantityValue, ctx: &CommandContext) -> DriverResult<()> {
        self.scpi.core_mut().store(ARBITRARY_DATA, value).await?;
        if !self.scpi.core().is_open() {
            return Ok(());
        }

        let mut ctx = ctx.clone();
        if ctx.get("segment").is_none() {
            ctx = ctx.with("segment", "ARB1");
        }
        let quantity = self
            .scpi
            .core()
            .quantity(ARBITRARY_DATA)
            .ok_or_else(|| DriverError::Unsupported(ARBITRARY_DATA.to_string()))?;
        let header = quantity.format_set_cmd(Default::default(), &ctx)?;
        let values = quantity
            .value
            .as_ref()
            .and_then(QuantityValue::as_vector)
            .map(<[f64]>::to_vec)
            .unwrap_or_default();

        debug!(parent: &self.scpi.core().span, points = values.len(), "Uploading arbitrary waveform");
        let session = self.scpi.session()?;
        session.write("FORM:BORD SWAP").await?;
        session
            .write_binary_values(&header, &values, BinaryFormat::new(BlockDataType::F32, false))
            .await
    }
}

#[async_trait]
impl Driver for WaveformGenerator {
    fn core(&self) -> &DriverCore {
        self.scpi.core()
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        self.scpi.core_mut()
    }

    async fn perform_open(&mut self) -> DriverResult<()> {
        self.scpi.perform_open().await
    }

    async fn perform_close(&mut self) -> DriverResult<()> {
        self.scpi.perform_close().await
    }

    async fn perform_set_value(
        &mut self,
        name: &str,
        value: QuantityValue,
        ctx: &CommandContext,
    ) -> DriverResult<()> {
        if name == ARBITRARY_DATA {
            return self.upload(value, ctx).await;
        }
        self.scpi.perform_set_value(name, value, ctx).await
    }

    async fn errors(&mut self) -> DriverResult<Vec<InstrumentError>> {
        self.scpi.errors().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::parse_resource_name;
    use crate::transport::{MockConnector, MockTransport};
    use std::sync::Arc;

    const ADDR: &str = "TCPIP0::192.168.1.20::INSTR";

    async fn open_awg() -> (WaveformGenerator, MockTransport) {
        let connector = MockConnector::new();
        let mock = connector.register(MockTransport::new(ADDR));
        mock.reply_to("*IDN?", "Agilent Technologies,33522B,MY5000,3.05");
        let args = DriverArgs::new(parse_resource_name(ADDR), Arc::new(connector));
        let mut awg = WaveformGenerator::new(args);
        awg.perform_open().await.unwrap();
        mock.clear_written();
        (awg, mock)
    }

    #[tokio::test]
    async fn test_default_profile_writes() {
        let (mut awg, mock) = open_awg().await;
        awg.init(None).await.unwrap();
        assert_eq!(
            mock.written(),
            vec![
                "OUTP1 0",
                "SOUR1:FUNC SIN",
                "SOUR1:VOLT 0.1",
                "SOUR1:VOLT:OFFS 0",
            ]
        );
    }

    #[tokio::test]
    async fn test_channel_override() {
        let (mut awg, mock) = open_awg().await;
        let ctx = CommandContext::new().with("ch", 2);
        awg.set_value("Frequency", 2.5e6.into(), &ctx).await.unwrap();
        awg.set_value("Burst Cycles", 10.into(), &ctx).await.unwrap();
        assert_eq!(mock.written(), vec!["SOUR2:FREQ 2500000", "SOUR2:BURS:NCYC 10"]);
    }

    #[tokio::test]
    async fn test_arbitrary_upload_as_block() {
        let (mut awg, mock) = open_awg().await;
        awg.set_value(ARBITRARY_DATA, vec![0.0, 1.0].into(), &CommandContext::new())
            .await
            .unwrap();

        let written = mock.written_bytes();
        assert_eq!(written[0], b"FORM:BORD SWAP\n".to_vec());
        assert!(written[1].starts_with(b"SOUR1:DATA:ARB ARB1,#18"));
        assert_eq!(written[1].len(), "SOUR1:DATA:ARB ARB1,#18".len() + 8 + 1);
    }
}

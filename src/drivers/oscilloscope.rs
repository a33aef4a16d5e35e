//! Digital storage oscilloscope (Keysight InfiniiVision command set).

use crate::block::{BinaryFormat, BlockDataType};
use crate::driver::{Driver, DriverArgs, DriverCore, DriverTemplate, InstrumentError};
use crate::error::{DriverError, DriverResult};
use crate::quantity::{CommandContext, Quantity, QuantityValue};
use crate::scpi::ScpiDriver;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use tracing::debug;

/// Scaled samples of the selected channel.
pub const TRACE: &str = "Trace";
/// Sample times of the last trace.
pub const TIME_AXIS: &str = "Time Axis";

/// Quantities of the oscilloscope.
pub static TEMPLATE: Lazy<DriverTemplate> = Lazy::new(|| {
    DriverTemplate::new(vec![
        Quantity::vector(TRACE)
            .with_unit("V")
            .with_ch(1)
            .with_get_cmd(":WAV:DATA?"),
        Quantity::vector(TIME_AXIS).with_unit("s"),
        Quantity::real("Timebase Scale")
            .with_unit("s")
            .with_get_cmd(":TIM:SCAL?")
            .with_set_cmd(":TIM:SCAL {value}"),
        Quantity::real("Vertical Scale")
            .with_unit("V")
            .with_ch(1)
            .with_get_cmd(":CHAN{ch}:SCAL?")
            .with_set_cmd(":CHAN{ch}:SCAL {value}"),
        Quantity::real("Vertical Offset")
            .with_unit("V")
            .with_ch(1)
            .with_get_cmd(":CHAN{ch}:OFFS?")
            .with_set_cmd(":CHAN{ch}:OFFS {value}"),
        Quantity::bool("Channel Display")
            .with_ch(1)
            .with_get_cmd(":CHAN{ch}:DISP?")
            .with_set_cmd(":CHAN{ch}:DISP {value}"),
        Quantity::option(
            "Trigger Source",
            &[
                ("CH1", "CHAN1"),
                ("CH2", "CHAN2"),
                ("CH3", "CHAN3"),
                ("CH4", "CHAN4"),
                ("External", "EXT"),
                ("Line", "LINE"),
            ],
        )
        .with_get_cmd(":TRIG:EDGE:SOUR?")
        .with_set_cmd(":TRIG:EDGE:SOUR {option}"),
        Quantity::real("Trigger Level")
            .with_unit("V")
            .with_get_cmd(":TRIG:EDGE:LEV?")
            .with_set_cmd(":TRIG:EDGE:LEV {value}"),
        Quantity::integer("Points")
            .with_get_cmd(":WAV:POIN?")
            .with_set_cmd(":WAV:POIN {value}"),
    ])
    .with_supported_models(&["DSOX3034T", "MSOX3104T", "DSOX4024A"])
});

/// Scaling returned by `:WAV:PRE?`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preamble {
    /// Number of samples.
    pub points: usize,
    /// Time between samples.
    pub x_increment: f64,
    /// Time of the first sample.
    pub x_origin: f64,
    /// Reference sample index.
    pub x_reference: f64,
    /// Volts per code.
    pub y_increment: f64,
    /// Voltage offset.
    pub y_origin: f64,
    /// Code at the voltage offset.
    pub y_reference: f64,
}

impl Preamble {
    /// Parses the ten preamble fields
    /// `format,type,points,count,xinc,xorig,xref,yinc,yorig,yref`.
    pub fn parse(fields: &[f64]) -> DriverResult<Self> {
        let &[_, _, points, _, x_increment, x_origin, x_reference, y_increment, y_origin, y_reference, ..] =
            fields
        else {
            return Err(DriverError::parse(format!(
                "waveform preamble has {} fields, expected 10",
                fields.len()
            )));
        };
        Ok(Self {
            points: points as usize,
            x_increment,
            x_origin,
            x_reference,
            y_increment,
            y_origin,
            y_reference,
        })
    }

    /// Converts a raw sample code to volts.
    pub fn volts(&self, raw: f64) -> f64 {
        (raw - self.y_reference) * self.y_increment + self.y_origin
    }

    /// Time of sample `index`.
    pub fn time(&self, index: usize) -> f64 {
        (index as f64 - self.x_reference) * self.x_increment + self.x_origin
    }
}

/// Oscilloscope driver.
///
/// Reading `Trace` selects the channel source, fetches the preamble and a
/// 16-bit binary block, and returns the samples scaled to volts. The matching
/// sample times are cached in `Time Axis`.
pub struct Oscilloscope {
    scpi: ScpiDriver,
}

impl Oscilloscope {
    /// Oscilloscope with the default template.
    pub fn new(args: DriverArgs) -> Self {
        Self {
            scpi: ScpiDriver::new(args, &TEMPLATE),
        }
    }

    /// Registry factory.
    pub fn build(args: DriverArgs) -> DriverResult<Box<dyn Driver>> {
        Ok(Box::new(Self::new(args)))
    }

    async fn read_trace(&mut self, ctx: &CommandContext) -> DriverResult<Option<QuantityValue>> {
        let ch = ctx
            .ch()
            .or_else(|| self.scpi.core().quantity(TRACE).and_then(|q| q.ch))
            .unwrap_or(1);

        let session = self.scpi.session()?;
        session.write(&format!(":WAV:SOUR CHAN{ch}")).await?;
        session.write(":WAV:FORM WORD").await?;
        session.write(":WAV:BYT LSBF").await?;
        session.write(":WAV:UNS 1").await?;
        let preamble = Preamble::parse(&session.query_ascii_values(":WAV:PRE?").await?)?;
        let raw = session
            .query_binary_values(":WAV:DATA?", BinaryFormat::new(BlockDataType::U16, false))
            .await?;

        if raw.len() != preamble.points {
            debug!(
                parent: &self.scpi.core().span,
                expected = preamble.points,
                received = raw.len(),
                "Trace length differs from preamble"
            );
        }

        let volts: Vec<f64> = raw.iter().map(|r| preamble.volts(*r)).collect();
        let times: Vec<f64> = (0..volts.len()).map(|i| preamble.time(i)).collect();

        let core = self.scpi.core_mut();
        core.store(TIME_AXIS, QuantityValue::Vector(times)).await?;
        core.store(TRACE, QuantityValue::Vector(volts.clone())).await?;
        Ok(Some(QuantityValue::Vector(volts)))
    }
}

#[async_trait]
impl Driver for Oscilloscope {
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

    async fn perform_get_value(
        &mut self,
        name: &str,
        ctx: &CommandContext,
    ) -> DriverResult<Option<QuantityValue>> {
        if name == TRACE && self.scpi.core().is_open() {
            return self.read_trace(ctx).await;
        }
        self.scpi.perform_get_value(name, ctx).await
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

    const ADDR: &str = "USB0::0x2A8D::0x1766::MY57000001::INSTR";

    #[test]
    fn test_preamble_scaling() {
        let p = Preamble::parse(&[1.0, 0.0, 4.0, 1.0, 1e-9, -2e-9, 0.0, 0.01, 0.0, 32768.0]).unwrap();
        assert_eq!(p.points, 4);
        assert!((p.volts(32868.0) - 1.0).abs() < 1e-12);
        assert!((p.time(2) - 0.0).abs() < 1e-18);
        assert!(Preamble::parse(&[1.0, 2.0]).is_err());
    }

    #[tokio::test]
    async fn test_trace_read_scales_block() {
        let connector = MockConnector::new();
        let mock = connector.register(MockTransport::new(ADDR));
        mock.reply_to("*IDN?", "KEYSIGHT TECHNOLOGIES,DSOX3034T,MY57000001,07.50");
        mock.reply_to(":WAV:PRE?", "+1,+0,+2,+1,+1.0E-06,+0.0E+00,+0,+1.0E-02,+0.0E+00,+32768");
        // 32768 + 100 and 32768 - 50, little endian
        mock.reply_to(":WAV:DATA?", b"#14\x64\x80\xce\x7f".to_vec());

        let args = DriverArgs::new(parse_resource_name(ADDR), Arc::new(connector));
        let mut scope = Oscilloscope::new(args);
        scope.perform_open().await.unwrap();

        let trace = scope
            .get_value(TRACE, &CommandContext::new().with("ch", 3))
            .await
            .unwrap()
            .unwrap();
        let volts = trace.as_vector().unwrap();
        assert!((volts[0] - 1.0).abs() < 1e-9);
        assert!((volts[1] + 0.5).abs() < 1e-9);
        assert!(mock.written().contains(&":WAV:SOUR CHAN3".to_string()));

        let times = scope.core().quantity(TIME_AXIS).unwrap().value.clone().unwrap();
        assert_eq!(times, QuantityValue::Vector(vec![0.0, 1e-6]));
    }

    #[tokio::test]
    async fn test_trace_without_session_is_cached_value() {
        let args = DriverArgs::new(parse_resource_name(ADDR), Arc::new(MockConnector::new()));
        let mut scope = Oscilloscope::new(args);
        assert_eq!(scope.get_value(TRACE, &CommandContext::new()).await.unwrap(), None);
    }
}

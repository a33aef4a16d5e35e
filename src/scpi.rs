//! Message-based (SCPI) driver over VISA or raw sockets.
//!
//! `ScpiDriver` is the transport-level driver most models build on. Opening
//! connects through the configured [`Connector`], identifies the instrument
//! with `*IDN?` and keeps the session. If identification fails the transport
//! is closed again before the error is returned, so a driver is either fully
//! open or not open at all.

use crate::driver::{Driver, DriverArgs, DriverCore, DriverTemplate, InstrumentError};
use crate::error::{DriverError, DriverResult};
use crate::session::{timeout_from_secs, MessageSession};
use crate::transport::Connector;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Parsed `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Manufacturer field.
    pub manufacturer: String,
    /// Model field, checked against the supported models.
    pub model: String,
    /// Serial number, if reported.
    pub serial: Option<String>,
    /// Firmware revision, if reported.
    pub firmware: Option<String>,
}

impl Identity {
    /// Parses `manufacturer,model,serial,firmware`.
    pub fn parse(addr: &str, reply: &str) -> DriverResult<Self> {
        let fields: Vec<&str> = reply.trim().split(',').map(str::trim).collect();
        let (manufacturer, model) = match fields.as_slice() {
            [manufacturer, model, ..] if !model.is_empty() => (*manufacturer, *model),
            _ => {
                return Err(DriverError::Identification {
                    addr: addr.to_string(),
                    reason: format!("unexpected *IDN? reply '{}'", reply.trim()),
                })
            }
        };
        let optional = |i: usize| {
            fields
                .get(i)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        };
        Ok(Self {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            serial: optional(2),
            firmware: optional(3),
        })
    }
}

/// Parses one error queue entry such as `-113,"Undefined header"`.
pub fn parse_error_reply(reply: &str) -> DriverResult<InstrumentError> {
    let reply = reply.trim();
    let (code, message) = reply.split_once(',').unwrap_or((reply, ""));
    let code = code
        .trim()
        .parse::<i64>()
        .map_err(|_| DriverError::parse(format!("invalid error queue entry '{reply}'")))?;
    Ok(InstrumentError {
        code,
        message: message.trim().trim_matches('"').to_string(),
    })
}

/// SCPI instrument driver.
pub struct ScpiDriver {
    core: DriverCore,
    connector: Arc<dyn Connector>,
    timeout_s: f64,
    error_command: String,
    supported_models: Vec<String>,
}

impl ScpiDriver {
    /// Unopened driver for `template`.
    pub fn new(args: DriverArgs, template: &DriverTemplate) -> Self {
        Self {
            core: DriverCore::new(&args, template),
            connector: args.connector,
            timeout_s: args.timeout_s,
            error_command: args.error_command,
            supported_models: template.supported_models.clone(),
        }
    }

    /// Changes the I/O timeout, immediately if the driver is open.
    pub async fn set_timeout(&mut self, seconds: f64) -> DriverResult<()> {
        timeout_from_secs(seconds)?;
        self.timeout_s = seconds;
        if let Some(session) = self.core.session.as_mut() {
            session.set_timeout_secs(seconds).await?;
        }
        Ok(())
    }

    /// Query followed by an error queue check.
    pub async fn query_checked(&mut self, message: &str) -> DriverResult<Option<String>> {
        self.query(message, true).await
    }

    /// Write followed by an error queue check.
    pub async fn write_checked(&mut self, message: &str) -> DriverResult<bool> {
        self.write(message, true).await
    }

    /// Session of an open driver.
    pub fn session(&mut self) -> DriverResult<&mut MessageSession> {
        self.core
            .session
            .as_mut()
            .ok_or_else(|| DriverError::NotConnected(self.core.addr.clone()))
    }

    async fn identify(&self, session: &mut MessageSession) -> DriverResult<Identity> {
        let reply = session.query("*IDN?").await?;
        Identity::parse(&self.core.addr, &reply)
    }
}

#[async_trait]
impl Driver for ScpiDriver {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    async fn perform_open(&mut self) -> DriverResult<()> {
        if self.core.is_open() {
            return Ok(());
        }

        let timeout = timeout_from_secs(self.timeout_s)?;
        let transport = self.connector.connect(&self.core.descriptor, timeout).await?;
        let mut session = MessageSession::new(transport, self.core.span.clone());

        let identity = match self.identify(&mut session).await {
            Ok(identity) => identity,
            Err(e) => {
                error!(parent: &self.core.span, addr = %self.core.addr, error = %e, "Identification failed, closing");
                if let Err(close_err) = session.close().await {
                    warn!(parent: &self.core.span, error = %close_err, "Close after failed identification also failed");
                }
                return Err(e);
            }
        };

        info!(
            parent: &self.core.span,
            addr = %self.core.addr,
            manufacturer = %identity.manufacturer,
            model = %identity.model,
            serial = identity.serial.as_deref().unwrap_or(""),
            firmware = identity.firmware.as_deref().unwrap_or(""),
            "Instrument opened"
        );
        if !self.supported_models.is_empty() && !self.supported_models.contains(&identity.model) {
            warn!(
                parent: &self.core.span,
                model = %identity.model,
                supported = ?self.supported_models,
                "Model is not in the confirmed list for this driver"
            );
        }

        self.core.model = Some(identity.model);
        self.core.session = Some(session);
        Ok(())
    }

    async fn perform_close(&mut self) -> DriverResult<()> {
        match self.core.session.take() {
            Some(mut session) => session.close().await,
            None => {
                debug!(parent: &self.core.span, addr = %self.core.addr, "Close on a driver that is not open");
                Ok(())
            }
        }
    }

    async fn errors(&mut self) -> DriverResult<Vec<InstrumentError>> {
        let mut errors = Vec::new();
        if self.error_command.is_empty() {
            return Ok(errors);
        }
        let Some(session) = self.core.session.as_mut() else {
            return Ok(errors);
        };
        // An instrument that never reports code 0 keeps this loop going.
        loop {
            let reply = session.query(&self.error_command).await?;
            let entry = parse_error_reply(&reply)?;
            if entry.code == 0 {
                break;
            }
            errors.push(entry);
        }
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::parse_resource_name;
    use crate::quantity::{CommandContext, Quantity};
    use crate::transport::{MockConnector, MockTransport};
    use tracing_test::traced_test;

    const ADDR: &str = "GPIB0::22::INSTR";

    fn driver(connector: &MockConnector) -> ScpiDriver {
        let template = DriverTemplate::new(vec![Quantity::real("Voltage")
            .with_get_cmd("VOLT?")
            .with_set_cmd("VOLT {value}")])
        .with_supported_models(&["E3631A"]);
        let args = DriverArgs::new(parse_resource_name(ADDR), Arc::new(connector.clone()));
        ScpiDriver::new(args, &template)
    }

    #[test]
    fn test_identity_parse() {
        let id = Identity::parse(ADDR, "Agilent Technologies,E3631A,0,2.1-5.0-1.0\n").unwrap();
        assert_eq!(id.model, "E3631A");
        assert_eq!(id.firmware.as_deref(), Some("2.1-5.0-1.0"));
        assert!(Identity::parse(ADDR, "garbage").is_err());
    }

    #[test]
    fn test_parse_error_reply() {
        let e = parse_error_reply("-113,\"Undefined header\"").unwrap();
        assert_eq!(e.code, -113);
        assert_eq!(e.message, "Undefined header");
        assert_eq!(parse_error_reply("+0,\"No error\"\n").unwrap().code, 0);
        assert!(parse_error_reply("oops").is_err());
    }

    #[traced_test]
    #[tokio::test]
    async fn test_open_identifies_model() {
        let connector = MockConnector::new();
        let mock = connector.register(MockTransport::new(ADDR));
        mock.reply_to("*IDN?", "Agilent Technologies,E3631A,0,2.1-5.0-1.0");

        let mut d = driver(&connector);
        d.perform_open().await.unwrap();
        assert_eq!(d.model(), Some("E3631A"));
        assert!(logs_contain("Instrument opened"));

        mock.push_response("1.25");
        let v = d.get_value("Voltage", &CommandContext::new()).await.unwrap();
        assert_eq!(v.and_then(|v| v.as_f64()), Some(1.25));
        assert_eq!(mock.written(), vec!["*IDN?", "VOLT?"]);
    }

    #[tokio::test]
    async fn test_failed_identification_closes_transport() {
        let connector = MockConnector::new();
        let mock = connector.register(MockTransport::new(ADDR));
        mock.reply_to("*IDN?", "nonsense");

        let mut d = driver(&connector);
        let err = d.perform_open().await.unwrap_err();
        assert!(matches!(err, DriverError::Identification { .. }));
        assert!(!d.core().is_open());
        assert!(mock.is_closed());
        assert_eq!(mock.close_count(), 1);
    }

    #[tokio::test]
    async fn test_error_queue_drains_until_zero() {
        let connector = MockConnector::new();
        let mock = connector.register(MockTransport::new(ADDR));
        mock.reply_to("*IDN?", "Agilent,E3631A,0,1.0");
        let mut d = driver(&connector);
        d.perform_open().await.unwrap();

        mock.push_response("-113,\"Undefined header\"");
        mock.push_response("-222,\"Data out of range\"");
        mock.push_response("0,\"No error\"");
        mock.push_response("-999,\"never read\"");

        let errors = d.errors().await.unwrap();
        assert_eq!(
            errors,
            vec![
                InstrumentError {
                    code: -113,
                    message: "Undefined header".into()
                },
                InstrumentError {
                    code: -222,
                    message: "Data out of range".into()
                },
            ]
        );
        assert_eq!(mock.pending_responses(), 1);
    }

    #[tokio::test]
    async fn test_close_then_reopen() {
        let connector = MockConnector::new();
        let mock = connector.register(MockTransport::new(ADDR));
        mock.reply_to("*IDN?", "Agilent,E3631A,0,1.0");
        let mut d = driver(&connector);

        d.perform_close().await.unwrap();
        d.perform_open().await.unwrap();
        d.set_timeout(0.5).await.unwrap();
        assert_eq!(d.session().unwrap().timeout().as_millis(), 500);

        d.perform_close().await.unwrap();
        assert!(mock.is_closed());
        assert!(d.session().is_err());
        assert!(!d.write_checked("*RST").await.unwrap());
    }
}

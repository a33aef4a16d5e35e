use lab_instruments::catalog::{InstrumentRecord, InstrumentTable};
use lab_instruments::driver::ConfigEntry;
use lab_instruments::quantity::{CommandContext, Quantity, QuantityValue};
use lab_instruments::registry::DriverRegistry;
use lab_instruments::transport::{MockConnector, MockTransport};
use lab_instruments::{DriverConfig, DriverManager, OpenOptions};
use std::sync::Arc;

const AWG: &str = "TCPIP0::192.168.1.20::INSTR";
const DMM: &str = "GPIB0::22::INSTR";

fn setup() -> (DriverManager, MockTransport, MockTransport) {
    let connector = MockConnector::new();
    let awg = connector.register(MockTransport::new(AWG));
    awg.reply_to("*IDN?", "Keysight Technologies,33522B,MY123,4.0");
    let dmm = connector.register(MockTransport::new(DMM));
    dmm.reply_to("*IDN?", "Agilent Technologies,34401A,0,11-5-2");

    let mut dmm_record = InstrumentRecord::new("dmm", DMM, "GenericScpi");
    dmm_record.quantities = vec![
        Quantity::real("Voltage").with_unit("V").with_get_cmd("MEAS:VOLT:DC?"),
        Quantity::option("Range", &[("Auto", "AUTO"), ("10 V", "10")])
            .with_get_cmd("VOLT:DC:RANG?")
            .with_set_cmd("VOLT:DC:RANG {option}"),
    ];
    let table = InstrumentTable::new()
        .with(InstrumentRecord::new("awg1", AWG, "WaveformGenerator"))
        .with(dmm_record);

    let manager = DriverManager::new(DriverRegistry::with_builtin(), Arc::new(table))
        .with_connector(Arc::new(connector));
    (manager, awg, dmm)
}

#[tokio::test]
async fn test_same_name_shares_one_driver() {
    let (mut manager, awg, _) = setup();
    let first = manager.open("awg1", OpenOptions::default()).await.unwrap();
    let second = manager.open("awg1", OpenOptions::default()).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(awg.written(), vec!["*IDN?"]);
    assert_eq!(first.lock().await.model(), Some("33522B"));
}

#[tokio::test]
async fn test_init_applies_default_profile_in_order() {
    let (mut manager, awg, _) = setup();
    let driver = manager.open("awg1", OpenOptions::default()).await.unwrap();
    awg.clear_written();

    driver.lock().await.init(None).await.unwrap();
    let written = awg.written();
    assert_eq!(written.len(), 4);
    assert_eq!(written[0], "OUTP1 0");
    assert_eq!(written[1], "SOUR1:FUNC SIN");
    assert!(written[2].starts_with("SOUR1:VOLT "));
    assert!(written[3].starts_with("SOUR1:VOLT:OFFS "));
}

#[tokio::test]
async fn test_profile_override_replaces_default() {
    let (mut manager, awg, _) = setup();
    let mut profile = DriverConfig::new();
    profile.insert("Waveform".into(), ConfigEntry::Value("Square".into()));
    let driver = manager
        .open("awg1", OpenOptions::default().profile(profile))
        .await
        .unwrap();
    awg.clear_written();

    driver.lock().await.init(None).await.unwrap();
    assert_eq!(awg.written(), vec!["SOUR1:FUNC SQU"]);
}

#[tokio::test]
async fn test_invalid_option_never_reaches_instrument() {
    let (mut manager, _, dmm) = setup();
    let driver = manager.open("dmm", OpenOptions::default()).await.unwrap();
    let mut driver = driver.lock().await;
    dmm.clear_written();

    let ctx = CommandContext::new();
    driver.set_value("Range", "1000 V".into(), &ctx).await.unwrap();
    assert!(dmm.written().is_empty());

    driver.set_value("Range", "10 V".into(), &ctx).await.unwrap();
    assert_eq!(dmm.written(), vec!["VOLT:DC:RANG 10"]);

    dmm.push_response("AUTO");
    assert_eq!(driver.get_index("Range", &ctx).await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_generic_driver_reads_and_drains_errors() {
    let (mut manager, _, dmm) = setup();
    let driver = manager.open("dmm", OpenOptions::default()).await.unwrap();
    let mut driver = driver.lock().await;

    dmm.push_response("+1.23450000E-01");
    let value = driver.get_value("Voltage", &CommandContext::new()).await.unwrap();
    assert_eq!(value, Some(QuantityValue::Real(0.12345)));
    assert_eq!(driver.get_value("Current", &CommandContext::new()).await.unwrap(), None);

    dmm.push_response("-222,\"Data out of range\"");
    dmm.push_response("+0,\"No error\"");
    let errors = driver.errors().await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].to_string(), "-222 : Data out of range");
}

#[tokio::test]
async fn test_close_all_releases_transports() {
    let (mut manager, awg, dmm) = setup();
    manager.open("awg1", OpenOptions::default()).await.unwrap();
    manager.open("dmm", OpenOptions::default()).await.unwrap();
    assert_eq!(manager.open_names(), vec!["awg1", "dmm"]);

    manager.close_all().await.unwrap();
    assert!(awg.is_closed());
    assert!(dmm.is_closed());
    assert!(!manager.is_open("awg1"));
}

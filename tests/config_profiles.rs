use lab_instruments::config::LabConfig;
use lab_instruments::transport::{MockConnector, MockTransport};
use lab_instruments::{DriverManager, OpenOptions};
use std::io::Write;
use std::sync::Arc;

const AWG: &str = "TCPIP0::192.168.1.20::INSTR";

const PROFILE: &str = r#"
[[instruments]]
name = "awg1"
address = "TCPIP0::192.168.1.20::INSTR"
driver = "WaveformGenerator"

[instruments.config]
Waveform = "Square"
Output = true
Amplitude = { value = 0.5, ch = 1 }
"#;

#[tokio::test]
async fn test_loaded_profile_is_written_in_file_order() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(PROFILE.as_bytes()).unwrap();
    let config = LabConfig::load_from(file.path()).unwrap();

    let connector = MockConnector::new();
    let awg = connector.register(MockTransport::new(AWG));
    awg.reply_to("*IDN?", "Keysight Technologies,33522B,MY123,4.0");
    let mut manager = DriverManager::from_config(&config).with_connector(Arc::new(connector));

    let driver = manager.open("awg1", OpenOptions::default()).await.unwrap();
    awg.clear_written();
    driver.lock().await.init(None).await.unwrap();

    let written = awg.written();
    assert_eq!(written.len(), 3);
    assert_eq!(written[0], "SOUR1:FUNC SQU");
    assert_eq!(written[1], "OUTP1 1");
    assert!(written[2].starts_with("SOUR1:VOLT "));
    manager.close_all().await.unwrap();
}

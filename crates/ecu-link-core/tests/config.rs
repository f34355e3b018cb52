use ecu_link_core::adapter::FlowControlPolicy;
use ecu_link_core::config::DetectorConfig;
use ecu_link_core::protocol::ProtocolError;
use pretty_assertions::assert_eq;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "deadline_ms": 8000,
            "adapter": {{ "protocol": 8, "flow_control": "strict" }},
            "handshake": {{ "baud_rate": 460800, "signature_prefix": "rusEFI master" }}
        }}"#
    )
    .unwrap();

    let config = DetectorConfig::from_file(file.path()).unwrap();
    assert_eq!(config.deadline_ms, 8000);
    assert_eq!(config.adapter.protocol, 8);
    assert_eq!(config.adapter.flow_control, FlowControlPolicy::Strict);
    assert_eq!(config.adapter.baud_rate, 38400);
    assert_eq!(config.handshake.baud_rate, 460800);
    assert_eq!(config.handshake.signature_prefix, "rusEFI master");
    assert_eq!(config.handshake.timeout_ms, 2000);
}

#[test]
fn test_save_and_reload() {
    let mut config = DetectorConfig::default();
    config.adapter.tx_id = "7E0".to_string();
    config.adapter.rx_id = "7E8".to_string();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("detector.json");
    std::fs::write(&path, config.to_json_string().unwrap()).unwrap();

    assert_eq!(DetectorConfig::from_file(&path).unwrap(), config);
}

#[test]
fn test_empty_object_is_default() {
    assert_eq!(
        DetectorConfig::from_json_str("{}").unwrap(),
        DetectorConfig::default()
    );
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = DetectorConfig::from_file(dir.path().join("nope.json")).unwrap_err();
    assert!(matches!(err, ProtocolError::IoError(_)));
}

#[test]
fn test_unknown_policy_rejected() {
    let err = DetectorConfig::from_json_str(r#"{ "adapter": { "flow_control": "lenient" } }"#)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::ConfigError(_)));
}

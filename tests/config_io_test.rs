use phoebus::config::{Config, Phase};

#[test]
fn default_config_round_trips_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("phoebus_config.yaml");

    let config = Config::default();
    config.save_to_file(&path).unwrap();

    let loaded = Config::from_file(&path).unwrap();
    assert_eq!(loaded.inverter.host, config.inverter.host);
    assert_eq!(loaded.inverter.port, config.inverter.port);
    assert_eq!(loaded.poll_interval_ms, config.poll_interval_ms);
    assert_eq!(loaded.outlets.len(), config.outlets.len());
    assert_eq!(loaded.outlets[0].start_soc, config.outlets[0].start_soc);
    assert!(loaded.validate().is_ok());
}

#[test]
fn sparse_file_fills_in_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sparse.yaml");
    std::fs::write(
        &path,
        r#"
inverter:
  host: 10.0.0.5
outlets:
  - outlet_id: 7
    name: Boiler
    host: 10.0.0.9
    priority: 1
    target_phase: L2
"#,
    )
    .unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.inverter.host, "10.0.0.5");
    assert_eq!(config.inverter.port, 8899, "default port kept");
    assert_eq!(config.outlets.len(), 1);
    assert_eq!(config.outlets[0].outlet_id, 7);
    assert_eq!(config.outlets[0].target_phase, Phase::L2);
    assert_eq!(config.outlets[0].start_soc, 70, "outlet defaults kept");
    assert!(config.validate().is_ok());
}

#[test]
fn malformed_file_is_a_serialization_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.yaml");
    std::fs::write(&path, "outlets: {not a list}").unwrap();

    let err = Config::from_file(&path).unwrap_err();
    assert!(err.to_string().contains("Serialization error"));
}

#[test]
fn missing_file_is_an_io_error() {
    let err = Config::from_file("/nonexistent/phoebus.yaml").unwrap_err();
    assert!(err.to_string().contains("I/O error"));
}

#[test]
fn validation_rejects_inverted_protection_thresholds() {
    let mut config = Config::default();
    config.protection.power_threshold_pct = 80;
    config.protection.recovery_threshold_pct = 95;
    assert!(config.validate().is_err());
}

#[test]
fn validation_rejects_priority_zero() {
    let mut config = Config::default();
    config.outlets[0].priority = 0;
    assert!(config.validate().is_err());
}

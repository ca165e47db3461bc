use phoebus::config::InverterConfig;
use phoebus::inverter::{InverterLink, InverterSnapshot, parse_signed, registers};

#[test]
fn link_starts_disconnected() {
    let link = InverterLink::new(&InverterConfig::default());
    assert!(!link.is_connected());
}

#[tokio::test]
async fn connect_invalid_address_errors() {
    let config = InverterConfig {
        host: "bad host".to_string(),
        ..Default::default()
    };
    let mut link = InverterLink::new(&config);
    let err = link.connect().await.unwrap_err();
    assert!(err.to_string().contains("Invalid socket address"));
}

#[test]
fn signed_register_conversion() {
    assert_eq!(parse_signed(100), 100);
    assert_eq!(parse_signed(32768), -32768);
    assert_eq!(parse_signed(65535), -1);
}

#[test]
fn snapshot_decoding_is_pure() {
    let mut telemetry = vec![0u16; registers::TELEMETRY_COUNT as usize];
    telemetry[registers::SOC] = 55;
    telemetry[registers::GRID_POWER] = 63536; // -2000 W
    telemetry[registers::VOLTAGE_L1] = 2300;
    telemetry[registers::VOLTAGE_L1 + 1] = 2310;
    telemetry[registers::VOLTAGE_L1 + 2] = 2290;
    telemetry[registers::UPS_LOAD_L1] = 400;
    let status = vec![0u16; registers::STATUS_COUNT as usize];

    let a = InverterSnapshot::decode(&telemetry, &status).unwrap();
    let b = InverterSnapshot::decode(&telemetry, &status).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.export_watts(), 2000);
    assert_eq!(a.total_ups_load(), 400);
    assert!(!a.grid_connected);
}

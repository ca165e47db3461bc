//! Modbus TCP client for the Deye hybrid inverter
//!
//! This module provides async register communication with the inverter,
//! decoding the telemetry block into an immutable snapshot and driving the
//! charge-current control registers with retry and reconnect handling.

use crate::config::InverterConfig;
use crate::error::{PhoebusError, Result};
use crate::logging::get_logger;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

/// Register map for the supported inverter model. Fixed per device, not
/// configurable.
pub mod registers {
    /// Base address of the telemetry block
    pub const TELEMETRY_BASE: u16 = 588;
    /// Number of registers in the telemetry block
    pub const TELEMETRY_COUNT: u16 = 90;

    /// Base address of the status block
    pub const STATUS_BASE: u16 = 500;
    /// Number of registers in the status block
    pub const STATUS_COUNT: u16 = 53;

    /// Battery max charge current (A), writable
    pub const MAX_CHARGE_CURRENT: u16 = 108;
    /// Battery max discharge current (A), writable
    pub const MAX_DISCHARGE_CURRENT: u16 = 109;
    /// Battery grid charge current (A), writable
    pub const GRID_CHARGE_CURRENT: u16 = 128;
    /// Max sell (export) power (W)
    pub const MAX_SELL_POWER: u16 = 143;

    // Offsets within the telemetry block
    pub const SOC: usize = 0;
    pub const BATTERY_POWER: usize = 2;
    pub const GRID_LOAD_L1: usize = 34;
    pub const GRID_POWER: usize = 37;
    pub const VOLTAGE_L1: usize = 56;
    pub const UPS_LOAD_L1: usize = 62;
    pub const CONSUMPTION_L1: usize = 65;
    pub const PV1_POWER: usize = 84;
    pub const PV2_POWER: usize = 85;

    // Offsets within the status block
    pub const RUN_STATE: usize = 0;
    pub const GRID_RELAY: usize = 52;
    /// Bit of the grid relay register that reports an established grid
    /// connection
    pub const GRID_CONNECTED_BIT: u16 = 2;
}

/// Modbus unit id of the inverter behind the datalogger
const UNIT_ID: u8 = 1;

/// Hard clamp for every charge/discharge current write, in amps
const MAX_CURRENT_LIMIT_A: u16 = 185;

/// Attempts per control-register write before giving up for this cycle
const WRITE_ATTEMPTS: u32 = 3;

/// Grace wait after the device acknowledges a write it is still processing
const ACK_GRACE: Duration = Duration::from_millis(500);

/// Convert an unsigned 16-bit register value to signed watts.
///
/// The inverter reports negative quantities (discharge, export) as values
/// above 32767.
pub fn parse_signed(value: u16) -> i32 {
    if value > 32767 {
        value as i32 - 65536
    } else {
        value as i32
    }
}

/// Immutable telemetry snapshot, produced once per successful read
#[derive(Debug, Clone, PartialEq)]
pub struct InverterSnapshot {
    /// Battery state of charge, 0-100 %
    pub soc: u16,

    /// Battery power in W; positive = charging
    pub battery_power: i32,

    /// Combined PV string power in W
    pub pv_power: i32,

    /// Grid power in W; negative = exporting
    pub grid_power: i32,

    /// Phase voltages [L1, L2, L3] in volts
    pub voltages: [f64; 3],

    /// UPS/backup port loads per phase in W
    pub ups_loads: [i32; 3],

    /// Grid-side CT loads per phase in W, signed
    pub grid_loads: [i32; 3],

    /// Total consumption per phase in W
    pub consumption: [i32; 3],

    /// Inverter running-state code
    pub run_state: u16,

    /// Whether the grid relay reports an established grid connection
    pub grid_connected: bool,
}

impl InverterSnapshot {
    /// Decode a snapshot from the raw telemetry and status blocks.
    ///
    /// Pure and deterministic: identical register contents always decode to
    /// identical snapshots.
    pub fn decode(telemetry: &[u16], status: &[u16]) -> Result<Self> {
        if telemetry.len() < registers::TELEMETRY_COUNT as usize {
            return Err(PhoebusError::modbus(format!(
                "Short telemetry block: {} registers",
                telemetry.len()
            )));
        }
        if status.len() < registers::STATUS_COUNT as usize {
            return Err(PhoebusError::modbus(format!(
                "Short status block: {} registers",
                status.len()
            )));
        }

        let voltages = [
            telemetry[registers::VOLTAGE_L1] as f64 / 10.0,
            telemetry[registers::VOLTAGE_L1 + 1] as f64 / 10.0,
            telemetry[registers::VOLTAGE_L1 + 2] as f64 / 10.0,
        ];
        let ups_loads = [
            telemetry[registers::UPS_LOAD_L1] as i32,
            telemetry[registers::UPS_LOAD_L1 + 1] as i32,
            telemetry[registers::UPS_LOAD_L1 + 2] as i32,
        ];
        let grid_loads = [
            parse_signed(telemetry[registers::GRID_LOAD_L1]),
            parse_signed(telemetry[registers::GRID_LOAD_L1 + 1]),
            parse_signed(telemetry[registers::GRID_LOAD_L1 + 2]),
        ];
        let consumption = [
            telemetry[registers::CONSUMPTION_L1] as i32,
            telemetry[registers::CONSUMPTION_L1 + 1] as i32,
            telemetry[registers::CONSUMPTION_L1 + 2] as i32,
        ];

        Ok(Self {
            soc: telemetry[registers::SOC],
            battery_power: parse_signed(telemetry[registers::BATTERY_POWER]),
            pv_power: telemetry[registers::PV1_POWER] as i32
                + telemetry[registers::PV2_POWER] as i32,
            grid_power: parse_signed(telemetry[registers::GRID_POWER]),
            voltages,
            ups_loads,
            grid_loads,
            consumption,
            run_state: status[registers::RUN_STATE],
            grid_connected: status[registers::GRID_RELAY] & (1 << registers::GRID_CONNECTED_BIT)
                != 0,
        })
    }

    /// Watts currently exported to the grid (zero when importing)
    pub fn export_watts(&self) -> i32 {
        (-self.grid_power).max(0)
    }

    /// Combined UPS output across all phases
    pub fn total_ups_load(&self) -> i32 {
        self.ups_loads.iter().sum()
    }

    /// Highest phase voltage
    pub fn max_voltage(&self) -> f64 {
        self.voltages.iter().fold(f64::MIN, |a, &b| a.max(b))
    }
}

/// Modbus TCP link to the inverter
pub struct InverterLink {
    /// Modbus TCP client connection
    client: Option<tokio_modbus::client::Context>,

    /// Configuration
    config: InverterConfig,

    /// Connection timeout
    connection_timeout: Duration,

    /// Operation timeout
    operation_timeout: Duration,

    /// Logger
    logger: crate::logging::StructuredLogger,
}

impl InverterLink {
    /// Create a new inverter link
    pub fn new(config: &InverterConfig) -> Self {
        let logger = get_logger("inverter");
        Self {
            client: None,
            config: config.clone(),
            connection_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(2),
            logger,
        }
    }

    /// Connect to the inverter, reusing an existing connection if present
    pub async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }

        let address = format!("{}:{}", self.config.host, self.config.port);
        self.logger.info(&format!(
            "Connecting to inverter at {} (logger serial {})",
            address, self.config.logger_serial
        ));

        let socket_addr: std::net::SocketAddr = address
            .parse()
            .map_err(|e| PhoebusError::modbus(format!("Invalid socket address: {}", e)))?;

        match timeout(
            self.connection_timeout,
            tcp::connect_slave(socket_addr, Slave(UNIT_ID)),
        )
        .await
        {
            Ok(Ok(client)) => {
                self.client = Some(client);
                self.logger.info("Successfully connected to inverter");
                Ok(())
            }
            Ok(Err(e)) => {
                let error_msg = format!("Failed to connect to inverter: {}", e);
                self.logger.error(&error_msg);
                Err(PhoebusError::modbus(error_msg))
            }
            Err(_) => {
                let error_msg = "Connection timeout".to_string();
                self.logger.error(&error_msg);
                Err(PhoebusError::timeout(error_msg))
            }
        }
    }

    /// Disconnect from the inverter
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(_client) = self.client.take() {
            self.logger.info("Disconnecting from inverter");
        }
        Ok(())
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Read a fresh telemetry snapshot.
    ///
    /// Any failure drops the connection handle so the next call reconnects
    /// from scratch; no partial state is kept across a failed cycle.
    pub async fn read(&mut self) -> Result<InverterSnapshot> {
        self.connect().await?;

        let telemetry = self
            .read_block(registers::TELEMETRY_BASE, registers::TELEMETRY_COUNT)
            .await?;
        let status = self
            .read_block(registers::STATUS_BASE, registers::STATUS_COUNT)
            .await?;

        InverterSnapshot::decode(&telemetry, &status)
    }

    /// Read the currently programmed charge triple:
    /// (max charge, grid charge, max discharge) in amps
    pub async fn read_charge_settings(&mut self) -> Result<(u16, u16, u16)> {
        self.connect().await?;

        let limits = self.read_block(registers::MAX_CHARGE_CURRENT, 2).await?;
        let grid = self.read_block(registers::GRID_CHARGE_CURRENT, 1).await?;
        Ok((limits[0], grid[0], limits[1]))
    }

    /// Read the inverter's configured max-sell power in watts
    pub async fn read_max_sell_power(&mut self) -> Result<u16> {
        self.connect().await?;

        let regs = self.read_block(registers::MAX_SELL_POWER, 1).await?;
        Ok(regs[0])
    }

    /// Set the battery max charge current, clamped to [0, 185] A.
    ///
    /// Returns false after exhausting retries; the caller must treat that as
    /// "unknown final state, retry next cycle".
    pub async fn set_max_charge_current(&mut self, amps: u16) -> bool {
        self.write_current(registers::MAX_CHARGE_CURRENT, amps, "max charge")
            .await
    }

    /// Set the grid charge current, clamped to [0, 185] A
    pub async fn set_grid_charge_current(&mut self, amps: u16) -> bool {
        self.write_current(registers::GRID_CHARGE_CURRENT, amps, "grid charge")
            .await
    }

    /// Set the battery max discharge current, clamped to [0, 185] A
    pub async fn set_max_discharge_current(&mut self, amps: u16) -> bool {
        self.write_current(registers::MAX_DISCHARGE_CURRENT, amps, "max discharge")
            .await
    }

    /// Write a current-limit register with retry, forcing a reconnect
    /// between attempts.
    async fn write_current(&mut self, address: u16, amps: u16, what: &str) -> bool {
        let value = amps.min(MAX_CURRENT_LIMIT_A);

        for attempt in 1..=WRITE_ATTEMPTS {
            if let Err(e) = self.connect().await {
                self.logger.warn(&format!(
                    "Write {} attempt {} could not connect: {}",
                    what, attempt, e
                ));
                continue;
            }

            match self.write_register(address, value).await {
                Ok(()) => {
                    self.logger
                        .info(&format!("Set {} current to {}A", what, value));
                    return true;
                }
                Err(e) if Self::is_acknowledge(&e) => {
                    // Device accepted the write but is still applying it
                    sleep(ACK_GRACE).await;
                    self.logger.info(&format!(
                        "Set {} current to {}A (acknowledged, delayed apply)",
                        what, value
                    ));
                    return true;
                }
                Err(e) => {
                    self.logger.warn(&format!(
                        "Write {} attempt {} failed: {}",
                        what, attempt, e
                    ));
                }
            }
        }

        self.logger.error(&format!(
            "Giving up writing {} current after {} attempts",
            what, WRITE_ATTEMPTS
        ));
        false
    }

    /// Read holding registers with timeout, dropping the handle on failure
    async fn read_block(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let timeout_duration = self.operation_timeout;

        self.logger.trace(&format!(
            "Reading {} registers from address {}",
            count, address
        ));

        let client = self.get_client()?;
        let request = client.read_holding_registers(address, count);
        let outcome = timeout(timeout_duration, request).await;

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                let error_msg = format!("Failed to read holding registers: {}", e);
                self.logger.error(&error_msg);
                self.client = None;
                Err(PhoebusError::modbus(error_msg))
            }
            Err(_) => {
                let error_msg = "Read operation timeout".to_string();
                self.logger.error(&error_msg);
                self.client = None;
                Err(PhoebusError::timeout(error_msg))
            }
        }
    }

    /// Write a single register with timeout, dropping the handle on failure
    async fn write_register(&mut self, address: u16, value: u16) -> Result<()> {
        let timeout_duration = self.operation_timeout;

        self.logger
            .debug(&format!("Writing value {} to register {}", value, address));

        let client = self.get_client()?;
        let request = client.write_single_register(address, value);
        let outcome = timeout(timeout_duration, request).await;

        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                let error_msg = format!("Failed to write register: {}", e);
                self.client = None;
                Err(PhoebusError::modbus(error_msg))
            }
            Err(_) => {
                let error_msg = "Write operation timeout".to_string();
                self.client = None;
                Err(PhoebusError::timeout(error_msg))
            }
        }
    }

    /// Get client reference or error if not connected
    fn get_client(&mut self) -> Result<&mut tokio_modbus::client::Context> {
        self.client
            .as_mut()
            .ok_or_else(|| PhoebusError::modbus("Not connected to inverter"))
    }

    /// Whether an error is the device's "acknowledged, still processing"
    /// response rather than a real failure
    fn is_acknowledge(error: &PhoebusError) -> bool {
        match error {
            PhoebusError::Modbus { message } => message.contains("Acknowledge"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry_block() -> Vec<u16> {
        let mut regs = vec![0u16; registers::TELEMETRY_COUNT as usize];
        regs[registers::SOC] = 84;
        regs[registers::BATTERY_POWER] = 65036; // -500 W, discharging
        regs[registers::GRID_LOAD_L1] = 120;
        regs[registers::GRID_LOAD_L1 + 1] = 65436; // -100 W backfeed
        regs[registers::GRID_LOAD_L1 + 2] = 0;
        regs[registers::GRID_POWER] = 60536; // -5000 W, exporting
        regs[registers::VOLTAGE_L1] = 2315;
        regs[registers::VOLTAGE_L1 + 1] = 2287;
        regs[registers::VOLTAGE_L1 + 2] = 2402;
        regs[registers::UPS_LOAD_L1] = 1500;
        regs[registers::UPS_LOAD_L1 + 1] = 700;
        regs[registers::UPS_LOAD_L1 + 2] = 300;
        regs[registers::CONSUMPTION_L1] = 1620;
        regs[registers::CONSUMPTION_L1 + 1] = 600;
        regs[registers::CONSUMPTION_L1 + 2] = 300;
        regs[registers::PV1_POWER] = 4200;
        regs[registers::PV2_POWER] = 3800;
        regs
    }

    fn status_block(grid_relay: u16) -> Vec<u16> {
        let mut regs = vec![0u16; registers::STATUS_COUNT as usize];
        regs[registers::RUN_STATE] = 2;
        regs[registers::GRID_RELAY] = grid_relay;
        regs
    }

    #[test]
    fn parse_signed_conversion() {
        assert_eq!(parse_signed(0), 0);
        assert_eq!(parse_signed(32767), 32767);
        assert_eq!(parse_signed(32768), -32768);
        assert_eq!(parse_signed(65535), -1);
        assert_eq!(parse_signed(60536), -5000);
    }

    #[test]
    fn decode_snapshot_fields() {
        let snap = InverterSnapshot::decode(&telemetry_block(), &status_block(0b0100)).unwrap();
        assert_eq!(snap.soc, 84);
        assert_eq!(snap.battery_power, -500);
        assert_eq!(snap.pv_power, 8000);
        assert_eq!(snap.grid_power, -5000);
        assert_eq!(snap.voltages, [231.5, 228.7, 240.2]);
        assert_eq!(snap.ups_loads, [1500, 700, 300]);
        assert_eq!(snap.grid_loads, [120, -100, 0]);
        assert_eq!(snap.consumption, [1620, 600, 300]);
        assert_eq!(snap.run_state, 2);
        assert!(snap.grid_connected);
    }

    #[test]
    fn decode_is_deterministic() {
        let telemetry = telemetry_block();
        let status = status_block(0b0100);
        let a = InverterSnapshot::decode(&telemetry, &status).unwrap();
        let b = InverterSnapshot::decode(&telemetry, &status).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn grid_connected_is_bit_two_only() {
        let snap = InverterSnapshot::decode(&telemetry_block(), &status_block(0b0011)).unwrap();
        assert!(!snap.grid_connected);
        let snap = InverterSnapshot::decode(&telemetry_block(), &status_block(0b0100)).unwrap();
        assert!(snap.grid_connected);
    }

    #[test]
    fn decode_rejects_short_blocks() {
        assert!(InverterSnapshot::decode(&[0u16; 10], &status_block(0)).is_err());
        assert!(InverterSnapshot::decode(&telemetry_block(), &[0u16; 10]).is_err());
    }

    #[test]
    fn snapshot_helpers() {
        let snap = InverterSnapshot::decode(&telemetry_block(), &status_block(0b0100)).unwrap();
        assert_eq!(snap.export_watts(), 5000);
        assert_eq!(snap.total_ups_load(), 2500);
        assert!((snap.max_voltage() - 240.2).abs() < f64::EPSILON);

        let mut importing = snap.clone();
        importing.grid_power = 350;
        assert_eq!(importing.export_watts(), 0);
    }

    #[test]
    fn acknowledge_classification() {
        let ack = PhoebusError::modbus("Modbus function error: Acknowledge");
        assert!(InverterLink::is_acknowledge(&ack));
        let other = PhoebusError::modbus("connection reset");
        assert!(!InverterLink::is_acknowledge(&other));
        let timeout = PhoebusError::timeout("Write operation timeout");
        assert!(!InverterLink::is_acknowledge(&timeout));
    }

    #[test]
    fn link_starts_disconnected() {
        let link = InverterLink::new(&InverterConfig::default());
        assert!(!link.is_connected());
    }
}

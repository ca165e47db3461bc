//! Configuration management for Phoebus
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files.

use crate::error::{PhoebusError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Inverter connection configuration
    pub inverter: InverterConfig,

    /// Tapo account credentials shared by all outlets
    pub tapo: TapoAuthConfig,

    /// Switched outlets under cascade control
    pub outlets: Vec<OutletConfig>,

    /// Global EMS safety parameters
    pub ems: EmsConfig,

    /// Time-of-day charge-current schedule
    pub schedule: ScheduleConfig,

    /// Overpower protection settings
    pub protection: ProtectionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Inverter polling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Outlet link cycle interval in milliseconds
    pub outlet_poll_interval_ms: u64,

    /// Timezone for schedule operations
    pub timezone: String,
}

/// Inverter connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InverterConfig {
    /// IP address or hostname of the inverter datalogger
    pub host: String,

    /// TCP port (typically 8899)
    pub port: u16,

    /// Datalogger serial number printed on the stick
    pub logger_serial: u64,
}

/// Tapo cloud account credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TapoAuthConfig {
    pub username: String,
    pub password: String,
}

/// Monitored phase selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    /// Index into the per-phase telemetry arrays
    pub fn index(self) -> usize {
        match self {
            Phase::L1 => 0,
            Phase::L2 => 1,
            Phase::L3 => 2,
        }
    }
}

impl Default for Phase {
    fn default() -> Self {
        Phase::L1
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::L1 => write!(f, "L1"),
            Phase::L2 => write!(f, "L2"),
            Phase::L3 => write!(f, "L3"),
        }
    }
}

/// Per-outlet identity, trigger thresholds and behavioral flags
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutletConfig {
    /// Stable outlet identifier
    pub outlet_id: u16,

    /// Human-readable name shown in logs
    pub name: String,

    /// IP address or hostname of the plug
    pub host: String,

    /// Cascade priority; lower number = higher priority
    pub priority: u8,

    /// Estimated load power in watts
    pub power: u32,

    /// SOC at or above which the outlet may auto-start
    pub start_soc: u16,

    /// SOC at or below which a running outlet is shut down
    pub stop_soc: u16,

    /// Target-phase voltage at or above which the outlet starts (HV dump)
    pub hv_threshold: f64,

    /// Target-phase voltage below which the undervoltage timer runs
    pub lv_threshold: f64,

    /// Seconds of sustained undervoltage before shutdown
    pub lv_delay: u64,

    /// Voltage that must hold before an LV-shutdown outlet may restart
    pub lv_recovery_voltage: f64,

    /// Seconds the recovery voltage must hold
    pub lv_recovery_delay: u64,

    /// Spare watts required on the target phase before starting
    pub headroom: i32,

    /// Phase whose voltage and load gate this outlet
    pub target_phase: Phase,

    /// SOC trigger enabled
    pub soc_enabled: bool,

    /// Voltage triggers (HV dump + LV shutdown) enabled
    pub voltage_enabled: bool,

    /// Export dump trigger enabled
    pub export_enabled: bool,

    /// Export watts at or above which the export dump fires
    pub export_limit: i32,

    /// Participate in automatic control only while off-grid
    pub off_grid_mode: bool,

    /// Hold the outlet on whenever the grid is present
    pub on_grid_always_on: bool,

    /// Seconds every higher-priority outlet must have run before this
    /// outlet may start
    pub runtime_delay: u64,
}

/// Global EMS safety parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmsConfig {
    /// Maximum watts allowed on any single UPS phase
    pub phase_max: i32,

    /// Critical low-voltage cutoff applied to every phase
    pub safety_lv: f64,

    /// Maximum combined UPS output across all three phases
    pub max_ups_total_power: i32,

    /// Disable automatic outlet control (safety interlocks stay active)
    pub manual_mode: bool,
}

/// One time-of-day charge-current slot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSlot {
    pub enabled: bool,
    pub start_hour: u8,
    pub start_min: u8,
    pub end_hour: u8,
    pub end_min: u8,
    pub max_charge_amps: u16,
    pub grid_charge_amps: u16,
    pub max_discharge_amps: u16,
}

/// Charge-current schedule container
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Whether time-of-day scheduling is active at all
    pub enabled: bool,

    /// Amps applied when no slot matches or scheduling is disabled
    pub default_max_charge_amps: u16,
    pub default_grid_charge_amps: u16,
    pub default_max_discharge_amps: u16,

    /// Time slots, first enabled match wins
    pub slots: Vec<ScheduleSlot>,
}

/// Overpower protection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Whether the adaptive boost loop runs at all
    pub enabled: bool,

    /// Inverter max-sell power in watts; refreshed from the device at startup
    pub max_sell_power: u32,

    /// Export percentage of max_sell_power at which boosting starts
    pub power_threshold_pct: u8,

    /// Export percentage of max_sell_power below which boost may unwind
    pub recovery_threshold_pct: u8,

    /// Phase voltage at which boosting starts
    pub voltage_warning: f64,

    /// Phase voltage below which boost may unwind
    pub voltage_recovery: f64,

    /// Amps added or removed per adjustment
    pub charge_step: u16,

    /// Minimum seconds between boost adjustments
    pub adjustment_interval_secs: u64,

    /// Hard ceiling for base + boost charge current in amps
    pub max_charge_limit: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Path to log file or directory
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Default for InverterConfig {
    fn default() -> Self {
        Self {
            host: "192.168.0.122".to_string(),
            port: 8899,
            logger_serial: 0,
        }
    }
}

impl Default for TapoAuthConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for OutletConfig {
    fn default() -> Self {
        Self {
            outlet_id: 1,
            name: "Heat Pump".to_string(),
            host: "192.168.0.158".to_string(),
            priority: 1,
            power: 3000,
            start_soc: 70,
            stop_soc: 32,
            hv_threshold: 252.0,
            lv_threshold: 210.0,
            lv_delay: 10,
            lv_recovery_voltage: 215.0,
            lv_recovery_delay: 30,
            headroom: 4000,
            target_phase: Phase::L1,
            soc_enabled: true,
            voltage_enabled: true,
            export_enabled: true,
            export_limit: 5000,
            off_grid_mode: false,
            on_grid_always_on: false,
            runtime_delay: 300,
        }
    }
}

impl Default for EmsConfig {
    fn default() -> Self {
        Self {
            phase_max: 7000,
            safety_lv: 185.0,
            max_ups_total_power: 16000,
            manual_mode: false,
        }
    }
}

impl Default for ScheduleSlot {
    fn default() -> Self {
        Self {
            enabled: false,
            start_hour: 0,
            start_min: 0,
            end_hour: 0,
            end_min: 0,
            max_charge_amps: 40,
            grid_charge_amps: 0,
            max_discharge_amps: 185,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_max_charge_amps: 40,
            default_grid_charge_amps: 0,
            default_max_discharge_amps: 185,
            slots: Vec::new(),
        }
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_sell_power: 12000,
            power_threshold_pct: 95,
            recovery_threshold_pct: 80,
            voltage_warning: 253.0,
            voltage_recovery: 250.0,
            charge_step: 5,
            adjustment_interval_secs: 30,
            max_charge_limit: 185,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/tmp/phoebus.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inverter: InverterConfig::default(),
            tapo: TapoAuthConfig::default(),
            outlets: vec![OutletConfig::default()],
            ems: EmsConfig::default(),
            schedule: ScheduleConfig::default(),
            protection: ProtectionConfig::default(),
            logging: LoggingConfig::default(),
            poll_interval_ms: 1200,
            outlet_poll_interval_ms: 2000,
            timezone: "UTC".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> Result<Self> {
        let default_paths = [
            "phoebus_config.yaml",
            "/data/phoebus_config.yaml",
            "/etc/phoebus/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // Fall back to default configuration
        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.inverter.host.is_empty() {
            return Err(PhoebusError::validation(
                "inverter.host",
                "Host cannot be empty",
            ));
        }

        if self.inverter.port == 0 {
            return Err(PhoebusError::validation(
                "inverter.port",
                "Port must be greater than 0",
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(PhoebusError::validation(
                "poll_interval_ms",
                "Must be greater than 0",
            ));
        }

        if self.outlet_poll_interval_ms == 0 {
            return Err(PhoebusError::validation(
                "outlet_poll_interval_ms",
                "Must be greater than 0",
            ));
        }

        let mut seen_ids = std::collections::HashSet::new();
        for outlet in &self.outlets {
            if outlet.host.is_empty() {
                return Err(PhoebusError::validation(
                    "outlets.host",
                    "Outlet host cannot be empty",
                ));
            }
            if !seen_ids.insert(outlet.outlet_id) {
                return Err(PhoebusError::validation(
                    "outlets.outlet_id",
                    "Outlet ids must be unique",
                ));
            }
            if outlet.priority == 0 {
                return Err(PhoebusError::validation(
                    "outlets.priority",
                    "Priority starts at 1",
                ));
            }
        }

        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(PhoebusError::validation(
                "timezone",
                "Unknown timezone name",
            ));
        }

        if self.protection.power_threshold_pct <= self.protection.recovery_threshold_pct {
            return Err(PhoebusError::validation(
                "protection.recovery_threshold_pct",
                "Recovery threshold must be below the boost threshold",
            ));
        }

        Ok(())
    }

    /// Parsed schedule timezone
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::Tz::UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.inverter.port, 8899);
        assert_eq!(config.poll_interval_ms, 1200);
        assert_eq!(config.outlet_poll_interval_ms, 2000);
        assert_eq!(config.outlets.len(), 1);
        assert!(!config.ems.manual_mode);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.inverter.host = String::new();
        assert!(config.validate().is_err());

        config = Config::default();
        config.inverter.port = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.outlets.push(OutletConfig::default());
        assert!(config.validate().is_err(), "duplicate outlet ids rejected");

        config = Config::default();
        config.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.inverter.port, deserialized.inverter.port);
        assert_eq!(
            config.outlets[0].target_phase,
            deserialized.outlets[0].target_phase
        );
    }

    #[test]
    fn test_phase_index() {
        assert_eq!(Phase::L1.index(), 0);
        assert_eq!(Phase::L2.index(), 1);
        assert_eq!(Phase::L3.index(), 2);
        assert_eq!(Phase::L3.to_string(), "L3");
    }
}

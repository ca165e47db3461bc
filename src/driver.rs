//! Core driver loop for Phoebus
//!
//! Runs the inverter poll cycle and feeds each snapshot through the cascade
//! engine, the charge schedule, and the overpower protection loop, in that
//! order. The inverter link is owned exclusively by this loop, so register
//! writes from the schedule and the protection controller are serialized by
//! construction.

use crate::config::Config;
use crate::engine::{CycleOutcome, EmsEngine, EmsParams};
use crate::error::Result;
use crate::inverter::{InverterLink, InverterSnapshot};
use crate::logging::get_logger;
use crate::outlet::OutletConnector;
use crate::protection::{ProtectionAction, ProtectionController};
use crate::registry::OutletRegistry;
use crate::schedule::{ScheduleKey, ScheduleResolver};
use crate::tapo::TapoConnector;
use std::time::Instant;
use tokio::time::{Duration, interval};

/// Main driver orchestrating the poll cycle
pub struct EmsDriver {
    /// Configuration
    config: Config,

    /// Inverter register link; single owner, single writer
    inverter: InverterLink,

    /// Outlet links and aggregate queries
    registry: OutletRegistry,

    /// Cascade decision engine
    engine: EmsEngine,

    /// Charge-current schedule
    schedule: ScheduleResolver,

    /// Overpower protection loop
    protection: ProtectionController,

    /// Key of the last successfully applied schedule resolution
    last_applied_schedule: Option<ScheduleKey>,

    /// Schedule-resolved max charge the protection boost rides on
    charge_base: u16,

    /// Previous cycle's outcome, to log changes at info and repeats at debug
    last_outcome: Option<CycleOutcome>,

    /// Logger
    logger: crate::logging::StructuredLogger,
}

impl EmsDriver {
    /// Create a new driver instance and spawn the outlet link tasks
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let logger = get_logger("driver");
        let inverter = InverterLink::new(&config.inverter);

        let auth = config.tapo.clone();
        let registry = OutletRegistry::spawn(
            config.outlets.clone(),
            |outlet| Box::new(TapoConnector::new(&auth, outlet)) as Box<dyn OutletConnector>,
            Duration::from_millis(config.outlet_poll_interval_ms),
        );

        let schedule = ScheduleResolver::new(config.schedule.clone());
        let protection = ProtectionController::new(config.protection.clone());
        let charge_base = config.schedule.default_max_charge_amps;

        Ok(Self {
            config,
            inverter,
            registry,
            engine: EmsEngine::new(),
            schedule,
            protection,
            last_applied_schedule: None,
            charge_base,
            last_outcome: None,
            logger,
        })
    }

    /// Run the driver main loop until ctrl-c
    pub async fn run(&mut self) -> Result<()> {
        self.logger.info("Starting EMS driver main loop");
        self.read_initial_settings().await;

        let mut poll = interval(Duration::from_millis(self.config.poll_interval_ms));
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.poll_cycle().await;
                }
                _ = &mut ctrl_c => {
                    self.logger.info("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// Seed the charge base and the protection ceiling from the device
    async fn read_initial_settings(&mut self) {
        match self.inverter.read_charge_settings().await {
            Ok((max_charge, grid_charge, max_discharge)) => {
                self.logger.info(&format!(
                    "Inverter charge settings: max {}A, grid {}A, discharge {}A",
                    max_charge, grid_charge, max_discharge
                ));
                self.charge_base = max_charge;
            }
            Err(e) => {
                self.logger
                    .warn(&format!("Could not read charge settings: {}", e));
            }
        }

        match self.inverter.read_max_sell_power().await {
            Ok(watts) => self.protection.set_max_sell_power(watts as u32),
            Err(e) => {
                self.logger
                    .warn(&format!("Could not read max sell power: {}", e));
            }
        }
    }

    /// One inverter poll cycle. A failed read means no data this cycle;
    /// the loop never terminates on errors.
    async fn poll_cycle(&mut self) {
        let snapshot = match self.inverter.read().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.logger
                    .warn(&format!("No inverter data this cycle: {}", e));
                return;
            }
        };

        self.logger.debug(&format!(
            "SOC={}% batt={}W pv={}W grid={}W V=({:.1},{:.1},{:.1}) UPS=({},{},{})W state={} grid_conn={}",
            snapshot.soc,
            snapshot.battery_power,
            snapshot.pv_power,
            snapshot.grid_power,
            snapshot.voltages[0],
            snapshot.voltages[1],
            snapshot.voltages[2],
            snapshot.ups_loads[0],
            snapshot.ups_loads[1],
            snapshot.ups_loads[2],
            snapshot.run_state,
            snapshot.grid_connected
        ));

        let params = EmsParams::from(&self.config.ems);
        let outlets = self.registry.all_outlets();
        let outcome = self
            .engine
            .process(&snapshot, &params, &outlets, &self.registry, Instant::now());

        match &self.last_outcome {
            Some(prev) if *prev == outcome => self.logger.debug(&outcome.to_string()),
            _ => self.logger.info(&outcome.to_string()),
        }
        self.last_outcome = Some(outcome);

        self.apply_schedule().await;
        self.apply_protection(&snapshot).await;
    }

    /// Resolve the schedule and write the charge triple when the resolved
    /// key changed. On a failed write the key is not recorded, so the write
    /// is retried next cycle.
    async fn apply_schedule(&mut self) {
        let now = chrono::Utc::now().with_timezone(&self.config.tz()).time();
        let (key, currents) = self.schedule.resolve(now);

        if self.last_applied_schedule.as_ref() == Some(&key) {
            return;
        }

        self.logger.info(&format!(
            "Applying charge settings: max {}A, grid {}A, discharge {}A",
            currents.max_charge, currents.grid_charge, currents.max_discharge
        ));

        let ok_max = self.inverter.set_max_charge_current(currents.max_charge).await;
        let ok_grid = self
            .inverter
            .set_grid_charge_current(currents.grid_charge)
            .await;
        let ok_discharge = self
            .inverter
            .set_max_discharge_current(currents.max_discharge)
            .await;

        if ok_max && ok_grid && ok_discharge {
            self.last_applied_schedule = Some(key);
            self.charge_base = currents.max_charge;
        } else {
            self.logger
                .warn("Failed to apply charge settings; retrying next cycle");
        }
    }

    /// Step the protection loop and write the boosted max-charge current
    /// when an adjustment fired
    async fn apply_protection(&mut self, snapshot: &InverterSnapshot) {
        let action = self.protection.step(
            snapshot.export_watts(),
            snapshot.max_voltage(),
            self.charge_base,
            Instant::now(),
        );

        if let ProtectionAction::Apply(total) = action {
            if !self.inverter.set_max_charge_current(total).await {
                self.logger
                    .warn("Failed to write boosted charge current; retrying next interval");
            }
        }
    }

    /// Stop outlet links and close the inverter connection
    async fn shutdown(&mut self) -> Result<()> {
        self.logger.info("Shutting down driver");
        self.registry.shutdown().await;
        self.inverter.disconnect().await?;
        self.logger.info("Driver shutdown complete");
        Ok(())
    }

    /// Enable or disable manual mode; safety interlocks stay active
    pub fn set_manual_mode(&mut self, enabled: bool) {
        self.config.ems.manual_mode = enabled;
    }

    /// Forward a user toggle request; also clears quarantine for the outlet
    pub fn toggle_outlet(&self, outlet_id: u16) {
        self.registry.toggle(outlet_id);
    }

    /// Registry access for status rendering
    pub fn registry(&self) -> &OutletRegistry {
        &self.registry
    }

    /// Configuration reference
    pub fn config(&self) -> &Config {
        &self.config
    }
}

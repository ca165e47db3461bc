//! Adaptive overpower protection
//!
//! Steps a charge-current boost on top of the scheduled base value to keep
//! export power and phase voltage under their ceilings, preventing inverter
//! trip-offs from excess export or overvoltage. Adjustments are gated by a
//! minimum interval; between adjustments no register write occurs.

use crate::config::ProtectionConfig;
use crate::logging::get_logger;
use std::time::{Duration, Instant};

/// Outcome of one protection step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionAction {
    /// Write this total max-charge current (base + boost) to the inverter
    Apply(u16),
    /// No register write this cycle
    Hold,
}

/// Adaptive stepping controller for the charge-current boost
pub struct ProtectionController {
    settings: ProtectionConfig,
    boost_amps: u16,
    active: bool,
    last_adjustment: Option<Instant>,
    logger: crate::logging::StructuredLogger,
}

impl ProtectionController {
    pub fn new(settings: ProtectionConfig) -> Self {
        Self {
            settings,
            boost_amps: 0,
            active: false,
            last_adjustment: None,
            logger: get_logger("protection"),
        }
    }

    /// Replace the max-sell power ceiling, e.g. after reading the real value
    /// from the inverter at startup
    pub fn set_max_sell_power(&mut self, watts: u32) {
        if watts > 0 && watts != self.settings.max_sell_power {
            self.logger
                .info(&format!("Max sell power updated to {} W", watts));
            self.settings.max_sell_power = watts;
        }
    }

    /// Current additive boost in amps
    pub fn boost_amps(&self) -> u16 {
        self.boost_amps
    }

    /// Whether a boost is currently applied
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Evaluate one cycle. `base_amps` is the schedule-resolved max charge
    /// current the boost rides on top of.
    pub fn step(
        &mut self,
        export_watts: i32,
        max_voltage: f64,
        base_amps: u16,
        now: Instant,
    ) -> ProtectionAction {
        if !self.settings.enabled {
            return ProtectionAction::Hold;
        }

        // Invariant: boost stays within [0, max_charge_limit - base]
        let ceiling = self.settings.max_charge_limit.saturating_sub(base_amps);
        if self.boost_amps > ceiling {
            self.boost_amps = ceiling;
        }

        if let Some(at) = self.last_adjustment {
            let interval = Duration::from_secs(self.settings.adjustment_interval_secs);
            if now.duration_since(at) < interval {
                return ProtectionAction::Hold;
            }
        }

        let max_sell = self.settings.max_sell_power as i64;
        let boost_trip = max_sell * self.settings.power_threshold_pct as i64 / 100;
        let recover_trip = max_sell * self.settings.recovery_threshold_pct as i64 / 100;

        let needs_boost = export_watts as i64 >= boost_trip
            || max_voltage >= self.settings.voltage_warning;
        let can_recover = (export_watts as i64) < recover_trip
            && max_voltage < self.settings.voltage_recovery;

        if needs_boost {
            let new_boost = self
                .boost_amps
                .saturating_add(self.settings.charge_step)
                .min(ceiling);
            if new_boost != self.boost_amps {
                self.boost_amps = new_boost;
                self.active = true;
                self.last_adjustment = Some(now);
                self.logger.info(&format!(
                    "Boost raised to +{}A (export {} W, max {:.1} V)",
                    new_boost, export_watts, max_voltage
                ));
                return ProtectionAction::Apply(base_amps + new_boost);
            }
            // Already at the ceiling; nothing to write
            return ProtectionAction::Hold;
        }

        if can_recover && self.boost_amps > 0 {
            self.boost_amps = self.boost_amps.saturating_sub(self.settings.charge_step);
            self.last_adjustment = Some(now);
            if self.boost_amps == 0 {
                self.active = false;
                self.logger.info("Boost cleared");
            } else {
                self.logger
                    .info(&format!("Boost lowered to +{}A", self.boost_amps));
            }
            return ProtectionAction::Apply(base_amps + self.boost_amps);
        }

        ProtectionAction::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ProtectionConfig {
        ProtectionConfig {
            enabled: true,
            max_sell_power: 10000,
            power_threshold_pct: 95,
            recovery_threshold_pct: 80,
            voltage_warning: 253.0,
            voltage_recovery: 250.0,
            charge_step: 5,
            adjustment_interval_secs: 30,
            max_charge_limit: 60,
        }
    }

    #[test]
    fn boosts_once_per_interval_on_high_export() {
        let mut ctl = ProtectionController::new(settings());
        let t0 = Instant::now();

        // 96% of max sell with a 95% threshold
        assert_eq!(ctl.step(9600, 240.0, 40, t0), ProtectionAction::Apply(45));
        assert_eq!(ctl.boost_amps(), 5);
        assert!(ctl.is_active());

        // Inside the interval: no write
        assert_eq!(
            ctl.step(9600, 240.0, 40, t0 + Duration::from_secs(10)),
            ProtectionAction::Hold
        );
        assert_eq!(ctl.boost_amps(), 5);

        // Next interval: one more step
        assert_eq!(
            ctl.step(9600, 240.0, 40, t0 + Duration::from_secs(30)),
            ProtectionAction::Apply(50)
        );
        assert_eq!(ctl.boost_amps(), 10);
    }

    #[test]
    fn boost_never_exceeds_limit_minus_base() {
        let mut ctl = ProtectionController::new(settings());
        let mut t = Instant::now();

        for _ in 0..10 {
            ctl.step(9900, 240.0, 40, t);
            t += Duration::from_secs(30);
        }
        // Ceiling is 60 - 40 = 20 A of boost
        assert_eq!(ctl.boost_amps(), 20);

        // At the ceiling further boosting holds without a write
        assert_eq!(ctl.step(9900, 240.0, 40, t), ProtectionAction::Hold);
    }

    #[test]
    fn voltage_warning_alone_triggers_boost() {
        let mut ctl = ProtectionController::new(settings());
        assert_eq!(
            ctl.step(0, 253.5, 40, Instant::now()),
            ProtectionAction::Apply(45)
        );
    }

    #[test]
    fn recovers_stepwise_to_zero_then_inactive() {
        let mut ctl = ProtectionController::new(settings());
        let t0 = Instant::now();
        ctl.step(9600, 240.0, 40, t0);
        ctl.step(9600, 240.0, 40, t0 + Duration::from_secs(30));
        assert_eq!(ctl.boost_amps(), 10);

        // 70% export, voltage calm: unwind one step per interval
        assert_eq!(
            ctl.step(7000, 240.0, 40, t0 + Duration::from_secs(60)),
            ProtectionAction::Apply(45)
        );
        assert!(ctl.is_active());
        assert_eq!(
            ctl.step(7000, 240.0, 40, t0 + Duration::from_secs(90)),
            ProtectionAction::Apply(40)
        );
        assert_eq!(ctl.boost_amps(), 0);
        assert!(!ctl.is_active());

        // Fully unwound: nothing further to write
        assert_eq!(
            ctl.step(7000, 240.0, 40, t0 + Duration::from_secs(120)),
            ProtectionAction::Hold
        );
    }

    #[test]
    fn middle_band_holds_boost() {
        let mut ctl = ProtectionController::new(settings());
        let t0 = Instant::now();
        ctl.step(9600, 240.0, 40, t0);

        // 85% export: neither boost nor recover
        assert_eq!(
            ctl.step(8500, 240.0, 40, t0 + Duration::from_secs(30)),
            ProtectionAction::Hold
        );
        assert_eq!(ctl.boost_amps(), 5);
        assert!(ctl.is_active());
    }

    #[test]
    fn high_voltage_blocks_recovery() {
        let mut ctl = ProtectionController::new(settings());
        let t0 = Instant::now();
        ctl.step(9600, 240.0, 40, t0);

        // Export is low but voltage still above recovery level
        assert_eq!(
            ctl.step(1000, 251.0, 40, t0 + Duration::from_secs(30)),
            ProtectionAction::Hold
        );
        assert_eq!(ctl.boost_amps(), 5);
    }

    #[test]
    fn base_change_reclamps_boost() {
        let mut ctl = ProtectionController::new(settings());
        let mut t = Instant::now();
        for _ in 0..4 {
            ctl.step(9900, 240.0, 40, t);
            t += Duration::from_secs(30);
        }
        assert_eq!(ctl.boost_amps(), 20);

        // Base rises to 55; ceiling shrinks to 5
        ctl.step(8500, 240.0, 55, t);
        assert_eq!(ctl.boost_amps(), 5);
    }

    #[test]
    fn disabled_controller_never_writes() {
        let mut s = settings();
        s.enabled = false;
        let mut ctl = ProtectionController::new(s);
        assert_eq!(
            ctl.step(9900, 255.0, 40, Instant::now()),
            ProtectionAction::Hold
        );
        assert_eq!(ctl.boost_amps(), 0);
    }
}

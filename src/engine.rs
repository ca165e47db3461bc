//! Cascade control engine
//!
//! Decides once per poll cycle which outlets should be on or off, subject to
//! safety interlocks, per-outlet trigger rules, hysteresis timers, and
//! priority ordering. The engine surfaces exactly one result per cycle: the
//! first state-changing or timer-reporting event encountered in priority
//! order short-circuits the rest of the evaluation. That single-action-per
//! -cycle contract is deliberate; downstream display logic depends on it.

use crate::config::{EmsConfig, OutletConfig};
use crate::inverter::InverterSnapshot;
use crate::logging::get_logger;
use crate::registry::OutletView;
use std::time::Instant;

/// Commands the engine issues toward outlets. Implemented by the registry;
/// tests substitute a recorder.
pub trait OutletCommands {
    fn request_on(&self, outlet_id: u16);
    fn request_off(&self, outlet_id: u16);
}

/// Global safety parameters for one engine cycle
#[derive(Debug, Clone)]
pub struct EmsParams {
    /// Maximum watts allowed on any single UPS phase
    pub phase_max: i32,

    /// Critical low-voltage cutoff applied to every phase
    pub safety_lv: f64,

    /// Maximum combined UPS output across all phases
    pub max_ups_total_power: i32,

    /// Automatic control disabled; safety interlocks stay active
    pub manual_mode: bool,
}

impl From<&EmsConfig> for EmsParams {
    fn from(cfg: &EmsConfig) -> Self {
        Self {
            phase_max: cfg.phase_max,
            safety_lv: cfg.safety_lv,
            max_ups_total_power: cfg.max_ups_total_power,
            manual_mode: cfg.manual_mode,
        }
    }
}

/// Tagged result of one engine cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResult {
    TapoOffline,
    SafetyTotalOverload,
    SafetyOverload,
    SafetyUndervoltage,
    ManualMode,
    ErrorSocConfig,
    ErrorVoltageConfig,
    ErrorCriticalConfig,
    OffUndervoltage,
    OffBatteryLow,
    OffGridRestored,
    OnHvDump,
    OnExportDump,
    OnAutoStart,
    OnGridAlwaysOn,
    WaitLvRecovery,
    WaitLowVoltage,
    WaitCharging,
    RunningOk,
}

impl ControlResult {
    /// Fixed display message for this result
    pub fn message(&self) -> &'static str {
        match self {
            ControlResult::TapoOffline => "TAPO OFFLINE",
            ControlResult::SafetyTotalOverload => "SAFETY KILL: TOTAL OVERLOAD",
            ControlResult::SafetyOverload => "SAFETY KILL: OVERLOAD",
            ControlResult::SafetyUndervoltage => "SAFETY KILL: UNDERVOLTAGE",
            ControlResult::ManualMode => "MANUAL MODE ACTIVE",
            ControlResult::ErrorSocConfig => "ERR: START SOC must be > STOP SOC",
            ControlResult::ErrorVoltageConfig => "ERR: HIGH V must be > LOW V",
            ControlResult::ErrorCriticalConfig => "ERR: LOW V must be > CRITICAL V",
            ControlResult::OffUndervoltage => "OFF: UNDER-VOLTAGE TIMER",
            ControlResult::OffBatteryLow => "OFF: BATTERY LOW",
            ControlResult::OffGridRestored => "OFF: GRID RESTORED",
            ControlResult::OnHvDump => "ON: HV DUMP",
            ControlResult::OnExportDump => "ON: EXPORT DUMP",
            ControlResult::OnAutoStart => "ON: AUTO-START (SOC)",
            ControlResult::OnGridAlwaysOn => "ON: GRID ALWAYS-ON",
            ControlResult::WaitLvRecovery => "Wait: LV recovery",
            ControlResult::WaitLowVoltage => "Wait: Low voltage",
            ControlResult::WaitCharging => "Wait: SOC Charging",
            ControlResult::RunningOk => "Logic: Running - All OK",
        }
    }

    /// Whether this result names a configuration error
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ControlResult::ErrorSocConfig
                | ControlResult::ErrorVoltageConfig
                | ControlResult::ErrorCriticalConfig
        )
    }

    /// Whether this result is a hard safety action
    pub fn is_safety(&self) -> bool {
        matches!(
            self,
            ControlResult::SafetyTotalOverload
                | ControlResult::SafetyOverload
                | ControlResult::SafetyUndervoltage
        )
    }
}

/// The single outcome of one engine cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub result: ControlResult,
    pub detail: String,
}

impl CycleOutcome {
    fn new<S: Into<String>>(result: ControlResult, detail: S) -> Self {
        Self {
            result,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.result.message())
        } else {
            write!(f, "{} ({})", self.result.message(), self.detail)
        }
    }
}

/// Hysteresis timers for one outlet, wall-clock based. Every timer resets
/// to unset the moment its triggering condition clears.
#[derive(Debug, Default)]
struct OutletTimers {
    outlet_id: u16,

    /// Undervoltage dwell while the outlet is on
    lv_timer_start: Option<Instant>,

    /// Sustained-recovery dwell after an undervoltage shutdown
    lv_recovery_timer_start: Option<Instant>,

    /// When the outlet was last observed transitioning to on
    runtime_start: Option<Instant>,

    /// Last turn-off was the undervoltage rule; arms the recovery gate
    lv_shutdown: bool,
}

/// Cascade decision engine
pub struct EmsEngine {
    timers: Vec<OutletTimers>,
    logger: crate::logging::StructuredLogger,
}

impl EmsEngine {
    pub fn new() -> Self {
        Self {
            timers: Vec::new(),
            logger: get_logger("engine"),
        }
    }

    /// Run one decision cycle over the latest snapshot and outlet states.
    ///
    /// `outlets` must be ordered by ascending priority (the registry's
    /// natural order). Returns the single most significant action or status
    /// of this cycle.
    pub fn process(
        &mut self,
        snapshot: &InverterSnapshot,
        params: &EmsParams,
        outlets: &[OutletView],
        commands: &dyn OutletCommands,
        now: Instant,
    ) -> CycleOutcome {
        self.sync_timers(outlets, now);

        // 1. Connectivity gate
        if !outlets.iter().any(|o| o.state.is_connected) {
            let offline: Vec<&str> = outlets.iter().map(|o| o.config.name.as_str()).collect();
            return CycleOutcome::new(ControlResult::TapoOffline, offline.join(", "));
        }

        // 2. Hard safety, always evaluated, even in manual mode
        if let Some(outcome) = self.safety_pass(snapshot, params, outlets, commands) {
            return outcome;
        }

        // 3. Manual mode suspends everything below
        if params.manual_mode {
            return CycleOutcome::new(ControlResult::ManualMode, "");
        }

        // 4. Per-outlet threshold invariants
        if let Some(outcome) = Self::validate_configs(params, outlets) {
            return outcome;
        }

        // 5. Cascade shutdown, least important outlet first
        if let Some(outcome) = self.shutdown_pass(snapshot, outlets, commands, now) {
            return outcome;
        }

        // 6. Cascade startup, highest priority first
        if let Some(outcome) = self.startup_pass(snapshot, params, outlets, commands, now) {
            return outcome;
        }

        // 7. Steady state
        if outlets
            .iter()
            .any(|o| o.state.is_connected && o.state.current_state)
        {
            CycleOutcome::new(ControlResult::RunningOk, "")
        } else {
            CycleOutcome::new(ControlResult::WaitCharging, format!("SOC: {}%", snapshot.soc))
        }
    }

    /// Keep the timer table aligned with the outlet set and observe run
    /// state transitions.
    fn sync_timers(&mut self, outlets: &[OutletView], now: Instant) {
        self.timers
            .retain(|t| outlets.iter().any(|o| o.config.outlet_id == t.outlet_id));

        for view in outlets {
            let timers = self.timers_mut(view.config.outlet_id);
            if view.state.is_connected && view.state.current_state {
                if timers.runtime_start.is_none() {
                    timers.runtime_start = Some(now);
                }
            } else {
                timers.runtime_start = None;
                timers.lv_timer_start = None;
            }
        }
    }

    fn safety_pass(
        &mut self,
        snapshot: &InverterSnapshot,
        params: &EmsParams,
        outlets: &[OutletView],
        commands: &dyn OutletCommands,
    ) -> Option<CycleOutcome> {
        let total_ups = snapshot.total_ups_load();
        let max_phase_load = snapshot.ups_loads.iter().copied().max().unwrap_or(0);
        let min_voltage = snapshot.voltages.iter().fold(f64::MAX, |a, &b| a.min(b));

        for view in outlets.iter().rev() {
            if !(view.state.is_connected && view.state.current_state) {
                continue;
            }

            if total_ups > params.max_ups_total_power {
                commands.request_off(view.config.outlet_id);
                self.logger.warn(&format!(
                    "Safety shed '{}': total UPS {} W",
                    view.config.name, total_ups
                ));
                return Some(CycleOutcome::new(
                    ControlResult::SafetyTotalOverload,
                    format!(
                        "{}: {}W > {}W",
                        view.config.name, total_ups, params.max_ups_total_power
                    ),
                ));
            }

            if max_phase_load > params.phase_max {
                commands.request_off(view.config.outlet_id);
                self.logger.warn(&format!(
                    "Safety shed '{}': phase load {} W",
                    view.config.name, max_phase_load
                ));
                return Some(CycleOutcome::new(
                    ControlResult::SafetyOverload,
                    format!(
                        "{}: Max: {}W > {}W",
                        view.config.name, max_phase_load, params.phase_max
                    ),
                ));
            }

            if min_voltage < params.safety_lv {
                commands.request_off(view.config.outlet_id);
                self.logger.warn(&format!(
                    "Safety shed '{}': {:.1} V below critical",
                    view.config.name, min_voltage
                ));
                return Some(CycleOutcome::new(
                    ControlResult::SafetyUndervoltage,
                    format!("{}: <{:.1}V", view.config.name, params.safety_lv),
                ));
            }
        }
        None
    }

    fn validate_configs(params: &EmsParams, outlets: &[OutletView]) -> Option<CycleOutcome> {
        for view in outlets.iter().filter(|o| o.state.is_connected) {
            let cfg = &view.config;
            if cfg.start_soc <= cfg.stop_soc {
                return Some(CycleOutcome::new(
                    ControlResult::ErrorSocConfig,
                    cfg.name.clone(),
                ));
            }
            if cfg.hv_threshold <= cfg.lv_threshold {
                return Some(CycleOutcome::new(
                    ControlResult::ErrorVoltageConfig,
                    cfg.name.clone(),
                ));
            }
            if cfg.lv_threshold <= params.safety_lv {
                return Some(CycleOutcome::new(
                    ControlResult::ErrorCriticalConfig,
                    cfg.name.clone(),
                ));
            }
        }
        None
    }

    /// Visit currently-on outlets from lowest to highest priority and stop
    /// at the first shutdown condition or running dwell timer.
    fn shutdown_pass(
        &mut self,
        snapshot: &InverterSnapshot,
        outlets: &[OutletView],
        commands: &dyn OutletCommands,
        now: Instant,
    ) -> Option<CycleOutcome> {
        for view in outlets.iter().rev() {
            if !(view.state.is_connected && view.state.current_state) {
                continue;
            }
            let cfg = &view.config;
            let id = cfg.outlet_id;

            if cfg.on_grid_always_on && snapshot.grid_connected {
                self.timers_mut(id).lv_timer_start = None;
                continue;
            }

            if cfg.off_grid_mode && snapshot.grid_connected {
                commands.request_off(id);
                return Some(CycleOutcome::new(
                    ControlResult::OffGridRestored,
                    cfg.name.clone(),
                ));
            }

            let v_target = snapshot.voltages[cfg.target_phase.index()];

            if cfg.voltage_enabled && v_target < cfg.lv_threshold {
                let timers = self.timers_mut(id);
                let started = *timers.lv_timer_start.get_or_insert(now);
                let elapsed = now.duration_since(started).as_secs_f64();

                if elapsed >= cfg.lv_delay as f64 {
                    timers.lv_timer_start = None;
                    timers.lv_shutdown = true;
                    commands.request_off(id);
                    return Some(CycleOutcome::new(
                        ControlResult::OffUndervoltage,
                        format!("{}: {:.1}V < {:.1}V", cfg.name, v_target, cfg.lv_threshold),
                    ));
                }

                // The running dwell timer consumes this cycle's action slot
                let remaining = cfg.lv_delay as f64 - elapsed;
                return Some(CycleOutcome::new(
                    ControlResult::OffUndervoltage,
                    format!("{}: timer {:.0}s remaining", cfg.name, remaining),
                ));
            }

            if cfg.soc_enabled && snapshot.soc <= cfg.stop_soc {
                commands.request_off(id);
                return Some(CycleOutcome::new(
                    ControlResult::OffBatteryLow,
                    format!("SOC: {}%", snapshot.soc),
                ));
            }

            self.timers_mut(id).lv_timer_start = None;
        }
        None
    }

    /// Visit off outlets by ascending priority and start the first one whose
    /// gates and triggers allow it.
    fn startup_pass(
        &mut self,
        snapshot: &InverterSnapshot,
        params: &EmsParams,
        outlets: &[OutletView],
        commands: &dyn OutletCommands,
        now: Instant,
    ) -> Option<CycleOutcome> {
        for view in outlets {
            if !view.state.is_connected
                || view.state.current_state
                || view.state.permanent_failure
            {
                continue;
            }
            let cfg = &view.config;
            let id = cfg.outlet_id;

            if cfg.on_grid_always_on && snapshot.grid_connected {
                commands.request_on(id);
                return Some(CycleOutcome::new(
                    ControlResult::OnGridAlwaysOn,
                    cfg.name.clone(),
                ));
            }
            if cfg.off_grid_mode && snapshot.grid_connected {
                continue;
            }

            if !self.priority_satisfied(cfg, outlets, now) {
                continue;
            }

            let v_target = snapshot.voltages[cfg.target_phase.index()];

            // A previous undervoltage shutdown blocks restart until the
            // recovery voltage has held for the full dwell
            if self.lv_shutdown_armed(id) {
                let recovery_delay = cfg.lv_recovery_delay;
                let recovery_voltage = cfg.lv_recovery_voltage;
                let timers = self.timers_mut(id);

                if v_target >= recovery_voltage {
                    let started = *timers.lv_recovery_timer_start.get_or_insert(now);
                    let held = now.duration_since(started).as_secs_f64();
                    if held >= recovery_delay as f64 {
                        timers.lv_shutdown = false;
                        timers.lv_recovery_timer_start = None;
                        // recovered; continue through the remaining gates
                    } else {
                        return Some(CycleOutcome::new(
                            ControlResult::WaitLvRecovery,
                            format!(
                                "{}: {:.0}/{}s at {:.1}V",
                                cfg.name, held, recovery_delay, v_target
                            ),
                        ));
                    }
                } else {
                    timers.lv_recovery_timer_start = None;
                    return Some(CycleOutcome::new(
                        ControlResult::WaitLvRecovery,
                        format!("{}: waiting for {:.1}V", cfg.name, recovery_voltage),
                    ));
                }
            }

            // Headroom gates: target phase spare capacity and total budget
            let available = params.phase_max - snapshot.ups_loads[cfg.target_phase.index()];
            if available < cfg.headroom {
                continue;
            }
            if snapshot.total_ups_load() + cfg.headroom > params.max_ups_total_power {
                continue;
            }

            let export = snapshot.export_watts();
            let export_would_fire = cfg.export_enabled && export >= cfg.export_limit;
            let soc_would_fire = cfg.soc_enabled && snapshot.soc >= cfg.start_soc;

            // Voltage floor: below the LV threshold nothing may start
            if cfg.voltage_enabled && v_target < cfg.lv_threshold {
                if export_would_fire || soc_would_fire {
                    return Some(CycleOutcome::new(
                        ControlResult::WaitLowVoltage,
                        format!("{}: {:.1}V < {:.1}V", cfg.name, v_target, cfg.lv_threshold),
                    ));
                }
                continue;
            }

            if cfg.voltage_enabled && v_target >= cfg.hv_threshold {
                commands.request_on(id);
                return Some(CycleOutcome::new(
                    ControlResult::OnHvDump,
                    format!("{}: {:.1}V", cfg.name, v_target),
                ));
            }
            if export_would_fire {
                commands.request_on(id);
                return Some(CycleOutcome::new(
                    ControlResult::OnExportDump,
                    format!("{}W", export),
                ));
            }
            if soc_would_fire {
                commands.request_on(id);
                return Some(CycleOutcome::new(
                    ControlResult::OnAutoStart,
                    format!("SOC: {}%", snapshot.soc),
                ));
            }
        }
        None
    }

    /// An outlet beyond priority 1 is only eligible once every
    /// higher-priority outlet is absent, dead, or has been continuously on
    /// for at least this outlet's runtime delay.
    fn priority_satisfied(&self, cfg: &OutletConfig, outlets: &[OutletView], now: Instant) -> bool {
        for other in outlets {
            if other.config.outlet_id == cfg.outlet_id || other.config.priority >= cfg.priority {
                continue;
            }
            if !other.state.is_connected || other.state.permanent_failure {
                continue;
            }
            if !other.state.current_state {
                return false;
            }
            let running_for = self
                .timers
                .iter()
                .find(|t| t.outlet_id == other.config.outlet_id)
                .and_then(|t| t.runtime_start)
                .map(|start| now.duration_since(start).as_secs());
            match running_for {
                Some(secs) if secs >= cfg.runtime_delay => {}
                _ => return false,
            }
        }
        true
    }

    fn lv_shutdown_armed(&self, outlet_id: u16) -> bool {
        self.timers
            .iter()
            .find(|t| t.outlet_id == outlet_id)
            .map(|t| t.lv_shutdown)
            .unwrap_or(false)
    }

    fn timers_mut(&mut self, outlet_id: u16) -> &mut OutletTimers {
        let idx = match self.timers.iter().position(|t| t.outlet_id == outlet_id) {
            Some(idx) => idx,
            None => {
                self.timers.push(OutletTimers {
                    outlet_id,
                    ..Default::default()
                });
                self.timers.len() - 1
            }
        };
        &mut self.timers[idx]
    }
}

impl Default for EmsEngine {
    fn default() -> Self {
        Self::new()
    }
}

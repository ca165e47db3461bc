//! Time-of-day charge-current schedule
//!
//! Resolves which charge-current triple applies at the current wall-clock
//! time. The resolver returns a key summarizing the decision so the caller
//! can skip register writes when nothing changed; writes to the inverter are
//! expensive and rate-sensitive.

use crate::config::{ScheduleConfig, ScheduleSlot};
use chrono::{NaiveTime, Timelike};

/// A charge-current triple in amps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeCurrents {
    pub max_charge: u16,
    pub grid_charge: u16,
    pub max_discharge: u16,
}

/// Summary of a resolution, compared against the previously applied key to
/// suppress redundant writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleKey {
    /// An enabled slot matched
    Slot {
        start: (u8, u8),
        end: (u8, u8),
        currents: ChargeCurrents,
    },
    /// No slot matched or scheduling is disabled
    Default { currents: ChargeCurrents },
}

/// Resolves the active charge-current triple from the slot table
pub struct ScheduleResolver {
    config: ScheduleConfig,
}

impl ScheduleResolver {
    pub fn new(config: ScheduleConfig) -> Self {
        Self { config }
    }

    /// Resolve the triple applicable at `now`. First enabled matching slot
    /// wins; otherwise the configured defaults apply.
    pub fn resolve(&self, now: NaiveTime) -> (ScheduleKey, ChargeCurrents) {
        let defaults = ChargeCurrents {
            max_charge: self.config.default_max_charge_amps,
            grid_charge: self.config.default_grid_charge_amps,
            max_discharge: self.config.default_max_discharge_amps,
        };

        if !self.config.enabled {
            return (ScheduleKey::Default { currents: defaults }, defaults);
        }

        let minutes = now.hour() * 60 + now.minute();
        for slot in self.config.slots.iter().filter(|s| s.enabled) {
            if slot_matches(slot, minutes) {
                let currents = ChargeCurrents {
                    max_charge: slot.max_charge_amps,
                    grid_charge: slot.grid_charge_amps,
                    max_discharge: slot.max_discharge_amps,
                };
                let key = ScheduleKey::Slot {
                    start: (slot.start_hour, slot.start_min),
                    end: (slot.end_hour, slot.end_min),
                    currents,
                };
                return (key, currents);
            }
        }

        (ScheduleKey::Default { currents: defaults }, defaults)
    }
}

/// Whether a slot covers the given minute of the day. A slot whose start is
/// after its end wraps past midnight.
fn slot_matches(slot: &ScheduleSlot, minutes: u32) -> bool {
    let start = slot.start_hour as u32 * 60 + slot.start_min as u32;
    let end = slot.end_hour as u32 * 60 + slot.end_min as u32;
    if start <= end {
        minutes >= start && minutes < end
    } else {
        minutes >= start || minutes < end
    }
}

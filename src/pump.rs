//! Pump actuation
//!
//! The core only knows "pump on" and "pump off" per reservoir slot. How a slot
//! maps onto a relay or GPIO line is up to the [`PumpDriver`] implementation.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
#[error("pump {slot}: {message}")]
pub struct PumpFault {
    pub slot: usize,
    pub message: String,
}

impl PumpFault {
    pub fn new(slot: usize, message: impl Into<String>) -> Self {
        Self {
            slot,
            message: message.into(),
        }
    }
}

/// Switches reservoir pumps.
///
/// `off` must be safe to call for a pump that is already off or was never
/// switched on.
pub trait PumpDriver: Send + Sync {
    fn on(&self, slot: usize) -> Result<(), PumpFault>;
    fn off(&self, slot: usize) -> Result<(), PumpFault>;
}

/// Holds one pump on; switches it off again when released or dropped.
pub struct PumpGuard<'a> {
    driver: &'a dyn PumpDriver,
    slot: usize,
    released: bool,
}

impl<'a> PumpGuard<'a> {
    /// Switch a pump on. If that fails the pump is still sent an `off`.
    pub fn switch_on(driver: &'a dyn PumpDriver, slot: usize) -> Result<Self, PumpFault> {
        let guard = Self {
            driver,
            slot,
            released: false,
        };
        driver.on(slot)?;
        Ok(guard)
    }

    pub fn release(mut self) -> Result<(), PumpFault> {
        self.released = true;
        self.driver.off(self.slot)
    }
}

impl Drop for PumpGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.driver.off(self.slot) {
            error!("Failed to switch off pump {}: {}", self.slot, e);
        }
    }
}

/// Driver without hardware: logs every switch and tracks which pumps are on.
pub struct SimulatedPumps {
    slot_count: usize,
    running: Mutex<BTreeSet<usize>>,
}

impl SimulatedPumps {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slot_count,
            running: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn running(&self) -> Vec<usize> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}

impl PumpDriver for SimulatedPumps {
    fn on(&self, slot: usize) -> Result<(), PumpFault> {
        if slot >= self.slot_count {
            return Err(PumpFault::new(slot, "no such pump"));
        }
        info!("Pump {} ON", slot);
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot);
        Ok(())
    }

    fn off(&self, slot: usize) -> Result<(), PumpFault> {
        if slot >= self.slot_count {
            warn!("Ignoring off for unknown pump {}", slot);
            return Ok(());
        }
        let was_on = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&slot);
        if was_on {
            info!("Pump {} OFF", slot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PumpEvent, RecordingPumps};

    #[test]
    fn guard_switches_off_on_drop() {
        let pumps = RecordingPumps::new();
        {
            let _guard = PumpGuard::switch_on(&pumps, 2).unwrap();
            assert!(pumps.is_on(2));
        }
        assert!(!pumps.is_on(2));
    }

    #[test]
    fn failed_switch_on_still_sends_off() {
        let pumps = RecordingPumps::new();
        pumps.fail_on(1);
        assert!(PumpGuard::switch_on(&pumps, 1).is_err());
        let events = pumps.events();
        assert!(matches!(events.last(), Some(PumpEvent::Off { slot: 1, .. })));
    }

    #[test]
    fn release_sends_off_once() {
        let pumps = RecordingPumps::new();
        let guard = PumpGuard::switch_on(&pumps, 0).unwrap();
        guard.release().unwrap();
        let offs = pumps
            .events()
            .iter()
            .filter(|e| matches!(e, PumpEvent::Off { .. }))
            .count();
        assert_eq!(offs, 1);
    }

    #[test]
    fn simulated_off_is_idempotent() {
        let pumps = SimulatedPumps::new(4);
        pumps.off(3).unwrap();
        pumps.on(3).unwrap();
        assert_eq!(pumps.running(), vec![3]);
        pumps.off(3).unwrap();
        pumps.off(3).unwrap();
        assert!(pumps.running().is_empty());
        assert!(pumps.on(7).is_err());
        assert!(pumps.off(7).is_ok());
    }
}

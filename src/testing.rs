//! Test doubles for pump actuation
//!
//! [`RecordingPumps`] records every switch with its (tokio) timestamp and can
//! be told to fail switching a given pump on or off.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::pump::{PumpDriver, PumpFault};

#[derive(Debug, Clone, PartialEq)]
pub enum PumpEvent {
    On { slot: usize, at: Instant },
    Off { slot: usize, at: Instant },
}

#[derive(Default)]
pub struct RecordingPumps {
    events: Mutex<Vec<PumpEvent>>,
    fail_on: Mutex<HashSet<usize>>,
    fail_off: Mutex<HashSet<usize>>,
}

impl RecordingPumps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `on` for this slot fail
    pub fn fail_on(&self, slot: usize) {
        self.fail_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot);
    }

    /// Make every `off` for this slot report a fault
    pub fn fail_off(&self, slot: usize) {
        self.fail_off
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot);
    }

    pub fn events(&self) -> Vec<PumpEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Slots in the order they were switched on
    pub fn started(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PumpEvent::On { slot, .. } => Some(slot),
                PumpEvent::Off { .. } => None,
            })
            .collect()
    }

    pub fn is_on(&self, slot: usize) -> bool {
        let mut on = false;
        for event in self.events() {
            match event {
                PumpEvent::On { slot: s, .. } if s == slot => on = true,
                PumpEvent::Off { slot: s, .. } if s == slot => on = false,
                _ => {}
            }
        }
        on
    }

    /// How long each on/off cycle of a slot lasted
    pub fn hold_times(&self, slot: usize) -> Vec<Duration> {
        let mut holds = Vec::new();
        let mut since = None;
        for event in self.events() {
            match event {
                PumpEvent::On { slot: s, at } if s == slot => since = Some(at),
                PumpEvent::Off { slot: s, at } if s == slot => {
                    if let Some(start) = since.take() {
                        holds.push(at - start);
                    }
                }
                _ => {}
            }
        }
        holds
    }

    fn record(&self, event: PumpEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl PumpDriver for RecordingPumps {
    fn on(&self, slot: usize) -> Result<(), PumpFault> {
        if self
            .fail_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&slot)
        {
            return Err(PumpFault::new(slot, "relay did not respond"));
        }
        self.record(PumpEvent::On {
            slot,
            at: Instant::now(),
        });
        Ok(())
    }

    fn off(&self, slot: usize) -> Result<(), PumpFault> {
        self.record(PumpEvent::Off {
            slot,
            at: Instant::now(),
        });
        if self
            .fail_off
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&slot)
        {
            return Err(PumpFault::new(slot, "relay stuck"));
        }
        Ok(())
    }
}

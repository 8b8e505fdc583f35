//! Dispensing orchestrator
//!
//! Runs a [`DispensePlan`] one pump at a time. Dosing is open loop: each
//! pump is held on for `amount / calibration` seconds and the planned amount
//! is trusted once the hold finishes. Timing follows the tokio timer, so a
//! hold may overrun by a few milliseconds under load.
//!
//! A run moves `Pending -> Running -> Completed | Aborted`. The first fault
//! ends the run; nothing is retried.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::availability::{DispensePlan, PlanEntry};
use crate::pump::{PumpDriver, PumpFault, PumpGuard};

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// The reservoir has no usable flow rate; its pump was never started
    Uncalibrated { slot: usize, ingredient: String },
    /// Switching the pump failed
    ActuationFault {
        slot: usize,
        ingredient: String,
        message: String,
    },
    /// Emergency stop; `slot` is the pump that was running, if any
    Cancelled { slot: Option<usize> },
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Uncalibrated { slot, ingredient } => {
                write!(f, "reservoir {} ({}) is not calibrated", slot, ingredient)
            }
            AbortReason::ActuationFault {
                slot,
                ingredient,
                message,
            } => write!(f, "pump {} ({}) failed: {}", slot, ingredient, message),
            AbortReason::Cancelled { slot: Some(slot) } => {
                write!(f, "stopped while pump {} was running", slot)
            }
            AbortReason::Cancelled { slot: None } => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    /// No entry has started yet
    Pending,
    Running,
    Completed,
    Aborted(AbortReason),
}

impl RunState {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunState::Completed)
    }
}

/// Terminal state of a run and what was pumped per reservoir slot
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub state: RunState,
    pub dispensed: BTreeMap<usize, f64>,
}

impl RunOutcome {
    pub fn total_dispensed(&self) -> f64 {
        self.dispensed.values().sum()
    }

    fn pending() -> Self {
        Self {
            state: RunState::Pending,
            dispensed: BTreeMap::new(),
        }
    }

    fn record(&mut self, slot: usize, amount_ml: f64) {
        if amount_ml > 0.0 {
            *self.dispensed.entry(slot).or_default() += amount_ml;
        }
    }
}

enum Step {
    Done(f64),
    Aborted { dispensed_ml: f64, reason: AbortReason },
}

enum Hold {
    Elapsed,
    Cancelled(Duration),
}

enum Actuation {
    Completed,
    OnFailed(PumpFault),
    OffFailed(PumpFault),
    Cancelled(Duration),
}

pub struct Orchestrator {
    pumps: Arc<dyn PumpDriver>,
}

impl Orchestrator {
    pub fn new(pumps: Arc<dyn PumpDriver>) -> Self {
        Self { pumps }
    }

    /// Execute every plan entry in order.
    ///
    /// Setting the `cancel` channel to `true` stops the run; the running
    /// pump is switched off on every exit path.
    pub async fn execute(&self, plan: &DispensePlan, cancel: &mut watch::Receiver<bool>) -> RunOutcome {
        let mut outcome = RunOutcome::pending();
        info!(
            "Dispensing {} ingredients ({:.1}ml)",
            plan.entries().len(),
            plan.total_ml()
        );

        for entry in plan.entries() {
            if *cancel.borrow() {
                warn!("Run cancelled before '{}'", entry.ingredient_name);
                outcome.state = RunState::Aborted(AbortReason::Cancelled { slot: None });
                return outcome;
            }
            if outcome.state == RunState::Pending {
                debug!("Run started with '{}'", entry.ingredient_name);
                outcome.state = RunState::Running;
            }

            match self.dispense_entry(entry, cancel).await {
                Step::Done(amount_ml) => outcome.record(entry.slot, amount_ml),
                Step::Aborted {
                    dispensed_ml,
                    reason,
                } => {
                    outcome.record(entry.slot, dispensed_ml);
                    error!("Dispensing aborted: {}", reason);
                    outcome.state = RunState::Aborted(reason);
                    return outcome;
                }
            }
        }

        info!("Dispensing completed ({:.1}ml)", outcome.total_dispensed());
        outcome.state = RunState::Completed;
        outcome
    }

    async fn dispense_entry(&self, entry: &PlanEntry, cancel: &mut watch::Receiver<bool>) -> Step {
        let uncalibrated = || Step::Aborted {
            dispensed_ml: 0.0,
            reason: AbortReason::Uncalibrated {
                slot: entry.slot,
                ingredient: entry.ingredient_name.clone(),
            },
        };

        let rate = match entry.calibration_ml_per_sec {
            Some(rate) if rate.is_finite() && rate > 0.0 => rate,
            _ => return uncalibrated(),
        };

        if entry.amount_ml <= 0.0 {
            debug!("Nothing to pour for '{}'", entry.ingredient_name);
            return Step::Done(0.0);
        }

        let Ok(duration) = Duration::try_from_secs_f64(entry.amount_ml / rate) else {
            return uncalibrated();
        };

        info!(
            "Pouring {:.1}ml of '{}' from reservoir {} ({:.2}ml/s for {:.2}s)",
            entry.amount_ml,
            entry.ingredient_name,
            entry.slot,
            rate,
            duration.as_secs_f64()
        );

        let fault = |message: String| AbortReason::ActuationFault {
            slot: entry.slot,
            ingredient: entry.ingredient_name.clone(),
            message,
        };

        match self.actuate(entry.slot, duration, cancel).await {
            Actuation::Completed => Step::Done(entry.amount_ml),
            Actuation::OnFailed(e) => Step::Aborted {
                dispensed_ml: 0.0,
                reason: fault(e.message),
            },
            // The full hold happened, so the liquid left the reservoir
            Actuation::OffFailed(e) => Step::Aborted {
                dispensed_ml: entry.amount_ml,
                reason: fault(e.message),
            },
            Actuation::Cancelled(elapsed) => {
                let estimate = (elapsed.as_secs_f64() * rate).min(entry.amount_ml);
                warn!(
                    "Pump {} stopped after {:.2}s, about {:.1}ml of '{}' poured",
                    entry.slot,
                    elapsed.as_secs_f64(),
                    estimate,
                    entry.ingredient_name
                );
                Step::Aborted {
                    dispensed_ml: estimate,
                    reason: AbortReason::Cancelled {
                        slot: Some(entry.slot),
                    },
                }
            }
        }
    }

    /// Run one pump for a fixed time outside of a recipe (calibration, cleaning)
    pub async fn run_for(
        &self,
        slot: usize,
        duration: Duration,
        label: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), AbortReason> {
        if *cancel.borrow() {
            return Err(AbortReason::Cancelled { slot: None });
        }
        info!("Running pump {} for {:.2}s ({})", slot, duration.as_secs_f64(), label);
        match self.actuate(slot, duration, cancel).await {
            Actuation::Completed => Ok(()),
            Actuation::OnFailed(e) | Actuation::OffFailed(e) => Err(AbortReason::ActuationFault {
                slot,
                ingredient: label.to_string(),
                message: e.message,
            }),
            Actuation::Cancelled(_) => Err(AbortReason::Cancelled { slot: Some(slot) }),
        }
    }

    async fn actuate(&self, slot: usize, duration: Duration, cancel: &mut watch::Receiver<bool>) -> Actuation {
        let guard = match PumpGuard::switch_on(self.pumps.as_ref(), slot) {
            Ok(guard) => guard,
            Err(e) => return Actuation::OnFailed(e),
        };

        let started = Instant::now();
        let held = hold(duration, cancel).await;
        let released = guard.release();
        debug!(
            "Pump {} held {:.3}s (target {:.3}s)",
            slot,
            started.elapsed().as_secs_f64(),
            duration.as_secs_f64()
        );

        match (held, released) {
            (Hold::Cancelled(elapsed), Ok(())) => Actuation::Cancelled(elapsed),
            (Hold::Cancelled(elapsed), Err(e)) => {
                error!("Failed to switch off pump {} after stop: {}", slot, e);
                Actuation::Cancelled(elapsed)
            }
            (Hold::Elapsed, Ok(())) => Actuation::Completed,
            (Hold::Elapsed, Err(e)) => Actuation::OffFailed(e),
        }
    }
}

/// Wait for `duration` unless the cancel flag goes up first
async fn hold(duration: Duration, cancel: &mut watch::Receiver<bool>) -> Hold {
    let started = Instant::now();
    let stop_requested = async {
        let closed = cancel.wait_for(|stop| *stop).await.is_err();
        if closed {
            // Sender gone: nobody can cancel any more
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = tokio::time::sleep(duration) => Hold::Elapsed,
        _ = stop_requested => Hold::Cancelled(started.elapsed()),
    }
}

//! The pour pipeline: scale -> check -> dispense -> settle
//!
//! A [`Station`] owns the machine: configuration, the catalog/registry
//! connection and the pump driver. Only one pump run (pour, calibration or
//! cleaning) may be active at a time; a second request gets
//! [`PourError::Busy`] instead of waiting. [`Station::emergency_stop`] may be
//! called from any task while a run is in progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use rusqlite::Connection;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::accounting::{self, SettleIssue, Settlement};
use crate::availability;
use crate::config::Config;
use crate::db;
use crate::dispense::{AbortReason, Orchestrator, RunOutcome, RunState};
use crate::error::PourError;
use crate::models::{Recipe, Reservoir, ScaledIngredient};
use crate::pump::PumpDriver;
use crate::scaling;

/// Everything a caller needs to explain how a pour went
#[derive(Debug, Clone)]
pub struct PourReport {
    pub recipe_id: i64,
    pub recipe_name: String,
    pub target_volume_ml: f64,
    pub scaled: Vec<ScaledIngredient>,
    pub outcome: RunOutcome,
    pub settlement: Settlement,
    pub log_id: Option<i64>,
}

impl PourReport {
    pub fn is_completed(&self) -> bool {
        self.outcome.state.is_completed()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleaningReport {
    pub secs_per_pump: f64,
    pub cleaned: Vec<usize>,
    pub state: RunState,
}

#[derive(Clone)]
pub struct Station {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    conn: Mutex<Connection>,
    pumps: Arc<dyn PumpDriver>,
    orchestrator: Orchestrator,
    busy: AtomicBool,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

/// Marks the station busy until dropped
struct BusyGuard<'a> {
    inner: &'a Inner,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.inner
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner.busy.store(false, Ordering::Release);
    }
}

impl Station {
    /// Build a station around an open connection, creating schema and slots as needed
    pub fn new(config: Config, conn: Connection, pumps: Arc<dyn PumpDriver>) -> anyhow::Result<Self> {
        config.validate()?;
        db::init_schema(&conn)?;
        db::init_reservoirs(&conn, config.slot_count)?;

        Ok(Self {
            inner: Arc::new(Inner {
                orchestrator: Orchestrator::new(pumps.clone()),
                config,
                conn: Mutex::new(conn),
                pumps,
                busy: AtomicBool::new(false),
                stop: Mutex::new(None),
            }),
        })
    }

    /// Open the database named in the config
    pub fn open(config: Config, pumps: Arc<dyn PumpDriver>) -> anyhow::Result<Self> {
        let conn = Connection::open(&config.database_path)
            .with_context(|| format!("Failed to open {}", config.database_path.display()))?;
        Self::new(config, conn, pumps)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.inner
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a closure against the catalog/registry database.
    ///
    /// Holds the connection lock for the duration of the closure, so it must
    /// not block on anything else.
    pub fn with_db<T>(&self, f: impl FnOnce(&mut Connection) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let mut conn = self.conn();
        f(&mut conn)
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    /// Stop the current run, if any, and switch every pump off
    pub fn emergency_stop(&self) {
        warn!("Emergency stop");
        if let Some(stop) = self
            .inner
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            stop.send_replace(true);
        }
        for slot in 0..self.inner.config.slot_count {
            if let Err(e) = self.inner.pumps.off(slot) {
                error!("Failed to switch off pump {}: {}", slot, e);
            }
        }
    }

    fn claim(&self) -> Result<(BusyGuard<'_>, watch::Receiver<bool>), PourError> {
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PourError::Busy);
        }
        let guard = BusyGuard { inner: &self.inner };
        let (tx, rx) = watch::channel(false);
        *self
            .inner
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok((guard, rx))
    }

    pub fn reservoirs(&self) -> Result<Vec<Reservoir>, PourError> {
        Ok(db::list_reservoirs(&self.conn())?)
    }

    /// Recipes that can be offered: every ingredient is bound to a reservoir
    pub fn available_recipes(&self) -> Result<Vec<Recipe>, PourError> {
        let conn = self.conn();
        let recipes = db::list_recipes(&conn)?;
        let reservoirs = db::list_reservoirs(&conn)?;
        let available = availability::available_recipes(&recipes, &reservoirs)
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        info!("{} of {} recipes available", available.len(), recipes.len());
        Ok(available)
    }

    fn load_recipe(&self, recipe_id: i64) -> Result<Recipe, PourError> {
        db::get_recipe(&self.conn(), recipe_id)?
            .ok_or_else(|| PourError::RecipeNotFound(recipe_id.to_string()))
    }

    /// Scale a recipe without pouring it
    pub fn preview(&self, recipe_id: i64, target_volume_ml: f64) -> Result<(Recipe, Vec<ScaledIngredient>), PourError> {
        let recipe = self.load_recipe(recipe_id)?;
        let scaled = scaling::scale(&recipe, target_volume_ml)?;
        Ok((recipe, scaled))
    }

    /// Pour one drink.
    ///
    /// Errors mean nothing was dispensed. Once pumps have run the result is
    /// a [`PourReport`] whose run state says whether the pour completed, and
    /// whatever was dispensed has been settled.
    ///
    /// Stop a pour with [`Station::emergency_stop`]. Dropping this future
    /// mid-run switches the running pump off but settles nothing, so the
    /// reservoir volumes are left as they were before the pour.
    pub async fn pour(&self, recipe_id: i64, target_volume_ml: f64) -> Result<PourReport, PourError> {
        let (_busy, mut cancel) = self.claim()?;

        let recipe = self.load_recipe(recipe_id)?;
        info!("Pouring '{}' ({}ml)", recipe.name, target_volume_ml);
        let scaled = scaling::scale(&recipe, target_volume_ml)?;

        let reservoirs = self.reservoirs()?;
        let plan = availability::check(&scaled, &reservoirs).map_err(PourError::Shortfall)?;

        let outcome = self.inner.orchestrator.execute(&plan, &mut cancel).await;

        let (settlement, log_id) = {
            let mut conn = self.conn();
            let settlement = match accounting::settle(&mut conn, &outcome.dispensed) {
                Ok(settlement) => settlement,
                Err(e) => {
                    error!("Settlement failed: {:#}", e);
                    unsettled(&outcome, &e)
                }
            };
            let log_id = match accounting::log_pour(&conn, recipe.id, target_volume_ml, &outcome) {
                Ok(id) => id,
                Err(e) => {
                    error!("Failed to write pour log: {:#}", e);
                    None
                }
            };
            (settlement, log_id)
        };

        if let RunState::Aborted(reason) = &outcome.state {
            warn!(
                "'{}' aborted ({}); {:.1}ml dispensed and settled, not logged",
                recipe.name,
                reason,
                outcome.total_dispensed()
            );
        }

        Ok(PourReport {
            recipe_id: recipe.id,
            recipe_name: recipe.name,
            target_volume_ml,
            scaled,
            outcome,
            settlement,
            log_id,
        })
    }

    fn ensure_slot(&self, slot: usize) -> Result<(), PourError> {
        if slot >= self.inner.config.slot_count {
            return Err(PourError::UnknownSlot(slot));
        }
        Ok(())
    }

    /// Run one pump for the configured calibration time
    pub async fn calibration_run(&self, slot: usize) -> Result<RunState, PourError> {
        self.ensure_slot(slot)?;
        let (_busy, mut cancel) = self.claim()?;
        let duration = Duration::from_secs_f64(self.inner.config.calibration_run_secs);

        let state = match self
            .inner
            .orchestrator
            .run_for(slot, duration, "calibration", &mut cancel)
            .await
        {
            Ok(()) => RunState::Completed,
            Err(reason) => RunState::Aborted(reason),
        };
        Ok(state)
    }

    /// Store the flow rate measured after a calibration run
    pub fn save_calibration(&self, slot: usize, measured_ml: f64) -> Result<f64, PourError> {
        self.ensure_slot(slot)?;
        if !(measured_ml.is_finite() && measured_ml > 0.0) {
            return Err(PourError::InvalidMeasurement(measured_ml));
        }
        let rate = measured_ml / self.inner.config.calibration_run_secs;
        db::set_calibration(&self.conn(), slot, Some(rate))?;
        info!("Reservoir {} calibrated at {:.3}ml/s", slot, rate);
        Ok(rate)
    }

    fn cleaning_secs(&self) -> f64 {
        let stored = db::get_setting(&self.conn(), db::SETTING_CLEANING_DURATION);
        match stored {
            Ok(Some(text)) => match text.trim().parse::<f64>() {
                Ok(secs) if secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok() => secs,
                _ => {
                    warn!("Invalid cleaning duration '{}', using config value", text);
                    self.inner.config.cleaning_secs_per_pump
                }
            },
            Ok(None) => self.inner.config.cleaning_secs_per_pump,
            Err(e) => {
                warn!("Cannot read cleaning duration: {:#}", e);
                self.inner.config.cleaning_secs_per_pump
            }
        }
    }

    /// Flush every pump in slot order
    pub async fn clean(&self) -> Result<CleaningReport, PourError> {
        let (_busy, mut cancel) = self.claim()?;
        let secs_per_pump = self.cleaning_secs();
        let duration = Duration::from_secs_f64(secs_per_pump);
        info!(
            "Cleaning {} pumps, {:.1}s each",
            self.inner.config.slot_count, secs_per_pump
        );

        let mut cleaned = Vec::new();
        for slot in 0..self.inner.config.slot_count {
            if let Err(reason) = self
                .inner
                .orchestrator
                .run_for(slot, duration, "cleaning", &mut cancel)
                .await
            {
                error!("Cleaning aborted: {}", reason);
                return Ok(CleaningReport {
                    secs_per_pump,
                    cleaned,
                    state: RunState::Aborted(reason),
                });
            }
            cleaned.push(slot);
        }

        Ok(CleaningReport {
            secs_per_pump,
            cleaned,
            state: RunState::Completed,
        })
    }
}

fn unsettled(outcome: &RunOutcome, e: &anyhow::Error) -> Settlement {
    Settlement {
        changes: Vec::new(),
        issues: outcome
            .dispensed
            .iter()
            .map(|(&slot, &dispensed_ml)| SettleIssue::Reconciliation {
                slot,
                dispensed_ml,
                message: format!("{:#}", e),
            })
            .collect(),
    }
}

/// Explain an aborted run to a user
pub fn describe_abort(reason: &AbortReason) -> String {
    match reason {
        AbortReason::Uncalibrated { slot, ingredient } => format!(
            "Reservoir {} ({}) has no calibration. Run a calibration first.",
            slot, ingredient
        ),
        AbortReason::ActuationFault {
            slot,
            ingredient,
            message,
        } => format!("Pump {} ({}) failed: {}. Check the pump before retrying.", slot, ingredient, message),
        AbortReason::Cancelled { .. } => "Stopped by emergency stop.".to_string(),
    }
}

//! Reservoir accounting after a dispense run
//!
//! Settlement is best effort: a reservoir whose volume cannot be read is
//! reported and skipped, the others are still debited. All writes of one
//! settlement commit together, so readers see either the volumes from before
//! the pour or the fully settled ones.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Utc;
use rusqlite::Connection;
use tracing::{error, info, warn};

use crate::db;
use crate::dispense::RunOutcome;

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeChange {
    pub slot: usize,
    pub previous_ml: f64,
    pub dispensed_ml: f64,
    pub new_ml: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleIssue {
    /// The prior volume could not be read; the slot was left untouched
    Reconciliation {
        slot: usize,
        dispensed_ml: f64,
        message: String,
    },
    /// More was dispensed than the books held; the volume was floored at zero
    Overdrawn { slot: usize, missing_ml: f64 },
    /// The new volume could not be written
    WriteFailed {
        slot: usize,
        new_ml: f64,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settlement {
    pub changes: Vec<VolumeChange>,
    pub issues: Vec<SettleIssue>,
}

impl Settlement {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Debit every reservoir for what was dispensed from it
pub fn settle(conn: &mut Connection, dispensed: &BTreeMap<usize, f64>) -> Result<Settlement> {
    let mut settlement = Settlement::default();
    if dispensed.is_empty() {
        return Ok(settlement);
    }

    let tx = conn.transaction()?;
    for (&slot, &dispensed_ml) in dispensed {
        let previous_ml = match db::get_volume(&tx, slot) {
            Ok(Some(volume)) => volume,
            Ok(None) => {
                error!("Cannot read volume of reservoir {}; {:.1}ml unaccounted", slot, dispensed_ml);
                settlement.issues.push(SettleIssue::Reconciliation {
                    slot,
                    dispensed_ml,
                    message: "no volume on record".to_string(),
                });
                continue;
            }
            Err(e) => {
                error!("Cannot read volume of reservoir {}: {}", slot, e);
                settlement.issues.push(SettleIssue::Reconciliation {
                    slot,
                    dispensed_ml,
                    message: e.to_string(),
                });
                continue;
            }
        };

        let remaining = previous_ml - dispensed_ml;
        if remaining < 0.0 {
            warn!(
                "Reservoir {} overdrawn by {:.1}ml; setting it to 0",
                slot, -remaining
            );
            settlement.issues.push(SettleIssue::Overdrawn {
                slot,
                missing_ml: -remaining,
            });
        }
        let new_ml = remaining.max(0.0);

        if let Err(e) = db::set_volume(&tx, slot, new_ml) {
            error!("Cannot update volume of reservoir {}: {}", slot, e);
            settlement.issues.push(SettleIssue::WriteFailed {
                slot,
                new_ml,
                message: e.to_string(),
            });
            continue;
        }

        info!(
            "Reservoir {}: {:.1}ml - {:.1}ml = {:.1}ml",
            slot, previous_ml, dispensed_ml, new_ml
        );
        settlement.changes.push(VolumeChange {
            slot,
            previous_ml,
            dispensed_ml,
            new_ml,
        });
    }
    tx.commit()?;

    if !settlement.is_clean() {
        warn!("Settlement finished with {} issue(s)", settlement.issues.len());
    }
    Ok(settlement)
}

/// Append a pour log entry if, and only if, the run completed
pub fn log_pour(conn: &Connection, recipe_id: i64, target_volume_ml: f64, outcome: &RunOutcome) -> Result<Option<i64>> {
    if !outcome.state.is_completed() {
        return Ok(None);
    }
    let id = db::add_pour_log_entry(conn, recipe_id, target_volume_ml, Utc::now())?;
    info!("Pour logged as entry {}", id);
    Ok(Some(id))
}

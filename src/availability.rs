//! Availability checking
//!
//! Matches scaled ingredients against a reservoir snapshot. The result is
//! all-or-nothing: a [`DispensePlan`] is produced only when every ingredient
//! has a bound reservoir holding enough liquid.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::models::{Recipe, Reservoir, ScaledIngredient};

#[derive(Debug, Clone, PartialEq)]
pub enum ShortfallReason {
    /// No reservoir is bound to the ingredient
    Unassigned,
    /// The bound reservoir holds less than required
    Insufficient { slot: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Shortfall {
    pub ingredient_id: i64,
    pub ingredient_name: String,
    pub required_ml: f64,
    pub available_ml: f64,
    pub reason: ShortfallReason,
}

impl std::fmt::Display for Shortfall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason {
            ShortfallReason::Unassigned => write!(
                f,
                "{} ({:.1}ml needed, no reservoir assigned)",
                self.ingredient_name, self.required_ml
            ),
            ShortfallReason::Insufficient { slot } => write!(
                f,
                "{} ({:.1}ml needed, only {:.1}ml in reservoir {})",
                self.ingredient_name, self.required_ml, self.available_ml, slot
            ),
        }
    }
}

/// One step of a dispense run
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    pub ingredient_id: i64,
    pub ingredient_name: String,
    pub slot: usize,
    pub amount_ml: f64,
    pub calibration_ml_per_sec: Option<f64>,
}

/// Validated ingredient -> reservoir mapping for the amounts it was checked against.
///
/// Only [`check`] builds one, so a plan always covers every scaled ingredient.
#[derive(Debug, Clone, PartialEq)]
pub struct DispensePlan {
    entries: Vec<PlanEntry>,
}

impl DispensePlan {
    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn total_ml(&self) -> f64 {
        self.entries.iter().map(|e| e.amount_ml).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn from_entries(entries: Vec<PlanEntry>) -> Self {
        Self { entries }
    }
}

fn ingredient_slots(reservoirs: &[Reservoir]) -> HashMap<i64, &Reservoir> {
    let mut by_ingredient: HashMap<i64, &Reservoir> = HashMap::new();
    for reservoir in reservoirs {
        if let Some(id) = reservoir.ingredient_id {
            if let Some(first) = by_ingredient.get(&id) {
                warn!(
                    "Ingredient {} is bound to reservoirs {} and {}; using {}",
                    id, first.slot, reservoir.slot, first.slot
                );
                continue;
            }
            by_ingredient.insert(id, reservoir);
        }
    }
    by_ingredient
}

/// Check scaled ingredients against a reservoir snapshot.
///
/// Ingredients are visited in the order given. Several lines drawing on the
/// same reservoir are checked against its volume cumulatively.
pub fn check(
    scaled: &[ScaledIngredient],
    reservoirs: &[Reservoir],
) -> Result<DispensePlan, Vec<Shortfall>> {
    let by_ingredient = ingredient_slots(reservoirs);
    let mut reserved: HashMap<usize, f64> = HashMap::new();
    let mut shortfalls = Vec::new();
    let mut entries = Vec::with_capacity(scaled.len());

    for ingredient in scaled {
        let Some(reservoir) = by_ingredient.get(&ingredient.ingredient_id) else {
            warn!(
                "No reservoir assigned for '{}' (id {})",
                ingredient.ingredient_name, ingredient.ingredient_id
            );
            shortfalls.push(Shortfall {
                ingredient_id: ingredient.ingredient_id,
                ingredient_name: ingredient.ingredient_name.clone(),
                required_ml: ingredient.amount_ml,
                available_ml: 0.0,
                reason: ShortfallReason::Unassigned,
            });
            continue;
        };

        let already = reserved.get(&reservoir.slot).copied().unwrap_or(0.0);
        let available = (reservoir.current_volume_ml - already).max(0.0);
        if available < ingredient.amount_ml {
            warn!(
                "Not enough '{}' in reservoir {}: need {:.1}ml, have {:.1}ml",
                ingredient.ingredient_name, reservoir.slot, ingredient.amount_ml, available
            );
            shortfalls.push(Shortfall {
                ingredient_id: ingredient.ingredient_id,
                ingredient_name: ingredient.ingredient_name.clone(),
                required_ml: ingredient.amount_ml,
                available_ml: available,
                reason: ShortfallReason::Insufficient {
                    slot: reservoir.slot,
                },
            });
            continue;
        }

        debug!(
            "'{}' from reservoir {}: need {:.1}ml, have {:.1}ml",
            ingredient.ingredient_name, reservoir.slot, ingredient.amount_ml, available
        );
        *reserved.entry(reservoir.slot).or_default() += ingredient.amount_ml;
        entries.push(PlanEntry {
            ingredient_id: ingredient.ingredient_id,
            ingredient_name: ingredient.ingredient_name.clone(),
            slot: reservoir.slot,
            amount_ml: ingredient.amount_ml,
            calibration_ml_per_sec: reservoir.calibration_ml_per_sec,
        });
    }

    if shortfalls.is_empty() {
        info!("All {} ingredients available", entries.len());
        Ok(DispensePlan { entries })
    } else {
        Err(shortfalls)
    }
}

/// Recipes whose every dispensed (ml) ingredient is bound to a reservoir.
///
/// Stock levels are not considered, and lines in other units (ice, garnish)
/// are added by hand so they need no reservoir.
pub fn available_recipes<'a>(recipes: &'a [Recipe], reservoirs: &[Reservoir]) -> Vec<&'a Recipe> {
    let bound = ingredient_slots(reservoirs);
    if bound.is_empty() {
        return Vec::new();
    }

    recipes
        .iter()
        .filter(|recipe| {
            let mut dispensed = recipe.lines.iter().filter(|line| line.is_volume()).peekable();
            dispensed.peek().is_some() && dispensed.all(|line| bound.contains_key(&line.ingredient_id))
        })
        .collect()
}

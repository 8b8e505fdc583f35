//! Recipe scaling
//!
//! Turns a recipe's base amounts into amounts for a requested total volume.
//! Only volume-unit lines take part: the factor is
//! `target_total / sum(base volume lines)`, so ratios between lines are kept.

use tracing::{debug, warn};

use crate::error::PourError;
use crate::models::{Amount, Recipe, RecipeIngredient, ScaledIngredient};

/// Sum of the numeric, non-negative volume-unit lines of a recipe
pub fn standard_volume(recipe: &Recipe) -> f64 {
    volume_lines(recipe).map(|(_, amount)| amount).sum()
}

fn volume_lines(recipe: &Recipe) -> impl Iterator<Item = (&RecipeIngredient, f64)> {
    recipe.lines.iter().filter_map(|line| {
        if !line.is_volume() {
            return None;
        }
        match &line.amount {
            Amount::Quantity(value) if value.is_finite() && *value >= 0.0 => Some((line, *value)),
            _ => None,
        }
    })
}

/// Scale a recipe to `target_total_ml`.
///
/// Lines in another unit are left out of the result (they cannot be pumped),
/// and lines whose amount is not a usable number are skipped with a warning.
/// Fails with [`PourError::RecipeNotScalable`] when nothing is left to scale.
pub fn scale(recipe: &Recipe, target_total_ml: f64) -> Result<Vec<ScaledIngredient>, PourError> {
    if !target_total_ml.is_finite() || target_total_ml <= 0.0 {
        return Err(PourError::InvalidTargetVolume(target_total_ml));
    }

    for line in &recipe.lines {
        if !line.is_volume() {
            debug!(
                "'{}' is given in '{}' and is not dispensed",
                line.ingredient_name, line.unit
            );
            continue;
        }
        match &line.amount {
            Amount::Quantity(value) if !value.is_finite() => warn!(
                "Skipping '{}' in '{}': amount {} is not a finite number",
                line.ingredient_name, recipe.name, value
            ),
            Amount::Quantity(value) if *value < 0.0 => warn!(
                "Skipping '{}' in '{}': negative amount {}",
                line.ingredient_name, recipe.name, value
            ),
            Amount::Unparsed(text) => warn!(
                "Skipping '{}' in '{}': amount '{}' is not a number",
                line.ingredient_name, recipe.name, text
            ),
            Amount::Quantity(_) => {}
        }
    }

    let standard_total = standard_volume(recipe);
    if standard_total <= 0.0 {
        warn!("Recipe '{}' has no scalable volume", recipe.name);
        return Err(PourError::RecipeNotScalable {
            recipe_id: recipe.id,
            name: recipe.name.clone(),
        });
    }

    let factor = target_total_ml / standard_total;
    debug!(
        "Scaling '{}': standard {}ml -> {}ml (factor {:.4})",
        recipe.name, standard_total, target_total_ml, factor
    );

    let scaled = volume_lines(recipe)
        .map(|(line, base)| {
            let amount_ml = base * factor;
            debug!(
                "  {}: {:.1}ml -> {:.1}ml",
                line.ingredient_name, base, amount_ml
            );
            ScaledIngredient {
                ingredient_id: line.ingredient_id,
                ingredient_name: line.ingredient_name.clone(),
                amount_ml,
            }
        })
        .collect();

    Ok(scaled)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn line(id: i64, name: &str, amount: Amount, unit: &str) -> RecipeIngredient {
        RecipeIngredient {
            ingredient_id: id,
            ingredient_name: name.to_string(),
            amount,
            unit: unit.to_string(),
        }
    }

    pub(crate) fn cuba_libre() -> Recipe {
        Recipe {
            id: 1,
            name: "Cuba Libre".to_string(),
            description: None,
            image_path: None,
            instructions: None,
            lines: vec![
                line(1, "Rum", Amount::Quantity(50.0), "ml"),
                line(2, "Cola", Amount::Quantity(150.0), "ml"),
                line(3, "Lime", Amount::Quantity(10.0), "ml"),
            ],
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn scales_cuba_libre_to_200ml() {
        let scaled = scale(&cuba_libre(), 200.0).unwrap();
        let amounts: Vec<f64> = scaled.iter().map(|s| (s.amount_ml * 10.0).round() / 10.0).collect();
        assert_eq!(amounts, vec![47.6, 142.9, 9.5]);
        assert_eq!(scaled[0].ingredient_name, "Rum");
    }

    #[test]
    fn standard_volume_is_identity() {
        let recipe = cuba_libre();
        let scaled = scale(&recipe, standard_volume(&recipe)).unwrap();
        for (scaled, base) in scaled.iter().zip([50.0, 150.0, 10.0]) {
            assert!(close(scaled.amount_ml, base));
        }
    }

    #[test]
    fn scaling_is_linear_in_target_volume() {
        let recipe = cuba_libre();
        let small = scale(&recipe, 150.0).unwrap();
        let large = scale(&recipe, 475.0).unwrap();
        for (s, l) in small.iter().zip(&large) {
            assert!(close(s.amount_ml / 150.0, l.amount_ml / 475.0));
        }
        // Ratios between lines are preserved
        assert!(close(large[1].amount_ml / large[0].amount_ml, 3.0));
    }

    #[test]
    fn non_volume_and_unparsed_lines_are_left_out() {
        let mut recipe = cuba_libre();
        recipe.lines.push(line(4, "Mint", Amount::Quantity(3.0), "leaves"));
        recipe.lines.push(line(5, "Bitters", Amount::Unparsed("a dash".into()), "ml"));

        let scaled = scale(&recipe, 210.0).unwrap();
        assert_eq!(scaled.len(), 3);
        assert!(scaled.iter().all(|s| s.ingredient_name != "Mint"));
        assert!(close(scaled.iter().map(|s| s.amount_ml).sum::<f64>(), 210.0));
    }

    #[test]
    fn infinite_amount_is_skipped_and_ratios_kept() {
        let mut recipe = cuba_libre();
        recipe.lines.insert(0, line(6, "Syrup", Amount::Quantity(f64::INFINITY), "ml"));

        let scaled = scale(&recipe, 200.0).unwrap();
        assert_eq!(scaled.len(), 3);
        assert!(scaled.iter().all(|s| s.amount_ml.is_finite()));
        assert_eq!(scaled[0].ingredient_name, "Rum");
        assert!(close(scaled[1].amount_ml / scaled[0].amount_ml, 3.0));
        assert!(close(scaled.iter().map(|s| s.amount_ml).sum::<f64>(), 200.0));
        assert!(close(standard_volume(&recipe), 210.0));
    }

    #[test]
    fn recipe_without_volume_is_not_scalable() {
        let mut recipe = cuba_libre();
        recipe.lines = vec![
            line(4, "Mint", Amount::Quantity(3.0), "leaves"),
            line(1, "Rum", Amount::Quantity(0.0), "ml"),
        ];
        assert!(matches!(
            scale(&recipe, 200.0),
            Err(PourError::RecipeNotScalable { recipe_id: 1, .. })
        ));
    }

    #[test]
    fn rejects_non_positive_target() {
        assert!(matches!(
            scale(&cuba_libre(), 0.0),
            Err(PourError::InvalidTargetVolume(_))
        ));
        assert!(matches!(
            scale(&cuba_libre(), f64::NAN),
            Err(PourError::InvalidTargetVolume(_))
        ));
    }
}

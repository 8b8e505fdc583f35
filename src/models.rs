//! Data models for the recipe catalog, reservoirs and the pour log

use chrono::{DateTime, Utc};

/// Unit string for the only lines that are scaled and dispensed.
pub const VOLUME_UNIT: &str = "ml";

#[derive(Debug, Clone, PartialEq)]
pub struct Ingredient {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub image_path: Option<String>,
    pub instructions: Option<String>,
    pub lines: Vec<RecipeIngredient>,
}

/// Base amount of a recipe line, as stored in the catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum Amount {
    Quantity(f64),
    /// Amount text that does not read as a number ("a dash", "1/2")
    Unparsed(String),
}

impl Amount {
    /// A numeric amount; infinities and NaN are kept as unparsed text.
    pub fn from_number(value: f64) -> Self {
        if value.is_finite() {
            Amount::Quantity(value)
        } else {
            Amount::Unparsed(value.to_string())
        }
    }

    /// Read an amount from catalog text, keeping the raw text if it is not numeric.
    pub fn parse(text: &str) -> Self {
        match text.trim().replace(',', ".").parse::<f64>() {
            Ok(value) if value.is_finite() => Amount::Quantity(value),
            _ => Amount::Unparsed(text.trim().to_string()),
        }
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Amount::Quantity(value) => write!(f, "{}", value),
            Amount::Unparsed(text) => write!(f, "{}", text),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecipeIngredient {
    pub ingredient_id: i64,
    pub ingredient_name: String,
    pub amount: Amount,
    pub unit: String,
}

impl RecipeIngredient {
    pub fn is_volume(&self) -> bool {
        self.unit.trim().eq_ignore_ascii_case(VOLUME_UNIT)
    }
}

/// One pump-fed container slot
#[derive(Debug, Clone, PartialEq)]
pub struct Reservoir {
    pub slot: usize,
    pub ingredient_id: Option<i64>,
    pub ingredient_name: Option<String>,
    pub current_volume_ml: f64,
    pub calibration_ml_per_sec: Option<f64>, // None = uncalibrated
}

impl Reservoir {
    /// Flow rate usable for timed dosing, if the pump has been calibrated.
    pub fn flow_rate(&self) -> Option<f64> {
        self.calibration_ml_per_sec
            .filter(|rate| rate.is_finite() && *rate > 0.0)
    }
}

/// An ingredient amount scaled for one pour
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledIngredient {
    pub ingredient_id: i64,
    pub ingredient_name: String,
    pub amount_ml: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PourLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub recipe_id: Option<i64>,
    pub recipe_name: Option<String>, // None once the recipe is deleted
    pub size_ml: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_parse_accepts_decimal_comma() {
        assert_eq!(Amount::parse(" 12,5 "), Amount::Quantity(12.5));
        assert_eq!(Amount::parse("50"), Amount::Quantity(50.0));
    }

    #[test]
    fn non_finite_numbers_are_not_quantities() {
        assert_eq!(Amount::from_number(2.5), Amount::Quantity(2.5));
        assert!(matches!(Amount::from_number(f64::INFINITY), Amount::Unparsed(_)));
        assert!(matches!(Amount::from_number(f64::NAN), Amount::Unparsed(_)));
    }

    #[test]
    fn amount_parse_keeps_text() {
        assert_eq!(
            Amount::parse("a dash"),
            Amount::Unparsed("a dash".to_string())
        );
        assert_eq!(Amount::parse("NaN"), Amount::Unparsed("NaN".to_string()));
    }

    #[test]
    fn volume_unit_is_case_insensitive() {
        let line = RecipeIngredient {
            ingredient_id: 1,
            ingredient_name: "Rum".to_string(),
            amount: Amount::Quantity(50.0),
            unit: " ML".to_string(),
        };
        assert!(line.is_volume());
    }

    #[test]
    fn zero_calibration_is_uncalibrated() {
        let reservoir = Reservoir {
            slot: 0,
            ingredient_id: None,
            ingredient_name: None,
            current_volume_ml: 0.0,
            calibration_ml_per_sec: Some(0.0),
        };
        assert_eq!(reservoir.flow_rate(), None);
    }
}

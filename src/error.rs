//! Errors that stop a pour before any pump runs

use thiserror::Error;

use crate::availability::Shortfall;

#[derive(Error, Debug)]
pub enum PourError {
    #[error("recipe {0} not found")]
    RecipeNotFound(String),

    #[error("recipe '{name}' (id {recipe_id}) has no volume to scale")]
    RecipeNotScalable { recipe_id: i64, name: String },

    #[error("target volume must be a positive number of ml, got {0}")]
    InvalidTargetVolume(f64),

    #[error("not enough ingredients: {}", format_shortfalls(.0))]
    Shortfall(Vec<Shortfall>),

    #[error("another pour is in progress")]
    Busy,

    #[error("unknown reservoir slot {0}")]
    UnknownSlot(usize),

    #[error("measured volume must be a positive number of ml, got {0}")]
    InvalidMeasurement(f64),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

fn format_shortfalls(shortfalls: &[Shortfall]) -> String {
    shortfalls
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

//! Cocktail dispenser
//!
//! Scales catalog recipes to a serving volume, checks them against the
//! ingredients loaded on the machine, runs the pumps for the computed times
//! and books what was poured against the reservoirs.

pub mod accounting;
pub mod availability;
pub mod config;
pub mod db;
pub mod dispense;
pub mod error;
pub mod import;
pub mod models;
pub mod pump;
pub mod scaling;
pub mod station;
pub mod testing;

pub use config::Config;
pub use error::PourError;
pub use pump::{PumpDriver, PumpFault, SimulatedPumps};
pub use station::{PourReport, Station};

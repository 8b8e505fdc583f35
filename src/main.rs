//! Cocktail Dispenser
//!
//! Command line front end for the dispensing station.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use tokio::runtime::Runtime;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cocktail_dispenser::config::Config;
use cocktail_dispenser::dispense::RunState;
use cocktail_dispenser::error::PourError;
use cocktail_dispenser::models::{Amount, Recipe};
use cocktail_dispenser::station::{PourReport, Station, describe_abort};
use cocktail_dispenser::{db, import, SimulatedPumps};

#[derive(Parser)]
#[command(name = "cocktail-dispenser")]
#[command(about = "Scale cocktail recipes and pour them through metered pumps")]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the SQLite database (overrides the config)
    #[arg(short, long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize empty database with schema and reservoir slots
    Init,

    /// Load a small sample catalog and bar setup
    LoadSample,

    /// Import recipes from a directory of YAML files
    Import {
        /// Directory to scan for *.yaml / *.yml recipe files
        dir: PathBuf,

        /// Clear the catalog before importing
        #[arg(long)]
        clear: bool,
    },

    /// List all ingredients in the catalog
    Ingredients,

    /// List recipes that can be poured with the current reservoirs
    Recipes {
        /// List every recipe in the catalog
        #[arg(short, long)]
        all: bool,
    },

    /// Show a recipe scaled to a serving volume
    Scale {
        /// Recipe id or name
        recipe: String,

        #[command(flatten)]
        volume: VolumeArgs,
    },

    /// Pour a recipe (Ctrl-C is an emergency stop)
    Pour {
        /// Recipe id or name
        recipe: String,

        #[command(flatten)]
        volume: VolumeArgs,
    },

    /// Show reservoir slots, volumes and calibrations
    Reservoirs,

    /// Bind an ingredient to a reservoir slot ("none" clears the slot)
    Bind { slot: usize, ingredient: String },

    /// Record the volume in a reservoir after refilling it
    SetVolume { slot: usize, volume_ml: f64 },

    /// Set a pump flow rate directly
    SetCalibration { slot: usize, ml_per_sec: f64 },

    /// Run one pump for the calibration time
    Calibrate { slot: usize },

    /// Store the volume measured after `calibrate`
    SaveCalibration { slot: usize, measured_ml: f64 },

    /// Flush every pump in turn
    Clean,

    /// Show the most recent pours
    Log {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Read or write a stored setting
    Setting {
        #[command(subcommand)]
        action: SettingAction,
    },
}

#[derive(clap::Args)]
struct VolumeArgs {
    /// Glass size name (e.g. "Large")
    #[arg(short, long, conflicts_with = "volume")]
    size: Option<String>,

    /// Serving volume in ml
    #[arg(short, long)]
    volume: Option<f64>,
}

#[derive(Subcommand)]
enum SettingAction {
    Get { key: String },
    Set { key: String, value: String },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    let pumps = Arc::new(SimulatedPumps::new(config.slot_count));
    let station = Station::open(config, pumps)?;

    let runtime = Runtime::new()?;
    runtime.block_on(run(station, cli.command))
}

async fn run(station: Station, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            println!(
                "Database initialized at: {} ({} reservoirs)",
                station.config().database_path.display(),
                station.config().slot_count
            );
        }

        Commands::LoadSample => {
            station.with_db(|conn| load_sample_data(conn))?;
            println!("Sample data loaded successfully!");
        }

        Commands::Import { dir, clear } => {
            let stats = station.with_db(|conn| {
                if clear {
                    println!("Clearing existing catalog...");
                    db::clear_catalog(conn)?;
                }
                import::import_directory(conn, &dir)
            })?;
            println!("\n{}", stats);
        }

        Commands::Ingredients => {
            let ingredients = station.with_db(|conn| db::list_ingredients(conn))?;
            if ingredients.is_empty() {
                println!("No ingredients in database. Run 'import' or 'load-sample' first.");
            } else {
                for i in ingredients {
                    println!("{:>4}  {}", i.id, i.name);
                }
            }
        }

        Commands::Recipes { all } => {
            let recipes = if all {
                station.with_db(|conn| db::list_recipes(conn))?
            } else {
                station.available_recipes()?
            };
            if recipes.is_empty() {
                if all {
                    println!("No recipes in database. Run 'import' or 'load-sample' first.");
                } else {
                    println!("No recipe can be poured with the current reservoirs.");
                }
            } else {
                for r in recipes {
                    println!("{:>4}  {}", r.id, r.name);
                }
            }
        }

        Commands::Scale { recipe, volume } => {
            let recipe = find_recipe(&station, &recipe)?;
            let target = target_volume(&station, &volume)?;
            let (recipe, scaled) = station.preview(recipe.id, target)?;

            println!("{} for {}ml:\n", recipe.name, target);
            for s in &scaled {
                println!("  {:<24} {:>8.1} ml", s.ingredient_name, s.amount_ml);
            }
            print_manual_lines(&recipe);
        }

        Commands::Pour { recipe, volume } => {
            let recipe = find_recipe(&station, &recipe)?;
            let target = target_volume(&station, &volume)?;
            let stopper = spawn_emergency_stop(&station);
            let result = station.pour(recipe.id, target).await;
            stopper.abort();

            match result {
                Ok(report) => {
                    print_pour_report(&report);
                    print_manual_lines(&recipe);
                }
                Err(PourError::Shortfall(shortfalls)) => {
                    println!("Cannot pour {}, missing:", recipe.name);
                    for s in shortfalls {
                        println!("  {}", s);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Reservoirs => {
            let reservoirs = station.reservoirs()?;
            println!(
                "{:<5} {:<24} {:>10} {:>12}",
                "Slot", "Ingredient", "Volume", "Flow (ml/s)"
            );
            println!("{}", "-".repeat(54));
            for r in reservoirs {
                let calibration = match r.flow_rate() {
                    Some(rate) => format!("{:.3}", rate),
                    None => "-".to_string(),
                };
                println!(
                    "{:<5} {:<24} {:>10.1} {:>12}",
                    r.slot,
                    r.ingredient_name.as_deref().unwrap_or("(empty)"),
                    r.current_volume_ml,
                    calibration
                );
            }
        }

        Commands::Bind { slot, ingredient } => {
            station.with_db(|conn| {
                let ingredient_id = if ingredient.eq_ignore_ascii_case("none") {
                    None
                } else {
                    match db::get_ingredient_by_name(conn, &ingredient)? {
                        Some(i) => Some(i.id),
                        None => bail!("Ingredient '{}' not found", ingredient),
                    }
                };
                db::bind(conn, slot, ingredient_id)
            })?;
            println!("Reservoir {} bound to {}", slot, ingredient);
        }

        Commands::SetVolume { slot, volume_ml } => {
            station.with_db(|conn| db::set_volume(conn, slot, volume_ml))?;
            println!("Reservoir {} now holds {}ml", slot, volume_ml);
        }

        Commands::SetCalibration { slot, ml_per_sec } => {
            station.with_db(|conn| db::set_calibration(conn, slot, Some(ml_per_sec)))?;
            println!("Reservoir {} calibrated at {}ml/s", slot, ml_per_sec);
        }

        Commands::Calibrate { slot } => {
            let secs = station.config().calibration_run_secs;
            println!("Running pump {} for {}s, collect the output...", slot, secs);
            let stopper = spawn_emergency_stop(&station);
            let state = station.calibration_run(slot).await;
            stopper.abort();

            match state? {
                RunState::Aborted(reason) => println!("{}", describe_abort(&reason)),
                _ => println!(
                    "Done. Measure the volume and run: save-calibration {} <ml>",
                    slot
                ),
            }
        }

        Commands::SaveCalibration { slot, measured_ml } => {
            let rate = station.save_calibration(slot, measured_ml)?;
            println!("Reservoir {} calibrated at {:.3}ml/s", slot, rate);
        }

        Commands::Clean => {
            let stopper = spawn_emergency_stop(&station);
            let report = station.clean().await;
            stopper.abort();

            let report = report?;
            println!(
                "Cleaned {} pumps at {:.1}s each",
                report.cleaned.len(),
                report.secs_per_pump
            );
            if let RunState::Aborted(reason) = &report.state {
                println!("{}", describe_abort(reason));
            }
        }

        Commands::Log { limit } => {
            let entries = station.with_db(|conn| db::pour_log(conn, limit))?;
            if entries.is_empty() {
                println!("Nothing poured yet.");
            }
            for e in entries {
                println!(
                    "{}  {:<24} {:>6.0} ml",
                    e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    e.recipe_name.as_deref().unwrap_or("(deleted recipe)"),
                    e.size_ml
                );
            }
        }

        Commands::Setting { action } => match action {
            SettingAction::Get { key } => {
                match station.with_db(|conn| db::get_setting(conn, &key))? {
                    Some(value) => println!("{} = {}", key, value),
                    None => println!("{} is not set", key),
                }
            }
            SettingAction::Set { key, value } => {
                station.with_db(|conn| db::set_setting(conn, &key, &value))?;
                println!("{} = {}", key, value);
            }
        },
    }

    Ok(())
}

fn find_recipe(station: &Station, key: &str) -> Result<Recipe> {
    match station.with_db(|conn| db::find_recipe(conn, key))? {
        Some(recipe) => Ok(recipe),
        None => bail!("Recipe '{}' not found", key),
    }
}

fn target_volume(station: &Station, args: &VolumeArgs) -> Result<f64> {
    let stored = station.with_db(|conn| db::get_setting(conn, db::SETTING_GLASS_SIZE))?;
    station
        .config()
        .target_volume(args.volume, args.size.as_deref(), stored.as_deref())
}

/// Turn Ctrl-C into an emergency stop for as long as the task lives
fn spawn_emergency_stop(station: &Station) -> tokio::task::JoinHandle<()> {
    let station = station.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Emergency stop requested");
            station.emergency_stop();
        }
    })
}

fn print_pour_report(report: &PourReport) {
    match &report.outcome.state {
        RunState::Aborted(reason) => {
            println!("{} was not completed. {}", report.recipe_name, describe_abort(reason));
        }
        _ => println!("{} ({}ml) poured.", report.recipe_name, report.target_volume_ml),
    }

    for change in &report.settlement.changes {
        println!(
            "  reservoir {}: {:.1} -> {:.1} ml (-{:.1})",
            change.slot, change.previous_ml, change.new_ml, change.dispensed_ml
        );
    }
    for issue in &report.settlement.issues {
        println!("  warning: {:?}", issue);
    }
}

/// Lines the machine does not pour, then the serving instructions
fn print_manual_lines(recipe: &Recipe) {
    let manual: Vec<_> = recipe
        .lines
        .iter()
        .filter(|line| !(line.is_volume() && matches!(line.amount, Amount::Quantity(v) if v >= 0.0)))
        .collect();
    if !manual.is_empty() {
        println!("\nAdd by hand:");
        for line in manual {
            println!("  {} {} {}", line.amount, line.unit, line.ingredient_name);
        }
    }
    if let Some(instructions) = &recipe.instructions {
        println!("\n{}", instructions);
    }
}

/// Load a sample catalog and bar setup for trying the machine without recipe files
fn load_sample_data(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    db::clear_catalog(&tx)?;

    let rum = db::add_ingredient(&tx, "White rum")?;
    let cola = db::add_ingredient(&tx, "Cola")?;
    let lime = db::add_ingredient(&tx, "Lime juice")?;
    let vodka = db::add_ingredient(&tx, "Vodka")?;
    let orange = db::add_ingredient(&tx, "Orange juice")?;
    let ice = db::add_ingredient(&tx, "Ice cubes")?;

    let cuba_libre = db::add_recipe(
        &tx,
        "Cuba Libre",
        Some("Rum, cola and lime."),
        Some("images/cuba_libre.png"),
        Some("Fill the glass with ice before pouring. Garnish with a lime wedge."),
    )?;
    db::add_recipe_line(&tx, cuba_libre, rum, &Amount::Quantity(50.0), "ml")?;
    db::add_recipe_line(&tx, cuba_libre, cola, &Amount::Quantity(150.0), "ml")?;
    db::add_recipe_line(&tx, cuba_libre, lime, &Amount::Quantity(10.0), "ml")?;
    db::add_recipe_line(&tx, cuba_libre, ice, &Amount::Quantity(4.0), "pcs")?;

    // Vodka and orange juice are not loaded, so this one is unavailable
    let screwdriver = db::add_recipe(
        &tx,
        "Screwdriver",
        Some("Vodka and orange juice."),
        None,
        Some("Serve over ice."),
    )?;
    db::add_recipe_line(&tx, screwdriver, vodka, &Amount::Quantity(50.0), "ml")?;
    db::add_recipe_line(&tx, screwdriver, orange, &Amount::Quantity(100.0), "ml")?;

    for (slot, ingredient, volume, rate) in [(0, rum, 700.0, 5.5), (1, cola, 1000.0, 8.1), (2, lime, 250.0, 4.0)] {
        db::bind(&tx, slot, Some(ingredient))?;
        db::set_volume(&tx, slot, volume)?;
        db::set_calibration(&tx, slot, Some(rate))?;
    }

    tx.commit()?;
    Ok(())
}

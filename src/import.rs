//! Recipe catalog import
//!
//! Reads recipe definitions from a directory of YAML files, one recipe per
//! file:
//!
//! ```yaml
//! name: Cuba Libre
//! description: A classic.
//! image: images/cuba_libre.png
//! instructions: Build over ice, stir gently.
//! ingredients:
//!   - ingredient: Rum
//!     amount: 50
//!   - ingredient: Cola
//!     amount: 150 ml
//!   - ingredient: Mint
//!     amount: 3
//!     unit: leaves
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use rusqlite::Connection;
use serde::Deserialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::db;
use crate::models::{Amount, VOLUME_UNIT};

// "50", "12.5 ml", "1,5cl"
static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([0-9]+(?:[.,][0-9]+)?)\s*([A-Za-z]+)?\s*$").expect("valid amount pattern")
});

#[derive(Debug, Deserialize)]
struct RecipeFile {
    name: String,
    description: Option<String>,
    image: Option<String>,
    instructions: Option<String>,
    #[serde(default)]
    ingredients: Vec<LineFile>,
}

#[derive(Debug, Deserialize)]
struct LineFile {
    ingredient: String,
    amount: RawAmount,
    unit: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Number(f64),
    Text(String),
}

/// Split a raw amount into a value and a unit.
///
/// An explicit unit wins over one written into the amount text; with neither
/// the line is taken to be in ml.
fn parse_line_amount(raw: &RawAmount, unit: Option<&str>) -> (Amount, String) {
    let explicit = unit.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
    match raw {
        RawAmount::Number(value) => (
            Amount::from_number(*value),
            explicit.unwrap_or_else(|| VOLUME_UNIT.to_string()),
        ),
        RawAmount::Text(text) => match AMOUNT_RE.captures(text) {
            Some(cap) => {
                let amount = Amount::parse(&cap[1]);
                let unit = explicit
                    .or_else(|| cap.get(2).map(|m| m.as_str().to_string()))
                    .unwrap_or_else(|| VOLUME_UNIT.to_string());
                (amount, unit)
            }
            None => (
                Amount::Unparsed(text.trim().to_string()),
                explicit.unwrap_or_else(|| VOLUME_UNIT.to_string()),
            ),
        },
    }
}

/// Find all *.yaml / *.yml files below a directory
pub fn find_recipe_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        })
        .collect();
    files.sort();
    files
}

fn parse_recipe_file(path: &Path) -> Result<RecipeFile> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let recipe: RecipeFile = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    if recipe.name.trim().is_empty() {
        bail!("{}: recipe name is empty", path.display());
    }
    if recipe.ingredients.is_empty() {
        bail!("{}: recipe '{}' has no ingredients", path.display(), recipe.name);
    }
    Ok(recipe)
}

/// Outcome of storing one recipe file
enum Stored {
    Added { lines: usize },
    AlreadyPresent,
}

fn store_recipe(conn: &mut Connection, recipe: &RecipeFile) -> Result<Stored> {
    let tx = conn.transaction()?;

    if let Some(existing) = db::get_recipe_by_name(&tx, &recipe.name)? {
        if !existing.lines.is_empty() {
            return Ok(Stored::AlreadyPresent);
        }
    }

    let recipe_id = db::add_recipe(
        &tx,
        &recipe.name,
        recipe.description.as_deref(),
        recipe.image.as_deref(),
        recipe.instructions.as_deref(),
    )?;

    for line in &recipe.ingredients {
        let ingredient_id = db::add_ingredient(&tx, &line.ingredient)?;
        let (amount, unit) = parse_line_amount(&line.amount, line.unit.as_deref());
        if let Amount::Unparsed(text) = &amount {
            warn!(
                "'{}' in '{}': amount '{}' kept as text",
                line.ingredient, recipe.name, text
            );
        }
        db::add_recipe_line(&tx, recipe_id, ingredient_id, &amount, &unit)?;
    }

    tx.commit()?;
    Ok(Stored::Added {
        lines: recipe.ingredients.len(),
    })
}

/// Import every recipe file below `dir` into the catalog
pub fn import_directory(conn: &mut Connection, dir: &Path) -> Result<ImportStats> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let mut stats = ImportStats::default();
    let files = find_recipe_files(dir);
    info!("Found {} recipe files in {}", files.len(), dir.display());

    for path in &files {
        let recipe = match parse_recipe_file(path) {
            Ok(recipe) => recipe,
            Err(e) => {
                warn!("{:#}", e);
                stats.errors += 1;
                continue;
            }
        };

        match store_recipe(conn, &recipe) {
            Ok(Stored::Added { lines }) => {
                debug!("Imported '{}' ({} lines)", recipe.name, lines);
                stats.recipes += 1;
                stats.lines += lines;
            }
            Ok(Stored::AlreadyPresent) => {
                debug!("'{}' already in the catalog", recipe.name);
                stats.skipped += 1;
            }
            Err(e) => {
                warn!("Failed to store '{}': {:#}", recipe.name, e);
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}

#[derive(Debug, Default, PartialEq)]
pub struct ImportStats {
    pub recipes: usize,
    pub lines: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl std::fmt::Display for ImportStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Imported {} recipes ({} ingredient lines). Skipped: {}, Errors: {}",
            self.recipes, self.lines, self.skipped, self.errors
        )
    }
}

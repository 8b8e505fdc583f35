//! Database schema and operations
//!
//! Rows are decoded here into the named records of [`crate::models`]; nothing
//! outside this module reads positional columns.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row};

use crate::models::{Amount, Ingredient, PourLogEntry, Recipe, RecipeIngredient, Reservoir};

pub const SETTING_GLASS_SIZE: &str = "SelectedGlassSize";
pub const SETTING_CLEANING_DURATION: &str = "CleaningDurationPerPump";

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS ingredients (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE COLLATE NOCASE
        );

        CREATE TABLE IF NOT EXISTS recipes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE COLLATE NOCASE,
            description TEXT,
            image_path TEXT,
            instructions TEXT
        );

        -- Line order is insertion order
        CREATE TABLE IF NOT EXISTS recipe_ingredients (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recipe_id INTEGER NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
            ingredient_id INTEGER NOT NULL REFERENCES ingredients(id) ON DELETE CASCADE,
            amount REAL NOT NULL,
            unit TEXT NOT NULL DEFAULT 'ml'
        );

        CREATE TABLE IF NOT EXISTS reservoirs (
            slot INTEGER PRIMARY KEY,
            ingredient_id INTEGER REFERENCES ingredients(id) ON DELETE SET NULL,
            current_volume_ml REAL NOT NULL DEFAULT 0.0,
            calibration_ml_per_sec REAL
        );

        -- A reservoir binds at most one ingredient, an ingredient sits in at most one reservoir
        CREATE UNIQUE INDEX IF NOT EXISTS idx_reservoirs_ingredient
            ON reservoirs(ingredient_id) WHERE ingredient_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY COLLATE NOCASE,
            value TEXT
        );

        CREATE TABLE IF NOT EXISTS pour_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            recipe_id INTEGER REFERENCES recipes(id) ON DELETE SET NULL,
            size_ml REAL NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_recipe_ingredients_recipe ON recipe_ingredients(recipe_id);
        CREATE INDEX IF NOT EXISTS idx_pour_log_timestamp ON pour_log(timestamp);
        "#,
    )?;
    Ok(())
}

/// Make sure reservoir rows 0..slot_count exist
pub fn init_reservoirs(conn: &Connection, slot_count: usize) -> Result<()> {
    let mut stmt = conn.prepare("INSERT OR IGNORE INTO reservoirs (slot) VALUES (?1)")?;
    for slot in 0..slot_count {
        stmt.execute([slot as i64])?;
    }
    Ok(())
}

/// Clear the recipe catalog and reservoir bindings (for reloading sample data)
pub fn clear_catalog(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        UPDATE reservoirs SET ingredient_id = NULL;
        DELETE FROM recipe_ingredients;
        DELETE FROM recipes;
        DELETE FROM ingredients;
        "#,
    )?;
    Ok(())
}

// ========== Ingredients ==========

/// Insert an ingredient, returning the existing id if the name is already known
pub fn add_ingredient(conn: &Connection, name: &str) -> Result<i64> {
    let name = name.trim();
    if name.is_empty() {
        bail!("ingredient name must not be empty");
    }
    if let Some(existing) = get_ingredient_by_name(conn, name)? {
        return Ok(existing.id);
    }
    conn.execute("INSERT INTO ingredients (name) VALUES (?1)", [name])?;
    Ok(conn.last_insert_rowid())
}

pub fn get_ingredient_by_name(conn: &Connection, name: &str) -> Result<Option<Ingredient>> {
    let ingredient = conn
        .query_row(
            "SELECT id, name FROM ingredients WHERE name = ?1 COLLATE NOCASE",
            [name.trim()],
            |row| {
                Ok(Ingredient {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(ingredient)
}

pub fn list_ingredients(conn: &Connection) -> Result<Vec<Ingredient>> {
    let mut stmt = conn.prepare("SELECT id, name FROM ingredients ORDER BY name COLLATE NOCASE")?;

    let rows = stmt.query_map([], |row| {
        Ok(Ingredient {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    })?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

// ========== Recipes ==========

/// Insert a recipe, returning the existing id if the name is already known
pub fn add_recipe(
    conn: &Connection,
    name: &str,
    description: Option<&str>,
    image_path: Option<&str>,
    instructions: Option<&str>,
) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM recipes WHERE name = ?1 COLLATE NOCASE",
            [name.trim()],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO recipes (name, description, image_path, instructions)
         VALUES (?1, ?2, ?3, ?4)",
        (name.trim(), description, image_path, instructions),
    )?;
    Ok(conn.last_insert_rowid())
}

/// Append an ingredient line to a recipe
pub fn add_recipe_line(
    conn: &Connection,
    recipe_id: i64,
    ingredient_id: i64,
    amount: &Amount,
    unit: &str,
) -> Result<()> {
    let stored = match amount {
        Amount::Quantity(value) => Value::Real(*value),
        Amount::Unparsed(text) => Value::Text(text.clone()),
    };
    conn.execute(
        "INSERT INTO recipe_ingredients (recipe_id, ingredient_id, amount, unit)
         VALUES (?1, ?2, ?3, ?4)",
        (recipe_id, ingredient_id, stored, unit.trim()),
    )?;
    Ok(())
}

/// Get the ordered ingredient lines of a recipe
pub fn get_recipe_lines(conn: &Connection, recipe_id: i64) -> Result<Vec<RecipeIngredient>> {
    let mut stmt = conn.prepare(
        "SELECT ri.ingredient_id, i.name, ri.amount, ri.unit
         FROM recipe_ingredients ri
         JOIN ingredients i ON ri.ingredient_id = i.id
         WHERE ri.recipe_id = ?1
         ORDER BY ri.id",
    )?;

    let rows = stmt.query_map([recipe_id], |row| {
        Ok(RecipeIngredient {
            ingredient_id: row.get(0)?,
            ingredient_name: row.get(1)?,
            amount: decode_amount(row.get(2)?),
            unit: row.get(3)?,
        })
    })?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

fn decode_amount(value: Value) -> Amount {
    match value {
        Value::Real(v) => Amount::from_number(v),
        Value::Integer(v) => Amount::Quantity(v as f64),
        Value::Text(text) => Amount::parse(&text),
        Value::Null => Amount::Unparsed(String::new()),
        Value::Blob(bytes) => Amount::Unparsed(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

fn recipe_header(row: &Row<'_>) -> rusqlite::Result<Recipe> {
    Ok(Recipe {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        image_path: row.get(3)?,
        instructions: row.get(4)?,
        lines: Vec::new(),
    })
}

pub fn get_recipe(conn: &Connection, recipe_id: i64) -> Result<Option<Recipe>> {
    let recipe = conn
        .query_row(
            "SELECT id, name, description, image_path, instructions FROM recipes WHERE id = ?1",
            [recipe_id],
            recipe_header,
        )
        .optional()?;

    match recipe {
        Some(mut recipe) => {
            recipe.lines = get_recipe_lines(conn, recipe.id)?;
            Ok(Some(recipe))
        }
        None => Ok(None),
    }
}

pub fn get_recipe_by_name(conn: &Connection, name: &str) -> Result<Option<Recipe>> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM recipes WHERE name = ?1 COLLATE NOCASE",
            [name.trim()],
            |row| row.get(0),
        )
        .optional()?;

    match id {
        Some(id) => get_recipe(conn, id),
        None => Ok(None),
    }
}

/// Look a recipe up by numeric id or, failing that, by name
pub fn find_recipe(conn: &Connection, key: &str) -> Result<Option<Recipe>> {
    if let Ok(id) = key.trim().parse::<i64>() {
        if let Some(recipe) = get_recipe(conn, id)? {
            return Ok(Some(recipe));
        }
    }
    get_recipe_by_name(conn, key)
}

/// List all recipes with their lines, in name order
pub fn list_recipes(conn: &Connection) -> Result<Vec<Recipe>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, image_path, instructions
         FROM recipes ORDER BY name COLLATE NOCASE",
    )?;

    let rows = stmt.query_map([], recipe_header)?;

    let mut results = Vec::new();
    for row in rows {
        let mut recipe = row?;
        recipe.lines = get_recipe_lines(conn, recipe.id)?;
        results.push(recipe);
    }
    Ok(results)
}

// ========== Reservoirs ==========

fn reservoir_row(row: &Row<'_>) -> rusqlite::Result<Reservoir> {
    let slot: i64 = row.get(0)?;
    let volume: Option<f64> = row.get(3)?;
    Ok(Reservoir {
        slot: slot as usize,
        ingredient_id: row.get(1)?,
        ingredient_name: row.get(2)?,
        current_volume_ml: volume.unwrap_or(0.0),
        calibration_ml_per_sec: row.get(4)?,
    })
}

/// Read every reservoir slot in one statement
pub fn list_reservoirs(conn: &Connection) -> Result<Vec<Reservoir>> {
    let mut stmt = conn.prepare(
        "SELECT r.slot, r.ingredient_id, i.name, r.current_volume_ml, r.calibration_ml_per_sec
         FROM reservoirs r
         LEFT JOIN ingredients i ON r.ingredient_id = i.id
         ORDER BY r.slot",
    )?;

    let rows = stmt.query_map([], reservoir_row)?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

pub fn get_reservoir(conn: &Connection, slot: usize) -> Result<Option<Reservoir>> {
    let reservoir = conn
        .query_row(
            "SELECT r.slot, r.ingredient_id, i.name, r.current_volume_ml, r.calibration_ml_per_sec
             FROM reservoirs r
             LEFT JOIN ingredients i ON r.ingredient_id = i.id
             WHERE r.slot = ?1",
            [slot as i64],
            reservoir_row,
        )
        .optional()?;
    Ok(reservoir)
}

/// Read only the stored volume of a slot; NULL is reported as `None`
pub fn get_volume(conn: &Connection, slot: usize) -> Result<Option<f64>> {
    let volume: Option<Option<f64>> = conn
        .query_row(
            "SELECT current_volume_ml FROM reservoirs WHERE slot = ?1",
            [slot as i64],
            |row| row.get(0),
        )
        .optional()?;
    Ok(volume.flatten())
}

fn ensure_updated(changed: usize, slot: usize) -> Result<()> {
    if changed == 0 {
        bail!("unknown reservoir slot {}", slot);
    }
    Ok(())
}

pub fn set_volume(conn: &Connection, slot: usize, volume_ml: f64) -> Result<()> {
    if !volume_ml.is_finite() || volume_ml < 0.0 {
        bail!("reservoir volume must be a non-negative number, got {}", volume_ml);
    }
    let changed = conn.execute(
        "UPDATE reservoirs SET current_volume_ml = ?1 WHERE slot = ?2",
        (volume_ml, slot as i64),
    )?;
    ensure_updated(changed, slot)
}

/// Store a flow rate for a slot; `None` marks the pump uncalibrated
pub fn set_calibration(conn: &Connection, slot: usize, ml_per_sec: Option<f64>) -> Result<()> {
    if let Some(rate) = ml_per_sec {
        if !rate.is_finite() || rate <= 0.0 {
            bail!("calibration must be a positive flow rate, got {} ml/s", rate);
        }
    }
    let changed = conn.execute(
        "UPDATE reservoirs SET calibration_ml_per_sec = ?1 WHERE slot = ?2",
        (ml_per_sec, slot as i64),
    )?;
    ensure_updated(changed, slot)
}

/// Bind an ingredient to a slot, or clear the slot with `None`
pub fn bind(conn: &Connection, slot: usize, ingredient_id: Option<i64>) -> Result<()> {
    if let Some(id) = ingredient_id {
        let bound_elsewhere: Option<i64> = conn
            .query_row(
                "SELECT slot FROM reservoirs WHERE ingredient_id = ?1 AND slot != ?2",
                (id, slot as i64),
                |row| row.get(0),
            )
            .optional()?;
        if let Some(other) = bound_elsewhere {
            bail!("ingredient {} is already bound to reservoir {}", id, other);
        }
    }
    let changed = conn.execute(
        "UPDATE reservoirs SET ingredient_id = ?1 WHERE slot = ?2",
        (ingredient_id, slot as i64),
    )?;
    ensure_updated(changed, slot)
}

// ========== Settings ==========

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1 COLLATE NOCASE",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.flatten())
}

pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
        (key, value),
    )?;
    Ok(())
}

// ========== Pour log ==========

/// Append an immutable pour log entry, returning its id
pub fn add_pour_log_entry(
    conn: &Connection,
    recipe_id: i64,
    size_ml: f64,
    timestamp: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO pour_log (timestamp, recipe_id, size_ml) VALUES (?1, ?2, ?3)",
        (timestamp, recipe_id, size_ml),
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent entries first, joined with the recipe name
pub fn pour_log(conn: &Connection, limit: usize) -> Result<Vec<PourLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT pl.id, pl.timestamp, pl.recipe_id, r.name, pl.size_ml
         FROM pour_log pl
         LEFT JOIN recipes r ON pl.recipe_id = r.id
         ORDER BY pl.timestamp DESC, pl.id DESC
         LIMIT ?1",
    )?;

    let rows = stmt.query_map([limit as i64], |row| {
        Ok(PourLogEntry {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            recipe_id: row.get(2)?,
            recipe_name: row.get(3)?,
            size_ml: row.get(4)?,
        })
    })?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

#[cfg(test)]
pub(crate) fn memory_db(slot_count: usize) -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    init_schema(&conn).unwrap();
    init_reservoirs(&conn, slot_count).unwrap();
    conn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingredient_names_are_case_insensitive() {
        let conn = memory_db(2);
        let first = add_ingredient(&conn, "Cola").unwrap();
        let second = add_ingredient(&conn, "cola").unwrap();
        assert_eq!(first, second);
        assert_eq!(list_ingredients(&conn).unwrap().len(), 1);
    }

    #[test]
    fn recipe_lines_keep_insertion_order_and_unparsed_text() {
        let conn = memory_db(2);
        let recipe = add_recipe(&conn, "Test", None, None, None).unwrap();
        let lime = add_ingredient(&conn, "Lime").unwrap();
        let rum = add_ingredient(&conn, "Rum").unwrap();
        add_recipe_line(&conn, recipe, rum, &Amount::Quantity(50.0), "ml").unwrap();
        add_recipe_line(&conn, recipe, lime, &Amount::Unparsed("a squeeze".into()), "ml").unwrap();

        let recipe = get_recipe(&conn, recipe).unwrap().unwrap();
        assert_eq!(recipe.lines[0].ingredient_name, "Rum");
        assert_eq!(recipe.lines[0].amount, Amount::Quantity(50.0));
        assert_eq!(recipe.lines[1].amount, Amount::Unparsed("a squeeze".into()));
    }

    #[test]
    fn find_recipe_by_id_or_name() {
        let conn = memory_db(1);
        let id = add_recipe(&conn, "Cuba Libre", Some("classic"), None, None).unwrap();
        assert_eq!(find_recipe(&conn, &id.to_string()).unwrap().unwrap().id, id);
        assert_eq!(find_recipe(&conn, "cuba libre").unwrap().unwrap().id, id);
        assert!(find_recipe(&conn, "Mojito").unwrap().is_none());
    }

    #[test]
    fn one_reservoir_per_ingredient() {
        let conn = memory_db(3);
        let rum = add_ingredient(&conn, "Rum").unwrap();
        bind(&conn, 0, Some(rum)).unwrap();
        assert!(bind(&conn, 1, Some(rum)).is_err());
        // Rebinding the same slot is fine
        bind(&conn, 0, Some(rum)).unwrap();
        bind(&conn, 0, None).unwrap();
        bind(&conn, 1, Some(rum)).unwrap();
        let reservoirs = list_reservoirs(&conn).unwrap();
        assert_eq!(reservoirs[1].ingredient_name.as_deref(), Some("Rum"));
        assert_eq!(reservoirs[0].ingredient_id, None);
    }

    #[test]
    fn registry_writes_validate_input() {
        let conn = memory_db(2);
        assert!(set_volume(&conn, 0, -1.0).is_err());
        assert!(set_volume(&conn, 9, 10.0).is_err());
        assert!(set_calibration(&conn, 0, Some(0.0)).is_err());
        set_volume(&conn, 1, 700.0).unwrap();
        set_calibration(&conn, 1, Some(5.5)).unwrap();
        let reservoir = get_reservoir(&conn, 1).unwrap().unwrap();
        assert_eq!(reservoir.current_volume_ml, 700.0);
        assert_eq!(reservoir.calibration_ml_per_sec, Some(5.5));
        assert_eq!(get_volume(&conn, 1).unwrap(), Some(700.0));
        assert_eq!(get_volume(&conn, 5).unwrap(), None);
    }

    #[test]
    fn stored_infinity_reads_back_unparsed() {
        let conn = memory_db(1);
        let rum = add_ingredient(&conn, "Rum").unwrap();
        let id = add_recipe(&conn, "Strong", None, None, None).unwrap();
        conn.execute(
            "INSERT INTO recipe_ingredients (recipe_id, ingredient_id, amount, unit) VALUES (?1, ?2, ?3, 'ml')",
            (id, rum, f64::INFINITY),
        )
        .unwrap();

        let lines = get_recipe_lines(&conn, id).unwrap();
        assert!(matches!(lines[0].amount, Amount::Unparsed(_)));
    }

    #[test]
    fn settings_round_trip() {
        let conn = memory_db(1);
        assert_eq!(get_setting(&conn, SETTING_GLASS_SIZE).unwrap(), None);
        set_setting(&conn, SETTING_GLASS_SIZE, "Large").unwrap();
        assert_eq!(
            get_setting(&conn, "selectedglasssize").unwrap().as_deref(),
            Some("Large")
        );
    }

    #[test]
    fn pour_log_is_most_recent_first() {
        let conn = memory_db(1);
        let cuba = add_recipe(&conn, "Cuba Libre", None, None, None).unwrap();
        let screw = add_recipe(&conn, "Screwdriver", None, None, None).unwrap();
        let t0 = Utc::now();
        add_pour_log_entry(&conn, cuba, 200.0, t0).unwrap();
        add_pour_log_entry(&conn, screw, 250.0, t0 + chrono::Duration::seconds(5)).unwrap();

        let entries = pour_log(&conn, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].recipe_name.as_deref(), Some("Screwdriver"));
        assert_eq!(entries[1].size_ml, 200.0);
        assert_eq!(pour_log(&conn, 1).unwrap().len(), 1);
    }
}

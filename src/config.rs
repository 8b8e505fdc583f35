//! Machine configuration
//!
//! Loaded once from YAML and handed to the [`crate::station::Station`] at
//! construction.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A named serving volume, e.g. a glass size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumePreset {
    pub name: String,
    pub volume_ml: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: PathBuf,
    pub slot_count: usize,
    pub glass_sizes: Vec<VolumePreset>,
    /// Used when no glass size resolves
    pub default_volume_ml: f64,
    pub calibration_run_secs: f64,
    pub cleaning_secs_per_pump: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("cocktails.db"),
            slot_count: 8,
            glass_sizes: vec![
                VolumePreset {
                    name: "Small".to_string(),
                    volume_ml: 150.0,
                },
                VolumePreset {
                    name: "Medium".to_string(),
                    volume_ml: 200.0,
                },
                VolumePreset {
                    name: "Large".to_string(),
                    volume_ml: 300.0,
                },
            ],
            default_volume_ml: 200.0,
            calibration_run_secs: 10.0,
            cleaning_secs_per_pump: 15.0,
        }
    }
}

impl Config {
    /// Load a config file; a missing file means defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 {
            bail!("slot_count must be at least 1");
        }
        for preset in &self.glass_sizes {
            if !(preset.volume_ml.is_finite() && preset.volume_ml > 0.0) {
                bail!("glass size '{}' must have a positive volume", preset.name);
            }
        }
        if !(self.default_volume_ml.is_finite() && self.default_volume_ml > 0.0) {
            bail!("default_volume_ml must be positive, got {}", self.default_volume_ml);
        }
        for (name, secs) in [
            ("calibration_run_secs", self.calibration_run_secs),
            ("cleaning_secs_per_pump", self.cleaning_secs_per_pump),
        ] {
            if !(secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok()) {
                bail!("{} must be a positive number of seconds, got {}", name, secs);
            }
        }
        Ok(())
    }

    pub fn preset(&self, name: &str) -> Option<&VolumePreset> {
        self.glass_sizes
            .iter()
            .find(|preset| preset.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Pick the serving volume for a pour.
    ///
    /// Order: explicit volume, requested size, stored size setting, first
    /// configured size, `default_volume_ml`.
    pub fn target_volume(
        &self,
        explicit_ml: Option<f64>,
        requested_size: Option<&str>,
        stored_size: Option<&str>,
    ) -> Result<f64> {
        if let Some(volume) = explicit_ml {
            return Ok(volume);
        }
        if let Some(size) = requested_size {
            return match self.preset(size) {
                Some(preset) => Ok(preset.volume_ml),
                None => bail!("unknown glass size '{}'", size),
            };
        }
        if let Some(preset) = stored_size.and_then(|size| self.preset(size)) {
            return Ok(preset.volume_ml);
        }
        Ok(self
            .glass_sizes
            .first()
            .map(|preset| preset.volume_ml)
            .unwrap_or(self.default_volume_ml))
    }
}

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Pipeline configuration loaded from `bdgd_map.toml`.
//!
//! Every field has a default, so an empty file (or no file at all) gives a
//! working configuration: BDGD `PONNOT` points joined to the `UC*_tab`
//! consumer tables on `COD_ID = PN_CON`, summed `ENE_TOT` over 1 km cells.
//!
//! ```toml
//! company_filter = "ENEL_SP"
//! date_filter = "2023"
//! aggregation_function = "mean"
//! grid_cell_size = 500.0
//! grid_strategy = "bulk_join"
//!
//! [crs]
//! policy = "force"
//! target = "EPSG:31983"
//! ```

use std::path::{Path, PathBuf};

use bdgd_map_database_models::{JoinKeys, JoinStrategy};
use bdgd_map_generate_models::{GridRequest, GridStrategy, GridUnit, Reducer};
use serde::{Deserialize, Serialize};

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "bdgd_map.toml";

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Cannot read {}: {source}", path.display())]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or inconsistent with another.
    #[error("Invalid configuration value for {field}: {message}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// How the run's base CRS is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrsPolicyKind {
    /// Use the CRS of the first spatial layer loaded.
    #[default]
    AdoptFirst,
    /// Reproject every layer into `target`.
    Force,
}

/// `[crs]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrsConfig {
    /// Base CRS policy.
    pub policy: CrsPolicyKind,
    /// Target CRS identifier, e.g. `EPSG:31983`. Required for `force`.
    pub target: Option<String>,
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Case-insensitive substring the geodatabase path must contain.
    pub company_filter: Option<String>,
    /// Case-insensitive substring (usually a year or date) the path must
    /// contain.
    pub date_filter: Option<String>,
    /// Maximum number of sources to process.
    pub max_sources: Option<usize>,
    /// Directory searched for `*.gdb` sources.
    pub input_dir: PathBuf,
    /// Spatial reference layer.
    pub spatial_layer: String,
    /// Join key in the spatial layer.
    pub spatial_key: String,
    /// Join key in the consumer layers.
    pub consumer_key: String,
    /// Consumer layers, read when present.
    pub consumer_layers: Vec<String>,
    /// Where the join runs.
    pub join_strategy: JoinStrategy,
    /// Column reduced per grid cell. Ignored for `count`.
    pub aggregation_column: String,
    /// Per-cell reducer.
    pub aggregation_function: Reducer,
    /// Cell edge length in `grid_unit`.
    pub grid_cell_size: f64,
    /// Unit of `grid_cell_size`.
    pub grid_unit: GridUnit,
    /// Grid aggregation strategy.
    pub grid_strategy: GridStrategy,
    /// Base CRS selection.
    pub crs: CrsConfig,
    /// `DuckDB` store file.
    pub store_path: PathBuf,
    /// `GeoJSON` output file.
    pub output_path: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            company_filter: None,
            date_filter: None,
            max_sources: None,
            input_dir: PathBuf::from("data/extracted"),
            spatial_layer: "PONNOT".to_string(),
            spatial_key: "COD_ID".to_string(),
            consumer_key: "PN_CON".to_string(),
            consumer_layers: ["UCAT_tab", "UCMT_tab", "UCBT_tab"]
                .map(String::from)
                .to_vec(),
            join_strategy: JoinStrategy::default(),
            aggregation_column: "ENE_TOT".to_string(),
            aggregation_function: Reducer::default(),
            grid_cell_size: 1000.0,
            grid_unit: GridUnit::default(),
            grid_strategy: GridStrategy::default(),
            crs: CrsConfig::default(),
            store_path: PathBuf::from("data/extracted/aneel_data.duckdb"),
            output_path: PathBuf::from("output/aneel_bdgd.geojson"),
        }
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

fn require_name(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(())
}

impl PipelineConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown enum
    /// values, or [`ConfigError::Invalid`] if validation fails.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or
    /// validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Loads `path` if given, otherwise [`DEFAULT_CONFIG_FILE`] if it exists
    /// in the working directory, otherwise the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a file is found but cannot be loaded.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default = Path::new(DEFAULT_CONFIG_FILE);
        if default.is_file() {
            return Self::load(default);
        }
        log::debug!("No {DEFAULT_CONFIG_FILE} found; using defaults");
        Ok(Self::default())
    }

    /// Checks values that deserialisation cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.grid_cell_size.is_finite() || self.grid_cell_size <= 0.0 {
            return Err(invalid(
                "grid_cell_size",
                format!("must be a positive number, got {}", self.grid_cell_size),
            ));
        }
        require_name("spatial_layer", &self.spatial_layer)?;
        require_name("spatial_key", &self.spatial_key)?;
        require_name("consumer_key", &self.consumer_key)?;
        if self.consumer_layers.is_empty() {
            return Err(invalid("consumer_layers", "at least one layer is required"));
        }
        for layer in &self.consumer_layers {
            require_name("consumer_layers", layer)?;
        }
        if self.aggregation_function != Reducer::Count {
            require_name("aggregation_column", &self.aggregation_column)?;
        }
        if self.max_sources == Some(0) {
            return Err(invalid("max_sources", "must be at least 1 when set"));
        }
        if self.crs.policy == CrsPolicyKind::Force
            && self.crs.target.as_deref().is_none_or(|t| t.trim().is_empty())
        {
            return Err(invalid("crs.target", "required when crs.policy is \"force\""));
        }
        Ok(())
    }

    /// Join key columns.
    #[must_use]
    pub fn join_keys(&self) -> JoinKeys {
        JoinKeys {
            spatial: self.spatial_key.clone(),
            consumer: self.consumer_key.clone(),
        }
    }

    /// Grid request built from the aggregation settings.
    #[must_use]
    pub fn grid_request(&self) -> GridRequest {
        GridRequest {
            cell_size: self.grid_cell_size,
            unit: self.grid_unit,
            reducer: self.aggregation_function,
            column: self.aggregation_column.clone(),
        }
    }
}

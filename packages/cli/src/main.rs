#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `bdgd_map`: joins ANEEL BDGD consumer records to their spatial layer and
//! writes a choropleth grid as `GeoJSON`.
//!
//! Settings come from `bdgd_map.toml` (see [`bdgd_map_config`]); flags
//! given on the command line take precedence over the file.

use std::path::{Path, PathBuf};
use std::time::Instant;

use bdgd_map_cli_utils::{IndicatifProgress, MultiProgress};
use bdgd_map_config::{CrsPolicyKind, PipelineConfig};
use bdgd_map_database::Store;
use bdgd_map_database_models::JoinStrategy;
use bdgd_map_gdb::{GdalReader, SourceReader, discover};
use bdgd_map_generate_models::{GridStrategy, GridUnit, Reducer};
use bdgd_map_geometry::{CrsPolicy, RunContext};
use bdgd_map_ingest::IngestOptions;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bdgd_map", about = "ANEEL BDGD consumer grid mapper")]
struct Cli {
    /// Configuration file (defaults to `./bdgd_map.toml` when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest geodatabases, join, aggregate and write the grid
    Run {
        #[command(flatten)]
        sources: SourceArgs,
        #[command(flatten)]
        grid: GridArgs,
        /// Where the join runs (`in_memory` or `store`)
        #[arg(long)]
        join_strategy: Option<JoinStrategy>,
        /// Reproject every layer into this CRS (e.g. `EPSG:31983`)
        #[arg(long)]
        crs: Option<String>,
        /// `DuckDB` store file
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// List local geodatabases matching the filters, with their layers
    Sources {
        #[command(flatten)]
        sources: SourceArgs,
    },
    /// Re-aggregate an existing store without reloading sources
    Grid {
        #[command(flatten)]
        grid: GridArgs,
        /// `DuckDB` store file
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Geodatabases to read instead of searching `--input-dir`
    #[arg(value_name = "GDB")]
    paths: Vec<PathBuf>,
    /// Directory searched for `*.gdb` sources
    #[arg(long)]
    input_dir: Option<PathBuf>,
    /// Only sources whose path contains this company name
    #[arg(long)]
    company: Option<String>,
    /// Only sources whose path contains this date or year
    #[arg(long)]
    date: Option<String>,
    /// Maximum number of sources to process
    #[arg(long)]
    max_sources: Option<usize>,
}

impl SourceArgs {
    /// Applies the filters to `config` and returns the explicit paths.
    fn apply(self, config: &mut PipelineConfig) -> Vec<PathBuf> {
        if let Some(dir) = self.input_dir {
            config.input_dir = dir;
        }
        if self.company.is_some() {
            config.company_filter = self.company;
        }
        if self.date.is_some() {
            config.date_filter = self.date;
        }
        if self.max_sources.is_some() {
            config.max_sources = self.max_sources;
        }
        self.paths
    }
}

#[derive(Args)]
struct GridArgs {
    /// Cell edge length in `--unit`
    #[arg(long)]
    cell_size: Option<f64>,
    /// Unit of the cell size (`meters` or `degrees`)
    #[arg(long)]
    unit: Option<GridUnit>,
    /// Per-cell reducer (`sum`, `mean` or `count`)
    #[arg(long)]
    function: Option<Reducer>,
    /// Column to aggregate
    #[arg(long)]
    column: Option<String>,
    /// Aggregation strategy (`per_cell`, `bulk_join` or `arithmetic`)
    #[arg(long)]
    strategy: Option<GridStrategy>,
    /// `GeoJSON` output file
    #[arg(long, short)]
    output: Option<PathBuf>,
}

impl GridArgs {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(size) = self.cell_size {
            config.grid_cell_size = size;
        }
        if let Some(unit) = self.unit {
            config.grid_unit = unit;
        }
        if let Some(function) = self.function {
            config.aggregation_function = function;
        }
        if let Some(column) = self.column {
            config.aggregation_column = column;
        }
        if let Some(strategy) = self.strategy {
            config.grid_strategy = strategy;
        }
        if let Some(output) = self.output {
            config.output_path = output;
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = bdgd_map_cli_utils::init_logger();
    let cli = Cli::parse();

    let mut config = PipelineConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            sources,
            grid,
            join_strategy,
            crs,
            store,
        } => {
            let paths = sources.apply(&mut config);
            grid.apply(&mut config);
            if let Some(strategy) = join_strategy {
                config.join_strategy = strategy;
            }
            if crs.is_some() {
                config.crs.policy = CrsPolicyKind::Force;
                config.crs.target = crs;
            }
            if let Some(store) = store {
                config.store_path = store;
            }
            config.validate()?;
            run(&config, &paths, &multi)?;
        }
        Commands::Sources { sources } => {
            let paths = sources.apply(&mut config);
            config.validate()?;
            list_sources(&config, &paths)?;
        }
        Commands::Grid { grid, store } => {
            grid.apply(&mut config);
            if let Some(store) = store {
                config.store_path = store;
            }
            config.validate()?;
            let store = open_existing(&config.store_path)?;
            grid_to_file(&store, &config, &multi)?;
        }
    }

    Ok(())
}

/// Explicit paths when given, otherwise every geodatabase under
/// `input_dir`, filtered by company, date and count.
fn selected_sources(
    config: &PipelineConfig,
    explicit: &[PathBuf],
) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let all = if explicit.is_empty() {
        if !config.input_dir.is_dir() {
            return Err(
                format!("Input directory {} does not exist", config.input_dir.display()).into(),
            );
        }
        discover::discover_gdbs(&config.input_dir)?
    } else {
        let mut paths = explicit.to_vec();
        paths.sort();
        paths.dedup();
        paths
    };
    Ok(discover::select_sources(
        &all,
        config.company_filter.as_deref(),
        config.date_filter.as_deref(),
        config.max_sources,
    ))
}

fn crs_policy(config: &PipelineConfig) -> Result<CrsPolicy, Box<dyn std::error::Error>> {
    match (config.crs.policy, config.crs.target.as_deref()) {
        (CrsPolicyKind::Force, Some(target)) => {
            let crs = bdgd_map_gdb::resolve_crs(target)?;
            log::info!("Reprojecting every source into {crs}");
            Ok(CrsPolicy::Force(crs))
        }
        (CrsPolicyKind::Force, None) => Err("crs.target is required for the force policy".into()),
        (CrsPolicyKind::AdoptFirst, _) => Ok(CrsPolicy::AdoptFirst),
    }
}

fn open_existing(path: &Path) -> Result<Store, Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(format!(
            "Store {} does not exist; run `bdgd_map run` first",
            path.display()
        )
        .into());
    }
    Ok(Store::open(path)?)
}

fn run(
    config: &PipelineConfig,
    explicit: &[PathBuf],
    multi: &MultiProgress,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();

    bdgd_map_geometry::ensure_projection_support()?;
    let mut ctx = RunContext::new(crs_policy(config)?);

    let paths = selected_sources(config, explicit)?;
    if paths.is_empty() {
        log::warn!(
            "No geodatabases under {} match the filters",
            config.input_dir.display()
        );
        bdgd_map_generate::remove_stale_output(&config.output_path)?;
        return Ok(());
    }

    let store = Store::create(&config.store_path)?;
    let opts = IngestOptions {
        spatial_layer: config.spatial_layer.clone(),
        consumer_layers: config.consumer_layers.clone(),
        keys: config.join_keys(),
        strategy: config.join_strategy,
    };

    let progress = IndicatifProgress::sources_bar(multi, "Ingesting geodatabases");
    let summary =
        bdgd_map_ingest::run_ingest(&store, &mut ctx, &GdalReader, &paths, &opts, progress)?;

    log::info!(
        "Ingest: {} joined, {} skipped, {} failed, {} rows, {} invalid geometries dropped",
        summary.sources_ok,
        summary.skipped,
        summary.failed,
        summary.rows,
        summary.invalid_geometries
    );

    if summary.sources_ok == 0 {
        log::error!("No source could be joined; nothing to map");
        bdgd_map_generate::remove_stale_output(&config.output_path)?;
        return Ok(());
    }

    grid_to_file(&store, config, multi)?;

    log::info!("Pipeline finished in {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn grid_to_file(
    store: &Store,
    config: &PipelineConfig,
    multi: &MultiProgress,
) -> Result<(), Box<dyn std::error::Error>> {
    let spinner = IndicatifProgress::step_spinner(
        multi,
        &format!("Aggregating grid ({})", config.grid_strategy),
    );
    let output =
        bdgd_map_generate::run_grid(store, &config.grid_request(), config.grid_strategy)?;

    let Some(output) = output else {
        spinner.finish("No located records to aggregate".to_string());
        log::warn!("Grid is empty; no output written");
        bdgd_map_generate::remove_stale_output(&config.output_path)?;
        return Ok(());
    };

    spinner.finish(format!("Aggregated {} cells", output.cells.len()));
    bdgd_map_generate::write_geojson(&config.output_path, &output)?;
    log::info!(
        "Wrote {} ({} cells, {})",
        config.output_path.display(),
        output.cells.len(),
        output.caption
    );
    Ok(())
}

fn list_sources(
    config: &PipelineConfig,
    explicit: &[PathBuf],
) -> Result<(), Box<dyn std::error::Error>> {
    let paths = selected_sources(config, explicit)?;
    if paths.is_empty() {
        log::warn!("No geodatabases found under {}", config.input_dir.display());
        return Ok(());
    }

    for line in source_listing(&GdalReader, &paths, config) {
        println!("{line}");
    }
    Ok(())
}

/// Lines printed by `bdgd_map sources`: each readable geodatabase followed
/// by its indented layers, with the spatial and consumer layers marked.
/// Unreadable geodatabases are reported through the log only.
fn source_listing(
    reader: &impl SourceReader,
    paths: &[PathBuf],
    config: &PipelineConfig,
) -> Vec<String> {
    let mut lines = Vec::new();
    for path in paths {
        let layers = match reader.list_layers(path) {
            Ok(layers) => layers,
            Err(e) => {
                log::warn!("Cannot list layers of {}: {e}", path.display());
                continue;
            }
        };
        lines.push(path.display().to_string());
        for layer in layers {
            let marker = if layer.eq_ignore_ascii_case(&config.spatial_layer) {
                " (spatial)"
            } else if config
                .consumer_layers
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&layer))
            {
                " (consumer)"
            } else {
                ""
            };
            lines.push(format!("  {layer}{marker}"));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use bdgd_map_database_models::{Relation, SpatialBatch};
    use bdgd_map_gdb::GdbError;

    use super::*;

    struct LayersOnly;

    impl SourceReader for LayersOnly {
        fn read_spatial(&self, path: &Path, layer: &str) -> Result<SpatialBatch, GdbError> {
            Err(GdbError::MissingLayer {
                path: path.to_path_buf(),
                layer: layer.to_string(),
            })
        }

        fn read_consumers(&self, path: &Path, layers: &[String]) -> Result<Vec<Relation>, GdbError> {
            Err(GdbError::NoConsumerLayers {
                path: path.to_path_buf(),
                layers: layers.join(", "),
            })
        }

        fn list_layers(&self, path: &Path) -> Result<Vec<String>, GdbError> {
            if path.ends_with("broken.gdb") {
                return Err(GdbError::MissingLayer {
                    path: path.to_path_buf(),
                    layer: "*".to_string(),
                });
            }
            Ok(vec![
                "ponnot".to_string(),
                "UCBT_tab".to_string(),
                "SSDBT".to_string(),
            ])
        }
    }

    #[test]
    fn listing_marks_layers_and_leaves_unreadable_sources_to_the_log() {
        let paths = [PathBuf::from("a/broken.gdb"), PathBuf::from("b/ENEL_2023.gdb")];
        let lines = source_listing(&LayersOnly, &paths, &PipelineConfig::default());
        assert_eq!(
            lines,
            [
                "b/ENEL_2023.gdb",
                "  ponnot (spatial)",
                "  UCBT_tab (consumer)",
                "  SSDBT",
            ]
        );
    }
}

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Joins spatial and consumer records across many BDGD geodatabases.
//!
//! Each source is read, validated, brought into the run's base CRS and
//! joined on its key columns, either in memory or inside the store. A
//! source that fails at any step is logged and skipped; sources that were
//! already joined are never affected. Once every source has been tried,
//! the energy aggregates are computed and the store is finalised for grid
//! aggregation.

pub mod join;
pub mod progress;

pub use join::join_in_memory;
pub use progress::{NullProgress, ProgressCallback, null_progress};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bdgd_map_analytics::{AnalyticsError, enrich, enrich_store};
use bdgd_map_database::{DbError, Store};
use bdgd_map_database_models::{JoinKeys, JoinStrategy, JoinedRelation, RelationError};
use bdgd_map_gdb::{GdbError, SourceReader};
use bdgd_map_geometry::{GeometryError, RunContext, reconcile_batch, validate_batch};

/// Errors that can occur while ingesting sources.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Reading a geodatabase failed.
    #[error(transparent)]
    Gdb(#[from] GdbError),

    /// Store operation failed.
    #[error(transparent)]
    Database(#[from] DbError),

    /// Energy aggregates could not be computed.
    #[error(transparent)]
    Analytics(#[from] AnalyticsError),

    /// Reprojection failed.
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    /// Joined row did not fit the output schema.
    #[error(transparent)]
    Relation(#[from] RelationError),

    /// A join key column is absent.
    #[error("Missing join key column {column} in {relation}")]
    MissingKey {
        /// Key column name.
        column: String,
        /// Which side of the join lacks it.
        relation: String,
    },
}

/// What to read from each source and how to join it.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Name of the spatial reference layer, e.g. `PONNOT`.
    pub spatial_layer: String,
    /// Consumer layer names; absent layers are skipped.
    pub consumer_layers: Vec<String>,
    /// Key columns on both sides of the join.
    pub keys: JoinKeys,
    /// Where the join runs.
    pub strategy: JoinStrategy,
}

/// Counts for one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Sources joined successfully, including those with no matches.
    pub sources_ok: usize,
    /// Sources skipped because nothing valid was left to join.
    pub skipped: usize,
    /// Sources that failed with an error.
    pub failed: usize,
    /// Joined rows across all sources.
    pub rows: u64,
    /// Spatial records dropped for invalid geometry.
    pub invalid_geometries: u64,
    /// Rows with derived coordinates after finalisation.
    pub located: u64,
}

enum SourceOutcome {
    Joined(u64),
    Skipped,
}

fn source_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

fn ingest_source(
    store: &Store,
    ctx: &mut RunContext,
    reader: &dyn SourceReader,
    path: &Path,
    opts: &IngestOptions,
    accumulated: &mut Option<JoinedRelation>,
    summary: &mut IngestSummary,
) -> Result<SourceOutcome, IngestError> {
    let name = source_name(path);

    let batch = reader.read_spatial(path, &opts.spatial_layer)?;
    let (batch, dropped) = validate_batch(batch);
    summary.invalid_geometries += dropped as u64;
    if dropped > 0 {
        log::warn!("{name}: dropped {dropped} records with invalid geometry");
    }
    if batch.is_empty() {
        log::warn!("{name}: no valid spatial records in {}", opts.spatial_layer);
        return Ok(SourceOutcome::Skipped);
    }

    let batch = reconcile_batch(ctx, batch)?;
    let consumers = reader.read_consumers(path, &opts.consumer_layers)?;

    let rows = match opts.strategy {
        JoinStrategy::Store => store.merge_source(&batch, &consumers, &opts.keys)?,
        JoinStrategy::InMemory => {
            let joined = join_in_memory(&batch, &consumers, &opts.keys)?;
            let rows = joined.len() as u64;
            match accumulated {
                Some(all) => all.extend(joined),
                None => *accumulated = Some(joined),
            }
            rows
        }
    };

    if rows == 0 {
        log::warn!("{name}: no consumer records matched the spatial layer");
    }
    Ok(SourceOutcome::Joined(rows))
}

/// Ingests every source, then computes energy aggregates and finalises the
/// store.
///
/// With [`JoinStrategy::Store`] each source is joined into the store in its
/// own transaction. With [`JoinStrategy::InMemory`] sources are joined in
/// memory and the accumulated result is written to the store once at the
/// end. If no source succeeds, the store is left without `processed_data`.
///
/// # Errors
///
/// Per-source errors are logged and counted, never returned. Returns
/// [`IngestError`] only if computing aggregates or finalising the store
/// fails.
pub fn run_ingest(
    store: &Store,
    ctx: &mut RunContext,
    reader: &dyn SourceReader,
    paths: &[PathBuf],
    opts: &IngestOptions,
    progress: Arc<dyn ProgressCallback>,
) -> Result<IngestSummary, IngestError> {
    let start = Instant::now();
    let mut summary = IngestSummary::default();
    let mut accumulated: Option<JoinedRelation> = None;

    progress.set_total(paths.len() as u64);
    log::info!(
        "Ingesting {} sources ({} join)",
        paths.len(),
        opts.strategy
    );

    for path in paths {
        let name = source_name(path);
        progress.set_message(name.clone());

        match ingest_source(store, ctx, reader, path, opts, &mut accumulated, &mut summary) {
            Ok(SourceOutcome::Joined(rows)) => {
                summary.sources_ok += 1;
                summary.rows += rows;
                log::info!("{name}: joined {rows} rows");
            }
            Ok(SourceOutcome::Skipped) => summary.skipped += 1,
            Err(e) => {
                summary.failed += 1;
                log::error!("{name}: skipped after error: {e}");
            }
        }
        progress.inc(1);
    }

    progress.finish(format!(
        "{} joined, {} skipped, {} failed",
        summary.sources_ok, summary.skipped, summary.failed
    ));

    if summary.sources_ok == 0 {
        log::warn!("No source was joined; nothing to aggregate");
        return Ok(summary);
    }
    let Some(base) = ctx.base_crs().cloned() else {
        log::warn!("No base CRS was established; nothing to aggregate");
        return Ok(summary);
    };

    match opts.strategy {
        JoinStrategy::InMemory => {
            let mut joined = accumulated.unwrap_or_else(|| JoinedRelation::empty(base.clone()));
            enrich(&mut joined.attributes);
            store.load_joined(&joined)?;
        }
        JoinStrategy::Store => {
            enrich_store(store)?;
        }
    }
    summary.located = store.finalize(&base)?.unwrap_or(0);

    log::info!(
        "Ingest complete: {} joined, {} skipped, {} failed, {} rows ({} invalid geometries dropped), took {:.1}s",
        summary.sources_ok,
        summary.skipped,
        summary.failed,
        summary.rows,
        summary.invalid_geometries,
        start.elapsed().as_secs_f64()
    );

    Ok(summary)
}

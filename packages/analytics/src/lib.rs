#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Per-record energy aggregates.
//!
//! Adds three derived columns to every joined record:
//!
//! * `ENE_TOT` = sum of `ENE_01`..`ENE_12`
//! * `ENE_MED` = `ENE_TOT / 12`
//! * `DEM` = `CAR_INST`
//!
//! Missing, null and non-numeric inputs count as zero. Existing derived
//! columns are overwritten. [`enrich`] works on an in-memory relation and
//! [`store::enrich_store`] runs the same computation as SQL over
//! `processed_data`.

pub mod store;

pub use store::enrich_store;

use bdgd_map_database::DbError;
use bdgd_map_database_models::columns::{CAR_INST, DEM, ENE_MED, ENE_MONTHS, ENE_TOT};
use bdgd_map_database_models::{Relation, Value};
use thiserror::Error;

/// Errors that can occur during analytics operations.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    /// Store operation failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// `DuckDB` statement failed.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),
}

/// Number of months averaged into `ENE_MED`.
const MONTHS: f64 = 12.0;

/// Adds or overwrites `ENE_TOT`, `ENE_MED` and `DEM` on every row.
///
/// Monthly columns that do not exist are created filled with zero, and a
/// missing `CAR_INST` is created empty.
pub fn enrich(relation: &mut Relation) {
    for month in ENE_MONTHS {
        relation.ensure_column(month, &Value::Float(0.0));
    }
    relation.ensure_column(CAR_INST, &Value::Null);

    let tot_idx = relation.ensure_column(ENE_TOT, &Value::Null);
    let med_idx = relation.ensure_column(ENE_MED, &Value::Null);
    let dem_idx = relation.ensure_column(DEM, &Value::Null);

    for row in 0..relation.len() {
        let total: f64 = ENE_MONTHS
            .iter()
            .map(|month| relation.numeric_or_zero(row, month))
            .sum();
        let demand = relation.numeric_or_zero(row, CAR_INST);

        relation.set(row, tot_idx, Value::Float(total));
        relation.set(row, med_idx, Value::Float(total / MONTHS));
        relation.set(row, dem_idx, Value::Float(demand));
    }

    log::info!("Computed energy aggregates for {} records", relation.len());
}

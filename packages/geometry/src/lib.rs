#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Geometry checks and coordinate handling for spatial batches.
//!
//! Batches pass through two gates before they are joined: invalid
//! geometries are dropped by [`validate::validate_batch`], then the batch
//! is brought into the run's base CRS by [`reconcile::RunContext`]. Actual
//! coordinate transforms go through PROJ via [`reproject::Reprojector`].

pub mod reconcile;
pub mod reproject;
pub mod validate;

pub use reconcile::{CrsPolicy, Reconciliation, RunContext, reconcile_batch};
pub use reproject::Reprojector;
pub use validate::{is_valid, validate_batch};

use bdgd_map_database_models::Crs;
use geo::{Centroid, Geometry, Point};

/// Errors from geometry handling and reprojection.
#[derive(Debug, thiserror::Error)]
pub enum GeometryError {
    /// PROJ could not build a transformation between two CRSs.
    #[error("Cannot create projection from {from} to {to}: {source}")]
    ProjCreate {
        /// Source CRS.
        from: Crs,
        /// Target CRS.
        to: Crs,
        /// Underlying PROJ error.
        source: proj::ProjCreateError,
    },

    /// A coordinate could not be transformed.
    #[error("Projection error: {0}")]
    Projection(#[from] proj::ProjError),
}

/// Returns the point used to place a geometry on the grid.
///
/// Points stand for themselves; anything else uses its centroid. Empty
/// geometries have none.
#[must_use]
pub fn representative_point(geometry: &Geometry<f64>) -> Option<Point<f64>> {
    match geometry {
        Geometry::Point(point) => Some(*point),
        other => other.centroid(),
    }
}

/// Checks that PROJ is usable by building and running a known
/// transformation.
///
/// # Errors
///
/// Returns [`GeometryError`] if PROJ cannot create or apply the
/// `EPSG:4326` to `EPSG:3857` transformation.
pub fn ensure_projection_support() -> Result<(), GeometryError> {
    let check = Reprojector::new(&Crs::wgs84(), &Crs::new("EPSG", "3857", false))?;
    let (x, y) = check.transform_xy(-46.63, -23.55)?;
    log::debug!("PROJ self-check transformed (-46.63, -23.55) to ({x:.1}, {y:.1})");
    Ok(())
}

//! Geometry validity checks.

use bdgd_map_database_models::SpatialBatch;
use geo::{CoordsIter, Geometry, HasDimensions, Validation};

/// Whether a geometry can take part in the pipeline.
///
/// Missing geometries, empty geometries, geometries with non-finite
/// coordinates and topologically invalid geometries are rejected.
#[must_use]
pub fn is_valid(geometry: Option<&Geometry<f64>>) -> bool {
    let Some(geometry) = geometry else {
        return false;
    };
    if geometry.is_empty() {
        return false;
    }
    if geometry
        .coords_iter()
        .any(|c| !c.x.is_finite() || !c.y.is_finite())
    {
        return false;
    }
    geometry.is_valid()
}

/// Removes records with invalid geometries from a batch.
///
/// Returns the filtered batch and the number of records dropped.
#[must_use]
pub fn validate_batch(batch: SpatialBatch) -> (SpatialBatch, usize) {
    let SpatialBatch {
        crs,
        mut attributes,
        geometries,
    } = batch;

    let keep: Vec<bool> = geometries.iter().map(|g| is_valid(g.as_ref())).collect();
    let dropped = keep.iter().filter(|k| !**k).count();

    if dropped > 0 {
        attributes.retain_rows(|i| keep[i]);
    }
    let geometries: Vec<_> = geometries
        .into_iter()
        .zip(&keep)
        .filter_map(|(g, k)| if *k { g } else { None })
        .collect();

    if dropped > 0 {
        log::debug!("Dropped {dropped} invalid geometries");
    }

    (
        SpatialBatch {
            crs,
            attributes,
            geometries: geometries.into_iter().map(Some).collect(),
        },
        dropped,
    )
}

//! Coordinate transforms through PROJ.

use bdgd_map_database_models::Crs;
use geo::{Geometry, MapCoords};
use proj::Proj;

use crate::GeometryError;

/// A transformation between two CRSs.
///
/// Transforming between equal CRSs is the identity and never touches PROJ.
pub struct Reprojector {
    from: Crs,
    to: Crs,
    proj: Option<Proj>,
}

impl std::fmt::Debug for Reprojector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reprojector")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

impl Reprojector {
    /// Creates a transformation from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::ProjCreate`] if PROJ does not know either
    /// CRS or cannot connect them.
    pub fn new(from: &Crs, to: &Crs) -> Result<Self, GeometryError> {
        let proj = if from == to {
            None
        } else {
            let proj = Proj::new_known_crs(&from.identifier(), &to.identifier(), None).map_err(
                |source| GeometryError::ProjCreate {
                    from: from.clone(),
                    to: to.clone(),
                    source,
                },
            )?;
            Some(proj)
        };

        Ok(Self {
            from: from.clone(),
            to: to.clone(),
            proj,
        })
    }

    /// Whether this transformation leaves coordinates unchanged.
    #[must_use]
    pub const fn is_identity(&self) -> bool {
        self.proj.is_none()
    }

    /// Transforms a single coordinate pair.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::Projection`] if PROJ rejects the coordinate.
    pub fn transform_xy(&self, x: f64, y: f64) -> Result<(f64, f64), GeometryError> {
        match &self.proj {
            None => Ok((x, y)),
            Some(proj) => Ok(proj.convert((x, y))?),
        }
    }

    /// Transforms every coordinate of a geometry.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::Projection`] on the first coordinate PROJ
    /// rejects.
    pub fn transform(&self, geometry: &Geometry<f64>) -> Result<Geometry<f64>, GeometryError> {
        if self.proj.is_none() {
            return Ok(geometry.clone());
        }
        geometry.try_map_coords(|coord| {
            let (x, y) = self.transform_xy(coord.x, coord.y)?;
            Ok(geo::coord! { x: x, y: y })
        })
    }
}

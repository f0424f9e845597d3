//! Spatial and joined batches: attribute rows paired with geometries.

use geo::Geometry;

use crate::{Crs, Relation, RelationError, Value};

/// Attributes and geometries read from one spatial layer.
///
/// `geometries[i]` belongs to `attributes.rows()[i]`. Geometries may be
/// missing until the batch has been validated.
#[derive(Debug, Clone)]
pub struct SpatialBatch {
    /// CRS the geometries are expressed in.
    pub crs: Crs,
    /// Attribute rows.
    pub attributes: Relation,
    /// One optional geometry per attribute row.
    pub geometries: Vec<Option<Geometry<f64>>>,
}

impl SpatialBatch {
    /// Creates a batch, checking that rows and geometries line up.
    ///
    /// # Errors
    ///
    /// Returns [`RelationError::Arity`] if the geometry count differs from
    /// the attribute row count.
    pub fn new(
        crs: Crs,
        attributes: Relation,
        geometries: Vec<Option<Geometry<f64>>>,
    ) -> Result<Self, RelationError> {
        if attributes.len() != geometries.len() {
            return Err(RelationError::Arity {
                expected: attributes.len(),
                found: geometries.len(),
            });
        }
        Ok(Self {
            crs,
            attributes,
            geometries,
        })
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.geometries.len()
    }

    /// Whether the batch holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }
}

/// Result of joining spatial records with consumer records.
///
/// Every row carries exactly one geometry, in the run's base CRS.
#[derive(Debug, Clone)]
pub struct JoinedRelation {
    /// The run's base CRS.
    pub crs: Crs,
    /// Union of spatial and consumer attributes.
    pub attributes: Relation,
    /// One geometry per attribute row.
    pub geometries: Vec<Geometry<f64>>,
}

impl JoinedRelation {
    /// Creates an empty joined relation in the given CRS.
    #[must_use]
    pub fn empty(crs: Crs) -> Self {
        Self {
            crs,
            attributes: Relation::default(),
            geometries: Vec::new(),
        }
    }

    /// Number of joined rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.geometries.len()
    }

    /// Whether there are no joined rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }

    /// Appends one joined row.
    ///
    /// # Errors
    ///
    /// Returns [`RelationError::Arity`] if `row` does not match the
    /// attribute columns.
    pub fn push(&mut self, row: Vec<Value>, geometry: Geometry<f64>) -> Result<(), RelationError> {
        self.attributes.push_row(row)?;
        self.geometries.push(geometry);
        Ok(())
    }

    /// Appends all rows of `other`, widening the attribute schema.
    pub fn extend(&mut self, other: Self) {
        self.attributes.append(other.attributes);
        self.geometries.extend(other.geometries);
    }
}

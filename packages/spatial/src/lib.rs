#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! In-memory spatial index over joined record locations.
//!
//! Loads representative points (and an optional value column) from the
//! store's `processed_data`, builds an R-tree, and answers "which points
//! lie inside this polygon" with an envelope pre-filter followed by an
//! exact containment test. Used by the per-cell grid strategy.

use bdgd_map_database::{PROCESSED_TABLE, quote_ident};
use geo::{BoundingRect, Contains, Point, Polygon};
use rstar::{AABB, RTree, RTreeObject};

/// A located record with the value it contributes to aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedPoint {
    /// X (or longitude) in the index frame.
    pub x: f64,
    /// Y (or latitude) in the index frame.
    pub y: f64,
    /// Numeric value, `None` when missing or non-numeric.
    pub value: Option<f64>,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.x, self.y])
    }
}

/// R-tree of [`IndexedPoint`]s.
pub struct PointIndex {
    tree: RTree<IndexedPoint>,
}

impl PointIndex {
    /// Builds an index from points.
    #[must_use]
    pub fn new(points: Vec<IndexedPoint>) -> Self {
        Self {
            tree: RTree::bulk_load(points),
        }
    }

    /// Loads points from `processed_data`.
    ///
    /// `x_column`/`y_column` select the coordinate frame. Rows without
    /// coordinates are skipped. When `value_column` is given its values are
    /// read as finite doubles; anything else becomes `None`.
    ///
    /// # Errors
    ///
    /// Returns [`duckdb::Error`] if the query fails.
    pub fn load(
        conn: &duckdb::Connection,
        x_column: &str,
        y_column: &str,
        value_column: Option<&str>,
    ) -> Result<Self, duckdb::Error> {
        let x = quote_ident(x_column);
        let y = quote_ident(y_column);
        let value = value_column.map_or_else(
            || "NULL::DOUBLE".to_string(),
            |column| {
                let cast = format!("TRY_CAST({} AS DOUBLE)", quote_ident(column));
                format!("CASE WHEN isfinite({cast}) THEN {cast} END")
            },
        );

        let mut stmt = conn.prepare(&format!(
            "SELECT {x}, {y}, {value} FROM {PROCESSED_TABLE}
             WHERE {x} IS NOT NULL AND {y} IS NOT NULL"
        ))?;
        let mut rows = stmt.query([])?;
        let mut points = Vec::new();

        while let Some(row) = rows.next()? {
            points.push(IndexedPoint {
                x: row.get(0)?,
                y: row.get(1)?,
                value: row.get(2)?,
            });
        }

        log::info!("Loaded {} points into spatial index", points.len());
        Ok(Self::new(points))
    }

    /// Number of indexed points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Points strictly inside `polygon`. Points on the boundary are not
    /// contained.
    pub fn points_within<'a>(
        &'a self,
        polygon: &'a Polygon<f64>,
    ) -> impl Iterator<Item = &'a IndexedPoint> + 'a {
        let envelope = polygon.bounding_rect().map(|rect| {
            AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
        });
        envelope
            .into_iter()
            .flat_map(move |env| self.tree.locate_in_envelope_intersecting(&env))
            .filter(move |p| polygon.contains(&Point::new(p.x, p.y)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Rect, coord};

    fn point(x: f64, y: f64, value: Option<f64>) -> IndexedPoint {
        IndexedPoint { x, y, value }
    }

    fn square(min: (f64, f64), max: (f64, f64)) -> Polygon<f64> {
        Rect::new(coord! { x: min.0, y: min.1 }, coord! { x: max.0, y: max.1 }).to_polygon()
    }

    #[test]
    fn finds_interior_points_only() {
        let index = PointIndex::new(vec![
            point(0.5, 0.5, Some(1.0)),
            point(1.5, 0.5, Some(2.0)),
            point(0.2, 0.8, None),
        ]);

        let mut found: Vec<_> = index
            .points_within(&square((0.0, 0.0), (1.0, 1.0)))
            .map(|p| (p.x, p.y))
            .collect();
        found.sort_by(|a, b| a.partial_cmp(b).unwrap());

        assert_eq!(found, vec![(0.2, 0.8), (0.5, 0.5)]);
    }

    #[test]
    fn boundary_points_are_excluded() {
        let index = PointIndex::new(vec![point(1.0, 0.5, None), point(0.0, 0.0, None)]);
        assert_eq!(index.points_within(&square((0.0, 0.0), (1.0, 1.0))).count(), 0);
    }

    #[test]
    fn loads_points_and_values_from_store() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE processed_data (geom_x DOUBLE, geom_y DOUBLE, ENE_TOT VARCHAR);
             INSERT INTO processed_data VALUES
                (1.0, 2.0, '10.5'), (3.0, 4.0, 'n/a'), (NULL, 1.0, '7');",
        )
        .unwrap();

        let index = PointIndex::load(&conn, "geom_x", "geom_y", Some("ENE_TOT")).unwrap();

        assert_eq!(index.len(), 2);
        let mut values: Vec<_> = index
            .points_within(&square((0.0, 0.0), (5.0, 5.0)))
            .map(|p| p.value)
            .collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, vec![None, Some(10.5)]);
    }

    #[test]
    fn loads_without_value_column() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE processed_data (longitude DOUBLE, latitude DOUBLE);
             INSERT INTO processed_data VALUES (-46.6, -23.5);",
        )
        .unwrap();

        let index = PointIndex::load(&conn, "longitude", "latitude", None).unwrap();

        assert!(!index.is_empty());
        let area = square((-47.0, -24.0), (-46.0, -23.0));
        let only = index
            .points_within(&area)
            .next()
            .unwrap();
        assert_eq!(only.value, None);
    }
}

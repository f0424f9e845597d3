#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Grid aggregation of joined BDGD records.
//!
//! Reads the finalised `processed_data` table, lays a regular [`Lattice`]
//! over the located rows, reduces a value column per cell with one of three
//! interchangeable [`GridAggregator`] strategies, and hands the populated
//! cells off as a `GeoJSON` choropleth layer.
//!
//! The arithmetic strategy is canonical: a point on a shared cell edge
//! belongs to the cell on its east/north side. The bulk join agrees with it
//! exactly. The per-cell strategy follows the geometry kernel instead and
//! drops points lying on cell outlines.

pub mod aggregate;
pub mod arithmetic;
pub mod bulk_join;
pub mod lattice;
pub mod output;
pub mod palette;
pub mod per_cell;

pub use aggregate::{CellQuery, GridAggregator, aggregator_for};
pub use lattice::{Lattice, LatticeError, MAX_LATTICE_CELLS};
pub use output::{remove_stale_output, to_feature_collection, write_geojson};

use bdgd_map_database::{DbError, PROCESSED_TABLE, Store};
use bdgd_map_database_models::{Crs, same_column};
use bdgd_map_generate_models::{
    CellAggregate, Frame, GridCell, GridRequest, GridStrategy, GridUnit, METERS_PER_DEGREE, Reducer,
    ValueRange,
};
use bdgd_map_geometry::{GeometryError, Reprojector};
use geo::{LineString, Polygon, Rect};

/// Errors that can occur during grid aggregation.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    /// Store error.
    #[error(transparent)]
    Database(#[from] DbError),

    /// `DuckDB` error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// Reprojection of cell outlines failed.
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `GeoJSON` serialisation error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The cell size is not a positive finite number.
    #[error("Invalid grid cell size: {size}")]
    InvalidCellSize {
        /// Configured size.
        size: f64,
    },

    /// The cell size is too small for the extent of the data.
    #[error("Grid cell size {size} is too small for the data extent: {source}")]
    TooManyCells {
        /// Cell size in frame units.
        size: f64,
        /// Lattice sizing failure.
        source: LatticeError,
    },

    /// The store has data but coordinates and indexes were never built.
    #[error("Spatial index is not ready; finalize the store before aggregating")]
    IndexNotReady,

    /// The store has no recorded base CRS.
    #[error("Store has no base CRS recorded")]
    MissingBaseCrs,

    /// The value column does not exist.
    #[error("Aggregation column {column} not found in {PROCESSED_TABLE}")]
    MissingColumn {
        /// Requested column.
        column: String,
    },
}

/// A finished grid, ready to be rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct GridOutput {
    /// Populated cells with geographic outlines, sorted by index.
    pub cells: Vec<GridCell>,
    /// Colour scale bounds, `None` when no value is positive.
    pub range: Option<ValueRange>,
    /// Legend caption.
    pub caption: String,
    /// Property name of the aggregated value.
    pub value_name: String,
    /// Frame the lattice was laid out in.
    pub frame: Frame,
    /// Cell size in frame units.
    pub cell_size: f64,
    /// Strategy that produced the cells.
    pub strategy: GridStrategy,
}

/// Chooses the coordinate frame and the cell size in that frame's units.
///
/// Degrees always use the geographic frame. Metres use the projected frame
/// when the base CRS is projected, otherwise they are converted to degrees
/// at [`METERS_PER_DEGREE`].
#[must_use]
pub fn resolve_frame(request: &GridRequest, base: &Crs) -> (Frame, f64) {
    match request.unit {
        GridUnit::Degrees => (Frame::Geographic, request.cell_size),
        GridUnit::Meters if !base.geographic => (Frame::Projected, request.cell_size),
        GridUnit::Meters => (Frame::Geographic, request.cell_size / METERS_PER_DEGREE),
    }
}

/// Extent of the located rows in a frame, `None` if there are none.
///
/// # Errors
///
/// Returns [`GridError`] if the query fails.
pub fn data_bounds(store: &Store, frame: Frame) -> Result<Option<Rect<f64>>, GridError> {
    let x = frame.x_column();
    let y = frame.y_column();
    let mut stmt = store.connection().prepare(&format!(
        "SELECT MIN({x}), MIN({y}), MAX({x}), MAX({y}) FROM {PROCESSED_TABLE}
         WHERE {x} IS NOT NULL AND {y} IS NOT NULL"
    ))?;
    let bounds = stmt.query_row([], |row| {
        Ok((
            row.get::<_, Option<f64>>(0)?,
            row.get::<_, Option<f64>>(1)?,
            row.get::<_, Option<f64>>(2)?,
            row.get::<_, Option<f64>>(3)?,
        ))
    })?;

    Ok(match bounds {
        (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) => Some(Rect::new(
            geo::coord! { x: min_x, y: min_y },
            geo::coord! { x: max_x, y: max_y },
        )),
        _ => None,
    })
}

fn resolve_value_column(store: &Store, request: &GridRequest) -> Result<Option<String>, GridError> {
    if request.reducer == Reducer::Count {
        return Ok(None);
    }
    store
        .table_columns(PROCESSED_TABLE)?
        .into_iter()
        .find(|c| same_column(c, &request.column))
        .map(Some)
        .ok_or_else(|| GridError::MissingColumn {
            column: request.column.clone(),
        })
}

fn cell_polygon(rect: Rect<f64>, to_geographic: Option<&Reprojector>) -> Result<Polygon<f64>, GridError> {
    let Some(reprojector) = to_geographic else {
        return Ok(rect.to_polygon());
    };
    let corners = [
        (rect.min().x, rect.min().y),
        (rect.max().x, rect.min().y),
        (rect.max().x, rect.max().y),
        (rect.min().x, rect.max().y),
        (rect.min().x, rect.min().y),
    ];
    let ring = corners
        .iter()
        .map(|&(x, y)| reprojector.transform_xy(x, y))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(LineString::from(ring), vec![]))
}

fn attach_outlines(
    lattice: &Lattice,
    aggregates: Vec<CellAggregate>,
    to_geographic: Option<&Reprojector>,
) -> Result<Vec<GridCell>, GridError> {
    aggregates
        .into_iter()
        .map(|aggregate| {
            Ok(GridCell {
                index: aggregate.index,
                polygon: cell_polygon(lattice.cell_rect(aggregate.index), to_geographic)?,
                value: aggregate.value,
                point_count: aggregate.point_count,
            })
        })
        .collect()
}

/// Aggregates the finalised store into a grid.
///
/// Returns `Ok(None)` when there is nothing to draw: no `processed_data`,
/// no located rows, or no populated cells.
///
/// # Errors
///
/// Returns [`GridError::InvalidCellSize`] for a non-positive cell size,
/// [`GridError::IndexNotReady`] if the store was never finalised,
/// [`GridError::MissingColumn`] if the value column is absent, or another
/// [`GridError`] if a query or reprojection fails.
pub fn run_grid(
    store: &Store,
    request: &GridRequest,
    strategy: GridStrategy,
) -> Result<Option<GridOutput>, GridError> {
    if !request.cell_size.is_finite() || request.cell_size <= 0.0 {
        return Err(GridError::InvalidCellSize {
            size: request.cell_size,
        });
    }

    if !store.has_processed_data()? {
        log::warn!("No {PROCESSED_TABLE} table; nothing to aggregate");
        return Ok(None);
    }
    if !store.spatial_index_ready()? {
        return Err(GridError::IndexNotReady);
    }
    let base = store.base_crs()?.ok_or(GridError::MissingBaseCrs)?;

    let (frame, size) = resolve_frame(request, &base);
    let value_column = resolve_value_column(store, request)?;

    let Some(bounds) = data_bounds(store, frame)? else {
        log::warn!("No located rows in {PROCESSED_TABLE}; nothing to aggregate");
        return Ok(None);
    };
    let lattice = match Lattice::from_bounds(
        bounds.min().x,
        bounds.min().y,
        bounds.max().x,
        bounds.max().y,
        size,
    ) {
        Ok(lattice) => lattice,
        Err(LatticeError::InvalidBounds) => {
            log::warn!("Cannot build a lattice over {bounds:?} with cell size {size}");
            return Ok(None);
        }
        Err(source @ LatticeError::TooManyCells { .. }) => {
            return Err(GridError::TooManyCells { size, source });
        }
    };
    log::info!(
        "Aggregating {} over a {}x{} {frame} lattice (cell size {size}) with the {strategy} strategy",
        request.caption(),
        lattice.nx,
        lattice.ny,
    );

    let aggregator = aggregator_for(strategy);
    let aggregates: Vec<CellAggregate> = aggregator
        .aggregate(
            store,
            &CellQuery {
                lattice: &lattice,
                frame,
                reducer: request.reducer,
                value_column: value_column.as_deref(),
            },
        )?
        .into_iter()
        .filter(|c| c.point_count > 0)
        .collect();

    if aggregates.is_empty() {
        log::warn!("{} strategy produced no populated cells", aggregator.name());
        return Ok(None);
    }

    let reprojector = match frame {
        Frame::Projected => Some(Reprojector::new(&base, &Crs::wgs84())?),
        Frame::Geographic => None,
    };
    let cells = attach_outlines(&lattice, aggregates, reprojector.as_ref())?;
    let range = ValueRange::from_values(cells.iter().map(|c| c.value));
    log::info!("Produced {} populated grid cells", cells.len());

    Ok(Some(GridOutput {
        cells,
        range,
        caption: request.caption(),
        value_name: request.value_name().to_string(),
        frame,
        cell_size: size,
        strategy,
    }))
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use std::collections::BTreeMap;

    use bdgd_map_database::insert_rows;
    use bdgd_map_generate_models::CellIndex;
    use duckdb::types::Value as SqlValue;

    use super::*;

    const ALL_STRATEGIES: [GridStrategy; 3] = [
        GridStrategy::PerCell,
        GridStrategy::BulkJoin,
        GridStrategy::Arithmetic,
    ];

    /// A finalised geographic store holding the given `(x, y, ENE_TOT)` rows.
    fn store_with(points: &[(f64, f64, Option<&str>)]) -> Store {
        store_in(&Crs::wgs84(), points)
    }

    /// Same as [`store_with`] with a different base CRS. Geographic columns
    /// are copied from the projected ones, which is enough for frame
    /// selection tests.
    fn store_in(base: &Crs, points: &[(f64, f64, Option<&str>)]) -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(&format!(
                "CREATE TABLE {PROCESSED_TABLE} (
                    COD_ID VARCHAR, ENE_TOT VARCHAR,
                    geom_x DOUBLE, geom_y DOUBLE, longitude DOUBLE, latitude DOUBLE
                );"
            ))
            .unwrap();
        let rows: Vec<Vec<SqlValue>> = points
            .iter()
            .enumerate()
            .map(|(i, &(x, y, value))| {
                vec![
                    SqlValue::Text(format!("P{i}")),
                    value.map_or(SqlValue::Null, |v| SqlValue::Text(v.to_string())),
                    SqlValue::Double(x),
                    SqlValue::Double(y),
                    SqlValue::Double(x),
                    SqlValue::Double(y),
                ]
            })
            .collect();
        insert_rows(
            store.connection(),
            PROCESSED_TABLE,
            &["COD_ID", "ENE_TOT", "geom_x", "geom_y", "longitude", "latitude"].map(String::from),
            &rows,
        )
        .unwrap();
        store.set_base_crs(base).unwrap();
        store
            .set_meta(bdgd_map_database::META_SPATIAL_INDEX_READY, "true")
            .unwrap();
        store
    }

    fn request(reducer: Reducer, cell_size: f64) -> GridRequest {
        GridRequest {
            cell_size,
            unit: GridUnit::Degrees,
            reducer,
            column: "ENE_TOT".to_string(),
        }
    }

    fn counts(output: &GridOutput) -> BTreeMap<(usize, usize), u64> {
        output
            .cells
            .iter()
            .map(|c| ((c.index.ix, c.index.iy), c.point_count))
            .collect()
    }

    fn grouping(output: &GridOutput) -> BTreeMap<(usize, usize), (u64, u64)> {
        output
            .cells
            .iter()
            .map(|c| ((c.index.ix, c.index.iy), (c.point_count, c.value.to_bits())))
            .collect()
    }

    fn four_points() -> Store {
        store_with(&[
            (0.0, 0.0, Some("10")),
            (0.5, 0.5, Some("20")),
            (1.5, 0.5, Some("30")),
            (1.5, 1.5, Some("40")),
        ])
    }

    #[test]
    fn four_point_scenario_with_floor_strategies() {
        let store = four_points();
        for strategy in [GridStrategy::Arithmetic, GridStrategy::BulkJoin] {
            let output = run_grid(&store, &request(Reducer::Count, 1.0), strategy)
                .unwrap()
                .unwrap();
            assert_eq!(
                counts(&output),
                BTreeMap::from([((0, 0), 2), ((1, 0), 1), ((1, 1), 1)]),
                "{strategy}"
            );
            assert_eq!(output.value_name, "count");
            assert_eq!(output.caption, "Count of Records per Grid Cell");
        }
    }

    #[test]
    fn per_cell_excludes_points_on_cell_outlines() {
        let store = four_points();
        let output = run_grid(&store, &request(Reducer::Count, 1.0), GridStrategy::PerCell)
            .unwrap()
            .unwrap();
        assert_eq!(
            counts(&output),
            BTreeMap::from([((0, 0), 1), ((1, 0), 1), ((1, 1), 1)])
        );
    }

    #[test]
    fn strategies_agree_off_cell_boundaries() {
        // Anchors at the lattice corners sit on cell outlines; every other
        // point is strictly inside a cell.
        let mut points = vec![(0.0, 0.0, Some("0")), (4.0, 4.0, Some("0"))];
        points.extend([
            (1.25, 0.25, Some("1.5")),
            (1.75, 0.4, Some("2")),
            (0.6, 1.9, Some("abc")),
            (1.3, 1.2, None),
            (1.7, 2.6, Some("8")),
            (2.2, 2.2, Some("3")),
            (3.9, 1.1, Some("7.25")),
            (2.5, 3.5, Some("-1")),
        ]);
        let store = store_with(&points);
        let anchors = [(0, 0), (3, 3)];

        for reducer in [Reducer::Sum, Reducer::Mean, Reducer::Count] {
            let results: Vec<_> = ALL_STRATEGIES
                .iter()
                .map(|&s| grouping(&run_grid(&store, &request(reducer, 1.0), s).unwrap().unwrap()))
                .collect();
            let (per_cell, bulk, arithmetic) = (&results[0], &results[1], &results[2]);

            assert_eq!(bulk, arithmetic, "{reducer}");
            let mut interior = arithmetic.clone();
            for anchor in anchors {
                interior.remove(&anchor);
            }
            assert_eq!(per_cell, &interior, "{reducer}");
        }
    }

    #[test]
    fn reducers_treat_non_numeric_as_missing() {
        let store = store_with(&[
            (0.1, 0.1, Some("10")),
            (0.2, 0.2, Some("x")),
            (0.3, 0.3, None),
            (0.4, 0.4, Some(" 20 ")),
        ]);
        let sum = run_grid(&store, &request(Reducer::Sum, 1.0), GridStrategy::Arithmetic)
            .unwrap()
            .unwrap();
        assert_eq!(sum.cells.len(), 1);
        assert_eq!(sum.cells[0].point_count, 4);

        let mean = run_grid(&store, &request(Reducer::Mean, 1.0), GridStrategy::Arithmetic)
            .unwrap()
            .unwrap();
        assert!(mean.cells[0].value > 0.0);
        assert_eq!(mean.caption, "Mean of ENE_TOT per Grid Cell");
    }

    #[test]
    fn sums_and_value_range() {
        let store = store_with(&[
            (0.1, 0.1, Some("10")),
            (0.2, 0.2, Some("15")),
            (1.5, 0.1, Some("0")),
        ]);
        let output = run_grid(&store, &request(Reducer::Sum, 1.0), GridStrategy::BulkJoin)
            .unwrap()
            .unwrap();
        assert_eq!(output.cells[0].value, 25.0);
        assert_eq!(output.cells[1].value, 0.0);
        assert_eq!(output.range, Some(ValueRange { min: 22.5, max: 25.0 }));
        assert_eq!(output.value_name, "ENE_TOT");
    }

    #[test]
    fn outlines_tile_the_lattice() {
        let store = four_points();
        let output = run_grid(&store, &request(Reducer::Count, 1.0), GridStrategy::Arithmetic)
            .unwrap()
            .unwrap();
        let cell = output
            .cells
            .iter()
            .find(|c| c.index == CellIndex::new(1, 1))
            .unwrap();
        let rect = geo::BoundingRect::bounding_rect(&cell.polygon).unwrap();
        assert_eq!((rect.min().x, rect.min().y), (1.0, 1.0));
        assert_eq!((rect.max().x, rect.max().y), (2.0, 2.0));
    }

    #[test]
    fn projected_cells_are_reprojected_to_geographic() {
        let sirgas = Crs::new("EPSG", "31983", false);
        let store = store_in(
            &sirgas,
            &[
                (333_100.0, 7_394_100.0, Some("5")),
                (334_500.0, 7_395_700.0, Some("7")),
            ],
        );
        let request = GridRequest {
            cell_size: 1000.0,
            unit: GridUnit::Meters,
            reducer: Reducer::Sum,
            column: "ENE_TOT".to_string(),
        };
        let output = run_grid(&store, &request, GridStrategy::Arithmetic)
            .unwrap()
            .unwrap();

        assert_eq!(output.frame, Frame::Projected);
        assert_eq!(output.cell_size, 1000.0);
        assert_eq!(
            counts(&output),
            BTreeMap::from([((0, 0), 1), ((1, 1), 1)])
        );
        for cell in &output.cells {
            let rect = geo::BoundingRect::bounding_rect(&cell.polygon).unwrap();
            assert!(rect.min().x > -47.0 && rect.max().x < -46.0, "{rect:?}");
            assert!(rect.min().y > -24.0 && rect.max().y < -23.0, "{rect:?}");
        }
    }

    #[test]
    fn metres_on_geographic_base_convert_to_degrees() {
        let request = GridRequest {
            cell_size: 1000.0,
            unit: GridUnit::Meters,
            reducer: Reducer::Sum,
            column: "ENE_TOT".to_string(),
        };
        let (frame, size) = resolve_frame(&request, &Crs::wgs84());
        assert_eq!(frame, Frame::Geographic);
        assert!((size - 1.0 / 111.32).abs() < 1e-12);

        let sirgas = Crs::new("EPSG", "31983", false);
        assert_eq!(resolve_frame(&request, &sirgas), (Frame::Projected, 1000.0));

        let degrees = GridRequest {
            unit: GridUnit::Degrees,
            cell_size: 0.01,
            ..request
        };
        assert_eq!(resolve_frame(&degrees, &sirgas), (Frame::Geographic, 0.01));
    }

    #[test]
    fn missing_table_is_no_result() {
        let store = Store::open_in_memory().unwrap();
        assert!(
            run_grid(&store, &request(Reducer::Sum, 1.0), GridStrategy::Arithmetic)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn no_located_rows_is_no_result() {
        let store = store_with(&[]);
        assert!(
            run_grid(&store, &request(Reducer::Count, 1.0), GridStrategy::BulkJoin)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn unfinalised_store_is_rejected() {
        let store = four_points();
        store
            .set_meta(bdgd_map_database::META_SPATIAL_INDEX_READY, "false")
            .unwrap();
        assert!(matches!(
            run_grid(&store, &request(Reducer::Count, 1.0), GridStrategy::Arithmetic),
            Err(GridError::IndexNotReady)
        ));
    }

    #[test]
    fn bad_requests_are_rejected() {
        let store = four_points();
        assert!(matches!(
            run_grid(&store, &request(Reducer::Sum, 0.0), GridStrategy::Arithmetic),
            Err(GridError::InvalidCellSize { .. })
        ));

        let missing = GridRequest {
            column: "DEM".to_string(),
            ..request(Reducer::Sum, 1.0)
        };
        assert!(matches!(
            run_grid(&store, &missing, GridStrategy::Arithmetic),
            Err(GridError::MissingColumn { .. })
        ));

        let count = GridRequest {
            column: "DEM".to_string(),
            ..request(Reducer::Count, 1.0)
        };
        assert!(run_grid(&store, &count, GridStrategy::Arithmetic).unwrap().is_some());
    }

    #[test]
    fn tiny_cells_over_a_wide_extent_are_an_error() {
        let sirgas = Crs::new("EPSG", "31983", false);
        let store = store_in(
            &sirgas,
            &[
                (0.0, 7_000_000.0, Some("1")),
                (4_000_000.0, 10_000_000.0, Some("2")),
            ],
        );
        let request = GridRequest {
            cell_size: 0.5,
            unit: GridUnit::Meters,
            reducer: Reducer::Sum,
            column: "ENE_TOT".to_string(),
        };
        for strategy in ALL_STRATEGIES {
            assert!(
                matches!(
                    run_grid(&store, &request, strategy),
                    Err(GridError::TooManyCells { .. })
                ),
                "{strategy}"
            );
        }
    }

    #[test]
    fn value_column_lookup_ignores_case() {
        let store = four_points();
        let lower = GridRequest {
            column: "ene_tot".to_string(),
            ..request(Reducer::Sum, 1.0)
        };
        let output = run_grid(&store, &lower, GridStrategy::Arithmetic)
            .unwrap()
            .unwrap();
        assert_eq!(output.cells[0].value, 30.0);
    }

    #[test]
    fn writes_feature_collection_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("grid.geojson");
        let store = four_points();
        let output = run_grid(&store, &request(Reducer::Sum, 1.0), GridStrategy::Arithmetic)
            .unwrap()
            .unwrap();

        write_geojson(&path, &output).unwrap();
        assert!(!dir.path().join("out").join("grid.geojson.tmp").exists());

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["type"], "FeatureCollection");
        assert_eq!(json["caption"], "Sum of ENE_TOT per Grid Cell");
        assert_eq!(json["value_max"], 40.0);
        assert_eq!(json["value_min"], 30.0);

        let features = json["features"].as_array().unwrap();
        assert_eq!(features.len(), 3);
        let first = &features[0]["properties"];
        assert_eq!(first["cell_x"], 0);
        assert_eq!(first["cell_y"], 0);
        assert_eq!(first["ENE_TOT"], 30.0);
        assert_eq!(first["point_count"], 2);
        assert_eq!(features[0]["geometry"]["type"], "Polygon");
        assert!(first["fill"].as_str().unwrap().starts_with('#'));
    }

    #[test]
    fn stale_output_is_removed_when_nothing_is_produced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.geojson");
        let output = run_grid(&four_points(), &request(Reducer::Sum, 1.0), GridStrategy::Arithmetic)
            .unwrap()
            .unwrap();
        write_geojson(&path, &output).unwrap();
        std::fs::write(dir.path().join("grid.geojson.tmp"), "{").unwrap();

        let empty = store_with(&[]);
        assert!(
            run_grid(&empty, &request(Reducer::Sum, 1.0), GridStrategy::Arithmetic)
                .unwrap()
                .is_none()
        );
        assert!(remove_stale_output(&path).unwrap());
        assert!(!path.exists());
        assert!(!dir.path().join("grid.geojson.tmp").exists());

        assert!(!remove_stale_output(&path).unwrap());
    }
}

//! Arithmetic binning: one grouped `FLOOR` query over the coordinate
//! columns.
//!
//! This is the canonical strategy. A point belongs to the cell whose
//! half-open interval `[edge, edge + size)` contains it on both axes, with
//! the closing edge of the lattice folded into the last column and row.

use bdgd_map_database::{PROCESSED_TABLE, Store};
use bdgd_map_generate_models::CellAggregate;

use crate::GridError;
use crate::aggregate::{CellQuery, GridAggregator, collect_grouped, located, reducer_expr, value_expr};

/// Grid aggregation by cell-index arithmetic in SQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct Arithmetic;

impl GridAggregator for Arithmetic {
    fn name(&self) -> &'static str {
        "arithmetic"
    }

    fn aggregate(&self, store: &Store, query: &CellQuery<'_>) -> Result<Vec<CellAggregate>, GridError> {
        let lattice = query.lattice;
        let x = query.frame.x_column();
        let y = query.frame.y_column();
        let sql = format!(
            "SELECT ix, iy, {reduce} AS value, COUNT(*) AS point_count
             FROM (
                 SELECT
                     LEAST(GREATEST(CAST(FLOOR(({x} - ?::DOUBLE) / ?::DOUBLE) AS BIGINT), 0), ?::BIGINT) AS ix,
                     LEAST(GREATEST(CAST(FLOOR(({y} - ?::DOUBLE) / ?::DOUBLE) AS BIGINT), 0), ?::BIGINT) AS iy,
                     {value} AS v
                 FROM {PROCESSED_TABLE}
                 WHERE {located}
             )
             GROUP BY ix, iy
             ORDER BY ix, iy",
            reduce = reducer_expr(query.reducer),
            value = value_expr("", query.value_column),
            located = located("", query.frame),
        );

        #[allow(clippy::cast_possible_wrap)]
        let (last_x, last_y) = ((lattice.nx - 1) as i64, (lattice.ny - 1) as i64);
        let cells = collect_grouped(
            store.connection(),
            &sql,
            duckdb::params![
                lattice.min_x,
                lattice.size,
                last_x,
                lattice.min_y,
                lattice.size,
                last_y,
            ],
        )?;

        log::debug!("Arithmetic binning produced {} populated cells", cells.len());
        Ok(cells)
    }
}

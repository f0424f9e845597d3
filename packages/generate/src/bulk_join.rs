//! Bulk join: the lattice is materialised as a `grid_cells` table and
//! matched against every point in one grouped range join.

use bdgd_map_database::{PROCESSED_TABLE, Store, insert_rows};
use bdgd_map_generate_models::CellAggregate;
use duckdb::types::Value as SqlValue;

use crate::GridError;
use crate::aggregate::{CellQuery, GridAggregator, collect_grouped, located, reducer_expr, value_expr};
use crate::lattice::Lattice;

const GRID_CELLS: &str = "grid_cells";

/// Grid aggregation by range join against a cell table.
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkJoin;

/// One row per lattice cell. The outer edges are opened to infinity so the
/// closing edge of the lattice lands in the last column and row, the same
/// way the clamped floor assigns it.
#[allow(clippy::cast_possible_wrap)]
fn cell_rows(lattice: &Lattice) -> Vec<Vec<SqlValue>> {
    let lower = |i: usize, edge: f64| if i == 0 { f64::NEG_INFINITY } else { edge };
    let upper = |i: usize, n: usize, edge: f64| if i + 1 == n { f64::INFINITY } else { edge };

    lattice
        .cells()
        .map(|cell| {
            vec![
                SqlValue::BigInt(cell.ix as i64),
                SqlValue::BigInt(cell.iy as i64),
                SqlValue::Double(lower(cell.ix, lattice.x_edge(cell.ix))),
                SqlValue::Double(upper(cell.ix, lattice.nx, lattice.x_edge(cell.ix + 1))),
                SqlValue::Double(lower(cell.iy, lattice.y_edge(cell.iy))),
                SqlValue::Double(upper(cell.iy, lattice.ny, lattice.y_edge(cell.iy + 1))),
            ]
        })
        .collect()
}

impl GridAggregator for BulkJoin {
    fn name(&self) -> &'static str {
        "bulk_join"
    }

    fn aggregate(&self, store: &Store, query: &CellQuery<'_>) -> Result<Vec<CellAggregate>, GridError> {
        let conn = store.connection();
        let rows = cell_rows(query.lattice);

        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {GRID_CELLS};
             CREATE TEMP TABLE {GRID_CELLS} (
                 ix BIGINT NOT NULL,
                 iy BIGINT NOT NULL,
                 x_min DOUBLE NOT NULL,
                 x_max DOUBLE NOT NULL,
                 y_min DOUBLE NOT NULL,
                 y_max DOUBLE NOT NULL
             );"
        ))?;
        insert_rows(
            conn,
            GRID_CELLS,
            &["ix", "iy", "x_min", "x_max", "y_min", "y_max"].map(String::from),
            &rows,
        )?;
        conn.execute_batch(&format!(
            "CREATE INDEX {GRID_CELLS}_bounds_idx ON {GRID_CELLS} (x_min, x_max, y_min, y_max);"
        ))?;
        log::debug!("Materialised {} grid cells", rows.len());

        let x = query.frame.x_column();
        let y = query.frame.y_column();
        let sql = format!(
            "SELECT ix, iy, {reduce} AS value, COUNT(*) AS point_count
             FROM (
                 SELECT g.ix, g.iy, {value} AS v
                 FROM {PROCESSED_TABLE} p
                 JOIN {GRID_CELLS} g
                   ON p.{x} >= g.x_min AND p.{x} < g.x_max
                  AND p.{y} >= g.y_min AND p.{y} < g.y_max
                 WHERE {located}
             )
             GROUP BY ix, iy
             ORDER BY ix, iy",
            reduce = reducer_expr(query.reducer),
            value = value_expr("p.", query.value_column),
            located = located("p.", query.frame),
        );

        let result = collect_grouped(conn, &sql, &[]);
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {GRID_CELLS};"))?;
        let cells = result?;

        log::debug!("Bulk join produced {} populated cells", cells.len());
        Ok(cells)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outer_edges_are_open() {
        let lattice = Lattice::from_bounds(0.0, 0.0, 2.0, 1.0, 1.0).unwrap();
        let rows = cell_rows(&lattice);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][2], SqlValue::Double(f64::NEG_INFINITY));
        assert_eq!(rows[0][3], SqlValue::Double(1.0));
        assert_eq!(rows[1][2], SqlValue::Double(1.0));
        assert_eq!(rows[1][3], SqlValue::Double(f64::INFINITY));
        assert_eq!(rows[1][5], SqlValue::Double(f64::INFINITY));
    }
}

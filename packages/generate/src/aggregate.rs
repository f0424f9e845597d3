//! The [`GridAggregator`] seam and what the three strategies share.

use std::collections::BTreeMap;

use bdgd_map_database::{Store, quote_ident};
use bdgd_map_generate_models::{CellAggregate, CellIndex, Frame, GridStrategy, Reducer};

use crate::arithmetic::Arithmetic;
use crate::bulk_join::BulkJoin;
use crate::lattice::Lattice;
use crate::per_cell::PerCell;
use crate::GridError;

/// Everything a strategy needs to aggregate one request.
#[derive(Debug, Clone, Copy)]
pub struct CellQuery<'a> {
    /// Lattice the points are binned into.
    pub lattice: &'a Lattice,
    /// Frame whose coordinate columns are read.
    pub frame: Frame,
    /// Reduction applied per cell.
    pub reducer: Reducer,
    /// Stored name of the value column, `None` for [`Reducer::Count`].
    pub value_column: Option<&'a str>,
}

/// Computes per-cell aggregates over `processed_data`.
///
/// Implementations return one [`CellAggregate`] per populated cell, sorted
/// by cell index. Cells without points are never returned.
pub trait GridAggregator {
    /// Strategy name used in logs.
    fn name(&self) -> &'static str;

    /// Aggregates every located row of `processed_data` into the lattice.
    ///
    /// # Errors
    ///
    /// Returns [`GridError`] if the underlying queries fail.
    fn aggregate(&self, store: &Store, query: &CellQuery<'_>) -> Result<Vec<CellAggregate>, GridError>;
}

/// Returns the aggregator for a configured strategy.
#[must_use]
pub fn aggregator_for(strategy: GridStrategy) -> Box<dyn GridAggregator> {
    match strategy {
        GridStrategy::PerCell => Box::new(PerCell),
        GridStrategy::BulkJoin => Box::new(BulkJoin),
        GridStrategy::Arithmetic => Box::new(Arithmetic),
    }
}

/// SQL expression yielding the value column as a finite `DOUBLE`, or `NULL`
/// for missing and non-numeric values.
pub(crate) fn value_expr(qualifier: &str, value_column: Option<&str>) -> String {
    value_column.map_or_else(
        || "NULL::DOUBLE".to_string(),
        |column| {
            let cast = format!("TRY_CAST({qualifier}{} AS DOUBLE)", quote_ident(column));
            format!("CASE WHEN isfinite({cast}) THEN {cast} END")
        },
    )
}

/// SQL aggregate over a value expression aliased `v`.
pub(crate) const fn reducer_expr(reducer: Reducer) -> &'static str {
    match reducer {
        Reducer::Sum => "COALESCE(SUM(v), 0)",
        Reducer::Mean => "COALESCE(AVG(v), 0)",
        Reducer::Count => "CAST(COUNT(*) AS DOUBLE)",
    }
}

/// `WHERE` clause keeping rows located in the frame.
pub(crate) fn located(qualifier: &str, frame: Frame) -> String {
    format!(
        "{qualifier}{x} IS NOT NULL AND {qualifier}{y} IS NOT NULL",
        x = frame.x_column(),
        y = frame.y_column(),
    )
}

/// Reads `(ix, iy, value, point_count)` rows produced by a grouped query.
pub(crate) fn collect_grouped(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[&dyn duckdb::ToSql],
) -> Result<Vec<CellAggregate>, GridError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut cells = Vec::new();

    while let Some(row) = rows.next()? {
        let ix: i64 = row.get(0)?;
        let iy: i64 = row.get(1)?;
        let value: f64 = row.get(2)?;
        let count: i64 = row.get(3)?;
        if count <= 0 {
            continue;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        cells.push(CellAggregate {
            index: CellIndex::new(ix as usize, iy as usize),
            value,
            point_count: count as u64,
        });
    }

    cells.sort_by_key(|c| c.index);
    Ok(cells)
}

/// Accumulates values per cell in Rust, for strategies that do not reduce
/// in SQL.
#[derive(Debug, Default)]
pub(crate) struct CellAccumulator {
    cells: BTreeMap<CellIndex, (u64, f64, u64)>,
}

impl CellAccumulator {
    /// Records one point. `value` is `None` for missing or non-numeric
    /// values, which count towards `point_count` only.
    pub fn add(&mut self, index: CellIndex, value: Option<f64>) {
        let entry = self.cells.entry(index).or_insert((0, 0.0, 0));
        entry.0 += 1;
        if let Some(v) = value.filter(|v| v.is_finite()) {
            entry.1 += v;
            entry.2 += 1;
        }
    }

    /// Reduces the accumulated cells.
    #[allow(clippy::cast_precision_loss)]
    pub fn finish(self, reducer: Reducer) -> Vec<CellAggregate> {
        self.cells
            .into_iter()
            .map(|(index, (points, sum, numeric))| {
                let value = match reducer {
                    Reducer::Sum => sum,
                    Reducer::Mean if numeric > 0 => sum / numeric as f64,
                    Reducer::Mean => 0.0,
                    Reducer::Count => points as f64,
                };
                CellAggregate {
                    index,
                    value,
                    point_count: points,
                }
            })
            .collect()
    }
}

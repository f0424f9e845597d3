//! Per-cell querying: one R-tree containment query per lattice cell.
//!
//! Containment follows the geometry kernel, so points lying exactly on a
//! cell outline belong to no cell.

use bdgd_map_database::Store;
use bdgd_map_generate_models::CellAggregate;
use bdgd_map_spatial::PointIndex;

use crate::GridError;
use crate::aggregate::{CellAccumulator, CellQuery, GridAggregator};

/// Grid aggregation by spatial queries against a point index.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerCell;

impl GridAggregator for PerCell {
    fn name(&self) -> &'static str {
        "per_cell"
    }

    fn aggregate(&self, store: &Store, query: &CellQuery<'_>) -> Result<Vec<CellAggregate>, GridError> {
        let index = PointIndex::load(
            store.connection(),
            query.frame.x_column(),
            query.frame.y_column(),
            query.value_column,
        )?;

        let mut accumulator = CellAccumulator::default();
        for cell in query.lattice.cells() {
            let polygon = query.lattice.cell_rect(cell).to_polygon();
            for point in index.points_within(&polygon) {
                accumulator.add(cell, point.value);
            }
        }

        let cells = accumulator.finish(query.reducer);
        log::debug!(
            "Per-cell queries over {} cells produced {} populated cells",
            query.lattice.len(),
            cells.len()
        );
        Ok(cells)
    }
}

//! Regular lattice over the data extent.

use bdgd_map_generate_models::CellIndex;
use geo::{Rect, coord};

/// A regular grid of square cells anchored at the lower-left corner of the
/// data.
///
/// Cells are half-open `[min, min + size)` on both axes, except that points
/// on the closing edge of the last column or row are assigned to that
/// column or row, so every in-bounds point maps to exactly one cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lattice {
    /// Western edge.
    pub min_x: f64,
    /// Southern edge.
    pub min_y: f64,
    /// Cell edge length in frame units.
    pub size: f64,
    /// Number of columns, at least 1.
    pub nx: usize,
    /// Number of rows, at least 1.
    pub ny: usize,
}

/// Upper bound on the number of cells in one lattice.
pub const MAX_LATTICE_CELLS: usize = 10_000_000;

/// Reasons a lattice cannot be laid out.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum LatticeError {
    /// A bound or the size is not finite, the bounds are inverted, or the
    /// size is not positive.
    #[error("Invalid lattice bounds or cell size")]
    InvalidBounds,

    /// The cell size is too small for the extent.
    #[error("Lattice of {columns} x {rows} cells exceeds the limit of {limit} cells")]
    TooManyCells {
        /// Columns the extent would need.
        columns: f64,
        /// Rows the extent would need.
        rows: f64,
        /// [`MAX_LATTICE_CELLS`].
        limit: usize,
    },
}

fn cells_along(extent: f64, size: f64) -> f64 {
    (extent / size).ceil().max(1.0)
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn clamped_floor(offset: f64, size: f64, n: usize) -> usize {
    let raw = (offset / size).floor();
    if raw <= 0.0 {
        0
    } else {
        (raw as usize).min(n - 1)
    }
}

impl Lattice {
    /// Builds the lattice covering `[min_x, max_x] × [min_y, max_y]`.
    ///
    /// # Errors
    ///
    /// * [`LatticeError::InvalidBounds`] if a bound is not finite, the bounds
    ///   are inverted, or `size` is not a positive finite number
    /// * [`LatticeError::TooManyCells`] if the lattice would hold more than
    ///   [`MAX_LATTICE_CELLS`] cells
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_bounds(
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
        size: f64,
    ) -> Result<Self, LatticeError> {
        let finite = [min_x, min_y, max_x, max_y, size]
            .iter()
            .all(|v| v.is_finite());
        if !finite || size <= 0.0 || max_x < min_x || max_y < min_y {
            return Err(LatticeError::InvalidBounds);
        }

        let columns = cells_along(max_x - min_x, size);
        let rows = cells_along(max_y - min_y, size);
        #[allow(clippy::cast_precision_loss)]
        let limit = MAX_LATTICE_CELLS as f64;
        if columns * rows > limit {
            return Err(LatticeError::TooManyCells {
                columns,
                rows,
                limit: MAX_LATTICE_CELLS,
            });
        }

        // Both counts are at most MAX_LATTICE_CELLS here.
        Ok(Self {
            min_x,
            min_y,
            size,
            nx: columns as usize,
            ny: rows as usize,
        })
    }

    /// Total number of cells, at most [`MAX_LATTICE_CELLS`].
    #[must_use]
    pub const fn len(&self) -> usize {
        self.nx * self.ny
    }

    /// Always `false`: a lattice has at least one cell.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Cell containing a point, or `None` for non-finite coordinates.
    #[must_use]
    pub fn cell_index(&self, x: f64, y: f64) -> Option<CellIndex> {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        Some(CellIndex::new(
            clamped_floor(x - self.min_x, self.size, self.nx),
            clamped_floor(y - self.min_y, self.size, self.ny),
        ))
    }

    /// X coordinate of the western edge of column `ix`. `x_edge(nx)` is the
    /// closing edge.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn x_edge(&self, ix: usize) -> f64 {
        (ix as f64).mul_add(self.size, self.min_x)
    }

    /// Y coordinate of the southern edge of row `iy`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn y_edge(&self, iy: usize) -> f64 {
        (iy as f64).mul_add(self.size, self.min_y)
    }

    /// Outline of a cell in frame coordinates. Adjacent cells share edges
    /// exactly.
    #[must_use]
    pub fn cell_rect(&self, index: CellIndex) -> Rect<f64> {
        Rect::new(
            coord! { x: self.x_edge(index.ix), y: self.y_edge(index.iy) },
            coord! { x: self.x_edge(index.ix + 1), y: self.y_edge(index.iy + 1) },
        )
    }

    /// Every cell index, column by column.
    pub fn cells(&self) -> impl Iterator<Item = CellIndex> + '_ {
        (0..self.nx).flat_map(move |ix| (0..self.ny).map(move |iy| CellIndex::new(ix, iy)))
    }
}

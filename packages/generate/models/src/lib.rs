#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Types shared by the grid aggregation engine and its callers.

use geo::Polygon;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Metres per degree used to convert a metric cell size for a geographic
/// frame (1 km = 1 / 111.32 degrees).
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// How values inside a cell are combined.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Reducer {
    /// Sum of numeric values, zero when there are none.
    #[default]
    Sum,
    /// Mean of numeric values, zero when there are none.
    Mean,
    /// Number of points in the cell.
    Count,
}

impl Reducer {
    /// Human label used in captions.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Sum => "Sum",
            Self::Mean => "Mean",
            Self::Count => "Count",
        }
    }
}

/// Unit of the configured cell size.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum GridUnit {
    /// Metres.
    #[default]
    Meters,
    /// Degrees of longitude/latitude.
    Degrees,
}

/// Which aggregation implementation to run.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum GridStrategy {
    /// One R-tree containment query per lattice cell.
    PerCell,
    /// One grouped range join against a materialised cell table.
    BulkJoin,
    /// One grouped `FLOOR` query on the coordinate columns.
    #[default]
    Arithmetic,
}

/// Coordinate frame the lattice is laid out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Frame {
    /// `longitude`/`latitude` in `EPSG:4326`.
    Geographic,
    /// `geom_x`/`geom_y` in the projected base CRS.
    Projected,
}

impl Frame {
    /// Column holding X in this frame.
    #[must_use]
    pub const fn x_column(self) -> &'static str {
        match self {
            Self::Geographic => "longitude",
            Self::Projected => "geom_x",
        }
    }

    /// Column holding Y in this frame.
    #[must_use]
    pub const fn y_column(self) -> &'static str {
        match self {
            Self::Geographic => "latitude",
            Self::Projected => "geom_y",
        }
    }
}

/// What to aggregate and at which resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRequest {
    /// Cell edge length in `unit`.
    pub cell_size: f64,
    /// Unit of `cell_size`.
    pub unit: GridUnit,
    /// Combination applied inside each cell.
    pub reducer: Reducer,
    /// Value column. Ignored for [`Reducer::Count`].
    pub column: String,
}

impl GridRequest {
    /// Property name of the aggregated value in the output.
    #[must_use]
    pub fn value_name(&self) -> &str {
        match self.reducer {
            Reducer::Count => "count",
            Reducer::Sum | Reducer::Mean => &self.column,
        }
    }

    /// Legend caption, e.g. `Sum of ENE_TOT per Grid Cell`.
    #[must_use]
    pub fn caption(&self) -> String {
        match self.reducer {
            Reducer::Count => "Count of Records per Grid Cell".to_string(),
            reducer => format!("{} of {} per Grid Cell", reducer.label(), self.column),
        }
    }
}

/// Position of a cell in the lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellIndex {
    /// Column, counted from the west edge.
    pub ix: usize,
    /// Row, counted from the south edge.
    pub iy: usize,
}

impl CellIndex {
    /// Creates a cell index.
    #[must_use]
    pub const fn new(ix: usize, iy: usize) -> Self {
        Self { ix, iy }
    }
}

/// Aggregate for one populated cell, before geometry is attached.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellAggregate {
    /// Lattice position.
    pub index: CellIndex,
    /// Reduced value.
    pub value: f64,
    /// Number of points in the cell.
    pub point_count: u64,
}

/// A populated output cell with its geographic outline.
#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    /// Lattice position.
    pub index: CellIndex,
    /// Cell outline in `EPSG:4326`.
    pub polygon: Polygon<f64>,
    /// Reduced value.
    pub value: f64,
    /// Number of points in the cell.
    pub point_count: u64,
}

/// Colour scale bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

impl ValueRange {
    /// Range of the positive values, or `None` if there are none.
    ///
    /// Zero and negative values are painted grey and never shape the scale.
    /// A single distinct value `v` gives `[0.9 * v, v]` so the scale is not
    /// degenerate.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn from_values<I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut range: Option<Self> = None;
        for value in values
            .into_iter()
            .filter(|v| v.is_finite() && *v > 0.0)
        {
            range = Some(match range {
                None => Self {
                    min: value,
                    max: value,
                },
                Some(r) => Self {
                    min: r.min.min(value),
                    max: r.max.max(value),
                },
            });
        }

        range.map(|mut r| {
            if r.min == r.max {
                r.min = r.max * 0.9;
            }
            r
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_value_range_widens_downward() {
        let range = ValueRange::from_values([50.0]).unwrap();
        assert!((range.min - 45.0).abs() < 1e-9);
        assert!((range.max - 50.0).abs() < 1e-9);
    }

    #[test]
    fn zeros_are_ignored() {
        let range = ValueRange::from_values([0.0, 3.0, 0.0, 9.0]).unwrap();
        assert_eq!(range, ValueRange { min: 3.0, max: 9.0 });
        assert_eq!(ValueRange::from_values([0.0, 0.0]), None);
    }

    #[test]
    fn negative_values_never_shape_the_range() {
        assert_eq!(ValueRange::from_values([-4.0, -4.0]), None);
        assert_eq!(ValueRange::from_values([-4.0, 0.0]), None);
        assert_eq!(
            ValueRange::from_values([-10.0, 5.0, 20.0]),
            Some(ValueRange { min: 5.0, max: 20.0 })
        );

        let single = ValueRange::from_values([-3.0, 8.0]).unwrap();
        assert!((single.min - 7.2).abs() < 1e-9);
        assert!((single.max - 8.0).abs() < 1e-9);
    }

    #[test]
    fn enums_parse_from_config_names() {
        assert_eq!("per_cell".parse::<GridStrategy>().unwrap(), GridStrategy::PerCell);
        assert_eq!("BULK_JOIN".parse::<GridStrategy>().unwrap(), GridStrategy::BulkJoin);
        assert_eq!("mean".parse::<Reducer>().unwrap(), Reducer::Mean);
        assert_eq!("degrees".parse::<GridUnit>().unwrap(), GridUnit::Degrees);
        assert!("median".parse::<Reducer>().is_err());
    }

    #[test]
    fn count_ignores_column_in_names() {
        let request = GridRequest {
            cell_size: 1000.0,
            unit: GridUnit::Meters,
            reducer: Reducer::Count,
            column: "ENE_TOT".to_string(),
        };
        assert_eq!(request.value_name(), "count");
        assert_eq!(request.caption(), "Count of Records per Grid Cell");

        let sum = GridRequest {
            reducer: Reducer::Sum,
            ..request
        };
        assert_eq!(sum.value_name(), "ENE_TOT");
        assert_eq!(sum.caption(), "Sum of ENE_TOT per Grid Cell");
    }
}

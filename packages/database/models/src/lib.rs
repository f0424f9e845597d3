#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Row and relation types shared by every pipeline stage.
//!
//! Geodatabase layers do not share a fixed schema: columns appear in one
//! source and are missing from the next, and the same natural key may be an
//! integer in one layer and text in another. Everything here is therefore
//! schema-on-read. A [`Relation`] is a list of column names plus rows of
//! loosely typed [`Value`]s, with explicit presence checks and typed
//! accessors that default missing numerics to zero.

pub mod batch;
pub mod columns;
pub mod crs;

pub use batch::{JoinedRelation, SpatialBatch};
pub use crs::{Crs, CrsParseError};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// A single loosely typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Missing value.
    Null,
    /// Integer value (any integer width read from a source).
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Text value, kept verbatim.
    Text(String),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Normalises the value into the string form used for key equality.
    ///
    /// Integers render in plain decimal and floats always keep a fractional
    /// part, so an integer key `123` matches the text `"123"` but never the
    /// float `123.0`. Text is compared exactly as read. Nulls have no key.
    #[must_use]
    pub fn as_key(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(format!("{f:?}")),
            Self::Text(s) => Some(s.clone()),
        }
    }

    /// Coerces the value to a float.
    ///
    /// Text is parsed after trimming whitespace. Non-numeric text, nulls and
    /// non-finite numbers yield `None`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            Self::Null => return None,
            Self::Int(i) => *i as f64,
            Self::Float(f) => *f,
            Self::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Errors raised when a row does not fit a relation's schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelationError {
    /// Row arity differs from the number of columns.
    #[error("row has {found} values but the relation has {expected} columns")]
    Arity {
        /// Number of columns in the relation.
        expected: usize,
        /// Number of values in the rejected row.
        found: usize,
    },
}

/// Join key column names on each side of the spatial join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinKeys {
    /// Key column in the spatial layer, e.g. `COD_ID`.
    pub spatial: String,
    /// Key column in the consumer layers, e.g. `PN_CON`.
    pub consumer: String,
}

/// Where spatial and consumer records are joined.
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
#[strum(serialize_all = "snake_case")]
pub enum JoinStrategy {
    /// Hash join in memory, then load the result into the store.
    InMemory,
    /// Staged, indexed join inside the store, one transaction per source.
    #[default]
    Store,
}

/// Compares two column names the way the store does (ASCII case-insensitive).
#[must_use]
pub fn same_column(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// A schema-on-read table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Relation {
    /// Creates an empty relation with the given columns.
    ///
    /// Columns whose names repeat an earlier column (case-insensitively) are
    /// dropped.
    #[must_use]
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for column in columns {
            let column = column.into();
            if !unique.iter().any(|c| same_column(c, &column)) {
                unique.push(column);
            }
        }
        Self {
            columns: unique,
            rows: Vec::new(),
        }
    }

    /// Column names in order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// All rows in order.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Consumes the relation, returning its columns and rows.
    #[must_use]
    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<Value>>) {
        (self.columns, self.rows)
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the relation has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column, matched case-insensitively.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| same_column(c, name))
    }

    /// Whether the column exists.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Appends a row.
    ///
    /// # Errors
    ///
    /// Returns [`RelationError::Arity`] if the row length differs from the
    /// number of columns.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), RelationError> {
        if row.len() != self.columns.len() {
            return Err(RelationError::Arity {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Value at `row` for the named column, if both exist.
    #[must_use]
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Numeric value at `row` for the named column. Missing columns, nulls
    /// and non-numeric values read as zero.
    #[must_use]
    pub fn numeric_or_zero(&self, row: usize, column: &str) -> f64 {
        self.value(row, column)
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    /// Returns the index of `name`, creating the column filled with
    /// `default` if it does not exist yet.
    pub fn ensure_column(&mut self, name: &str, default: &Value) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(default.clone());
        }
        self.columns.len() - 1
    }

    /// Overwrites one cell. Out-of-range positions are ignored.
    pub fn set(&mut self, row: usize, column: usize, value: Value) {
        if let Some(cell) = self.rows.get_mut(row).and_then(|r| r.get_mut(column)) {
            *cell = value;
        }
    }

    /// Keeps only the rows for which `keep` returns `true`.
    pub fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(usize) -> bool,
    {
        let mut idx = 0;
        self.rows.retain(|_| {
            let kept = keep(idx);
            idx += 1;
            kept
        });
    }

    /// Appends every row of `other`, widening the schema to the union of
    /// both column sets. Cells for columns a side does not have become
    /// [`Value::Null`].
    pub fn append(&mut self, other: Self) {
        let (other_columns, other_rows) = other.into_parts();
        let mapping: Vec<usize> = other_columns
            .iter()
            .map(|c| self.ensure_column(c, &Value::Null))
            .collect();
        let width = self.columns.len();

        self.rows.reserve(other_rows.len());
        for row in other_rows {
            let mut widened = vec![Value::Null; width];
            for (value, &target) in row.into_iter().zip(&mapping) {
                widened[target] = value;
            }
            self.rows.push(widened);
        }
    }

    /// Concatenates relations into one with the union schema. Column order
    /// follows first appearance.
    #[must_use]
    pub fn concat<I>(relations: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let mut out = Self::default();
        for relation in relations {
            out.append(relation);
        }
        out
    }
}

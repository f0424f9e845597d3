#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Disk-backed `DuckDB` store for joined BDGD records.
//!
//! Each source is staged into `spatial_staging` / `consumer_staging`,
//! joined on indexed key columns and appended to the accumulating
//! `processed_data` table inside one transaction, so a failing source
//! never touches rows committed by earlier ones. Once every source is in,
//! [`Store::finalize`] derives `longitude`/`latitude`, builds the spatial
//! indexes and records the `_meta` flags downstream stages check.

pub mod finalize;
pub mod merge;
pub mod paths;

use std::path::{Path, PathBuf};

use bdgd_map_database_models::{Crs, RelationError};
use bdgd_map_geometry::GeometryError;
use duckdb::Connection;

/// Name of the accumulating output table.
pub const PROCESSED_TABLE: &str = "processed_data";

/// `_meta` key holding the run's base CRS identifier.
pub const META_BASE_CRS: &str = "base_crs";

/// `_meta` key holding whether the base CRS is geographic.
pub const META_BASE_CRS_GEOGRAPHIC: &str = "base_crs_geographic";

/// `_meta` key set to `true` once coordinates and indexes are built.
pub const META_SPATIAL_INDEX_READY: &str = "spatial_index_ready";

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Geometry serialisation error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reprojection error while deriving coordinates.
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    /// Relation shape error.
    #[error(transparent)]
    Relation(#[from] RelationError),

    /// A required column is absent from the input.
    #[error("Missing column {column} in {relation}")]
    MissingColumn {
        /// Column name.
        column: String,
        /// Where it was expected.
        relation: String,
    },

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}

/// Quotes an identifier for interpolation into SQL.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A `DuckDB` connection holding the pipeline's tables.
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) a store file and ensures the `_meta` table exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the directory, connection or schema cannot be
    /// created.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            paths::ensure_dir(parent)?;
        }
        let conn = Connection::open(path)?;
        log::debug!("Opened store {}", path.display());
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Creates a fresh store, deleting any previous file and its `.wal`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the old files cannot be removed or the new
    /// store cannot be opened.
    pub fn create(path: &Path) -> Result<Self, DbError> {
        paths::remove_store_files(path)?;
        Self::open(path)
    }

    /// Opens a transient in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or schema cannot be created.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, DbError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn, path })
    }

    /// The underlying connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Path of the store file, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Gets a metadata value from the `_meta` table.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>, DbError> {
        let mut stmt = self.conn.prepare("SELECT value FROM _meta WHERE key = ?")?;
        let result = stmt.query_row([key], |row| row.get(0));
        match result {
            Ok(v) => Ok(Some(v)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::DuckDb(e)),
        }
    }

    /// Sets a metadata value in the `_meta` table.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the upsert fails.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO _meta (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            duckdb::params![key, value],
        )?;
        Ok(())
    }

    /// Records the run's base CRS.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the metadata update fails.
    pub fn set_base_crs(&self, crs: &Crs) -> Result<(), DbError> {
        self.set_meta(META_BASE_CRS, &crs.identifier())?;
        self.set_meta(
            META_BASE_CRS_GEOGRAPHIC,
            if crs.geographic { "true" } else { "false" },
        )
    }

    /// Reads the base CRS recorded by a previous run.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or the stored identifier is
    /// malformed.
    pub fn base_crs(&self) -> Result<Option<Crs>, DbError> {
        let Some(identifier) = self.get_meta(META_BASE_CRS)? else {
            return Ok(None);
        };
        let mut crs: Crs = identifier.parse().map_err(|e| DbError::Conversion {
            message: format!("{e}"),
        })?;
        crs.geographic = self.get_meta(META_BASE_CRS_GEOGRAPHIC)?.as_deref() == Some("true");
        Ok(Some(crs))
    }

    /// Whether coordinates and spatial indexes have been built.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn spatial_index_ready(&self) -> Result<bool, DbError> {
        self.get_meta(META_SPATIAL_INDEX_READY)
            .map(|v| v.as_deref() == Some("true"))
    }

    /// Whether a table (or view) exists. Names compare case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn has_table(&self, name: &str) -> Result<bool, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT COUNT(*) FROM information_schema.tables WHERE lower(table_name) = lower(?)",
        )?;
        let count: i64 = stmt.query_row([name], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Whether `processed_data` exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn has_processed_data(&self) -> Result<bool, DbError> {
        self.has_table(PROCESSED_TABLE)
    }

    /// Column names of a table in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn table_columns(&self, table: &str) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT column_name FROM information_schema.columns
             WHERE lower(table_name) = lower(?)
             ORDER BY ordinal_position",
        )?;
        let columns = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    /// Number of rows in a table.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn row_count(&self, table: &str) -> Result<u64, DbError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        #[allow(clippy::cast_sign_loss)]
        Ok(count as u64)
    }

    /// Runs `f` inside a transaction, committing on success and rolling back
    /// on failure.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or [`DbError`] if the transaction cannot
    /// be started or committed.
    pub fn in_transaction<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        match f(&self.conn) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    log::error!("Rollback failed: {rollback}");
                }
                Err(e)
            }
        }
    }
}

/// Number of bound parameters per multi-row INSERT statement.
const CHUNK_PARAMS: usize = 50_000;

/// Inserts rows with multi-row `INSERT ... VALUES` statements.
///
/// # Errors
///
/// Returns [`DbError::Relation`] if a row's width differs from `columns`,
/// or [`DbError::DuckDb`] if a statement fails.
pub fn insert_rows(
    conn: &Connection,
    table: &str,
    columns: &[String],
    rows: &[Vec<duckdb::types::Value>],
) -> Result<(), DbError> {
    if rows.is_empty() || columns.is_empty() {
        return Ok(());
    }

    let width = columns.len();
    let per_chunk = (CHUNK_PARAMS / width).max(1);
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = format!("({})", vec!["?"; width].join(", "));

    for chunk in rows.chunks(per_chunk) {
        let mut sql = format!("INSERT INTO {} ({column_list}) VALUES ", quote_ident(table));
        for i in 0..chunk.len() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&placeholders);
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut param_idx = 1usize;
        for row in chunk {
            if row.len() != width {
                return Err(RelationError::Arity {
                    expected: width,
                    found: row.len(),
                }
                .into());
            }
            for value in row {
                stmt.raw_bind_parameter(param_idx, value)?;
                param_idx += 1;
            }
        }
        stmt.raw_execute()?;
    }

    Ok(())
}

//! Staging, indexed join and accumulation of sources into `processed_data`.

use bdgd_map_database_models::columns::{self, GEOM_X, GEOM_Y, GEOMETRY};
use bdgd_map_database_models::{JoinKeys, JoinedRelation, Relation, SpatialBatch, Value, same_column};
use bdgd_map_geometry::representative_point;
use duckdb::Connection;
use duckdb::types::Value as SqlValue;
use geo::Geometry;

use crate::{DbError, PROCESSED_TABLE, Store, insert_rows, quote_ident};

const SPATIAL_STAGING: &str = "spatial_staging";
const CONSUMER_STAGING: &str = "consumer_staging";
const KEY_COLUMN: &str = "_join_key";
const ROW_COLUMN: &str = "_row";

/// Text form of an attribute value as stored in the store.
fn text_value(value: &Value) -> SqlValue {
    value.as_key().map_or(SqlValue::Null, SqlValue::Text)
}

fn numeric_value(value: &Value) -> SqlValue {
    value.as_f64().map_or(SqlValue::Null, SqlValue::Double)
}

fn geometry_json(geometry: &Geometry<f64>) -> Result<String, DbError> {
    let geometry = geojson::Geometry::new(geojson::Value::from(geometry));
    Ok(serde_json::to_string(&geometry)?)
}

/// Geometry, representative X and representative Y cells for a row.
fn geometry_cells(geometry: &Geometry<f64>) -> Result<[SqlValue; 3], DbError> {
    let point = representative_point(geometry);
    Ok([
        SqlValue::Text(geometry_json(geometry)?),
        point.map_or(SqlValue::Null, |p| SqlValue::Double(p.x())),
        point.map_or(SqlValue::Null, |p| SqlValue::Double(p.y())),
    ])
}

/// Attribute columns the store takes from a relation. Reserved names and
/// staging bookkeeping columns are dropped.
fn attribute_columns(relation: &Relation) -> Vec<String> {
    relation
        .columns()
        .iter()
        .filter(|c| {
            !columns::is_reserved(c) && !same_column(c, KEY_COLUMN) && !same_column(c, ROW_COLUMN)
        })
        .cloned()
        .collect()
}

fn column_definitions(columns: &[String], sql_type: impl Fn(&str) -> &'static str) -> String {
    columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(c), sql_type(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn text_type(_: &str) -> &'static str {
    "VARCHAR"
}

fn stage_spatial(
    conn: &Connection,
    batch: &SpatialBatch,
    key: &str,
    columns: &[String],
) -> Result<usize, DbError> {
    let key_idx = batch
        .attributes
        .column_index(key)
        .ok_or_else(|| DbError::MissingColumn {
            column: key.to_string(),
            relation: "spatial layer".to_string(),
        })?;
    let positions: Vec<usize> = columns
        .iter()
        .filter_map(|c| batch.attributes.column_index(c))
        .collect();

    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {SPATIAL_STAGING};
         CREATE TABLE {SPATIAL_STAGING} ({ROW_COLUMN} BIGINT, {KEY_COLUMN} VARCHAR, {}{}{GEOMETRY} VARCHAR, {GEOM_X} DOUBLE, {GEOM_Y} DOUBLE);",
        column_definitions(columns, text_type),
        if columns.is_empty() { "" } else { ", " },
    ))?;

    let mut rows = Vec::with_capacity(batch.len());
    for (i, (row, geometry)) in batch
        .attributes
        .rows()
        .iter()
        .zip(&batch.geometries)
        .enumerate()
    {
        let (Some(key), Some(geometry)) = (row[key_idx].as_key(), geometry) else {
            continue;
        };
        let mut out = Vec::with_capacity(positions.len() + 5);
        out.push(SqlValue::BigInt(i64::try_from(i).unwrap_or(i64::MAX)));
        out.push(SqlValue::Text(key));
        out.extend(positions.iter().map(|&p| text_value(&row[p])));
        out.extend(geometry_cells(geometry)?);
        rows.push(out);
    }

    let mut all_columns = vec![ROW_COLUMN.to_string(), KEY_COLUMN.to_string()];
    all_columns.extend(columns.iter().cloned());
    all_columns.extend([GEOMETRY, GEOM_X, GEOM_Y].map(String::from));
    insert_rows(conn, SPATIAL_STAGING, &all_columns, &rows)?;

    conn.execute_batch(&format!(
        "CREATE INDEX {SPATIAL_STAGING}_key_idx ON {SPATIAL_STAGING} ({KEY_COLUMN});"
    ))?;

    Ok(rows.len())
}

fn stage_consumers(
    conn: &Connection,
    consumers: &Relation,
    key: &str,
    columns: &[String],
) -> Result<usize, DbError> {
    let key_idx = consumers
        .column_index(key)
        .ok_or_else(|| DbError::MissingColumn {
            column: key.to_string(),
            relation: "consumer layers".to_string(),
        })?;
    let positions: Vec<usize> = columns
        .iter()
        .filter_map(|c| consumers.column_index(c))
        .collect();

    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {CONSUMER_STAGING};
         CREATE TABLE {CONSUMER_STAGING} ({ROW_COLUMN} BIGINT, {KEY_COLUMN} VARCHAR{}{});",
        if columns.is_empty() { "" } else { ", " },
        column_definitions(columns, text_type),
    ))?;

    let mut rows = Vec::with_capacity(consumers.len());
    for (i, row) in consumers.rows().iter().enumerate() {
        let Some(key) = row[key_idx].as_key() else {
            continue;
        };
        let mut out = Vec::with_capacity(positions.len() + 2);
        out.push(SqlValue::BigInt(i64::try_from(i).unwrap_or(i64::MAX)));
        out.push(SqlValue::Text(key));
        out.extend(positions.iter().map(|&p| text_value(&row[p])));
        rows.push(out);
    }

    let mut all_columns = vec![ROW_COLUMN.to_string(), KEY_COLUMN.to_string()];
    all_columns.extend(columns.iter().cloned());
    insert_rows(conn, CONSUMER_STAGING, &all_columns, &rows)?;

    conn.execute_batch(&format!(
        "CREATE INDEX {CONSUMER_STAGING}_key_idx ON {CONSUMER_STAGING} ({KEY_COLUMN});"
    ))?;

    Ok(rows.len())
}

/// Adds any of `columns` that `processed_data` lacks, as text.
fn widen_processed(store: &Store, conn: &Connection, columns: &[String]) -> Result<(), DbError> {
    let existing = store.table_columns(PROCESSED_TABLE)?;
    for column in columns {
        if !existing.iter().any(|e| same_column(e, column)) {
            log::debug!("Adding column {column} to {PROCESSED_TABLE}");
            conn.execute_batch(&format!(
                "ALTER TABLE {PROCESSED_TABLE} ADD COLUMN {} VARCHAR;",
                quote_ident(column)
            ))?;
        }
    }
    Ok(())
}

impl Store {
    /// Joins one source's spatial batch with its consumer layers and appends
    /// the result to `processed_data`, creating it on first use.
    ///
    /// Everything happens in one transaction: a failure leaves rows from
    /// earlier sources untouched. Returns the number of joined rows added.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::MissingColumn`] if a key column is absent, or
    /// another [`DbError`] if staging or the join query fails.
    pub fn merge_source(
        &self,
        spatial: &SpatialBatch,
        consumers: &[Relation],
        keys: &JoinKeys,
    ) -> Result<u64, DbError> {
        let consumers = Relation::concat(consumers.iter().cloned());
        let spatial_columns = attribute_columns(&spatial.attributes);
        let consumer_columns: Vec<String> = attribute_columns(&consumers)
            .into_iter()
            .filter(|c| !spatial_columns.iter().any(|s| same_column(s, c)))
            .collect();

        let mut output_columns = spatial_columns.clone();
        output_columns.extend(consumer_columns.iter().cloned());

        let select_list = spatial_columns
            .iter()
            .map(|c| format!("s.{}", quote_ident(c)))
            .chain(consumer_columns.iter().map(|c| format!("c.{}", quote_ident(c))))
            .chain([GEOMETRY, GEOM_X, GEOM_Y].map(|c| format!("s.{c}")))
            .collect::<Vec<_>>()
            .join(", ");
        let join_query = format!(
            "SELECT {select_list}
             FROM {SPATIAL_STAGING} s
             JOIN {CONSUMER_STAGING} c ON s.{KEY_COLUMN} = c.{KEY_COLUMN}
             ORDER BY s.{ROW_COLUMN}, c.{ROW_COLUMN}"
        );

        self.in_transaction(|conn| {
            let staged_spatial = stage_spatial(conn, spatial, &keys.spatial, &spatial_columns)?;
            let staged_consumers =
                stage_consumers(conn, &consumers, &keys.consumer, &consumer_columns)?;
            log::debug!("Staged {staged_spatial} spatial rows and {staged_consumers} consumer rows");

            let added = if self.has_processed_data()? {
                let before = self.row_count(PROCESSED_TABLE)?;
                widen_processed(self, conn, &output_columns)?;
                conn.execute_batch(&format!(
                    "INSERT INTO {PROCESSED_TABLE} BY NAME {join_query};"
                ))?;
                self.row_count(PROCESSED_TABLE)? - before
            } else {
                conn.execute_batch(&format!(
                    "CREATE TABLE {PROCESSED_TABLE} AS {join_query};"
                ))?;
                self.row_count(PROCESSED_TABLE)?
            };

            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {SPATIAL_STAGING};
                 DROP TABLE IF EXISTS {CONSUMER_STAGING};"
            ))?;

            Ok(added)
        })
    }

    /// Replaces `processed_data` with an already joined relation.
    ///
    /// Derived analytics columns are stored as `DOUBLE`, everything else as
    /// text. Returns the number of rows written.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the table cannot be written.
    pub fn load_joined(&self, joined: &JoinedRelation) -> Result<u64, DbError> {
        let columns = attribute_columns(&joined.attributes);
        let positions: Vec<usize> = columns
            .iter()
            .filter_map(|c| joined.attributes.column_index(c))
            .collect();
        let derived: Vec<bool> = columns.iter().map(|c| columns::is_derived(c)).collect();

        let mut rows = Vec::with_capacity(joined.len());
        for (row, geometry) in joined.attributes.rows().iter().zip(&joined.geometries) {
            let mut out = Vec::with_capacity(positions.len() + 3);
            out.extend(positions.iter().zip(&derived).map(|(&p, &numeric)| {
                if numeric {
                    numeric_value(&row[p])
                } else {
                    text_value(&row[p])
                }
            }));
            out.extend(geometry_cells(geometry)?);
            rows.push(out);
        }

        let definitions = column_definitions(&columns, |c| {
            if columns::is_derived(c) {
                "DOUBLE"
            } else {
                "VARCHAR"
            }
        });
        let mut all_columns = columns.clone();
        all_columns.extend([GEOMETRY, GEOM_X, GEOM_Y].map(String::from));

        self.in_transaction(|conn| {
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {PROCESSED_TABLE};
                 CREATE TABLE {PROCESSED_TABLE} ({definitions}{}{GEOMETRY} VARCHAR, {GEOM_X} DOUBLE, {GEOM_Y} DOUBLE);",
                if columns.is_empty() { "" } else { ", " },
            ))?;
            insert_rows(conn, PROCESSED_TABLE, &all_columns, &rows)?;
            Ok(rows.len() as u64)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bdgd_map_database_models::Crs;
    use geo::Point;

    pub fn keys() -> JoinKeys {
        JoinKeys {
            spatial: "COD_ID".to_string(),
            consumer: "PN_CON".to_string(),
        }
    }

    pub fn spatial(keys: &[&str], start_x: f64) -> SpatialBatch {
        let mut attributes = Relation::new(["COD_ID", "TIP"]);
        let mut geometries = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            attributes
                .push_row(vec![Value::from(*key), Value::from(format!("t{i}"))])
                .unwrap();
            #[allow(clippy::cast_precision_loss)]
            geometries.push(Some(Geometry::Point(Point::new(start_x + i as f64, 0.5))));
        }
        SpatialBatch::new(Crs::wgs84(), attributes, geometries).unwrap()
    }

    pub fn consumers(columns: &[&str], rows: Vec<Vec<Value>>) -> Relation {
        let mut rel = Relation::new(columns.iter().copied());
        for row in rows {
            rel.push_row(row).unwrap();
        }
        rel
    }

    fn column_values(store: &Store, column: &str) -> Vec<Option<String>> {
        let mut stmt = store
            .connection()
            .prepare(&format!(
                "SELECT CAST({} AS VARCHAR) FROM {PROCESSED_TABLE} ORDER BY rowid",
                quote_ident(column)
            ))
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn join_fans_out_on_duplicate_consumer_keys() {
        let store = Store::open_in_memory().unwrap();
        let consumer = consumers(
            &["PN_CON", "ENE_01"],
            vec![
                vec!["A".into(), 1.into()],
                vec!["A".into(), 2.into()],
                vec!["B".into(), 3.into()],
                vec!["D".into(), 4.into()],
            ],
        );

        let added = store
            .merge_source(&spatial(&["A", "B", "C"], 0.0), &[consumer], &keys())
            .unwrap();

        assert_eq!(added, 3);
        assert_eq!(
            column_values(&store, "COD_ID"),
            vec![Some("A".into()), Some("A".into()), Some("B".into())]
        );
        assert_eq!(
            column_values(&store, "ENE_01"),
            vec![Some("1".into()), Some("2".into()), Some("3".into())]
        );
        assert!(!store.has_table("spatial_staging").unwrap());
        assert!(!store.has_table("consumer_staging").unwrap());
    }

    #[test]
    fn integer_and_text_keys_match() {
        let store = Store::open_in_memory().unwrap();
        let mut attributes = Relation::new(["COD_ID"]);
        attributes.push_row(vec![Value::Int(123)]).unwrap();
        attributes.push_row(vec![Value::Float(7.0)]).unwrap();
        let batch = SpatialBatch::new(
            Crs::wgs84(),
            attributes,
            vec![
                Some(Geometry::Point(Point::new(0.0, 0.0))),
                Some(Geometry::Point(Point::new(1.0, 1.0))),
            ],
        )
        .unwrap();
        let consumer = consumers(
            &["PN_CON"],
            vec![vec!["123".into()], vec!["7".into()], vec![Value::Null]],
        );

        let added = store.merge_source(&batch, &[consumer], &keys()).unwrap();

        assert_eq!(added, 1);
        assert_eq!(column_values(&store, "PN_CON"), vec![Some("123".into())]);
    }

    #[test]
    fn duplicate_columns_keep_spatial_side() {
        let store = Store::open_in_memory().unwrap();
        let consumer = consumers(
            &["PN_CON", "tip", "geom_x"],
            vec![vec!["A".into(), "consumer".into(), 99.into()]],
        );

        store
            .merge_source(&spatial(&["A"], 5.0), &[consumer], &keys())
            .unwrap();

        let columns = store.table_columns(PROCESSED_TABLE).unwrap();
        assert_eq!(
            columns,
            vec!["COD_ID", "TIP", "PN_CON", "geometry", "geom_x", "geom_y"]
        );
        assert_eq!(column_values(&store, "TIP"), vec![Some("t0".into())]);
        assert_eq!(column_values(&store, "geom_x"), vec![Some("5.0".into())]);
    }

    #[test]
    fn sources_accumulate_with_widening_schema() {
        let store = Store::open_in_memory().unwrap();
        let first = consumers(&["PN_CON", "ENE_01"], vec![vec!["A".into(), 1.into()]]);
        let second = consumers(
            &["PN_CON", "CAR_INST"],
            vec![vec!["X".into(), 10.into()], vec!["Y".into(), 20.into()]],
        );

        store
            .merge_source(&spatial(&["A"], 0.0), &[first], &keys())
            .unwrap();
        let added = store
            .merge_source(&spatial(&["X", "Y"], 10.0), &[second], &keys())
            .unwrap();

        assert_eq!(added, 2);
        assert_eq!(store.row_count(PROCESSED_TABLE).unwrap(), 3);
        assert_eq!(
            column_values(&store, "ENE_01"),
            vec![Some("1".into()), None, None]
        );
        assert_eq!(
            column_values(&store, "CAR_INST"),
            vec![None, Some("10".into()), Some("20".into())]
        );
    }

    #[test]
    fn failing_source_leaves_earlier_rows_intact() {
        let store = Store::open_in_memory().unwrap();
        let consumer = consumers(&["PN_CON"], vec![vec!["A".into()]]);
        store
            .merge_source(&spatial(&["A"], 0.0), &[consumer.clone()], &keys())
            .unwrap();

        // A view with the staging name makes the staging DROP TABLE fail
        // after the spatial staging table was already created.
        store
            .connection()
            .execute_batch("CREATE VIEW consumer_staging AS SELECT 1 AS x")
            .unwrap();
        let result = store.merge_source(&spatial(&["A"], 0.0), &[consumer], &keys());

        assert!(result.is_err());
        assert_eq!(store.row_count(PROCESSED_TABLE).unwrap(), 1);
        assert!(!store.has_table("spatial_staging").unwrap());
    }

    #[test]
    fn missing_key_column_is_reported() {
        let store = Store::open_in_memory().unwrap();
        let consumer = consumers(&["OTHER"], vec![vec!["A".into()]]);
        let result = store.merge_source(&spatial(&["A"], 0.0), &[consumer], &keys());
        assert!(matches!(result, Err(DbError::MissingColumn { .. })));
        assert!(!store.has_processed_data().unwrap());
    }

    #[test]
    fn repeated_runs_produce_identical_tables() {
        let build = || {
            let store = Store::open_in_memory().unwrap();
            let consumer = consumers(
                &["PN_CON", "ENE_01"],
                vec![
                    vec!["B".into(), 3.into()],
                    vec!["A".into(), 1.into()],
                    vec!["A".into(), 2.into()],
                ],
            );
            store
                .merge_source(&spatial(&["A", "B"], 0.0), &[consumer], &keys())
                .unwrap();
            (
                column_values(&store, "COD_ID"),
                column_values(&store, "ENE_01"),
            )
        };

        assert_eq!(build(), build());
    }

    #[test]
    fn load_joined_stores_derived_columns_as_numbers() {
        let store = Store::open_in_memory().unwrap();
        let mut joined = JoinedRelation::empty(Crs::wgs84());
        joined.attributes = Relation::new(["COD_ID", "ENE_TOT"]);
        joined
            .push(
                vec!["A".into(), Value::Float(12.5)],
                Geometry::Point(Point::new(1.0, 2.0)),
            )
            .unwrap();

        assert_eq!(store.load_joined(&joined).unwrap(), 1);

        let total: f64 = store
            .connection()
            .query_row("SELECT ENE_TOT FROM processed_data", [], |row| row.get(0))
            .unwrap();
        assert!((total - 12.5).abs() < f64::EPSILON);
        assert_eq!(column_values(&store, "geom_y"), vec![Some("2.0".into())]);
    }
}

//! In-store computation of the energy aggregates.

use bdgd_map_database::{PROCESSED_TABLE, Store, quote_ident};
use bdgd_map_database_models::columns::{CAR_INST, DEM, DERIVED, ENE_MED, ENE_MONTHS, ENE_TOT};
use bdgd_map_database_models::same_column;

use crate::AnalyticsError;

/// SQL expression reading a text or numeric column as a finite double,
/// zero otherwise.
fn numeric_or_zero(column: &str) -> String {
    let cast = format!("TRY_CAST({} AS DOUBLE)", quote_ident(column));
    format!("COALESCE(CASE WHEN isfinite({cast}) THEN {cast} END, 0)")
}

/// Adds or overwrites `ENE_TOT`, `ENE_MED` and `DEM` on `processed_data`.
///
/// Runs in one transaction. Spatial indexes are dropped first because the
/// table schema changes; [`Store::finalize`] rebuilds them. Returns the
/// number of rows updated, or `None` if there is no `processed_data`.
///
/// # Errors
///
/// Returns [`AnalyticsError`] if any statement fails.
pub fn enrich_store(store: &Store) -> Result<Option<u64>, AnalyticsError> {
    if !store.has_processed_data()? {
        log::warn!("No {PROCESSED_TABLE} table, skipping analytics");
        return Ok(None);
    }

    store.drop_spatial_indexes()?;

    let rows = store.in_transaction(|conn| {
        let existing = store.table_columns(PROCESSED_TABLE)?;
        let has = |name: &str| existing.iter().any(|c| same_column(c, name));

        let mut ddl = String::new();
        for month in ENE_MONTHS {
            if !has(month) {
                ddl.push_str(&format!(
                    "ALTER TABLE {PROCESSED_TABLE} ADD COLUMN {} VARCHAR DEFAULT '0';\n",
                    quote_ident(month)
                ));
            }
        }
        if !has(CAR_INST) {
            ddl.push_str(&format!(
                "ALTER TABLE {PROCESSED_TABLE} ADD COLUMN {} VARCHAR;\n",
                quote_ident(CAR_INST)
            ));
        }
        for derived in DERIVED {
            if has(derived) {
                ddl.push_str(&format!(
                    "ALTER TABLE {PROCESSED_TABLE} DROP COLUMN {};\n",
                    quote_ident(derived)
                ));
            }
            ddl.push_str(&format!(
                "ALTER TABLE {PROCESSED_TABLE} ADD COLUMN {} DOUBLE;\n",
                quote_ident(derived)
            ));
        }
        conn.execute_batch(&ddl)?;

        let total = ENE_MONTHS
            .iter()
            .map(|month| numeric_or_zero(month))
            .collect::<Vec<_>>()
            .join(" + ");
        let updated = conn.execute(
            &format!(
                "UPDATE {PROCESSED_TABLE} SET {ENE_TOT} = {total}, {DEM} = {}",
                numeric_or_zero(CAR_INST)
            ),
            [],
        )?;
        conn.execute_batch(&format!(
            "UPDATE {PROCESSED_TABLE} SET {ENE_MED} = {ENE_TOT} / 12.0;"
        ))?;

        Ok(updated as u64)
    })?;

    log::info!("Computed energy aggregates for {rows} records in {PROCESSED_TABLE}");
    Ok(Some(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdgd_map_database_models::{Crs, JoinedRelation, Relation, Value};
    use geo::{Geometry, Point};

    fn store_with(columns: &[&str], rows: Vec<Vec<Value>>) -> Store {
        let store = Store::open_in_memory().unwrap();
        let mut joined = JoinedRelation::empty(Crs::wgs84());
        joined.attributes = Relation::new(columns.iter().copied());
        for row in rows {
            joined
                .push(row, Geometry::Point(Point::new(0.0, 0.0)))
                .unwrap();
        }
        store.load_joined(&joined).unwrap();
        store
    }

    fn derived(store: &Store) -> Vec<(f64, f64, f64)> {
        let mut stmt = store
            .connection()
            .prepare("SELECT ENE_TOT, ENE_MED, DEM FROM processed_data ORDER BY rowid")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn missing_table_is_skipped() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(enrich_store(&store).unwrap(), None);
    }

    #[test]
    fn matches_in_memory_computation() {
        let columns = ["COD_ID", "ENE_01", "ENE_02", "ENE_12", "CAR_INST"];
        let rows = vec![
            vec!["A".into(), 10.into(), "2.5".into(), Value::Null, "3".into()],
            vec!["B".into(), "x".into(), Value::Null, 12.into(), Value::Null],
            vec![
                "C".into(),
                Value::Null,
                Value::Null,
                Value::Null,
                Value::Null,
            ],
        ];

        let store = store_with(&columns, rows.clone());
        assert_eq!(enrich_store(&store).unwrap(), Some(3));

        let mut rel = Relation::new(columns);
        for row in rows {
            rel.push_row(row).unwrap();
        }
        crate::enrich(&mut rel);

        let from_store = derived(&store);
        for (i, (tot, med, dem)) in from_store.into_iter().enumerate() {
            assert!((tot - rel.numeric_or_zero(i, ENE_TOT)).abs() < 1e-9);
            assert!((med - rel.numeric_or_zero(i, ENE_MED)).abs() < 1e-9);
            assert!((dem - rel.numeric_or_zero(i, DEM)).abs() < 1e-9);
        }
        assert_eq!(
            derived(&store),
            vec![(12.5, 12.5 / 12.0, 3.0), (12.0, 1.0, 0.0), (0.0, 0.0, 0.0)]
        );
    }

    #[test]
    fn creates_missing_columns_and_overwrites_derived() {
        let store = store_with(
            &["COD_ID", "ENE_TOT"],
            vec![vec!["A".into(), Value::Float(999.0)]],
        );

        enrich_store(&store).unwrap();

        let columns = store.table_columns(PROCESSED_TABLE).unwrap();
        for month in ENE_MONTHS {
            assert!(columns.iter().any(|c| c == month), "{month} missing");
        }
        assert!(columns.iter().any(|c| c == CAR_INST));
        assert_eq!(derived(&store), vec![(0.0, 0.0, 0.0)]);
    }

    #[test]
    fn can_run_after_finalize() {
        let store = store_with(&["ENE_01"], vec![vec![Value::Int(6)]]);
        store.finalize(&Crs::wgs84()).unwrap();

        enrich_store(&store).unwrap();

        assert_eq!(derived(&store), vec![(6.0, 0.5, 0.0)]);
        assert!(!store.spatial_index_ready().unwrap());
    }
}

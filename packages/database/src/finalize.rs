//! Post-merge coordinates and spatial indexes.

use bdgd_map_database_models::columns::{GEOM_X, GEOM_Y, LATITUDE, LONGITUDE};
use bdgd_map_database_models::{Crs, same_column};
use bdgd_map_geometry::Reprojector;
use duckdb::types::Value as SqlValue;

use crate::{DbError, META_SPATIAL_INDEX_READY, PROCESSED_TABLE, Store, insert_rows};

const COORD_LOOKUP: &str = "coord_lookup";
const XY_INDEX: &str = "processed_data_xy_idx";
const LONLAT_INDEX: &str = "processed_data_lonlat_idx";

impl Store {
    /// Drops the spatial indexes on `processed_data` and clears the ready
    /// flag. Schema changes to the table need this first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statements fail.
    pub fn drop_spatial_indexes(&self) -> Result<(), DbError> {
        self.conn.execute_batch(&format!(
            "DROP INDEX IF EXISTS {XY_INDEX};
             DROP INDEX IF EXISTS {LONLAT_INDEX};"
        ))?;
        self.set_meta(META_SPATIAL_INDEX_READY, "false")
    }

    /// Derives `longitude`/`latitude` from `geom_x`/`geom_y`, reprojecting
    /// from `base` to `EPSG:4326` when needed, then indexes both coordinate
    /// pairs and marks the store ready for grid aggregation.
    ///
    /// Returns the number of rows with coordinates, or `None` if there is no
    /// `processed_data` table.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the transformation cannot be created or any
    /// statement fails.
    pub fn finalize(&self, base: &Crs) -> Result<Option<u64>, DbError> {
        if !self.has_processed_data()? {
            log::warn!("No {PROCESSED_TABLE} table to finalize");
            return Ok(None);
        }

        self.drop_spatial_indexes()?;
        let reprojector = Reprojector::new(base, &Crs::wgs84())?;

        let located = self.in_transaction(|conn| {
            let existing = self.table_columns(PROCESSED_TABLE)?;
            for column in [LONGITUDE, LATITUDE] {
                if !existing.iter().any(|e| same_column(e, column)) {
                    conn.execute_batch(&format!(
                        "ALTER TABLE {PROCESSED_TABLE} ADD COLUMN {column} DOUBLE;"
                    ))?;
                }
            }

            if reprojector.is_identity() {
                conn.execute_batch(&format!(
                    "UPDATE {PROCESSED_TABLE} SET {LONGITUDE} = {GEOM_X}, {LATITUDE} = {GEOM_Y};"
                ))?;
            } else {
                let mut stmt = conn.prepare(&format!(
                    "SELECT DISTINCT {GEOM_X}, {GEOM_Y} FROM {PROCESSED_TABLE}
                     WHERE {GEOM_X} IS NOT NULL AND {GEOM_Y} IS NOT NULL"
                ))?;
                let coords = stmt
                    .query_map([], |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut failed = 0usize;
                let mut rows = Vec::with_capacity(coords.len());
                for (x, y) in coords {
                    let Ok((lon, lat)) = reprojector.transform_xy(x, y) else {
                        failed += 1;
                        continue;
                    };
                    rows.push(vec![
                        SqlValue::Double(x),
                        SqlValue::Double(y),
                        SqlValue::Double(lon),
                        SqlValue::Double(lat),
                    ]);
                }
                if failed > 0 {
                    log::warn!("{failed} coordinates could not be reprojected to EPSG:4326");
                }
                log::info!(
                    "Reprojected {} distinct coordinates from {base} to EPSG:4326",
                    rows.len()
                );

                conn.execute_batch(&format!(
                    "DROP TABLE IF EXISTS {COORD_LOOKUP};
                     CREATE TEMP TABLE {COORD_LOOKUP} ({GEOM_X} DOUBLE, {GEOM_Y} DOUBLE, {LONGITUDE} DOUBLE, {LATITUDE} DOUBLE);"
                ))?;
                insert_rows(
                    conn,
                    COORD_LOOKUP,
                    &[GEOM_X, GEOM_Y, LONGITUDE, LATITUDE].map(String::from),
                    &rows,
                )?;
                conn.execute_batch(&format!(
                    "UPDATE {PROCESSED_TABLE}
                     SET {LONGITUDE} = l.{LONGITUDE}, {LATITUDE} = l.{LATITUDE}
                     FROM {COORD_LOOKUP} l
                     WHERE {PROCESSED_TABLE}.{GEOM_X} = l.{GEOM_X}
                       AND {PROCESSED_TABLE}.{GEOM_Y} = l.{GEOM_Y};
                     DROP TABLE {COORD_LOOKUP};"
                ))?;
            }

            conn.execute_batch(&format!(
                "CREATE INDEX {XY_INDEX} ON {PROCESSED_TABLE} ({GEOM_X}, {GEOM_Y});
                 CREATE INDEX {LONLAT_INDEX} ON {PROCESSED_TABLE} ({LONGITUDE}, {LATITUDE});"
            ))?;

            let located: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {PROCESSED_TABLE}
                     WHERE {LONGITUDE} IS NOT NULL AND {LATITUDE} IS NOT NULL"
                ),
                [],
                |row| row.get(0),
            )?;
            #[allow(clippy::cast_sign_loss)]
            Ok(located as u64)
        })?;

        self.set_base_crs(base)?;
        self.set_meta(META_SPATIAL_INDEX_READY, "true")?;
        log::info!("Spatial index ready: {located} located rows in {PROCESSED_TABLE}");

        Ok(Some(located))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::tests::{consumers, keys, spatial};

    fn coordinates(store: &Store) -> Vec<(f64, f64)> {
        let mut stmt = store
            .connection()
            .prepare(
                "SELECT longitude, latitude FROM processed_data
                 WHERE longitude IS NOT NULL ORDER BY rowid",
            )
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn missing_table_is_not_finalized() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.finalize(&Crs::wgs84()).unwrap(), None);
        assert!(!store.spatial_index_ready().unwrap());
    }

    #[test]
    fn geographic_base_copies_coordinates() {
        let store = Store::open_in_memory().unwrap();
        let consumer = consumers(&["PN_CON"], vec![vec!["A".into()], vec!["B".into()]]);
        store
            .merge_source(&spatial(&["A", "B"], -46.0), &[consumer], &keys())
            .unwrap();

        assert_eq!(store.finalize(&Crs::wgs84()).unwrap(), Some(2));

        assert_eq!(coordinates(&store), vec![(-46.0, 0.5), (-45.0, 0.5)]);
        assert!(store.spatial_index_ready().unwrap());
        assert_eq!(store.base_crs().unwrap(), Some(Crs::wgs84()));
    }

    #[test]
    fn projected_base_is_reprojected_to_wgs84() {
        let store = Store::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE processed_data (geom_x DOUBLE, geom_y DOUBLE);
                 INSERT INTO processed_data VALUES (333000.0, 7394000.0), (333000.0, 7394000.0), (NULL, NULL);",
            )
            .unwrap();
        let utm: Crs = "EPSG:31983".parse().unwrap();

        assert_eq!(store.finalize(&utm).unwrap(), Some(2));

        let coords = coordinates(&store);
        assert_eq!(coords.len(), 2);
        for (lon, lat) in &coords {
            assert!(*lon > -48.0 && *lon < -45.0, "lon {lon}");
            assert!(*lat > -25.0 && *lat < -22.0, "lat {lat}");
        }
        assert!(!store.has_table("coord_lookup").unwrap());
    }

    #[test]
    fn finalize_can_run_twice() {
        let store = Store::open_in_memory().unwrap();
        let consumer = consumers(&["PN_CON"], vec![vec!["A".into()]]);
        store
            .merge_source(&spatial(&["A"], 1.0), &[consumer], &keys())
            .unwrap();

        store.finalize(&Crs::wgs84()).unwrap();
        assert_eq!(store.finalize(&Crs::wgs84()).unwrap(), Some(1));
    }
}

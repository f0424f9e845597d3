//! In-memory hash join of one source's spatial and consumer records.

use std::collections::HashMap;

use bdgd_map_database_models::{
    JoinKeys, JoinedRelation, Relation, SpatialBatch, columns, same_column,
};

use crate::IngestError;

/// Positions of the attribute columns the join output keeps.
fn kept_columns<'a>(relation: &'a Relation, exclude: &[&String]) -> Vec<(usize, &'a String)> {
    relation
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| !columns::is_reserved(c) && !exclude.iter().any(|e| same_column(e, c)))
        .collect()
}

/// Inner-joins a validated spatial batch with a source's consumer layers.
///
/// Consumer layers are concatenated with a union schema and indexed by
/// their normalised key. Output rows follow spatial row order, then
/// consumer order, so one spatial record fans out to every matching
/// consumer. Rows whose key is null never match. When both sides carry a
/// column of the same name, the spatial value is kept.
///
/// # Errors
///
/// Returns [`IngestError::MissingKey`] if either key column is absent.
pub fn join_in_memory(
    spatial: &SpatialBatch,
    consumers: &[Relation],
    keys: &JoinKeys,
) -> Result<JoinedRelation, IngestError> {
    let consumers = Relation::concat(consumers.iter().cloned());

    let spatial_key = spatial
        .attributes
        .column_index(&keys.spatial)
        .ok_or_else(|| IngestError::MissingKey {
            column: keys.spatial.clone(),
            relation: "spatial layer".to_string(),
        })?;
    let consumer_key = consumers
        .column_index(&keys.consumer)
        .ok_or_else(|| IngestError::MissingKey {
            column: keys.consumer.clone(),
            relation: "consumer layers".to_string(),
        })?;

    let spatial_columns = kept_columns(&spatial.attributes, &[]);
    let spatial_names: Vec<&String> = spatial_columns.iter().map(|(_, c)| *c).collect();
    let consumer_columns = kept_columns(&consumers, &spatial_names);

    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, row) in consumers.rows().iter().enumerate() {
        if let Some(key) = row[consumer_key].as_key() {
            index.entry(key).or_default().push(i);
        }
    }

    let names = spatial_columns
        .iter()
        .chain(&consumer_columns)
        .map(|(_, c)| (*c).clone());
    let mut joined = JoinedRelation {
        crs: spatial.crs.clone(),
        attributes: Relation::new(names),
        geometries: Vec::new(),
    };

    for (row, geometry) in spatial.attributes.rows().iter().zip(&spatial.geometries) {
        let (Some(key), Some(geometry)) = (row[spatial_key].as_key(), geometry) else {
            continue;
        };
        let Some(matches) = index.get(&key) else {
            continue;
        };
        for &c in matches {
            let consumer = &consumers.rows()[c];
            let out = spatial_columns
                .iter()
                .map(|(p, _)| row[*p].clone())
                .chain(consumer_columns.iter().map(|(p, _)| consumer[*p].clone()))
                .collect();
            joined.push(out, geometry.clone())?;
        }
    }

    log::debug!(
        "Joined {} spatial and {} consumer records into {} rows",
        spatial.len(),
        consumers.len(),
        joined.len()
    );
    Ok(joined)
}

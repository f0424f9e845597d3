//! `GeoJSON` hand-off for the map renderer.

use std::path::Path;

use geojson::{Feature, FeatureCollection, JsonObject, JsonValue};

use crate::palette::fill_color;
use crate::{GridError, GridOutput};

/// Builds the feature collection for a grid result.
///
/// Every cell becomes a polygon feature with `cell_x`, `cell_y`, the value
/// under [`GridOutput::value_name`], `point_count` and a `fill` colour. The
/// collection carries `value_min`, `value_max` and `caption` for the legend.
#[must_use]
pub fn to_feature_collection(output: &GridOutput) -> FeatureCollection {
    let features = output
        .cells
        .iter()
        .map(|cell| {
            let mut properties = JsonObject::new();
            properties.insert("cell_x".to_string(), JsonValue::from(cell.index.ix));
            properties.insert("cell_y".to_string(), JsonValue::from(cell.index.iy));
            properties.insert(output.value_name.clone(), JsonValue::from(cell.value));
            properties.insert("point_count".to_string(), JsonValue::from(cell.point_count));
            properties.insert(
                "fill".to_string(),
                JsonValue::from(fill_color(cell.value, output.range)),
            );

            Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&cell.polygon))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    let mut members = JsonObject::new();
    members.insert(
        "value_min".to_string(),
        output.range.map_or(JsonValue::Null, |r| JsonValue::from(r.min)),
    );
    members.insert(
        "value_max".to_string(),
        output.range.map_or(JsonValue::Null, |r| JsonValue::from(r.max)),
    );
    members.insert("caption".to_string(), JsonValue::from(output.caption.clone()));

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(members),
    }
}

/// Writes a grid result to `path` as `GeoJSON`.
///
/// Uses an atomic write pattern (write to `.tmp`, then rename) so a reader
/// never sees a partial file.
///
/// # Errors
///
/// Returns [`GridError`] if the collection cannot be serialised or the file
/// cannot be written.
pub fn write_geojson(path: &Path, output: &GridOutput) -> Result<(), GridError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);

    let contents = serde_json::to_string(&to_feature_collection(output))?;
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;

    log::info!(
        "Wrote {} grid cells to {}",
        output.cells.len(),
        path.display()
    );
    Ok(())
}

/// Removes a grid file left at `path` by an earlier run, along with any
/// leftover `.tmp` sibling. Returns whether a grid file was removed.
///
/// # Errors
///
/// Returns [`GridError::Io`] if an existing file cannot be removed.
pub fn remove_stale_output(path: &Path) -> Result<bool, GridError> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);
    if tmp_path.is_file() {
        std::fs::remove_file(&tmp_path)?;
    }

    if !path.is_file() {
        return Ok(false);
    }
    std::fs::remove_file(path)?;
    log::warn!("Removed stale grid output {}", path.display());
    Ok(true)
}

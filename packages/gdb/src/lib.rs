#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Reading BDGD file geodatabases.
//!
//! A BDGD release is an Esri file geodatabase (`*.gdb` directory) holding
//! one spatial layer with the reference points (e.g. `PONNOT`) and several
//! consumer tables (`UCAT_tab`, `UCMT_tab`, `UCBT_tab`). [`SourceReader`] is
//! the seam the ingestion loop reads through; [`GdalReader`] implements it
//! with GDAL's `OpenFileGDB` driver.

pub mod discover;

use std::path::{Path, PathBuf};

use bdgd_map_database_models::{Crs, CrsParseError, Relation, RelationError, SpatialBatch, Value};
use gdal::Dataset;
use gdal::spatial_ref::SpatialRef;
use gdal::vector::{FieldValue, Layer, LayerAccess};

/// Errors from opening or reading a geodatabase.
#[derive(Debug, thiserror::Error)]
pub enum GdbError {
    /// GDAL failed to open or read the dataset.
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    /// Filesystem error while discovering sources.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A requested layer does not exist in the geodatabase.
    #[error("Layer {layer} not found in {}", path.display())]
    MissingLayer {
        /// Geodatabase path.
        path: PathBuf,
        /// Requested layer name.
        layer: String,
    },

    /// None of the consumer layers exist in the geodatabase.
    #[error("No consumer layers ({layers}) found in {}", path.display())]
    NoConsumerLayers {
        /// Geodatabase path.
        path: PathBuf,
        /// Requested layer names, comma separated.
        layers: String,
    },

    /// The spatial layer has no coordinate reference system.
    #[error("Layer {layer} in {} has no spatial reference", path.display())]
    MissingCrs {
        /// Geodatabase path.
        path: PathBuf,
        /// Layer name.
        layer: String,
    },

    /// The CRS definition has no authority code.
    #[error("CRS {definition:?} has no authority identifier")]
    UnidentifiedCrs {
        /// The definition that could not be identified.
        definition: String,
    },

    /// Authority string could not be parsed.
    #[error(transparent)]
    CrsParse(#[from] CrsParseError),

    /// Row did not fit the layer schema.
    #[error(transparent)]
    Relation(#[from] RelationError),
}

/// Reads spatial and consumer layers from one geodatabase.
pub trait SourceReader {
    /// Reads the spatial layer: attributes, geometries and CRS.
    ///
    /// # Errors
    ///
    /// Returns [`GdbError`] if the source cannot be opened, the layer is
    /// missing, or it has no resolvable CRS.
    fn read_spatial(&self, path: &Path, layer: &str) -> Result<SpatialBatch, GdbError>;

    /// Reads every consumer layer that exists in the source. Layers that
    /// are absent are skipped; geometry columns are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`GdbError::NoConsumerLayers`] if none of `layers` exist, or
    /// another [`GdbError`] if a present layer cannot be read.
    fn read_consumers(&self, path: &Path, layers: &[String]) -> Result<Vec<Relation>, GdbError>;

    /// Lists layer names in the source.
    ///
    /// # Errors
    ///
    /// Returns [`GdbError`] if the source cannot be opened.
    fn list_layers(&self, path: &Path) -> Result<Vec<String>, GdbError>;
}

/// [`SourceReader`] backed by GDAL.
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalReader;

impl GdalReader {
    fn find_layer<'a>(dataset: &'a Dataset, name: &str) -> Result<Option<Layer<'a>>, GdbError> {
        let actual = dataset
            .layers()
            .map(|layer| layer.name())
            .find(|actual| actual.eq_ignore_ascii_case(name));
        match actual {
            Some(actual) => Ok(Some(dataset.layer_by_name(&actual)?)),
            None => Ok(None),
        }
    }
}

impl SourceReader for GdalReader {
    fn read_spatial(&self, path: &Path, layer_name: &str) -> Result<SpatialBatch, GdbError> {
        let dataset = Dataset::open(path)?;
        let mut layer =
            Self::find_layer(&dataset, layer_name)?.ok_or_else(|| GdbError::MissingLayer {
                path: path.to_path_buf(),
                layer: layer_name.to_string(),
            })?;

        let srs = layer.spatial_ref().ok_or_else(|| GdbError::MissingCrs {
            path: path.to_path_buf(),
            layer: layer_name.to_string(),
        })?;
        let crs = crs_from_spatial_ref(srs)?;

        let (attributes, geometries) = read_layer(&mut layer, true)?;
        log::debug!(
            "Read {} features from {}:{layer_name} ({crs})",
            attributes.len(),
            path.display()
        );

        Ok(SpatialBatch::new(crs, attributes, geometries)?)
    }

    fn read_consumers(&self, path: &Path, layers: &[String]) -> Result<Vec<Relation>, GdbError> {
        let dataset = Dataset::open(path)?;
        let mut relations = Vec::new();

        for name in layers {
            let Some(mut layer) = Self::find_layer(&dataset, name)? else {
                log::debug!("Consumer layer {name} not present in {}", path.display());
                continue;
            };
            let (attributes, _) = read_layer(&mut layer, false)?;
            log::debug!(
                "Read {} consumer rows from {}:{name}",
                attributes.len(),
                path.display()
            );
            relations.push(attributes);
        }

        if relations.is_empty() {
            return Err(GdbError::NoConsumerLayers {
                path: path.to_path_buf(),
                layers: layers.join(", "),
            });
        }

        Ok(relations)
    }

    fn list_layers(&self, path: &Path) -> Result<Vec<String>, GdbError> {
        let dataset = Dataset::open(path)?;
        Ok(dataset.layers().map(|layer| layer.name()).collect())
    }
}

fn read_layer(
    layer: &mut Layer<'_>,
    with_geometry: bool,
) -> Result<(Relation, Vec<Option<geo::Geometry<f64>>>), GdbError> {
    let columns: Vec<String> = layer.defn().fields().map(|field| field.name()).collect();
    let mut attributes = Relation::new(columns.iter().cloned());
    let mut geometries = Vec::new();

    // Relation::new collapses case-insensitive duplicates, so map by name.
    let positions: Vec<Option<usize>> = columns
        .iter()
        .enumerate()
        .map(|(i, name)| (attributes.column_index(name) == Some(i)).then_some(i))
        .collect();
    let width = attributes.columns().len();

    for feature in layer.features() {
        let mut row = vec![Value::Null; width];
        for ((_, value), target) in feature.fields().zip(&positions) {
            if let (Some(target), Some(value)) = (target, value) {
                row[*target] = field_value(value);
            }
        }
        attributes.push_row(row)?;

        if with_geometry {
            let geometry = match feature.geometry() {
                Some(geometry) => match geometry.to_geo() {
                    Ok(geometry) => Some(geometry),
                    Err(e) => {
                        log::debug!("Unconvertible geometry: {e}");
                        None
                    }
                },
                None => None,
            };
            geometries.push(geometry);
        }
    }

    Ok((attributes, geometries))
}

/// Converts a GDAL field into a loosely typed value. Dates and lists are
/// kept as their string rendering.
fn field_value(value: FieldValue) -> Value {
    match value {
        FieldValue::IntegerValue(i) => Value::Int(i64::from(i)),
        FieldValue::Integer64Value(i) => Value::Int(i),
        FieldValue::RealValue(f) => Value::Float(f),
        FieldValue::StringValue(s) => Value::Text(s),
        other => other.into_string().map_or(Value::Null, Value::Text),
    }
}

fn crs_from_spatial_ref(mut srs: SpatialRef) -> Result<Crs, GdbError> {
    if srs.auto_identify_epsg().is_err() {
        log::debug!("Could not auto-identify an EPSG code, using the declared authority");
    }
    let authority = srs.authority().map_err(|_| GdbError::UnidentifiedCrs {
        definition: srs.to_wkt().unwrap_or_default(),
    })?;
    let mut crs: Crs = authority.parse()?;
    crs.geographic = srs.is_geographic();
    Ok(crs)
}

/// Resolves a CRS definition (`EPSG:31983`, WKT, PROJ string) to an
/// authority identifier.
///
/// # Errors
///
/// Returns [`GdbError`] if GDAL cannot parse the definition or it maps to
/// no authority code.
pub fn resolve_crs(definition: &str) -> Result<Crs, GdbError> {
    let srs = SpatialRef::from_definition(definition)?;
    crs_from_spatial_ref(srs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_values_keep_their_types() {
        assert_eq!(field_value(FieldValue::IntegerValue(7)), Value::Int(7));
        assert_eq!(
            field_value(FieldValue::Integer64Value(9_000_000_000)),
            Value::Int(9_000_000_000)
        );
        assert_eq!(field_value(FieldValue::RealValue(1.5)), Value::Float(1.5));
        assert_eq!(
            field_value(FieldValue::StringValue("UC-1".to_string())),
            Value::from("UC-1")
        );
    }

    #[test]
    fn resolves_projected_and_geographic_codes() {
        let utm = resolve_crs("EPSG:31983").unwrap();
        assert_eq!(utm.to_string(), "EPSG:31983");
        assert!(!utm.geographic);

        let wgs84 = resolve_crs("EPSG:4326").unwrap();
        assert_eq!(wgs84, Crs::wgs84());
        assert!(wgs84.geographic);
    }

    #[test]
    fn unresolvable_definition_is_an_error() {
        assert!(resolve_crs("not a crs").is_err());
    }

    #[test]
    fn missing_dataset_is_an_error() {
        let reader = GdalReader;
        let result = reader.read_spatial(Path::new("/nonexistent/source.gdb"), "PONNOT");
        assert!(matches!(result, Err(GdbError::Gdal(_))));
    }
}

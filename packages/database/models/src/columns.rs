//! Well-known BDGD and store column names.

/// Monthly energy consumption columns, January to December.
pub const ENE_MONTHS: [&str; 12] = [
    "ENE_01", "ENE_02", "ENE_03", "ENE_04", "ENE_05", "ENE_06", "ENE_07", "ENE_08", "ENE_09",
    "ENE_10", "ENE_11", "ENE_12",
];

/// Installed load.
pub const CAR_INST: &str = "CAR_INST";

/// Annual energy total, derived.
pub const ENE_TOT: &str = "ENE_TOT";

/// Mean monthly energy, derived.
pub const ENE_MED: &str = "ENE_MED";

/// Demand, derived from installed load.
pub const DEM: &str = "DEM";

/// Serialised geometry (`GeoJSON` text) in the store.
pub const GEOMETRY: &str = "geometry";

/// Representative point X in the run's base CRS.
pub const GEOM_X: &str = "geom_x";

/// Representative point Y in the run's base CRS.
pub const GEOM_Y: &str = "geom_y";

/// Representative point longitude in `EPSG:4326`.
pub const LONGITUDE: &str = "longitude";

/// Representative point latitude in `EPSG:4326`.
pub const LATITUDE: &str = "latitude";

/// Columns owned by the store. Source attributes with these names are
/// discarded on load.
pub const RESERVED: [&str; 5] = [GEOMETRY, GEOM_X, GEOM_Y, LONGITUDE, LATITUDE];

/// Derived analytics columns, stored as numbers rather than text.
pub const DERIVED: [&str; 3] = [ENE_TOT, ENE_MED, DEM];

/// Whether a column name is reserved by the store.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    RESERVED.iter().any(|r| crate::same_column(r, name))
}

/// Whether a column name is a derived analytics column.
#[must_use]
pub fn is_derived(name: &str) -> bool {
    DERIVED.iter().any(|d| crate::same_column(d, name))
}

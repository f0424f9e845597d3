//! Coordinate reference system identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a CRS identifier string is not `AUTHORITY:CODE`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid CRS identifier {input:?}, expected AUTHORITY:CODE")]
pub struct CrsParseError {
    /// The rejected input.
    pub input: String,
}

/// An authority-qualified CRS identifier such as `EPSG:31983`.
///
/// Equality compares the authority case-insensitively and the code exactly.
/// The `geographic` flag describes the CRS and takes no part in identity.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Crs {
    /// Authority name, e.g. `EPSG`.
    pub authority: String,
    /// Code within the authority, e.g. `4326`.
    pub code: String,
    /// Whether coordinates are angular (longitude/latitude).
    pub geographic: bool,
}

impl Crs {
    /// Creates a CRS identifier.
    #[must_use]
    pub fn new(authority: impl Into<String>, code: impl Into<String>, geographic: bool) -> Self {
        Self {
            authority: authority.into(),
            code: code.into(),
            geographic,
        }
    }

    /// WGS 84 geographic coordinates (`EPSG:4326`).
    #[must_use]
    pub fn wgs84() -> Self {
        Self::new("EPSG", "4326", true)
    }

    /// Whether this is `EPSG:4326`.
    #[must_use]
    pub fn is_wgs84(&self) -> bool {
        *self == Self::wgs84()
    }

    /// Identifier string in the form PROJ accepts, e.g. `EPSG:4326`.
    #[must_use]
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.authority.to_ascii_uppercase(), self.code)
    }
}

impl PartialEq for Crs {
    fn eq(&self, other: &Self) -> bool {
        self.authority.eq_ignore_ascii_case(&other.authority) && self.code == other.code
    }
}

impl std::hash::Hash for Crs {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.authority.to_ascii_uppercase().hash(state);
        self.code.hash(state);
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

impl FromStr for Crs {
    type Err = CrsParseError;

    /// Parses `AUTHORITY:CODE`. The geographic flag is only known for
    /// `EPSG:4326` here; other identifiers are resolved against the CRS
    /// database before use.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || CrsParseError {
            input: s.to_string(),
        };
        let (authority, code) = s.trim().split_once(':').ok_or_else(err)?;
        let (authority, code) = (authority.trim(), code.trim());
        if authority.is_empty() || code.is_empty() {
            return Err(err());
        }
        let mut crs = Self::new(authority, code, false);
        crs.geographic = crs.is_wgs84();
        Ok(crs)
    }
}

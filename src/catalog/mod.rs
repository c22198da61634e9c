//! Carrier reference endpoint catalog.
//!
//! The table is a TOML document (`endpoints.toml`, embedded at build time)
//! listing locations in order, each with an ordered set of carrier endpoints.
//! It is parsed once at startup and never mutated; a replacement table can
//! be loaded from disk with [`TargetCatalog::from_path`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::config::AddressFamily;

const BUILTIN_CATALOG: &str = include_str!("endpoints.toml");

/// Carrier group an endpoint belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarrierKind {
    Telecom,
    Unicom,
    Mobile,
    Education,
}

impl CarrierKind {
    /// Carrier groups in the order batches trace them
    pub const ALL: [CarrierKind; 4] = [
        CarrierKind::Telecom,
        CarrierKind::Unicom,
        CarrierKind::Mobile,
        CarrierKind::Education,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "telecom" | "ct" => Some(Self::Telecom),
            "unicom" | "cu" => Some(Self::Unicom),
            "mobile" | "cm" => Some(Self::Mobile),
            "education" | "edu" => Some(Self::Education),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Telecom => "telecom",
            Self::Unicom => "unicom",
            Self::Mobile => "mobile",
            Self::Education => "education",
        }
    }
}

impl fmt::Display for CarrierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One carrier's reference host at a location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierEndpoint {
    /// Display name of the network ("China Telecom CN2")
    pub isp: String,
    pub carrier: CarrierKind,
    /// Host (or literal) traced for IPv4 runs
    pub ipv4: String,
    /// Host (or literal) traced for IPv6 runs
    pub ipv6: String,
}

impl CarrierEndpoint {
    pub fn host(&self, family: AddressFamily) -> &str {
        match family {
            AddressFamily::V4 => &self.ipv4,
            AddressFamily::V6 => &self.ipv6,
        }
    }
}

/// A named location and its endpoints, in table order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationGroup {
    pub name: String,
    pub endpoints: Vec<CarrierEndpoint>,
}

/// Which slice of the catalog a batch traces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
    /// One endpoint per carrier at the reference location
    Fast,
    Carrier(CarrierKind),
    /// Every carrier group, one after another
    All,
    /// Every endpoint at the named locations
    Locations(Vec<String>),
}

/// A selected endpoint with the location it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry<'a> {
    pub location: &'a str,
    pub endpoint: &'a CarrierEndpoint,
}

impl CatalogEntry<'_> {
    /// Header text for this endpoint ("Beijing China Telecom")
    pub fn label(&self) -> String {
        format!("{} {}", self.location, self.endpoint.isp)
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid catalog: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("catalog has no locations")]
    Empty,
    #[error("reference location '{0}' is not in the catalog")]
    MissingReference(String),
    #[error("reference location has no {0} endpoint")]
    MissingCarrier(CarrierKind),
    #[error("location '{name}' not found. Available locations: {available}")]
    UnknownLocation { name: String, available: String },
}

/// Read-only registry of carrier reference endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct TargetCatalog {
    /// Location the fast subset is drawn from
    reference: String,
    locations: Vec<LocationGroup>,
}

impl TargetCatalog {
    /// The table shipped with the binary
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    /// Load a replacement table from disk
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, CatalogError> {
        let catalog: TargetCatalog = toml::from_str(text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        if self.locations.iter().all(|l| l.endpoints.is_empty()) {
            return Err(CatalogError::Empty);
        }
        let reference = self
            .locations
            .iter()
            .find(|l| l.name == self.reference)
            .ok_or_else(|| CatalogError::MissingReference(self.reference.clone()))?;
        for kind in CarrierKind::ALL {
            if !reference.endpoints.iter().any(|e| e.carrier == kind) {
                return Err(CatalogError::MissingCarrier(kind));
            }
        }
        Ok(())
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn locations(&self) -> &[LocationGroup] {
        &self.locations
    }

    /// Every endpoint in table order
    fn entries(&self) -> impl Iterator<Item = CatalogEntry<'_>> {
        self.locations.iter().flat_map(|loc| {
            loc.endpoints.iter().map(move |endpoint| CatalogEntry {
                location: &loc.name,
                endpoint,
            })
        })
    }

    /// Every endpoint, grouped by carrier in [`CarrierKind::ALL`] order
    pub fn all(&self) -> Vec<CatalogEntry<'_>> {
        CarrierKind::ALL
            .iter()
            .flat_map(|&kind| self.by_carrier(kind))
            .collect()
    }

    /// Endpoints of one carrier group in table order
    pub fn by_carrier(&self, kind: CarrierKind) -> Vec<CatalogEntry<'_>> {
        self.entries()
            .filter(|e| e.endpoint.carrier == kind)
            .collect()
    }

    /// First endpoint of each carrier at the reference location
    pub fn fast_subset(&self) -> Vec<CatalogEntry<'_>> {
        let reference: Vec<_> = self
            .entries()
            .filter(|e| e.location == self.reference)
            .collect();
        CarrierKind::ALL
            .iter()
            .filter_map(|&kind| reference.iter().find(|e| e.endpoint.carrier == kind).copied())
            .collect()
    }

    /// Every endpoint at the given locations, in table order
    pub fn by_locations<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<CatalogEntry<'_>>, CatalogError> {
        for name in names {
            let name = name.as_ref();
            if !self.locations.iter().any(|l| l.name.eq_ignore_ascii_case(name)) {
                return Err(CatalogError::UnknownLocation {
                    name: name.to_string(),
                    available: self
                        .locations
                        .iter()
                        .map(|l| l.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }
        Ok(self
            .entries()
            .filter(|e| names.iter().any(|n| e.location.eq_ignore_ascii_case(n.as_ref())))
            .collect())
    }

    pub fn select(&self, selection: &Selection) -> Result<Vec<CatalogEntry<'_>>, CatalogError> {
        match selection {
            Selection::Fast => Ok(self.fast_subset()),
            Selection::Carrier(kind) => Ok(self.by_carrier(*kind)),
            Selection::All => Ok(self.all()),
            Selection::Locations(names) => self.by_locations(names),
        }
    }
}

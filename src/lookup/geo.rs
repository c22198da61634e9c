//! Geolocation session for hop enrichment.
//!
//! A batch opens one session before its first target and releases it after
//! the last one. The default backend reads a MaxMind GeoLite2 City database;
//! without one the batch runs with [`NoGeo`].

use anyhow::{Context, Result};
use maxminddb::{Reader, geoip2};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Geolocation information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl fmt::Display for GeoInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.country)?;
        if let Some(ref region) = self.region {
            write!(f, " {}", region)?;
        }
        if let Some(ref city) = self.city
            && self.region.as_deref() != Some(city)
        {
            write!(f, " {}", city)?;
        }
        Ok(())
    }
}

/// A long-lived geolocation session shared by every target in a batch
pub trait GeoSession: Send + Sync {
    /// Look up `ip`, naming places in `lang` where the source has it
    fn lookup(&self, ip: IpAddr, lang: &str) -> Option<GeoInfo>;

    /// Close the session. Called once per batch.
    fn release(&self);
}

/// Opens geolocation sessions
pub trait GeoConnector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn GeoSession>>;
}

/// Session that knows nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeo;

impl GeoSession for NoGeo {
    fn lookup(&self, _ip: IpAddr, _lang: &str) -> Option<GeoInfo> {
        None
    }

    fn release(&self) {}
}

/// GeoIP cache entry
struct CacheEntry {
    geo: Option<GeoInfo>,
    cached_at: Instant,
}

/// GeoIP lookup using MaxMind GeoLite2 database
pub struct GeoLookup {
    /// `None` once released
    reader: RwLock<Option<Reader<Vec<u8>>>>,
    cache: RwLock<HashMap<(IpAddr, &'static str), CacheEntry>>,
    cache_ttl: Duration,
}

impl GeoLookup {
    /// Create a new GeoLookup from a database file path
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, maxminddb::MaxMindDBError> {
        let reader = Reader::open_readfile(db_path)?;

        Ok(Self {
            reader: RwLock::new(Some(reader)),
            cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::from_secs(3600), // 1 hour
        })
    }

    /// Try to create GeoLookup from common default paths
    pub fn try_default() -> Option<Self> {
        default_paths()
            .into_iter()
            .filter(|path| path.exists())
            .find_map(|path| Self::new(&path).ok())
    }

    /// Perform the actual database lookup
    fn do_lookup(&self, ip: IpAddr, locale: &str) -> Option<GeoInfo> {
        let guard = self.reader.read();
        let reader = guard.as_ref()?;
        let city: geoip2::City = reader.lookup(ip).ok()?;

        let name = |names: Option<&std::collections::BTreeMap<&str, &str>>| {
            names
                .and_then(|n| n.get(locale).or_else(|| n.get("en")))
                .map(|s| s.to_string())
        };

        // Extract country (required)
        let country = city
            .country
            .as_ref()
            .and_then(|c| name(c.names.as_ref()).or_else(|| c.iso_code.map(str::to_string)))?;

        let city_name = city.city.as_ref().and_then(|c| name(c.names.as_ref()));

        let region = city
            .subdivisions
            .as_ref()
            .and_then(|s| s.first())
            .and_then(|s| name(s.names.as_ref()));

        let (latitude, longitude) = city
            .location
            .as_ref()
            .map(|loc| (loc.latitude, loc.longitude))
            .unwrap_or((None, None));

        Some(GeoInfo {
            city: city_name,
            region,
            country,
            latitude,
            longitude,
        })
    }
}

impl GeoSession for GeoLookup {
    fn lookup(&self, ip: IpAddr, lang: &str) -> Option<GeoInfo> {
        let locale = locale_for(lang);

        // Check cache first
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(&(ip, locale))
                && entry.cached_at.elapsed() < self.cache_ttl
            {
                return entry.geo.clone();
            }
        }

        let geo = self.do_lookup(ip, locale);

        // Cache result
        {
            let mut cache = self.cache.write();
            cache.insert(
                (ip, locale),
                CacheEntry {
                    geo: geo.clone(),
                    cached_at: Instant::now(),
                },
            );
        }

        geo
    }

    fn release(&self) {
        if self.reader.write().take().is_some() {
            self.cache.write().clear();
            tracing::debug!("geolocation session released");
        }
    }
}

/// Map a language tag onto a GeoLite2 locale key
fn locale_for(lang: &str) -> &'static str {
    match lang.to_lowercase().as_str() {
        "cn" | "zh" | "zh-cn" => "zh-CN",
        "ja" | "jp" => "ja",
        "de" => "de",
        "fr" => "fr",
        "ru" => "ru",
        _ => "en",
    }
}

/// Common GeoLite2 City locations, most specific first
fn default_paths() -> Vec<PathBuf> {
    [
        // User data directory
        dirs::data_dir().map(|d| d.join("fast-trace").join("GeoLite2-City.mmdb")),
        // Config directory
        dirs::config_dir().map(|d| d.join("fast-trace").join("GeoLite2-City.mmdb")),
        // Current directory
        Some(PathBuf::from("GeoLite2-City.mmdb")),
        // System locations
        Some(PathBuf::from("/usr/share/GeoIP/GeoLite2-City.mmdb")),
        Some(PathBuf::from("/var/lib/GeoIP/GeoLite2-City.mmdb")),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Connects to a GeoLite2 database: an explicit path must open, the default
/// paths are best effort and fall back to [`NoGeo`]
#[derive(Debug, Clone, Default)]
pub struct MaxMindConnector {
    pub path: Option<PathBuf>,
}

impl MaxMindConnector {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl GeoConnector for MaxMindConnector {
    fn connect(&self) -> Result<Arc<dyn GeoSession>> {
        if let Some(ref path) = self.path {
            let lookup = GeoLookup::new(path)
                .with_context(|| format!("Failed to load GeoIP database '{}'", path.display()))?;
            return Ok(Arc::new(lookup));
        }

        match GeoLookup::try_default() {
            Some(lookup) => Ok(Arc::new(lookup)),
            None => {
                tracing::info!("no GeoLite2 database found, hops will not be geolocated");
                Ok(Arc::new(NoGeo))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_info_display() {
        let geo = GeoInfo {
            city: Some("Mountain View".to_string()),
            region: Some("California".to_string()),
            country: "United States".to_string(),
            latitude: Some(37.386),
            longitude: Some(-122.0838),
        };
        assert_eq!(geo.to_string(), "United States California Mountain View");

        // Municipalities name the region and city the same
        let geo = GeoInfo {
            city: Some("Beijing".to_string()),
            region: Some("Beijing".to_string()),
            country: "China".to_string(),
            latitude: None,
            longitude: None,
        };
        assert_eq!(geo.to_string(), "China Beijing");
    }

    #[test]
    fn test_locale_for() {
        assert_eq!(locale_for("cn"), "zh-CN");
        assert_eq!(locale_for("EN"), "en");
        assert_eq!(locale_for("xx"), "en");
    }

    #[test]
    fn test_missing_explicit_database_is_an_error() {
        let connector = MaxMindConnector::new(Some(PathBuf::from("/nonexistent/GeoLite2-City.mmdb")));
        let err = connector.connect().err().unwrap();
        assert!(err.to_string().contains("GeoIP database"));
    }

    #[test]
    fn test_no_geo_session() {
        let session = NoGeo;
        assert!(session.lookup("8.8.8.8".parse().unwrap(), "en").is_none());
        session.release();
    }
}

//! User preferences persistence.
//!
//! Saved defaults live in ~/.config/fast-trace/config.toml. Command-line
//! values always win over them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::cli::Args;

/// User preferences
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prefs {
    /// Language for geolocation names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// GeoLite2 City database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geoip_db: Option<PathBuf>,
    /// traceroute program to drive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    /// Trace log path for logging mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

impl Prefs {
    /// Get config file path: ~/.config/fast-trace/config.toml
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("fast-trace").join("config.toml"))
    }

    /// Load preferences from disk (returns default if missing/invalid)
    pub fn load() -> Self {
        Self::path()
            .and_then(|p| fs::read_to_string(p).ok())
            .and_then(|s| match toml::from_str(&s) {
                Ok(prefs) => Some(prefs),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring invalid preferences file");
                    None
                }
            })
            .unwrap_or_default()
    }

    /// Fill options the user left unset on the command line
    pub fn apply_to(&self, args: &mut Args) {
        if args.lang.is_none() {
            args.lang = self.language.clone();
        }
        if args.geoip_db.is_none() {
            args.geoip_db = self.geoip_db.clone();
        }
        if args.engine.is_none() {
            args.engine = self.engine.clone();
        }
        if args.log_path.is_none() {
            args.log_path = self.log_path.clone();
        }
    }
}

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::{CarrierKind, Selection};
use crate::cli::Args;

/// Probe transport handed to the diagnostic engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    #[default]
    Icmp,
    /// TCP SYN probes to the destination port
    Tcp,
}

impl ProbeMethod {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Icmp => "ICMP",
            Self::Tcp => "TCP SYN",
        }
    }
}

/// IP address family of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        Self::of(addr) == *self
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::V4 => "IPv4",
            Self::V6 => "IPv6",
        }
    }
}

/// Where hop output goes for the whole batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Render to the terminal as hops arrive
    #[default]
    Interactive,
    /// Append to the durable trace log, one handle per target
    Logging,
}

/// What the batch does after a target's engine invocation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Record the failure and move on to the next target
    #[default]
    ContinueOnError,
    /// Record the failure and stop; remaining targets are not run
    AbortOnError,
}

/// Where the batch's targets come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSource {
    Catalog(Selection),
    File(PathBuf),
}

impl Default for TargetSource {
    fn default() -> Self {
        Self::Catalog(Selection::Fast)
    }
}

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Interface to pick a source address from
    pub source_interface: Option<String>,
    /// Explicit source address, used when no interface is given
    pub source_address: Option<IpAddr>,
    /// First TTL to probe
    pub begin_hop: u8,
    /// Maximum TTL
    pub max_hops: u8,
    /// Enable reverse DNS of hop addresses
    pub rdns: bool,
    /// Wait for every reverse lookup instead of a bounded budget
    pub always_wait_rdns: bool,
    /// Language tag for geolocation names ("en", "cn")
    pub language: String,
    /// Probe packet size in bytes
    pub packet_size: u16,
    /// Per-probe timeout
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Set the don't-fragment bit
    pub dont_fragment: bool,
    pub method: ProbeMethod,
    pub family: AddressFamily,
    pub mode: RunMode,
    pub source: TargetSource,
    pub policy: FailurePolicy,
    /// Extra attempts for targets failing with a retryable error
    pub retries: u8,
    /// Durable log path for logging mode
    pub log_path: PathBuf,
    /// Mask destination addresses in headers
    pub hide_destination: bool,
    /// GeoLite2 City database; default search paths when unset
    pub geoip_db: Option<PathBuf>,
    /// traceroute program to drive
    pub engine: String,
}

/// Engine program used when none is configured
pub const DEFAULT_ENGINE: &str = "traceroute";

/// Upper bound on extra attempts per target
pub const MAX_RETRIES: u8 = 5;

/// Default location of the durable trace log
pub fn default_log_path() -> PathBuf {
    std::env::temp_dir().join("trace.log")
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source_interface: None,
            source_address: None,
            begin_hop: 1,
            max_hops: 30,
            rdns: true,
            always_wait_rdns: false,
            language: "en".to_string(),
            packet_size: 52,
            timeout: Duration::from_secs(1),
            dont_fragment: false,
            method: ProbeMethod::Icmp,
            family: AddressFamily::V4,
            mode: RunMode::Interactive,
            source: TargetSource::default(),
            policy: FailurePolicy::ContinueOnError,
            retries: 0,
            log_path: default_log_path(),
            hide_destination: false,
            geoip_db: None,
            engine: DEFAULT_ENGINE.to_string(),
        }
    }
}

impl From<&Args> for RunConfig {
    fn from(args: &Args) -> Self {
        let source = match args.file {
            Some(ref path) => TargetSource::File(path.clone()),
            None if !args.locations.is_empty() => {
                TargetSource::Catalog(Selection::Locations(args.locations.clone()))
            }
            None => TargetSource::Catalog(selection_from_name(&args.carrier)),
        };

        Self {
            source_interface: args.source_dev.clone(),
            source_address: args.source,
            begin_hop: args.first_hop,
            max_hops: args.max_hops,
            rdns: !args.no_rdns,
            always_wait_rdns: args.always_rdns,
            language: args.lang.clone().unwrap_or_else(|| "en".to_string()),
            packet_size: args.packet_size,
            timeout: args.timeout_duration(),
            dont_fragment: args.dont_fragment,
            method: if args.tcp { ProbeMethod::Tcp } else { ProbeMethod::Icmp },
            family: if args.ipv6 { AddressFamily::V6 } else { AddressFamily::V4 },
            mode: if args.output { RunMode::Logging } else { RunMode::Interactive },
            source,
            policy: if args.abort_on_error {
                FailurePolicy::AbortOnError
            } else {
                FailurePolicy::ContinueOnError
            },
            retries: args.retries.min(MAX_RETRIES),
            log_path: args.log_path.clone().unwrap_or_else(default_log_path),
            hide_destination: args.hide_dest_ip,
            geoip_db: args.geoip_db.clone(),
            engine: args
                .engine
                .clone()
                .unwrap_or_else(|| DEFAULT_ENGINE.to_string()),
        }
    }
}

/// Map a `--carrier` value onto a catalog selection (validated by `Args::validate`)
fn selection_from_name(name: &str) -> Selection {
    match name.to_lowercase().as_str() {
        "all" => Selection::All,
        other => CarrierKind::from_name(other)
            .map(Selection::Carrier)
            .unwrap_or(Selection::Fast),
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(argv: &[&str]) -> RunConfig {
        let args = Args::parse_from(std::iter::once("fast-trace").chain(argv.iter().copied()));
        RunConfig::from(&args)
    }

    #[test]
    fn test_defaults_select_fast_subset() {
        let config = parse(&[]);
        assert_eq!(config.source, TargetSource::Catalog(Selection::Fast));
        assert_eq!(config.method, ProbeMethod::Icmp);
        assert_eq!(config.mode, RunMode::Interactive);
        assert_eq!(config.policy, FailurePolicy::ContinueOnError);
        assert_eq!(config.family, AddressFamily::V4);
        assert_eq!(config.engine, "traceroute");
        assert!(config.geoip_db.is_none());
    }

    #[test]
    fn test_file_wins_over_catalog() {
        let config = parse(&["--file", "targets.txt", "--carrier", "mobile"]);
        assert_eq!(config.source, TargetSource::File(PathBuf::from("targets.txt")));
    }

    #[test]
    fn test_carrier_and_locations() {
        let config = parse(&["--carrier", "unicom"]);
        assert_eq!(
            config.source,
            TargetSource::Catalog(Selection::Carrier(CarrierKind::Unicom))
        );

        let config = parse(&["--carrier", "all"]);
        assert_eq!(config.source, TargetSource::Catalog(Selection::All));

        let config = parse(&["--location", "Shanghai", "--location", "Hefei"]);
        assert_eq!(
            config.source,
            TargetSource::Catalog(Selection::Locations(vec![
                "Shanghai".to_string(),
                "Hefei".to_string()
            ]))
        );
    }

    #[test]
    fn test_mode_method_and_policy_flags() {
        let config = parse(&["-T", "-6", "--output", "--abort-on-error", "--retries", "2"]);
        assert_eq!(config.method, ProbeMethod::Tcp);
        assert_eq!(config.family, AddressFamily::V6);
        assert_eq!(config.mode, RunMode::Logging);
        assert_eq!(config.policy, FailurePolicy::AbortOnError);
        assert_eq!(config.retries, 2);
    }

    #[test]
    fn test_retries_capped() {
        let config = parse(&["--retries", "200"]);
        assert_eq!(config.retries, MAX_RETRIES);
    }

    #[test]
    fn test_address_family_of() {
        let v4: IpAddr = "1.1.1.1".parse().unwrap();
        let v6: IpAddr = "2606:4700::1111".parse().unwrap();
        assert_eq!(AddressFamily::of(&v4), AddressFamily::V4);
        assert_eq!(AddressFamily::of(&v6), AddressFamily::V6);
        assert!(AddressFamily::V6.matches(&v6));
        assert!(!AddressFamily::V6.matches(&v4));
    }

    #[test]
    fn test_config_serialization() {
        let config = RunConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"policy\":\"continue-on-error\""));
        let loaded: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.timeout, config.timeout);
        assert_eq!(loaded.source, config.source);
    }
}

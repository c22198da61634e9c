use clap::{ArgAction, Parser};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::MAX_RETRIES;

/// Batch traceroute against carrier reference endpoints or a list of targets
#[derive(Parser, Debug, Clone)]
#[command(name = "fast-trace")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Carrier group to trace (fast, telecom, unicom, mobile, education, all)
    #[arg(short = 'c', long = "carrier", default_value = "fast")]
    pub carrier: String,

    /// Trace every endpoint at these catalog locations instead of a carrier group
    #[arg(short = 'l', long = "location")]
    pub locations: Vec<String>,

    /// Read targets from a file (`<address-or-host> [label]` per line)
    #[arg(short = 'f', long = "file", conflicts_with = "locations")]
    pub file: Option<PathBuf>,

    /// Replacement catalog (TOML) for the built-in endpoint table
    #[arg(long = "catalog")]
    pub catalog: Option<PathBuf>,

    /// Print the catalog and exit
    #[arg(long = "list")]
    pub list: bool,

    /// Use TCP SYN probes instead of ICMP
    #[arg(short = 'T', long = "tcp")]
    pub tcp: bool,

    /// Trace IPv6 catalog endpoints
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,

    /// Pick the source address from this interface
    #[arg(short = 'D', long = "dev")]
    pub source_dev: Option<String>,

    /// Use this source address (ignored when --dev is set)
    #[arg(short = 's', long = "source")]
    pub source: Option<IpAddr>,

    /// First TTL to probe
    #[arg(long = "first", default_value = "1")]
    pub first_hop: u8,

    /// Maximum TTL (hops)
    #[arg(short = 'm', long = "max-hops", default_value = "30")]
    pub max_hops: u8,

    /// Skip reverse DNS of hop addresses
    #[arg(short = 'n', long = "no-rdns")]
    pub no_rdns: bool,

    /// Wait for every reverse lookup to finish before rendering a hop
    #[arg(short = 'a', long = "always-rdns", conflicts_with = "no_rdns")]
    pub always_rdns: bool,

    /// Language for geolocation names (en, cn)
    #[arg(long = "lang")]
    pub lang: Option<String>,

    /// Probe packet size in bytes
    #[arg(long = "psize", default_value = "52")]
    pub packet_size: u16,

    /// Probe timeout in milliseconds
    #[arg(long = "timeout", default_value = "1000")]
    pub timeout: u64,

    /// Set the don't-fragment bit on probes
    #[arg(long = "dont-fragment")]
    pub dont_fragment: bool,

    /// Append hop results to the trace log; target headers still print to the terminal
    #[arg(short = 'o', long = "output")]
    pub output: bool,

    /// Trace log path (default: <tmp>/trace.log)
    #[arg(long = "log-path")]
    pub log_path: Option<PathBuf>,

    /// Stop the batch at the first failed target
    #[arg(long = "abort-on-error")]
    pub abort_on_error: bool,

    /// Extra attempts for targets that fail with a retryable error
    #[arg(long = "retries", default_value = "0")]
    pub retries: u8,

    /// Mask destination addresses in target headers
    #[arg(long = "hide-dest-ip")]
    pub hide_dest_ip: bool,

    /// Path to a MaxMind GeoLite2 City database
    #[arg(long = "geoip-db")]
    pub geoip_db: Option<PathBuf>,

    /// traceroute program to drive
    #[arg(long = "engine")]
    pub engine: Option<String>,

    /// Print the batch report as JSON when done
    #[arg(long = "json")]
    pub json: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

/// Carrier names accepted by `--carrier`
pub const CARRIER_CHOICES: [&str; 6] = ["fast", "telecom", "unicom", "mobile", "education", "all"];

impl Args {
    /// Get timeout as Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        let carrier = self.carrier.to_lowercase();
        if !CARRIER_CHOICES.contains(&carrier.as_str()) {
            return Err(format!(
                "Unknown carrier: {}. Use one of: {}",
                self.carrier,
                CARRIER_CHOICES.join(", ")
            ));
        }

        if self.timeout == 0 {
            return Err("Timeout must be positive".into());
        }

        if self.first_hop == 0 {
            return Err("First hop must be at least 1".into());
        }

        if self.max_hops == 0 {
            return Err("Max hops must be at least 1".into());
        }

        // Upper bound to keep a single trace from running away
        const MAX_SAFE_TTL: u8 = 64;
        if self.max_hops > MAX_SAFE_TTL {
            return Err(format!("Max hops cannot exceed {}", MAX_SAFE_TTL));
        }

        if self.first_hop > self.max_hops {
            return Err(format!(
                "First hop ({}) cannot exceed max hops ({})",
                self.first_hop, self.max_hops
            ));
        }

        if self.retries > MAX_RETRIES {
            return Err(format!("Retries cannot exceed {}", MAX_RETRIES));
        }

        if let Some(ref iface) = self.source_dev {
            if iface.is_empty() {
                return Err("Interface name cannot be empty".into());
            }
            // IFNAMSIZ on Linux is 16 including null terminator
            if iface.len() > 15 {
                return Err(format!("Interface name too long: {} (max 15 chars)", iface));
            }
        }

        if let Some(ref src) = self.source {
            if src.is_ipv6() != self.ipv6 && self.file.is_none() {
                return Err(format!(
                    "Source address {} does not match the {} catalog family",
                    src,
                    if self.ipv6 { "IPv6" } else { "IPv4" }
                ));
            }
        }

        Ok(())
    }
}

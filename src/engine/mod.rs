//! Contract with the external diagnostic engine.
//!
//! The engine sweeps TTLs toward one destination and reports each hop to
//! an [`OutputSink`] as it is discovered. Batches only ever see this
//! trait; [`CommandEngine`] is the implementation that drives the system
//! `traceroute` binary.

pub mod command;
pub mod parse;

pub use command::CommandEngine;
pub use parse::parse_hop_line;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{AddressFamily, ProbeMethod, RunConfig};
use crate::lookup::{GeoInfo, GeoSession};
use crate::output::OutputSink;
use crate::targets::TargetDescriptor;

/// Destination port for TCP SYN probes
pub const DEFAULT_DEST_PORT: u16 = 80;
/// Probes sent per TTL
pub const MEASUREMENTS_PER_HOP: u8 = 3;
/// Probes in flight at once
pub const PARALLEL_REQUESTS: u8 = 18;
/// Gap between consecutive probes
pub const PACKET_INTERVAL: Duration = Duration::from_millis(100);
/// Gap between TTL rounds
pub const TTL_INTERVAL: Duration = Duration::from_millis(500);

/// Everything the engine needs for one target
#[derive(Clone)]
pub struct ProbeConfig {
    pub method: ProbeMethod,
    pub begin_hop: u8,
    pub max_hops: u8,
    pub destination: IpAddr,
    pub destination_port: u16,
    pub measurements_per_hop: u8,
    pub parallelism: u8,
    pub packet_interval: Duration,
    pub ttl_interval: Duration,
    pub rdns: bool,
    pub always_wait_rdns: bool,
    pub timeout: Duration,
    pub source_address: Option<IpAddr>,
    pub packet_size: u16,
    pub language: String,
    pub dont_fragment: bool,
    /// Batch-wide geolocation session
    pub geo: Arc<dyn GeoSession>,
}

impl ProbeConfig {
    /// Merge the batch's fixed parameters with one target's destination.
    ///
    /// `source_address` is dropped if its family differs from the target's.
    pub fn for_target(
        run: &RunConfig,
        target: &TargetDescriptor,
        source_address: Option<IpAddr>,
        geo: Arc<dyn GeoSession>,
    ) -> Self {
        let source_address = source_address.filter(|src| {
            let ok = target.family().matches(src);
            if !ok {
                tracing::warn!(%src, dst = %target.address(), "source address family mismatch, ignoring");
            }
            ok
        });

        Self {
            method: run.method,
            begin_hop: run.begin_hop,
            max_hops: run.max_hops,
            destination: target.address(),
            destination_port: DEFAULT_DEST_PORT,
            measurements_per_hop: MEASUREMENTS_PER_HOP,
            parallelism: PARALLEL_REQUESTS,
            packet_interval: PACKET_INTERVAL,
            ttl_interval: TTL_INTERVAL,
            rdns: run.rdns,
            always_wait_rdns: run.always_wait_rdns,
            timeout: run.timeout,
            source_address,
            packet_size: run.packet_size,
            language: run.language.clone(),
            dont_fragment: run.dont_fragment,
            geo,
        }
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.destination)
    }
}

impl fmt::Debug for ProbeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeConfig")
            .field("method", &self.method)
            .field("begin_hop", &self.begin_hop)
            .field("max_hops", &self.max_hops)
            .field("destination", &self.destination)
            .field("destination_port", &self.destination_port)
            .field("source_address", &self.source_address)
            .field("packet_size", &self.packet_size)
            .field("timeout", &self.timeout)
            .field("rdns", &self.rdns)
            .field("dont_fragment", &self.dont_fragment)
            .finish_non_exhaustive()
    }
}

/// One probe's answer at a hop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HopProbe {
    /// Responder, `None` when the probe timed out
    pub addr: Option<IpAddr>,
    pub hostname: Option<String>,
    pub rtt: Option<Duration>,
    pub geo: Option<GeoInfo>,
}

impl HopProbe {
    pub fn timeout() -> Self {
        Self::default()
    }

    pub fn reply(addr: IpAddr, rtt: Duration) -> Self {
        Self {
            addr: Some(addr),
            rtt: Some(rtt),
            ..Self::default()
        }
    }
}

/// Everything learned at one TTL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopRecord {
    pub ttl: u8,
    pub probes: Vec<HopProbe>,
}

impl HopRecord {
    /// Distinct responders in the order they answered
    pub fn responders(&self) -> Vec<IpAddr> {
        let mut seen = Vec::new();
        for addr in self.probes.iter().filter_map(|p| p.addr) {
            if !seen.contains(&addr) {
                seen.push(addr);
            }
        }
        seen
    }

    /// True when no probe at this TTL got an answer
    pub fn is_silent(&self) -> bool {
        self.probes.iter().all(|p| p.addr.is_none())
    }
}

/// What a finished trace amounted to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    /// Hops reported
    pub hops: usize,
    /// Whether the destination itself answered
    pub reached: bool,
}

impl TraceSummary {
    pub fn record(&mut self, hop: &HopRecord, destination: IpAddr) {
        self.hops += 1;
        if hop.probes.iter().any(|p| p.addr == Some(destination)) {
            self.reached = true;
        }
    }
}

/// Classes of engine failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    /// The run did not finish in time
    Timeout,
    /// Temporary network or resolver condition
    Transient,
    /// Destination rejected by the engine
    InvalidDestination,
    /// Raw sockets or capabilities missing
    PermissionDenied,
    /// Engine binary missing or not executable
    Unavailable,
    /// Hop output could not be written
    Output,
    /// Anything else the engine reported
    Failed,
}

impl EngineErrorKind {
    /// Whether trying the same target again can help
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transient => "transient failure",
            Self::InvalidDestination => "invalid destination",
            Self::PermissionDenied => "permission denied",
            Self::Unavailable => "engine unavailable",
            Self::Output => "output error",
            Self::Failed => "engine failure",
        }
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A run-level failure reported by the engine
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// External path-probing engine
#[async_trait]
pub trait DiagnosticEngine: Send + Sync {
    /// Trace toward `config.destination`, rendering each hop into `sink`.
    ///
    /// Errors are reserved for failures of the run as a whole; unanswered
    /// probes are part of a normal result.
    async fn run_probe(
        &self,
        config: &ProbeConfig,
        sink: &mut dyn OutputSink,
    ) -> Result<TraceSummary, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::NoGeo;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_probe_config_merges_run_and_target() {
        let run = RunConfig {
            begin_hop: 2,
            max_hops: 20,
            packet_size: 64,
            language: "cn".to_string(),
            dont_fragment: true,
            ..RunConfig::default()
        };
        let target = TargetDescriptor::new(ip("1.1.1.1"), "Cloudflare");
        let config = ProbeConfig::for_target(&run, &target, Some(ip("203.0.113.5")), Arc::new(NoGeo));

        assert_eq!(config.destination, ip("1.1.1.1"));
        assert_eq!(config.destination_port, 80);
        assert_eq!(config.measurements_per_hop, 3);
        assert_eq!(config.parallelism, 18);
        assert_eq!(config.packet_interval, Duration::from_millis(100));
        assert_eq!(config.ttl_interval, Duration::from_millis(500));
        assert_eq!(config.begin_hop, 2);
        assert_eq!(config.max_hops, 20);
        assert_eq!(config.packet_size, 64);
        assert_eq!(config.language, "cn");
        assert!(config.dont_fragment);
        assert_eq!(config.source_address, Some(ip("203.0.113.5")));
    }

    #[test]
    fn test_probe_config_drops_mismatched_source() {
        let target = TargetDescriptor::new(ip("2001:db8::1"), "v6");
        let config = ProbeConfig::for_target(
            &RunConfig::default(),
            &target,
            Some(ip("203.0.113.5")),
            Arc::new(NoGeo),
        );
        assert_eq!(config.source_address, None);
        assert_eq!(config.family(), AddressFamily::V6);
    }

    #[test]
    fn test_hop_record_responders() {
        let hop = HopRecord {
            ttl: 3,
            probes: vec![
                HopProbe::reply(ip("10.0.0.1"), Duration::from_millis(5)),
                HopProbe::timeout(),
                HopProbe::reply(ip("10.0.0.2"), Duration::from_millis(6)),
                HopProbe::reply(ip("10.0.0.1"), Duration::from_millis(5)),
            ],
        };
        assert_eq!(hop.responders(), vec![ip("10.0.0.1"), ip("10.0.0.2")]);
        assert!(!hop.is_silent());

        let silent = HopRecord {
            ttl: 4,
            probes: vec![HopProbe::timeout(); 3],
        };
        assert!(silent.is_silent());
    }

    #[test]
    fn test_summary_detects_destination() {
        let dest = ip("1.1.1.1");
        let mut summary = TraceSummary::default();
        summary.record(
            &HopRecord {
                ttl: 1,
                probes: vec![HopProbe::reply(ip("192.168.1.1"), Duration::from_millis(1))],
            },
            dest,
        );
        assert!(!summary.reached);
        summary.record(
            &HopRecord {
                ttl: 2,
                probes: vec![HopProbe::reply(dest, Duration::from_millis(9))],
            },
            dest,
        );
        assert_eq!(summary.hops, 2);
        assert!(summary.reached);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(EngineErrorKind::Timeout.is_retryable());
        assert!(EngineErrorKind::Transient.is_retryable());
        assert!(!EngineErrorKind::InvalidDestination.is_retryable());
        assert!(!EngineErrorKind::PermissionDenied.is_retryable());
        assert!(!EngineErrorKind::Unavailable.is_retryable());

        let err = EngineError::new(EngineErrorKind::PermissionDenied, "raw socket");
        assert_eq!(err.to_string(), "permission denied: raw socket");
    }
}

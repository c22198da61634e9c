//! Engine adapter for the system `traceroute(8)`.
//!
//! The child always runs numeric (`-n`); hostnames and locations are filled
//! in here from the reverse resolver and the batch's geolocation session.

use async_trait::async_trait;
use std::net::IpAddr;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use super::{
    DiagnosticEngine, EngineError, EngineErrorKind, HopRecord, ProbeConfig, TraceSummary,
    parse_hop_line,
};
use crate::config::{AddressFamily, ProbeMethod};
use crate::lookup::{DnsLookup, sanitize_display};
use crate::output::OutputSink;

/// How long a hop waits on reverse DNS unless `always_wait_rdns` is set
const RDNS_BUDGET: Duration = Duration::from_millis(800);

/// Drives an external traceroute binary, one child process per target
pub struct CommandEngine {
    program: String,
    dns: Arc<DnsLookup>,
    rdns_budget: Duration,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, dns: Arc<DnsLookup>) -> Self {
        Self {
            program: program.into(),
            dns,
            rdns_budget: RDNS_BUDGET,
        }
    }

    /// Fill in hostnames and locations for the hop's responders
    async fn enrich(&self, hop: &mut HopRecord, config: &ProbeConfig) {
        let responders = hop.responders();

        let names: Vec<(IpAddr, Option<String>)> = if config.rdns {
            let lookups = responders.iter().map(|&ip| {
                let dns = self.dns.clone();
                let wait_all = config.always_wait_rdns;
                let budget = self.rdns_budget;
                async move {
                    let name = if wait_all {
                        dns.reverse_lookup(ip).await
                    } else {
                        tokio::time::timeout(budget, dns.reverse_lookup(ip))
                            .await
                            .ok()
                            .flatten()
                    };
                    (ip, name)
                }
            });
            futures::future::join_all(lookups).await
        } else {
            Vec::new()
        };

        for probe in &mut hop.probes {
            let Some(addr) = probe.addr else { continue };
            if let Some((_, Some(name))) = names.iter().find(|(ip, _)| *ip == addr) {
                probe.hostname = Some(sanitize_display(name));
            }
            probe.geo = config.geo.lookup(addr, &config.language);
        }
    }
}

/// Build the traceroute argument list for one target
pub fn command_args(config: &ProbeConfig) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    args.push(
        match config.family() {
            AddressFamily::V4 => "-4",
            AddressFamily::V6 => "-6",
        }
        .to_string(),
    );

    match config.method {
        ProbeMethod::Icmp => args.push("-I".to_string()),
        ProbeMethod::Tcp => {
            args.push("-T".to_string());
            args.push("-p".to_string());
            args.push(config.destination_port.to_string());
        }
    }

    // Names are resolved by the adapter, not the child
    args.push("-n".to_string());

    args.extend([
        "-f".to_string(),
        config.begin_hop.to_string(),
        "-m".to_string(),
        config.max_hops.to_string(),
        "-q".to_string(),
        config.measurements_per_hop.to_string(),
        "-N".to_string(),
        config.parallelism.to_string(),
        "-z".to_string(),
        send_wait(config.packet_interval),
        "-w".to_string(),
        format!("{}", config.timeout.as_secs_f64()),
    ]);

    if let Some(src) = config.source_address {
        args.push("-s".to_string());
        args.push(src.to_string());
    }

    if config.dont_fragment {
        args.push("-F".to_string());
    }

    args.push(config.destination.to_string());
    args.push(config.packet_size.to_string());
    args
}

/// `-z` takes milliseconds above 10, seconds otherwise
fn send_wait(interval: Duration) -> String {
    let ms = interval.as_millis();
    if ms > 10 {
        ms.to_string()
    } else {
        format!("{}", interval.as_secs_f64())
    }
}

/// Classify a failed run from its exit status and stderr
pub fn classify_failure(status: Option<i32>, stderr: &str) -> EngineError {
    let lower = stderr.to_lowercase();
    let kind = if lower.contains("operation not permitted")
        || lower.contains("permission denied")
        || lower.contains("must be root")
        || lower.contains("requires root")
    {
        EngineErrorKind::PermissionDenied
    } else if lower.contains("temporary failure") || lower.contains("try again") {
        EngineErrorKind::Transient
    } else if lower.contains("network is unreachable") || lower.contains("no route to host") {
        EngineErrorKind::Transient
    } else if lower.contains("timed out") {
        EngineErrorKind::Timeout
    } else if lower.contains("name or service not known")
        || lower.contains("cannot handle")
        || lower.contains("unknown host")
        || lower.contains("bad address")
        || lower.contains("invalid argument")
    {
        EngineErrorKind::InvalidDestination
    } else {
        EngineErrorKind::Failed
    };

    let detail = stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no diagnostics");
    let message = match status {
        Some(code) => format!("exited with status {}: {}", code, detail),
        None => format!("terminated by signal: {}", detail),
    };
    EngineError::new(kind, message)
}

fn spawn_error(program: &str, err: std::io::Error) -> EngineError {
    let kind = match err.kind() {
        std::io::ErrorKind::NotFound => EngineErrorKind::Unavailable,
        std::io::ErrorKind::PermissionDenied => EngineErrorKind::PermissionDenied,
        _ => EngineErrorKind::Failed,
    };
    EngineError::new(kind, format!("cannot run '{}': {}", program, err))
}

fn io_error(err: std::io::Error) -> EngineError {
    EngineError::new(EngineErrorKind::Failed, err.to_string())
}

#[async_trait]
impl DiagnosticEngine for CommandEngine {
    async fn run_probe(
        &self,
        config: &ProbeConfig,
        sink: &mut dyn OutputSink,
    ) -> Result<TraceSummary, EngineError> {
        let args = command_args(config);
        tracing::debug!(program = %self.program, ?args, "starting engine");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the invocation (batch cancelled) kills the trace
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.program, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::new(EngineErrorKind::Failed, "engine stdout unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::new(EngineErrorKind::Failed, "engine stderr unavailable"))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut summary = TraceSummary::default();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await.map_err(io_error)? {
            let Some(mut hop) = parse_hop_line(&line) else {
                tracing::trace!(line = %line, "engine output");
                continue;
            };
            self.enrich(&mut hop, config).await;
            summary.record(&hop, config.destination);
            sink.render(&hop)
                .map_err(|e| EngineError::new(EngineErrorKind::Output, e.to_string()))?;
        }

        let status: ExitStatus = child.wait().await.map_err(io_error)?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(classify_failure(status.code(), &stderr));
        }
        Ok(summary)
    }
}

//! Hop output destinations.
//!
//! A batch picks one [`RunMode`]; [`ModeSinks`] then opens a fresh sink per
//! target. The engine pushes hops into the sink as they are discovered.

pub mod format;
pub mod log;
pub mod terminal;

pub use format::{format_hop, format_retry, hide_ip_part};
pub use log::LogSink;
pub use terminal::TerminalSink;

use std::io::{self, Write};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::config::{ProbeMethod, RunConfig, RunMode};
use crate::engine::{EngineError, HopRecord};
use crate::targets::TargetDescriptor;

/// Header shown before a target's hops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHeader {
    pub label: String,
    pub destination: IpAddr,
    pub max_hops: u8,
    pub packet_size: u16,
    pub method: ProbeMethod,
    pub hide_destination: bool,
}

impl TargetHeader {
    pub fn new(target: &TargetDescriptor, config: &RunConfig) -> Self {
        Self {
            label: target.label().to_string(),
            destination: target.address(),
            max_hops: config.max_hops,
            packet_size: config.packet_size,
            method: config.method,
            hide_destination: config.hide_destination,
        }
    }
}

/// Per-target rendering destination
pub trait OutputSink: Send {
    /// Emit the target header
    fn begin(&mut self, header: &TargetHeader) -> io::Result<()>;

    /// Emit one hop; called once per hop, in TTL order
    fn render(&mut self, hop: &HopRecord) -> io::Result<()>;

    /// Mark the start of attempt `attempt` after `error` ended the previous
    /// one; hops that follow belong to the new attempt
    fn retry(&mut self, attempt: u8, error: &EngineError) -> io::Result<()>;

    /// Emit the footer and release whatever the sink holds
    fn finish(&mut self) -> io::Result<()>;

    /// Whether output outlives the process (log file)
    fn is_durable(&self) -> bool {
        false
    }
}

/// Opens one sink per target
pub trait SinkFactory: Send + Sync {
    fn open(&self, target: &TargetDescriptor) -> Box<dyn OutputSink>;

    /// Visual break between consecutive targets
    fn separator(&self) -> io::Result<()>;
}

/// Sinks for a run mode: the terminal, or the append-only trace log
#[derive(Debug, Clone)]
pub struct ModeSinks {
    mode: RunMode,
    log_path: PathBuf,
}

impl ModeSinks {
    pub fn new(mode: RunMode, log_path: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            log_path: log_path.into(),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.mode, config.log_path.clone())
    }
}

impl SinkFactory for ModeSinks {
    fn open(&self, target: &TargetDescriptor) -> Box<dyn OutputSink> {
        match self.mode {
            RunMode::Interactive => Box::new(TerminalSink::stdout()),
            // Headers still reach the terminal; hops go to the log only
            RunMode::Logging => match LogSink::open(&self.log_path) {
                Ok(sink) => Box::new(sink.with_echo(io::stdout(), true)),
                Err(e) => {
                    tracing::warn!(
                        path = %self.log_path.display(),
                        dst = %target,
                        error = %e,
                        "cannot open trace log, writing this target to the terminal"
                    );
                    Box::new(TerminalSink::stdout())
                }
            },
        }
    }

    fn separator(&self) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out)?;
        out.flush()
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::net::IpAddr;

use crate::engine::EngineErrorKind;
use crate::targets::{SkippedTarget, TargetDescriptor};

/// How the batch loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every target was attempted
    Completed,
    /// A failure under the abort policy stopped the loop
    AbortedOnError,
    /// Cancelled from outside (Ctrl-C)
    Interrupted,
}

impl BatchStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::AbortedOnError => "aborted on error",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Result of one target's engine invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetOutcome {
    Succeeded {
        hops: usize,
        reached: bool,
        attempts: u8,
    },
    Failed {
        kind: EngineErrorKind,
        message: String,
        attempts: u8,
    },
    /// Cancelled while the engine was running
    Interrupted,
    /// Never started: the batch stopped before reaching it
    NotRun,
}

impl TargetOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    pub label: String,
    pub destination: IpAddr,
    /// Source address handed to the engine, if any
    pub source_address: Option<IpAddr>,
    pub outcome: TargetOutcome,
}

impl TargetReport {
    pub fn not_run(target: &TargetDescriptor) -> Self {
        Self {
            label: target.label().to_string(),
            destination: target.address(),
            source_address: None,
            outcome: TargetOutcome::NotRun,
        }
    }
}

/// Everything a batch did, in target order
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: Vec<TargetReport>,
    /// Input records dropped while loading targets
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedTarget>,
}

impl BatchReport {
    pub fn has_failures(&self) -> bool {
        self.targets.iter().any(|t| t.outcome.is_failure())
    }

    /// Completed with no failed target
    pub fn is_success(&self) -> bool {
        self.status == BatchStatus::Completed && !self.has_failures()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Succeeded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(TargetOutcome::is_failure)
    }

    pub fn not_run(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::NotRun | TargetOutcome::Interrupted))
    }

    fn count(&self, pred: impl Fn(&TargetOutcome) -> bool) -> usize {
        self.targets.iter().filter(|t| pred(&t.outcome)).count()
    }

    /// Short human summary of the batch
    pub fn write_summary<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        let elapsed = self.finished_at - self.started_at;
        writeln!(
            writer,
            "{} targets: {} succeeded, {} failed, {} not run ({}, {:.1}s)",
            self.targets.len(),
            self.succeeded(),
            self.failed(),
            self.not_run(),
            self.status.label(),
            elapsed.num_milliseconds() as f64 / 1000.0
        )?;

        for target in &self.targets {
            if let TargetOutcome::Failed {
                kind,
                ref message,
                attempts,
            } = target.outcome
            {
                writeln!(
                    writer,
                    "  failed: {} ({}) after {} attempt(s): {}: {}",
                    target.label, target.destination, attempts, kind, message
                )?;
            }
        }

        for skipped in &self.skipped {
            writeln!(
                writer,
                "  skipped line {}: {:?} ({})",
                skipped.position, skipped.input, skipped.reason
            )?;
        }
        Ok(())
    }
}

//! Target descriptors and the two ways of producing them: a user target
//! file, or a selection from the carrier catalog.

pub mod catalog;
pub mod loader;

pub use catalog::resolve_catalog;
pub use loader::{LoadError, load_target_file, load_targets};

use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

use crate::config::AddressFamily;

/// One destination of a batch. Fields are fixed at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetDescriptor {
    address: IpAddr,
    label: String,
    family: AddressFamily,
}

impl TargetDescriptor {
    /// Build a descriptor; IPv4-mapped IPv6 addresses are stored as IPv4
    pub fn new(address: IpAddr, label: impl Into<String>) -> Self {
        let address = address.to_canonical();
        Self {
            address,
            label: label.into(),
            family: AddressFamily::of(&address),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.address)
    }
}

/// Why an input record produced no target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Nothing on the line
    Blank,
    /// Not an IP literal and the resolver gave no usable address
    Unresolvable(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blank => f.write_str("blank line"),
            Self::Unresolvable(why) => write!(f, "unresolvable: {}", why),
        }
    }
}

/// An input record that was skipped, with its 1-based position
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTarget {
    pub position: usize,
    pub input: String,
    pub reason: SkipReason,
}

/// Ordered targets plus everything that was skipped on the way
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadedTargets {
    pub targets: Vec<TargetDescriptor>,
    pub skipped: Vec<SkippedTarget>,
    /// Set when reading stopped early on an I/O error
    pub read_error: Option<String>,
}

impl LoadedTargets {
    pub(crate) fn skip(&mut self, position: usize, input: &str, reason: SkipReason) {
        tracing::warn!(position, input, %reason, "ignoring target");
        self.skipped.push(SkippedTarget {
            position,
            input: input.to_string(),
            reason,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

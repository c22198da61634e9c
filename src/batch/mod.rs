//! Sequential batch execution and its report.

pub mod report;
pub mod runner;

pub use report::{BatchReport, BatchStatus, TargetOutcome, TargetReport};
pub use runner::{BatchError, BatchRunner};

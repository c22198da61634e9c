// Public API - orchestration, collaborators and their data types
pub mod batch;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod engine;
pub mod lookup;
pub mod output;
pub mod prefs;
pub mod probe;
pub mod targets;

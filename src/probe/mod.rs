pub mod source;

pub use source::{is_non_public, pick_source_address, select_source_address};

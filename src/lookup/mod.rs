pub mod dns;
pub mod geo;

pub use dns::{DnsLookup, HostResolver};
pub use geo::{GeoConnector, GeoInfo, GeoLookup, GeoSession, MaxMindConnector, NoGeo};

/// Sanitize a string for safe terminal display by removing control characters.
///
/// This filters out ASCII control characters (0x00-0x1F, 0x7F) and Unicode control
/// characters that could be used to inject terminal escape sequences.
pub(crate) fn sanitize_display(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}

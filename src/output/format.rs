use std::fmt::Write as _;
use std::net::IpAddr;

use super::TargetHeader;
use crate::engine::{EngineError, HopProbe, HopRecord};

/// Mask an address down to its leading network part.
///
/// IPv4 keeps the first two octets (`a.b.0.0/16`), IPv6 the first two
/// segments (`xxxx:xxxx::/32`).
pub fn hide_ip_part(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.0.0/16", o[0], o[1])
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            format!("{:x}:{:x}::/32", s[0], s[1])
        }
    }
}

/// Destination as shown in headers
pub fn display_destination(header: &TargetHeader) -> String {
    if header.hide_destination {
        hide_ip_part(header.destination)
    } else {
        header.destination.to_string()
    }
}

/// `traceroute to <dst>, <N> hops max, <M> bytes payload`
pub fn format_trace_line(header: &TargetHeader) -> String {
    format!(
        "traceroute to {}, {} hops max, {} bytes payload",
        display_destination(header),
        header.max_hops,
        header.packet_size
    )
}

/// Marker between a failed attempt's hops and the next attempt's
pub fn format_retry(attempt: u8, error: &EngineError) -> String {
    format!("-- attempt {} after {}", attempt, error)
}

fn describe(probe: &HopProbe, addr: IpAddr) -> String {
    let mut host = match probe.hostname {
        Some(ref name) => format!("{} ({})", name, addr),
        None => addr.to_string(),
    };
    if let Some(ref geo) = probe.geo {
        let _ = write!(host, "  {}", geo);
    }
    host
}

/// Render one hop the way `traceroute` lays it out: the TTL, then each
/// responder followed by its RTTs, `*` for unanswered probes.
pub fn format_hop(hop: &HopRecord) -> String {
    let mut line = format!("{:>2}", hop.ttl);
    let mut last: Option<IpAddr> = None;

    for probe in &hop.probes {
        let Some(addr) = probe.addr else {
            line.push_str("  *");
            continue;
        };
        if last != Some(addr) {
            line.push_str("  ");
            line.push_str(&describe(probe, addr));
            last = Some(addr);
        }
        if let Some(rtt) = probe.rtt {
            let _ = write!(line, "  {:.2} ms", rtt.as_secs_f64() * 1000.0);
        }
    }

    line
}

//! Parser for `traceroute -n` hop lines.
//!
//! ```text
//!  1  192.168.1.1  0.512 ms  0.400 ms  0.388 ms
//!  2  * * *
//!  3  10.0.0.1  5.1 ms 10.0.0.2  6.2 ms *
//!  4  _gateway (192.168.1.1)  0.392 ms !H  0.378 ms
//! ```

use std::net::IpAddr;
use std::time::Duration;

use super::{HopProbe, HopRecord};

/// Parse one output line into a hop, or `None` for headers and noise
pub fn parse_hop_line(line: &str) -> Option<HopRecord> {
    let mut tokens = line.split_whitespace();
    let ttl: u8 = tokens.next()?.parse().ok()?;

    let mut probes = Vec::new();
    let mut current: Option<(IpAddr, Option<String>)> = None;
    let mut pending_name: Option<&str> = None;

    for tok in tokens {
        if tok == "*" {
            probes.push(HopProbe::timeout());
            continue;
        }
        // Units and ICMP annotations (!H, !N, !X, !<num>)
        if tok == "ms" || tok.starts_with('!') {
            continue;
        }
        if let Some(inner) = tok.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
            if let Ok(ip) = inner.parse::<IpAddr>() {
                current = Some((ip, pending_name.take().map(str::to_string)));
            }
            continue;
        }
        if let Ok(ip) = tok.parse::<IpAddr>() {
            current = Some((ip, None));
            pending_name = None;
            continue;
        }
        if let Ok(ms) = tok.parse::<f64>() {
            if let Some((addr, ref hostname)) = current
                && ms.is_finite()
                && ms >= 0.0
            {
                probes.push(HopProbe {
                    addr: Some(addr),
                    hostname: hostname.clone(),
                    rtt: Some(Duration::from_micros((ms * 1000.0).round() as u64)),
                    geo: None,
                });
            }
            continue;
        }
        pending_name = Some(tok);
    }

    if probes.is_empty() {
        return None;
    }
    Some(HopRecord { ttl, probes })
}

//! Outgoing source address selection.
//!
//! Picks an address bound to a named interface for a given family,
//! preferring public addresses. When nothing usable is found the caller
//! leaves the source unset and the OS routing table decides.

use pnet::datalink;
use std::net::{IpAddr, Ipv6Addr};

use crate::config::AddressFamily;

/// Check if an IPv6 address is link-local (fe80::/10)
///
/// Link-local addresses have the first 10 bits set to 1111111010,
/// which means the first segment is in the range 0xfe80-0xfebf.
pub fn is_link_local_ipv6(addr: &Ipv6Addr) -> bool {
    let first_seg = addr.segments()[0];
    (0xfe80..=0xfebf).contains(&first_seg)
}

/// Unique local IPv6 (fc00::/7)
fn is_unique_local_ipv6(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

/// Link-local multicast: 224.0.0.0/24 and ff02::/16 (any flags nibble)
fn is_link_local_multicast(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 224 && o[1] == 0 && o[2] == 0
        }
        IpAddr::V6(v6) => {
            let o = v6.octets();
            o[0] == 0xff && (o[1] & 0x0f) == 0x02
        }
    }
}

/// True for addresses that cannot be a useful public source: private,
/// loopback, link-local unicast or link-local multicast
pub fn is_non_public(addr: &IpAddr) -> bool {
    let scoped = match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            is_unique_local_ipv6(v6) || v6.is_loopback() || is_link_local_ipv6(v6)
        }
    };
    scoped || is_link_local_multicast(addr)
}

/// Choose a source address of `family` from `candidates`.
///
/// The first public address wins. If none of the family is public, the
/// first address of the family is used; enumeration order past that point
/// does not matter.
pub fn pick_source_address<I>(candidates: I, family: AddressFamily) -> Option<IpAddr>
where
    I: IntoIterator<Item = IpAddr>,
{
    let mut fallback = None;
    for addr in candidates {
        // IPv4-mapped IPv6 entries count as IPv4
        let addr = addr.to_canonical();
        if !family.matches(&addr) {
            continue;
        }
        if !is_non_public(&addr) {
            return Some(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback
}

/// Select an outgoing source address on `interface` for `family`.
///
/// Returns `None` when no interface is named, the interface does not exist,
/// or it has no address of the family.
pub fn select_source_address(interface: Option<&str>, family: AddressFamily) -> Option<IpAddr> {
    let name = interface?;
    let Some(iface) = datalink::interfaces().into_iter().find(|i| i.name == name) else {
        tracing::warn!(interface = name, "interface not found, using default source address");
        return None;
    };

    let picked = pick_source_address(iface.ips.iter().map(|net| net.ip()), family);
    match picked {
        Some(addr) => {
            if is_non_public(&addr) {
                tracing::info!(interface = name, %addr, "no public address on interface, using first match");
            }
        }
        None => {
            tracing::warn!(
                interface = name,
                family = family.label(),
                "interface has no address of this family, using default source address"
            );
        }
    }
    picked
}

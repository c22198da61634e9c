use std::net::IpAddr;

use super::{LoadedTargets, SkipReason, TargetDescriptor};
use crate::catalog::CatalogEntry;
use crate::config::AddressFamily;
use crate::lookup::HostResolver;

/// Turn selected catalog entries into targets of `family`, keeping catalog order.
///
/// Each endpoint's host for the family is resolved restricted to that
/// family; entries that do not resolve are skipped and reported.
pub async fn resolve_catalog(
    entries: &[CatalogEntry<'_>],
    family: AddressFamily,
    resolver: &dyn HostResolver,
) -> LoadedTargets {
    let mut loaded = LoadedTargets::default();

    for (idx, entry) in entries.iter().enumerate() {
        let host = entry.endpoint.host(family);

        let address = match host.parse::<IpAddr>() {
            Ok(ip) if family.matches(&ip.to_canonical()) => ip,
            Ok(ip) => {
                loaded.skip(
                    idx + 1,
                    host,
                    SkipReason::Unresolvable(format!("{} is not an {} address", ip, family.label())),
                );
                continue;
            }
            Err(_) => match resolver.resolve(host, Some(family)).await {
                Ok(addrs) if !addrs.is_empty() => addrs[0],
                Ok(_) => {
                    loaded.skip(
                        idx + 1,
                        host,
                        SkipReason::Unresolvable(format!("no {} addresses", family.label())),
                    );
                    continue;
                }
                Err(e) => {
                    loaded.skip(idx + 1, host, SkipReason::Unresolvable(e.to_string()));
                    continue;
                }
            },
        };

        loaded.targets.push(TargetDescriptor::new(address, entry.label()));
    }

    loaded
}

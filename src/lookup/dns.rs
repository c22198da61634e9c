use anyhow::{Result, anyhow};
use async_trait::async_trait;
use hickory_resolver::config::{LookupIpStrategy, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{Resolver, TokioResolver};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::config::AddressFamily;

/// Forward resolution of target hostnames
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolve `host` to its addresses, restricted to `family` when given.
    ///
    /// Addresses come back in resolver order; callers take the first.
    async fn resolve(&self, host: &str, family: Option<AddressFamily>) -> Result<Vec<IpAddr>>;
}

/// Reverse DNS cache entry
struct CacheEntry {
    hostname: Option<String>,
    cached_at: Instant,
}

/// DNS lookups (forward for targets, reverse for hops) with a reverse cache
pub struct DnsLookup {
    resolver: TokioResolver,
    cache: RwLock<HashMap<IpAddr, CacheEntry>>,
    cache_ttl: Duration,
}

impl DnsLookup {
    pub fn new() -> Self {
        // Try system DNS config first, fall back to Google DNS if unavailable
        let mut builder = match Resolver::builder_tokio() {
            Ok(builder) => builder,
            Err(e) => {
                tracing::warn!(error = %e, "system DNS config unavailable, using Google DNS");
                Resolver::builder_with_config(
                    ResolverConfig::google(),
                    TokioConnectionProvider::default(),
                )
            }
        };
        // Ask for both families so IPv6 targets resolve even when A records exist
        builder.options_mut().ip_strategy = LookupIpStrategy::Ipv4AndIpv6;

        Self {
            resolver: builder.build(),
            cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::from_secs(3600), // 1 hour
        }
    }

    /// Lookup reverse DNS for an IP, using cache
    pub async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        // Check cache first
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(&ip)
                && entry.cached_at.elapsed() < self.cache_ttl
            {
                return entry.hostname.clone();
            }
        }

        // Perform lookup
        let hostname = match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup.iter().next().map(|name| trim_root(&name.to_string())),
            Err(_) => None,
        };

        // Cache result
        {
            let mut cache = self.cache.write();
            cache.insert(
                ip,
                CacheEntry {
                    hostname: hostname.clone(),
                    cached_at: Instant::now(),
                },
            );
        }

        hostname
    }
}

impl Default for DnsLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostResolver for DnsLookup {
    async fn resolve(&self, host: &str, family: Option<AddressFamily>) -> Result<Vec<IpAddr>> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| anyhow!("failed to resolve {}: {}", host, e))?;

        let addrs: Vec<IpAddr> = lookup
            .iter()
            .filter(|ip| family.is_none_or(|f| f.matches(ip)))
            .collect();

        if addrs.is_empty() {
            match family {
                Some(f) => anyhow::bail!("No {} addresses found for {}", f.label(), host),
                None => anyhow::bail!("No addresses found for {}", host),
            }
        }
        Ok(addrs)
    }
}

/// Remove the trailing root dot from a PTR name
fn trim_root(name: &str) -> String {
    name.trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_root() {
        assert_eq!(trim_root("dns.google."), "dns.google");
        assert_eq!(trim_root("dns.google"), "dns.google");
    }
}

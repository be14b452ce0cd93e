//! Asynchronous hostname resolution with a process-wide bounded cache
//! (spec §4.5 step 1, §4.7). Grounded on
//! `original_source/s54http/server.py::SockProxy.resolveHost` (dotted-quad
//! fast path, cache-before-lookup, never populate the cache on failure).

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::sync::Mutex;
use tracing::debug;
use tunnel_proto::BoundedCache;

const DEFAULT_CACHE_CAPACITY: usize = 1024;

pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    cache: Mutex<BoundedCache<String, String>>,
}

impl DnsResolver {
    /// Build a resolver that sends A-record queries to `upstream`
    /// (`addr:port`, default port 53 per spec §6).
    pub fn new(upstream: std::net::SocketAddr) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        let servers = NameServerConfigGroup::from_ips_clear(&[upstream.ip()], upstream.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], servers);
        let resolver = TokioAsyncResolver::tokio(config, opts);

        DnsResolver {
            resolver,
            cache: Mutex::new(BoundedCache::new(DEFAULT_CACHE_CAPACITY)),
        }
    }

    #[cfg(test)]
    fn with_capacity(upstream: std::net::SocketAddr, capacity: usize) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        let servers = NameServerConfigGroup::from_ips_clear(&[upstream.ip()], upstream.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], servers);
        let resolver = TokioAsyncResolver::tokio(config, opts);
        DnsResolver {
            resolver,
            cache: Mutex::new(BoundedCache::new(capacity)),
        }
    }

    /// Resolve `host` to a dotted-quad IPv4 address. Recognizes an
    /// already-numeric host without touching the network or the cache;
    /// otherwise serves from cache, falling back to an async A-record
    /// lookup. Only successful lookups are cached (spec §4.5 step 4).
    pub async fn resolve(&self, host: &str) -> anyhow::Result<String> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(ip.to_string());
        }

        if let Some(cached) = self.cache.lock().await.get(&host.to_string()) {
            debug!("dns cache hit for {host}");
            return Ok(cached.clone());
        }

        debug!("resolving {host} via upstream DNS");
        let response = self.resolver.lookup_ip(host).await?;
        let addr = response
            .iter()
            .find_map(|ip| match ip {
                std::net::IpAddr::V4(v4) => Some(v4),
                std::net::IpAddr::V6(_) => None,
            })
            .ok_or_else(|| anyhow::anyhow!("no A record for {host}"))?;

        let addr = addr.to_string();
        self.cache.lock().await.insert(host.to_string(), addr.clone());
        Ok(addr)
    }
}

pub type SharedResolver = Arc<DnsResolver>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dotted_quad_bypasses_resolution_and_cache() {
        let resolver = DnsResolver::with_capacity("8.8.8.8:53".parse().unwrap(), 4);
        let addr = resolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(addr, "127.0.0.1");
        assert!(resolver.cache.lock().await.is_empty());
    }
}

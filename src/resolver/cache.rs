use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::config::CachePolicy;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    addr: Ipv4Addr,
    /// `None` for entries that only leave the cache by being overwritten.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Hostname to address cache shared by all connection tasks.
///
/// Keys are normalised hostnames (leading `www.` removed by the resolver).
#[derive(Debug, Default)]
pub struct ResolutionCache {
    entries: DashMap<String, CacheEntry>,
    policy: CachePolicy,
}

impl ResolutionCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
        }
    }

    /// Creates a cache pre-seeded with static entries that never expire.
    pub fn with_hosts<I, S>(policy: CachePolicy, hosts: I) -> Self
    where
        I: IntoIterator<Item = (S, Ipv4Addr)>,
        S: Into<String>,
    {
        let cache = Self::new(policy);
        for (host, addr) in hosts {
            let host = host.into();
            debug!("pinning {} to {}", host, addr);
            cache.entries.insert(
                host,
                CacheEntry {
                    addr,
                    expires_at: None,
                },
            );
        }
        cache
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Returns the cached address, dropping it if it has expired.
    pub fn get(&self, host: &str) -> Option<Ipv4Addr> {
        let entry = self.entries.get(host).map(|e| *e)?;
        let now = Instant::now();
        if entry.is_expired(now) {
            self.entries.remove_if(host, |_, e| e.is_expired(now));
            debug!("cache entry for {} expired", host);
            return None;
        }
        Some(entry.addr)
    }

    /// Stores an address; `ttl` is the DNS TTL of the answer it came from.
    pub fn insert(&self, host: &str, addr: Ipv4Addr, ttl: u32) {
        let expires_at = match self.policy {
            CachePolicy::Never => None,
            CachePolicy::HonorTtl => Some(Instant::now() + Duration::from_secs(ttl.into())),
            CachePolicy::Fixed { seconds } => Some(Instant::now() + Duration::from_secs(seconds)),
        };
        self.entries
            .insert(host.to_string(), CacheEntry { addr, expires_at });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

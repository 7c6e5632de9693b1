//! Origin address resolution over DNS-over-HTTPS.
//!
//! The resolver's job is to find an address that is reachable, not merely
//! one that DNS returns: every candidate is dialed on port 443 and only a
//! successful dial is cached. Cached addresses are re-dialed on use, and a
//! failed dial falls through to a fresh DoH lookup.

mod cache;
mod doh;

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub use cache::ResolutionCache;
pub use doh::{DohAnswer, DohClient, DohError, DohQuestion, DohRecord, HttpsDohClient};

use crate::config::Config;

/// Port every origin is dialed on.
pub const ORIGIN_PORT: u16 = 443;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no DoH endpoint returned a reachable address for {0}")]
    NotFound(String),
}

/// Opens connections to candidate addresses.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Stream: Send + 'static;

    async fn dial(&self, addr: SocketAddr) -> io::Result<Self::Stream>;
}

/// Dials plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

/// Provides a connected stream to the real origin of a host.
#[async_trait]
pub trait OriginResolver: Send + Sync {
    async fn connect(&self, host: &str) -> Result<TcpStream, ResolveError>;
}

/// Strips a single leading `www.` label.
pub fn normalize_host(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// DoH resolver with a reachability-checked cache.
pub struct DohResolver<C = HttpsDohClient, D = TcpDialer> {
    endpoints: Vec<String>,
    client: C,
    dialer: D,
    cache: ResolutionCache,
}

impl DohResolver {
    /// Creates the production resolver from configuration.
    pub fn from_config(config: &Config) -> Result<Self, DohError> {
        let client = HttpsDohClient::new(config.doh.timeout())?;
        let cache = ResolutionCache::with_hosts(
            config.doh.cache,
            config.hosts.iter().map(|(host, addr)| (host.clone(), *addr)),
        );
        Ok(Self::new(config.doh.endpoints.clone(), client, TcpDialer, cache))
    }
}

impl<C: DohClient, D: Dialer> DohResolver<C, D> {
    pub fn new(endpoints: Vec<String>, client: C, dialer: D, cache: ResolutionCache) -> Self {
        Self {
            endpoints,
            client,
            dialer,
            cache,
        }
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    /// Resolves `host` to a reachable IPv4 address.
    pub async fn resolve(&self, host: &str) -> Result<Ipv4Addr, ResolveError> {
        self.connect_origin(host).await.map(|(_, addr)| addr)
    }

    /// Resolves `host` and returns the connection that proved the address
    /// reachable.
    pub async fn connect_origin(&self, host: &str) -> Result<(D::Stream, Ipv4Addr), ResolveError> {
        let host = normalize_host(host);

        if let Some(addr) = self.cache.get(host) {
            match self.dial(addr).await {
                Ok(stream) => {
                    debug!("cache hit for {}: {}", host, addr);
                    return Ok((stream, addr));
                }
                Err(e) => warn!("cached address {} for {} unreachable: {}", addr, host, e),
            }
        }

        for endpoint in &self.endpoints {
            let answer = match self.client.query(endpoint, host).await {
                Ok(answer) => answer,
                Err(e) => {
                    warn!("DoH query to {} for {} failed: {}", endpoint, host, e);
                    continue;
                }
            };

            for (addr, ttl) in answer.candidates() {
                match self.dial(addr).await {
                    Ok(stream) => {
                        info!("DoH {} -> {} (via {})", host, addr, endpoint);
                        self.cache.insert(host, addr, ttl);
                        return Ok((stream, addr));
                    }
                    Err(e) => debug!("candidate {} for {} unreachable: {}", addr, host, e),
                }
            }
        }

        Err(ResolveError::NotFound(host.to_string()))
    }

    async fn dial(&self, addr: Ipv4Addr) -> io::Result<D::Stream> {
        self.dialer
            .dial(SocketAddr::V4(SocketAddrV4::new(addr, ORIGIN_PORT)))
            .await
    }
}

#[async_trait]
impl<C: DohClient> OriginResolver for DohResolver<C, TcpDialer> {
    async fn connect(&self, host: &str) -> Result<TcpStream, ResolveError> {
        self.connect_origin(host).await.map(|(stream, _)| stream)
    }
}

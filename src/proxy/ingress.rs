//! Plaintext forward-proxy ingress.
//!
//! Clients configured with this proxy send either `CONNECT host:port` or an
//! absolute-form request. Hosts in the intercept set are handed to the TLS
//! terminator over the bridge; everything else is dialed directly and relayed
//! untouched.

use std::net::SocketAddr;
use std::sync::Arc;

use http::Uri;
use http::uri::Authority;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use super::{ProxyError, accept_retrying};
use super::tunnel::Tunnel;
use crate::bridge::BridgeListener;
use crate::pattern::DomainPatternSet;

/// Size of the single initial read that must contain the request line.
const INITIAL_READ: usize = 1024;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Where a client request is headed, as parsed from its request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
    /// `true` for `CONNECT`, which needs a 200 reply before relaying.
    pub tunnel: bool,
}

impl ProxyTarget {
    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parses the method and target out of the first request line.
///
/// `head` is the initial chunk read from the client; only its first line is
/// inspected, except that a relative target falls back to the `Host` header.
pub fn parse_request_line(head: &[u8]) -> Result<ProxyTarget, ProxyError> {
    let text = String::from_utf8_lossy(head);
    let line = text
        .lines()
        .next()
        .ok_or_else(|| ProxyError::Parse("empty request".to_string()))?;

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::Parse(format!("malformed request line: {line:?}")));
    };
    if !version.starts_with("HTTP/") {
        return Err(ProxyError::Parse(format!("bad HTTP version {version:?}")));
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        let authority: Authority = target
            .parse()
            .map_err(|e| ProxyError::Parse(format!("bad CONNECT target {target:?}: {e}")))?;
        return Ok(ProxyTarget {
            host: authority.host().to_string(),
            port: authority_port(&authority, 443)?,
            tunnel: true,
        });
    }

    let uri: Uri = target
        .parse()
        .map_err(|e| ProxyError::Parse(format!("bad request target {target:?}: {e}")))?;
    let authority = match uri.authority() {
        Some(authority) => authority.clone(),
        None => host_header(&text)
            .ok_or_else(|| ProxyError::Parse(format!("no host for target {target:?}")))?
            .parse()
            .map_err(|e| ProxyError::Parse(format!("bad Host header: {e}")))?,
    };

    Ok(ProxyTarget {
        host: authority.host().to_string(),
        port: authority_port(&authority, 80)?,
        tunnel: false,
    })
}

/// Port of `authority`, or `default` when none is given. `http` accepts any
/// text after the colon, so a non-numeric port is rejected here.
fn authority_port(authority: &Authority, default: u16) -> Result<u16, ProxyError> {
    let host_port = authority.as_str().rsplit('@').next().unwrap_or_default();
    let rest = host_port.get(authority.host().len()..).unwrap_or_default();
    match rest.strip_prefix(':') {
        None | Some("") => Ok(default),
        Some(port) => port
            .parse()
            .map_err(|_| ProxyError::Parse(format!("bad port in {authority}"))),
    }
}

fn host_header(head: &str) -> Option<&str> {
    head.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("host")
            .then(|| value.trim())
    })
}

/// Forward proxy accepting plaintext HTTP and `CONNECT` requests.
pub struct ForwardProxy {
    listener: TcpListener,
    patterns: Arc<DomainPatternSet>,
    bridge: Arc<BridgeListener>,
}

impl ForwardProxy {
    pub async fn bind(
        addr: SocketAddr,
        patterns: Arc<DomainPatternSet>,
        bridge: Arc<BridgeListener>,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("forward proxy listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            patterns,
            bridge,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accepts clients forever. Accept errors are logged and retried.
    pub async fn run(self) {
        let listener = &self.listener;
        loop {
            let (stream, peer_addr) = accept_retrying(move || listener.accept()).await;
            debug!("accepted proxy client {}", peer_addr);

            let patterns = Arc::clone(&self.patterns);
            let bridge = Arc::clone(&self.bridge);
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, &patterns, &bridge).await {
                    error!("proxy client {}: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Serves one proxy client from request line to end of relay.
pub async fn handle_client<S>(
    mut client: S,
    patterns: &DomainPatternSet,
    bridge: &BridgeListener,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; INITIAL_READ];
    let n = client.read(&mut buf).await?;
    buf.truncate(n);

    let target = parse_request_line(&buf)?;

    if patterns.matches(&target.host) {
        info!("intercepting {}", target.address());
        let mut upstream = bridge.connect().await?;
        relay(&mut client, &mut upstream, &target, &buf).await
    } else {
        debug!("direct {}", target.address());
        let mut upstream = TcpStream::connect(target.address()).await?;
        relay(&mut client, &mut upstream, &target, &buf).await
    }
}

async fn relay<C, U>(
    client: &mut C,
    upstream: &mut U,
    target: &ProxyTarget,
    head: &[u8],
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    if target.tunnel {
        client.write_all(CONNECT_ESTABLISHED).await?;
        // Anything pipelined after the CONNECT header belongs to the tunnel.
        if let Some(end) = find_header_end(head)
            && end < head.len()
        {
            upstream.write_all(&head[end..]).await?;
        }
    } else {
        upstream.write_all(head).await?;
    }

    Tunnel::run(client, upstream).await?;
    Ok(())
}

fn find_header_end(head: &[u8]) -> Option<usize> {
    head.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

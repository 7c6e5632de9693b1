//! The two proxy faces: the plaintext forward-proxy ingress and the
//! TLS-terminating reverse proxy behind it.

mod ingress;
mod terminator;
mod tls;
mod tunnel;

pub use ingress::{ForwardProxy, ProxyTarget, handle_client, parse_request_line};
pub use terminator::{GatewayErrorPage, ProxyBody, TlsTerminator, UpstreamErrorHandler};
pub use tls::TlsAcceptor;
pub use tunnel::{Tunnel, TunnelError};

use std::future::Future;
use std::io;
use std::time::Duration;

use tracing::{debug, warn};

use crate::bridge::BridgeError;
use crate::resolver::ResolveError;

/// Pause after an accept error that is not tied to a single connection.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    Parse(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] std::io::Error),
    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] rustls::Error),
    #[error("resolution failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error("upstream error: {0}")]
    Upstream(#[source] hyper::Error),
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
    #[error("HTTP error: {0}")]
    Http(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Runs `accept` until it yields a connection.
///
/// Errors that belong to one pending connection are retried at once. Anything
/// else (typically running out of file descriptors) is logged and retried
/// after [`ACCEPT_BACKOFF`], so a listener never stops on its own.
pub(crate) async fn accept_retrying<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) if is_connection_error(&e) => debug!("accept failed: {}", e),
            Err(e) => {
                warn!("accept failed: {}, retrying in {:?}", e, ACCEPT_BACKOFF);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

//! TLS-terminating reverse proxy.
//!
//! Decrypts intercepted connections with a forged leaf certificate, then
//! replays each request to the real origin over a fresh, anonymised TLS
//! connection.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::{ProxyError, accept_retrying};
use super::tls::TlsAcceptor;
use super::tunnel::Tunnel;
use crate::bridge::BridgeListener;
use crate::ca::CertificateSelector;
use crate::resolver::OriginResolver;

/// Response body type produced by the terminator.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "http2-settings",
];

/// Turns a failed upstream exchange into the response the client sees.
pub trait UpstreamErrorHandler: Send + Sync {
    fn on_upstream_error(&self, host: &str, uri: &Uri, error: &ProxyError) -> Response<ProxyBody>;
}

/// Default handler: logs the failure and answers with a short text page,
/// `504` when the origin could not be resolved and `502` otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayErrorPage;

impl UpstreamErrorHandler for GatewayErrorPage {
    fn on_upstream_error(&self, host: &str, uri: &Uri, error: &ProxyError) -> Response<ProxyBody> {
        error!("upstream {} ({}): {}", host, uri, error);
        let status = match error {
            ProxyError::Resolve(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        text_response(status, format!("{status}: {error}\n"))
    }
}

fn text_response(status: StatusCode, text: String) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(text))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Reverse proxy serving intercepted TLS connections.
#[derive(Clone)]
pub struct TlsTerminator {
    acceptor: TlsAcceptor,
    origins: Arc<dyn OriginResolver>,
    tunnel: Arc<Tunnel>,
    errors: Arc<dyn UpstreamErrorHandler>,
}

impl std::fmt::Debug for TlsTerminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTerminator").finish_non_exhaustive()
    }
}

impl TlsTerminator {
    pub fn new(
        selector: Arc<dyn CertificateSelector>,
        origins: Arc<dyn OriginResolver>,
        tunnel: Tunnel,
    ) -> Result<Self, ProxyError> {
        Ok(Self {
            acceptor: TlsAcceptor::new(selector)?,
            origins,
            tunnel: Arc::new(tunnel),
            errors: Arc::new(GatewayErrorPage),
        })
    }

    /// Replaces the default [`GatewayErrorPage`].
    pub fn with_error_handler(mut self, errors: Arc<dyn UpstreamErrorHandler>) -> Self {
        self.errors = errors;
        self
    }

    /// Serves connections handed over by the forward proxy until the bridge
    /// is closed.
    pub async fn serve_bridge(&self, bridge: Arc<BridgeListener>) {
        info!("TLS terminator serving bridged connections");
        while let Some((stream, peer_addr)) = bridge.accept().await {
            self.spawn_connection(stream, peer_addr);
        }
        info!("bridge closed, TLS terminator stopped");
    }

    /// Serves connections from a network listener. Accept errors are
    /// logged and retried, so this only returns if the address is unknown.
    pub async fn serve_tcp(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("TLS terminator listening on {}", listener.local_addr()?);
        let listener = &listener;
        loop {
            let (stream, peer_addr) = accept_retrying(move || listener.accept()).await;
            self.spawn_connection(stream, peer_addr);
        }
    }

    fn spawn_connection<IO>(&self, stream: IO, peer_addr: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!("accepted connection from {}", peer_addr);
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.handle_connection(stream).await {
                warn!("connection from {}: {}", peer_addr, e);
            }
        });
    }

    /// Terminates TLS on `stream` and serves HTTP/1.1 or HTTP/2 over it.
    pub async fn handle_connection<IO>(&self, stream: IO) -> Result<(), ProxyError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tls_stream, sni) = self
            .acceptor
            .accept(stream)
            .await
            .map_err(ProxyError::TlsHandshake)?;
        debug!("serving {:?}", sni);

        let this = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let this = this.clone();
            async move { Ok::<_, Infallible>(this.handle_request(req).await) }
        });

        let mut builder = ServerBuilder::new(TokioExecutor::new());
        builder.http1().keep_alive(false);
        builder
            .serve_connection(TokioIo::new(tls_stream), service)
            .await
            .map_err(ProxyError::Http)
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(authority) = request_authority(&req) else {
            warn!("request without host: {} {}", req.method(), req.uri());
            return text_response(StatusCode::BAD_REQUEST, "missing Host\n".to_string());
        };

        let path = req
            .uri()
            .path_and_query()
            .map(PathAndQuery::as_str)
            .unwrap_or("/");
        let target = Uri::builder()
            .scheme("https")
            .authority(authority.clone())
            .path_and_query(path)
            .build()
            .unwrap_or_else(|_| req.uri().clone());

        info!("{} {}", req.method(), target);

        match self.forward(req, &authority).await {
            Ok(response) => response,
            Err(e) => self.errors.on_upstream_error(authority.host(), &target, &e),
        }
    }

    async fn forward(&self, req: Request<Incoming>, authority: &Authority) -> Result<Response<ProxyBody>, ProxyError> {
        let stream = self.origins.connect(authority.host()).await?;
        let tls_stream = self.tunnel.connect_upstream(stream).await?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls_stream))
            .await
            .map_err(ProxyError::Upstream)?;
        let host = authority.host().to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("upstream connection to {} ended: {}", host, e);
            }
        });

        let req = rewrite_request(req, authority)?;
        let response = sender.send_request(req).await.map_err(ProxyError::Upstream)?;
        debug!("upstream {} answered {}", authority, response.status());

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Target authority from the `Host` header, or the URI for HTTP/2.
fn request_authority<B>(req: &Request<B>) -> Option<Authority> {
    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .or_else(|| req.uri().authority().cloned())
}

/// Prepares a client request for a one-shot HTTP/1.1 origin connection.
fn rewrite_request<B>(req: Request<B>, authority: &Authority) -> Result<Request<B>, ProxyError> {
    let (mut parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::from(path);
    parts.version = Version::HTTP_11;

    strip_hop_by_hop(&mut parts.headers);
    let host = HeaderValue::from_str(authority.as_str()).map_err(|e| ProxyError::Http(Box::new(e)))?;
    parts.headers.insert(header::HOST, host);
    parts
        .headers
        .insert(header::CONNECTION, HeaderValue::from_static("close"));

    Ok(Request::from_parts(parts, body))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers listed in Connection are hop-by-hop too.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

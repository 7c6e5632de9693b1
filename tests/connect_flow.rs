//! End-to-end flows through the forward proxy, the bridge and the TLS
//! terminator against a local TLS origin.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use pixivchan::ca::{CertStore, CertificateAuthority};
use pixivchan::config::SiteConfig;
use pixivchan::proxy::{ForwardProxy, TlsTerminator, Tunnel};
use pixivchan::{BridgeListener, DomainPatternSet, OriginResolver, ResolveError};
use rustls::crypto::ring;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Resolves every host to one fixed address and records what was asked.
struct FixedOrigin {
    addr: Option<SocketAddr>,
    asked: Mutex<Vec<String>>,
}

impl FixedOrigin {
    fn new(addr: Option<SocketAddr>) -> Self {
        Self {
            addr,
            asked: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OriginResolver for FixedOrigin {
    async fn connect(&self, host: &str) -> Result<TcpStream, ResolveError> {
        self.asked.lock().unwrap().push(host.to_string());
        let addr = self.addr.ok_or_else(|| ResolveError::NotFound(host.to_string()))?;
        TcpStream::connect(addr)
            .await
            .map_err(|_| ResolveError::NotFound(host.to_string()))
    }
}

fn sites() -> Vec<SiteConfig> {
    vec![SiteConfig {
        name: "pixiv.net".to_string(),
        domains: vec!["pixiv.net".to_string(), "*.pixiv.net".to_string()],
    }]
}

/// Starts an HTTPS origin answering `<host> <path>` for every request.
///
/// Its certificate is issued for a name the proxy never sends, so the
/// exchange only works because the outbound side skips verification.
async fn spawn_origin(dir: &Path, ca: &CertificateAuthority) -> SocketAddr {
    ca.issue_leaf(dir, "origin", &["origin.invalid".to_string()])
        .unwrap();
    let chain = CertificateDer::pem_file_iter(dir.join("origin.cer"))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = PrivateKeyDer::from_pem_file(dir.join("origin.key")).unwrap();

    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let service = service_fn(|req: Request<Incoming>| async move {
                    let host = req
                        .headers()
                        .get(http::header::HOST)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let body = format!("{} {}", host, req.uri());
                    Ok::<_, hyper::Error>(hyper::Response::new(Full::new(Bytes::from(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });
    addr
}

fn client_config(ca: &CertificateAuthority) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(ca.cert_der().clone()).unwrap();
    let mut config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Sends `GET <path>` with `Host: <host>` over an established TLS stream.
async fn get<S>(stream: S, host: &str, path: &str) -> (StatusCode, String)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .uri(path)
        .header(http::header::HOST, host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

/// Tests the full proxy-mode path: CONNECT to an intercepted host, TLS
/// handshake against the forged leaf, and a request relayed to the origin.
#[tokio::test]
async fn connect_is_intercepted_and_relayed() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::ensure(dir.path()).unwrap();
    let store = CertStore::build(&ca, dir.path(), &sites()).unwrap();
    let origin_addr = spawn_origin(dir.path(), &ca).await;
    let origins = Arc::new(FixedOrigin::new(Some(origin_addr)));

    let resolver: Arc<dyn OriginResolver> = origins.clone();
    let terminator = TlsTerminator::new(Arc::new(store), resolver, Tunnel::new(None).unwrap()).unwrap();
    let bridge = Arc::new(BridgeListener::new(8));
    {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { terminator.serve_bridge(bridge).await });
    }

    let patterns = Arc::new(DomainPatternSet::new(["pixiv.net", "*.pixiv.net"]));
    let proxy = ForwardProxy::bind("127.0.0.1:0".parse().unwrap(), patterns, Arc::clone(&bridge))
        .await
        .unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    tokio::spawn(proxy.run());

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"CONNECT www.pixiv.net:443 HTTP/1.1\r\nHost: www.pixiv.net:443\r\n\r\n")
        .await
        .unwrap();
    let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, CONNECT_ESTABLISHED);

    let connector = TlsConnector::from(client_config(&ca));
    let tls = connector
        .connect(ServerName::try_from("www.pixiv.net").unwrap(), client)
        .await
        .expect("forged leaf should chain to the local CA");

    let (status, body) = get(tls, "www.pixiv.net", "/ajax/user?lang=ja").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "www.pixiv.net /ajax/user?lang=ja");
    assert_eq!(*origins.asked.lock().unwrap(), vec!["www.pixiv.net".to_string()]);

    bridge.close();
}

/// A server name outside every site group aborts the handshake.
#[tokio::test]
async fn unknown_sni_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::ensure(dir.path()).unwrap();
    let store = CertStore::build(&ca, dir.path(), &sites()).unwrap();
    let terminator = TlsTerminator::new(
        Arc::new(store),
        Arc::new(FixedOrigin::new(None)),
        Tunnel::new(None).unwrap(),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { terminator.serve_tcp(listener).await });

    let stream = TcpStream::connect(addr).await.unwrap();
    let connector = TlsConnector::from(client_config(&ca));
    let result = connector
        .connect(ServerName::try_from("evil.com").unwrap(), stream)
        .await;
    assert!(result.is_err());
}

/// Tests standalone serving with an origin that cannot be resolved: the
/// client gets a gateway timeout page instead of a dropped connection.
#[tokio::test]
async fn unresolvable_origin_gets_gateway_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::ensure(dir.path()).unwrap();
    let store = CertStore::build(&ca, dir.path(), &sites()).unwrap();
    let terminator = TlsTerminator::new(
        Arc::new(store),
        Arc::new(FixedOrigin::new(None)),
        Tunnel::new(None).unwrap(),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { terminator.serve_tcp(listener).await });

    let stream = TcpStream::connect(addr).await.unwrap();
    let connector = TlsConnector::from(client_config(&ca));
    let tls = connector
        .connect(ServerName::try_from("pixiv.net").unwrap(), stream)
        .await
        .unwrap();

    let (status, body) = get(tls, "pixiv.net", "/").await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(body.contains("pixiv.net"));
}

//! TLS termination and certificate resolution.

use std::sync::Arc;

use rustls::ServerConfig;
use rustls::crypto::ring;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tracing::{debug, warn};

use crate::ca::CertificateSelector;

/// TLS acceptor that performs TLS handshake with SNI-based certificate selection.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Creates a new TLS acceptor presenting certificates chosen by `selector`.
    pub fn new(selector: Arc<dyn CertificateSelector>) -> Result<Self, rustls::Error> {
        let config = Self::create_config(selector)?;
        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(config),
        })
    }

    /// Creates a rustls ServerConfig with SNI-based certificate resolution.
    fn create_config(selector: Arc<dyn CertificateSelector>) -> Result<Arc<ServerConfig>, rustls::Error> {
        let resolver = Arc::new(CertResolver { selector });
        let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    /// Accepts a TLS connection, performing the handshake.
    /// Returns the TLS stream and the SNI (if provided by client).
    pub async fn accept<IO>(&self, stream: IO) -> Result<(TlsStream<IO>, Option<String>), std::io::Error>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let tls_stream = self.inner.accept(stream).await?;

        let sni = tls_stream.get_ref().1.server_name().map(|s| s.to_string());

        debug!("TLS handshake completed, SNI: {:?}", sni);

        Ok((tls_stream, sni))
    }
}

/// Adapts a [`CertificateSelector`] to rustls.
///
/// Returning `None` makes rustls abort the handshake, which is how an
/// unknown server name reaches the client.
struct CertResolver {
    selector: Arc<dyn CertificateSelector>,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver").finish_non_exhaustive()
    }
}

impl rustls::server::ResolvesServerCert for CertResolver {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        let Some(sni) = client_hello.server_name() else {
            warn!("client sent no SNI, cannot select a certificate");
            return None;
        };
        debug!("resolving certificate for SNI: {}", sni);
        match self.selector.select_certificate(sni) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }
}

//! Outbound TLS to origins and bidirectional relaying.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Dials origins with an anonymised TLS handshake and relays streams.
///
/// The handshake either omits SNI entirely or sends a fixed placeholder
/// name, and the origin's certificate is not verified, since it is issued
/// for the real name the handshake deliberately hides.
pub struct Tunnel {
    client_config: Arc<ClientConfig>,
    server_name: Option<ServerName<'static>>,
}

impl Tunnel {
    /// Creates a tunnel. `server_name` is the placeholder sent as SNI;
    /// `None` sends no SNI at all.
    pub fn new(server_name: Option<&str>) -> Result<Self, TunnelError> {
        let provider = Arc::new(ring::default_provider());
        let verifier = Arc::new(AcceptAnyCert {
            provider: Arc::clone(&provider),
        });

        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(TunnelError::Config)?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        config.enable_sni = server_name.is_some();

        let server_name = server_name
            .map(|name| {
                ServerName::try_from(name.to_string())
                    .map_err(|_| TunnelError::InvalidSni(name.to_string()))
            })
            .transpose()?;

        Ok(Self {
            client_config: Arc::new(config),
            server_name,
        })
    }

    /// Performs the client handshake over an already connected origin stream.
    pub async fn connect_upstream(
        &self,
        stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TunnelError> {
        let peer = stream.peer_addr().map_err(TunnelError::Io)?;
        // With SNI disabled the name only feeds rustls' session cache.
        let server_name = match &self.server_name {
            Some(name) => name.clone(),
            None => ServerName::IpAddress(peer.ip().into()),
        };

        debug!("TLS handshake with upstream {}", peer);

        let connector = TlsConnector::from(Arc::clone(&self.client_config));
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(TunnelError::TlsHandshake)?;

        debug!("upstream TLS connection established to {}", peer);

        Ok(tls_stream)
    }

    /// Runs a bidirectional tunnel between two streams until both sides close.
    pub async fn run<C, U>(client: &mut C, upstream: &mut U) -> Result<(u64, u64), TunnelError>
    where
        C: AsyncRead + AsyncWrite + Unpin + ?Sized,
        U: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let result = copy_bidirectional(client, upstream)
            .await
            .map_err(TunnelError::Io)?;

        debug!(
            "tunnel closed: {} bytes client->upstream, {} bytes upstream->client",
            result.0, result.1
        );

        Ok(result)
    }
}

/// Certificate verifier that accepts any origin certificate while still
/// checking handshake signatures.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("TLS client configuration error: {0}")]
    Config(#[source] rustls::Error),
    #[error("invalid SNI: {0}")]
    InvalidSni(String),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn hidden_sni_by_default() {
        let tunnel = Tunnel::new(None).unwrap();
        assert!(!tunnel.client_config.enable_sni);
        assert!(tunnel.server_name.is_none());
    }

    #[test]
    fn placeholder_sni() {
        let tunnel = Tunnel::new(Some("placeholder.invalid")).unwrap();
        assert!(tunnel.client_config.enable_sni);
        assert!(matches!(tunnel.server_name, Some(ServerName::DnsName(_))));
    }

    #[test]
    fn rejects_unusable_placeholder() {
        assert!(matches!(Tunnel::new(Some("-")), Err(TunnelError::InvalidSni(_))));
    }

    /// Tests that the relay copies both directions and finishes once both
    /// peers have shut down.
    #[tokio::test]
    async fn run_relays_both_directions() {
        let (mut client, mut client_far) = tokio::io::duplex(1024);
        let (mut upstream, mut upstream_far) = tokio::io::duplex(1024);

        let relay = tokio::spawn(async move { Tunnel::run(&mut client_far, &mut upstream_far).await });

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();
        let mut got = Vec::new();
        upstream.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"request");

        upstream.write_all(b"response").await.unwrap();
        upstream.shutdown().await.unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"response");

        let (up, down) = relay.await.unwrap().unwrap();
        assert_eq!((up, down), (7, 8));
    }
}

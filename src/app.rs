//! Startup wiring for both deployment modes.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::bridge::BridgeListener;
use crate::ca::{CertStore, CertificateAuthority};
use crate::config::{Config, Mode};
use crate::proxy::{ForwardProxy, TlsTerminator, Tunnel};
use crate::resolver::DohResolver;

/// A configured proxy ready to serve.
pub struct App {
    config: Config,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Loads certificate material and builds the TLS terminator.
    pub fn terminator(&self) -> Result<TlsTerminator> {
        let base_dir = &self.config.base_dir;
        std::fs::create_dir_all(base_dir)
            .with_context(|| format!("failed to create {}", base_dir.display()))?;

        let ca = CertificateAuthority::ensure(base_dir).context("failed to load certificate authority")?;
        info!("certificate authority ready in {}", base_dir.display());

        let store = CertStore::build(&ca, base_dir, &self.config.sites).context("failed to issue site certificates")?;
        for leaf in store.leaves() {
            info!("site {}: {}", leaf.name(), leaf.dns_names().join(", "));
        }

        let resolver = DohResolver::from_config(&self.config).context("failed to create DoH client")?;
        let tunnel = Tunnel::new(self.config.upstream.server_name.as_deref())
            .context("invalid upstream server name")?;

        TlsTerminator::new(Arc::new(store), Arc::new(resolver), tunnel).context("failed to configure TLS")
    }

    /// Serves until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let terminator = self.terminator()?;
        match self.config.mode {
            Mode::Proxy => self.run_proxy(terminator).await,
            Mode::Standalone => self.run_standalone(terminator).await,
        }
    }

    async fn run_proxy(&self, terminator: TlsTerminator) -> Result<()> {
        let bridge = Arc::new(BridgeListener::new(self.config.bridge_capacity));
        let patterns = Arc::new(self.config.intercept_patterns());
        let proxy = ForwardProxy::bind(self.config.listen, patterns, Arc::clone(&bridge))
            .await
            .with_context(|| format!("failed to bind forward proxy on {}", self.config.listen))?;

        let serving = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { terminator.serve_bridge(bridge).await })
        };

        let result = tokio::select! {
            () = proxy.run() => Ok(()),
            result = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                result.context("failed to listen for Ctrl-C")
            }
        };

        bridge.close();
        if let Err(e) = serving.await {
            warn!("TLS terminator task failed: {}", e);
        }
        result
    }

    async fn run_standalone(&self, terminator: TlsTerminator) -> Result<()> {
        let listener = TcpListener::bind(self.config.tls_listen)
            .await
            .with_context(|| format!("failed to bind TLS listener on {}", self.config.tls_listen))?;

        tokio::select! {
            result = terminator.serve_tcp(listener) => result.context("TLS listener stopped"),
            result = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                result.context("failed to listen for Ctrl-C")
            }
        }
    }
}

use anyhow::{Context, Result};
use clap::Parser;
use pixivchan::{App, Config, Mode, pac};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Local TLS-intercepting proxy for reaching blocked sites.
///
/// Terminates TLS for configured domains with a locally generated CA and
/// forwards requests to addresses resolved over DNS-over-HTTPS, without
/// revealing the real server name.
#[derive(Parser, Debug)]
#[command(name = "pixivchan")]
#[command(version, about)]
struct Args {
    /// Path to the configuration file (YAML).
    /// If not specified, the built-in site list is used.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Deployment mode, overriding the configuration file.
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Forward proxy listen address (proxy mode).
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// TLS listen address (standalone mode).
    #[arg(long)]
    tls_listen: Option<SocketAddr>,

    /// Directory for CA and site certificates.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Write a proxy auto-config script for the intercepted domains.
    #[arg(long, value_name = "PATH")]
    pac: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(tls_listen) = args.tls_listen {
        config.tls_listen = tls_listen;
    }
    if let Some(base_dir) = args.base_dir {
        config.base_dir = base_dir;
    }
    config.validate().context("invalid configuration")?;

    if let Some(path) = &args.pac {
        pac::write(path, &config.intercept_patterns(), config.listen)
            .with_context(|| format!("failed to write PAC file to {:?}", path))?;
        info!("PAC script written to {:?}", path);
    }

    App::new(config).run().await
}

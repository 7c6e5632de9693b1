//! Local TLS-intercepting proxy that reaches blocked sites through their
//! real addresses.
//!
//! Connections to configured domains are terminated locally with
//! certificates forged by a persisted local CA. Each request is then
//! replayed to the origin's true address, found over DNS-over-HTTPS, on a
//! TLS connection whose SNI is hidden.
//!
//! # Architecture
//!
//! In proxy mode:
//! 1. [`proxy::ForwardProxy`] reads the first request line from a client
//! 2. Hosts in the intercept set go through the in-process
//!    [`bridge::BridgeListener`]; all others are dialed directly
//! 3. [`proxy::TlsTerminator`] accepts the bridged connection, presenting the
//!    leaf chosen by SNI from [`ca::CertStore`]
//! 4. [`resolver::DohResolver`] finds a reachable origin address
//! 5. The request is sent to the origin over [`proxy::Tunnel`]
//!
//! Standalone mode skips steps 1 and 2 and binds the terminator to a socket;
//! clients reach it through hosts-file redirection.
//!
//! # Example
//!
//! ```no_run
//! use pixivchan::{App, Config};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load("pixivchan.yaml")?;
//! App::new(config).run().await?;
//! # Ok(())
//! # }
//! ```

mod app;
pub mod bridge;
pub mod ca;
pub mod config;
pub mod pac;
pub mod pattern;
pub mod proxy;
pub mod resolver;

pub use app::App;
pub use bridge::{BridgeError, BridgeListener};
pub use config::{CachePolicy, Config, ConfigError, Mode};
pub use pattern::{DomainPattern, DomainPatternSet, pattern_matches};
pub use proxy::ProxyError;
pub use resolver::{DohResolver, OriginResolver, ResolveError};

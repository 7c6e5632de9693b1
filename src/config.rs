use std::collections::BTreeMap;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pattern::DomainPatternSet;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where the TLS terminator receives its connections from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Plaintext forward proxy; intercepted hosts are bridged in-process.
    #[default]
    Proxy,
    /// TLS terminator bound to a real socket (hosts-file redirection).
    Standalone,
}

/// A group of domains served by a single leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    /// File stem for `<name>.cer` / `<name>.key`, also the certificate CN.
    pub name: String,
    /// Patterns placed in the certificate SAN list and used for interception.
    pub domains: Vec<String>,
}

/// Expiry policy for resolved addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Entries live until a dial to them fails.
    #[default]
    Never,
    /// Entries expire after the TTL of the accepted answer record.
    HonorTtl,
    /// Entries expire after a fixed number of seconds.
    Fixed { seconds: u64 },
}

/// DNS-over-HTTPS settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DohConfig {
    /// JSON DoH endpoints, queried in order.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    /// Per-endpoint request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub cache: CachePolicy,
}

impl DohConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            timeout_secs: default_timeout_secs(),
            cache: CachePolicy::default(),
        }
    }
}

/// Outbound TLS settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Server name sent to origins. When unset no SNI extension is sent.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Top-level configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub mode: Mode,

    /// Forward proxy listen address (proxy mode).
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// TLS listen address (standalone mode).
    #[serde(default = "default_tls_listen")]
    pub tls_listen: SocketAddr,

    /// Directory holding CA and leaf certificate material.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Maximum number of bridged connections waiting for the TLS terminator.
    #[serde(default = "default_bridge_capacity")]
    pub bridge_capacity: usize,

    #[serde(default = "default_sites")]
    pub sites: Vec<SiteConfig>,

    #[serde(default)]
    pub doh: DohConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Static host to address overrides, seeded into the resolution cache.
    #[serde(default = "default_hosts")]
    pub hosts: BTreeMap<String, Ipv4Addr>,
}

/// The only config file format understood so far.
const CONFIG_VERSION: u32 = 1;

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_tls_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 443))
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_bridge_capacity() -> usize {
    100
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_endpoints() -> Vec<String> {
    [
        "https://dns.artikel10.org/dns-query",
        "https://dns.digitalsize.net/dns-query",
        "https://dns1.dnscrypt.ca:453/dns-query",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn site(name: &str, domains: &[&str]) -> SiteConfig {
    SiteConfig {
        name: name.to_string(),
        domains: domains.iter().map(|d| d.to_string()).collect(),
    }
}

fn default_sites() -> Vec<SiteConfig> {
    vec![
        site("pixiv.net", &["pixiv.net", "*.pixiv.net", "*.secure.pixiv.net"]),
        site("pximg.net", &["pximg.net", "*.pximg.net"]),
        site("pixiv.org", &["pixiv.org", "*.pixiv.org"]),
        site(
            "github.com",
            &[
                "github.com",
                "*.github.com",
                "githubusercontent.com",
                "*.githubusercontent.com",
                "githubassets.com",
                "*.githubassets.com",
            ],
        ),
    ]
}

fn default_hosts() -> BTreeMap<String, Ipv4Addr> {
    BTreeMap::from([(
        "accounts.pixiv.net".to_string(),
        Ipv4Addr::new(210, 140, 92, 187),
    )])
}

impl Config {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Every pattern of every site, in site order.
    pub fn intercept_patterns(&self) -> DomainPatternSet {
        self.sites
            .iter()
            .flat_map(|site| site.domains.iter().cloned())
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {} (expected {})",
                self.version, CONFIG_VERSION
            )));
        }
        if self.sites.is_empty() {
            return Err(ConfigError::Invalid("no sites configured".to_string()));
        }

        let mut seen = Vec::with_capacity(self.sites.len());
        for site in &self.sites {
            if site.name.is_empty()
                || site.name.contains(['/', '\\'])
                || site.name.chars().any(char::is_whitespace)
            {
                return Err(ConfigError::Invalid(format!(
                    "invalid site name: {:?}",
                    site.name
                )));
            }
            if seen.contains(&site.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate site name: {}",
                    site.name
                )));
            }
            seen.push(site.name.as_str());

            if site.domains.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "site {} has no domains",
                    site.name
                )));
            }
            for pattern in &site.domains {
                if pattern.is_empty()
                    || pattern.chars().any(char::is_whitespace)
                    || pattern.split('.').any(str::is_empty)
                {
                    return Err(ConfigError::Invalid(format!(
                        "invalid domain pattern: {pattern:?}"
                    )));
                }
            }
        }

        if self.doh.endpoints.is_empty() {
            return Err(ConfigError::Invalid("no DoH endpoints".to_string()));
        }
        for endpoint in &self.doh.endpoints {
            if !endpoint.starts_with("https://") && !endpoint.starts_with("http://") {
                return Err(ConfigError::Invalid(format!(
                    "DoH endpoint must be an http(s) URL: {endpoint}"
                )));
            }
        }
        if self.doh.timeout_secs == 0 {
            return Err(ConfigError::Invalid("DoH timeout must be non-zero".to_string()));
        }

        if self.bridge_capacity == 0 {
            return Err(ConfigError::Invalid("bridge capacity must be non-zero".to_string()));
        }

        if let Some(name) = &self.upstream.server_name
            && rustls::pki_types::ServerName::try_from(name.as_str()).is_err()
        {
            return Err(ConfigError::Invalid(format!(
                "invalid upstream server name: {name}"
            )));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            mode: Mode::default(),
            listen: default_listen(),
            tls_listen: default_tls_listen(),
            base_dir: default_base_dir(),
            bridge_capacity: default_bridge_capacity(),
            sites: default_sites(),
            doh: DohConfig::default(),
            upstream: UpstreamConfig::default(),
            hosts: default_hosts(),
        }
    }
}

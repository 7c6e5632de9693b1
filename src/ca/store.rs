//! SNI-based selection among issued leaf certificates.

use std::path::Path;
use std::sync::Arc;

use rustls::sign::CertifiedKey;
use tracing::debug;

use super::authority::{CertificateAuthority, LeafCertificate};
use super::CaResult;
use crate::config::SiteConfig;
use crate::pattern::pattern_matches;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no certificate matches server name {0:?}")]
pub struct CertNotFound(pub String);

/// Picks the certificate to present for a requested server name.
pub trait CertificateSelector: Send + Sync {
    fn select_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CertNotFound>;
}

/// Leaf certificates in issuance order.
///
/// Built once at startup and never mutated, so concurrent handshakes read it
/// without locking.
#[derive(Debug, Clone, Default)]
pub struct CertStore {
    leaves: Vec<LeafCertificate>,
}

impl CertStore {
    pub fn new(leaves: Vec<LeafCertificate>) -> Self {
        Self { leaves }
    }

    /// Issues (or loads) one leaf per site group, in configuration order.
    pub fn build(ca: &CertificateAuthority, dir: &Path, sites: &[SiteConfig]) -> CaResult<Self> {
        let leaves = sites
            .iter()
            .map(|site| ca.issue_leaf(dir, &site.name, &site.domains))
            .collect::<CaResult<Vec<_>>>()?;
        Ok(Self::new(leaves))
    }

    /// Returns the first leaf with a SAN pattern matching `server_name`.
    pub fn find(&self, server_name: &str) -> Option<&LeafCertificate> {
        self.leaves.iter().find(|leaf| {
            leaf.dns_names()
                .iter()
                .any(|pattern| pattern_matches(pattern, server_name))
        })
    }

    pub fn leaves(&self) -> &[LeafCertificate] {
        &self.leaves
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

impl CertificateSelector for CertStore {
    fn select_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CertNotFound> {
        match self.find(server_name) {
            Some(leaf) => {
                debug!("selected certificate {} for {}", leaf.name(), server_name);
                Ok(Arc::clone(leaf.certified_key()))
            }
            None => Err(CertNotFound(server_name.to_string())),
        }
    }
}

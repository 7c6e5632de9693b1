//! Certificate authority management for TLS termination.
//!
//! This module provides the persisted local CA, per-site leaf issuance and
//! SNI-based certificate selection.

mod authority;
mod storage;
mod store;

use std::path::PathBuf;

pub use authority::{CertificateAuthority, LeafCertificate};
pub use store::{CertNotFound, CertStore, CertificateSelector};

/// The result type for CA operations.
pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed certificate material in {}: {reason}", .path.display())]
    Format { path: PathBuf, reason: String },
    #[error("failed to generate certificate: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),
}

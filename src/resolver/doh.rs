//! JSON DoH (DNS over HTTPS) queries and answer validation.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use http::header::ACCEPT;
use serde::Deserialize;
use tracing::debug;

/// Content type for JSON DNS answers.
const DNS_JSON_CONTENT_TYPE: &str = "application/dns-json";

#[derive(Debug, thiserror::Error)]
pub enum DohError {
    #[error("DoH request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("DoH server answered with DNS status {0}")]
    Status(u32),
}

/// A JSON DoH answer as returned by `?name=<host>&type=A` endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DohAnswer {
    #[serde(rename = "Status", default)]
    pub status: u32,
    #[serde(rename = "TC", default)]
    pub truncated: bool,
    #[serde(rename = "RD", default)]
    pub recursion_desired: bool,
    #[serde(rename = "RA", default)]
    pub recursion_available: bool,
    #[serde(rename = "AD", default)]
    pub authenticated_data: bool,
    #[serde(rename = "CD", default)]
    pub checking_disabled: bool,
    #[serde(rename = "Question", default)]
    pub question: Vec<DohQuestion>,
    #[serde(rename = "Answer", default)]
    pub answer: Vec<DohRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DohQuestion {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub qtype: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DohRecord {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub rtype: u16,
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
    #[serde(default)]
    pub data: String,
}

impl DohRecord {
    /// Parses `data` as a usable IPv4 address.
    ///
    /// Rejects anything that is not a dotted-quad literal, loopback
    /// addresses (a common poisoning answer) and `0.0.0.0`.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        let addr: Ipv4Addr = self.data.parse().ok()?;
        if addr.is_loopback() || addr.is_unspecified() {
            return None;
        }
        Some(addr)
    }
}

impl DohAnswer {
    /// Accepted candidate addresses with their TTL, in answer order.
    pub fn candidates(&self) -> impl Iterator<Item = (Ipv4Addr, u32)> + '_ {
        self.answer
            .iter()
            .filter_map(|record| record.ipv4().map(|addr| (addr, record.ttl)))
    }
}

/// Transport for DoH lookups.
#[async_trait]
pub trait DohClient: Send + Sync {
    /// Queries `endpoint` for the A records of `host`.
    async fn query(&self, endpoint: &str, host: &str) -> Result<DohAnswer, DohError>;
}

/// DoH client over HTTPS using reqwest.
#[derive(Debug, Clone)]
pub struct HttpsDohClient {
    client: reqwest::Client,
}

impl HttpsDohClient {
    /// Creates a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, DohError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DohClient for HttpsDohClient {
    async fn query(&self, endpoint: &str, host: &str) -> Result<DohAnswer, DohError> {
        debug!("querying {} for {}", endpoint, host);

        let answer: DohAnswer = self
            .client
            .get(endpoint)
            .query(&[("name", host), ("type", "A")])
            .header(ACCEPT, DNS_JSON_CONTENT_TYPE)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if answer.status != 0 {
            return Err(DohError::Status(answer.status));
        }
        Ok(answer)
    }
}

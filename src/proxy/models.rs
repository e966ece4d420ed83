//! Proxy data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Longest host string accepted from a listing page
const MAX_IP_LEN: usize = 64;

/// Protocol a proxy can be validated for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    /// Protocols in the order they are probed
    pub const ALL: [Protocol; 2] = [Protocol::Http, Protocol::Https];
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// A proxy discovered on a listing page, identified by `sha`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyCandidate {
    pub ip: String,
    pub port: u16,
    pub sha: String,
}

impl ProxyCandidate {
    /// Create a candidate, computing its identity hash
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        let ip = ip.into();
        let sha = candidate_sha(&ip, port);
        Self { ip, port, sha }
    }

    /// Create a candidate only if `ip` and `port` look plausible
    pub fn checked(ip: &str, port: u16) -> Option<Self> {
        let ip = ip.trim();
        if ip.is_empty() || ip.len() > MAX_IP_LEN || port == 0 {
            return None;
        }
        Some(Self::new(ip, port))
    }

    /// Parse the `IP:PORT` form
    pub fn parse(s: &str) -> Option<Self> {
        let (ip, port) = s.trim().rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        Self::checked(ip, port)
    }

    /// The candidate as a plain HTTP proxy URL
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    /// Get the candidate in IP:PORT format
    pub fn to_simple_string(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl PartialEq for ProxyCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.sha == other.sha
    }
}

impl Eq for ProxyCandidate {}

impl Hash for ProxyCandidate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sha.hash(state);
    }
}

impl fmt::Display for ProxyCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_simple_string())
    }
}

/// Stable identity hash of `ip:port`
pub fn candidate_sha(ip: &str, port: u16) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", ip, port).as_bytes());
    hex::encode(hasher.finalize())
}

/// Anonymity level derived from a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anonymity {
    /// At least one protocol works and never leaked our address
    Elite,
    /// Answered, but either leaked our address or only partially responded
    Transparent,
    /// Never produced a usable response on either protocol
    Disabled,
}

/// Outcome of validating one candidate
///
/// `bad_http`/`bad_https` are `None` when the protocol was never decided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyVerdict {
    pub sha: String,
    pub bad_proxy: bool,
    pub bad_http: Option<bool>,
    pub bad_https: Option<bool>,
    pub protocols: BTreeSet<Protocol>,
    pub avg_resp_seconds: Option<f64>,
    pub noresp_http: Option<u32>,
    pub noresp_https: Option<u32>,
    pub checked_at: DateTime<Utc>,
}

impl ProxyVerdict {
    /// Whether the proxy was confirmed usable for `protocol`
    pub fn supports(&self, protocol: Protocol) -> bool {
        self.protocols.contains(&protocol)
    }

    /// Not a bad proxy and confirmed working for at least one protocol
    pub fn is_usable(&self) -> bool {
        !self.bad_proxy && !self.protocols.is_empty()
    }

    pub fn anonymity(&self) -> Anonymity {
        // a protocol never tried counts as unresponsive
        let silent = |bad: Option<bool>, noresp: Option<u32>| bad.is_none() || noresp.is_some();
        if self.is_usable() {
            Anonymity::Elite
        } else if silent(self.bad_http, self.noresp_http)
            && silent(self.bad_https, self.noresp_https)
        {
            Anonymity::Disabled
        } else {
            Anonymity::Transparent
        }
    }
}

/// `bad_proxy` is set when both protocols failed or neither was decided
pub fn derive_bad_proxy(bad_http: Option<bool>, bad_https: Option<bool>) -> bool {
    matches!(
        (bad_http, bad_https),
        (Some(true), Some(true)) | (None, None)
    )
}

//! Core data model shared across every pipeline stage: candidates awaiting
//! validation, validation outcomes, and the atomically-published snapshot
//! that backs the API.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three proxy protocols this system understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Socks4,
    Socks5,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        }
    }

    pub fn parse(s: &str) -> Option<Protocol> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "https" => Some(Protocol::Http),
            "socks4" => Some(Protocol::Socks4),
            "socks5" => Some(Protocol::Socks5),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a candidate/alive-proxy was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Scraped,
    Zmap,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Scraped => "scraped",
            Source::Zmap => "zmap",
        }
    }
}

/// A prospective proxy awaiting validation. Identity is `(address, protocol)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub address: String,
    pub protocol: Protocol,
}

impl Candidate {
    pub fn new(address: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            address: address.into(),
            protocol,
        }
    }

    pub fn key(&self) -> (String, Protocol) {
        (self.address.to_ascii_lowercase(), self.protocol)
    }
}

/// The outcome of one validation attempt.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub address: String,
    pub protocol: Protocol,
    pub alive: bool,
    pub latency_ms: u64,
    pub error: String,
}

impl CheckResult {
    pub fn alive(address: String, protocol: Protocol, latency_ms: u64) -> Self {
        Self {
            address,
            protocol,
            alive: true,
            latency_ms,
            error: String::new(),
        }
    }

    pub fn dead(address: String, protocol: Protocol, error: impl Into<String>) -> Self {
        Self {
            address,
            protocol,
            alive: false,
            latency_ms: 0,
            error: error.into(),
        }
    }
}

/// An entry in the current snapshot: a proxy confirmed alive on its most
/// recent validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliveProxy {
    pub address: String,
    pub protocol: Protocol,
    pub latency_ms: u64,
    pub last_check: DateTime<Utc>,
    pub source: Source,
}

/// Per-source discovery counters, keyed by source URL in `Stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStat {
    pub url: String,
    pub proxies_found: u64,
    pub error: String,
}

/// Aggregate summary for the most recently completed cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub total_scraped: u64,
    pub total_alive: u64,
    pub total_dead: u64,
    pub alive_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<DateTime<Utc>>,
    pub sources: std::collections::HashMap<String, SourceStat>,
}

/// The atomically-published view of the current alive set.
///
/// Invariants (enforced by `Snapshot::new`, never by mutation in place):
/// - no duplicate `(address, protocol)` pair in `proxies`
/// - every `AliveProxy.last_check <= updated`
/// - `stats.total_alive == proxies.len()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub proxies: Vec<AliveProxy>,
    pub stats: Stats,
    pub updated: DateTime<Utc>,
}

impl Snapshot {
    /// Builds a well-formed snapshot, deduplicating by `(address, protocol)`
    /// (last write wins) and clamping `last_check` to `updated` so the
    /// invariants in `spec.md` §3/§8 hold unconditionally.
    pub fn new(mut proxies: Vec<AliveProxy>, mut stats: Stats, updated: DateTime<Utc>) -> Self {
        let mut seen = std::collections::HashSet::with_capacity(proxies.len());
        proxies.retain(|p| seen.insert((p.address.to_ascii_lowercase(), p.protocol)));
        for p in &mut proxies {
            if p.last_check > updated {
                p.last_check = updated;
            }
        }
        stats.total_alive = proxies.len() as u64;
        Self {
            proxies,
            stats,
            updated,
        }
    }

    /// The empty, well-formed snapshot returned before the first `Update`.
    pub fn empty() -> Self {
        Self {
            proxies: Vec::new(),
            stats: Stats::default(),
            updated: Utc::now(),
        }
    }
}

/// A configured candidate source, bound at startup (not mutated at runtime).
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDescriptor {
    pub url: String,
    #[serde(default = "default_protocol_auto")]
    pub protocol: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_protocol_auto() -> String {
    "auto".to_string()
}

fn default_true() -> bool {
    true
}

impl SourceDescriptor {
    pub fn default_protocol(&self) -> Option<Protocol> {
        if self.protocol.eq_ignore_ascii_case("auto") {
            None
        } else {
            Protocol::parse(&self.protocol)
        }
    }
}

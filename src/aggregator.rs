//! Fetches remote proxy lists concurrently, parses lines into candidates,
//! and deduplicates them. `spec.md` §4.1.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::warn;

use crate::types::{Candidate, Protocol, SourceDescriptor, SourceStat};

/// Hard ceiling on a fetched source body, per §4.1.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// `[scheme://]a.b.c.d:port`, scheme optional, per §4.1 "Parse".
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:(http|https|socks4|socks5)://)?(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})",
    )
    .expect("static regex is valid")
});

pub struct AggregatorOutput {
    pub candidates: Vec<Candidate>,
    pub sources: std::collections::HashMap<String, SourceStat>,
}

/// Runs the Aggregator contract (`spec.md` §4.1) over the enabled sources.
pub async fn aggregate(
    client: &reqwest::Client,
    sources: &[SourceDescriptor],
    user_agent: &str,
) -> AggregatorOutput {
    let enabled: Vec<&SourceDescriptor> = sources.iter().filter(|s| s.enabled).collect();

    let fetches = enabled.iter().map(|src| fetch_one(client, src, user_agent));
    let results = futures::future::join_all(fetches).await;

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    let mut source_stats = std::collections::HashMap::new();

    for (src, outcome) in enabled.iter().zip(results) {
        let mut stat = SourceStat {
            url: src.url.clone(),
            proxies_found: 0,
            error: String::new(),
        };
        match outcome {
            Ok(body) => {
                let found = parse_body(&body, src);
                stat.proxies_found = found.len() as u64;
                for c in found {
                    if seen.insert(c.key()) {
                        candidates.push(c);
                    }
                }
            }
            Err(e) => {
                warn!(source = %src.url, error = %e, "aggregator source fetch failed");
                stat.error = e;
            }
        }
        source_stats.insert(src.url.clone(), stat);
    }

    AggregatorOutput {
        candidates,
        sources: source_stats,
    }
}

async fn fetch_one(
    client: &reqwest::Client,
    src: &SourceDescriptor,
    user_agent: &str,
) -> Result<String, String> {
    let resp = tokio::time::timeout(
        FETCH_TIMEOUT,
        client.get(&src.url).header("User-Agent", user_agent).send(),
    )
    .await
    .map_err(|_| "fetch timed out".to_string())?
    .map_err(|e| e.to_string())?;

    let bytes = tokio::time::timeout(FETCH_TIMEOUT, resp.bytes())
        .await
        .map_err(|_| "read timed out".to_string())?
        .map_err(|e| e.to_string())?;

    let truncated = &bytes[..bytes.len().min(MAX_BODY_BYTES)];
    Ok(String::from_utf8_lossy(truncated).into_owned())
}

/// Parses a source body per §4.1 "Parse" and "Protocol resolution".
fn parse_body(body: &str, src: &SourceDescriptor) -> Vec<Candidate> {
    let url_fallback = protocol_from_url(&src.url);
    let mut out = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(caps) = LINE_RE.captures(line) else {
            continue;
        };
        let protocol = caps
            .get(1)
            .and_then(|m| Protocol::parse(m.as_str()))
            .or_else(|| src.default_protocol())
            .or(url_fallback)
            .unwrap_or(Protocol::Http);
        let host = &caps[2];
        let port = &caps[3];
        let address = format!("{host}:{port}");
        out.push(Candidate::new(address, protocol));
    }
    out
}

/// Fallback protocol inference from the source URL, per §4.1 rule (3) and
/// the §9 Open Question resolution: retained only as a fallback behind
/// explicit scheme / `default_protocol`.
fn protocol_from_url(url: &str) -> Option<Protocol> {
    let lower = url.to_ascii_lowercase();
    if lower.contains("socks5") {
        Some(Protocol::Socks5)
    } else if lower.contains("socks4") {
        Some(Protocol::Socks4)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(url: &str, protocol: &str) -> SourceDescriptor {
        SourceDescriptor {
            url: url.to_string(),
            protocol: protocol.to_string(),
            enabled: true,
        }
    }

    #[test]
    fn parses_plain_lines_as_http_by_default() {
        let body = "203.0.113.7:8080\n# comment\n\n198.51.100.2:3128";
        let s = src("https://example.test/list.txt", "auto");
        let found = parse_body(body, &s);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|c| c.protocol == Protocol::Http));
    }

    #[test]
    fn explicit_scheme_wins_over_default_protocol() {
        let body = "socks5://198.51.100.2:1080";
        let s = src("https://example.test/list.txt", "http");
        let found = parse_body(body, &s);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].protocol, Protocol::Socks5);
    }

    #[test]
    fn source_default_protocol_applies_without_scheme() {
        let body = "198.51.100.2:1080";
        let s = src("https://example.test/list.txt", "socks5");
        let found = parse_body(body, &s);
        assert_eq!(found[0].protocol, Protocol::Socks5);
    }

    #[test]
    fn url_substring_fallback_when_auto_and_no_scheme() {
        let body = "198.51.100.2:1080";
        let s = src("https://example.test/socks5.txt", "auto");
        let found = parse_body(body, &s);
        assert_eq!(found[0].protocol, Protocol::Socks5);
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let body = "not-an-address\n999.999.999.999\n:8080";
        let s = src("https://example.test/list.txt", "auto");
        let found = parse_body(body, &s);
        assert!(found.is_empty());
    }

    #[test]
    fn dedup_keeps_same_address_different_protocol() {
        let mut seen = HashSet::new();
        let a = Candidate::new("203.0.113.7:8080", Protocol::Http);
        let b = Candidate::new("203.0.113.7:8080", Protocol::Socks5);
        assert!(seen.insert(a.key()));
        assert!(seen.insert(b.key()));
    }
}

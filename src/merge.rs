//! Trivial but load-bearing: concatenate Aggregator and Scanner Driver
//! output, then deduplicate by `(address, protocol)`. `spec.md` §4.3.

use std::collections::HashSet;

use crate::types::Candidate;

/// Linear-time insertion, constant-expected-time lookup, required by
/// §4.3 for the ~200k-entry production case.
pub fn merge(scraped: Vec<Candidate>, scanned: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::with_capacity(scraped.len() + scanned.len());
    let mut out = Vec::with_capacity(scraped.len() + scanned.len());
    for c in scraped.into_iter().chain(scanned) {
        if seen.insert(c.key()) {
            out.push(c);
        }
    }
    out
}

/// Drops any `incoming` candidate already present in `scraped` by
/// `(address, protocol)` identity. The orchestrator's scraped and scanned
/// batches are validated as two separate passes (to support the two-publish
/// design in §4.7), so this applies §4.3's dedup rule across those passes
/// without re-validating a candidate the scraped pass already checked.
pub fn dedupe_against(scraped: &[Candidate], incoming: Vec<Candidate>) -> Vec<Candidate> {
    let seen: HashSet<(String, crate::types::Protocol)> =
        scraped.iter().map(Candidate::key).collect();
    incoming.into_iter().filter(|c| !seen.contains(&c.key())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    #[test]
    fn dedups_across_both_inputs() {
        let scraped = vec![
            Candidate::new("1.2.3.4:80", Protocol::Http),
            Candidate::new("1.2.3.4:80", Protocol::Http),
        ];
        let scanned = vec![
            Candidate::new("1.2.3.4:80", Protocol::Http),
            Candidate::new("5.6.7.8:1080", Protocol::Socks5),
        ];
        let merged = merge(scraped, scanned);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn same_address_different_protocol_both_kept() {
        let scraped = vec![Candidate::new("1.2.3.4:80", Protocol::Http)];
        let scanned = vec![Candidate::new("1.2.3.4:80", Protocol::Socks5)];
        let merged = merge(scraped, scanned);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn dedupe_against_drops_already_scraped_candidates() {
        let scraped = vec![Candidate::new("1.2.3.4:80", Protocol::Http)];
        let scanned = vec![
            Candidate::new("1.2.3.4:80", Protocol::Http),
            Candidate::new("1.2.3.4:80", Protocol::Socks5),
            Candidate::new("5.6.7.8:1080", Protocol::Socks5),
        ];
        let novel = dedupe_against(&scraped, scanned);
        assert_eq!(novel.len(), 2);
    }
}

//! Bulk TCP-connect pre-filter: discards candidates whose address does not
//! accept a TCP connection within a short timeout. `spec.md` §4.4.
//!
//! Generalizes the teacher's `scan_targets_internal` concurrency shape
//! (`Arc<Semaphore>` + `JoinSet` + `tokio::time::timeout` around
//! `TcpStream::connect`) from `(IpAddr, port)` pairs to `Candidate`s.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::types::Candidate;

/// Below this many candidates the filter is a no-op, per §4.4 "Contract".
const ENABLE_THRESHOLD: usize = 1_000;

pub async fn filter(
    candidates: Vec<Candidate>,
    timeout_ms: u64,
    concurrency: usize,
    cancel: CancellationToken,
) -> Vec<Candidate> {
    if candidates.len() < ENABLE_THRESHOLD {
        return candidates;
    }

    let timeout = Duration::from_millis(timeout_ms);
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();

    for candidate in candidates {
        if cancel.is_cancelled() {
            break;
        }
        let permit = match sem.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let cancel = cancel.clone();
        set.spawn(async move {
            let _permit = permit;
            if cancel.is_cancelled() {
                return None;
            }
            match tokio::time::timeout(timeout, TcpStream::connect(&candidate.address)).await {
                Ok(Ok(_stream)) => Some(candidate),
                _ => None,
            }
        });
    }

    let mut survivors = Vec::new();
    while let Some(res) = set.join_next().await {
        if let Ok(Some(candidate)) = res {
            survivors.push(candidate);
        }
    }
    survivors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn below_threshold_is_passthrough() {
        let candidates: Vec<_> = (0..10)
            .map(|i| Candidate::new(format!("10.255.255.{i}:9"), Protocol::Http))
            .collect();
        let out = filter(candidates.clone(), 50, 10, CancellationToken::new()).await;
        assert_eq!(out.len(), candidates.len());
    }

    #[tokio::test]
    async fn keeps_connectable_and_drops_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let mut candidates: Vec<_> = (0..1_200)
            .map(|i| Candidate::new(format!("192.0.2.{}:9", i % 250), Protocol::Http))
            .collect();
        candidates.push(Candidate::new(addr.to_string(), Protocol::Http));

        let out = filter(candidates, 300, 256, CancellationToken::new()).await;
        assert!(out.iter().any(|c| c.address == addr.to_string()));
        assert!(out.len() < 1_200);
    }
}

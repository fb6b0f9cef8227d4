//! The atomic, lock-free snapshot store backing the API. `spec.md` §4.6.
//!
//! `Get` is wait-free: a single `ArcSwap::load_full()`. `Update` is a
//! single atomic pointer store. No reader ever observes a half-built
//! snapshot, per the §9 "Atomic publish over locking" design note.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::seq::SliceRandom;
use tracing::warn;

use crate::persistence::PersistenceBackend;
use crate::types::{AliveProxy, Protocol, Snapshot, Stats};

/// Persisted entries older than this are dropped on startup load, per §4.6
/// `LoadFromBackingStore` and §9 "Snapshot staleness cutoff on startup".
const STALENESS_CUTOFF: chrono::Duration = chrono::Duration::hours(1);

pub struct SnapshotStore {
    current: ArcSwap<Snapshot>,
    round_robin: AtomicUsize,
    backend: Arc<dyn PersistenceBackend>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl SnapshotStore {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::empty()),
            round_robin: AtomicUsize::new(0),
            backend,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// `Get()`: lock-free, wait-free, no allocation on the hot path.
    pub fn get(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// `Update(proxies, stats)`: atomically publishes a new snapshot, then
    /// kicks off an async durable write. Persistence failures never affect
    /// the in-memory snapshot, per §4.6 "Failure semantics".
    pub fn update(self: &Arc<Self>, proxies: Vec<AliveProxy>, stats: Stats) {
        let snapshot = Snapshot::new(proxies, stats, chrono::Utc::now());
        self.current.store(Arc::new(snapshot));

        let this = self.clone();
        tokio::spawn(async move {
            this.persist().await;
        });
    }

    pub async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.current.load_full();
        if let Err(e) = self.backend.save(&snapshot).await {
            warn!(error = %e, "snapshot persistence write failed");
            crate::metrics::record_persistence_failure("proxy_pool");
        }
    }

    /// `LoadFromBackingStore()`: restores a snapshot at startup, filtering
    /// out entries older than the staleness cutoff.
    pub async fn load_from_backing_store(self: &Arc<Self>) {
        match self.backend.load().await {
            Ok(Some(mut snapshot)) => {
                let cutoff = chrono::Utc::now() - STALENESS_CUTOFF;
                snapshot.proxies.retain(|p| p.last_check >= cutoff);
                let stats = Stats {
                    total_alive: snapshot.proxies.len() as u64,
                    ..snapshot.stats
                };
                let rebuilt = Snapshot::new(snapshot.proxies, stats, snapshot.updated);
                self.current.store(Arc::new(rebuilt));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "failed to load persisted snapshot, starting empty");
            }
        }
    }

    /// `GetOne()`: one proxy via round-robin, safe under concurrent callers.
    pub fn get_one(&self) -> Option<AliveProxy> {
        let snapshot = self.current.load();
        if snapshot.proxies.is_empty() {
            return None;
        }
        let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % snapshot.proxies.len();
        Some(snapshot.proxies[idx].clone())
    }

    /// `GetN(n)`: round-robin for small `n`, random permutation otherwise.
    pub fn get_n(&self, n: usize, protocol: Option<Protocol>) -> Vec<AliveProxy> {
        let snapshot = self.current.load();
        let pool: Vec<&AliveProxy> = snapshot
            .proxies
            .iter()
            .filter(|p| protocol.is_none_or(|want| p.protocol == want))
            .collect();
        if pool.is_empty() || n == 0 {
            return Vec::new();
        }
        let n = n.min(pool.len());
        const ROUND_ROBIN_THRESHOLD: usize = 8;
        if n <= ROUND_ROBIN_THRESHOLD {
            let start = self.round_robin.fetch_add(n, Ordering::Relaxed);
            (0..n)
                .map(|i| pool[(start + i) % pool.len()].clone())
                .collect()
        } else {
            let mut indices: Vec<usize> = (0..pool.len()).collect();
            indices.shuffle(&mut rand::thread_rng());
            indices
                .into_iter()
                .take(n)
                .map(|i| pool[i].clone())
                .collect()
        }
    }

    /// `GetAll()`: a defensive copy of the current proxy sequence.
    pub fn get_all(&self, protocol: Option<Protocol>) -> Vec<AliveProxy> {
        let snapshot = self.current.load();
        snapshot
            .proxies
            .iter()
            .filter(|p| protocol.is_none_or(|want| p.protocol == want))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::NullBackend;
    use crate::types::Source;

    fn alive(addr: &str, protocol: Protocol) -> AliveProxy {
        AliveProxy {
            address: addr.to_string(),
            protocol,
            latency_ms: 10,
            last_check: chrono::Utc::now(),
            source: Source::Scraped,
        }
    }

    #[test]
    fn get_returns_empty_well_formed_snapshot_before_first_update() {
        let store = SnapshotStore::new(Arc::new(NullBackend));
        let snap = store.get();
        assert!(snap.proxies.is_empty());
        assert_eq!(snap.stats.total_alive, 0);
    }

    #[tokio::test]
    async fn update_is_visible_to_get_and_enforces_invariants() {
        let store = Arc::new(SnapshotStore::new(Arc::new(NullBackend)));
        let proxies = vec![
            alive("1.1.1.1:80", Protocol::Http),
            alive("1.1.1.1:80", Protocol::Http), // duplicate key
            alive("2.2.2.2:1080", Protocol::Socks5),
        ];
        store.update(proxies, Stats::default());
        let snap = store.get();
        assert_eq!(snap.proxies.len(), 2);
        assert_eq!(snap.stats.total_alive, 2);
        for p in &snap.proxies {
            assert!(p.last_check <= snap.updated);
        }
    }

    #[test]
    fn get_one_round_robins_across_calls() {
        let store = SnapshotStore::new(Arc::new(NullBackend));
        let proxies = vec![
            alive("1.1.1.1:80", Protocol::Http),
            alive("2.2.2.2:80", Protocol::Http),
        ];
        let snapshot = Snapshot::new(proxies, Stats::default(), chrono::Utc::now());
        store.current.store(Arc::new(snapshot));

        let first = store.get_one().unwrap();
        let second = store.get_one().unwrap();
        assert_ne!(first.address, second.address);
    }

    #[test]
    fn protocol_filter_round_trip() {
        let store = SnapshotStore::new(Arc::new(NullBackend));
        let proxies = vec![
            alive("1.1.1.1:80", Protocol::Http),
            alive("2.2.2.2:1080", Protocol::Socks5),
            alive("3.3.3.3:1081", Protocol::Socks4),
        ];
        let snapshot = Snapshot::new(proxies, Stats::default(), chrono::Utc::now());
        store.current.store(Arc::new(snapshot));

        let all = store.get_all(None);
        let only_socks5 = store.get_all(Some(Protocol::Socks5));
        assert_eq!(only_socks5.len(), 1);
        assert!(only_socks5.iter().all(|p| p.protocol == Protocol::Socks5));
        assert_eq!(
            only_socks5.len(),
            all.iter().filter(|p| p.protocol == Protocol::Socks5).count()
        );
    }
}

//! The cycle controller: drives aggregator → scanner → merge → filter →
//! validator → snapshot, and owns the cancellation context. `spec.md` §4.7.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator;
use crate::backpressure::effective_concurrency;
use crate::config::Config;
use crate::fast_filter;
use crate::metrics;
use crate::scanner_driver::ScannerDriver;
use crate::snapshot::SnapshotStore;
use crate::types::{AliveProxy, Candidate, CheckResult, Source, Stats};
use crate::validator::Validator;

/// Scanning may run far longer than a cycle's nominal interval; bound the
/// scanned-pass publish at this hard deadline regardless, per §4.7 step 4.
const SCAN_HARD_DEADLINE_SECS: u64 = 15 * 60;

pub struct Orchestrator {
    config: Arc<Config>,
    store: Arc<SnapshotStore>,
    scanner: Option<Arc<ScannerDriver>>,
    http_client: reqwest::Client,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, store: Arc<SnapshotStore>, cancel: CancellationToken) -> Self {
        let scanner = ScannerDriver::new(config.zmap.clone()).map(Arc::new);
        let http_client = reqwest::Client::builder()
            .user_agent(config.aggregator.user_agent.clone())
            .build()
            .expect("building the aggregator's shared HTTP client");
        Self {
            config,
            store,
            scanner,
            http_client,
            cancel,
        }
    }

    pub fn scanner(&self) -> Option<Arc<ScannerDriver>> {
        self.scanner.clone()
    }

    /// Runs the interval-driven loop, also listening for `POST /reload`
    /// requests on `reload_rx`, per §4.7 state 1 and the §9 resolution for
    /// `/reload`'s return semantics.
    pub async fn run(self: Arc<Self>, mut reload_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.aggregator.interval_seconds,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = reload_rx.recv() => {
                    info!("reload requested, starting an out-of-band cycle");
                }
                _ = self.cancel.cancelled() => {
                    info!("orchestrator cancelled, flushing final snapshot and stopping");
                    self.store.persist().await;
                    return;
                }
            }
            self.clone().run_one_cycle().await;
        }
    }

    async fn run_one_cycle(self: Arc<Self>) {
        info!("cycle: aggregating");
        let agg = aggregator::aggregate(
            &self.http_client,
            &self.config.aggregator.sources,
            &self.config.aggregator.user_agent,
        )
        .await;
        let total_scraped = agg.candidates.len() as u64;

        let scan_task = self.scanner.clone().map(|scanner| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                metrics::record_scan("proxy_pool");
                tokio::select! {
                    candidates = scanner.scan() => candidates,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(SCAN_HARD_DEADLINE_SECS)) => {
                        warn!("scanner exceeded the cycle's hard deadline, proceeding without it");
                        Vec::new()
                    }
                    _ = cancel.cancelled() => Vec::new(),
                }
            })
        });

        let scraped_candidates = agg.candidates;
        info!(count = scraped_candidates.len(), "cycle: validating scraped candidates");
        let scraped_results = self
            .validate_batch(scraped_candidates.clone())
            .await;
        let scraped_alive = results_to_alive(&scraped_results, Source::Scraped);

        let mut stats = Stats {
            total_scraped,
            total_dead: scraped_results.iter().filter(|r| !r.alive).count() as u64,
            last_check_time: Some(chrono::Utc::now()),
            sources: agg.sources,
            ..Stats::default()
        };
        stats.alive_percent = alive_percent(&stats, scraped_alive.len() as u64);

        metrics::record_validated(
            "proxy_pool",
            scraped_alive.len() as u64,
            stats.total_dead,
        );
        self.store.update(scraped_alive.clone(), stats.clone());
        metrics::record_snapshot_size("proxy_pool", self.store.get().proxies.len() as u64);
        info!("cycle: scraped snapshot published");

        if let Some(task) = scan_task {
            let scanned_candidates =
                crate::merge::dedupe_against(&scraped_candidates, task.await.unwrap_or_default());
            if !scanned_candidates.is_empty() {
                info!(count = scanned_candidates.len(), "cycle: validating scanned candidates");
                let scanned_results = self.validate_batch(scanned_candidates).await;
                let scanned_alive = results_to_alive(&scanned_results, Source::Zmap);

                let merged_alive = merge_alive(scraped_alive, scanned_alive);
                let mut union_stats = stats;
                union_stats.total_dead += scanned_results.iter().filter(|r| !r.alive).count() as u64;
                union_stats.total_scraped += scanned_candidates_total(&scanned_results);
                union_stats.alive_percent = alive_percent(&union_stats, merged_alive.len() as u64);

                metrics::record_validated(
                    "proxy_pool",
                    scanned_results.iter().filter(|r| r.alive).count() as u64,
                    scanned_results.iter().filter(|r| !r.alive).count() as u64,
                );
                self.store.update(merged_alive, union_stats);
                metrics::record_snapshot_size("proxy_pool", self.store.get().proxies.len() as u64);
                info!("cycle: union snapshot published");
            }
        }

        info!("cycle: complete");
    }

    async fn validate_batch(&self, candidates: Vec<Candidate>) -> Vec<CheckResult> {
        let filtered = if self.config.checker.enable_fast_filter {
            fast_filter::filter(
                candidates,
                self.config.checker.fast_filter_timeout_ms,
                self.config.checker.fast_filter_concurrency,
                self.cancel.clone(),
            )
            .await
        } else {
            candidates
        };

        let nominal = self.config.checker.concurrency_total;
        let limit = if self.config.checker.enable_adaptive_concurrency {
            let fd_soft = rlimit::getrlimit(rlimit::Resource::NOFILE)
                .map(|(soft, _)| soft)
                .unwrap_or(u64::MAX);
            let resident = current_resident_bytes();
            let limit = effective_concurrency(
                nominal,
                filtered.len(),
                fd_soft,
                self.config.checker.max_fd_usage_percent,
                resident,
            );
            if limit < nominal {
                warn!(nominal, limit, "adaptive concurrency reduced this batch");
            }
            metrics::record_adaptive_limit("proxy_pool", limit);
            limit
        } else {
            nominal
        };

        let mut checker_config = self.config.checker.clone();
        checker_config.concurrency_total = limit;
        let validator = Validator::new(checker_config);
        validator.validate_all(filtered, self.cancel.clone()).await
    }
}

fn results_to_alive(results: &[CheckResult], source: Source) -> Vec<AliveProxy> {
    let now = chrono::Utc::now();
    results
        .iter()
        .filter(|r| r.alive)
        .map(|r| AliveProxy {
            address: r.address.clone(),
            protocol: r.protocol,
            latency_ms: r.latency_ms,
            last_check: now,
            source,
        })
        .collect()
}

/// Unions the scraped-alive and scanned-alive sets for the second publish
/// in §4.7 step 4, deduplicating by `(address, protocol)` with scraped
/// entries winning ties. Same identity rule as the raw-candidate Merge &
/// Dedup step (§4.3), applied here to `AliveProxy` rather than `Candidate`.
fn merge_alive(scraped: Vec<AliveProxy>, scanned: Vec<AliveProxy>) -> Vec<AliveProxy> {
    let mut seen = std::collections::HashSet::with_capacity(scraped.len() + scanned.len());
    scraped
        .into_iter()
        .chain(scanned)
        .filter(|p| seen.insert((p.address.to_ascii_lowercase(), p.protocol)))
        .collect()
}

fn alive_percent(stats: &Stats, alive: u64) -> f64 {
    if stats.total_scraped == 0 {
        0.0
    } else {
        (alive as f64 / stats.total_scraped as f64) * 100.0
    }
}

fn scanned_candidates_total(results: &[CheckResult]) -> u64 {
    results.len() as u64
}

fn current_resident_bytes() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_process(sysinfo::get_current_pid().unwrap_or(sysinfo::Pid::from(0)));
    sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid))
        .map(|p| p.memory())
        .unwrap_or(0)
}

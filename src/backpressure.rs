//! Adaptive concurrency reduction, `spec.md` §5 "Adaptive backpressure".
//!
//! Per the §9 Open Question resolution, the three reductions are applied
//! as a **minimum**, not a multiplicative chain, and the result never
//! rises above the configured nominal limit.

/// Computes the effective concurrency limit for the next batch.
///
/// - `nominal`: the configured `concurrency_total`.
/// - `live_tasks`: currently in-flight validations.
/// - `fd_soft_limit`: the process's open-file soft rlimit.
/// - `max_fd_usage_percent`: configured ceiling, applied to `fd_soft_limit`.
/// - `resident_bytes`: current RSS.
pub fn effective_concurrency(
    nominal: usize,
    live_tasks: usize,
    fd_soft_limit: u64,
    max_fd_usage_percent: u32,
    resident_bytes: u64,
) -> usize {
    let mut limit = nominal;

    if live_tasks > nominal.saturating_mul(2) {
        limit = limit.min((nominal as f64 * 0.6) as usize);
    }

    if (nominal as f64 * 1.5) > (fd_soft_limit as f64 * max_fd_usage_percent as f64 / 100.0) {
        let fd_cap = (fd_soft_limit as f64 * max_fd_usage_percent as f64 / 150.0) as usize;
        limit = limit.min(fd_cap);
    }

    const TWO_GIB: u64 = 2 * 1024 * 1024 * 1024;
    if resident_bytes > TWO_GIB {
        limit = limit.min((nominal as f64 * 0.7) as usize);
    }

    limit.min(nominal).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_reduction_under_normal_conditions() {
        let limit = effective_concurrency(20_000, 5_000, 1_000_000, 70, 500_000_000);
        assert_eq!(limit, 20_000);
    }

    #[test]
    fn reduces_on_task_overload() {
        let limit = effective_concurrency(20_000, 45_000, 1_000_000, 70, 500_000_000);
        assert_eq!(limit, 12_000);
    }

    #[test]
    fn reduces_on_memory_pressure() {
        let limit = effective_concurrency(20_000, 5_000, 1_000_000, 70, 3 * 1024 * 1024 * 1024);
        assert_eq!(limit, 14_000);
    }

    #[test]
    fn reduces_on_fd_pressure() {
        let limit = effective_concurrency(20_000, 5_000, 10_000, 70, 500_000_000);
        assert!(limit < 20_000);
    }

    #[test]
    fn never_exceeds_nominal() {
        let limit = effective_concurrency(100, 0, u64::MAX, 100, 0);
        assert!(limit <= 100);
    }

    #[test]
    fn minimum_of_reductions_is_applied_not_a_chain() {
        // Both task overload (0.6x) and memory pressure (0.7x) trigger;
        // the spec's §9 resolution takes the minimum of the two, not their
        // product.
        let limit = effective_concurrency(20_000, 45_000, 1_000_000, 70, 3 * 1024 * 1024 * 1024);
        assert_eq!(limit, 12_000); // min(0.6, 0.7) * nominal, not 0.42 * nominal
    }
}

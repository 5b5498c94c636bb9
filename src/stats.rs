//! Scheduler counters
//!
//! Global atomic counters for the policy operations and the balancer.
//! Everything is `Relaxed`: these are diagnostics, not synchronization.

use core::sync::atomic::{AtomicU64, Ordering};

/// Global scheduler statistics
pub struct WrrStats {
    /// Tasks linked into a run queue
    pub enqueues: AtomicU64,

    /// Tasks unlinked from a run queue
    pub dequeues: AtomicU64,

    /// pick_next selections
    pub picks: AtomicU64,

    /// pick_next selections that changed the running task
    pub switches: AtomicU64,

    /// Voluntary yields
    pub yields: AtomicU64,

    /// Quantum expiries that rotated the running task
    pub preemptions: AtomicU64,

    /// Balancer passes executed
    pub balance_passes: AtomicU64,

    /// Cross-CPU migrations performed
    pub migrations: AtomicU64,
}

impl WrrStats {
    pub const fn new() -> Self {
        Self {
            enqueues: AtomicU64::new(0),
            dequeues: AtomicU64::new(0),
            picks: AtomicU64::new(0),
            switches: AtomicU64::new(0),
            yields: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            balance_passes: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
        }
    }

    pub fn record_enqueue(&self) {
        self.enqueues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeue(&self) {
        self.dequeues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pick(&self) {
        self.picks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_switch(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_yield(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_balance_pass(&self) {
        self.balance_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough copy for reporting
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueues: self.enqueues.load(Ordering::Relaxed),
            dequeues: self.dequeues.load(Ordering::Relaxed),
            picks: self.picks.load(Ordering::Relaxed),
            switches: self.switches.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            balance_passes: self.balance_passes.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub enqueues: u64,
    pub dequeues: u64,
    pub picks: u64,
    pub switches: u64,
    pub yields: u64,
    pub preemptions: u64,
    pub balance_passes: u64,
    pub migrations: u64,
}

/// Global statistics instance
pub static SCHED_STATS: WrrStats = WrrStats::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = WrrStats::new();
        stats.record_enqueue();
        stats.record_enqueue();
        stats.record_migration();

        let snap = stats.snapshot();
        assert_eq!(snap.enqueues, 2);
        assert_eq!(snap.migrations, 1);
        assert_eq!(snap.picks, 0);
    }
}

//! Periodic cross-CPU load balancing
//!
//! Runs on a fixed wall-clock interval, independent of any task's
//! lifecycle. Each pass does bounded work: one weight snapshot, then at
//! most one migration from the heaviest CPU to the lightest.
//!
//! Locking: the snapshot takes one run-queue lock at a time; only the
//! migration step holds two, always acquired in ascending CPU index so
//! concurrent passes over overlapping pairs cannot deadlock.

use core::sync::atomic::Ordering;

use log::{debug, warn};

use crate::error::SchedResult;
use crate::runqueue::RunQueue;
use crate::scheduler::{EnqueueFlags, WrrScheduler};
use crate::stats::SCHED_STATS;
use crate::task::TaskId;

/// Wall-clock period between balancer passes
pub const BALANCE_INTERVAL_MS: u64 = 2000;

/// A migration performed by the balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub task: TaskId,
    pub from: usize,
    pub to: usize,
}

impl WrrScheduler {
    /// Timer entry point: runs a balance pass if the interval has
    /// elapsed, and re-arms the deadline either way once it fires.
    pub fn trigger_balance(&self, now_ms: u64) -> Option<Migration> {
        if now_ms < self.next_balance_ms.load(Ordering::Relaxed) {
            return None;
        }
        self.next_balance_ms
            .store(now_ms + BALANCE_INTERVAL_MS, Ordering::Relaxed);
        self.rebalance()
    }

    /// One balance pass: find the heaviest and lightest online CPUs and
    /// move the heaviest safe task between them. A pass that finds
    /// nothing safe to move is a normal no-op round.
    pub fn rebalance(&self) -> Option<Migration> {
        SCHED_STATS.record_balance_pass();

        // Phase 1: snapshot per-CPU weights, one lock at a time.
        let mut max: Option<(usize, u64)> = None;
        let mut min: Option<(usize, u64)> = None;
        for cpu_rq in (0..self.nr_cpus()).filter_map(|c| self.cpu(c)) {
            if !cpu_rq.is_online() {
                continue;
            }
            let weight = cpu_rq.rq.lock().total_weight();

            // Strict comparisons keep the lowest index on ties
            if max.map_or(true, |(_, w)| weight > w) {
                max = Some((cpu_rq.cpu(), weight));
            }
            if min.map_or(true, |(_, w)| weight < w) {
                min = Some((cpu_rq.cpu(), weight));
            }
        }

        let (max_cpu, _) = max?;
        let (min_cpu, _) = min?;
        if max_cpu == min_cpu {
            return None;
        }

        // Phase 2: lock both queues in ascending index order, then
        // re-derive the weights; the snapshot may already be stale.
        let lo = max_cpu.min(min_cpu);
        let hi = max_cpu.max(min_cpu);
        let mut lo_guard = self.cpu(lo)?.rq.lock();
        let mut hi_guard = self.cpu(hi)?.rq.lock();
        let (max_rq, min_rq): (&mut RunQueue, &mut RunQueue) = if max_cpu == lo {
            (&mut *lo_guard, &mut *hi_guard)
        } else {
            (&mut *hi_guard, &mut *lo_guard)
        };

        let max_weight = max_rq.total_weight();
        let min_weight = min_rq.total_weight();
        if max_weight <= min_weight {
            return None;
        }

        // Phase 3: heaviest task on the busy CPU that is not running,
        // whose move keeps the order (min + w < max - w), and whose
        // affinity admits the idle CPU.
        let curr_id = max_rq.curr().map(|c| c.id());
        let mut candidate: Option<(TaskId, u32)> = None;
        for task in max_rq.iter() {
            if Some(task.id()) == curr_id {
                continue;
            }
            let weight = task.weight();
            if candidate.map_or(false, |(_, best)| weight <= best) {
                continue;
            }
            if min_weight + u64::from(weight) >= max_weight - u64::from(weight) {
                continue;
            }
            if !task.affinity().is_set(min_cpu) {
                continue;
            }
            candidate = Some((task.id(), weight));
        }

        let (task_id, weight) = match candidate {
            Some(c) => c,
            None => {
                debug!(
                    "wrr: no safe migration from cpu {} ({}) to cpu {} ({})",
                    max_cpu, max_weight, min_cpu, min_weight
                );
                return None;
            }
        };

        // Phase 4: migrate through the same single-queue primitives the
        // local operations use, both locks held throughout.
        let task = max_rq.unlink(task_id)?;
        self.cpu(max_cpu)?.publish(max_rq);
        min_rq.link(task, false);
        let min_cpu_rq = self.cpu(min_cpu)?;
        min_cpu_rq.publish(min_rq);
        min_cpu_rq.request_resched();

        SCHED_STATS.record_migration();
        debug!(
            "wrr: migrated task {} (weight {}) from cpu {} to cpu {}",
            task_id, weight, max_cpu, min_cpu
        );
        Some(Migration {
            task: task_id,
            from: max_cpu,
            to: min_cpu,
        })
    }

    /// Let a CPU participate in scheduling again
    pub fn rq_online(&self, cpu: usize) -> SchedResult<()> {
        self.rq(cpu)?.set_online(true);
        debug!("wrr: cpu {} online", cpu);
        Ok(())
    }

    /// Take a CPU out of scheduling and re-place its queued tasks on the
    /// remaining online CPUs. Tasks whose affinity admits no online CPU
    /// are left detached for the caller to park.
    pub fn rq_offline(&self, cpu: usize) -> SchedResult<()> {
        let cpu_rq = self.rq(cpu)?;
        cpu_rq.set_online(false);

        let drained = {
            let mut rq = cpu_rq.rq.lock();
            let drained = rq.drain_all();
            cpu_rq.publish(&rq);
            drained
        };
        debug!("wrr: cpu {} offline, re-placing {} tasks", cpu, drained.len());

        for task in drained {
            match self.select_cpu(&task) {
                Some(target) => {
                    if let Err(err) = self.enqueue(&task, target, EnqueueFlags::empty()) {
                        warn!("wrr: re-placing task {} failed: {}", task.id(), err);
                    }
                }
                None => {
                    warn!(
                        "wrr: task {} has no eligible cpu after cpu {} went offline",
                        task.id(),
                        cpu
                    );
                }
            }
        }
        Ok(())
    }
}

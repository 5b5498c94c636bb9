//! Task record for the WRR policy
//!
//! One `Task` per schedulable unit: configured weight, remaining
//! timeslice, queue membership and execution-time statistics. All mutable
//! fields are atomics so a `Task` can be shared via `Arc` between the run
//! queues and the host; queue-related fields are only written while the
//! owning run queue's lock is held.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::affinity::CpuMask;

/// Task ID type
pub type TaskId = u64;

/// Ticks granted per unit of weight
pub const BASE_TIMESLICE: u32 = 10;

/// Weight assigned when the operator gives none
pub const DEFAULT_WEIGHT: u32 = 10;

/// A schedulable task under the WRR policy
#[derive(Debug)]
pub struct Task {
    /// Unique identity
    id: TaskId,

    /// Operator-assigned weight (always >= 1)
    weight: AtomicU32,

    /// Remaining execution quantum in ticks
    time_slice: AtomicU32,

    /// Linked into some run queue's FIFO
    queued: AtomicBool,

    /// Owning CPU index while queued
    on_cpu: AtomicUsize,

    /// Allowed CPUs (raw `CpuMask` bits)
    affinity: AtomicU64,

    /// Timestamp of the current execution stretch (ns, 0 = not running)
    exec_start: AtomicU64,

    /// Accumulated execution time (ns)
    sum_exec_runtime: AtomicU64,

    /// Largest single execution delta observed (ns)
    exec_max: AtomicU64,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Task {}

impl Task {
    /// Create a task with the given weight, allowed on every CPU
    pub fn new(id: TaskId, weight: u32) -> Self {
        Self::with_affinity(id, weight, CpuMask::all())
    }

    /// Create a task restricted to the given CPUs
    pub fn with_affinity(id: TaskId, weight: u32, affinity: CpuMask) -> Self {
        let weight = weight.max(1);
        Self {
            id,
            weight: AtomicU32::new(weight),
            time_slice: AtomicU32::new(weight * BASE_TIMESLICE),
            queued: AtomicBool::new(false),
            on_cpu: AtomicUsize::new(0),
            affinity: AtomicU64::new(affinity.bits()),
            exec_start: AtomicU64::new(0),
            sum_exec_runtime: AtomicU64::new(0),
            exec_max: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Raw weight store. Queued tasks must go through
    /// `WrrScheduler::set_weight` so the queue counters stay in sync.
    pub(crate) fn store_weight(&self, weight: u32) {
        self.weight.store(weight.max(1), Ordering::Relaxed);
    }

    /// Full quantum for this task: `weight * BASE_TIMESLICE`
    pub fn timeslice(&self) -> u32 {
        self.weight() * BASE_TIMESLICE
    }

    /// Remaining ticks in the current quantum
    pub fn remaining_timeslice(&self) -> u32 {
        self.time_slice.load(Ordering::Relaxed)
    }

    /// Reset the quantum to its full length
    pub(crate) fn refill_timeslice(&self) {
        self.time_slice.store(self.timeslice(), Ordering::Relaxed);
    }

    /// Burn one tick; returns the remaining ticks (0 = expired)
    pub(crate) fn tick_timeslice(&self) -> u32 {
        let prev = self.time_slice.load(Ordering::Relaxed);
        let next = prev.saturating_sub(1);
        self.time_slice.store(next, Ordering::Relaxed);
        next
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Relaxed)
    }

    pub(crate) fn set_queued(&self, queued: bool) {
        self.queued.store(queued, Ordering::Relaxed);
    }

    /// CPU this task is queued on (meaningful only while queued)
    pub fn cpu(&self) -> usize {
        self.on_cpu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.on_cpu.store(cpu, Ordering::Relaxed);
    }

    pub fn affinity(&self) -> CpuMask {
        CpuMask::from_bits(self.affinity.load(Ordering::Relaxed))
    }

    pub fn set_affinity(&self, mask: CpuMask) {
        self.affinity.store(mask.bits(), Ordering::Relaxed);
    }

    /// Total accumulated execution time (ns); monotonic
    pub fn sum_exec_runtime(&self) -> u64 {
        self.sum_exec_runtime.load(Ordering::Relaxed)
    }

    /// Largest single execution stretch observed (ns)
    pub fn exec_max(&self) -> u64 {
        self.exec_max.load(Ordering::Relaxed)
    }

    /// Stamp the start of an execution stretch
    pub(crate) fn start_exec(&self, now_ns: u64) {
        self.exec_start.store(now_ns, Ordering::Relaxed);
    }

    pub(crate) fn clear_exec(&self) {
        self.exec_start.store(0, Ordering::Relaxed);
    }

    /// Fold elapsed execution time into the totals.
    ///
    /// Returns the accounted delta. A non-positive delta (clock went
    /// backwards, or no stretch in progress) is skipped rather than
    /// corrupting the totals.
    pub(crate) fn account_exec(&self, now_ns: u64) -> u64 {
        let start = self.exec_start.load(Ordering::Relaxed);
        if start == 0 || now_ns <= start {
            return 0;
        }
        let delta = now_ns - start;

        self.sum_exec_runtime.fetch_add(delta, Ordering::Relaxed);
        if delta > self.exec_max.load(Ordering::Relaxed) {
            self.exec_max.store(delta, Ordering::Relaxed);
        }
        self.exec_start.store(now_ns, Ordering::Relaxed);
        delta
    }
}

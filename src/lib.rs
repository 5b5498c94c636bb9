//! Weighted Round-Robin scheduling class core
//!
//! One scheduling policy: runnable tasks are kept in per-CPU FIFO run
//! queues and selected in cyclic order; a task's weight decides how long
//! it runs once selected (`weight * BASE_TIMESLICE` ticks), never where
//! it sits in the queue. A periodic balancer migrates at most one task
//! per pass from the heaviest CPU to the lightest.
//!
//! # Features
//! - O(1) pick: plain FIFO order, no priority sorting
//! - Weight-proportional timeslices with single-runnable exemption
//! - Least-loaded initial CPU placement (advisory, lock-free reads)
//! - Conservative cross-CPU balancing under ascending-index double lock
//!
//! The host owns the dispatch loop, the tick source, the monotonic clock
//! and the periodic timer; it feeds `now` values into the operations that
//! need them. Nothing in this crate blocks or sleeps.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod affinity;
pub mod balance;
pub mod error;
pub mod runqueue;
pub mod scheduler;
pub mod stats;
pub mod task;

pub use affinity::{CpuMask, MAX_CPUS};
pub use balance::{Migration, BALANCE_INTERVAL_MS};
pub use error::{SchedError, SchedResult};
pub use runqueue::CpuRq;
pub use scheduler::{init, scheduler, EnqueueFlags, WrrScheduler};
pub use stats::{StatsSnapshot, SCHED_STATS};
pub use task::{Task, TaskId, BASE_TIMESLICE, DEFAULT_WEIGHT};

//! Per-CPU run queues
//!
//! `RunQueue` is the FIFO of runnable tasks plus aggregate counters; it is
//! only touched through its owning `CpuRq` lock. `CpuRq` additionally
//! carries lock-free advisory mirrors of the aggregates (for placement
//! scans) and the reschedule flag for its CPU.
//!
//! Round-robin order *is* the FIFO order: weight never changes a task's
//! position, only how long it runs once it reaches the head.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use log::warn;
use spin::Mutex;

use crate::task::{Task, TaskId};

/// Ordered collection of runnable tasks on one CPU
#[derive(Debug)]
pub struct RunQueue {
    /// FIFO of queued tasks; the running task stays linked at whatever
    /// position round-robin rotation left it (head right after a pick)
    queue: VecDeque<Arc<Task>>,

    /// Number of queued tasks
    nr_running: usize,

    /// Sum of `weight` over queued tasks
    total_weight: u64,

    /// Task currently executing on this CPU, if any. Always a member of
    /// `queue`; `pick_next` sets it, `remove` clears it.
    curr: Option<Arc<Task>>,

    /// CPU that owns this queue (for diagnostics)
    cpu: usize,
}

impl RunQueue {
    pub fn new(cpu: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            nr_running: 0,
            total_weight: 0,
            curr: None,
            cpu,
        }
    }

    pub fn nr_running(&self) -> usize {
        self.nr_running
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Head of the FIFO (the next task round-robin will run)
    pub fn head(&self) -> Option<&Arc<Task>> {
        self.queue.front()
    }

    /// Currently running task on this CPU
    pub fn curr(&self) -> Option<&Arc<Task>> {
        self.curr.as_ref()
    }

    pub(crate) fn set_curr(&mut self, task: Option<Arc<Task>>) {
        self.curr = task;
    }

    pub(crate) fn position(&self, id: TaskId) -> Option<usize> {
        self.queue.iter().position(|t| t.id() == id)
    }

    /// Iterate queued tasks in FIFO order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.queue.iter()
    }

    /// Link a task into the FIFO (tail by default, head on request) and
    /// bump the aggregate counters.
    pub(crate) fn link(&mut self, task: Arc<Task>, head: bool) {
        task.set_queued(true);
        task.set_cpu(self.cpu);
        self.nr_running += 1;
        self.total_weight += u64::from(task.weight());
        if head {
            self.queue.push_front(task);
        } else {
            self.queue.push_back(task);
        }
    }

    /// Unlink a task and drop the aggregate counters. Clears `curr` if the
    /// removed task was running here.
    pub(crate) fn unlink(&mut self, id: TaskId) -> Option<Arc<Task>> {
        let pos = self.position(id)?;
        let task = self.queue.remove(pos)?;

        self.dec_counters(&task);
        task.set_queued(false);
        task.clear_exec();

        if self.curr.as_ref().map(|c| c.id()) == Some(id) {
            self.curr = None;
        }
        Some(task)
    }

    /// Move an already-queued task to the tail; false if it is not here
    pub(crate) fn move_to_tail(&mut self, id: TaskId) -> bool {
        match self.position(id) {
            Some(pos) => {
                if let Some(task) = self.queue.remove(pos) {
                    self.queue.push_back(task);
                }
                true
            }
            None => false,
        }
    }

    /// Re-aggregate `total_weight` after a queued task's weight changed
    pub(crate) fn adjust_weight(&mut self, old: u32, new: u32) {
        self.total_weight = self.total_weight - u64::from(old) + u64::from(new);
    }

    /// Unlink every task (offline drain); counters end at zero
    pub(crate) fn drain_all(&mut self) -> Vec<Arc<Task>> {
        let drained: Vec<_> = self.queue.drain(..).collect();
        for task in &drained {
            self.dec_counters(task);
            task.set_queued(false);
            task.clear_exec();
        }
        self.curr = None;
        drained
    }

    fn dec_counters(&mut self, task: &Arc<Task>) {
        if self.nr_running == 0 || self.total_weight < u64::from(task.weight()) {
            // Invariant violation: report and clamp, never underflow
            warn!(
                "wrr: counter underflow on cpu {} (nr_running={}, total_weight={}, task={})",
                self.cpu,
                self.nr_running,
                self.total_weight,
                task.id()
            );
            self.nr_running = self.nr_running.saturating_sub(1);
            self.total_weight = self
                .total_weight
                .saturating_sub(u64::from(task.weight()));
            return;
        }
        self.nr_running -= 1;
        self.total_weight -= u64::from(task.weight());
    }
}

/// One CPU's share of the scheduler: the locked run queue plus lock-free
/// advisory state read by placement and balancing scans.
#[derive(Debug)]
pub struct CpuRq {
    /// CPU index
    cpu: usize,

    /// The run queue; all local mutations happen under this lock
    pub(crate) rq: Mutex<RunQueue>,

    /// CPU participates in scheduling
    online: AtomicBool,

    /// Advisory mirror of `total_weight` (stale reads tolerated)
    load_weight: AtomicU64,

    /// Advisory mirror of `nr_running`
    nr_queued: AtomicUsize,

    /// Reschedule requested for this CPU
    need_resched: AtomicBool,
}

impl CpuRq {
    pub fn new(cpu: usize) -> Self {
        Self {
            cpu,
            rq: Mutex::new(RunQueue::new(cpu)),
            online: AtomicBool::new(true),
            load_weight: AtomicU64::new(0),
            nr_queued: AtomicUsize::new(0),
            need_resched: AtomicBool::new(false),
        }
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// Advisory total weight; may lag the locked value
    pub fn load_weight(&self) -> u64 {
        self.load_weight.load(Ordering::Relaxed)
    }

    /// Advisory runnable count; may lag the locked value
    pub fn nr_queued(&self) -> usize {
        self.nr_queued.load(Ordering::Relaxed)
    }

    /// Refresh the advisory mirrors from the locked queue state. Called
    /// with the `rq` lock held, after every mutation.
    pub(crate) fn publish(&self, rq: &RunQueue) {
        self.load_weight.store(rq.total_weight(), Ordering::Relaxed);
        self.nr_queued.store(rq.nr_running(), Ordering::Relaxed);
    }

    /// Ask this CPU's dispatcher to reschedule
    pub(crate) fn request_resched(&self) {
        self.need_resched.store(true, Ordering::Relaxed);
    }

    /// Consume the reschedule request, if one is pending
    pub fn take_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::Relaxed)
    }

    /// Peek the reschedule request without consuming it
    pub fn resched_pending(&self) -> bool {
        self.need_resched.load(Ordering::Relaxed)
    }
}

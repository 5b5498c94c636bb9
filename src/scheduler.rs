//! WRR policy engine
//!
//! The five class operations (enqueue, dequeue, pick-next, tick, yield)
//! plus requeue, weight changes, execution accounting and initial CPU
//! placement. Every local operation takes exactly one run-queue lock;
//! cross-CPU work lives in `balance`.
//!
//! State machine per task: detached -> queued -> running -> queued ...
//! A running task stays linked in the FIFO; the queue's `curr` pointer is
//! what marks it as executing, so "running" is always unambiguous.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU64;
use hashbrown::HashMap;
use log::{debug, trace, warn};
use spin::{Mutex, Once};

use crate::affinity::MAX_CPUS;
use crate::error::{SchedError, SchedResult};
use crate::runqueue::CpuRq;
use crate::stats::SCHED_STATS;
use crate::task::{Task, TaskId};

bitflags::bitflags! {
    /// Placement flags for `enqueue`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnqueueFlags: u32 {
        /// Insert at the queue head instead of the tail (re-admitting a
        /// task that must run next, e.g. after a temporary detach)
        const HEAD = 1 << 0;
    }
}

/// The weighted round-robin scheduler: one run queue per CPU plus the
/// registry of tasks currently governed by this policy.
pub struct WrrScheduler {
    /// Per-CPU run queues, indexed by CPU number
    cpus: Vec<CpuRq>,

    /// Tasks attached to this policy
    tasks: Mutex<HashMap<TaskId, Arc<Task>>>,

    /// Wall-clock deadline (ms) of the next balancer pass
    pub(crate) next_balance_ms: AtomicU64,
}

impl WrrScheduler {
    /// Create a scheduler for `nr_cpus` CPUs (clamped to 1..=MAX_CPUS),
    /// all initially online with empty queues.
    pub fn new(nr_cpus: usize) -> Self {
        let nr_cpus = nr_cpus.clamp(1, MAX_CPUS);
        let cpus = (0..nr_cpus).map(CpuRq::new).collect();
        Self {
            cpus,
            tasks: Mutex::new(HashMap::new()),
            next_balance_ms: AtomicU64::new(0),
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Access one CPU's queue state (advisory loads, resched flag)
    pub fn cpu(&self, cpu: usize) -> Option<&CpuRq> {
        self.cpus.get(cpu)
    }

    pub(crate) fn rq(&self, cpu: usize) -> SchedResult<&CpuRq> {
        self.cpus.get(cpu).ok_or(SchedError::InvalidCpu { cpu })
    }

    /// Register a task with this policy (no queue placement yet)
    pub fn attach(&self, task: Arc<Task>) {
        let id = task.id();
        if self.tasks.lock().insert(id, task).is_some() {
            warn!("wrr: task {} attached twice, replacing", id);
        }
        debug!("wrr: task {} attached", id);
    }

    /// Remove a task from this policy, dequeuing it first if needed
    pub fn detach(&self, id: TaskId) -> SchedResult<Arc<Task>> {
        let task = self
            .tasks
            .lock()
            .remove(&id)
            .ok_or(SchedError::TaskNotFound { task: id })?;

        if task.is_queued() {
            self.dequeue(&task, task.cpu())?;
        }
        debug!("wrr: task {} detached", id);
        Ok(task)
    }

    /// Look up an attached task
    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.lock().get(&id).cloned()
    }

    /// Link a task into `cpu`'s run queue. Idempotent: a task that is
    /// already queued somewhere is left where it is.
    pub fn enqueue(
        &self,
        task: &Arc<Task>,
        cpu: usize,
        flags: EnqueueFlags,
    ) -> SchedResult<()> {
        let cpu_rq = self.rq(cpu)?;
        if !cpu_rq.is_online() {
            return Err(SchedError::CpuOffline { cpu });
        }
        if !task.affinity().is_set(cpu) {
            return Err(SchedError::AffinityForbidden {
                task: task.id(),
                cpu,
            });
        }

        let mut rq = cpu_rq.rq.lock();
        if task.is_queued() || rq.position(task.id()).is_some() {
            trace!("wrr: task {} already queued, enqueue is a no-op", task.id());
            return Ok(());
        }

        rq.link(task.clone(), flags.contains(EnqueueFlags::HEAD));
        cpu_rq.publish(&rq);
        SCHED_STATS.record_enqueue();
        debug!(
            "wrr: task {} (weight {}) enqueued on cpu {} ({} running, weight {})",
            task.id(),
            task.weight(),
            cpu,
            rq.nr_running(),
            rq.total_weight()
        );
        Ok(())
    }

    /// Unlink a task from `cpu`'s run queue. Calling it again, or for a
    /// task that was never queued here, is a no-op.
    pub fn dequeue(&self, task: &Task, cpu: usize) -> SchedResult<()> {
        let cpu_rq = self.rq(cpu)?;
        let mut rq = cpu_rq.rq.lock();

        match rq.unlink(task.id()) {
            Some(_) => {
                cpu_rq.publish(&rq);
                SCHED_STATS.record_dequeue();
                debug!("wrr: task {} dequeued from cpu {}", task.id(), cpu);
                Ok(())
            }
            None if task.is_queued() && task.cpu() == cpu => {
                // Membership flag says queued here but the FIFO disagrees
                warn!(
                    "wrr: dequeue of task {} on cpu {} found no entry",
                    task.id(),
                    cpu
                );
                Err(SchedError::QueueUnderflow { cpu })
            }
            None => Ok(()),
        }
    }

    /// Move an already-queued task to the tail (round-robin rotation).
    /// No-op if the task is not queued on `cpu`.
    pub fn requeue(&self, task: &Task, cpu: usize) -> SchedResult<()> {
        let cpu_rq = self.rq(cpu)?;
        let mut rq = cpu_rq.rq.lock();
        rq.move_to_tail(task.id());
        Ok(())
    }

    /// Voluntary relinquishment: rotate the running task to the tail
    /// without touching its timeslice.
    pub fn yield_task(&self, cpu: usize) -> SchedResult<()> {
        let cpu_rq = self.rq(cpu)?;
        let mut rq = cpu_rq.rq.lock();

        if let Some(curr) = rq.curr().cloned() {
            rq.move_to_tail(curr.id());
            SCHED_STATS.record_yield();
            trace!("wrr: task {} yielded cpu {}", curr.id(), cpu);
        }
        Ok(())
    }

    /// Select the next task to run on `cpu`: the FIFO head, or `None`
    /// when nothing is runnable. Marks the selection as the CPU's running
    /// task and stamps its execution start; the FIFO order itself is not
    /// changed.
    pub fn pick_next(&self, cpu: usize, now_ns: u64) -> SchedResult<Option<Arc<Task>>> {
        let cpu_rq = self.rq(cpu)?;
        let mut rq = cpu_rq.rq.lock();

        let next = match rq.head().cloned() {
            Some(next) => next,
            None => {
                rq.set_curr(None);
                return Ok(None);
            }
        };

        SCHED_STATS.record_pick();
        let prev_id = rq.curr().map(|c| c.id());
        if prev_id != Some(next.id()) {
            if let Some(prev) = rq.curr() {
                prev.clear_exec();
            }
            next.start_exec(now_ns);
            rq.set_curr(Some(next.clone()));
            SCHED_STATS.record_switch();
            trace!("wrr: cpu {} now running task {}", cpu, next.id());
        }
        Ok(Some(next))
    }

    /// Per-tick driver for the running task: account execution time, burn
    /// one tick of quantum, and on expiry refill and rotate. The only
    /// queued task is exempt: it keeps running without a reschedule.
    pub fn task_tick(&self, cpu: usize, now_ns: u64) -> SchedResult<()> {
        let cpu_rq = self.rq(cpu)?;
        let mut rq = cpu_rq.rq.lock();

        let curr = match rq.curr().cloned() {
            Some(curr) => curr,
            None => return Ok(()),
        };

        curr.account_exec(now_ns);

        if curr.tick_timeslice() > 0 {
            return Ok(());
        }

        curr.refill_timeslice();
        if rq.nr_running() > 1 {
            rq.move_to_tail(curr.id());
            cpu_rq.request_resched();
            SCHED_STATS.record_preemption();
            debug!(
                "wrr: task {} expired its quantum on cpu {}, requeued",
                curr.id(),
                cpu
            );
        }
        Ok(())
    }

    /// Quantum granted to `task` per selection, in ticks
    pub fn get_timeslice(&self, task: &Task) -> u32 {
        task.timeslice()
    }

    /// Fold elapsed execution time of `cpu`'s running task into its
    /// statistics. Non-positive deltas are skipped.
    pub fn update_curr(&self, cpu: usize, now_ns: u64) -> SchedResult<()> {
        let cpu_rq = self.rq(cpu)?;
        let rq = cpu_rq.rq.lock();

        if let Some(curr) = rq.curr() {
            if curr.account_exec(now_ns) == 0 {
                trace!("wrr: skipped accounting for task {} on cpu {}", curr.id(), cpu);
            }
        }
        Ok(())
    }

    /// Change a task's weight, keeping the owning queue's `total_weight`
    /// consistent. The new quantum length applies from the next refill.
    pub fn set_weight(&self, task: &Task, weight: u32) -> SchedResult<()> {
        let weight = weight.max(1);

        if task.is_queued() {
            let cpu_rq = self.rq(task.cpu())?;
            let mut rq = cpu_rq.rq.lock();
            if rq.position(task.id()).is_some() {
                rq.adjust_weight(task.weight(), weight);
                task.store_weight(weight);
                cpu_rq.publish(&rq);
                return Ok(());
            }
        }

        task.store_weight(weight);
        Ok(())
    }

    /// Initial placement: the online CPU with the least advisory load
    /// among those the task's affinity allows; ties go to the lowest
    /// index. `None` when the mask excludes every online CPU.
    pub fn select_cpu(&self, task: &Task) -> Option<usize> {
        let affinity = task.affinity();
        let mut best: Option<(usize, u64)> = None;

        for cpu_rq in &self.cpus {
            if !cpu_rq.is_online() || !affinity.is_set(cpu_rq.cpu()) {
                continue;
            }
            let load = cpu_rq.load_weight();
            match best {
                Some((_, best_load)) if load >= best_load => {}
                _ => best = Some((cpu_rq.cpu(), load)),
            }
        }

        if best.is_none() {
            debug!("wrr: no eligible cpu for task {}", task.id());
        }
        best.map(|(cpu, _)| cpu)
    }
}

/// Global scheduler instance, set up once by `init`
static SCHED: Once<WrrScheduler> = Once::new();

/// Initialize the global scheduler for `nr_cpus` CPUs. Subsequent calls
/// return the existing instance.
pub fn init(nr_cpus: usize) -> &'static WrrScheduler {
    SCHED.call_once(|| {
        debug!("wrr: scheduler initialized for {} cpus", nr_cpus);
        WrrScheduler::new(nr_cpus)
    })
}

/// The global scheduler, if `init` has run
pub fn scheduler() -> Option<&'static WrrScheduler> {
    SCHED.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::CpuMask;
    use crate::task::BASE_TIMESLICE;

    fn sched(nr_cpus: usize) -> WrrScheduler {
        WrrScheduler::new(nr_cpus)
    }

    fn spawn(s: &WrrScheduler, id: TaskId, weight: u32, cpu: usize) -> Arc<Task> {
        let task = Arc::new(Task::new(id, weight));
        s.attach(task.clone());
        s.enqueue(&task, cpu, EnqueueFlags::empty()).unwrap();
        task
    }

    /// Drive cpu 0 until the running task's quantum expires; returns the
    /// number of ticks it took.
    fn ticks_until_resched(s: &WrrScheduler, cpu: usize, limit: u32) -> u32 {
        for tick in 1..=limit {
            s.task_tick(cpu, 0).unwrap();
            if s.cpu(cpu).unwrap().take_resched() {
                return tick;
            }
        }
        panic!("no reschedule within {} ticks", limit);
    }

    #[test]
    fn test_round_robin_fairness_three_cycles() {
        let s = sched(1);
        for id in 1..=3 {
            spawn(&s, id, 1, 0);
        }

        let mut order = Vec::new();
        for _ in 0..9 {
            let picked = s.pick_next(0, 0).unwrap().unwrap();
            order.push(picked.id());
            assert_eq!(ticks_until_resched(&s, 0, BASE_TIMESLICE + 1), BASE_TIMESLICE);
        }
        assert_eq!(order, [1, 2, 3, 1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_weight_proportional_quantum() {
        for weight in [1u32, 5, 10] {
            let s = sched(1);
            let heavy = spawn(&s, 1, weight, 0);
            spawn(&s, 2, 1, 0);

            let picked = s.pick_next(0, 0).unwrap().unwrap();
            assert_eq!(picked.id(), heavy.id());
            assert_eq!(
                ticks_until_resched(&s, 0, weight * BASE_TIMESLICE + 1),
                weight * BASE_TIMESLICE
            );
        }
    }

    #[test]
    fn test_single_runnable_never_preempted() {
        let s = sched(1);
        let task = spawn(&s, 1, 1, 0);
        s.pick_next(0, 0).unwrap().unwrap();

        for _ in 0..3 * BASE_TIMESLICE {
            s.task_tick(0, 0).unwrap();
            assert!(!s.cpu(0).unwrap().resched_pending());
        }
        // Quantum kept refilling, the task never moved
        let again = s.pick_next(0, 0).unwrap().unwrap();
        assert_eq!(again.id(), task.id());
        assert!(task.remaining_timeslice() <= task.timeslice());
    }

    #[test]
    fn test_dequeue_idempotent() {
        let s = sched(1);
        let task = spawn(&s, 1, 3, 0);

        s.dequeue(&task, 0).unwrap();
        let cpu = s.cpu(0).unwrap();
        assert_eq!(cpu.load_weight(), 0);
        assert_eq!(cpu.nr_queued(), 0);

        // Second call is a no-op, counters unchanged
        s.dequeue(&task, 0).unwrap();
        assert_eq!(cpu.load_weight(), 0);
        assert_eq!(cpu.nr_queued(), 0);
    }

    #[test]
    fn test_enqueue_idempotent() {
        let s = sched(1);
        let task = spawn(&s, 1, 2, 0);
        s.enqueue(&task, 0, EnqueueFlags::empty()).unwrap();
        assert_eq!(s.cpu(0).unwrap().nr_queued(), 1);
        assert_eq!(s.cpu(0).unwrap().load_weight(), 2);
    }

    #[test]
    fn test_head_placement_runs_next() {
        let s = sched(1);
        spawn(&s, 1, 1, 0);
        spawn(&s, 2, 1, 0);

        let urgent = Arc::new(Task::new(3, 1));
        s.attach(urgent.clone());
        s.enqueue(&urgent, 0, EnqueueFlags::HEAD).unwrap();

        let picked = s.pick_next(0, 0).unwrap().unwrap();
        assert_eq!(picked.id(), 3);
    }

    #[test]
    fn test_yield_rotates_without_timeslice_cost() {
        let s = sched(1);
        let a = spawn(&s, 1, 1, 0);
        spawn(&s, 2, 1, 0);

        s.pick_next(0, 0).unwrap();
        s.task_tick(0, 0).unwrap();
        let before = a.remaining_timeslice();

        s.yield_task(0).unwrap();
        assert_eq!(a.remaining_timeslice(), before);
        assert_eq!(s.pick_next(0, 0).unwrap().unwrap().id(), 2);
    }

    #[test]
    fn test_select_cpu_least_loaded_lowest_index() {
        let s = sched(3);
        spawn(&s, 1, 5, 0);
        spawn(&s, 2, 2, 1);

        let task = Task::new(3, 1);
        // cpu 2 is empty, lightest
        assert_eq!(s.select_cpu(&task), Some(2));

        spawn(&s, 4, 2, 2);
        // cpus 1 and 2 now tie at weight 2: lowest index wins
        assert_eq!(s.select_cpu(&task), Some(1));
    }

    #[test]
    fn test_select_cpu_respects_affinity() {
        let s = sched(2);
        spawn(&s, 1, 9, 0);

        let pinned = Task::with_affinity(2, 1, CpuMask::single(0));
        assert_eq!(s.select_cpu(&pinned), Some(0));

        let nowhere = Task::with_affinity(3, 1, CpuMask::empty());
        assert_eq!(s.select_cpu(&nowhere), None);
    }

    #[test]
    fn test_enqueue_rejects_forbidden_cpu() {
        let s = sched(2);
        let pinned = Arc::new(Task::with_affinity(1, 1, CpuMask::single(0)));
        s.attach(pinned.clone());

        assert_eq!(
            s.enqueue(&pinned, 1, EnqueueFlags::empty()),
            Err(SchedError::AffinityForbidden { task: 1, cpu: 1 })
        );
    }

    #[test]
    fn test_set_weight_updates_queue_totals() {
        let s = sched(1);
        let task = spawn(&s, 1, 2, 0);
        spawn(&s, 2, 1, 0);
        assert_eq!(s.cpu(0).unwrap().load_weight(), 3);

        s.set_weight(&task, 6).unwrap();
        assert_eq!(task.weight(), 6);
        assert_eq!(s.cpu(0).unwrap().load_weight(), 7);

        // Quantum length follows the weight from the next refill
        assert_eq!(s.get_timeslice(&task), 6 * BASE_TIMESLICE);
    }

    #[test]
    fn test_detach_dequeues() {
        let s = sched(1);
        let task = spawn(&s, 1, 4, 0);

        let detached = s.detach(1).unwrap();
        assert_eq!(detached.id(), task.id());
        assert!(!task.is_queued());
        assert_eq!(s.cpu(0).unwrap().load_weight(), 0);

        assert_eq!(s.detach(1), Err(SchedError::TaskNotFound { task: 1 }));
    }

    #[test]
    fn test_update_curr_accumulates() {
        let s = sched(1);
        let task = spawn(&s, 1, 1, 0);

        s.pick_next(0, 1_000).unwrap();
        s.update_curr(0, 3_000).unwrap();
        assert_eq!(task.sum_exec_runtime(), 2_000);

        // Clock anomaly: skipped, totals unchanged
        s.update_curr(0, 2_500).unwrap();
        assert_eq!(task.sum_exec_runtime(), 2_000);
    }

    #[test]
    fn test_pick_next_empty_queue() {
        let s = sched(1);
        assert!(s.pick_next(0, 0).unwrap().is_none());
    }

    #[test]
    fn test_invalid_cpu() {
        let s = sched(2);
        let task = Arc::new(Task::new(1, 1));
        assert_eq!(
            s.enqueue(&task, 5, EnqueueFlags::empty()),
            Err(SchedError::InvalidCpu { cpu: 5 })
        );
    }
}

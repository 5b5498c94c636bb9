//! Scheduler error types
//!
//! Caller errors carry enough context to pinpoint the offending task or
//! CPU. Transient outcomes (no migration candidate, no eligible CPU for
//! placement) are *not* errors; they surface as `None` results.

use core::fmt;

use crate::task::TaskId;

/// Result alias for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors reported by the WRR policy operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Task is not registered with the scheduler
    TaskNotFound { task: TaskId },

    /// CPU index is outside the configured range
    InvalidCpu { cpu: usize },

    /// CPU exists but does not participate in scheduling
    CpuOffline { cpu: usize },

    /// Task's affinity mask forbids the requested CPU
    AffinityForbidden { task: TaskId, cpu: usize },

    /// Dequeue attempted against an empty run queue
    QueueUnderflow { cpu: usize },
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskNotFound { task } => {
                write!(f, "task {} not registered", task)
            }
            Self::InvalidCpu { cpu } => {
                write!(f, "cpu {} out of range", cpu)
            }
            Self::CpuOffline { cpu } => {
                write!(f, "cpu {} is offline", cpu)
            }
            Self::AffinityForbidden { task, cpu } => {
                write!(f, "task {} affinity forbids cpu {}", task, cpu)
            }
            Self::QueueUnderflow { cpu } => {
                write!(f, "dequeue on empty run queue of cpu {}", cpu)
            }
        }
    }
}

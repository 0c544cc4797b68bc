//! Units of work and their results.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::frame::{FrameState, Tick};
use super::snapshot::EngineSnapshot;

/// Identifier of a submitted frame computation.
///
/// Sequence numbers are unique for the lifetime of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskId {
    /// Dispatched to a worker.
    Compute(u64),
    /// Answered from the cache at submission; no computation was performed.
    Cached { seq: u64, tick: Tick },
}

impl TaskId {
    /// Pool-wide sequence number.
    pub fn seq(&self) -> u64 {
        match *self {
            TaskId::Compute(seq) | TaskId::Cached { seq, .. } => seq,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, TaskId::Cached { .. })
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Compute(seq) => write!(f, "task_{seq}"),
            TaskId::Cached { seq, tick } => write!(f, "cached_{tick}_{seq}"),
        }
    }
}

/// Who produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerId {
    /// Computed by worker `n`.
    Worker(usize),
    /// Served from the frame cache.
    Cache,
    /// Worker `n` failed on this task.
    Errored(usize),
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerId::Worker(n) => write!(f, "worker_{n}"),
            WorkerId::Cache => f.write_str("cache"),
            WorkerId::Errored(n) => write!(f, "error_worker_{n}"),
        }
    }
}

/// Lifecycle of a task: `Pending -> Running -> {Completed | Errored}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Errored,
}

/// Outcome carried by a [`FrameResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultStatus {
    Ok,
    /// Snapshot or computation failure, with detail.
    Error(String),
}

/// A frame computation handed to one worker.
#[derive(Debug)]
pub struct FrameTask {
    pub id: TaskId,
    pub tick: Tick,
    pub snapshot: EngineSnapshot,
}

/// Result of one frame computation.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub task_id: TaskId,
    pub tick: Tick,
    /// Computed state; empty on error.
    pub frame_state: Arc<FrameState>,
    pub worker_id: WorkerId,
    pub computation_time: Duration,
    pub status: ResultStatus,
}

impl FrameResult {
    /// Result served straight from the cache.
    pub fn cached(task_id: TaskId, frame_state: Arc<FrameState>) -> Self {
        Self {
            task_id,
            tick: frame_state.tick,
            frame_state,
            worker_id: WorkerId::Cache,
            computation_time: Duration::ZERO,
            status: ResultStatus::Ok,
        }
    }

    /// Failed result with an empty frame.
    pub fn errored(
        task_id: TaskId,
        tick: Tick,
        worker: usize,
        computation_time: Duration,
        message: String,
    ) -> Self {
        Self {
            task_id,
            tick,
            frame_state: Arc::new(FrameState::empty(tick)),
            worker_id: WorkerId::Errored(worker),
            computation_time,
            status: ResultStatus::Error(message),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }

    /// Task status implied by this result.
    pub fn task_status(&self) -> TaskStatus {
        if self.is_ok() {
            TaskStatus::Completed
        } else {
            TaskStatus::Errored
        }
    }
}

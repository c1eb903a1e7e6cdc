//! Tasks
//!
//! Executable units, their priority classes and the handles producers keep.

use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::idle::IdleDeadline;
use crate::trace::WrapperId;

/// Task ID counter
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

fn next_task_id() -> TaskId {
    TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
}

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Task priority classes, drained control > default > idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskPriority {
    /// Runs only inside idle periods
    Idle = 0,
    /// Normal engine work
    Default = 1,
    /// Scheduler-internal and input-critical work
    Control = 2,
}

impl TaskPriority {
    /// Get priority name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Default => "default",
            Self::Control => "control",
        }
    }
}

/// Lifecycle of a posted task as seen through its handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Queued, not yet dequeued
    Pending = 0,
    /// Dequeued and executing
    Running = 1,
    /// Ran to completion
    Completed = 2,
    /// Cancelled before dequeue; the body never ran
    Cancelled = 3,
    /// Discarded by shutdown or teardown, or abandoned by a panicking body
    Dropped = 4,
}

impl TaskStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Cancelled,
            _ => Self::Dropped,
        }
    }
}

/// State shared between a task and its handle.
///
/// The unit lives here rather than in the queue entry so that cancelling
/// releases the closure and everything it captured immediately, even while
/// the entry is still waiting in a delayed queue.
pub(crate) struct TaskCell {
    status: AtomicU8,
    unit: Mutex<Option<TaskUnit>>,
}

impl TaskCell {
    fn new(unit: TaskUnit) -> Self {
        Self {
            status: AtomicU8::new(TaskStatus::Pending as u8),
            unit: Mutex::new(Some(unit)),
        }
    }

    pub(crate) fn get(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Transition `from -> to`, failing if someone else moved it first
    pub(crate) fn transition(&self, from: TaskStatus, to: TaskStatus) -> Result<(), TaskStatus> {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TaskStatus::from_u8)
    }

    fn take_unit(&self) -> Option<TaskUnit> {
        self.unit.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl fmt::Debug for TaskCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCell").field("status", &self.get()).finish()
    }
}

/// Executable body of a task
pub(crate) enum TaskUnit {
    /// Control or default work
    Once(Box<dyn FnOnce() + Send + 'static>),
    /// Idle work receiving the remaining idle budget
    Idle(Box<dyn FnOnce(IdleDeadline) + Send + 'static>),
}

/// A queued task.
///
/// Owned by its queue until dequeued, then by the executing thread for the
/// duration of the call.
pub(crate) struct Task {
    pub id: TaskId,
    pub priority: TaskPriority,
    pub posted_from: &'static Location<'static>,
    pub queued_at: Instant,
    /// Not eligible for dequeue before this time
    pub run_at: Option<Instant>,
    /// Enqueue order, assigned by the owning queue set
    pub sequence: u64,
    /// Heap objects kept alive while the task is pending
    pub retains: Vec<WrapperId>,
    pub cell: Arc<TaskCell>,
}

impl Task {
    pub(crate) fn new(
        priority: TaskPriority,
        unit: TaskUnit,
        posted_from: &'static Location<'static>,
        queued_at: Instant,
        run_at: Option<Instant>,
    ) -> Self {
        Self {
            id: next_task_id(),
            priority,
            posted_from,
            queued_at,
            run_at,
            sequence: 0,
            retains: Vec::new(),
            cell: Arc::new(TaskCell::new(unit)),
        }
    }

    pub(crate) fn with_retains(mut self, retains: Vec<WrapperId>) -> Self {
        self.retains = retains;
        self
    }

    /// Handle for the producer
    pub(crate) fn handle(&self) -> TaskHandle {
        TaskHandle {
            id: self.id,
            cell: Arc::clone(&self.cell),
        }
    }

    /// Claim the task for execution and take its body; `None` if it was
    /// cancelled
    pub(crate) fn claim(&self) -> Option<TaskUnit> {
        self.cell.transition(TaskStatus::Pending, TaskStatus::Running).ok()?;
        let unit = self.cell.take_unit();
        debug_assert!(unit.is_some(), "{} claimed without a body", self.id);
        unit
    }

    /// Mark a never-run task as discarded
    pub(crate) fn discard(self) {
        if self.cell.transition(TaskStatus::Pending, TaskStatus::Dropped).is_ok() {
            drop(self.cell.take_unit());
        }
        tracing::trace!("Dropped {} ({}) posted from {}", self.id, self.priority.name(), self.posted_from);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cell.get() == TaskStatus::Cancelled
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("posted_from", &format_args!("{}", self.posted_from))
            .field("run_at", &self.run_at)
            .field("sequence", &self.sequence)
            .field("status", &self.cell.get())
            .finish()
    }
}

/// Producer-side handle to a posted task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    cell: Arc<TaskCell>,
}

impl TaskHandle {
    /// Task ID
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current status
    pub fn status(&self) -> TaskStatus {
        self.cell.get()
    }

    /// Still waiting in its queue?
    pub fn is_pending(&self) -> bool {
        self.status() == TaskStatus::Pending
    }

    /// Request cancellation.
    ///
    /// Returns `true` if the task was still queued; its body is dropped
    /// right away and will never run. Once a task has been dequeued it runs
    /// to completion and this returns `false`. Cancelling twice is a
    /// programmer error.
    pub fn cancel(&self) -> bool {
        match self.cell.transition(TaskStatus::Pending, TaskStatus::Cancelled) {
            Ok(()) => {
                drop(self.cell.take_unit());
                tracing::trace!("Cancelled {}", self.id);
                true
            }
            Err(TaskStatus::Cancelled) => {
                debug_assert!(false, "{} cancelled twice", self.id);
                tracing::warn!("{} cancelled twice", self.id);
                false
            }
            Err(_) => false,
        }
    }
}

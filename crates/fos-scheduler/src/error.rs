//! Scheduler errors

use std::thread::ThreadId;

/// Errors surfaced by the scheduling layer.
///
/// Posting to a scheduler that is shutting down is *not* an error: the task
/// is accepted and silently dropped. Only operations on a wrapper whose
/// scheduler has terminated are rejected.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Thread {thread:?} is detached: its scheduler has terminated")]
    DetachedThread { thread: ThreadId },

    #[error("Task was dropped before it produced a reply")]
    TaskDropped,

    #[error("Failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Scheduler thread exited during startup")]
    ThreadStartup,
}

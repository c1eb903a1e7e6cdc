//! Task retention tracing
//!
//! Tasks may keep heap objects alive until they run. The garbage collector
//! asks each scheduler which objects its pending and executing tasks retain.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Identity of a heap object (native or scripting side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WrapperId(pub u64);

impl fmt::Display for WrapperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One object retained by a queued or running task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRoot {
    /// Retaining task
    pub task: TaskId,
    /// Retained object
    pub object: WrapperId,
    /// Task is currently executing rather than queued
    pub executing: bool,
}

//! Task Observers
//!
//! Hooks invoked around every task the scheduler runs. "Will process" hooks
//! fire in registration order and "did process" hooks in reverse, so an
//! observer that acquires on enter and releases on exit always unwinds LIFO.
//!
//! The scheduler holds observers weakly. Registrants keep them alive and
//! remove them before dropping them.

use std::panic::Location;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::task::{TaskId, TaskPriority};

/// Description of the task being processed
#[derive(Debug, Clone, Copy)]
pub struct TaskInfo {
    pub id: TaskId,
    pub priority: TaskPriority,
    /// Call site that posted the task
    pub posted_from: &'static Location<'static>,
    pub queued_at: Instant,
}

/// Before/after hooks around each task
pub trait TaskObserver {
    /// Called before the task body runs
    fn will_process_task(&self, task: &TaskInfo);

    /// Called after the task body returns
    fn did_process_task(&self, task: &TaskInfo);
}

/// Timing hooks around each task
pub trait TaskTimeObserver {
    /// Called with the start time before the task body runs
    fn will_process_task(&self, _start: Instant) {}

    /// Called with the measured wall time once the task body returns
    fn did_process_task(&self, start: Instant, end: Instant);
}

/// Ordered, non-owning observer list
pub(crate) struct ObserverList<T: ?Sized> {
    entries: Vec<Weak<T>>,
}

impl<T: ?Sized> ObserverList<T> {
    pub(crate) fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub(crate) fn add(&mut self, observer: Weak<T>) {
        debug_assert!(
            !self.entries.iter().any(|e| e.ptr_eq(&observer)),
            "observer registered twice"
        );
        self.entries.push(observer);
    }

    /// Returns `true` if the observer was registered
    pub(crate) fn remove(&mut self, observer: &Weak<T>) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !e.ptr_eq(observer));
        self.entries.len() != before
    }

    /// Live observers in registration order, pruning dropped ones
    pub(crate) fn snapshot(&mut self) -> Vec<Rc<T>> {
        self.entries.retain(|e| e.strong_count() > 0);
        self.entries.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.strong_count() > 0).count()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

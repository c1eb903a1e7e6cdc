//! Task Queues
//!
//! One queue per priority class. Each queue keeps an immediate FIFO and a
//! delayed heap; delayed tasks move into the FIFO once their time arrives,
//! earliest eligibility first and posting order among equals.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Instant;

use crate::task::{Task, TaskPriority};

/// Delayed heap size below which cancelled entries are left for promotion
const DELAYED_PURGE_MIN: usize = 64;

/// Delayed heap entry, min-ordered by (run_at, sequence)
#[derive(Debug)]
struct DelayedTask {
    run_at: Instant,
    task: Task,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.task.sequence.cmp(&self.task.sequence))
    }
}

/// Queue for a single priority class
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    /// Eligible tasks in execution order
    immediate: VecDeque<Task>,
    /// Tasks waiting for their delay to elapse
    delayed: BinaryHeap<DelayedTask>,
    /// Delayed heap size that triggers the next purge
    purge_at: usize,
}

impl TaskQueue {
    /// Returns the number of cancelled delayed entries purged
    fn push(&mut self, task: Task) -> usize {
        match task.run_at {
            Some(run_at) => {
                let purged = self.purge_cancelled_delayed();
                self.delayed.push(DelayedTask { run_at, task });
                purged
            }
            None => {
                self.immediate.push_back(task);
                0
            }
        }
    }

    /// Drop cancelled entries once the heap has doubled since the last purge,
    /// so cancelled timeouts cannot pile up ahead of their run time
    fn purge_cancelled_delayed(&mut self) -> usize {
        if self.delayed.len() < self.purge_at.max(DELAYED_PURGE_MIN) {
            return 0;
        }
        let before = self.delayed.len();
        self.delayed.retain(|d| !d.task.is_cancelled());
        self.purge_at = self.delayed.len() * 2;
        before - self.delayed.len()
    }

    /// Move every delayed task whose time has come into the FIFO
    fn promote_ready(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while self.delayed.peek().is_some_and(|d| d.run_at <= now) {
            if let Some(entry) = self.delayed.pop() {
                self.immediate.push_back(entry.task);
                promoted += 1;
            }
        }
        promoted
    }

    /// Pop the next runnable task, discarding cancelled ones
    fn pop(&mut self, cancelled: &mut u64) -> Option<Task> {
        while let Some(task) = self.immediate.pop_front() {
            if task.is_cancelled() {
                *cancelled += 1;
                continue;
            }
            return Some(task);
        }
        None
    }

    fn has_ready(&self) -> bool {
        self.immediate.iter().any(|t| !t.is_cancelled())
    }

    fn next_run_time(&self) -> Option<Instant> {
        self.delayed.peek().map(|d| d.run_at)
    }

    fn ready_len(&self) -> usize {
        self.immediate.iter().filter(|t| !t.is_cancelled()).count()
    }

    fn delayed_len(&self) -> usize {
        self.delayed.iter().filter(|d| !d.task.is_cancelled()).count()
    }

    fn take_all(&mut self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.immediate.drain(..).collect();
        tasks.extend(self.delayed.drain().map(|d| d.task));
        tasks
    }

    fn iter(&self) -> impl Iterator<Item = &Task> {
        self.immediate.iter().chain(self.delayed.iter().map(|d| &d.task))
    }
}

/// The queues owned by one scheduler
#[derive(Debug, Default)]
pub(crate) struct TaskQueues {
    control: TaskQueue,
    default: TaskQueue,
    idle: TaskQueue,
    /// Enqueue order across all classes
    next_sequence: u64,
    /// Cancelled tasks discarded at dequeue
    cancelled: u64,
}

impl TaskQueues {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn queue(&self, priority: TaskPriority) -> &TaskQueue {
        match priority {
            TaskPriority::Control => &self.control,
            TaskPriority::Default => &self.default,
            TaskPriority::Idle => &self.idle,
        }
    }

    fn queue_mut(&mut self, priority: TaskPriority) -> &mut TaskQueue {
        match priority {
            TaskPriority::Control => &mut self.control,
            TaskPriority::Default => &mut self.default,
            TaskPriority::Idle => &mut self.idle,
        }
    }

    /// Enqueue a task, stamping its sequence number
    pub(crate) fn push(&mut self, mut task: Task) {
        task.sequence = self.next_sequence;
        self.next_sequence += 1;
        let purged = self.queue_mut(task.priority).push(task);
        if purged > 0 {
            self.cancelled += purged as u64;
            tracing::trace!("Purged {} cancelled delayed tasks", purged);
        }
    }

    /// Promote delayed tasks that are due in every class
    pub(crate) fn promote_ready(&mut self, now: Instant) {
        let promoted = self.control.promote_ready(now)
            + self.default.promote_ready(now)
            + self.idle.promote_ready(now);
        if promoted > 0 {
            tracing::trace!("Promoted {} delayed tasks", promoted);
        }
    }

    /// Next control or default task, highest class first
    pub(crate) fn pop_normal(&mut self) -> Option<Task> {
        if let Some(task) = self.control.pop(&mut self.cancelled) {
            return Some(task);
        }
        self.default.pop(&mut self.cancelled)
    }

    /// Next idle task
    pub(crate) fn pop_idle(&mut self) -> Option<Task> {
        self.idle.pop(&mut self.cancelled)
    }

    /// Any eligible control or default work?
    pub(crate) fn has_normal_ready(&self) -> bool {
        self.control.has_ready() || self.default.has_ready()
    }

    pub(crate) fn has_idle_ready(&self) -> bool {
        self.idle.has_ready()
    }

    /// Earliest time a delayed control or default task becomes eligible
    pub(crate) fn next_normal_run_time(&self) -> Option<Instant> {
        [self.control.next_run_time(), self.default.next_run_time()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Earliest time any delayed task becomes eligible
    pub(crate) fn next_run_time(&self) -> Option<Instant> {
        [self.next_normal_run_time(), self.idle.next_run_time()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Remove everything still queued in one class
    pub(crate) fn take_class(&mut self, priority: TaskPriority) -> Vec<Task> {
        self.queue_mut(priority).take_all()
    }

    /// Remove everything still queued
    pub(crate) fn take_all(&mut self) -> Vec<Task> {
        let mut tasks = self.control.take_all();
        tasks.extend(self.default.take_all());
        tasks.extend(self.idle.take_all());
        tasks
    }

    /// Visit every queued task
    pub(crate) fn for_each(&self, mut f: impl FnMut(&Task)) {
        for priority in [TaskPriority::Control, TaskPriority::Default, TaskPriority::Idle] {
            self.queue(priority).iter().for_each(&mut f);
        }
    }

    pub(crate) fn cancelled(&self) -> u64 {
        self.cancelled
    }

    /// Get pending count at each priority
    pub(crate) fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            control: self.control.ready_len(),
            default: self.default.ready_len(),
            idle: self.idle.ready_len(),
            delayed: self.control.delayed_len() + self.default.delayed_len() + self.idle.delayed_len(),
        }
    }
}

/// Pending task counts by priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Eligible control tasks
    pub control: usize,
    /// Eligible default tasks
    pub default: usize,
    /// Eligible idle tasks
    pub idle: usize,
    /// Tasks of any class still waiting on their delay
    pub delayed: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.control + self.default + self.idle + self.delayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskUnit;
    use std::panic::Location;
    use std::time::Duration;

    fn task(priority: TaskPriority, run_at: Option<Instant>) -> Task {
        Task::new(priority, TaskUnit::Once(Box::new(|| {})), Location::caller(), Instant::now(), run_at)
    }

    #[test]
    fn test_priority_order() {
        let mut queues = TaskQueues::new();
        let now = Instant::now();

        let idle = task(TaskPriority::Idle, None);
        let default = task(TaskPriority::Default, None);
        let control = task(TaskPriority::Control, None);
        let (idle_id, default_id, control_id) = (idle.id, default.id, control.id);

        queues.push(idle);
        queues.push(default);
        queues.push(control);
        queues.promote_ready(now);

        assert_eq!(queues.pop_normal().unwrap().id, control_id);
        assert_eq!(queues.pop_normal().unwrap().id, default_id);
        assert!(queues.pop_normal().is_none());
        assert_eq!(queues.pop_idle().unwrap().id, idle_id);
    }

    #[test]
    fn test_delayed_not_eligible_early() {
        let mut queues = TaskQueues::new();
        let now = Instant::now();
        queues.push(task(TaskPriority::Default, Some(now + Duration::from_millis(10))));

        queues.promote_ready(now);
        assert!(queues.pop_normal().is_none());
        assert_eq!(queues.next_normal_run_time(), Some(now + Duration::from_millis(10)));

        queues.promote_ready(now + Duration::from_millis(10));
        assert!(queues.pop_normal().is_some());
    }

    #[test]
    fn test_delayed_order_by_eligibility_then_sequence() {
        let mut queues = TaskQueues::new();
        let now = Instant::now();

        let late = task(TaskPriority::Default, Some(now + Duration::from_millis(10)));
        let tie_a = task(TaskPriority::Default, Some(now + Duration::from_millis(5)));
        let tie_b = task(TaskPriority::Default, Some(now + Duration::from_millis(5)));
        let ids = [tie_a.id, tie_b.id, late.id];

        queues.push(late);
        queues.push(tie_a);
        queues.push(tie_b);
        queues.promote_ready(now + Duration::from_millis(20));

        let order: Vec<_> = std::iter::from_fn(|| queues.pop_normal()).map(|t| t.id).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn test_cancelled_tasks_skipped() {
        let mut queues = TaskQueues::new();
        let first = task(TaskPriority::Default, None);
        let second = task(TaskPriority::Default, None);
        let second_id = second.id;
        first.handle().cancel();

        queues.push(first);
        queues.push(second);

        assert_eq!(queues.pending_counts().default, 1);
        assert_eq!(queues.pop_normal().unwrap().id, second_id);
        assert_eq!(queues.cancelled(), 1);
    }

    #[test]
    fn test_cancelled_delayed_tasks_purged() {
        let mut queues = TaskQueues::new();
        let later = Instant::now() + Duration::from_secs(3600);
        let live = task(TaskPriority::Default, Some(later));
        queues.push(live);

        for _ in 0..1000 {
            let timeout = task(TaskPriority::Default, Some(later));
            let handle = timeout.handle();
            queues.push(timeout);
            handle.cancel();
        }

        assert!(queues.default.delayed.len() <= 2 * DELAYED_PURGE_MIN);
        assert!(queues.cancelled() > 900);
        assert_eq!(queues.pending_counts().delayed, 1);
    }

    #[test]
    fn test_pending_counts() {
        let mut queues = TaskQueues::new();
        let now = Instant::now();
        queues.push(task(TaskPriority::Control, None));
        queues.push(task(TaskPriority::Idle, None));
        queues.push(task(TaskPriority::Default, Some(now + Duration::from_secs(1))));

        let counts = queues.pending_counts();
        assert_eq!(counts.control, 1);
        assert_eq!(counts.idle, 1);
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.total(), 3);
    }
}

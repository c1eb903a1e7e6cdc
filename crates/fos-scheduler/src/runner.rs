//! Task Runners
//!
//! Cheap, cloneable, `Send` handles for posting work to a scheduler's thread.
//! Posting never blocks on the consumer and never fails: once the scheduler
//! has begun shutting down, posted tasks are dropped without running.

use std::panic::Location;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::SchedulerError;
use crate::idle::IdleDeadline;
use crate::scheduler::Shared;
use crate::task::{Task, TaskHandle, TaskPriority, TaskUnit};
use crate::trace::WrapperId;

/// Posts control or default priority tasks
#[derive(Debug, Clone)]
pub struct TaskRunner {
    shared: Arc<Shared>,
    priority: TaskPriority,
}

impl TaskRunner {
    pub(crate) fn new(shared: Arc<Shared>, priority: TaskPriority) -> Self {
        Self { shared, priority }
    }

    /// Priority of tasks posted through this runner
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Is the calling thread the one these tasks run on?
    pub fn runs_tasks_on_current_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id()
    }

    fn post(&self, unit: TaskUnit, delay: Option<Duration>, retains: Vec<WrapperId>, from: &'static Location<'static>) -> TaskHandle {
        let now = self.shared.now();
        let task = Task::new(self.priority, unit, from, now, delay.map(|d| now + d)).with_retains(retains);
        self.shared.enqueue(task)
    }

    /// Post a task for execution as soon as possible
    #[track_caller]
    pub fn post_task<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(TaskUnit::Once(Box::new(task)), None, Vec::new(), Location::caller())
    }

    /// Post a task that may not run before `delay` has elapsed
    #[track_caller]
    pub fn post_delayed_task<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(TaskUnit::Once(Box::new(task)), Some(delay), Vec::new(), Location::caller())
    }

    /// Post a task that keeps the given heap objects alive until it has run
    #[track_caller]
    pub fn post_retaining_task<I, F>(&self, retains: I, task: F) -> TaskHandle
    where
        I: IntoIterator<Item = WrapperId>,
        F: FnOnce() + Send + 'static,
    {
        self.post(
            TaskUnit::Once(Box::new(task)),
            None,
            retains.into_iter().collect(),
            Location::caller(),
        )
    }

    /// Post a task and get its result back on the calling side
    #[track_caller]
    pub fn post_task_with_reply<T, F>(&self, task: F) -> TaskReply<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = smol::channel::bounded(1);
        let handle = self.post_task(move || {
            let _ = tx.try_send(task());
        });
        TaskReply { rx, handle }
    }
}

/// Posts idle tasks
#[derive(Debug, Clone)]
pub struct IdleTaskRunner {
    inner: TaskRunner,
}

impl IdleTaskRunner {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            inner: TaskRunner::new(shared, TaskPriority::Idle),
        }
    }

    pub fn runs_tasks_on_current_thread(&self) -> bool {
        self.inner.runs_tasks_on_current_thread()
    }

    /// Post a task to run during an idle period.
    ///
    /// The task receives the remaining budget. The budget is advisory: the
    /// task is expected to check it and yield by reposting itself.
    #[track_caller]
    pub fn post_idle_task<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce(IdleDeadline) + Send + 'static,
    {
        self.inner
            .post(TaskUnit::Idle(Box::new(task)), None, Vec::new(), Location::caller())
    }

    /// Post an idle task that only becomes eligible after `delay`
    #[track_caller]
    pub fn post_delayed_idle_task<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce(IdleDeadline) + Send + 'static,
    {
        self.inner
            .post(TaskUnit::Idle(Box::new(task)), Some(delay), Vec::new(), Location::caller())
    }
}

/// Result of a task posted with [`TaskRunner::post_task_with_reply`]
#[derive(Debug)]
pub struct TaskReply<T> {
    rx: smol::channel::Receiver<T>,
    handle: TaskHandle,
}

impl<T> TaskReply<T> {
    /// Handle of the underlying task
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    /// Wait for the result. Fails if the task was cancelled or dropped.
    pub async fn recv(self) -> Result<T, SchedulerError> {
        self.rx.recv().await.map_err(|_| SchedulerError::TaskDropped)
    }

    /// Block the calling thread until the result arrives
    pub fn wait(self) -> Result<T, SchedulerError> {
        smol::block_on(self.recv())
    }

    /// Result if the task has already run
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SchedulerConfig;
    use crate::scheduler::Scheduler;
    use crate::task::TaskStatus;

    #[test]
    fn test_runner_reports_thread() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let runner = scheduler.default_task_runner();
        assert!(runner.runs_tasks_on_current_thread());

        let remote = std::thread::spawn(move || runner.runs_tasks_on_current_thread())
            .join()
            .unwrap();
        assert!(!remote);
    }

    #[test]
    fn test_posted_from_is_caller() {
        use crate::observer::{TaskInfo, TaskObserver};
        use std::cell::Cell;
        use std::rc::Rc;

        struct LineCapture(Cell<Option<u32>>);

        impl TaskObserver for LineCapture {
            fn will_process_task(&self, task: &TaskInfo) {
                self.0.set(Some(task.posted_from.line()));
            }

            fn did_process_task(&self, _task: &TaskInfo) {}
        }

        let scheduler = Scheduler::new(SchedulerConfig::default());
        let capture = Rc::new(LineCapture(Cell::new(None)));
        scheduler.add_task_observer(&capture);

        let runner = scheduler.default_task_runner();
        let line = line!() + 1;
        runner.post_task(|| {});
        scheduler.run_until_idle();

        assert_eq!(capture.0.get(), Some(line));
    }

    #[test]
    fn test_reply_delivered() {
        let clock = Arc::new(ManualClock::new());
        let scheduler = Scheduler::with_clock(SchedulerConfig::default(), clock);
        let reply = scheduler.default_task_runner().post_task_with_reply(|| 6 * 7);

        assert!(reply.try_recv().is_none());
        scheduler.run_until_idle();
        assert_eq!(reply.wait().unwrap(), 42);
    }

    #[test]
    fn test_reply_of_cancelled_task_fails() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let reply = scheduler.default_task_runner().post_task_with_reply(|| "never");
        assert!(reply.handle().cancel());

        scheduler.run_until_idle();
        assert_eq!(reply.handle().status(), TaskStatus::Cancelled);
        assert!(matches!(reply.wait(), Err(SchedulerError::TaskDropped)));
    }

    #[test]
    fn test_cancel_fails_reply_before_queue_runs() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let reply = scheduler.default_task_runner().post_task_with_reply(|| "never");
        assert!(reply.handle().cancel());

        // The sender went with the body, so nothing waits on the run loop
        assert!(matches!(reply.wait(), Err(SchedulerError::TaskDropped)));
        assert_eq!(scheduler.stats().pending.total(), 0);
    }
}

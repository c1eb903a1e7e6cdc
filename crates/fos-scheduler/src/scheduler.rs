//! Renderer Scheduler
//!
//! One scheduler per renderer thread. It owns the control, default and idle
//! queues, drains them in priority order on its owning thread, and brackets
//! every task with the registered observers.
//!
//! Lifecycle: `Initializing -> Running -> ShuttingDown -> Terminated`.
//! Posting is accepted while initializing or running; afterwards tasks are
//! silently dropped. That drop is the expected outcome of racing a thread's
//! teardown, not an error.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::idle::{BeginFrameArgs, IdleDeadline, IdleHelper, IdlePeriodState};
use crate::observer::{ObserverList, TaskInfo, TaskObserver, TaskTimeObserver};
use crate::queue::{PendingCounts, TaskQueues};
use crate::runner::{IdleTaskRunner, TaskRunner};
use crate::task::{Task, TaskCell, TaskId, TaskPriority, TaskStatus, TaskUnit};
use crate::trace::{TaskRoot, WrapperId};

/// Scheduler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SchedulerState {
    /// Queues are being allocated
    Initializing = 0,
    /// Accepting and running tasks
    Running = 1,
    /// Draining already-queued control/default work once
    ShuttingDown = 2,
    /// Queues destroyed
    Terminated = 3,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initializing,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Terminated,
        }
    }

    /// Are new posts queued (rather than dropped)?
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, Self::Initializing | Self::Running)
    }
}

/// Task currently executing on the owning thread
#[derive(Debug)]
struct ExecutingTask {
    id: TaskId,
    retains: Vec<WrapperId>,
}

/// Occupies the executing slot for one dequeued task.
///
/// Dropping it clears the slot. A task still `Running` at that point unwound
/// out of its body and is marked `Dropped`.
struct ExecutingGuard<'a> {
    shared: &'a Shared,
    id: TaskId,
    cell: Arc<TaskCell>,
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        *self.shared.lock_executing() = None;
        if self.cell.transition(TaskStatus::Running, TaskStatus::Dropped).is_ok() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::error!("{} panicked on {:?}", self.id, self.shared.thread_id);
        }
    }
}

/// State shared between the owning thread and producers on other threads
#[derive(Debug)]
pub(crate) struct Shared {
    thread_id: ThreadId,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    queues: Mutex<TaskQueues>,
    /// Signalled on every post, quit and GC resume
    wakeup: Condvar,
    gc_pause_depth: AtomicUsize,
    quit: AtomicBool,
    executing: Mutex<Option<ExecutingTask>>,
    posted: AtomicU64,
    executed: AtomicU64,
    dropped: AtomicU64,
    /// Cancelled between dequeue and claim
    cancelled_late: AtomicU64,
    idle_overruns: AtomicU64,
}

impl Shared {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            thread_id: thread::current().id(),
            clock,
            state: AtomicU8::new(SchedulerState::Initializing as u8),
            queues: Mutex::new(TaskQueues::new()),
            wakeup: Condvar::new(),
            gc_pause_depth: AtomicUsize::new(0),
            quit: AtomicBool::new(false),
            executing: Mutex::new(None),
            posted: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            cancelled_late: AtomicU64::new(0),
            idle_overruns: AtomicU64::new(0),
        }
    }

    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    pub(crate) fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Only called with the queue lock held, so posts see a consistent state
    fn set_state(&self, _queues: &MutexGuard<'_, TaskQueues>, state: SchedulerState) {
        self.state.store(state as u8, Ordering::Release);
        tracing::debug!("Scheduler on {:?} -> {:?}", self.thread_id, state);
    }

    fn lock_queues(&self) -> MutexGuard<'_, TaskQueues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_executing(&self) -> MutexGuard<'_, Option<ExecutingTask>> {
        self.executing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a task to the owning thread, or drop it if teardown has begun
    pub(crate) fn enqueue(&self, task: Task) -> crate::task::TaskHandle {
        let handle = task.handle();
        self.posted.fetch_add(1, Ordering::Relaxed);

        let mut queues = self.lock_queues();
        if !self.state().accepts_tasks() {
            drop(queues);
            self.discard(std::iter::once(task));
            return handle;
        }
        queues.push(task);
        drop(queues);

        self.wakeup.notify_one();
        handle
    }

    /// Publish a task leaving the queues as executing, so a tracer never
    /// sees it in neither place
    fn mark_executing(&self, _queues: &MutexGuard<'_, TaskQueues>, task: &mut Task) -> ExecutingGuard<'_> {
        *self.lock_executing() = Some(ExecutingTask {
            id: task.id,
            retains: std::mem::take(&mut task.retains),
        });
        ExecutingGuard {
            shared: self,
            id: task.id,
            cell: Arc::clone(&task.cell),
        }
    }

    fn discard(&self, tasks: impl IntoIterator<Item = Task>) -> usize {
        let mut count = 0;
        for task in tasks {
            task.discard();
            count += 1;
        }
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    fn is_gc_paused(&self) -> bool {
        self.gc_pause_depth.load(Ordering::Acquire) > 0
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    /// Tasks posted, including those later dropped
    pub posted: u64,
    /// Task bodies run to completion
    pub executed: u64,
    /// Tasks cancelled before dequeue
    pub cancelled: u64,
    /// Tasks discarded by shutdown or teardown
    pub dropped: u64,
    /// Idle tasks that returned after their deadline
    pub idle_overruns: u64,
    pub pending: PendingCounts,
}

/// Per-thread task scheduler.
///
/// Not `Send`: it lives and dies on the thread that created it. Other threads
/// reach it through [`TaskRunner`], [`IdleTaskRunner`], [`SchedulerHandle`]
/// and [`QuitHandle`].
pub struct Scheduler {
    shared: Arc<Shared>,
    config: SchedulerConfig,
    idle: RefCell<IdleHelper>,
    task_observers: RefCell<ObserverList<dyn TaskObserver>>,
    time_observers: RefCell<ObserverList<dyn TaskTimeObserver>>,
}

impl Scheduler {
    /// Create a scheduler for the current thread
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a scheduler driven by the given clock
    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let shared = Arc::new(Shared::new(clock));
        tracing::debug!("Initializing scheduler on {:?}", shared.thread_id);

        let scheduler = Self {
            idle: RefCell::new(IdleHelper::new(config.clone())),
            task_observers: RefCell::new(ObserverList::new()),
            time_observers: RefCell::new(ObserverList::new()),
            shared,
            config,
        };

        let queues = scheduler.shared.lock_queues();
        scheduler.shared.set_state(&queues, SchedulerState::Running);
        drop(queues);

        tracing::info!("Scheduler running on {:?}", scheduler.shared.thread_id);
        scheduler
    }

    /// Owning thread
    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread_id
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Scheduler's time source
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.shared.clock)
    }

    /// Runner for normal-priority work
    pub fn default_task_runner(&self) -> TaskRunner {
        TaskRunner::new(Arc::clone(&self.shared), TaskPriority::Default)
    }

    /// Runner for control-priority work
    pub fn control_task_runner(&self) -> TaskRunner {
        TaskRunner::new(Arc::clone(&self.shared), TaskPriority::Control)
    }

    /// Runner for idle work
    pub fn idle_task_runner(&self) -> IdleTaskRunner {
        IdleTaskRunner::new(Arc::clone(&self.shared))
    }

    /// Thread-safe handle for coordination from other threads
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Handle that stops [`Scheduler::run`] from any thread
    pub fn quit_handle(&self) -> QuitHandle {
        QuitHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    fn check_running_for_registration(&self) -> bool {
        let state = self.state();
        debug_assert!(
            state == SchedulerState::Running,
            "observers can only be registered while running (state: {:?})",
            state
        );
        if state != SchedulerState::Running {
            tracing::warn!("Ignoring observer registration in state {:?}", state);
            return false;
        }
        true
    }

    /// Register a task observer. The scheduler does not keep it alive.
    pub fn add_task_observer<O: TaskObserver + 'static>(&self, observer: &Rc<O>) {
        if self.check_running_for_registration() {
            let observer: Rc<dyn TaskObserver> = observer.clone();
            self.task_observers.borrow_mut().add(Rc::downgrade(&observer));
        }
    }

    pub fn remove_task_observer<O: TaskObserver + 'static>(&self, observer: &Rc<O>) -> bool {
        let observer: Rc<dyn TaskObserver> = observer.clone();
        self.task_observers.borrow_mut().remove(&Rc::downgrade(&observer))
    }

    /// Register a task time observer. The scheduler does not keep it alive.
    pub fn add_task_time_observer<O: TaskTimeObserver + 'static>(&self, observer: &Rc<O>) {
        if self.check_running_for_registration() {
            let observer: Rc<dyn TaskTimeObserver> = observer.clone();
            self.time_observers.borrow_mut().add(Rc::downgrade(&observer));
        }
    }

    pub fn remove_task_time_observer<O: TaskTimeObserver + 'static>(&self, observer: &Rc<O>) -> bool {
        let observer: Rc<dyn TaskTimeObserver> = observer.clone();
        self.time_observers.borrow_mut().remove(&Rc::downgrade(&observer))
    }

    pub fn task_observer_count(&self) -> usize {
        self.task_observers.borrow().len()
    }

    // ------------------------------------------------------------------
    // Frame and input signals
    // ------------------------------------------------------------------

    /// A new frame has begun; ends any idle period
    pub fn will_begin_frame(&self, args: BeginFrameArgs) {
        self.idle.borrow_mut().will_begin_frame(args);
    }

    /// The frame was handed to the compositor; idle until the next frame
    pub fn did_commit_frame_to_compositor(&self) {
        let now = self.shared.now();
        self.idle.borrow_mut().did_commit_frame(now);
    }

    /// No frames for a while; long idle periods may start
    pub fn begin_frame_not_expected_soon(&self) {
        self.idle.borrow_mut().begin_frame_not_expected_soon();
    }

    /// An input event was handled; long idle periods wait for quiescence
    pub fn did_handle_input_event(&self) {
        let now = self.shared.now();
        self.idle.borrow_mut().did_handle_input(now);
    }

    pub fn idle_period_state(&self) -> IdlePeriodState {
        self.idle.borrow().state()
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Pick the next task: control, then default, then idle inside an idle period
    fn select_next(&self) -> Option<(Task, Option<IdleDeadline>, ExecutingGuard<'_>)> {
        let now = self.shared.now();
        let mut queues = self.shared.lock_queues();
        // Pauses are entered under this lock: nothing is dequeued after one
        if self.shared.is_gc_paused() {
            return None;
        }
        queues.promote_ready(now);

        let (mut task, deadline) = match queues.pop_normal() {
            Some(task) => (task, None),
            None => {
                if !queues.has_idle_ready() {
                    return None;
                }
                let next_work = queues.next_normal_run_time();
                let deadline = self
                    .idle
                    .borrow_mut()
                    .idle_deadline(now, next_work, &self.shared.clock)?;
                (queues.pop_idle()?, Some(deadline))
            }
        };
        let executing = self.shared.mark_executing(&queues, &mut task);
        Some((task, deadline, executing))
    }

    /// Run one eligible task. Returns `false` when nothing could run.
    pub fn run_next_task(&self) -> bool {
        if self.state() != SchedulerState::Running {
            return false;
        }
        if self.shared.is_gc_paused() {
            tracing::trace!("Run loop held: garbage collection in progress");
            return false;
        }

        while let Some((task, deadline, executing)) = self.select_next() {
            if self.execute(task, deadline, executing) {
                return true;
            }
        }
        false
    }

    /// Run tasks until none is eligible. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_next_task() {
            ran += 1;
        }
        ran
    }

    /// Run tasks, sleeping between them, until quit or shutdown
    pub fn run(&self) {
        tracing::debug!("Entering run loop on {:?}", self.shared.thread_id);
        while !self.shared.quit.load(Ordering::Acquire) && self.state() == SchedulerState::Running {
            if self.run_next_task() {
                continue;
            }
            self.wait_for_work();
        }
        self.shared.quit.store(false, Ordering::Release);
        tracing::debug!("Leaving run loop on {:?}", self.shared.thread_id);
    }

    fn wait_for_work(&self) {
        let now = self.shared.now();
        let idle_transition = self.idle.borrow().next_transition(now);
        let paused = self.shared.is_gc_paused();

        let queues = self.shared.lock_queues();
        if self.shared.quit.load(Ordering::Acquire) {
            return;
        }

        let mut timeout = self.config.idle_wait_bound;
        if !paused {
            if queues.has_normal_ready() {
                return;
            }
            for wake_at in [queues.next_run_time(), idle_transition].into_iter().flatten() {
                timeout = timeout.min(wake_at.saturating_duration_since(now));
            }
            if timeout.is_zero() {
                return;
            }
        }

        let _ = self
            .shared
            .wakeup
            .wait_timeout(queues, timeout)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Run one task with the observer bracket. Returns `false` if it was
    /// cancelled before it could be claimed.
    fn execute(&self, task: Task, deadline: Option<IdleDeadline>, executing: ExecutingGuard<'_>) -> bool {
        let Some(unit) = task.claim() else {
            self.shared.cancelled_late.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let info = TaskInfo {
            id: task.id,
            priority: task.priority,
            posted_from: task.posted_from,
            queued_at: task.queued_at,
        };
        let observers = self.task_observers.borrow_mut().snapshot();
        let time_observers = self.time_observers.borrow_mut().snapshot();

        for observer in &observers {
            observer.will_process_task(&info);
        }
        let start = self.shared.now();
        for observer in &time_observers {
            observer.will_process_task(start);
        }

        match unit {
            TaskUnit::Once(body) => body(),
            TaskUnit::Idle(body) => {
                let deadline = deadline
                    .clone()
                    .unwrap_or_else(|| IdleDeadline::new(start, Duration::ZERO, self.clock()));
                body(deadline)
            }
        }

        let end = self.shared.now();
        for observer in observers.iter().rev() {
            observer.did_process_task(&info);
        }
        for observer in &time_observers {
            observer.did_process_task(start, end);
        }

        let _ = executing.cell.transition(TaskStatus::Running, TaskStatus::Completed);
        drop(executing);
        self.shared.executed.fetch_add(1, Ordering::Relaxed);

        if let Some(deadline) = deadline {
            if end > deadline.deadline() {
                self.shared.idle_overruns.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Idle {} overran its deadline by {:?} (posted from {})",
                    info.id,
                    end - deadline.deadline(),
                    info.posted_from
                );
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop accepting work, run already-eligible control/default tasks once,
    /// then terminate and drop whatever is left.
    pub fn shutdown(&self) {
        if self.state() >= SchedulerState::ShuttingDown {
            return;
        }
        tracing::info!("Scheduler on {:?} shutting down", self.shared.thread_id);

        let now = self.shared.now();
        let idle = {
            let mut queues = self.shared.lock_queues();
            self.shared.set_state(&queues, SchedulerState::ShuttingDown);
            queues.promote_ready(now);
            queues.take_class(TaskPriority::Idle)
        };
        self.idle.borrow_mut().end_idle_period();
        self.shared.discard(idle);

        // Only work eligible above runs; nothing is promoted from here on
        loop {
            let (task, executing) = {
                let mut queues = self.shared.lock_queues();
                if self.shared.is_gc_paused() {
                    tracing::warn!(
                        "Shutdown during garbage collection; dropping {} queued tasks",
                        queues.pending_counts().total()
                    );
                    break;
                }
                let Some(mut task) = queues.pop_normal() else {
                    break;
                };
                let executing = self.shared.mark_executing(&queues, &mut task);
                (task, executing)
            };
            self.execute(task, None, executing);
        }

        self.terminate();
    }

    fn terminate(&self) {
        let leftovers = {
            let mut queues = self.shared.lock_queues();
            self.shared.set_state(&queues, SchedulerState::Terminated);
            queues.take_all()
        };
        let dropped = self.shared.discard(leftovers);

        self.task_observers.borrow_mut().clear();
        self.time_observers.borrow_mut().clear();
        self.shared.wakeup.notify_all();

        tracing::info!("Scheduler on {:?} terminated ({} tasks dropped)", self.shared.thread_id, dropped);
    }

    /// Get scheduler stats
    pub fn stats(&self) -> SchedulerStats {
        self.handle().stats()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.state() != SchedulerState::Terminated {
            self.terminate();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("thread_id", &self.shared.thread_id)
            .field("state", &self.state())
            .field("idle_period", &self.idle_period_state())
            .field("task_observers", &self.task_observer_count())
            .finish()
    }
}

/// Thread-safe view of a scheduler used for cross-thread coordination.
///
/// Stays valid after the scheduler is gone; it then reports `Terminated`.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread_id
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SchedulerState::Terminated
    }

    /// Runner for normal-priority work on this thread
    pub fn default_task_runner(&self) -> TaskRunner {
        TaskRunner::new(Arc::clone(&self.shared), TaskPriority::Default)
    }

    /// Hold the run loop: no task is dequeued until the matching resume
    pub fn enter_gc_pause(&self) {
        let queues = self.shared.lock_queues();
        let depth = self.shared.gc_pause_depth.fetch_add(1, Ordering::AcqRel) + 1;
        drop(queues);
        tracing::trace!("GC pause on {:?} (depth {})", self.shared.thread_id, depth);
    }

    /// Release one GC pause and wake the run loop
    pub fn exit_gc_pause(&self) {
        let result = self
            .shared
            .gc_pause_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1));
        debug_assert!(result.is_ok(), "GC pause released more times than entered");
        if result.is_err() {
            tracing::warn!("Unbalanced GC resume on {:?}", self.shared.thread_id);
        }
        self.shared.wakeup.notify_all();
    }

    pub fn is_gc_paused(&self) -> bool {
        self.shared.is_gc_paused()
    }

    /// Report every object retained by a queued or executing task
    pub fn trace_tasks(&self, visitor: &mut dyn FnMut(TaskRoot)) {
        {
            let queues = self.shared.lock_queues();
            queues.for_each(|task| {
                if task.is_cancelled() {
                    return;
                }
                for &object in &task.retains {
                    visitor(TaskRoot {
                        task: task.id,
                        object,
                        executing: false,
                    });
                }
            });
        }

        if let Some(executing) = self.shared.lock_executing().as_ref() {
            for &object in &executing.retains {
                visitor(TaskRoot {
                    task: executing.id,
                    object,
                    executing: true,
                });
            }
        }
    }

    /// Get scheduler stats
    pub fn stats(&self) -> SchedulerStats {
        let queues = self.shared.lock_queues();
        SchedulerStats {
            posted: self.shared.posted.load(Ordering::Relaxed),
            executed: self.shared.executed.load(Ordering::Relaxed),
            cancelled: queues.cancelled() + self.shared.cancelled_late.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            idle_overruns: self.shared.idle_overruns.load(Ordering::Relaxed),
            pending: queues.pending_counts(),
        }
    }
}

/// Stops a blocking [`Scheduler::run`] loop from any thread
#[derive(Debug, Clone)]
pub struct QuitHandle {
    shared: Arc<Shared>,
}

impl QuitHandle {
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        // Take the lock so a run loop about to wait cannot miss the signal
        drop(self.shared.lock_queues());
        self.shared.wakeup.notify_all();
    }
}

//! Scheduler Threads
//!
//! - `ThreadWrapper`: the engine-facing view of one thread's scheduler
//! - `ThreadRegistry`: explicit thread-identity lookup, no ambient globals
//! - `SchedulerThread`: a dedicated OS thread running its own scheduler

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::observer::{TaskObserver, TaskTimeObserver};
use crate::runner::{IdleTaskRunner, TaskRunner};
use crate::scheduler::{QuitHandle, Scheduler, SchedulerHandle, SchedulerState};

/// Engine-facing adapter over a thread's scheduler.
///
/// Holds no state of its own. Borrowing the scheduler keeps the wrapper from
/// outliving it; once the scheduler has terminated every call fails with
/// [`SchedulerError::DetachedThread`], so callers can tell a rejected request
/// apart from a post that was accepted and then dropped.
#[derive(Debug, Clone, Copy)]
pub struct ThreadWrapper<'a> {
    scheduler: &'a Scheduler,
}

impl<'a> ThreadWrapper<'a> {
    pub fn new(scheduler: &'a Scheduler) -> Self {
        Self { scheduler }
    }

    fn attached(&self) -> Result<&'a Scheduler, SchedulerError> {
        if self.scheduler.state() == SchedulerState::Terminated {
            return Err(SchedulerError::DetachedThread {
                thread: self.scheduler.thread_id(),
            });
        }
        Ok(self.scheduler)
    }

    /// Identity of the wrapped thread
    pub fn thread_id(&self) -> Result<ThreadId, SchedulerError> {
        Ok(self.attached()?.thread_id())
    }

    /// Is the caller running on the wrapped thread?
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.scheduler.thread_id()
    }

    /// Underlying scheduler
    pub fn scheduler(&self) -> Result<&'a Scheduler, SchedulerError> {
        self.attached()
    }

    /// Default-priority runner
    pub fn task_runner(&self) -> Result<TaskRunner, SchedulerError> {
        Ok(self.attached()?.default_task_runner())
    }

    /// Control-priority runner
    pub fn control_task_runner(&self) -> Result<TaskRunner, SchedulerError> {
        Ok(self.attached()?.control_task_runner())
    }

    /// Idle-priority runner
    pub fn idle_task_runner(&self) -> Result<IdleTaskRunner, SchedulerError> {
        Ok(self.attached()?.idle_task_runner())
    }

    pub fn add_task_observer<O: TaskObserver + 'static>(&self, observer: &Rc<O>) -> Result<(), SchedulerError> {
        self.attached()?.add_task_observer(observer);
        Ok(())
    }

    pub fn remove_task_observer<O: TaskObserver + 'static>(&self, observer: &Rc<O>) -> Result<bool, SchedulerError> {
        Ok(self.attached()?.remove_task_observer(observer))
    }

    pub fn add_task_time_observer<O: TaskTimeObserver + 'static>(
        &self,
        observer: &Rc<O>,
    ) -> Result<(), SchedulerError> {
        self.attached()?.add_task_time_observer(observer);
        Ok(())
    }

    pub fn remove_task_time_observer<O: TaskTimeObserver + 'static>(
        &self,
        observer: &Rc<O>,
    ) -> Result<bool, SchedulerError> {
        Ok(self.attached()?.remove_task_time_observer(observer))
    }
}

/// Maps thread identity to the scheduler running on that thread
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<HashMap<ThreadId, SchedulerHandle>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, SchedulerHandle>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a scheduler under its owning thread
    pub fn register(&self, scheduler: &Scheduler) {
        let handle = scheduler.handle();
        tracing::debug!("Registering scheduler for {:?}", handle.thread_id());
        if self.lock().insert(handle.thread_id(), handle).is_some() {
            tracing::warn!("Replaced a scheduler registration for {:?}", scheduler.thread_id());
        }
    }

    pub fn unregister(&self, thread: ThreadId) -> bool {
        self.lock().remove(&thread).is_some()
    }

    /// Scheduler for a thread, if one is registered and not terminated
    pub fn lookup(&self, thread: ThreadId) -> Option<SchedulerHandle> {
        let mut threads = self.lock();
        match threads.get(&thread) {
            Some(handle) if handle.is_terminated() => {
                threads.remove(&thread);
                None
            }
            Some(handle) => Some(handle.clone()),
            None => None,
        }
    }

    /// Scheduler for the calling thread
    pub fn current(&self) -> Option<SchedulerHandle> {
        self.lookup(thread::current().id())
    }

    /// Every registered scheduler that has not terminated
    pub fn live_threads(&self) -> Vec<SchedulerHandle> {
        let mut threads = self.lock();
        threads.retain(|_, handle| !handle.is_terminated());
        threads.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.live_threads().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runners handed back by a freshly started scheduler thread
struct Startup {
    default_runner: TaskRunner,
    control_runner: TaskRunner,
    idle_runner: IdleTaskRunner,
    handle: SchedulerHandle,
    quit: QuitHandle,
}

/// Dedicated OS thread running its own scheduler
#[derive(Debug)]
pub struct SchedulerThread {
    name: String,
    default_runner: TaskRunner,
    control_runner: TaskRunner,
    idle_runner: IdleTaskRunner,
    handle: SchedulerHandle,
    quit: QuitHandle,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerThread {
    /// Spawn a thread, create its scheduler and run `init` on it before the
    /// run loop starts. Returns once the thread is accepting tasks.
    pub fn spawn<F>(
        name: &str,
        config: SchedulerConfig,
        registry: Option<Arc<ThreadRegistry>>,
        init: F,
    ) -> Result<Self, SchedulerError>
    where
        F: FnOnce(&ThreadWrapper<'_>) + Send + 'static,
    {
        let (tx, rx) = smol::channel::bounded(1);

        let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
            let scheduler = Scheduler::new(config);
            if let Some(registry) = &registry {
                registry.register(&scheduler);
            }

            init(&ThreadWrapper::new(&scheduler));

            let startup = Startup {
                default_runner: scheduler.default_task_runner(),
                control_runner: scheduler.control_task_runner(),
                idle_runner: scheduler.idle_task_runner(),
                handle: scheduler.handle(),
                quit: scheduler.quit_handle(),
            };
            if tx.send_blocking(startup).is_ok() {
                scheduler.run();
            }

            scheduler.shutdown();
            if let Some(registry) = &registry {
                registry.unregister(scheduler.thread_id());
            }
        })?;

        let startup = rx.recv_blocking().map_err(|_| SchedulerError::ThreadStartup)?;
        tracing::info!("Spawned scheduler thread '{}' ({:?})", name, startup.handle.thread_id());

        Ok(Self {
            name: name.to_string(),
            default_runner: startup.default_runner,
            control_runner: startup.control_runner,
            idle_runner: startup.idle_runner,
            handle: startup.handle,
            quit: startup.quit,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_id(&self) -> ThreadId {
        self.handle.thread_id()
    }

    pub fn task_runner(&self) -> TaskRunner {
        self.default_runner.clone()
    }

    pub fn control_task_runner(&self) -> TaskRunner {
        self.control_runner.clone()
    }

    pub fn idle_task_runner(&self) -> IdleTaskRunner {
        self.idle_runner.clone()
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Quit the run loop, shut the scheduler down and join the thread
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.quit.quit();
            if thread.join().is_err() {
                tracing::error!("Scheduler thread '{}' panicked", self.name);
            } else {
                tracing::info!("Scheduler thread '{}' stopped", self.name);
            }
        }
    }
}

impl Drop for SchedulerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

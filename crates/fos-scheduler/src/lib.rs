//! fOS Scheduler
//!
//! Per-thread task scheduling for renderer threads.
//!
//! # Overview
//! - Control, default and idle priority task queues owned by one thread
//! - Delayed tasks ordered by eligibility time, then posting order
//! - Idle tasks dispatched only inside idle periods, with a cooperative deadline
//! - Task observers bracketing every task (forward before, reverse after)
//! - A thin [`ThreadWrapper`] view for the rest of the engine
//!
//! Producers post from any thread through [`TaskRunner`] and
//! [`IdleTaskRunner`]; only the owning thread ever runs the tasks.
//!
//! # Example
//! ```rust,ignore
//! use fos_scheduler::{Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default());
//! let runner = scheduler.default_task_runner();
//! runner.post_task(|| tracing::info!("hello from the renderer thread"));
//! scheduler.run_until_idle();
//! ```

mod clock;
mod config;
mod error;
mod idle;
mod observer;
mod queue;
mod runner;
mod scheduler;
mod task;
mod thread;
mod trace;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use idle::{BeginFrameArgs, IdleDeadline, IdlePeriodState};
pub use observer::{TaskInfo, TaskObserver, TaskTimeObserver};
pub use queue::PendingCounts;
pub use runner::{IdleTaskRunner, TaskReply, TaskRunner};
pub use scheduler::{QuitHandle, Scheduler, SchedulerHandle, SchedulerState, SchedulerStats};
pub use task::{TaskHandle, TaskId, TaskPriority, TaskStatus};
pub use thread::{SchedulerThread, ThreadRegistry, ThreadWrapper};
pub use trace::{TaskRoot, WrapperId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Deferred task execution for debounced teardown.
//!
//! The cache never sleeps. It hands a task and a delay to a [`Scheduler`],
//! which runs the task once the delay has elapsed. [`TimerThread`] does this
//! on a background thread with real time, [`ManualScheduler`] on a virtual
//! clock advanced by the caller.

mod manual;
mod timer;

pub use manual::ManualScheduler;
pub use timer::TimerThread;

use std::time::Duration;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed. Tasks may call back into
    /// whatever scheduled them.
    fn schedule(&self, delay: Duration, task: Task);
}

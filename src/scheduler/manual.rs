//! Virtual-clock scheduler.

use super::{Scheduler, Task};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    tasks: BTreeMap<(Duration, u64), Task>,
}

/// Scheduler driven by an explicit clock.
///
/// Nothing runs until [`advance`](Self::advance) moves the clock past a
/// task's deadline, which makes grace windows testable without sleeping.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward and run every task that became due, in
    /// deadline order. Returns how many ran.
    pub fn advance(&self, by: Duration) -> usize {
        let now = {
            let mut state = self.state.lock();
            state.now += by;
            state.now
        };

        let mut ran = 0;
        loop {
            // Tasks run without the lock so they can schedule more work.
            let task = {
                let mut state = self.state.lock();
                match state.tasks.keys().next().copied() {
                    Some(slot) if slot.0 <= now => state.tasks.remove(&slot),
                    _ => None,
                }
            };
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Tasks still waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.state.lock().tasks.len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let mut state = self.state.lock();
        state.next_id += 1;
        let slot = (state.now + delay, state.next_id);
        state.tasks.insert(slot, task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_advance_runs_only_due_tasks() {
        let scheduler = ManualScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (delay, name) in [(5, "five"), (1, "one"), (3, "three")] {
            let log = Arc::clone(&log);
            scheduler.schedule(
                Duration::from_secs(delay),
                Box::new(move || log.lock().push(name)),
            );
        }

        assert_eq!(scheduler.advance(Duration::from_secs(3)), 2);
        assert_eq!(*log.lock(), vec!["one", "three"]);
        assert_eq!(scheduler.pending(), 1);

        assert_eq!(scheduler.advance(Duration::from_secs(2)), 1);
        assert_eq!(*log.lock(), vec!["one", "three", "five"]);
        assert_eq!(scheduler.now(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_delay_task_waits_for_advance() {
        let scheduler = Arc::new(ManualScheduler::new());
        let fired = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fired);
        scheduler.schedule(Duration::ZERO, Box::new(move || *flag.lock() = true));

        assert!(!*fired.lock());
        assert_eq!(scheduler.advance(Duration::ZERO), 1);
        assert!(*fired.lock());
    }

    #[test]
    fn test_task_can_schedule_more_work() {
        let scheduler = Arc::new(ManualScheduler::new());
        let inner = Arc::clone(&scheduler);
        scheduler.schedule(
            Duration::from_secs(1),
            Box::new(move || inner.schedule(Duration::ZERO, Box::new(|| {}))),
        );

        assert_eq!(scheduler.advance(Duration::from_secs(1)), 2);
        assert_eq!(scheduler.pending(), 0);
    }
}

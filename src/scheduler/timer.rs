//! Background timer thread.

use super::{Scheduler, Task};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::thread;
use std::time::{Duration, Instant};

/// Runs scheduled tasks on a dedicated thread.
///
/// The thread exits once the `TimerThread` is dropped. Tasks that have not
/// fired by then are discarded.
pub struct TimerThread {
    sender: Sender<(Instant, Task)>,
}

impl TimerThread {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded::<(Instant, Task)>();

        let spawned = thread::Builder::new()
            .name("docket-cache-timer".into())
            .spawn(move || {
                let mut deadlines: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
                let mut tasks: HashMap<u64, Task> = HashMap::new();
                let mut next_id = 0u64;

                loop {
                    let now = Instant::now();
                    while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
                        if deadline > now {
                            break;
                        }
                        deadlines.pop();
                        if let Some(task) = tasks.remove(&id) {
                            task();
                        }
                    }

                    let received = match deadlines.peek() {
                        Some(Reverse((deadline, _))) => receiver.recv_deadline(*deadline),
                        None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };

                    match received {
                        Ok((deadline, task)) => {
                            next_id += 1;
                            deadlines.push(Reverse((deadline, next_id)));
                            tasks.insert(next_id, task);
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                tracing::debug!(dropped = tasks.len(), "timer thread stopped");
            });

        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn timer thread; teardowns will not fire");
        }

        Self { sender }
    }
}

impl Default for TimerThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TimerThread {
    fn schedule(&self, delay: Duration, task: Task) {
        if self.sender.send((Instant::now() + delay, task)).is_err() {
            tracing::warn!("timer thread is gone; scheduled task dropped");
        }
    }
}

//! Timeout scheduler owned by a channel group.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send>;

/// A single thread running delayed jobs.
#[derive(Debug)]
pub(crate) struct Timer {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<TimerState>,

    /// Signalled when the earliest deadline changes or the timer shuts down.
    changed: Condvar,
}

struct TimerState {
    /// Deadlines ordered earliest first.
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,

    /// Jobs that are still scheduled. Cancelled jobs leave a stale deadline behind.
    jobs: HashMap<u64, Job>,

    next_id: u64,
    shutdown: bool,
}

impl std::fmt::Debug for TimerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerState")
            .field("scheduled", &self.jobs.len())
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

/// Cancels a scheduled job.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    id: u64,
    shared: Weak<Shared>,
}

impl TimerHandle {
    /// Cancel the job. Returns `false` if it already ran or was cancelled.
    pub(crate) fn cancel(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => lock!(shared.state.lock()).jobs.remove(&self.id).is_some(),
            None => false,
        }
    }
}

impl Timer {
    /// Start the timer thread.
    pub(crate) fn new(name: &str) -> io::Result<Timer> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                deadlines: BinaryHeap::new(),
                jobs: HashMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });

        thread::Builder::new().name(format!("{}-timer", name)).spawn({
            let shared = shared.clone();
            move || shared.run()
        })?;

        Ok(Timer { shared })
    }

    /// Run `job` after `delay`. Returns `None` once the timer is shut down.
    pub(crate) fn schedule(
        &self,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> Option<TimerHandle> {
        let mut state = lock!(self.shared.state.lock());
        if state.shutdown {
            return None;
        }

        let id = state.next_id;
        state.next_id += 1;

        let deadline = Instant::now()
            .checked_add(delay)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(60 * 60 * 24 * 365));
        state.deadlines.push(Reverse((deadline, id)));
        state.jobs.insert(id, Box::new(job));
        self.shared.changed.notify_one();

        Some(TimerHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Drop every scheduled job and stop the thread.
    pub(crate) fn shutdown(&self) {
        let mut state = lock!(self.shared.state.lock());
        state.shutdown = true;
        state.jobs.clear();
        state.deadlines.clear();
        self.shared.changed.notify_all();
    }
}

impl Shared {
    fn run(&self) {
        let mut state = lock!(self.state.lock());

        loop {
            if state.shutdown {
                return;
            }

            let now = Instant::now();
            let next = state.deadlines.peek().map(|Reverse((deadline, _))| *deadline);
            match next {
                None => state = lock!(self.changed.wait(state)),
                Some(deadline) if deadline > now => {
                    state = lock!(self.changed.wait_timeout(state, deadline - now)).0;
                }
                Some(_) => {
                    let job = state
                        .deadlines
                        .pop()
                        .and_then(|Reverse((_, id))| state.jobs.remove(&id));

                    if let Some(job) = job {
                        drop(state);
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            tracing::error!("timeout job panicked");
                        }
                        state = lock!(self.state.lock());
                    }
                }
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn jobs_fire_in_deadline_order() {
        let timer = Timer::new("test").unwrap();
        let (tx, rx) = mpsc::channel();

        for (delay, tag) in [(60, 'c'), (20, 'a'), (40, 'b')] {
            let tx = tx.clone();
            timer
                .schedule(Duration::from_millis(delay), move || tx.send(tag).unwrap())
                .unwrap();
        }

        let order: Vec<char> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, ['a', 'b', 'c']);
    }

    #[test]
    fn cancelled_job_never_runs() {
        let timer = Timer::new("test").unwrap();
        let (tx, rx) = mpsc::channel::<()>();

        let handle = timer
            .schedule(Duration::from_millis(20), move || tx.send(()).unwrap())
            .unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn schedule_after_shutdown_is_refused() {
        let timer = Timer::new("test").unwrap();
        timer.shutdown();
        assert!(timer.schedule(Duration::ZERO, || {}).is_none());
    }
}

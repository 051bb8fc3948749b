//! Thread pool executors used by groups and file channels.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::group::GroupId;
use crate::invoker::DispatchContext;
use crate::CallOnDrop;

/// How long an idle thread of a cached pool lingers before exiting.
const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// A unit of work submitted to a [`ThreadPool`].
///
/// A task may be bound to a [`ChannelGroup`]. While a bound task runs, the thread carries a
/// [`DispatchContext`] for that group, which lets completion callbacks be invoked directly.
///
/// [`ChannelGroup`]: crate::ChannelGroup
pub struct Task {
    context: Option<GroupId>,
    job: Box<dyn FnOnce() + Send>,
}

impl Task {
    /// Creates an unbound task.
    pub fn new(job: impl FnOnce() + Send + 'static) -> Task {
        Task {
            context: None,
            job: Box::new(job),
        }
    }

    /// Creates a task bound to `group`.
    pub(crate) fn bound(group: GroupId, job: impl FnOnce() + Send + 'static) -> Task {
        Task {
            context: Some(group),
            job: Box::new(job),
        }
    }

    /// The group this task is bound to.
    pub fn group(&self) -> Option<GroupId> {
        self.context
    }

    /// Runs the task on the current thread.
    pub(crate) fn run(self) {
        match self.context {
            Some(group) => {
                let _scope = DispatchContext::enter(group);
                (self.job)();
            }
            None => (self.job)(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Returned when a pool that has been shut down is given a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("task rejected: executor is shut down")]
pub struct Rejected;

/// A pool of OS threads executing [`Task`]s.
///
/// A fixed pool starts threads on demand up to its size and keeps them. A cached pool starts a
/// thread whenever no idle thread is available and lets idle threads exit after a while.
/// Clones refer to the same pool.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// Prefix for thread names.
    name: String,

    /// Maximum number of threads, `None` for a cached pool.
    max_threads: Option<usize>,

    /// Queued tasks. Disconnected once the pool is shut down and the queue is drained.
    receiver: Receiver<Task>,

    /// Threads blocked waiting for a task.
    idle: AtomicUsize,

    state: Mutex<PoolState>,

    /// Signalled when the last thread exits after shutdown.
    terminated: Condvar,
}

struct PoolState {
    /// `None` after shutdown.
    sender: Option<Sender<Task>>,
    threads: usize,
    spawned: usize,
}

impl ThreadPool {
    /// Creates a pool of at most `threads` threads.
    pub fn fixed(name: &str, threads: usize) -> ThreadPool {
        ThreadPool::with_limit(name, Some(threads.max(1)))
    }

    /// Creates a pool that grows as needed.
    pub fn cached(name: &str) -> ThreadPool {
        ThreadPool::with_limit(name, None)
    }

    fn with_limit(name: &str, max_threads: Option<usize>) -> ThreadPool {
        let (sender, receiver) = crossbeam_channel::unbounded();
        ThreadPool {
            inner: Arc::new(PoolInner {
                name: name.to_owned(),
                max_threads,
                receiver,
                idle: AtomicUsize::new(0),
                state: Mutex::new(PoolState {
                    sender: Some(sender),
                    threads: 0,
                    spawned: 0,
                }),
                terminated: Condvar::new(),
            }),
        }
    }

    /// Whether this pool has a fixed size.
    pub fn is_fixed(&self) -> bool {
        self.inner.max_threads.is_some()
    }

    /// Queues a task, starting a thread if one is needed.
    pub fn execute(&self, task: Task) -> Result<(), Rejected> {
        let mut state = lock!(self.inner.state.lock());
        if state.sender.is_none() {
            return Err(Rejected);
        }

        let queued = self.inner.receiver.len() + 1;
        let starved = self.inner.idle.load(Ordering::SeqCst) < queued;
        let wants_thread = match self.inner.max_threads {
            Some(max) => state.threads < max && starved,
            None => starved,
        };
        if wants_thread {
            let name = format!("{}-pool-{}", self.inner.name, state.spawned);
            let inner = self.inner.clone();
            match thread::Builder::new().name(name).spawn(move || inner.run()) {
                Ok(_) => {
                    state.threads += 1;
                    state.spawned += 1;
                }
                Err(err) if state.threads == 0 => {
                    tracing::error!(?err, "failed to start a pool thread");
                    return Err(Rejected);
                }
                Err(err) => tracing::warn!(?err, "failed to start a pool thread"),
            }
        }

        match &state.sender {
            Some(sender) => sender.send(task).map_err(|_| Rejected),
            None => Err(Rejected),
        }
    }

    /// Stops accepting tasks. Queued tasks still run.
    pub fn shutdown(&self) {
        let mut state = lock!(self.inner.state.lock());
        if state.sender.take().is_some() {
            tracing::debug!(
                pool = %self.inner.name,
                queued = self.inner.receiver.len(),
                "shutdown"
            );
        }
        if state.threads == 0 {
            self.inner.terminated.notify_all();
        }
    }

    /// Whether [`shutdown`](ThreadPool::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        lock!(self.inner.state.lock()).sender.is_none()
    }

    /// Whether the pool is shut down and all its threads have exited.
    pub fn is_terminated(&self) -> bool {
        let state = lock!(self.inner.state.lock());
        state.sender.is_none() && state.threads == 0
    }

    /// Waits until the pool terminates or `timeout` passes. Returns `true` if it terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = lock!(self.inner.state.lock());

        while !(state.sender.is_none() && state.threads == 0) {
            match deadline {
                None => state = lock!(self.inner.terminated.wait(state)),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = lock!(self.inner.terminated.wait_timeout(state, deadline - now)).0;
                }
            }
        }

        true
    }
}

impl PoolInner {
    fn run(self: Arc<Self>) {
        let _exit = CallOnDrop(|| {
            let mut state = lock!(self.state.lock());
            state.threads -= 1;
            if state.sender.is_none() && state.threads == 0 {
                self.terminated.notify_all();
            }
        });

        while let Some(task) = self.next_task() {
            let group = task.group();
            if panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
                tracing::error!(pool = %self.name, ?group, "task panicked");
            }
        }
    }

    fn next_task(&self) -> Option<Task> {
        loop {
            self.idle.fetch_add(1, Ordering::SeqCst);
            let received = match self.max_threads {
                Some(_) => self
                    .receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
                None => self.receiver.recv_timeout(KEEP_ALIVE),
            };
            self.idle.fetch_sub(1, Ordering::SeqCst);

            match received {
                Ok(task) => return Some(task),
                Err(RecvTimeoutError::Disconnected) => return None,
                Err(RecvTimeoutError::Timeout) => {
                    // A task queued while this thread was leaving saw it as idle.
                    let _state = lock!(self.state.lock());
                    if self.receiver.is_empty() {
                        return None;
                    }
                }
            }
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock!(self.inner.state.lock());
        f.debug_struct("ThreadPool")
            .field("name", &self.inner.name)
            .field("max_threads", &self.inner.max_threads)
            .field("threads", &state.threads)
            .field("queued", &self.inner.receiver.len())
            .field("shutdown", &state.sender.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fixed_pool_runs_everything_then_terminates() {
        let pool = ThreadPool::fixed("test", 2);
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let ran = ran.clone();
            pool.execute(Task::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 16);
        assert_eq!(pool.execute(Task::new(|| {})).unwrap_err(), Rejected);
    }

    #[test]
    fn panicking_task_does_not_kill_the_pool() {
        let pool = ThreadPool::fixed("test", 1);
        let (tx, rx) = mpsc::channel();

        pool.execute(Task::new(|| panic!("boom"))).unwrap();
        pool.execute(Task::new(move || tx.send(()).unwrap())).unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn bound_task_carries_context() {
        let pool = ThreadPool::cached("test");
        let group = GroupId::next();
        let (tx, rx) = mpsc::channel();

        pool.execute(Task::bound(group, move || {
            tx.send(DispatchContext::current()).unwrap();
        }))
        .unwrap();

        let context = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(context.group(), group);
        assert_eq!(context.depth(), 0);
        pool.shutdown();
    }

    #[test]
    fn shutdown_drains_queued_tasks() {
        let pool = ThreadPool::fixed("test", 1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        pool.execute(Task::new(move || {
            let _ = gate_rx.recv();
        }))
        .unwrap();
        for _ in 0..4 {
            let ran = ran.clone();
            pool.execute(Task::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(!pool.is_terminated());
        drop(gate_tx);

        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn cached_pool_reuses_idle_threads() {
        let pool = ThreadPool::cached("test");
        let (tx, rx) = mpsc::channel();

        for _ in 0..3 {
            let tx = tx.clone();
            pool.execute(Task::new(move || tx.send(thread::current().id()).unwrap()))
                .unwrap();
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
            // Let the worker get back to waiting on the queue.
            thread::sleep(Duration::from_millis(50));
        }

        assert_eq!(lock!(pool.inner.state.lock()).spawned, 1);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }
}

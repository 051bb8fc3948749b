//! Channel groups: worker threads, completion dispatch and shutdown.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::cache::{Overlapped, PendingIo, Token};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::invoker::DispatchContext;
use crate::pool::{Rejected, Task, ThreadPool};
use crate::port::{CompletionPort, Packet};
use crate::timer::{Timer, TimerHandle};

/// Channels closed per pass when a group is shut down forcefully.
const CLOSE_BATCH: usize = 32;

/// Identifies a [`ChannelGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u64);

impl GroupId {
    pub(crate) fn next() -> GroupId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        GroupId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle of a [`ChannelGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Accepting channels and operations.
    Active,
    /// Shutdown was requested; it completes when the last channel closes.
    ShutdownRequested,
    /// Worker threads are being stopped.
    Terminating,
    /// Every worker thread has exited.
    Terminated,
}

/// A channel registered with a group, as seen by the group's workers.
pub(crate) trait OverlappedChannel: Send + Sync {
    /// Remove and return the operation issued under `token`.
    fn take_pending(&self, token: Token) -> Option<Arc<dyn PendingIo>>;

    /// Close the channel. Must unregister it from the group.
    fn close_channel(&self) -> Result<()>;
}

/// A set of channels sharing worker threads, a completion port and a timer.
///
/// Completions of queued operations on the group's channels are picked up by its worker
/// threads, which run the completion callbacks. Clones refer to the same group.
#[derive(Clone)]
pub struct ChannelGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    id: GroupId,
    config: Config,

    /// Executor of the worker threads and of indirect callbacks.
    pool: ThreadPool,

    /// Whether `pool` is a fixed pool whose threads are all parked on the port.
    fixed: bool,

    port: Arc<CompletionPort>,

    /// Tasks for a fixed pool, handed out through wakeup packets.
    task_queue: Option<Mutex<VecDeque<Task>>>,

    thread_count: AtomicUsize,

    timer: Timer,

    /// Registered channels, by completion key.
    channels: RwLock<HashMap<usize, Weak<dyn OverlappedChannel>>>,
    next_key: AtomicUsize,

    shutdown: AtomicBool,
    terminate_initiated: AtomicBool,

    /// Serializes termination.
    shutdown_lock: Mutex<()>,

    /// Records of force-failed operations whose native completion may still arrive.
    stale: Mutex<HashMap<Token, Box<Overlapped>>>,

    /// Signalled when the port is closed.
    exit_lock: Mutex<()>,
    exited: Condvar,
}

impl ChannelGroup {
    /// Creates a group with `threads` worker threads.
    ///
    /// Tasks are handed to the workers through the completion port, since every worker is
    /// parked waiting on it.
    pub fn fixed(threads: usize, config: Config) -> io::Result<ChannelGroup> {
        if threads == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a fixed group needs at least one thread",
            ));
        }

        let pool = ThreadPool::fixed(&config.thread_name, threads);
        ChannelGroup::start(pool, true, threads, config)
    }

    /// Creates a group over an elastic pool.
    ///
    /// [`Config::internal_threads`] dedicated threads are always running. `initial_size`
    /// additional workers are submitted to `pool`.
    pub fn elastic(
        pool: ThreadPool,
        initial_size: usize,
        config: Config,
    ) -> io::Result<ChannelGroup> {
        ChannelGroup::start(pool, false, initial_size, config)
    }

    fn start(
        pool: ThreadPool,
        fixed: bool,
        pool_size: usize,
        config: Config,
    ) -> io::Result<ChannelGroup> {
        let timer = Timer::new(&config.thread_name)?;
        let inner = Arc::new(GroupInner {
            id: GroupId::next(),
            pool,
            fixed,
            port: Arc::new(CompletionPort::new()),
            task_queue: if fixed {
                Some(Mutex::new(VecDeque::new()))
            } else {
                None
            },
            thread_count: AtomicUsize::new(0),
            timer,
            channels: RwLock::new(HashMap::new()),
            next_key: AtomicUsize::new(1),
            shutdown: AtomicBool::new(false),
            terminate_initiated: AtomicBool::new(false),
            shutdown_lock: Mutex::new(()),
            stale: Mutex::new(HashMap::new()),
            exit_lock: Mutex::new(()),
            exited: Condvar::new(),
            config,
        });

        let span = tracing::trace_span!("start", group = ?inner.id, fixed, pool_size);
        let _enter = span.enter();

        if let Err(err) = inner.start_threads(pool_size) {
            inner.shutdown.store(true, Ordering::SeqCst);
            inner.initiate_termination(false);
            return Err(err);
        }

        Ok(ChannelGroup { inner })
    }

    /// The identity of this group.
    pub fn id(&self) -> GroupId {
        self.inner.id
    }

    /// The configuration this group was created with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Number of worker threads currently running.
    pub fn thread_count(&self) -> usize {
        self.inner.thread_count.load(Ordering::SeqCst)
    }

    /// Whether shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    /// Whether every worker thread has exited after shutdown.
    pub fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> GroupState {
        if self.inner.is_terminated() {
            GroupState::Terminated
        } else if self.inner.terminate_initiated.load(Ordering::SeqCst) {
            GroupState::Terminating
        } else if self.inner.is_shutdown() {
            GroupState::ShutdownRequested
        } else {
            GroupState::Active
        }
    }

    /// Requests an orderly shutdown.
    ///
    /// No channel can be registered afterwards. Termination starts right away if the group
    /// has no channels, otherwise when the last one closes.
    pub fn shutdown(&self) {
        let span = tracing::trace_span!("shutdown", group = ?self.inner.id);
        let _enter = span.enter();

        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.inner.is_empty() {
            tracing::debug!("shutdown deferred until the last channel closes");
            return;
        }
        self.inner.initiate_termination(false);
    }

    /// Closes every channel of the group and stops its threads.
    pub fn shutdown_now(&self) {
        let span = tracing::trace_span!("shutdown_now", group = ?self.inner.id);
        let _enter = span.enter();

        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.initiate_termination(true);
    }

    /// Waits for termination for at most `timeout`. Returns `true` if the group terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        if !self.inner.pool.await_termination(timeout) {
            return false;
        }

        let mut guard = lock!(self.inner.exit_lock.lock());
        while !self.inner.is_closed() {
            match deadline {
                None => guard = lock!(self.inner.exited.wait(guard)),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    guard = lock!(self.inner.exited.wait_timeout(guard, deadline - now)).0;
                }
            }
        }

        true
    }

    /// Runs `job` on one of the group's threads.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.execute_on_pooled_thread(job)
            .map_err(|_| Error::GroupShutDown)
    }

    /// Hands `job` to a thread of the group.
    ///
    /// Fixed groups queue it and wake a worker through the port. Elastic groups submit it to
    /// the pool, bound to this group.
    pub(crate) fn execute_on_pooled_thread(
        &self,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<(), Rejected> {
        match &self.inner.task_queue {
            Some(queue) => {
                let mut queue = lock!(queue.lock());
                if self.inner.port.is_closed() {
                    return Err(Rejected);
                }

                queue.push_back(Task::new(job));
                if self.inner.port.wakeup().is_err() {
                    queue.pop_back();
                    return Err(Rejected);
                }
                Ok(())
            }
            None => self.inner.pool.execute(self.bind_to_group(job)),
        }
    }

    /// Wraps `job` so that it runs with this group's dispatch context.
    pub(crate) fn bind_to_group(&self, job: impl FnOnce() + Send + 'static) -> Task {
        Task::bound(self.inner.id, job)
    }

    /// Run `job` after `delay` on the group's timer.
    pub(crate) fn schedule(
        &self,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> Option<TimerHandle> {
        self.inner.timer.schedule(delay, job)
    }

    pub(crate) fn port(&self) -> &Arc<CompletionPort> {
        &self.inner.port
    }

    /// Reserve a completion key for a channel about to be registered.
    pub(crate) fn reserve_key(&self) -> usize {
        self.inner.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a channel under `key`. Fails once the group is shut down.
    pub(crate) fn attach(&self, key: usize, channel: Weak<dyn OverlappedChannel>) -> Result<()> {
        let mut channels = lock!(self.inner.channels.write());
        if self.inner.is_shutdown() {
            return Err(Error::GroupShutDown);
        }
        channels.insert(key, channel);
        Ok(())
    }

    /// Remove a channel. Removing the last channel of a group that was asked to shut down
    /// starts termination.
    pub(crate) fn unregister(&self, key: usize) {
        let empty = {
            let mut channels = lock!(self.inner.channels.write());
            channels.remove(&key);
            channels.is_empty()
        };

        if empty && self.inner.is_shutdown() {
            self.inner.initiate_termination(false);
        }
    }

    /// Park the record of a force-failed operation until its completion shows up.
    pub(crate) fn make_stale(&self, token: Token, record: Box<Overlapped>) {
        lock!(self.inner.stale.lock()).insert(token, record);
    }

    /// Release the record behind `token` if it was stale. Returns whether it was.
    #[cfg(test)]
    pub(crate) fn check_if_stale(&self, token: Token) -> bool {
        self.inner.check_if_stale(token)
    }
}

impl GroupInner {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn is_terminated(&self) -> bool {
        self.terminate_initiated.load(Ordering::SeqCst)
            && self.is_closed()
            && self.pool.is_terminated()
    }

    /// Every worker has exited and the port is closed.
    fn is_closed(&self) -> bool {
        self.thread_count.load(Ordering::SeqCst) == 0 && self.port.is_closed()
    }

    fn is_empty(&self) -> bool {
        lock!(self.channels.read()).is_empty()
    }

    fn check_if_stale(&self, token: Token) -> bool {
        lock!(self.stale.lock()).remove(&token).is_some()
    }

    fn start_threads(self: &Arc<Self>, pool_size: usize) -> io::Result<()> {
        if !self.fixed {
            for _ in 0..self.config.internal_threads {
                self.thread_count.fetch_add(1, Ordering::SeqCst);
                if let Err(err) = self.spawn_internal() {
                    self.thread_count.fetch_sub(1, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }

        for _ in 0..pool_size {
            self.thread_count.fetch_add(1, Ordering::SeqCst);
            if self.submit_worker().is_err() {
                self.thread_count.fetch_sub(1, Ordering::SeqCst);
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "thread pool refused the group's workers",
                ));
            }
        }

        Ok(())
    }

    /// Start a dedicated thread outside the pool.
    fn spawn_internal(self: &Arc<Self>) -> io::Result<()> {
        let group = self.clone();
        thread::Builder::new()
            .name(format!("{}-internal", self.config.thread_name))
            .spawn(move || group.run_worker(true))
            .map(drop)
    }

    /// Submit a worker to the pool.
    fn submit_worker(self: &Arc<Self>) -> Result<(), Rejected> {
        let group = self.clone();
        self.pool
            .execute(Task::bound(self.id, move || group.run_worker(false)))
    }

    /// Worker loop: wait for a packet, then run a task or dispatch a completion.
    fn run_worker(self: Arc<Self>, internal: bool) {
        let _exit = WorkerExit {
            group: self.clone(),
            internal,
        };

        let can_invoke_direct = DispatchContext::current().map_or(false, |c| c.group() == self.id);
        tracing::debug!(group = ?self.id, internal, "worker started");

        loop {
            DispatchContext::reset_depth();

            let packet = match self.port.wait() {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::trace!(group = ?self.id, ?err, "port closed");
                    return;
                }
            };

            match packet {
                Packet::Wakeup => match self.poll_task() {
                    Some(task) => task.run(),
                    // A wakeup with nothing to run is a request to exit.
                    None => return,
                },
                Packet::Completion { key, token, result } => {
                    self.dispatch(key, token, result, can_invoke_direct)
                }
            }
        }
    }

    fn poll_task(&self) -> Option<Task> {
        self.task_queue
            .as_ref()
            .and_then(|queue| lock!(queue.lock()).pop_front())
    }

    fn dispatch(
        &self,
        key: usize,
        token: Token,
        result: io::Result<usize>,
        can_invoke_direct: bool,
    ) {
        let channel = lock!(self.channels.read())
            .get(&key)
            .and_then(|channel| channel.upgrade());
        let io = channel.and_then(|channel| channel.take_pending(token));

        match io {
            Some(io) => match result {
                Ok(bytes) => io.completed(bytes, can_invoke_direct),
                Err(err) => io.failed(Error::from(err)),
            },
            None => {
                if self.check_if_stale(token) {
                    tracing::trace!(key, ?token, "late completion of a failed operation dropped");
                } else {
                    tracing::trace!(key, ?token, "completion for unknown operation dropped");
                }
            }
        }
    }

    /// Account for an exiting worker and replace it if requested.
    ///
    /// Returns the number of workers left.
    fn thread_exit(self: &Arc<Self>, internal: bool, replace: bool) -> usize {
        if replace && !self.terminate_initiated.load(Ordering::SeqCst) {
            let replaced = if internal {
                self.spawn_internal().is_ok()
            } else {
                self.submit_worker().is_ok()
            };

            if replaced {
                tracing::debug!(group = ?self.id, internal, "worker replaced");
                return self.thread_count.load(Ordering::SeqCst);
            }
        }

        let remaining = self.thread_count.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::debug!(group = ?self.id, internal, remaining, "worker exited");
        remaining
    }

    /// Start termination once. With `close_channels`, every channel is closed first.
    fn initiate_termination(&self, close_channels: bool) {
        if self.terminate_initiated.load(Ordering::SeqCst) {
            return;
        }

        let _guard = lock!(self.shutdown_lock.lock());
        if self.terminate_initiated.swap(true, Ordering::SeqCst) {
            return;
        }

        if close_channels {
            self.close_all_channels();
        }
        self.shutdown_workers();
        self.pool.shutdown();
        self.timer.shutdown();

        // Nothing will exit to close the port if no worker ever started.
        if self.thread_count.load(Ordering::SeqCst) == 0 {
            self.close_port();
        }
    }

    fn close_all_channels(&self) {
        loop {
            let batch: Vec<(usize, Weak<dyn OverlappedChannel>)> = lock!(self.channels.read())
                .iter()
                .take(CLOSE_BATCH)
                .map(|(key, channel)| (*key, channel.clone()))
                .collect();

            if batch.is_empty() {
                break;
            }

            for (key, channel) in batch {
                if let Some(channel) = channel.upgrade() {
                    if let Err(err) = channel.close_channel() {
                        tracing::debug!(key, ?err, "error closing channel");
                    }
                }
                lock!(self.channels.write()).remove(&key);
            }
        }
    }

    /// Post one exit wakeup per worker.
    fn shutdown_workers(&self) {
        let threads = self.thread_count.load(Ordering::SeqCst);
        for _ in 0..threads {
            if let Err(err) = self.port.wakeup() {
                tracing::trace!(?err, "wakeup failed");
                break;
            }
        }
    }

    /// Release the port and everything parked on it. Done by the last worker to exit.
    fn close_port(&self) {
        self.port.close();

        if let Some(queue) = &self.task_queue {
            while !thread::panicking() {
                let task = lock!(queue.lock()).pop_front();
                match task {
                    Some(task) => task.run(),
                    None => break,
                }
            }
        }

        let stale = mem::take(&mut *lock!(self.stale.lock()));
        tracing::debug!(group = ?self.id, stale = stale.len(), "group closed");

        let _guard = lock!(self.exit_lock.lock());
        self.exited.notify_all();
    }
}

/// Runs when a worker loop ends, normally or by panic.
struct WorkerExit {
    group: Arc<GroupInner>,
    internal: bool,
}

impl Drop for WorkerExit {
    fn drop(&mut self) {
        // Only a panicking worker is replaced.
        let remaining = self.group.thread_exit(self.internal, thread::panicking());
        if remaining == 0 && self.group.is_shutdown() {
            self.group.close_port();
        }
    }
}

impl fmt::Debug for ChannelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGroup")
            .field("id", &self.inner.id)
            .field("fixed", &self.inner.fixed)
            .field("threads", &self.thread_count())
            .field("state", &self.state())
            .finish()
    }
}

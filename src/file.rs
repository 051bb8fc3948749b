//! Portable asynchronous file channel.
//!
//! Every operation runs a blocking call of a [`FileDispatcher`] on a [`ThreadPool`]. Threads
//! inside a blocking call are recorded so that closing the channel can interrupt them and
//! wait for them to leave.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::buffer::IoBuffer;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::future::{Cancellable, OpKind, PendingFuture};
use crate::invoker;
use crate::native::{FileDispatcher, LockStatus};
use crate::pool::{Task, ThreadPool};
use crate::threads::NativeThreadSet;
use crate::CallOnDrop;

/// Largest offset the OS accepts.
const MAX_POSITION: u64 = i64::MAX as u64;

/// Chunk size of a buffered transfer.
const TRANSFER_CHUNK: usize = 8192;

/// Options for opening an [`AsyncFileChannel`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    create: bool,
    truncate: bool,
    executor: Option<ThreadPool>,
    config: Config,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions::new()
    }
}

impl OpenOptions {
    /// Options with every flag unset and a private executor.
    pub fn new() -> OpenOptions {
        OpenOptions {
            read: false,
            write: false,
            create: false,
            truncate: false,
            executor: None,
            config: Config::default(),
        }
    }

    /// Open for reading.
    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    /// Open for writing.
    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    /// Create the file if it does not exist.
    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    /// Truncate the file on open.
    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    /// Run operations on `executor` instead of a private pool.
    ///
    /// A private pool is shut down once the last handle to the channel is dropped. A shared
    /// executor is left alone.
    pub fn executor(&mut self, executor: ThreadPool) -> &mut Self {
        self.executor = Some(executor);
        self
    }

    /// Use `config` for the channel.
    pub fn config(&mut self, config: Config) -> &mut Self {
        self.config = config;
        self
    }

    /// Opens the file at `path`.
    #[cfg(any(unix, windows))]
    pub fn open(&self, path: impl AsRef<Path>) -> Result<AsyncFileChannel> {
        let file = std::fs::OpenOptions::new()
            .read(self.read)
            .write(self.write)
            .create(self.create)
            .truncate(self.truncate)
            .open(path.as_ref())?;

        tracing::trace!(path = ?path.as_ref(), read = self.read, write = self.write, "file opened");
        Ok(self.build(Arc::new(crate::native::SysFileDispatcher::new(file))))
    }

    /// Creates a channel over `dispatcher`, readable and writable as set in these options.
    pub fn build(&self, dispatcher: Arc<dyn FileDispatcher>) -> AsyncFileChannel {
        let (executor, owns_executor) = match &self.executor {
            Some(executor) => (executor.clone(), false),
            None => (ThreadPool::cached(&self.config.thread_name), true),
        };

        AsyncFileChannel {
            inner: Arc::new(FileInner {
                dispatcher: RwLock::new(Some(dispatcher)),
                readable: self.read,
                writable: self.write,
                executor,
                owns_executor,
                config: self.config.clone(),
                open: AtomicBool::new(true),
                threads: NativeThreadSet::new(2),
                locks: Mutex::new(HashMap::new()),
                next_lock: AtomicU64::new(0),
            }),
        }
    }
}

/// An asynchronous channel for reading, writing and locking a file.
///
/// Operations address the file by position and never move a file cursor. When a callback
/// is given, it runs on the channel's executor, never on the calling thread.
///
/// Clones refer to the same channel.
#[derive(Clone)]
pub struct AsyncFileChannel {
    inner: Arc<FileInner>,
}

struct FileInner {
    /// `None` once closed. Held for reading for the duration of every blocking call.
    dispatcher: RwLock<Option<Arc<dyn FileDispatcher>>>,

    readable: bool,
    writable: bool,

    executor: ThreadPool,
    owns_executor: bool,

    config: Config,

    open: AtomicBool,

    /// Threads currently inside a blocking call.
    threads: NativeThreadSet,

    /// Locks held through this channel.
    locks: Mutex<HashMap<u64, Arc<LockRecord>>>,
    next_lock: AtomicU64,
}

/// A region lock acquired through an [`AsyncFileChannel`].
///
/// A lock stays valid until it is released or its channel is closed. Clones refer to the same
/// lock.
#[derive(Clone)]
pub struct FileLock {
    record: Arc<LockRecord>,
}

struct LockRecord {
    id: u64,
    position: u64,
    size: u64,
    shared: bool,
    channel: Weak<FileInner>,
    valid: Mutex<bool>,
}

impl LockRecord {
    fn overlaps(&self, position: u64, size: u64) -> bool {
        position < self.position.saturating_add(self.size)
            && self.position < position.saturating_add(size)
    }
}

impl AsyncFileChannel {
    /// Options for opening a channel.
    pub fn options() -> OpenOptions {
        OpenOptions::new()
    }

    /// Whether the channel is open.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Reads into the remaining bytes of `buf`, starting at `position` in the file.
    ///
    /// The buffer's position is advanced by the number of bytes read. 0 means end of file.
    pub fn read(&self, buf: &IoBuffer, position: u64) -> Result<PendingFuture<usize>> {
        let future = PendingFuture::new(Some(self.inner.weak()), OpKind::Read);
        self.inner.read(buf, position, future.clone())?;
        Ok(future)
    }

    /// Reads into `buf` and calls `handler` with the number of bytes read.
    pub fn read_with<A, F>(
        &self,
        buf: &IoBuffer,
        position: u64,
        attachment: A,
        handler: F,
    ) -> Result<()>
    where
        A: Send + 'static,
        F: FnOnce(Result<usize>, A) + Send + 'static,
    {
        let future = PendingFuture::with_handler(
            Some(self.inner.weak()),
            OpKind::Read,
            attachment,
            handler,
        );
        self.inner.read(buf, position, future)
    }

    /// Writes the remaining bytes of `buf` at `position` in the file.
    ///
    /// The buffer's position is advanced by the number of bytes written.
    pub fn write(&self, buf: &IoBuffer, position: u64) -> Result<PendingFuture<usize>> {
        let future = PendingFuture::new(Some(self.inner.weak()), OpKind::Write);
        self.inner.write(buf, position, future.clone())?;
        Ok(future)
    }

    /// Writes from `buf` and calls `handler` with the number of bytes written.
    pub fn write_with<A, F>(
        &self,
        buf: &IoBuffer,
        position: u64,
        attachment: A,
        handler: F,
    ) -> Result<()>
    where
        A: Send + 'static,
        F: FnOnce(Result<usize>, A) + Send + 'static,
    {
        let future = PendingFuture::with_handler(
            Some(self.inner.weak()),
            OpKind::Write,
            attachment,
            handler,
        );
        self.inner.write(buf, position, future)
    }

    /// Locks `size` bytes at `position`, waiting until the region is available.
    ///
    /// Pass `u64::MAX` (or anything from `i64::MAX` up) as `size` to lock to the end of the
    /// file, however large it grows.
    pub fn lock(&self, position: u64, size: u64, shared: bool) -> Result<PendingFuture<FileLock>> {
        let future = PendingFuture::new(Some(self.inner.weak()), OpKind::Lock);
        self.inner.lock(position, size, shared, future.clone())?;
        Ok(future)
    }

    /// Locks a region and calls `handler` with the lock.
    pub fn lock_with<A, F>(
        &self,
        position: u64,
        size: u64,
        shared: bool,
        attachment: A,
        handler: F,
    ) -> Result<()>
    where
        A: Send + 'static,
        F: FnOnce(Result<FileLock>, A) + Send + 'static,
    {
        let future = PendingFuture::with_handler(
            Some(self.inner.weak()),
            OpKind::Lock,
            attachment,
            handler,
        );
        self.inner.lock(position, size, shared, future)
    }

    /// Tries to lock a region without waiting. Returns `Ok(None)` if someone else holds it.
    pub fn try_lock(&self, position: u64, size: u64, shared: bool) -> Result<Option<FileLock>> {
        let span = tracing::trace_span!("try_lock", position, size, shared);
        let _enter = span.enter();

        let record = match self.inner.add_lock(position, size, shared)? {
            Some(record) => record,
            None => return Err(Error::Closed),
        };

        match self.inner.blocking(|d| d.lock(false, position, size, shared)) {
            Ok(LockStatus::Locked) => Ok(Some(FileLock { record })),
            Ok(LockStatus::Unavailable) => {
                self.inner.remove_lock(record.id);
                Ok(None)
            }
            Err(err) => {
                self.inner.remove_lock(record.id);
                Err(err)
            }
        }
    }

    /// Current size of the file.
    pub fn size(&self) -> Result<u64> {
        self.inner.blocking(|d| d.size())
    }

    /// Shrinks the file to `size` bytes. A larger `size` leaves the file as it is.
    pub fn truncate(&self, size: u64) -> Result<()> {
        if size > MAX_POSITION {
            return Err(Error::InvalidArgument("size exceeds the largest file offset"));
        }
        if !self.inner.writable {
            return Err(Error::NonWritable);
        }

        self.inner.blocking(|d| {
            if size < d.size()? {
                d.truncate(size)?;
            }
            Ok(())
        })
    }

    /// Flushes written data to storage, with the file's metadata if `metadata` is set.
    pub fn force(&self, metadata: bool) -> Result<()> {
        self.inner.blocking(|d| d.force(metadata))
    }

    /// Copies up to `count` bytes at `position` into `target` at `target_position`.
    ///
    /// Returns the number of bytes copied, which is short if the end of this file is reached.
    /// With [`Config::fast_file_transfer`] set, an in-kernel copy is tried first.
    pub fn transfer_to(
        &self,
        position: u64,
        count: u64,
        target: &AsyncFileChannel,
        target_position: u64,
    ) -> Result<u64> {
        if position > MAX_POSITION || target_position > MAX_POSITION {
            return Err(Error::InvalidArgument("position exceeds the largest file offset"));
        }
        if !self.inner.readable {
            return Err(Error::NonReadable);
        }
        if !target.inner.writable {
            return Err(Error::NonWritable);
        }

        let span = tracing::trace_span!("transfer_to", position, count, target_position);
        let _enter = span.enter();

        let fast = self.inner.config.fast_file_transfer;
        target.inner.blocking(|dst| {
            self.inner
                .blocking(|src| copy_range(src, dst, position, count, target_position, fast))
                .map_err(io::Error::from)
        })
    }

    /// Closes the channel.
    ///
    /// Every lock is released, threads blocked in a call on this channel are interrupted, and
    /// the call returns once they have all left. Their operations complete with
    /// [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        self.inner.close();
        Ok(())
    }
}

impl FileInner {
    fn weak(self: &Arc<Self>) -> Weak<dyn Cancellable> {
        let weak = Arc::downgrade(self);
        let weak: Weak<dyn Cancellable> = weak;
        weak
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Run `op` against the dispatcher on the calling thread.
    ///
    /// The thread is recorded for the duration of the call. Interrupted calls are retried
    /// while the channel is open. Failures after close are reported as [`Error::Closed`].
    fn blocking<T>(&self, mut op: impl FnMut(&dyn FileDispatcher) -> io::Result<T>) -> Result<T> {
        let slot = self.threads.add();
        let _registered = CallOnDrop(|| self.threads.remove(slot));

        let guard = lock!(self.dispatcher.read());
        let dispatcher = match &*guard {
            Some(dispatcher) if self.is_open() => dispatcher,
            _ => return Err(Error::Closed),
        };

        loop {
            match op(&**dispatcher) {
                Ok(value) => return Ok(value),
                Err(err) if err.kind() == io::ErrorKind::Interrupted && self.is_open() => {
                    tracing::trace!("interrupted, retrying");
                }
                Err(_) if !self.is_open() => return Err(Error::Closed),
                Err(err) => return Err(Error::from(err)),
            }
        }
    }

    /// Complete `future` without blocking and dispatch its callback to the executor.
    fn complete_now<V, A>(&self, future: &PendingFuture<V, A>, outcome: Result<V>) -> Result<()>
    where
        V: Clone + Send + 'static,
        A: Send + 'static,
    {
        future.complete(outcome);
        invoker::invoke_on_executor(&self.executor, future)
    }

    /// Run `job` on the executor.
    fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.executor
            .execute(Task::new(job))
            .map_err(|_| Error::IllegalState("file executor is shut down"))
    }

    fn read<A: Send + 'static>(
        self: &Arc<Self>,
        buf: &IoBuffer,
        position: u64,
        future: PendingFuture<usize, A>,
    ) -> Result<()> {
        if !self.readable {
            return Err(Error::NonReadable);
        }
        if position > MAX_POSITION {
            return Err(Error::InvalidArgument("position exceeds the largest file offset"));
        }
        if buf.is_read_only() {
            return Err(Error::InvalidArgument("read into a read-only buffer"));
        }

        if !self.is_open() {
            return self.complete_now(&future, Err(Error::Closed));
        }
        if !buf.has_remaining() {
            return self.complete_now(&future, Ok(0));
        }

        let channel = self.clone();
        let buf = buf.clone();
        self.submit(move || {
            let mut bytes = vec![0; buf.remaining()];
            let outcome = channel.blocking(|d| d.read_at(&mut bytes, position));

            let filled = outcome.as_ref().ok().copied();
            future.complete_with(outcome, || {
                if let Some(n) = filled {
                    buf.put(&bytes[..n]);
                }
            });
            invoker::invoke_unchecked(&future);
        })
    }

    fn write<A: Send + 'static>(
        self: &Arc<Self>,
        buf: &IoBuffer,
        position: u64,
        future: PendingFuture<usize, A>,
    ) -> Result<()> {
        if !self.writable {
            return Err(Error::NonWritable);
        }
        if position > MAX_POSITION {
            return Err(Error::InvalidArgument("position exceeds the largest file offset"));
        }

        if !self.is_open() {
            return self.complete_now(&future, Err(Error::Closed));
        }
        if !buf.has_remaining() {
            return self.complete_now(&future, Ok(0));
        }

        let channel = self.clone();
        let buf = buf.clone();
        self.submit(move || {
            let bytes = buf.remaining_bytes();
            let outcome = channel.blocking(|d| d.write_at(&bytes, position));

            let written = outcome.as_ref().ok().copied();
            future.complete_with(outcome, || {
                if let Some(n) = written {
                    buf.advance(n);
                }
            });
            invoker::invoke_unchecked(&future);
        })
    }

    fn lock<A: Send + 'static>(
        self: &Arc<Self>,
        position: u64,
        size: u64,
        shared: bool,
        future: PendingFuture<FileLock, A>,
    ) -> Result<()> {
        if shared && !self.readable {
            return Err(Error::NonReadable);
        }
        if !shared && !self.writable {
            return Err(Error::NonWritable);
        }

        let record = match self.add_lock(position, size, shared)? {
            Some(record) => record,
            None => return self.complete_now(&future, Err(Error::Closed)),
        };

        let channel = self.clone();
        let submitted = self.submit({
            let record = record.clone();
            move || {
                let outcome = channel.blocking(|d| d.lock(true, position, size, shared));

                match outcome {
                    Ok(LockStatus::Locked) if !channel.is_open() => {
                        channel.drop_lock(&record);
                        future.set_failure(Error::Closed);
                    }
                    Ok(LockStatus::Locked) => {
                        let lock = FileLock { record: record.clone() };
                        if !future.set_result(lock) {
                            // Cancelled while waiting for the lock.
                            channel.drop_lock(&record);
                        }
                    }
                    Ok(LockStatus::Unavailable) => {
                        channel.remove_lock(record.id);
                        future.set_failure(Error::from(io::Error::from(io::ErrorKind::WouldBlock)));
                    }
                    Err(err) => {
                        channel.remove_lock(record.id);
                        future.set_failure(err);
                    }
                }
                invoker::invoke_unchecked(&future);
            }
        });

        if submitted.is_err() {
            self.remove_lock(record.id);
        }
        submitted
    }

    /// Record a new lock. Returns `None` if the channel is closed.
    fn add_lock(
        self: &Arc<Self>,
        position: u64,
        size: u64,
        shared: bool,
    ) -> Result<Option<Arc<LockRecord>>> {
        if position > MAX_POSITION {
            return Err(Error::InvalidArgument("position exceeds the largest file offset"));
        }

        let mut locks = lock!(self.locks.lock());
        if !self.is_open() {
            return Ok(None);
        }
        if locks.values().any(|held| held.overlaps(position, size)) {
            return Err(Error::OverlappingLock);
        }

        let record = Arc::new(LockRecord {
            id: self.next_lock.fetch_add(1, Ordering::Relaxed),
            position,
            size,
            shared,
            channel: Arc::downgrade(self),
            valid: Mutex::new(true),
        });
        locks.insert(record.id, record.clone());
        Ok(Some(record))
    }

    fn remove_lock(&self, id: u64) {
        lock!(self.locks.lock()).remove(&id);
    }

    /// Release an acquired lock nobody will see, ignoring failures.
    fn drop_lock(&self, record: &LockRecord) {
        let mut valid = lock!(record.valid.lock());
        if *valid {
            if let Some(dispatcher) = &*lock!(self.dispatcher.read()) {
                if let Err(err) = dispatcher.release(record.position, record.size) {
                    tracing::debug!(?err, "error releasing abandoned lock");
                }
            }
            *valid = false;
        }
        drop(valid);
        self.remove_lock(record.id);
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let span = tracing::trace_span!("close");
        let _enter = span.enter();

        // Released while the dispatcher is still in place.
        let held: Vec<Arc<LockRecord>> = lock!(self.locks.lock()).drain().map(|(_, l)| l).collect();
        for record in held {
            let mut valid = lock!(record.valid.lock());
            if *valid {
                if let Some(dispatcher) = &*lock!(self.dispatcher.read()) {
                    if let Err(err) = dispatcher.release(record.position, record.size) {
                        tracing::debug!(?err, "error releasing lock on close");
                    }
                }
                *valid = false;
            }
        }

        self.threads.signal_and_wait(self.config.close_drain_timeout);

        let dispatcher = lock!(self.dispatcher.write()).take();
        drop(dispatcher);
        tracing::debug!("file channel closed");
    }
}

impl Cancellable for FileInner {
    fn on_cancel(&self, _kind: OpKind) {}

    fn force_close(&self) {
        self.close();
    }
}

impl Drop for FileInner {
    fn drop(&mut self) {
        if self.owns_executor {
            self.executor.shutdown();
        }
    }
}

/// Copy `count` bytes between two files.
fn copy_range(
    src: &dyn FileDispatcher,
    dst: &dyn FileDispatcher,
    position: u64,
    count: u64,
    target_position: u64,
    fast: bool,
) -> io::Result<u64> {
    if count == 0 {
        return Ok(0);
    }

    if fast {
        let len = usize::try_from(count).unwrap_or(usize::MAX);
        match src.copy_to(position, len, dst, target_position) {
            Ok(copied) => return Ok(copied as u64),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Err(err),
            Err(err) => {
                tracing::trace!(?err, "in-kernel copy unavailable, copying through a buffer")
            }
        }
    }

    let mut chunk = vec![0; TRANSFER_CHUNK.min(usize::try_from(count).unwrap_or(TRANSFER_CHUNK))];
    let mut copied = 0u64;
    while copied < count {
        let want = (count - copied).min(chunk.len() as u64) as usize;
        let read = src.read_at(&mut chunk[..want], position + copied)?;
        if read == 0 {
            break;
        }

        let mut written = 0;
        while written < read {
            let n = dst.write_at(&chunk[written..read], target_position + copied + written as u64)?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            written += n;
        }
        copied += read as u64;
    }

    Ok(copied)
}

impl FileLock {
    /// Start of the locked region.
    pub fn position(&self) -> u64 {
        self.record.position
    }

    /// Length of the locked region.
    pub fn size(&self) -> u64 {
        self.record.size
    }

    /// Whether other processes may hold a shared lock on the region too.
    pub fn is_shared(&self) -> bool {
        self.record.shared
    }

    /// Whether the lock is still held.
    pub fn is_valid(&self) -> bool {
        *lock!(self.record.valid.lock())
    }

    /// Releases the lock. Releasing an invalid lock does nothing.
    pub fn release(&self) -> Result<()> {
        let record = &self.record;
        let mut valid = lock!(record.valid.lock());
        if !*valid {
            return Ok(());
        }

        let channel = record.channel.upgrade().ok_or(Error::Closed)?;
        channel.blocking(|d| d.release(record.position, record.size))?;
        *valid = false;
        drop(valid);

        channel.remove_lock(record.id);
        Ok(())
    }
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock")
            .field("position", &self.record.position)
            .field("size", &self.record.size)
            .field("shared", &self.record.shared)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl fmt::Debug for AsyncFileChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFileChannel")
            .field("open", &self.inner.is_open())
            .field("readable", &self.inner.readable)
            .field("writable", &self.inner.writable)
            .field("locks", &lock!(self.inner.locks.lock()).len())
            .field("blocked", &self.inner.threads.len())
            .finish()
    }
}

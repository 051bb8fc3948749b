//! Stream sockets driven by a [`ChannelGroup`]'s completion port.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::buffer::IoBuffer;
use crate::cache::{PendingIo, PendingIoCache, Token};
use crate::error::{Error, Result};
use crate::future::{Cancellable, OpKind, PendingFuture};
use crate::group::{ChannelGroup, OverlappedChannel};
use crate::invoker;
use crate::native::{Handle, Issue, NativeDispatcher, Request};
use crate::port::Completer;

/// An asynchronous stream socket.
///
/// At most one read and one write may be outstanding at a time. A read or write that times
/// out or is cancelled leaves the native operation in an unknown state, so further
/// operations in that direction are refused with [`Error::IllegalState`].
///
/// Clones refer to the same socket.
#[derive(Clone)]
pub struct AsyncSocket {
    inner: Arc<SocketInner>,
}

pub(crate) struct SocketInner {
    group: ChannelGroup,
    key: usize,
    handle: Handle,
    dispatcher: Arc<dyn NativeDispatcher>,
    cache: PendingIoCache,

    /// Whether the socket is open. Held for reading while an operation is being issued.
    open: RwLock<bool>,

    /// Set once the socket has been unregistered and its handle closed.
    released: AtomicBool,

    state: Mutex<SocketState>,
}

#[derive(Debug, Default)]
struct SocketState {
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    connecting: bool,
    connect_killed: bool,
    read: DirectionState,
    write: DirectionState,
}

#[derive(Debug, Default)]
struct DirectionState {
    pending: bool,
    killed: bool,
}

/// Transfer direction of a read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

impl SocketState {
    fn direction(&mut self, direction: Direction) -> &mut DirectionState {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }
}

impl AsyncSocket {
    /// Opens an unconnected socket in `group`.
    pub fn open(
        group: &ChannelGroup,
        dispatcher: Arc<dyn NativeDispatcher>,
    ) -> Result<AsyncSocket> {
        let handle = dispatcher.open_socket()?;
        AsyncSocket::register(group, dispatcher, handle)
    }

    /// Registers an already open native socket with `group`.
    ///
    /// The handle is closed if registration fails.
    pub(crate) fn register(
        group: &ChannelGroup,
        dispatcher: Arc<dyn NativeDispatcher>,
        handle: Handle,
    ) -> Result<AsyncSocket> {
        let key = group.reserve_key();
        let inner = Arc::new(SocketInner {
            group: group.clone(),
            key,
            handle,
            dispatcher,
            cache: PendingIoCache::new(group.clone()),
            open: RwLock::new(true),
            released: AtomicBool::new(false),
            state: Mutex::new(SocketState::default()),
        });

        let channel = Arc::downgrade(&inner);
        let channel: Weak<dyn OverlappedChannel> = channel;
        group.attach(key, channel)?;
        tracing::trace!(key, ?handle, "socket registered");

        Ok(AsyncSocket { inner })
    }

    /// The native handle.
    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    /// The group this socket belongs to.
    pub fn group(&self) -> &ChannelGroup {
        &self.inner.group
    }

    /// Whether the socket is open.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// The local address, once bound or connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock!(self.inner.state.lock()).local
    }

    /// The remote address, once connected.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        lock!(self.inner.state.lock()).remote
    }

    /// Binds the socket to a local address.
    pub fn bind(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let open = lock!(self.inner.open.read());
        if !*open {
            return Err(Error::Closed);
        }

        let mut state = lock!(self.inner.state.lock());
        if state.local.is_some() {
            return Err(Error::IllegalState("socket is already bound"));
        }

        let local = self.inner.dispatcher.bind(self.inner.handle, addr)?;
        state.local = Some(local);
        Ok(local)
    }

    /// Connects to `remote`.
    pub fn connect(&self, remote: SocketAddr) -> Result<PendingFuture<()>> {
        let future = PendingFuture::new(Some(self.inner.weak()), OpKind::Connect);
        self.inner.connect(remote, future.clone())?;
        Ok(future)
    }

    /// Connects to `remote` and calls `handler` with the outcome.
    pub fn connect_with<A, F>(&self, remote: SocketAddr, attachment: A, handler: F) -> Result<()>
    where
        A: Send + 'static,
        F: FnOnce(Result<()>, A) + Send + 'static,
    {
        let future = PendingFuture::with_handler(
            Some(self.inner.weak()),
            OpKind::Connect,
            attachment,
            handler,
        );
        self.inner.connect(remote, future)
    }

    /// Reads into the remaining bytes of `buf`.
    ///
    /// The buffer's position is advanced by the number of bytes read. A result of 0 with bytes
    /// remaining means end of stream.
    pub fn read(&self, buf: &IoBuffer) -> Result<PendingFuture<usize>> {
        let future = PendingFuture::new(Some(self.inner.weak()), OpKind::Read);
        self.inner.transfer(Direction::Read, buf, None, future.clone())?;
        Ok(future)
    }

    /// Reads into `buf` and calls `handler` with the number of bytes read.
    ///
    /// If `timeout` passes first, the handler gets [`Error::Timeout`] and further reads are
    /// refused.
    pub fn read_with<A, F>(
        &self,
        buf: &IoBuffer,
        timeout: Option<Duration>,
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
        self.inner.transfer(Direction::Read, buf, timeout, future)
    }

    /// Writes the remaining bytes of `buf`.
    ///
    /// The buffer's position is advanced by the number of bytes written.
    pub fn write(&self, buf: &IoBuffer) -> Result<PendingFuture<usize>> {
        let future = PendingFuture::new(Some(self.inner.weak()), OpKind::Write);
        self.inner.transfer(Direction::Write, buf, None, future.clone())?;
        Ok(future)
    }

    /// Writes from `buf` and calls `handler` with the number of bytes written.
    ///
    /// If `timeout` passes first, the handler gets [`Error::Timeout`] and further writes are
    /// refused.
    pub fn write_with<A, F>(
        &self,
        buf: &IoBuffer,
        timeout: Option<Duration>,
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
        self.inner.transfer(Direction::Write, buf, timeout, future)
    }

    /// Closes the socket.
    ///
    /// Operations still pending complete with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Marks an accepted socket as connected.
    pub(crate) fn set_connected(&self, local: SocketAddr, remote: SocketAddr) {
        let mut state = lock!(self.inner.state.lock());
        state.local = Some(local);
        state.remote = Some(remote);
    }
}

impl SocketInner {
    fn weak(self: &Arc<Self>) -> Weak<dyn Cancellable> {
        let weak = Arc::downgrade(self);
        let weak: Weak<dyn Cancellable> = weak;
        weak
    }

    fn is_open(&self) -> bool {
        *lock!(self.open.read())
    }

    /// Map a failure observed after the socket was closed to [`Error::Closed`].
    fn closed_or(&self, error: Error) -> Error {
        if self.is_open() {
            error
        } else {
            Error::Closed
        }
    }

    /// Claim `direction` for a new operation.
    fn begin(&self, direction: Direction) -> Result<()> {
        let mut state = lock!(self.state.lock());
        if state.remote.is_none() {
            return Err(Error::NotConnected);
        }

        let side = state.direction(direction);
        if side.killed {
            return Err(match direction {
                Direction::Read => {
                    Error::IllegalState("reading not allowed after timeout or cancellation")
                }
                Direction::Write => {
                    Error::IllegalState("writing not allowed after timeout or cancellation")
                }
            });
        }
        if side.pending {
            return Err(match direction {
                Direction::Read => Error::ReadPending,
                Direction::Write => Error::WritePending,
            });
        }

        side.pending = true;
        Ok(())
    }

    /// Release `direction`, refusing further operations if `killed`.
    fn end(&self, direction: Direction, killed: bool) {
        let mut state = lock!(self.state.lock());
        let side = state.direction(direction);
        side.pending = false;
        if killed {
            side.killed = true;
        }
    }

    fn transfer<A: Send + 'static>(
        self: &Arc<Self>,
        direction: Direction,
        buf: &IoBuffer,
        timeout: Option<Duration>,
        future: PendingFuture<usize, A>,
    ) -> Result<()> {
        let span = tracing::trace_span!("transfer", key = self.key, ?direction);
        let _enter = span.enter();

        if direction == Direction::Read && buf.is_read_only() {
            return Err(Error::InvalidArgument("read into a read-only buffer"));
        }

        if !self.is_open() {
            future.set_failure(Error::Closed);
            return invoker::invoke(&self.group, &future);
        }

        self.begin(direction)?;

        let task = Arc::new(TransferTask {
            socket: Arc::downgrade(self),
            group: self.group.clone(),
            key: self.key,
            direction,
            buf: buf.clone(),
            future: future.clone(),
        });

        if !buf.has_remaining() {
            task.finish(Ok(0));
            return invoker::invoke(&self.group, &future);
        }

        let issued = {
            let open = lock!(self.open.read());
            if !*open {
                Err(Error::Closed)
            } else {
                let request = match direction {
                    Direction::Read => Request::Read(buf),
                    Direction::Write => Request::Write(buf),
                };
                self.issue(request, task.clone())
            }
        };

        match issued {
            Ok(None) => {
                if let Some(timeout) = timeout {
                    self.schedule_timeout(direction, timeout, &future);
                }
                Ok(())
            }
            Ok(Some(bytes)) => {
                task.finish(Ok(bytes));
                invoker::invoke(&self.group, &future)
            }
            Err(err) => {
                task.finish(Err(err));
                invoker::invoke(&self.group, &future)
            }
        }
    }

    /// Register `io` and start `request`.
    ///
    /// Returns `Ok(None)` if the operation was queued, or the byte count if it completed on
    /// the spot. Must be called with the open lock held for reading.
    fn issue(&self, request: Request<'_>, io: Arc<dyn PendingIo>) -> Result<Option<usize>> {
        let token = self.cache.add(io)?;
        let completer = Completer::new(self.group.port().clone(), self.key, token);

        match self.dispatcher.issue(self.handle, request, completer) {
            Issue::Queued => {
                tracing::trace!(key = self.key, ?token, "queued");
                Ok(None)
            }
            Issue::Immediate(bytes) => {
                self.release_token(token);
                Ok(Some(bytes))
            }
            Issue::Failed(err) => {
                self.release_token(token);
                Err(Error::from(err))
            }
        }
    }

    fn release_token(&self, token: Token) {
        if self.cache.remove(token).is_none() {
            tracing::warn!(key = self.key, ?token, "token already released");
        }
    }

    fn schedule_timeout<A: Send + 'static>(
        self: &Arc<Self>,
        direction: Direction,
        timeout: Duration,
        future: &PendingFuture<usize, A>,
    ) {
        let socket = Arc::downgrade(self);
        let timed_out = future.clone();
        let handle = self.group.schedule(timeout, move || {
            let socket = match socket.upgrade() {
                Some(socket) => socket,
                None => return,
            };

            if timed_out.complete_with(Err(Error::Timeout), || socket.end(direction, true)) {
                tracing::trace!(key = socket.key, ?direction, "timed out");
                if let Err(err) = invoker::invoke(&socket.group, &timed_out) {
                    tracing::debug!(?err, "timeout callback not dispatched");
                }
            }
        });

        if let Some(handle) = handle {
            future.set_timeout(handle);
        }
    }

    fn connect<A: Send + 'static>(
        self: &Arc<Self>,
        remote: SocketAddr,
        future: PendingFuture<(), A>,
    ) -> Result<()> {
        let span = tracing::trace_span!("connect", key = self.key, ?remote);
        let _enter = span.enter();

        if !self.is_open() {
            future.set_failure(Error::Closed);
            return invoker::invoke(&self.group, &future);
        }

        {
            let mut state = lock!(self.state.lock());
            if state.remote.is_some() {
                return Err(Error::AlreadyConnected);
            }
            if state.connect_killed {
                return Err(Error::IllegalState("connect not allowed after cancellation"));
            }
            if state.connecting {
                return Err(Error::ConnectPending);
            }
            state.connecting = true;
        }

        let task = Arc::new(ConnectTask {
            socket: Arc::downgrade(self),
            group: self.group.clone(),
            key: self.key,
            remote,
            future: future.clone(),
        });

        let issued = {
            let open = lock!(self.open.read());
            if !*open {
                Err(Error::Closed)
            } else {
                self.issue(Request::Connect(remote), task.clone())
            }
        };

        match issued {
            Ok(None) => Ok(()),
            Ok(Some(_)) => {
                task.finish(Ok(()));
                invoker::invoke(&self.group, &future)
            }
            Err(err) => {
                task.finish(Err(err));
                invoker::invoke(&self.group, &future)
            }
        }
    }

    fn close(&self) -> Result<()> {
        {
            let mut open = lock!(self.open.write());
            if !*open {
                return Ok(());
            }
            *open = false;
        }

        let span = tracing::trace_span!("close", key = self.key, handle = ?self.handle);
        let _enter = span.enter();

        let result = self.release();
        self.cache.close();
        self.group.unregister(self.key);
        result
    }

    /// Close the native handle once.
    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.dispatcher.close(self.handle).map_err(Error::from)
    }
}

impl OverlappedChannel for SocketInner {
    fn take_pending(&self, token: Token) -> Option<Arc<dyn PendingIo>> {
        self.cache.remove(token)
    }

    fn close_channel(&self) -> Result<()> {
        self.close()
    }
}

impl Cancellable for SocketInner {
    fn on_cancel(&self, kind: OpKind) {
        let mut state = lock!(self.state.lock());
        match kind {
            OpKind::Read => state.read.killed = true,
            OpKind::Write => state.write.killed = true,
            OpKind::Connect => state.connect_killed = true,
            _ => {}
        }
    }

    fn force_close(&self) {
        if let Err(err) = self.close() {
            tracing::debug!(key = self.key, ?err, "error closing cancelled socket");
        }
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        if *lock!(self.open.read()) {
            if let Err(err) = self.release() {
                tracing::debug!(key = self.key, ?err, "error closing dropped socket");
            }
            self.cache.close();
            self.group.unregister(self.key);
        }
    }
}

/// A read or write waiting for its native completion.
struct TransferTask<A> {
    socket: Weak<SocketInner>,
    group: ChannelGroup,
    key: usize,
    direction: Direction,
    buf: IoBuffer,
    future: PendingFuture<usize, A>,
}

impl<A: Send + 'static> TransferTask<A> {
    /// Complete the future, advancing the buffer on success. Returns whether this call
    /// completed it.
    fn finish(&self, outcome: Result<usize>) -> bool {
        let socket = self.socket.upgrade();
        let outcome = match &socket {
            Some(socket) => outcome.map_err(|err| socket.closed_or(err)),
            None => outcome.map_err(|_| Error::Closed),
        };
        let advance = outcome.as_ref().ok().copied();

        self.future.complete_with(outcome, || {
            if let Some(bytes) = advance {
                self.buf.advance(bytes);
            }
            if let Some(socket) = &socket {
                socket.end(self.direction, false);
            }
        })
    }

    fn dispatch(&self, can_invoke_direct: bool) {
        if can_invoke_direct {
            invoker::invoke_unchecked(&self.future);
        } else if let Err(err) = invoker::invoke(&self.group, &self.future) {
            tracing::debug!(key = self.key, ?err, "completion callback not dispatched");
        }
    }
}

impl<A: Send + 'static> PendingIo for TransferTask<A> {
    fn completed(&self, bytes: usize, can_invoke_direct: bool) {
        tracing::trace!(key = self.key, direction = ?self.direction, bytes, "completed");
        if self.finish(Ok(bytes)) {
            self.dispatch(can_invoke_direct);
        }
    }

    fn failed(&self, error: Error) {
        tracing::trace!(key = self.key, direction = ?self.direction, %error, "failed");
        if self.finish(Err(error)) {
            self.dispatch(false);
        }
    }
}

/// A connect waiting for its native completion.
struct ConnectTask<A> {
    socket: Weak<SocketInner>,
    group: ChannelGroup,
    key: usize,
    remote: SocketAddr,
    future: PendingFuture<(), A>,
}

impl<A: Send + 'static> ConnectTask<A> {
    fn finish(&self, outcome: Result<()>) -> bool {
        let socket = match self.socket.upgrade() {
            Some(socket) => socket,
            None => return self.future.set_failure(Error::Closed),
        };

        let outcome = outcome
            .and_then(|()| Ok(socket.dispatcher.finish_connect(socket.handle)?))
            .map_err(|err| socket.closed_or(err));

        let local = match &outcome {
            Ok(local) => Some(*local),
            Err(_) => None,
        };

        let done = self.future.complete_with(outcome.map(drop), || {
            let mut state = lock!(socket.state.lock());
            state.connecting = false;
            if let Some(local) = local {
                state.local = Some(local);
                state.remote = Some(self.remote);
            }
        });

        // A socket whose connect failed cannot be reused.
        if done && local.is_none() {
            if let Err(err) = socket.close() {
                tracing::debug!(key = self.key, ?err, "error closing socket after failed connect");
            }
        }
        done
    }

    fn dispatch(&self, can_invoke_direct: bool) {
        if can_invoke_direct {
            invoker::invoke_unchecked(&self.future);
        } else if let Err(err) = invoker::invoke(&self.group, &self.future) {
            tracing::debug!(key = self.key, ?err, "connect callback not dispatched");
        }
    }
}

impl<A: Send + 'static> PendingIo for ConnectTask<A> {
    fn completed(&self, _bytes: usize, can_invoke_direct: bool) {
        if self.finish(Ok(())) {
            self.dispatch(can_invoke_direct);
        }
    }

    fn failed(&self, error: Error) {
        if self.finish(Err(error)) {
            self.dispatch(false);
        }
    }
}

impl fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock!(self.inner.state.lock());
        f.debug_struct("AsyncSocket")
            .field("key", &self.inner.key)
            .field("handle", &self.inner.handle)
            .field("open", &self.inner.is_open())
            .field("local", &state.local)
            .field("remote", &state.remote)
            .finish()
    }
}

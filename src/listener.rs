//! Listening sockets and the accept protocol.
//!
//! An accept needs a child socket before the native call is made. The child is created and
//! registered with the group first, then handed to the dispatcher together with a correlation
//! token. Whichever way the native call ends, the child is either delivered to the caller or
//! closed, and the callback is always dispatched to a group thread.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::cache::{PendingIo, PendingIoCache, Token};
use crate::error::{Error, Result};
use crate::future::{Cancellable, OpKind, PendingFuture};
use crate::group::{ChannelGroup, OverlappedChannel};
use crate::invoker;
use crate::native::{Handle, Issue, NativeDispatcher, Request};
use crate::port::Completer;
use crate::socket::AsyncSocket;

/// A listening socket accepting connections as [`AsyncSocket`]s.
///
/// Only one accept may be outstanding at a time. Clones refer to the same listener.
#[derive(Clone)]
pub struct AsyncListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    group: ChannelGroup,
    key: usize,
    handle: Handle,
    dispatcher: Arc<dyn NativeDispatcher>,
    cache: PendingIoCache,

    /// Whether the listener is open. Held for reading while an accept is being issued.
    open: RwLock<bool>,
    released: AtomicBool,

    local: Mutex<Option<SocketAddr>>,

    /// Set while an accept is outstanding.
    accepting: AtomicBool,

    /// Set when a pending accept was cancelled.
    accept_killed: AtomicBool,
}

impl AsyncListener {
    /// Opens an unbound listener in `group`.
    pub fn open(
        group: &ChannelGroup,
        dispatcher: Arc<dyn NativeDispatcher>,
    ) -> Result<AsyncListener> {
        let handle = dispatcher.open_socket()?;
        let key = group.reserve_key();
        let inner = Arc::new(ListenerInner {
            group: group.clone(),
            key,
            handle,
            dispatcher,
            cache: PendingIoCache::new(group.clone()),
            open: RwLock::new(true),
            released: AtomicBool::new(false),
            local: Mutex::new(None),
            accepting: AtomicBool::new(false),
            accept_killed: AtomicBool::new(false),
        });

        let channel = Arc::downgrade(&inner);
        let channel: Weak<dyn OverlappedChannel> = channel;
        group.attach(key, channel)?;
        tracing::trace!(key, ?handle, "listener registered");

        Ok(AsyncListener { inner })
    }

    /// The native handle.
    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    /// Whether the listener is open.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// The bound address, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock!(self.inner.local.lock())
    }

    /// Binds the listener to `addr` and returns the address actually bound.
    pub fn bind(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let open = lock!(self.inner.open.read());
        if !*open {
            return Err(Error::Closed);
        }

        let mut local = lock!(self.inner.local.lock());
        if local.is_some() {
            return Err(Error::IllegalState("listener is already bound"));
        }

        let bound = self.inner.dispatcher.bind(self.inner.handle, addr)?;
        *local = Some(bound);
        Ok(bound)
    }

    /// Accepts a connection.
    pub fn accept(&self) -> Result<PendingFuture<AsyncSocket>> {
        let future = PendingFuture::new(Some(self.inner.weak()), OpKind::Accept);
        self.inner.accept(future.clone())?;
        Ok(future)
    }

    /// Accepts a connection and calls `handler` with it.
    ///
    /// The handler always runs on a thread of the listener's group, never on the calling
    /// thread.
    pub fn accept_with<A, F>(&self, attachment: A, handler: F) -> Result<()>
    where
        A: Send + 'static,
        F: FnOnce(Result<AsyncSocket>, A) + Send + 'static,
    {
        let future = PendingFuture::with_handler(
            Some(self.inner.weak()),
            OpKind::Accept,
            attachment,
            handler,
        );
        self.inner.accept(future)
    }

    /// Closes the listener. A pending accept completes with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

impl ListenerInner {
    fn weak(self: &Arc<Self>) -> Weak<dyn Cancellable> {
        let weak = Arc::downgrade(self);
        let weak: Weak<dyn Cancellable> = weak;
        weak
    }

    fn is_open(&self) -> bool {
        *lock!(self.open.read())
    }

    /// Map a failure observed after the listener was closed to [`Error::Closed`].
    fn closed_or(&self, error: Error) -> Error {
        if self.is_open() {
            error
        } else {
            Error::Closed
        }
    }

    fn accept<A: Send + 'static>(
        self: &Arc<Self>,
        future: PendingFuture<AsyncSocket, A>,
    ) -> Result<()> {
        let span = tracing::trace_span!("accept", key = self.key);
        let _enter = span.enter();

        if !self.is_open() {
            future.set_failure(Error::Closed);
            return invoker::invoke_indirectly(&self.group, &future);
        }
        if self.accept_killed.load(Ordering::SeqCst) {
            return Err(Error::IllegalState("accept not allowed after cancellation"));
        }
        if lock!(self.local.lock()).is_none() {
            return Err(Error::NotBound);
        }

        // Claimed before anything native is touched, so a rejected accept changes nothing.
        if self
            .accepting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AcceptPending);
        }

        let child = match AsyncSocket::open(&self.group, self.dispatcher.clone()) {
            Ok(child) => child,
            Err(err) => {
                self.accepting.store(false, Ordering::SeqCst);
                future.set_failure(err);
                return invoker::invoke_indirectly(&self.group, &future);
            }
        };

        let task = Arc::new(AcceptTask {
            listener: Arc::downgrade(self),
            group: self.group.clone(),
            key: self.key,
            child,
            future: future.clone(),
        });

        let issued = {
            let open = lock!(self.open.read());
            if !*open {
                Err(Error::Closed)
            } else {
                self.issue(task.clone())
            }
        };

        match issued {
            Ok(true) => Ok(()),
            Ok(false) => task.finish(Ok(())),
            Err(err) => task.finish(Err(err)),
        }
    }

    /// Start the native accept. Returns `true` if it was queued.
    fn issue<A: Send + 'static>(&self, task: Arc<AcceptTask<A>>) -> Result<bool> {
        let child = task.child.handle();
        let token = self.cache.add(task)?;
        let completer = Completer::new(self.group.port().clone(), self.key, token);

        match self.dispatcher.issue(self.handle, Request::Accept { child }, completer) {
            Issue::Queued => {
                tracing::trace!(key = self.key, ?token, "accept queued");
                Ok(true)
            }
            Issue::Immediate(_) => {
                self.cache.remove(token);
                Ok(false)
            }
            Issue::Failed(err) => {
                self.cache.remove(token);
                Err(Error::from(err))
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

    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.dispatcher.close(self.handle).map_err(Error::from)
    }
}

impl OverlappedChannel for ListenerInner {
    fn take_pending(&self, token: Token) -> Option<Arc<dyn PendingIo>> {
        self.cache.remove(token)
    }

    fn close_channel(&self) -> Result<()> {
        self.close()
    }
}

impl Cancellable for ListenerInner {
    fn on_cancel(&self, kind: OpKind) {
        if kind == OpKind::Accept {
            self.accept_killed.store(true, Ordering::SeqCst);
        }
    }

    fn force_close(&self) {
        if let Err(err) = self.close() {
            tracing::debug!(key = self.key, ?err, "error closing cancelled listener");
        }
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        if *lock!(self.open.read()) {
            if let Err(err) = self.release() {
                tracing::debug!(key = self.key, ?err, "error closing dropped listener");
            }
            self.cache.close();
            self.group.unregister(self.key);
        }
    }
}

/// An accept waiting for its native completion, with the child it will hand out.
struct AcceptTask<A> {
    listener: Weak<ListenerInner>,
    group: ChannelGroup,
    key: usize,
    child: AsyncSocket,
    future: PendingFuture<AsyncSocket, A>,
}

impl<A: Send + 'static> AcceptTask<A> {
    /// Finish the accept and dispatch the callback to a group thread.
    ///
    /// Fails with [`Error::GroupShutDown`] if the group refused the callback.
    fn finish(&self, outcome: Result<()>) -> Result<()> {
        let listener = self.listener.upgrade();

        let accepted = match &listener {
            Some(listener) => outcome
                .and_then(|()| {
                    if self.group.is_shutdown() {
                        return Err(Error::GroupShutDown);
                    }
                    let child = self.child.handle();
                    let (local, remote) =
                        listener.dispatcher.finish_accept(listener.handle, child)?;
                    self.child.set_connected(local, remote);
                    Ok(())
                })
                .map_err(|err| listener.closed_or(err)),
            None => Err(Error::Closed),
        };
        if let Some(listener) = &listener {
            listener.accepting.store(false, Ordering::SeqCst);
        }

        let delivered = match accepted {
            Ok(()) => self.future.set_result(self.child.clone()),
            Err(err) => {
                self.future.set_failure(err);
                false
            }
        };

        let dispatched = invoker::invoke_indirectly(&self.group, &self.future);

        // Nobody will take the child: the accept failed, was cancelled first, or its
        // callback cannot run.
        if !delivered || dispatched.is_err() {
            tracing::trace!(
                key = self.key,
                child = ?self.child.handle(),
                "closing undelivered child"
            );
            if let Err(err) = self.child.close() {
                tracing::debug!(?err, "error closing child socket");
            }
        }
        dispatched
    }
}

impl<A: Send + 'static> PendingIo for AcceptTask<A> {
    fn completed(&self, _bytes: usize, _can_invoke_direct: bool) {
        if let Err(err) = self.finish(Ok(())) {
            tracing::debug!(key = self.key, ?err, "accept callback not dispatched");
        }
    }

    fn failed(&self, error: Error) {
        if let Err(err) = self.finish(Err(error)) {
            tracing::debug!(key = self.key, ?err, "accept callback not dispatched");
        }
    }
}

impl fmt::Debug for AsyncListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncListener")
            .field("key", &self.inner.key)
            .field("handle", &self.inner.handle)
            .field("open", &self.inner.is_open())
            .field("local", &self.local_addr())
            .field("accepting", &self.inner.accepting.load(Ordering::SeqCst))
            .finish()
    }
}

//! Result handle of an asynchronous operation.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::timer::TimerHandle;

/// The kind of operation a future belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Read,
    Write,
    Accept,
    Connect,
    Lock,
}

/// Implemented by channels whose in-flight operations can be invalidated on cancel.
pub(crate) trait Cancellable: Send + Sync {
    /// Invoked before a pending operation of `kind` is marked cancelled.
    fn on_cancel(&self, kind: OpKind);

    /// Closes the channel, failing everything that is still pending.
    fn force_close(&self);
}

/// Callback registered with an operation, with its attachment.
struct Handler<V, A> {
    callback: Box<dyn FnOnce(Result<V>, A) + Send>,
    attachment: A,
}

/// The outcome of an asynchronous operation.
///
/// A future completes exactly once, by success, failure or cancellation, whichever happens
/// first. Later attempts are ignored. Clones refer to the same operation.
pub struct PendingFuture<V, A = ()> {
    inner: Arc<Inner<V, A>>,
}

struct Inner<V, A> {
    /// Owning channel, notified on cancel.
    channel: Option<Weak<dyn Cancellable>>,

    kind: OpKind,

    state: Mutex<State<V, A>>,
}

struct State<V, A> {
    /// `Some` once the operation is done. Never replaced after that.
    outcome: Option<Result<V>>,

    /// Taken exactly once when the callback runs.
    handler: Option<Handler<V, A>>,

    /// Timeout job to cancel on completion.
    timeout: Option<TimerHandle>,

    /// Created by the first blocked waiter.
    gate: Option<Arc<Condvar>>,
}

impl<V, A> Clone for PendingFuture<V, A> {
    fn clone(&self) -> Self {
        PendingFuture {
            inner: self.inner.clone(),
        }
    }
}

impl<V, A> PendingFuture<V, A>
where
    V: Clone + Send + 'static,
    A: Send + 'static,
{
    fn with_state(
        channel: Option<Weak<dyn Cancellable>>,
        kind: OpKind,
        outcome: Option<Result<V>>,
        handler: Option<Handler<V, A>>,
    ) -> Self {
        PendingFuture {
            inner: Arc::new(Inner {
                channel,
                kind,
                state: Mutex::new(State {
                    outcome,
                    handler,
                    timeout: None,
                    gate: None,
                }),
            }),
        }
    }

    /// A pending operation with a callback.
    pub(crate) fn with_handler<F>(
        channel: Option<Weak<dyn Cancellable>>,
        kind: OpKind,
        attachment: A,
        callback: F,
    ) -> Self
    where
        F: FnOnce(Result<V>, A) + Send + 'static,
    {
        let handler = Handler {
            callback: Box::new(callback),
            attachment,
        };
        Self::with_state(channel, kind, None, Some(handler))
    }

    /// Whether a callback is registered and has not run yet.
    pub(crate) fn has_handler(&self) -> bool {
        lock!(self.inner.state.lock()).handler.is_some()
    }

    /// Complete with `outcome`. Returns `false` if the operation was already done.
    pub(crate) fn complete(&self, outcome: Result<V>) -> bool {
        self.complete_with(outcome, || {})
    }

    /// Complete with `outcome`, running `before` first under the same lock.
    ///
    /// `before` only runs if this call completes the operation.
    pub(crate) fn complete_with(&self, outcome: Result<V>, before: impl FnOnce()) -> bool {
        let mut state = lock!(self.inner.state.lock());
        if state.outcome.is_some() {
            return false;
        }

        before();
        state.outcome = Some(outcome);
        Self::release(&mut state);
        true
    }

    /// Complete successfully. Returns `false` if the operation was already done.
    pub(crate) fn set_result(&self, value: V) -> bool {
        self.complete(Ok(value))
    }

    /// Fail. Returns `false` if the operation was already done.
    pub(crate) fn set_failure(&self, error: Error) -> bool {
        self.complete(Err(error))
    }

    /// Attach a timeout job. It is cancelled right away if the operation is already done.
    pub(crate) fn set_timeout(&self, handle: TimerHandle) {
        let mut state = lock!(self.inner.state.lock());
        if state.outcome.is_some() {
            handle.cancel();
        } else {
            state.timeout = Some(handle);
        }
    }

    /// Run the callback with the outcome, if both are present. At most once.
    pub(crate) fn invoke_handler(&self) {
        let (handler, outcome) = {
            let mut state = lock!(self.inner.state.lock());
            let outcome = match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => return,
            };
            match state.handler.take() {
                Some(handler) => (handler, outcome),
                None => return,
            }
        };

        (handler.callback)(outcome, handler.attachment);
    }

    /// Cancels the timeout and wakes every waiter. Called with the state locked.
    fn release(state: &mut State<V, A>) {
        if let Some(timeout) = state.timeout.take() {
            timeout.cancel();
        }
        if let Some(gate) = &state.gate {
            gate.notify_all();
        }
    }

    /// Blocks until the operation is done and returns its outcome.
    pub fn get(&self) -> Result<V> {
        self.wait(None)
    }

    /// Blocks for at most `timeout`. Returns [`Error::Timeout`] if the operation is still
    /// pending by then; the operation itself is unaffected.
    pub fn get_timeout(&self, timeout: Duration) -> Result<V> {
        self.wait(Some(timeout))
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<V> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = lock!(self.inner.state.lock());

        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }

            let gate = state
                .gate
                .get_or_insert_with(|| Arc::new(Condvar::new()))
                .clone();

            match deadline {
                None => state = lock!(gate.wait(state)),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    state = lock!(gate.wait_timeout(state, deadline - now)).0;
                }
            }
        }
    }

    /// Whether the operation is done.
    pub fn is_done(&self) -> bool {
        lock!(self.inner.state.lock()).outcome.is_some()
    }

    /// Whether the operation ended by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            lock!(self.inner.state.lock()).outcome,
            Some(Err(Error::Cancelled))
        )
    }

    /// Cancels the operation if it is not done yet.
    ///
    /// The owning channel is told first so that it can refuse further operations of the same
    /// kind; the native operation may still complete later and is then discarded. With
    /// `force_close` the channel is closed afterwards. Returns `false` if the operation was
    /// already done.
    pub fn cancel(&self, force_close: bool) -> bool {
        if self.is_done() {
            return false;
        }

        let channel = self.inner.channel.as_ref().and_then(Weak::upgrade);
        if let Some(channel) = &channel {
            channel.on_cancel(self.inner.kind);
        }

        if !self.complete(Err(Error::Cancelled)) {
            return false;
        }

        if force_close {
            if let Some(channel) = channel {
                channel.force_close();
            }
        }
        true
    }
}

impl<V: Clone + Send + 'static> PendingFuture<V, ()> {
    /// A pending operation without a callback.
    pub(crate) fn new(channel: Option<Weak<dyn Cancellable>>, kind: OpKind) -> Self {
        Self::with_state(channel, kind, None, None)
    }
}

impl<V, A> fmt::Debug for PendingFuture<V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock!(self.inner.state.lock());
        f.debug_struct("PendingFuture")
            .field("kind", &self.inner.kind)
            .field("done", &state.outcome.is_some())
            .field("has_handler", &state.handler.is_some())
            .finish()
    }
}

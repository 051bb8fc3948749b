//! Completion callback dispatch with bounded recursion.

use std::cell::Cell;

use crate::error::{Error, Result};
use crate::future::PendingFuture;
use crate::group::{ChannelGroup, GroupId};
use crate::pool::{Task, ThreadPool};

thread_local! {
    static CONTEXT: Cell<Option<DispatchContext>> = const { Cell::new(None) };
}

/// Identity of a thread running on behalf of a [`ChannelGroup`].
///
/// The context is installed for the duration of a task bound to a group. `depth` counts the
/// completion callbacks invoked directly on the current stack since the thread last went
/// back to waiting for completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchContext {
    group: GroupId,
    depth: usize,
}

/// Restores the previous context when dropped.
pub(crate) struct ContextScope {
    previous: Option<DispatchContext>,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        CONTEXT.with(|c| c.set(self.previous));
    }
}

impl DispatchContext {
    /// The context of the calling thread, if it belongs to a group.
    pub fn current() -> Option<DispatchContext> {
        CONTEXT.with(Cell::get)
    }

    /// The group this thread belongs to.
    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Number of callbacks invoked directly on this stack.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Bind the calling thread to `group` until the returned scope drops.
    pub(crate) fn enter(group: GroupId) -> ContextScope {
        let previous = CONTEXT.with(|c| c.replace(Some(DispatchContext { group, depth: 0 })));
        ContextScope { previous }
    }

    /// Called by a worker each time it goes back to waiting for completions.
    pub(crate) fn reset_depth() {
        Self::update(|_| 0);
    }

    fn update(f: impl FnOnce(usize) -> usize) {
        CONTEXT.with(|c| {
            if let Some(mut context) = c.get() {
                context.depth = f(context.depth);
                c.set(Some(context));
            }
        });
    }
}

/// Invokes the callback of a completed operation.
///
/// The callback runs on the current thread if it belongs to `group` and fewer than
/// `max_handlers_on_stack` callbacks are already on its stack. Otherwise it is handed to the
/// group. If the group refuses it, a thread of the group still runs it inline; any other
/// thread gets [`Error::GroupShutDown`].
pub(crate) fn invoke<V, A>(group: &ChannelGroup, future: &PendingFuture<V, A>) -> Result<()>
where
    V: Clone + Send + 'static,
    A: Send + 'static,
{
    if !future.has_handler() {
        return Ok(());
    }

    let mut identity_okay = false;
    let mut invoke_direct = false;
    if let Some(context) = DispatchContext::current() {
        if context.group == group.id() {
            identity_okay = true;
            invoke_direct = context.depth < group.config().max_handlers_on_stack;
        }
    }

    if invoke_direct {
        self::invoke_direct(future);
        return Ok(());
    }

    match invoke_indirectly(group, future) {
        Err(Error::GroupShutDown) if identity_okay => {
            self::invoke_direct(future);
            Ok(())
        }
        result => result,
    }
}

/// Invokes the callback on this stack, counting it against the stack depth.
pub(crate) fn invoke_direct<V, A>(future: &PendingFuture<V, A>)
where
    V: Clone + Send + 'static,
    A: Send + 'static,
{
    DispatchContext::update(|depth| depth + 1);
    invoke_unchecked(future);
}

/// Invokes the callback on a thread of `group`, as the first callback on that stack.
pub(crate) fn invoke_indirectly<V, A>(
    group: &ChannelGroup,
    future: &PendingFuture<V, A>,
) -> Result<()>
where
    V: Clone + Send + 'static,
    A: Send + 'static,
{
    if !future.has_handler() {
        return Ok(());
    }

    let future = future.clone();
    group
        .execute_on_pooled_thread(move || {
            DispatchContext::update(|_| 1);
            invoke_unchecked(&future);
        })
        .map_err(|_| Error::GroupShutDown)
}

/// Invokes the callback on a thread of `executor`.
pub(crate) fn invoke_on_executor<V, A>(
    executor: &ThreadPool,
    future: &PendingFuture<V, A>,
) -> Result<()>
where
    V: Clone + Send + 'static,
    A: Send + 'static,
{
    if !future.has_handler() {
        return Ok(());
    }

    let future = future.clone();
    executor
        .execute(Task::new(move || invoke_unchecked(&future)))
        .map_err(|_| Error::GroupShutDown)
}

/// Invokes the callback on this stack without any checks.
pub(crate) fn invoke_unchecked<V, A>(future: &PendingFuture<V, A>)
where
    V: Clone + Send + 'static,
    A: Send + 'static,
{
    future.invoke_handler();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::future::OpKind;
    use std::sync::mpsc;
    use std::thread;

    /// An elastic group whose pool no longer accepts work.
    fn refusing_group(max_handlers_on_stack: usize) -> ChannelGroup {
        let pool = ThreadPool::cached("invoker-test");
        let config = Config {
            internal_threads: 0,
            max_handlers_on_stack,
            ..Config::default()
        };
        let group = ChannelGroup::elastic(pool.clone(), 0, config).unwrap();
        pool.shutdown();
        group
    }

    #[test]
    fn scopes_nest_and_restore() {
        assert_eq!(DispatchContext::current(), None);

        let outer = GroupId::next();
        let inner = GroupId::next();
        {
            let _outer = DispatchContext::enter(outer);
            DispatchContext::update(|d| d + 3);
            {
                let _inner = DispatchContext::enter(inner);
                let context = DispatchContext::current().unwrap();
                assert_eq!((context.group(), context.depth()), (inner, 0));
            }

            let context = DispatchContext::current().unwrap();
            assert_eq!((context.group(), context.depth()), (outer, 3));

            DispatchContext::reset_depth();
            assert_eq!(DispatchContext::current().unwrap().depth(), 0);
        }

        assert_eq!(DispatchContext::current(), None);
    }

    #[test]
    fn unbound_thread_is_unaffected_by_depth_updates() {
        DispatchContext::update(|d| d + 1);
        DispatchContext::reset_depth();
        assert_eq!(DispatchContext::current(), None);
    }

    #[test]
    fn refused_callback_fails_on_foreign_thread() {
        let group = refusing_group(16);
        let (tx, rx) = mpsc::channel();
        let future = PendingFuture::with_handler(None, OpKind::Read, (), move |result, ()| {
            tx.send(result).unwrap();
        });
        assert!(future.set_result(7usize));

        assert!(matches!(invoke(&group, &future), Err(Error::GroupShutDown)));
        assert!(rx.try_recv().is_err());
        group.shutdown_now();
    }

    #[test]
    fn refused_callback_runs_inline_on_group_thread() {
        let group = refusing_group(0);
        let (tx, rx) = mpsc::channel();
        let future = PendingFuture::with_handler(None, OpKind::Read, (), move |result, ()| {
            tx.send((result, thread::current().id())).unwrap();
        });
        assert!(future.set_result(7usize));

        {
            let _scope = DispatchContext::enter(group.id());
            invoke(&group, &future).unwrap();
        }

        let (result, ran_on) = rx.try_recv().unwrap();
        assert_eq!(result.unwrap(), 7);
        assert_eq!(ran_on, thread::current().id());
        group.shutdown_now();
    }
}

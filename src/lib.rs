//! Completion-based asynchronous I/O core.
//!
//! Operations issued on a channel (read, write, accept, connect, lock) either complete
//! immediately or are parked in a per-channel [`PendingIoCache`] under a correlation
//! [`Token`] until a completion arrives on the owning [`ChannelGroup`]'s completion port.
//! Results are delivered through a [`PendingFuture`] or through a callback.
//!
//! Supported channels:
//!
//! - [`AsyncSocket`] and [`AsyncListener`], driven by a [`NativeDispatcher`] and the group's
//!   worker threads.
//! - [`AsyncFileChannel`], a portable channel that runs blocking file calls on a
//!   [`ThreadPool`] and interrupts them on close.
//!
//! Callbacks are invoked directly on the thread that observed the completion when that
//! thread belongs to the channel's group and fewer than
//! [`Config::max_handlers_on_stack`] callbacks are already on its stack. Otherwise they are
//! handed to the group's pool.
//!
//! # Examples
//!
//! ```
//! use iogroup::{ChannelGroup, Config};
//! use std::time::Duration;
//!
//! # fn main() -> std::io::Result<()> {
//! let group = ChannelGroup::fixed(2, Config::default())?;
//! assert_eq!(group.thread_count(), 2);
//!
//! group.shutdown();
//! assert!(group.await_termination(Duration::from_secs(5)));
//! # Ok(()) }
//! ```
//!
//! [`PendingIoCache`]: cache::PendingIoCache

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, rust_2018_idioms)]

/// Macro to lock and ignore lock poisoning.
macro_rules! lock {
    ($lock_result:expr) => {{
        $lock_result.unwrap_or_else(|e| e.into_inner())
    }};
}

/// Calls a libc function and turns `-1` into the last OS error.
#[cfg(unix)]
macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)? ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod buffer;
mod cache;
mod config;
mod error;
mod file;
mod future;
mod group;
mod invoker;
mod listener;
mod native;
mod pool;
mod port;
mod socket;
mod threads;
mod timer;

pub use buffer::IoBuffer;
pub use cache::Token;
pub use config::Config;
pub use error::{Error, Result};
pub use file::{AsyncFileChannel, FileLock, OpenOptions};
pub use future::PendingFuture;
pub use group::{ChannelGroup, GroupId, GroupState};
pub use invoker::DispatchContext;
pub use listener::AsyncListener;
pub use native::{FileDispatcher, Handle, Issue, LockStatus, NativeDispatcher, Request};
pub use pool::{Rejected, Task, ThreadPool};
pub use port::Completer;
pub use socket::AsyncSocket;

#[cfg(any(unix, windows))]
pub use native::SysFileDispatcher;

/// Runs a closure when dropped.
struct CallOnDrop<F: FnMut()>(F);

impl<F: FnMut()> Drop for CallOnDrop<F> {
    fn drop(&mut self) {
        (self.0)();
    }
}

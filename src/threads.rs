//! Registry of threads blocked in native calls on behalf of a channel.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A thread that may be blocked inside a native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NativeThread {
    /// The platform offers no way to interrupt this thread.
    Unsignalable,

    /// A thread that can be interrupted by a thread-directed signal.
    #[cfg_attr(not(unix), allow(dead_code))]
    Signalable(usize),
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::io;
        use std::mem;
        use std::ptr;
        use std::sync::OnceLock;

        /// Signal used to knock a thread out of a blocking system call.
        fn interrupt_signal() -> libc::c_int {
            cfg_if::cfg_if! {
                if #[cfg(target_os = "linux")] {
                    libc::SIGRTMAX() - 2
                } else {
                    libc::SIGIO
                }
            }
        }

        extern "C" fn on_interrupt(_: libc::c_int) {}

        /// Install a no-op handler without `SA_RESTART`, so that blocked calls fail with
        /// `EINTR` instead of resuming.
        fn install_handler() -> io::Result<()> {
            static INSTALLED: OnceLock<Option<i32>> = OnceLock::new();

            let failure = *INSTALLED.get_or_init(|| {
                let mut action: libc::sigaction = unsafe { mem::zeroed() };
                action.sa_sigaction =
                    on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
                action.sa_flags = 0;

                let result = syscall!(sigemptyset(&mut action.sa_mask))
                    .and_then(|_| {
                        syscall!(sigaction(interrupt_signal(), &action, ptr::null_mut()))
                    });

                match result {
                    Ok(_) => None,
                    Err(err) => {
                        tracing::warn!(?err, "could not install the interrupt handler");
                        err.raw_os_error()
                    }
                }
            });

            match failure {
                None => Ok(()),
                Some(code) => Err(io::Error::from_raw_os_error(code)),
            }
        }

        impl NativeThread {
            /// The calling thread.
            pub(crate) fn current() -> NativeThread {
                match install_handler() {
                    Ok(()) => NativeThread::Signalable(unsafe { libc::pthread_self() } as usize),
                    Err(_) => NativeThread::Unsignalable,
                }
            }

            /// Interrupt the thread if it is blocked in a system call.
            fn signal(self) {
                if let NativeThread::Signalable(thread) = self {
                    let thread = thread as libc::pthread_t;
                    let code = unsafe { libc::pthread_kill(thread, interrupt_signal()) };
                    if code != 0 {
                        let err = io::Error::from_raw_os_error(code);
                        tracing::trace!(?err, "pthread_kill failed");
                    }
                }
            }
        }
    } else {
        impl NativeThread {
            /// The calling thread.
            pub(crate) fn current() -> NativeThread {
                NativeThread::Unsignalable
            }

            fn signal(self) {}
        }
    }
}

/// Threads currently blocked in a native call for one channel.
#[derive(Debug)]
pub(crate) struct NativeThreadSet {
    slots: Mutex<Slots>,

    /// Signalled when the set becomes empty while a closer is waiting.
    emptied: Condvar,
}

#[derive(Debug)]
struct Slots {
    elements: Vec<Option<NativeThread>>,
    used: usize,
    waiting_to_empty: bool,
}

impl NativeThreadSet {
    pub(crate) fn new(capacity: usize) -> NativeThreadSet {
        NativeThreadSet {
            slots: Mutex::new(Slots {
                elements: vec![None; capacity.max(1)],
                used: 0,
                waiting_to_empty: false,
            }),
            emptied: Condvar::new(),
        }
    }

    /// Record the calling thread. Returns the slot to pass to [`remove`](Self::remove).
    pub(crate) fn add(&self) -> usize {
        let thread = NativeThread::current();
        let mut slots = lock!(self.slots.lock());

        let mut start = 0;
        if slots.used >= slots.elements.len() {
            start = slots.elements.len();
            let doubled = start * 2;
            slots.elements.resize(doubled, None);
        }

        let index = (start..slots.elements.len())
            .find(|&i| slots.elements[i].is_none())
            .unwrap_or(slots.elements.len());
        if index == slots.elements.len() {
            slots.elements.push(None);
        }

        slots.elements[index] = Some(thread);
        slots.used += 1;
        index
    }

    /// Clear a slot filled by [`add`](Self::add).
    pub(crate) fn remove(&self, index: usize) {
        let mut slots = lock!(self.slots.lock());
        if slots.elements[index].take().is_some() {
            slots.used -= 1;
        }

        if slots.used == 0 && slots.waiting_to_empty {
            self.emptied.notify_all();
        }
    }

    /// Number of registered threads.
    pub(crate) fn len(&self) -> usize {
        lock!(self.slots.lock()).used
    }

    /// Interrupt every registered thread and wait until all of them have left.
    ///
    /// Threads are signalled again after each `interval` until the set is empty.
    pub(crate) fn signal_and_wait(&self, interval: Duration) {
        let mut slots = lock!(self.slots.lock());
        slots.waiting_to_empty = true;

        while slots.used > 0 {
            let mut left = slots.used;
            for thread in slots.elements.iter().flatten() {
                thread.signal();
                left -= 1;
                if left == 0 {
                    break;
                }
            }

            slots = lock!(self.emptied.wait_timeout(slots, interval)).0;
        }

        slots.waiting_to_empty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn slots_grow_and_are_reused() {
        let set = NativeThreadSet::new(2);
        let a = set.add();
        let b = set.add();
        let c = set.add();
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(set.len(), 3);

        set.remove(b);
        assert_eq!(set.add(), 1);

        set.remove(a);
        set.remove(1);
        set.remove(c);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn signal_and_wait_returns_once_empty() {
        let set = Arc::new(NativeThreadSet::new(4));
        let slot = set.add();

        let remover = thread::spawn({
            let set = set.clone();
            move || {
                thread::sleep(Duration::from_millis(120));
                set.remove(slot);
            }
        });

        set.signal_and_wait(Duration::from_millis(50));
        assert_eq!(set.len(), 0);
        remover.join().unwrap();
    }

    #[test]
    fn empty_set_does_not_block() {
        NativeThreadSet::new(1).signal_and_wait(Duration::from_secs(60));
    }
}

//! Correlation of native completions with pending operations.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Error, Result};
use crate::group::ChannelGroup;

/// Identifies one native operation between its issue and its completion.
///
/// A token is the address of a heap-allocated correlation record. The record stays allocated
/// while the operation may still complete, so a live token is never shared by two operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(usize);

impl Token {
    /// The raw value of the token.
    pub fn as_raw(self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: usize) -> Token {
        Token(raw)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:#x})", self.0)
    }
}

/// Native-sized correlation record. Its heap address is the token.
#[derive(Debug, Default)]
pub(crate) struct Overlapped {
    storage: [u64; 4],
}

impl Overlapped {
    fn token(&self) -> Token {
        Token(self as *const Overlapped as usize)
    }

    fn reset(&mut self) {
        self.storage.fill(0);
    }
}

/// An issued operation awaiting its native completion.
pub(crate) trait PendingIo: Send + Sync {
    /// The native operation transferred `bytes`.
    ///
    /// `can_invoke_direct` is set when the calling worker belongs to the channel's group.
    fn completed(&self, bytes: usize, can_invoke_direct: bool);

    /// The native operation failed, or will never complete.
    fn failed(&self, error: Error);
}

/// Per-channel map from correlation tokens to pending operations.
pub(crate) struct PendingIoCache {
    group: ChannelGroup,
    state: Mutex<CacheState>,

    /// Signalled on removal while a close is draining.
    drained: Condvar,
}

struct CacheState {
    pending: HashMap<Token, Entry>,

    /// Reclaimed records, reused before allocating.
    free: Vec<Box<Overlapped>>,

    close_pending: bool,
    closed: bool,
}

struct Entry {
    record: Box<Overlapped>,
    io: Arc<dyn PendingIo>,
}

impl PendingIoCache {
    pub(crate) fn new(group: ChannelGroup) -> PendingIoCache {
        let capacity = group.config().cached_tokens;
        PendingIoCache {
            group,
            state: Mutex::new(CacheState {
                pending: HashMap::new(),
                free: Vec::with_capacity(capacity),
                close_pending: false,
                closed: false,
            }),
            drained: Condvar::new(),
        }
    }

    /// Register `io` and return the token to hand to the native layer.
    pub(crate) fn add(&self, io: Arc<dyn PendingIo>) -> Result<Token> {
        let mut state = lock!(self.state.lock());
        if state.closed {
            return Err(Error::Closed);
        }

        let record = state.free.pop().unwrap_or_default();
        let token = record.token();
        state.pending.insert(token, Entry { record, io });
        Ok(token)
    }

    /// Remove the operation registered under `token`.
    pub(crate) fn remove(&self, token: Token) -> Option<Arc<dyn PendingIo>> {
        let mut state = lock!(self.state.lock());
        let Entry { mut record, io } = state.pending.remove(&token)?;

        if state.free.len() < self.group.config().cached_tokens {
            record.reset();
            state.free.push(record);
        }
        if state.close_pending {
            self.drained.notify_all();
        }

        Some(io)
    }

    /// Number of operations still pending.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock!(self.state.lock()).pending.len()
    }

    /// Fail whatever is still pending and release every record.
    ///
    /// Operations get a short grace period to complete on their own. The rest are failed with
    /// [`Error::Closed`] on the group's threads, and their records are parked with the group
    /// so that a late completion is recognized and dropped.
    pub(crate) fn close(&self) {
        let grace = self.group.config().close_drain_timeout;

        let leftover = {
            let mut state = lock!(self.state.lock());
            if state.closed {
                return;
            }

            if !state.pending.is_empty() {
                state.close_pending = true;
                state = lock!(self.drained.wait_timeout_while(state, grace, |s| {
                    !s.pending.is_empty()
                }))
                .0;
                state.close_pending = false;
            }

            let mut leftover = Vec::with_capacity(state.pending.len());
            for (token, Entry { record, io }) in state.pending.drain() {
                self.group.make_stale(token, record);
                leftover.push(io);
            }

            state.free.clear();
            state.closed = true;
            leftover
        };

        if !leftover.is_empty() {
            tracing::debug!(count = leftover.len(), "failing operations pending at close");
        }

        for io in leftover {
            let task_io = io.clone();
            if self
                .group
                .execute_on_pooled_thread(move || task_io.failed(Error::Closed))
                .is_err()
            {
                io.failed(Error::Closed);
            }
        }
    }
}

impl fmt::Debug for PendingIoCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock!(self.state.lock());
        f.debug_struct("PendingIoCache")
            .field("pending", &state.pending.len())
            .field("free", &state.free.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    struct Recorder {
        tx: Mutex<mpsc::Sender<std::result::Result<usize, String>>>,
    }

    impl PendingIo for Recorder {
        fn completed(&self, bytes: usize, _can_invoke_direct: bool) {
            lock!(self.tx.lock()).send(Ok(bytes)).ok();
        }

        fn failed(&self, error: Error) {
            lock!(self.tx.lock()).send(Err(error.to_string())).ok();
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::Receiver<std::result::Result<usize, String>>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Recorder { tx: Mutex::new(tx) }), rx)
    }

    fn group() -> ChannelGroup {
        ChannelGroup::fixed(1, Config::default()).unwrap()
    }

    #[test]
    fn records_are_reused() {
        let group = group();
        let cache = PendingIoCache::new(group.clone());
        let (io, _rx) = recorder();

        let first = cache.add(io.clone()).unwrap();
        assert!(cache.remove(first).is_some());
        assert!(cache.remove(first).is_none());

        let second = cache.add(io).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);

        cache.close();
        group.shutdown_now();
    }

    #[test]
    fn free_list_is_bounded() {
        let group = group();
        let cache = PendingIoCache::new(group.clone());
        let (io, _rx) = recorder();

        let tokens: Vec<Token> = (0..10).map(|_| cache.add(io.clone()).unwrap()).collect();
        for token in tokens {
            cache.remove(token);
        }
        assert_eq!(lock!(cache.state.lock()).free.len(), 4);

        cache.close();
        group.shutdown_now();
    }

    #[test]
    fn close_fails_leftovers_and_marks_them_stale() {
        let group = group();
        let cache = PendingIoCache::new(group.clone());
        let (io, rx) = recorder();

        let tokens: Vec<Token> = (0..3).map(|_| cache.add(io.clone()).unwrap()).collect();
        cache.close();

        assert_eq!(cache.len(), 0);
        assert!(lock!(cache.state.lock()).free.is_empty());
        for _ in 0..3 {
            let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(outcome, Err(Error::Closed.to_string()));
        }
        for token in tokens {
            assert!(group.check_if_stale(token));
            assert!(!group.check_if_stale(token));
        }
        assert!(matches!(cache.add(io), Err(Error::Closed)));

        group.shutdown_now();
    }

    #[test]
    fn close_waits_for_inflight_removal() {
        let group = group();
        let cache = Arc::new(PendingIoCache::new(group.clone()));
        let (io, rx) = recorder();
        let token = cache.add(io).unwrap();

        let completer = thread::spawn({
            let cache = cache.clone();
            move || {
                thread::sleep(Duration::from_millis(5));
                if let Some(io) = cache.remove(token) {
                    io.completed(11, false);
                }
            }
        });

        cache.close();
        completer.join().unwrap();

        // Either the completion won the grace period or close failed the operation.
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(outcome == Ok(11) || outcome == Err(Error::Closed.to_string()));
        assert_eq!(cache.len(), 0);

        group.shutdown_now();
    }
}

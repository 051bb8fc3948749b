//! Completion port polled by a group's worker threads.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex};

use crate::cache::Token;

/// A packet dequeued by a worker.
#[derive(Debug)]
pub(crate) enum Packet {
    /// Wakes one worker: run a queued task, or exit if there is none.
    Wakeup,

    /// A native operation finished.
    Completion {
        /// Registration key of the channel the operation was issued on.
        key: usize,
        /// Correlation token handed to the native layer.
        token: Token,
        /// Bytes transferred, or the native error.
        result: io::Result<usize>,
    },
}

/// A FIFO of completion packets with blocking dequeue.
#[derive(Debug)]
pub(crate) struct CompletionPort {
    state: Mutex<PortState>,

    /// Signalled when a packet is queued or the port closes.
    ready: Condvar,
}

#[derive(Debug)]
struct PortState {
    packets: VecDeque<Packet>,
    closed: bool,
}

impl CompletionPort {
    /// Create a new completion port.
    pub(crate) fn new() -> CompletionPort {
        CompletionPort {
            state: Mutex::new(PortState {
                packets: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Post a packet to this port.
    pub(crate) fn post(&self, packet: Packet) -> io::Result<()> {
        let mut state = lock!(self.state.lock());
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "completion port is closed",
            ));
        }

        state.packets.push_back(packet);
        self.ready.notify_one();
        Ok(())
    }

    /// Wake one waiting worker.
    pub(crate) fn wakeup(&self) -> io::Result<()> {
        self.post(Packet::Wakeup)
    }

    /// Wait for the next packet. Fails once the port is closed.
    pub(crate) fn wait(&self) -> io::Result<Packet> {
        let mut state = lock!(self.state.lock());

        loop {
            if let Some(packet) = state.packets.pop_front() {
                return Ok(packet);
            }
            if state.closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "completion port is closed",
                ));
            }

            state = lock!(self.ready.wait(state));
        }
    }

    /// Close the port, discarding queued packets.
    pub(crate) fn close(&self) {
        let mut state = lock!(self.state.lock());
        if !state.closed {
            state.closed = true;
            let dropped = state.packets.len();
            state.packets.clear();
            tracing::trace!(dropped, "completion port closed");
        }
        self.ready.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock!(self.state.lock()).closed
    }
}

/// Delivers the completion of one queued native operation.
///
/// A [`NativeDispatcher`] receives a `Completer` with every request. When the request is
/// queued, the dispatcher keeps it and calls [`complete`] once the operation finishes, from
/// any thread. When the request completes immediately or fails, the completer is dropped.
///
/// [`NativeDispatcher`]: crate::NativeDispatcher
/// [`complete`]: Completer::complete
pub struct Completer {
    port: Arc<CompletionPort>,
    key: usize,
    token: Token,
}

impl Completer {
    pub(crate) fn new(port: Arc<CompletionPort>, key: usize, token: Token) -> Completer {
        Completer { port, key, token }
    }

    /// The correlation token of the operation.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Post the outcome of the operation to the owning group.
    pub fn complete(self, result: io::Result<usize>) {
        let packet = Packet::Completion {
            key: self.key,
            token: self.token,
            result,
        };

        if let Err(err) = self.port.post(packet) {
            tracing::trace!(key = self.key, token = ?self.token, ?err, "completion dropped");
        }
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

#![allow(dead_code)]

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use iogroup::{AsyncSocket, ChannelGroup, Completer, Handle, Issue, NativeDispatcher, Request};

/// What the fake does with the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Complete on the spot, transferring at most this many bytes.
    Immediate(usize),
    /// Keep the completer for the test to complete.
    Queue,
    /// Refuse to start.
    Fail,
}

/// A native dispatcher that never touches the network.
pub struct FakeDispatcher {
    mode: Mutex<Mode>,
    next_handle: AtomicU64,
    queued: Mutex<Vec<Completer>>,
    closed: Mutex<Vec<Handle>>,
    pub opened: AtomicUsize,
    pub issued: AtomicUsize,
}

impl FakeDispatcher {
    pub fn new(mode: Mode) -> Arc<FakeDispatcher> {
        Arc::new(FakeDispatcher {
            mode: Mutex::new(mode),
            next_handle: AtomicU64::new(100),
            queued: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
            issued: AtomicUsize::new(0),
        })
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Handle most recently returned by `open_socket`.
    pub fn last_handle(&self) -> Handle {
        Handle(self.next_handle.load(Ordering::SeqCst) - 1)
    }

    /// Waits for `count` queued requests and takes them.
    pub fn take_queued(&self, count: usize) -> Vec<Completer> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let mut queued = self.queued.lock().unwrap();
                if queued.len() >= count {
                    return queued.drain(..count).collect();
                }
            }
            assert!(Instant::now() < deadline, "requests were never queued");
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn is_closed(&self, handle: Handle) -> bool {
        self.closed.lock().unwrap().contains(&handle)
    }

    /// Waits until `handle` has been closed.
    pub fn wait_closed(&self, handle: Handle) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.is_closed(handle) {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }
}

impl NativeDispatcher for FakeDispatcher {
    fn open_socket(&self) -> io::Result<Handle> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Handle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
    }

    fn bind(&self, _handle: Handle, addr: SocketAddr) -> io::Result<SocketAddr> {
        Ok(addr)
    }

    fn issue(&self, _handle: Handle, request: Request<'_>, completer: Completer) -> Issue {
        self.issued.fetch_add(1, Ordering::SeqCst);

        match *self.mode.lock().unwrap() {
            Mode::Immediate(limit) => match request {
                Request::Read(buf) => Issue::Immediate(buf.with_remaining_mut(|bytes| {
                    let n = limit.min(bytes.len());
                    bytes[..n].fill(7);
                    n
                })),
                Request::Write(buf) => Issue::Immediate(limit.min(buf.remaining())),
                Request::Accept { .. } | Request::Connect(_) => Issue::Immediate(0),
            },
            Mode::Queue => {
                self.queued.lock().unwrap().push(completer);
                Issue::Queued
            }
            Mode::Fail => Issue::Failed(io::Error::from(io::ErrorKind::ConnectionReset)),
        }
    }

    fn finish_accept(
        &self,
        _listener: Handle,
        _child: Handle,
    ) -> io::Result<(SocketAddr, SocketAddr)> {
        Ok((addr(8080), addr(50000)))
    }

    fn finish_connect(&self, _handle: Handle) -> io::Result<SocketAddr> {
        Ok(addr(40000))
    }

    fn close(&self, handle: Handle) -> io::Result<()> {
        self.closed.lock().unwrap().push(handle);
        Ok(())
    }
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Opens a socket and connects it, leaving the dispatcher in `mode`.
pub fn connected_socket(
    group: &ChannelGroup,
    dispatcher: &Arc<FakeDispatcher>,
    mode: Mode,
) -> AsyncSocket {
    dispatcher.set_mode(Mode::Immediate(0));
    let socket = AsyncSocket::open(group, dispatcher.clone()).unwrap();
    socket
        .connect(addr(9000))
        .unwrap()
        .get_timeout(Duration::from_secs(5))
        .unwrap();
    dispatcher.set_mode(mode);
    socket
}

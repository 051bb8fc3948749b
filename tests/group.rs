mod common;

use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use common::{connected_socket, FakeDispatcher, Mode};
use iogroup::{
    AsyncSocket, ChannelGroup, Config, DispatchContext, Error, GroupState, IoBuffer, ThreadPool,
};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn fixed_group_lifecycle() {
    let group = ChannelGroup::fixed(2, Config::default()).unwrap();
    assert_eq!(group.thread_count(), 2);
    assert_eq!(group.state(), GroupState::Active);

    group.shutdown();
    assert!(group.is_shutdown());
    assert!(group.await_termination(WAIT));
    assert!(group.is_terminated());
    assert_eq!(group.state(), GroupState::Terminated);
    assert_eq!(group.thread_count(), 0);
}

#[test]
fn fixed_group_needs_a_thread() {
    let err = ChannelGroup::fixed(0, Config::default()).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
}

#[test]
fn elastic_group_keeps_internal_threads() {
    let config = Config {
        internal_threads: 2,
        ..Config::default()
    };
    let group = ChannelGroup::elastic(ThreadPool::cached("elastic"), 1, config).unwrap();
    assert_eq!(group.thread_count(), 3);

    let (tx, rx) = mpsc::channel();
    let id = group.id();
    group
        .execute(move || {
            let context = DispatchContext::current();
            tx.send(context.map(|c| c.group())).unwrap();
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Some(id));

    group.shutdown();
    assert!(group.await_termination(WAIT));
}

#[test]
fn tasks_run_with_group_identity() {
    let group = ChannelGroup::fixed(1, Config::default()).unwrap();
    let (tx, rx) = mpsc::channel();

    let id = group.id();
    group
        .execute(move || {
            let context = DispatchContext::current().unwrap();
            tx.send((context.group(), thread::current().id())).unwrap();
        })
        .unwrap();

    let (seen, thread) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(seen, id);
    assert_ne!(thread, thread::current().id());
    assert_eq!(DispatchContext::current(), None);

    group.shutdown();
    assert!(group.await_termination(WAIT));
    assert!(matches!(group.execute(|| {}), Err(Error::GroupShutDown)));
}

#[test]
fn shutdown_waits_for_last_channel() {
    let group = ChannelGroup::fixed(1, Config::default()).unwrap();
    let dispatcher = FakeDispatcher::new(Mode::Queue);
    let socket = AsyncSocket::open(&group, dispatcher.clone()).unwrap();

    group.shutdown();
    assert_eq!(group.state(), GroupState::ShutdownRequested);
    assert!(!group.await_termination(Duration::from_millis(100)));

    // No new channels once shutdown was requested.
    assert!(matches!(
        AsyncSocket::open(&group, dispatcher.clone()),
        Err(Error::GroupShutDown)
    ));

    socket.close().unwrap();
    assert!(group.await_termination(WAIT));
    assert_eq!(group.state(), GroupState::Terminated);
}

#[test]
fn shutdown_now_fails_pending_operations() {
    let group = ChannelGroup::fixed(2, Config::default()).unwrap();
    let dispatcher = FakeDispatcher::new(Mode::Queue);
    let socket = connected_socket(&group, &dispatcher, Mode::Queue);

    let buf = IoBuffer::allocate(16);
    let read = socket.read(&buf).unwrap();
    dispatcher.take_queued(1);

    group.shutdown_now();
    assert!(matches!(read.get_timeout(WAIT), Err(Error::Closed)));
    assert!(!socket.is_open());
    assert!(dispatcher.is_closed(socket.handle()));
    assert!(group.await_termination(WAIT));
}

#[test]
fn late_completion_after_shutdown_now_is_dropped() {
    let group = ChannelGroup::fixed(1, Config::default()).unwrap();
    let dispatcher = FakeDispatcher::new(Mode::Queue);
    let socket = connected_socket(&group, &dispatcher, Mode::Queue);

    let buf = IoBuffer::allocate(16);
    let read = socket.read(&buf).unwrap();
    let completer = dispatcher.take_queued(1).pop().unwrap();

    socket.close().unwrap();
    assert!(matches!(read.get_timeout(WAIT), Err(Error::Closed)));

    // Arrives after the operation was failed; ignored.
    completer.complete(Ok(8));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(buf.position(), 0);

    group.shutdown();
    assert!(group.await_termination(WAIT));
}

#[test]
fn panicking_worker_is_replaced() {
    let group = ChannelGroup::fixed(1, Config::default()).unwrap();

    group.execute(|| panic!("worker failure")).unwrap();

    let (tx, rx) = mpsc::channel();
    group.execute(move || tx.send(()).unwrap()).unwrap();
    rx.recv_timeout(WAIT).unwrap();
    assert_eq!(group.thread_count(), 1);

    group.shutdown();
    assert!(group.await_termination(WAIT));
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use iogroup::{AsyncFileChannel, Config, Error, IoBuffer, OpenOptions, ThreadPool};

const WAIT: Duration = Duration::from_secs(5);

fn open_rw(dir: &tempfile::TempDir, name: &str) -> AsyncFileChannel {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(dir.path().join(name))
        .unwrap()
}

#[test]
fn write_then_read_at_positions() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open_rw(&dir, "data");

    let src = IoBuffer::wrap(b"hello world".to_vec());
    assert_eq!(channel.write(&src, 0).unwrap().get_timeout(WAIT).unwrap(), 11);
    assert!(!src.has_remaining());

    let dst = IoBuffer::allocate(32);
    assert_eq!(channel.read(&dst, 6).unwrap().get_timeout(WAIT).unwrap(), 5);
    assert_eq!(dst.filled(), b"world".to_vec());

    let eof = IoBuffer::allocate(8);
    assert_eq!(channel.read(&eof, 11).unwrap().get_timeout(WAIT).unwrap(), 0);

    assert_eq!(channel.size().unwrap(), 11);
    channel.truncate(5).unwrap();
    assert_eq!(channel.size().unwrap(), 5);
    channel.truncate(100).unwrap();
    assert_eq!(channel.size().unwrap(), 5);
    channel.force(true).unwrap();
    channel.force(false).unwrap();

    channel.close().unwrap();
    assert_eq!(std::fs::read(dir.path().join("data")).unwrap(), b"hello".to_vec());
}

#[test]
fn mode_and_argument_checks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("modes");
    std::fs::write(&path, b"abc").unwrap();

    let read_only = OpenOptions::new().read(true).open(&path).unwrap();
    assert!(matches!(
        read_only.write(&IoBuffer::wrap(vec![1]), 0),
        Err(Error::NonWritable)
    ));
    assert!(matches!(read_only.truncate(0), Err(Error::NonWritable)));
    assert!(matches!(read_only.lock(0, 1, false), Err(Error::NonWritable)));

    let write_only = OpenOptions::new().write(true).open(&path).unwrap();
    assert!(matches!(
        write_only.read(&IoBuffer::allocate(1), 0),
        Err(Error::NonReadable)
    ));
    assert!(matches!(write_only.lock(0, 1, true), Err(Error::NonReadable)));

    assert!(matches!(
        read_only.read(&IoBuffer::allocate(1), u64::MAX),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        read_only.read(&IoBuffer::wrap(vec![0; 4]).as_read_only(), 0),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn zero_length_read_calls_back_once_on_another_thread() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open_rw(&dir, "empty");

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let caller = thread::current().id();
    channel
        .read_with(&IoBuffer::allocate(0), 0, (), {
            let calls = calls.clone();
            move |result, ()| {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.send((result.unwrap(), thread::current().id() != caller)).unwrap();
            }
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (0, true));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Without a callback the result is there on return.
    let future = channel.read(&IoBuffer::allocate(0), 0).unwrap();
    assert!(future.is_done());
    assert_eq!(future.get().unwrap(), 0);
}

#[test]
fn closed_channel_completes_without_blocking() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open_rw(&dir, "closed");
    channel.close().unwrap();
    assert!(!channel.is_open());

    let future = channel.read(&IoBuffer::allocate(4), 0).unwrap();
    assert!(future.is_done());
    assert!(matches!(future.get(), Err(Error::Closed)));

    let lock = channel.lock(0, 4, false).unwrap();
    assert!(matches!(lock.get(), Err(Error::Closed)));

    let (tx, rx) = mpsc::channel();
    channel
        .write_with(&IoBuffer::wrap(vec![1; 4]), 0, (), move |result, ()| {
            tx.send(result.is_err()).unwrap();
        })
        .unwrap();
    assert!(rx.recv_timeout(WAIT).unwrap());

    assert!(matches!(channel.size(), Err(Error::Closed)));
    assert!(matches!(channel.try_lock(0, 1, false), Err(Error::Closed)));
}

#[test]
fn callbacks_receive_attachment() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open_rw(&dir, "callbacks");

    let (tx, rx) = mpsc::channel();
    let buf = IoBuffer::wrap(vec![9; 64]);
    channel
        .write_with(&buf, 10, String::from("tag"), move |result, tag| {
            tx.send((result.unwrap(), tag)).unwrap();
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (64, String::from("tag")));
    assert_eq!(buf.position(), 64);
    assert_eq!(channel.size().unwrap(), 74);
}

#[test]
fn region_locks() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open_rw(&dir, "locks");

    let first = channel.lock(0, 10, false).unwrap().get_timeout(WAIT).unwrap();
    assert!(first.is_valid());
    assert_eq!((first.position(), first.size(), first.is_shared()), (0, 10, false));

    assert!(matches!(channel.try_lock(5, 10, false), Err(Error::OverlappingLock)));
    assert!(matches!(channel.lock(9, 1, false), Err(Error::OverlappingLock)));

    let second = channel.try_lock(10, 10, true).unwrap().unwrap();
    assert!(second.is_shared());

    first.release().unwrap();
    assert!(!first.is_valid());
    first.release().unwrap();

    let again = channel.try_lock(0, 10, false).unwrap();
    assert!(again.is_some());

    let to_end = channel.try_lock(100, u64::MAX, false).unwrap().unwrap();
    assert!(matches!(channel.try_lock(1 << 40, 1, false), Err(Error::OverlappingLock)));
    to_end.release().unwrap();
}

#[test]
fn close_invalidates_locks() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open_rw(&dir, "invalidate");

    let a = channel.try_lock(0, 4, false).unwrap().unwrap();
    let b = channel.lock(8, 4, false).unwrap().get_timeout(WAIT).unwrap();

    channel.close().unwrap();
    assert!(!a.is_valid());
    assert!(!b.is_valid());
    a.release().unwrap();
}

#[test]
fn transfer_between_channels() {
    let dir = tempfile::tempdir().unwrap();
    let source = open_rw(&dir, "source");
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let buf = IoBuffer::wrap(payload.clone());
    while buf.has_remaining() {
        let position = buf.position() as u64;
        channel_write(&source, &buf, position);
    }

    let target = open_rw(&dir, "target");
    assert_eq!(source.transfer_to(100, 15_000, &target, 0).unwrap(), 15_000);
    assert_eq!(
        std::fs::read(dir.path().join("target")).unwrap(),
        payload[100..15_100].to_vec()
    );

    // Short when the source ends early.
    assert_eq!(source.transfer_to(19_000, 5_000, &target, 0).unwrap(), 1_000);

    let fast_config = Config {
        fast_file_transfer: true,
        ..Config::default()
    };
    let fast_source = OpenOptions::new()
        .read(true)
        .config(fast_config)
        .open(dir.path().join("source"))
        .unwrap();
    let fast_target = open_rw(&dir, "fast");
    let copied = fast_source.transfer_to(0, 20_000, &fast_target, 0).unwrap();
    assert!(copied > 0 && copied <= 20_000);
    assert_eq!(
        std::fs::read(dir.path().join("fast")).unwrap(),
        payload[..copied as usize].to_vec()
    );

    assert!(matches!(
        fast_target.transfer_to(0, 1, &fast_source, 0),
        Err(Error::NonWritable)
    ));
}

fn channel_write(channel: &AsyncFileChannel, buf: &IoBuffer, position: u64) {
    channel.write(buf, position).unwrap().get_timeout(WAIT).unwrap();
}

#[test]
fn shared_executor_survives_close() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ThreadPool::fixed("files", 2);

    let channel = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .executor(pool.clone())
        .open(dir.path().join("shared"))
        .unwrap();
    channel_write(&channel, &IoBuffer::wrap(vec![1; 8]), 0);
    channel.close().unwrap();

    assert!(!pool.is_shutdown());
    pool.shutdown();
    assert!(pool.await_termination(WAIT));
}

#[cfg(unix)]
mod blocking {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicBool;

    use iogroup::{FileDispatcher, LockStatus};

    /// Reads block on an empty pipe until interrupted.
    struct PipeDispatcher {
        read_fd: libc::c_int,
        write_fd: libc::c_int,
        interrupted: AtomicBool,
    }

    impl PipeDispatcher {
        fn new() -> PipeDispatcher {
            let mut fds = [0; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            PipeDispatcher {
                read_fd: fds[0],
                write_fd: fds[1],
                interrupted: AtomicBool::new(false),
            }
        }
    }

    impl FileDispatcher for PipeDispatcher {
        fn read_at(&self, buf: &mut [u8], _position: u64) -> io::Result<usize> {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    self.interrupted.store(true, Ordering::SeqCst);
                }
                return Err(err);
            }
            Ok(n as usize)
        }

        fn write_at(&self, buf: &[u8], _position: u64) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn size(&self) -> io::Result<u64> {
            Ok(0)
        }

        fn truncate(&self, _size: u64) -> io::Result<()> {
            Ok(())
        }

        fn force(&self, _metadata: bool) -> io::Result<()> {
            Ok(())
        }

        fn lock(
            &self,
            _blocking: bool,
            _position: u64,
            _size: u64,
            _shared: bool,
        ) -> io::Result<LockStatus> {
            Ok(LockStatus::Locked)
        }

        fn release(&self, _position: u64, _size: u64) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for PipeDispatcher {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.read_fd);
                libc::close(self.write_fd);
            }
        }
    }

    #[test]
    fn close_interrupts_blocked_read() {
        let dispatcher = Arc::new(PipeDispatcher::new());
        let channel = OpenOptions::new().read(true).build(dispatcher.clone());

        let read = channel.read(&IoBuffer::allocate(8), 0).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(!read.is_done());

        channel.close().unwrap();

        // Close returned only after the reader was knocked out of its call.
        assert!(dispatcher.interrupted.load(Ordering::SeqCst));
        assert!(matches!(read.get_timeout(WAIT), Err(Error::Closed)));
    }
}

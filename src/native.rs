//! Interfaces to the native layer, and the platform file dispatcher.

use std::fmt;
use std::fs::File;
use std::io;
use std::net::SocketAddr;

use crate::buffer::IoBuffer;
use crate::port::Completer;

/// An opaque native socket handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

/// An operation handed to a [`NativeDispatcher`].
#[derive(Debug)]
pub enum Request<'a> {
    /// Fill the remaining bytes of the buffer. The position must not be moved.
    Read(&'a IoBuffer),

    /// Send the remaining bytes of the buffer. The position must not be moved.
    Write(&'a IoBuffer),

    /// Accept a connection into `child`, a handle obtained from
    /// [`NativeDispatcher::open_socket`].
    Accept {
        /// Handle the accepted connection is bound to.
        child: Handle,
    },

    /// Connect to a remote address.
    Connect(SocketAddr),
}

/// How a native operation was started.
#[derive(Debug)]
pub enum Issue {
    /// Finished on the spot, with the byte count. No completion will be posted.
    Immediate(usize),

    /// Started. The dispatcher posts the outcome through the request's [`Completer`].
    Queued,

    /// Could not be started. No completion will be posted.
    Failed(io::Error),
}

/// Socket-level native operations used by [`AsyncSocket`] and [`AsyncListener`].
///
/// [`AsyncSocket`]: crate::AsyncSocket
/// [`AsyncListener`]: crate::AsyncListener
pub trait NativeDispatcher: Send + Sync {
    /// Creates an unconnected socket.
    fn open_socket(&self) -> io::Result<Handle>;

    /// Binds a socket to a local address and returns the address actually bound.
    fn bind(&self, handle: Handle, addr: SocketAddr) -> io::Result<SocketAddr>;

    /// Starts `request` on `handle`.
    fn issue(&self, handle: Handle, request: Request<'_>, completer: Completer) -> Issue;

    /// Finishes an accept on `child` and returns its local and remote addresses.
    fn finish_accept(
        &self,
        listener: Handle,
        child: Handle,
    ) -> io::Result<(SocketAddr, SocketAddr)>;

    /// Finishes a connect and returns the local address.
    fn finish_connect(&self, handle: Handle) -> io::Result<SocketAddr>;

    /// Closes a socket. Operations still in flight complete with an error or not at all.
    fn close(&self, handle: Handle) -> io::Result<()>;
}

/// Result of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// The region is locked.
    Locked,
    /// Someone else holds a conflicting lock.
    Unavailable,
}

/// Blocking file operations used by [`AsyncFileChannel`].
///
/// Every call may block. A call interrupted by a signal returns
/// [`io::ErrorKind::Interrupted`], which the channel retries while it is open.
///
/// [`AsyncFileChannel`]: crate::AsyncFileChannel
pub trait FileDispatcher: Send + Sync {
    /// Reads at `position` into `buf`. Returns 0 at end of file.
    fn read_at(&self, buf: &mut [u8], position: u64) -> io::Result<usize>;

    /// Writes `buf` at `position`.
    fn write_at(&self, buf: &[u8], position: u64) -> io::Result<usize>;

    /// Current size of the file.
    fn size(&self) -> io::Result<u64>;

    /// Shrinks the file to `size` bytes.
    fn truncate(&self, size: u64) -> io::Result<()>;

    /// Flushes data, and metadata if `metadata` is set, to storage.
    fn force(&self, metadata: bool) -> io::Result<()>;

    /// Locks a region. With `blocking` unset, returns [`LockStatus::Unavailable`] instead of
    /// waiting.
    fn lock(
        &self,
        blocking: bool,
        position: u64,
        size: u64,
        shared: bool,
    ) -> io::Result<LockStatus>;

    /// Releases a region locked by [`lock`](FileDispatcher::lock).
    fn release(&self, position: u64, size: u64) -> io::Result<()>;

    /// The file behind this dispatcher, if there is one.
    fn file(&self) -> Option<&File> {
        None
    }

    /// Copies `count` bytes at `position` to `target` at `target_position` inside the kernel.
    ///
    /// Returns [`io::ErrorKind::Unsupported`] when no such copy is available, in which case
    /// the caller copies through a buffer.
    fn copy_to(
        &self,
        position: u64,
        count: usize,
        target: &dyn FileDispatcher,
        target_position: u64,
    ) -> io::Result<usize> {
        let _ = (position, count, target, target_position);
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// [`FileDispatcher`] over an open [`File`].
#[cfg(any(unix, windows))]
pub struct SysFileDispatcher {
    file: File,
}

#[cfg(any(unix, windows))]
impl SysFileDispatcher {
    /// Wraps an open file.
    pub fn new(file: File) -> SysFileDispatcher {
        SysFileDispatcher { file }
    }
}

#[cfg(any(unix, windows))]
impl fmt::Debug for SysFileDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysFileDispatcher")
            .field("file", &self.file)
            .finish()
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::mem;
        use std::os::unix::io::AsRawFd;

        /// Converts a region length for `fcntl`, where 0 means "to the end".
        fn region_len(size: u64) -> u64 {
            if size >= i64::MAX as u64 {
                0
            } else {
                size
            }
        }

        impl SysFileDispatcher {
            fn fcntl_lock(
                &self,
                cmd: libc::c_int,
                kind: libc::c_int,
                position: u64,
                size: u64,
            ) -> io::Result<()> {
                let mut region: libc::flock = unsafe { mem::zeroed() };
                region.l_type = kind as _;
                region.l_whence = libc::SEEK_SET as _;
                region.l_start = position as libc::off_t;
                region.l_len = region_len(size) as libc::off_t;

                syscall!(fcntl(self.file.as_raw_fd(), cmd, &region as *const libc::flock)).map(drop)
            }
        }

        impl FileDispatcher for SysFileDispatcher {
            fn read_at(&self, buf: &mut [u8], position: u64) -> io::Result<usize> {
                Ok(rustix::io::pread(&self.file, buf, position)?)
            }

            fn write_at(&self, buf: &[u8], position: u64) -> io::Result<usize> {
                Ok(rustix::io::pwrite(&self.file, buf, position)?)
            }

            fn size(&self) -> io::Result<u64> {
                let stat = rustix::fs::fstat(&self.file)?;
                Ok(stat.st_size as u64)
            }

            fn truncate(&self, size: u64) -> io::Result<()> {
                Ok(rustix::fs::ftruncate(&self.file, size)?)
            }

            fn force(&self, metadata: bool) -> io::Result<()> {
                cfg_if::cfg_if! {
                    if #[cfg(any(target_os = "linux", target_os = "android"))] {
                        if !metadata {
                            return Ok(rustix::fs::fdatasync(&self.file)?);
                        }
                    } else {
                        let _ = metadata;
                    }
                }
                Ok(rustix::fs::fsync(&self.file)?)
            }

            fn lock(
                &self,
                blocking: bool,
                position: u64,
                size: u64,
                shared: bool,
            ) -> io::Result<LockStatus> {
                let kind = if shared { libc::F_RDLCK } else { libc::F_WRLCK };
                let cmd = if blocking { libc::F_SETLKW } else { libc::F_SETLK };

                match self.fcntl_lock(cmd, kind as libc::c_int, position, size) {
                    Ok(()) => Ok(LockStatus::Locked),
                    Err(err)
                        if !blocking
                            && matches!(
                                err.raw_os_error(),
                                Some(libc::EAGAIN) | Some(libc::EACCES)
                            ) =>
                    {
                        Ok(LockStatus::Unavailable)
                    }
                    Err(err) => Err(err),
                }
            }

            fn release(&self, position: u64, size: u64) -> io::Result<()> {
                self.fcntl_lock(libc::F_SETLK, libc::F_UNLCK as libc::c_int, position, size)
            }

            fn file(&self) -> Option<&File> {
                Some(&self.file)
            }

            #[cfg(any(target_os = "linux", target_os = "android"))]
            fn copy_to(
                &self,
                position: u64,
                count: usize,
                target: &dyn FileDispatcher,
                target_position: u64,
            ) -> io::Result<usize> {
                let target = target
                    .file()
                    .ok_or_else(|| io::Error::from(io::ErrorKind::Unsupported))?;

                let mut from = position;
                let mut to = target_position;
                Ok(rustix::fs::copy_file_range(
                    &self.file,
                    Some(&mut from),
                    target,
                    Some(&mut to),
                    count,
                )?)
            }
        }
    } else if #[cfg(windows)] {
        use std::os::windows::fs::FileExt;
        use std::os::windows::io::AsRawHandle;

        use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };
        use windows_sys::Win32::System::IO::OVERLAPPED;

        /// An `OVERLAPPED` carrying `position` as its offset.
        fn overlapped_at(position: u64) -> OVERLAPPED {
            let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
            overlapped.Anonymous.Anonymous.Offset = position as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (position >> 32) as u32;
            overlapped
        }

        impl FileDispatcher for SysFileDispatcher {
            fn read_at(&self, buf: &mut [u8], position: u64) -> io::Result<usize> {
                self.file.seek_read(buf, position)
            }

            fn write_at(&self, buf: &[u8], position: u64) -> io::Result<usize> {
                self.file.seek_write(buf, position)
            }

            fn size(&self) -> io::Result<u64> {
                Ok(self.file.metadata()?.len())
            }

            fn truncate(&self, size: u64) -> io::Result<()> {
                self.file.set_len(size)
            }

            fn force(&self, metadata: bool) -> io::Result<()> {
                if metadata {
                    self.file.sync_all()
                } else {
                    self.file.sync_data()
                }
            }

            fn lock(
                &self,
                blocking: bool,
                position: u64,
                size: u64,
                shared: bool,
            ) -> io::Result<LockStatus> {
                let mut flags = 0;
                if !shared {
                    flags |= LOCKFILE_EXCLUSIVE_LOCK;
                }
                if !blocking {
                    flags |= LOCKFILE_FAIL_IMMEDIATELY;
                }

                let len = if size == 0 { u64::MAX } else { size };
                let mut overlapped = overlapped_at(position);
                let result = unsafe {
                    LockFileEx(
                        self.file.as_raw_handle() as HANDLE,
                        flags,
                        0,
                        len as u32,
                        (len >> 32) as u32,
                        &mut overlapped,
                    )
                };

                if result != 0 {
                    return Ok(LockStatus::Locked);
                }

                let err = io::Error::last_os_error();
                if !blocking && err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
                    Ok(LockStatus::Unavailable)
                } else {
                    Err(err)
                }
            }

            fn release(&self, position: u64, size: u64) -> io::Result<()> {
                let len = if size == 0 { u64::MAX } else { size };
                let mut overlapped = overlapped_at(position);
                let result = unsafe {
                    UnlockFileEx(
                        self.file.as_raw_handle() as HANDLE,
                        0,
                        len as u32,
                        (len >> 32) as u32,
                        &mut overlapped,
                    )
                };

                if result == 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            }

            fn file(&self) -> Option<&File> {
                Some(&self.file)
            }
        }
    }
}

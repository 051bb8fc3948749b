//! Shared byte buffer with a position and a limit.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// A byte buffer shared between the issuing caller and the thread that completes the I/O.
///
/// Reads fill the bytes between the position and the limit, writes drain them. A completed
/// operation advances the position by the number of bytes transferred. Clones refer to the
/// same storage.
#[derive(Clone)]
pub struct IoBuffer {
    inner: Arc<Mutex<Inner>>,
    read_only: bool,
}

struct Inner {
    data: Vec<u8>,
    position: usize,
    limit: usize,
}

impl IoBuffer {
    /// Allocates a zeroed buffer of `capacity` bytes.
    pub fn allocate(capacity: usize) -> IoBuffer {
        IoBuffer::wrap(vec![0; capacity])
    }

    /// Wraps existing bytes. The limit is set to their length.
    pub fn wrap(data: Vec<u8>) -> IoBuffer {
        let limit = data.len();
        IoBuffer {
            inner: Arc::new(Mutex::new(Inner {
                data,
                position: 0,
                limit,
            })),
            read_only: false,
        }
    }

    /// Returns a read-only view of the same storage.
    pub fn as_read_only(&self) -> IoBuffer {
        IoBuffer {
            inner: self.inner.clone(),
            read_only: true,
        }
    }

    /// Whether this view rejects being filled.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Total size of the storage.
    pub fn capacity(&self) -> usize {
        lock!(self.inner.lock()).data.len()
    }

    /// Current position.
    pub fn position(&self) -> usize {
        lock!(self.inner.lock()).position
    }

    /// Current limit.
    pub fn limit(&self) -> usize {
        lock!(self.inner.lock()).limit
    }

    /// Number of bytes between the position and the limit.
    pub fn remaining(&self) -> usize {
        let inner = lock!(self.inner.lock());
        inner.limit - inner.position
    }

    /// Whether any bytes remain between the position and the limit.
    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Moves the position. It may not pass the limit.
    pub fn set_position(&self, position: usize) -> Result<()> {
        let mut inner = lock!(self.inner.lock());
        if position > inner.limit {
            return Err(Error::InvalidArgument("position beyond limit"));
        }
        inner.position = position;
        Ok(())
    }

    /// Moves the limit, pulling the position back if needed.
    pub fn set_limit(&self, limit: usize) -> Result<()> {
        let mut inner = lock!(self.inner.lock());
        if limit > inner.data.len() {
            return Err(Error::InvalidArgument("limit beyond capacity"));
        }
        inner.limit = limit;
        inner.position = inner.position.min(limit);
        Ok(())
    }

    /// Sets the limit to the position and the position to zero.
    pub fn flip(&self) {
        let mut inner = lock!(self.inner.lock());
        inner.limit = inner.position;
        inner.position = 0;
    }

    /// Resets the position to zero and the limit to the capacity.
    pub fn clear(&self) {
        let mut inner = lock!(self.inner.lock());
        inner.position = 0;
        inner.limit = inner.data.len();
    }

    /// Copies the remaining bytes out.
    pub fn remaining_bytes(&self) -> Vec<u8> {
        self.with_remaining(|bytes| bytes.to_vec())
    }

    /// Copies the bytes before the position out.
    pub fn filled(&self) -> Vec<u8> {
        let inner = lock!(self.inner.lock());
        inner.data[..inner.position].to_vec()
    }

    /// Copies as much of `bytes` as fits and advances the position. Returns the count copied.
    pub fn put(&self, bytes: &[u8]) -> usize {
        let mut inner = lock!(self.inner.lock());
        let start = inner.position;
        let n = bytes.len().min(inner.limit - start);
        inner.data[start..start + n].copy_from_slice(&bytes[..n]);
        inner.position += n;
        n
    }

    /// Runs `f` over the remaining bytes. The position is not moved.
    pub fn with_remaining<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = lock!(self.inner.lock());
        f(&inner.data[inner.position..inner.limit])
    }

    /// Runs `f` over the remaining bytes mutably. The position is not moved.
    ///
    /// Native dispatchers fill reads through this. The channel advances the position once the
    /// transfer count is known.
    pub fn with_remaining_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = lock!(self.inner.lock());
        let Inner {
            data,
            position,
            limit,
        } = &mut *inner;
        f(&mut data[*position..*limit])
    }

    /// Advances the position by `n`, saturating at the limit.
    pub(crate) fn advance(&self, n: usize) {
        let mut inner = lock!(self.inner.lock());
        inner.position = (inner.position + n).min(inner.limit);
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock!(self.inner.lock());
        f.debug_struct("IoBuffer")
            .field("position", &inner.position)
            .field("limit", &inner.limit)
            .field("capacity", &inner.data.len())
            .field("read_only", &self.read_only)
            .finish()
    }
}

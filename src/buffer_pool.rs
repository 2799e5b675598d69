//! Pre-allocated I/O scratch buffers.
//!
//! The IPC server encodes every response frame into a pooled buffer instead
//! of allocating per frame. Buffers come back to the pool when the guard
//! drops, so error paths cannot leak them.

use std::sync::{Arc, Mutex};

use bytes::BytesMut;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub total_buffers: usize,
    pub available: usize,
    pub acquisitions: u64,
    pub releases: u64,
}

#[derive(Debug)]
struct Inner {
    free: Vec<BytesMut>,
    total: usize,
    acquisitions: u64,
    releases: u64,
}

#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<Inner>>,
    buffer_size: usize,
}

/// A buffer checked out of the pool. Deref to `BytesMut`; cleared and
/// returned on drop.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: BufferPool,
}

impl std::ops::Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            let mut inner = self.pool.inner.lock().unwrap();
            inner.releases += 1;
            if inner.free.len() < inner.total {
                inner.free.push(buf);
            }
        }
    }
}

impl BufferPool {
    pub fn new(buffer_size: usize, pool_size: usize) -> Self {
        let free = (0..pool_size)
            .map(|_| BytesMut::with_capacity(buffer_size))
            .collect();
        BufferPool {
            inner: Arc::new(Mutex::new(Inner {
                free,
                total: pool_size,
                acquisitions: 0,
                releases: 0,
            })),
            buffer_size,
        }
    }

    /// Takes a buffer from the freelist, or allocates a fresh one when the
    /// pool is drained; the overflow buffer is simply dropped on release.
    pub fn acquire(&self) -> PooledBuffer {
        let mut inner = self.inner.lock().unwrap();
        inner.acquisitions += 1;
        let buf = inner
            .free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        let inner = self.inner.lock().unwrap();
        BufferPoolStats {
            total_buffers: inner.total,
            available: inner.free.len(),
            acquisitions: inner.acquisitions,
            releases: inner.releases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_round_trip() {
        let pool = BufferPool::new(64, 2);
        {
            let mut a = pool.acquire();
            let b = pool.acquire();
            a.extend_from_slice(b"hello");
            assert_eq!(pool.stats().available, 0);
            drop(b);
        }
        let stats = pool.stats();
        assert_eq!(stats.acquisitions, 2);
        assert_eq!(stats.releases, 2);
        assert_eq!(stats.available, 2);

        // Returned buffers come back cleared.
        let buf = pool.acquire();
        assert!(buf.is_empty());
    }

    #[test]
    fn drained_pool_still_serves_buffers() {
        let pool = BufferPool::new(16, 1);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        // Overflow buffer was dropped, pool holds at most `total`.
        assert_eq!(pool.stats().available, 1);
        assert_eq!(pool.stats().releases, 2);
    }
}

//! Pooled message buffers.
//!
//! A [`MessageBuffer`] is a contiguous byte region with an active
//! `offset`/`count` window inside it, satisfying
//! `0 <= offset <= offset + count <= capacity` at all times. Buffers are
//! acquired from a [`BufferPool`] and their backing storage returns to the
//! pool when the buffer is dropped, so release happens exactly once on every
//! path and a double release is unrepresentable.
//!
//! When the free list is already at its configured ceiling (or the buffer
//! was never pooled), the storage is freed instead of recycled and the
//! `finalizations{type="message_buffer"}` counter ticks. A steadily rising
//! counter means the pool ceiling is too small for the traffic, or buffers
//! are being created outside the pool on a hot path.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::metrics::MetricsSink;

/// Errors produced by buffer window manipulation.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The requested window does not fit the backing storage.
    #[error("window {offset}+{count} does not fit in capacity {capacity}")]
    InvalidWindow {
        /// Requested start of the window.
        offset: usize,
        /// Requested length of the window.
        count: usize,
        /// Capacity of the backing storage.
        capacity: usize,
    },
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    max_cached: usize,
    metrics: Arc<dyn MetricsSink>,
}

impl PoolInner {
    fn reclaim(&self, mut storage: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < self.max_cached {
            storage.clear();
            free.push(storage);
        } else {
            drop(free);
            self.metrics
                .counter("finalizations", &[("type", "message_buffer")], 1);
        }
    }
}

/// Allocator-like façade handing out [`MessageBuffer`]s.
///
/// Cloning is cheap; all clones share one free list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool that caches at most `max_cached` released buffers.
    pub fn new(max_cached: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                max_cached,
                metrics,
            }),
        }
    }

    /// Acquire a zero-filled buffer whose window spans exactly `len` bytes.
    ///
    /// Reuses cached storage when a large enough region is available.
    pub fn acquire(&self, len: usize) -> MessageBuffer {
        let mut storage = {
            let mut free = self.inner.free.lock();
            match free.iter().position(|v| v.capacity() >= len) {
                Some(i) => free.swap_remove(i),
                None => Vec::with_capacity(len),
            }
        };
        storage.resize(len, 0);
        MessageBuffer {
            storage,
            offset: 0,
            count: len,
            pool: Some(Arc::clone(&self.inner)),
        }
    }

    /// Acquire a buffer and copy `bytes` into its window.
    pub fn acquire_from(&self, bytes: &[u8]) -> MessageBuffer {
        let mut buffer = self.acquire(bytes.len());
        buffer.as_mut_slice().copy_from_slice(bytes);
        buffer
    }

    /// Number of buffers currently cached on the free list.
    pub fn cached(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// A byte region with an active window, owned exclusively by its holder.
pub struct MessageBuffer {
    storage: Vec<u8>,
    offset: usize,
    count: usize,
    pool: Option<Arc<PoolInner>>,
}

impl MessageBuffer {
    /// Wrap an existing byte vector without pooling its storage.
    pub fn from_vec(storage: Vec<u8>) -> Self {
        let count = storage.len();
        Self {
            storage,
            offset: 0,
            count,
            pool: None,
        }
    }

    /// Start of the active window.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the active window.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Capacity of the backing storage.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The bytes inside the active window.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.count]
    }

    /// Mutable view of the active window.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.count]
    }

    /// Move the active window, rejecting windows outside the storage.
    pub fn set_window(&mut self, offset: usize, count: usize) -> Result<(), BufferError> {
        if offset.checked_add(count).map_or(true, |end| end > self.storage.len()) {
            return Err(BufferError::InvalidWindow {
                offset,
                count,
                capacity: self.storage.len(),
            });
        }
        self.offset = offset;
        self.count = count;
        Ok(())
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("offset", &self.offset)
            .field("count", &self.count)
            .field("capacity", &self.storage.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.reclaim(std::mem::take(&mut self.storage));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RecordingSink;

    fn pool(max_cached: usize) -> (BufferPool, Arc<RecordingSink>) {
        let sink = RecordingSink::shared();
        (BufferPool::new(max_cached, sink.clone()), sink)
    }

    #[test]
    fn test_acquire_spans_requested_length() {
        let (pool, _) = pool(4);
        let buffer = pool.acquire(16);
        assert_eq!(buffer.offset(), 0);
        assert_eq!(buffer.count(), 16);
        assert_eq!(buffer.as_slice(), &[0u8; 16]);
    }

    #[test]
    fn test_release_returns_storage_to_pool() {
        let (pool, sink) = pool(4);
        drop(pool.acquire(64));
        assert_eq!(pool.cached(), 1);
        drop(pool.acquire(32));
        assert_eq!(pool.cached(), 1, "cached storage should be reused");
        assert_eq!(
            sink.counter_value("finalizations", &[("type", "message_buffer")]),
            0
        );
    }

    #[test]
    fn test_overflow_release_counts_finalization() {
        let (pool, sink) = pool(1);
        let a = pool.acquire(8);
        let b = pool.acquire(8);
        drop(a);
        drop(b);
        assert_eq!(pool.cached(), 1);
        assert_eq!(
            sink.counter_value("finalizations", &[("type", "message_buffer")]),
            1
        );
    }

    #[test]
    fn test_window_invariant_enforced() {
        let (pool, _) = pool(4);
        let mut buffer = pool.acquire(10);
        buffer.set_window(2, 5).unwrap();
        assert_eq!(buffer.offset(), 2);
        assert_eq!(buffer.count(), 5);
        assert!(buffer.set_window(8, 3).is_err());
        assert!(buffer.set_window(usize::MAX, 2).is_err());
        // the failed calls must not have moved the window
        assert_eq!(buffer.offset(), 2);
        assert_eq!(buffer.count(), 5);
    }

    #[test]
    fn test_window_slicing() {
        let (pool, _) = pool(4);
        let mut buffer = pool.acquire_from(b"hello world");
        buffer.set_window(6, 5).unwrap();
        assert_eq!(buffer.as_slice(), b"world");
    }

    #[test]
    fn test_unpooled_buffer_does_not_touch_pool() {
        let buffer = MessageBuffer::from_vec(b"abc".to_vec());
        assert_eq!(buffer.as_slice(), b"abc");
        drop(buffer);
    }

    #[test]
    fn test_zero_length_buffer() {
        let (pool, _) = pool(4);
        let buffer = pool.acquire(0);
        assert_eq!(buffer.count(), 0);
        assert!(buffer.as_slice().is_empty());
    }
}

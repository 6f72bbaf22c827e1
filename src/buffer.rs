//! Sector-aligned buffer pool for pending query reads.
//!
//! A chain walk that falls through to disk copies its query key and record
//! bytes into a pooled buffer: the walker's stack does not survive the I/O
//! boundary. Buffers are sector-aligned so a direct-I/O device can consume
//! them unchanged, and are returned to the pool when the pending context
//! resolves.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Alignment for pooled buffers.
pub const SECTOR_SIZE: usize = 512;

struct RawBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: RawBuffer uniquely owns its allocation; the pointer is never
// shared outside the owning PooledBuffer.
unsafe impl Send for RawBuffer {}

impl RawBuffer {
    fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len, SECTOR_SIZE).expect("buffer layout");
        // SAFETY: layout has non-zero size (len is rounded up to a sector).
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "buffer allocation failed");
        RawBuffer { ptr, len }
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, SECTOR_SIZE).expect("buffer layout");
        // SAFETY: ptr was allocated with exactly this layout in `new`.
        unsafe { dealloc(self.ptr, layout) };
    }
}

/// Fixed-buffer-size pool. Acquire hands out a recycled buffer when one is
/// free, otherwise allocates.
pub struct BufferPool {
    buffer_len: usize,
    free: Mutex<Vec<RawBuffer>>,
}

impl BufferPool {
    /// Create a pool of `buffer_len`-byte buffers (rounded up to a whole
    /// number of sectors).
    pub fn new(buffer_len: usize) -> Arc<Self> {
        let rounded = buffer_len.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        Arc::new(BufferPool {
            buffer_len: rounded,
            free: Mutex::new(Vec::new()),
        })
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Number of buffers currently parked in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let raw = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| RawBuffer::new(self.buffer_len));
        PooledBuffer {
            raw: Some(raw),
            pool: Arc::clone(self),
        }
    }
}

/// A buffer checked out of a [`BufferPool`]; returns itself on drop.
pub struct PooledBuffer {
    raw: Option<RawBuffer>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    fn raw(&self) -> &RawBuffer {
        self.raw.as_ref().expect("buffer present until drop")
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let raw = self.raw();
        // SAFETY: ptr/len describe one live allocation owned by this buffer.
        unsafe { std::slice::from_raw_parts(raw.ptr, raw.len) }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let raw = self.raw.as_ref().expect("buffer present until drop");
        // SAFETY: as above; &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(raw.ptr, raw.len) }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.pool.free.lock().push(raw);
        }
    }
}

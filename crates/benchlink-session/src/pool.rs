//! Read scratch buffers owned by one session.
//!
//! The pool is sized at construction. Renting from an empty pool allocates
//! a fresh buffer rather than waiting; returned buffers beyond the pool's
//! size are dropped.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

use tracing::trace;

pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
    buffer_size: usize,
    slots: usize,
}

impl BufferPool {
    /// Pre-allocate `slots` buffers of `buffer_size` bytes each.
    pub fn new(slots: usize, buffer_size: usize) -> Self {
        let free = (0..slots)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();
        Self {
            free: Mutex::new(free),
            buffer_size,
            slots,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Buffers currently available without allocating.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Take a buffer; it goes back to the pool when dropped.
    pub fn rent(&self) -> PooledBuffer<'_> {
        let buf = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| {
                trace!(size = self.buffer_size, "buffer pool empty, allocating");
                vec![0u8; self.buffer_size].into_boxed_slice()
            });
        PooledBuffer {
            buf: Some(buf),
            pool: self,
        }
    }

    fn give_back(&self, buf: Box<[u8]>) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.slots {
            free.push(buf);
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("slots", &self.slots)
            .field("available", &self.available())
            .finish()
    }
}

/// A buffer rented from a [`BufferPool`].
pub struct PooledBuffer<'a> {
    buf: Option<Box<[u8]>>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

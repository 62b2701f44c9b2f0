//! A bag of reusable, alignment-padded buffers for streaming copies and direct I/O.
//!
//! Allocating and zeroing a multi-megabyte buffer per request would dominate a hot transfer
//! loop; instead handlers borrow a [`PooledBuffer`] for the duration of one chunk and it is
//! returned to the pool on drop.

use std::sync::Mutex;

/// Default chunk size used for streaming copies between the HTTP body and the backend.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Buffers are over-allocated by this much so a backend can round a request up to the device's
/// logical block size (commonly 512 or 4096 bytes) without reallocating.
const ALIGNMENT_PADDING: usize = 4096;

pub struct BufferPool {
    chunk_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self
            .free
            .lock()
            .expect("buffer pool mutex poisoned")
            .pop()
            .unwrap_or_else(|| vec![0u8; self.chunk_size + ALIGNMENT_PADDING].into_boxed_slice());
        PooledBuffer { pool: self, buf: Some(buf) }
    }
}

pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Option<Box<[u8]>>,
}

impl PooledBuffer<'_> {
    pub fn as_mut_slice(&mut self, len: usize) -> &mut [u8] {
        &mut self.buf.as_mut().expect("buffer taken")[..len]
    }

    pub fn as_slice(&self, len: usize) -> &[u8] {
        &self.buf.as_ref().expect("buffer taken")[..len]
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free.lock().expect("buffer pool mutex poisoned").push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_recycled() {
        let pool = BufferPool::new(64);
        {
            let mut buf = pool.acquire();
            buf.as_mut_slice(64).fill(0xAB);
        }
        assert_eq!(pool.free.lock().unwrap().len(), 1);
        let buf = pool.acquire();
        assert_eq!(pool.free.lock().unwrap().len(), 0);
        assert_eq!(buf.as_slice(64).len(), 64);
    }
}

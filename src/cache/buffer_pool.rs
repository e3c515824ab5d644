use bytes::{Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;
use std::sync::Arc;

use super::BLOCK_SIZE;

pub const BUFFER_POOL_BLOCKS: usize = 1024;

/// Recycles block-sized buffers for the producer side.
///
/// Producers check out a `BytesMut`, fill it, and freeze it into the
/// `Bytes` a write job carries. Once the cache and the writer have dropped
/// their clones, `release` can reclaim the allocation for the next block.
pub struct BufferPool {
    buffers: ArrayQueue<BytesMut>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        let pool = Arc::new(Self {
            buffers: ArrayQueue::new(BUFFER_POOL_BLOCKS),
        });

        for _ in 0..BUFFER_POOL_BLOCKS {
            let _ = pool.buffers.push(BytesMut::with_capacity(BLOCK_SIZE));
        }

        pool
    }

    pub fn checkout(&self) -> BytesMut {
        self.buffers
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(BLOCK_SIZE))
    }

    /// Returns a buffer to the pool if this was the last reference to it;
    /// otherwise the allocation is freed when the remaining clones drop.
    pub fn release(&self, buf: Bytes) {
        if let Ok(mut buf) = buf.try_into_mut() {
            buf.clear();
            let _ = self.buffers.push(buf);
        }
    }

    pub fn available(&self) -> usize {
        self.buffers.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            buffers: ArrayQueue::new(BUFFER_POOL_BLOCKS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_and_release_recycles() {
        let pool = BufferPool::new();
        let before = pool.available();

        let mut buf = pool.checkout();
        assert_eq!(pool.available(), before - 1);
        buf.extend_from_slice(&[1u8; 100]);

        let frozen = buf.freeze();
        pool.release(frozen);
        assert_eq!(pool.available(), before);
    }

    #[test]
    fn test_release_skips_shared_buffers() {
        let pool = BufferPool::new();
        let before = pool.available();

        let mut buf = pool.checkout();
        buf.extend_from_slice(&[2u8; 100]);
        let buf = buf.freeze();
        let _clone = buf.clone();
        pool.release(buf);

        // still referenced elsewhere, so it cannot be recycled
        assert_eq!(pool.available(), before - 1);
    }
}

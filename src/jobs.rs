//! Disk job types exchanged with the cache.
//!
//! Jobs arrive at the cache already constructed. Completed jobs are pushed
//! onto a [`JobQueue`] the caller owns; aborted write jobs are handed back
//! the same way so the engine can fail them with a cancellation status.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::cache::PieceLocation;
use crate::storage::StorageHandle;

/// A pending block write.
///
/// The cache takes custody of `buf` until the block has been flushed and any
/// hashing that needs the bytes has completed.
pub struct WriteJob {
    /// Handle of the torrent this block belongs to.
    pub storage: Arc<dyn StorageHandle>,
    /// The piece the block belongs to.
    pub piece: PieceLocation,
    /// Block index within the piece.
    pub block_index: usize,
    /// The block payload.
    pub buf: Bytes,
}

impl WriteJob {
    pub fn new(
        storage: Arc<dyn StorageHandle>,
        piece: PieceLocation,
        block_index: usize,
        buf: Bytes,
    ) -> Self {
        Self {
            storage,
            piece,
            block_index,
            buf,
        }
    }

    /// Size of the block payload in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buf.len()
    }
}

impl fmt::Debug for WriteJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteJob")
            .field("piece", &self.piece)
            .field("block_index", &self.block_index)
            .field("buffer_size", &self.buf.len())
            .finish()
    }
}

/// A request for a piece hash.
///
/// The cache fills `piece_hash` and, when `block_hashes` was pre-sized by
/// the caller, as many v2 block hashes as fit.
#[derive(Debug, Clone)]
pub struct HashJob {
    pub piece: PieceLocation,
    /// v1 SHA-1 piece hash, written by the cache.
    pub piece_hash: [u8; 20],
    /// v2 SHA-256 block hashes. Left empty when the caller does not want
    /// them; otherwise the cache copies at most `block_hashes.len()` hashes.
    pub block_hashes: Vec<[u8; 32]>,
}

impl HashJob {
    pub fn new(piece: PieceLocation) -> Self {
        Self {
            piece,
            piece_hash: [0u8; 20],
            block_hashes: Vec::new(),
        }
    }

    /// Requests `count` v2 block hashes along with the piece hash.
    pub fn with_block_hashes(piece: PieceLocation, count: usize) -> Self {
        Self {
            piece,
            piece_hash: [0u8; 20],
            block_hashes: vec![[0u8; 32]; count],
        }
    }
}

/// A request to discard a piece that failed its hash check.
#[derive(Debug, Clone)]
pub struct ClearJob {
    pub piece: PieceLocation,
}

impl ClearJob {
    pub fn new(piece: PieceLocation) -> Self {
        Self { piece }
    }
}

/// Any job the cache can hand back to the caller.
#[derive(Debug)]
pub enum DiskJob {
    Write(WriteJob),
    Hash(HashJob),
    Clear(ClearJob),
}

/// FIFO queue of completed or aborted jobs, owned by the caller.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<DiskJob>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: DiskJob) {
        self.jobs.push_back(job);
    }

    pub fn pop(&mut self) -> Option<DiskJob> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Moves every queued job out, front to back.
    pub fn drain(&mut self) -> impl Iterator<Item = DiskJob> + '_ {
        self.jobs.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageId, TorrentFiles};

    #[test]
    fn test_queue_is_fifo() {
        let loc = PieceLocation::new(StorageId(0), 0);
        let mut q = JobQueue::new();
        q.push(DiskJob::Hash(HashJob::new(loc)));
        q.push(DiskJob::Clear(ClearJob::new(loc)));

        assert_eq!(q.len(), 2);
        assert!(matches!(q.pop(), Some(DiskJob::Hash(_))));
        assert!(matches!(q.pop(), Some(DiskJob::Clear(_))));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_write_job_buffer_size() {
        let storage = Arc::new(TorrentFiles::new(4 * 16384, 16384, true, false));
        let loc = PieceLocation::new(StorageId(7), 2);
        let job = WriteJob::new(storage, loc, 1, Bytes::from(vec![0u8; 16384]));
        assert_eq!(job.buffer_size(), 16384);
        assert_eq!(job.piece, loc);
    }
}

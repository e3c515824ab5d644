use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::jobs::{ClearJob, HashJob, WriteJob};
use crate::storage::StorageId;

/// Identity of a piece: which torrent, which piece index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceLocation {
    pub torrent: StorageId,
    pub piece: u32,
}

impl PieceLocation {
    pub fn new(torrent: StorageId, piece: u32) -> Self {
        Self { torrent, piece }
    }
}

/// One block slot of a cached piece.
///
/// Holds either a pending write job or, once the block has been flushed,
/// the buffer taken from it (`buf_holder`) until hashing no longer needs
/// the bytes. Never both.
#[derive(Debug, Default)]
pub(crate) struct CachedBlock {
    pub write_job: Option<WriteJob>,
    pub buf_holder: Option<Bytes>,
    pub flushed_to_disk: bool,
    /// v2 SHA-256 of this block. Only meaningful once the hasher cursor has
    /// passed the block on a v2 piece.
    pub block_hash: [u8; 32],
}

impl CachedBlock {
    /// The resident bytes, whichever side currently owns them.
    pub fn buf(&self) -> Option<&Bytes> {
        if let Some(buf) = &self.buf_holder {
            return Some(buf);
        }
        self.write_job.as_ref().map(|job| &job.buf)
    }
}

pub(crate) struct CachedPiece {
    pub blocks_in_piece: usize,
    pub blocks: Box<[CachedBlock]>,

    pub v1_hashes: bool,
    pub v2_hashes: bool,

    /// Streaming SHA-1 over the contiguous prefix of blocks.
    pub ph: Sha1,

    /// Blocks from index 0 already folded into `ph` (and, on v2 pieces,
    /// whose `block_hash` is computed).
    pub hasher_cursor: usize,

    /// Contiguous blocks from index 0 durably on disk. Subtracted from the
    /// hasher cursor this gives the run that can be flushed without
    /// read-back later.
    pub flushed_cursor: usize,

    /// A thread is hashing this piece with the cache lock released.
    pub hashing: bool,

    /// A thread is writing this piece to disk. Only one at a time.
    pub flushing: bool,

    /// Every block either has a pending write or is already flushed; the
    /// piece is prioritized for flushing.
    pub ready_to_flush: bool,

    /// The final piece hash has been handed to a client.
    pub piece_hash_returned: bool,

    /// Hash job waiting for the hasher to reach the end of the piece.
    pub hash_job: Option<HashJob>,

    /// Clear job parked while the piece was busy flushing.
    pub clear_piece: Option<ClearJob>,
}

impl CachedPiece {
    pub fn new(blocks_in_piece: usize, v1_hashes: bool, v2_hashes: bool) -> Self {
        let blocks = (0..blocks_in_piece)
            .map(|_| CachedBlock::default())
            .collect();
        Self {
            blocks_in_piece,
            blocks,
            v1_hashes,
            v2_hashes,
            ph: Sha1::new(),
            hasher_cursor: 0,
            flushed_cursor: 0,
            hashing: false,
            flushing: false,
            ready_to_flush: false,
            piece_hash_returned: false,
            hash_job: None,
            clear_piece: None,
        }
    }

    /// Number of hashed-but-not-flushed blocks. Negative when flushing has
    /// run ahead of the hasher.
    pub fn cheap_to_flush(&self) -> isize {
        self.hasher_cursor as isize - self.flushed_cursor as isize
    }
}

/// True if every block in the slice has resident bytes.
pub(crate) fn have_buffers(blocks: &[CachedBlock]) -> bool {
    blocks.iter().all(|b| b.buf().is_some())
}

/// True if every block either has a pending write or is already on disk.
pub(crate) fn compute_ready_to_flush(blocks: &[CachedBlock]) -> bool {
    blocks
        .iter()
        .all(|b| b.write_job.is_some() || b.flushed_to_disk)
}

/// Length of the contiguous flushed prefix.
pub(crate) fn compute_flushed_cursor(blocks: &[CachedBlock]) -> usize {
    blocks
        .iter()
        .take_while(|b| b.flushed_to_disk)
        .count()
}

/// Number of slots holding a live write job.
pub(crate) fn count_jobs(blocks: &[CachedBlock]) -> usize {
    blocks.iter().filter(|b| b.write_job.is_some()).count()
}

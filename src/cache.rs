//! Write-back caching of downloaded blocks
//!
//! Blocks arriving from the network are batched here before they reach
//! disk. The cache drives incremental piece hashing (v1 SHA-1 over the
//! whole piece, v2 SHA-256 per block) while blocks are still in memory, so
//! pieces can usually be verified without ever reading them back.
//!
//! # Components
//!
//! - [`DiskCache`] - the write-back cache itself
//! - [`PieceLocation`] - (torrent, piece) identity of a cached piece
//! - [`FlushBlock`] / [`HashResult`] - writer-callback and hash-query views
//! - [`BufferPool`] - block buffer recycling for the producer side

mod buffer_pool;
mod disk_cache;
mod entry;

pub use buffer_pool::{BufferPool, BUFFER_POOL_BLOCKS};
pub use disk_cache::{DiskCache, FlushBlock, HashResult};
pub use entry::PieceLocation;

/// Standard block size for BitTorrent (16 KiB). Only the last block of a
/// torrent may be shorter.
pub const BLOCK_SIZE: usize = 16384;

//! btcache - a write-back piece cache for a BitTorrent engine
//!
//! Downloaded data arrives in 16 KiB blocks belonging to logical pieces.
//! This crate batches those blocks in memory, hashes them incrementally
//! (v1 SHA-1 per piece, v2 SHA-256 per block) and flushes them to durable
//! storage through a caller-supplied writer, balancing three concerns that
//! all want the same buffers: producers inserting blocks, hasher threads
//! consuming contiguous prefixes, and a flusher draining dirty runs.
//!
//! # Modules
//!
//! - [`cache`] - The write-back cache: insertion, hashing, tiered flushing
//! - [`jobs`] - Write / hash / clear jobs and the completed-job queue
//! - [`storage`] - Storage handles, the per-session registry, errors
//! - [`bitfield`] - The flushed-block bitmap filled in by writer callbacks

pub mod bitfield;
pub mod cache;
pub mod jobs;
pub mod storage;

pub use bitfield::Bitfield;
pub use cache::{BufferPool, DiskCache, FlushBlock, HashResult, PieceLocation, BLOCK_SIZE};
pub use jobs::{ClearJob, DiskJob, HashJob, JobQueue, WriteJob};
pub use storage::{
    FileStorage, StorageError, StorageHandle, StorageId, StorageRegistry, TorrentFiles,
};

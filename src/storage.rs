//! Storage handles the cache reads torrent metadata through.
//!
//! The cache never touches files itself; it learns piece sizes and hash
//! flags through [`StorageHandle`] and leaves the actual writes to the
//! writer callback. [`FileStorage`] is a minimal single-file implementation
//! used to build such callbacks; [`StorageRegistry`] lets a session look
//! handles up by [`StorageId`].

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;

use crate::cache::BLOCK_SIZE;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("invalid block index: piece {piece}, block {block}")]
    InvalidBlockIndex { piece: u32, block: usize },

    #[error("write aborted")]
    Aborted,
}

/// Identifies one torrent's storage within the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageId(pub u32);

/// Per-torrent metadata the cache needs: piece sizes and which hash
/// versions the torrent carries.
pub trait StorageHandle: Send + Sync {
    /// Size in bytes of the given piece. The last piece may be short.
    fn piece_size(&self, piece: u32) -> u32;

    /// True if the torrent has v1 SHA-1 piece hashes.
    fn v1(&self) -> bool;

    /// True if the torrent has v2 SHA-256 block hashes.
    fn v2(&self) -> bool;

    /// Number of 16 KiB blocks in the given piece. Pieces shorter than one
    /// block still count one.
    fn blocks_in_piece(&self, piece: u32) -> usize {
        (self.piece_size(piece) as usize).div_ceil(BLOCK_SIZE).max(1)
    }
}

/// Piece geometry for a torrent, without any backing file.
#[derive(Debug, Clone)]
pub struct TorrentFiles {
    total_len: u64,
    piece_length: u32,
    v1: bool,
    v2: bool,
}

impl TorrentFiles {
    pub fn new(total_len: u64, piece_length: u32, v1: bool, v2: bool) -> Self {
        assert!(piece_length > 0);
        Self {
            total_len,
            piece_length,
            v1,
            v2,
        }
    }

    pub fn num_pieces(&self) -> u32 {
        self.total_len.div_ceil(u64::from(self.piece_length)) as u32
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }
}

impl StorageHandle for TorrentFiles {
    fn piece_size(&self, piece: u32) -> u32 {
        let start = u64::from(piece) * u64::from(self.piece_length);
        debug_assert!(start < self.total_len, "piece {piece} out of range");
        let remaining = self.total_len.saturating_sub(start);
        remaining.min(u64::from(self.piece_length)) as u32
    }

    fn v1(&self) -> bool {
        self.v1
    }

    fn v2(&self) -> bool {
        self.v2
    }
}

/// Single-file storage backing a torrent's pieces.
///
/// Blocks live at `piece * piece_length + block * 16384`. Good enough to
/// drive writer callbacks end to end; multi-file mapping belongs to the
/// engine, not the cache.
pub struct FileStorage {
    files: TorrentFiles,
    file: Mutex<File>,
}

impl FileStorage {
    pub fn create(
        path: &Path,
        total_len: u64,
        piece_length: u32,
        v1: bool,
        v2: bool,
    ) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.set_len(total_len)?;
        Ok(Self {
            files: TorrentFiles::new(total_len, piece_length, v1, v2),
            file: Mutex::new(file),
        })
    }

    fn block_range(&self, piece: u32, block: usize) -> Result<(u64, usize), StorageError> {
        if piece >= self.files.num_pieces() {
            return Err(StorageError::InvalidPieceIndex(piece));
        }
        let piece_size = self.files.piece_size(piece) as usize;
        let offset_in_piece = block * BLOCK_SIZE;
        if offset_in_piece >= piece_size {
            return Err(StorageError::InvalidBlockIndex { piece, block });
        }
        let len = BLOCK_SIZE.min(piece_size - offset_in_piece);
        let offset = u64::from(piece) * u64::from(self.files.piece_length())
            + offset_in_piece as u64;
        Ok((offset, len))
    }

    pub fn write_block(&self, piece: u32, block: usize, data: &[u8]) -> Result<(), StorageError> {
        let (offset, len) = self.block_range(piece, block)?;
        debug_assert_eq!(data.len(), len);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn read_block(&self, piece: u32, block: usize) -> Result<Vec<u8>, StorageError> {
        let (offset, len) = self.block_range(piece, block)?;
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn sync(&self) -> Result<(), StorageError> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}

impl StorageHandle for FileStorage {
    fn piece_size(&self, piece: u32) -> u32 {
        self.files.piece_size(piece)
    }

    fn v1(&self) -> bool {
        self.files.v1()
    }

    fn v2(&self) -> bool {
        self.files.v2()
    }
}

/// Session-level map from [`StorageId`] to the torrent's handle.
#[derive(Default)]
pub struct StorageRegistry {
    handles: DashMap<StorageId, Arc<dyn StorageHandle>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: StorageId, handle: Arc<dyn StorageHandle>) {
        self.handles.insert(id, handle);
    }

    pub fn unregister(&self, id: StorageId) -> Option<Arc<dyn StorageHandle>> {
        self.handles.remove(&id).map(|(_, h)| h)
    }

    pub fn get(&self, id: StorageId) -> Option<Arc<dyn StorageHandle>> {
        self.handles.get(&id).map(|h| h.clone())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_piece_geometry() {
        let files = TorrentFiles::new(3 * 65536 + 1000, 65536, true, false);
        assert_eq!(files.num_pieces(), 4);
        assert_eq!(files.piece_size(0), 65536);
        assert_eq!(files.piece_size(3), 1000);
        assert_eq!(files.blocks_in_piece(0), 4);
        assert_eq!(files.blocks_in_piece(3), 1);
    }

    #[test]
    fn test_blocks_in_piece_short_piece() {
        // Pieces shorter than one block still count one block.
        let files = TorrentFiles::new(4000, 4000, true, true);
        assert_eq!(files.piece_size(0), 4000);
        assert_eq!(files.blocks_in_piece(0), 1);
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("payload.dat");
        let storage = FileStorage::create(&path, 65536, 32768, true, false).unwrap();

        let data: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        storage.write_block(0, 0, &data).unwrap();
        storage.write_block(1, 1, &data).unwrap();

        assert_eq!(storage.read_block(0, 0).unwrap(), data);
        assert_eq!(storage.read_block(1, 1).unwrap(), data);
    }

    #[test]
    fn test_file_storage_rejects_bad_indices() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("payload.dat");
        let storage = FileStorage::create(&path, 32768, 32768, true, false).unwrap();

        assert!(matches!(
            storage.write_block(9, 0, &[0u8; BLOCK_SIZE]),
            Err(StorageError::InvalidPieceIndex(9))
        ));
        assert!(matches!(
            storage.read_block(0, 5),
            Err(StorageError::InvalidBlockIndex { piece: 0, block: 5 })
        ));
    }

    #[test]
    fn test_registry() {
        let registry = StorageRegistry::new();
        let handle: Arc<dyn StorageHandle> =
            Arc::new(TorrentFiles::new(65536, 16384, true, false));
        registry.register(StorageId(3), handle);

        assert!(registry.get(StorageId(3)).is_some());
        assert!(registry.get(StorageId(4)).is_none());
        assert!(registry.unregister(StorageId(3)).is_some());
        assert!(registry.is_empty());
    }
}

use std::collections::BTreeMap;
use std::mem;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::{debug, trace};

use super::entry::{
    compute_flushed_cursor, compute_ready_to_flush, count_jobs, have_buffers, CachedPiece,
    PieceLocation,
};
use crate::bitfield::Bitfield;
use crate::jobs::{ClearJob, DiskJob, HashJob, JobQueue, WriteJob};
use crate::storage::StorageId;

/// One block of a piece as seen by the writer callback.
///
/// `buf` is `Some` for blocks with a pending write; blocks that are already
/// on disk (or were never inserted) show up as `None` and the writer skips
/// them.
#[derive(Debug, Clone)]
pub struct FlushBlock {
    /// Block index within the piece.
    pub index: usize,
    pub buf: Option<Bytes>,
}

/// Outcome of [`DiskCache::try_hash_piece`].
#[derive(Debug)]
pub enum HashResult {
    /// The hash was available; it has been written into the job.
    Completed(HashJob),
    /// The piece is mid-hash; the job is parked on the piece and will be
    /// posted by the hasher when it reaches the end.
    Queued,
    /// The piece is not fully resident; the caller must read the bytes back
    /// from disk to hash them.
    Post(HashJob),
}

struct CacheInner {
    pieces: BTreeMap<PieceLocation, CachedPiece>,

    /// Blocks with a pending write job across all pieces. The cache may
    /// briefly hold more buffers than this while hashing catches up.
    dirty_blocks: usize,

    /// Blocks currently handed to a writer callback. Used to avoid
    /// overshooting the flush target from several threads at once.
    flushing_blocks: usize,
}

/// Write-back cache of downloaded blocks, keyed by piece.
///
/// Producers `insert` blocks as they arrive; hasher threads drive
/// [`kick_hasher`](DiskCache::kick_hasher) to fold contiguous prefixes into
/// the piece's streaming SHA-1 (and per-block SHA-256 on v2 torrents); a
/// flusher drains dirty blocks through a writer callback with
/// [`flush_to_disk`](DiskCache::flush_to_disk). A single mutex guards the
/// container; slow work runs with the mutex released while the piece is
/// pinned by its `hashing` / `flushing` flag, and state is re-fetched by key
/// afterwards.
pub struct DiskCache {
    inner: Mutex<CacheInner>,
}

impl Default for DiskCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                pieces: BTreeMap::new(),
                dirty_blocks: 0,
                flushing_blocks: 0,
            }),
        }
    }

    /// Invokes `f` with the block's bytes if it is resident. The reader runs
    /// after the cache lock has been released and must not re-enter the
    /// cache. Returns false if the block is not resident.
    pub fn get<F>(&self, loc: PieceLocation, block_idx: usize, f: F) -> bool
    where
        F: FnOnce(&[u8]),
    {
        let guard = self.inner.lock();
        check_invariant(&guard);

        let Some(piece) = guard.pieces.get(&loc) else {
            return false;
        };
        let Some(buf) = piece.blocks.get(block_idx).and_then(|b| b.buf()).cloned() else {
            return false;
        };
        drop(guard);
        f(&buf);
        true
    }

    /// Reads blocks `block_idx` and `block_idx + 1` in one call. Returns 0
    /// without invoking `f` if neither block is resident; otherwise returns
    /// whatever `f` makes of the two (possibly one-sided) buffers.
    pub fn get2<F>(&self, loc: PieceLocation, block_idx: usize, f: F) -> usize
    where
        F: FnOnce(Option<&[u8]>, Option<&[u8]>) -> usize,
    {
        let guard = self.inner.lock();
        check_invariant(&guard);

        let Some(piece) = guard.pieces.get(&loc) else {
            return 0;
        };
        let buf1 = piece.blocks.get(block_idx).and_then(|b| b.buf()).cloned();
        let buf2 = piece
            .blocks
            .get(block_idx + 1)
            .and_then(|b| b.buf())
            .cloned();
        if buf1.is_none() && buf2.is_none() {
            return 0;
        }
        drop(guard);
        f(buf1.as_deref(), buf2.as_deref())
    }

    /// v2 block hash: the cached hash if the hasher has passed the block, a
    /// one-shot SHA-256 if the bytes are resident, otherwise `fallback`.
    /// The fallback also runs when the piece is mid-hash; it is invoked with
    /// the lock released and must not re-enter the cache.
    pub fn hash2<F>(&self, loc: PieceLocation, block_idx: usize, fallback: F) -> [u8; 32]
    where
        F: FnOnce() -> [u8; 32],
    {
        let guard = self.inner.lock();
        check_invariant(&guard);

        if let Some(piece) = guard.pieces.get(&loc) {
            if piece.hashing {
                drop(guard);
                return fallback();
            }
            if let Some(blk) = piece.blocks.get(block_idx) {
                if piece.hasher_cursor > block_idx {
                    return blk.block_hash;
                }
                if let Some(buf) = blk.buf() {
                    return Sha256::digest(buf).into();
                }
            }
        }
        drop(guard);
        fallback()
    }

    /// Inserts a block. The piece entry is created on first contact, sized
    /// from the job's storage handle. Returns true if the caller should
    /// schedule a hasher kick: either this was block 0 (unblocking the
    /// hasher) or the piece just became fully populated.
    ///
    /// The slot must be vacant and at or past both cursors; violating that
    /// is a caller bug.
    pub fn insert(&self, loc: PieceLocation, block_idx: usize, job: WriteJob) -> bool {
        let mut guard = self.inner.lock();
        check_invariant(&guard);

        let inner = &mut *guard;
        debug_assert_eq!(job.piece, loc);
        debug_assert_eq!(job.block_index, block_idx);

        let piece = inner.pieces.entry(loc).or_insert_with(|| {
            let storage = &job.storage;
            CachedPiece::new(
                storage.blocks_in_piece(loc.piece),
                storage.v1(),
                storage.v2(),
            )
        });

        let blk = &mut piece.blocks[block_idx];
        debug_assert!(blk.buf_holder.is_none());
        debug_assert!(blk.write_job.is_none());
        debug_assert!(!blk.flushed_to_disk);
        debug_assert!(block_idx >= piece.flushed_cursor);
        debug_assert!(block_idx >= piece.hasher_cursor);

        blk.write_job = Some(job);
        inner.dirty_blocks += 1;

        let ready = compute_ready_to_flush(&piece.blocks);
        piece.ready_to_flush = ready;

        block_idx == 0 || ready
    }

    /// Hands the piece's hash state to `f` for a caller-driven hash pass
    /// (the read-back path): the streaming SHA-1 context, the hasher
    /// cursor, every block's resident bytes, and the v2 block hashes. The
    /// piece is pinned `hashing` and the lock is released around `f`.
    /// Returns false if the piece is not in the cache.
    pub fn hash_piece<F>(&self, loc: PieceLocation, f: F) -> bool
    where
        F: FnOnce(&mut Sha1, usize, &[Option<Bytes>], &[[u8; 32]]),
    {
        let mut guard = self.inner.lock();
        check_invariant(&guard);

        let Some(piece) = guard.pieces.get_mut(&loc) else {
            return false;
        };
        debug_assert!(!piece.hashing);

        let blocks: Vec<Option<Bytes>> = piece.blocks.iter().map(|b| b.buf().cloned()).collect();
        let v2_hashes: Vec<[u8; 32]> = piece.blocks.iter().map(|b| b.block_hash).collect();
        let hasher_cursor = piece.hasher_cursor;
        piece.hashing = true;
        let mut ph = mem::take(&mut piece.ph);

        MutexGuard::unlocked(&mut guard, || {
            f(&mut ph, hasher_cursor, &blocks, &v2_hashes);
        });

        if let Some(piece) = guard.pieces.get_mut(&loc) {
            piece.ph = ph;
            piece.hashing = false;
        }
        true
    }

    /// Requests the piece hash.
    ///
    /// Three outcomes: the hash is ready and written into the job
    /// ([`HashResult::Completed`]); the piece is mid-hash with every
    /// remaining block resident, so the job is hung on the piece for the
    /// hasher to finish ([`HashResult::Queued`]); or the piece cannot be
    /// hashed from the cache and the caller must read back from disk
    /// ([`HashResult::Post`]).
    pub fn try_hash_piece(&self, loc: PieceLocation, mut job: HashJob) -> HashResult {
        let mut guard = self.inner.lock();
        check_invariant(&guard);

        let Some(piece) = guard.pieces.get_mut(&loc) else {
            return HashResult::Post(job);
        };

        // the hash is handed out once
        debug_assert!(!piece.piece_hash_returned);

        if !piece.hashing && piece.hasher_cursor == piece.blocks_in_piece {
            piece.piece_hash_returned = true;
            job.piece_hash = piece.ph.clone().finalize().into();
            return HashResult::Completed(job);
        }

        if piece.hashing
            && piece.hasher_cursor < piece.blocks_in_piece
            && have_buffers(&piece.blocks[piece.hasher_cursor..])
        {
            // no simultaneous hash requests for the same piece
            debug_assert!(piece.hash_job.is_none());
            piece.hash_job = Some(job);
            return HashResult::Queued;
        }

        HashResult::Post(job)
    }

    /// Advances the piece's hash as far as contiguous resident blocks
    /// allow. Runs on a hasher thread; returns immediately if another
    /// thread is already hashing the piece. When hashing reaches the end of
    /// the piece, a hung hash job is completed and pushed to `completed`.
    pub fn kick_hasher(&self, loc: PieceLocation, completed: &mut JobQueue) {
        let mut guard = self.inner.lock();
        check_invariant(&guard);

        match guard.pieces.get(&loc) {
            None => return,
            // some other thread beat us to it
            Some(piece) if piece.hashing => return,
            Some(_) => {}
        }

        loop {
            let Some(piece) = guard.pieces.get_mut(&loc) else {
                return;
            };
            let cursor = piece.hasher_cursor;
            let run: Vec<Bytes> = piece.blocks[cursor..]
                .iter()
                .map_while(|b| b.buf().cloned())
                .collect();
            if run.is_empty() {
                break;
            }

            let need_v1 = piece.v1_hashes;
            let need_v2 = piece.v2_hashes;
            piece.hashing = true;
            let mut ph = mem::take(&mut piece.ph);

            let mut block_hashes: Vec<[u8; 32]> = Vec::new();
            MutexGuard::unlocked(&mut guard, || {
                for buf in &run {
                    if need_v1 {
                        ph.update(buf);
                    }
                    if need_v2 {
                        block_hashes.push(Sha256::digest(buf).into());
                    }
                }
            });

            let Some(piece) = guard.pieces.get_mut(&loc) else {
                return;
            };
            piece.ph = ph;
            let end = cursor + run.len();
            for (i, blk) in piece.blocks[cursor..end].iter_mut().enumerate() {
                if need_v2 {
                    blk.block_hash = block_hashes[i];
                }
                // already flushed; the hasher was the last consumer of
                // these bytes
                if blk.buf_holder.is_some() {
                    blk.buf_holder = None;
                }
            }
            piece.hasher_cursor = end;
            piece.hashing = false;
            trace!(?loc, cursor = end, "hashed {} blocks", run.len());

            if end == piece.blocks_in_piece || piece.blocks[end].buf().is_none() {
                break;
            }
            // a new block arrived at the cursor while we were unlocked
        }

        let Some(piece) = guard.pieces.get_mut(&loc) else {
            return;
        };
        if piece.hasher_cursor != piece.blocks_in_piece {
            return;
        }
        let Some(mut job) = piece.hash_job.take() else {
            return;
        };

        // completing the hash may have made trailing buffers releasable
        piece.ready_to_flush = compute_ready_to_flush(&piece.blocks);

        job.piece_hash = piece.ph.clone().finalize().into();
        if !job.block_hashes.is_empty() {
            debug_assert!(piece.v2_hashes);
            let to_copy = piece.blocks_in_piece.min(job.block_hashes.len());
            for i in 0..to_copy {
                job.block_hashes[i] = piece.blocks[i].block_hash;
            }
        }
        debug!(?loc, "piece fully hashed, posting hung hash job");
        completed.push(DiskJob::Hash(job));
    }

    /// Discards a piece that failed its hash check. Pending writes are
    /// moved to `aborted` for the caller to fail with a cancellation
    /// status. Returns the job if the clear completed and should be posted
    /// now; returns `None` if the piece is busy flushing and the job was
    /// parked — the flush driver will finish the clear and hand the job to
    /// its clear callback.
    pub fn try_clear_piece(
        &self,
        loc: PieceLocation,
        job: ClearJob,
        aborted: &mut JobQueue,
    ) -> Option<ClearJob> {
        let mut guard = self.inner.lock();
        check_invariant(&guard);

        let CacheInner {
            pieces,
            dirty_blocks,
            ..
        } = &mut *guard;
        let Some(piece) = pieces.get_mut(&loc) else {
            return Some(job);
        };
        if piece.flushing {
            // postpone until the flusher is done with the piece
            piece.clear_piece = Some(job);
            return None;
        }

        // pieces are cleared after a failed hash check; hashing is done by
        // then
        debug_assert!(!piece.hashing);
        if piece.hashing {
            piece.clear_piece = Some(job);
            return None;
        }

        clear_piece_impl(piece, dirty_blocks, aborted);
        Some(job)
    }

    /// Flushes dirty blocks until at most `target_blocks` remain resident.
    ///
    /// Three passes, each ending the whole call when the writer reports a
    /// short count:
    ///
    /// 1. fully populated pieces, regardless of the target — a finished
    ///    piece has no value in RAM;
    /// 2. the longest hashed-but-unflushed runs, which can be flushed
    ///    without ever reading them back;
    /// 3. any remaining dirty blocks in piece order, accepting future
    ///    read-back.
    ///
    /// The writer is called per piece with the lock released and must not
    /// re-enter the cache; `clear_cb` receives the aborted writes and
    /// parked job of any clear that was waiting on a flushing piece.
    pub fn flush_to_disk<W, C>(&self, mut writer: W, target_blocks: usize, mut clear_cb: C)
    where
        W: FnMut(PieceLocation, &mut Bitfield, &[FlushBlock], usize) -> usize,
        C: FnMut(JobQueue, ClearJob),
    {
        let mut guard = self.inner.lock();
        check_invariant(&guard);

        // ready pieces first
        let ready: Vec<PieceLocation> = guard
            .pieces
            .iter()
            .filter(|(_, p)| p.ready_to_flush && !p.flushing)
            .map(|(loc, _)| *loc)
            .collect();

        for loc in ready {
            let CacheInner {
                pieces,
                flushing_blocks,
                ..
            } = &mut *guard;
            let Some(piece) = pieces.get_mut(&loc) else {
                continue;
            };
            if piece.flushing || !piece.ready_to_flush {
                continue;
            }

            piece.flushing = true;
            let num_blocks = piece.blocks_in_piece;
            *flushing_blocks += num_blocks;
            let hash_cursor = piece.hasher_cursor;
            let span = collect_span(piece, 0, num_blocks);
            trace!(?loc, num_blocks, "flushing ready piece");

            let mut bitmap = Bitfield::new(span.len());
            let count =
                MutexGuard::unlocked(&mut guard, || writer(loc, &mut bitmap, &span, hash_cursor));

            let CacheInner {
                pieces,
                dirty_blocks,
                flushing_blocks,
            } = &mut *guard;
            debug_assert!(*flushing_blocks >= num_blocks);
            *flushing_blocks -= num_blocks;
            let Some(piece) = pieces.get_mut(&loc) else {
                continue;
            };
            piece.flushing = false;
            apply_flushed(piece, 0, &bitmap, hash_cursor);
            piece.flushed_cursor = compute_flushed_cursor(&piece.blocks);
            piece.ready_to_flush = compute_ready_to_flush(&piece.blocks);
            debug_assert!(*dirty_blocks >= count);
            *dirty_blocks = dirty_blocks.saturating_sub(count);

            finish_parked_clear(&mut guard, loc, &mut clear_cb);

            let pieces = &mut guard.pieces;
            if let Some(piece) = pieces.get(&loc) {
                if piece.piece_hash_returned {
                    debug_assert!(!piece.flushing);
                    debug_assert!(!piece.hashing);
                    pieces.remove(&loc);
                }
            }

            if count < num_blocks {
                return;
            }
        }

        // cheapest partial flushes next: pieces with the longest runs of
        // hashed blocks that have not been written yet
        let mut cheap: Vec<(isize, PieceLocation)> = guard
            .pieces
            .iter()
            .filter(|(_, p)| !p.flushing && p.cheap_to_flush() > 0)
            .map(|(loc, p)| (p.cheap_to_flush(), *loc))
            .collect();
        cheap.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, loc) in cheap {
            if guard.dirty_blocks.saturating_sub(guard.flushing_blocks) <= target_blocks {
                return;
            }
            let CacheInner {
                pieces,
                flushing_blocks,
                ..
            } = &mut *guard;
            let Some(piece) = pieces.get_mut(&loc) else {
                continue;
            };
            if piece.flushing {
                continue;
            }
            let run = piece.cheap_to_flush();
            if run <= 0 {
                continue;
            }
            let num_blocks = run as usize;
            let start = piece.flushed_cursor;

            piece.flushing = true;
            *flushing_blocks += num_blocks;
            let span = collect_span(piece, start, num_blocks);
            trace!(?loc, num_blocks, "flushing hashed run");

            let mut bitmap = Bitfield::new(span.len());
            let count =
                MutexGuard::unlocked(&mut guard, || writer(loc, &mut bitmap, &span, num_blocks));

            let CacheInner {
                pieces,
                dirty_blocks,
                flushing_blocks,
            } = &mut *guard;
            debug_assert!(*flushing_blocks >= num_blocks);
            *flushing_blocks -= num_blocks;
            let Some(piece) = pieces.get_mut(&loc) else {
                continue;
            };
            piece.flushing = false;
            apply_flushed(piece, start, &bitmap, num_blocks);
            piece.flushed_cursor = compute_flushed_cursor(&piece.blocks);
            debug_assert!(*dirty_blocks >= count);
            *dirty_blocks = dirty_blocks.saturating_sub(count);

            finish_parked_clear(&mut guard, loc, &mut clear_cb);

            if count < num_blocks {
                return;
            }
        }

        // last resort: flush in piece order even though unhashed blocks
        // will have to be read back later
        let remaining: Vec<PieceLocation> = guard.pieces.keys().copied().collect();
        for loc in remaining {
            if guard.dirty_blocks.saturating_sub(guard.flushing_blocks) <= target_blocks {
                return;
            }
            let CacheInner {
                pieces,
                flushing_blocks,
                ..
            } = &mut *guard;
            let Some(piece) = pieces.get_mut(&loc) else {
                continue;
            };
            if piece.flushing {
                continue;
            }
            let num_blocks = count_jobs(&piece.blocks);
            if num_blocks == 0 {
                continue;
            }

            piece.flushing = true;
            *flushing_blocks += num_blocks;
            let hash_cursor = piece.hasher_cursor;
            let total = piece.blocks_in_piece;
            let span = collect_span(piece, 0, total);
            trace!(?loc, num_blocks, "force flushing piece");

            let mut bitmap = Bitfield::new(span.len());
            let count =
                MutexGuard::unlocked(&mut guard, || writer(loc, &mut bitmap, &span, hash_cursor));

            let CacheInner {
                pieces,
                dirty_blocks,
                flushing_blocks,
            } = &mut *guard;
            debug_assert!(*flushing_blocks >= num_blocks);
            *flushing_blocks -= num_blocks;
            let Some(piece) = pieces.get_mut(&loc) else {
                continue;
            };
            piece.flushing = false;
            apply_flushed(piece, 0, &bitmap, hash_cursor);
            piece.flushed_cursor = compute_flushed_cursor(&piece.blocks);
            debug_assert!(*dirty_blocks >= count);
            *dirty_blocks = dirty_blocks.saturating_sub(count);

            finish_parked_clear(&mut guard, loc, &mut clear_cb);

            if count < num_blocks {
                return;
            }
        }
    }

    /// Flushes every dirty block of one torrent and evicts its pieces.
    /// Pieces another thread is busy flushing are left behind; pieces with
    /// no pending writes are skipped.
    pub fn flush_storage<W, C>(&self, mut writer: W, storage: StorageId, mut clear_cb: C)
    where
        W: FnMut(PieceLocation, &mut Bitfield, &[FlushBlock], usize) -> usize,
        C: FnMut(JobQueue, ClearJob),
    {
        let mut guard = self.inner.lock();
        check_invariant(&guard);

        let first = PieceLocation::new(storage, 0);
        let last = PieceLocation::new(storage, u32::MAX);
        let locations: Vec<PieceLocation> =
            guard.pieces.range(first..=last).map(|(loc, _)| *loc).collect();

        for loc in locations {
            let CacheInner {
                pieces,
                flushing_blocks,
                ..
            } = &mut *guard;
            let Some(piece) = pieces.get_mut(&loc) else {
                continue;
            };
            // another thread is flushing this piece and may not flush it
            // completely; leave it behind rather than wait
            if piece.flushing {
                continue;
            }
            let num_blocks = count_jobs(&piece.blocks);
            if num_blocks == 0 {
                continue;
            }

            piece.flushing = true;
            *flushing_blocks += num_blocks;
            let hash_cursor = piece.hasher_cursor;
            let total = piece.blocks_in_piece;
            let span = collect_span(piece, 0, total);

            let mut bitmap = Bitfield::new(span.len());
            let count =
                MutexGuard::unlocked(&mut guard, || writer(loc, &mut bitmap, &span, hash_cursor));

            let CacheInner {
                pieces,
                dirty_blocks,
                flushing_blocks,
            } = &mut *guard;
            debug_assert!(*flushing_blocks >= num_blocks);
            *flushing_blocks -= num_blocks;
            let Some(piece) = pieces.get_mut(&loc) else {
                continue;
            };
            piece.flushing = false;
            apply_flushed(piece, 0, &bitmap, hash_cursor);
            piece.flushed_cursor = compute_flushed_cursor(&piece.blocks);
            debug_assert!(*dirty_blocks >= count);
            *dirty_blocks = dirty_blocks.saturating_sub(count);

            finish_parked_clear(&mut guard, loc, &mut clear_cb);

            let pieces = &mut guard.pieces;
            if let Some(piece) = pieces.get(&loc) {
                debug_assert!(!piece.flushing);
                debug_assert!(!piece.hashing);
                pieces.remove(&loc);
            }
        }
        debug!(?storage, "storage flushed and evicted");
    }

    /// Number of dirty blocks resident in the cache.
    pub fn size(&self) -> usize {
        let guard = self.inner.lock();
        check_invariant(&guard);
        guard.dirty_blocks
    }

    /// Number of blocks currently handed to writer callbacks.
    pub fn num_flushing(&self) -> usize {
        let guard = self.inner.lock();
        check_invariant(&guard);
        guard.flushing_blocks
    }
}

/// Snapshot of `num_blocks` block slots starting at `start`, cloning the
/// pending buffers so the writer can work on them with the lock released.
fn collect_span(piece: &CachedPiece, start: usize, num_blocks: usize) -> Vec<FlushBlock> {
    piece.blocks[start..start + num_blocks]
        .iter()
        .enumerate()
        .map(|(i, b)| FlushBlock {
            index: start + i,
            buf: b.write_job.as_ref().map(|j| j.buf.clone()),
        })
        .collect()
}

/// Applies the writer's bitmap: for every flushed block, the buffer moves
/// from the write job into `buf_holder`, and is dropped right away if the
/// hasher is already past it. `hash_cursor` is relative to the span start.
fn apply_flushed(piece: &mut CachedPiece, span_start: usize, bitmap: &Bitfield, hash_cursor: usize) {
    for i in 0..bitmap.len() {
        if !bitmap.get(i) {
            continue;
        }
        let blk = &mut piece.blocks[span_start + i];
        let Some(job) = blk.write_job.take() else {
            debug_assert!(blk.flushed_to_disk);
            continue;
        };
        blk.buf_holder = Some(job.buf);
        blk.flushed_to_disk = true;
        if i < hash_cursor {
            blk.buf_holder = None;
        }
    }
}

/// Runs a clear that was parked on a piece while it was flushing, then
/// hands the aborted writes and the parked job to the clear callback with
/// the lock released.
fn finish_parked_clear<C>(
    guard: &mut MutexGuard<'_, CacheInner>,
    loc: PieceLocation,
    clear_cb: &mut C,
) where
    C: FnMut(JobQueue, ClearJob),
{
    let CacheInner {
        pieces,
        dirty_blocks,
        ..
    } = &mut **guard;
    let Some(piece) = pieces.get_mut(&loc) else {
        return;
    };
    if piece.clear_piece.is_none() {
        return;
    }
    let mut aborted = JobQueue::new();
    clear_piece_impl(piece, dirty_blocks, &mut aborted);
    let Some(job) = piece.clear_piece.take() else {
        return;
    };
    MutexGuard::unlocked(guard, || clear_cb(aborted, job));
}

/// Aborts all pending writes and resets the piece's hash state. Requires
/// the lock to be held and the piece to be unpinned.
fn clear_piece_impl(piece: &mut CachedPiece, dirty_blocks: &mut usize, aborted: &mut JobQueue) {
    debug_assert!(!piece.flushing);
    debug_assert!(!piece.hashing);
    for blk in piece.blocks.iter_mut() {
        if let Some(job) = blk.write_job.take() {
            aborted.push(DiskJob::Write(job));
            blk.flushed_to_disk = false;
            *dirty_blocks -= 1;
        }
        blk.buf_holder = None;
    }
    piece.ready_to_flush = false;
    piece.piece_hash_returned = false;
    piece.hasher_cursor = 0;
    piece.flushed_cursor = 0;
    piece.ph = Sha1::new();
}

/// Cross-checks the container against the counters. Runs at the head of
/// every public operation in debug builds.
fn verify_invariants(inner: &CacheInner) {
    let mut dirty_blocks = 0;
    let mut flushing_blocks = 0;

    for (loc, piece) in &inner.pieces {
        assert!(piece.flushed_cursor <= piece.blocks_in_piece);
        assert!(piece.hasher_cursor <= piece.blocks_in_piece);
        if piece.flushing {
            flushing_blocks += piece.blocks_in_piece;
        }

        for (idx, blk) in piece.blocks.iter().enumerate() {
            if blk.write_job.is_some() {
                dirty_blocks += 1;
            }
            // a block holds either a write job or a buffer, never both
            assert!(
                !(blk.write_job.is_some() && blk.buf_holder.is_some()),
                "block {idx} of {loc:?} holds both a write job and a buffer"
            );

            if idx < piece.flushed_cursor {
                assert!(blk.write_job.is_none());
                assert!(blk.flushed_to_disk);
            } else if idx == piece.flushed_cursor {
                assert!(blk.buf_holder.is_none());
            }

            if piece.ready_to_flush {
                assert!(blk.write_job.is_some() || blk.flushed_to_disk);
            }
        }
    }

    assert_eq!(dirty_blocks, inner.dirty_blocks);
    // while blocks are in flight we only know the upper bound
    assert!(inner.flushing_blocks <= flushing_blocks);
}

fn check_invariant(inner: &CacheInner) {
    if cfg!(debug_assertions) {
        verify_invariants(inner);
    }
}

#[cfg(test)]
pub(crate) struct PieceState {
    pub blocks_in_piece: usize,
    pub hasher_cursor: usize,
    pub flushed_cursor: usize,
    pub ready_to_flush: bool,
    pub piece_hash_returned: bool,
    pub block_hashes: Vec<[u8; 32]>,
    pub resident: Vec<bool>,
    pub flushed: Vec<bool>,
}

#[cfg(test)]
impl DiskCache {
    pub(crate) fn assert_invariants(&self) {
        verify_invariants(&self.inner.lock());
    }

    pub(crate) fn num_pieces(&self) -> usize {
        self.inner.lock().pieces.len()
    }

    pub(crate) fn piece_state(&self, loc: PieceLocation) -> Option<PieceState> {
        let inner = self.inner.lock();
        inner.pieces.get(&loc).map(|p| PieceState {
            blocks_in_piece: p.blocks_in_piece,
            hasher_cursor: p.hasher_cursor,
            flushed_cursor: p.flushed_cursor,
            ready_to_flush: p.ready_to_flush,
            piece_hash_returned: p.piece_hash_returned,
            block_hashes: p.blocks.iter().map(|b| b.block_hash).collect(),
            resident: p.blocks.iter().map(|b| b.buf().is_some()).collect(),
            flushed: p.blocks.iter().map(|b| b.flushed_to_disk).collect(),
        })
    }
}

//! Fixed-capacity byte segments and the pool that recycles them.
//!
//! A [`Piece`] owns one `PIECE_CAPACITY` block and a window `[offset, offset + len)`
//! of valid bytes inside it. Dropping a piece hands its block back to the
//! [`PiecePool`] it came from, so pieces can travel freely between loop threads:
//! received on one worker, consumed and released on another.
//!
//! ```text
//!  block: [ headroom | valid bytes | tailroom ]
//!         0        offset      offset+len   PIECE_CAPACITY
//! ```
//!
//! The pool keeps idle blocks around for reuse but trims itself whenever the
//! idle count would exceed `in_use + POOL_SLACK`.

use std::{collections::VecDeque, fmt, mem, sync::Arc};

use parking_lot::Mutex;

/// Size of every block handed out by a [`PiecePool`].
pub const PIECE_CAPACITY: usize = 4096;

/// Idle blocks allowed on top of the number of blocks in use.
pub const POOL_SLACK: usize = 8;

/// Upper bound on blocks freed by a single release.
const MAX_TRIM: usize = 8;

struct PoolState {
    free: VecDeque<Box<[u8]>>,
    in_use: usize,
}

/// Snapshot of a pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub in_use: usize,
    pub idle: usize,
}

/// Thread-safe recycler of [`Piece`] blocks.
///
/// Cloning is cheap and yields a handle to the same pool. Applications
/// typically create one pool and pass it to every server and client through
/// their configs.
#[derive(Clone)]
pub struct PiecePool {
    state: Arc<Mutex<PoolState>>,
}

impl Default for PiecePool {
    fn default() -> Self {
        Self::new()
    }
}

impl PiecePool {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                free: VecDeque::new(),
                in_use: 0,
            })),
        }
    }

    /// Takes an empty piece (`offset == 0`, `len == 0`), reusing an idle block
    /// when one is available.
    pub fn acquire(&self) -> Piece {
        let reused = {
            let mut state = self.state.lock();
            state.in_use += 1;
            state.free.pop_front()
        };
        let block = reused.unwrap_or_else(|| vec![0u8; PIECE_CAPACITY].into_boxed_slice());
        Piece {
            block,
            offset: 0,
            len: 0,
            pool: self.clone(),
        }
    }

    /// Gives a piece back to the pool. Equivalent to dropping it.
    pub fn release(&self, piece: Piece) {
        debug_assert!(Arc::ptr_eq(&self.state, &piece.pool.state));
        drop(piece);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            in_use: state.in_use,
            idle: state.free.len(),
        }
    }

    fn recycle(&self, block: Box<[u8]>) {
        let trimmed = {
            let mut state = self.state.lock();
            assert!(state.in_use > 0, "piece released to a pool that lent none");
            state.in_use -= 1;

            let limit = state.in_use + POOL_SLACK;
            if state.free.len() < limit {
                state.free.push_back(block);
                return;
            }

            let count = (state.free.len() - limit + 1).min(MAX_TRIM);
            let mut trimmed = Vec::with_capacity(count);
            trimmed.push(block);
            for _ in 1..count {
                match state.free.pop_front() {
                    Some(block) => trimmed.push(block),
                    None => break,
                }
            }
            trimmed
        };
        // blocks are deallocated outside the lock
        drop(trimmed);
    }
}

impl fmt::Debug for PiecePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("PiecePool")
            .field("in_use", &stats.in_use)
            .field("idle", &stats.idle)
            .finish()
    }
}

/// One pooled block plus its window of valid bytes.
pub struct Piece {
    block: Box<[u8]>,
    offset: usize,
    len: usize,
    pool: PiecePool,
}

impl Piece {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.block.len()
    }

    /// Unused bytes in front of the valid window.
    pub fn headroom(&self) -> usize {
        self.offset
    }

    /// Unused bytes after the valid window.
    pub fn tailroom(&self) -> usize {
        self.block.len() - self.offset - self.len
    }

    pub fn data(&self) -> &[u8] {
        &self.block[self.offset..self.offset + self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.block[self.offset..self.offset + self.len]
    }

    /// The writable tail after the valid window. Bytes written here only become
    /// part of the piece after [`commit`](Self::commit).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let end = self.offset + self.len;
        &mut self.block[end..]
    }

    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.tailroom(), "commit past piece capacity");
        self.len += n;
    }

    pub fn uncommit(&mut self, n: usize) {
        assert!(n <= self.len, "uncommit more than the piece holds");
        self.len -= n;
    }

    /// Drops `n` bytes from the front of the window.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len, "consume more than the piece holds");
        self.offset += n;
        self.len -= n;
    }

    /// Reverts the last `n` consumed bytes.
    pub fn unconsume(&mut self, n: usize) {
        assert!(n <= self.offset, "unconsume past the start of the block");
        self.offset -= n;
        self.len += n;
    }

    /// Copies as much of `src` as fits into the tailroom, returning the count.
    pub fn extend_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.tailroom());
        let end = self.offset + self.len;
        self.block[end..end + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Moves the valid window to the start of the block.
    pub fn compact(&mut self) {
        if self.offset == 0 {
            return;
        }
        self.block.copy_within(self.offset..self.offset + self.len, 0);
        self.offset = 0;
    }

    /// Leaves `n` bytes of headroom in an empty piece.
    pub fn reserve_headroom(&mut self, n: usize) {
        assert!(self.len == 0, "headroom can only be reserved in an empty piece");
        assert!(n <= self.block.len(), "headroom larger than piece capacity");
        self.offset = n;
    }

    /// Writes `src` into the headroom directly in front of the window.
    pub fn prepend(&mut self, src: &[u8]) {
        assert!(
            src.len() <= self.offset,
            "prepend of {} bytes exceeds reserved headroom {}",
            src.len(),
            self.offset
        );
        self.offset -= src.len();
        self.len += src.len();
        self.block[self.offset..self.offset + src.len()].copy_from_slice(src);
    }

    /// The whole block, including headroom and tailroom.
    pub(crate) fn raw(&self) -> &[u8] {
        &self.block
    }
}

impl Drop for Piece {
    fn drop(&mut self) {
        let block = mem::take(&mut self.block);
        self.pool.recycle(block);
    }
}

impl fmt::Debug for Piece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Piece")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

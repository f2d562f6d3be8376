//! Segmented byte queue built from pooled [`Piece`]s.
//!
//! A [`Buffer`] is a FIFO of pieces plus a running byte count. Writes fill the
//! tail piece and pull new pieces from the pool; reads and skips drain the head
//! and hand exhausted pieces back. Nothing is ever copied into one contiguous
//! allocation unless the caller asks for it (`read_vec`, `read_all`, `to_vec`).
//!
//! Two zero-copy views let a serializer work directly on the piece memory:
//!
//! - [`InputView`] grants the valid bytes of the head piece one window at a
//!   time and detaches that piece from the buffer. `back_up(n)` returns the
//!   last `n` granted bytes; whatever is left over goes back to the buffer
//!   head when the view is dropped.
//! - [`OutputView`] grants the free tail of the last piece, counting it as
//!   written. `back_up(n)` gives back what the writer did not fill; dropping
//!   the view gives nothing back.
//!
//! Both views implement `std::io::Read` / `std::io::Write` on top of that
//! protocol.
//!
//! Calling `read`, `skip` or `peek` for more bytes than are buffered, or
//! `prepend` beyond the reserved headroom, is a programming error and panics.

use std::{collections::VecDeque, fmt, io, mem};

use crate::piece::{Piece, PiecePool, PIECE_CAPACITY};

pub struct Buffer {
    pieces: VecDeque<Piece>,
    len: usize,
    pool: PiecePool,
}

impl Buffer {
    pub fn new(pool: &PiecePool) -> Self {
        Self {
            pieces: VecDeque::new(),
            len: 0,
            pool: pool.clone(),
        }
    }

    pub fn pool(&self) -> &PiecePool {
        &self.pool
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Iterates over the valid window of each piece, head first.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.pieces.iter().map(Piece::data).filter(|c| !c.is_empty())
    }

    /// Copies the whole content without consuming it.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn clear(&mut self) {
        self.pieces.clear();
        self.len = 0;
    }

    pub fn write(&mut self, mut src: &[u8]) {
        while !src.is_empty() {
            let piece = self.writable_tail();
            let n = piece.extend_from(src);
            src = &src[n..];
            self.len += n;
        }
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write(&value.to_be_bytes());
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write(&value.to_be_bytes());
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write(&value.to_be_bytes());
    }

    /// Reserves `n` bytes of headroom so a header can later be prepended
    /// without moving the payload. The buffer must be empty.
    pub fn reserve_prepend(&mut self, n: usize) {
        assert!(self.len == 0, "reserve_prepend on a non-empty buffer");
        assert!(n < PIECE_CAPACITY, "prepend reservation of {n} bytes");
        self.pieces.clear();
        let mut piece = self.pool.acquire();
        piece.reserve_headroom(n);
        self.pieces.push_back(piece);
    }

    pub fn prepend(&mut self, src: &[u8]) {
        let Some(head) = self.pieces.front_mut() else {
            panic!("prepend of {} bytes exceeds reserved headroom 0", src.len());
        };
        head.prepend(src);
        self.len += src.len();
    }

    pub fn prepend_i32(&mut self, value: i32) {
        self.prepend(&value.to_be_bytes());
    }

    pub fn prepend_i16(&mut self, value: i16) {
        self.prepend(&value.to_be_bytes());
    }

    pub fn prepend_i8(&mut self, value: i8) {
        self.prepend(&value.to_be_bytes());
    }

    /// Copies `dst.len()` bytes from the head without consuming them.
    pub fn peek(&self, dst: &mut [u8]) {
        assert!(
            dst.len() <= self.len,
            "peek of {} bytes from a buffer holding {}",
            dst.len(),
            self.len
        );
        let mut filled = 0;
        for chunk in self.chunks() {
            if filled == dst.len() {
                break;
            }
            let n = chunk.len().min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&chunk[..n]);
            filled += n;
        }
    }

    pub fn peek_i32(&self) -> i32 {
        let mut raw = [0u8; 4];
        self.peek(&mut raw);
        i32::from_be_bytes(raw)
    }

    pub fn peek_i16(&self) -> i16 {
        let mut raw = [0u8; 2];
        self.peek(&mut raw);
        i16::from_be_bytes(raw)
    }

    pub fn peek_i8(&self) -> i8 {
        let mut raw = [0u8; 1];
        self.peek(&mut raw);
        i8::from_be_bytes(raw)
    }

    /// Moves `dst.len()` bytes out of the head of the buffer.
    pub fn read(&mut self, dst: &mut [u8]) {
        self.peek(dst);
        self.skip(dst.len());
    }

    pub fn read_i32(&mut self) -> i32 {
        let value = self.peek_i32();
        self.skip(4);
        value
    }

    pub fn read_i16(&mut self) -> i16 {
        let value = self.peek_i16();
        self.skip(2);
        value
    }

    pub fn read_i8(&mut self) -> i8 {
        let value = self.peek_i8();
        self.skip(1);
        value
    }

    pub fn read_vec(&mut self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        self.read(&mut out);
        out
    }

    pub fn read_all(&mut self) -> Vec<u8> {
        let out = self.to_vec();
        self.clear();
        out
    }

    /// Discards `n` bytes from the head, releasing drained pieces.
    pub fn skip(&mut self, mut n: usize) {
        assert!(
            n <= self.len,
            "skip of {n} bytes from a buffer holding {}",
            self.len
        );
        self.len -= n;
        while n > 0 {
            let Some(head) = self.pieces.front_mut() else {
                break;
            };
            let step = head.len().min(n);
            head.consume(step);
            n -= step;
            if head.is_empty() {
                self.pieces.pop_front();
            }
        }
        if self.len == 0 {
            self.pieces.clear();
        }
    }

    /// Moves `n` bytes into `dst`, handing over whole pieces where possible.
    pub fn read_into(&mut self, mut n: usize, dst: &mut Buffer) {
        assert!(
            n <= self.len,
            "read of {n} bytes from a buffer holding {}",
            self.len
        );
        while n > 0 {
            let Some(head) = self.pieces.front_mut() else {
                break;
            };
            if head.is_empty() {
                self.pieces.pop_front();
                continue;
            }
            if head.len() <= n {
                if let Some(piece) = self.pieces.pop_front() {
                    n -= piece.len();
                    self.len -= piece.len();
                    dst.append_piece(piece);
                }
            } else {
                dst.write(&head.data()[..n]);
                head.consume(n);
                self.len -= n;
                n = 0;
            }
        }
    }

    /// Takes the whole piece chain, leaving this buffer empty.
    pub fn detach(&mut self) -> Buffer {
        let pieces = mem::take(&mut self.pieces);
        let len = mem::replace(&mut self.len, 0);
        Buffer {
            pieces,
            len,
            pool: self.pool.clone(),
        }
    }

    /// Appends every piece of `other` to the tail.
    pub fn append(&mut self, other: Buffer) {
        let Buffer { pieces, len, .. } = other;
        self.len += len;
        self.pieces
            .extend(pieces.into_iter().filter(|piece| !piece.is_empty()));
    }

    /// Appends one piece, merging it into the tail piece when it fits there.
    pub fn append_piece(&mut self, piece: Piece) {
        let n = piece.len();
        if n == 0 {
            return;
        }
        if let Some(tail) = self.pieces.back_mut() {
            if tail.tailroom() < n && tail.headroom() + tail.tailroom() >= n {
                tail.compact();
            }
            if tail.tailroom() >= n {
                tail.extend_from(piece.data());
                self.len += n;
                return;
            }
        }
        self.len += n;
        self.pieces.push_back(piece);
    }

    /// Pops the head piece, folding following pieces into it while they fit.
    /// Used to batch several small sends into one write.
    pub fn pop_coalesced(&mut self) -> Option<Piece> {
        let mut head = loop {
            let piece = self.pieces.pop_front()?;
            if !piece.is_empty() {
                break piece;
            }
        };
        while let Some(next) = self.pieces.front() {
            if next.len() > head.headroom() + head.tailroom() {
                break;
            }
            if head.tailroom() < next.len() {
                head.compact();
            }
            if let Some(next) = self.pieces.pop_front() {
                head.extend_from(next.data());
            }
        }
        self.len -= head.len();
        if self.len == 0 {
            self.pieces.clear();
        }
        Some(head)
    }

    /// Puts an unread remainder back in front of the buffer.
    pub(crate) fn push_front_piece(&mut self, piece: Piece) {
        if piece.is_empty() {
            return;
        }
        self.len += piece.len();
        self.pieces.push_front(piece);
    }

    /// Read view over at most `limit` bytes from the head.
    pub fn input_view(&mut self, limit: usize) -> InputView<'_> {
        let limit = limit.min(self.len);
        InputView {
            buffer: self,
            current: None,
            remaining: limit,
            last_grant: 0,
            byte_count: 0,
        }
    }

    pub fn output_view(&mut self) -> OutputView<'_> {
        let start_len = self.len;
        OutputView {
            buffer: self,
            start_len,
            last_grant: 0,
        }
    }

    fn writable_tail(&mut self) -> &mut Piece {
        if self.pieces.back().map_or(true, |tail| tail.tailroom() == 0) {
            self.pieces.push_back(self.pool.acquire());
        }
        let last = self.pieces.len() - 1;
        &mut self.pieces[last]
    }

    /// Commits the whole free tail of the last piece and returns it.
    fn grant_tail(&mut self) -> &mut [u8] {
        if self.pieces.back().map_or(true, |tail| tail.tailroom() == 0) {
            self.pieces.push_back(self.pool.acquire());
        }
        let last = self.pieces.len() - 1;
        let piece = &mut self.pieces[last];
        let n = piece.tailroom();
        piece.commit(n);
        self.len += n;
        let data = piece.data_mut();
        let start = data.len() - n;
        &mut data[start..]
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("pieces", &self.pieces.len())
            .finish()
    }
}

/// Zero-copy reader over the head of a [`Buffer`].
pub struct InputView<'a> {
    buffer: &'a mut Buffer,
    current: Option<Piece>,
    remaining: usize,
    last_grant: usize,
    byte_count: usize,
}

impl InputView<'_> {
    /// Grants the next window of readable bytes, or `None` once the limit or
    /// the buffer is exhausted.
    pub fn next(&mut self) -> Option<&[u8]> {
        loop {
            if self.remaining == 0 {
                self.last_grant = 0;
                return None;
            }
            let empty = self.current.as_ref().map_or(true, Piece::is_empty);
            if !empty {
                break;
            }
            let piece = self.buffer.pieces.pop_front()?;
            self.buffer.len -= piece.len();
            self.current = Some(piece);
        }

        let piece = self.current.as_mut()?;
        let n = piece.len().min(self.remaining);
        let start = piece.headroom();
        piece.consume(n);
        self.remaining -= n;
        self.byte_count += n;
        self.last_grant = n;
        Some(&piece.raw()[start..start + n])
    }

    /// Returns the last `count` bytes of the previous grant.
    pub fn back_up(&mut self, count: usize) {
        assert!(
            count <= self.last_grant,
            "back_up of {count} bytes after a grant of {}",
            self.last_grant
        );
        if count == 0 {
            return;
        }
        if let Some(piece) = self.current.as_mut() {
            piece.unconsume(count);
        }
        self.last_grant -= count;
        self.remaining += count;
        self.byte_count -= count;
    }

    /// Bytes consumed through this view so far.
    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    /// Bytes still readable through this view.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl io::Read for InputView<'_> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let Some(window) = self.next() else {
            return Ok(0);
        };
        let n = window.len().min(dst.len());
        dst[..n].copy_from_slice(&window[..n]);
        let unused = self.last_grant - n;
        self.back_up(unused);
        Ok(n)
    }
}

impl Drop for InputView<'_> {
    fn drop(&mut self) {
        if let Some(piece) = self.current.take() {
            self.buffer.push_front_piece(piece);
        }
    }
}

/// Zero-copy writer over the tail of a [`Buffer`].
pub struct OutputView<'a> {
    buffer: &'a mut Buffer,
    start_len: usize,
    last_grant: usize,
}

impl OutputView<'_> {
    /// Grants the free tail of the last piece (allocating one when full) and
    /// counts all of it as written.
    pub fn next(&mut self) -> &mut [u8] {
        let window = self.buffer.grant_tail();
        self.last_grant = window.len();
        window
    }

    /// Gives back the last `count` bytes of the previous grant.
    pub fn back_up(&mut self, count: usize) {
        assert!(
            count <= self.last_grant,
            "back_up of {count} bytes after a grant of {}",
            self.last_grant
        );
        if count == 0 {
            return;
        }
        if let Some(tail) = self.buffer.pieces.back_mut() {
            tail.uncommit(count);
        }
        self.buffer.len -= count;
        self.last_grant -= count;
    }

    /// Bytes written through this view so far.
    pub fn byte_count(&self) -> usize {
        self.buffer.len - self.start_len
    }
}

impl io::Write for OutputView<'_> {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < src.len() {
            let window = self.next();
            let n = window.len().min(src.len() - written);
            window[..n].copy_from_slice(&src[written..written + n]);
            written += n;
            let unused = self.last_grant - n;
            self.back_up(unused);
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

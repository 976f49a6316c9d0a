//! A seekable queue of sample chunks, addressed in bytes.
//!
//! Backs the per-stream render queue on the playback side and the delay
//! queue on the capture side. Read and write cursors are independent;
//! regions never written to (holes left by seeking) read back as silence,
//! and already-read data is retained up to `max_rewind` bytes so the read
//! cursor can move backwards during a rewind.

use std::collections::VecDeque;

use crate::memblock::MemChunk;

/// A byte-addressed queue of [`MemChunk`]s.
#[derive(Debug)]
pub struct MemBlockQ {
    /// Queued chunks tagged with their absolute byte offset, in offset order.
    items: VecDeque<(i64, MemChunk)>,
    read_index: i64,
    write_index: i64,
    max_rewind: usize,
}

impl Default for MemBlockQ {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBlockQ {
    /// Creates an empty queue with both cursors at zero.
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            read_index: 0,
            write_index: 0,
            max_rewind: 0,
        }
    }

    /// The number of unread bytes between the cursors.
    pub fn length(&self) -> usize {
        (self.write_index - self.read_index).max(0) as usize
    }

    /// The absolute read cursor.
    pub fn read_index(&self) -> i64 {
        self.read_index
    }

    /// The absolute write cursor.
    pub fn write_index(&self) -> i64 {
        self.write_index
    }

    /// How far back the read cursor may be rewound.
    pub fn max_rewind(&self) -> usize {
        self.max_rewind
    }

    /// Sets the rewind history budget and prunes excess history.
    pub fn set_max_rewind(&mut self, max_rewind: usize) {
        self.max_rewind = max_rewind;
        self.prune();
    }

    /// Appends a chunk at the write cursor.
    pub fn push(&mut self, chunk: MemChunk) {
        if chunk.length == 0 {
            return;
        }

        // A backward seek may have left items past the write cursor; they are
        // superseded by the new data.
        self.truncate_after(self.write_index);

        self.items.push_back((self.write_index, chunk.clone()));
        self.write_index += chunk.length as i64;
    }

    /// Returns the data at the read cursor without consuming it: the next
    /// contiguous chunk, or a silence chunk covering the hole before the next
    /// written region. Returns `None` if the queue is empty.
    pub fn peek(&self) -> Option<MemChunk> {
        if self.length() == 0 {
            return None;
        }

        for (offset, chunk) in self.items.iter() {
            let end = offset + chunk.length as i64;
            if end <= self.read_index {
                continue;
            }

            if *offset <= self.read_index {
                // The read cursor is inside this chunk.
                let skip = (self.read_index - offset) as usize;
                let mut piece = chunk.clone();
                piece.index += skip;
                piece.length -= skip;
                piece.length = piece.length.min(self.length());
                return Some(piece);
            }

            // There is a hole before the next chunk.
            let hole = (*offset - self.read_index) as usize;
            return Some(MemChunk::silence(hole.min(self.length())));
        }

        // Nothing written between the cursors at all.
        Some(MemChunk::silence(self.length()))
    }

    /// Consumes and returns up to `max` bytes from the read cursor.
    pub fn pop(&mut self, max: usize) -> Option<MemChunk> {
        let mut chunk = self.peek()?;
        if chunk.length > max {
            chunk.length = max;
        }
        self.drop_bytes(chunk.length);
        Some(chunk)
    }

    /// Advances the read cursor by `n` bytes.
    pub fn drop_bytes(&mut self, n: usize) {
        self.read_index += n as i64;
        self.prune();
    }

    /// Moves the read cursor backwards by up to `n` bytes, limited by the
    /// retained history. Returns the actual distance moved.
    pub fn rewind(&mut self, n: usize) -> usize {
        let floor = self.history_floor();
        let possible = (self.read_index - floor).max(0) as usize;
        let n = n.min(possible);
        self.read_index -= n as i64;
        n
    }

    /// Moves the write cursor by `offset` bytes.
    ///
    /// Seeking forward leaves a hole that reads back as silence; seeking
    /// backward drops the data past the new cursor so it can be rewritten.
    pub fn seek_write(&mut self, offset: i64) {
        self.write_index += offset;
        if offset < 0 {
            self.truncate_after(self.write_index);
        }
        if self.write_index < self.read_index {
            self.write_index = self.read_index;
        }
    }

    /// Drops all unread data, leaving the read cursor in place.
    pub fn flush_write(&mut self) {
        self.truncate_after(self.read_index);
        self.write_index = self.read_index;
    }

    /// Replaces everything between the cursors with silence.
    ///
    /// Cursors do not move, so subsequent peeks return silence rather than
    /// stale (or rewound-into) data.
    pub fn silence(&mut self) {
        self.items.clear();
    }

    fn history_floor(&self) -> i64 {
        self.items
            .front()
            .map(|(offset, _)| *offset)
            .unwrap_or(self.read_index)
            .max(self.read_index - self.max_rewind as i64)
    }

    fn prune(&mut self) {
        let keep_from = self.read_index - self.max_rewind as i64;
        while let Some((offset, chunk)) = self.items.front() {
            if offset + chunk.length as i64 <= keep_from {
                self.items.pop_front();
            } else {
                break;
            }
        }
    }

    fn truncate_after(&mut self, at: i64) {
        while let Some((offset, chunk)) = self.items.back_mut() {
            if *offset >= at {
                self.items.pop_back();
            } else if *offset + chunk.length as i64 > at {
                chunk.length = (at - *offset) as usize;
                break;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(bytes: &[u8]) -> MemChunk {
        MemChunk::from_vec(bytes.to_vec())
    }

    #[test]
    fn push_peek_drop() {
        let mut q = MemBlockQ::new();
        q.push(chunk(&[1, 2, 3]));
        q.push(chunk(&[4, 5]));
        assert_eq!(q.length(), 5);

        let head = q.peek().unwrap();
        assert_eq!(head.as_slice(), &[1, 2, 3]);

        q.drop_bytes(4);
        let head = q.peek().unwrap();
        assert_eq!(head.as_slice(), &[5]);
        q.drop_bytes(1);
        assert!(q.peek().is_none());
    }

    #[test]
    fn holes_read_as_silence() {
        let mut q = MemBlockQ::new();
        q.push(chunk(&[1, 2]));
        q.seek_write(3);
        q.push(chunk(&[9]));

        q.drop_bytes(2);
        let hole = q.peek().unwrap();
        assert_eq!(hole.as_slice(), &[0, 0, 0]);
        q.drop_bytes(3);
        assert_eq!(q.peek().unwrap().as_slice(), &[9]);
    }

    #[test]
    fn rewind_respects_history_budget() {
        let mut q = MemBlockQ::new();
        q.set_max_rewind(2);
        q.push(chunk(&[1, 2, 3, 4]));
        q.drop_bytes(4);

        assert_eq!(q.rewind(10), 2);
        assert_eq!(q.peek().unwrap().as_slice(), &[3, 4]);
    }

    #[test]
    fn backward_seek_drops_superseded_data() {
        let mut q = MemBlockQ::new();
        q.push(chunk(&[1, 2, 3, 4]));
        q.seek_write(-2);
        q.push(chunk(&[9, 9]));

        let head = q.peek().unwrap();
        assert_eq!(head.as_slice(), &[1, 2]);
        q.drop_bytes(2);
        assert_eq!(q.peek().unwrap().as_slice(), &[9, 9]);
    }

    #[test]
    fn silence_keeps_cursors() {
        let mut q = MemBlockQ::new();
        q.push(chunk(&[1, 2, 3]));
        q.silence();
        assert_eq!(q.length(), 3);
        assert_eq!(q.peek().unwrap().as_slice(), &[0, 0, 0]);
    }
}

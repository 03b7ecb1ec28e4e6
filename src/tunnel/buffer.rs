//! Bounded per-direction byte buffer

use bytes::Bytes;
use std::collections::VecDeque;

/// Bytes waiting for the next stage of a circuit.
///
/// The buffer itself never refuses a push; `has_room` is the signal callers
/// use to stop producing (pause socket reads, stop draining the session).
#[derive(Debug)]
pub struct BackpressureBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
    limit: usize,
}

impl BackpressureBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space before the limit
    pub fn room(&self) -> usize {
        self.limit.saturating_sub(self.len)
    }

    /// True while producers may keep adding bytes
    pub fn has_room(&self) -> bool {
        self.len < self.limit
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Offer buffered chunks, oldest first, to `sink`.
    ///
    /// `sink` returns how many bytes of the chunk it took. A short take
    /// stops the drain and keeps the rest for the next call. Returns the
    /// total number of bytes taken.
    pub fn drain_into(&mut self, mut sink: impl FnMut(&Bytes) -> usize) -> usize {
        let mut total = 0;
        while let Some(front) = self.chunks.front_mut() {
            let taken = sink(front).min(front.len());
            total += taken;
            self.len -= taken;
            if taken == front.len() {
                self.chunks.pop_front();
            } else {
                *front = front.slice(taken..);
                break;
            }
        }
        total
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

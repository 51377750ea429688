use bytes::{Buf, Bytes};
use std::collections::VecDeque;

/// Segmented byte buffer.
///
/// Socket input accumulates here as it arrives: each read lands in its own
/// [`Bytes`] segment and no segment is ever re-copied to make the whole
/// thing contiguous. Consumers walk the segments in order via [`chunks`]
/// and discard what they have parsed with [`consume`].
///
/// [`chunks`]: ChunkList::chunks
/// [`consume`]: ChunkList::consume
#[derive(Debug, Default)]
pub struct ChunkList {
    segs: VecDeque<Bytes>,
    len: usize,
}

impl ChunkList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total buffered bytes across all segments.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a segment. Empty segments are dropped on the floor.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.segs.push_back(chunk);
    }

    /// Copies `data` into a fresh segment at the tail.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.push(Bytes::copy_from_slice(data));
    }

    /// Iterates the segments front to back. Each item is one contiguous
    /// run of bytes; the sequence is finite and non-destructive.
    pub fn chunks(&self) -> impl Iterator<Item = &Bytes> {
        self.segs.iter()
    }

    /// Cheap (reference-counted) clones of all segments, front to back.
    pub fn to_bytes_vec(&self) -> Vec<Bytes> {
        self.segs.iter().cloned().collect()
    }

    /// Drops `n` bytes from the front, splitting a segment if the cut
    /// lands inside one. Returns the number actually dropped, which is
    /// smaller than `n` only if the buffer ran out.
    pub fn consume(&mut self, n: usize) -> usize {
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.segs.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.segs.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }
        let consumed = n - remaining;
        self.len -= consumed;
        consumed
    }

    pub fn clear(&mut self) {
        self.segs.clear();
        self.len = 0;
    }

    /// Flattens the buffered bytes into one `Vec`. Test and debugging
    /// helper; the hot paths never need contiguous storage.
    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in &self.segs {
            out.extend_from_slice(seg);
        }
        out
    }
}

//! Fixed-capacity circular byte buffer.
//!
//! A [`StreamBuffer`] serves as either a send queue or a receive queue, never
//! both:
//! - **send**: the application [`write`](StreamBuffer::write)s bytes, the
//!   socket slices them into segments with
//!   [`extract_window`](StreamBuffer::extract_window), and cumulative ACKs
//!   release them with [`advance_base`](StreamBuffer::advance_base).
//! - **receive**: in-order segments are appended with
//!   [`write_segment`](StreamBuffer::write_segment) and the application
//!   [`read`](StreamBuffer::read)s them out.
//!
//! # Layout
//!
//! ```text
//!        base                      end
//!         │                         │
//!  ───────┼─────── used ────────────┼──── available ───┼─ 1 spare ─
//!         │<───── buffered bytes ──▶│                   (full != empty)
//! ```
//!
//! One slot is always kept free so that `base == end` means empty:
//! `used + available == capacity - 1`.
//!
//! Sequence numbers map onto offsets as `(seq - orig_seq) mod capacity`, where
//! `orig_seq` is the number of the first byte ever written.  The
//! buffer tracks the sequence number of the byte at `base` so that the mapping
//! keeps working when 32-bit sequence numbers wrap.

use crate::segment::{Segment, SegmentKind};

#[derive(Debug)]
pub struct StreamBuffer {
    data: Box<[u8]>,
    /// Index of the first unconsumed (receive) or unacknowledged (send) byte.
    base: usize,
    /// Index just past the last written byte.
    end: usize,
    /// Sequence number of the byte at `base`.
    base_seq: u32,
    /// Congestion window in bytes; only meaningful on the send side.
    cwnd: u32,
    mss: usize,
}

impl StreamBuffer {
    /// # Panics
    ///
    /// Panics if `capacity < 2` (one slot is reserved) or `mss == 0`.
    pub fn new(capacity: usize, mss: usize, cwnd: u32, orig_seq: u32) -> Self {
        assert!(capacity >= 2, "stream buffer capacity must be at least 2");
        assert!(mss >= 1, "mss must be at least 1");
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            base: 0,
            end: 0,
            base_seq: orig_seq,
            cwnd,
            mss,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of buffered bytes between `base` and `end`.
    pub fn used(&self) -> usize {
        (self.end + self.capacity() - self.base) % self.capacity()
    }

    /// Bytes that can still be written before the buffer is full.
    pub fn available(&self) -> usize {
        self.capacity() - self.used() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.base == self.end
    }

    /// Full when writing one more byte would make `end` equal `base`.
    pub fn is_full(&self) -> bool {
        (self.end + 1) % self.capacity() == self.base
    }

    /// Sequence number of the byte at `base`.
    pub fn base_seq(&self) -> u32 {
        self.base_seq
    }

    /// Sequence number just past the last written byte.
    pub fn end_seq(&self) -> u32 {
        self.base_seq.wrapping_add(self.used() as u32)
    }

    pub fn congestion_window(&self) -> u32 {
        self.cwnd
    }

    pub fn set_congestion_window(&mut self, cwnd: u32) {
        self.cwnd = cwnd;
    }

    /// Buffer offset of `seq`, or `None` when `seq` lies outside
    /// `[base_seq, end_seq]`.
    pub fn offset_of(&self, seq: u32) -> Option<usize> {
        self.distance(seq)
            .map(|d| (self.base + d) % self.capacity())
    }

    /// Append as many bytes of `bytes` as fit.  Returns the count written,
    /// `0` when the buffer is full.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.available());
        let cap = self.capacity();
        let first = n.min(cap - self.end);
        self.data[self.end..self.end + first].copy_from_slice(&bytes[..first]);
        self.data[..n - first].copy_from_slice(&bytes[first..n]);
        self.end = (self.end + n) % cap;
        n
    }

    /// Remove up to `out.len()` bytes from `base` into `out`.  Returns the
    /// count read, `0` when the buffer is empty.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.used());
        let chunk = self.copy_out(self.base, n);
        out[..n].copy_from_slice(&chunk);
        self.base = (self.base + n) % self.capacity();
        self.base_seq = self.base_seq.wrapping_add(n as u32);
        n
    }

    /// Write a segment's whole payload, or nothing.
    ///
    /// Returns `None` without touching the buffer when the payload does not
    /// fit; the caller drops the segment unacknowledged so the peer retries.
    pub fn write_segment(&mut self, segment: &Segment) -> Option<usize> {
        if self.available() < segment.payload.len() {
            return None;
        }
        Some(self.write(&segment.payload))
    }

    /// Slice the buffered bytes starting at `seq_start` into DATA segments.
    ///
    /// At most `min(receiver_window, used, cwnd)` bytes are covered, cut into
    /// MSS-sized segments (the last one may be shorter) with consecutive
    /// sequence numbers.  Returns an empty vector when there is nothing to
    /// send or `seq_start` lies outside the buffered range.
    pub fn extract_window(
        &self,
        src_port: u16,
        dst_port: u16,
        seq_start: u32,
        receiver_window: u32,
    ) -> Vec<Segment> {
        let (Some(skip), Some(start)) = (self.distance(seq_start), self.offset_of(seq_start))
        else {
            return Vec::new();
        };
        let pending = self.used() - skip;
        let to_send = pending
            .min(self.cwnd as usize)
            .min(receiver_window as usize);

        let mut segments = Vec::with_capacity(to_send.div_ceil(self.mss));
        let mut offset = 0;
        while offset < to_send {
            let len = self.mss.min(to_send - offset);
            segments.push(Segment {
                src_port,
                dst_port,
                kind: SegmentKind::Data,
                window: self.cwnd,
                seq: seq_start.wrapping_add(offset as u32),
                payload: self.copy_out((start + offset) % self.capacity(), len),
            });
            offset += len;
        }
        segments
    }

    /// Release every byte before `ack_seq`.  Returns how many bytes were
    /// released; `ack_seq` values behind `base` or past `end` release nothing.
    pub fn advance_base(&mut self, ack_seq: u32) -> usize {
        let Some(released) = self.distance(ack_seq) else {
            return 0;
        };
        self.base = (self.base + released) % self.capacity();
        self.base_seq = ack_seq;
        released
    }

    /// Drop everything still buffered.
    pub fn clear(&mut self) {
        self.base_seq = self.end_seq();
        self.base = self.end;
    }

    /// Distance of `seq` from `base_seq`, if it lies within the buffered range.
    fn distance(&self, seq: u32) -> Option<usize> {
        let d = seq.wrapping_sub(self.base_seq) as usize;
        (d <= self.used()).then_some(d)
    }

    /// Copy `len` bytes starting at buffer offset `start`, wrapping at the end.
    fn copy_out(&self, start: usize, len: usize) -> Vec<u8> {
        let cap = self.capacity();
        let first = len.min(cap - start);
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&self.data[start..start + first]);
        out.extend_from_slice(&self.data[..len - first]);
        out
    }
}

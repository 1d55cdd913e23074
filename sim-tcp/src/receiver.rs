//! Receive-side in-order delivery.
//!
//! [`Receiver`] accepts only the segment whose `seq` equals `rcv_nxt`:
//!
//! - Out-of-order or duplicate segments are discarded; the caller re-sends
//!   the unchanged [`ack_number`](Receiver::ack_number) so the sender sees
//!   a duplicate ACK.  There is no reordering buffer.
//! - An in-order segment that does not fit in the receive buffer is dropped
//!   whole and *not* acknowledged; the sender's window timer retries it.
//!
//! This module only manages state; all I/O is the caller's responsibility.

use crate::buffer::StreamBuffer;
use crate::config::Config;
use crate::segment::Segment;

/// What happened to an inbound DATA segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Appended to the receive buffer; carries the payload length.
    Accepted(usize),
    /// `seq` did not match `rcv_nxt`.
    OutOfOrder,
    /// In order, but the receive buffer lacks room for the whole payload.
    NoRoom,
}

#[derive(Debug)]
pub struct Receiver {
    buffer: StreamBuffer,
    /// Next expected sequence number.
    rcv_nxt: u32,
}

impl Receiver {
    /// `peer_isn` is the sequence number carried by the peer's SYN (or
    /// SYN-ACK); the first data byte is `peer_isn + 1`.
    pub fn new(config: &Config, peer_isn: u32) -> Self {
        let first = peer_isn.wrapping_add(1);
        Self {
            buffer: StreamBuffer::new(config.buffer_size, config.mss, 0, first),
            rcv_nxt: first,
        }
    }

    pub fn on_segment(&mut self, segment: &Segment) -> Delivery {
        if segment.seq != self.rcv_nxt {
            return Delivery::OutOfOrder;
        }
        match self.buffer.write_segment(segment) {
            Some(n) => {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(n as u32);
                Delivery::Accepted(n)
            }
            None => Delivery::NoRoom,
        }
    }

    /// Cumulative ACK number: every byte before it has been received.
    pub fn ack_number(&self) -> u32 {
        self.rcv_nxt
    }

    /// Free receive space to advertise.
    pub fn window(&self) -> u32 {
        self.buffer.available() as u32
    }

    /// Bytes waiting for the application.
    pub fn readable(&self) -> usize {
        self.buffer.used()
    }

    pub fn read(&mut self, out: &mut [u8]) -> usize {
        self.buffer.read(out)
    }
}

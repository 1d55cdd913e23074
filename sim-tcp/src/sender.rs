//! Send-side sequence state for one connection.
//!
//! [`Sender`] owns the send buffer, the congestion controller and the RTT
//! estimator.  It decides *what* to transmit; the socket decides *when* and
//! does the actual sending and timer arming.
//!
//! # Sequence-number layout
//!
//! ```text
//!  snd_una            win_end         snd_max          buffer end
//!     │                  │               │                  │
//!  ───┼──────────────────┼───────────────┼──────────────────┼──▶ seq space
//!     │ <─ current window ─▶│              │ <── not yet sent ─▶
//! ```
//!
//! Windows are sent whole.  A new window goes out only when the previous one
//! is completely acknowledged, or when the window timer fires and the whole
//! unacknowledged window is resent from `snd_una` (go back to N).

use std::time::Duration;

use crate::buffer::StreamBuffer;
use crate::config::Config;
use crate::congestion::{CongestionControl, CongestionState};
use crate::segment::Segment;
use crate::timer::RttEstimator;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Returns `true` when sequence number `a` is ≤ `b` in wrap-around space.
///
/// The comparison works correctly as long as the two values are less than
/// `u32::MAX / 2` apart, which is always the case for a bounded buffer.
#[inline]
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= (u32::MAX / 2)
}

/// Returns `true` when sequence number `a` is strictly before `b`.
#[inline]
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    a != b && seq_le(a, b)
}

// ---------------------------------------------------------------------------
// Flight / AckOutcome
// ---------------------------------------------------------------------------

/// One window's worth of DATA segments, ready to transmit.
#[derive(Debug, Clone)]
pub struct Flight {
    pub segments: Vec<Segment>,
    /// How long to wait for the whole window to be acknowledged.
    pub timeout: Duration,
    /// Tag for the window timer; a timer carrying an older generation is stale.
    pub generation: u64,
    /// `true` when this flight resends bytes that were already sent.
    pub retransmit: bool,
}

/// What a cumulative ACK did to the send state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ACK fell behind `snd_una`.
    Duplicate,
    /// The ACK acknowledged bytes that were never sent.
    Ignored,
    /// The ACK was accepted.  `window_complete` is set once everything up to
    /// the end of the current window is acknowledged.
    Advanced { bytes: usize, window_complete: bool },
}

#[derive(Debug, Clone, Copy)]
struct RttSample {
    sent_at: Duration,
    expected_ack: u32,
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Sender {
    buffer: StreamBuffer,
    isn: u32,
    /// Oldest unacknowledged sequence number.
    snd_una: u32,
    /// End of the most recently transmitted window.
    win_end: u32,
    /// Highest sequence number ever transmitted (exclusive).
    snd_max: u32,
    /// Receiver's last advertised free space.
    rwnd: u32,
    congestion: CongestionControl,
    rtt: RttEstimator,
    sample: Option<RttSample>,
    generation: u64,
}

impl Sender {
    /// Create the send side of a connection whose SYN carried `isn`.  The
    /// first data byte is `isn + 1`.
    pub fn new(config: &Config, isn: u32, rwnd: u32) -> Self {
        let first = isn.wrapping_add(1);
        let mss = config.mss as u32;
        Self {
            buffer: StreamBuffer::new(config.buffer_size, config.mss, mss, first),
            isn,
            snd_una: first,
            win_end: first,
            snd_max: first,
            rwnd,
            congestion: CongestionControl::new(mss, config.buffer_size as u32),
            rtt: RttEstimator::new(&config.timers),
            sample: None,
            generation: 0,
        }
    }

    pub fn isn(&self) -> u32 {
        self.isn
    }

    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    pub fn snd_max(&self) -> u32 {
        self.snd_max
    }

    /// Sequence number just past the last byte written by the application.
    pub fn end_seq(&self) -> u32 {
        self.buffer.end_seq()
    }

    pub fn rwnd(&self) -> u32 {
        self.rwnd
    }

    pub fn cwnd(&self) -> u32 {
        self.congestion.cwnd()
    }

    pub fn ssthresh(&self) -> u32 {
        self.congestion.ssthresh()
    }

    pub fn congestion_state(&self) -> CongestionState {
        self.congestion.state()
    }

    pub fn rto(&self) -> Duration {
        self.rtt.timeout()
    }

    /// Bytes written but not yet acknowledged.
    pub fn buffered(&self) -> usize {
        self.buffer.used()
    }

    /// Nothing is in flight.
    pub fn is_idle(&self) -> bool {
        !seq_lt(self.snd_una, self.win_end)
    }

    /// Every written byte has been acknowledged.
    pub fn is_drained(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn set_receiver_window(&mut self, rwnd: u32) {
        self.rwnd = rwnd;
    }

    /// Queue application bytes.  Returns how many fit.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.buffer.write(data)
    }

    /// Slice the next window starting at `snd_una`.
    ///
    /// The window is `min(rwnd, cwnd)` bytes; a zero receiver window is
    /// treated as one byte so the probe's ACK can reopen it.  Returns `None`
    /// when there is nothing to send.
    pub fn next_window(&mut self, src_port: u16, dst_port: u16, now: Duration) -> Option<Flight> {
        // A collapsed congestion window still lets one byte through.
        self.buffer.set_congestion_window(self.congestion.cwnd().max(1));
        let segments = self
            .buffer
            .extract_window(src_port, dst_port, self.snd_una, self.rwnd.max(1));
        let first = segments.first()?;
        let end = segments.last().map_or(first.end_seq(), Segment::end_seq);

        let retransmit = seq_lt(self.snd_una, self.win_end);
        // Only a fresh window may be timed; a resent one would confuse the sample.
        self.sample = (!retransmit).then_some(RttSample {
            sent_at: now,
            expected_ack: first.end_seq(),
        });

        self.generation += 1;
        self.win_end = end;
        if seq_lt(self.snd_max, end) {
            self.snd_max = end;
        }

        log::trace!(
            "[snd] window {}..{} segs={} cwnd={} rwnd={} retransmit={}",
            self.snd_una,
            end,
            segments.len(),
            self.congestion.cwnd(),
            self.rwnd,
            retransmit
        );

        let timeout = self.flight_timeout(segments.len());
        Some(Flight {
            segments,
            timeout,
            generation: self.generation,
            retransmit,
        })
    }

    /// Process a cumulative ACK for `ack` advertising `window` free bytes.
    pub fn on_ack(&mut self, ack: u32, window: u32, now: Duration) -> AckOutcome {
        if seq_lt(ack, self.snd_una) {
            self.congestion.on_duplicate_ack();
            return AckOutcome::Duplicate;
        }
        if seq_lt(self.snd_max, ack) {
            log::debug!("[snd] ACK {ack} beyond snd_max {}", self.snd_max);
            return AckOutcome::Ignored;
        }

        self.congestion.on_new_ack();
        let bytes = self.buffer.advance_base(ack);
        self.snd_una = ack;
        self.rwnd = window;

        if let Some(sample) = self.sample {
            if sample.expected_ack == ack {
                self.rtt.record_sample(now.saturating_sub(sample.sent_at));
                self.sample = None;
            }
        }

        AckOutcome::Advanced {
            bytes,
            window_complete: seq_le(self.win_end, ack),
        }
    }

    /// The window timer tagged `generation` expired.
    ///
    /// Returns the window to resend, or `None` when the timer is stale or
    /// nothing is outstanding.  The window is sliced with the pre-timeout
    /// congestion window; the congestion reset and RTO doubling apply to what
    /// follows.
    pub fn on_window_timeout(
        &mut self,
        generation: u64,
        src_port: u16,
        dst_port: u16,
        now: Duration,
    ) -> Option<Flight> {
        if generation != self.generation || self.is_idle() {
            return None;
        }
        let mut flight = self.next_window(src_port, dst_port, now)?;
        self.congestion.on_timeout();
        self.rtt.back_off();
        flight.timeout = self.flight_timeout(flight.segments.len());
        Some(flight)
    }

    /// Drop everything still queued.  Nothing outstanding remains afterwards.
    pub fn abandon(&mut self) {
        self.buffer.clear();
        let end = self.buffer.end_seq();
        self.snd_una = end;
        self.win_end = end;
        if seq_lt(self.snd_max, end) {
            self.snd_max = end;
        }
        self.sample = None;
    }

    fn flight_timeout(&self, segments: usize) -> Duration {
        let n = u32::try_from(segments).unwrap_or(u32::MAX);
        self.rtt.timeout().saturating_mul(n)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Retransmission timeout estimation and timer events.
//!
//! Reliable delivery requires that an unacknowledged window is re-sent if no
//! ACK arrives within a bounded time.  This module provides:
//! - [`RttEstimator`]: Jacobson/Karels smoothing of RTT samples into the
//!   retransmission timeout (RTO), with exponential back-off on timeout.
//! - [`TimerEvent`] / [`Timer`]: the tagged events a socket hands to the
//!   clock collaborator.  Each carries just enough state for the handler to
//!   decide, when it fires, whether it is still relevant.
//!
//! RTO is computed as
//!   `estimatedRTT = (1 - α)·estimatedRTT + α·sampleRTT`
//!   `devRTT       = (1 - β)·devRTT       + β·|sampleRTT - estimatedRTT|`
//!   `RTO          = estimatedRTT + 4·devRTT`
//! with α = 0.125 and β = 0.25, and doubles on each timeout.

use std::time::Duration;

use crate::socket::SocketId;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;

/// Adjustable timeout parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerConfig {
    /// RTO before any RTT sample is available.
    pub initial_rto: Duration,
    /// Interval between SYN (and SYN-ACK) retransmissions.
    pub syn_retransmit: Duration,
    /// Interval between checks for a drained send buffer after `close()`.
    pub shutdown_check: Duration,
    /// Floor under the computed RTO.
    pub min_rto: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(1000),
            syn_retransmit: Duration::from_millis(1000),
            shutdown_check: Duration::from_millis(1000),
            min_rto: Duration::from_millis(1),
        }
    }
}

/// Smoothed RTT state for one connection.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    estimated: Duration,
    deviation: Duration,
    timeout: Duration,
    min_rto: Duration,
}

impl RttEstimator {
    pub fn new(config: &TimerConfig) -> Self {
        Self {
            estimated: Duration::ZERO,
            deviation: Duration::ZERO,
            timeout: config.initial_rto.max(config.min_rto),
            min_rto: config.min_rto,
        }
    }

    /// Current retransmission timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn estimated(&self) -> Duration {
        self.estimated
    }

    pub fn deviation(&self) -> Duration {
        self.deviation
    }

    /// Fold one RTT sample into the estimate and recompute the RTO.
    pub fn record_sample(&mut self, sample: Duration) {
        self.estimated = self.estimated.mul_f64(1.0 - ALPHA) + sample.mul_f64(ALPHA);
        let diff = sample.abs_diff(self.estimated);
        self.deviation = self.deviation.mul_f64(1.0 - BETA) + diff.mul_f64(BETA);
        self.timeout = (self.estimated + self.deviation * 4).max(self.min_rto);
        log::trace!(
            "[rtt] sample={sample:?} est={:?} dev={:?} rto={:?}",
            self.estimated,
            self.deviation,
            self.timeout
        );
    }

    /// Double the RTO after a retransmission timeout.  There is no ceiling.
    pub fn back_off(&mut self) {
        self.timeout = self.timeout.saturating_mul(2);
    }
}

/// Deferred work a socket asks the clock to hand back later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Resend the SYN if the socket is still waiting for the SYN-ACK whose
    /// handshake started at `isn`.
    RetransmitSyn { isn: u32 },
    /// Resend the SYN-ACK if the initiator has still not confirmed the
    /// handshake and nothing has been received past `ack`.
    RetransmitSynAck { ack: u32 },
    /// Send FIN once the send buffer has drained up to `fin_seq`.
    ShutdownCheck { fin_seq: u32 },
    /// The flight tagged `generation` has not been fully acknowledged in time.
    WindowTimeout { generation: u64 },
}

/// A [`TimerEvent`] addressed to one socket of the node that armed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    pub socket: SocketId,
    pub event: TimerEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> RttEstimator {
        RttEstimator::new(&TimerConfig::default())
    }

    fn close_to(d: Duration, millis: f64) -> bool {
        (d.as_secs_f64() * 1000.0 - millis).abs() < 1e-3
    }

    #[test]
    fn starts_at_initial_rto() {
        let rtt = estimator();
        assert_eq!(rtt.timeout(), Duration::from_secs(1));
        assert_eq!(rtt.estimated(), Duration::ZERO);
    }

    #[test]
    fn first_sample_from_zero_estimate() {
        let mut rtt = estimator();
        rtt.record_sample(Duration::from_millis(80));
        // est = 0.125 * 80 = 10, dev = 0.25 * |80 - 10| = 17.5
        assert!(close_to(rtt.estimated(), 10.0));
        assert!(close_to(rtt.deviation(), 17.5));
        assert!(close_to(rtt.timeout(), 80.0));
    }

    #[test]
    fn steady_samples_converge() {
        let mut rtt = estimator();
        for _ in 0..200 {
            rtt.record_sample(Duration::from_millis(40));
        }
        assert!(close_to(rtt.estimated(), 40.0), "estimate {:?}", rtt.estimated());
        assert!(rtt.deviation() < Duration::from_micros(10));
        assert!(close_to(rtt.timeout(), 40.0));
    }

    #[test]
    fn back_off_doubles_without_ceiling() {
        let mut rtt = estimator();
        for _ in 0..10 {
            rtt.back_off();
        }
        assert_eq!(rtt.timeout(), Duration::from_secs(1024));
    }

    #[test]
    fn back_off_saturates_instead_of_overflowing() {
        let mut rtt = estimator();
        for _ in 0..200 {
            rtt.back_off();
        }
        assert_eq!(rtt.timeout(), Duration::MAX);
    }

    #[test]
    fn tiny_samples_respect_floor() {
        let mut rtt = estimator();
        rtt.record_sample(Duration::ZERO);
        assert_eq!(rtt.timeout(), Duration::from_millis(1));
    }
}

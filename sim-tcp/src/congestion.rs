//! AIMD congestion control: slow start, congestion avoidance, fast recovery.
//!
//! The controller only moves `cwnd` and `ssthresh`; it never sends anything.
//! The sender feeds it one event per ACK or timeout and copies the resulting
//! window into its send buffer before slicing the next flight.
//!
//! ```text
//!                 new ACK, cwnd >= ssthresh
//!  SLOW_START ───────────────────────────────▶ CONGESTION_AVOIDANCE
//!      │  ▲                                         │        ▲
//!      │  └──────────── timeout (any state) ◀───────┤        │ new ACK
//!      │ 3 dup ACKs                       3 dup ACKs│        │
//!      ▼                                            ▼        │
//!  FAST_RECOVERY ◀──────────────────────────────────┘────────┘
//! ```

/// Number of duplicate ACKs that triggers fast recovery.
pub const DUP_ACK_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionState {
    #[default]
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

impl std::fmt::Display for CongestionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone)]
pub struct CongestionControl {
    mss: u32,
    cwnd: u32,
    ssthresh: u32,
    dup_acks: u32,
    state: CongestionState,
}

impl CongestionControl {
    /// Start in slow start with `cwnd = 1 MSS`.
    pub fn new(mss: u32, ssthresh: u32) -> Self {
        Self {
            mss,
            cwnd: mss,
            ssthresh,
            dup_acks: 0,
            state: CongestionState::SlowStart,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn dup_acks(&self) -> u32 {
        self.dup_acks
    }

    pub fn state(&self) -> CongestionState {
        self.state
    }

    /// An ACK that moved the send base (or at least did not fall behind it).
    pub fn on_new_ack(&mut self) {
        match self.state {
            CongestionState::SlowStart => {
                self.cwnd = self.cwnd.saturating_add(self.mss);
                if self.cwnd >= self.ssthresh {
                    self.state = CongestionState::CongestionAvoidance;
                }
            }
            CongestionState::CongestionAvoidance => {
                // Integer division: the increment is zero once cwnd > MSS.
                let step = self.mss * (self.mss / self.cwnd.max(1));
                self.cwnd = self.cwnd.saturating_add(step);
            }
            CongestionState::FastRecovery => {
                self.cwnd = self.ssthresh;
                self.state = CongestionState::CongestionAvoidance;
            }
        }
        self.dup_acks = 0;
    }

    /// An ACK that fell behind the send base.
    pub fn on_duplicate_ack(&mut self) {
        match self.state {
            CongestionState::SlowStart | CongestionState::CongestionAvoidance => {
                self.dup_acks += 1;
                if self.dup_acks == DUP_ACK_THRESHOLD {
                    self.ssthresh = self.cwnd / 2;
                    self.cwnd = self
                        .ssthresh
                        .saturating_add(DUP_ACK_THRESHOLD * self.mss);
                    self.state = CongestionState::FastRecovery;
                    log::debug!(
                        "[cc] fast recovery: ssthresh={} cwnd={}",
                        self.ssthresh,
                        self.cwnd
                    );
                }
            }
            CongestionState::FastRecovery => {
                self.cwnd = self.cwnd.saturating_add(self.mss);
            }
        }
    }

    /// The retransmission timer expired with data still unacknowledged.
    pub fn on_timeout(&mut self) {
        self.ssthresh = self.cwnd / 2;
        self.cwnd = self.mss;
        self.dup_acks = 0;
        self.state = CongestionState::SlowStart;
        log::debug!("[cc] timeout: ssthresh={} cwnd={}", self.ssthresh, self.cwnd);
    }
}

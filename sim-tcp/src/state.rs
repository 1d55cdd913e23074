//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::socket::Socket`] can occupy.
//! Transitions are driven by [`crate::socket`]; only the state type and the
//! status predicates exposed to applications live here.
//!
//! ```text
//!            listen()
//!  CLOSED ─────────────▶ LISTEN ──SYN──▶ (spawns child in ESTABLISHED)
//!    │
//!    │ connect()
//!    ▼
//!  SYN_SENT ──SYN-ACK──▶ ESTABLISHED ──close() / peer FIN──▶ SHUTDOWN
//!    │                                                          │
//!    │ FIN / release()                        drained, FIN sent │
//!    ▼                                                          ▼
//!  CLOSED ◀─────────────────────────────────────────────────── CLOSED
//! ```

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No connection exists; initial and terminal state.
    Closed,
    /// Waiting for SYNs on a bound port.
    Listen,
    /// SYN sent; waiting for the SYN-ACK.
    SynSent,
    /// Data may flow in both directions.
    Established,
    /// `close()` requested or peer FIN seen; FIN deferred until the send
    /// buffer drains.
    Shutdown,
}

impl SocketState {
    pub fn is_connection_pending(self) -> bool {
        self == Self::SynSent
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    pub fn is_connected(self) -> bool {
        self == Self::Established
    }

    pub fn is_closure_pending(self) -> bool {
        self == Self::Shutdown
    }

    pub fn is_listening(self) -> bool {
        self == Self::Listen
    }
}

impl Default for SocketState {
    fn default() -> Self {
        Self::Closed
    }
}

impl std::fmt::Display for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::Established => "ESTABLISHED",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

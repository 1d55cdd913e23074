//! Network-layer envelope.
//!
//! The network collaborator moves [`Packet`]s between nodes.  A transport
//! segment rides inside `payload` as opaque bytes; framing of the envelope
//! itself is the network's business and is not defined here.

/// Address of a node on the simulated network.
pub type NodeAddr = u16;

/// Hop limit stamped on every packet this crate originates.
pub const MAX_TTL: u8 = 15;

/// Protocol tag in the envelope.  Only [`Protocol::Transport`] is consumed by
/// the transport manager; everything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ping,
    PingReply,
    Transport,
    Other(u8),
}

impl Protocol {
    pub fn code(self) -> u8 {
        match self {
            Self::Ping => 0,
            Self::PingReply => 1,
            Self::Transport => 4,
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Ping,
            1 => Self::PingReply,
            4 => Self::Transport,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src: NodeAddr,
    pub dest: NodeAddr,
    pub ttl: u8,
    pub protocol: Protocol,
    /// Envelope sequence number; the transport copies its segment `seq` here.
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Wrap an already-packed transport segment.
    pub fn transport(src: NodeAddr, dest: NodeAddr, ttl: u8, seq: u32, payload: Vec<u8>) -> Self {
        Self {
            src,
            dest,
            ttl,
            protocol: Protocol::Transport,
            seq,
            payload,
        }
    }
}

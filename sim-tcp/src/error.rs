//! Error types for the socket API and configuration.
//!
//! Protocol violations (stale ACKs, out-of-order DATA, segments for unknown
//! connections) are not errors: they are answered on the wire and logged.
//! Only mistakes by the immediate caller surface here.

use thiserror::Error;

use crate::socket::SocketId;
use crate::state::SocketState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("port {0} is already bound")]
    PortInUse(u16),
    #[error("socket is already bound to port {0}")]
    AlreadyBound(u16),
    #[error("socket is not bound to a port")]
    NotBound,
    #[error("operation not allowed in state {0}")]
    InvalidState(SocketState),
    #[error("no socket with id {0}")]
    UnknownSocket(SocketId),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("mss {0} must be between 1 and the largest segment payload")]
    InvalidMss(usize),
    #[error("buffer size {buffer_size} must be at least 2 and larger than mss {mss}")]
    BufferTooSmall { buffer_size: usize, mss: usize },
    #[error("buffer size {0} does not fit a 32-bit window")]
    BufferTooLarge(usize),
    #[error("ttl must be non-zero")]
    ZeroTtl,
    #[error("{name} = {value} is not a probability in [0, 1]")]
    InvalidProbability { name: &'static str, value: f64 },
    #[error("node {0} already exists")]
    DuplicateNode(u16),
}

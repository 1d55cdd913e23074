//! Demultiplexer: which socket gets an inbound segment.
//!
//! Three tables, all keyed by ports of this node:
//!
//! | Table         | Key                                         | Value      |
//! |---------------|---------------------------------------------|------------|
//! | `bound`       | local port                                  | (claimed)  |
//! | `listening`   | local port                                  | listener   |
//! | `connections` | (local port, remote address, remote port)   | connection |
//!
//! A SYN prefers an existing connection with the same identity (a
//! retransmitted SYN whose SYN-ACK was lost), then the listener on its
//! destination port.  Every other kind needs an exact connection match; when
//! none exists the sender is told to go away with a FIN, unless the segment
//! was itself a FIN.

use std::collections::{HashMap, HashSet};

use crate::packet::NodeAddr;
use crate::segment::{Segment, SegmentKind};
use crate::socket::SocketId;

/// Identity of an established or pending connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub local_port: u16,
    pub remote_addr: NodeAddr,
    pub remote_port: u16,
}

/// Where an inbound segment goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// A SYN for the listener on the destination port.
    Listener(SocketId),
    /// A segment for an existing connection.
    Connection(SocketId),
    /// No socket matches: send this FIN back to the source.
    Reset(Segment),
    /// No socket matches and no reply is due.
    Drop,
}

#[derive(Debug, Default)]
pub struct Demux {
    bound: HashSet<u16>,
    listening: HashMap<u16, SocketId>,
    connections: HashMap<ConnKey, SocketId>,
}

impl Demux {
    /// Claim `port` exclusively.  Returns `false` if it is already bound.
    pub fn can_bind(&mut self, port: u16) -> bool {
        self.bound.insert(port)
    }

    /// Release `port`, including any listener registered on it.
    pub fn unbind(&mut self, port: u16) {
        self.bound.remove(&port);
        self.listening.remove(&port);
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.bound.contains(&port)
    }

    pub fn register_listening(&mut self, port: u16, socket: SocketId) {
        self.listening.insert(port, socket);
    }

    pub fn register_connection(&mut self, key: ConnKey, socket: SocketId) {
        if let Some(previous) = self.connections.insert(key, socket) {
            if previous != socket {
                log::warn!("[demux] {key:?} re-registered: {previous} replaced by {socket}");
            }
        }
    }

    /// Forget `key`, but only if it still maps to `socket`.
    pub fn unregister_connection(&mut self, key: ConnKey, socket: SocketId) {
        if self.connections.get(&key) == Some(&socket) {
            self.connections.remove(&key);
        }
    }

    pub fn listener(&self, port: u16) -> Option<SocketId> {
        self.listening.get(&port).copied()
    }

    pub fn connection(&self, key: &ConnKey) -> Option<SocketId> {
        self.connections.get(key).copied()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Decide where `segment`, received from node `src`, is delivered.
    pub fn route(&self, segment: &Segment, src: NodeAddr) -> Route {
        let key = ConnKey {
            local_port: segment.dst_port,
            remote_addr: src,
            remote_port: segment.src_port,
        };
        if let Some(id) = self.connection(&key) {
            return Route::Connection(id);
        }

        match segment.kind {
            SegmentKind::Syn => match self.listener(segment.dst_port) {
                Some(id) => Route::Listener(id),
                None => {
                    log::info!(
                        "[demux] SYN from {}:{} to closed port {}; dropped",
                        src,
                        segment.src_port,
                        segment.dst_port
                    );
                    Route::Drop
                }
            },
            SegmentKind::Fin => Route::Drop,
            SegmentKind::Ack | SegmentKind::Data => {
                log::warn!(
                    "[demux] {} from {}:{} for unknown connection on port {}; resetting",
                    segment.kind,
                    src,
                    segment.src_port,
                    segment.dst_port
                );
                Route::Reset(Segment::control(
                    segment.dst_port,
                    segment.src_port,
                    SegmentKind::Fin,
                    0,
                    0,
                ))
            }
        }
    }
}

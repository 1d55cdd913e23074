//! Per-node transport manager.
//!
//! [`TcpManager`] owns every socket of one node, the demultiplexer tables and
//! the node's [`Config`].  Applications call the socket API on it with a
//! [`SocketId`]; the host feeds it packets ([`TcpManager::on_packet`]) and
//! expired timers ([`TcpManager::on_timer`]).
//!
//! ```text
//!   application ──socket()/bind()/connect()/write()/...──┐
//!                                                        ▼
//!   host ──on_packet()──▶ TcpManager ──Demux::route()──▶ Socket
//!   host ──on_timer()───▶     │                            │
//!        ◀── send_packet() / schedule() ── Ctx ◀───────────┘
//! ```
//!
//! All calls are synchronous and non-blocking.  Anything that may emit a
//! packet or arm a timer takes the node's [`Host`].

use std::collections::HashMap;
use std::time::Duration;

use crate::config::Config;
use crate::demux::{Demux, Route};
use crate::error::{ConfigError, SocketError};
use crate::host::Host;
use crate::packet::{NodeAddr, Packet, Protocol};
use crate::segment::{Segment, SegmentKind};
use crate::socket::{Socket, SocketId};
use crate::state::SocketState;
use crate::timer::{Timer, TimerEvent};

// ---------------------------------------------------------------------------
// Ctx
// ---------------------------------------------------------------------------

/// What a socket handler may touch besides itself.
pub(crate) struct Ctx<'a> {
    pub addr: NodeAddr,
    pub config: &'a Config,
    pub host: &'a mut dyn Host,
    pub demux: &'a mut Demux,
}

impl Ctx<'_> {
    pub fn now(&self) -> Duration {
        self.host.now()
    }

    /// Pack `segment` and hand it to the network.  Returns `false` if the
    /// segment could not be encoded.
    pub fn send(&mut self, dest: NodeAddr, segment: &Segment) -> bool {
        match segment.pack() {
            Ok(bytes) => {
                self.host.send_packet(Packet::transport(
                    self.addr,
                    dest,
                    self.config.ttl,
                    segment.seq,
                    bytes,
                ));
                true
            }
            Err(e) => {
                log::error!("[tcp {}] cannot encode {} segment: {e}", self.addr, segment.kind);
                false
            }
        }
    }

    pub fn schedule(&mut self, delay: Duration, socket: SocketId, event: TimerEvent) {
        self.host.schedule(delay, Timer { socket, event });
    }
}

// ---------------------------------------------------------------------------
// TcpManager
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TcpManager {
    addr: NodeAddr,
    config: Config,
    sockets: HashMap<SocketId, Socket>,
    demux: Demux,
    next_id: u32,
}

impl TcpManager {
    pub fn new(addr: NodeAddr, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            addr,
            config,
            sockets: HashMap::new(),
            demux: Demux::default(),
            next_id: 1,
        })
    }

    pub fn addr(&self) -> NodeAddr {
        self.addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Inspect a socket.  `None` once it has been released.
    pub fn get(&self, id: SocketId) -> Option<&Socket> {
        self.sockets.get(&id)
    }

    pub fn demux(&self) -> &Demux {
        &self.demux
    }

    // -----------------------------------------------------------------------
    // Socket API
    // -----------------------------------------------------------------------

    /// Create a socket in CLOSED.
    pub fn socket(&mut self) -> SocketId {
        let id = self.alloc_id();
        self.sockets.insert(id, Socket::new(id));
        id
    }

    pub fn bind(&mut self, id: SocketId, port: u16) -> Result<(), SocketError> {
        let socket = self
            .sockets
            .get_mut(&id)
            .ok_or(SocketError::UnknownSocket(id))?;
        let result = socket.bind(port, &mut self.demux);
        if let Err(e) = &result {
            log::warn!("[tcp {}] bind {id} to {port}: {e}", self.addr);
        }
        result
    }

    pub fn listen(&mut self, id: SocketId, backlog: usize) -> Result<(), SocketError> {
        let socket = self
            .sockets
            .get_mut(&id)
            .ok_or(SocketError::UnknownSocket(id))?;
        let result = socket.listen(backlog, &mut self.demux);
        match &result {
            Ok(()) => log::debug!("[tcp {}] {id} listening (backlog {backlog})", self.addr),
            Err(e) => log::warn!("[tcp {}] listen {id}: {e}", self.addr),
        }
        result
    }

    /// Dequeue one connection from a listener's backlog.
    ///
    /// Connections that already reached CLOSED while waiting (the peer sent
    /// FIN and the shutdown completed) are discarded rather than handed out.
    /// One still in SHUTDOWN is returned so its received data can be read.
    pub fn accept(&mut self, id: SocketId) -> Option<SocketId> {
        loop {
            let child = self.sockets.get_mut(&id)?.accept()?;
            if self.state(child).is_closed() {
                log::debug!(
                    "[tcp {}] discarding {} from backlog of {}: already closed",
                    self.addr,
                    child,
                    id
                );
                self.sockets.remove(&child);
                continue;
            }
            return Some(child);
        }
    }

    pub fn connect(
        &mut self,
        id: SocketId,
        remote_addr: NodeAddr,
        remote_port: u16,
        host: &mut dyn Host,
    ) -> Result<(), SocketError> {
        let Self {
            addr,
            config,
            sockets,
            demux,
            ..
        } = self;
        let socket = sockets.get_mut(&id).ok_or(SocketError::UnknownSocket(id))?;
        let mut ctx = Ctx {
            addr: *addr,
            config,
            host,
            demux,
        };
        socket.connect(remote_addr, remote_port, &mut ctx)
    }

    /// Queue bytes for sending.  Returns how many were accepted: 0 unless the
    /// connection is ESTABLISHED, fewer than `data.len()` when the send
    /// buffer fills.
    pub fn write(
        &mut self,
        id: SocketId,
        data: &[u8],
        host: &mut dyn Host,
    ) -> Result<usize, SocketError> {
        let Self {
            addr,
            config,
            sockets,
            demux,
            ..
        } = self;
        let socket = sockets.get_mut(&id).ok_or(SocketError::UnknownSocket(id))?;
        let mut ctx = Ctx {
            addr: *addr,
            config,
            host,
            demux,
        };
        Ok(socket.write(data, &mut ctx))
    }

    /// Read received bytes into `out`.  Returns 0 when nothing is buffered.
    pub fn read(&mut self, id: SocketId, out: &mut [u8]) -> Result<usize, SocketError> {
        let socket = self
            .sockets
            .get_mut(&id)
            .ok_or(SocketError::UnknownSocket(id))?;
        Ok(socket.read(out))
    }

    /// Graceful close.  LISTEN and SYN_SENT sockets are released instead.
    pub fn close(&mut self, id: SocketId, host: &mut dyn Host) -> Result<(), SocketError> {
        let state = self
            .sockets
            .get(&id)
            .map(Socket::state)
            .ok_or(SocketError::UnknownSocket(id))?;
        if matches!(state, SocketState::Listen | SocketState::SynSent) {
            self.release(id, host);
            return Ok(());
        }

        let Self {
            addr,
            config,
            sockets,
            demux,
            ..
        } = self;
        if let Some(socket) = sockets.get_mut(&id) {
            let mut ctx = Ctx {
                addr: *addr,
                config,
                host,
                demux,
            };
            socket.close(&mut ctx);
        }
        Ok(())
    }

    /// Abortive close.  The socket is forgotten immediately, together with
    /// any connections still waiting in its backlog.
    pub fn release(&mut self, id: SocketId, host: &mut dyn Host) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(mut socket) = self.sockets.remove(&id) else {
                continue;
            };
            let mut ctx = Ctx {
                addr: self.addr,
                config: &self.config,
                host: &mut *host,
                demux: &mut self.demux,
            };
            pending.extend(socket.release(&mut ctx));
        }
    }

    // -----------------------------------------------------------------------
    // Status predicates (unknown sockets report CLOSED)
    // -----------------------------------------------------------------------

    pub fn state(&self, id: SocketId) -> SocketState {
        self.sockets.get(&id).map_or(SocketState::Closed, Socket::state)
    }

    pub fn is_connection_pending(&self, id: SocketId) -> bool {
        self.state(id).is_connection_pending()
    }

    pub fn is_closed(&self, id: SocketId) -> bool {
        self.state(id).is_closed()
    }

    pub fn is_connected(&self, id: SocketId) -> bool {
        self.state(id).is_connected()
    }

    pub fn is_closure_pending(&self, id: SocketId) -> bool {
        self.state(id).is_closure_pending()
    }

    pub fn is_listening(&self, id: SocketId) -> bool {
        self.state(id).is_listening()
    }

    // -----------------------------------------------------------------------
    // Host callbacks
    // -----------------------------------------------------------------------

    /// Handle a packet addressed to this node.
    pub fn on_packet(&mut self, packet: &Packet, host: &mut dyn Host) {
        if packet.protocol != Protocol::Transport {
            log::trace!("[tcp {}] ignoring {:?} packet", self.addr, packet.protocol);
            return;
        }
        if packet.ttl == 0 {
            log::debug!("[tcp {}] dropping packet from {} with ttl 0", self.addr, packet.src);
            return;
        }
        let segment = match Segment::unpack(&packet.payload) {
            Ok(segment) => segment,
            Err(e) => {
                log::warn!("[tcp {}] malformed segment from {}: {e}", self.addr, packet.src);
                return;
            }
        };

        let route = self.demux.route(&segment, packet.src);
        let Self {
            addr,
            config,
            sockets,
            demux,
            next_id,
        } = self;
        let mut ctx = Ctx {
            addr: *addr,
            config,
            host,
            demux,
        };

        match route {
            Route::Listener(id) => {
                let child_id = SocketId(*next_id);
                let Some(listener) = sockets.get_mut(&id) else {
                    return;
                };
                if let Some(child) = listener.on_syn(&segment, packet.src, child_id, &mut ctx) {
                    *next_id += 1;
                    sockets.insert(child_id, child);
                }
            }
            Route::Connection(id) => {
                let Some(socket) = sockets.get_mut(&id) else {
                    return;
                };
                if segment.kind == SegmentKind::Syn {
                    socket.on_duplicate_syn(&mut ctx);
                } else {
                    socket.on_segment(&segment, &mut ctx);
                }
            }
            Route::Reset(fin) => {
                ctx.send(packet.src, &fin);
            }
            Route::Drop => {}
        }
    }

    /// Handle a timer previously armed by one of this node's sockets.
    pub fn on_timer(&mut self, timer: Timer, host: &mut dyn Host) {
        let Self {
            addr,
            config,
            sockets,
            demux,
            ..
        } = self;
        let Some(socket) = sockets.get_mut(&timer.socket) else {
            log::trace!("[tcp {}] timer for released socket {}", addr, timer.socket);
            return;
        };
        let mut ctx = Ctx {
            addr: *addr,
            config,
            host,
            demux,
        };
        socket.on_timer(timer.event, &mut ctx);
    }

    fn alloc_id(&mut self) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        id
    }
}

//! Per-connection state machine.
//!
//! One [`Socket`] type plays both roles:
//!
//! - **listening**: bound to a port, in LISTEN, owning a backlog of freshly
//!   spawned connection sockets awaiting `accept()`;
//! - **connected**: owning a [`Sender`] and a [`Receiver`] for one
//!   (local port, remote address, remote port) identity.
//!
//! Sockets never touch the network or the clock directly.  Every handler
//! receives a [`Ctx`] from the [`crate::manager::TcpManager`] through which it
//! sends segments, arms timers and updates the demultiplexer tables.
//!
//! # Handshake
//!
//! ```text
//!  client (SYN_SENT)                            listener (LISTEN)
//!      │ ── SYN seq=isn_c win=cwnd ─────────────────▶ │ spawn child (ESTABLISHED)
//!      │ ◀──── ACK seq=isn_c+1 win=rwnd [isn_s] ──── │ child re-sends until confirmed
//!  ESTABLISHED                                       │
//!      │ ── ACK seq=isn_s+1 win=rwnd ──────────────▶ │ child confirmed
//! ```

use std::collections::VecDeque;
use std::fmt;

use crate::demux::{ConnKey, Demux};
use crate::error::SocketError;
use crate::manager::Ctx;
use crate::packet::NodeAddr;
use crate::receiver::{Delivery, Receiver};
use crate::segment::{Segment, SegmentKind};
use crate::sender::{AckOutcome, Flight, Sender};
use crate::state::SocketState;
use crate::timer::TimerEvent;

/// Handle to a socket owned by a [`crate::manager::TcpManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) u32);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Counters accumulated over a socket's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    pub segments_sent: u64,
    pub windows_retransmitted: u64,
    pub duplicate_acks: u64,
    pub timeouts: u64,
    pub bytes_acked: u64,
    pub bytes_delivered: u64,
}

#[derive(Debug)]
pub struct Socket {
    id: SocketId,
    state: SocketState,
    local_port: Option<u16>,
    /// Set for sockets that claimed their port through `bind`.  Spawned
    /// connection sockets share the listener's port and never own it.
    owns_port: bool,
    remote: Option<(NodeAddr, u16)>,
    sender: Option<Sender>,
    receiver: Option<Receiver>,
    backlog_limit: usize,
    backlog: VecDeque<SocketId>,
    /// FIN goes out once everything before this sequence number is acked.
    fin_seq: Option<u32>,
    peer_closed: bool,
    /// The initiator has proven it saw our SYN-ACK.
    peer_confirmed: bool,
    /// A SYN is outstanding; cleared explicitly when the SYN-ACK arrives.
    syn_pending: bool,
    stats: SocketStats,
}

impl Socket {
    pub(crate) fn new(id: SocketId) -> Self {
        Self {
            id,
            state: SocketState::Closed,
            local_port: None,
            owns_port: false,
            remote: None,
            sender: None,
            receiver: None,
            backlog_limit: 0,
            backlog: VecDeque::new(),
            fin_seq: None,
            peer_closed: false,
            peer_confirmed: false,
            syn_pending: false,
            stats: SocketStats::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// `(address, port)` of the peer, once a connection has been attempted.
    pub fn remote(&self) -> Option<(NodeAddr, u16)> {
        self.remote
    }

    pub fn stats(&self) -> SocketStats {
        self.stats
    }

    /// Send-side state: congestion window, RTO, sequence numbers.
    pub fn sender(&self) -> Option<&Sender> {
        self.sender.as_ref()
    }

    /// Connections waiting to be accepted.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Bytes received and not yet read.
    pub fn readable(&self) -> usize {
        self.receiver.as_ref().map_or(0, Receiver::readable)
    }

    /// The peer has sent FIN.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    fn port(&self) -> u16 {
        self.local_port.unwrap_or(0)
    }

    /// The port this socket still holds through `bind`.  Spawned connections
    /// and sockets that have released their port do not qualify.
    fn owned_port(&self) -> Result<u16, SocketError> {
        self.local_port
            .filter(|_| self.owns_port)
            .ok_or(SocketError::NotBound)
    }

    /// `(local port, remote address, remote port)` of a connected socket.
    fn endpoints(&self) -> Option<(u16, NodeAddr, u16)> {
        let (addr, port) = self.remote?;
        Some((self.local_port?, addr, port))
    }

    fn conn_key(&self) -> Option<ConnKey> {
        self.endpoints()
            .map(|(local_port, remote_addr, remote_port)| ConnKey {
                local_port,
                remote_addr,
                remote_port,
            })
    }

    fn is_open(&self) -> bool {
        matches!(
            self.state,
            SocketState::Established | SocketState::Shutdown
        )
    }

    // -----------------------------------------------------------------------
    // Application calls
    // -----------------------------------------------------------------------

    pub(crate) fn bind(&mut self, port: u16, demux: &mut Demux) -> Result<(), SocketError> {
        if let Some(bound) = self.local_port {
            return Err(SocketError::AlreadyBound(bound));
        }
        if self.state != SocketState::Closed {
            return Err(SocketError::InvalidState(self.state));
        }
        if !demux.can_bind(port) {
            return Err(SocketError::PortInUse(port));
        }
        self.local_port = Some(port);
        self.owns_port = true;
        Ok(())
    }

    pub(crate) fn listen(&mut self, backlog: usize, demux: &mut Demux) -> Result<(), SocketError> {
        if self.state != SocketState::Closed {
            return Err(SocketError::InvalidState(self.state));
        }
        let port = self.owned_port()?;
        demux.register_listening(port, self.id);
        self.backlog_limit = backlog;
        self.state = SocketState::Listen;
        Ok(())
    }

    pub(crate) fn accept(&mut self) -> Option<SocketId> {
        if self.state != SocketState::Listen {
            return None;
        }
        self.backlog.pop_front()
    }

    pub(crate) fn connect(
        &mut self,
        remote_addr: NodeAddr,
        remote_port: u16,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), SocketError> {
        if self.state != SocketState::Closed {
            return Err(SocketError::InvalidState(self.state));
        }
        let local_port = self.owned_port()?;

        let isn = ctx.config.initial_seq;
        self.remote = Some((remote_addr, remote_port));
        self.sender = Some(Sender::new(ctx.config, isn, 0));
        ctx.demux.register_connection(
            ConnKey {
                local_port,
                remote_addr,
                remote_port,
            },
            self.id,
        );
        self.state = SocketState::SynSent;
        self.syn_pending = true;
        log::debug!(
            "[tcp {}:{} {}] connecting to {}:{}",
            ctx.addr,
            local_port,
            self.id,
            remote_addr,
            remote_port
        );

        self.send_syn(ctx);
        ctx.schedule(ctx.config.timers.syn_retransmit, self.id, TimerEvent::RetransmitSyn { isn });
        Ok(())
    }

    /// Queue bytes for sending.  Returns 0 unless ESTABLISHED.
    pub(crate) fn write(&mut self, data: &[u8], ctx: &mut Ctx<'_>) -> usize {
        if self.state != SocketState::Established {
            return 0;
        }
        let Some(sender) = self.sender.as_mut() else {
            return 0;
        };
        let n = sender.write(data);
        // A window in flight picks up new bytes once it is fully acked.
        if sender.is_idle() && !sender.is_drained() {
            self.send_window(ctx);
        }
        n
    }

    pub(crate) fn read(&mut self, out: &mut [u8]) -> usize {
        self.receiver.as_mut().map_or(0, |r| r.read(out))
    }

    /// Graceful close of an ESTABLISHED connection.  FIN is deferred until
    /// every byte written so far has been acknowledged.
    pub(crate) fn close(&mut self, ctx: &mut Ctx<'_>) {
        if self.state != SocketState::Established {
            return;
        }
        let Some(fin_seq) = self.sender.as_ref().map(Sender::end_seq) else {
            return;
        };
        self.fin_seq = Some(fin_seq);
        self.state = SocketState::Shutdown;
        log::debug!(
            "[tcp {}:{} {}] close: FIN deferred until seq {}",
            ctx.addr,
            self.port(),
            self.id,
            fin_seq
        );
        ctx.schedule(
            ctx.config.timers.shutdown_check,
            self.id,
            TimerEvent::ShutdownCheck { fin_seq },
        );
    }

    /// Abortive close.  Returns the un-accepted backlog, which the caller
    /// releases as well.
    pub(crate) fn release(&mut self, ctx: &mut Ctx<'_>) -> Vec<SocketId> {
        log::debug!(
            "[tcp {}:{} {}] release in {}",
            ctx.addr,
            self.port(),
            self.id,
            self.state
        );
        self.state = SocketState::Closed;
        self.syn_pending = false;
        self.destroy(ctx.demux);
        self.backlog.drain(..).collect()
    }

    /// Remove this socket's entries from the demultiplexer tables.
    fn destroy(&mut self, demux: &mut Demux) {
        if let Some(key) = self.conn_key() {
            demux.unregister_connection(key, self.id);
        }
        if self.owns_port {
            if let Some(port) = self.local_port {
                demux.unbind(port);
            }
            self.owns_port = false;
        }
    }

    // -----------------------------------------------------------------------
    // Segment handlers
    // -----------------------------------------------------------------------

    /// Passive open.  Returns the spawned connection socket, already
    /// ESTABLISHED and queued on the backlog, or `None` when the SYN is
    /// refused.
    pub(crate) fn on_syn(
        &mut self,
        segment: &Segment,
        src: NodeAddr,
        child_id: SocketId,
        ctx: &mut Ctx<'_>,
    ) -> Option<Socket> {
        if self.state != SocketState::Listen {
            return None;
        }
        if self.backlog.len() >= self.backlog_limit {
            log::info!(
                "[tcp {}:{} {}] backlog full ({}); dropping SYN from {}:{}",
                ctx.addr,
                self.port(),
                self.id,
                self.backlog_limit,
                src,
                segment.src_port
            );
            return None;
        }

        let local_port = self.local_port?;
        let mut child = Socket::new(child_id);
        child.state = SocketState::Established;
        child.local_port = Some(local_port);
        child.remote = Some((src, segment.src_port));
        child.sender = Some(Sender::new(ctx.config, ctx.config.initial_seq, segment.window));
        child.receiver = Some(Receiver::new(ctx.config, segment.seq));
        ctx.demux.register_connection(
            ConnKey {
                local_port,
                remote_addr: src,
                remote_port: segment.src_port,
            },
            child_id,
        );

        log::info!(
            "[tcp {}:{} {}] SYN from {}:{}; spawned {}",
            ctx.addr,
            local_port,
            self.id,
            src,
            segment.src_port,
            child_id
        );
        child.send_syn_ack(ctx);
        let ack = segment.seq.wrapping_add(1);
        ctx.schedule(
            ctx.config.timers.syn_retransmit,
            child_id,
            TimerEvent::RetransmitSynAck { ack },
        );

        self.backlog.push_back(child_id);
        Some(child)
    }

    /// A SYN for a connection that already exists: the SYN-ACK was lost.
    pub(crate) fn on_duplicate_syn(&mut self, ctx: &mut Ctx<'_>) {
        if self.is_open() && !self.peer_closed && self.receiver.is_some() {
            log::debug!(
                "[tcp {}:{} {}] duplicate SYN; re-sending SYN-ACK",
                ctx.addr,
                self.port(),
                self.id
            );
            self.send_syn_ack(ctx);
        }
    }

    /// Dispatch a non-SYN segment routed to this connection.
    pub(crate) fn on_segment(&mut self, segment: &Segment, ctx: &mut Ctx<'_>) {
        log::trace!(
            "[tcp {}:{} {}] ← {} seq={} win={} len={}",
            ctx.addr,
            self.port(),
            self.id,
            segment.kind,
            segment.seq,
            segment.window,
            segment.payload.len()
        );
        match segment.kind {
            SegmentKind::Ack => self.on_ack(segment, ctx),
            SegmentKind::Data => self.on_data(segment, ctx),
            SegmentKind::Fin => self.on_fin(ctx),
            SegmentKind::Syn => {}
        }
    }

    fn on_ack(&mut self, segment: &Segment, ctx: &mut Ctx<'_>) {
        match self.state {
            SocketState::SynSent => self.on_syn_ack(segment, ctx),
            SocketState::Established | SocketState::Shutdown => {
                if !segment.payload.is_empty() {
                    // Our third-leg ACK was lost and the SYN-ACK came again.
                    self.send_ack(ctx);
                    return;
                }
                let Some(sender) = self.sender.as_mut() else {
                    return;
                };
                if !self.peer_confirmed {
                    self.peer_confirmed = true;
                    if segment.seq == sender.snd_una() {
                        sender.set_receiver_window(segment.window);
                        return;
                    }
                }

                match sender.on_ack(segment.seq, segment.window, ctx.now()) {
                    AckOutcome::Duplicate => self.stats.duplicate_acks += 1,
                    AckOutcome::Ignored => {}
                    AckOutcome::Advanced {
                        bytes,
                        window_complete,
                    } => {
                        self.stats.bytes_acked += bytes as u64;
                        if window_complete && !sender.is_drained() {
                            self.send_window(ctx);
                        }
                    }
                }
            }
            SocketState::Closed | SocketState::Listen => {}
        }
    }

    fn on_syn_ack(&mut self, segment: &Segment, ctx: &mut Ctx<'_>) {
        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        let expected = sender.isn().wrapping_add(1);
        let peer_isn = match <[u8; 4]>::try_from(segment.payload.as_slice()) {
            Ok(bytes) if segment.seq == expected => u32::from_be_bytes(bytes),
            _ => {
                log::debug!(
                    "[tcp {}:{} {}] unexpected ACK {} in SYN_SENT (want {})",
                    ctx.addr,
                    self.port(),
                    self.id,
                    segment.seq,
                    expected
                );
                return;
            }
        };

        sender.set_receiver_window(segment.window);
        self.receiver = Some(Receiver::new(ctx.config, peer_isn));
        self.state = SocketState::Established;
        self.syn_pending = false;
        self.peer_confirmed = true;
        log::debug!(
            "[tcp {}:{} {}] SYN_SENT → ESTABLISHED (peer isn={})",
            ctx.addr,
            self.port(),
            self.id,
            peer_isn
        );
        self.send_ack(ctx);
    }

    fn on_data(&mut self, segment: &Segment, ctx: &mut Ctx<'_>) {
        if !self.is_open() {
            return;
        }
        let Some(receiver) = self.receiver.as_mut() else {
            return;
        };
        self.peer_confirmed = true;
        match receiver.on_segment(segment) {
            Delivery::Accepted(n) => {
                self.stats.bytes_delivered += n as u64;
                self.send_ack(ctx);
            }
            Delivery::OutOfOrder => {
                let want = receiver.ack_number();
                log::debug!(
                    "[tcp {}:{} {}] out-of-order DATA seq={} (want {}); re-ACK",
                    ctx.addr,
                    self.port(),
                    self.id,
                    segment.seq,
                    want
                );
                self.send_ack(ctx);
            }
            Delivery::NoRoom => {
                log::debug!(
                    "[tcp {}:{} {}] receive buffer full; dropping DATA seq={}",
                    ctx.addr,
                    self.port(),
                    self.id,
                    segment.seq
                );
            }
        }
    }

    fn on_fin(&mut self, ctx: &mut Ctx<'_>) {
        match self.state {
            SocketState::Established | SocketState::Shutdown => {
                self.peer_closed = true;
                self.peer_confirmed = true;
                let Some(sender) = self.sender.as_mut() else {
                    return;
                };
                // Nothing more can be acknowledged by a closed peer.
                sender.abandon();
                let fin_seq = sender.snd_una();
                self.fin_seq = Some(fin_seq);
                log::debug!(
                    "[tcp {}:{} {}] ← FIN in {}; → SHUTDOWN",
                    ctx.addr,
                    self.port(),
                    self.id,
                    self.state
                );
                self.state = SocketState::Shutdown;
                ctx.schedule(
                    ctx.config.timers.shutdown_check,
                    self.id,
                    TimerEvent::ShutdownCheck { fin_seq },
                );
            }
            SocketState::SynSent => {
                log::info!(
                    "[tcp {}:{} {}] connection refused",
                    ctx.addr,
                    self.port(),
                    self.id
                );
                self.peer_closed = true;
                self.state = SocketState::Closed;
                self.syn_pending = false;
                self.destroy(ctx.demux);
            }
            SocketState::Closed | SocketState::Listen => {}
        }
    }

    // -----------------------------------------------------------------------
    // Timer handler
    // -----------------------------------------------------------------------

    pub(crate) fn on_timer(&mut self, event: TimerEvent, ctx: &mut Ctx<'_>) {
        match event {
            TimerEvent::RetransmitSyn { isn } => {
                let current = self.sender.as_ref().map(Sender::isn);
                if self.state == SocketState::SynSent && self.syn_pending && current == Some(isn) {
                    log::debug!(
                        "[tcp {}:{} {}] SYN timeout; re-sending",
                        ctx.addr,
                        self.port(),
                        self.id
                    );
                    self.send_syn(ctx);
                    ctx.schedule(ctx.config.timers.syn_retransmit, self.id, event);
                }
            }
            TimerEvent::RetransmitSynAck { ack } => {
                let current = self.receiver.as_ref().map(Receiver::ack_number);
                if self.is_open() && !self.peer_confirmed && current == Some(ack) {
                    self.send_syn_ack(ctx);
                    ctx.schedule(ctx.config.timers.syn_retransmit, self.id, event);
                }
            }
            TimerEvent::ShutdownCheck { fin_seq } => {
                if self.state == SocketState::Shutdown && self.fin_seq == Some(fin_seq) {
                    self.check_shutdown(fin_seq, ctx);
                }
            }
            TimerEvent::WindowTimeout { generation } => {
                if !self.is_open() {
                    return;
                }
                let Some((src, _, dst)) = self.endpoints() else {
                    return;
                };
                let now = ctx.now();
                let Some(flight) = self
                    .sender
                    .as_mut()
                    .and_then(|s| s.on_window_timeout(generation, src, dst, now))
                else {
                    return;
                };
                self.stats.timeouts += 1;
                log::debug!(
                    "[tcp {}:{} {}] window timeout; resending {} segment(s) from seq={}",
                    ctx.addr,
                    src,
                    self.id,
                    flight.segments.len(),
                    flight.segments.first().map_or(0, |s| s.seq)
                );
                self.transmit_flight(flight, ctx);
            }
        }
    }

    fn check_shutdown(&mut self, fin_seq: u32, ctx: &mut Ctx<'_>) {
        let drained = self
            .sender
            .as_ref()
            .is_some_and(|s| s.is_drained() && s.snd_una() == fin_seq);
        if !drained {
            ctx.schedule(
                ctx.config.timers.shutdown_check,
                self.id,
                TimerEvent::ShutdownCheck { fin_seq },
            );
            return;
        }
        if let Some((src, _, dst)) = self.endpoints() {
            self.send(ctx, &Segment::control(src, dst, SegmentKind::Fin, 0, fin_seq));
        }
        log::debug!(
            "[tcp {}:{} {}] → FIN seq={}; SHUTDOWN → CLOSED",
            ctx.addr,
            self.port(),
            self.id,
            fin_seq
        );
        self.state = SocketState::Closed;
        self.destroy(ctx.demux);
    }

    // -----------------------------------------------------------------------
    // Output helpers
    // -----------------------------------------------------------------------

    fn send_syn(&mut self, ctx: &mut Ctx<'_>) {
        let Some((src, _, dst)) = self.endpoints() else {
            return;
        };
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        let syn = Segment::control(src, dst, SegmentKind::Syn, sender.cwnd(), sender.isn());
        self.send(ctx, &syn);
    }

    fn send_syn_ack(&mut self, ctx: &mut Ctx<'_>) {
        let Some((src, _, dst)) = self.endpoints() else {
            return;
        };
        let (Some(sender), Some(receiver)) = (self.sender.as_ref(), self.receiver.as_ref()) else {
            return;
        };
        let syn_ack = Segment {
            src_port: src,
            dst_port: dst,
            kind: SegmentKind::Ack,
            window: receiver.window(),
            seq: receiver.ack_number(),
            payload: sender.isn().to_be_bytes().to_vec(),
        };
        self.send(ctx, &syn_ack);
    }

    fn send_ack(&mut self, ctx: &mut Ctx<'_>) {
        let Some((src, _, dst)) = self.endpoints() else {
            return;
        };
        let Some(receiver) = self.receiver.as_ref() else {
            return;
        };
        let ack = Segment::control(
            src,
            dst,
            SegmentKind::Ack,
            receiver.window(),
            receiver.ack_number(),
        );
        self.send(ctx, &ack);
    }

    fn send_window(&mut self, ctx: &mut Ctx<'_>) {
        let Some((src, _, dst)) = self.endpoints() else {
            return;
        };
        let now = ctx.now();
        if let Some(flight) = self
            .sender
            .as_mut()
            .and_then(|s| s.next_window(src, dst, now))
        {
            self.transmit_flight(flight, ctx);
        }
    }

    fn transmit_flight(&mut self, flight: Flight, ctx: &mut Ctx<'_>) {
        if flight.retransmit {
            self.stats.windows_retransmitted += 1;
        }
        for segment in &flight.segments {
            self.send(ctx, segment);
        }
        ctx.schedule(
            flight.timeout,
            self.id,
            TimerEvent::WindowTimeout {
                generation: flight.generation,
            },
        );
    }

    fn send(&mut self, ctx: &mut Ctx<'_>, segment: &Segment) {
        let Some((addr, port)) = self.remote else {
            return;
        };
        log::trace!(
            "[tcp {}:{} {}] → {} {}:{} seq={} win={} len={}",
            ctx.addr,
            segment.src_port,
            self.id,
            segment.kind,
            addr,
            port,
            segment.seq,
            segment.window,
            segment.payload.len()
        );
        if ctx.send(addr, segment) {
            self.stats.segments_sent += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host::testing::RecordingHost;

    const CLIENT: NodeAddr = 1;
    const SERVER: NodeAddr = 2;

    struct Node {
        config: Config,
        demux: Demux,
        host: RecordingHost,
    }

    impl Node {
        fn new() -> Self {
            Self {
                config: Config {
                    mss: 10,
                    buffer_size: 100,
                    ..Config::default()
                },
                demux: Demux::default(),
                host: RecordingHost::default(),
            }
        }

        fn ctx(&mut self, addr: NodeAddr) -> Ctx<'_> {
            Ctx {
                addr,
                config: &self.config,
                host: &mut self.host,
                demux: &mut self.demux,
            }
        }
    }

    fn established_pair() -> (Socket, Node, Socket, Node) {
        let mut cnode = Node::new();
        let mut snode = Node::new();

        let mut listener = Socket::new(SocketId(1));
        listener.bind(80, &mut snode.demux).unwrap();
        listener.listen(2, &mut snode.demux).unwrap();

        let mut client = Socket::new(SocketId(1));
        client.bind(5000, &mut cnode.demux).unwrap();
        client.connect(SERVER, 80, &mut cnode.ctx(CLIENT)).unwrap();
        let syn = cnode.host.take_segments().remove(0);

        let mut child = listener
            .on_syn(&syn, CLIENT, SocketId(2), &mut snode.ctx(SERVER))
            .unwrap();
        let syn_ack = snode.host.take_segments().remove(0);
        client.on_segment(&syn_ack, &mut cnode.ctx(CLIENT));
        let ack = cnode.host.take_segments().remove(0);
        child.on_segment(&ack, &mut snode.ctx(SERVER));
        (client, cnode, child, snode)
    }

    #[test]
    fn bind_twice_is_rejected() {
        let mut demux = Demux::default();
        let mut a = Socket::new(SocketId(1));
        let mut b = Socket::new(SocketId(2));
        a.bind(80, &mut demux).unwrap();
        assert_eq!(a.bind(81, &mut demux), Err(SocketError::AlreadyBound(80)));
        assert_eq!(b.bind(80, &mut demux), Err(SocketError::PortInUse(80)));
    }

    #[test]
    fn listen_requires_bound_closed_socket() {
        let mut demux = Demux::default();
        let mut s = Socket::new(SocketId(1));
        assert_eq!(s.listen(1, &mut demux), Err(SocketError::NotBound));
        s.bind(80, &mut demux).unwrap();
        s.listen(1, &mut demux).unwrap();
        assert_eq!(
            s.listen(1, &mut demux),
            Err(SocketError::InvalidState(SocketState::Listen))
        );
    }

    #[test]
    fn connect_sends_syn_and_arms_retransmit() {
        let mut node = Node::new();
        let mut s = Socket::new(SocketId(3));
        s.bind(5000, &mut node.demux).unwrap();
        s.connect(SERVER, 80, &mut node.ctx(CLIENT)).unwrap();

        assert!(s.state().is_connection_pending());
        let segs = node.host.take_segments();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].kind, SegmentKind::Syn);
        assert_eq!(segs[0].seq, 0);
        assert_eq!(segs[0].window, 10);
        assert_eq!(
            node.host.timers[0].1.event,
            TimerEvent::RetransmitSyn { isn: 0 }
        );
    }

    #[test]
    fn handshake_establishes_both_sides() {
        let (client, _, child, _) = established_pair();
        assert!(client.state().is_connected());
        assert!(child.state().is_connected());
        assert_eq!(client.remote(), Some((SERVER, 80)));
        assert_eq!(child.remote(), Some((CLIENT, 5000)));
        assert_eq!(child.local_port(), Some(80));
        assert!(child.peer_confirmed);
        // The confirming ACK advertised the client's free receive space.
        assert_eq!(child.sender().unwrap().rwnd(), 99);
    }

    #[test]
    fn syn_timer_is_stale_after_handshake() {
        let (mut client, mut cnode, _, _) = established_pair();
        client.on_timer(TimerEvent::RetransmitSyn { isn: 0 }, &mut cnode.ctx(CLIENT));
        assert!(cnode.host.take_segments().is_empty());
    }

    #[test]
    fn data_flows_and_is_acked() {
        let (mut client, mut cnode, mut child, mut snode) = established_pair();
        assert_eq!(client.write(b"hello", &mut cnode.ctx(CLIENT)), 5);
        let data = cnode.host.take_segments();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].seq, 1);

        child.on_segment(&data[0], &mut snode.ctx(SERVER));
        let ack = snode.host.take_segments().remove(0);
        assert_eq!(ack.kind, SegmentKind::Ack);
        assert_eq!(ack.seq, 6);

        let mut out = [0u8; 16];
        let n = child.read(&mut out);
        assert_eq!(&out[..n], b"hello");

        client.on_segment(&ack, &mut cnode.ctx(CLIENT));
        assert!(client.sender().unwrap().is_drained());
        assert_eq!(client.stats().bytes_acked, 5);
    }

    #[test]
    fn out_of_order_data_is_reacked_with_old_number() {
        let (_, _, mut child, mut snode) = established_pair();
        let seg = Segment {
            src_port: 5000,
            dst_port: 80,
            kind: SegmentKind::Data,
            window: 10,
            seq: 11,
            payload: b"later".to_vec(),
        };
        child.on_segment(&seg, &mut snode.ctx(SERVER));
        let ack = snode.host.take_segments().remove(0);
        assert_eq!(ack.seq, 1);
        assert_eq!(child.readable(), 0);
    }

    #[test]
    fn write_outside_established_returns_zero() {
        let mut node = Node::new();
        let mut s = Socket::new(SocketId(1));
        assert_eq!(s.write(b"abc", &mut node.ctx(CLIENT)), 0);
    }

    #[test]
    fn close_defers_fin_until_drained() {
        let (mut client, mut cnode, mut child, mut snode) = established_pair();
        client.write(&[7u8; 25], &mut cnode.ctx(CLIENT));
        client.close(&mut cnode.ctx(CLIENT));
        assert!(client.state().is_closure_pending());
        assert_eq!(client.fin_seq, Some(26));

        // Nothing acked yet: the check re-arms without sending FIN.
        cnode.host.take_segments();
        client.on_timer(TimerEvent::ShutdownCheck { fin_seq: 26 }, &mut cnode.ctx(CLIENT));
        assert!(cnode.host.take_segments().is_empty());

        // Drive the transfer to completion by hand.
        let mut pending = vec![Segment {
            src_port: 5000,
            dst_port: 80,
            kind: SegmentKind::Data,
            window: 10,
            seq: 1,
            payload: vec![7u8; 10],
        }];
        while let Some(seg) = pending.pop() {
            child.on_segment(&seg, &mut snode.ctx(SERVER));
            for ack in snode.host.take_segments() {
                client.on_segment(&ack, &mut cnode.ctx(CLIENT));
            }
            pending.extend(cnode.host.take_segments().into_iter().rev());
        }
        assert!(client.sender().unwrap().is_drained());

        client.on_timer(TimerEvent::ShutdownCheck { fin_seq: 26 }, &mut cnode.ctx(CLIENT));
        let fin = cnode.host.take_segments();
        assert_eq!(fin.len(), 1);
        assert_eq!(fin[0].kind, SegmentKind::Fin);
        assert_eq!(fin[0].seq, 26);
        assert!(client.state().is_closed());
    }

    #[test]
    fn peer_fin_abandons_unsent_data() {
        let (mut client, mut cnode, _, _) = established_pair();
        client.write(&[1u8; 40], &mut cnode.ctx(CLIENT));
        let fin = Segment::control(80, 5000, SegmentKind::Fin, 0, 1);
        client.on_segment(&fin, &mut cnode.ctx(CLIENT));
        assert!(client.state().is_closure_pending());
        assert!(client.peer_closed());
        assert!(client.sender().unwrap().is_drained());
    }

    #[test]
    fn fin_in_syn_sent_aborts() {
        let mut node = Node::new();
        let mut s = Socket::new(SocketId(1));
        s.bind(5000, &mut node.demux).unwrap();
        s.connect(SERVER, 80, &mut node.ctx(CLIENT)).unwrap();
        let reset = Segment::control(80, 5000, SegmentKind::Fin, 0, 0);
        s.on_segment(&reset, &mut node.ctx(CLIENT));
        assert!(s.state().is_closed());
        assert!(node.demux.can_bind(5000));
        // The port went back to the demux, so it cannot be reused from here.
        assert_eq!(s.listen(1, &mut node.demux), Err(SocketError::NotBound));
        assert_eq!(node.demux.listener(5000), None);
    }

    #[test]
    fn spawned_connection_never_owns_the_listener_port() {
        let (_, _, mut child, mut snode) = established_pair();
        let fin = Segment::control(5000, 80, SegmentKind::Fin, 0, 1);
        child.on_segment(&fin, &mut snode.ctx(SERVER));
        child.on_timer(TimerEvent::ShutdownCheck { fin_seq: 1 }, &mut snode.ctx(SERVER));
        assert!(child.state().is_closed());

        assert_eq!(child.listen(1, &mut snode.demux), Err(SocketError::NotBound));
        assert_eq!(
            child.connect(CLIENT, 6000, &mut snode.ctx(SERVER)),
            Err(SocketError::NotBound)
        );
        assert_eq!(snode.demux.listener(80), Some(SocketId(1)));
    }

    #[test]
    fn full_backlog_refuses_syn() {
        let mut node = Node::new();
        let mut listener = Socket::new(SocketId(1));
        listener.bind(80, &mut node.demux).unwrap();
        listener.listen(1, &mut node.demux).unwrap();
        let syn = |port| Segment::control(port, 80, SegmentKind::Syn, 10, 0);

        assert!(listener
            .on_syn(&syn(5000), CLIENT, SocketId(2), &mut node.ctx(SERVER))
            .is_some());
        assert!(listener
            .on_syn(&syn(5001), CLIENT, SocketId(3), &mut node.ctx(SERVER))
            .is_none());
        assert_eq!(listener.accept(), Some(SocketId(2)));
        assert_eq!(listener.accept(), None);
    }
}

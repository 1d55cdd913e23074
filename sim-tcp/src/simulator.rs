//! Deterministic network simulator.
//!
//! Real networks drop, reorder, and duplicate packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`Simulator`] hosts any number of [`TcpManager`] nodes on a virtual clock
//! and moves packets between them through a configurable fault model:
//!
//! | Fault            | Description                                      |
//! |------------------|--------------------------------------------------|
//! | Packet loss      | Drop a packet with probability `loss_rate`.      |
//! | Reordering       | Delay a packet by `reorder_delay`, letting later |
//! |                  | packets overtake it.                             |
//! | Duplication      | Deliver a packet twice.                          |
//! | Corruption       | Flip one random bit of the payload.              |
//! | Bandwidth cap    | Serialise each node's output at `bw_limit` B/s.  |
//! | Jitter           | Add up to `jitter` to each packet's latency.     |
//!
//! All randomness comes from one [`StdRng`] seeded from `seed`, so a run is
//! reproducible.  Tests that need one specific loss use
//! [`Simulator::set_drop_filter`] instead.
//!
//! Events (packet deliveries and timers) are processed one at a time in
//! (virtual time, insertion order).  Every packet handed to the network is
//! recorded in the [`trace`](Simulator::trace).

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::error::ConfigError;
use crate::host::Host;
use crate::manager::TcpManager;
use crate::packet::{NodeAddr, Packet, Protocol};
use crate::segment::Segment;
use crate::timer::Timer;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// One-way delay applied to every packet.
    pub latency: Duration,
    /// Extra uniformly random delay in `[0, jitter]`.
    pub jitter: Duration,
    /// Probability that any given packet is silently dropped.
    pub loss_rate: f64,
    /// Probability that a packet is duplicated.
    pub duplicate_rate: f64,
    /// Probability that a packet is reordered.
    pub reorder_rate: f64,
    /// Fixed delay applied to reordered packets.
    pub reorder_delay: Duration,
    /// Probability that one payload bit is flipped.
    pub corruption_rate: f64,
    /// Optional bandwidth cap in bytes per second (`None` = unlimited).
    pub bw_limit: Option<u64>,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: a fixed-latency pass-through.
        Self {
            latency: Duration::from_millis(10),
            jitter: Duration::ZERO,
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::from_millis(30),
            corruption_rate: 0.0,
            bw_limit: None,
            seed: 0,
        }
    }
}

impl SimulatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("loss_rate", self.loss_rate),
            ("duplicate_rate", self.duplicate_rate),
            ("reorder_rate", self.reorder_rate),
            ("corruption_rate", self.corruption_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidProbability { name, value });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

/// What the network did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    /// Scheduled for delivery (possibly late, duplicated or corrupted).
    Delivered,
    /// Dropped by the random loss model.
    Lost,
    /// Dropped by the drop filter.
    Filtered,
    /// No node with the destination address exists.
    Unroutable,
}

/// One packet handed to the network.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    /// Virtual time of transmission.
    pub at: Duration,
    /// The packet as sent, before any corruption.
    pub packet: Packet,
    pub fate: Fate,
}

impl TraceEntry {
    /// Decode the transport segment carried by this packet.
    pub fn segment(&self) -> Option<Segment> {
        if self.packet.protocol != Protocol::Transport {
            return None;
        }
        Segment::unpack(&self.packet.payload).ok()
    }
}

/// Fault counters over the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub sent: u64,
    pub lost: u64,
    pub filtered: u64,
    pub duplicated: u64,
    pub reordered: u64,
    pub corrupted: u64,
}

// ---------------------------------------------------------------------------
// Event queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Event {
    Deliver(Packet),
    Timer { node: NodeAddr, timer: Timer },
}

#[derive(Debug)]
struct Scheduled {
    at: Duration,
    order: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.order == other.order
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the earliest event first.
        (other.at, other.order).cmp(&(self.at, self.order))
    }
}

type DropFilter = Box<dyn FnMut(&Packet) -> bool>;

/// Everything except the nodes themselves, so a node can be borrowed
/// mutably alongside the network it sends into.
struct Network {
    config: SimulatorConfig,
    rng: StdRng,
    now: Duration,
    queue: BinaryHeap<Scheduled>,
    order: u64,
    trace: Vec<TraceEntry>,
    stats: NetworkStats,
    drop_filter: Option<DropFilter>,
    /// Per-sender time at which its outgoing link becomes idle.
    link_free_at: HashMap<NodeAddr, Duration>,
    addrs: Vec<NodeAddr>,
}

impl Network {
    fn push(&mut self, at: Duration, event: Event) {
        self.order += 1;
        self.queue.push(Scheduled {
            at,
            order: self.order,
            event,
        });
    }

    fn record(&mut self, packet: Packet, fate: Fate) {
        self.trace.push(TraceEntry {
            at: self.now,
            packet,
            fate,
        });
    }

    fn transmit(&mut self, packet: Packet) {
        self.stats.sent += 1;
        if !self.addrs.contains(&packet.dest) {
            log::debug!("[sim] no node {}; dropping packet from {}", packet.dest, packet.src);
            self.record(packet, Fate::Unroutable);
            return;
        }
        if let Some(filter) = self.drop_filter.as_mut() {
            if filter(&packet) {
                log::debug!("[sim] filter dropped packet {} → {}", packet.src, packet.dest);
                self.stats.filtered += 1;
                self.record(packet, Fate::Filtered);
                return;
            }
        }
        if self.roll(self.config.loss_rate) {
            log::debug!("[sim] lost packet {} → {} seq={}", packet.src, packet.dest, packet.seq);
            self.stats.lost += 1;
            self.record(packet, Fate::Lost);
            return;
        }

        let mut wire = packet.clone();
        if !wire.payload.is_empty() && self.roll(self.config.corruption_rate) {
            let byte = self.rng.random_range(0..wire.payload.len());
            let bit = self.rng.random_range(0..8u8);
            wire.payload[byte] ^= 1 << bit;
            self.stats.corrupted += 1;
        }

        let mut at = self.departure(&packet) + self.config.latency + self.jitter();
        if self.roll(self.config.reorder_rate) {
            at += self.config.reorder_delay;
            self.stats.reordered += 1;
        }
        if self.roll(self.config.duplicate_rate) {
            let again = at + self.jitter();
            self.push(again, Event::Deliver(wire.clone()));
            self.stats.duplicated += 1;
        }
        self.push(at, Event::Deliver(wire));
        self.record(packet, Fate::Delivered);
    }

    /// When the last bit of `packet` leaves the sender's link.
    fn departure(&mut self, packet: &Packet) -> Duration {
        let Some(rate) = self.config.bw_limit.filter(|&r| r > 0) else {
            return self.now;
        };
        let bytes = packet.payload.len() as u64;
        let tx = Duration::from_nanos(bytes.saturating_mul(1_000_000_000) / rate);
        let free = self.link_free_at.entry(packet.src).or_insert(self.now);
        let start = (*free).max(self.now);
        *free = start + tx;
        *free
    }

    fn jitter(&mut self) -> Duration {
        let max = self.config.jitter.as_nanos() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.rng.random_range(0..=max))
    }

    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.random_bool(probability)
    }
}

// ---------------------------------------------------------------------------
// NodeHost
// ---------------------------------------------------------------------------

/// The [`Host`] a node sees while the simulator runs one of its callbacks.
struct NodeHost<'a> {
    addr: NodeAddr,
    net: &'a mut Network,
}

impl Host for NodeHost<'_> {
    fn now(&self) -> Duration {
        self.net.now
    }

    fn send_packet(&mut self, packet: Packet) {
        self.net.transmit(packet);
    }

    fn schedule(&mut self, delay: Duration, timer: Timer) {
        let at = self.net.now.saturating_add(delay);
        self.net.push(
            at,
            Event::Timer {
                node: self.addr,
                timer,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct Simulator {
    nodes: BTreeMap<NodeAddr, TcpManager>,
    net: Network,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            nodes: BTreeMap::new(),
            net: Network {
                config,
                rng,
                now: Duration::ZERO,
                queue: BinaryHeap::new(),
                order: 0,
                trace: Vec::new(),
                stats: NetworkStats::default(),
                drop_filter: None,
                link_free_at: HashMap::new(),
                addrs: Vec::new(),
            },
        })
    }

    /// Attach a node running a fresh [`TcpManager`].
    pub fn add_node(&mut self, addr: NodeAddr, config: Config) -> Result<(), ConfigError> {
        if self.nodes.contains_key(&addr) {
            return Err(ConfigError::DuplicateNode(addr));
        }
        self.nodes.insert(addr, TcpManager::new(addr, config)?);
        self.net.addrs.push(addr);
        Ok(())
    }

    pub fn node(&self, addr: NodeAddr) -> Option<&TcpManager> {
        self.nodes.get(&addr)
    }

    /// Run `f` against a node's manager with that node's [`Host`].
    pub fn with_node<R>(
        &mut self,
        addr: NodeAddr,
        f: impl FnOnce(&mut TcpManager, &mut dyn Host) -> R,
    ) -> Option<R> {
        let manager = self.nodes.get_mut(&addr)?;
        let mut host = NodeHost {
            addr,
            net: &mut self.net,
        };
        Some(f(manager, &mut host))
    }

    /// Drop every packet for which `filter` returns `true`.
    pub fn set_drop_filter(&mut self, filter: impl FnMut(&Packet) -> bool + 'static) {
        self.net.drop_filter = Some(Box::new(filter));
    }

    pub fn now(&self) -> Duration {
        self.net.now
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.net.trace
    }

    pub fn stats(&self) -> NetworkStats {
        self.net.stats
    }

    /// Number of deliveries and timers not yet processed.
    pub fn pending_events(&self) -> usize {
        self.net.queue.len()
    }

    /// Process the earliest event.  Returns `false` when the queue is empty.
    pub fn step(&mut self) -> bool {
        let Some(Scheduled { at, event, .. }) = self.net.queue.pop() else {
            return false;
        };
        self.net.now = at;
        match event {
            Event::Deliver(packet) => {
                let Some(manager) = self.nodes.get_mut(&packet.dest) else {
                    return true;
                };
                let mut host = NodeHost {
                    addr: packet.dest,
                    net: &mut self.net,
                };
                manager.on_packet(&packet, &mut host);
            }
            Event::Timer { node, timer } => {
                let Some(manager) = self.nodes.get_mut(&node) else {
                    return true;
                };
                let mut host = NodeHost {
                    addr: node,
                    net: &mut self.net,
                };
                manager.on_timer(timer, &mut host);
            }
        }
        true
    }

    /// Process every event due within `duration`, then advance the clock to
    /// the end of that interval.
    pub fn run_for(&mut self, duration: Duration) {
        let deadline = self.net.now.saturating_add(duration);
        while self.net.queue.peek().is_some_and(|e| e.at <= deadline) {
            self.step();
        }
        self.net.now = deadline;
    }

    /// Step until `done` holds, the queue runs dry, or the next event lies
    /// beyond `limit` from now.  Returns whether `done` was satisfied.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&mut Self) -> bool) -> bool {
        let deadline = self.net.now.saturating_add(limit);
        loop {
            if done(self) {
                return true;
            }
            match self.net.queue.peek() {
                Some(next) if next.at <= deadline => {
                    self.step();
                }
                _ => return false,
            }
        }
    }
}

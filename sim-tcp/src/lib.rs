//! `sim-tcp`: a TCP-like reliable byte stream over a simulated, unreliable
//! packet network.
//!
//! # Architecture
//!
//! ```text
//!   application                         ┌────────────────────────────┐
//!   socket()/bind()/listen()/accept()   │         TcpManager         │
//!   connect()/write()/read()/close() ──▶│  ┌───────┐   ┌──────────┐  │
//!                                       │  │ Demux │──▶│  Socket  │  │
//!                                       │  └───▲───┘   │ ├ Sender │  │
//!                                       │      │       │ └ Receiver  │
//!                                       └──────┼───────┴────┬─────┘──┘
//!                          on_packet / on_timer│            │ send_packet / schedule
//!                                       ┌──────┴────────────▼─────┐
//!                                       │     Host (Simulator)    │
//!                                       └─────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`segment`]   : wire format (pack / unpack, checksum)
//! - [`packet`]    : network-layer envelope carrying a segment
//! - [`buffer`]    : circular send / receive byte buffer
//! - [`congestion`]: slow start, congestion avoidance, fast recovery
//! - [`timer`]     : RTT estimation, RTO back-off, timer events
//! - [`state`]     : connection finite-state-machine types
//! - [`sender`]    : outbound windowing and retransmission state
//! - [`receiver`]  : inbound in-order delivery
//! - [`socket`]    : per-connection state machine and event handlers
//! - [`demux`]     : port binding and segment routing
//! - [`manager`]   : per-node socket table and application API
//! - [`host`]      : clock / network collaborator trait
//! - [`simulator`] : deterministic lossy network used by tests and the CLI
//! - [`config`]    : transport parameters
//! - [`error`]     : error types

pub mod buffer;
pub mod config;
pub mod congestion;
pub mod demux;
pub mod error;
pub mod host;
pub mod manager;
pub mod packet;
pub mod receiver;
pub mod segment;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod timer;

pub use config::Config;
pub use error::{ConfigError, SocketError};
pub use host::Host;
pub use manager::TcpManager;
pub use packet::{NodeAddr, Packet};
pub use segment::{Segment, SegmentKind};
pub use simulator::{Simulator, SimulatorConfig};
pub use socket::{SocketId, SocketStats};
pub use state::SocketState;
pub use timer::TimerConfig;

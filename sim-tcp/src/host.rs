//! Services a node borrows from whatever is hosting it.
//!
//! The transport core never owns a clock or a network.  Every entry point on
//! [`crate::manager::TcpManager`] that may emit packets or arm timers takes a
//! `&mut dyn Host`; the simulator (or any other driver) implements it.

use std::time::Duration;

use crate::packet::Packet;
use crate::timer::Timer;

pub trait Host {
    /// Current virtual time.
    fn now(&self) -> Duration;

    /// Hand a packet to the network.  Delivery is best effort.
    fn send_packet(&mut self, packet: Packet);

    /// Deliver `timer` back to the owning node once, after `delay`.
    ///
    /// There is no cancellation; handlers re-validate the event when it fires.
    fn schedule(&mut self, delay: Duration, timer: Timer);
}

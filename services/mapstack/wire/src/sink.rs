//! Packet consumer and poll capabilities.
//!
//! A stage that accepts packets implements [`PacketSink`]; a stage that needs
//! periodic cooperative polling implements [`Process`]. Stages are wired
//! together through shared handles so one stage can feed several others.

use crate::packet::{PacketId, PacketPool};
use crate::status::Status;
use std::cell::RefCell;
use std::rc::Rc;

/// Accepts packets by handle.
///
/// A sink that keeps `packet` beyond the call must take a reference on it
/// through the pool first and release it when done.
pub trait PacketSink {
    /// Offer a packet viewed from the header at `header_offset`.
    ///
    /// Returns `Good` when accepted, `Busy` to ask for a retry and `Bad`
    /// when the packet is rejected.
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8)
        -> Status;
}

/// Cooperative polling step.
pub trait Process {
    /// Make as much progress as possible without blocking
    fn process(&mut self, pool: &mut PacketPool) -> Status;
}

/// Shared packet sink handle
pub type SharedSink = Rc<RefCell<dyn PacketSink>>;

/// Shared pollable handle
pub type SharedProcess = Rc<RefCell<dyn Process>>;

/// A packet handle paired with the header it should be viewed from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPacket {
    /// Packet handle
    pub packet: PacketId,
    /// Header level within the packet
    pub header_offset: u8,
}

impl OffsetPacket {
    /// Pair a handle with a header offset
    pub fn new(packet: PacketId, header_offset: u8) -> Self {
        Self {
            packet,
            header_offset,
        }
    }
}

impl<T: PacketSink + ?Sized> PacketSink for Box<T> {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        (**self).sink_packet(pool, packet, header_offset)
    }
}

impl<T: PacketSink + ?Sized> PacketSink for Rc<RefCell<T>> {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        self.borrow_mut().sink_packet(pool, packet, header_offset)
    }
}

impl<T: Process + ?Sized> Process for Rc<RefCell<T>> {
    fn process(&mut self, pool: &mut PacketPool) -> Status {
        self.borrow_mut().process(pool)
    }
}

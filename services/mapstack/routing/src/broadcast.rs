//! Unconditional fan-out

use crate::error::RoutingError;
use mapstack_wire::{PacketId, PacketPool, PacketSink, SharedSink, Status};
use smallvec::SmallVec;

/// Most sinks one router feeds
pub const MAX_BROADCAST_SINKS: usize = 255;

/// Forwards every packet to every registered sink.
///
/// The packet is referenced for the duration of the fan-out so a sink that
/// drops the last other reference cannot free it mid-broadcast.
#[derive(Default)]
pub struct BroadcastRouter {
    sinks: SmallVec<[SharedSink; 4]>,
}

impl BroadcastRouter {
    /// Router with no sinks
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink
    pub fn add_sink(&mut self, sink: SharedSink) -> Result<(), RoutingError> {
        if self.sinks.len() >= MAX_BROADCAST_SINKS {
            return Err(RoutingError::TooManySinks(self.sinks.len()));
        }
        self.sinks.push(sink);
        Ok(())
    }

    /// Number of registered sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// No sinks registered
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl PacketSink for BroadcastRouter {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        if pool.reference(packet).is_err() {
            return Status::Bad;
        }
        for sink in &self.sinks {
            sink.borrow_mut().sink_packet(pool, packet, header_offset);
        }
        pool.dereference(packet);
        Status::Good
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Takes over the caller's reference and drops it immediately
    struct Releaser;

    impl PacketSink for Releaser {
        fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, _: u8) -> Status {
            pool.dereference(packet);
            Status::Good
        }
    }

    #[derive(Default)]
    struct Seen(Vec<bool>);

    impl PacketSink for Seen {
        fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, _: u8) -> Status {
            self.0.push(pool.is_live(packet));
            Status::Good
        }
    }

    #[test]
    fn test_packet_outlives_fan_out() {
        let mut pool = PacketPool::default();
        let seen = Rc::new(RefCell::new(Seen::default()));
        let mut router = BroadcastRouter::new();
        router.add_sink(Rc::new(RefCell::new(Releaser))).unwrap();
        router.add_sink(seen.clone()).unwrap();
        assert_eq!(router.len(), 2);

        let id = pool.allocate_from(&[1, 2]).unwrap();
        assert_eq!(router.sink_packet(&mut pool, id, 0), Status::Good);
        assert_eq!(seen.borrow().0, vec![true]);
        assert!(!pool.is_live(id));
        assert_eq!(router.sink_packet(&mut pool, id, 0), Status::Bad);
    }
}

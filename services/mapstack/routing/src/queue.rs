//! Packet queue that absorbs downstream backpressure

use mapstack_wire::{OffsetPacket, PacketId, PacketPool, PacketSink, Process, SharedSink, Status};
use std::collections::VecDeque;
use tracing::trace;

/// Default queue depth
pub const DEFAULT_QUEUE_DEPTH: usize = 1;

/// Holds packets a busy sink could not take yet.
///
/// Packets pass straight through while the queue is empty and the sink
/// accepts them. A `Busy` sink gets the packet queued (with a reference) and
/// retried from [`Process::process`]; packets arriving while others wait are
/// queued behind them.
pub struct PacketQueue {
    sink: SharedSink,
    queue: VecDeque<OffsetPacket>,
    depth: usize,
}

impl PacketQueue {
    /// Queue of [`DEFAULT_QUEUE_DEPTH`] in front of `sink`
    pub fn new(sink: SharedSink) -> Self {
        Self::with_depth(sink, DEFAULT_QUEUE_DEPTH)
    }

    /// Queue holding up to `depth` packets
    pub fn with_depth(sink: SharedSink, depth: usize) -> Self {
        Self {
            sink,
            queue: VecDeque::with_capacity(depth),
            depth,
        }
    }

    /// Packets waiting
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Nothing waiting
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// No room for another packet
    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.depth
    }
}

impl PacketSink for PacketQueue {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        if self.queue.is_empty() {
            let status = self.sink.borrow_mut().sink_packet(pool, packet, header_offset);
            if status != Status::Busy {
                return status;
            }
        }
        if self.is_full() || pool.reference(packet).is_err() {
            return Status::Busy;
        }
        trace!("queue: holding {}", packet);
        self.queue.push_back(OffsetPacket::new(packet, header_offset));
        Status::Good
    }
}

impl Process for PacketQueue {
    fn process(&mut self, pool: &mut PacketPool) -> Status {
        let Some(&head) = self.queue.front() else {
            return Status::Good;
        };
        let status = self
            .sink
            .borrow_mut()
            .sink_packet(pool, head.packet, head.header_offset);
        if status != Status::Busy {
            self.queue.pop_front();
            pool.dereference(head.packet);
        }
        Status::Good
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Busy until opened, then records packets
    #[derive(Default)]
    struct Gate {
        open: bool,
        taken: Vec<PacketId>,
    }

    impl PacketSink for Gate {
        fn sink_packet(&mut self, _: &mut PacketPool, packet: PacketId, _: u8) -> Status {
            if !self.open {
                return Status::Busy;
            }
            self.taken.push(packet);
            Status::Good
        }
    }

    #[test]
    fn test_pass_through() {
        let mut pool = PacketPool::default();
        let gate = Rc::new(RefCell::new(Gate {
            open: true,
            ..Gate::default()
        }));
        let mut queue = PacketQueue::new(gate.clone());
        let id = pool.allocate_from(&[1]).unwrap();
        assert_eq!(queue.sink_packet(&mut pool, id, 0), Status::Good);
        assert!(queue.is_empty());
        assert_eq!(pool.reference_count(id), 1);
        assert_eq!(gate.borrow().taken, vec![id]);
    }

    #[test]
    fn test_queue_and_retry() {
        let mut pool = PacketPool::default();
        let gate = Rc::new(RefCell::new(Gate::default()));
        let mut queue = PacketQueue::new(gate.clone());

        let first = pool.allocate_from(&[1]).unwrap();
        let second = pool.allocate_from(&[2]).unwrap();
        assert_eq!(queue.sink_packet(&mut pool, first, 0), Status::Good);
        assert_eq!(pool.reference_count(first), 2);
        assert!(queue.is_full());
        assert_eq!(queue.sink_packet(&mut pool, second, 0), Status::Busy);
        assert_eq!(pool.reference_count(second), 1);

        // the caller lets go; the queue keeps the packet alive
        pool.dereference(first);
        assert_eq!(queue.process(&mut pool), Status::Good);
        assert_eq!(queue.len(), 1);

        gate.borrow_mut().open = true;
        assert_eq!(queue.process(&mut pool), Status::Good);
        assert!(queue.is_empty());
        assert_eq!(gate.borrow().taken, vec![first]);
        assert!(!pool.is_live(first));
    }

    #[test]
    fn test_order_preserved_behind_queue() {
        let mut pool = PacketPool::default();
        let gate = Rc::new(RefCell::new(Gate::default()));
        let mut queue = PacketQueue::with_depth(gate.clone(), 2);

        let first = pool.allocate_from(&[1]).unwrap();
        let second = pool.allocate_from(&[2]).unwrap();
        assert_eq!(queue.sink_packet(&mut pool, first, 0), Status::Good);
        gate.borrow_mut().open = true;
        // queued behind `first` even though the sink would accept it now
        assert_eq!(queue.sink_packet(&mut pool, second, 0), Status::Good);
        assert!(gate.borrow().taken.is_empty());

        queue.process(&mut pool);
        queue.process(&mut pool);
        assert_eq!(gate.borrow().taken, vec![first, second]);
    }
}

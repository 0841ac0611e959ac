//! Reference-counted packet buffers.
//!
//! Packets live in a [`PacketPool`] arena and are addressed by [`PacketId`]
//! handles carrying a slot generation. A slot is recycled only when its
//! reference count drops to zero, after which every old handle is stale and
//! rejected instead of aliasing the next packet stored there. A slot whose
//! generation counter runs out is retired rather than wrapped.
//!
//! Buffer capacity is charged against an [`Allocator`]; growth fails cleanly
//! when the allocator is exhausted or an explicit ceiling is reached, and a
//! failed append never leaves a partial write behind.

use crate::c78::C78Bytes;
use crate::error::PacketError;
use crate::status::Status;
use std::fmt;
use std::ops::Range;
use tracing::{trace, warn};

/// Byte budget collaborator backing packet storage
pub trait Allocator {
    /// Reserve `size` bytes; false when exhausted
    fn allocate(&mut self, size: usize) -> bool;

    /// Return `size` bytes
    fn deallocate(&mut self, size: usize);
}

/// Allocator bounded by a fixed byte budget
#[derive(Debug, Clone)]
pub struct BudgetAllocator {
    budget: usize,
    in_use: usize,
}

impl BudgetAllocator {
    /// Create an allocator holding `budget` bytes
    pub fn new(budget: usize) -> Self {
        Self { budget, in_use: 0 }
    }

    /// Bytes currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Bytes still available
    pub fn available(&self) -> usize {
        self.budget.saturating_sub(self.in_use)
    }
}

impl Allocator for BudgetAllocator {
    fn allocate(&mut self, size: usize) -> bool {
        if size > self.available() {
            return false;
        }
        self.in_use += size;
        true
    }

    fn deallocate(&mut self, size: usize) {
        self.in_use = self.in_use.saturating_sub(size);
    }
}

/// Allocator that never refuses
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl Allocator for Unbounded {
    fn allocate(&mut self, _size: usize) -> bool {
        true
    }

    fn deallocate(&mut self, _size: usize) {}
}

/// Generation-checked packet handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId {
    index: u16,
    generation: u32,
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Packet byte storage with status and reference count
#[derive(Debug)]
pub struct PacketBuffer {
    data: Vec<u8>,
    capacity: usize,
    status: Status,
    references: u8,
}

impl PacketBuffer {
    /// Bytes used
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// No bytes used
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes reserved against the allocator
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes that can be appended without growth
    pub fn available(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// No room left without growth
    pub fn is_full(&self) -> bool {
        self.available() == 0
    }

    /// Begin cursor
    pub fn front(&self) -> usize {
        0
    }

    /// End cursor
    pub fn back(&self) -> usize {
        self.data.len()
    }

    /// Packet bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Status tag
    pub fn status(&self) -> Status {
        self.status
    }

    /// Live references
    pub fn reference_count(&self) -> u8 {
        self.references
    }
}

/// Mutable access to one packet, able to grow it through the pool allocator
pub struct PacketMut<'a> {
    buf: &'a mut PacketBuffer,
    allocator: &'a mut dyn Allocator,
}

impl<'a> PacketMut<'a> {
    /// Read-only view of the packet
    pub fn buffer(&self) -> &PacketBuffer {
        self.buf
    }

    /// Bytes used
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// No bytes used
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes reserved
    pub fn capacity(&self) -> usize {
        self.buf.capacity
    }

    /// Bytes that can be appended without growth
    pub fn available(&self) -> usize {
        self.buf.available()
    }

    /// Packet bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.buf.data
    }

    /// Mutable packet bytes; length is fixed
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf.data
    }

    /// Set the status tag
    pub fn sink_status(&mut self, status: Status) {
        self.buf.status = status;
    }

    /// Resize the reservation, charging or refunding the allocator
    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), PacketError> {
        let current = self.buf.capacity;
        if capacity < self.buf.len() {
            return Err(PacketError::Shrink {
                capacity,
                len: self.buf.len(),
            });
        }
        if capacity > current {
            let extra = capacity - current;
            if !self.allocator.allocate(extra) {
                return Err(PacketError::Exhausted(extra));
            }
            self.buf.data.reserve_exact(capacity - self.buf.data.len());
        } else if capacity < current {
            self.allocator.deallocate(current - capacity);
            self.buf.data.shrink_to(capacity);
        }
        self.buf.capacity = capacity;
        Ok(())
    }

    /// Make room for `additional` bytes with no ceiling
    pub fn ensure_available(&mut self, additional: usize) -> Result<(), PacketError> {
        if self.available() >= additional {
            return Ok(());
        }
        self.set_capacity(self.buf.len() + additional)
    }

    /// Make room for `additional` bytes, growing in `increment` steps up to `limit`
    pub fn reserve(
        &mut self,
        additional: usize,
        increment: usize,
        limit: usize,
    ) -> Result<(), PacketError> {
        let available = self.available();
        if available >= additional {
            return Ok(());
        }
        if increment == 0 {
            return Err(PacketError::CapacityLimit(self.buf.capacity));
        }
        let deficit = additional - available;
        let steps = deficit.div_ceil(increment);
        let target = self.buf.capacity + steps * increment;
        if target > limit {
            // a partial final step is still allowed if it reaches the ceiling
            if self.buf.capacity + deficit > limit {
                return Err(PacketError::CapacityLimit(limit));
            }
            return self.set_capacity(limit);
        }
        self.set_capacity(target)
    }

    /// Append without growth
    pub fn sink_data(&mut self, byte: u8) -> Status {
        if self.buf.is_full() {
            return Status::Busy;
        }
        self.buf.data.push(byte);
        Status::Good
    }

    /// Append, growing by `increment` (never past `limit`) if full
    pub fn sink_expand(&mut self, byte: u8, increment: usize, limit: usize) -> Result<(), PacketError> {
        self.reserve(1, increment, limit)?;
        self.buf.data.push(byte);
        Ok(())
    }

    /// Append a run of bytes all-or-nothing, growing as `sink_expand` does
    pub fn extend_expand(
        &mut self,
        bytes: &[u8],
        increment: usize,
        limit: usize,
    ) -> Result<(), PacketError> {
        self.reserve(bytes.len(), increment, limit)?;
        self.buf.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Append into already available capacity
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        if self.available() < bytes.len() {
            return Err(PacketError::Full);
        }
        self.buf.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Append an unsigned Code78 field
    pub fn sink_c78(&mut self, value: u32, increment: usize, limit: usize) -> Result<(), PacketError> {
        self.extend_expand(C78Bytes::unsigned(value).as_slice(), increment, limit)
    }

    /// Append a signed Code78 field
    pub fn sink_c78_signed(
        &mut self,
        value: i32,
        increment: usize,
        limit: usize,
    ) -> Result<(), PacketError> {
        self.extend_expand(C78Bytes::signed(value).as_slice(), increment, limit)
    }

    /// Overwrite one byte in place
    pub fn set(&mut self, index: usize, byte: u8) -> Option<()> {
        let slot = self.buf.data.get_mut(index)?;
        *slot = byte;
        Some(())
    }

    /// Drop bytes past `len`
    pub fn truncate(&mut self, len: usize) {
        self.buf.data.truncate(len);
    }

    /// Remove a byte range, shifting the tail down
    pub fn remove_range(&mut self, range: Range<usize>) {
        self.buf.data.drain(range);
    }

    /// Drop all bytes, keeping the reservation
    pub fn clear(&mut self) {
        self.buf.data.clear();
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    packet: Option<PacketBuffer>,
}

/// Default number of packet slots
pub const DEFAULT_MAX_PACKETS: usize = 32;

/// Arena of reference-counted packets
pub struct PacketPool {
    slots: Vec<Slot>,
    free: Vec<u16>,
    max_packets: usize,
    live: usize,
    allocator: Box<dyn Allocator>,
}

impl PacketPool {
    /// Pool bounded by slot count and a byte budget
    pub fn new(max_packets: usize, budget: usize) -> Self {
        Self::with_allocator(max_packets, Box::new(BudgetAllocator::new(budget)))
    }

    /// Pool backed by a caller-supplied allocator
    pub fn with_allocator(max_packets: usize, allocator: Box<dyn Allocator>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            max_packets: max_packets.min(u16::MAX as usize),
            live: 0,
            allocator,
        }
    }

    /// Allocate an empty packet holding one reference for the caller
    pub fn allocate(&mut self, capacity: usize) -> Result<PacketId, PacketError> {
        if capacity == 0 {
            return Err(PacketError::ZeroCapacity);
        }
        let index = match self.free.last() {
            Some(&index) => index,
            None if self.slots.len() < self.max_packets => self.slots.len() as u16,
            None => return Err(PacketError::TooManyPackets),
        };
        if !self.allocator.allocate(capacity) {
            return Err(PacketError::Exhausted(capacity));
        }

        let packet = PacketBuffer {
            data: Vec::with_capacity(capacity),
            capacity,
            status: Status::Good,
            references: 1,
        };
        if self.free.last() == Some(&index) {
            self.free.pop();
        } else {
            self.slots.push(Slot {
                generation: 0,
                packet: None,
            });
        }
        let slot = &mut self.slots[index as usize];
        slot.packet = Some(packet);
        self.live += 1;

        let id = PacketId {
            index,
            generation: slot.generation,
        };
        trace!("packet {} allocated, capacity {}", id, capacity);
        Ok(id)
    }

    fn slot(&self, id: PacketId) -> Result<&PacketBuffer, PacketError> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.packet.as_ref())
            .ok_or(PacketError::Stale)
    }

    /// Read access to a live packet
    pub fn get(&self, id: PacketId) -> Result<&PacketBuffer, PacketError> {
        self.slot(id)
    }

    /// Mutable access to a live packet
    pub fn get_mut(&mut self, id: PacketId) -> Result<PacketMut<'_>, PacketError> {
        let allocator = self.allocator.as_mut();
        let buf = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.packet.as_mut())
            .ok_or(PacketError::Stale)?;
        Ok(PacketMut { buf, allocator })
    }

    /// Take an additional reference
    pub fn reference(&mut self, id: PacketId) -> Result<u8, PacketError> {
        let mut packet = self.get_mut(id)?;
        let count = packet
            .buf
            .references
            .checked_add(1)
            .ok_or(PacketError::References)?;
        packet.buf.references = count;
        Ok(count)
    }

    /// Release a reference, freeing the packet when none remain.
    ///
    /// Returns true when this call freed the packet. Stale handles are ignored.
    pub fn dereference(&mut self, id: PacketId) -> bool {
        let Some(slot) = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
        else {
            return false;
        };
        let Some(packet) = slot.packet.as_mut() else {
            return false;
        };
        if packet.references > 1 {
            packet.references -= 1;
            return false;
        }

        let capacity = packet.capacity;
        slot.packet = None;
        self.allocator.deallocate(capacity);
        match slot.generation.checked_add(1) {
            Some(generation) => {
                slot.generation = generation;
                self.free.push(id.index);
            }
            None => warn!("packet slot {} retired, generations exhausted", id.index),
        }
        self.live -= 1;
        trace!("packet {} freed", id);
        true
    }

    /// Reference count of a packet, zero once freed
    pub fn reference_count(&self, id: PacketId) -> u8 {
        self.slot(id).map(|p| p.references).unwrap_or(0)
    }

    /// Whether the handle still names a live packet
    pub fn is_live(&self, id: PacketId) -> bool {
        self.slot(id).is_ok()
    }

    /// Number of live packets
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Status tag of a live packet
    pub fn status(&self, id: PacketId) -> Result<Status, PacketError> {
        self.slot(id).map(|p| p.status)
    }

    /// Set the status tag of a live packet
    pub fn sink_status(&mut self, id: PacketId, status: Status) -> Result<(), PacketError> {
        self.get_mut(id)?.sink_status(status);
        Ok(())
    }

    /// Allocate a packet and fill it from a slice
    pub fn allocate_from(&mut self, bytes: &[u8]) -> Result<PacketId, PacketError> {
        let id = self.allocate(bytes.len().max(1))?;
        self.get_mut(id)?.append(bytes)?;
        Ok(id)
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::with_allocator(DEFAULT_MAX_PACKETS, Box::new(Unbounded))
    }
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("slots", &self.slots.len())
            .field("live", &self.live)
            .field("max_packets", &self.max_packets)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let mut pool = PacketPool::new(4, 100);
        assert_eq!(pool.allocate(0), Err(PacketError::ZeroCapacity));

        let id = pool.allocate(20).unwrap();
        assert_eq!(pool.reference_count(id), 1);
        assert_eq!(pool.get(id).unwrap().capacity(), 20);
        assert_eq!(pool.status(id), Ok(Status::Good));
        assert_eq!(pool.live_count(), 1);

        assert!(pool.dereference(id));
        assert!(!pool.is_live(id));
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.get(id).err(), Some(PacketError::Stale));
    }

    #[test]
    fn test_reference_counting() {
        let mut pool = PacketPool::default();
        let id = pool.allocate(8).unwrap();
        for n in 2..=5 {
            assert_eq!(pool.reference(id), Ok(n));
        }
        for _ in 0..4 {
            assert!(!pool.dereference(id));
            assert!(pool.is_live(id));
        }
        assert!(pool.dereference(id));
        assert!(!pool.is_live(id));
        // released handle: no double free
        assert!(!pool.dereference(id));
        assert_eq!(pool.reference_count(id), 0);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_reference_overflow() {
        let mut pool = PacketPool::default();
        let id = pool.allocate(1).unwrap();
        for _ in 1..u8::MAX {
            pool.reference(id).unwrap();
        }
        assert_eq!(pool.reference(id), Err(PacketError::References));
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut pool = PacketPool::new(1, 100);
        let first = pool.allocate(4).unwrap();
        pool.dereference(first);
        let second = pool.allocate(4).unwrap();
        assert_ne!(first, second);
        assert!(pool.get_mut(first).is_err());
        assert!(!pool.dereference(first));
        assert!(pool.is_live(second));
    }

    #[test]
    fn test_generation_does_not_wrap() {
        let mut pool = PacketPool::new(2, 100);
        let first = pool.allocate(4).unwrap();
        pool.dereference(first);
        pool.slots[0].generation = u16::MAX as u32;
        let id = pool.allocate(4).unwrap();
        pool.dereference(id);
        let next = pool.allocate(4).unwrap();
        assert_eq!(next.index, 0);
        assert_eq!(next.generation, u16::MAX as u32 + 1);
        assert!(!pool.is_live(id));
        pool.dereference(next);

        // the last generation retires the slot
        pool.slots[0].generation = u32::MAX;
        let last = pool.allocate(4).unwrap();
        assert!(pool.dereference(last));
        let other = pool.allocate(4).unwrap();
        assert_eq!(other.index, 1);
        assert!(!pool.is_live(last));
        assert_eq!(pool.allocate(4), Err(PacketError::TooManyPackets));
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn test_slot_and_budget_exhaustion() {
        let mut pool = PacketPool::new(2, 30);
        let a = pool.allocate(10).unwrap();
        let _b = pool.allocate(10).unwrap();
        assert_eq!(pool.allocate(1), Err(PacketError::TooManyPackets));
        pool.dereference(a);
        assert_eq!(pool.allocate(25), Err(PacketError::Exhausted(25)));
        assert!(pool.allocate(20).is_ok());
    }

    #[test]
    fn test_sink_expand_growth() {
        let mut pool = PacketPool::new(1, 100);
        let id = pool.allocate(2).unwrap();
        let mut packet = pool.get_mut(id).unwrap();
        assert_eq!(packet.sink_data(1), Status::Good);
        assert_eq!(packet.sink_data(2), Status::Good);
        assert_eq!(packet.sink_data(3), Status::Busy);

        packet.sink_expand(3, 3, 6).unwrap();
        assert_eq!(packet.capacity(), 5);
        packet.sink_expand(4, 3, 6).unwrap();
        packet.sink_expand(5, 3, 6).unwrap();
        assert_eq!(packet.capacity(), 6);
        assert_eq!(packet.sink_expand(6, 3, 6), Err(PacketError::CapacityLimit(6)));
        assert_eq!(packet.as_slice(), &[1, 2, 3, 4, 5]);
        assert!(packet.buffer().is_full());
    }

    #[test]
    fn test_extend_is_all_or_nothing() {
        let mut pool = PacketPool::new(1, 12);
        let id = pool.allocate(10).unwrap();
        let mut packet = pool.get_mut(id).unwrap();
        packet.append(&[0; 9]).unwrap();
        assert_eq!(packet.extend_expand(&[1, 2, 3, 4], 4, 50), Err(PacketError::Exhausted(4)));
        assert_eq!(packet.len(), 9);
        assert_eq!(packet.capacity(), 10);
        packet.extend_expand(&[1, 2], 2, 50).unwrap();
        assert_eq!(packet.len(), 11);
    }

    #[test]
    fn test_capacity_refund() {
        let mut pool = PacketPool::new(2, 20);
        let id = pool.allocate(15).unwrap();
        {
            let mut packet = pool.get_mut(id).unwrap();
            packet.append(&[7; 3]).unwrap();
            assert!(matches!(packet.set_capacity(2), Err(PacketError::Shrink { .. })));
            packet.set_capacity(3).unwrap();
        }
        assert!(pool.allocate(17).is_ok());
    }

    #[test]
    fn test_c78_fields() {
        let mut pool = PacketPool::default();
        let id = pool.allocate(1).unwrap();
        let mut packet = pool.get_mut(id).unwrap();
        packet.sink_c78(300, 4, 50).unwrap();
        packet.sink_c78_signed(-2, 4, 50).unwrap();
        assert_eq!(packet.as_slice(), &[0x82, 0x2C, 0x03]);
        assert_eq!(packet.sink_c78(u32::MAX, 1, 4), Err(PacketError::CapacityLimit(4)));
    }

    #[test]
    fn test_allocate_from() {
        let mut pool = PacketPool::default();
        let id = pool.allocate_from(&[1, 2, 3]).unwrap();
        assert_eq!(pool.get(id).unwrap().as_slice(), &[1, 2, 3]);
        let empty = pool.allocate_from(&[]).unwrap();
        assert!(pool.get(empty).unwrap().is_empty());
    }
}

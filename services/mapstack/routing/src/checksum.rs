//! Checksum pipeline stages

use mapstack_wire::{MapPacket, PacketId, PacketPool, PacketSink, SharedSink, Status, CHECKSUM_LENGTH};
use tracing::{debug, trace};

/// Appends a checksum to the viewed header, then forwards.
///
/// A packet that other holders still reference is left untouched; the
/// checksum goes onto a private copy, which is what gets forwarded.
pub struct ChecksumGenerator {
    sink: SharedSink,
}

impl ChecksumGenerator {
    /// Stage feeding `sink`
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }

    fn append_and_forward(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        let result = pool
            .get_mut(packet)
            .map_err(Into::into)
            .and_then(|mut p| p.append_checksum(header_offset));
        if let Err(e) = result {
            debug!("checksum append failed for {}: {}", packet, e);
            return e.status();
        }
        self.sink.borrow_mut().sink_packet(pool, packet, header_offset)
    }

    fn forward_copy(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        let bytes = match pool.get(packet) {
            Ok(buffer) => buffer.as_slice().to_vec(),
            Err(_) => return Status::Bad,
        };
        let copy = match pool.allocate(bytes.len() + CHECKSUM_LENGTH) {
            Ok(copy) => copy,
            Err(e) => return e.status(),
        };
        let status = match pool.get_mut(copy).and_then(|mut p| p.append(&bytes)) {
            Ok(()) => {
                trace!("checksum on copy {} of shared {}", copy, packet);
                self.append_and_forward(pool, copy, header_offset)
            }
            Err(e) => e.status(),
        };
        pool.dereference(copy);
        status
    }
}

impl PacketSink for ChecksumGenerator {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        let unchecked = pool.get(packet).ok().and_then(|buffer| {
            let map = MapPacket::new(buffer.as_slice());
            let h = map.header(header_offset)?;
            map.header_byte(h).map(|header| !header.checksum_present())
        });
        if unchecked == Some(true) && pool.reference_count(packet) > 1 {
            return self.forward_copy(pool, packet, header_offset);
        }
        self.append_and_forward(pool, packet, header_offset)
    }
}

/// Verifies checksums from the viewed header inward, then forwards
pub struct ChecksumValidator {
    sink: SharedSink,
    require_checksum: bool,
    remove_checksums: bool,
}

impl ChecksumValidator {
    /// Stage feeding `sink`; checksums optional and kept
    pub fn new(sink: SharedSink) -> Self {
        Self {
            sink,
            require_checksum: false,
            remove_checksums: false,
        }
    }

    /// Reject packets whose viewed header has no checksum
    pub fn require_checksum(mut self, require: bool) -> Self {
        self.require_checksum = require;
        self
    }

    /// Strip verified checksums before forwarding
    pub fn remove_checksums(mut self, remove: bool) -> Self {
        self.remove_checksums = remove;
        self
    }
}

impl PacketSink for ChecksumValidator {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        let result = pool.get_mut(packet).map_err(Into::into).and_then(|mut p| {
            p.validate(header_offset, self.require_checksum, self.remove_checksums)
        });
        if let Err(e) = result {
            debug!("dropping {}: {}", packet, e);
            return Status::Bad;
        }
        self.sink.borrow_mut().sink_packet(pool, packet, header_offset)
    }
}

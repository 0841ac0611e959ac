//! Single-packet server with reply addressing

use crate::ServerError;
use mapstack_wire::{
    skip_c78, AddressType, Header, HeaderFlags, MapPacket, OffsetPacket, PacketId, PacketPool,
    PacketSink, Status,
};
use tracing::{debug, trace};

/// Reply capacity reserved for the header and address
pub const REPLY_HEADER_CAPACITY: usize = 8;

/// Reply growth step
pub const REPLY_CAPACITY_INCREMENT: usize = 8;

/// Holds at most one inbound packet until the owner is done with it
#[derive(Debug, Default)]
pub struct SimpleServer {
    current: Option<OffsetPacket>,
}

impl SimpleServer {
    /// Idle server
    pub fn new() -> Self {
        Self::default()
    }

    /// Packet being served
    pub fn current(&self) -> Option<OffsetPacket> {
        self.current
    }

    /// A packet is held
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Mark the held packet Complete and release it
    pub fn finished_with_packet(&mut self, pool: &mut PacketPool) -> Status {
        let Some(held) = self.current.take() else {
            return Status::Bad;
        };
        let _ = pool.sink_status(held.packet, Status::Complete);
        pool.dereference(held.packet);
        trace!("server: released {}", held.packet);
        Status::Good
    }

    /// Build a reply addressed to the held packet's sender.
    ///
    /// The first header from the held offset inward that carries a source
    /// address supplies the reply's destination. The returned packet holds
    /// one reference for the caller and has at least `data_capacity` bytes
    /// free for the payload.
    pub fn prepare_reply(
        &self,
        pool: &mut PacketPool,
        data_capacity: usize,
    ) -> Result<PacketId, ServerError> {
        let held = self.current.ok_or(ServerError::Idle)?;
        let (address_type, address) = {
            let buffer = pool.get(held.packet)?;
            let map = MapPacket::new(buffer.as_slice());
            let h = map
                .header(held.header_offset)
                .ok_or(ServerError::NoSourceAddress)?;
            let src_header = map
                .headers(h)
                .find(|&h| map.header_byte(h).is_some_and(|b| b.src_address_present()))
                .ok_or(ServerError::NoSourceAddress)?;
            let start = map
                .src_address(src_header)
                .ok_or(ServerError::NoSourceAddress)?;
            let end = skip_c78(map.bytes(), start).ok_or(ServerError::NoSourceAddress)?;
            let address_type = map
                .header_byte(src_header)
                .map(Header::address_type)
                .ok_or(ServerError::NoSourceAddress)?;
            (address_type, map.bytes()[start..end].to_vec())
        };
        if address_type >= AddressType::Extended as u8 {
            return Err(ServerError::ExtendedAddressType(address_type));
        }

        let reply = pool.allocate(REPLY_HEADER_CAPACITY + data_capacity)?;
        let header = Header::new(HeaderFlags::DEST_ADDRESS_PRESENT, address_type);
        let built = pool.get_mut(reply).and_then(|mut packet| {
            packet.sink_header(header, REPLY_CAPACITY_INCREMENT, usize::MAX)?;
            packet.extend_expand(&address, REPLY_CAPACITY_INCREMENT, usize::MAX)?;
            packet.ensure_available(data_capacity)
        });
        if let Err(e) = built {
            debug!("server: reply preparation failed: {}", e);
            pool.dereference(reply);
            return Err(e.into());
        }
        Ok(reply)
    }
}

impl PacketSink for SimpleServer {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        if self.current.is_some() {
            return Status::Bad;
        }
        if pool.reference(packet).is_err() {
            return Status::Bad;
        }
        self.current = Some(OffsetPacket::new(packet, header_offset));
        Status::Good
    }
}

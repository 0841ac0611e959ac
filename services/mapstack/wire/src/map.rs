//! MAP (Micro Address Protocol) packet model.
//!
//! A MAP packet starts with a header byte whose high nibble flags optional
//! fields and whose low nibble is the address type. Optional Code78 fields
//! follow in a fixed order: next protocol, destination address, source
//! address. When the next protocol is MAP itself the payload is another
//! header, so one buffer can carry a chain of nested headers.
//!
//! Every header level with the checksum flag owns 4 trailing CRC-32 bytes
//! (low byte first). Checksums nest like headers: the innermost sits closest
//! to the payload and each outer checksum covers everything from its header
//! through the inner checksum bytes.
//!
//! All navigation is by byte offset into the packet; a field walk that would
//! run past the end yields `None`.

use crate::c78::{skip_c78, source_c78};
use crate::checksum::crc32;
use crate::error::{MapError, PacketError};
use crate::packet::PacketMut;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::iter;
use tracing::debug;

/// Trailing bytes per checksum-bearing header
pub const CHECKSUM_LENGTH: usize = 4;

/// Default packet capacity ceiling
pub const DEFAULT_CAPACITY_LIMIT: usize = 50;

/// Address type bits of the header byte
pub const ADDRESS_TYPE_MASK: u8 = 0x0F;

bitflags! {
    /// Header presence flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HeaderFlags: u8 {
        /// Trailing CRC-32 present
        const CHECKSUM_PRESENT = 0x80;
        /// Next-protocol field present
        const NEXT_PROTO_PRESENT = 0x40;
        /// Destination address field present
        const DEST_ADDRESS_PRESENT = 0x20;
        /// Source address field present
        const SRC_ADDRESS_PRESENT = 0x10;
    }
}

/// Next-protocol identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// No next protocol
    None = 0,
    /// Nested MAP header
    Map = 1,
    /// ICMP
    Icmp = 4,
    /// MAC
    Mac = 5,
    /// IPv4
    Ipv4 = 6,
    /// UDP
    Udp = 7,
    /// TCP
    Tcp = 8,
    /// ARP
    Arp = 9,
    /// DNS
    Dns = 10,
    /// Protocol id continues in an extended field
    Extended = 63,
}

impl TryFrom<u8> for Protocol {
    type Error = MapError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Protocol::None),
            1 => Ok(Protocol::Map),
            4 => Ok(Protocol::Icmp),
            5 => Ok(Protocol::Mac),
            6 => Ok(Protocol::Ipv4),
            7 => Ok(Protocol::Udp),
            8 => Ok(Protocol::Tcp),
            9 => Ok(Protocol::Arp),
            10 => Ok(Protocol::Dns),
            63 => Ok(Protocol::Extended),
            _ => Err(MapError::Protocol(value)),
        }
    }
}

/// Address type nibble values
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    /// No address
    None = 0,
    /// Hardware-local (bus position)
    HardwareLocal = 1,
    /// Statically assigned device-local
    DeviceLocalStatic = 2,
    /// Dynamically assigned device-local
    DeviceLocalDynamic = 3,
    /// LAN-local
    LanLocal = 4,
    /// MAC
    Mac = 5,
    /// IP
    Ip = 6,
    /// DNS name
    Dns = 7,
    /// Extended type, unsupported
    Extended = 15,
}

impl TryFrom<u8> for AddressType {
    type Error = MapError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AddressType::None),
            1 => Ok(AddressType::HardwareLocal),
            2 => Ok(AddressType::DeviceLocalStatic),
            3 => Ok(AddressType::DeviceLocalDynamic),
            4 => Ok(AddressType::LanLocal),
            5 => Ok(AddressType::Mac),
            6 => Ok(AddressType::Ip),
            7 => Ok(AddressType::Dns),
            15 => Ok(AddressType::Extended),
            _ => Err(MapError::AddressType(value)),
        }
    }
}

/// A MAP header byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header(u8);

impl Header {
    /// Build a header from flags and an address type.
    ///
    /// # Panics
    ///
    /// If `address_type` is 15 (extended) or larger.
    pub fn new(flags: HeaderFlags, address_type: u8) -> Self {
        let mut header = Header(flags.bits());
        header.set_address_type(address_type);
        header
    }

    /// Raw byte
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Presence flags
    pub fn flags(self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.0)
    }

    fn set_flag(&mut self, flag: HeaderFlags, value: bool) {
        if value {
            self.0 |= flag.bits();
        } else {
            self.0 &= !flag.bits();
        }
    }

    /// Checksum flag
    pub fn checksum_present(self) -> bool {
        self.flags().contains(HeaderFlags::CHECKSUM_PRESENT)
    }

    /// Set or clear the checksum flag
    pub fn set_checksum_present(&mut self, value: bool) {
        self.set_flag(HeaderFlags::CHECKSUM_PRESENT, value);
    }

    /// Next-protocol flag
    pub fn next_proto_present(self) -> bool {
        self.flags().contains(HeaderFlags::NEXT_PROTO_PRESENT)
    }

    /// Set or clear the next-protocol flag
    pub fn set_next_proto_present(&mut self, value: bool) {
        self.set_flag(HeaderFlags::NEXT_PROTO_PRESENT, value);
    }

    /// Destination address flag
    pub fn dest_address_present(self) -> bool {
        self.flags().contains(HeaderFlags::DEST_ADDRESS_PRESENT)
    }

    /// Set or clear the destination address flag
    pub fn set_dest_address_present(&mut self, value: bool) {
        self.set_flag(HeaderFlags::DEST_ADDRESS_PRESENT, value);
    }

    /// Source address flag
    pub fn src_address_present(self) -> bool {
        self.flags().contains(HeaderFlags::SRC_ADDRESS_PRESENT)
    }

    /// Set or clear the source address flag
    pub fn set_src_address_present(&mut self, value: bool) {
        self.set_flag(HeaderFlags::SRC_ADDRESS_PRESENT, value);
    }

    /// Address type nibble
    pub fn address_type(self) -> u8 {
        self.0 & ADDRESS_TYPE_MASK
    }

    /// Replace the address type nibble.
    ///
    /// # Panics
    ///
    /// Extended address types (15 and up) are not supported.
    pub fn set_address_type(&mut self, address_type: u8) {
        assert!(
            address_type < AddressType::Extended as u8,
            "extended address type {} unsupported",
            address_type
        );
        self.0 = (self.0 & !ADDRESS_TYPE_MASK) | address_type;
    }
}

impl From<u8> for Header {
    fn from(value: u8) -> Self {
        Header(value)
    }
}

impl From<Header> for u8 {
    fn from(header: Header) -> Self {
        header.0
    }
}

/// Checksum regions verified by a validation pass
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChecksumPlan {
    /// End of the region visible from the validated header
    outer_stop: usize,
    /// Start of the verified checksum bytes
    inner_stop: usize,
    /// Headers whose checksum verified
    verified: Vec<usize>,
}

/// Read-only MAP view over packet bytes
#[derive(Debug, Clone, Copy)]
pub struct MapPacket<'a> {
    bytes: &'a [u8],
}

impl<'a> MapPacket<'a> {
    /// View `bytes` as a MAP packet
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Underlying bytes
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Header byte at position `h`
    pub fn header_byte(&self, h: usize) -> Option<Header> {
        self.bytes.get(h).copied().map(Header)
    }

    /// Outermost header position
    pub fn first_header(&self) -> Option<usize> {
        (!self.bytes.is_empty()).then_some(0)
    }

    /// Position of the header `offset` levels in from the outermost
    pub fn header(&self, offset: u8) -> Option<usize> {
        let mut h = self.first_header()?;
        for _ in 0..offset {
            h = self.next_header(h)?;
        }
        Some(h)
    }

    /// Header positions from `h` inward
    pub fn headers(&self, h: usize) -> impl Iterator<Item = usize> + '_ {
        iter::successors(self.header_byte(h).map(|_| h), move |&h| self.next_header(h))
    }

    fn skip_if(&self, pos: usize, present: bool) -> Option<usize> {
        if present {
            skip_c78(self.bytes, pos)
        } else {
            Some(pos)
        }
    }

    fn field_at(&self, pos: usize, present: bool) -> Option<usize> {
        (present && pos < self.bytes.len()).then_some(pos)
    }

    fn after_next_proto(&self, h: usize) -> Option<usize> {
        let header = self.header_byte(h)?;
        self.skip_if(h + 1, header.next_proto_present())
    }

    fn after_dest(&self, h: usize) -> Option<usize> {
        let header = self.header_byte(h)?;
        self.skip_if(self.after_next_proto(h)?, header.dest_address_present())
    }

    /// Start of the next-protocol field
    pub fn next_proto(&self, h: usize) -> Option<usize> {
        let header = self.header_byte(h)?;
        self.field_at(h + 1, header.next_proto_present())
    }

    /// Start of the destination address field
    pub fn dest_address(&self, h: usize) -> Option<usize> {
        let header = self.header_byte(h)?;
        self.field_at(self.after_next_proto(h)?, header.dest_address_present())
    }

    /// Start of the source address field
    pub fn src_address(&self, h: usize) -> Option<usize> {
        let header = self.header_byte(h)?;
        self.field_at(self.after_dest(h)?, header.src_address_present())
    }

    /// Start of everything after this header's fields; may equal the end
    pub fn contents(&self, h: usize) -> Option<usize> {
        let header = self.header_byte(h)?;
        self.skip_if(self.after_dest(h)?, header.src_address_present())
    }

    /// Decoded Code78 value at `pos`
    pub fn c78_value(&self, pos: usize) -> Option<u32> {
        source_c78(self.bytes, pos).ok().map(|(value, _)| value)
    }

    /// Decoded next-protocol id
    pub fn next_proto_value(&self, h: usize) -> Option<u32> {
        self.c78_value(self.next_proto(h)?)
    }

    /// Decoded destination address
    pub fn dest_address_value(&self, h: usize) -> Option<u32> {
        self.c78_value(self.dest_address(h)?)
    }

    /// Decoded source address
    pub fn src_address_value(&self, h: usize) -> Option<u32> {
        self.c78_value(self.src_address(h)?)
    }

    /// Nested header, when the next protocol is MAP and a header byte follows
    pub fn next_header(&self, h: usize) -> Option<usize> {
        if self.next_proto_value(h)? != Protocol::Map as u32 {
            return None;
        }
        let contents = self.contents(h)?;
        (contents < self.bytes.len()).then_some(contents)
    }

    /// Innermost payload position, walking nested headers from `h`
    pub fn data(&self, h: usize) -> Option<usize> {
        let innermost = self.headers(h).last()?;
        self.contents(innermost)
    }

    /// Innermost payload position for the header at `offset`
    pub fn data_at(&self, offset: u8) -> Option<usize> {
        self.data(self.header(offset)?)
    }

    /// End of the innermost payload, before every trailing checksum
    pub fn data_end(&self) -> Option<usize> {
        let first = self.first_header()?;
        let trailing = self
            .headers(first)
            .filter(|&h| Header(self.bytes[h]).checksum_present())
            .count();
        self.bytes.len().checked_sub(trailing * CHECKSUM_LENGTH)
    }

    fn checksum_plan(&self, offset: u8, require_checksum: bool) -> Result<ChecksumPlan, MapError> {
        if self.bytes.is_empty() {
            return Err(MapError::Empty);
        }
        let first = self.header(offset).ok_or(MapError::NoHeader(offset))?;
        if require_checksum && !Header(self.bytes[first]).checksum_present() {
            return Err(MapError::MissingChecksum);
        }
        self.data(first).ok_or(MapError::Truncated)?;

        // checksums of enclosing headers sit past everything visible from here
        let mut stop = self.bytes.len();
        for h in self.headers(0).take(offset as usize) {
            if Header(self.bytes[h]).checksum_present() {
                stop = stop.checked_sub(CHECKSUM_LENGTH).ok_or(MapError::Truncated)?;
            }
        }
        let outer_stop = stop;

        let mut verified = Vec::new();
        for h in self.headers(first) {
            if !Header(self.bytes[h]).checksum_present() {
                continue;
            }
            if stop < h + 1 + CHECKSUM_LENGTH {
                return Err(MapError::Truncated);
            }
            let end = stop - CHECKSUM_LENGTH;
            let expected = crc32(&self.bytes[h..end]);
            let stored = &self.bytes[end..stop];
            let found = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
            if expected != found {
                debug!("checksum mismatch at header {}: {:#010x} != {:#010x}", h, expected, found);
                return Err(MapError::Mismatch { expected, found });
            }
            stop = end;
            verified.push(h);
        }

        Ok(ChecksumPlan {
            outer_stop,
            inner_stop: stop,
            verified,
        })
    }

    /// Verify every checksum from the header at `offset` inward.
    ///
    /// Checksums of headers enclosing `offset` are skipped but their trailing
    /// bytes are excluded from scope.
    pub fn verify(&self, offset: u8, require_checksum: bool) -> Result<(), MapError> {
        self.checksum_plan(offset, require_checksum).map(|_| ())
    }
}

impl PacketMut<'_> {
    /// MAP view of the current bytes
    pub fn map(&self) -> MapPacket<'_> {
        MapPacket::new(self.as_slice())
    }

    /// Header byte at position `h`
    pub fn header_at(&self, h: usize) -> Option<Header> {
        self.map().header_byte(h)
    }

    /// Overwrite the header byte at position `h`
    pub fn set_header(&mut self, h: usize, header: Header) -> Result<(), MapError> {
        self.set(h, header.bits()).ok_or(MapError::Truncated)
    }

    /// Validate every checksum from the header at `offset` inward.
    ///
    /// With `remove_checksums`, verified checksum bytes are cut out and their
    /// header flags cleared. The packet is untouched on failure.
    pub fn validate(
        &mut self,
        offset: u8,
        require_checksum: bool,
        remove_checksums: bool,
    ) -> Result<(), MapError> {
        let plan = self.map().checksum_plan(offset, require_checksum)?;
        if remove_checksums && !plan.verified.is_empty() {
            self.remove_range(plan.inner_stop..plan.outer_stop);
            for h in plan.verified {
                if let Some(mut header) = self.header_at(h) {
                    header.set_checksum_present(false);
                    self.set_header(h, header)?;
                }
            }
        }
        Ok(())
    }

    /// Append a checksum for the header at `offset` unless it already has one.
    ///
    /// Covers everything from the header to the current end.
    pub fn append_checksum(&mut self, offset: u8) -> Result<(), MapError> {
        let h = self.map().header(offset).ok_or(MapError::NoHeader(offset))?;
        let mut header = self.header_at(h).ok_or(MapError::NoHeader(offset))?;
        if header.checksum_present() {
            return Ok(());
        }
        self.ensure_available(CHECKSUM_LENGTH)?;

        header.set_checksum_present(true);
        self.set_header(h, header)?;
        let checksum = crc32(&self.as_slice()[h..]);
        self.append(&checksum.to_le_bytes())
            .map_err(MapError::from)
    }

    /// Append a header byte, growing by `increment` up to `limit`
    pub fn sink_header(&mut self, header: Header, increment: usize, limit: usize) -> Result<(), PacketError> {
        self.sink_expand(header.bits(), increment, limit)
    }

    /// Read an unsigned Code78 field at `cursor`
    pub fn source_c78(&self, cursor: usize) -> Result<(u32, usize), MapError> {
        Ok(source_c78(self.as_slice(), cursor)?)
    }

    /// Read a signed Code78 field at `cursor`
    pub fn source_c78_signed(&self, cursor: usize) -> Result<(i32, usize), MapError> {
        Ok(crate::c78::source_c78_signed(self.as_slice(), cursor)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketPool;

    fn with_checksum(mut bytes: Vec<u8>) -> Vec<u8> {
        bytes[0] |= HeaderFlags::CHECKSUM_PRESENT.bits();
        let crc = crc32(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// outer: csum + next-proto MAP + dest 7; inner: csum + dest 5, payload AA BB
    fn nested_packet() -> Vec<u8> {
        let inner = with_checksum(vec![0x22, 0x05, 0xAA, 0xBB]);
        let mut outer = vec![0x62, 0x01, 0x07];
        outer.extend_from_slice(&inner);
        with_checksum(outer)
    }

    #[test]
    fn test_header_bits() {
        let mut header = Header::new(HeaderFlags::DEST_ADDRESS_PRESENT, 2);
        assert_eq!(header.bits(), 0x22);
        assert!(header.dest_address_present());
        assert!(!header.checksum_present());

        header.set_checksum_present(true);
        header.set_src_address_present(true);
        header.set_next_proto_present(true);
        assert_eq!(header.bits(), 0xF2);
        header.set_dest_address_present(false);
        header.set_address_type(AddressType::Ip as u8);
        assert_eq!(header.bits(), 0xD6);
        assert_eq!(header.address_type(), 6);
        assert_eq!(u8::from(header), 0xD6);
    }

    #[test]
    #[should_panic(expected = "extended address type")]
    fn test_extended_address_type_rejected() {
        Header::default().set_address_type(15);
    }

    #[test]
    fn test_protocol_and_address_ids() {
        assert_eq!(Protocol::try_from(1).unwrap(), Protocol::Map);
        assert_eq!(Protocol::try_from(2), Err(MapError::Protocol(2)));
        assert_eq!(AddressType::try_from(2).unwrap(), AddressType::DeviceLocalStatic);
        assert_eq!(AddressType::try_from(9), Err(MapError::AddressType(9)));
    }

    #[test]
    fn test_dest_address_with_checksum() {
        let bytes = with_checksum(vec![0x22, 0x05, 0xAA, 0xBB]);
        assert_eq!(bytes[0], 0xA2);
        let view = MapPacket::new(&bytes);
        assert_eq!(view.verify(0, true), Ok(()));
        assert_eq!(view.dest_address(0), Some(1));
        assert_eq!(view.dest_address_value(0), Some(5));
        assert_eq!(view.src_address(0), None);
        assert_eq!(view.next_proto(0), None);
        assert_eq!(view.data(0), Some(2));
        assert_eq!(bytes[view.data(0).unwrap()], 0xAA);
        assert_eq!(view.data_end(), Some(4));
        assert_eq!(MapPacket::new(&[0x22, 0x05]).data_end(), Some(2));
        assert_eq!(MapPacket::new(&[0xA2, 0x05]).data_end(), None);
    }

    #[test]
    fn test_field_navigation() {
        // next-proto UDP, dest 0x81 0x02, src 0x03, payload 0x44
        let bytes = [0x72, 0x07, 0x81, 0x02, 0x03, 0x44];
        let view = MapPacket::new(&bytes);
        assert_eq!(view.next_proto(0), Some(1));
        assert_eq!(view.next_proto_value(0), Some(Protocol::Udp as u32));
        assert_eq!(view.dest_address(0), Some(2));
        assert_eq!(view.dest_address_value(0), Some(0x82));
        assert_eq!(view.src_address(0), Some(4));
        assert_eq!(view.contents(0), Some(5));
        assert_eq!(view.next_header(0), None);
        assert_eq!(view.data_at(0), Some(5));
        assert_eq!(view.header(1), None);
    }

    #[test]
    fn test_truncated_fields() {
        let view = MapPacket::new(&[0x30, 0x81]);
        assert_eq!(view.dest_address(0), Some(1));
        assert_eq!(view.src_address(0), None);
        assert_eq!(view.contents(0), None);

        // empty payload is fine
        let view = MapPacket::new(&[0x20, 0x01]);
        assert_eq!(view.contents(0), Some(2));
        assert_eq!(view.data(0), Some(2));

        let view = MapPacket::new(&[]);
        assert_eq!(view.header(0), None);
        assert_eq!(view.verify(0, false), Err(MapError::Empty));
    }

    #[test]
    fn test_nested_headers() {
        let bytes = nested_packet();
        let view = MapPacket::new(&bytes);
        assert_eq!(view.header(0), Some(0));
        assert_eq!(view.header(1), Some(3));
        assert_eq!(view.header(2), None);
        assert_eq!(view.headers(0).collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(view.dest_address_value(0), Some(7));
        assert_eq!(view.dest_address_value(3), Some(5));
        assert_eq!(view.data(0), Some(5));
        assert_eq!(view.data_at(1), Some(5));
        assert_eq!(view.data_end(), Some(7));
        assert_eq!(&bytes[5..7], &[0xAA, 0xBB]);
        assert_eq!(view.verify(0, true), Ok(()));
        assert_eq!(view.verify(1, true), Ok(()));
    }

    #[test]
    fn test_nested_checksum_scoping() {
        // corrupt only the outer header's own field
        let mut bytes = nested_packet();
        bytes[2] ^= 0x01;
        let view = MapPacket::new(&bytes);
        assert!(matches!(view.verify(0, true), Err(MapError::Mismatch { .. })));
        assert_eq!(view.verify(1, true), Ok(()));

        // corrupt inner payload, then repair the outer checksum
        let mut bytes = nested_packet();
        let inner_crc = u32::from_le_bytes(bytes[7..11].try_into().unwrap());
        bytes[5] ^= 0x10;
        let len = bytes.len();
        let outer = crc32(&bytes[..len - 4]);
        bytes[len - 4..].copy_from_slice(&outer.to_le_bytes());
        let view = MapPacket::new(&bytes);
        assert!(matches!(
            view.verify(0, true),
            Err(MapError::Mismatch { found, .. }) if found == inner_crc
        ));
        assert!(view.verify(1, true).is_err());
    }

    #[test]
    fn test_checksum_integrity_bit_flips() {
        let mut pool = PacketPool::default();
        let id = pool.allocate_from(&[0x32, 0x05, 0x09, 0x10, 0x20, 0x30]).unwrap();
        pool.get_mut(id).unwrap().append_checksum(0).unwrap();
        let good = pool.get(id).unwrap().as_slice().to_vec();
        assert_eq!(MapPacket::new(&good).verify(0, true), Ok(()));

        for byte in 0..good.len() - CHECKSUM_LENGTH {
            for bit in 0..8 {
                let mut bytes = good.clone();
                bytes[byte] ^= 1 << bit;
                assert!(
                    MapPacket::new(&bytes).verify(0, true).is_err(),
                    "flip of byte {} bit {} went unnoticed",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_append_checksum() {
        let mut pool = PacketPool::new(4, 64);
        let id = pool.allocate_from(&[0x22, 0x05, 0xAA, 0xBB]).unwrap();
        {
            let mut packet = pool.get_mut(id).unwrap();
            assert_eq!(packet.capacity(), 4);
            packet.append_checksum(0).unwrap();
            assert_eq!(packet.len(), 8);
            // second call is a no-op
            packet.append_checksum(0).unwrap();
            assert_eq!(packet.len(), 8);
        }
        assert_eq!(
            pool.get(id).unwrap().as_slice(),
            with_checksum(vec![0x22, 0x05, 0xAA, 0xBB]).as_slice()
        );
    }

    #[test]
    fn test_append_checksum_exhausted() {
        let mut pool = PacketPool::new(1, 4);
        let id = pool.allocate_from(&[0x20, 0x05, 0xAA, 0xBB]).unwrap();
        let mut packet = pool.get_mut(id).unwrap();
        let err = packet.append_checksum(0).unwrap_err();
        assert_eq!(err, MapError::Packet(PacketError::Exhausted(4)));
        assert_eq!(packet.as_slice(), &[0x20, 0x05, 0xAA, 0xBB]);
    }

    #[test]
    fn test_validate_rejections() {
        let mut pool = PacketPool::default();
        let plain = pool.allocate_from(&[0x20, 0x05, 0xAA]).unwrap();
        let mut packet = pool.get_mut(plain).unwrap();
        assert_eq!(packet.validate(0, true, false), Err(MapError::MissingChecksum));
        assert_eq!(packet.validate(0, false, true), Ok(()));
        assert_eq!(packet.validate(1, false, false), Err(MapError::NoHeader(1)));

        // checksum flag without room for the bytes
        let short = pool.allocate_from(&[0xA0, 0x05, 0xAA]).unwrap();
        let mut packet = pool.get_mut(short).unwrap();
        assert_eq!(packet.validate(0, true, false), Err(MapError::Truncated));
        assert_eq!(packet.len(), 3);
    }

    #[test]
    fn test_validate_removes_checksums() {
        let mut pool = PacketPool::default();
        let id = pool.allocate_from(&nested_packet()).unwrap();
        let mut packet = pool.get_mut(id).unwrap();
        packet.validate(0, true, true).unwrap();
        assert_eq!(packet.as_slice(), &[0x62, 0x01, 0x07, 0x22, 0x05, 0xAA, 0xBB]);
        assert_eq!(packet.validate(0, true, false), Err(MapError::MissingChecksum));
        assert_eq!(packet.validate(0, false, false), Ok(()));
    }

    #[test]
    fn test_validate_inner_view_keeps_outer_checksum() {
        let mut pool = PacketPool::default();
        let original = nested_packet();
        let id = pool.allocate_from(&original).unwrap();
        let mut packet = pool.get_mut(id).unwrap();
        packet.validate(1, true, true).unwrap();

        let len = original.len();
        let mut expected = original[..7].to_vec();
        expected[3] &= !HeaderFlags::CHECKSUM_PRESENT.bits();
        expected.extend_from_slice(&original[len - 4..]);
        assert_eq!(packet.as_slice(), expected.as_slice());
        assert!(packet.header_at(0).unwrap().checksum_present());
    }

    #[test]
    fn test_packet_c78_fields() {
        let mut pool = PacketPool::default();
        let id = pool.allocate(2).unwrap();
        let mut packet = pool.get_mut(id).unwrap();
        packet
            .sink_header(Header::new(HeaderFlags::NEXT_PROTO_PRESENT, 0), 2, 16)
            .unwrap();
        packet.sink_c78(Protocol::Map as u32, 2, 16).unwrap();
        packet.sink_c78_signed(-300, 2, 16).unwrap();
        assert_eq!(packet.source_c78(1), Ok((1, 2)));
        assert_eq!(packet.source_c78_signed(2), Ok((-300, 4)));
        assert_eq!(packet.source_c78(4), Err(MapError::C78(crate::C78Error::Truncated)));
    }
}

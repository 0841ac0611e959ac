//! Address matching for routing edges

use crate::error::RoutingError;
use mapstack_wire::{MapPacket, PacketId, PacketPool, PacketSink, SharedSink, Status};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Mode bit inverting the match result
pub const MODE_NEGATE: u8 = 0x80;

/// Mode bits selecting the match kind
pub const MODE_KIND_MASK: u8 = 0x7F;

/// Size of an edge in its byte form
pub const EDGE_LENGTH: usize = 6;

/// How an edge compares destination addresses
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Never matches; the slot is free
    #[default]
    Inactive = 0,
    /// Matches every address
    MatchAll = 1,
    /// Matches on address type only
    AddressType = 2,
    /// Matches type and masked first value byte
    MaskedAddressValue = 3,
}

impl TryFrom<u8> for MatchMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MatchMode::Inactive),
            1 => Ok(MatchMode::MatchAll),
            2 => Ok(MatchMode::AddressType),
            3 => Ok(MatchMode::MaskedAddressValue),
            other => Err(other),
        }
    }
}

/// One routing edge: a destination filter and the sink it feeds.
///
/// Only address types and first value bytes below 128 are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressFilter {
    /// Match kind
    pub mode: MatchMode,
    /// Invert the match
    pub negate: bool,
    /// Index into the graph's sink list
    pub sink_index: u8,
    /// Header levels to add when forwarding
    pub header_offset: u8,
    /// Address type compared against
    pub address_type: u8,
    /// Address value compared against
    pub address_value: u8,
    /// Mask applied to the packet's address value
    pub address_value_mask: u8,
}

impl Default for AddressFilter {
    fn default() -> Self {
        Self {
            mode: MatchMode::Inactive,
            negate: false,
            sink_index: 0,
            header_offset: 0,
            address_type: 0,
            address_value: 0,
            address_value_mask: 0xFF,
        }
    }
}

impl AddressFilter {
    /// Edge forwarding everything to `sink_index`
    pub fn match_all(sink_index: u8) -> Self {
        Self {
            mode: MatchMode::MatchAll,
            sink_index,
            ..Self::default()
        }
    }

    /// Edge forwarding one address type to `sink_index`
    pub fn address_type(sink_index: u8, address_type: u8) -> Self {
        Self {
            mode: MatchMode::AddressType,
            sink_index,
            address_type,
            ..Self::default()
        }
    }

    /// Edge forwarding a masked address value to `sink_index`
    pub fn masked_value(sink_index: u8, address_type: u8, address_value: u8, mask: u8) -> Self {
        Self {
            mode: MatchMode::MaskedAddressValue,
            sink_index,
            address_type,
            address_value,
            address_value_mask: mask,
            ..Self::default()
        }
    }

    /// Forward at a deeper header level
    pub fn with_header_offset(mut self, header_offset: u8) -> Self {
        self.header_offset = header_offset;
        self
    }

    /// Invert the match
    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    /// Slot is in use
    pub fn is_active(&self) -> bool {
        self.mode != MatchMode::Inactive
    }

    /// Mode in its byte form, negate bit included
    pub fn mode_byte(&self) -> u8 {
        let negate = if self.negate { MODE_NEGATE } else { 0 };
        self.mode as u8 | negate
    }

    /// Compare a destination address type and first value byte
    pub fn is_match(&self, address_type: u8, address_value: u8) -> bool {
        let matched = match self.mode {
            MatchMode::Inactive => return false,
            MatchMode::MatchAll => true,
            MatchMode::AddressType => address_type == self.address_type,
            MatchMode::MaskedAddressValue => {
                address_type == self.address_type
                    && (address_value & self.address_value_mask) == self.address_value
            }
        };
        matched != self.negate
    }

    /// Byte form: mode, sink index, header offset, type, value, mask
    pub fn to_bytes(&self) -> [u8; EDGE_LENGTH] {
        [
            self.mode_byte(),
            self.sink_index,
            self.header_offset,
            self.address_type,
            self.address_value,
            self.address_value_mask,
        ]
    }

    /// Parse the byte form
    pub fn from_bytes(bytes: &[u8; EDGE_LENGTH]) -> Result<Self, RoutingError> {
        let mode = MatchMode::try_from(bytes[0] & MODE_KIND_MASK)
            .map_err(|m| RoutingError::InvalidEdge(format!("unknown mode {}", m)))?;
        Ok(Self {
            mode,
            negate: bytes[0] & MODE_NEGATE != 0,
            sink_index: bytes[1],
            header_offset: bytes[2],
            address_type: bytes[3],
            address_value: bytes[4],
            address_value_mask: bytes[5],
        })
    }
}

impl fmt::Display for AddressFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "m{} i{} h{} aT{} aV{} aM{}",
            self.mode_byte(),
            self.sink_index,
            self.header_offset,
            self.address_type,
            self.address_value,
            self.address_value_mask
        )
    }
}

/// Passes on packets addressed to one (type, value) pair.
///
/// Any header in the chain from the given offset inward may carry the match.
pub struct AddressBinding {
    address_type: u8,
    address_value: u8,
    sink: SharedSink,
}

impl AddressBinding {
    /// Bind `sink` to one address
    pub fn new(address_type: u8, address_value: u8, sink: SharedSink) -> Self {
        Self {
            address_type,
            address_value,
            sink,
        }
    }

    fn matches(&self, map: &MapPacket<'_>, header_offset: u8) -> bool {
        let Some(first) = map.header(header_offset) else {
            return false;
        };
        map.headers(first).any(|h| {
            let Some(header) = map.header_byte(h) else {
                return false;
            };
            header.address_type() == self.address_type
                && map
                    .dest_address(h)
                    .and_then(|pos| map.bytes().get(pos))
                    .is_some_and(|&value| value == self.address_value)
        })
    }
}

impl PacketSink for AddressBinding {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        let matched = match pool.get(packet) {
            Ok(buffer) => self.matches(&MapPacket::new(buffer.as_slice()), header_offset),
            Err(_) => false,
        };
        if !matched {
            trace!("binding: blocking packet {}", packet);
            return Status::Bad;
        }
        self.sink.borrow_mut().sink_packet(pool, packet, header_offset)
    }
}

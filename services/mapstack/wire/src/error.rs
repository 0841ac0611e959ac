//! Wire protocol error types.

use crate::status::Status;
use thiserror::Error;

/// Packet arena and buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Zero-capacity allocation requested
    #[error("zero capacity")]
    ZeroCapacity,

    /// Allocator refused the request
    #[error("allocator exhausted: {0} bytes")]
    Exhausted(usize),

    /// Every arena slot is in use
    #[error("packet slots exhausted")]
    TooManyPackets,

    /// Growth would pass the capacity ceiling
    #[error("capacity limit {0} reached")]
    CapacityLimit(usize),

    /// Capacity below the bytes already stored
    #[error("capacity {capacity} below length {len}")]
    Shrink {
        /// Requested capacity
        capacity: usize,
        /// Current length
        len: usize,
    },

    /// Append without growth found no room
    #[error("packet full")]
    Full,

    /// Handle refers to a freed slot
    #[error("stale packet handle")]
    Stale,

    /// Reference count would overflow
    #[error("reference count overflow")]
    References,
}

impl PacketError {
    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, PacketError::Exhausted(_) | PacketError::TooManyPackets)
    }

    /// Status a non-blocking caller reports for this error
    pub fn status(&self) -> Status {
        if self.is_transient() {
            Status::Busy
        } else {
            Status::Bad
        }
    }
}

/// Code78 field errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum C78Error {
    /// Buffer ended before a terminating byte
    #[error("c78 field truncated")]
    Truncated,

    /// Value does not fit 32 bits
    #[error("c78 value overflow")]
    Overflow,
}

/// MAP packet errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    /// Packet has no bytes
    #[error("empty packet")]
    Empty,

    /// Header offset does not resolve
    #[error("no header at offset {0}")]
    NoHeader(u8),

    /// Outer checksum required but absent
    #[error("checksum missing")]
    MissingChecksum,

    /// Header fields or checksum run past the end
    #[error("packet truncated")]
    Truncated,

    /// Checksum bytes do not match
    #[error("checksum mismatch: expected {expected:#010x}, found {found:#010x}")]
    Mismatch {
        /// Computed CRC32
        expected: u32,
        /// CRC32 carried by the packet
        found: u32,
    },

    /// Unknown protocol id
    #[error("unknown protocol {0}")]
    Protocol(u8),

    /// Unknown or extended address type
    #[error("unsupported address type {0}")]
    AddressType(u8),

    /// Buffer error while rewriting the packet
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// Field decode error
    #[error(transparent)]
    C78(#[from] C78Error),
}

impl MapError {
    /// Status a non-blocking caller reports for this error
    pub fn status(&self) -> Status {
        match self {
            MapError::Packet(e) => e.status(),
            _ => Status::Bad,
        }
    }
}

/// Framing errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Control prefix has opcode bits set
    #[error("invalid control prefix {0:#04x}")]
    ControlPrefix(u8),

    /// Decoder capacities are inconsistent
    #[error("invalid decoder capacities")]
    Capacity,
}

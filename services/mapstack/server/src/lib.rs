//! Reply servers for mapstack packets.
//!
//! A [`SimpleServer`] holds one inbound packet at a time and builds reply
//! packets addressed back to its sender. [`EchoServer`] uses it to return
//! each packet's payload.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod echo;
pub mod simple;

pub use echo::EchoServer;
pub use simple::{SimpleServer, REPLY_CAPACITY_INCREMENT, REPLY_HEADER_CAPACITY};

use mapstack_wire::{PacketError, Status};
use thiserror::Error;

/// Server errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// No inbound packet is held
    #[error("no packet held")]
    Idle,
    /// No header in the inbound packet carries a source address
    #[error("no source address to reply to")]
    NoSourceAddress,
    /// Source address type is in the extended range
    #[error("extended address type {0} unsupported")]
    ExtendedAddressType(u8),
    /// Reply packet could not be allocated or grown
    #[error("reply packet: {0}")]
    Packet(#[from] PacketError),
}

impl ServerError {
    /// Call status for this error; allocation pressure is `Busy`
    pub fn status(&self) -> Status {
        match self {
            ServerError::Packet(e) => e.status(),
            _ => Status::Bad,
        }
    }
}

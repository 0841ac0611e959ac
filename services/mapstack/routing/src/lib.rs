//! Packet sink graph for mapstack.
//!
//! Stages in this crate consume packets through [`PacketSink`] and, where
//! they hold packets across calls, make progress through [`Process`]:
//!
//! - [`ChecksumGenerator`] and [`ChecksumValidator`] append or verify MAP
//!   checksums before passing packets on
//! - [`AddressFilter`] and [`AddressBinding`] match destination addresses
//! - [`AddressGraph`] routes by an edge table that can be edited with
//!   command packets and persisted through [`EdgeStore`]
//! - [`BroadcastRouter`] fans packets out to every sink
//! - [`PacketQueue`] absorbs `Busy` from a downstream sink

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod checksum;
pub mod error;
pub mod filter;
pub mod graph;
pub mod persist;
pub mod queue;

pub use broadcast::BroadcastRouter;
pub use checksum::{ChecksumGenerator, ChecksumValidator};
pub use error::RoutingError;
pub use filter::{AddressBinding, AddressFilter, MatchMode, EDGE_LENGTH, MODE_NEGATE};
pub use graph::{AddressGraph, CommandOpcode, RemoveKey, RouteCommand, DEFAULT_MAX_EDGES};
pub use persist::EdgeStore;
pub use queue::{PacketQueue, DEFAULT_QUEUE_DEPTH};

pub use mapstack_wire::{OffsetPacket, PacketSink, Process, SharedProcess, SharedSink};

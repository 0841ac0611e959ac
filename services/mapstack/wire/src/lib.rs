//! Serial wire protocols for mapstack.
//!
//! This crate provides the byte-level layers of the stack: CRC32 checksums,
//! the Code78 variable-length codec, the reference-counted packet arena, the
//! MAP addressed datagram model and the MEP/NP framing state machines that
//! carry MAP packets over a raw serial line.
//!
//! ## Layers
//!
//! - **Checksum**: table-driven POSIX CRC-32, one byte at a time
//! - **Code78**: 7-bit groups with a continuation bit, for integers and byte escaping
//! - **Packets**: capacity-bounded buffers in a generation-checked arena
//! - **MAP**: header flags, nested headers and per-level trailing checksums
//! - **MEP**: control-prefix byte stuffing with 2-bit opcodes
//!
//! ## MAP Header
//!
//! ```text
//! bit  7        6           5          4         3..0
//!     +--------+-----------+----------+---------+--------------+
//!     | csum   | next-proto| dest     | src     | address type |
//!     +--------+-----------+----------+---------+--------------+
//! then: [next-proto c78] [dest c78] [src c78] payload.. [crc32 le]
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod c78;
pub mod checksum;
pub mod error;
pub mod frame;
pub mod map;
pub mod np;
pub mod packet;
pub mod sink;
pub mod status;

// Re-export main types
pub use c78::{
    is_last_byte, sink_c78, sink_c78_signed, skip_c78, source_c78, source_c78_signed, C78Bytes,
    C78Decoder, C78Encoder,
};
pub use checksum::{crc32, ChecksumEngine, CRC32_TABLE};
pub use error::{C78Error, FrameError, MapError, PacketError};
pub use frame::{
    ByteSink, ControlPrefix, DecoderConfig, DecoderState, EncoderState, MepDecoder, MepEncoder,
    Opcode, OutputBuffer, DEFAULT_CONTROL_PREFIX, DEFAULT_OUTPUT_CAPACITY, OPCODE_MASK, PREFIX_MASK,
};
pub use map::{
    AddressType, Header, HeaderFlags, MapPacket, Protocol, ADDRESS_TYPE_MASK, CHECKSUM_LENGTH,
    DEFAULT_CAPACITY_LIMIT,
};
pub use np::{NpDecoder, NpEncoder};
pub use packet::{
    Allocator, BudgetAllocator, PacketBuffer, PacketId, PacketMut, PacketPool, Unbounded,
    DEFAULT_MAX_PACKETS,
};
pub use sink::{OffsetPacket, PacketSink, Process, SharedProcess, SharedSink};
pub use status::Status;

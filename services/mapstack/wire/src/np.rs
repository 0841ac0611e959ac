//! NP newline packet protocol.
//!
//! A debugging framing for human-readable links: packet bytes are sent raw,
//! `\n` ends a packet and `!` aborts it. Packets must not contain either byte.

use crate::error::FrameError;
use crate::frame::{ByteSink, DecoderConfig};
use crate::map::MapPacket;
use crate::packet::{PacketId, PacketPool};
use crate::sink::{PacketSink, Process, SharedSink};
use crate::status::Status;
use tracing::{debug, warn};

/// End of packet
pub const NP_COMPLETE: u8 = b'\n';

/// Abort packet
pub const NP_ABORT: u8 = b'!';

/// Newline-delimited packet decoder
pub struct NpDecoder {
    config: DecoderConfig,
    packet: Option<PacketId>,
    discarding: bool,
    sink: SharedSink,
}

impl NpDecoder {
    /// Decoder with default sizes
    pub fn new(sink: SharedSink) -> Self {
        Self {
            config: DecoderConfig::default(),
            packet: None,
            discarding: false,
            sink,
        }
    }

    /// Decoder with explicit sizes
    pub fn with_config(sink: SharedSink, config: DecoderConfig) -> Result<Self, FrameError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new(sink)
        })
    }

    /// Dropping bytes until the next end or abort byte
    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    /// Packet being assembled
    pub fn current_packet(&self) -> Option<PacketId> {
        self.packet
    }

    /// Consume one byte; `Busy` means retry the same byte later
    pub fn sink_data(&mut self, pool: &mut PacketPool, byte: u8) -> Status {
        match byte {
            NP_COMPLETE => {
                let discarding = std::mem::take(&mut self.discarding);
                let packet = self.packet.take();
                if discarding {
                    return Status::Good;
                }
                let id = match packet {
                    Some(id) => id,
                    None if self.config.deliver_empty => {
                        match pool.allocate(self.config.initial_capacity) {
                            Ok(id) => id,
                            Err(e) => return e.status(),
                        }
                    }
                    None => return Status::Good,
                };
                self.sink.borrow_mut().sink_packet(pool, id, 0);
                pool.dereference(id);
                Status::Good
            }
            NP_ABORT => {
                if let Some(id) = self.packet.take() {
                    debug!("np: packet {} aborted", id);
                    pool.dereference(id);
                }
                self.discarding = false;
                Status::Good
            }
            _ => {
                if self.discarding {
                    return Status::Good;
                }
                let id = match self.packet {
                    Some(id) => id,
                    None => match pool.allocate(self.config.initial_capacity) {
                        Ok(id) => {
                            self.packet = Some(id);
                            id
                        }
                        Err(e) => return e.status(),
                    },
                };
                let result = pool.get_mut(id).and_then(|mut packet| {
                    packet.sink_expand(byte, self.config.capacity_increment, self.config.max_capacity)
                });
                match result {
                    Ok(()) => Status::Good,
                    Err(e) if e.is_transient() => Status::Busy,
                    Err(e) => {
                        warn!("np: discarding packet: {}", e);
                        if let Some(id) = self.packet.take() {
                            pool.dereference(id);
                        }
                        self.discarding = true;
                        Status::Bad
                    }
                }
            }
        }
    }
}

/// Newline-delimited packet encoder
pub struct NpEncoder<O: ByteSink> {
    current: Option<PacketId>,
    cursor: usize,
    output: O,
}

impl<O: ByteSink> NpEncoder<O> {
    /// Encoder writing to `output`
    pub fn new(output: O) -> Self {
        Self {
            current: None,
            cursor: 0,
            output,
        }
    }

    /// A packet is in flight
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Output sink
    pub fn output(&self) -> &O {
        &self.output
    }

    /// Mutable output sink
    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }
}

impl<O: ByteSink> PacketSink for NpEncoder<O> {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        if self.is_busy() {
            return Status::Busy;
        }
        let start = match pool.get(packet) {
            Ok(_) if header_offset == 0 => Some(0),
            Ok(buffer) => MapPacket::new(buffer.as_slice()).header(header_offset),
            Err(_) => None,
        };
        let Some(start) = start else {
            return Status::Bad;
        };
        if pool.reference(packet).is_err() {
            return Status::Bad;
        }
        let _ = pool.sink_status(packet, Status::Busy);
        self.current = Some(packet);
        self.cursor = start;
        Status::Good
    }
}

impl<O: ByteSink> Process for NpEncoder<O> {
    fn process(&mut self, pool: &mut PacketPool) -> Status {
        let Some(id) = self.current else {
            return Status::Complete;
        };
        let Ok(buffer) = pool.get(id) else {
            self.current = None;
            return Status::Bad;
        };
        while let Some(&byte) = buffer.as_slice().get(self.cursor) {
            if self.output.sink_byte(byte) != Status::Good {
                return Status::Busy;
            }
            self.cursor += 1;
        }
        if self.output.sink_byte(NP_COMPLETE) != Status::Good {
            return Status::Busy;
        }

        let _ = pool.sink_status(id, Status::Complete);
        pool.dereference(id);
        self.current = None;
        Status::Good
    }
}

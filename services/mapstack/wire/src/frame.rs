//! MEP (Micro Encapsulation Protocol) framing.
//!
//! MEP carries an endless series of packets over a raw byte stream. Data
//! bytes pass through unchanged except the reserved control prefix, which
//! starts a two-byte control sequence: the prefix, then the prefix with a
//! 2-bit opcode in its low bits.
//!
//! ```text
//! ...  [data bytes]
//! '<'  control prefix
//! '='  prefix|1  literal control prefix as data
//! '<'  control prefix
//! '>'  prefix|2  end of packet
//! ```
//!
//! Any other byte after a control prefix means the prefix itself was data.
//! Both state machines are non-blocking: `Busy` means nothing was consumed
//! and the same call should be repeated later.

use crate::error::FrameError;
use crate::map::MapPacket;
use crate::packet::{PacketId, PacketPool};
use crate::sink::{OffsetPacket, PacketSink, Process, SharedSink};
use crate::status::Status;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Opcode bits at the bottom of a control byte
pub const OPCODE_MASK: u8 = 0x03;

/// Prefix bits of a control byte
pub const PREFIX_MASK: u8 = 0xFC;

/// Suggested control prefix, ASCII `<`
pub const DEFAULT_CONTROL_PREFIX: u8 = b'<';

/// Control opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Repeated control prefix; no effect
    Idle = 0,
    /// Literal control prefix as data
    SendControlPrefixAsData = 1,
    /// End of packet
    CompletePacket = 2,
    /// Abort packet
    BadPacket = 3,
}

impl From<u8> for Opcode {
    fn from(byte: u8) -> Self {
        match byte & OPCODE_MASK {
            1 => Opcode::SendControlPrefixAsData,
            2 => Opcode::CompletePacket,
            3 => Opcode::BadPacket,
            _ => Opcode::Idle,
        }
    }
}

/// Control prefix with its opcode bits clear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPrefix(u8);

impl ControlPrefix {
    /// Validate a prefix byte
    pub fn new(byte: u8) -> Result<Self, FrameError> {
        if byte & OPCODE_MASK != 0 {
            return Err(FrameError::ControlPrefix(byte));
        }
        Ok(Self(byte))
    }

    /// Prefix byte
    pub fn byte(self) -> u8 {
        self.0
    }

    /// Control byte carrying `opcode`
    pub fn with_opcode(self, opcode: Opcode) -> u8 {
        self.0 | opcode as u8
    }

    /// Whether `byte` carries this prefix in its prefix bits
    pub fn matches(self, byte: u8) -> bool {
        byte & PREFIX_MASK == self.0
    }
}

impl Default for ControlPrefix {
    fn default() -> Self {
        Self(DEFAULT_CONTROL_PREFIX)
    }
}

impl TryFrom<u8> for ControlPrefix {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::new(byte)
    }
}

/// Decoder packet sizing and delivery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Capacity of a freshly allocated packet
    pub initial_capacity: usize,
    /// Growth step when a packet fills
    pub capacity_increment: usize,
    /// Ceiling; a packet that needs more is discarded
    pub max_capacity: usize,
    /// Deliver packets that carry no bytes
    pub deliver_empty: bool,
}

impl DecoderConfig {
    /// Check the capacities are usable
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.initial_capacity == 0
            || self.capacity_increment == 0
            || self.initial_capacity > self.max_capacity
        {
            return Err(FrameError::Capacity);
        }
        Ok(())
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 20,
            capacity_increment: 10,
            max_capacity: 150,
            deliver_empty: false,
        }
    }
}

/// Decoder position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Consuming data bytes
    Data,
    /// Last byte was the control prefix
    ControlSeen,
}

/// Byte-at-a-time MEP decoder feeding complete packets to a sink
pub struct MepDecoder {
    prefix: ControlPrefix,
    config: DecoderConfig,
    state: DecoderState,
    packet: Option<PacketId>,
    discarding: bool,
    sink: SharedSink,
}

impl MepDecoder {
    /// Decoder with the default prefix and sizes
    pub fn new(sink: SharedSink) -> Self {
        Self {
            prefix: ControlPrefix::default(),
            config: DecoderConfig::default(),
            state: DecoderState::Data,
            packet: None,
            discarding: false,
            sink,
        }
    }

    /// Decoder with an explicit prefix and sizes
    pub fn with_config(
        sink: SharedSink,
        prefix: ControlPrefix,
        config: DecoderConfig,
    ) -> Result<Self, FrameError> {
        config.validate()?;
        Ok(Self {
            prefix,
            config,
            ..Self::new(sink)
        })
    }

    /// Current position
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Dropping bytes until the next end or abort opcode
    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    /// Packet being assembled
    pub fn current_packet(&self) -> Option<PacketId> {
        self.packet
    }

    /// Active control prefix
    pub fn control_prefix(&self) -> ControlPrefix {
        self.prefix
    }

    /// Consume one byte.
    ///
    /// `Busy` means the allocator refused and nothing changed; feed the same
    /// byte again later. `Bad` means the packet outgrew its ceiling and is
    /// being discarded.
    pub fn sink_data(&mut self, pool: &mut PacketPool, byte: u8) -> Status {
        match self.state {
            DecoderState::Data => {
                if byte == self.prefix.byte() {
                    self.state = DecoderState::ControlSeen;
                    return Status::Good;
                }
                self.append(pool, &[byte])
            }
            DecoderState::ControlSeen => {
                if !self.prefix.matches(byte) {
                    let status = self.append(pool, &[self.prefix.byte(), byte]);
                    if status != Status::Busy {
                        self.state = DecoderState::Data;
                    }
                    return status;
                }
                match Opcode::from(byte) {
                    Opcode::Idle => Status::Good,
                    Opcode::SendControlPrefixAsData => {
                        let status = self.append(pool, &[self.prefix.byte()]);
                        if status != Status::Busy {
                            self.state = DecoderState::Data;
                        }
                        status
                    }
                    Opcode::CompletePacket => {
                        let status = self.complete(pool);
                        if status != Status::Busy {
                            self.end_packet();
                        }
                        status
                    }
                    Opcode::BadPacket => {
                        if !self.discarding {
                            debug!("mep: packet aborted by sender");
                        }
                        self.discard_packet(pool);
                        self.end_packet();
                        Status::Good
                    }
                }
            }
        }
    }

    /// Consume bytes until one is refused; returns how many were consumed
    pub fn sink_slice(&mut self, pool: &mut PacketPool, bytes: &[u8]) -> usize {
        for (consumed, &byte) in bytes.iter().enumerate() {
            if self.sink_data(pool, byte) == Status::Busy {
                return consumed;
            }
        }
        bytes.len()
    }

    /// Drop any partial packet and return to the initial state
    pub fn reset(&mut self, pool: &mut PacketPool) {
        self.discard_packet(pool);
        self.end_packet();
    }

    fn end_packet(&mut self) {
        self.state = DecoderState::Data;
        self.discarding = false;
    }

    fn discard_packet(&mut self, pool: &mut PacketPool) {
        if let Some(id) = self.packet.take() {
            pool.dereference(id);
        }
    }

    fn start_packet(&mut self, pool: &mut PacketPool) -> Result<PacketId, Status> {
        if let Some(id) = self.packet {
            return Ok(id);
        }
        match pool.allocate(self.config.initial_capacity) {
            Ok(id) => {
                trace!("mep: new packet {}", id);
                self.packet = Some(id);
                Ok(id)
            }
            Err(e) => Err(e.status()),
        }
    }

    fn append(&mut self, pool: &mut PacketPool, bytes: &[u8]) -> Status {
        if self.discarding {
            return Status::Good;
        }
        let id = match self.start_packet(pool) {
            Ok(id) => id,
            Err(status) => return status,
        };
        let result = pool.get_mut(id).and_then(|mut packet| {
            packet.extend_expand(
                bytes,
                self.config.capacity_increment,
                self.config.max_capacity,
            )
        });
        match result {
            Ok(()) => Status::Good,
            Err(e) if e.is_transient() => Status::Busy,
            Err(e) => {
                warn!("mep: discarding packet: {}", e);
                self.discard_packet(pool);
                self.discarding = true;
                Status::Bad
            }
        }
    }

    fn complete(&mut self, pool: &mut PacketPool) -> Status {
        if self.discarding {
            return Status::Good;
        }
        let id = match self.packet {
            Some(id) if pool.get(id).map(|p| !p.is_empty()).unwrap_or(false) => id,
            _ if !self.config.deliver_empty => {
                self.discard_packet(pool);
                return Status::Good;
            }
            _ => match self.start_packet(pool) {
                Ok(id) => id,
                Err(status) => return status,
            },
        };

        self.packet = None;
        debug!("mep: packet {} complete, {} bytes", id, pool.get(id).map(|p| p.len()).unwrap_or(0));
        let status = self.sink.borrow_mut().sink_packet(pool, id, 0);
        if status != Status::Good {
            debug!("mep: packet {} refused downstream: {}", id, status);
        }
        pool.dereference(id);
        Status::Good
    }
}

/// Destination for encoded bytes
pub trait ByteSink {
    /// Accept one byte; anything but `Good` means try again later
    fn sink_byte(&mut self, byte: u8) -> Status;
}

impl ByteSink for Vec<u8> {
    fn sink_byte(&mut self, byte: u8) -> Status {
        self.push(byte);
        Status::Good
    }
}

impl ByteSink for BytesMut {
    fn sink_byte(&mut self, byte: u8) -> Status {
        self.put_u8(byte);
        Status::Good
    }
}

/// Default output queue size
pub const DEFAULT_OUTPUT_CAPACITY: usize = 32;

/// Bounded outgoing byte queue, `Busy` when full
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    queue: VecDeque<u8>,
    capacity: usize,
}

impl OutputBuffer {
    /// Queue holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Queued bytes
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Nothing queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// No room left
    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    /// Take the oldest byte
    pub fn pop(&mut self) -> Option<u8> {
        self.queue.pop_front()
    }

    /// Move every queued byte into `out`; returns the count
    pub fn drain_into<B: BufMut>(&mut self, out: &mut B) -> usize {
        let count = self.queue.len();
        for byte in self.queue.drain(..) {
            out.put_u8(byte);
        }
        count
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_CAPACITY)
    }
}

impl ByteSink for OutputBuffer {
    fn sink_byte(&mut self, byte: u8) -> Status {
        if self.is_full() {
            return Status::Busy;
        }
        self.queue.push_back(byte);
        Status::Good
    }
}

/// Encoder position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    /// No packet
    Idle,
    /// Sending packet bytes
    Transmitting,
    /// Escaping a trailing control prefix
    FlushCollision,
    /// Sending the control prefix of the end sequence
    SendControl,
    /// Sending the end opcode
    SendEndOpcode,
}

enum Progress {
    Blocked,
    Finished,
}

/// Resumable MEP encoder for one packet at a time
pub struct MepEncoder<O: ByteSink = OutputBuffer> {
    prefix: ControlPrefix,
    state: EncoderState,
    collision: bool,
    current: Option<OffsetPacket>,
    cursor: usize,
    output: O,
}

impl<O: ByteSink> MepEncoder<O> {
    /// Encoder with the default prefix
    pub fn new(output: O) -> Self {
        Self::with_prefix(output, ControlPrefix::default())
    }

    /// Encoder with an explicit prefix
    pub fn with_prefix(output: O, prefix: ControlPrefix) -> Self {
        Self {
            prefix,
            state: EncoderState::Idle,
            collision: false,
            current: None,
            cursor: 0,
            output,
        }
    }

    /// A packet is in flight
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Current position
    pub fn state(&self) -> EncoderState {
        self.state
    }

    /// Output sink
    pub fn output(&self) -> &O {
        &self.output
    }

    /// Mutable output sink
    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    /// Abandon the packet in flight
    pub fn reset(&mut self, pool: &mut PacketPool) {
        if let Some(current) = self.current.take() {
            pool.dereference(current.packet);
        }
        self.state = EncoderState::Idle;
        self.collision = false;
        self.cursor = 0;
    }

    fn emit(&mut self, byte: u8) -> bool {
        self.output.sink_byte(byte) == Status::Good
    }

    fn step(&mut self, bytes: &[u8]) -> Progress {
        loop {
            match self.state {
                EncoderState::Idle => return Progress::Finished,
                EncoderState::Transmitting => {
                    while let Some(&byte) = bytes.get(self.cursor) {
                        if self.collision && self.prefix.matches(byte) {
                            let escape = self.prefix.with_opcode(Opcode::SendControlPrefixAsData);
                            if !self.emit(escape) {
                                return Progress::Blocked;
                            }
                            self.collision = false;
                        }
                        if !self.emit(byte) {
                            return Progress::Blocked;
                        }
                        self.collision = byte == self.prefix.byte();
                        self.cursor += 1;
                    }
                    self.state = EncoderState::FlushCollision;
                }
                EncoderState::FlushCollision => {
                    // a trailing raw prefix would read as the start of a control sequence
                    if self.collision {
                        let escape = self.prefix.with_opcode(Opcode::SendControlPrefixAsData);
                        if !self.emit(escape) {
                            return Progress::Blocked;
                        }
                        self.collision = false;
                    }
                    self.state = EncoderState::SendControl;
                }
                EncoderState::SendControl => {
                    if !self.emit(self.prefix.byte()) {
                        return Progress::Blocked;
                    }
                    self.state = EncoderState::SendEndOpcode;
                }
                EncoderState::SendEndOpcode => {
                    if !self.emit(self.prefix.with_opcode(Opcode::CompletePacket)) {
                        return Progress::Blocked;
                    }
                    return Progress::Finished;
                }
            }
        }
    }
}

impl<O: ByteSink> PacketSink for MepEncoder<O> {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        if self.is_busy() {
            return Status::Busy;
        }
        let start = match pool.get(packet) {
            Ok(buffer) => MapPacket::new(buffer.as_slice()).header(header_offset),
            Err(_) => None,
        };
        let Some(start) = start else {
            debug!("mep: no header {} in packet {}", header_offset, packet);
            return Status::Bad;
        };
        if pool.reference(packet).is_err() {
            return Status::Bad;
        }
        let _ = pool.sink_status(packet, Status::Busy);

        self.current = Some(OffsetPacket::new(packet, header_offset));
        self.cursor = start;
        self.collision = false;
        self.state = EncoderState::Transmitting;
        Status::Good
    }
}

impl<O: ByteSink> Process for MepEncoder<O> {
    /// `Complete` when idle, `Busy` while the output is full, `Good` otherwise.
    fn process(&mut self, pool: &mut PacketPool) -> Status {
        let Some(current) = self.current else {
            return Status::Complete;
        };
        let progress = match pool.get(current.packet) {
            Ok(buffer) => self.step(buffer.as_slice()),
            Err(_) => {
                warn!("mep: packet {} vanished mid-encode", current.packet);
                self.current = None;
                self.reset(pool);
                return Status::Bad;
            }
        };
        match progress {
            Progress::Blocked => Status::Busy,
            Progress::Finished => {
                let _ = pool.sink_status(current.packet, Status::Complete);
                trace!("mep: packet {} sent", current.packet);
                self.reset(pool);
                Status::Good
            }
        }
    }
}

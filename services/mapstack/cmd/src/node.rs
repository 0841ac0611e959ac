//! Packet pipeline of a serial node.
//!
//! ```text
//! serial in -> decoder -> checksum validator -> address graph
//!                                                 | sink 0 -> queue -> echo server --+
//!                                                 | sink 1 -> queue -----------------+-> checksum generator -> encoder -> serial out
//! ```
//!
//! Command packets addressed to the node's own address edit the graph's
//! edge table, which is written back to the EEPROM image when it changes.

use crate::config::{Framing, NodeConfig};
use anyhow::{Context, Result};
use mapstack_routing::{
    AddressGraph, ChecksumGenerator, ChecksumValidator, EdgeStore, PacketQueue, RoutingError,
};
use mapstack_server::EchoServer;
use mapstack_storage::{Eeprom, FileEeprom};
use mapstack_wire::{
    ControlPrefix, MepDecoder, MepEncoder, NpDecoder, NpEncoder, OutputBuffer, PacketId,
    PacketPool, PacketSink, Process, Status,
};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Graph sink index of the echo server
pub const ECHO_SINK: u8 = 0;

/// Graph sink index of the serial output
pub const SERIAL_SINK: u8 = 1;

enum Decoder {
    Mep(MepDecoder),
    Np(NpDecoder),
}

impl Decoder {
    fn sink_data(&mut self, pool: &mut PacketPool, byte: u8) -> Status {
        match self {
            Decoder::Mep(decoder) => decoder.sink_data(pool, byte),
            Decoder::Np(decoder) => decoder.sink_data(pool, byte),
        }
    }
}

enum Encoder {
    Mep(MepEncoder<OutputBuffer>),
    Np(NpEncoder<OutputBuffer>),
}

impl Encoder {
    fn is_busy(&self) -> bool {
        match self {
            Encoder::Mep(encoder) => encoder.is_busy(),
            Encoder::Np(encoder) => encoder.is_busy(),
        }
    }

    fn output_mut(&mut self) -> &mut OutputBuffer {
        match self {
            Encoder::Mep(encoder) => encoder.output_mut(),
            Encoder::Np(encoder) => encoder.output_mut(),
        }
    }
}

impl PacketSink for Encoder {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        match self {
            Encoder::Mep(encoder) => encoder.sink_packet(pool, packet, header_offset),
            Encoder::Np(encoder) => encoder.sink_packet(pool, packet, header_offset),
        }
    }
}

impl Process for Encoder {
    fn process(&mut self, pool: &mut PacketPool) -> Status {
        match self {
            Encoder::Mep(encoder) => encoder.process(pool),
            Encoder::Np(encoder) => encoder.process(pool),
        }
    }
}

/// A node's pool, pipeline stages and edge store
pub struct Node {
    pool: PacketPool,
    decoder: Decoder,
    encoder: Rc<RefCell<Encoder>>,
    local: Rc<RefCell<PacketQueue>>,
    forward: Rc<RefCell<PacketQueue>>,
    echo: Rc<RefCell<EchoServer>>,
    graph: Rc<RefCell<AddressGraph>>,
    store: Option<EdgeStore<Box<dyn Eeprom>>>,
}

impl Node {
    /// Build the pipeline, opening the configured EEPROM image if any
    pub fn open(config: &NodeConfig) -> Result<Self> {
        let eeprom = match &config.eeprom.path {
            Some(path) => {
                let image = FileEeprom::open(path, config.eeprom.size)
                    .with_context(|| format!("opening EEPROM image {:?}", path))?;
                Some(Box::new(image) as Box<dyn Eeprom>)
            }
            None => None,
        };
        Self::new(config, eeprom)
    }

    /// Build the pipeline over an explicit EEPROM, or none
    pub fn new(config: &NodeConfig, eeprom: Option<Box<dyn Eeprom>>) -> Result<Self> {
        let prefix = ControlPrefix::new(config.control_prefix)?;
        let pool = PacketPool::new(config.max_packets, config.packet_budget);

        let output = OutputBuffer::new(config.output_buffer);
        let encoder = Rc::new(RefCell::new(match config.framing {
            Framing::Mep => Encoder::Mep(MepEncoder::with_prefix(output, prefix)),
            Framing::Np => Encoder::Np(NpEncoder::new(output)),
        }));
        let transmit = Rc::new(RefCell::new(ChecksumGenerator::new(encoder.clone())));
        let echo = Rc::new(RefCell::new(EchoServer::new(transmit.clone())));
        let local = Rc::new(RefCell::new(PacketQueue::with_depth(
            echo.clone(),
            config.queue_depth,
        )));
        let forward = Rc::new(RefCell::new(PacketQueue::with_depth(
            transmit,
            config.queue_depth,
        )));

        let mut graph = AddressGraph::new(config.local_address_type, config.local_address_value);
        let echo_index = graph.add_sink(local.clone())?;
        let serial_index = graph.add_sink(forward.clone())?;
        debug_assert_eq!((echo_index, serial_index), (ECHO_SINK, SERIAL_SINK));

        let mut store = eeprom.map(EdgeStore::new);
        let restored = match store.as_mut().map(|store| store.load(&mut graph)) {
            Some(Ok(Some(count))) => {
                info!("Restored {} edges from EEPROM", count);
                true
            }
            Some(Ok(None)) | None => false,
            Some(Err(e)) => {
                warn!("Stored edge table unusable, using configured edges: {}", e);
                false
            }
        };
        if !restored {
            for edge in &config.edges {
                if let Err(e) = graph.sink_edge(*edge) {
                    warn!("Configured edge {} rejected: {}", edge, e);
                }
            }
            info!("Installed {} configured edges", graph.active_edges().count());
        }

        let graph = Rc::new(RefCell::new(graph));
        let validator = Rc::new(RefCell::new(
            ChecksumValidator::new(graph.clone())
                .require_checksum(config.require_checksum)
                .remove_checksums(config.remove_checksums),
        ));
        let decoder = match config.framing {
            Framing::Mep => Decoder::Mep(MepDecoder::with_config(validator, prefix, config.decoder)?),
            Framing::Np => Decoder::Np(NpDecoder::with_config(validator, config.decoder)?),
        };

        Ok(Self {
            pool,
            decoder,
            encoder,
            local,
            forward,
            echo,
            graph,
            store,
        })
    }

    /// Feed received bytes; returns how many were consumed.
    ///
    /// Stops at the first byte the decoder refuses with `Busy`; offer the
    /// rest again after [`Node::poll`] has freed packets.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        for (consumed, &byte) in bytes.iter().enumerate() {
            if self.decoder.sink_data(&mut self.pool, byte) == Status::Busy {
                debug!("decoder busy after {} bytes", consumed);
                return consumed;
            }
        }
        bytes.len()
    }

    /// Run every stage until no more output appears, appending the
    /// encoded bytes to `out`. Returns the number of bytes appended.
    pub fn poll(&mut self, out: &mut Vec<u8>) -> usize {
        let mut total = 0;
        loop {
            let pool = &mut self.pool;
            self.local.borrow_mut().process(pool);
            self.echo.borrow_mut().process(pool);
            self.forward.borrow_mut().process(pool);
            self.encoder.borrow_mut().process(pool);

            let drained = self.encoder.borrow_mut().output_mut().drain_into(out);
            total += drained;
            if drained == 0 {
                return total;
            }
        }
    }

    /// Write the edge table back if it changed; `true` when written
    pub fn persist(&mut self) -> Result<bool, RoutingError> {
        match self.store.as_mut() {
            Some(store) => store.sync(&self.graph.borrow()),
            None => Ok(false),
        }
    }

    /// Nothing is queued, being served or being transmitted
    pub fn is_idle(&self) -> bool {
        self.local.borrow().is_empty()
            && self.forward.borrow().is_empty()
            && !self.echo.borrow().is_busy()
            && !self.encoder.borrow().is_busy()
    }

    /// Routing graph
    pub fn graph(&self) -> &Rc<RefCell<AddressGraph>> {
        &self.graph
    }

    /// Live packets in the pool
    pub fn live_packets(&self) -> usize {
        self.pool.live_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapstack_routing::AddressFilter;
    use mapstack_storage::MemoryEeprom;
    use mapstack_wire::HeaderFlags;

    #[derive(Default)]
    struct Collector {
        packets: Vec<Vec<u8>>,
    }

    impl PacketSink for Collector {
        fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, _: u8) -> Status {
            self.packets.push(pool.get(packet).unwrap().as_slice().to_vec());
            Status::Good
        }
    }

    fn frame(packet: &[u8]) -> Vec<u8> {
        let mut pool = PacketPool::default();
        let id = pool.allocate_from(packet).unwrap();
        let mut encoder = MepEncoder::new(Vec::<u8>::new());
        assert_eq!(encoder.sink_packet(&mut pool, id, 0), Status::Good);
        while encoder.process(&mut pool) == Status::Busy {}
        encoder.output().clone()
    }

    fn unframe(bytes: &[u8]) -> Vec<Vec<u8>> {
        let collector = Rc::new(RefCell::new(Collector::default()));
        let validator = Rc::new(RefCell::new(
            ChecksumValidator::new(collector.clone())
                .require_checksum(true)
                .remove_checksums(true),
        ));
        let mut pool = PacketPool::default();
        let mut decoder = MepDecoder::new(validator);
        assert_eq!(decoder.sink_slice(&mut pool, bytes), bytes.len());
        let packets = collector.borrow().packets.clone();
        packets
    }

    fn echo_config() -> NodeConfig {
        NodeConfig {
            edges: vec![AddressFilter::masked_value(ECHO_SINK, 3, 0x10, 0xF0)],
            ..NodeConfig::default()
        }
    }

    fn echo_request(dest: u8, payload: &[u8]) -> Vec<u8> {
        let header = (HeaderFlags::DEST_ADDRESS_PRESENT | HeaderFlags::SRC_ADDRESS_PRESENT).bits() | 3;
        let mut packet = vec![header, dest, 0x07];
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn test_echo_round_trip() {
        let mut node = Node::new(&echo_config(), None).unwrap();
        let input = frame(&echo_request(0x15, b"hello"));
        assert_eq!(node.feed(&input), input.len());

        let mut out = Vec::new();
        assert!(node.poll(&mut out) > 0);
        let reply = vec![HeaderFlags::DEST_ADDRESS_PRESENT.bits() | 3, 0x07, b'h', b'e', b'l', b'l', b'o'];
        assert_eq!(unframe(&out), vec![reply]);
        assert!(node.is_idle());
        assert_eq!(node.live_packets(), 0);
    }

    #[test]
    fn test_unmatched_packet_dropped() {
        let mut node = Node::new(&echo_config(), None).unwrap();
        let input = frame(&echo_request(0x25, b"x"));
        node.feed(&input);

        let mut out = Vec::new();
        assert_eq!(node.poll(&mut out), 0);
        assert_eq!(node.live_packets(), 0);
    }

    #[test]
    fn test_forward_to_serial() {
        let config = NodeConfig {
            edges: vec![AddressFilter::address_type(SERIAL_SINK, 3)],
            ..NodeConfig::default()
        };
        let mut node = Node::new(&config, None).unwrap();
        let request = echo_request(0x40, &[1, 2, 3]);
        node.feed(&frame(&request));

        let mut out = Vec::new();
        node.poll(&mut out);
        assert_eq!(unframe(&out), vec![request]);
    }

    #[test]
    fn test_echo_and_forward_same_packet() {
        let request = echo_request(0x15, b"hi");
        let mut pool = PacketPool::default();
        let id = pool.allocate_from(&request).unwrap();
        pool.get_mut(id).unwrap().append_checksum(0).unwrap();
        let checked = pool.get(id).unwrap().as_slice().to_vec();

        for (input, remove_checksums) in [(&request, true), (&checked, false), (&checked, true)] {
            let config = NodeConfig {
                remove_checksums,
                edges: vec![
                    AddressFilter::match_all(ECHO_SINK),
                    AddressFilter::match_all(SERIAL_SINK),
                ],
                ..NodeConfig::default()
            };
            let mut node = Node::new(&config, None).unwrap();
            node.feed(&frame(input));

            let mut out = Vec::new();
            node.poll(&mut out);
            let packets = unframe(&out);
            let reply = vec![HeaderFlags::DEST_ADDRESS_PRESENT.bits() | 3, 0x07, b'h', b'i'];
            assert_eq!(packets.len(), 2, "remove_checksums={}", remove_checksums);
            assert!(packets.contains(&reply), "remove_checksums={}", remove_checksums);
            assert!(packets.contains(&request), "remove_checksums={}", remove_checksums);
            assert!(node.is_idle());
            assert_eq!(node.live_packets(), 0);
        }
    }

    #[test]
    fn test_command_edits_and_persists_edges() {
        let eeprom: Box<dyn Eeprom> = Box::new(MemoryEeprom::new(64));
        let mut node = Node::new(&NodeConfig::default(), Some(eeprom)).unwrap();
        assert_eq!(node.graph().borrow().active_edges().count(), 0);

        // add: sink 1, header offset 0, match all
        let command = [HeaderFlags::DEST_ADDRESS_PRESENT.bits() | 2, 0x01, 1, 1, 0, 1];
        node.feed(&frame(&command));
        node.poll(&mut Vec::new());
        assert_eq!(node.graph().borrow().active_edges().count(), 1);

        assert!(node.persist().unwrap());
        assert!(!node.persist().unwrap());
    }

    #[test]
    fn test_stored_edges_override_config() {
        let mut graph = AddressGraph::new(2, 1);
        graph.sink_edge(AddressFilter::match_all(SERIAL_SINK)).unwrap();
        let mut store = EdgeStore::new(MemoryEeprom::new(64));
        store.save(&graph).unwrap();
        let eeprom = store.eeprom().clone();

        let node = Node::new(&echo_config(), Some(Box::new(eeprom))).unwrap();
        let graph = node.graph().borrow();
        let edges: Vec<_> = graph.active_edges().copied().collect();
        assert_eq!(edges, vec![AddressFilter::match_all(SERIAL_SINK)]);
    }

    #[test]
    fn test_np_framing() {
        let config = NodeConfig {
            framing: Framing::Np,
            remove_checksums: false,
            edges: vec![AddressFilter::address_type(SERIAL_SINK, 3)],
            ..NodeConfig::default()
        };
        let mut node = Node::new(&config, None).unwrap();
        let request = echo_request(0x40, b"ok");
        let mut input = request.clone();
        input.push(b'\n');
        node.feed(&input);

        let mut out = Vec::new();
        node.poll(&mut out);
        assert_eq!(out.last(), Some(&b'\n'));
        assert!(out.len() > input.len());
    }
}

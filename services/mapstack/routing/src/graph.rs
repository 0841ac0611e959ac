//! Address graph router.
//!
//! The graph owns a list of downstream sinks and a small table of edges.
//! Each inbound packet's destination address is compared with every active
//! edge and the packet is forwarded to the sink of each edge that matches,
//! so one packet can fan out to several sinks.
//!
//! Packets addressed to the graph's own local address are routing commands
//! and are never forwarded. The payload's first byte is an opcode:
//!
//! ```text
//! 1 Add        sink_index header_offset mode [type [value mask]]
//! 2 Remove     sink_index [mode [type [value]]]
//! 3 RemoveAll
//! ```
//!
//! Every field is a single byte with the high bit clear, except an Add mask
//! of 128 or more which is sent as `0x81, mask & 0x7F`.

use crate::error::RoutingError;
use crate::filter::{AddressFilter, MatchMode};
use mapstack_wire::{MapPacket, PacketId, PacketPool, PacketSink, SharedSink, Status};
use smallvec::SmallVec;
use tracing::{debug, info, trace};

/// Initial edge table capacity
pub const DEFAULT_INITIAL_EDGES: usize = 8;

/// Edge table growth step
pub const EDGE_CAPACITY_INCREMENT: usize = 3;

/// Edge table ceiling
pub const DEFAULT_MAX_EDGES: usize = 15;

/// Command opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOpcode {
    /// Add an edge
    Add = 1,
    /// Deactivate matching edges
    Remove = 2,
    /// Clear the table
    RemoveAll = 3,
}

impl TryFrom<u8> for CommandOpcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CommandOpcode::Add),
            2 => Ok(CommandOpcode::Remove),
            3 => Ok(CommandOpcode::RemoveAll),
            other => Err(other),
        }
    }
}

/// Edge fields selecting what a Remove command deactivates.
///
/// Each field narrows the match; `None` fields are wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveKey {
    /// Sink index
    pub sink_index: u8,
    /// Mode byte
    pub mode: Option<u8>,
    /// Address type, only with a mode
    pub address_type: Option<u8>,
    /// Address value, only with a type
    pub address_value: Option<u8>,
}

impl RemoveKey {
    /// Whether `edge` falls under this key
    pub fn covers(&self, edge: &AddressFilter) -> bool {
        edge.sink_index == self.sink_index
            && self.mode.map_or(true, |m| edge.mode_byte() == m)
            && self.address_type.map_or(true, |t| edge.address_type == t)
            && self.address_value.map_or(true, |v| edge.address_value == v)
    }
}

/// A parsed routing command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteCommand {
    /// Add an edge
    Add(AddressFilter),
    /// Deactivate matching edges
    Remove(RemoveKey),
    /// Clear the table
    RemoveAll,
}

fn field(payload: &[u8], pos: usize) -> Option<u8> {
    payload.get(pos).copied().filter(|b| b & 0x80 == 0)
}

impl RouteCommand {
    /// Parse a command payload; malformed commands yield `None`
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let opcode = CommandOpcode::try_from(field(payload, 0)?).ok()?;
        match opcode {
            CommandOpcode::Add => Self::parse_add(&payload[1..]).map(RouteCommand::Add),
            CommandOpcode::Remove => Self::parse_remove(&payload[1..]).map(RouteCommand::Remove),
            CommandOpcode::RemoveAll => Some(RouteCommand::RemoveAll),
        }
    }

    fn parse_add(fields: &[u8]) -> Option<AddressFilter> {
        let mut edge = AddressFilter {
            sink_index: field(fields, 0)?,
            header_offset: field(fields, 1)?,
            ..AddressFilter::default()
        };
        edge.mode = MatchMode::try_from(field(fields, 2)?).ok()?;
        match edge.mode {
            MatchMode::Inactive => return None,
            MatchMode::MatchAll => return Some(edge),
            _ => {}
        }

        edge.address_type = field(fields, 3)?;
        if edge.mode == MatchMode::AddressType {
            return Some(edge);
        }

        edge.address_value = field(fields, 4)?;
        edge.address_value_mask = match *fields.get(5)? {
            0x81 => 0x80 | field(fields, 6)?,
            mask if mask & 0x80 == 0 => mask,
            _ => return None,
        };
        Some(edge)
    }

    fn parse_remove(fields: &[u8]) -> Option<RemoveKey> {
        if fields.len() > 4 {
            return None;
        }
        let mut key = RemoveKey {
            sink_index: field(fields, 0)?,
            mode: None,
            address_type: None,
            address_value: None,
        };
        let mut rest = (1..fields.len()).map(|pos| field(fields, pos));
        if let Some(mode) = rest.next() {
            key.mode = Some(mode?);
        }
        if let Some(address_type) = rest.next() {
            key.address_type = Some(address_type?);
        }
        if let Some(address_value) = rest.next() {
            key.address_value = Some(address_value?);
        }
        Some(key)
    }
}

/// Edge-table router with a local command address
pub struct AddressGraph {
    local_address_type: u8,
    local_address_value: u8,
    sinks: SmallVec<[SharedSink; 4]>,
    edges: Vec<AddressFilter>,
    max_edges: usize,
    changes: u64,
}

impl AddressGraph {
    /// Graph answering commands at (`local_address_type`, `local_address_value`)
    pub fn new(local_address_type: u8, local_address_value: u8) -> Self {
        Self {
            local_address_type,
            local_address_value,
            sinks: SmallVec::new(),
            edges: Vec::with_capacity(DEFAULT_INITIAL_EDGES),
            max_edges: DEFAULT_MAX_EDGES,
            changes: 0,
        }
    }

    /// Override the edge ceiling
    pub fn with_max_edges(mut self, max_edges: usize) -> Self {
        self.max_edges = max_edges;
        self
    }

    /// Register a sink; returns its index for edges to refer to
    pub fn add_sink(&mut self, sink: SharedSink) -> Result<u8, RoutingError> {
        let index = u8::try_from(self.sinks.len())
            .map_err(|_| RoutingError::TooManySinks(self.sinks.len()))?;
        self.sinks.push(sink);
        Ok(index)
    }

    /// Number of registered sinks
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Edge slots, inactive ones included
    pub fn edges(&self) -> &[AddressFilter] {
        &self.edges
    }

    /// Active edges in table order
    pub fn active_edges(&self) -> impl Iterator<Item = &AddressFilter> + '_ {
        self.edges.iter().filter(|e| e.is_active())
    }

    /// Edge ceiling
    pub fn max_edges(&self) -> usize {
        self.max_edges
    }

    /// Counter bumped by every table mutation
    pub fn changes(&self) -> u64 {
        self.changes
    }

    /// Insert an edge.
    ///
    /// An identical edge is left as is; otherwise the first inactive slot is
    /// reused, and only then does the table grow.
    pub fn sink_edge(&mut self, edge: AddressFilter) -> Result<(), RoutingError> {
        if !edge.is_active() {
            return Err(RoutingError::InvalidEdge("inactive edge".to_string()));
        }
        if self.edges.contains(&edge) {
            debug!("edge exists: {}", edge);
            return Ok(());
        }
        if let Some(slot) = self.edges.iter_mut().find(|e| !e.is_active()) {
            *slot = edge;
        } else if self.edges.len() < self.max_edges {
            if self.edges.len() == self.edges.capacity() {
                let room = EDGE_CAPACITY_INCREMENT.min(self.max_edges - self.edges.len());
                self.edges.reserve_exact(room);
            }
            self.edges.push(edge);
        } else {
            return Err(RoutingError::TableFull(self.edges.len()));
        }
        self.changes += 1;
        info!("edge added: {}", edge);
        Ok(())
    }

    /// Deactivate every edge covered by `key`; returns how many
    pub fn remove_edges(&mut self, key: &RemoveKey) -> usize {
        let mut removed = 0;
        for edge in self.edges.iter_mut().filter(|e| e.is_active() && key.covers(e)) {
            edge.mode = MatchMode::Inactive;
            removed += 1;
        }
        if removed > 0 {
            self.changes += 1;
            info!("{} edges removed for sink {}", removed, key.sink_index);
        }
        removed
    }

    /// Drop every edge
    pub fn clear_edges(&mut self) {
        self.edges.clear();
        self.changes += 1;
        info!("edge table cleared");
    }

    /// Apply a parsed command
    pub fn apply(&mut self, command: RouteCommand) {
        match command {
            RouteCommand::Add(edge) => {
                if let Err(e) = self.sink_edge(edge) {
                    debug!("add rejected: {}", e);
                }
            }
            RouteCommand::Remove(key) => {
                self.remove_edges(&key);
            }
            RouteCommand::RemoveAll => self.clear_edges(),
        }
    }

    fn process_command(&mut self, map: &MapPacket<'_>, header_offset: u8) {
        let Some(data) = map.data_at(header_offset) else {
            return;
        };
        match RouteCommand::parse(&map.bytes()[data..]) {
            Some(command) => {
                debug!("command: {:?}", command);
                self.apply(command);
            }
            None => debug!("malformed command ignored"),
        }
    }
}

impl PacketSink for AddressGraph {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        let Ok(buffer) = pool.get(packet) else {
            return Status::Bad;
        };
        let map = MapPacket::new(buffer.as_slice());
        let Some(h) = map.header(header_offset) else {
            return Status::Bad;
        };
        let Some(header) = map.header_byte(h) else {
            return Status::Bad;
        };
        let Some(dest_value) = map.dest_address(h).map(|pos| map.bytes()[pos]) else {
            return Status::Bad;
        };
        let dest_type = header.address_type();
        trace!(
            "graph: {} at offset {} to {}/{}",
            packet,
            header_offset,
            dest_type,
            dest_value
        );

        if dest_type == self.local_address_type && dest_value == self.local_address_value {
            self.process_command(&map, header_offset);
            return Status::Good;
        }

        let targets: SmallVec<[(usize, u8); 4]> = self
            .edges
            .iter()
            .filter(|e| e.is_match(dest_type, dest_value))
            .filter(|e| (e.sink_index as usize) < self.sinks.len())
            .filter_map(|e| {
                header_offset
                    .checked_add(e.header_offset)
                    .map(|offset| (e.sink_index as usize, offset))
            })
            .collect();
        for (index, offset) in targets {
            trace!("graph: edge accepts, sink {} offset {}", index, offset);
            self.sinks[index].borrow_mut().sink_packet(pool, packet, offset);
        }
        Status::Good
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapstack_wire::HeaderFlags;
    use std::cell::RefCell;
    use std::rc::Rc;

    const LOCAL_TYPE: u8 = 2;
    const LOCAL_VALUE: u8 = 1;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<(PacketId, u8)>,
        references: Vec<u8>,
    }

    impl PacketSink for Recorder {
        fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
            self.seen.push((packet, header_offset));
            self.references.push(pool.reference_count(packet));
            Status::Good
        }
    }

    fn graph_with_sinks(n: usize) -> (AddressGraph, Vec<Rc<RefCell<Recorder>>>) {
        let mut graph = AddressGraph::new(LOCAL_TYPE, LOCAL_VALUE);
        let recorders: Vec<_> = (0..n).map(|_| Rc::new(RefCell::new(Recorder::default()))).collect();
        for r in &recorders {
            graph.add_sink(r.clone()).unwrap();
        }
        (graph, recorders)
    }

    fn addressed(address_type: u8, dest: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![HeaderFlags::DEST_ADDRESS_PRESENT.bits() | address_type, dest];
        bytes.extend_from_slice(payload);
        bytes
    }

    fn command(pool: &mut PacketPool, graph: &mut AddressGraph, payload: &[u8]) {
        let id = pool
            .allocate_from(&addressed(LOCAL_TYPE, LOCAL_VALUE, payload))
            .unwrap();
        assert_eq!(graph.sink_packet(pool, id, 0), Status::Good);
        pool.dereference(id);
    }

    #[test]
    fn test_broadcast_to_matching_edges() {
        let mut pool = PacketPool::default();
        let (mut graph, recorders) = graph_with_sinks(3);
        graph.sink_edge(AddressFilter::address_type(0, 3)).unwrap();
        graph.sink_edge(AddressFilter::masked_value(1, 3, 0x04, 0xFC)).unwrap();
        graph.sink_edge(AddressFilter::address_type(2, 4)).unwrap();

        let id = pool.allocate_from(&addressed(3, 0x05, &[0xAA])).unwrap();
        let before = pool.reference_count(id);
        assert_eq!(graph.sink_packet(&mut pool, id, 0), Status::Good);
        assert_eq!(pool.reference_count(id), before);

        assert_eq!(recorders[0].borrow().seen, vec![(id, 0)]);
        assert_eq!(recorders[1].borrow().seen, vec![(id, 0)]);
        assert!(recorders[2].borrow().seen.is_empty());
        assert_eq!(recorders[0].borrow().references, vec![before]);
    }

    #[test]
    fn test_edge_header_offset_and_bad_index() {
        let mut pool = PacketPool::default();
        let (mut graph, recorders) = graph_with_sinks(1);
        graph.sink_edge(AddressFilter::match_all(0).with_header_offset(1)).unwrap();
        graph.sink_edge(AddressFilter::match_all(7)).unwrap();

        let id = pool.allocate_from(&addressed(3, 0x05, &[])).unwrap();
        assert_eq!(graph.sink_packet(&mut pool, id, 2), Status::Bad);
        assert_eq!(graph.sink_packet(&mut pool, id, 0), Status::Good);
        assert_eq!(recorders[0].borrow().seen, vec![(id, 1)]);
    }

    #[test]
    fn test_rejects_without_dest() {
        let mut pool = PacketPool::default();
        let (mut graph, _) = graph_with_sinks(1);
        let id = pool.allocate_from(&[0x02, 0xAA]).unwrap();
        assert_eq!(graph.sink_packet(&mut pool, id, 0), Status::Bad);
        let truncated = pool.allocate_from(&[HeaderFlags::DEST_ADDRESS_PRESENT.bits()]).unwrap();
        assert_eq!(graph.sink_packet(&mut pool, truncated, 0), Status::Bad);
    }

    #[test]
    fn test_commands_mutate_table() {
        let mut pool = PacketPool::default();
        let (mut graph, recorders) = graph_with_sinks(2);

        command(&mut pool, &mut graph, &[1, 0, 0, 1]);
        command(&mut pool, &mut graph, &[1, 1, 0, 2, 3]);
        command(&mut pool, &mut graph, &[1, 1, 1, 3, 3, 0x10, 0x81, 0x70]);
        let edges: Vec<_> = graph.active_edges().copied().collect();
        assert_eq!(
            edges,
            vec![
                AddressFilter::match_all(0),
                AddressFilter::address_type(1, 3),
                AddressFilter::masked_value(1, 3, 0x10, 0xF0).with_header_offset(1),
            ]
        );
        // command packets never reach the sinks
        assert!(recorders.iter().all(|r| r.borrow().seen.is_empty()));

        let changes = graph.changes();
        command(&mut pool, &mut graph, &[1, 0, 0, 1]);
        assert_eq!(graph.changes(), changes);

        command(&mut pool, &mut graph, &[2, 1, 2]);
        assert_eq!(graph.active_edges().count(), 2);
        command(&mut pool, &mut graph, &[2, 1]);
        assert_eq!(graph.active_edges().count(), 1);

        command(&mut pool, &mut graph, &[3]);
        assert_eq!(graph.edges().len(), 0);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_inactive_slot_reused() {
        let (mut graph, _) = graph_with_sinks(2);
        graph.sink_edge(AddressFilter::address_type(0, 1)).unwrap();
        graph.sink_edge(AddressFilter::address_type(1, 2)).unwrap();
        graph.remove_edges(&RemoveKey {
            sink_index: 0,
            mode: None,
            address_type: None,
            address_value: None,
        });
        graph.sink_edge(AddressFilter::match_all(1)).unwrap();
        assert_eq!(graph.edges().len(), 2);
        assert_eq!(graph.edges()[0], AddressFilter::match_all(1));
    }

    #[test]
    fn test_table_ceiling() {
        let (mut graph, _) = graph_with_sinks(1);
        for t in 0..DEFAULT_MAX_EDGES as u8 {
            graph.sink_edge(AddressFilter::address_type(0, t)).unwrap();
        }
        assert!(matches!(
            graph.sink_edge(AddressFilter::address_type(0, 99)),
            Err(RoutingError::TableFull(15))
        ));
        assert!(graph.sink_edge(AddressFilter::default()).is_err());
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            RouteCommand::parse(&[1, 2, 0, 2, 5]),
            Some(RouteCommand::Add(AddressFilter::address_type(2, 5)))
        );
        // truncated, high-bit fields, inactive mode and bad mask escape
        assert_eq!(RouteCommand::parse(&[1, 2, 0]), None);
        assert_eq!(RouteCommand::parse(&[1, 0x82, 0, 1]), None);
        assert_eq!(RouteCommand::parse(&[1, 0, 0, 0, 1]), None);
        assert_eq!(RouteCommand::parse(&[1, 0, 0, 3, 1, 2, 0x82, 1]), None);
        assert_eq!(RouteCommand::parse(&[9]), None);
        assert_eq!(RouteCommand::parse(&[]), None);

        assert_eq!(
            RouteCommand::parse(&[2, 1, 3, 4, 5]),
            Some(RouteCommand::Remove(RemoveKey {
                sink_index: 1,
                mode: Some(3),
                address_type: Some(4),
                address_value: Some(5),
            }))
        );
        assert_eq!(RouteCommand::parse(&[2, 1, 3, 4, 5, 6]), None);
        assert_eq!(RouteCommand::parse(&[2]), None);
        assert_eq!(RouteCommand::parse(&[3, 0x55]), Some(RouteCommand::RemoveAll));
    }
}

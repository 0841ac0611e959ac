//! Edge table persistence.
//!
//! Layout at the store's base address:
//!
//! ```text
//! [count] [edge; 6 bytes] * count [crc32 of count and edges, low byte first]
//! ```
//!
//! An erased device (count byte 0xFF) holds no table.

use crate::error::RoutingError;
use crate::filter::{AddressFilter, EDGE_LENGTH};
use crate::graph::AddressGraph;
use mapstack_storage::{Eeprom, ERASED};
use mapstack_wire::crc32;
use tracing::{debug, info, warn};

const COUNT_LENGTH: usize = 1;
const CRC_LENGTH: usize = 4;

/// Saves and restores an [`AddressGraph`] edge table
pub struct EdgeStore<E: Eeprom> {
    eeprom: E,
    base: usize,
    saved_changes: Option<u64>,
}

impl<E: Eeprom> EdgeStore<E> {
    /// Store at the start of `eeprom`
    pub fn new(eeprom: E) -> Self {
        Self::at(eeprom, 0)
    }

    /// Store starting at `base`
    pub fn at(eeprom: E, base: usize) -> Self {
        Self {
            eeprom,
            base,
            saved_changes: None,
        }
    }

    /// Backing device
    pub fn eeprom(&self) -> &E {
        &self.eeprom
    }

    /// Most edges that fit
    pub fn max_edges(&self) -> usize {
        let room = self.eeprom.capacity().saturating_sub(self.base);
        room.saturating_sub(COUNT_LENGTH + CRC_LENGTH) / EDGE_LENGTH
    }

    /// Write the active edges, dropping the newest ones that do not fit.
    ///
    /// Returns the number of edges written.
    pub fn save(&mut self, graph: &AddressGraph) -> Result<usize, RoutingError> {
        let active = graph.active_edges().count();
        let max = self.max_edges().min(ERASED as usize - 1);
        if active > max {
            warn!("edge table trimmed from {} to {} edges", active, max);
        }

        let mut blob = Vec::with_capacity(COUNT_LENGTH + max * EDGE_LENGTH + CRC_LENGTH);
        blob.push(0);
        let mut count = 0;
        for edge in graph.active_edges().take(max) {
            blob.extend_from_slice(&edge.to_bytes());
            count += 1;
        }
        blob[0] = count as u8;
        let crc = crc32(&blob);
        blob.extend_from_slice(&crc.to_le_bytes());

        self.eeprom.write_block(self.base, &blob)?;
        self.eeprom.flush()?;
        self.saved_changes = Some(graph.changes());
        debug!("saved {} edges", count);
        Ok(count)
    }

    /// Save only when the table changed since the last save or load
    pub fn sync(&mut self, graph: &AddressGraph) -> Result<bool, RoutingError> {
        if self.saved_changes == Some(graph.changes()) {
            return Ok(false);
        }
        self.save(graph)?;
        Ok(true)
    }

    /// Replace the graph's edges with the stored table.
    ///
    /// Returns `None` when nothing is stored; the graph is left untouched
    /// then and on any error.
    pub fn load(&mut self, graph: &mut AddressGraph) -> Result<Option<usize>, RoutingError> {
        let count = self.eeprom.read_byte(self.base)?;
        if count == ERASED {
            debug!("no stored edge table");
            return Ok(None);
        }
        let count = count as usize;
        if count > self.max_edges() {
            return Err(RoutingError::Corrupt(format!(
                "{} edges do not fit in {} bytes",
                count,
                self.eeprom.capacity()
            )));
        }

        let mut blob = vec![0u8; COUNT_LENGTH + count * EDGE_LENGTH + CRC_LENGTH];
        self.eeprom.read_block(self.base, &mut blob)?;
        let (body, stored) = blob.split_at(blob.len() - CRC_LENGTH);
        let found = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        let expected = crc32(body);
        if found != expected {
            return Err(RoutingError::Corrupt(format!(
                "crc {:#010x} != {:#010x}",
                found, expected
            )));
        }

        let edges = body[COUNT_LENGTH..]
            .chunks_exact(EDGE_LENGTH)
            .map(|chunk| {
                let mut bytes = [0u8; EDGE_LENGTH];
                bytes.copy_from_slice(chunk);
                AddressFilter::from_bytes(&bytes)
            })
            .collect::<Result<Vec<_>, _>>()?;

        graph.clear_edges();
        let mut loaded = 0;
        for edge in edges {
            match graph.sink_edge(edge) {
                Ok(()) => loaded += 1,
                Err(e) => warn!("stored edge {} rejected: {}", edge, e),
            }
        }
        self.saved_changes = Some(graph.changes());
        info!("loaded {} edges", loaded);
        Ok(Some(loaded))
    }
}

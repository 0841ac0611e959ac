//! In-memory EEPROM for development and testing

use crate::{check_range, Eeprom, StorageError, ERASED};
use tracing::trace;

/// Volatile EEPROM image
#[derive(Debug, Clone)]
pub struct MemoryEeprom {
    cells: Vec<u8>,
    writes: usize,
}

impl MemoryEeprom {
    /// Erased device of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: vec![ERASED; capacity],
            writes: 0,
        }
    }

    /// Raw contents
    pub fn as_slice(&self) -> &[u8] {
        &self.cells
    }

    /// Number of write calls so far
    pub fn write_count(&self) -> usize {
        self.writes
    }
}

impl Eeprom for MemoryEeprom {
    fn capacity(&self) -> usize {
        self.cells.len()
    }

    fn read_block(&self, addr: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        check_range(addr, buf.len(), self.cells.len())?;
        buf.copy_from_slice(&self.cells[addr..addr + buf.len()]);
        Ok(())
    }

    fn write_block(&mut self, addr: usize, data: &[u8]) -> Result<(), StorageError> {
        check_range(addr, data.len(), self.cells.len())?;
        trace!("eeprom write addr={} len={}", addr, data.len());
        self.cells[addr..addr + data.len()].copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }
}

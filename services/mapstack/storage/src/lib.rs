//! EEPROM byte-block storage for mapstack.
//!
//! Small persistent state (the routing edge table) is kept in an
//! EEPROM-like device: a fixed number of bytes addressed from zero, read
//! and written a byte or a block at a time. Backends are in-memory for
//! tests and file images for a host node.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

pub use backend::file::FileEeprom;
pub use backend::mem::MemoryEeprom;

use thiserror::Error;

/// Value of erased EEPROM cells
pub const ERASED: u8 = 0xFF;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Access outside the device
    #[error("Out of range: {len} bytes at {addr}, capacity {capacity}")]
    OutOfRange {
        /// Start address
        addr: usize,
        /// Access length
        len: usize,
        /// Device size
        capacity: usize,
    },
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
}

/// Byte-addressed persistent storage
pub trait Eeprom {
    /// Device size in bytes
    fn capacity(&self) -> usize;

    /// Read `buf.len()` bytes starting at `addr`
    fn read_block(&self, addr: usize, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Write `data` starting at `addr`
    fn write_block(&mut self, addr: usize, data: &[u8]) -> Result<(), StorageError>;

    /// Read one byte
    fn read_byte(&self, addr: usize) -> Result<u8, StorageError> {
        let mut byte = [0u8; 1];
        self.read_block(addr, &mut byte)?;
        Ok(byte[0])
    }

    /// Write one byte
    fn write_byte(&mut self, addr: usize, byte: u8) -> Result<(), StorageError> {
        self.write_block(addr, &[byte])
    }

    /// Persist pending writes
    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Range check shared by backends
pub(crate) fn check_range(addr: usize, len: usize, capacity: usize) -> Result<(), StorageError> {
    match addr.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(StorageError::OutOfRange {
            addr,
            len,
            capacity,
        }),
    }
}

impl<E: Eeprom + ?Sized> Eeprom for Box<E> {
    fn capacity(&self) -> usize {
        (**self).capacity()
    }

    fn read_block(&self, addr: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        (**self).read_block(addr, buf)
    }

    fn write_block(&mut self, addr: usize, data: &[u8]) -> Result<(), StorageError> {
        (**self).write_block(addr, data)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        (**self).flush()
    }
}

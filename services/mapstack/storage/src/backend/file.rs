//! File-backed EEPROM.
//!
//! The image is held in an anonymous mapping and written back to the file
//! on [`Eeprom::flush`]; unflushed writes are lost when the node stops.

use crate::{check_range, Eeprom, StorageError, ERASED};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// EEPROM image persisted in a fixed-size file
pub struct FileEeprom {
    path: PathBuf,
    file: File,
    map: MmapMut,
}

impl FileEeprom {
    /// Open or create an image of exactly `capacity` bytes.
    ///
    /// New files start erased. An existing file of a different size is rejected.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, StorageError> {
        if capacity == 0 {
            return Err(StorageError::Invalid("zero capacity eeprom".to_string()));
        }
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        let fresh = len == 0;
        if fresh {
            file.set_len(capacity as u64)?;
        } else if len != capacity as u64 {
            return Err(StorageError::Corruption(format!(
                "{} is {} bytes, expected {}",
                path.display(),
                len,
                capacity
            )));
        }

        let mut map = MmapMut::map_anon(capacity)?;
        if fresh {
            map.fill(ERASED);
        } else {
            file.read_exact(&mut map)?;
        }
        let mut eeprom = Self { path, file, map };
        if fresh {
            eeprom.write_back()?;
            info!("Created eeprom image {:?} ({} bytes)", eeprom.path, capacity);
        } else {
            debug!("Opened eeprom image {:?}", eeprom.path);
        }
        Ok(eeprom)
    }

    fn write_back(&mut self) -> Result<(), StorageError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.map)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Eeprom for FileEeprom {
    fn capacity(&self) -> usize {
        self.map.len()
    }

    fn read_block(&self, addr: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        check_range(addr, buf.len(), self.map.len())?;
        buf.copy_from_slice(&self.map[addr..addr + buf.len()]);
        Ok(())
    }

    fn write_block(&mut self, addr: usize, data: &[u8]) -> Result<(), StorageError> {
        check_range(addr, data.len(), self.map.len())?;
        self.map[addr..addr + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.write_back()
    }
}

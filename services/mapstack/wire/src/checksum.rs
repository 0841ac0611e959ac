//! POSIX CRC-32 checksum engine.
//!
//! Reflected polynomial 0xEDB88320, initial value 0xFFFFFFFF, final
//! inversion. The lookup table is built at compile time.

/// Reflected CRC-32 polynomial
pub const CRC32_POLYNOMIAL: u32 = 0xEDB8_8320;

const CRC32_INIT: u32 = 0xFFFF_FFFF;

const fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 {
                CRC32_POLYNOMIAL ^ (c >> 1)
            } else {
                c >> 1
            };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

/// Byte-indexed CRC-32 lookup table
pub static CRC32_TABLE: [u32; 256] = make_table();

/// Incremental CRC-32 over a byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumEngine {
    state: u32,
}

impl ChecksumEngine {
    /// Create an engine with no bytes folded in
    pub fn new() -> Self {
        Self { state: CRC32_INIT }
    }

    /// Forget every byte sunk so far
    pub fn reset(&mut self) {
        self.state = CRC32_INIT;
    }

    /// Fold one byte into the running state
    #[inline]
    pub fn sink_data(&mut self, byte: u8) {
        self.state = CRC32_TABLE[((self.state ^ byte as u32) & 0xFF) as usize] ^ (self.state >> 8);
    }

    /// Fold a slice into the running state
    pub fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.sink_data(byte);
        }
    }

    /// CRC-32 of every byte sunk since the last reset
    pub fn checksum(&self) -> u32 {
        !self.state
    }
}

impl Default for ChecksumEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot CRC-32 of a slice
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut engine = ChecksumEngine::new();
    engine.update(bytes);
    engine.checksum()
}

//! Bus address window mapping.
//!
//! The host-visible bus address range is narrower than the device's
//! internal address space, so a small set of movable windows remaps bus
//! addresses onto device addresses. The whole window set is always
//! replaced atomically; a transaction that depends on a new mapping must
//! be queued behind the reprogramming write.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::protocol::constants::{
    MEM_DOWNLOAD_BASE, MEM_DOWNLOAD_SIZE, MEM_WORKING_BASE, MEM_WORKING_SIZE, REG_AREA_BASE,
    REG_AREA_SIZE,
};

/// Access class a window targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Device memory (firmware, data buffers).
    Memory,
    /// Device register file.
    Registers,
}

/// One mapped window of device address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionWindow {
    /// Window base address in device space.
    pub start: u32,
    /// Window size in bytes.
    pub size: u32,
    pub kind: WindowKind,
}

impl PartitionWindow {
    /// Whether `addr..addr + len` lies entirely inside this window.
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.start && addr.saturating_add(len) <= self.start + self.size
    }
}

/// Number of simultaneously mapped windows.
pub const WINDOW_COUNT: usize = 4;

/// The full window set programmed into the device's mapping register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionTable {
    windows: [PartitionWindow; WINDOW_COUNT],
}

impl PartitionTable {
    pub fn new(windows: [PartitionWindow; WINDOW_COUNT]) -> Self {
        Self { windows }
    }

    /// Mapping used while streaming the firmware image: one large memory
    /// window at `mem_base` plus the register file.
    pub fn download(mem_base: u32) -> Self {
        Self::with_memory_window(mem_base, MEM_DOWNLOAD_SIZE)
    }

    /// Mapping used in steady state after boot.
    pub fn working() -> Self {
        Self::with_memory_window(MEM_WORKING_BASE, MEM_WORKING_SIZE)
    }

    fn with_memory_window(mem_base: u32, mem_size: u32) -> Self {
        Self {
            windows: [
                PartitionWindow {
                    start: mem_base,
                    size: mem_size,
                    kind: WindowKind::Memory,
                },
                PartitionWindow {
                    start: REG_AREA_BASE,
                    size: REG_AREA_SIZE,
                    kind: WindowKind::Registers,
                },
                PartitionWindow {
                    start: 0,
                    size: 0,
                    kind: WindowKind::Memory,
                },
                PartitionWindow {
                    start: 0,
                    size: 0,
                    kind: WindowKind::Registers,
                },
            ],
        }
    }

    pub fn windows(&self) -> &[PartitionWindow; WINDOW_COUNT] {
        &self.windows
    }

    /// The primary memory window.
    pub fn memory(&self) -> &PartitionWindow {
        &self.windows[0]
    }

    /// Whether any window maps `addr..addr + len`.
    pub fn maps(&self, addr: u32, len: u32) -> bool {
        self.windows.iter().any(|w| w.size > 0 && w.contains(addr, len))
    }

    /// Serialize the table for the window-mapping register write.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WINDOW_COUNT * 8);
        for w in &self.windows {
            buf.write_u32::<LittleEndian>(w.start).unwrap();
            buf.write_u32::<LittleEndian>(w.size).unwrap();
        }
        buf
    }
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self::download(MEM_DOWNLOAD_BASE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_contains() {
        let w = PartitionWindow {
            start: 0x1000,
            size: 0x100,
            kind: WindowKind::Memory,
        };
        assert!(w.contains(0x1000, 0x100));
        assert!(w.contains(0x10F0, 0x10));
        assert!(!w.contains(0x10F0, 0x11));
        assert!(!w.contains(0x0FFF, 4));
    }

    #[test]
    fn test_download_maps_registers_and_memory() {
        let table = PartitionTable::download(MEM_DOWNLOAD_BASE);
        assert!(table.maps(MEM_DOWNLOAD_BASE, 512));
        assert!(table.maps(REG_AREA_BASE + 4, 4));
        assert!(!table.maps(MEM_WORKING_BASE + MEM_DOWNLOAD_SIZE, 512));
    }

    #[test]
    fn test_serialized_size() {
        let table = PartitionTable::working();
        assert_eq!(table.to_bytes().len(), WINDOW_COUNT * 8);
    }
}

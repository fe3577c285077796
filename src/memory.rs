/*
    h89emu: Heathkit H89 computer emulator based on the z80emu library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! The 64kb memory of the `H89`.
//!
//! The low 8kb holds the resident monitor ROM at `0x0000` and the disk
//! controller boot ROM at `0x1800`. The write guard for that region is
//! enforced by the bus, the memory itself is a flat array.
#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

const MEMSIZE: usize = 0x10000;

/// Address the monitor ROM is loaded at.
pub const MONITOR_ROM_ADDR: u16 = 0x0000;
/// Address the disk controller boot ROM is loaded at.
pub const DISK_ROM_ADDR: u16 = 0x1800;
/// Writes below this address are subject to the ROM write guard.
pub const ROM_GUARD_TOP: u16 = 0x2000;

pub struct Memory {
    cells: Box<[u8; MEMSIZE]>,
}

impl Default for Memory {
    fn default() -> Self {
        Memory { cells: Box::new([0; MEMSIZE]) }
    }
}

impl Memory {
    pub fn new() -> Self {
        Memory::default()
    }

    /// Zero the entire address space.
    pub fn clear(&mut self) {
        self.cells.fill(0);
    }

    /// Copy a ROM image into memory at `addr`.
    ///
    /// **Panics** if the image does not fit in the address space.
    pub fn load_rom(&mut self, addr: u16, image: &[u8]) {
        let start = usize::from(addr);
        let end = start.checked_add(image.len())
                       .filter(|end| *end <= MEMSIZE)
                       .expect("ROM image does not fit in memory");
        self.cells[start..end].copy_from_slice(image);
    }

    #[inline(always)]
    pub fn read(&self, addr: u16) -> u8 {
        self.cells[usize::from(addr)]
    }

    #[inline(always)]
    pub fn read16(&self, addr: u16) -> u16 {
        u16::from_le_bytes([self.read(addr), self.read(addr.wrapping_add(1))])
    }

    #[inline(always)]
    pub fn write(&mut self, addr: u16, data: u8) {
        self.cells[usize::from(addr)] = data;
    }

    /// Return a copy of the given address range.
    pub fn view(&self, addrs: core::ops::Range<u16>) -> Vec<u8> {
        addrs.map(|addr| self.read(addr)).collect()
    }
}

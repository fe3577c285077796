/*
    h89emu: Heathkit H89 computer emulator based on the z80emu library.
    Copyright (C) 2019-2024  Rafal Michalski

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Lesser General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Lesser General Public License for more details.

    You should have received a copy of the GNU Lesser General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.

    Author contact information: see Cargo.toml file, section [package.authors].
*/
//! An emulator of the Heathkit H89 "all-in-one" computer: a Z80 machine
//! with a 2ms timer interrupt, a serial console and the H-88-1 hard-sectored
//! floppy disk controller, built on the
//! [z80emu](https://github.com/royaltm/rust-z80emu) CPU emulator.
//!
//! The disk controller's rotational timing is synthesized entirely from the
//! CPU cycle counter, so emulation speed does not affect what the firmware
//! observes.
pub mod bus;
pub mod clock;
pub mod console;
pub mod h17;
pub mod memory;
pub mod runner;
mod thread;

use std::path::Path;
use std::{io, fs};
use io::Read;

use z80emu::{Clock, Cpu};

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

use bus::Bus;
use console::ConsoleDevice;
use h17::{DiskGeometry, GeometryPolicy, UnrecognizedImage, H17};
use memory::{Memory, MONITOR_ROM_ADDR, DISK_ROM_ADDR, ROM_GUARD_TOP};

/// For implementations.
pub use clock::Ts;
pub use thread::{RunnerMsg, SharedStatus, DiskPosition};

/// The H89 CPU crystal frequency in T-states per second.
pub const DEFAULT_CLOCK_HZ: u32 = 2_048_000;
/// The hardware timer fires every 2 milliseconds.
const TIMER_HZ: u32 = 500;
/// How many execution bursts per emulated second.
const BURSTS_PER_SECOND: u32 = 100;

/// A consistent snapshot of the machine published to the control side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MachineSnapshot {
    pub cycles: Ts,
    pub drive: u8,
    pub track: u8,
    pub sector: u8,
    pub hole_count: u8,
}

/// The computer.
///
/// Owns the CPU, the bus with all peripherals, and the burst runner;
/// there is no ambient state, everything is reachable from here.
pub struct H89<C: Cpu, K: ConsoleDevice> {
    cpu: C,
    bus: Bus<K>,
    runner: runner::BurstRunner,
    monitor_rom: Box<[u8]>,
    disk_rom: Box<[u8]>,
}

/// Read a ROM image file.
pub fn read_rom_file<P: AsRef<Path>>(path: P) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    fs::File::open(path)?.read_to_end(&mut buf)?;
    Ok(buf)
}

impl<C: Cpu + Default, K: ConsoleDevice> H89<C, K> {
    /// Return a new instance of the computer with both ROM images loaded.
    ///
    /// **Panics** if the ROM images overflow their slots in low memory.
    pub fn new(
            clock_hz: u32,
            monitor_rom: &[u8],
            disk_rom: &[u8],
            console: K,
            policy: GeometryPolicy
        ) -> Self
    {
        assert!(monitor_rom.len() <= usize::from(DISK_ROM_ADDR));
        assert!(disk_rom.len() <= usize::from(ROM_GUARD_TOP - DISK_ROM_ADDR));
        let states_per_update = Ts::from(clock_hz / BURSTS_PER_SECOND);
        let states_per_int1 = Ts::from(clock_hz / TIMER_HZ);
        let runner = runner::BurstRunner::new(clock_hz, states_per_update, states_per_int1);
        let h17 = H17::new(states_per_int1, policy);
        let mut memory = Memory::new();
        memory.load_rom(MONITOR_ROM_ADDR, monitor_rom);
        memory.load_rom(DISK_ROM_ADDR, disk_rom);
        let bus = Bus::new(memory, h17, console);
        let mut cpu = C::default();
        cpu.reset();
        H89 {
            cpu,
            bus,
            runner,
            monitor_rom: monitor_rom.to_vec().into_boxed_slice(),
            disk_rom: disk_rom.to_vec().into_boxed_slice(),
        }
    }

    /// Run one execution burst, performing a requested reset first.
    /// Returns the elapsed T-states.
    pub fn step(&mut self) -> Ts {
        if self.runner.take_reset_request() {
            self.perform_reset();
        }
        self.runner.step(&mut self.cpu, &mut self.bus)
    }

    /// Flag a system reset.
    ///
    /// The reset is two-phase: any thread may set the flag, the actual
    /// teardown happens between bursts on whichever context calls
    /// [`H89::step`], so CPU and memory state are never mutated from
    /// outside the execution context.
    pub fn request_reset(&mut self) {
        self.runner.request_reset();
    }

    fn perform_reset(&mut self) {
        info!("system reset");
        self.cpu.reset();
        let memory = self.bus.memory_mut();
        memory.clear();
        memory.load_rom(MONITOR_ROM_ADDR, &self.monitor_rom);
        memory.load_rom(DISK_ROM_ADDR, &self.disk_rom);
        self.bus.reset();
        self.runner.rearm_timer();
    }

    /// Arm a one-shot breakpoint; 0 disarms it.
    pub fn set_breakpoint(&mut self, addr: u16) {
        self.runner.set_breakpoint(addr);
    }

    pub fn set_single_step(&mut self, enable: bool) {
        self.runner.set_single_step(enable);
    }

    pub fn request_step(&mut self) {
        self.runner.request_step();
    }

    /// Pace opcode fetches to the wall clock, matching hardware speed.
    pub fn match_hardware_clock(&mut self, enable: bool) {
        self.runner.clock_mut().match_hardware_clock(enable);
    }

    pub fn is_hardware_pace(&self) -> bool {
        self.runner.clock().is_hardware_pace()
    }

    /// Load a disk image into a drive.
    pub fn insert_disk(&mut self, drive: usize, image: &[u8])
        -> Result<DiskGeometry, UnrecognizedImage>
    {
        self.bus.h17_mut().insert_disk(drive, image)
    }

    /// Empty a drive.
    pub fn eject_disk(&mut self, drive: usize) {
        self.bus.h17_mut().eject_disk(drive);
    }

    /// Return a copy of a drive's image.
    pub fn save_disk(&self, drive: usize) -> Vec<u8> {
        self.bus.h17_ref().save_disk(drive)
    }

    /// A consistent snapshot of the cycle counter and the disk position.
    pub fn snapshot(&self) -> MachineSnapshot {
        let h17 = self.bus.h17_ref();
        MachineSnapshot {
            cycles: self.runner.clock().as_timestamp(),
            drive: h17.selected_drive() as u8,
            track: h17.drive().track(),
            sector: h17.sector(),
            hole_count: h17.hole_count(),
        }
    }

    pub fn cpu_ref(&self) -> &C {
        &self.cpu
    }

    pub fn bus_ref(&self) -> &Bus<K> {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus<K> {
        &mut self.bus
    }

    pub fn runner_ref(&self) -> &runner::BurstRunner {
        &self.runner
    }
}

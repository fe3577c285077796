/*
    h89emu: Heathkit H89 computer emulator based on the z80emu library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! The system bus: memory with the ROM write guard and the I/O port
//! dispatcher.
//!
//! Port addresses are masked to 8 bits and resolved through a 256-entry
//! owner table built at construction, so attaching a device is a table
//! registration rather than an edit to a dispatch chain.
use core::num::NonZeroU16;
use bitflags::bitflags;
use z80emu::opconsts;

use super::clock::Ts;
use super::console::ConsoleDevice;
use super::h17::{self, H17};
use super::memory::{Memory, ROM_GUARD_TOP};

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

/// Console UART registers, INS8250 style.
pub const UART_FIRST_PORT: u16 = 0xE8;
pub const UART_LAST_PORT: u16 = 0xEF;
const UART_DATA: u16 = 0xE8;
const UART_INT_ENABLE: u16 = 0xE9;
const UART_INT_ID: u16 = 0xEA;
const UART_LINE_CONTROL: u16 = 0xEB;
const UART_MODEM_CONTROL: u16 = 0xEC;
const UART_LINE_STATUS: u16 = 0xED;
const UART_MODEM_STATUS: u16 = 0xEE;

/// The general-purpose control latch.
pub const GENERAL_CONTROL_PORT: u16 = 0xF2;
/// Unpopulated positions: writes ignored, reads return 0.
pub const UNPOPULATED_PORTS: [u16; 3] = [0xF0, 0xFA, 0xFB];

/// The `RST 08h` opcode fed to the CPU on a timer interrupt.
pub const TIMER_IRQ_VECTOR: u8 = opconsts::RST_08H_OPCODE;
/// The `RST 18h` opcode fed to the CPU on a keyboard interrupt.
pub const KEYBOARD_IRQ_VECTOR: u8 = opconsts::RST_18H_OPCODE;

bitflags! {
    /// General control latch bits (port `0xF2`).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct GeneralControl: u8 {
        const TIMER_INT_ENABLE = 0x02;
        const ROM_DISABLE      = 0x20;
        const SIDE_SELECT      = 0x40;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortOwner {
    Disk,
    Console,
    Control,
    Unpopulated,
    General,
}

fn build_port_table() -> [PortOwner; 256] {
    let mut owners = [PortOwner::General; 256];
    for port in h17::DATA_PORT..=h17::CONTROL_PORT {
        owners[usize::from(port)] = PortOwner::Disk;
    }
    for port in UART_FIRST_PORT..=UART_LAST_PORT {
        owners[usize::from(port)] = PortOwner::Console;
    }
    owners[usize::from(GENERAL_CONTROL_PORT)] = PortOwner::Control;
    for port in UNPOPULATED_PORTS {
        owners[usize::from(port)] = PortOwner::Unpopulated;
    }
    owners
}

/// The memory and I/O system of the `H89`.
pub struct Bus<K: ConsoleDevice> {
    memory: Memory,
    h17: H17,
    console: K,
    owners: [PortOwner; 256],
    general: [u8; 256],
    ctrl: GeneralControl,
    pending_irq: Option<u8>,
}

impl<K: ConsoleDevice> Bus<K> {
    pub fn new(memory: Memory, h17: H17, console: K) -> Self {
        Bus {
            memory,
            h17,
            console,
            owners: build_port_table(),
            general: [0; 256],
            ctrl: GeneralControl::empty(),
            pending_irq: None,
        }
    }

    /// Clear every latch on the bus. Drive media survive, memory content
    /// is the machine's to deal with.
    pub fn reset(&mut self) {
        self.general = [0; 256];
        self.ctrl = GeneralControl::empty();
        self.pending_irq = None;
        self.h17.reset();
        self.h17.set_side(false);
    }

    pub fn memory_ref(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn h17_ref(&self) -> &H17 {
        &self.h17
    }

    pub fn h17_mut(&mut self) -> &mut H17 {
        &mut self.h17
    }

    pub fn console_mut(&mut self) -> &mut K {
        &mut self.console
    }

    pub fn general_control(&self) -> GeneralControl {
        self.ctrl
    }

    /// Whether the `0xF2` latch permits timer interrupts.
    pub fn is_timer_int_enabled(&self) -> bool {
        self.ctrl.contains(GeneralControl::TIMER_INT_ENABLE)
    }

    /// Whether the console has a character waiting and the UART
    /// receive interrupt is enabled.
    pub fn is_keyboard_int_pending(&mut self) -> bool {
        self.general[usize::from(UART_INT_ENABLE)] & 0x01 != 0
            && self.console.has_char()
    }

    /// Latch an interrupt vector for the CPU's next acknowledge cycle.
    pub fn raise_irq(&mut self, vector: u8) {
        self.pending_irq = Some(vector);
    }

    /// Latch the keyboard interrupt and flag it in the UART interrupt
    /// identification register.
    pub fn raise_keyboard_irq(&mut self) {
        self.general[usize::from(UART_INT_ID)] = 0x04;
        self.raise_irq(KEYBOARD_IRQ_VECTOR);
    }

    /// Drop an interrupt the CPU did not accept.
    pub fn clear_irq(&mut self) {
        self.pending_irq = None;
    }

    fn is_low_mem_writable(&self) -> bool {
        self.ctrl.contains(GeneralControl::ROM_DISABLE)
            || self.h17.is_write_enabled()
    }

    #[inline]
    fn general_read(&self, port: u16) -> u8 {
        self.general[usize::from(port)]
    }

    #[inline]
    fn general_write(&mut self, port: u16, data: u8) {
        self.general[usize::from(port)] = data;
    }

    fn uart_read(&mut self, port: u16) -> u8 {
        match port {
            // with the divisor latch open the data register is a plain latch
            UART_DATA if self.general_read(UART_LINE_CONTROL) & 0x80 == 0 => {
                let byte = self.console.get_char().unwrap_or(0);
                self.general_write(UART_DATA, byte);
                let lsr = self.general_read(UART_LINE_STATUS) & !0x01;
                self.general_write(UART_LINE_STATUS, lsr);
                byte
            }
            UART_MODEM_CONTROL => 0x03, // DTR/RTS
            UART_LINE_STATUS => {
                let lsr = 0x60 | u8::from(self.console.has_char());
                self.general_write(UART_LINE_STATUS, lsr);
                lsr
            }
            UART_MODEM_STATUS => 0x30, // DSR/CTS
            _ => self.general_read(port)
        }
    }

    fn uart_write(&mut self, port: u16, data: u8) {
        if port == UART_DATA && self.general_read(UART_LINE_CONTROL) & 0x80 == 0 {
            self.console.put_char(data);
        }
        self.general_write(port, data);
    }

    fn control_write(&mut self, data: u8) {
        self.ctrl = GeneralControl::from_bits_truncate(data);
        self.h17.set_side(self.ctrl.contains(GeneralControl::SIDE_SELECT));
        self.general_write(GENERAL_CONTROL_PORT, data);
    }

    fn control_read(&self) -> u8 {
        0x20 | if self.ctrl.contains(GeneralControl::SIDE_SELECT) { 0x40 }
               else { 0 }
    }
}

impl<K: ConsoleDevice> z80emu::Io for Bus<K> {
    type Timestamp = Ts;
    type WrIoBreak = ();
    type RetiBreak = ();

    fn read_io(&mut self, port: u16, ts: Ts) -> (u8, Option<NonZeroU16>) {
        let port = port & 0xFF;
        let byte = match self.owners[usize::from(port)] {
            PortOwner::Disk => self.h17.read_io(port, ts),
            PortOwner::Console => self.uart_read(port),
            PortOwner::Control => self.control_read(),
            PortOwner::Unpopulated => 0,
            PortOwner::General => self.general_read(port),
        };
        (byte, None)
    }

    fn write_io(&mut self, port: u16, data: u8, ts: Ts) -> (Option<()>, Option<NonZeroU16>) {
        let port = port & 0xFF;
        match self.owners[usize::from(port)] {
            PortOwner::Disk => self.h17.write_io(port, data, ts),
            PortOwner::Console => self.uart_write(port, data),
            PortOwner::Control => self.control_write(data),
            PortOwner::Unpopulated => {}
            PortOwner::General => self.general_write(port, data),
        }
        (None, None)
    }

    #[inline]
    fn is_irq(&mut self, _ts: Ts) -> bool {
        self.pending_irq.is_some()
    }

    fn irq_data(&mut self, _pc: u16, _ts: Ts) -> (u8, Option<NonZeroU16>) {
        (self.pending_irq.take().unwrap_or(opconsts::NOP_OPCODE), None)
    }
}

impl<K: ConsoleDevice> z80emu::Memory for Bus<K> {
    type Timestamp = Ts;

    #[inline(always)]
    fn read_opcode(&mut self, pc: u16, _ir: u16, _ts: Ts) -> u8 {
        self.memory.read(pc)
    }

    #[inline(always)]
    fn read_mem(&self, addr: u16, _ts: Ts) -> u8 {
        self.memory.read(addr)
    }

    #[inline(always)]
    fn read_mem16(&self, addr: u16, _ts: Ts) -> u16 {
        self.memory.read16(addr)
    }

    #[inline(always)]
    fn write_mem(&mut self, addr: u16, data: u8, _ts: Ts) {
        if addr < ROM_GUARD_TOP && !self.is_low_mem_writable() {
            return;
        }
        self.memory.write(addr, data);
    }

    #[inline(always)]
    fn read_debug(&self, addr: u16) -> u8 {
        self.memory.read(addr)
    }
}

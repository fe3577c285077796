/*
    h89emu: Heathkit H89 computer emulator based on the z80emu library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! Whole-machine tests driving real Z80 machine code through the bus,
//! the timer, the console UART and the disk controller.
use log::LevelFilter;
use simplelog::{Config, SimpleLogger};
use z80emu::{Cpu, Z80NMOS};
use h89emu::{H89, DEFAULT_CLOCK_HZ};
use h89emu::console::QueueConsole;
use h89emu::h17::{Checksum, GeometryPolicy, SYNC_BYTE, SECTOR_SIZE, TRACK_BYTES};

type Machine = H89<Z80NMOS, QueueConsole>;

fn new_machine(rom: &[u8]) -> Machine {
    let _ = SimpleLogger::init(LevelFilter::Debug, Config::default());
    H89::new(DEFAULT_CLOCK_HZ, rom, &[], QueueConsole::default(),
             GeometryPolicy::KeepPrevious)
}

fn run_until_halt(machine: &mut Machine) {
    for _ in 0..100 {
        machine.step();
        if machine.cpu_ref().is_halt() {
            return;
        }
    }
    panic!("the program never halted");
}

#[test]
fn console_output_through_uart() {
    // print "H89" and halt
    let rom = &[
        0x3E, 0x48,       // 0000: LD   A, 'H'
        0xD3, 0xE8,       // 0002: OUT  (E8H), A
        0x3E, 0x38,       // 0004: LD   A, '8'
        0xD3, 0xE8,       // 0006: OUT  (E8H), A
        0x3E, 0x39,       // 0008: LD   A, '9'
        0xD3, 0xE8,       // 000A: OUT  (E8H), A
        0x76,             // 000C: HALT
    ];
    let mut machine = new_machine(rom);
    run_until_halt(&mut machine);
    assert_eq!(machine.bus_mut().console_mut().output, b"H89");
}

const INTERRUPT_ROM: &[u8] = &[
    0xC3, 0x20, 0x00,       // 0000: JP   0020H
    0x00, 0x00, 0x00, 0x00, 0x00,
    0x21, 0x00, 0x20,       // 0008: LD   HL, 2000H    ; timer ISR
    0x34,                   // 000B: INC  (HL)
    0xFB,                   // 000C: EI
    0xC9,                   // 000D: RET
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xDB, 0xE8,             // 0018: IN   A, (E8H)     ; keyboard ISR
    0x32, 0x01, 0x20,       // 001A: LD   (2001H), A
    0xFB,                   // 001D: EI
    0xC9,                   // 001E: RET
    0x00,
    0x31, 0x00, 0x40,       // 0020: LD   SP, 4000H
    0x3E, 0x02,             // 0023: LD   A, 02H       ; timer int enable
    0xD3, 0xF2,             // 0025: OUT  (F2H), A
    0x3E, 0x01,             // 0027: LD   A, 01H       ; UART rx int enable
    0xD3, 0xE9,             // 0029: OUT  (E9H), A
    0xFB,                   // 002B: EI
    0x18, 0xFE,             // 002C: JR   $
];

#[test]
fn timer_interrupt_increments_counter() {
    let mut machine = new_machine(INTERRUPT_ROM);
    for _ in 0..10 {
        machine.step();
    }
    let count = machine.bus_ref().memory_ref().read(0x2000);
    assert!(count > 0, "timer service routine never ran");
}

// same layout as INTERRUPT_ROM but the timer stays off, so the
// keyboard interrupt is the only one competing for the CPU
const KEYBOARD_ROM: &[u8] = &[
    0xC3, 0x20, 0x00,       // 0000: JP   0020H
    0x00, 0x00, 0x00, 0x00, 0x00,
    0x21, 0x00, 0x20,       // 0008: LD   HL, 2000H    ; timer ISR
    0x34,                   // 000B: INC  (HL)
    0xFB,                   // 000C: EI
    0xC9,                   // 000D: RET
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xDB, 0xE8,             // 0018: IN   A, (E8H)     ; keyboard ISR
    0x32, 0x01, 0x20,       // 001A: LD   (2001H), A
    0xFB,                   // 001D: EI
    0xC9,                   // 001E: RET
    0x00,
    0x31, 0x00, 0x40,       // 0020: LD   SP, 4000H
    0x3E, 0x01,             // 0023: LD   A, 01H       ; UART rx int enable
    0xD3, 0xE9,             // 0025: OUT  (E9H), A
    0xFB,                   // 0027: EI
    0x18, 0xFE,             // 0028: JR   $
];

#[test]
fn keyboard_interrupt_delivers_character() {
    let mut machine = new_machine(KEYBOARD_ROM);
    for _ in 0..3 {
        machine.step();
    }
    machine.bus_mut().console_mut().input.push_back(b'K');
    for _ in 0..3 {
        machine.step();
    }
    assert_eq!(machine.bus_ref().memory_ref().read(0x2001), b'K');
}

#[test]
fn firmware_reads_a_sector_frame() {
    // select drive 0, start the motor, poll status for a sector pulse,
    // then pull a whole frame through the data port into 0x3000
    let rom = &[
        0x31, 0x00, 0x40, // 0000: LD   SP, 4000H
        0x3E, 0x12,       // 0003: LD   A, 12H       ; motor on, drive 0
        0xD3, 0x7F,       // 0005: OUT  (7FH), A
        0xDB, 0x7F,       // 0007: IN   A, (7FH)     ; status poll
        0xE6, 0x01,       // 0009: AND  01H          ; sector pulse?
        0xCA, 0x07, 0x00, // 000B: JP   Z, 0007H
        0x21, 0x00, 0x30, // 000E: LD   HL, 3000H
        0x0E, 0x7C,       // 0011: LD   C, 7CH
        0x06, 0x00,       // 0013: LD   B, 0         ; 256 bytes
        0xED, 0xB2,       // 0015: INIR
        0x06, 0x07,       // 0017: LD   B, 7         ; frame tail
        0xED, 0xB2,       // 0019: INIR
        0x76,             // 001B: HALT
    ];
    let image: Vec<u8> = (0..TRACK_BYTES * 40).map(|i| (i % 253) as u8).collect();
    let mut machine = new_machine(rom);
    machine.insert_disk(0, &image).unwrap();
    run_until_halt(&mut machine);

    let memory = machine.bus_ref().memory_ref();
    let frame = memory.view(0x3000..0x3000 + 263);
    assert_eq!(frame[0], SYNC_BYTE);
    assert_eq!(frame[1], 0); // volume is forced to 0 on track 0
    assert_eq!(frame[2], 0);
    assert_eq!(frame[3], 0); // the first sector pulse selects sector 0
    let mut sum = Checksum::start(SYNC_BYTE);
    for &byte in &frame[1..4] {
        sum.feed(byte);
    }
    assert_eq!(frame[4], sum.value());
    assert_eq!(frame[5], SYNC_BYTE);
    assert_eq!(&frame[6..6 + SECTOR_SIZE], &image[..SECTOR_SIZE]);
    let mut sum = Checksum::start(SYNC_BYTE);
    for &byte in &frame[6..6 + SECTOR_SIZE] {
        sum.feed(byte);
    }
    assert_eq!(frame[6 + SECTOR_SIZE], sum.value());
}

#[test]
fn rom_guard_blocks_firmware_self_destruction() {
    // try to overwrite the monitor ROM, then halt
    let rom = &[
        0x3E, 0xAA,       // 0000: LD   A, 0AAH
        0x32, 0x00, 0x10, // 0002: LD   (1000H), A
        0x32, 0x00, 0x28, // 0005: LD   (2800H), A
        0x76,             // 0008: HALT
    ];
    let mut machine = new_machine(rom);
    run_until_halt(&mut machine);
    let memory = machine.bus_ref().memory_ref();
    assert_eq!(memory.read(0x1000), 0);
    assert_eq!(memory.read(0x2800), 0xAA);
}

#[test]
fn reset_reloads_roms_and_keeps_the_cycle_counter() {
    let mut machine = new_machine(INTERRUPT_ROM);
    for _ in 0..5 {
        machine.step();
    }
    let before = machine.snapshot().cycles;
    assert!(before > 0);
    // simulated corruption, as if a runaway write had slipped through
    machine.bus_mut().memory_mut().write(0x0000, 0xFF);
    machine.request_reset();
    machine.step();
    let memory = machine.bus_ref().memory_ref();
    assert_eq!(memory.read(0x0000), INTERRUPT_ROM[0]);
    assert_eq!(memory.read(0x2000), 0); // RAM cleared
    assert!(machine.snapshot().cycles > before); // the clock never rewinds
}

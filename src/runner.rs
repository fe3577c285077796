/*
    h89emu: Heathkit H89 computer emulator based on the z80emu library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! The burst executor: runs the CPU in bounded bursts, injects timer and
//! keyboard interrupts, and implements single-step and breakpoint debugging.
use z80emu::{Clock, Cpu, BreakCause, CpuDebugFn};

use super::bus::{Bus, TIMER_IRQ_VECTOR};
use super::clock::{H89Clock, Ts};
use super::console::ConsoleDevice;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

/// Drives the CPU through execution bursts against the system bus.
///
/// A burst normally spans `states_per_update` T-states. While single-step
/// mode is active each burst executes at most one instruction, and only
/// when a step has been requested. While a breakpoint is armed execution
/// proceeds instruction by instruction so the program counter can be
/// checked after every fetch.
pub struct BurstRunner {
    clock: H89Clock,
    states_per_update: Ts,
    states_per_int1: Ts,
    next_int1: Ts,
    single_step: bool,
    step_request: bool,
    breakpoint: Option<u16>,
    reset_request: bool,
}

impl BurstRunner {
    pub fn new(clock_hz: u32, states_per_update: Ts, states_per_int1: Ts) -> Self {
        assert!(states_per_update != 0 && states_per_int1 != 0);
        BurstRunner {
            clock: H89Clock::new(clock_hz),
            states_per_update,
            states_per_int1,
            next_int1: states_per_int1,
            single_step: false,
            step_request: false,
            breakpoint: None,
            reset_request: false,
        }
    }

    /// Run one burst. Returns the number of T-states that elapsed,
    /// 0 when single-step mode is waiting for a step request.
    ///
    /// After the burst, every timer threshold the accumulated cycle count
    /// has crossed raises one timer interrupt opportunity and advances the
    /// threshold by exactly the timer period, so a large burst never skips
    /// pending interrupts. A pending console character raises the keyboard
    /// interrupt last.
    pub fn step<C, K>(&mut self, cpu: &mut C, bus: &mut Bus<K>) -> Ts
        where C: Cpu, K: ConsoleDevice
    {
        let start = self.clock.as_timestamp();
        if self.single_step {
            if self.step_request {
                self.step_request = false;
                self.execute_one(cpu, bus);
                self.check_breakpoint(cpu);
            }
        }
        else if self.breakpoint.is_some() {
            let limit = start + self.states_per_update;
            while !self.clock.is_past_limit(limit) {
                self.execute_one(cpu, bus);
                if self.check_breakpoint(cpu) {
                    break;
                }
            }
        }
        else {
            let limit = start + self.states_per_update;
            loop {
                match cpu.execute_with_limit(bus, &mut self.clock, limit) {
                    Ok(()) => break,
                    Err(BreakCause::Halt) => {}
                    Err(cause) => panic!("no break request was expected: {}", cause)
                }
            }
        }
        self.dispatch_interrupts(cpu, bus);
        self.clock.as_timestamp() - start
    }

    /// Execute one whole instruction, including any opcode prefixes.
    fn execute_one<C, K>(&mut self, cpu: &mut C, bus: &mut Bus<K>)
        where C: Cpu, K: ConsoleDevice
    {
        loop {
            match cpu.execute_next(bus, &mut self.clock, Option::<CpuDebugFn>::None) {
                Ok(()) | Err(BreakCause::Halt) => {}
                Err(cause) => panic!("no break request was expected: {}", cause)
            }
            if !cpu.is_after_prefix() {
                break;
            }
        }
    }

    fn check_breakpoint<C: Cpu>(&mut self, cpu: &C) -> bool {
        match self.breakpoint {
            Some(addr) if cpu.get_pc() == addr => {
                debug!("breakpoint hit at {:04x}", addr);
                self.breakpoint = None;
                self.step_request = false;
                self.single_step = true;
                true
            }
            _ => false
        }
    }

    fn dispatch_interrupts<C, K>(&mut self, cpu: &mut C, bus: &mut Bus<K>)
        where C: Cpu, K: ConsoleDevice
    {
        let ts = self.clock.as_timestamp();
        while ts >= self.next_int1 {
            if bus.is_timer_int_enabled() && cpu.is_irq_allowed() {
                bus.raise_irq(TIMER_IRQ_VECTOR);
                if cpu.irq(bus, &mut self.clock, Option::<CpuDebugFn>::None).is_none() {
                    bus.clear_irq();
                }
            }
            self.next_int1 += self.states_per_int1;
        }
        if bus.is_keyboard_int_pending() {
            bus.raise_keyboard_irq();
            if !cpu.is_irq_allowed()
                || cpu.irq(bus, &mut self.clock, Option::<CpuDebugFn>::None).is_none()
            {
                bus.clear_irq();
            }
        }
    }

    /// Toggle or set single-step mode.
    pub fn set_single_step(&mut self, enable: bool) {
        self.single_step = enable;
        if !enable {
            self.step_request = false;
        }
    }

    pub fn is_single_step(&self) -> bool {
        self.single_step
    }

    /// Permit one instruction to execute in single-step mode.
    pub fn request_step(&mut self) {
        self.step_request = true;
    }

    /// Arm a one-shot breakpoint; 0 disarms it.
    pub fn set_breakpoint(&mut self, addr: u16) {
        self.breakpoint = if addr == 0 { None } else { Some(addr) };
    }

    pub fn breakpoint(&self) -> Option<u16> {
        self.breakpoint
    }

    /// Flag a reset for the execution context to perform between bursts.
    pub fn request_reset(&mut self) {
        self.reset_request = true;
    }

    pub fn take_reset_request(&mut self) -> bool {
        core::mem::take(&mut self.reset_request)
    }

    /// Rearm the timer threshold one period past the current cycle count.
    /// The cycle counter itself survives a reset.
    pub fn rearm_timer(&mut self) {
        self.next_int1 = self.clock.as_timestamp() + self.states_per_int1;
    }

    pub fn states_per_update(&self) -> Ts {
        self.states_per_update
    }

    pub fn states_per_int1(&self) -> Ts {
        self.states_per_int1
    }

    pub fn next_timer_threshold(&self) -> Ts {
        self.next_int1
    }

    pub fn clock(&self) -> &H89Clock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut H89Clock {
        &mut self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::GeneralControl;
    use crate::console::QueueConsole;
    use crate::h17::{GeometryPolicy, H17};
    use crate::memory::Memory;
    use z80emu::Z80NMOS;

    const K: Ts = 1000;
    const BURST: Ts = 5000;

    fn new_fixture(code: &[u8]) -> (Z80NMOS, Bus<QueueConsole>, BurstRunner) {
        let mut memory = Memory::new();
        memory.load_rom(0, code);
        let h17 = H17::new(K, GeometryPolicy::KeepPrevious);
        let bus = Bus::new(memory, h17, QueueConsole::default());
        let mut cpu = Z80NMOS::default();
        cpu.reset();
        cpu.set_sp(0x8000);
        (cpu, bus, BurstRunner::new(2_048_000, BURST, K))
    }

    const TIMER_TEST_CODE: &[u8] = &[
        0xFB,             // 0000: EI
        0x76,             // 0001: HALT
        0x18, 0xFE,       // 0002: JR   $
        0x00, 0x00, 0x00, 0x00,
        0x21, 0x00, 0x20, // 0008: LD   HL, 2000H
        0x34,             // 000B: INC  (HL)
        0xFB,             // 000C: EI
        0xC9,             // 000D: RET
    ];

    #[test]
    fn timer_thresholds_never_skip() {
        let (mut cpu, mut bus, mut runner) = new_fixture(TIMER_TEST_CODE);
        use z80emu::Io;
        bus.write_io(0xF2, GeneralControl::TIMER_INT_ENABLE.bits(), 0);
        for steps in 1..=5u64 {
            let delta = runner.step(&mut cpu, &mut bus);
            assert!(delta >= BURST);
            let ts = runner.clock().as_timestamp();
            let next = runner.next_timer_threshold();
            // thresholds always advance by exactly K per crossing
            assert!(next > ts && next - ts <= K);
            assert_eq!(next % K, 0);
            // the service routine from the previous burst's interrupt has run
            let counter = u64::from(bus.memory_ref().read(0x2000));
            assert_eq!(counter, steps - 1);
        }
    }

    #[test]
    fn timer_interrupts_respect_enable_latch() {
        let (mut cpu, mut bus, mut runner) = new_fixture(TIMER_TEST_CODE);
        for _ in 0..5 {
            runner.step(&mut cpu, &mut bus);
        }
        assert_eq!(bus.memory_ref().read(0x2000), 0);
    }

    const STEP_TEST_CODE: &[u8] = &[
        0x00,                   // 0000: NOP
        0x00,                   // 0001: NOP
        0xDD, 0x21, 0x34, 0x12, // 0002: LD   IX, 1234H
        0x3C,                   // 0006: INC  A
        0x76,                   // 0007: HALT
    ];

    #[test]
    fn single_step_executes_one_instruction_per_request() {
        let (mut cpu, mut bus, mut runner) = new_fixture(STEP_TEST_CODE);
        runner.set_single_step(true);
        assert_eq!(runner.step(&mut cpu, &mut bus), 0);
        assert_eq!(cpu.get_pc(), 0);
        runner.request_step();
        runner.step(&mut cpu, &mut bus);
        assert_eq!(cpu.get_pc(), 1);
        assert_eq!(runner.step(&mut cpu, &mut bus), 0);
        runner.request_step();
        runner.step(&mut cpu, &mut bus);
        assert_eq!(cpu.get_pc(), 2);
        // a prefixed instruction counts as one step
        runner.request_step();
        runner.step(&mut cpu, &mut bus);
        assert_eq!(cpu.get_pc(), 6);
    }

    #[test]
    fn breakpoint_is_one_shot_and_forces_single_step() {
        let (mut cpu, mut bus, mut runner) = new_fixture(STEP_TEST_CODE);
        runner.set_breakpoint(0x0006);
        runner.step(&mut cpu, &mut bus);
        assert_eq!(cpu.get_pc(), 0x0006);
        assert!(runner.is_single_step());
        assert_eq!(runner.breakpoint(), None);
        // paused at the breakpoint until a step is requested
        runner.step(&mut cpu, &mut bus);
        assert_eq!(cpu.get_pc(), 0x0006);
        runner.request_step();
        runner.step(&mut cpu, &mut bus);
        assert_eq!(cpu.get_pc(), 0x0007);
    }

    #[test]
    fn reset_request_is_consumed_once() {
        let (_, _, mut runner) = new_fixture(&[]);
        assert!(!runner.take_reset_request());
        runner.request_reset();
        assert!(runner.take_reset_request());
        assert!(!runner.take_reset_request());
    }
}

/*
    h89emu: Heathkit H89 computer emulator based on the z80emu library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! [`Clock`] implementation for the `H89`.
use core::num::{NonZeroU8, NonZeroU16};
use std::time::{Duration, Instant};
use z80emu::host::{cycles, Clock};
use cycles::*;

/// The type used for `Timestamps`.
///
/// The counter is monotonic for the lifetime of the machine, it is never
/// being reset, not even on a system reset.
pub type Ts = u64;

/// Spin until the wall clock reaches each opcode fetch deadline.
struct FetchThrottle {
    next_fetch: Instant,
    period: Duration,
}

/// The cycle clock of the `H89`.
///
/// Accumulates T-states of every machine cycle reported by the `CPU` emulator.
/// Optionally paces opcode fetches against the wall clock with a busy-wait,
/// emulating the speed of the 2.048 MHz hardware crystal.
pub struct H89Clock {
    cur: Ts,
    clock_hz: u32,
    throttle: Option<FetchThrottle>,
}

impl H89Clock {
    /// Return a new instance of the clock from a given number of T-states per second.
    pub fn new(clock_hz: u32) -> Self {
        assert!(clock_hz != 0);
        H89Clock { cur: 0, clock_hz, throttle: None }
    }

    /// Return the `CPU` clock frequency in T-states per second.
    pub fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    /// Return a duration of a single T-state in nanoseconds.
    pub fn ts_duration_nanos(&self) -> u32 {
        1e9 as u32 / self.clock_hz
    }

    /// Enable or disable pacing of opcode fetches against the wall clock.
    ///
    /// While enabled, every opcode fetch busy-waits until its wall-clock
    /// deadline. The fetch period is below the OS sleep resolution, hence
    /// the spin.
    pub fn match_hardware_clock(&mut self, enable: bool) {
        if enable {
            let period = Duration::from_nanos(
                u64::from(M1_CYCLE_TS) * u64::from(self.ts_duration_nanos()));
            self.throttle = Some(FetchThrottle {
                next_fetch: Instant::now() + period,
                period
            });
        }
        else {
            self.throttle = None;
        }
    }

    /// Return whether fetch pacing is currently enabled.
    pub fn is_hardware_pace(&self) -> bool {
        self.throttle.is_some()
    }
}

impl Clock for H89Clock {
    type Limit = Ts;
    type Timestamp = Ts;

    #[inline]
    fn is_past_limit(&self, limit: Self::Limit) -> bool {
        self.cur >= limit
    }

    #[inline]
    fn add_irq(&mut self, _addr: u16) -> Ts {
        self.cur += Ts::from(IRQ_ACK_CYCLE_TS);
        self.cur
    }

    #[inline]
    fn add_no_mreq(&mut self, _addr: u16, add_ts: NonZeroU8) {
        self.cur += Ts::from(add_ts.get());
    }

    #[inline]
    fn add_io(&mut self, _port: u16) -> Ts {
        self.cur += Ts::from(IO_CYCLE_TS);
        self.cur
    }

    #[inline]
    fn add_mreq(&mut self, _addr: u16) -> Ts {
        self.cur += Ts::from(MEMRW_CYCLE_TS);
        self.cur
    }

    #[inline]
    fn add_m1(&mut self, _addr: u16) -> Ts {
        if let Some(throttle) = self.throttle.as_mut() {
            while Instant::now() < throttle.next_fetch {
                core::hint::spin_loop();
            }
            throttle.next_fetch = Instant::now() + throttle.period;
        }
        self.cur += Ts::from(M1_CYCLE_TS);
        self.cur
    }

    #[inline]
    fn add_wait_states(&mut self, _bus: u16, wait_states: NonZeroU16) {
        self.cur += Ts::from(wait_states.get());
    }

    #[inline]
    fn as_timestamp(&self) -> Ts {
        self.cur
    }
}

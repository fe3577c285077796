/*
    h89emu: Heathkit H89 computer emulator based on the z80emu library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! Std thread runner for the `H89`.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use z80emu::Cpu;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

use super::{H89, MachineSnapshot, Ts};
use super::console::ChannelConsole;
use super::h17::GeometryPolicy;

/// How long the execution thread naps while single-step mode waits
/// for a step request.
const IDLE_NAP: Duration = Duration::from_millis(2);

/// A message for controlling the emulation in a thread.
#[derive(Debug)]
pub enum RunnerMsg {
    /// Terminates the emulation thread.
    Terminate,
    /// Resets the computer.
    Reset,
    /// Enables or disables single-step mode.
    SingleStep(bool),
    /// Permits one instruction to execute in single-step mode.
    Step,
    /// Arms a one-shot breakpoint; 0 disarms it.
    SetBreakpoint(u16),
    /// Paces opcode fetches to the wall clock.
    MatchHardwareClock(bool),
    /// Loads a disk image into a drive.
    InsertDisk { drive: usize, image: Vec<u8> },
    /// Empties a drive.
    EjectDisk { drive: usize },
    /// Requests a copy of a drive's image over the reply channel.
    SaveDisk { drive: usize, reply: SyncSender<Vec<u8>> },
}

/// Telemetry published by the execution thread after every burst.
///
/// Readers on the control side only ever see whole published values,
/// never a torn intermediate state.
#[derive(Debug, Default)]
pub struct SharedStatus {
    cycles: AtomicU64,
    position: AtomicU64,
}

/// The disk position part of a published [`SharedStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskPosition {
    pub drive: u8,
    pub track: u8,
    pub sector: u8,
    pub hole_count: u8,
}

impl SharedStatus {
    /// The accumulated T-state count at the last published burst.
    pub fn cycles(&self) -> Ts {
        self.cycles.load(Ordering::Acquire)
    }

    /// The disk position at the last published burst.
    pub fn position(&self) -> DiskPosition {
        let packed = self.position.load(Ordering::Acquire);
        DiskPosition {
            drive: (packed >> 24) as u8,
            track: (packed >> 16) as u8,
            sector: (packed >> 8) as u8,
            hole_count: packed as u8,
        }
    }

    fn publish(&self, snapshot: MachineSnapshot) {
        let packed = u64::from(snapshot.drive) << 24
                   | u64::from(snapshot.track) << 16
                   | u64::from(snapshot.sector) << 8
                   | u64::from(snapshot.hole_count);
        self.position.store(packed, Ordering::Release);
        self.cycles.store(snapshot.cycles, Ordering::Release);
    }
}

impl<C: Cpu + Default + Send + 'static> H89<C, ChannelConsole> {
    /// Create a new computer and run it in a dedicated execution thread.
    ///
    /// Provide `run_rx` as a [`Receiver`] of [`RunnerMsg`] to control the
    /// emulation, `keyboard` and `display` as the console endpoints and
    /// `status` for the published telemetry.
    ///
    /// See [`H89::new`] for a description of the other arguments.
    #[allow(clippy::too_many_arguments)]
    pub fn start_thread(
            run_rx: Receiver<RunnerMsg>,
            clock_hz: u32,
            monitor_rom: Vec<u8>,
            disk_rom: Vec<u8>,
            policy: GeometryPolicy,
            keyboard: Receiver<u8>,
            display: SyncSender<u8>,
            status: Arc<SharedStatus>
        ) -> JoinHandle<()>
    {
        thread::spawn(move || {
            let console = ChannelConsole::new(keyboard, display);
            let mut computer = Self::new(clock_hz, &monitor_rom, &disk_rom, console, policy);
            computer.run(run_rx, &status);
        })
    }

    fn run(&mut self, run_rx: Receiver<RunnerMsg>, status: &SharedStatus) {
        let frame_duration = Duration::from_nanos(
            self.runner_ref().states_per_update()
            * u64::from(self.runner_ref().clock().ts_duration_nanos()));
        let mut time = Instant::now();

        loop {
            match run_rx.try_recv() {
                Ok(RunnerMsg::Terminate) => break,
                Ok(msg) => self.handle_message(msg),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break,
            }

            let delta = self.step();
            status.publish(self.snapshot());

            if delta == 0 {
                // single-step mode, waiting for orders
                thread::sleep(IDLE_NAP);
                time = Instant::now();
            }
            else if self.is_hardware_pace() {
                // the fetch throttle paces execution already
                time = Instant::now();
            }
            else {
                if let Some(nap) = frame_duration.checked_sub(time.elapsed()) {
                    thread::sleep(nap);
                }
                time += frame_duration;
            }
        }
    }

    /// Disk operations are handled here, between bursts on the execution
    /// thread, so they can never observe a port-driven write mid-sector.
    fn handle_message(&mut self, msg: RunnerMsg) {
        match msg {
            RunnerMsg::Terminate => unreachable!(),
            RunnerMsg::Reset => self.request_reset(),
            RunnerMsg::SingleStep(enable) => self.set_single_step(enable),
            RunnerMsg::Step => self.request_step(),
            RunnerMsg::SetBreakpoint(addr) => self.set_breakpoint(addr),
            RunnerMsg::MatchHardwareClock(enable) => self.match_hardware_clock(enable),
            RunnerMsg::InsertDisk { drive, image } => {
                if let Err(err) = self.insert_disk(drive, &image) {
                    error!("drive {}: {}", drive, err);
                }
            }
            RunnerMsg::EjectDisk { drive } => self.eject_disk(drive),
            RunnerMsg::SaveDisk { drive, reply } => {
                let _ = reply.try_send(self.save_disk(drive));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{channel, sync_channel};
    use std::time::Duration;
    use z80emu::Z80NMOS;

    const HELLO_ROM: &[u8] = &[
        0x3E, 0x48,       // 0000: LD   A, 48H  'H'
        0xD3, 0xE8,       // 0002: OUT  (E8H), A
        0x76,             // 0004: HALT
    ];

    #[test]
    fn threaded_machine_prints_and_terminates() {
        let (run_tx, run_rx) = channel();
        let (_key_tx, key_rx) = channel();
        let (disp_tx, disp_rx) = sync_channel(16);
        let status = Arc::new(SharedStatus::default());

        let handle = H89::<Z80NMOS, _>::start_thread(
            run_rx, crate::DEFAULT_CLOCK_HZ,
            HELLO_ROM.to_vec(), Vec::new(),
            GeometryPolicy::KeepPrevious,
            key_rx, disp_tx, Arc::clone(&status));

        let byte = disp_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(byte, b'H');

        run_tx.send(RunnerMsg::Terminate).unwrap();
        handle.join().unwrap();
        assert!(status.cycles() > 0);
    }

    #[test]
    fn threaded_disk_save_round_trip() {
        let (run_tx, run_rx) = channel();
        let (_key_tx, key_rx) = channel();
        let (disp_tx, _disp_rx) = sync_channel(16);
        let status = Arc::new(SharedStatus::default());

        let handle = H89::<Z80NMOS, _>::start_thread(
            run_rx, crate::DEFAULT_CLOCK_HZ,
            vec![0x76], Vec::new(), // HALT
            GeometryPolicy::KeepPrevious,
            key_rx, disp_tx, Arc::clone(&status));

        let image: Vec<u8> = (0..102_400usize).map(|i| (i % 251) as u8).collect();
        run_tx.send(RunnerMsg::InsertDisk { drive: 1, image: image.clone() }).unwrap();
        let (reply_tx, reply_rx) = sync_channel(1);
        run_tx.send(RunnerMsg::SaveDisk { drive: 1, reply: reply_tx }).unwrap();
        let saved = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(saved, image);

        run_tx.send(RunnerMsg::Terminate).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn shared_status_packs_position() {
        let status = SharedStatus::default();
        status.publish(MachineSnapshot {
            cycles: 123_456, drive: 2, track: 39, sector: 7, hole_count: 10
        });
        assert_eq!(status.cycles(), 123_456);
        assert_eq!(status.position(), DiskPosition {
            drive: 2, track: 39, sector: 7, hole_count: 10
        });
    }
}

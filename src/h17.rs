/*
    h89emu: Heathkit H89 computer emulator based on the z80emu library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! The H-88-1 hard-sectored floppy disk controller.
//!
//! The controller occupies 4 I/O ports and serves up to 3 drives with
//! 10 hard sectors of 256 bytes per track. Disk rotation is not driven
//! by a timer: the index and sector hole pulses are synthesized from the
//! CPU cycle counter whenever the firmware polls the status port, which
//! is exactly how often the real controller's state could be observed.
//!
//! Port map:
//!
//! | port   | read                    | write               |
//! |--------|-------------------------|---------------------|
//! | `0x7C` | next sector-frame byte  | write-capture byte  |
//! | `0x7D` | data-ready status       | ignored             |
//! | `0x7E` | sync detect, `0xFF`     | ignored             |
//! | `0x7F` | controller status       | command register    |
use core::fmt;
use std::time::Instant;
use arrayvec::ArrayVec;
use bitflags::bitflags;
#[cfg(feature = "serde")]
use serde::{Serialize, Deserialize};

use super::clock::Ts;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

/// Data port: sector-frame bytes out, write-capture bytes in.
pub const DATA_PORT: u16 = 0x7C;
/// Data-ready status port.
pub const READY_PORT: u16 = 0x7D;
/// Sync-character detect port.
pub const SYNC_PORT: u16 = 0x7E;
/// Status (read) and command (write) port.
pub const CONTROL_PORT: u16 = 0x7F;

/// The number of bytes in a sector payload.
pub const SECTOR_SIZE: usize = 256;
/// The number of hard sectors on a track.
pub const SECTORS_PER_TRACK: usize = 10;
/// The number of image bytes per logical track.
pub const TRACK_BYTES: usize = SECTOR_SIZE * SECTORS_PER_TRACK;
/// The number of drives served by the controller.
pub const NUM_DRIVES: usize = 3;

/// The sync marker preceding the sector header and the sector data.
pub const SYNC_BYTE: u8 = 0xFD;
/// Image offset of the volume id byte on recognized disks.
const VOLUME_ID_OFFSET: usize = 0x900;
/// Sync + volume + track + sector + checksum.
const HEADER_SIZE: usize = 5;
/// A complete sector frame: header, sync, payload, checksum.
const FRAME_SIZE: usize = HEADER_SIZE + 1 + SECTOR_SIZE + 1;

/// One hole-timing slot per revolution: 10 sector pulses and the index pulse.
const HOLE_SLOTS: u8 = 11;

const RAW_CAPTURE_SIZE: usize = 4096;
/// Approximate raw-track spacing of sector pulses, in captured bytes.
const RAW_MARKER_SPACING: usize = 320;

/// Boot sector signatures of disk formats that carry a volume id.
/// HDOS 1.x, 2.x, 3.x, Super-89 and two OMDOS variants.
const BOOT_SIGNATURES: [[u8; 4]; 6] = [
    [0xAF, 0xD3, 0x7D, 0xCD],
    [0xC3, 0xA0, 0x22, 0x20],
    [0xC3, 0xA0, 0x22, 0x30],
    [0xC3, 0x1D, 0x24, 0x20],
    [0x18, 0x1E, 0x13, 0x20],
    [0xC3, 0xD1, 0x23, 0x20],
];

bitflags! {
    /// Command register bits (port `0x7F` writes).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiskCommand: u8 {
        const WRITE_GATE   = 0x01;
        const SELECT_0     = 0x02;
        const SELECT_1     = 0x04;
        const SELECT_2     = 0x08;
        const MOTOR_ON     = 0x10;
        const STEP_IN      = 0x20;
        const STEP         = 0x40;
        const WRITE_ENABLE = 0x80;
    }

    /// Status register bits (port `0x7F` reads).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiskStatus: u8 {
        const HOLE          = 0x01;
        const TRACK0        = 0x02;
        const WRITE_PROTECT = 0x04;
        const SYNC_DETECT   = 0x08;
    }
}

/// What to do with a disk image whose byte length matches no known geometry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GeometryPolicy {
    /// Keep the drive's previous geometry and load the image bytes anyway.
    #[default]
    KeepPrevious,
    /// Refuse to load the image.
    Reject,
}

/// An error loading a disk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnrecognizedImage {
    /// The offending image length in bytes.
    pub len: usize,
}

impl fmt::Display for UnrecognizedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized disk image length: {} bytes", self.len)
    }
}

impl std::error::Error for UnrecognizedImage {}

/// Disk geometry, inferred from an image's byte length and never stored
/// in the image itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiskGeometry {
    pub sides: u8,
    pub tracks: u8,
}

impl Default for DiskGeometry {
    fn default() -> Self {
        DiskGeometry { sides: 1, tracks: 40 }
    }
}

impl DiskGeometry {
    /// Infer the geometry from an image byte length, `None` if the length
    /// matches no known format (100kb, 200kb or 400kb).
    pub fn from_image_len(len: usize) -> Option<Self> {
        match len {
            l if l == TRACK_BYTES * 40 => Some(DiskGeometry { sides: 1, tracks: 40 }),
            l if l == TRACK_BYTES * 40 * 2 => Some(DiskGeometry { sides: 2, tracks: 40 }),
            l if l == TRACK_BYTES * 80 * 2 => Some(DiskGeometry { sides: 2, tracks: 80 }),
            _ => None
        }
    }

    /// The exact image length in bytes for this geometry.
    pub fn image_len(&self) -> usize {
        TRACK_BYTES * usize::from(self.sides) * usize::from(self.tracks)
    }

    /// The highest head position.
    pub fn max_track(&self) -> u8 {
        self.tracks - 1
    }
}

/// The byte offset of a sector in a flat disk image.
///
/// `t` is the logical track index: head track position times the number of
/// sides, plus the selected side (cylinder-major, then side).
pub const fn image_offset(t: usize, sector: usize) -> usize {
    TRACK_BYTES * t + SECTOR_SIZE * sector
}

/// The 9-bit rotating checksum used for sector headers and payloads.
///
/// Each run is seeded with the sync byte that precedes it; since the seed
/// is also folded in, the accumulator always leaves the sync byte at zero.
#[derive(Debug, Clone, Copy)]
pub struct Checksum(u16);

impl Checksum {
    /// Start a checksum run from the sync byte.
    pub fn start(sync: u8) -> Self {
        let mut sum = Checksum(u16::from(sync));
        sum.feed(sync);
        sum
    }

    /// Fold the next byte into the accumulator.
    pub fn feed(&mut self, byte: u8) {
        self.0 ^= u16::from(byte);
        self.0 <<= 1;
        if self.0 & 0x0100 != 0 {
            // carry-out rotates back into bit 0
            self.0 = (self.0 & 0xFF) | 0x01;
        }
    }

    /// The checksum byte.
    pub fn value(&self) -> u8 {
        self.0 as u8
    }
}

/// A single drive: its image buffer, geometry and head position.
pub struct Drive {
    image: Box<[u8]>,
    geometry: DiskGeometry,
    track: u8,
    volume: u8,
    recognized: bool,
    write_protect: bool,
    loaded: bool,
}

impl Default for Drive {
    fn default() -> Self {
        let geometry = DiskGeometry::default();
        Drive {
            image: vec![0; geometry.image_len()].into_boxed_slice(),
            geometry,
            track: 0,
            volume: 0,
            recognized: false,
            write_protect: false,
            loaded: false,
        }
    }
}

impl Drive {
    /// Load a disk image into the drive.
    ///
    /// On an unrecognized image length the `policy` decides whether the load
    /// fails or proceeds under the drive's previous geometry.
    pub fn load(&mut self, image: &[u8], policy: GeometryPolicy)
        -> Result<DiskGeometry, UnrecognizedImage>
    {
        match DiskGeometry::from_image_len(image.len()) {
            Some(geometry) => {
                self.geometry = geometry;
                self.image = image.to_vec().into_boxed_slice();
            }
            None => match policy {
                GeometryPolicy::Reject => {
                    return Err(UnrecognizedImage { len: image.len() })
                }
                GeometryPolicy::KeepPrevious => {
                    warn!("disk image length {} unrecognized, keeping geometry {:?}",
                          image.len(), self.geometry);
                    let n = image.len().min(self.image.len());
                    self.image[..n].copy_from_slice(&image[..n]);
                }
            }
        }
        self.track = self.track.min(self.geometry.max_track());
        self.recognized = self.image.len() >= 4 &&
            BOOT_SIGNATURES.iter().any(|sig| self.image[..4] == sig[..]);
        self.volume = if self.recognized {
            self.image.get(VOLUME_ID_OFFSET).copied().unwrap_or(0)
        }
        else {
            0
        };
        self.loaded = true;
        info!("disk loaded: {} bytes, sides={} tracks={} vol={}",
              image.len(), self.geometry.sides, self.geometry.tracks, self.volume);
        Ok(self.geometry)
    }

    /// Empty the drive, returning it to its default single-sided state.
    pub fn eject(&mut self) {
        *self = Drive { write_protect: self.write_protect, ..Drive::default() };
    }

    /// Return a copy of the drive's image, sized exactly to its geometry.
    pub fn save(&self) -> Vec<u8> {
        self.image.to_vec()
    }

    fn step(&mut self, inward: bool) {
        self.track = if inward {
            self.track.saturating_add(1).min(self.geometry.max_track())
        }
        else {
            self.track.saturating_sub(1)
        };
    }

    pub fn geometry(&self) -> DiskGeometry { self.geometry }
    pub fn track(&self) -> u8 { self.track }
    pub fn volume(&self) -> u8 { self.volume }
    pub fn is_recognized_format(&self) -> bool { self.recognized }
    pub fn is_loaded(&self) -> bool { self.loaded }
    pub fn is_write_protected(&self) -> bool { self.write_protect }
    pub fn set_write_protect(&mut self, protect: bool) {
        self.write_protect = protect;
    }
}

/// Diagnostic timing of one hole slot: how long the slot took in T-states
/// and in wall-clock milliseconds.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HoleTiming {
    pub tstates: Ts,
    pub millis: u64,
}

/// The rotational state of the spindle, shared by all drives since the
/// controller addresses one drive at a time.
struct Rotation {
    hole_count: u8,
    last_hole_ts: Ts,
    last_hole_ms: u64,
    hole_active: bool,
    timing: [HoleTiming; HOLE_SLOTS as usize],
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation {
            hole_count: 0,
            last_hole_ts: 0,
            last_hole_ms: 0,
            hole_active: false,
            timing: [HoleTiming::default(); HOLE_SLOTS as usize],
        }
    }
}

/// The assembled frame of the sector currently passing under the head.
#[derive(Default)]
struct SectorFrame {
    buf: ArrayVec<u8, FRAME_SIZE>,
    cursor: usize,
}

impl SectorFrame {
    /// Reset a cursor left mid-header or at the end of the frame by an
    /// interrupted read sequence.
    fn resync(&mut self) {
        if self.cursor < HEADER_SIZE || self.cursor == self.buf.len() {
            self.cursor = 0;
        }
    }

    fn read(&mut self) -> u8 {
        match self.buf.get(self.cursor) {
            Some(&byte) => {
                self.cursor += 1;
                byte
            }
            None => 0
        }
    }
}

/// The write-capture state machine, active while the write gate is enabled.
#[derive(Default)]
struct WriteCapture {
    /// Image offset established by the most recent sector frame build.
    target: usize,
    sync_seen: bool,
    committing: bool,
    count: usize,
}

/// Raw capture of every byte presented on the data-write path, with markers
/// approximating sector-pulse positions. Diagnostic only.
struct RawCapture {
    buf: Box<[u8; RAW_CAPTURE_SIZE]>,
    marker: Box<[u8; RAW_CAPTURE_SIZE]>,
    count: usize,
}

impl Default for RawCapture {
    fn default() -> Self {
        RawCapture {
            buf: Box::new([0; RAW_CAPTURE_SIZE]),
            marker: Box::new([0; RAW_CAPTURE_SIZE]),
            count: 0,
        }
    }
}

impl RawCapture {
    fn push(&mut self, byte: u8) {
        let n = self.count % RAW_CAPTURE_SIZE;
        self.buf[n] = byte;
        self.marker[n] = u8::from(n % RAW_MARKER_SPACING == 0);
        self.count += 1;
    }
}

/// The disk controller.
pub struct H17 {
    drives: [Drive; NUM_DRIVES],
    selected: usize,
    side: bool,
    motor_on: bool,
    step_inward: bool,
    write_gate: bool,
    write_enable: bool,
    sync_detect: bool,
    data_avail: bool,
    sector: u8,
    rotation: Rotation,
    frame: SectorFrame,
    capture: WriteCapture,
    raw: RawCapture,
    states_per_hole: Ts,
    policy: GeometryPolicy,
    epoch: Instant,
}

impl H17 {
    /// Create a controller.
    ///
    /// `states_per_int1` is the 2ms timer tick period in T-states; one disk
    /// revolution spans 10 of those ticks (300 RPM).
    pub fn new(states_per_int1: Ts, policy: GeometryPolicy) -> Self {
        H17 {
            drives: Default::default(),
            selected: 0,
            side: false,
            motor_on: false,
            step_inward: false,
            write_gate: false,
            write_enable: false,
            sync_detect: false,
            data_avail: false,
            sector: 0,
            rotation: Rotation::default(),
            frame: SectorFrame::default(),
            capture: WriteCapture::default(),
            raw: RawCapture::default(),
            states_per_hole: states_per_int1 * 10,
            policy,
            epoch: Instant::now(),
        }
    }

    /// Handle a read of one of the controller's 4 ports.
    pub fn read_io(&mut self, port: u16, ts: Ts) -> u8 {
        match port {
            DATA_PORT => {
                let byte = self.frame.read();
                self.sync_detect = false;
                byte
            }
            READY_PORT => 0x80 | u8::from(self.data_avail),
            SYNC_PORT => {
                self.sync_detect = true;
                0xFF
            }
            CONTROL_PORT => {
                self.frame.resync();
                self.advance_rotation(ts);
                self.status().bits()
            }
            _ => 0
        }
    }

    /// Handle a write to one of the controller's 4 ports.
    pub fn write_io(&mut self, port: u16, data: u8, _ts: Ts) {
        self.frame.resync();
        match port {
            DATA_PORT => self.write_data(data),
            CONTROL_PORT => self.write_command(DiskCommand::from_bits_truncate(data)),
            _ => {}
        }
    }

    fn status(&mut self) -> DiskStatus {
        let mut status = DiskStatus::empty();
        if self.rotation.hole_active {
            // a one-shot pulse, reading it consumes it
            self.rotation.hole_active = false;
            status |= DiskStatus::HOLE;
        }
        if self.drive().track() == 0 {
            status |= DiskStatus::TRACK0;
        }
        if self.drive().is_write_protected() {
            status |= DiskStatus::WRITE_PROTECT;
        }
        if self.sync_detect {
            status |= DiskStatus::SYNC_DETECT;
        }
        status
    }

    /// Advance the synthesized rotation, at most one hole slot per call.
    ///
    /// Slots 0..=9 are sector pulses and select the sector passing under
    /// the head; slot 10 is the index pulse. The last two slots each span
    /// half the nominal hole interval.
    fn advance_rotation(&mut self, ts: Ts) {
        if !self.motor_on {
            return;
        }
        let mut interval = self.states_per_hole;
        if self.rotation.hole_count >= 9 {
            interval /= 2;
        }
        if ts >= self.rotation.last_hole_ts + interval {
            let ms = self.wall_ms();
            let slot = usize::from(self.rotation.hole_count);
            self.rotation.timing[slot] = HoleTiming {
                tstates: ts - self.rotation.last_hole_ts,
                millis: ms - self.rotation.last_hole_ms,
            };
            self.rotation.last_hole_ts = ts;
            self.rotation.last_hole_ms = ms;
            if self.rotation.hole_count < 10 {
                self.sector = self.rotation.hole_count;
                self.build_sector_frame();
            }
            self.rotation.hole_count = (self.rotation.hole_count + 1) % HOLE_SLOTS;
            self.rotation.hole_active = true;
        }
    }

    /// Assemble the frame of the currently selected sector and establish
    /// the write-capture target at that sector's image offset. Writes always
    /// land on the sector the head was last positioned over.
    fn build_sector_frame(&mut self) {
        let side = usize::from(self.side);
        let drive = &self.drives[self.selected];
        let t = usize::from(drive.track()) * usize::from(drive.geometry().sides) + side;
        let volume = if t == 0 { 0 } else { drive.volume() };
        let offset = image_offset(t, usize::from(self.sector));

        let buf = &mut self.frame.buf;
        buf.clear();
        let mut sum = Checksum::start(SYNC_BYTE);
        buf.push(SYNC_BYTE);
        for byte in [volume, t as u8, self.sector] {
            buf.push(byte);
            sum.feed(byte);
        }
        buf.push(sum.value());

        let mut sum = Checksum::start(SYNC_BYTE);
        buf.push(SYNC_BYTE);
        for i in 0..SECTOR_SIZE {
            let byte = drive.image.get(offset + i).copied().unwrap_or(0);
            buf.push(byte);
            sum.feed(byte);
        }
        buf.push(sum.value());

        self.frame.cursor = 0;
        self.capture.target = offset;
    }

    fn write_data(&mut self, byte: u8) {
        if self.write_gate {
            if byte == SYNC_BYTE && !self.capture.sync_seen {
                self.capture.sync_seen = true;
                self.capture.count = 0;
                self.capture.committing = true;
            }
            if self.capture.committing {
                let n = self.capture.count;
                self.capture.count += 1;
                if n == 0 {
                    // the sync marker itself
                }
                else if n <= SECTOR_SIZE {
                    let target = self.capture.target;
                    if let Some(cell) = self.drives[self.selected].image.get_mut(target) {
                        *cell = byte;
                    }
                    self.capture.target += 1;
                }
                else {
                    self.capture.sync_seen = false;
                    self.capture.committing = false;
                }
            }
        }
        self.raw.push(byte);
    }

    fn write_command(&mut self, command: DiskCommand) {
        if command.contains(DiskCommand::WRITE_GATE) {
            if !self.write_gate {
                self.write_gate = true;
                self.raw.count = 0;
            }
        }
        else if self.write_gate {
            self.write_gate = false;
            self.capture.committing = false;
            self.capture.sync_seen = false;
            self.capture.count = 0;
        }

        if command.contains(DiskCommand::SELECT_0) {
            self.selected = 0;
        }
        else if command.contains(DiskCommand::SELECT_1) {
            self.selected = 1;
        }
        else if command.contains(DiskCommand::SELECT_2) {
            self.selected = 2;
        }

        self.motor_on = command.contains(DiskCommand::MOTOR_ON);
        self.step_inward = command.contains(DiskCommand::STEP_IN);

        if command.contains(DiskCommand::STEP) {
            let inward = self.step_inward;
            self.drives[self.selected].step(inward);
            trace!("head step {} to track {}",
                   if inward { "in" } else { "out" },
                   self.drives[self.selected].track());
        }

        self.write_enable = command.contains(DiskCommand::WRITE_ENABLE);
    }

    /// Reset the rotational state. Drive images, head positions and the
    /// selected drive survive a system reset.
    pub fn reset(&mut self) {
        self.rotation = Rotation::default();
        self.sync_detect = false;
        self.write_gate = false;
        self.write_enable = false;
        self.motor_on = false;
        self.capture = WriteCapture::default();
    }

    /// Load a disk image into the given drive.
    pub fn insert_disk(&mut self, drive: usize, image: &[u8])
        -> Result<DiskGeometry, UnrecognizedImage>
    {
        self.drives[drive].load(image, self.policy)
    }

    /// Empty the given drive.
    pub fn eject_disk(&mut self, drive: usize) {
        self.drives[drive].eject();
    }

    /// Return a copy of the given drive's image.
    pub fn save_disk(&self, drive: usize) -> Vec<u8> {
        self.drives[drive].save()
    }

    /// Latch the head side, driven by the general control port.
    pub fn set_side(&mut self, side: bool) {
        self.side = side;
    }

    /// Assert or release the external data-available line.
    pub fn set_data_avail(&mut self, avail: bool) {
        self.data_avail = avail;
    }

    /// The ROM write guard override: asserted by command bit 7.
    pub fn is_write_enabled(&self) -> bool {
        self.write_enable
    }

    pub fn drive(&self) -> &Drive {
        &self.drives[self.selected]
    }

    pub fn drive_mut(&mut self, drive: usize) -> &mut Drive {
        &mut self.drives[drive]
    }

    pub fn selected_drive(&self) -> usize { self.selected }
    pub fn sector(&self) -> u8 { self.sector }
    pub fn hole_count(&self) -> u8 { self.rotation.hole_count }
    pub fn is_motor_on(&self) -> bool { self.motor_on }

    /// Diagnostic per-slot timing of the last revolution.
    pub fn hole_timing(&self) -> &[HoleTiming] {
        &self.rotation.timing
    }

    fn wall_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

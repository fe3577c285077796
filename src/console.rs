/*
    h89emu: Heathkit H89 computer emulator based on the z80emu library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! The console (terminal/keyboard) collaborator of the `H89`.
use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, SyncSender};

/// An interface to the device on the other side of the console UART.
///
/// The emulated machine pulls keyboard characters from and pushes display
/// characters to an implementation of this trait.
pub trait ConsoleDevice {
    /// Return whether a keyboard character is waiting to be read.
    fn has_char(&mut self) -> bool;
    /// Take the next keyboard character if one is waiting.
    fn get_char(&mut self) -> Option<u8>;
    /// Send a character to the display.
    fn put_char(&mut self, data: u8);
}

/// A console exchanging characters over `mpsc` channels.
///
/// Characters that the display side fails to accept in time are dropped,
/// the emulated machine must never block on its console.
pub struct ChannelConsole {
    input: Receiver<u8>,
    output: SyncSender<u8>,
    pending: Option<u8>,
}

impl ChannelConsole {
    pub fn new(input: Receiver<u8>, output: SyncSender<u8>) -> Self {
        ChannelConsole { input, output, pending: None }
    }

    fn fill_pending(&mut self) {
        if self.pending.is_none() {
            self.pending = self.input.try_recv().ok();
        }
    }
}

impl ConsoleDevice for ChannelConsole {
    fn has_char(&mut self) -> bool {
        self.fill_pending();
        self.pending.is_some()
    }

    fn get_char(&mut self) -> Option<u8> {
        self.fill_pending();
        self.pending.take()
    }

    fn put_char(&mut self, data: u8) {
        let _ = self.output.try_send(data);
    }
}

/// A queue-backed console for driving the machine from tests.
#[derive(Default)]
pub struct QueueConsole {
    pub input: VecDeque<u8>,
    pub output: Vec<u8>,
}

impl ConsoleDevice for QueueConsole {
    fn has_char(&mut self) -> bool {
        !self.input.is_empty()
    }

    fn get_char(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn put_char(&mut self, data: u8) {
        self.output.push(data);
    }
}

/// A console with no keyboard that discards all display output.
#[derive(Default)]
pub struct NullConsole;

impl ConsoleDevice for NullConsole {
    fn has_char(&mut self) -> bool { false }
    fn get_char(&mut self) -> Option<u8> { None }
    fn put_char(&mut self, _data: u8) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_console_round_trip() {
        let mut console = QueueConsole::default();
        assert!(!console.has_char());
        assert_eq!(console.get_char(), None);
        console.input.extend([b'A', b'B']);
        assert!(console.has_char());
        assert_eq!(console.get_char(), Some(b'A'));
        assert_eq!(console.get_char(), Some(b'B'));
        assert_eq!(console.get_char(), None);
        console.put_char(b'X');
        assert_eq!(console.output, b"X");
    }

    #[test]
    fn channel_console_does_not_block() {
        let (in_tx, in_rx) = std::sync::mpsc::channel();
        let (out_tx, out_rx) = std::sync::mpsc::sync_channel(1);
        let mut console = ChannelConsole::new(in_rx, out_tx);
        assert!(!console.has_char());
        in_tx.send(b'Z').unwrap();
        assert!(console.has_char());
        assert_eq!(console.get_char(), Some(b'Z'));
        console.put_char(b'1');
        console.put_char(b'2'); // channel full, dropped
        assert_eq!(out_rx.try_recv().ok(), Some(b'1'));
        assert!(out_rx.try_recv().is_err());
    }
}

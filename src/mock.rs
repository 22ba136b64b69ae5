//! Simulated ROM bootloader for tests

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::protocol::*;
use crate::SerialPort;

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct MockError;

/// Device side of the link
pub struct Device {
    pub memory: Vec<u8>,
    pub unlocked: bool,
    pub baud: u32,
    pub host_baud: u32,
    /// `(line, level)` in the order they were driven
    pub lines: Vec<(&'static str, bool)>,
    /// `(command, address, length)` of every decoded request
    pub requests: Vec<(u8, u16, u16)>,
    /// Last load PC target
    pub pc: Option<u16>,
    /// Read timeout set by the host
    pub read_timeout: Option<u32>,

    /// Ignore everything
    pub silent: bool,
    /// Answer syncs but ignore frames
    pub mute_frames: bool,
    /// Number of data replies to send with a broken checksum
    pub corrupt_replies: u32,
    /// NAK every write block
    pub nak_writes: bool,

    rx: VecDeque<u8>,
    frame: Vec<u8>,
    in_frame: bool,
}

impl Device {
    /// F149 with ROM BSL 1.60 and blank flash
    pub fn new() -> Self {
        let mut d = Self {
            memory: vec![ERASED; ADDRESS_SPACE as usize],
            unlocked: false,
            baud: INITIAL_BAUD,
            host_baud: INITIAL_BAUD,
            lines: Vec::new(),
            requests: Vec::new(),
            pc: None,
            read_timeout: None,
            silent: false,
            mute_frames: false,
            corrupt_replies: 0,
            nak_writes: false,
            rx: VecDeque::new(),
            frame: Vec::new(),
            in_frame: false,
        };
        d.set_version(0xF149, 0x0160);
        d
    }

    pub fn set_version(&mut self, device_id: u16, bsl: u16) {
        let a = VERSION_ADDR as usize;
        self.memory[a..a + 2].copy_from_slice(&device_id.to_be_bytes());
        self.memory[a + 10..a + 12].copy_from_slice(&bsl.to_be_bytes());
    }

    pub fn load(&mut self, address: u16, data: &[u8]) {
        let a = address as usize;
        self.memory[a..a + data.len()].copy_from_slice(data);
    }

    /// Requests carrying `command`, in order
    pub fn requests_of(&self, command: Command) -> Vec<(u16, u16)> {
        self.requests
            .iter()
            .filter(|(c, _, _)| *c == command as u8)
            .map(|(_, a, l)| (*a, *l))
            .collect()
    }

    fn receive(&mut self, b: u8) {
        if self.silent {
            return;
        }

        if !self.in_frame {
            if b == BSL_SYNC {
                self.rx.push_back(DATA_ACK);
                self.in_frame = true;
            }
            return;
        }

        self.frame.push(b);
        if self.frame.len() >= 4 && self.frame.len() == self.frame[2] as usize + 6 {
            let raw = std::mem::take(&mut self.frame);
            self.in_frame = false;

            if !self.mute_frames {
                self.handle(&raw);
            }
        }
    }

    fn handle(&mut self, raw: &[u8]) {
        let frame = match Frame::decode(raw) {
            Ok(f) => f,
            Err(_) => return self.rx.push_back(DATA_NAK),
        };

        let p = &frame.payload;
        let address = u16::from_le_bytes([p[0], p[1]]);
        let length = u16::from_le_bytes([p[2], p[3]]);
        let data = p[4..].to_vec();
        self.requests.push((frame.command, address, length));

        let command = match Command::from_u8(frame.command) {
            Some(c) => c,
            None => return self.rx.push_back(DATA_NAK),
        };
        if command.requires_password() && !self.unlocked {
            return self.rx.push_back(DATA_NAK);
        }

        let a = address as usize;
        let ok = match command {
            Command::RxPassword => {
                self.unlocked = data[..] == self.memory[PASSWORD_ADDR as usize..];
                self.unlocked
            }
            Command::RxDataBlock if self.nak_writes => false,
            Command::RxDataBlock => {
                for (i, b) in data.iter().enumerate() {
                    // Flash can only clear bits
                    if a + i >= 0x1000 {
                        self.memory[a + i] &= *b;
                    } else {
                        self.memory[a + i] = *b;
                    }
                }
                true
            }
            Command::TxDataBlock => {
                let block = self.memory[a..a + length as usize].to_vec();
                return self.reply(block);
            }
            Command::Erase => match length {
                ERASE_SEGMENT => {
                    let size = segment_size(address as u32) as usize;
                    self.fill(a, a + size);
                    true
                }
                ERASE_MAIN => {
                    self.fill(0x1100, ADDRESS_SPACE as usize);
                    true
                }
                _ => false,
            },
            Command::MassErase => {
                self.fill(0x1000, ADDRESS_SPACE as usize);
                true
            }
            Command::LoadPc => {
                self.pc = Some(address);
                // User code comes back through a locked BSL, the RAM patch returns directly
                if address != RAM_LOAD_ADDR {
                    self.unlocked = false;
                }
                true
            }
            Command::ChangeBaud => {
                self.baud = match length {
                    0 => 9600,
                    1 => 19200,
                    _ => 38400,
                };
                true
            }
        };

        self.rx.push_back(if ok { DATA_ACK } else { DATA_NAK });
    }

    fn reply(&mut self, data: Vec<u8>) {
        let mut raw = Frame::new(0, data).encode().unwrap();
        if self.corrupt_replies > 0 {
            self.corrupt_replies -= 1;
            raw[4] ^= 0x01;
        }
        self.rx.extend(raw);
    }

    fn fill(&mut self, start: usize, end: usize) {
        for b in &mut self.memory[start..end] {
            *b = ERASED;
        }
    }
}

/// Host side handle, clones share the device
#[derive(Clone)]
pub struct MockPort(pub Rc<RefCell<Device>>);

impl MockPort {
    pub fn new() -> (Self, Rc<RefCell<Device>>) {
        let dev = Rc::new(RefCell::new(Device::new()));
        (Self(dev.clone()), dev)
    }
}

impl Read<u8> for MockPort {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, MockError> {
        self.0.borrow_mut().rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for MockPort {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), MockError> {
        self.0.borrow_mut().receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), MockError> {
        Ok(())
    }
}

impl SerialPort<MockError> for MockPort {
    fn set_rts(&mut self, level: bool) -> Result<(), MockError> {
        self.0.borrow_mut().lines.push(("rts", level));
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), MockError> {
        self.0.borrow_mut().lines.push(("dtr", level));
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), MockError> {
        self.0.borrow_mut().host_baud = baud;
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout_ms: u32) -> Result<(), MockError> {
        self.0.borrow_mut().read_timeout = Some(timeout_ms);
        Ok(())
    }
}

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

//! Simulated STM32 UART bootloader for driving the programmer in tests.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use stm32ld::protocol::{checksum, FLASH_BASE, UART_ACK, UART_DISC, UART_NACK};
use stm32ld::{Options, Programmer, SerialPort};

/// Error injected when the simulated link is unplugged
#[derive(Debug, Clone, PartialEq)]
pub struct LinkDown;

/// Commands the target accepted, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Get,
    GetId,
    Unprotect,
    Erase,
    ExtendedErase,
    Write { address: u32, len: usize },
    Read { address: u32, len: usize },
    Go { address: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Dtr(bool),
    Rts(bool),
}

enum Stage {
    Idle,
    Complement(u8),
    EraseParams { want: Vec<u8>, buf: Vec<u8>, op: Op },
    Address { op: u8, buf: Vec<u8> },
    WriteLen { address: u32 },
    WriteData { address: u32, buf: Vec<u8>, want: usize },
    ReadLen { address: u32, buf: Vec<u8> },
}

pub struct Target {
    // Behaviour
    pub version: u8,
    pub chip_id: u16,
    pub commands: Vec<u8>,
    /// Init character (1 based) that gets the first ACK, `None` to stay silent
    pub ack_sync_on: Option<u32>,
    /// Whether write unprotect resets the bootloader
    pub reset_on_unprotect: bool,
    /// NACK the next n write data stages
    pub nack_writes: u32,
    /// Swallow the ACK of the next n write data stages
    pub drop_write_acks: u32,
    /// Always NACK writes to this address
    pub nack_write_at: Option<u32>,
    /// Flip the byte at this address in read memory replies
    pub corrupt_read_at: Option<u32>,
    pub nack_go: bool,
    /// Jump without acknowledging the go address
    pub silent_go: bool,
    pub link_down: bool,

    // Observed
    pub sync_bytes: u32,
    pub sent: Vec<u8>,
    pub ops: Vec<Op>,
    pub lines: Vec<Line>,
    pub write_stages: u32,
    pub flash: Vec<u8>,

    synced: bool,
    after_reset: bool,
    stage: Stage,
    rx: VecDeque<u8>,
}

impl Target {
    pub fn new(version: u8, chip_id: u16) -> Self {
        let commands = if version >> 4 == 3 {
            vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92]
        } else {
            vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0x63, 0x73, 0x82, 0x92]
        };

        Self {
            version,
            chip_id,
            commands,
            ack_sync_on: Some(1),
            reset_on_unprotect: true,
            nack_writes: 0,
            drop_write_acks: 0,
            nack_write_at: None,
            corrupt_read_at: None,
            nack_go: false,
            silent_go: false,
            link_down: false,
            sync_bytes: 0,
            sent: vec![],
            ops: vec![],
            lines: vec![],
            write_stages: 0,
            flash: vec![],
            synced: false,
            after_reset: false,
            stage: Stage::Idle,
            rx: VecDeque::new(),
        }
    }

    /// Addresses and lengths of accepted writes
    pub fn writes(&self) -> Vec<(u32, usize)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Write { address, len } => Some((*address, *len)),
                _ => None,
            })
            .collect()
    }

    fn reply(&mut self, data: &[u8]) {
        self.rx.extend(data.iter().copied());
    }

    fn extended(&self) -> bool {
        self.version >> 4 == 3
    }

    fn receive(&mut self, b: u8) {
        let stage = std::mem::replace(&mut self.stage, Stage::Idle);

        self.stage = match stage {
            Stage::Idle if !self.synced => {
                if b == UART_DISC {
                    self.sync_bytes += 1;
                    let ack = self.after_reset
                        || matches!(self.ack_sync_on, Some(k) if self.sync_bytes >= k);
                    if ack {
                        self.synced = true;
                        self.after_reset = false;
                        self.reply(&[UART_ACK]);
                    }
                }
                Stage::Idle
            }
            Stage::Idle if b == UART_DISC => {
                self.reply(&[UART_NACK]);
                Stage::Idle
            }
            Stage::Idle => Stage::Complement(b),

            Stage::Complement(op) if b != !op => {
                self.reply(&[UART_NACK]);
                Stage::Idle
            }
            Stage::Complement(op) => self.command(op),

            Stage::EraseParams { want, mut buf, op } => {
                buf.push(b);
                if buf.len() < want.len() {
                    Stage::EraseParams { want, buf, op }
                } else {
                    if buf == want {
                        self.flash.clear();
                        self.ops.push(op);
                        self.reply(&[UART_ACK]);
                    } else {
                        self.reply(&[UART_NACK]);
                    }
                    Stage::Idle
                }
            }

            Stage::Address { op, mut buf } => {
                buf.push(b);
                if buf.len() < 5 {
                    self.stage = Stage::Address { op, buf };
                    return;
                }
                if checksum(&buf[..4]) != buf[4] {
                    self.reply(&[UART_NACK]);
                    return;
                }
                let address = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                match op {
                    0x31 => {
                        self.reply(&[UART_ACK]);
                        Stage::WriteLen { address }
                    }
                    0x11 => {
                        self.reply(&[UART_ACK]);
                        Stage::ReadLen {
                            address,
                            buf: vec![],
                        }
                    }
                    _ => {
                        if self.nack_go {
                            self.reply(&[UART_NACK]);
                        } else {
                            self.ops.push(Op::Go { address });
                            if !self.silent_go {
                                self.reply(&[UART_ACK]);
                            }
                            self.synced = false;
                        }
                        Stage::Idle
                    }
                }
            }

            Stage::WriteLen { address } => Stage::WriteData {
                address,
                buf: vec![b],
                want: b as usize + 3,
            },

            Stage::WriteData {
                address,
                mut buf,
                want,
            } => {
                buf.push(b);
                if buf.len() < want {
                    self.stage = Stage::WriteData { address, buf, want };
                    return;
                }
                self.write_stages += 1;

                if self.nack_writes > 0 {
                    self.nack_writes -= 1;
                    self.reply(&[UART_NACK]);
                } else if self.drop_write_acks > 0 {
                    self.drop_write_acks -= 1;
                } else if self.nack_write_at == Some(address)
                    || checksum(&buf[..want - 1]) != buf[want - 1]
                {
                    self.reply(&[UART_NACK]);
                } else {
                    let data = &buf[1..want - 1];
                    let offset = (address - FLASH_BASE) as usize;
                    if self.flash.len() < offset + data.len() {
                        self.flash.resize(offset + data.len(), 0xFF);
                    }
                    self.flash[offset..offset + data.len()].copy_from_slice(data);
                    self.ops.push(Op::Write {
                        address,
                        len: data.len(),
                    });
                    self.reply(&[UART_ACK]);
                }
                Stage::Idle
            }

            Stage::ReadLen { address, mut buf } => {
                buf.push(b);
                if buf.len() < 2 {
                    self.stage = Stage::ReadLen { address, buf };
                    return;
                }
                if buf[1] != !buf[0] {
                    self.reply(&[UART_NACK]);
                    return;
                }
                let len = buf[0] as usize + 1;
                let mut data = vec![];
                for i in 0..len as u32 {
                    let a = address + i;
                    let offset = (a - FLASH_BASE) as usize;
                    let mut v = self.flash.get(offset).copied().unwrap_or(0xFF);
                    if self.corrupt_read_at == Some(a) {
                        v = !v;
                    }
                    data.push(v);
                }
                self.ops.push(Op::Read { address, len });
                self.reply(&[UART_ACK]);
                self.reply(&data);
                Stage::Idle
            }
        };
    }

    fn command(&mut self, op: u8) -> Stage {
        match op {
            0x00 => {
                let mut r = vec![UART_ACK, self.commands.len() as u8, self.version];
                r.extend_from_slice(&self.commands);
                r.push(UART_ACK);
                self.reply(&r);
                self.ops.push(Op::Get);
                Stage::Idle
            }
            0x02 => {
                let id = self.chip_id.to_be_bytes();
                self.reply(&[UART_ACK, 1, id[0], id[1], UART_ACK]);
                self.ops.push(Op::GetId);
                Stage::Idle
            }
            0x73 => {
                self.reply(&[UART_ACK, UART_ACK]);
                self.ops.push(Op::Unprotect);
                if self.reset_on_unprotect {
                    self.synced = false;
                    self.after_reset = true;
                }
                Stage::Idle
            }
            0x43 if !self.extended() => {
                self.reply(&[UART_ACK]);
                Stage::EraseParams {
                    want: vec![0xFF, 0x00],
                    buf: vec![],
                    op: Op::Erase,
                }
            }
            0x44 if self.extended() => {
                self.reply(&[UART_ACK]);
                Stage::EraseParams {
                    want: vec![0xFF, 0xFF, 0x00],
                    buf: vec![],
                    op: Op::ExtendedErase,
                }
            }
            0x11 | 0x21 | 0x31 => {
                self.reply(&[UART_ACK]);
                Stage::Address { op, buf: vec![] }
            }
            _ => {
                self.reply(&[UART_NACK]);
                Stage::Idle
            }
        }
    }
}

impl Read<u8> for Target {
    type Error = LinkDown;

    fn read(&mut self) -> nb::Result<u8, LinkDown> {
        if self.link_down {
            return Err(nb::Error::Other(LinkDown));
        }
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for Target {
    type Error = LinkDown;

    fn write(&mut self, word: u8) -> nb::Result<(), LinkDown> {
        if self.link_down {
            return Err(nb::Error::Other(LinkDown));
        }
        self.sent.push(word);
        self.receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), LinkDown> {
        Ok(())
    }
}

impl SerialPort<LinkDown> for Target {
    fn set_rts(&mut self, level: bool) -> Result<(), LinkDown> {
        self.lines.push(Line::Rts(level));
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), LinkDown> {
        self.lines.push(Line::Dtr(level));
        Ok(())
    }
}

/// Delay that only accounts for the time requested
#[derive(Clone, Default)]
pub struct Clock(pub Rc<Cell<u64>>);

impl Clock {
    pub fn elapsed_ms(&self) -> u64 {
        self.0.get()
    }
}

impl DelayMs<u32> for Clock {
    fn delay_ms(&mut self, ms: u32) {
        self.0.set(self.0.get() + u64::from(ms));
    }
}

pub type TestProgrammer = Programmer<Target, Clock, LinkDown>;

/// Short timeouts, no reset and no spacing between init characters
pub fn options() -> Options {
    Options {
        no_reset: true,
        response_timeout_ms: 5,
        erase_timeout_ms: 5,
        sync_interval_ms: 0,
        ..Options::default()
    }
}

pub fn programmer(target: Target) -> TestProgrammer {
    Programmer::new(target, Clock::default(), options())
}

pub fn programmer_with(target: Target, options: Options) -> TestProgrammer {
    Programmer::new(target, Clock::default(), options)
}

/// Test image with a recognisable pattern
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
}

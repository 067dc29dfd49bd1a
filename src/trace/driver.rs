// This file is part of retrace64.
// Copyright (c) 2021-2023 retrace64 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::io::Read;
use std::rc::Rc;

use bit_field::BitField;
use log::{error, info, trace};

use crate::cpu::{Cpu6502, Flag};
use crate::error::Error;
use crate::mem::BusBridge;
use crate::sound::Sid;
use crate::trace::TraceStream;
use crate::util::{Clock, Pin, Shared};
use crate::video::Vic;

// Design:
//   The driver replays one captured bus cycle per step. A word pair is
//   classified as a VIC cycle (BA low, no write) or a CPU cycle; on CPU
//   cycles the emulated pins are reconciled against the observation before
//   the data byte is fed in. Interrupts cannot be seen on the bus directly,
//   so the driver looks for their signature: three consecutive stack
//   writes, which nothing but BRK or an interrupt sequence produces.

/// Outcome of replaying one bus cycle.
#[derive(Debug, PartialEq)]
pub enum Step {
    Continue,
    Eof,
}

pub struct TraceDriver<R: Read> {
    // Dependencies
    stream: TraceStream<R>,
    bridge: BusBridge,
    vic: Shared<Vic>,
    sid: Shared<Sid>,
    ba_line: Shared<Pin>,
    clock: Rc<Clock>,
    // Runtime state
    cpu: Cpu6502,
    vic_in_sync: bool,
    forcing_interrupt: bool,
}

impl<R: Read> TraceDriver<R> {
    pub fn new(
        stream: TraceStream<R>,
        bridge: BusBridge,
        vic: Shared<Vic>,
        sid: Shared<Sid>,
        ba_line: Shared<Pin>,
        clock: Rc<Clock>,
    ) -> Self {
        Self {
            stream,
            bridge,
            vic,
            sid,
            ba_line,
            clock,
            cpu: Cpu6502::new(),
            vic_in_sync: false,
            forcing_interrupt: false,
        }
    }

    pub fn cpu(&self) -> &Cpu6502 {
        &self.cpu
    }

    pub fn reset(&mut self) {
        self.cpu.reset();
        self.bridge.reset();
        self.vic_in_sync = false;
        self.forcing_interrupt = false;
    }

    /// Discard words until the trace shows the reset vector fetch, two
    /// consecutive reads of $FFFC/$FFFD.
    pub fn wait_for_reset(&mut self) -> Result<(), Error> {
        loop {
            let w0 = match self.stream.peek(0) {
                Ok(word) => word,
                Err(Error::TraceEof) => return Err(Error::ResetNotFound),
                Err(err) => return Err(err),
            };
            let w2 = match self.stream.peek(2) {
                Ok(word) => word,
                Err(Error::TraceEof) => return Err(Error::ResetNotFound),
                Err(err) => return Err(err),
            };
            if w0 == 0xfffc && w2 == 0xfffd {
                info!(target: "trace::sync", "reset vector fetch found at cycle {}", self.clock.get());
                return Ok(());
            }
            match self.stream.get() {
                Ok(_) => {}
                Err(Error::TraceEof) => return Err(Error::ResetNotFound),
                Err(err) => return Err(err),
            }
        }
    }

    fn peek_write(&mut self, pos: usize) -> bool {
        matches!(self.stream.peek(pos), Ok(word) if word & 0x0100 != 0)
    }

    /// Replay one captured bus cycle.
    pub fn step(&mut self) -> Result<Step, Error> {
        let address = match self.stream.get() {
            Ok(word) => word,
            Err(Error::TraceEof) => return Ok(Step::Eof),
            Err(err) => return Err(err),
        };
        let status_data = match self.stream.get() {
            Ok(word) => word,
            Err(Error::TraceEof) => return Ok(Step::Eof),
            Err(err) => return Err(err),
        };
        let status = (status_data >> 8) as u8;
        let data = status_data as u8;
        let cycle = self.clock.get();

        if status & 0xfc != 0 {
            return Err(Error::TraceFormat { status, cycle });
        }
        let ba = status.get_bit(1);
        let write = status.get_bit(0);

        // Steer an in-flight forced interrupt sequence
        if self.forcing_interrupt {
            match self.cpu.cycle {
                1 => self.forcing_interrupt = false,
                4 => {
                    // The pushed status has the break flag clear
                    self.cpu.data &= !(Flag::Break as u8);
                }
                5 => {
                    // The observed vector address tells IRQ and NMI apart
                    if address == 0xfffa {
                        self.cpu.addr = address;
                    }
                }
                _ => {}
            }
        }

        // Look ahead: three consecutive writes only occur during an
        // interrupt or BRK
        if !self.forcing_interrupt
            && self.cpu.cycle == 1
            && self.peek_write(1)
            && self.peek_write(3)
            && self.peek_write(5)
            && self.cpu.opcode != 0x00
        {
            trace!(target: "trace::int", "interrupt signature at cycle {}", cycle);
            self.cpu.force_interrupt();
            self.forcing_interrupt = true;
        }

        // Advance the VIC once its BA prediction has locked to the trace
        if self.vic_in_sync || self.ba_line.borrow().is_high() {
            let line_done = self.vic.borrow_mut().clock();
            if line_done {
                self.sid.borrow_mut().emulate_line();
            }
        } else if ba {
            info!(target: "trace::sync", "VIC locked to capture stream at cycle {}", cycle);
            self.vic_in_sync = true;
        }

        // CPU cycle: reconcile the emulated pins against the observation
        if !ba || write {
            // The 6502 keeps calculating through stolen cycles, allow the
            // one-page-up intermediate of an unfinished index fixup
            if address != self.cpu.addr && address != self.cpu.addr.wrapping_add(0x100) {
                error!(
                    target: "trace::sync",
                    "{} {:04x} {:02x} - op: {:02x}({}) - cycle {}",
                    if write { 'W' } else { 'R' },
                    address,
                    data,
                    self.cpu.opcode,
                    self.cpu.cycle,
                    cycle
                );
                return Err(Error::AddressDesync {
                    cycle,
                    expected: self.cpu.addr,
                    observed: address,
                });
            }

            if write {
                if !self.cpu.write {
                    return Err(Error::StrobeDesync {
                        cycle,
                        write_expected: false,
                    });
                }
                // The upper nibble is undefined when read back from color
                // RAM, compare the stored nibble only
                if address > 0x0001 && (data & 0x0f) != (self.cpu.data & 0x0f) {
                    return Err(Error::DataDesync {
                        cycle,
                        address,
                        expected: self.cpu.data,
                        observed: data,
                    });
                }
                let value = if address <= 0x0001 { self.cpu.data } else { data };
                self.bridge.write(address, value);
            } else {
                if self.cpu.write {
                    return Err(Error::StrobeDesync {
                        cycle,
                        write_expected: true,
                    });
                }
                self.cpu.data = match address {
                    0x0000 | 0x0001 => self.bridge.read(address),
                    _ => data,
                };
            }
            self.cpu.clock();
        }

        self.clock.tick();
        Ok(Step::Continue)
    }
}

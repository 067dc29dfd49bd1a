// This file is part of retrace64.
// Copyright (c) 2021-2023 retrace64 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use log::trace;

use crate::io::Cia2;
use crate::mem::Ram;
use crate::sound::Sid;
use crate::util::Shared;
use crate::video::Vic;

// Design:
//   The bridge holds the memory the chips share and decodes CPU-side
//   accesses observed on the trace. I/O visibility at $D000-$DFFF follows
//   the 6510 processor port: an I/O access lands in a chip register, color
//   RAM or one of the CIAs, everything else goes straight to RAM. Reads
//   are only decoded for the processor port itself; all other read data
//   comes from the capture stream.

pub struct BusBridge {
    // Dependencies
    ram: Shared<Ram>,
    color_ram: Shared<Ram>,
    vic: Shared<Vic>,
    sid: Shared<Sid>,
    cia2: Shared<Cia2>,
    // 6510 port
    ddr: u8,
    dr: u8,
    io_visible: bool,
}

impl BusBridge {
    pub fn new(
        ram: Shared<Ram>,
        color_ram: Shared<Ram>,
        vic: Shared<Vic>,
        sid: Shared<Sid>,
        cia2: Shared<Cia2>,
    ) -> Self {
        let mut bridge = Self {
            ram,
            color_ram,
            vic,
            sid,
            cia2,
            ddr: 0x00,
            dr: 0x3f,
            io_visible: false,
        };
        bridge.changed_port();
        bridge
    }

    /// Restart state for a new replay: memories cleared, 6510 port back
    /// to its power-on value.
    pub fn reset(&mut self) {
        self.ram.borrow_mut().reset();
        self.color_ram.borrow_mut().reset();
        self.ddr = 0x00;
        self.dr = 0x3f;
        self.changed_port();
    }

    #[inline]
    pub fn io_visible(&self) -> bool {
        self.io_visible
    }

    /// CPU-side read decode. Only the processor port is served locally;
    /// every other read is satisfied by the capture stream.
    pub fn read(&self, address: u16) -> u8 {
        match address {
            0x0000 => self.ddr,
            // Sense is always high, no cassette button pressed
            0x0001 => self.dr | 0x10,
            _ => self.ram.borrow().read(address),
        }
    }

    pub fn write(&mut self, address: u16, value: u8) {
        match address {
            0x0000 => {
                self.ddr = value & 0x3f;
                self.changed_port();
            }
            0x0001 => {
                self.dr = value & 0x3f;
                self.changed_port();
            }
            _ => {}
        }
        if address < 0xd000 || address >= 0xe000 || !self.io_visible {
            self.ram.borrow_mut().write(address, value);
        } else {
            match (address >> 8) & 0x0f {
                0x0..=0x3 => self.vic.borrow_mut().write((address & 0x3f) as u8, value),
                0x4..=0x7 => self.sid.borrow_mut().write((address & 0x1f) as u8, value),
                // Reads from color RAM return garbage in the upper nibble,
                // only the stored nibble is meaningful
                0x8..=0xb => self
                    .color_ram
                    .borrow_mut()
                    .write(address & 0x03ff, value & 0x0f),
                0xc => {
                    // CIA 1: keyboard/joystick, no effect on the chips here
                    trace!(target: "mem::bus", "cia1 write {:#06x} = {:#04x}", address, value);
                }
                0xd => self.cia2.borrow_mut().write((address & 0x0f) as u8, value),
                _ => {
                    // I/O 1 and I/O 2 expansion areas are not populated
                }
            }
        }
    }

    fn changed_port(&mut self) {
        let port = !self.ddr | self.dr;
        self.io_visible = (port & 0x03) != 0 && (port & 0x04) != 0;
        trace!(target: "mem::bus", "io_visible = {}", self.io_visible);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    use crate::io::Cia2;
    use crate::mem::Rom;
    use crate::sound::{Sid, SAMPLE_FREQ};
    use crate::util::{new_shared, Clock, IrqLine, Pin};
    use crate::video::{FrameBuffer, Palette, Vic, DISPLAY_X, DISPLAY_Y};

    fn setup() -> (BusBridge, Shared<Ram>, Shared<Ram>) {
        let ram = new_shared(Ram::new(0x10000));
        let color_ram = new_shared(Ram::new(0x0400));
        let char_rom = new_shared(Rom::new(vec![0; 0x1000]));
        let frame_buffer = new_shared(FrameBuffer::new(DISPLAY_X, DISPLAY_Y, Palette::default()));
        let ba_line = new_shared(Pin::new_high());
        let irq_line = new_shared(IrqLine::new("irq"));
        let clock = Rc::new(Clock::new());
        let vic = new_shared(Vic::new(
            ram.clone(),
            color_ram.clone(),
            char_rom,
            frame_buffer,
            ba_line,
            irq_line,
            clock,
        ));
        let sid = new_shared(Sid::new(SAMPLE_FREQ, true));
        let cia2 = new_shared(Cia2::new(vic.clone()));
        let bridge = BusBridge::new(ram.clone(), color_ram.clone(), vic, sid, cia2);
        (bridge, ram, color_ram)
    }

    #[test]
    fn io_is_visible_after_reset() {
        let (bridge, _, _) = setup();
        assert!(bridge.io_visible());
    }

    #[test]
    fn reset_clears_memories() {
        let (mut bridge, ram, color_ram) = setup();
        bridge.write(0x1234, 0xaa);
        bridge.write(0xd800, 0x0f);
        bridge.reset();
        assert_eq!(0x00, ram.borrow().read(0x1234));
        assert_eq!(0x00, color_ram.borrow().read(0x0000));
        assert!(bridge.io_visible());
    }

    #[test]
    fn color_ram_stores_nibbles() {
        let (mut bridge, ram, color_ram) = setup();
        bridge.write(0xd800, 0xff);
        assert_eq!(0x0f, color_ram.borrow().read(0x0000));
        assert_eq!(0x00, ram.borrow().read(0xd800));
    }

    #[test]
    fn banked_out_io_goes_to_ram() {
        let (mut bridge, ram, _) = setup();
        // Drive the low port bits as outputs and pull them low
        bridge.write(0x0000, 0x07);
        bridge.write(0x0001, 0x00);
        assert!(!bridge.io_visible());
        bridge.write(0xd020, 0x05);
        assert_eq!(0x05, ram.borrow().read(0xd020));
    }

    #[test]
    fn processor_port_reads() {
        let (mut bridge, _, _) = setup();
        bridge.write(0x0000, 0x2f);
        bridge.write(0x0001, 0x07);
        assert_eq!(0x2f, bridge.read(0x0000));
        // Cassette sense is forced high
        assert_eq!(0x07 | 0x10, bridge.read(0x0001));
    }

    #[test]
    fn port_writes_also_land_in_ram() {
        let (mut bridge, ram, _) = setup();
        bridge.write(0x0001, 0x36);
        assert_eq!(0x36, ram.borrow().read(0x0001));
    }
}

// This file is part of retrace64.
// Copyright (c) 2021-2023 retrace64 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use log::trace;

use crate::util::Shared;
use crate::video::Vic;

// Only the port A data and direction registers matter to the re-simulation:
// they select VA14/15 and thereby the 16K bank the VIC sees. Timers, serial
// and TOD live their lives on the real machine; their effects arrive through
// the capture stream.

pub struct Cia2 {
    vic: Shared<Vic>,
    pra: u8,
    ddra: u8,
}

impl Cia2 {
    pub fn new(vic: Shared<Vic>) -> Self {
        Self {
            vic,
            pra: 0,
            ddra: 0,
        }
    }

    pub fn reset(&mut self) {
        self.pra = 0;
        self.ddra = 0;
        self.changed_va();
    }

    pub fn write(&mut self, reg: u8, value: u8) {
        match reg {
            0x00 => {
                self.pra = value;
                self.changed_va();
            }
            0x02 => {
                self.ddra = value;
                self.changed_va();
            }
            _ => {}
        }
    }

    fn changed_va(&mut self) {
        let va = !(self.pra | !self.ddra) & 0x03;
        trace!(target: "io::cia2", "VA14/15 = {}", va);
        self.vic.borrow_mut().changed_va(u16::from(va));
    }
}

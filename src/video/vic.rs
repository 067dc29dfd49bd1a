// This file is part of retrace64.
// Copyright (c) 2021-2023 retrace64 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::rc::Rc;

use bit_field::BitField;
use log::trace;

use crate::mem::{Ram, Rom};
use crate::util::{Clock, IrqLine, IrqSource, Pin, Shared};
use crate::video::FrameBuffer;

// Spec: "The MOS 6567/6569 video controller (VIC-II) and its application
// in the Commodore 64" by Christian Bauer.
// Design:
//   A 63-cycle-per-line state machine for the PAL chip. Each clock()
//   advances one raster cycle (8 pixels of output) and performs the memory
//   accesses of that cycle: sprite pointers and data in the line margins,
//   refresh, then the 40-column character matrix and graphics fetches. On
//   bad lines BA is pulled low to stall the CPU while the matrix and color
//   line buffers are refilled. Graphics are painted per cycle, sprites and
//   the border overlay once per line.
//
// Known deviations from the real chip, matching the capture replay this
// core is reconciled against:
//   - changes to border/background color show up 7 pixels late
//   - sprite data accesses do not respect BA
//   - sprite collisions are only detected within the visible area
//   - sprites are dropped unless they fit the chunky line completely

pub const DISPLAY_X: usize = 0x180;
pub const DISPLAY_Y: usize = 0x110;
pub const TOTAL_RASTERS: u16 = 0x138;
pub const CYCLES_PER_LINE: u16 = 63;
pub const SCREEN_FREQ: u32 = 50;

// First and last displayed line
const FIRST_DISP_LINE: u16 = 0x10;
const LAST_DISP_LINE: u16 = 0x11f;

// First and last possible line for Bad Lines
const FIRST_DMA_LINE: u16 = 0x30;
const LAST_DMA_LINE: u16 = 0xf7;

// Display window coordinates
const ROW25_YSTART: u16 = 0x33;
const ROW25_YSTOP: u16 = 0xfb;
const ROW24_YSTART: u16 = 0x37;
const ROW24_YSTOP: u16 = 0xf7;

const SPRITES_ON: bool = true;
const SPRITE_COLLISIONS: bool = false;

// The sprite compositor reads a 9-byte window of the foreground mask,
// the padding keeps the rightmost sprites in bounds.
const FORE_MASK_LEN: usize = DISPLAY_X / 8 + 8;

const fn sprite_exp_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut value = 0u16;
        let mut bit = 0;
        while bit < 8 {
            if i & (1 << bit) != 0 {
                value |= 0b11 << (bit * 2);
            }
            bit += 1;
        }
        table[i] = value;
        i += 1;
    }
    table
}

const fn sprite_multi_exp_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut value = 0u16;
        let mut pair = 0;
        while pair < 4 {
            let bits = ((i >> (pair * 2)) & 0b11) as u16;
            value |= (bits | bits << 2) << (pair * 4);
            pair += 1;
        }
        table[i] = value;
        i += 1;
    }
    table
}

// Tables for sprite X expansion
static EXP_TABLE: [u16; 256] = sprite_exp_table();
static MULTI_EXP_TABLE: [u16; 256] = sprite_multi_exp_table();

pub struct Vic {
    // Dependencies
    ram: Shared<Ram>,
    color_ram: Shared<Ram>,
    char_rom: Shared<Rom>,
    frame_buffer: Shared<FrameBuffer>,
    ba_line: Shared<Pin>,
    irq_line: Shared<IrqLine>,
    clock: Rc<Clock>,
    // Registers
    mx: [u16; 8],
    my: [u8; 8],
    mx8: u8,
    ctrl1: u8,
    ctrl2: u8,
    me: u8,
    mxe: u8,
    mye: u8,
    mdp: u8,
    mmc: u8,
    vbase: u8,
    irq_flag: u8,
    irq_mask: u8,
    clx_spr: u8,
    clx_bgr: u8,
    // Colors (palette indices)
    ec_color: u8,
    b0c_color: u8,
    b1c_color: u8,
    b2c_color: u8,
    b3c_color: u8,
    mm0_color: u8,
    mm1_color: u8,
    spr_color: [u8; 8],
    // Line buffers read in on Bad Lines
    matrix_line: [u8; 40],
    color_line: [u8; 40],
    // Output position within the chunky frame buffer
    chunky_pos: usize,
    line_start: usize,
    fore_mask_pos: usize,
    fore_mask_buf: [u8; FORE_MASK_LEN],
    // Raster counters
    raster_x: u16,
    raster_y: u16,
    irq_raster: u16,
    dy_start: u16,
    dy_stop: u16,
    rc: u16,
    vc: u16,
    vc_base: u16,
    x_scroll: u16,
    y_scroll: u16,
    cia_vabase: u16,
    cycle: u16,
    display_idx: u8,
    ml_index: usize,
    // Sprite engine
    mc: [u16; 8],
    mc_base: [u16; 8],
    spr_exp_y: u8,
    spr_dma_on: u8,
    spr_disp_on: u8,
    spr_draw: u8,
    spr_ptr: [u16; 8],
    spr_data: [[u8; 4]; 8],
    spr_draw_data: [[u8; 4]; 8],
    spr_coll_buf: [u8; DISPLAY_X],
    // Display state
    display_state: bool,
    border_on: bool,
    ud_border_on: bool,
    bad_lines_enabled: bool,
    is_bad_line: bool,
    draw_this_line: bool,
    vblanking: bool,
    border_on_sample: [bool; 5],
    border_color_sample: [u8; DISPLAY_X / 8],
    // Memory pointers
    matrix_base: u16,
    char_base: u16,
    bitmap_base: u16,
    // Graphics data pipeline
    ref_cnt: u8,
    gfx_data: u8,
    char_data: u8,
    color_data: u8,
    last_char_data: u8,
    first_ba_cycle: u32,
}

impl Vic {
    pub fn new(
        ram: Shared<Ram>,
        color_ram: Shared<Ram>,
        char_rom: Shared<Rom>,
        frame_buffer: Shared<FrameBuffer>,
        ba_line: Shared<Pin>,
        irq_line: Shared<IrqLine>,
        clock: Rc<Clock>,
    ) -> Self {
        Self {
            ram,
            color_ram,
            char_rom,
            frame_buffer,
            ba_line,
            irq_line,
            clock,
            mx: [0; 8],
            my: [0; 8],
            mx8: 0,
            ctrl1: 0,
            ctrl2: 0,
            me: 0,
            mxe: 0,
            mye: 0,
            mdp: 0,
            mmc: 0,
            vbase: 0,
            irq_flag: 0,
            irq_mask: 0,
            clx_spr: 0,
            clx_bgr: 0,
            ec_color: 0,
            b0c_color: 0,
            b1c_color: 0,
            b2c_color: 0,
            b3c_color: 0,
            mm0_color: 0,
            mm1_color: 0,
            spr_color: [0; 8],
            matrix_line: [0; 40],
            color_line: [0; 40],
            chunky_pos: 0,
            line_start: 0,
            fore_mask_pos: 0,
            fore_mask_buf: [0; FORE_MASK_LEN],
            raster_x: 0,
            raster_y: 0,
            irq_raster: 0,
            dy_start: ROW24_YSTART,
            dy_stop: ROW24_YSTOP,
            rc: 0,
            vc: 0,
            vc_base: 0,
            x_scroll: 0,
            y_scroll: 0,
            cia_vabase: 0,
            cycle: 1,
            display_idx: 0,
            ml_index: 0,
            mc: [0; 8],
            mc_base: [0; 8],
            spr_exp_y: 0,
            spr_dma_on: 0,
            spr_disp_on: 0,
            spr_draw: 0,
            spr_ptr: [0; 8],
            spr_data: [[0; 4]; 8],
            spr_draw_data: [[0; 4]; 8],
            spr_coll_buf: [0; DISPLAY_X],
            display_state: false,
            border_on: false,
            ud_border_on: false,
            bad_lines_enabled: false,
            is_bad_line: false,
            draw_this_line: false,
            vblanking: false,
            border_on_sample: [false; 5],
            border_color_sample: [0; DISPLAY_X / 8],
            matrix_base: 0,
            char_base: 0,
            bitmap_base: 0,
            ref_cnt: 0,
            gfx_data: 0,
            char_data: 0,
            color_data: 0,
            last_char_data: 0,
            first_ba_cycle: 0,
        }
    }

    pub fn reset(&mut self) {
        self.mx = [0; 8];
        self.my = [0; 8];
        self.mx8 = 0;
        self.ctrl1 = 0;
        self.ctrl2 = 0;
        self.me = 0;
        self.mxe = 0;
        self.mye = 0;
        self.mdp = 0;
        self.mmc = 0;
        self.vbase = 0;
        self.irq_flag = 0;
        self.irq_mask = 0;
        self.clx_spr = 0;
        self.clx_bgr = 0;
        self.cia_vabase = 0;
        self.ec_color = 0;
        self.b0c_color = 0;
        self.b1c_color = 0;
        self.b2c_color = 0;
        self.b3c_color = 0;
        self.mm0_color = 0;
        self.mm1_color = 0;
        self.spr_color = [0; 8];
        self.matrix_base = 0;
        self.char_base = 0;
        self.bitmap_base = 0;
        self.raster_y = TOTAL_RASTERS - 1;
        self.rc = 7;
        self.irq_raster = 0;
        self.vc = 0;
        self.vc_base = 0;
        self.x_scroll = 0;
        self.y_scroll = 0;
        self.dy_start = ROW24_YSTART;
        self.dy_stop = ROW24_YSTOP;
        self.ml_index = 0;
        self.cycle = 1;
        self.display_idx = 0;
        self.display_state = false;
        self.border_on = false;
        self.ud_border_on = false;
        self.vblanking = false;
        self.bad_lines_enabled = false;
        self.is_bad_line = false;
        self.draw_this_line = false;
        self.raster_x = 0;
        self.spr_exp_y = 0;
        self.spr_dma_on = 0;
        self.spr_disp_on = 0;
        self.spr_draw = 0;
        self.mc = [63; 8];
        self.mc_base = [0; 8];
        self.spr_ptr = [0; 8];
        self.spr_data = [[0; 4]; 8];
        self.spr_draw_data = [[0; 4]; 8];
        self.spr_coll_buf = [0; DISPLAY_X];
        self.fore_mask_buf = [0; FORE_MASK_LEN];
        self.border_on_sample = [false; 5];
        self.border_color_sample = [0; DISPLAY_X / 8];
        self.matrix_line = [0; 40];
        self.color_line = [0; 40];
        self.chunky_pos = 0;
        self.line_start = 0;
        self.fore_mask_pos = 0;
        self.ref_cnt = 0;
        self.gfx_data = 0;
        self.char_data = 0;
        self.color_data = 0;
        self.last_char_data = 0;
        self.first_ba_cycle = 0;
        self.ba_line.borrow_mut().set_active(true);
        self.irq_line.borrow_mut().reset();
    }

    // -- Introspection used by the driver and tests

    pub fn raster_y(&self) -> u16 {
        self.raster_y
    }

    pub fn current_cycle(&self) -> u16 {
        self.cycle
    }

    pub fn is_bad_line(&self) -> bool {
        self.is_bad_line
    }

    pub fn irq_flag(&self) -> u8 {
        self.irq_flag
    }

    pub fn spr_dma_on(&self) -> u8 {
        self.spr_dma_on
    }

    pub fn spr_disp_on(&self) -> u8 {
        self.spr_disp_on
    }

    pub fn sprite_mc(&self, index: usize) -> u16 {
        self.mc[index]
    }

    pub fn matrix_line(&self) -> &[u8; 40] {
        &self.matrix_line
    }

    // -- Register file

    pub fn write(&mut self, reg: u8, value: u8) {
        trace!(target: "vic::reg", "write {:02x} = {:02x}", reg, value);
        match reg {
            0x00 | 0x02 | 0x04 | 0x06 | 0x08 | 0x0a | 0x0c | 0x0e => {
                let n = (reg >> 1) as usize;
                self.mx[n] = (self.mx[n] & 0xff00) | u16::from(value);
            }
            0x01 | 0x03 | 0x05 | 0x07 | 0x09 | 0x0b | 0x0d | 0x0f => {
                self.my[(reg >> 1) as usize] = value;
            }
            0x10 => {
                self.mx8 = value;
                for i in 0..8 {
                    if self.mx8.get_bit(i) {
                        self.mx[i] |= 0x100;
                    } else {
                        self.mx[i] &= 0xff;
                    }
                }
            }
            0x11 => {
                // Control register 1
                self.ctrl1 = value;
                self.y_scroll = u16::from(value & 7);

                let new_irq_raster = (self.irq_raster & 0xff) | (u16::from(value & 0x80) << 1);
                if self.irq_raster != new_irq_raster && self.raster_y == new_irq_raster {
                    self.raster_irq();
                }
                self.irq_raster = new_irq_raster;

                if value & 8 != 0 {
                    self.dy_start = ROW25_YSTART;
                    self.dy_stop = ROW25_YSTOP;
                } else {
                    self.dy_start = ROW24_YSTART;
                    self.dy_stop = ROW24_YSTOP;
                }

                // In line $30, the DEN bit controls if Bad Lines can occur
                if self.raster_y == 0x30 && value & 0x10 != 0 {
                    self.bad_lines_enabled = true;
                }

                self.update_bad_line();
                self.display_idx = ((self.ctrl1 & 0x60) | (self.ctrl2 & 0x10)) >> 4;
            }
            0x12 => {
                // Raster counter compare
                let new_irq_raster = (self.irq_raster & 0xff00) | u16::from(value);
                if self.irq_raster != new_irq_raster && self.raster_y == new_irq_raster {
                    self.raster_irq();
                }
                self.irq_raster = new_irq_raster;
            }
            0x15 => self.me = value,
            0x16 => {
                // Control register 2
                self.ctrl2 = value;
                self.x_scroll = u16::from(value & 7);
                self.display_idx = ((self.ctrl1 & 0x60) | (self.ctrl2 & 0x10)) >> 4;
            }
            0x17 => {
                // Clearing an expansion bit sets the corresponding flip-flop
                self.mye = value;
                self.spr_exp_y |= !value;
            }
            0x18 => {
                self.vbase = value;
                self.matrix_base = u16::from(value & 0xf0) << 6;
                self.char_base = u16::from(value & 0x0e) << 10;
                self.bitmap_base = u16::from(value & 0x08) << 10;
            }
            0x19 => {
                // IRQ flags are acknowledged by writing a 1
                self.irq_flag &= !value & 0x0f;
                if self.irq_flag & self.irq_mask != 0 {
                    self.irq_flag |= 0x80;
                } else {
                    self.irq_line.borrow_mut().clear();
                }
            }
            0x1a => {
                self.irq_mask = value & 0x0f;
                if self.irq_flag & self.irq_mask != 0 {
                    self.irq_flag |= 0x80;
                    let source = self.pending_irq_source();
                    self.irq_line.borrow_mut().trigger(source);
                } else {
                    self.irq_flag &= 0x7f;
                    self.irq_line.borrow_mut().clear();
                }
            }
            0x1b => self.mdp = value,
            0x1c => self.mmc = value,
            0x1d => self.mxe = value,
            0x1e | 0x1f => {
                // Collision latches are read-only
            }
            0x20 => self.ec_color = value & 0x0f,
            0x21 => self.b0c_color = value & 0x0f,
            0x22 => self.b1c_color = value & 0x0f,
            0x23 => self.b2c_color = value & 0x0f,
            0x24 => self.b3c_color = value & 0x0f,
            0x25 => self.mm0_color = value & 0x0f,
            0x26 => self.mm1_color = value & 0x0f,
            0x27..=0x2e => self.spr_color[(reg - 0x27) as usize] = value & 0x0f,
            _ => {}
        }
    }

    /// CIA 2 port A changed VA14/15: move the 16K bank the chip sees.
    pub fn changed_va(&mut self, va14_15: u16) {
        self.cia_vabase = va14_15 << 14;
        let vbase = self.vbase;
        self.write(0x18, vbase);
    }

    fn update_bad_line(&mut self) {
        self.is_bad_line = self.raster_y >= FIRST_DMA_LINE
            && self.raster_y <= LAST_DMA_LINE
            && (self.raster_y & 7) == self.y_scroll
            && self.bad_lines_enabled;
    }

    fn raster_irq(&mut self) {
        self.irq_flag |= 0x01;
        if self.irq_mask & 0x01 != 0 {
            self.irq_flag |= 0x80;
            self.irq_line.borrow_mut().trigger(IrqSource::Raster);
        }
    }

    /// The condition behind a pending interrupt, for edge logging when a
    /// mask write lets it through.
    fn pending_irq_source(&self) -> IrqSource {
        if self.irq_flag & 0x01 != 0 {
            IrqSource::Raster
        } else if self.irq_flag & 0x02 != 0 {
            IrqSource::SpriteBackground
        } else {
            IrqSource::SpriteSprite
        }
    }

    // -- Memory accesses

    fn read_vic_byte(&self, adr: u16) -> u8 {
        let va = adr | self.cia_vabase;
        if va & 0x7000 == 0x1000 {
            self.char_rom.borrow().read(va & 0x0fff)
        } else {
            self.ram.borrow().read(va)
        }
    }

    fn set_ba_low(&mut self) {
        if self.ba_line.borrow().is_high() {
            self.first_ba_cycle = self.clock.get();
            self.ba_line.borrow_mut().set_active(false);
        }
    }

    fn display_if_bad_line(&mut self) {
        if self.is_bad_line {
            self.display_state = true;
        }
    }

    fn fetch_if_bad_line(&mut self) {
        if self.is_bad_line {
            self.display_state = true;
            self.set_ba_low();
        }
    }

    fn rc_if_bad_line(&mut self) {
        if self.is_bad_line {
            self.display_state = true;
            self.rc = 0;
            self.set_ba_low();
        }
    }

    fn idle_access(&self) {
        let _ = self.read_vic_byte(0x3fff);
    }

    fn refresh_access(&mut self) {
        let _ = self.read_vic_byte(0x3f00 | u16::from(self.ref_cnt));
        self.ref_cnt = self.ref_cnt.wrapping_sub(1);
    }

    fn matrix_access(&mut self) {
        if self.ba_line.borrow().is_low() {
            // The CPU is released three cycles after BA goes low, matrix
            // accesses before that read $FF
            if self.clock.get().wrapping_sub(self.first_ba_cycle) < 3 {
                self.matrix_line[self.ml_index] = 0xff;
                self.color_line[self.ml_index] = 0xff;
            } else {
                let adr = (self.vc & 0x03ff) | self.matrix_base;
                self.matrix_line[self.ml_index] = self.read_vic_byte(adr);
                self.color_line[self.ml_index] = self.color_ram.borrow().read(adr & 0x03ff);
            }
        }
    }

    fn graphics_access(&mut self) {
        if self.display_state {
            let mut adr = if self.ctrl1 & 0x20 != 0 {
                // Bitmap
                ((self.vc & 0x03ff) << 3) | self.bitmap_base | self.rc
            } else {
                // Text
                (u16::from(self.matrix_line[self.ml_index]) << 3) | self.char_base | self.rc
            };
            if self.ctrl1 & 0x40 != 0 {
                // ECM forces address lines 9 and 10 low
                adr &= 0xf9ff;
            }
            self.gfx_data = self.read_vic_byte(adr);
            self.char_data = self.matrix_line[self.ml_index];
            self.color_data = self.color_line[self.ml_index];
            self.ml_index += 1;
            self.vc += 1;
        } else {
            // Display is off
            self.gfx_data = self.read_vic_byte(if self.ctrl1 & 0x40 != 0 {
                0x39ff
            } else {
                0x3fff
            });
            self.char_data = 0;
            self.color_data = 0;
        }
    }

    fn check_sprite_dma(&mut self) {
        for i in 0..8 {
            let mask = 1 << i;
            if self.me & mask != 0 && (self.raster_y & 0xff) as u8 == self.my[i] {
                self.spr_dma_on |= mask;
                self.mc_base[i] = 0;
                if self.mye & mask != 0 {
                    self.spr_exp_y &= !mask;
                }
            }
        }
    }

    fn spr_ptr_access(&mut self, num: usize) {
        self.spr_ptr[num] =
            u16::from(self.read_vic_byte(self.matrix_base | 0x03f8 | num as u16)) << 6;
    }

    fn spr_data_access(&mut self, num: usize, byte_num: usize) {
        if self.spr_dma_on & (1 << num) != 0 {
            self.spr_data[num][byte_num] =
                self.read_vic_byte((self.mc[num] & 0x3f) | self.spr_ptr[num]);
            self.mc[num] += 1;
        } else if byte_num == 1 {
            self.idle_access();
        }
    }

    /// Sample the border color and advance the output position.
    fn sample_border(&mut self) {
        if self.draw_this_line {
            if self.border_on {
                self.border_color_sample[(self.cycle - 13) as usize] = self.ec_color;
            }
            self.chunky_pos += 8;
            self.fore_mask_pos += 1;
        }
    }

    // -- Pixel generation

    fn draw_background(&mut self) {
        if !self.draw_this_line {
            return;
        }
        let color = match self.display_idx {
            // Standard text, multicolor text, multicolor bitmap
            0 | 1 | 3 => self.b0c_color,
            // Standard bitmap
            2 => self.last_char_data & 0x0f,
            // ECM text
            4 => match self.last_char_data & 0xc0 {
                0x00 => self.b0c_color,
                0x40 => self.b1c_color,
                0x80 => self.b2c_color,
                _ => self.b3c_color,
            },
            _ => 0,
        };
        self.frame_buffer.borrow_mut().write_8(self.chunky_pos, color);
    }

    fn draw_graphics(&mut self) {
        if !self.draw_this_line {
            return;
        }
        if self.ud_border_on {
            self.draw_background();
            return;
        }
        match self.display_idx {
            0 => {
                // Standard text
                let colors = [self.b0c_color, self.color_data & 0x0f];
                self.emit_std(colors);
            }
            1 => {
                // Multicolor text
                if self.color_data.get_bit(3) {
                    let colors = [
                        self.b0c_color,
                        self.b1c_color,
                        self.b2c_color,
                        self.color_data & 7,
                    ];
                    self.emit_multi(colors);
                } else {
                    let colors = [self.b0c_color, self.color_data & 0x0f];
                    self.emit_std(colors);
                }
            }
            2 => {
                // Standard bitmap
                let colors = [self.char_data & 0x0f, self.char_data >> 4];
                self.emit_std(colors);
            }
            3 => {
                // Multicolor bitmap
                let colors = [
                    self.b0c_color,
                    self.char_data >> 4,
                    self.char_data & 0x0f,
                    self.color_data & 0x0f,
                ];
                self.emit_multi(colors);
            }
            4 => {
                // ECM text
                let background = match self.char_data & 0xc0 {
                    0x00 => self.b0c_color,
                    0x40 => self.b1c_color,
                    0x80 => self.b2c_color,
                    _ => self.b3c_color,
                };
                let colors = [background, self.color_data & 0x0f];
                self.emit_std(colors);
            }
            5 => {
                // Invalid multicolor text: black output, mask still forms
                self.frame_buffer
                    .borrow_mut()
                    .write_8(self.chunky_pos + self.x_scroll as usize, 0);
                if self.color_data.get_bit(3) {
                    self.set_fore_mask_multi();
                } else {
                    self.set_fore_mask_std();
                }
            }
            6 => {
                // Invalid standard bitmap
                self.frame_buffer
                    .borrow_mut()
                    .write_8(self.chunky_pos + self.x_scroll as usize, 0);
                self.set_fore_mask_std();
            }
            _ => {
                // Invalid multicolor bitmap
                self.frame_buffer
                    .borrow_mut()
                    .write_8(self.chunky_pos + self.x_scroll as usize, 0);
                self.set_fore_mask_multi();
            }
        }
    }

    fn set_fore_mask_std(&mut self) {
        let gfx = self.gfx_data;
        let shift = self.x_scroll as u32;
        self.fore_mask_buf[self.fore_mask_pos] |= gfx >> shift;
        self.fore_mask_buf[self.fore_mask_pos + 1] |= (u16::from(gfx) << (7 - shift)) as u8;
    }

    fn set_fore_mask_multi(&mut self) {
        let gfx = (self.gfx_data & 0xaa) | (self.gfx_data & 0xaa) >> 1;
        let shift = self.x_scroll as u32;
        self.fore_mask_buf[self.fore_mask_pos] |= gfx >> shift;
        self.fore_mask_buf[self.fore_mask_pos + 1] |= (u16::from(gfx) << (8 - shift)) as u8;
    }

    /// 8 pixels, 1 bit each, two-entry palette.
    fn emit_std(&mut self, colors: [u8; 2]) {
        self.set_fore_mask_std();
        let base = self.chunky_pos + self.x_scroll as usize;
        let mut fb = self.frame_buffer.borrow_mut();
        let mut data = self.gfx_data;
        for i in (0..8).rev() {
            fb.write(base + i, colors[(data & 1) as usize]);
            data >>= 1;
        }
    }

    /// 4 double-wide pixels, 2 bits each, four-entry palette.
    fn emit_multi(&mut self, colors: [u8; 4]) {
        self.set_fore_mask_multi();
        let base = self.chunky_pos + self.x_scroll as usize;
        let mut fb = self.frame_buffer.borrow_mut();
        let mut data = self.gfx_data;
        for i in (0..4).rev() {
            let color = colors[(data & 3) as usize];
            fb.write(base + i * 2, color);
            fb.write(base + i * 2 + 1, color);
            data >>= 2;
        }
    }

    fn draw_sprites(&mut self) {
        let mut spr_coll: u8 = 0;
        let mut gfx_coll: u8 = 0;

        self.spr_coll_buf = [0; DISPLAY_X];
        let mut fb = self.frame_buffer.borrow_mut();

        for snum in 0..8 {
            let sbit = 1u8 << snum;
            // Sprites that do not completely fit the chunky line are dropped
            if self.spr_draw & sbit == 0 || self.mx[snum] > (DISPLAY_X - 32) as u16 {
                continue;
            }
            let p0 = self.line_start + self.mx[snum] as usize + 8;
            let q0 = self.mx[snum] as usize + 8;
            let color = self.spr_color[snum];

            let d = &self.spr_draw_data[snum];
            let sdata = u32::from(d[0]) << 24 | u32::from(d[1]) << 16 | u32::from(d[2]) << 8;

            let spr_mask_pos = self.mx[snum] as usize + 8;
            let mp = spr_mask_pos / 8;
            let sshift = (spr_mask_pos & 7) as u32;
            let fmb = &self.fore_mask_buf;
            let fore_mask = ((u32::from(fmb[mp]) << 24
                | u32::from(fmb[mp + 1]) << 16
                | u32::from(fmb[mp + 2]) << 8
                | u32::from(fmb[mp + 3]))
                << sshift)
                | (u32::from(fmb[mp + 4]) >> (8 - sshift));

            if self.mxe & sbit != 0 {
                // X-expanded
                if self.mx[snum] > (DISPLAY_X - 56) as u16 {
                    continue;
                }
                let fore_mask_r = ((u32::from(fmb[mp + 4]) << 24
                    | u32::from(fmb[mp + 5]) << 16
                    | u32::from(fmb[mp + 6]) << 8
                    | u32::from(fmb[mp + 7]))
                    << sshift)
                    | (u32::from(fmb[mp + 8]) >> (8 - sshift));

                if self.mmc & sbit != 0 {
                    // Multicolor mode
                    let sdata_l = u32::from(MULTI_EXP_TABLE[(sdata >> 24 & 0xff) as usize]) << 16
                        | u32::from(MULTI_EXP_TABLE[(sdata >> 16 & 0xff) as usize]);
                    let sdata_r = u32::from(MULTI_EXP_TABLE[(sdata >> 8 & 0xff) as usize]) << 16;

                    // Convert sprite chunky pixels to bitplanes
                    let mut plane0_l = (sdata_l & 0x5555_5555) | (sdata_l & 0x5555_5555) << 1;
                    let mut plane1_l = (sdata_l & 0xaaaa_aaaa) | (sdata_l & 0xaaaa_aaaa) >> 1;
                    let mut plane0_r = (sdata_r & 0x5555_5555) | (sdata_r & 0x5555_5555) << 1;
                    let mut plane1_r = (sdata_r & 0xaaaa_aaaa) | (sdata_r & 0xaaaa_aaaa) >> 1;

                    if (fore_mask & (plane0_l | plane1_l)) != 0
                        || (fore_mask_r & (plane0_r | plane1_r)) != 0
                    {
                        gfx_coll |= sbit;
                        if self.mdp & sbit != 0 {
                            // Sprite is behind the foreground
                            plane0_l &= !fore_mask;
                            plane1_l &= !fore_mask;
                            plane0_r &= !fore_mask_r;
                            plane1_r &= !fore_mask_r;
                        }
                    }

                    for i in 0..48 {
                        let (plane0, plane1) = if i < 32 {
                            (plane0_l, plane1_l)
                        } else {
                            (plane0_r, plane1_r)
                        };
                        let col = if plane1 & 0x8000_0000 != 0 {
                            if plane0 & 0x8000_0000 != 0 {
                                Some(self.mm1_color)
                            } else {
                                Some(color)
                            }
                        } else if plane0 & 0x8000_0000 != 0 {
                            Some(self.mm0_color)
                        } else {
                            None
                        };
                        if i < 32 {
                            plane0_l <<= 1;
                            plane1_l <<= 1;
                        } else {
                            plane0_r <<= 1;
                            plane1_r <<= 1;
                        }
                        if let Some(col) = col {
                            if self.spr_coll_buf[q0 + i] != 0 {
                                spr_coll |= self.spr_coll_buf[q0 + i] | sbit;
                            } else {
                                fb.write(p0 + i, col);
                                self.spr_coll_buf[q0 + i] = sbit;
                            }
                        }
                    }
                } else {
                    // Standard mode
                    let mut sdata_l = u32::from(EXP_TABLE[(sdata >> 24 & 0xff) as usize]) << 16
                        | u32::from(EXP_TABLE[(sdata >> 16 & 0xff) as usize]);
                    let mut sdata_r = u32::from(EXP_TABLE[(sdata >> 8 & 0xff) as usize]) << 16;

                    if (fore_mask & sdata_l) != 0 || (fore_mask_r & sdata_r) != 0 {
                        gfx_coll |= sbit;
                        if self.mdp & sbit != 0 {
                            sdata_l &= !fore_mask;
                            sdata_r &= !fore_mask_r;
                        }
                    }

                    for i in 0..48 {
                        let pixel = if i < 32 {
                            let pixel = sdata_l & 0x8000_0000 != 0;
                            sdata_l <<= 1;
                            pixel
                        } else {
                            let pixel = sdata_r & 0x8000_0000 != 0;
                            sdata_r <<= 1;
                            pixel
                        };
                        if pixel {
                            if self.spr_coll_buf[q0 + i] != 0 {
                                spr_coll |= self.spr_coll_buf[q0 + i] | sbit;
                            } else {
                                fb.write(p0 + i, color);
                                self.spr_coll_buf[q0 + i] = sbit;
                            }
                        }
                    }
                }
            } else if self.mmc & sbit != 0 {
                // Unexpanded multicolor
                let mut plane0 = (sdata & 0x5555_5555) | (sdata & 0x5555_5555) << 1;
                let mut plane1 = (sdata & 0xaaaa_aaaa) | (sdata & 0xaaaa_aaaa) >> 1;

                if fore_mask & (plane0 | plane1) != 0 {
                    gfx_coll |= sbit;
                    if self.mdp & sbit != 0 {
                        plane0 &= !fore_mask;
                        plane1 &= !fore_mask;
                    }
                }

                for i in 0..24 {
                    let col = if plane1 & 0x8000_0000 != 0 {
                        if plane0 & 0x8000_0000 != 0 {
                            Some(self.mm1_color)
                        } else {
                            Some(color)
                        }
                    } else if plane0 & 0x8000_0000 != 0 {
                        Some(self.mm0_color)
                    } else {
                        None
                    };
                    plane0 <<= 1;
                    plane1 <<= 1;
                    if let Some(col) = col {
                        if self.spr_coll_buf[q0 + i] != 0 {
                            spr_coll |= self.spr_coll_buf[q0 + i] | sbit;
                        } else {
                            fb.write(p0 + i, col);
                            self.spr_coll_buf[q0 + i] = sbit;
                        }
                    }
                }
            } else {
                // Unexpanded standard
                let mut sdata = sdata;
                if fore_mask & sdata != 0 {
                    gfx_coll |= sbit;
                    if self.mdp & sbit != 0 {
                        sdata &= !fore_mask;
                    }
                }

                for i in 0..24 {
                    if sdata & 0x8000_0000 != 0 {
                        if self.spr_coll_buf[q0 + i] != 0 {
                            spr_coll |= self.spr_coll_buf[q0 + i] | sbit;
                        } else {
                            fb.write(p0 + i, color);
                            self.spr_coll_buf[q0 + i] = sbit;
                        }
                    }
                    sdata <<= 1;
                }
            }
        }
        drop(fb);

        if SPRITE_COLLISIONS {
            if self.clx_spr != 0 {
                self.clx_spr |= spr_coll;
            } else {
                self.clx_spr |= spr_coll;
                if self.clx_spr != 0 {
                    self.irq_flag |= 0x04;
                    if self.irq_mask & 0x04 != 0 {
                        self.irq_flag |= 0x80;
                        self.irq_line.borrow_mut().trigger(IrqSource::SpriteSprite);
                    }
                }
            }
            if self.clx_bgr != 0 {
                self.clx_bgr |= gfx_coll;
            } else {
                self.clx_bgr |= gfx_coll;
                if self.clx_bgr != 0 {
                    self.irq_flag |= 0x02;
                    if self.irq_mask & 0x02 != 0 {
                        self.irq_flag |= 0x80;
                        self.irq_line
                            .borrow_mut()
                            .trigger(IrqSource::SpriteBackground);
                    }
                }
            }
        }
    }

    /// Shared border comparison for the left screen edge (cycles 17/18).
    fn update_border_left(&mut self) {
        if self.raster_y == self.dy_stop {
            self.ud_border_on = true;
        } else if self.ctrl1 & 0x10 != 0 {
            if self.raster_y == self.dy_start {
                self.border_on = false;
                self.ud_border_on = false;
            } else if !self.ud_border_on {
                self.border_on = false;
            }
        } else if !self.ud_border_on {
            self.border_on = false;
        }
    }

    /// Paint the border overlay from the per-cycle samples.
    fn overlay_border(&mut self) {
        let mut fb = self.frame_buffer.borrow_mut();
        if self.border_on_sample[0] {
            for i in 0..4 {
                fb.write_8(self.line_start + i * 8, self.border_color_sample[i]);
            }
        }
        if self.border_on_sample[1] {
            fb.write_8(self.line_start + 4 * 8, self.border_color_sample[4]);
        }
        if self.border_on_sample[2] {
            for i in 5..43 {
                fb.write_8(self.line_start + i * 8, self.border_color_sample[i]);
            }
        }
        if self.border_on_sample[3] {
            fb.write_8(self.line_start + 43 * 8, self.border_color_sample[43]);
        }
        if self.border_on_sample[4] {
            for i in 44..DISPLAY_X / 8 {
                fb.write_8(self.line_start + i * 8, self.border_color_sample[i]);
            }
        }
    }

    /// Advance one raster cycle. Returns true on the last cycle of a line.
    pub fn clock(&mut self) -> bool {
        match self.cycle {
            // Fetch sprite pointer 3, increment raster counter, trigger
            // raster IRQ, test for Bad Line, release BA if sprites 3 and 4
            // are off, read data of sprite 3
            1 => {
                if self.raster_y == TOTAL_RASTERS - 1 {
                    // Trigger vblank in cycle 2
                    self.vblanking = true;
                } else {
                    self.raster_y += 1;
                    if self.raster_y == self.irq_raster {
                        self.raster_irq();
                    }
                    if self.raster_y == 0x30 {
                        self.bad_lines_enabled = self.ctrl1 & 0x10 != 0;
                    }
                    self.update_bad_line();
                    self.draw_this_line =
                        self.raster_y >= FIRST_DISP_LINE && self.raster_y <= LAST_DISP_LINE;
                }

                // First sample of border state
                self.border_on_sample[0] = self.border_on;

                self.spr_ptr_access(3);
                self.spr_data_access(3, 0);
                self.display_if_bad_line();
                if self.spr_dma_on & 0x18 == 0 {
                    self.ba_line.borrow_mut().set_active(true);
                }
            }
            // Set BA for sprite 5, read data of sprite 3
            2 => {
                if self.vblanking {
                    // Vertical blank, reset counters
                    self.raster_y = 0;
                    self.vc_base = 0;
                    self.ref_cnt = 0xff;
                    self.vblanking = false;
                    self.line_start = 0;
                    self.frame_buffer.borrow_mut().set_sync(true);
                    // Trigger raster IRQ if the compare value is line 0
                    if self.irq_raster == 0 {
                        self.raster_irq();
                    }
                }

                // Our output goes here
                self.chunky_pos = self.line_start;
                self.fore_mask_buf = [0; FORE_MASK_LEN];
                self.fore_mask_pos = 0;

                self.spr_data_access(3, 1);
                self.spr_data_access(3, 2);
                self.display_if_bad_line();
                if self.spr_dma_on & 0x20 != 0 {
                    self.set_ba_low();
                }
            }
            3 => {
                self.spr_ptr_access(4);
                self.spr_data_access(4, 0);
                self.display_if_bad_line();
                if self.spr_dma_on & 0x30 == 0 {
                    self.ba_line.borrow_mut().set_active(true);
                }
            }
            4 => {
                self.spr_data_access(4, 1);
                self.spr_data_access(4, 2);
                self.display_if_bad_line();
                if self.spr_dma_on & 0x40 != 0 {
                    self.set_ba_low();
                }
            }
            5 => {
                self.spr_ptr_access(5);
                self.spr_data_access(5, 0);
                self.display_if_bad_line();
                if self.spr_dma_on & 0x60 == 0 {
                    self.ba_line.borrow_mut().set_active(true);
                }
            }
            6 => {
                self.spr_data_access(5, 1);
                self.spr_data_access(5, 2);
                self.display_if_bad_line();
                if self.spr_dma_on & 0x80 != 0 {
                    self.set_ba_low();
                }
            }
            7 => {
                self.spr_ptr_access(6);
                self.spr_data_access(6, 0);
                self.display_if_bad_line();
                if self.spr_dma_on & 0xc0 == 0 {
                    self.ba_line.borrow_mut().set_active(true);
                }
            }
            8 => {
                self.spr_data_access(6, 1);
                self.spr_data_access(6, 2);
                self.display_if_bad_line();
            }
            9 => {
                self.spr_ptr_access(7);
                self.spr_data_access(7, 0);
                self.display_if_bad_line();
                if self.spr_dma_on & 0x80 == 0 {
                    self.ba_line.borrow_mut().set_active(true);
                }
            }
            10 => {
                self.spr_data_access(7, 1);
                self.spr_data_access(7, 2);
                self.display_if_bad_line();
            }
            // Refresh, release BA
            11 => {
                self.refresh_access();
                self.display_if_bad_line();
                self.ba_line.borrow_mut().set_active(true);
            }
            // Refresh, turn on matrix access if Bad Line
            12 => {
                self.refresh_access();
                self.fetch_if_bad_line();
            }
            // Graphics display starts here
            13 => {
                self.draw_background();
                self.sample_border();
                self.refresh_access();
                self.fetch_if_bad_line();
                self.raster_x = 0xfffc;
            }
            // VCBASE->VC, reset RC if Bad Line
            14 => {
                self.draw_background();
                self.sample_border();
                self.refresh_access();
                self.rc_if_bad_line();
                self.vc = self.vc_base;
            }
            // Last refresh, matrix access starts
            15 => {
                self.draw_background();
                self.sample_border();
                self.refresh_access();
                self.fetch_if_bad_line();
                for i in 0..8 {
                    if self.spr_exp_y & (1 << i) != 0 {
                        self.mc_base[i] += 2;
                    }
                }
                self.ml_index = 0;
                self.matrix_access();
            }
            // Graphics access starts, check if sprite DMA can be turned off
            16 => {
                self.draw_background();
                self.sample_border();
                self.graphics_access();
                self.fetch_if_bad_line();
                for i in 0..8 {
                    let mask = 1 << i;
                    if self.spr_exp_y & mask != 0 {
                        self.mc_base[i] += 1;
                    }
                    if self.mc_base[i] & 0x3f == 0x3f {
                        self.spr_dma_on &= !mask;
                    }
                }
                self.matrix_access();
            }
            // Turn off border in 40 column mode, display window starts here
            17 => {
                if self.ctrl2 & 8 != 0 {
                    self.update_border_left();
                }
                // Second sample of border state
                self.border_on_sample[1] = self.border_on;
                self.draw_background();
                self.draw_graphics();
                self.sample_border();
                self.graphics_access();
                self.fetch_if_bad_line();
                self.matrix_access();
            }
            // Turn off border in 38 column mode (cycle 18), then plain
            // graphics and matrix accesses
            18..=54 => {
                if self.cycle == 18 {
                    if self.ctrl2 & 8 == 0 {
                        self.update_border_left();
                    }
                    // Third sample of border state
                    self.border_on_sample[2] = self.border_on;
                }
                self.draw_graphics();
                self.sample_border();
                self.graphics_access();
                self.fetch_if_bad_line();
                self.matrix_access();
                self.last_char_data = self.char_data;
            }
            // Last graphics access, turn on sprite DMA if the Y coordinate
            // matches, handle sprite Y expansion, set BA for sprite 0
            55 => {
                self.draw_graphics();
                self.sample_border();
                self.graphics_access();
                self.display_if_bad_line();

                // Invert Y expansion flip-flop if bit in MYE is set
                for i in 0..8 {
                    let mask = 1 << i;
                    if self.mye & mask != 0 {
                        self.spr_exp_y ^= mask;
                    }
                }
                self.check_sprite_dma();

                if self.spr_dma_on & 0x01 != 0 {
                    self.set_ba_low();
                } else {
                    self.ba_line.borrow_mut().set_active(true);
                }
            }
            // Turn on border in 38 column mode, display window ends here
            56 => {
                if self.ctrl2 & 8 == 0 {
                    self.border_on = true;
                }
                // Fourth sample of border state
                self.border_on_sample[3] = self.border_on;
                self.draw_graphics();
                self.sample_border();
                self.idle_access();
                self.display_if_bad_line();
                self.check_sprite_dma();
                if self.spr_dma_on & 0x01 != 0 {
                    self.set_ba_low();
                }
            }
            // Turn on border in 40 column mode, set BA for sprite 1
            57 => {
                if self.ctrl2 & 8 != 0 {
                    self.border_on = true;
                }
                // Fifth sample of border state
                self.border_on_sample[4] = self.border_on;

                // Sample sprite display state and data for drawing
                self.spr_draw = self.spr_disp_on;
                if self.spr_draw != 0 {
                    self.spr_draw_data = self.spr_data;
                }
                // Turn off sprite display where DMA has ended
                for i in 0..8 {
                    let mask = 1 << i;
                    if self.spr_disp_on & mask != 0 && self.spr_dma_on & mask == 0 {
                        self.spr_disp_on &= !mask;
                    }
                }

                self.draw_background();
                self.sample_border();
                self.idle_access();
                self.display_if_bad_line();
                if self.spr_dma_on & 0x02 != 0 {
                    self.set_ba_low();
                }
            }
            // Fetch sprite pointer 0, MCBASE->MC, turn on sprite display if
            // necessary, leave display state if RC=7
            58 => {
                self.draw_background();
                self.sample_border();

                for i in 0..8 {
                    let mask = 1 << i;
                    self.mc[i] = self.mc_base[i];
                    if self.spr_dma_on & mask != 0 && (self.raster_y & 0xff) as u8 == self.my[i] {
                        self.spr_disp_on |= mask;
                    }
                }
                self.spr_ptr_access(0);
                self.spr_data_access(0, 0);

                if self.rc == 7 {
                    self.vc_base = self.vc;
                    self.display_state = false;
                }
                if self.is_bad_line || self.display_state {
                    self.display_state = true;
                    self.rc = (self.rc + 1) & 7;
                }
            }
            59 => {
                self.draw_background();
                self.sample_border();
                self.spr_data_access(0, 1);
                self.spr_data_access(0, 2);
                self.display_if_bad_line();
                if self.spr_dma_on & 0x04 != 0 {
                    self.set_ba_low();
                }
            }
            // Sprites and border overlay, graphics display ends here
            60 => {
                self.draw_background();
                self.sample_border();

                if self.draw_this_line {
                    if self.spr_draw != 0 && SPRITES_ON {
                        self.draw_sprites();
                    }
                    self.overlay_border();
                    let pitch = self.frame_buffer.borrow().get_pitch();
                    self.line_start += pitch;
                }

                self.spr_ptr_access(1);
                self.spr_data_access(1, 0);
                self.display_if_bad_line();
                if self.spr_dma_on & 0x06 == 0 {
                    self.ba_line.borrow_mut().set_active(true);
                }
            }
            61 => {
                self.spr_data_access(1, 1);
                self.spr_data_access(1, 2);
                self.display_if_bad_line();
                if self.spr_dma_on & 0x08 != 0 {
                    self.set_ba_low();
                }
            }
            62 => {
                self.spr_ptr_access(2);
                self.spr_data_access(2, 0);
                self.display_if_bad_line();
                if self.spr_dma_on & 0x0c == 0 {
                    self.ba_line.borrow_mut().set_active(true);
                }
            }
            // Last cycle: vertical border flip-flop, BA for sprite 4
            _ => {
                self.spr_data_access(2, 1);
                self.spr_data_access(2, 2);
                self.display_if_bad_line();

                if self.raster_y == self.dy_stop {
                    self.ud_border_on = true;
                } else if self.ctrl1 & 0x10 != 0 && self.raster_y == self.dy_start {
                    self.ud_border_on = false;
                }

                if self.spr_dma_on & 0x10 != 0 {
                    self.set_ba_low();
                }

                self.raster_x = self.raster_x.wrapping_add(8);
                self.cycle = 1;
                return true;
            }
        }
        self.raster_x = self.raster_x.wrapping_add(8);
        self.cycle += 1;
        false
    }
}

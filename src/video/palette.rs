// This file is part of retrace64.
// Copyright (c) 2021-2023 retrace64 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

// Spec: https://www.pepto.de/projects/colorvic/

pub struct Palette;

impl Palette {
    pub fn default() -> [u32; 16] {
        [
            0x0000_00ff, // Black
            0xffff_ffff, // White
            0x8133_38ff, // Red
            0x75ce_c8ff, // Cyan
            0x8e3c_97ff, // Purple
            0x56ac_4dff, // Green
            0x2e2c_9bff, // Blue
            0xedf1_71ff, // Yellow
            0x8e50_29ff, // Orange
            0x5538_00ff, // Brown
            0xc46c_71ff, // LightRed
            0x4a4a_4aff, // DarkGray
            0x7b7b_7bff, // MediumGray
            0xa9ff_9fff, // LightGreen
            0x706d_ebff, // LightBlue
            0xb2b2_b2ff, // LightGray
        ]
    }
}

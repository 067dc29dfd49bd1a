// This file is part of retrace64.
// Copyright (c) 2021-2023 retrace64 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal conditions of the co-simulation. None of these are recoverable
/// in-process; they propagate to main which cleans up and exits.
#[derive(Debug, Error)]
pub enum Error {
    /// Reserved bits were set in a capture stream status byte.
    #[error("invalid status byte {status:#04x} in capture stream at cycle {cycle}")]
    TraceFormat { status: u8, cycle: u32 },

    /// The capture stream ended before the reset vector fetch was seen.
    #[error("capture stream ended before the reset vector fetch")]
    ResetNotFound,

    /// End of the capture stream. This is the normal termination condition
    /// once the main loop is running.
    #[error("end of capture stream")]
    TraceEof,

    /// The capture transport failed mid-stream.
    #[error("capture stream read failed: {0}")]
    TraceIo(#[from] io::Error),

    /// The emulated CPU drove a different address than the real machine.
    #[error(
        "trace desync at cycle {cycle}: expected address {expected:#06x}, observed {observed:#06x}"
    )]
    AddressDesync {
        cycle: u32,
        expected: u16,
        observed: u16,
    },

    /// The emulated CPU and the trace disagree on the R/W strobe.
    #[error("trace desync at cycle {cycle}: expected a {} cycle", if *write_expected { "write" } else { "read" })]
    StrobeDesync { cycle: u32, write_expected: bool },

    /// The emulated CPU wrote a different value than the real machine.
    #[error(
        "trace desync at cycle {cycle}: expected write of {expected:#04x} to {address:#06x}, observed {observed:#04x}"
    )]
    DataDesync {
        cycle: u32,
        address: u16,
        expected: u8,
        observed: u8,
    },

    /// A ROM image could not be read.
    #[error("failed to load ROM {}: {source}", path.display())]
    RomLoad {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A ROM image had the wrong size.
    #[error("ROM {} is {len} bytes, expected {expected}", path.display())]
    RomSize {
        path: PathBuf,
        len: usize,
        expected: usize,
    },

    /// The audio device could not be initialized by the embedding app.
    #[error("audio initialization failed: {0}")]
    AudioInit(String),

    /// The video presenter could not be initialized by the embedding app.
    #[error("video initialization failed: {0}")]
    VideoInit(String),
}

// This file is part of retrace64.
// Copyright (c) 2021-2023 retrace64 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Error;

// One refill pulls roughly 130 raster lines worth of bus cycles, the same
// granularity the capture DMA hands over.
const CHUNK_WORDS: usize = 16384;

/// Word-oriented view of a capture stream with lookahead. Each bus cycle is
/// two little-endian 16-bit words, `address` then `status|data`; the stream
/// itself is just a flat sequence of words.
pub struct TraceStream<R: Read> {
    reader: R,
    buffer: VecDeque<u16>,
    eof: bool,
}

impl<R: Read> TraceStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: VecDeque::new(),
            eof: false,
        }
    }

    /// Pull the next word off the stream.
    pub fn get(&mut self) -> Result<u16, Error> {
        self.fill_to(1)?;
        self.buffer.pop_front().ok_or(Error::TraceEof)
    }

    /// Look ahead `pos` words without consuming anything.
    pub fn peek(&mut self, pos: usize) -> Result<u16, Error> {
        self.fill_to(pos + 1)?;
        self.buffer.get(pos).copied().ok_or(Error::TraceEof)
    }

    fn fill_to(&mut self, wanted: usize) -> Result<(), Error> {
        while self.buffer.len() < wanted && !self.eof {
            let mut chunk = [0u8; CHUNK_WORDS * 2];
            let mut filled = 0;
            while filled < chunk.len() {
                match self.reader.read(&mut chunk[filled..]) {
                    Ok(0) => {
                        self.eof = true;
                        break;
                    }
                    Ok(n) => filled += n,
                    Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(err) => return Err(Error::TraceIo(err)),
                }
            }
            // A trailing odd byte cannot form a word
            for pair in chunk[..filled & !1].chunks_exact(2) {
                self.buffer.push_back(LittleEndian::read_u16(pair));
            }
        }
        Ok(())
    }
}

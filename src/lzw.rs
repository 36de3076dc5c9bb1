// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GIF flavored LZW: variable width codes packed LSB first, growing from
//! `data_size + 1` up to 12 bits.

use arrayvec::ArrayVec;

use std::io::Read;

use crate::blocks::SubBlocks;
use crate::{Error, Result, ToUsize};

const MAX_CODES: usize = 4096;
const MAX_STACK: usize = MAX_CODES + 1;

/// Pixel indices are 8-bit, so literal codes never need more than 8 bits.
pub(crate) const MAX_DATA_SIZE: u8 = 8;

/// Dictionary and pixel stack, reused across frames.
pub(crate) struct LzwDecoder {
    prefix: [u16; MAX_CODES],
    suffix: [u8; MAX_CODES],
    stack: ArrayVec<u8, MAX_STACK>,
}

impl LzwDecoder {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            prefix: [0; MAX_CODES],
            suffix: [0; MAX_CODES],
            stack: ArrayVec::new(),
        })
    }

    /// Decodes up to `pixel_count` indices from the sub-blocks into `emit`,
    /// returning how many were produced.
    ///
    /// An end code or the sub-block terminator may stop the stream early; the
    /// caller treats the missing pixels as index 0. Leaves any unread
    /// sub-blocks in `src`.
    pub fn decode<T: Read>(
        &mut self,
        data_size: u8,
        src: &mut SubBlocks<'_, T>,
        pixel_count: usize,
        mut emit: impl FnMut(u8),
    ) -> Result<usize> {
        if data_size == 0 || data_size > MAX_DATA_SIZE {
            return Err(Error::InvalidData("LZW minimum code size out of range"));
        }
        let clear = 1u16 << data_size;
        let end = clear + 1;
        let mut code_size = u32::from(data_size) + 1;
        let mut code_mask = (1u32 << code_size) - 1;
        let mut available = clear + 2;
        let mut old_code: Option<u16> = None;
        let mut first = 0u8;

        for code in 0..clear {
            let code = code.to_usize();
            self.prefix[code] = 0;
            // clear <= 256, so every literal fits
            self.suffix[code] = code as u8;
        }
        self.stack.clear();

        let mut datum = 0u32;
        let mut bits = 0u32;
        let mut produced = 0usize;

        while produced < pixel_count {
            while bits < code_size {
                match src.next_byte()? {
                    Some(byte) => {
                        datum |= u32::from(byte) << bits;
                        bits += 8;
                    },
                    None => return Ok(produced),
                }
            }
            let code = (datum & code_mask) as u16;
            datum >>= code_size;
            bits -= code_size;

            if code == clear {
                code_size = u32::from(data_size) + 1;
                code_mask = (1 << code_size) - 1;
                available = clear + 2;
                old_code = None;
                continue;
            }
            if code == end {
                break;
            }

            let Some(prev) = old_code else {
                if code >= available {
                    return Err(Error::InvalidData("LZW code refers to an undefined entry"));
                }
                first = self.suffix[code.to_usize()];
                emit(first);
                produced += 1;
                old_code = Some(code);
                continue;
            };
            if code > available {
                return Err(Error::InvalidData("LZW code out of range"));
            }

            let in_code = code;
            let mut code = code;
            if code == available {
                push(&mut self.stack, first)?;
                code = prev;
            }
            while code > end {
                let entry = code.to_usize();
                if self.prefix[entry] == code {
                    return Err(Error::InvalidData("self-referential LZW code"));
                }
                push(&mut self.stack, self.suffix[entry])?;
                code = self.prefix[entry];
            }
            first = self.suffix[code.to_usize()];
            push(&mut self.stack, first)?;

            if available.to_usize() < MAX_CODES {
                self.prefix[available.to_usize()] = prev;
                self.suffix[available.to_usize()] = first;
                available += 1;
                if u32::from(available) & code_mask == 0 && available.to_usize() < MAX_CODES {
                    code_size += 1;
                    code_mask += u32::from(available);
                }
            }
            old_code = Some(in_code);

            // the stack holds the string reversed
            while let Some(index) = self.stack.pop() {
                if produced < pixel_count {
                    emit(index);
                    produced += 1;
                }
            }
        }
        Ok(produced)
    }
}

fn push(stack: &mut ArrayVec<u8, MAX_STACK>, index: u8) -> Result<()> {
    stack.try_push(index).map_err(|_| Error::InvalidData("LZW pixel stack overflow"))
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block-level pieces of the GIF stream: tags, extensions, image descriptors
//! and the length-prefixed sub-block framing shared by all of them.

use byteorder::ReadBytesExt;
use log::debug;

use std::io::Read;

use crate::{Result, ToUsize};

pub(crate) const EXTENSION_INTRODUCER: u8 = 0x21;
pub(crate) const IMAGE_SEPARATOR: u8 = 0x2C;
pub(crate) const TRAILER: u8 = 0x3B;

pub(crate) const GRAPHIC_CONTROL_LABEL: u8 = 0xF9;
pub(crate) const APPLICATION_LABEL: u8 = 0xFF;

/// Application identifiers that carry a loop count sub-block.
const LOOPING_APPLICATIONS: [&[u8; 11]; 2] = [b"NETSCAPE2.0", b"ANIMEXTS1.0"];

const MAX_SUB_BLOCK_LEN: usize = 255;

/// Delays at or below 10 ms are reported as this value, which is what browsers
/// do for the many files that encode a 0 or 1 centisecond delay.
pub const MIN_FRAME_DELAY_MS: u32 = 100;

/// Delay of a frame that is not preceded by a graphic control extension.
pub(crate) const DEFAULT_FRAME_DELAY_MS: u32 = MIN_FRAME_DELAY_MS;

/// What happens to a frame's rectangle before the next frame is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposal {
    /// No disposal specified; treated like [`Disposal::Keep`].
    #[default]
    Unspecified,
    /// Leave the frame in place.
    Keep,
    /// Clear the frame's rectangle to the background (or transparent).
    RestoreBackground,
    /// Put back the canvas as it was before the frame was drawn.
    RestorePrevious,
}

impl Disposal {
    /// Bits 2..=4 of the graphic control packed byte. Reserved values 4-7
    /// behave as unspecified.
    fn from_packed(packed: u8) -> Self {
        match (packed >> 2) & 0x07 {
            1 => Self::Keep,
            2 => Self::RestoreBackground,
            3 => Self::RestorePrevious,
            _ => Self::Unspecified,
        }
    }
}

/// Graphic control extension values; they apply to the next image only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GraphicControl {
    pub disposal: Disposal,
    pub transparent_index: Option<u8>,
    pub delay_ms: u32,
}

impl Default for GraphicControl {
    fn default() -> Self {
        Self {
            disposal: Disposal::Unspecified,
            transparent_index: None,
            delay_ms: DEFAULT_FRAME_DELAY_MS,
        }
    }
}

impl GraphicControl {
    /// Reads the fixed 6 bytes that follow the `0xF9` label: block size,
    /// packed byte, delay, transparent index and terminator.
    pub(crate) fn read<T: Read>(src: &mut T) -> Result<Self> {
        let block_size = src.read_u8()?;
        if block_size != 4 {
            debug!("graphic control block size {block_size}, reading 4 bytes anyway");
        }
        let packed = src.read_u8()?;
        let delay = le_u16(src)?;
        let transparent = src.read_u8()?;
        let _terminator = src.read_u8()?;

        Ok(Self {
            disposal: Disposal::from_packed(packed),
            transparent_index: (packed & 0x01 != 0).then_some(transparent),
            delay_ms: delay_floor(delay),
        })
    }
}

fn delay_floor(centiseconds: u16) -> u32 {
    let ms = u32::from(centiseconds) * 10;
    if ms <= 10 {
        MIN_FRAME_DELAY_MS
    } else {
        ms
    }
}

/// Reads an application extension after its `0xFF` label, returning the loop
/// count if it is a looping extension. Any other application is skipped.
pub(crate) fn read_application_extension<T: Read>(src: &mut T) -> Result<Option<u16>> {
    let mut identifier = [0u8; MAX_SUB_BLOCK_LEN];
    let len = src.read_u8()?.to_usize();
    if len == 0 {
        return Ok(None);
    }
    src.read_exact(&mut identifier[..len])?;

    if !LOOPING_APPLICATIONS.iter().any(|app| identifier[..len] == app[..]) {
        debug!("skipping application extension {:?}", String::from_utf8_lossy(&identifier[..len]));
        skip_sub_blocks(src)?;
        return Ok(None);
    }

    let mut loop_count = None;
    let mut block = [0u8; MAX_SUB_BLOCK_LEN];
    loop {
        let len = src.read_u8()?.to_usize();
        if len == 0 {
            break;
        }
        src.read_exact(&mut block[..len])?;
        // sub-block id 1 is the loop count; id 2 (buffer size) is ignored
        if len >= 3 && block[0] == 1 {
            loop_count = Some(u16::from_le_bytes([block[1], block[2]]));
        }
    }
    Ok(loop_count)
}

/// Consumes sub-blocks up to and including the zero-length terminator.
pub(crate) fn skip_sub_blocks<T: Read>(src: &mut T) -> Result<()> {
    let mut scratch = [0u8; MAX_SUB_BLOCK_LEN];
    loop {
        let len = src.read_u8()?.to_usize();
        if len == 0 {
            return Ok(());
        }
        src.read_exact(&mut scratch[..len])?;
    }
}

/// Position, size and flags of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ImageDescriptor {
    pub left: u16,
    pub top: u16,
    pub width: u16,
    pub height: u16,
    pub packed: u8,
}

impl ImageDescriptor {
    /// Reads the 9 bytes after the `0x2C` separator.
    pub(crate) fn read<T: Read>(src: &mut T) -> Result<Self> {
        Ok(Self {
            left: le_u16(src)?,
            top: le_u16(src)?,
            width: le_u16(src)?,
            height: le_u16(src)?,
            packed: src.read_u8()?,
        })
    }

    pub fn has_local_table(&self) -> bool {
        self.packed & 0x80 != 0
    }

    pub fn is_interlaced(&self) -> bool {
        self.packed & 0x40 != 0
    }
}

/// Streams the bytes of a run of sub-blocks, stopping at the terminator.
pub(crate) struct SubBlocks<'a, T> {
    src: &'a mut T,
    block: [u8; MAX_SUB_BLOCK_LEN],
    len: usize,
    pos: usize,
    terminated: bool,
}

impl<'a, T: Read> SubBlocks<'a, T> {
    pub fn new(src: &'a mut T) -> Self {
        Self {
            src,
            block: [0; MAX_SUB_BLOCK_LEN],
            len: 0,
            pos: 0,
            terminated: false,
        }
    }

    /// The next data byte, or `None` once the terminator has been read.
    /// Running out of input before the terminator is an error.
    pub fn next_byte(&mut self) -> Result<Option<u8>> {
        while self.pos == self.len {
            if self.terminated {
                return Ok(None);
            }
            let len = self.src.read_u8()?.to_usize();
            if len == 0 {
                self.terminated = true;
                return Ok(None);
            }
            self.src.read_exact(&mut self.block[..len])?;
            self.len = len;
            self.pos = 0;
        }
        let byte = self.block[self.pos];
        self.pos += 1;
        Ok(Some(byte))
    }

    /// Skips whatever the consumer did not read, through the terminator.
    pub fn finish(self) -> Result<()> {
        if !self.terminated {
            skip_sub_blocks(self.src)?;
        }
        Ok(())
    }
}

pub(crate) fn le_u16<T: ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::LittleEndian>().map_err(From::from)
}

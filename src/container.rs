// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use arrayvec::ArrayVec;
use byteorder::ReadBytesExt;
use log::{debug, warn};
use rgb::RGBA8;

use std::io::{Cursor, Read};

use crate::blocks::le_u16;
use crate::{Error, Result, ToUsize};

/// Largest palette a GIF can carry.
pub const MAX_COLORS: usize = 256;

const SIGNATURE: &[u8; 3] = b"GIF";

pub(crate) const TRANSPARENT: RGBA8 = RGBA8 { r: 0, g: 0, b: 0, a: 0 };

/// A global or local palette. Entries are opaque; transparency is a property
/// of the frame, not the table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColorTable {
    colors: ArrayVec<RGBA8, MAX_COLORS>,
}

impl ColorTable {
    /// Read the `2 << (packed & 7)` RGB triples announced by a screen or
    /// image descriptor's packed byte.
    pub(crate) fn read<T: Read>(src: &mut T, packed: u8) -> Result<Self> {
        let entries = 2usize << (packed & 0x07);
        let mut rgb = [0u8; MAX_COLORS * 3];
        let rgb = &mut rgb[..entries * 3];
        src.read_exact(rgb)?;

        let colors = rgb
            .chunks_exact(3)
            .map(|c| RGBA8::new(c[0], c[1], c[2], 0xff))
            .collect();
        Ok(Self { colors })
    }

    /// Color for a pixel index, if the table has that many entries.
    pub fn get(&self, index: u8) -> Option<RGBA8> {
        self.colors.get(index.to_usize()).copied()
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    pub fn as_slice(&self) -> &[RGBA8] {
        &self.colors
    }
}

/// The header, logical screen descriptor and global color table of a GIF.
///
/// Parsed once; the frame decoder never mutates it. A container that failed to
/// parse is still a value: [`GifContainer::is_valid`] is the error channel, and
/// an invalid container decodes no frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GifContainer {
    version: [u8; 3],
    width: u16,
    height: u16,
    global_color_table: Option<ColorTable>,
    background_index: u8,
    pixel_aspect_ratio: u8,
    header_len: u64,
    valid: bool,
}

impl GifContainer {
    /// Parse the container, logging and recording the failure instead of
    /// returning it.
    pub fn parse(data: &[u8]) -> Self {
        match Self::try_parse(data) {
            Ok(container) => container,
            Err(err) => {
                warn!("invalid GIF header: {err}");
                Self::invalid()
            },
        }
    }

    /// Parse the container, returning why it is not a GIF.
    pub fn try_parse(data: &[u8]) -> Result<Self> {
        let mut src = Cursor::new(data);

        let mut signature = [0u8; 3];
        src.read_exact(&mut signature)?;
        if &signature != SIGNATURE {
            return Err(Error::InvalidData("missing GIF signature"));
        }
        // 87a and 89a are both accepted; the version is recorded, not checked
        let mut version = [0u8; 3];
        src.read_exact(&mut version)?;

        let width = le_u16(&mut src)?;
        let height = le_u16(&mut src)?;
        if width == 0 || height == 0 {
            return Err(Error::InvalidData("zero logical screen dimension"));
        }
        let packed = src.read_u8()?;
        let background_index = src.read_u8()?;
        let pixel_aspect_ratio = src.read_u8()?;

        let global_color_table = if packed & 0x80 != 0 {
            Some(ColorTable::read(&mut src, packed)?)
        } else {
            None
        };

        debug!(
            "GIF{} {}x{}, global table: {:?} entries, background {}",
            String::from_utf8_lossy(&version),
            width,
            height,
            global_color_table.as_ref().map(ColorTable::len),
            background_index
        );

        Ok(Self {
            version,
            width,
            height,
            global_color_table,
            background_index,
            pixel_aspect_ratio,
            header_len: src.position(),
            valid: true,
        })
    }

    fn invalid() -> Self {
        Self {
            version: [0; 3],
            width: 0,
            height: 0,
            global_color_table: None,
            background_index: 0,
            pixel_aspect_ratio: 0,
            header_len: 0,
            valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Logical screen width in pixels.
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Logical screen height in pixels.
    pub fn height(&self) -> u16 {
        self.height
    }

    /// The version bytes following the signature, e.g. `b"89a"`.
    pub fn version(&self) -> [u8; 3] {
        self.version
    }

    pub fn global_color_table(&self) -> Option<&ColorTable> {
        self.global_color_table.as_ref()
    }

    pub fn background_index(&self) -> u8 {
        self.background_index
    }

    /// The global table entry at [`Self::background_index`], or transparent
    /// black when the file has no global table or the index is outside it.
    pub fn background_color(&self) -> RGBA8 {
        self.global_color_table
            .as_ref()
            .and_then(|table| table.get(self.background_index))
            .unwrap_or(TRANSPARENT)
    }

    pub fn pixel_aspect_ratio(&self) -> u8 {
        self.pixel_aspect_ratio
    }

    /// Offset of the first block after the global color table.
    pub fn header_len(&self) -> u64 {
        self.header_len
    }
}

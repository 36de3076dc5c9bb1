// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use byteorder::ReadBytesExt;
use imgref::ImgRef;
use log::{debug, warn};
use rgb::RGBA8;

use std::borrow::Cow;
use std::io::{Cursor, Read};

use crate::blocks::{
    read_application_extension, skip_sub_blocks, Disposal, GraphicControl, ImageDescriptor, SubBlocks,
    APPLICATION_LABEL, EXTENSION_INTRODUCER, GRAPHIC_CONTROL_LABEL, IMAGE_SEPARATOR, TRAILER,
};
use crate::container::{ColorTable, GifContainer, TRANSPARENT};
use crate::lzw::LzwDecoder;
use crate::{DecodeConfig, Error, FailureKind, ResourceTracker, Result, ToUsize};

const BYTES_PER_PIXEL: u64 = 4;

/// One composited frame: the whole canvas after an image block was drawn.
///
/// Frames returned by [`GifDecoder::decode_next`] borrow the decoder's canvas;
/// use [`FrameRef::into_owned`] to keep one past the next call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRef<'a> {
    /// Row-major canvas pixels, `width * height` long.
    pub pixels: Cow<'a, [RGBA8]>,
    pub width: u32,
    pub height: u32,
    /// How long to show this frame, in milliseconds. Never below 20.
    pub delay_ms: u32,
    /// Position of the frame within its pass over the file.
    pub index: u32,
    /// Which repetition of the animation this frame belongs to, from 0.
    pub pass: u32,
}

impl FrameRef<'_> {
    /// The pixels as a 2D image.
    pub fn as_img(&self) -> ImgRef<'_, RGBA8> {
        ImgRef::new(&self.pixels[..], self.width as usize, self.height as usize)
    }

    /// Pixel at `(x, y)`, if inside the canvas.
    pub fn pixel(&self, x: u32, y: u32) -> Option<RGBA8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get(y as usize * self.width as usize + x as usize).copied()
    }

    /// Copy the pixels so the frame outlives the decoder.
    pub fn into_owned(self) -> Result<FrameRef<'static>> {
        let pixels = match self.pixels {
            Cow::Owned(pixels) => pixels,
            Cow::Borrowed(pixels) => {
                let mut owned = Vec::new();
                owned.try_reserve_exact(pixels.len())?;
                owned.extend_from_slice(pixels);
                owned
            },
        };
        Ok(FrameRef {
            pixels: Cow::Owned(pixels),
            width: self.width,
            height: self.height,
            delay_ms: self.delay_ms,
            index: self.index,
            pass: self.pass,
        })
    }
}

/// Where a [`GifDecoder`] is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// More frames may follow.
    Decoding,
    /// The last pass ended; [`GifDecoder::decode_next`] returns `None`.
    Done,
    /// Terminal failure; every further decode call fails.
    Failed(FailureKind),
}

/// Frame rectangle clipped to the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Rect {
    x: usize,
    y: usize,
    width: usize,
    height: usize,
}

impl Rect {
    /// An image that falls entirely outside the canvas clamps to an empty
    /// rectangle at the origin.
    fn clamp(descriptor: &ImageDescriptor, canvas_width: u16, canvas_height: u16) -> Self {
        let width = descriptor.width.min(canvas_width.saturating_sub(descriptor.left));
        let height = descriptor.height.min(canvas_height.saturating_sub(descriptor.top));
        if width == 0 || height == 0 {
            return Self::default();
        }
        Self {
            x: descriptor.left.to_usize(),
            y: descriptor.top.to_usize(),
            width: width.to_usize(),
            height: height.to_usize(),
        }
    }

    fn area(&self) -> usize {
        self.width * self.height
    }
}

/// Disposal facts about the most recently drawn frame.
#[derive(Debug, Clone, Copy)]
struct PreviousFrame {
    rect: Rect,
    disposal: Disposal,
    transparent: bool,
}

enum Step {
    Frame,
    EndOfStream,
}

/// Mutable state of one decode session.
pub(crate) struct FrameDecoderState {
    cursor: u64,
    canvas: Vec<RGBA8>,
    backup: Vec<RGBA8>,
    backup_valid: bool,
    raster: Vec<u8>,
    pending: GraphicControl,
    /// `None` until the first frame of a pass is drawn.
    previous: Option<PreviousFrame>,
    delay_ms: u32,
    frame_count: u32,
    loop_index: u32,
    loop_count: Option<u16>,
    lzw: Box<LzwDecoder>,
    tracker: ResourceTracker,
}

impl FrameDecoderState {
    fn new(container: &GifContainer, config: &DecodeConfig) -> Self {
        Self {
            cursor: container.header_len(),
            canvas: Vec::new(),
            backup: Vec::new(),
            backup_valid: false,
            raster: Vec::new(),
            pending: GraphicControl::default(),
            previous: None,
            delay_ms: 0,
            frame_count: 0,
            loop_index: 0,
            loop_count: None,
            lzw: LzwDecoder::new(),
            tracker: ResourceTracker::new(config),
        }
    }

    fn allocate_canvas(&mut self, container: &GifContainer) -> Result<()> {
        if !self.canvas.is_empty() {
            return Ok(());
        }
        self.tracker.validate_canvas(container.width(), container.height())?;
        let pixels = container.width().to_usize() * container.height().to_usize();
        self.tracker.reserve(pixels as u64 * BYTES_PER_PIXEL)?;
        self.canvas.try_reserve_exact(pixels)?;
        self.canvas.resize(pixels, TRANSPARENT);
        Ok(())
    }

    fn allocate_backup(&mut self) -> Result<()> {
        if self.backup.len() == self.canvas.len() {
            return Ok(());
        }
        self.tracker.reserve(self.canvas.len() as u64 * BYTES_PER_PIXEL)?;
        self.backup.try_reserve_exact(self.canvas.len())?;
        self.backup.resize(self.canvas.len(), TRANSPARENT);
        Ok(())
    }

    /// Back to the first block, with a blank canvas and no disposal history.
    fn rewind(&mut self, container: &GifContainer) {
        self.cursor = container.header_len();
        self.canvas.fill(TRANSPARENT);
        self.backup_valid = false;
        self.pending = GraphicControl::default();
        self.previous = None;
        self.frame_count = 0;
    }

    /// Walks blocks until an image has been drawn or the stream ends.
    fn scan<T: Read>(&mut self, src: &mut T, container: &GifContainer) -> Result<Step> {
        loop {
            // a stream cut off before its trailer is corrupt, not finished
            match src.read_u8()? {
                EXTENSION_INTRODUCER => self.read_extension(src)?,
                IMAGE_SEPARATOR => {
                    self.decode_image(src, container)?;
                    return Ok(Step::Frame);
                },
                TRAILER => return Ok(Step::EndOfStream),
                0x00 => {},
                other => debug!("skipping unknown block tag {other:#04x}"),
            }
        }
    }

    fn read_extension<T: Read>(&mut self, src: &mut T) -> Result<()> {
        match src.read_u8()? {
            GRAPHIC_CONTROL_LABEL => self.pending = GraphicControl::read(src)?,
            APPLICATION_LABEL => {
                if let Some(loop_count) = read_application_extension(src)? {
                    debug!("loop count {loop_count}");
                    self.loop_count = Some(loop_count);
                }
            },
            label => {
                debug!("skipping extension {label:#04x}");
                skip_sub_blocks(src)?;
            },
        }
        Ok(())
    }

    /// Decodes one image after its separator and draws it onto the canvas.
    ///
    /// Everything that can fail happens before the canvas is touched: pixel
    /// indices land in `raster` first, and disposal plus compositing run only
    /// once the whole image decoded.
    fn decode_image<T: Read>(&mut self, src: &mut T, container: &GifContainer) -> Result<()> {
        self.tracker.validate_frame_count(self.frame_count + 1)?;

        let descriptor = ImageDescriptor::read(src)?;
        let local_table = if descriptor.has_local_table() {
            Some(ColorTable::read(src, descriptor.packed)?)
        } else {
            None
        };
        let rect = Rect::clamp(&descriptor, container.width(), container.height());

        let raster_bytes = rect.area() as u64;
        self.tracker.reserve(raster_bytes)?;
        let decoded = self.decode_raster(src, &descriptor, rect);
        self.tracker.release(raster_bytes);
        decoded?;

        if self.pending.disposal == Disposal::RestorePrevious {
            self.allocate_backup()?;
        }

        self.dispose_previous(container);
        if self.pending.disposal == Disposal::RestorePrevious {
            self.backup.copy_from_slice(&self.canvas);
            self.backup_valid = true;
        }
        let table = local_table.as_ref().or(container.global_color_table());
        self.composite(container.width().to_usize(), rect, table);

        self.previous = Some(PreviousFrame {
            rect,
            disposal: self.pending.disposal,
            transparent: self.pending.transparent_index.is_some(),
        });
        self.delay_ms = self.pending.delay_ms;
        self.pending = GraphicControl::default();
        self.frame_count += 1;
        debug!(
            "frame {} ({}x{} at {},{}), {} ms",
            self.frame_count - 1,
            descriptor.width,
            descriptor.height,
            descriptor.left,
            descriptor.top,
            self.delay_ms
        );
        Ok(())
    }

    /// Fills `raster` with the clipped image's indices; pixels outside the
    /// canvas are decoded and dropped, pixels missing from the stream are 0.
    fn decode_raster<T: Read>(&mut self, src: &mut T, descriptor: &ImageDescriptor, rect: Rect) -> Result<()> {
        let data_size = src.read_u8()?;

        self.raster.clear();
        self.raster.try_reserve_exact(rect.area())?;
        self.raster.resize(rect.area(), 0);

        let mut sink = RasterSink::new(&mut self.raster, rect, descriptor);
        let pixel_count = descriptor.width.to_usize() * descriptor.height.to_usize();
        let mut sub_blocks = SubBlocks::new(src);
        let produced = self.lzw.decode(data_size, &mut sub_blocks, pixel_count, |index| sink.put(index))?;
        sub_blocks.finish()?;

        if produced < pixel_count {
            debug!("image data ended after {produced} of {pixel_count} pixels");
        }
        Ok(())
    }

    fn dispose_previous(&mut self, container: &GifContainer) {
        let Some(previous) = self.previous else {
            return;
        };
        match previous.disposal {
            Disposal::Unspecified | Disposal::Keep => {},
            Disposal::RestorePrevious => {
                if self.backup_valid {
                    self.canvas.copy_from_slice(&self.backup);
                }
            },
            Disposal::RestoreBackground => {
                let fill = if previous.transparent {
                    TRANSPARENT
                } else {
                    container.background_color()
                };
                let canvas_width = container.width().to_usize();
                let rect = previous.rect;
                for row in rect.y..rect.y + rect.height {
                    let start = row * canvas_width + rect.x;
                    self.canvas[start..start + rect.width].fill(fill);
                }
            },
        }
        self.backup_valid = false;
    }

    fn composite(&mut self, canvas_width: usize, rect: Rect, table: Option<&ColorTable>) {
        let Some(table) = table else {
            warn!("image has neither a local nor a global color table; nothing drawn");
            return;
        };
        if rect.width == 0 {
            return;
        }
        let transparent = self.pending.transparent_index;
        let mut out_of_palette = 0usize;

        for (row, indices) in self.raster.chunks_exact(rect.width).enumerate() {
            let start = (rect.y + row) * canvas_width + rect.x;
            let pixels = &mut self.canvas[start..start + rect.width];
            for (pixel, &index) in pixels.iter_mut().zip(indices) {
                if Some(index) == transparent {
                    continue;
                }
                match table.get(index) {
                    Some(color) => *pixel = color,
                    None => out_of_palette += 1,
                }
            }
        }
        if out_of_palette > 0 {
            warn!("{out_of_palette} pixels reference colors past the end of a {}-entry table", table.len());
        }
    }
}

/// Places decoded indices into the clipped raster in stream order,
/// de-interlacing rows when needed.
struct RasterSink<'a> {
    raster: &'a mut [u8],
    rect: Rect,
    stride: usize,
    rows: usize,
    interlaced: bool,
    col: usize,
    src_row: usize,
    dest_row: usize,
}

impl<'a> RasterSink<'a> {
    fn new(raster: &'a mut [u8], rect: Rect, descriptor: &ImageDescriptor) -> Self {
        let rows = descriptor.height.to_usize();
        let interlaced = descriptor.is_interlaced();
        Self {
            raster,
            rect,
            stride: descriptor.width.to_usize(),
            rows,
            interlaced,
            col: 0,
            src_row: 0,
            dest_row: if interlaced { interlaced_row(0, rows) } else { 0 },
        }
    }

    fn put(&mut self, index: u8) {
        if self.col < self.rect.width && self.dest_row < self.rect.height {
            self.raster[self.dest_row * self.rect.width + self.col] = index;
        }
        self.col += 1;
        if self.col == self.stride {
            self.col = 0;
            self.src_row += 1;
            self.dest_row = if self.interlaced {
                interlaced_row(self.src_row, self.rows)
            } else {
                self.src_row
            };
        }
    }
}

/// Maps the n-th stored row of an interlaced image to its display row.
/// Rows past the end map to `height`.
fn interlaced_row(mut row: usize, height: usize) -> usize {
    for (start, step) in [(0, 8), (4, 8), (2, 4), (1, 2)] {
        let rows_in_pass = height.saturating_sub(start).div_ceil(step);
        if row < rows_in_pass {
            return start + row * step;
        }
        row -= rows_in_pass;
    }
    height
}

/// Pull-based decoder that yields one composited frame per call.
///
/// Frames keep coming for as many passes as the file's loop count (or
/// [`DecodeConfig::loop_count_override`]) asks for; with a loop count of 0
/// an animation never ends. Static images end after their single frame.
///
/// Any failure is terminal: [`Self::status`] reports it and every later
/// [`Self::decode_next`] returns [`Error::Poisoned`].
pub struct GifDecoder<'data> {
    raw: Cow<'data, [u8]>,
    container: GifContainer,
    config: DecodeConfig,
    state: FrameDecoderState,
    status: DecodeStatus,
}

impl<'data> GifDecoder<'data> {
    /// Decode a GIF borrowed from memory, with default limits.
    pub fn from_bytes(data: &'data [u8]) -> Self {
        Self::from_bytes_with_config(data, &DecodeConfig::default())
    }

    pub fn from_bytes_with_config(data: &'data [u8], config: &DecodeConfig) -> Self {
        let container = GifContainer::parse(data);
        Self::with_container(Cow::Borrowed(data), container, config)
    }

    pub(crate) fn with_container(raw: Cow<'data, [u8]>, container: GifContainer, config: &DecodeConfig) -> Self {
        let status = if container.is_valid() {
            DecodeStatus::Decoding
        } else {
            DecodeStatus::Failed(FailureKind::HeaderInvalid)
        };
        Self {
            state: FrameDecoderState::new(&container, config),
            raw,
            container,
            config: config.clone(),
            status,
        }
    }

    /// The container as parsed at construction.
    pub fn container(&self) -> &GifContainer {
        &self.container
    }

    pub fn is_valid(&self) -> bool {
        self.container.is_valid()
    }

    /// Intrinsic width, from the logical screen descriptor.
    pub fn width(&self) -> u16 {
        self.container.width()
    }

    /// Intrinsic height, from the logical screen descriptor.
    pub fn height(&self) -> u16 {
        self.container.height()
    }

    pub fn status(&self) -> DecodeStatus {
        self.status
    }

    /// Passes the animation plays for (0 = forever). Files without a looping
    /// extension play once. Only known after the extension was read, which
    /// encoders put before the first image.
    pub fn loop_count(&self) -> u16 {
        self.config.loop_count_override.or(self.state.loop_count).unwrap_or(1)
    }

    /// Zero-based index of the current pass.
    pub fn loop_index(&self) -> u32 {
        self.state.loop_index
    }

    /// Frames decoded so far in the current pass.
    pub fn frame_count(&self) -> u32 {
        self.state.frame_count
    }

    /// The canvas as left by the last successful frame. Empty before the
    /// first decode call.
    pub fn canvas(&self) -> &[RGBA8] {
        &self.state.canvas
    }

    /// Start over from the first frame of the first pass. A failed decoder
    /// stays failed.
    pub fn reset(&mut self) {
        if let DecodeStatus::Failed(_) = self.status {
            return;
        }
        self.state.rewind(&self.container);
        self.state.loop_index = 0;
        self.status = DecodeStatus::Decoding;
    }

    /// Decode up to and including the next image block and return the canvas.
    ///
    /// Returns `Ok(None)` once the animation is done.
    pub fn decode_next(&mut self) -> Result<Option<FrameRef<'_>>> {
        match self.status {
            DecodeStatus::Decoding => {},
            DecodeStatus::Done => return Ok(None),
            DecodeStatus::Failed(kind) => return Err(Error::Poisoned(kind)),
        }

        match self.advance() {
            Ok(true) => Ok(Some(self.current_frame())),
            Ok(false) => {
                self.status = DecodeStatus::Done;
                Ok(None)
            },
            Err(err) => {
                let kind = err.failure_kind().unwrap_or(FailureKind::StreamCorrupt);
                warn!("GIF decoding failed at byte {}: {err}", self.state.cursor);
                self.status = DecodeStatus::Failed(kind);
                Err(err)
            },
        }
    }

    fn advance(&mut self) -> Result<bool> {
        self.state.allocate_canvas(&self.container)?;
        loop {
            let mut src = Cursor::new(self.raw.as_ref());
            src.set_position(self.state.cursor);
            let step = self.state.scan(&mut src, &self.container);
            self.state.cursor = src.position();

            match (step?, self.state.frame_count) {
                (Step::Frame, _) => return Ok(true),
                (Step::EndOfStream, 0) => return Err(Error::NoFrames),
                (Step::EndOfStream, 1) => return Ok(false),
                (Step::EndOfStream, _) => {
                    let loop_count = u32::from(self.loop_count());
                    if loop_count != 0 && self.state.loop_index + 1 >= loop_count {
                        return Ok(false);
                    }
                    self.state.rewind(&self.container);
                    self.state.loop_index += 1;
                    debug!("starting pass {}", self.state.loop_index);
                },
            }
        }
    }

    fn current_frame(&self) -> FrameRef<'_> {
        FrameRef {
            pixels: Cow::Borrowed(&self.state.canvas),
            width: self.container.width().into(),
            height: self.container.height().into(),
            delay_ms: self.state.delay_ms,
            index: self.state.frame_count - 1,
            pass: self.state.loop_index,
        }
    }
}

impl GifDecoder<'static> {
    /// Decode a GIF that the decoder takes ownership of, with default limits.
    pub fn from_owned(data: Vec<u8>) -> Self {
        Self::from_owned_with_config(data, &DecodeConfig::default())
    }

    pub fn from_owned_with_config(data: Vec<u8>, config: &DecodeConfig) -> Self {
        let container = GifContainer::parse(&data);
        Self::with_container(Cow::Owned(data), container, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interlace_order() {
        let order: Vec<usize> = (0..8).map(|row| interlaced_row(row, 8)).collect();
        assert_eq!(order, [0, 4, 2, 6, 1, 3, 5, 7]);

        let order: Vec<usize> = (0..10).map(|row| interlaced_row(row, 10)).collect();
        assert_eq!(order, [0, 8, 4, 2, 6, 1, 3, 5, 7, 9]);

        // short images skip empty passes
        assert_eq!((0..3).map(|row| interlaced_row(row, 3)).collect::<Vec<_>>(), [0, 2, 1]);
        assert_eq!(interlaced_row(0, 1), 0);
        assert_eq!(interlaced_row(1, 1), 1);
    }

    #[test]
    fn interlace_mapping_is_a_permutation() {
        for height in 1..40 {
            let mut rows: Vec<usize> = (0..height).map(|row| interlaced_row(row, height)).collect();
            rows.sort_unstable();
            assert_eq!(rows, (0..height).collect::<Vec<_>>(), "height {height}");
        }
    }

    fn descriptor(left: u16, top: u16, width: u16, height: u16, packed: u8) -> ImageDescriptor {
        ImageDescriptor { left, top, width, height, packed }
    }

    #[test]
    fn clamp_to_canvas() {
        let rect = Rect::clamp(&descriptor(8, 0, 10000, 10, 0), 10, 10);
        assert_eq!(rect, Rect { x: 8, y: 0, width: 2, height: 10 });
        let rect = Rect::clamp(&descriptor(20, 3, 5, 5, 0), 10, 10);
        assert_eq!(rect, Rect::default());
        assert_eq!(rect.area(), 0);
        let rect = Rect::clamp(&descriptor(3, 3, 0, 5, 0), 10, 10);
        assert_eq!(rect, Rect::default());
    }

    #[test]
    fn sink_clips_wide_rows() {
        let desc = descriptor(0, 0, 4, 2, 0);
        let rect = Rect { x: 0, y: 0, width: 2, height: 2 };
        let mut raster = vec![0u8; 4];
        let mut sink = RasterSink::new(&mut raster, rect, &desc);
        for index in [1, 2, 9, 9, 3, 4, 9, 9, 9, 9] {
            sink.put(index);
        }
        assert_eq!(raster, [1, 2, 3, 4]);
    }

    #[test]
    fn sink_deinterlaces() {
        let desc = descriptor(0, 0, 1, 5, 0x40);
        let rect = Rect { x: 0, y: 0, width: 1, height: 5 };
        let mut raster = vec![0u8; 5];
        let mut sink = RasterSink::new(&mut raster, rect, &desc);
        // stored order is rows 0, 4, 2, 1, 3
        for index in [10, 14, 12, 11, 13] {
            sink.put(index);
        }
        assert_eq!(raster, [10, 11, 12, 13, 14]);
    }

    #[test]
    fn frame_pixel_lookup_and_owned_copy() {
        let canvas = [RGBA8::new(1, 2, 3, 4), RGBA8::new(5, 6, 7, 8)];
        let frame = FrameRef {
            pixels: Cow::Borrowed(&canvas[..]),
            width: 2,
            height: 1,
            delay_ms: 100,
            index: 0,
            pass: 0,
        };
        assert_eq!(frame.pixel(1, 0), Some(RGBA8::new(5, 6, 7, 8)));
        assert_eq!(frame.pixel(2, 0), None);
        assert_eq!(frame.as_img().width(), 2);
        let owned = frame.into_owned().expect("copy");
        assert!(matches!(owned.pixels, Cow::Owned(_)));
        assert_eq!(owned.pixel(0, 0), Some(RGBA8::new(1, 2, 3, 4)));
    }
}

#![deny(unsafe_code)]
//! Module for parsing GIF87a/GIF89a images and decoding their animation frames.
//!
//! The crate is split into a one-time container read ([`GifContainer`]) and a
//! pull-based frame decoder ([`GifDecoder`]) that composites every image block
//! onto a persistent RGBA canvas. [`Animator`] runs the decoder on a dedicated
//! thread for consumers that render on another one.
//!
//! This crate is written entirely in safe Rust code and never reads files: the
//! GIF bytes are handed in fully loaded.
//!
//! ```no_run
//! use zengif_parse::GifDecoder;
//!
//! let bytes = std::fs::read("image.gif")?;
//! let mut decoder = GifDecoder::from_bytes(&bytes);
//! while let Some(frame) = decoder.decode_next()? {
//!     println!("frame {} for {} ms", frame.index, frame.delay_ms);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::debug;

use std::convert::TryInto as _;

mod animator;
mod blocks;
mod container;
mod decoder;
mod lzw;

pub use crate::animator::{AnimationEvent, Animator, CancelFlag};
pub use crate::blocks::{Disposal, MIN_FRAME_DELAY_MS};
pub use crate::container::{ColorTable, GifContainer};
pub use crate::decoder::{DecodeStatus, FrameRef, GifDecoder};

pub use enough::{Stop, StopReason, Unstoppable};
pub use imgref::ImgRef;
pub use rgb::RGBA8;

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

/// Statically verify that the given type can fit within a `usize`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap()
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);

/// Which class of failure put a decoder into its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Signature mismatch or truncated header; detected once, at construction.
    HeaderInvalid,
    /// Corrupt LZW data or a read past the end of the buffer while decoding a frame.
    StreamCorrupt,
    /// The trailer was reached before any image block decoded.
    EmptyStream,
    /// A [`DecodeConfig`] limit was hit or an allocation failed.
    ResourceLimit,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::HeaderInvalid => "invalid GIF header",
            Self::StreamCorrupt => "corrupt GIF stream",
            Self::EmptyStream => "GIF contains no frames",
            Self::ResourceLimit => "resource limit exceeded",
        })
    }
}

/// Describes decoder failures.
///
/// This enum wraps the standard `io::Error` type, unified with
/// our own parser error states.
#[derive(Debug)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// The stream ended without a single decodable image block.
    NoFrames,
    /// Out of memory
    OutOfMemory,
    /// Resource limit exceeded during decoding
    ResourceLimitExceeded(&'static str),
    /// Operation was stopped/cancelled
    Stopped(enough::StopReason),
    /// The decoder failed earlier and accepts no further calls.
    Poisoned(FailureKind),
}

impl Error {
    /// Classify this error the way a frame decoder records it in
    /// [`DecodeStatus::Failed`]. Cancellation is not a decoder failure.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::NoFrames => Some(FailureKind::EmptyStream),
            Self::OutOfMemory | Self::ResourceLimitExceeded(_) => Some(FailureKind::ResourceLimit),
            Self::Poisoned(kind) => Some(*kind),
            Self::Stopped(_) => None,
            Self::InvalidData(_) | Self::UnexpectedEOF | Self::Io(_) => {
                Some(FailureKind::StreamCorrupt)
            },
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s) | Self::ResourceLimitExceeded(s) => s,
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return err.fmt(f),
            Self::NoFrames => "no image frames",
            Self::OutOfMemory => "OOM",
            Self::Stopped(reason) => return write!(f, "Stopped: {}", reason),
            Self::Poisoned(kind) => return write!(f, "decoder unusable: {kind}"),
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<enough::StopReason> for Error {
    fn from(reason: enough::StopReason) -> Self {
        Self::Stopped(reason)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) => std::io::ErrorKind::InvalidData,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Configuration for decoding GIF files with resource limits and playback options
///
/// GIF input is frequently untrusted web content: a 20-byte file can claim a
/// 65535×65535 canvas. Limits are checked **before** allocations occur.
///
/// # Examples
///
/// ```rust
/// use zengif_parse::DecodeConfig;
///
/// // Default limits (suitable for most apps)
/// let config = DecodeConfig::default();
///
/// // Strict limits for untrusted input, and play every animation once
/// let config = DecodeConfig::default()
///     .with_peak_memory_limit(64_000_000)
///     .with_max_canvas_pixels(4_000_000)
///     .with_loop_count_override(1);
///
/// // No limits
/// let config = DecodeConfig::unlimited();
/// ```
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Maximum heap memory held by one decoder (canvas, restore snapshot and
    /// index raster), in bytes.
    /// Default: 1GB (1,000,000,000 bytes)
    pub peak_memory_limit: Option<u64>,

    /// Maximum logical screen size in pixels.
    /// Default: 256 megapixels
    pub max_canvas_pixels: Option<u64>,

    /// Maximum number of image blocks in one pass over the stream.
    /// Default: 100,000 frames
    pub max_frames_per_pass: Option<u32>,

    /// Replaces the loop count from the NETSCAPE2.0 extension (0 = forever).
    /// Default: None (use the file's value)
    pub loop_count_override: Option<u16>,

    /// Whether an [`Animator`] decodes its first frame immediately, or waits
    /// for the first [`Animator::acknowledge`].
    /// Default: true
    pub auto_start: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            peak_memory_limit: Some(1_000_000_000),
            max_canvas_pixels: Some(256_000_000),
            max_frames_per_pass: Some(100_000),
            loop_count_override: None,
            auto_start: true,
        }
    }
}

impl DecodeConfig {
    /// Create a configuration with no resource limits.
    pub fn unlimited() -> Self {
        Self {
            peak_memory_limit: None,
            max_canvas_pixels: None,
            max_frames_per_pass: None,
            ..Self::default()
        }
    }

    /// Set the peak memory limit in bytes
    pub fn with_peak_memory_limit(mut self, bytes: u64) -> Self {
        self.peak_memory_limit = Some(bytes);
        self
    }

    /// Set the logical screen size limit in pixels
    pub fn with_max_canvas_pixels(mut self, pixels: u64) -> Self {
        self.max_canvas_pixels = Some(pixels);
        self
    }

    /// Set the maximum number of frames per pass
    pub fn with_max_frames_per_pass(mut self, frames: u32) -> Self {
        self.max_frames_per_pass = Some(frames);
        self
    }

    /// Ignore the file's loop count and use this one (0 = forever)
    pub fn with_loop_count_override(mut self, loops: u16) -> Self {
        self.loop_count_override = Some(loops);
        self
    }

    /// Start decoding as soon as an [`Animator`] is spawned
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }
}

/// Tracks the bytes one decoder holds against [`DecodeConfig`] limits.
#[derive(Debug, Clone)]
pub(crate) struct ResourceTracker {
    peak_memory_limit: Option<u64>,
    max_canvas_pixels: Option<u64>,
    max_frames_per_pass: Option<u32>,
    current_memory: u64,
    peak_memory: u64,
}

impl ResourceTracker {
    pub(crate) fn new(config: &DecodeConfig) -> Self {
        Self {
            peak_memory_limit: config.peak_memory_limit,
            max_canvas_pixels: config.max_canvas_pixels,
            max_frames_per_pass: config.max_frames_per_pass,
            current_memory: 0,
            peak_memory: 0,
        }
    }

    pub(crate) fn reserve(&mut self, bytes: u64) -> Result<()> {
        self.current_memory = self.current_memory.saturating_add(bytes);
        self.peak_memory = self.peak_memory.max(self.current_memory);

        if let Some(limit) = self.peak_memory_limit {
            if self.peak_memory > limit {
                return Err(Error::ResourceLimitExceeded("peak memory limit exceeded"));
            }
        }

        Ok(())
    }

    pub(crate) fn release(&mut self, bytes: u64) {
        self.current_memory = self.current_memory.saturating_sub(bytes);
    }

    pub(crate) fn validate_canvas(&self, width: u16, height: u16) -> Result<()> {
        if let Some(limit) = self.max_canvas_pixels {
            let pixels = u64::from(width) * u64::from(height);
            if pixels > limit {
                return Err(Error::ResourceLimitExceeded("canvas pixel limit exceeded"));
            }
        }

        Ok(())
    }

    pub(crate) fn validate_frame_count(&self, count: u32) -> Result<()> {
        if let Some(limit) = self.max_frames_per_pass {
            if count > limit {
                return Err(Error::ResourceLimitExceeded("frame count limit exceeded"));
            }
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn current_memory(&self) -> u64 {
        self.current_memory
    }
}

/// Every frame of one pass over a GIF, copied out of the decoder.
#[derive(Debug)]
pub struct GifData {
    /// Logical screen width.
    pub width: u16,
    /// Logical screen height.
    pub height: u16,
    /// Number of passes the file asks for (0 = forever), after any
    /// [`DecodeConfig::loop_count_override`].
    pub loop_count: u16,
    /// Fully composited frames, in display order.
    pub frames: std::vec::Vec<FrameRef<'static>>,
}

/// Decode one full pass of a GIF with resource limits and cancellation support
///
/// Each returned frame is a full canvas snapshot, so memory use is
/// `frames × width × height × 4` bytes. Prefer [`GifDecoder`] for long
/// animations.
///
/// # Arguments
///
/// * `data` - The complete GIF file
/// * `config` - Resource limits
/// * `stop` - Cancellation token (use [`Unstoppable`] if not needed), checked between frames
pub fn read_gif(data: &[u8], config: &DecodeConfig, stop: &dyn Stop) -> Result<GifData> {
    let container = GifContainer::try_parse(data)?;
    let mut decoder = GifDecoder::with_container(std::borrow::Cow::Borrowed(data), container, config);
    let mut frames = std::vec::Vec::new();

    loop {
        stop.check()?;
        match decoder.decode_next()? {
            Some(frame) if frame.pass == 0 => {
                frames.try_reserve(1)?;
                frames.push(frame.into_owned()?);
            },
            _ => break,
        }
    }
    debug!("read_gif: {} frames", frames.len());

    Ok(GifData {
        width: decoder.width(),
        height: decoder.height(),
        loop_count: decoder.loop_count(),
        frames,
    })
}

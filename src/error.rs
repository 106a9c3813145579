// Copyright (c) the parapng Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use thiserror::Error;

use crate::header::ColorType;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Operation not permitted: {0}")]
    InvalidState(&'static str),
    #[error("Invalid image size: {0}x{1}")]
    InvalidImageSize(u32, u32),
    #[error("Invalid bit depth {1} for color type {0:?}")]
    InvalidBitDepth(ColorType, u8),
    #[error("Invalid compression level {0}, expected 1 through 9")]
    InvalidCompressionLevel(u8),
    #[error("Chunk size {0} out of range, must be at least 32768 and below 2^31")]
    ChunkSizeOutOfRange(usize),
    #[error("Palette length {0} must be a nonzero multiple of 3, at most 768")]
    InvalidPaletteSize(usize),
    #[error("Palette not allowed for color type {0:?}")]
    PaletteNotAllowed(ColorType),
    #[error("Indexed color requires a palette before image data")]
    MissingPalette,
    #[error("Transparency not allowed for color type {0:?}")]
    TransparencyNotAllowed(ColorType),
    #[error("Invalid transparency length {0} for color type {1:?}")]
    InvalidTransparencySize(usize, ColorType),
    #[error("Row data length {0} is not a multiple of the {1}-byte stride")]
    PartialRow(usize, usize),
    #[error("Too much image data: got {0} rows, image height is {1}")]
    TooManyRows(u64, u32),
    #[error("Too little image data: got {0} of {1} rows")]
    MissingRows(u64, u32),
    #[error("Chunk data too long: {0} bytes")]
    ChunkTooLarge(usize),
    #[error("Deflate stream error in {0}")]
    Compressor(&'static str),
    #[error("Output error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Worker thread lost")]
    WorkerLost,
    #[error("Encoder poisoned by an earlier failure")]
    Poisoned,
}

impl Error {
    /// Whether this failure leaves the encoder unusable.
    ///
    /// Parameter and state validation happens before any output or pipeline
    /// mutation, so those errors are recoverable; anything that surfaces from
    /// the sink, the compressor, or a worker is not.
    pub(crate) fn poisons(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Compressor(_) | Error::WorkerLost)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// Copyright (c) the parapng Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! The image metadata that goes into the IHDR chunk.

use crate::error::{Error, Result};

/// Maximum width or height: PNG stores dimensions as 31-bit values.
pub const MAX_DIMENSION: u32 = 0x7fff_ffff;

/// PNG color types, with the numeric values used on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ColorType {
    Greyscale = 0,
    Truecolor = 2,
    IndexedColor = 3,
    GreyscaleAlpha = 4,
    TruecolorAlpha = 6,
}

impl ColorType {
    pub fn channels(self) -> usize {
        match self {
            ColorType::Greyscale | ColorType::IndexedColor => 1,
            ColorType::GreyscaleAlpha => 2,
            ColorType::Truecolor => 3,
            ColorType::TruecolorAlpha => 4,
        }
    }

    /// The legal bit depths for this color type, per PNG Table 11.1.
    pub fn is_depth_valid(self, depth: u8) -> bool {
        match self {
            ColorType::Greyscale => matches!(depth, 1 | 2 | 4 | 8 | 16),
            ColorType::IndexedColor => matches!(depth, 1 | 2 | 4 | 8),
            ColorType::Truecolor | ColorType::GreyscaleAlpha | ColorType::TruecolorAlpha => {
                matches!(depth, 8 | 16)
            }
        }
    }
}

/// Image metadata for the IHDR chunk.
///
/// Defaults to truecolor with alpha at 8-bit depth and an unset size; the
/// size must be filled in with [`Header::set_size`] before the header can be
/// written.
#[derive(Copy, Clone, Debug)]
pub struct Header {
    width: u32,
    height: u32,
    color_type: ColorType,
    depth: u8,
}

impl Default for Header {
    fn default() -> Header {
        Header::new()
    }
}

impl Header {
    pub fn new() -> Header {
        Header {
            width: 0,
            height: 0,
            color_type: ColorType::TruecolorAlpha,
            depth: 8,
        }
    }

    pub fn set_size(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(Error::InvalidImageSize(width, height));
        }
        self.width = width;
        self.height = height;
        Ok(())
    }

    pub fn set_color(&mut self, color_type: ColorType, depth: u8) -> Result<()> {
        if !color_type.is_depth_valid(depth) {
            return Err(Error::InvalidBitDepth(color_type, depth));
        }
        self.color_type = color_type;
        self.depth = depth;
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn color_type(&self) -> ColorType {
        self.color_type
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Bytes per packed row of raster input.
    pub fn stride(&self) -> usize {
        let bits = self.width as u64 * self.depth as u64 * self.color_type.channels() as u64;
        ((bits + 7) / 8) as usize
    }

    /// Bytes per complete pixel, rounded up to at least one. This is the
    /// distance to the "left" byte in the Sub, Average and Paeth filters.
    pub fn bytes_per_pixel(&self) -> usize {
        let bytes = self.color_type.channels() * self.depth as usize / 8;
        bytes.max(1)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidImageSize(self.width, self.height));
        }
        Ok(())
    }

    /// The 13-byte IHDR chunk payload.
    pub(crate) fn ihdr_payload(&self) -> [u8; 13] {
        let mut payload = [0u8; 13];
        payload[0..4].copy_from_slice(&self.width.to_be_bytes());
        payload[4..8].copy_from_slice(&self.height.to_be_bytes());
        payload[8] = self.depth;
        payload[9] = self.color_type as u8;
        // Compression method, filter method, interlace method: all zero.
        payload
    }
}

// Copyright (c) the parapng Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Raw deflate compression for one row group at a time.
//!
//! Every group is compressed as a run of non-final deflate blocks, primed
//! with the previous group's filtered tail as a preset dictionary and ended
//! on a byte boundary with a sync flush. Concatenating the groups' output,
//! the [`FINAL_EMPTY_BLOCK`] and the combined Adler-32 trailer behind a
//! [`zlib_header`] yields a single valid zlib stream.

// The zlib C API requires unsafe calls - this is inherent to FFI.
#![allow(unsafe_code)]

use std::mem;
use std::os::raw::c_int;

use libz_sys::{
    deflate, deflateEnd, deflateInit2_, deflateSetDictionary, uInt, z_stream, zlibVersion,
    Z_BUF_ERROR, Z_DEFLATED, Z_NO_FLUSH, Z_OK, Z_SYNC_FLUSH,
};
use crate::error::{Error, Result};

/// The deflate LZ77 window: the most a preset dictionary can hold, and the
/// least a row group may span so back-references keep reaching across
/// group boundaries.
pub const WINDOW_SIZE: usize = 32 * 1024;

/// A final fixed-Huffman block containing nothing but the end-of-block
/// symbol: bits 011 then seven zeroes, padded out to two bytes. Emitted
/// exactly once, after the last group.
pub const FINAL_EMPTY_BLOCK: [u8; 2] = [0x03, 0x00];

// Negative window bits select a raw stream with no zlib wrapper; the
// wrapper is written by the reassembler around all groups at once.
const WINDOW_BITS_RAW: c_int = -15;
const MEM_LEVEL: c_int = 8;

// Cap on bytes handed to the stream per call; avail_in is 32-bit.
const MAX_CALL_INPUT: usize = 1 << 30;

/// Deflate strategies. Discriminants match zlib's strategy codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    Default = 0,
    Filtered = 1,
    HuffmanOnly = 2,
    Rle = 3,
    Fixed = 4,
}

/// A deflate compression level from 1 to 9.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Result<CompressionLevel> {
        if !(1..=9).contains(&level) {
            return Err(Error::InvalidCompressionLevel(level));
        }
        Ok(CompressionLevel(level))
    }

    /// Level 1, cheapest.
    pub fn fast() -> CompressionLevel {
        CompressionLevel(1)
    }

    /// Level 9, densest.
    pub fn high() -> CompressionLevel {
        CompressionLevel(9)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    /// Level 6, zlib's traditional default.
    fn default() -> CompressionLevel {
        CompressionLevel(6)
    }
}

/// The two-byte zlib stream header for the given level: CMF 0x78, FLG with
/// FDICT clear, FLEVEL from the level, and the check bits making
/// CMF*256+FLG divisible by 31.
pub fn zlib_header(level: CompressionLevel) -> [u8; 2] {
    let flevel: u16 = match level.get() {
        1 => 0,
        2..=5 => 1,
        6 => 2,
        _ => 3,
    };
    let cmf: u16 = 0x78;
    let mut flg = flevel << 6;
    let rem = (cmf * 256 + flg) % 31;
    if rem != 0 {
        flg += 31 - rem;
    }
    [cmf as u8, flg as u8]
}

/// The compression capability a worker needs. The pipeline's compression
/// stage is generic over this, so another deflate implementation can be
/// swapped in at the dispatch site.
pub trait Compressor: Sized {
    /// Builds a fresh stream for one group.
    fn new(level: CompressionLevel, strategy: Strategy) -> Result<Self>;

    /// Primes the stream with up to [`WINDOW_SIZE`] bytes of history that
    /// are not emitted into the output.
    fn set_dictionary(&mut self, dict: &[u8]) -> Result<()>;

    /// Compresses `input`, appending any produced bytes to `out`. Output
    /// may be withheld until more input or a flush arrives.
    fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()>;

    /// Flushes all pending output and aligns the stream to a byte boundary
    /// without terminating it.
    fn sync_flush(&mut self, out: &mut Vec<u8>) -> Result<()>;
}

/// zlib-backed [`Compressor`] producing a raw deflate stream.
pub struct ZlibCompressor {
    // Boxed: zlib keeps an interior pointer to the stream struct, so it
    // must not move between calls.
    strm: Box<z_stream>,
}

impl ZlibCompressor {
    fn drive(&mut self, input: &[u8], flush: c_int, out: &mut Vec<u8>) -> Result<()> {
        let mut remaining = input;
        let mut buf = [0u8; 16 * 1024];
        loop {
            let feed = remaining.len().min(MAX_CALL_INPUT);
            self.strm.next_in = remaining.as_ptr() as *mut u8;
            self.strm.avail_in = feed as uInt;
            self.strm.next_out = buf.as_mut_ptr();
            self.strm.avail_out = buf.len() as uInt;
            // SAFETY: next_in/avail_in and next_out/avail_out describe live
            // buffers for the duration of this call.
            let ret = unsafe { deflate(&mut *self.strm, flush) };
            if ret != Z_OK && ret != Z_BUF_ERROR {
                return Err(Error::Compressor("deflate"));
            }
            let consumed = feed - self.strm.avail_in as usize;
            remaining = &remaining[consumed..];
            let produced = buf.len() - self.strm.avail_out as usize;
            out.extend_from_slice(&buf[..produced]);
            // Room left in the output buffer means the stream has nothing
            // more to say for this input and flush mode.
            if remaining.is_empty() && self.strm.avail_out != 0 {
                return Ok(());
            }
            if consumed == 0 && produced == 0 {
                return Err(Error::Compressor("deflate made no progress"));
            }
        }
    }
}

impl Compressor for ZlibCompressor {
    fn new(level: CompressionLevel, strategy: Strategy) -> Result<ZlibCompressor> {
        // An all-zero z_stream is the documented initial state: Z_NULL
        // allocators make deflateInit2 install zlib's defaults.
        let mut strm = Box::new(mem::MaybeUninit::<z_stream>::zeroed());
        // SAFETY: the pointer refers to a zeroed stream struct that
        // outlives the call, and the version/size pair matches the linked
        // zlib.
        let ret = unsafe {
            deflateInit2_(
                strm.as_mut_ptr(),
                c_int::from(level.get()),
                Z_DEFLATED,
                WINDOW_BITS_RAW,
                MEM_LEVEL,
                strategy as c_int,
                zlibVersion(),
                mem::size_of::<z_stream>() as c_int,
            )
        };
        if ret != Z_OK {
            return Err(Error::Compressor("deflateInit2"));
        }
        // SAFETY: deflateInit2 filled in every field, including non-null
        // allocator pointers, so the stream is initialized from here on.
        let strm = unsafe { Box::from_raw(Box::into_raw(strm) as *mut z_stream) };
        Ok(ZlibCompressor { strm })
    }

    fn set_dictionary(&mut self, dict: &[u8]) -> Result<()> {
        if dict.is_empty() {
            return Ok(());
        }
        debug_assert!(dict.len() <= WINDOW_SIZE);
        // SAFETY: dict is a live slice; zlib copies it into its own window.
        let ret =
            unsafe { deflateSetDictionary(&mut *self.strm, dict.as_ptr(), dict.len() as uInt) };
        if ret != Z_OK {
            return Err(Error::Compressor("deflateSetDictionary"));
        }
        Ok(())
    }

    fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.drive(input, Z_NO_FLUSH, out)
    }

    fn sync_flush(&mut self, out: &mut Vec<u8>) -> Result<()> {
        self.drive(&[], Z_SYNC_FLUSH, out)
    }
}

impl Drop for ZlibCompressor {
    fn drop(&mut self) {
        // SAFETY: the stream was initialized in new() and is ended exactly
        // once; the unfinished-stream status code is expected here.
        unsafe {
            deflateEnd(&mut *self.strm);
        }
    }
}

// Copyright (c) the parapng Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Encoder configuration.

use std::sync::Arc;

use rayon::ThreadPool;

use crate::deflate::{CompressionLevel, Strategy};
use crate::error::{Error, Result};
use crate::filter::Filter;

/// Row groups must span at least a full deflate window so preset
/// dictionaries can carry compression across group boundaries.
pub const MIN_CHUNK_SIZE: usize = 32 * 1024;

/// Chunk sizes must stay below 2^31 so group payloads fit PNG chunk limits.
pub const MAX_CHUNK_SIZE: usize = 0x7fff_ffff;

const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Either pick per row group (or per row) automatically, or force a fixed
/// choice. Used for both filters and deflate strategies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode<T> {
    Adaptive,
    Fixed(T),
}

/// Configuration for an [`Encoder`](crate::encoder::Encoder).
///
/// Values are copied into the encoder at construction; mutating an options
/// object afterwards does not affect encoders already built from it. The
/// same options may be reused for any number of encoders.
#[derive(Clone)]
pub struct Options {
    thread_pool: Option<Arc<ThreadPool>>,
    filter_mode: Mode<Filter>,
    strategy_mode: Mode<Strategy>,
    compression_level: CompressionLevel,
    chunk_size: usize,
    streaming: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options::new()
    }
}

impl Options {
    pub fn new() -> Options {
        Options {
            thread_pool: None,
            filter_mode: Mode::Adaptive,
            strategy_mode: Mode::Adaptive,
            compression_level: CompressionLevel::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            streaming: true,
        }
    }

    /// Run filter and compression jobs on the given shared pool instead of
    /// rayon's global one. The pool may be shared between encoders.
    pub fn set_thread_pool(&mut self, pool: Arc<ThreadPool>) -> Result<()> {
        self.thread_pool = Some(pool);
        Ok(())
    }

    pub fn set_filter_mode(&mut self, mode: Mode<Filter>) -> Result<()> {
        self.filter_mode = mode;
        Ok(())
    }

    pub fn set_strategy_mode(&mut self, mode: Mode<Strategy>) -> Result<()> {
        self.strategy_mode = mode;
        Ok(())
    }

    pub fn set_compression_level(&mut self, level: CompressionLevel) -> Result<()> {
        self.compression_level = level;
        Ok(())
    }

    /// Target size in bytes of the filtered data handed to each parallel
    /// compression job. Larger chunks compress slightly better; smaller
    /// chunks parallelize smaller images.
    pub fn set_chunk_size(&mut self, chunk_size: usize) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(Error::ChunkSizeOutOfRange(chunk_size));
        }
        self.chunk_size = chunk_size;
        Ok(())
    }

    /// In streaming mode (the default) IDAT chunks are emitted and the sink
    /// flushed as compressed data accumulates; otherwise the whole stream is
    /// buffered and written as a single IDAT at finish time.
    pub fn set_streaming(&mut self, streaming: bool) -> Result<()> {
        self.streaming = streaming;
        Ok(())
    }

    pub(crate) fn thread_pool(&self) -> Option<&Arc<ThreadPool>> {
        self.thread_pool.as_ref()
    }

    pub(crate) fn filter_mode(&self) -> Mode<Filter> {
        self.filter_mode
    }

    pub(crate) fn strategy_mode(&self) -> Mode<Strategy> {
        self.strategy_mode
    }

    pub(crate) fn compression_level(&self) -> CompressionLevel {
        self.compression_level
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) fn streaming(&self) -> bool {
        self.streaming
    }
}

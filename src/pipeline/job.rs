// Copyright (c) the parapng Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Worker-side jobs. Both stages are pure functions of their inputs, so
//! encoded bytes do not depend on scheduling or worker count.

use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::adler;
use crate::deflate::{self, CompressionLevel, Compressor, Strategy};
use crate::error::Result;
use crate::filter::{Filter, Filterer};
use crate::options::Mode;
use crate::util::tracing_wrappers::*;

/// Input to the filter stage for one row group.
pub(crate) struct FilterJob {
    pub index: u64,
    /// Raw raster rows, `nrows * stride` bytes.
    pub rows: Vec<u8>,
    pub nrows: usize,
    /// Last raster row of the previous group; all zeroes for group 0.
    pub prev_row: Arc<Vec<u8>>,
    pub stride: usize,
    pub bpp: usize,
    pub mode: Mode<Filter>,
}

/// Result of the filter stage.
pub(crate) struct FilteredGroup {
    pub index: u64,
    /// Filter-type byte plus filtered bytes, per row.
    pub filtered: Vec<u8>,
    /// Adler-32 over `filtered`.
    pub adler: u32,
    pub nrows: usize,
    /// Rows that picked a filter other than None; drives the adaptive
    /// strategy choice.
    pub filtered_rows: usize,
    /// Last `WINDOW_SIZE` bytes of `filtered`: the next group's preset
    /// dictionary.
    pub tail: Arc<Vec<u8>>,
}

/// Result of the compression stage.
pub(crate) struct DeflatedGroup {
    /// Raw deflate bytes: non-final blocks, sync-flushed to a byte boundary.
    pub compressed: Vec<u8>,
    pub adler: u32,
    pub filtered_len: u64,
}

pub(crate) enum JobMsg {
    Filtered(FilteredGroup),
    Deflated(u64, Result<DeflatedGroup>),
}

// A failed send means the encoder was dropped mid-encode; the job's output
// is discarded along with it.

pub(crate) fn run_filter(job: FilterJob, tx: Sender<JobMsg>) {
    let FilterJob {
        index,
        rows,
        nrows,
        prev_row,
        stride,
        bpp,
        mode,
    } = job;
    let mut filtered = Vec::with_capacity(nrows * (stride + 1));
    let mut filterer = Filterer::new(mode, bpp, stride);
    let mut filtered_rows = 0;
    let mut prev: &[u8] = &prev_row;
    for r in 0..nrows {
        let cur = &rows[r * stride..(r + 1) * stride];
        if filterer.filter_into(prev, cur, &mut filtered) != Filter::None {
            filtered_rows += 1;
        }
        prev = cur;
    }
    let adler = adler::checksum(&filtered);
    let tail_at = filtered.len().saturating_sub(deflate::WINDOW_SIZE);
    let tail = Arc::new(filtered[tail_at..].to_vec());
    trace!("filtered group {index}: {nrows} rows, {filtered_rows} non-None");
    let _ = tx.send(JobMsg::Filtered(FilteredGroup {
        index,
        filtered,
        adler,
        nrows,
        filtered_rows,
        tail,
    }));
}

pub(crate) fn run_deflate<C: Compressor>(
    group: FilteredGroup,
    dict: Arc<Vec<u8>>,
    level: CompressionLevel,
    strategy: Strategy,
    tx: Sender<JobMsg>,
) {
    let index = group.index;
    let result = deflate_group::<C>(&group.filtered, &dict, level, strategy).map(|compressed| {
        trace!(
            "deflated group {index}: {} -> {} bytes",
            group.filtered.len(),
            compressed.len()
        );
        DeflatedGroup {
            compressed,
            adler: group.adler,
            filtered_len: group.filtered.len() as u64,
        }
    });
    let _ = tx.send(JobMsg::Deflated(index, result));
}

fn deflate_group<C: Compressor>(
    filtered: &[u8],
    dict: &[u8],
    level: CompressionLevel,
    strategy: Strategy,
) -> Result<Vec<u8>> {
    let mut stream = C::new(level, strategy)?;
    stream.set_dictionary(dict)?;
    let mut out = Vec::with_capacity(filtered.len() / 2 + 64);
    stream.compress(filtered, &mut out)?;
    stream.sync_flush(&mut out)?;
    Ok(out)
}

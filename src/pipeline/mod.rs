// Copyright (c) the parapng Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! The parallel encoding pipeline.
//!
//! Incoming raster rows accumulate into row groups sized so that each
//! group's filtered bytes reach the configured chunk size. Each group runs
//! through two pure worker stages: filtering (which needs only the previous
//! group's raw last row, known at dispatch time) and compression (which
//! needs the previous group's filtered tail as a preset dictionary, known
//! once that group's filter stage reports back). The stages are chained by
//! the pump on the caller thread rather than by blocking inside workers, so
//! the pipeline cannot deadlock however the pool schedules jobs, and both
//! stages parallelize across groups.
//!
//! Compressed groups are reassembled in index order, folded into one rolling
//! Adler-32, and emitted as IDAT chunks.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;

use rayon::ThreadPool;

use crate::adler;
use crate::chunk;
use crate::deflate::{self, CompressionLevel, Strategy, ZlibCompressor};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::header::{ColorType, Header};
use crate::options::{Mode, Options};
use crate::util::tracing_wrappers::*;

mod job;

use job::{DeflatedGroup, FilteredGroup, JobMsg};

/// Compressed bytes are buffered up to this size before being flushed to
/// the sink as an IDAT chunk in streaming mode.
pub(crate) const IDAT_SOFT_CAP: usize = 256 * 1024;

pub(crate) struct Pipeline {
    stride: usize,
    bpp: usize,
    height: u32,
    rows_per_group: usize,
    filter_mode: Mode<Filter>,
    strategy_mode: Mode<Strategy>,
    level: CompressionLevel,
    streaming: bool,
    pool: Option<Arc<ThreadPool>>,
    max_in_flight: usize,

    // Row accumulation.
    current: Vec<u8>,
    rows_in_current: usize,
    rows_received: u64,
    prev_row: Arc<Vec<u8>>,

    // Dispatch bookkeeping. A group counts as in flight from filter
    // dispatch until its compressed bytes are emitted.
    tx: Sender<JobMsg>,
    rx: Receiver<JobMsg>,
    next_group: u64,
    in_flight: usize,
    pending_filtered: BTreeMap<u64, FilteredGroup>,
    tails: BTreeMap<u64, Arc<Vec<u8>>>,
    next_deflate: u64,

    // Reassembly.
    completed: BTreeMap<u64, DeflatedGroup>,
    next_emit: u64,
    adler: u32,
    idat: Vec<u8>,
}

impl Pipeline {
    pub(crate) fn new(header: &Header, options: &Options) -> Pipeline {
        let stride = header.stride();
        // Enough rows that the filtered bytes reach the chunk size.
        let rows_per_group = (options.chunk_size() + stride) / (stride + 1);
        let filter_mode = match (options.filter_mode(), header.color_type()) {
            // Index values carry no spatial correlation worth predicting.
            (Mode::Adaptive, ColorType::IndexedColor) => Mode::Fixed(Filter::None),
            (mode, _) => mode,
        };
        let pool = options.thread_pool().cloned();
        let workers = pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, |p| p.current_num_threads());
        let cap_rows = (rows_per_group as u64).min(header.height() as u64) as usize;
        let (tx, rx) = mpsc::channel();
        Pipeline {
            stride,
            bpp: header.bytes_per_pixel(),
            height: header.height(),
            rows_per_group,
            filter_mode,
            strategy_mode: options.strategy_mode(),
            level: options.compression_level(),
            streaming: options.streaming(),
            pool,
            max_in_flight: (2 * workers).max(2),
            current: Vec::with_capacity(cap_rows * stride),
            rows_in_current: 0,
            rows_received: 0,
            prev_row: Arc::new(vec![0; stride]),
            tx,
            rx,
            next_group: 0,
            in_flight: 0,
            pending_filtered: BTreeMap::new(),
            tails: BTreeMap::new(),
            next_deflate: 0,
            completed: BTreeMap::new(),
            next_emit: 0,
            adler: adler::INITIAL,
            idat: Vec::new(),
        }
    }

    /// Buffers one or more raster rows, dispatching any groups they fill.
    ///
    /// Validation happens before any row is consumed, so a rejected call
    /// leaves the pipeline exactly as it was.
    pub(crate) fn write_rows<W: Write>(&mut self, sink: &mut W, data: &[u8]) -> Result<()> {
        if data.len() % self.stride != 0 {
            return Err(Error::PartialRow(data.len(), self.stride));
        }
        let nrows = (data.len() / self.stride) as u64;
        if self.rows_received + nrows > self.height as u64 {
            return Err(Error::TooManyRows(self.rows_received + nrows, self.height));
        }
        let mut data = data;
        while !data.is_empty() {
            let rows_wanted = self.rows_per_group - self.rows_in_current;
            let take = (rows_wanted * self.stride).min(data.len());
            self.current.extend_from_slice(&data[..take]);
            self.rows_in_current += take / self.stride;
            self.rows_received += (take / self.stride) as u64;
            data = &data[take..];
            if self.rows_in_current == self.rows_per_group {
                self.close_group(sink)?;
            }
        }
        Ok(())
    }

    /// Dispatches the final partial group, drains every outstanding job,
    /// and writes the tail of the zlib stream into the last IDAT chunk(s).
    pub(crate) fn finish<W: Write>(&mut self, sink: &mut W) -> Result<()> {
        if self.rows_received < self.height as u64 {
            return Err(Error::MissingRows(self.rows_received, self.height));
        }
        if self.rows_in_current > 0 {
            self.close_group(sink)?;
        }
        while self.next_emit < self.next_group {
            self.pump(sink, true)?;
        }
        self.idat.extend_from_slice(&deflate::FINAL_EMPTY_BLOCK);
        self.idat.extend_from_slice(&self.adler.to_be_bytes());
        debug!("stream complete, adler {:08x}", self.adler);
        self.flush_idat(sink, true)?;
        sink.flush()?;
        Ok(())
    }

    fn spawn<F: FnOnce() + Send + 'static>(&self, f: F) {
        match &self.pool {
            Some(pool) => pool.spawn(f),
            None => rayon::spawn(f),
        }
    }

    /// Hands the accumulated rows to a filter job. Applies backpressure
    /// first: no more than `max_in_flight` groups may be outstanding.
    fn close_group<W: Write>(&mut self, sink: &mut W) -> Result<()> {
        while self.in_flight >= self.max_in_flight {
            self.pump(sink, true)?;
        }
        let nrows = self.rows_in_current;
        let cap = self.current.capacity();
        let rows = std::mem::replace(&mut self.current, Vec::with_capacity(cap));
        self.rows_in_current = 0;
        let prev_row = std::mem::replace(
            &mut self.prev_row,
            Arc::new(rows[rows.len() - self.stride..].to_vec()),
        );
        let index = self.next_group;
        debug!("dispatching group {index} ({nrows} rows)");
        let job = job::FilterJob {
            index,
            rows,
            nrows,
            prev_row,
            stride: self.stride,
            bpp: self.bpp,
            mode: self.filter_mode,
        };
        let tx = self.tx.clone();
        self.spawn(move || job::run_filter(job, tx));
        self.next_group += 1;
        self.in_flight += 1;
        Ok(())
    }

    /// Processes completed jobs: waits for one if `block`, then drains the
    /// channel and emits whatever became ready in order.
    fn pump<W: Write>(&mut self, sink: &mut W, block: bool) -> Result<()> {
        if block {
            let msg = self.rx.recv().map_err(|_| Error::WorkerLost)?;
            self.handle(msg)?;
        }
        loop {
            match self.rx.try_recv() {
                Ok(msg) => self.handle(msg)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(Error::WorkerLost),
            }
        }
        self.emit_ready(sink)
    }

    fn handle(&mut self, msg: JobMsg) -> Result<()> {
        match msg {
            JobMsg::Filtered(group) => {
                self.tails.insert(group.index, Arc::clone(&group.tail));
                self.pending_filtered.insert(group.index, group);
                self.dispatch_ready_deflates();
                Ok(())
            }
            JobMsg::Deflated(index, result) => {
                let group = result?;
                self.completed.insert(index, group);
                Ok(())
            }
        }
    }

    /// Starts compression for every filtered group whose predecessor's
    /// filtered tail is available. Deflate jobs start in index order but
    /// run concurrently.
    fn dispatch_ready_deflates(&mut self) {
        while self.pending_filtered.contains_key(&self.next_deflate) {
            let dict = if self.next_deflate == 0 {
                Arc::new(Vec::new())
            } else {
                match self.tails.remove(&(self.next_deflate - 1)) {
                    Some(tail) => tail,
                    // Predecessor still filtering.
                    None => return,
                }
            };
            let group = self.pending_filtered.remove(&self.next_deflate).unwrap();
            let strategy = match self.strategy_mode {
                Mode::Fixed(strategy) => strategy,
                Mode::Adaptive => {
                    if group.filtered_rows * 2 > group.nrows {
                        Strategy::Filtered
                    } else {
                        Strategy::Default
                    }
                }
            };
            let level = self.level;
            let tx = self.tx.clone();
            self.spawn(move || job::run_deflate::<ZlibCompressor>(group, dict, level, strategy, tx));
            self.next_deflate += 1;
        }
    }

    /// Appends completed groups to the IDAT buffer in strict index order,
    /// folding their checksums into the rolling Adler-32.
    fn emit_ready<W: Write>(&mut self, sink: &mut W) -> Result<()> {
        while let Some(group) = self.completed.remove(&self.next_emit) {
            if self.next_emit == 0 {
                self.idat
                    .extend_from_slice(&deflate::zlib_header(self.level));
            }
            self.idat.extend_from_slice(&group.compressed);
            self.adler = adler::combine(self.adler, group.adler, group.filtered_len);
            self.next_emit += 1;
            self.in_flight -= 1;
            self.flush_idat(sink, false)?;
        }
        Ok(())
    }

    fn flush_idat<W: Write>(&mut self, sink: &mut W, force: bool) -> Result<()> {
        let ready = if force {
            !self.idat.is_empty()
        } else {
            self.streaming && self.idat.len() >= IDAT_SOFT_CAP
        };
        if !ready {
            return Ok(());
        }
        for piece in self.idat.chunks(chunk::MAX_CHUNK_DATA) {
            chunk::write_chunk(sink, chunk::IDAT, piece)?;
        }
        self.idat.clear();
        if self.streaming {
            sink.flush()?;
        }
        Ok(())
    }
}

// Copyright (c) the parapng Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! The encoder facade and its call-ordering state machine.

use std::io::Write;

use crate::chunk;
use crate::error::{Error, Result};
use crate::header::{ColorType, Header};
use crate::options::Options;
use crate::pipeline::Pipeline;
use crate::util::tracing_wrappers::*;

// Chunk ordering is driven entirely by facade calls: a call that is not
// permitted in the current state fails without changing anything.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Created,
    HeaderWritten,
    PaletteWritten,
    TransparencyWritten,
    StreamingRows,
    Poisoned,
}

/// Encodes a single PNG image to a [`Write`] sink.
///
/// Calls must follow the chunk order: header first, then an optional
/// palette and optional transparency, then rows, then `finish`.
/// The encoder must be driven from one thread; the parallelism lives behind
/// it, in the pipeline. A sink, compressor or worker failure poisons the
/// encoder: every later call fails with [`Error::Poisoned`] and the sink is
/// never touched again. Dropping an encoder at any point is safe.
pub struct Encoder<W: Write> {
    sink: W,
    options: Options,
    state: State,
    header: Option<Header>,
    palette_entries: Option<usize>,
    pipeline: Option<Pipeline>,
}

impl<W: Write> Encoder<W> {
    /// Creates an encoder writing to `sink`. The options are copied, so
    /// later mutation of `options` does not affect this encoder.
    pub fn new(sink: W, options: &Options) -> Encoder<W> {
        Encoder {
            sink,
            options: options.clone(),
            state: State::Created,
            header: None,
            palette_entries: None,
            pipeline: None,
        }
    }

    /// Writes the PNG signature and the IHDR chunk, and fixes the image
    /// shape for the rest of the encode. The header is copied and may be
    /// released or reused immediately.
    pub fn write_header(&mut self, header: &Header) -> Result<()> {
        self.check_not_poisoned()?;
        if self.state != State::Created {
            return Err(Error::InvalidState("header already written"));
        }
        header.validate()?;
        let result = self.emit_header(header);
        self.guard(result)?;
        debug!(
            "wrote header: {}x{} {:?} depth {}",
            header.width(),
            header.height(),
            header.color_type(),
            header.depth()
        );
        self.header = Some(*header);
        self.pipeline = Some(Pipeline::new(header, &self.options));
        self.state = State::HeaderWritten;
        Ok(())
    }

    /// Writes a PLTE chunk: the color table for an indexed image, or a
    /// suggested quantization palette for a truecolor one.
    pub fn write_palette(&mut self, palette: &[u8]) -> Result<()> {
        self.check_not_poisoned()?;
        if self.state != State::HeaderWritten {
            return Err(Error::InvalidState("palette must directly follow the header"));
        }
        let color = self.header.unwrap().color_type();
        match color {
            ColorType::IndexedColor | ColorType::Truecolor | ColorType::TruecolorAlpha => {}
            _ => return Err(Error::PaletteNotAllowed(color)),
        }
        if palette.is_empty() || palette.len() % 3 != 0 || palette.len() > 768 {
            return Err(Error::InvalidPaletteSize(palette.len()));
        }
        let result = chunk::write_chunk(&mut self.sink, chunk::PLTE, palette);
        self.guard(result)?;
        self.palette_entries = Some(palette.len() / 3);
        self.state = State::PaletteWritten;
        Ok(())
    }

    /// Writes a tRNS chunk in the layout the color type mandates: a 2-byte
    /// grey sample, a 6-byte RGB sample, or one alpha byte per palette
    /// entry (at most) for indexed color. Alpha color types carry their
    /// transparency in the pixels and reject this call.
    pub fn write_transparency(&mut self, transparency: &[u8]) -> Result<()> {
        self.check_not_poisoned()?;
        if !matches!(self.state, State::HeaderWritten | State::PaletteWritten) {
            return Err(Error::InvalidState("transparency must precede image data"));
        }
        let color = self.header.unwrap().color_type();
        match color {
            ColorType::Greyscale => {
                if transparency.len() != 2 {
                    return Err(Error::InvalidTransparencySize(transparency.len(), color));
                }
            }
            ColorType::Truecolor => {
                if transparency.len() != 6 {
                    return Err(Error::InvalidTransparencySize(transparency.len(), color));
                }
            }
            ColorType::IndexedColor => {
                let entries = self.palette_entries.ok_or(Error::MissingPalette)?;
                if transparency.is_empty() || transparency.len() > entries {
                    return Err(Error::InvalidTransparencySize(transparency.len(), color));
                }
            }
            ColorType::GreyscaleAlpha | ColorType::TruecolorAlpha => {
                return Err(Error::TransparencyNotAllowed(color));
            }
        }
        let result = chunk::write_chunk(&mut self.sink, chunk::TRNS, transparency);
        self.guard(result)?;
        self.state = State::TransparencyWritten;
        Ok(())
    }

    /// Feeds one or more raster rows, pre-packed to the header's stride.
    ///
    /// May block while the pipeline is at its in-flight limit. A call whose
    /// length is not a whole number of rows, or which would exceed the
    /// image height, is rejected without consuming anything.
    pub fn write_image_rows(&mut self, data: &[u8]) -> Result<()> {
        self.check_not_poisoned()?;
        if !matches!(
            self.state,
            State::HeaderWritten
                | State::PaletteWritten
                | State::TransparencyWritten
                | State::StreamingRows
        ) {
            return Err(Error::InvalidState("image data requires a header"));
        }
        let header = self.header.unwrap();
        if header.color_type() == ColorType::IndexedColor && self.palette_entries.is_none() {
            return Err(Error::MissingPalette);
        }
        let pipeline = self.pipeline.as_mut().unwrap();
        let result = pipeline.write_rows(&mut self.sink, data);
        self.guard(result)?;
        self.state = State::StreamingRows;
        Ok(())
    }

    /// Drains the pipeline, writes the remaining IDAT data and the IEND
    /// chunk, flushes the sink, and hands it back.
    ///
    /// Fails if the rows delivered so far do not add up to the header's
    /// height.
    pub fn finish(mut self) -> Result<W> {
        self.check_not_poisoned()?;
        if self.state == State::Created {
            return Err(Error::InvalidState("finish requires a header"));
        }
        let header = self.header.unwrap();
        if header.color_type() == ColorType::IndexedColor && self.palette_entries.is_none() {
            return Err(Error::MissingPalette);
        }
        let mut pipeline = self.pipeline.take().unwrap();
        pipeline.finish(&mut self.sink)?;
        chunk::write_chunk(&mut self.sink, chunk::IEND, &[])?;
        self.sink.flush()?;
        debug!("encode finished");
        Ok(self.sink)
    }

    fn emit_header(&mut self, header: &Header) -> Result<()> {
        chunk::write_signature(&mut self.sink)?;
        chunk::write_chunk(&mut self.sink, chunk::IHDR, &header.ihdr_payload())
    }

    fn check_not_poisoned(&self) -> Result<()> {
        if self.state == State::Poisoned {
            return Err(Error::Poisoned);
        }
        Ok(())
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.poisons() {
                warn!("encoder poisoned: {e}");
                self.state = State::Poisoned;
            }
        }
        result
    }
}

// Copyright (c) the parapng Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! End-to-end tests: encode with this crate, decode with the `png` crate,
//! and pick apart the emitted chunk and zlib structure directly.

use std::io::Read;
use std::sync::Arc;

use rand::RngCore;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;

use crate::chunk;
use crate::deflate::{CompressionLevel, Strategy};
use crate::encoder::Encoder;
use crate::error::Error;
use crate::filter::Filter;
use crate::header::{ColorType, Header};
use crate::options::{Mode, Options};

fn header(width: u32, height: u32, color: ColorType, depth: u8) -> Header {
    let mut header = Header::new();
    header.set_size(width, height).unwrap();
    header.set_color(color, depth).unwrap();
    header
}

fn encode(header: &Header, raster: &[u8], options: &Options) -> Vec<u8> {
    let mut encoder = Encoder::new(Vec::new(), options);
    encoder.write_header(header).unwrap();
    encoder.write_image_rows(raster).unwrap();
    encoder.finish().unwrap()
}

fn decode(bytes: &[u8]) -> (png::OutputInfo, Vec<u8>, Option<Vec<u8>>) {
    let mut decoder = png::Decoder::new(std::io::Cursor::new(bytes));
    decoder.set_transformations(png::Transformations::IDENTITY);
    let mut reader = decoder.read_info().unwrap();
    let mut buf = vec![0; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf).unwrap();
    let palette = reader.info().palette.as_ref().map(|p| p.to_vec());
    buf.truncate(info.buffer_size());
    (info, buf, palette)
}

struct RawChunk {
    tag: [u8; 4],
    data: Vec<u8>,
}

fn parse_chunks(bytes: &[u8]) -> Vec<RawChunk> {
    assert_eq!(&bytes[..8], &chunk::SIGNATURE, "missing PNG signature");
    let mut rest = &bytes[8..];
    let mut out = Vec::new();
    while !rest.is_empty() {
        let len = u32::from_be_bytes(rest[0..4].try_into().unwrap()) as usize;
        let tag: [u8; 4] = rest[4..8].try_into().unwrap();
        let data = rest[8..8 + len].to_vec();
        let crc = u32::from_be_bytes(rest[8 + len..12 + len].try_into().unwrap());
        assert_eq!(crc, chunk::crc32(&tag, &data), "bad CRC in {tag:?}");
        out.push(RawChunk { tag, data });
        rest = &rest[12 + len..];
    }
    out
}

fn inflate_idat(bytes: &[u8]) -> Vec<u8> {
    let mut stream = Vec::new();
    for c in parse_chunks(bytes) {
        if &c.tag == chunk::IDAT {
            stream.extend_from_slice(&c.data);
        }
    }
    let mut filtered = Vec::new();
    flate2::read::ZlibDecoder::new(&stream[..])
        .read_to_end(&mut filtered)
        .unwrap();
    filtered
}

fn pool(threads: usize) -> Arc<rayon::ThreadPool> {
    Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap(),
    )
}

// R, G and B gradients with different directions; rows differ from their
// neighbors, so adaptive filtering has something to chew on.
fn gradient_rgb(width: u32, height: u32) -> Vec<u8> {
    let mut raster = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            raster.push(((x + y) % 256) as u8);
            raster.push(((2 * x + y) % 256) as u8);
            raster.push(((x + 2 * y) % 256) as u8);
        }
    }
    raster
}

#[test]
fn one_pixel_truecolor() {
    let head = header(1, 1, ColorType::Truecolor, 8);
    let bytes = encode(&head, &[0xff, 0x00, 0x00], &Options::new());

    let chunks = parse_chunks(&bytes);
    let tags: Vec<&[u8; 4]> = chunks.iter().map(|c| &c.tag).collect();
    assert_eq!(tags, [chunk::IHDR, chunk::IDAT, chunk::IEND]);
    assert_eq!(chunks[0].data, [0, 0, 0, 1, 0, 0, 0, 1, 8, 2, 0, 0, 0]);
    assert!(chunks[2].data.is_empty());

    let (info, raster, _) = decode(&bytes);
    assert_eq!((info.width, info.height), (1, 1));
    assert_eq!(info.color_type, png::ColorType::Rgb);
    assert_eq!(raster, [0xff, 0x00, 0x00]);
}

#[test_log::test]
fn large_gradient_round_trips() {
    let head = header(1024, 768, ColorType::Truecolor, 8);
    let raster = gradient_rgb(1024, 768);
    let mut options = Options::new();
    options.set_chunk_size(200_000).unwrap();
    let bytes = encode(&head, &raster, &options);

    let (info, decoded, _) = decode(&bytes);
    assert_eq!((info.width, info.height), (1024, 768));
    assert_eq!(decoded, raster);

    // The zlib stream inside IDAT holds one filter byte per row.
    let filtered = inflate_idat(&bytes);
    assert_eq!(filtered.len(), 768 * (1 + head.stride()));
}

#[test]
fn indexed_depth4_with_palette() {
    let head = header(17, 1, ColorType::IndexedColor, 4);
    assert_eq!(head.stride(), 9);
    let palette = [0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0x7f, 0x7f, 0x7f];
    // Indices 0,1,2,0,1,2,... packed two per byte, high nibble first.
    let mut row = [0u8; 9];
    for x in 0..17 {
        let index = (x % 3) as u8;
        row[x / 2] |= index << (4 * (1 - x % 2));
    }

    let mut encoder = Encoder::new(Vec::new(), &Options::new());
    encoder.write_header(&head).unwrap();
    encoder.write_palette(&palette).unwrap();
    encoder.write_image_rows(&row).unwrap();
    let bytes = encoder.finish().unwrap();

    let tags: Vec<[u8; 4]> = parse_chunks(&bytes).iter().map(|c| c.tag).collect();
    assert_eq!(tags, [*chunk::IHDR, *chunk::PLTE, *chunk::IDAT, *chunk::IEND]);

    let (info, decoded, decoded_palette) = decode(&bytes);
    assert_eq!(info.color_type, png::ColorType::Indexed);
    assert_eq!(info.bit_depth, png::BitDepth::Four);
    assert_eq!(decoded, row);
    assert_eq!(decoded_palette.as_deref(), Some(&palette[..]));
}

#[test]
fn greyscale_alpha_sixteen_bit() {
    let head = header(2, 2, ColorType::GreyscaleAlpha, 16);
    assert_eq!(head.stride(), 8);
    // Big-endian sample then alpha, per pixel.
    let raster: Vec<u8> = vec![
        0x12, 0x34, 0xff, 0xff, 0xab, 0xcd, 0x80, 0x00, //
        0x00, 0x01, 0x00, 0x00, 0xfe, 0xdc, 0x7f, 0xff,
    ];
    let bytes = encode(&head, &raster, &Options::new());
    let (info, decoded, _) = decode(&bytes);
    assert_eq!(info.color_type, png::ColorType::GrayscaleAlpha);
    assert_eq!(info.bit_depth, png::BitDepth::Sixteen);
    assert_eq!(decoded, raster);
}

#[test]
fn greyscale_depth_one_packs_bits() {
    let head = header(9, 3, ColorType::Greyscale, 1);
    assert_eq!(head.stride(), 2);
    let raster = [0b1010_1010, 0b1000_0000, 0xff, 0x80, 0x00, 0x00];
    let bytes = encode(&head, &raster, &Options::new());
    let (info, decoded, _) = decode(&bytes);
    assert_eq!(info.bit_depth, png::BitDepth::One);
    assert_eq!(decoded, raster);
}

#[test]
fn truecolor_sixteen_bit_round_trips() {
    let head = header(3, 2, ColorType::Truecolor, 16);
    let raster: Vec<u8> = (0..head.stride() * 2).map(|i| (i * 29 % 256) as u8).collect();
    let bytes = encode(&head, &raster, &Options::new());
    let (_, decoded, _) = decode(&bytes);
    assert_eq!(decoded, raster);
}

#[test_log::test]
fn output_is_identical_across_worker_counts() {
    let head = header(640, 480, ColorType::Truecolor, 8);
    let raster = gradient_rgb(640, 480);
    let mut options = Options::new();
    options.set_chunk_size(65536).unwrap();

    let reference = encode(&head, &raster, &options);
    for threads in [1, 2, 4, 16] {
        let mut options = options.clone();
        options.set_thread_pool(pool(threads)).unwrap();
        let bytes = encode(&head, &raster, &options);
        assert_eq!(bytes, reference, "{threads} worker threads");
    }
}

#[test]
fn chunk_size_changes_bytes_but_not_pixels() {
    let head = header(300, 300, ColorType::Truecolor, 8);
    let raster = gradient_rgb(300, 300);
    for chunk_size in [32768usize, 65536, 1_000_000] {
        let mut options = Options::new();
        options.set_chunk_size(chunk_size).unwrap();
        let bytes = encode(&head, &raster, &options);
        let (_, decoded, _) = decode(&bytes);
        assert_eq!(decoded, raster, "chunk size {chunk_size}");
    }
}

#[test]
fn row_delivery_granularity_does_not_change_output() {
    let head = header(128, 64, ColorType::Truecolor, 8);
    let raster = gradient_rgb(128, 64);
    let options = Options::new();

    let all_at_once = encode(&head, &raster, &options);

    let mut encoder = Encoder::new(Vec::new(), &options);
    encoder.write_header(&head).unwrap();
    for row in raster.chunks(head.stride()) {
        encoder.write_image_rows(row).unwrap();
    }
    let row_by_row = encoder.finish().unwrap();

    assert_eq!(all_at_once, row_by_row);
}

#[test]
fn adaptive_mode_filters_gradient_rows() {
    let head = header(64, 64, ColorType::Truecolor, 8);
    let raster = gradient_rgb(64, 64);
    let bytes = encode(&head, &raster, &Options::new());

    let filtered = inflate_idat(&bytes);
    let stride = head.stride();
    let chosen: Vec<u8> = filtered.chunks(stride + 1).map(|row| row[0]).collect();
    assert_eq!(chosen.len(), 64);
    assert!(
        chosen.iter().any(|&f| f != 0),
        "adaptive filtering never chose a filter: {chosen:?}"
    );
    // Smooth gradients predict well; None should not be winning rows here.
    assert!(chosen.iter().filter(|&&f| f != 0).count() > 32);
}

#[test]
fn fixed_filter_mode_is_applied_to_every_row() {
    let head = header(32, 16, ColorType::Truecolor, 8);
    let raster = gradient_rgb(32, 16);
    let mut options = Options::new();
    options.set_filter_mode(Mode::Fixed(Filter::Up)).unwrap();
    let bytes = encode(&head, &raster, &options);

    let filtered = inflate_idat(&bytes);
    for row in filtered.chunks(head.stride() + 1) {
        assert_eq!(row[0], Filter::Up as u8);
    }
    let (_, decoded, _) = decode(&bytes);
    assert_eq!(decoded, raster);
}

#[test]
fn all_strategies_decode_identically() {
    let head = header(96, 48, ColorType::Truecolor, 8);
    let raster = gradient_rgb(96, 48);
    for strategy in [
        Strategy::Default,
        Strategy::Filtered,
        Strategy::HuffmanOnly,
        Strategy::Rle,
        Strategy::Fixed,
    ] {
        let mut options = Options::new();
        options.set_strategy_mode(Mode::Fixed(strategy)).unwrap();
        let (_, decoded, _) = decode(&encode(&head, &raster, &options));
        assert_eq!(decoded, raster, "{strategy:?}");
    }
}

#[test]
fn compression_level_sets_zlib_flevel() {
    let head = header(64, 64, ColorType::Truecolor, 8);
    let raster = gradient_rgb(64, 64);
    for (level, flg) in [
        (CompressionLevel::fast(), 0x01),
        (CompressionLevel::default(), 0x9c),
        (CompressionLevel::high(), 0xda),
    ] {
        let mut options = Options::new();
        options.set_compression_level(level).unwrap();
        let bytes = encode(&head, &raster, &options);
        let chunks = parse_chunks(&bytes);
        let idat = chunks.iter().find(|c| &c.tag == chunk::IDAT).unwrap();
        assert_eq!(idat.data[0], 0x78);
        assert_eq!(idat.data[1], flg);
        let (_, decoded, _) = decode(&bytes);
        assert_eq!(decoded, raster);
    }
}

#[test]
fn buffered_mode_emits_a_single_idat() {
    let mut raster = vec![0u8; 512 * 512 * 4];
    XorShiftRng::seed_from_u64(0x5eed).fill_bytes(&mut raster);
    let head = header(512, 512, ColorType::TruecolorAlpha, 8);

    let mut options = Options::new();
    options.set_streaming(false).unwrap();
    let bytes = encode(&head, &raster, &options);
    let idats = parse_chunks(&bytes)
        .iter()
        .filter(|c| &c.tag == chunk::IDAT)
        .count();
    assert_eq!(idats, 1);

    // Streaming mode splits the same stream across several IDAT chunks;
    // random data does not compress, so the soft cap is passed many times.
    options.set_streaming(true).unwrap();
    let streamed = encode(&head, &raster, &options);
    let idats = parse_chunks(&streamed)
        .iter()
        .filter(|c| &c.tag == chunk::IDAT)
        .count();
    assert!(idats > 1, "expected multiple IDAT chunks, got {idats}");

    assert_eq!(decode(&bytes).1, raster);
    assert_eq!(decode(&streamed).1, raster);
}

#[test]
fn greyscale_transparency_chunk_round_trips() {
    let head = header(2, 2, ColorType::Greyscale, 8);
    let mut encoder = Encoder::new(Vec::new(), &Options::new());
    encoder.write_header(&head).unwrap();
    encoder.write_transparency(&[0, 42]).unwrap();
    encoder.write_image_rows(&[1, 2, 42, 4]).unwrap();
    let bytes = encoder.finish().unwrap();

    let mut decoder = png::Decoder::new(std::io::Cursor::new(&bytes[..]));
    decoder.set_transformations(png::Transformations::IDENTITY);
    let reader = decoder.read_info().unwrap();
    assert_eq!(reader.info().trns.as_deref(), Some(&[0u8, 42][..]));
}

// A slow sink keeps the reassembler busy while workers race ahead; the
// in-flight cap has to hold the line instead of memory.
#[test_log::test]
fn slow_sink_backpressure_completes() {
    struct SleepySink(Vec<u8>);

    impl std::io::Write for SleepySink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            std::thread::sleep(std::time::Duration::from_micros(200));
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let head = header(4096, 96, ColorType::Truecolor, 8);
    let raster = gradient_rgb(4096, 96);
    let mut options = Options::new();
    options.set_chunk_size(32768).unwrap();
    options.set_thread_pool(pool(2)).unwrap();

    let mut encoder = Encoder::new(SleepySink(Vec::new()), &options);
    encoder.write_header(&head).unwrap();
    encoder.write_image_rows(&raster).unwrap();
    let sink = encoder.finish().unwrap();

    let (_, decoded, _) = decode(&sink.0);
    assert_eq!(decoded, raster);
}

#[test]
fn wrong_length_then_correct_call_succeeds() {
    let head = header(16, 4, ColorType::Truecolor, 8);
    let raster = gradient_rgb(16, 4);
    let mut encoder = Encoder::new(Vec::new(), &Options::new());
    encoder.write_header(&head).unwrap();
    let stride = head.stride();
    assert!(matches!(
        encoder.write_image_rows(&raster[..stride + 1]),
        Err(Error::PartialRow(..))
    ));
    encoder.write_image_rows(&raster).unwrap();
    let bytes = encoder.finish().unwrap();
    assert_eq!(decode(&bytes).1, raster);
}

#[test]
fn shared_pool_outlives_several_encoders() {
    let shared = pool(3);
    let head = header(64, 16, ColorType::Truecolor, 8);
    let raster = gradient_rgb(64, 16);
    let mut options = Options::new();
    options.set_thread_pool(Arc::clone(&shared)).unwrap();

    let first = encode(&head, &raster, &options);
    let second = encode(&head, &raster, &options);
    assert_eq!(first, second);
    assert_eq!(Arc::strong_count(&shared), 2);
}

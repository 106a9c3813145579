// Copyright (c) the parapng Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Adler-32 checksums over filtered row data.
//!
//! Each row group is checksummed by the worker that filtered it; the
//! reassembler folds the per-group values together with [`combine`] instead
//! of rescanning bytes, so the zlib trailer can be produced without ever
//! holding the whole filtered stream.

use simd_adler32::Adler32;

/// The checksum of the empty byte sequence.
pub const INITIAL: u32 = 1;

const BASE: u64 = 65521;

pub fn checksum(data: &[u8]) -> u32 {
    let mut adler = Adler32::new();
    adler.write(data);
    adler.finish()
}

/// Computes the Adler-32 of the concatenation of `A` and `B` given the
/// checksums of the two parts and the length of `B`.
///
/// Port of zlib's `adler32_combine`: the low sum of the concatenation is
/// `s1(A) + s1(B) - 1`, and the high sum picks up `len(B)` copies of
/// `s1(A)`, all modulo 65521.
pub fn combine(adler1: u32, adler2: u32, len2: u64) -> u32 {
    let rem = len2 % BASE;
    let mut sum1 = u64::from(adler1 & 0xffff);
    let mut sum2 = (rem * sum1) % BASE;
    sum1 += u64::from(adler2 & 0xffff) + BASE - 1;
    sum2 += u64::from((adler1 >> 16) & 0xffff) + u64::from((adler2 >> 16) & 0xffff) + BASE - rem;
    if sum1 >= BASE {
        sum1 -= BASE;
    }
    if sum1 >= BASE {
        sum1 -= BASE;
    }
    if sum2 >= BASE << 1 {
        sum2 -= BASE << 1;
    }
    if sum2 >= BASE {
        sum2 -= BASE;
    }
    (sum1 | (sum2 << 16)) as u32
}

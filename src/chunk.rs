// Copyright (c) the parapng Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! PNG chunk framing: big-endian length, four-byte type, payload, and a
//! CRC-32 over type plus payload.

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::{Error, Result};

/// The eight-byte file signature every PNG stream starts with.
pub const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// Chunk payloads are limited to 2^31 - 1 bytes.
pub const MAX_CHUNK_DATA: usize = 0x7fff_ffff;

pub const IHDR: &[u8; 4] = b"IHDR";
pub const PLTE: &[u8; 4] = b"PLTE";
pub const TRNS: &[u8; 4] = b"tRNS";
pub const IDAT: &[u8; 4] = b"IDAT";
pub const IEND: &[u8; 4] = b"IEND";

const PNG_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub(crate) fn crc32(tag: &[u8; 4], data: &[u8]) -> u32 {
    let mut digest = PNG_CRC.digest();
    digest.update(tag);
    digest.update(data);
    digest.finalize()
}

pub(crate) fn write_signature<W: Write>(w: &mut W) -> Result<()> {
    w.write_all(&SIGNATURE)?;
    Ok(())
}

pub(crate) fn write_chunk<W: Write>(w: &mut W, tag: &[u8; 4], data: &[u8]) -> Result<()> {
    if data.len() > MAX_CHUNK_DATA {
        return Err(Error::ChunkTooLarge(data.len()));
    }
    w.write_u32::<BigEndian>(data.len() as u32)?;
    w.write_all(tag)?;
    w.write_all(data)?;
    w.write_u32::<BigEndian>(crc32(tag, data))?;
    Ok(())
}

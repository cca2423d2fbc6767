/*
sparseconv, to convert between raw and Android sparse images: format module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

// Logic to interact with Android Sparse Image
// # Android sparse img format
// # From https://android.googlesource.com/\
// # platform/system/core/+/master/libsparse/sparse_format.h
// 0		lelong	0xed26ff3a		Android sparse image
// >4		leshort	x			\b, version: %d
// >6		leshort	x			\b.%d
// >16		lelong	x			\b, Total of %d
// >12		lelong	x			\b %d-byte output blocks in
// >20		lelong	x			\b %d input chunks.

use std::{fmt::Display, io::{Read, Write}};

use serde::Serialize;

/* These values are always the same for any images we write */

pub(crate) const MAGIC: u32 = 0xed26ff3a;
pub(crate) const MAJOR_VERSION: u16 = 1;
pub(crate) const MINOR_VERSION: u16 = 0;

pub(crate) const SIZE_HEADER: usize = 28;
pub(crate) const SIZE_CHUNK_HEADER: usize = 12;
/// Payload of a fill chunk, and of a CRC32 chunk
pub(crate) const SIZE_FILL: usize = 4;

/// Block size used when compressing, images from other tools may differ
pub(crate) const BLOCK_SIZE: usize = 0x10000;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum SparseError {
    #[error("magic is not 0x{magic:08x}", magic = MAGIC)]
    InvalidMagic,
    #[error("unsupported version {major}.{minor}")]
    UnsupportedVersion {
        major: u16,
        minor: u16,
    },
    #[error("header sizes {file_header}/{chunk_header} smaller than {min_file}/{min_chunk}",
        min_file = SIZE_HEADER, min_chunk = SIZE_CHUNK_HEADER)]
    InvalidHeaderSize {
        file_header: u16,
        chunk_header: u16,
    },
    #[error("block size {block_size} is not a non-zero multiple of {word}", word = SIZE_FILL)]
    InvalidBlockSize {
        block_size: u32,
    },
    #[error("invalid chunk type 0x{chunk_type:04x} for chunk {index}")]
    InvalidChunkType {
        index: u32,
        chunk_type: RawChunkType,
    },
}

pub(crate) type RawChunkType = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) enum ChunkType {
    Raw,
    Fill,
    DontCare,
    Crc32,
}

impl ChunkType {
    pub(crate) fn raw_value(&self) -> RawChunkType {
        match self {
            ChunkType::Raw => 0xcac1,
            ChunkType::Fill => 0xcac2,
            ChunkType::DontCare => 0xcac3,
            ChunkType::Crc32 => 0xcac4,
        }
    }
}

impl TryFrom<RawChunkType> for ChunkType {
    /// The unknown value is handed back
    type Error = RawChunkType;

    fn try_from(value: RawChunkType) -> Result<Self, Self::Error> {
        match value {
            0xcac1 => Ok(Self::Raw),
            0xcac2 => Ok(Self::Fill),
            0xcac3 => Ok(Self::DontCare),
            0xcac4 => Ok(Self::Crc32),
            _ => Err(value),
        }
    }
}

impl Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}",
            match self {
                ChunkType::Raw => "raw",
                ChunkType::Fill => "fill",
                ChunkType::DontCare => "don't care",
                ChunkType::Crc32 => "crc32",
            }
        )
    }
}

fn u16_at(buffer: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buffer[offset], buffer[offset + 1]])
}

fn u32_at(buffer: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buffer[offset], buffer[offset + 1],
        buffer[offset + 2], buffer[offset + 3]])
}

fn put_u16(buffer: &mut [u8], offset: usize, value: u16) {
    buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes())
}

fn put_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes())
}

/// The 28-byte image header at the start of every sparse file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Header {
    pub(crate) magic: u32,
    pub(crate) major_version: u16,
    pub(crate) minor_version: u16,
    pub(crate) file_header_size: u16,
    pub(crate) chunk_header_size: u16,
    pub(crate) block_size: u32,
    pub(crate) total_blocks: u32,
    pub(crate) total_chunks: u32,
    pub(crate) image_checksum: u32,
}

impl Header {
    pub(crate) fn new(block_size: u32, total_blocks: u32, total_chunks: u32)
        -> Self
    {
        Self {
            magic: MAGIC,
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            file_header_size: SIZE_HEADER as u16,
            chunk_header_size: SIZE_CHUNK_HEADER as u16,
            block_size,
            total_blocks,
            total_chunks,
            image_checksum: 0,
        }
    }

    /// Returns `None` if the magic does not match, no other field is checked
    pub(crate) fn from_bytes(buffer: &[u8; SIZE_HEADER]) -> Option<Self> {
        let magic = u32_at(buffer, 0);
        if magic != MAGIC {
            return None
        }
        Some(Self {
            magic,
            major_version: u16_at(buffer, 4),
            minor_version: u16_at(buffer, 6),
            file_header_size: u16_at(buffer, 8),
            chunk_header_size: u16_at(buffer, 10),
            block_size: u32_at(buffer, 12),
            total_blocks: u32_at(buffer, 16),
            total_chunks: u32_at(buffer, 20),
            image_checksum: u32_at(buffer, 24),
        })
    }

    pub(crate) fn to_bytes(&self) -> [u8; SIZE_HEADER] {
        let mut buffer = [0; SIZE_HEADER];
        put_u32(&mut buffer, 0, self.magic);
        put_u16(&mut buffer, 4, self.major_version);
        put_u16(&mut buffer, 6, self.minor_version);
        put_u16(&mut buffer, 8, SIZE_HEADER as u16);
        put_u16(&mut buffer, 10, SIZE_CHUNK_HEADER as u16);
        put_u32(&mut buffer, 12, self.block_size);
        put_u32(&mut buffer, 16, self.total_blocks);
        put_u32(&mut buffer, 20, self.total_chunks);
        put_u32(&mut buffer, 24, self.image_checksum);
        buffer
    }

    pub(crate) fn try_read<R: Read>(reader: &mut R) -> std::io::Result<Option<Self>> {
        let mut buffer = [0; SIZE_HEADER];
        reader.read_exact(&mut buffer)?;
        Ok(Self::from_bytes(&buffer))
    }

    pub(crate) fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    /// Size of the image once unsparsed
    pub(crate) fn total_size(&self) -> u64 {
        self.total_blocks as u64 * self.block_size as u64
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Android sparse image v{}.{}, {} blocks of {} bytes in {} chunks",
            self.major_version, self.minor_version, self.total_blocks,
            self.block_size, self.total_chunks)
    }
}

/// The 12-byte record before each chunk payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkHeader {
    pub(crate) chunk_type: RawChunkType,
    pub(crate) reserved: u16,
    /// In blocks
    pub(crate) chunk_size: u32,
    /// In bytes, this header included
    pub(crate) total_size: u32,
}

impl ChunkHeader {
    pub(crate) fn new(chunk_type: ChunkType, chunk_size: u32, payload: u32)
        -> Self
    {
        Self {
            chunk_type: chunk_type.raw_value(),
            reserved: 0,
            chunk_size,
            total_size: SIZE_CHUNK_HEADER as u32 + payload,
        }
    }

    pub(crate) fn from_bytes(buffer: &[u8; SIZE_CHUNK_HEADER]) -> Self {
        Self {
            chunk_type: u16_at(buffer, 0),
            reserved: u16_at(buffer, 2),
            chunk_size: u32_at(buffer, 4),
            total_size: u32_at(buffer, 8),
        }
    }

    pub(crate) fn to_bytes(&self) -> [u8; SIZE_CHUNK_HEADER] {
        let mut buffer = [0; SIZE_CHUNK_HEADER];
        put_u16(&mut buffer, 0, self.chunk_type);
        put_u16(&mut buffer, 2, self.reserved);
        put_u32(&mut buffer, 4, self.chunk_size);
        put_u32(&mut buffer, 8, self.total_size);
        buffer
    }

    /// The type is not checked here, see [`ChunkType::try_from`]
    pub(crate) fn read<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut buffer = [0; SIZE_CHUNK_HEADER];
        reader.read_exact(&mut buffer)?;
        Ok(Self::from_bytes(&buffer))
    }

    pub(crate) fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.to_bytes())
    }
}

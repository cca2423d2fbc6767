/*
sparseconv, to convert between raw and Android sparse images: compression module
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

use std::{fs::File, io::{BufWriter, Read, Seek, SeekFrom, Write}, path::{Path, PathBuf}};

use indicatif::ProgressBar;
use tracing::{debug, error, info};

use crate::{progress::{progress_bar_with_template, TEMPLATE_BLOCKS},
    sparse::{ChunkHeader, ChunkType, Header, BLOCK_SIZE, SIZE_CHUNK_HEADER,
        SIZE_FILL, SIZE_HEADER},
    Error, Result};

/// Header, a leading and a trailing don't care chunk, and one raw block
pub(crate) const MIN_OUTPUT_SIZE: u64 =
    (SIZE_HEADER + 3 * SIZE_CHUNK_HEADER + BLOCK_SIZE) as u64;

/// Room needed before taking another block: its chunk header and data, plus
/// the trailing don't care chunk
const SEGMENT_RESERVE: u64 = (2 * SIZE_CHUNK_HEADER + BLOCK_SIZE) as u64;

/// Total size of a raw chunk must fit in u32
const MAX_RAW_BLOCKS: usize = (u32::MAX as usize - SIZE_CHUNK_HEADER) / BLOCK_SIZE;

/// Whether another segment file is needed after this one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Segment {
    Final,
    Continued,
}

/// The 4-byte pattern the whole block repeats, if any
///
/// # Panics
/// If the block length is not a multiple of 4, which would be a bug since
/// the block size is fixed.
pub(crate) fn fill_pattern(block: &[u8]) -> Option<[u8; SIZE_FILL]> {
    assert!(block.len() % SIZE_FILL == 0,
        "Block length {} is not a multiple of {}", block.len(), SIZE_FILL);
    let pattern: [u8; SIZE_FILL] = block.get(..SIZE_FILL)?.try_into().ok()?;
    block.chunks_exact(SIZE_FILL)
        .all(|word| word == &pattern[..])
        .then_some(pattern)
}

/// A complete chunk, ready to be written
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Chunk {
    Raw (Vec<u8>),
    Fill {
        pattern: [u8; SIZE_FILL],
        blocks: u32,
    },
    DontCare {
        blocks: u32,
    },
}

impl Chunk {
    fn header(&self) -> ChunkHeader {
        match self {
            Chunk::Raw(data) => ChunkHeader::new(ChunkType::Raw,
                (data.len() / BLOCK_SIZE) as u32, data.len() as u32),
            Chunk::Fill { blocks, .. } => ChunkHeader::new(ChunkType::Fill,
                *blocks, SIZE_FILL as u32),
            Chunk::DontCare { blocks } => ChunkHeader::new(ChunkType::DontCare,
                *blocks, 0),
        }
    }

    fn write<W: Write>(&self, writer: &mut W) -> Result<ChunkHeader> {
        let header = self.header();
        header.write(writer)?;
        match self {
            Chunk::Raw(data) => writer.write_all(data)?,
            Chunk::Fill { pattern, .. } => writer.write_all(pattern)?,
            Chunk::DontCare { .. } => (),
        }
        Ok(header)
    }
}

/// The chunk still being built, at most one is open at any time
#[derive(Debug, Default)]
enum Accumulator {
    #[default]
    Idle,
    Raw (Vec<u8>),
    Fill {
        pattern: [u8; SIZE_FILL],
        blocks: u32,
    },
}

impl Accumulator {
    /// Bytes the open chunk will take once written
    fn pending_size(&self) -> u64 {
        match self {
            Accumulator::Idle => 0,
            Accumulator::Raw(data) => (SIZE_CHUNK_HEADER + data.len()) as u64,
            Accumulator::Fill { .. } => (SIZE_CHUNK_HEADER + SIZE_FILL) as u64,
        }
    }

    /// Take in one block, returning the chunk it closed, if any
    fn push(&mut self, block: &[u8]) -> Option<Chunk> {
        let (next, flushed) = match (std::mem::take(self), fill_pattern(block)) {
            (Self::Idle, Some(pattern)) =>
                (Self::Fill { pattern, blocks: 1 }, None),
            (Self::Idle, None) =>
                (Self::Raw(block.to_vec()), None),
            (Self::Fill { pattern, blocks }, Some(current))
                if pattern == current =>
                (Self::Fill { pattern, blocks: blocks + 1 }, None),
            (Self::Fill { pattern, blocks }, Some(current)) =>
                (Self::Fill { pattern: current, blocks: 1 },
                    Some(Chunk::Fill { pattern, blocks })),
            (Self::Fill { pattern, blocks }, None) =>
                (Self::Raw(block.to_vec()), Some(Chunk::Fill { pattern, blocks })),
            (Self::Raw(mut data), None)
                if data.len() < MAX_RAW_BLOCKS * BLOCK_SIZE =>
            {
                data.extend_from_slice(block);
                (Self::Raw(data), None)
            },
            (Self::Raw(data), None) =>
                (Self::Raw(block.to_vec()), Some(Chunk::Raw(data))),
            (Self::Raw(data), Some(pattern)) =>
                (Self::Fill { pattern, blocks: 1 }, Some(Chunk::Raw(data))),
        };
        *self = next;
        flushed
    }

    /// Close whatever is open, an idle accumulator still gives an empty fill
    fn finish(self) -> Chunk {
        match self {
            Accumulator::Idle => Chunk::Fill { pattern: [0; SIZE_FILL], blocks: 0 },
            Accumulator::Raw(data) => Chunk::Raw(data),
            Accumulator::Fill { pattern, blocks } => Chunk::Fill { pattern, blocks },
        }
    }
}

/// Tracks what went into the segment file being written
struct SegmentWriter<'a, W> {
    output: &'a mut W,
    size: u64,
    chunks: u32,
}

impl<'a, W: Write> SegmentWriter<'a, W> {
    fn new(output: &'a mut W) -> Self {
        Self { output, size: SIZE_HEADER as u64, chunks: 0 }
    }

    fn emit(&mut self, chunk: &Chunk) -> Result<()> {
        let header = chunk.write(&mut *self.output)?;
        debug!("Chunk {}: type 0x{:04x}, {} blocks, {} bytes",
            self.chunks, header.chunk_type, header.chunk_size, header.total_size);
        self.size += header.total_size as u64;
        self.chunks += 1;
        Ok(())
    }
}

pub(crate) fn check_output_limit(max_output_size: u64) -> Result<()> {
    if max_output_size < MIN_OUTPUT_SIZE {
        error!("Maximum sparse size {} is smaller than the minimum {}",
            max_output_size, MIN_OUTPUT_SIZE);
        return Err(Error::ConfigurationError {
            limit: max_output_size, minimum: MIN_OUTPUT_SIZE })
    }
    Ok(())
}

fn check_image_length(length: u64) -> Result<()> {
    if length % BLOCK_SIZE as u64 != 0 {
        error!("Image size {} is not a multiple of {} bytes", length, BLOCK_SIZE);
        return Err(Error::UnalignedImage { length, block_size: BLOCK_SIZE })
    }
    if length / BLOCK_SIZE as u64 > u32::MAX as u64 {
        return Err(Error::ImageTooLarge { length, max_blocks: u32::MAX })
    }
    Ok(())
}

fn blocks_of(bytes: u64) -> u32 {
    (bytes / BLOCK_SIZE as u64) as u32
}

/// Splits one raw image into sparse segments, each no larger than
/// `max_output_size`. The read position of the input is where the next
/// segment starts.
pub(crate) struct Compressor<R> {
    input: R,
    length: u64,
    max_output_size: u64,
    progress: ProgressBar,
}

impl<R: Read + Seek> Compressor<R> {
    pub(crate) fn new(mut input: R, max_output_size: u64) -> Result<Self> {
        check_output_limit(max_output_size)?;
        let length = input.seek(SeekFrom::End(0))?;
        input.seek(SeekFrom::Start(0))?;
        check_image_length(length)?;
        Ok(Self {
            input,
            length,
            max_output_size,
            progress: ProgressBar::hidden(),
        })
    }

    pub(crate) fn with_progress(self, progress: ProgressBar) -> Self {
        Self { progress, ..self }
    }

    pub(crate) fn total_blocks(&self) -> u32 {
        blocks_of(self.length)
    }

    /// Write one segment into `output`, which should be empty
    pub(crate) fn encode_segment<W: Write + Seek>(&mut self, output: &mut W)
        -> Result<Segment>
    {
        let mut cursor = self.input.stream_position()?;
        let start = cursor;
        // Header goes last, once the chunk count is known
        output.seek(SeekFrom::Start(SIZE_HEADER as u64))?;
        let mut writer = SegmentWriter::new(output);
        if cursor != 0 {
            writer.emit(&Chunk::DontCare { blocks: blocks_of(cursor) })?;
        }
        let mut accumulator = Accumulator::default();
        let mut block = vec![0; BLOCK_SIZE];
        while cursor < self.length &&
            writer.size + accumulator.pending_size() + SEGMENT_RESERVE
                <= self.max_output_size
        {
            self.input.read_exact(&mut block)?;
            cursor += BLOCK_SIZE as u64;
            if let Some(chunk) = accumulator.push(&block) {
                writer.emit(&chunk)?
            }
            self.progress.inc(1);
        }
        writer.emit(&accumulator.finish())?;
        let segment = if cursor == self.length {
            Segment::Final
        } else {
            writer.emit(&Chunk::DontCare { blocks: blocks_of(self.length - cursor) })?;
            Segment::Continued
        };
        let (size, chunks) = (writer.size, writer.chunks);
        output.seek(SeekFrom::Start(0))?;
        Header::new(BLOCK_SIZE as u32, self.total_blocks(), chunks).write(output)?;
        output.flush()?;
        debug!("Segment covers blocks {}..{} in {} chunks, {} bytes",
            blocks_of(start), blocks_of(cursor), chunks, size);
        Ok(segment)
    }
}

/// Compress `image` into `<outdir>/<image name>_sparsechunk1`, `2`, ...
pub(crate) fn compress<P1, P2>(image: P1, outdir: P2, max_output_size: u64)
    -> Result<Vec<PathBuf>>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>
{
    let image = image.as_ref();
    let outdir = outdir.as_ref();
    check_output_limit(max_output_size)?;
    let name = match image.file_name() {
        Some(name) => name.to_string_lossy(),
        None => return Err(Error::open(image, std::io::Error::new(
            std::io::ErrorKind::InvalidInput, "path has no file name"))),
    };
    let input = File::open(image).map_err(|e|Error::open(image, e))?;
    let mut compressor = Compressor::new(input, max_output_size)?;
    if ! outdir.is_dir() {
        error!("Output directory '{}' does not exist", outdir.display());
        return Err(Error::MissingOutputDir(outdir.into()))
    }
    let progress_bar = progress_bar_with_template(
        compressor.total_blocks().into(), TEMPLATE_BLOCKS)?;
    compressor = compressor.with_progress(progress_bar.clone());
    let mut paths = Vec::new();
    for index in 1.. {
        let path = outdir.join(format!("{}_sparsechunk{}", name, index));
        progress_bar.suspend(||info!("Writing: {}", path.display()));
        progress_bar.set_message(format!("sparsechunk{}", index));
        let file = File::create(&path).map_err(|e|Error::open(&path, e))?;
        let mut output = BufWriter::new(file);
        let segment = compressor.encode_segment(&mut output)?;
        output.into_inner().map_err(|e|e.into_error())?;
        paths.push(path);
        if segment == Segment::Final {
            break
        }
    }
    progress_bar.finish_and_clear();
    Ok(paths)
}

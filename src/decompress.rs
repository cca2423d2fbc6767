/*
sparseconv, to convert between raw and Android sparse images: decompression module
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

use std::{fs::File, io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write}, path::{Path, PathBuf}};

use indicatif::ProgressBar;
use tracing::{debug, error, info};

use crate::{progress::{progress_bar_with_template, TEMPLATE_CHUNKS},
    sparse::{ChunkHeader, ChunkType, Header, SparseError, BLOCK_SIZE,
        MAJOR_VERSION, SIZE_CHUNK_HEADER, SIZE_FILL, SIZE_HEADER},
    Error, Result};

/// Receives the chunks of a sparse file in order, see [`walk_segment`]
pub(crate) trait ChunkSink {
    /// Called once the header of a segment is read and valid
    fn begin(&mut self, _header: &Header) -> Result<()> {
        Ok(())
    }

    /// `data` yields at most `length` bytes, what is left unread is skipped
    fn raw(&mut self, chunk: &ChunkHeader, data: &mut dyn Read, length: u64)
        -> Result<()>;

    fn fill(&mut self, chunk: &ChunkHeader, pattern: [u8; SIZE_FILL], length: u64)
        -> Result<()>;

    fn dont_care(&mut self, chunk: &ChunkHeader, length: u64) -> Result<()>;

    fn crc32(&mut self, chunk: &ChunkHeader, checksum: u32) -> Result<()>;
}

fn unexpected_eof() -> Error {
    io::Error::from(io::ErrorKind::UnexpectedEof).into()
}

fn skip<R: Read>(reader: &mut R, length: u64) -> Result<()> {
    if length == 0 {
        return Ok(())
    }
    if io::copy(&mut reader.by_ref().take(length), &mut io::sink())? < length {
        return Err(unexpected_eof())
    }
    Ok(())
}

fn validate(header: &Header) -> Result<()> {
    if header.major_version != MAJOR_VERSION {
        error!("Sparse image version {}.{} is not supported",
            header.major_version, header.minor_version);
        return Err(SparseError::UnsupportedVersion {
            major: header.major_version, minor: header.minor_version }.into())
    }
    if (header.file_header_size as usize) < SIZE_HEADER ||
        (header.chunk_header_size as usize) < SIZE_CHUNK_HEADER
    {
        return Err(SparseError::InvalidHeaderSize {
            file_header: header.file_header_size,
            chunk_header: header.chunk_header_size }.into())
    }
    if header.block_size == 0 || header.block_size as usize % SIZE_FILL != 0 {
        return Err(SparseError::InvalidBlockSize {
            block_size: header.block_size }.into())
    }
    Ok(())
}

/// Read the header and all chunks of one sparse file, handing each chunk to
/// `sink`
pub(crate) fn walk_segment<R, S>(input: &mut R, sink: &mut S, progress: &ProgressBar)
    -> Result<Header>
where
    R: Read,
    S: ChunkSink,
{
    let header = match Header::try_read(input)? {
        Some(header) => header,
        None => {
            error!("Sparse image magic invalid");
            return Err(SparseError::InvalidMagic.into())
        },
    };
    validate(&header)?;
    debug!("{}", header);
    skip(input, (header.file_header_size as usize - SIZE_HEADER) as u64)?;
    let excess_chunk_header =
        (header.chunk_header_size as usize - SIZE_CHUNK_HEADER) as u64;
    sink.begin(&header)?;
    progress.set_length(header.total_chunks.into());
    progress.set_position(0);
    for index in 0..header.total_chunks {
        let chunk = ChunkHeader::read(input)?;
        skip(input, excess_chunk_header)?;
        let chunk_type = ChunkType::try_from(chunk.chunk_type)
            .map_err(|chunk_type|{
                error!("Chunk {} has invalid type 0x{:04x}", index, chunk_type);
                SparseError::InvalidChunkType { index, chunk_type }
            })?;
        let length = chunk.chunk_size as u64 * header.block_size as u64;
        debug!("Chunk {}: {}, {} blocks, {} bytes", index, chunk_type,
            chunk.chunk_size, chunk.total_size);
        match chunk_type {
            ChunkType::Raw => {
                let mut data = input.by_ref().take(length);
                sink.raw(&chunk, &mut data, length)?;
                io::copy(&mut data, &mut io::sink())?;
                if data.limit() > 0 {
                    return Err(unexpected_eof())
                }
            },
            ChunkType::Fill => {
                let mut pattern = [0; SIZE_FILL];
                input.read_exact(&mut pattern)?;
                sink.fill(&chunk, pattern, length)?
            },
            ChunkType::DontCare => sink.dont_care(&chunk, length)?,
            ChunkType::Crc32 => {
                let mut checksum = [0; SIZE_FILL];
                input.read_exact(&mut checksum)?;
                sink.crc32(&chunk, u32::from_le_bytes(checksum))?
            },
        }
        progress.inc(1);
    }
    Ok(header)
}

/// Writes chunks back at their offsets in the raw image. Every segment starts
/// from offset 0, as later segments lead with a don't care chunk covering
/// what came before.
pub(crate) struct Unsparser<'a, W> {
    output: &'a mut W,
    position: u64,
}

impl<'a, W: Write + Seek> Unsparser<'a, W> {
    pub(crate) fn new(output: &'a mut W) -> Self {
        Self { output, position: 0 }
    }
}

impl<W: Write + Seek> ChunkSink for Unsparser<'_, W> {
    fn begin(&mut self, _header: &Header) -> Result<()> {
        self.position = self.output.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn raw(&mut self, _chunk: &ChunkHeader, data: &mut dyn Read, length: u64)
        -> Result<()>
    {
        if io::copy(data, &mut *self.output)? < length {
            return Err(unexpected_eof())
        }
        self.position += length;
        Ok(())
    }

    fn fill(&mut self, _chunk: &ChunkHeader, pattern: [u8; SIZE_FILL], length: u64)
        -> Result<()>
    {
        let tile = pattern.repeat(BLOCK_SIZE / SIZE_FILL);
        let mut remaining = length;
        while remaining > 0 {
            let size = remaining.min(tile.len() as u64) as usize;
            self.output.write_all(&tile[..size])?;
            remaining -= size as u64;
        }
        self.position += length;
        Ok(())
    }

    /// Skipped, what the output holds there is left as is
    fn dont_care(&mut self, _chunk: &ChunkHeader, length: u64) -> Result<()> {
        self.position += length;
        self.output.seek(SeekFrom::Start(self.position))?;
        Ok(())
    }

    /// Not verified
    fn crc32(&mut self, _chunk: &ChunkHeader, checksum: u32) -> Result<()> {
        debug!("Ignoring CRC32 0x{:08x}", checksum);
        Ok(())
    }
}

/// Decode one sparse file into `output`
pub(crate) fn decode_segment<R, W>(input: &mut R, output: &mut W, progress: &ProgressBar)
    -> Result<Header>
where
    R: Read,
    W: Write + Seek,
{
    let mut unsparser = Unsparser::new(output);
    walk_segment(input, &mut unsparser, progress)
}

/// `first` followed by every existing file whose name counts up from its
/// trailing number, e.g. `a_sparsechunk1`, `a_sparsechunk2`, ...
pub(crate) fn sparse_list<P: AsRef<Path>>(first: P) -> Vec<PathBuf> {
    let first = first.as_ref();
    let mut list = vec![first.to_path_buf()];
    let Some(name) = first.file_name().and_then(|name|name.to_str()) else {
        return list
    };
    let prefix = name.trim_end_matches(|c: char|c.is_ascii_digit());
    let Ok(mut index) = name[prefix.len()..].parse::<u64>() else {
        return list
    };
    while let Some(next) = index.checked_add(1) {
        let path = first.with_file_name(format!("{}{}", prefix, next));
        if ! path.exists() {
            break
        }
        list.push(path);
        index = next;
    }
    list
}

/// Decompress `first` and the segments following it into a new file at
/// `output`
pub(crate) fn decompress<P1, P2>(first: P1, output: P2) -> Result<()>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>
{
    let segments = sparse_list(first);
    let output = output.as_ref();
    let file = File::create(output).map_err(|e|Error::open(output, e))?;
    info!("Output: {}", output.display());
    let mut writer = BufWriter::new(file);
    let progress_bar = progress_bar_with_template(0, TEMPLATE_CHUNKS)?;
    let mut total_size = 0;
    for path in segments.iter() {
        progress_bar.suspend(||info!("Processing: {}", path.display()));
        if let Some(name) = path.file_name() {
            progress_bar.set_message(name.to_string_lossy().into_owned());
        }
        let file = File::open(path).map_err(|e|Error::open(path, e))?;
        let mut input = BufReader::new(file);
        let header = decode_segment(&mut input, &mut writer, &progress_bar)?;
        total_size = total_size.max(header.total_size());
    }
    progress_bar.finish_and_clear();
    let file = writer.into_inner().map_err(|e|e.into_error())?;
    // A trailing don't care chunk only seeks
    if file.metadata()?.len() < total_size {
        file.set_len(total_size)?
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::compress::{tests::{compress_to_segments, fill_block, noise_block},
        MIN_OUTPUT_SIZE};

    use super::*;

    /// A sparse file by hand, with a small block size
    fn craft(block_size: u32, total_blocks: u32, chunks: &[(ChunkHeader, Vec<u8>)])
        -> Vec<u8>
    {
        let mut buffer = Vec::new();
        Header::new(block_size, total_blocks, chunks.len() as u32)
            .write(&mut buffer).unwrap();
        for (chunk, payload) in chunks.iter() {
            chunk.write(&mut buffer).unwrap();
            buffer.extend_from_slice(payload);
        }
        buffer
    }

    fn mixed_image() -> Vec<u8> {
        [noise_block(0), fill_block([0; 4]), fill_block([0; 4]), noise_block(1),
            noise_block(2), fill_block([0xff; 4]), fill_block([1, 2, 3, 4]),
            noise_block(3)].concat()
    }

    fn decode_all(segments: &[Vec<u8>]) -> Vec<u8> {
        let mut output = Cursor::new(Vec::new());
        for segment in segments.iter() {
            decode_segment(&mut Cursor::new(segment), &mut output, &ProgressBar::hidden())
                .unwrap();
        }
        output.into_inner()
    }

    #[test]
    fn round_trip_single_segment() {
        let image = mixed_image();
        let segments = compress_to_segments(&image, 64 << 20);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].len() < image.len());
        assert_eq!(decode_all(&segments), image);
    }

    #[test]
    fn round_trip_split_segments() {
        let image = mixed_image();
        for limit in [MIN_OUTPUT_SIZE, MIN_OUTPUT_SIZE + 1,
            2 * BLOCK_SIZE as u64 + 64, 3 * BLOCK_SIZE as u64]
        {
            let segments = compress_to_segments(&image, limit);
            assert!(segments.len() > 1);
            assert_eq!(decode_all(&segments), image, "limit {}", limit);
        }
    }

    #[test]
    fn round_trip_minimum_limit_one_block_each() {
        let image = mixed_image();
        let segments = compress_to_segments(&image, MIN_OUTPUT_SIZE);
        assert_eq!(segments.len(), image.len() / BLOCK_SIZE);
        assert_eq!(decode_all(&segments), image);
    }

    #[test]
    fn round_trip_empty() {
        let segments = compress_to_segments(&[], MIN_OUTPUT_SIZE);
        assert_eq!(decode_all(&segments), Vec::<u8>::new());
    }

    #[test]
    fn bad_magic_writes_nothing() {
        let mut input = craft(16, 1, &[
            (ChunkHeader::new(ChunkType::Fill, 1, 4), vec![1, 1, 1, 1])]);
        input[..4].fill(0);
        let mut output = Cursor::new(Vec::new());
        let result = decode_segment(&mut Cursor::new(&input), &mut output,
            &ProgressBar::hidden());
        assert!(matches!(result,
            Err(Error::FormatError(SparseError::InvalidMagic))));
        assert!(output.into_inner().is_empty());
    }

    #[test]
    fn invalid_chunk_type_aborts() {
        let mut bogus = ChunkHeader::new(ChunkType::DontCare, 1, 0);
        bogus.chunk_type = 0xcac5;
        let input = craft(16, 2, &[
            (ChunkHeader::new(ChunkType::DontCare, 1, 0), vec![]),
            (bogus, vec![]),
        ]);
        let result = decode_segment(&mut Cursor::new(&input),
            &mut Cursor::new(Vec::new()), &ProgressBar::hidden());
        assert!(matches!(result, Err(Error::FormatError(
            SparseError::InvalidChunkType { index: 1, chunk_type: 0xcac5 }))));
    }

    #[test]
    fn unsupported_version_rejected() {
        let mut input = craft(16, 0, &[]);
        input[4] = 2;
        let result = decode_segment(&mut Cursor::new(&input),
            &mut Cursor::new(Vec::new()), &ProgressBar::hidden());
        assert!(matches!(result, Err(Error::FormatError(
            SparseError::UnsupportedVersion { major: 2, minor: 0 }))));
    }

    #[test]
    fn bad_block_size_rejected() {
        let input = craft(6, 0, &[]);
        let result = decode_segment(&mut Cursor::new(&input),
            &mut Cursor::new(Vec::new()), &ProgressBar::hidden());
        assert!(matches!(result, Err(Error::FormatError(
            SparseError::InvalidBlockSize { block_size: 6 }))));
    }

    #[test]
    fn all_chunk_types_small_blocks() {
        let raw: Vec<u8> = (0..16).collect();
        let input = craft(16, 5, &[
            (ChunkHeader::new(ChunkType::Fill, 2, 4), vec![1, 2, 3, 4]),
            (ChunkHeader::new(ChunkType::Crc32, 0, 4), vec![0xaa, 0xbb, 0xcc, 0xdd]),
            (ChunkHeader::new(ChunkType::DontCare, 1, 0), vec![]),
            (ChunkHeader::new(ChunkType::Raw, 1, 16), raw.clone()),
            (ChunkHeader::new(ChunkType::Fill, 1, 4), vec![9, 9, 9, 9]),
        ]);
        let mut output = Cursor::new(Vec::new());
        let header = decode_segment(&mut Cursor::new(&input), &mut output,
            &ProgressBar::hidden()).unwrap();
        assert_eq!(header.total_size(), 80);
        let expected = [
            [1, 2, 3, 4].repeat(8),
            vec![0; 16],
            raw,
            vec![9; 16],
        ].concat();
        assert_eq!(output.into_inner(), expected);
    }

    #[test]
    fn excess_header_bytes_skipped() {
        let mut input = Vec::new();
        let mut header = Header::new(8, 2, 2).to_bytes();
        header[8] = 32;
        header[10] = 16;
        input.extend_from_slice(&header);
        input.extend_from_slice(&[0xee; 4]);
        for (chunk, payload) in [
            (ChunkHeader::new(ChunkType::Fill, 1, 4), &[5u8; 4][..]),
            (ChunkHeader::new(ChunkType::Raw, 1, 8), &[1, 2, 3, 4, 5, 6, 7, 8][..]),
        ] {
            input.extend_from_slice(&chunk.to_bytes());
            input.extend_from_slice(&[0xee; 4]);
            input.extend_from_slice(payload);
        }
        let mut output = Cursor::new(Vec::new());
        decode_segment(&mut Cursor::new(&input), &mut output, &ProgressBar::hidden())
            .unwrap();
        assert_eq!(output.into_inner(), [5, 5, 5, 5, 5, 5, 5, 5, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn truncated_raw_is_io_error() {
        let input = craft(16, 1, &[
            (ChunkHeader::new(ChunkType::Raw, 1, 16), vec![0; 10])]);
        let result = decode_segment(&mut Cursor::new(&input),
            &mut Cursor::new(Vec::new()), &ProgressBar::hidden());
        assert!(matches!(result, Err(Error::IOError(e))
            if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn sparse_list_counts_up() {
        let dir = tempfile::tempdir().unwrap();
        for index in 1..=3 {
            std::fs::write(dir.path().join(format!("a.img_sparsechunk{}", index)), b"")
                .unwrap();
        }
        std::fs::write(dir.path().join("a.img_sparsechunk5"), b"").unwrap();
        let first = dir.path().join("a.img_sparsechunk1");
        assert_eq!(sparse_list(&first), [
            first.clone(),
            dir.path().join("a.img_sparsechunk2"),
            dir.path().join("a.img_sparsechunk3"),
        ]);
        let second = dir.path().join("a.img_sparsechunk2");
        assert_eq!(sparse_list(&second).len(), 2);
        let plain = dir.path().join("plain.img");
        assert_eq!(sparse_list(&plain), [plain.clone()]);
    }

    #[test]
    fn decompress_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let image = mixed_image();
        let image_path = dir.path().join("super.img");
        std::fs::write(&image_path, &image).unwrap();
        let paths = crate::compress::compress(
            &image_path, dir.path(), 2 * BLOCK_SIZE as u64 + 64).unwrap();
        assert!(paths.len() > 1);
        let output = dir.path().join("restored.img");
        decompress(&paths[0], &output).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), image);
    }

    #[test]
    fn decompress_extends_trailing_dont_care() {
        let dir = tempfile::tempdir().unwrap();
        let input = craft(16, 3, &[
            (ChunkHeader::new(ChunkType::Fill, 1, 4), vec![7; 4]),
            (ChunkHeader::new(ChunkType::DontCare, 2, 0), vec![]),
        ]);
        let sparse = dir.path().join("tail.simg");
        std::fs::write(&sparse, input).unwrap();
        let output = dir.path().join("tail.img");
        decompress(&sparse, &output).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), [vec![7; 16], vec![0; 32]].concat());
    }

    #[test]
    fn decompress_missing_segment_is_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = decompress(dir.path().join("none_sparsechunk1"),
            dir.path().join("out.img"));
        assert!(matches!(result, Err(Error::OpenError { .. })));
    }
}

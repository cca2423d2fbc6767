/*
sparseconv, to convert between raw and Android sparse images: statistics module
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

use std::{fs::File, io::{BufReader, Read}, path::Path};

use indicatif::ProgressBar;
use serde::Serialize;

use crate::{decompress::{walk_segment, ChunkSink},
    pretty::try_into_human_readble,
    sparse::{ChunkHeader, ChunkType, Header, SIZE_FILL},
    Error, Result};

#[derive(Debug, Serialize)]
pub(crate) struct ChunkInfo {
    index: usize,
    chunk_type: ChunkType,
    chunk_size: u32,
    total_size: u32,
    /// Where the chunk lands in the unsparsed image
    offset: u64,
    /// Fill pattern or CRC32, as a little-endian u32
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<u32>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SparseStats {
    header: Header,
    chunks: Vec<ChunkInfo>,
    /// Bytes actually carried by raw and fill chunks
    output_size: u64,
}

#[derive(Default)]
struct Inspector {
    chunks: Vec<ChunkInfo>,
    offset: u64,
    output_size: u64,
}

impl Inspector {
    fn record(&mut self, chunk: &ChunkHeader, chunk_type: ChunkType,
        length: u64, value: Option<u32>)
    {
        self.chunks.push(ChunkInfo {
            index: self.chunks.len(),
            chunk_type,
            chunk_size: chunk.chunk_size,
            total_size: chunk.total_size,
            offset: self.offset,
            value,
        });
        self.offset += length;
    }
}

impl ChunkSink for Inspector {
    fn raw(&mut self, chunk: &ChunkHeader, _data: &mut dyn Read, length: u64)
        -> Result<()>
    {
        self.record(chunk, ChunkType::Raw, length, None);
        self.output_size += length;
        Ok(())
    }

    fn fill(&mut self, chunk: &ChunkHeader, pattern: [u8; SIZE_FILL], length: u64)
        -> Result<()>
    {
        self.record(chunk, ChunkType::Fill, length, Some(u32::from_le_bytes(pattern)));
        self.output_size += length;
        Ok(())
    }

    fn dont_care(&mut self, chunk: &ChunkHeader, length: u64) -> Result<()> {
        self.record(chunk, ChunkType::DontCare, length, None);
        Ok(())
    }

    fn crc32(&mut self, chunk: &ChunkHeader, checksum: u32) -> Result<()> {
        self.record(chunk, ChunkType::Crc32, 0, Some(checksum));
        Ok(())
    }
}

/// Walk one sparse file without unsparsing it
pub(crate) fn inspect<R: Read>(input: &mut R) -> Result<SparseStats> {
    let mut inspector = Inspector::default();
    let header = walk_segment(input, &mut inspector, &ProgressBar::hidden())?;
    Ok(SparseStats {
        header,
        chunks: inspector.chunks,
        output_size: inspector.output_size,
    })
}

impl SparseStats {
    pub(crate) fn try_read<P: AsRef<Path>>(file: P) -> Result<Self> {
        let path = file.as_ref();
        let file = File::open(path).map_err(|e|Error::open(path, e))?;
        inspect(&mut BufReader::new(file))
    }

    pub(crate) fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub(crate) fn print_table_stdout(&self) -> Result<()> {
        macro_rules! cell_right {
            ($raw: expr) => {
                $raw.cell().justify(Justify::Right)
            };
        }
        macro_rules! cell_bold_center {
            ($raw: expr) => {
                $raw.cell().bold(true).justify(Justify::Center)
            };
        }
        use cli_table::{Cell, Style, Table, format::Justify};
        let rows: Vec<_> = self.chunks.iter().map(|chunk|[
            cell_right!(chunk.index),
            cell_right!(chunk.chunk_type),
            cell_right!(chunk.chunk_size),
            cell_right!(chunk.total_size),
            cell_right!(format!("0x{:x}", chunk.offset)),
            cell_right!(match chunk.value {
                Some(value) => format!("0x{:08x}", value),
                None => String::new(),
            }),
        ]).collect();
        let table = rows.table().title([
            cell_bold_center!("ID"),
            cell_bold_center!("type"),
            cell_bold_center!("blocks"),
            cell_bold_center!("total size"),
            cell_bold_center!("image off"),
            cell_bold_center!("value"),
        ]).bold(true);
        println!("{}", self.header);
        cli_table::print_stdout(table)?;
        let (size, suffix) = try_into_human_readble(self.output_size);
        println!("Output size: {} ({:.2}{})", self.output_size, size, suffix);
        Ok(())
    }
}

/*
sparseconv, to convert between raw and Android sparse images: error module
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

use std::path::PathBuf;

use crate::sparse::SparseError;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("I/O error: {0}")]
    IOError (#[from] std::io::Error),
    #[error("Cannot open '{}': {source}", .path.display())]
    OpenError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Malformed sparse image, the whole decode is aborted
    #[error("Invalid sparse image format: {0}")]
    FormatError (#[from] SparseError),
    /// Size ceiling can not hold even a single block
    #[error("Maximum sparse size {limit} is smaller than the minimum {minimum} bytes")]
    ConfigurationError {
        limit: u64,
        minimum: u64,
    },
    #[error("Image size {length} is not a multiple of {block_size} bytes")]
    UnalignedImage {
        length: u64,
        block_size: usize,
    },
    #[error("Image size {length} exceeds the {max_blocks} blocks a sparse image could describe")]
    ImageTooLarge {
        length: u64,
        max_blocks: u32,
    },
    #[error("Output directory '{}' does not exist", .0.display())]
    MissingOutputDir (PathBuf),
    #[error("Invalid progress bar template: {0}")]
    TemplateError (#[from] indicatif::style::TemplateError),
    #[error("Failed to serialize to YAML: {0}")]
    YamlError (#[from] serde_yaml::Error),
}

impl Error {
    pub(crate) fn open<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        Self::OpenError { path: path.into(), source }
    }
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

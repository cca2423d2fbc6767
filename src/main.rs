/*
sparseconv, to convert between raw and Android sparse images: main module
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

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing::{error, info, metadata::LevelFilter};
use tracing_subscriber::{prelude::*, EnvFilter};

mod compress;
mod decompress;
mod error;
mod pretty;
mod progress;
mod sparse;
mod stats;

use error::{Error, Result};

#[derive(clap::Subcommand, Debug, Clone)]
enum Action {
    /// Compress a raw image into one or more sparse images
    Compress {
        /// Path of raw image, size must be a multiple of 64KiB
        image: PathBuf,
        /// Existing dir to write <image name>_sparsechunk1, 2, ... into
        outdir: PathBuf,
        /// Maximum size of each sparse image, e.g. 64MB, 512KB
        #[arg(value_parser = pretty::parse_size_arg)]
        max_size: u64,
    },
    /// Decompress sparse images back into a raw image
    Decompress {
        /// Path of the first sparse image, following ones are found by
        /// counting up its trailing number
        sparse: PathBuf,
        /// Path of raw image to write, would be truncated if exists
        output: PathBuf,
    },
    /// Print the chunks of a sparse image
    Stats {
        /// Path of sparse image
        sparse: PathBuf,
        #[arg(short, long)]
        /// Dump as YAML instead of a table
        yaml: bool,
    },
}

#[derive(Parser, Debug)]
#[command(version)]
struct Arg {
    #[command(subcommand)]
    action: Action,
}

fn print_stats(sparse: PathBuf, yaml: bool) -> Result<()> {
    let stats = stats::SparseStats::try_read(sparse)?;
    if yaml {
        print!("{}", stats.to_yaml()?);
        Ok(())
    } else {
        stats.print_table_stdout()
    }
}

fn fallible_main(arg: Arg) -> Result<()> {
    match arg.action {
        Action::Compress { image, outdir, max_size } => {
            let paths = compress::compress(image, outdir, max_size)?;
            info!("Wrote {} sparse images", paths.len());
            Ok(())
        },
        Action::Decompress { sparse, output } =>
            decompress::decompress(sparse, output),
        Action::Stats { sparse, yaml } => print_stats(sparse, yaml),
    }
}

fn main() -> ExitCode {
    let subscriber = tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer()
            .without_time()
            .with_writer(std::io::stderr));
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }
    let arg = Arg::parse();
    match fallible_main(arg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

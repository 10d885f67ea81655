use clap::{Parser, Subcommand};
use std::{
    fs,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::info;

use ipt_rs::{
    cache::{self, Index, Merger},
    config,
    diag::{self, Result},
    image::ImageStore,
    manifest::Manifest,
};

/// Build, merge and query block-offset caches of flow traces.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a trace into a block cache
    Generate {
        /// Trace file to decode
        trace: PathBuf,

        /// Cache file to write
        #[arg(short, long)]
        output: PathBuf,

        /// Raw code to map, as PATH@ADDRESS (repeatable)
        #[arg(long = "image", value_parser = config::parse_placement)]
        images: Vec<(PathBuf, u64)>,

        /// ELF executable to map, as PATH or PATH@BIAS (repeatable)
        #[arg(long = "elf", value_parser = config::parse_elf)]
        elfs: Vec<(PathBuf, u64)>,

        /// Manifest written by ipt-record, to map code on demand
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// Decoding threads
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,

        /// PSBs per chunk
        #[arg(long, default_value_t = 16)]
        chunk: usize,
    },
    /// Merge cache files, and directories of *.cache files, into one
    Merge {
        /// Cache file to write
        #[arg(short, long)]
        output: PathBuf,

        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Print cached blocks
    Query {
        cache: PathBuf,

        /// Address space to look in
        #[arg(long, default_value = "0", value_parser = config::parse_number)]
        cr3: u64,

        /// Blocks starting in START-END
        #[arg(long, value_parser = config::parse_range, conflicts_with = "address")]
        range: Option<RangeInclusive<u64>>,

        /// Blocks covering this address
        #[arg(long, value_parser = config::parse_number)]
        address: Option<u64>,
    },
}

fn generate(
    trace: &Path,
    output: &Path,
    placements: &[(PathBuf, u64)],
    elfs: &[(PathBuf, u64)],
    manifest: Option<&Path>,
    jobs: usize,
    chunk: usize,
) -> Result<()> {
    let mut images = ImageStore::new();
    for (path, base) in placements {
        images.add_file(path, 0, None, *base)?;
    }
    for (path, bias) in elfs {
        images.add_elf(path, *bias)?;
    }
    let manifest = manifest.map(Manifest::load).transpose()?;

    let trace: Arc<[u8]> = fs::read(trace)?.into();
    let entries = cache::generate(&trace, &images, manifest.as_ref(), jobs, chunk)?;
    cache::save(&entries, output)?;
    info!("{} blocks to {}", entries.len(), output.display());
    Ok(())
}

fn merge(output: &Path, inputs: &[PathBuf]) -> Result<()> {
    let mut merger = Merger::new();
    for input in inputs {
        if input.is_dir() {
            merger.add_directory(input)?;
        } else {
            merger.add_file(input)?;
        }
    }
    merger.save(output)
}

fn query(
    path: &Path,
    cr3: u64,
    range: Option<&RangeInclusive<u64>>,
    address: Option<u64>,
) -> Result<()> {
    let index: Index = cache::load(path)?.into_iter().collect();
    let entries = match (address, range) {
        (Some(address), _) => index.containing(cr3, address),
        (None, Some(range)) => index.block_range(cr3, *range.start(), *range.end()),
        (None, None) => index.block_range(cr3, 0, u64::MAX),
    };

    for entry in entries {
        println!(
            "{:016x} ~ {:016x} sync {:#x} offset {:#x}",
            entry.ip, entry.end_ip, entry.sync_offset, entry.offset
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    diag::init_logging();

    match Args::parse().command {
        Command::Generate {
            trace,
            output,
            images,
            elfs,
            manifest,
            jobs,
            chunk,
        } => generate(
            &trace,
            &output,
            &images,
            &elfs,
            manifest.as_deref(),
            jobs,
            chunk,
        ),
        Command::Merge { output, inputs } => merge(&output, &inputs),
        Command::Query {
            cache,
            cr3,
            range,
            address,
        } => query(&cache, cr3, range.as_ref(), address),
    }
}

use clap::{Parser, ValueEnum};
use std::{ops::RangeInclusive, path::PathBuf};

use ipt_rs::{
    analyzer::{Analyzer, InsnFilter},
    cache,
    config::{self, Config},
    diag::{self, Result},
    elf::Elf,
    manifest::Manifest,
    print::Printer,
    session::Session,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Instruction,
    Block,
}

/// Decode a flow trace and print its instructions or blocks.
///
/// Set `RUST_LOG=debug` for decoder logging.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Trace file to decode
    trace: PathBuf,

    /// Raw code to map, as PATH@ADDRESS (repeatable)
    #[arg(long = "image", value_parser = config::parse_placement)]
    images: Vec<(PathBuf, u64)>,

    /// ELF executable to map and symbolize, as PATH or PATH@BIAS (repeatable)
    #[arg(long = "elf", value_parser = config::parse_elf)]
    elfs: Vec<(PathBuf, u64)>,

    /// Manifest written by ipt-record, to map code on demand
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// JSON decoder configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// First trace offset to decode
    #[arg(short = 'S', long, value_parser = config::parse_number)]
    begin: Option<u64>,

    /// Trace offset to stop decoding at
    #[arg(short = 'E', long, value_parser = config::parse_number)]
    end: Option<u64>,

    /// Start at the PSB at this offset
    #[arg(long, value_parser = config::parse_number)]
    sync_offset: Option<u64>,

    #[arg(short, long, value_enum, default_value_t = Format::Instruction)]
    format: Format,

    /// Print instruction bytes
    #[arg(long)]
    raw: bool,

    /// Only print instructions in START-END (repeatable)
    #[arg(long = "range", value_parser = config::parse_range)]
    ranges: Vec<RangeInclusive<u64>>,

    /// Stop after the instruction at this address
    #[arg(long, value_parser = config::parse_number)]
    stop: Option<u64>,

    /// Stop once the end address of every --range was printed
    #[arg(long, requires = "ranges")]
    until_range_ends: bool,

    /// Only print the instruction decoded at this trace offset
    #[arg(long, value_parser = config::parse_number)]
    offset: Option<u64>,

    /// Write the block cache to this file (block format only)
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Only print the blocks decoded under the PSB at this offset (block
    /// format only)
    #[arg(long, value_parser = config::parse_number)]
    psb: Option<u64>,

    /// Log progress every N instructions or blocks
    #[arg(long, default_value_t = 0)]
    progress: usize,
}

fn main() -> Result<()> {
    diag::init_logging();
    let args = Args::parse();

    let mut config = args
        .config
        .as_deref()
        .map(Config::load)
        .transpose()?
        .unwrap_or_default();
    if let Some(begin) = args.begin {
        config.begin = begin;
    }
    if let Some(end) = args.end {
        config.end = end;
    }

    let mut session = Session::new();
    let mut printer = Printer::new().with_raw(args.raw);
    for (path, base) in &args.images {
        session.add_image_file(path, *base)?;
    }
    for (path, bias) in &args.elfs {
        session.add_elf(path, *bias)?;
        printer.add_symbols(Elf::build(path)?, *bias);
    }

    session.open(&args.trace, &config)?;
    if let Some(offset) = args.sync_offset {
        session.set_sync_offset(offset)?;
    }

    let mut analyzer = Analyzer::new(session).with_progress_interval(args.progress);
    if let Some(path) = &args.manifest {
        analyzer = analyzer.with_loader(Manifest::load(path)?);
    }

    match args.format {
        Format::Instruction => {
            let filter = InsnFilter {
                ranges: args.ranges,
                stop_address: args.stop,
                offset: args.offset,
                until_range_ends: args.until_range_ends,
            };
            let mut instructions = analyzer.instructions(filter);
            while let Some(insn) = instructions.next() {
                println!("{}", printer.insn(instructions.offset(), &insn));
            }
        }
        Format::Block => {
            let blocks = match args.psb {
                Some(offset) => analyzer.blocks_under(offset),
                None => analyzer.blocks(),
            };
            let mut entries = Vec::new();
            for (block, entry) in blocks {
                println!("{}", printer.block(&block));
                entries.push(entry);
            }
            if let Some(path) = &args.cache {
                cache::save(&entries, path)?;
            }
        }
    }

    Ok(())
}

use clap::Parser;
use std::{fs::File, io::BufWriter, path::PathBuf, process};

use tracing::info;

use ipt_rs::{
    diag::{self, Result},
    input,
    manifest::Manifest,
    packet::Writer,
    record::{Recorder, DEFAULT_PSB_PERIOD},
};

/// Run a command under ptrace and record its instruction flow.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Trace file to write
    #[arg(short, long, default_value = "trace.flow")]
    output: PathBuf,

    /// Manifest file to write [default: OUTPUT with a .manifest extension]
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Instructions between two PSBs, 0 for a single one
    #[arg(long, default_value_t = DEFAULT_PSB_PERIOD)]
    psb_period: u64,

    /// Command to record
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    diag::init_logging();
    let args = Args::parse();

    let command = input::command(&args.command)?;
    let env = input::env()?;

    let mut writer = Writer::new(BufWriter::new(File::create(&args.output)?));
    let mut manifest = Manifest::default();
    let recording = Recorder::new(args.psb_period).record(&command, &env, &mut writer, &mut manifest)?;

    let manifest_path = args
        .manifest
        .unwrap_or_else(|| args.output.with_extension("manifest"));
    manifest.save(&manifest_path)?;
    info!(
        "{} instructions to {}, {} mappings to {}",
        recording.instructions,
        args.output.display(),
        manifest.mappings.len(),
        manifest_path.display()
    );

    process::exit(recording.exit_code)
}

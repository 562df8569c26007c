// Command-line batch driver for the diff engine.
use std::path::PathBuf;

use clap::Parser;

mod batch;
mod commands;

#[derive(Parser)]
#[command(name = "bindelta")]
#[command(about = "Structural diffing for disassembled binaries")]
#[command(version)]
pub struct Cli {
    /// Primary input file, or input directory in batch mode
    #[arg(short, long)]
    pub primary: Option<PathBuf>,

    /// Secondary input file
    #[arg(short, long)]
    pub secondary: Option<PathBuf>,

    /// Positional input pair (alternative to --primary/--secondary)
    #[arg(value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Output path, defaults to the current directory
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Comma-separated list of output formats: bin (result database),
    /// log (text report), ground (groundtruth), none
    #[arg(long, default_value = "bin", value_delimiter = ',')]
    pub output_format: Vec<String>,

    /// Dump call-graph MD indices of the inputs instead of diffing
    #[arg(long)]
    pub md_index: bool,

    /// List hash/filenames for all payloads in the input directory
    #[arg(long)]
    pub ls: bool,

    /// Config file path
    #[arg(long)]
    pub config: Option<PathBuf>,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(error) = commands::run(cli) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

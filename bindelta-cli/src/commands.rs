//! Command dispatch: single diffs, MD-index dumps, payload listing and
//! the handoff to batch mode.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use anyhow::{bail, Context, Result};

use bindelta_core::config::MatchingConfig;
use bindelta_core::differ::{self, Program};
use bindelta_core::intern::Interner;
use bindelta_core::payload::ProgramPayload;
use bindelta_core::writers::database::DatabaseWriter;
use bindelta_core::writers::groundtruth_writer::GroundtruthWriter;
use bindelta_core::writers::log_writer::ResultsLogWriter;
use bindelta_core::writers::{ChainWriter, ResultWriter};

use crate::batch;
use crate::Cli;

/// Payload files are JSON exports with this extension.
pub const PAYLOAD_EXTENSION: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Binary,
    Log,
    Groundtruth,
}

fn parse_formats(raw: &[String]) -> Result<Vec<OutputFormat>> {
    let mut formats = Vec::new();
    for value in raw {
        match value.as_str() {
            "bin" | "binary" => formats.push(OutputFormat::Binary),
            "log" => formats.push(OutputFormat::Log),
            "ground" | "groundtruth" => formats.push(OutputFormat::Groundtruth),
            "none" | "" => {}
            other => bail!("unknown output format '{other}'"),
        }
    }
    Ok(formats)
}

pub fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => MatchingConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => MatchingConfig::default(),
    };
    let formats = parse_formats(&cli.output_format)?;

    let mut inputs = cli.files.clone();
    let (primary, secondary) = match (cli.primary.clone(), cli.secondary.clone()) {
        (Some(primary), secondary) => (Some(primary), secondary),
        (None, _) if inputs.len() >= 2 => {
            let secondary = inputs.pop();
            (inputs.pop(), secondary)
        }
        (None, _) if inputs.len() == 1 => (inputs.pop(), None),
        _ => (None, None),
    };

    let Some(primary) = primary else {
        bail!("no input files; use --primary/--secondary or a positional pair");
    };

    if cli.ls {
        return list_payloads(&primary);
    }
    if cli.md_index {
        dump_md_index(&primary, &config)?;
        if let Some(secondary) = &secondary {
            dump_md_index(secondary, &config)?;
        }
        return Ok(());
    }

    if primary.is_dir() {
        let quit = AtomicBool::new(false);
        return batch::batch_diff(&primary, &cli.output_dir, &config, &formats, &quit);
    }

    let Some(secondary) = secondary else {
        bail!("a secondary input file is required");
    };
    if primary == secondary {
        bail!("primary and secondary must differ");
    }
    let summary = diff_pair(&primary, &secondary, &cli.output_dir, &config, &formats)?;
    println!("{summary}");
    Ok(())
}

/// Diffs one pair of payload files and writes the requested outputs.
/// Returns the one-line-per-counter result summary.
pub fn diff_pair(
    primary_path: &Path,
    secondary_path: &Path,
    output_dir: &Path,
    config: &MatchingConfig,
    formats: &[OutputFormat],
) -> Result<String> {
    let mut interner = Interner::new();
    let primary = Program::read(primary_path, &mut interner, config.detect_library_functions)
        .with_context(|| format!("reading {}", primary_path.display()))?;
    let secondary = Program::read(
        secondary_path,
        &mut interner,
        config.detect_library_functions,
    )
    .with_context(|| format!("reading {}", secondary_path.display()))?;

    let context = differ::diff(&primary, &secondary, config)?;
    let scores = differ::score(&context);

    let mut writer = ChainWriter::new();
    for format in formats {
        let boxed: Box<dyn ResultWriter> = match format {
            OutputFormat::Binary => {
                let path = result_path(output_dir, &primary, &secondary, ".BinDelta")?;
                Box::new(DatabaseWriter::new(path))
            }
            OutputFormat::Log => {
                let path = result_path(output_dir, &primary, &secondary, ".results")?;
                Box::new(ResultsLogWriter::new(path))
            }
            OutputFormat::Groundtruth => {
                let path = result_path(output_dir, &primary, &secondary, ".truth")?;
                Box::new(GroundtruthWriter::new(path))
            }
        };
        writer.add(boxed);
    }
    if !writer.is_empty() {
        writer.write(&context).context("writing results")?;
    }

    let mut summary = format!(
        "{} vs {}:\tsimilarity:\t{}\tconfidence:\t{}",
        primary_path.display(),
        secondary_path.display(),
        scores.similarity,
        scores.confidence,
    );
    for index in 0..bindelta_core::statistics::Counts::UI_ENTRY_COUNT {
        if let Some((name, value)) = scores.counts.entry(index) {
            summary.push_str(&format!("\n\t{name}:\t{value}"));
        }
    }
    Ok(summary)
}

/// Builds `<out>/<name1>_vs_<name2><extension>`, truncating the two name
/// parts evenly when the result would exceed the filesystem limit.
fn result_path(
    output_dir: &Path,
    primary: &Program,
    secondary: &Program,
    extension: &str,
) -> Result<PathBuf> {
    const MAX_FILENAME: usize = 250;
    let mut one = primary.call_graph.file_name();
    let mut two = secondary.call_graph.file_name();
    let fixed = "_vs_".len() + extension.len();
    let budget = MAX_FILENAME.saturating_sub(fixed);
    if one.len() + two.len() > budget {
        let half = budget / 2;
        if one.len() > half {
            one.truncate(half.max(budget.saturating_sub(two.len())));
        }
        if one.len() + two.len() > budget {
            two.truncate(budget.saturating_sub(one.len()));
        }
        if one.is_empty() || two.is_empty() {
            bail!("cannot create a valid output filename, input names too long");
        }
    }
    Ok(output_dir.join(format!("{one}_vs_{two}{extension}")))
}

fn dump_md_index(path: &Path, config: &MatchingConfig) -> Result<()> {
    let mut interner = Interner::new();
    let program = Program::read(path, &mut interner, config.detect_library_functions)
        .with_context(|| format!("reading {}", path.display()))?;
    println!("{}: {}", path.display(), program.call_graph.md_index());
    Ok(())
}

fn list_payloads(directory: &Path) -> Result<()> {
    if !directory.is_dir() {
        bail!("{} is not a directory", directory.display());
    }
    for path in collect_payloads(directory)? {
        match ProgramPayload::read(&path) {
            Ok(payload) => println!(
                "{}: {} ({})",
                path.display(),
                payload.meta.executable_id,
                payload.meta.executable_name
            ),
            Err(error) => eprintln!("{}: {error}", path.display()),
        }
    }
    Ok(())
}

/// All payload files of a directory, sorted by name for deterministic
/// pairing.
pub fn collect_payloads(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut payloads = Vec::new();
    for entry in std::fs::read_dir(directory)
        .with_context(|| format!("listing {}", directory.display()))?
    {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|extension| extension.eq_ignore_ascii_case(PAYLOAD_EXTENSION))
        {
            payloads.push(path);
        }
    }
    payloads.sort();
    Ok(payloads)
}

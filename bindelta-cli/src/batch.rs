//! Batch mode
//!
//! Diffs every ordered pair of payload files in a directory over a worker
//! pool. Workers share nothing but the FIFO work queue behind one mutex;
//! each owns its programs and fixed-point store. The quit flag is checked
//! between pairs only, so in-flight diffs always run to completion.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use bindelta_core::config::MatchingConfig;

use crate::commands::{self, OutputFormat};

pub fn batch_diff(
    input_dir: &Path,
    output_dir: &Path,
    config: &MatchingConfig,
    formats: &[OutputFormat],
    quit: &AtomicBool,
) -> Result<()> {
    let payloads = commands::collect_payloads(input_dir)?;
    if payloads.len() < 2 {
        bail!(
            "batch mode needs at least two payload files in {}",
            input_dir.display()
        );
    }

    let mut pairs: VecDeque<(PathBuf, PathBuf)> = VecDeque::new();
    for first in &payloads {
        for second in &payloads {
            if first != second {
                pairs.push_back((first.clone(), second.clone()));
            }
        }
    }
    let total = pairs.len() as u64;
    info!("batch diffing {total} pairs from {}", input_dir.display());

    let queue = Mutex::new(pairs);
    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let workers = if config.num_threads > 0 {
        config.num_threads
    } else {
        std::thread::available_parallelism()
            .map(|parallelism| parallelism.get())
            .unwrap_or(1)
    };

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if quit.load(Ordering::Relaxed) {
                    break;
                }
                let next = {
                    let mut queue = queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    queue.pop_front()
                };
                let Some((primary, secondary)) = next else {
                    break;
                };
                progress.set_message(format!(
                    "{} vs {}",
                    primary
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    secondary
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                ));
                match commands::diff_pair(&primary, &secondary, output_dir, config, formats) {
                    Ok(summary) => progress.println(summary),
                    Err(error) => progress.println(format!(
                        "while diffing {} vs {}: {error:#}",
                        primary.display(),
                        secondary.display()
                    )),
                }
                progress.inc(1);
            });
        }
    });
    progress.finish_and_clear();
    Ok(())
}

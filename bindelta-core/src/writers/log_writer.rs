//! Results log writer
//!
//! Human-readable text report: both filenames and call-graph MD indices,
//! the per-kind counters and histogram, global similarity/confidence,
//! then one block per fixed point with its nested basic-block and
//! instruction matches, and finally the two unmatched sections.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::error::Result;
use crate::matching::context::MatchingContext;
use crate::statistics::{self, Counts, Histogram};
use crate::util::format_address;
use crate::writers::ResultWriter;

pub struct ResultsLogWriter {
    path: PathBuf,
}

impl ResultsLogWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ResultsLogWriter { path: path.into() }
    }
}

fn padded(name: &str, width: usize) -> String {
    let dots = width.saturating_sub(name.len());
    format!("{name}{}", ".".repeat(dots))
}

impl ResultWriter for ResultsLogWriter {
    fn write(&mut self, context: &MatchingContext) -> Result<()> {
        let mut histogram = Histogram::new();
        let mut counts = Counts::default();
        statistics::counts_and_histogram(
            context.primary,
            context.secondary,
            &context.fixed_points,
            &mut histogram,
            &mut counts,
        );
        let similarity = statistics::global_similarity(
            &context.primary.call_graph,
            &context.secondary.call_graph,
            &histogram,
            &counts,
            &context.confidences,
        );
        let confidence = statistics::confidence(&histogram, &context.confidences);

        let mut out = BufWriter::new(File::create(&self.path)?);
        writeln!(out, "{}", context.primary.call_graph.file_name())?;
        writeln!(out, "{}", context.secondary.call_graph.file_name())?;
        writeln!(
            out,
            "call graph1 MD index {}",
            context.primary.call_graph.md_index()
        )?;
        writeln!(
            out,
            "call graph2 MD index {}",
            context.secondary.call_graph.md_index()
        )?;
        writeln!(out)?;
        writeln!(out, " --------- statistics ---------")?;
        for index in 0..Counts::UI_ENTRY_COUNT {
            if let Some((name, value)) = counts.entry(index) {
                writeln!(out, "{}:{value:7}", padded(name, 60))?;
            }
        }
        writeln!(out)?;
        for (name, value) in &histogram {
            writeln!(out, "{}:{value:7}", padded(name, 60))?;
        }
        writeln!(out)?;
        writeln!(out, "similarity: {similarity}")?;
        writeln!(out, "confidence: {confidence}")?;
        writeln!(out)?;
        writeln!(out, "individual confidence values used: ")?;
        for (name, value) in &context.confidences {
            writeln!(out, "{}:{value:7.2}", padded(name, 60))?;
        }

        writeln!(
            out,
            " --------- matched {} of {}/{} ({}/{}) ------------ ",
            context.fixed_points.len(),
            counts[crate::statistics::CountKind::FunctionsPrimaryNonLibrary],
            counts[crate::statistics::CountKind::FunctionsSecondaryNonLibrary],
            counts[crate::statistics::CountKind::FunctionsPrimaryLibrary],
            counts[crate::statistics::CountKind::FunctionsSecondaryLibrary],
        )?;
        for fixed_point in context.fixed_points.iter() {
            let primary = context.primary.flow_graph(fixed_point.primary());
            let secondary = context.secondary.flow_graph(fixed_point.secondary());
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t\"{}\"\t\"{}\"",
                format_address(fixed_point.primary_entry()),
                format_address(fixed_point.secondary_entry()),
                fixed_point.similarity(),
                fixed_point.confidence(),
                primary.md_index(),
                secondary.md_index(),
                primary.is_library() as u8,
                secondary.is_library() as u8,
                fixed_point.step(),
                primary.name(),
                secondary.name(),
            )?;
            writeln!(
                out,
                "\t{}\t{}\t{}",
                fixed_point.basic_block_count(),
                primary.basic_block_count(),
                secondary.basic_block_count(),
            )?;
            for basic_block in fixed_point.basic_blocks() {
                writeln!(
                    out,
                    "\t{}\t{}\t{}",
                    format_address(primary.address(basic_block.primary_vertex)),
                    format_address(secondary.address(basic_block.secondary_vertex)),
                    basic_block.step(),
                )?;
                writeln!(
                    out,
                    "\t\t{}\t{}\t{}",
                    basic_block.instruction_matches().len(),
                    primary.instruction_count(basic_block.primary_vertex),
                    secondary.instruction_count(basic_block.secondary_vertex),
                )?;
                for instruction_match in basic_block.instruction_matches() {
                    writeln!(
                        out,
                        "\t\t{}\t{}",
                        format_address(
                            primary.all_instructions()[instruction_match.primary as usize].address
                        ),
                        format_address(
                            secondary.all_instructions()[instruction_match.secondary as usize]
                                .address
                        ),
                    )?;
                }
            }
        }

        for (label, program, matched_entries) in [
            (
                "primary",
                context.primary,
                context
                    .fixed_points
                    .iter()
                    .map(|fp| fp.primary_entry())
                    .collect::<BTreeSet<_>>(),
            ),
            (
                "secondary",
                context.secondary,
                context
                    .fixed_points
                    .iter()
                    .map(|fp| fp.secondary_entry())
                    .collect::<BTreeSet<_>>(),
            ),
        ] {
            let unmatched: Vec<_> = program
                .flow_graphs()
                .iter()
                .filter(|fg| !matched_entries.contains(&fg.entry_point()))
                .collect();
            writeln!(
                out,
                " --------- unmatched {label} ({}) ------------ ",
                unmatched.len()
            )?;
            for flow_graph in unmatched {
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}",
                    format_address(flow_graph.entry_point()),
                    flow_graph.is_library() as u8,
                    flow_graph.md_index(),
                    flow_graph.name(),
                )?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

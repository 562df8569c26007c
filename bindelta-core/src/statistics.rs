//! Counts, histograms and scoring
//!
//! Aggregates per-side and per-match tallies, the histogram of matches per
//! step name, and the similarity/confidence formulas. Library functions are
//! tallied separately so they can be excluded from the global similarity.

use std::collections::BTreeMap;

use crate::differ::Program;
use crate::graph::call_graph::CallGraph;
use crate::graph::flow_graph::FlowGraph;
use crate::matching::fixed_points::{FixedPoint, FixedPointStore};

/// Matches per step name.
pub type Histogram = BTreeMap<&'static str, u64>;

/// Per-step confidence weights.
pub type Confidences = BTreeMap<&'static str, f64>;

/// Labeled counter kinds. The first [`Counts::UI_ENTRY_COUNT`] entries make
/// up the human-readable summary; the rest are per-side scratch tallies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountKind {
    BasicBlockMatchesLibrary = 0,
    BasicBlockMatchesNonLibrary,
    BasicBlocksPrimaryLibrary,
    BasicBlocksPrimaryNonLibrary,
    BasicBlocksSecondaryLibrary,
    BasicBlocksSecondaryNonLibrary,
    FlowGraphEdgeMatchesLibrary,
    FlowGraphEdgeMatchesNonLibrary,
    FlowGraphEdgesPrimaryLibrary,
    FlowGraphEdgesPrimaryNonLibrary,
    FlowGraphEdgesSecondaryLibrary,
    FlowGraphEdgesSecondaryNonLibrary,
    FunctionMatchesLibrary,
    FunctionMatchesNonLibrary,
    FunctionsPrimaryLibrary,
    FunctionsPrimaryNonLibrary,
    FunctionsSecondaryLibrary,
    FunctionsSecondaryNonLibrary,
    InstructionMatchesLibrary,
    InstructionMatchesNonLibrary,
    InstructionsPrimaryLibrary,
    InstructionsPrimaryNonLibrary,
    InstructionsSecondaryLibrary,
    InstructionsSecondaryNonLibrary,
    // Plain per-side tallies, not part of the summary.
    BasicBlocksLibrary,
    BasicBlocksNonLibrary,
    EdgesLibrary,
    EdgesNonLibrary,
    FunctionsLibrary,
    FunctionsNonLibrary,
    InstructionsLibrary,
    InstructionsNonLibrary,
}

impl CountKind {
    pub const COUNT: usize = 32;

    pub const ALL: [CountKind; CountKind::COUNT] = [
        CountKind::BasicBlockMatchesLibrary,
        CountKind::BasicBlockMatchesNonLibrary,
        CountKind::BasicBlocksPrimaryLibrary,
        CountKind::BasicBlocksPrimaryNonLibrary,
        CountKind::BasicBlocksSecondaryLibrary,
        CountKind::BasicBlocksSecondaryNonLibrary,
        CountKind::FlowGraphEdgeMatchesLibrary,
        CountKind::FlowGraphEdgeMatchesNonLibrary,
        CountKind::FlowGraphEdgesPrimaryLibrary,
        CountKind::FlowGraphEdgesPrimaryNonLibrary,
        CountKind::FlowGraphEdgesSecondaryLibrary,
        CountKind::FlowGraphEdgesSecondaryNonLibrary,
        CountKind::FunctionMatchesLibrary,
        CountKind::FunctionMatchesNonLibrary,
        CountKind::FunctionsPrimaryLibrary,
        CountKind::FunctionsPrimaryNonLibrary,
        CountKind::FunctionsSecondaryLibrary,
        CountKind::FunctionsSecondaryNonLibrary,
        CountKind::InstructionMatchesLibrary,
        CountKind::InstructionMatchesNonLibrary,
        CountKind::InstructionsPrimaryLibrary,
        CountKind::InstructionsPrimaryNonLibrary,
        CountKind::InstructionsSecondaryLibrary,
        CountKind::InstructionsSecondaryNonLibrary,
        CountKind::BasicBlocksLibrary,
        CountKind::BasicBlocksNonLibrary,
        CountKind::EdgesLibrary,
        CountKind::EdgesNonLibrary,
        CountKind::FunctionsLibrary,
        CountKind::FunctionsNonLibrary,
        CountKind::InstructionsLibrary,
        CountKind::InstructionsNonLibrary,
    ];

    pub fn display_name(self) -> &'static str {
        match self {
            CountKind::BasicBlockMatchesLibrary => "Basic Block Matches (Library)",
            CountKind::BasicBlockMatchesNonLibrary => "Basic Block Matches (Non-Library)",
            CountKind::BasicBlocksPrimaryLibrary => "Basic Blocks Primary (Library)",
            CountKind::BasicBlocksPrimaryNonLibrary => "Basic Blocks Primary (Non-Library)",
            CountKind::BasicBlocksSecondaryLibrary => "Basic Blocks Secondary (Library)",
            CountKind::BasicBlocksSecondaryNonLibrary => "Basic Blocks Secondary (Non-Library)",
            CountKind::FlowGraphEdgeMatchesLibrary => "Flow Graph Edge Matches (Library)",
            CountKind::FlowGraphEdgeMatchesNonLibrary => "Flow Graph Edge Matches (Non-Library)",
            CountKind::FlowGraphEdgesPrimaryLibrary => "Flow Graph Edges Primary (Library)",
            CountKind::FlowGraphEdgesPrimaryNonLibrary => "Flow Graph Edges Primary (Non-Library)",
            CountKind::FlowGraphEdgesSecondaryLibrary => "Flow Graph Edges Secondary (Library)",
            CountKind::FlowGraphEdgesSecondaryNonLibrary => {
                "Flow Graph Edges Secondary (Non-Library)"
            }
            CountKind::FunctionMatchesLibrary => "Function Matches (Library)",
            CountKind::FunctionMatchesNonLibrary => "Function Matches (Non-Library)",
            CountKind::FunctionsPrimaryLibrary => "Functions Primary (Library)",
            CountKind::FunctionsPrimaryNonLibrary => "Functions Primary (Non-Library)",
            CountKind::FunctionsSecondaryLibrary => "Functions Secondary (Library)",
            CountKind::FunctionsSecondaryNonLibrary => "Functions Secondary (Non-Library)",
            CountKind::InstructionMatchesLibrary => "Instruction Matches (Library)",
            CountKind::InstructionMatchesNonLibrary => "Instruction Matches (Non-Library)",
            CountKind::InstructionsPrimaryLibrary => "Instructions Primary (Library)",
            CountKind::InstructionsPrimaryNonLibrary => "Instructions Primary (Non-Library)",
            CountKind::InstructionsSecondaryLibrary => "Instructions Secondary (Library)",
            CountKind::InstructionsSecondaryNonLibrary => "Instructions Secondary (Non-Library)",
            CountKind::BasicBlocksLibrary => "Basic Blocks (Library)",
            CountKind::BasicBlocksNonLibrary => "Basic Blocks (Non-Library)",
            CountKind::EdgesLibrary => "Edges (Library)",
            CountKind::EdgesNonLibrary => "Edges (Non-Library)",
            CountKind::FunctionsLibrary => "Functions (Library)",
            CountKind::FunctionsNonLibrary => "Functions (Non-Library)",
            CountKind::InstructionsLibrary => "Instructions (Library)",
            CountKind::InstructionsNonLibrary => "Instructions (Non-Library)",
        }
    }
}

/// Fixed-size typed counter array.
#[derive(Debug, Clone)]
pub struct Counts([u64; CountKind::COUNT]);

impl Default for Counts {
    fn default() -> Self {
        Counts([0; CountKind::COUNT])
    }
}

impl Counts {
    /// Number of entries shown in the summary output.
    pub const UI_ENTRY_COUNT: usize = 24;

    pub fn entry(&self, index: usize) -> Option<(&'static str, u64)> {
        let kind = *CountKind::ALL.get(index)?;
        Some((kind.display_name(), self.0[kind as usize]))
    }

    pub fn clear(&mut self) {
        self.0 = [0; CountKind::COUNT];
    }
}

impl std::ops::Index<CountKind> for Counts {
    type Output = u64;

    fn index(&self, kind: CountKind) -> &u64 {
        &self.0[kind as usize]
    }
}

impl std::ops::IndexMut<CountKind> for Counts {
    fn index_mut(&mut self, kind: CountKind) -> &mut u64 {
        &mut self.0[kind as usize]
    }
}

/// Tallies the per-side counters of one program into the plain kinds.
pub fn count_program(program: &Program, counts: &mut Counts) {
    for flow_graph in program.flow_graphs() {
        let library = flow_graph.is_library();
        let (functions, basic_blocks, instructions, edges) = if library {
            (
                CountKind::FunctionsLibrary,
                CountKind::BasicBlocksLibrary,
                CountKind::InstructionsLibrary,
                CountKind::EdgesLibrary,
            )
        } else {
            (
                CountKind::FunctionsNonLibrary,
                CountKind::BasicBlocksNonLibrary,
                CountKind::InstructionsNonLibrary,
                CountKind::EdgesNonLibrary,
            )
        };
        counts[functions] += 1;
        counts[basic_blocks] += flow_graph.basic_block_count() as u64;
        counts[instructions] += flow_graph.total_instruction_count() as u64;
        counts[edges] += flow_graph.edge_count() as u64;
    }
}

/// Tallies one fixed point: histogram buckets, matched functions, basic
/// blocks, instructions, and flow edges.
///
/// A primary edge counts as matched when both endpoints are matched and
/// the counterpart edge exists in the secondary graph.
pub fn count_fixed_point(
    fixed_point: &FixedPoint,
    primary: &FlowGraph,
    secondary: &FlowGraph,
    counts: &mut Counts,
    histogram: &mut Histogram,
) {
    let library = primary.is_library() || secondary.is_library();
    let (functions, basic_blocks, instructions, edges) = if library {
        (
            CountKind::FunctionMatchesLibrary,
            CountKind::BasicBlockMatchesLibrary,
            CountKind::InstructionMatchesLibrary,
            CountKind::FlowGraphEdgeMatchesLibrary,
        )
    } else {
        (
            CountKind::FunctionMatchesNonLibrary,
            CountKind::BasicBlockMatchesNonLibrary,
            CountKind::InstructionMatchesNonLibrary,
            CountKind::FlowGraphEdgeMatchesNonLibrary,
        )
    };

    *histogram.entry(fixed_point.step()).or_insert(0) += 1;
    counts[functions] += 1;
    counts[basic_blocks] += fixed_point.basic_block_count() as u64;
    for basic_block in fixed_point.basic_blocks() {
        *histogram.entry(basic_block.step()).or_insert(0) += 1;
        counts[instructions] += basic_block.instruction_matches().len() as u64;
    }

    let graph = primary.graph();
    for edge in 0..graph.edge_count() as u32 {
        let source = graph.source(edge);
        let target = graph.target(edge);
        let (Some(source2), Some(target2)) = (
            fixed_point.secondary_vertex_for(source),
            fixed_point.secondary_vertex_for(target),
        ) else {
            continue;
        };
        if secondary.graph().find_edge(source2, target2).is_some() {
            counts[edges] += 1;
        }
    }
}

/// Aggregates counts and the histogram for a whole diff.
pub fn counts_and_histogram(
    primary: &Program,
    secondary: &Program,
    fixed_points: &FixedPointStore,
    histogram: &mut Histogram,
    counts: &mut Counts,
) {
    let mut counts1 = Counts::default();
    let mut counts2 = Counts::default();
    count_program(primary, &mut counts1);
    count_program(secondary, &mut counts2);

    counts[CountKind::FunctionsPrimaryLibrary] = counts1[CountKind::FunctionsLibrary];
    counts[CountKind::FunctionsPrimaryNonLibrary] = counts1[CountKind::FunctionsNonLibrary];
    counts[CountKind::FunctionsSecondaryLibrary] = counts2[CountKind::FunctionsLibrary];
    counts[CountKind::FunctionsSecondaryNonLibrary] = counts2[CountKind::FunctionsNonLibrary];
    counts[CountKind::BasicBlocksPrimaryLibrary] = counts1[CountKind::BasicBlocksLibrary];
    counts[CountKind::BasicBlocksPrimaryNonLibrary] = counts1[CountKind::BasicBlocksNonLibrary];
    counts[CountKind::BasicBlocksSecondaryLibrary] = counts2[CountKind::BasicBlocksLibrary];
    counts[CountKind::BasicBlocksSecondaryNonLibrary] = counts2[CountKind::BasicBlocksNonLibrary];
    counts[CountKind::InstructionsPrimaryLibrary] = counts1[CountKind::InstructionsLibrary];
    counts[CountKind::InstructionsPrimaryNonLibrary] = counts1[CountKind::InstructionsNonLibrary];
    counts[CountKind::InstructionsSecondaryLibrary] = counts2[CountKind::InstructionsLibrary];
    counts[CountKind::InstructionsSecondaryNonLibrary] =
        counts2[CountKind::InstructionsNonLibrary];
    counts[CountKind::FlowGraphEdgesPrimaryLibrary] = counts1[CountKind::EdgesLibrary];
    counts[CountKind::FlowGraphEdgesPrimaryNonLibrary] = counts1[CountKind::EdgesNonLibrary];
    counts[CountKind::FlowGraphEdgesSecondaryLibrary] = counts2[CountKind::EdgesLibrary];
    counts[CountKind::FlowGraphEdgesSecondaryNonLibrary] = counts2[CountKind::EdgesNonLibrary];

    for fixed_point in fixed_points.iter() {
        let mut fixed_point_counts = Counts::default();
        count_fixed_point(
            fixed_point,
            primary.flow_graph(fixed_point.primary()),
            secondary.flow_graph(fixed_point.secondary()),
            &mut fixed_point_counts,
            histogram,
        );
        for kind in [
            CountKind::FunctionMatchesLibrary,
            CountKind::FunctionMatchesNonLibrary,
            CountKind::BasicBlockMatchesLibrary,
            CountKind::BasicBlockMatchesNonLibrary,
            CountKind::InstructionMatchesLibrary,
            CountKind::InstructionMatchesNonLibrary,
            CountKind::FlowGraphEdgeMatchesLibrary,
            CountKind::FlowGraphEdgeMatchesNonLibrary,
        ] {
            counts[kind] += fixed_point_counts[kind];
        }
    }
}

/// Counts and histogram restricted to one matched pair, used to refresh a
/// fixed point's own scores.
pub fn pair_counts_and_histogram(
    fixed_point: &FixedPoint,
    primary: &FlowGraph,
    secondary: &FlowGraph,
) -> (Counts, Histogram) {
    let mut counts = Counts::default();
    let mut histogram = Histogram::new();

    let (functions1, basic_blocks1, instructions1, edges1) = if primary.is_library() {
        (
            CountKind::FunctionsPrimaryLibrary,
            CountKind::BasicBlocksPrimaryLibrary,
            CountKind::InstructionsPrimaryLibrary,
            CountKind::FlowGraphEdgesPrimaryLibrary,
        )
    } else {
        (
            CountKind::FunctionsPrimaryNonLibrary,
            CountKind::BasicBlocksPrimaryNonLibrary,
            CountKind::InstructionsPrimaryNonLibrary,
            CountKind::FlowGraphEdgesPrimaryNonLibrary,
        )
    };
    counts[functions1] += 1;
    counts[basic_blocks1] += primary.basic_block_count() as u64;
    counts[instructions1] += primary.total_instruction_count() as u64;
    counts[edges1] += primary.edge_count() as u64;

    let (functions2, basic_blocks2, instructions2, edges2) = if secondary.is_library() {
        (
            CountKind::FunctionsSecondaryLibrary,
            CountKind::BasicBlocksSecondaryLibrary,
            CountKind::InstructionsSecondaryLibrary,
            CountKind::FlowGraphEdgesSecondaryLibrary,
        )
    } else {
        (
            CountKind::FunctionsSecondaryNonLibrary,
            CountKind::BasicBlocksSecondaryNonLibrary,
            CountKind::InstructionsSecondaryNonLibrary,
            CountKind::FlowGraphEdgesSecondaryNonLibrary,
        )
    };
    counts[functions2] += 1;
    counts[basic_blocks2] += secondary.basic_block_count() as u64;
    counts[instructions2] += secondary.total_instruction_count() as u64;
    counts[edges2] += secondary.edge_count() as u64;

    count_fixed_point(fixed_point, primary, secondary, &mut counts, &mut histogram);
    (counts, histogram)
}

/// Sigmoid-squashed average of per-step weights over the histogram.
pub fn confidence(histogram: &Histogram, confidences: &Confidences) -> f64 {
    let mut weighted = 0.0;
    let mut match_count = 0.0;
    for (name, &value) in histogram {
        weighted += value as f64 * confidences.get(name).copied().unwrap_or(0.0);
        match_count += value as f64;
    }
    if match_count > 0.0 {
        1.0 / (1.0 + (-(weighted / match_count - 0.5) * 10.0).exp())
    } else {
        0.0
    }
}

fn md_index_consistency(md_index1: f64, md_index2: f64) -> f64 {
    1.0 - (md_index1 - md_index2).abs() / (1.0 + md_index1 + md_index2)
}

/// Similarity of one matched function pair. Library functions are
/// included here; only the global score excludes them.
pub fn pair_similarity(
    primary: &FlowGraph,
    secondary: &FlowGraph,
    histogram: &Histogram,
    counts: &Counts,
    confidences: &Confidences,
) -> f64 {
    let basic_block_matches = counts[CountKind::BasicBlockMatchesNonLibrary]
        + counts[CountKind::BasicBlockMatchesLibrary];
    let basic_blocks_primary = counts[CountKind::BasicBlocksPrimaryNonLibrary]
        + counts[CountKind::BasicBlocksPrimaryLibrary];
    let basic_blocks_secondary = counts[CountKind::BasicBlocksSecondaryNonLibrary]
        + counts[CountKind::BasicBlocksSecondaryLibrary];
    let instruction_matches = counts[CountKind::InstructionMatchesNonLibrary]
        + counts[CountKind::InstructionMatchesLibrary];
    let instructions_primary = counts[CountKind::InstructionsPrimaryNonLibrary]
        + counts[CountKind::InstructionsPrimaryLibrary];
    let instructions_secondary = counts[CountKind::InstructionsSecondaryNonLibrary]
        + counts[CountKind::InstructionsSecondaryLibrary];
    let edge_matches = counts[CountKind::FlowGraphEdgeMatchesNonLibrary]
        + counts[CountKind::FlowGraphEdgeMatchesLibrary];
    let edges_primary = counts[CountKind::FlowGraphEdgesPrimaryNonLibrary]
        + counts[CountKind::FlowGraphEdgesPrimaryLibrary];
    let edges_secondary = counts[CountKind::FlowGraphEdgesSecondaryNonLibrary]
        + counts[CountKind::FlowGraphEdgesSecondaryLibrary];

    if basic_block_matches == basic_blocks_primary
        && basic_block_matches == basic_blocks_secondary
        && instruction_matches == instructions_primary
        && instruction_matches == instructions_secondary
    {
        return 1.0;
    }

    let mut similarity = 0.0;
    similarity += 0.55 * edge_matches as f64
        / f64::max(1.0, 0.5 * (edges_primary + edges_secondary) as f64);
    similarity += 0.30 * basic_block_matches as f64
        / f64::max(1.0, 0.5 * (basic_blocks_primary + basic_blocks_secondary) as f64);
    similarity += 0.15 * instruction_matches as f64
        / f64::max(
            1.0,
            0.5 * (instructions_primary + instructions_secondary) as f64,
        );
    similarity = similarity.min(1.0);
    similarity += md_index_consistency(primary.md_index(), secondary.md_index());
    similarity /= 2.0;
    similarity * confidence(histogram, confidences)
}

/// Global similarity of the whole pair of binaries. Excludes library
/// functions so they do not inflate the score.
pub fn global_similarity(
    primary: &CallGraph,
    secondary: &CallGraph,
    histogram: &Histogram,
    counts: &Counts,
    confidences: &Confidences,
) -> f64 {
    let mut similarity = 0.0;
    similarity += 0.35 * counts[CountKind::FlowGraphEdgeMatchesNonLibrary] as f64
        / f64::max(
            1.0,
            0.5 * (counts[CountKind::FlowGraphEdgesPrimaryNonLibrary]
                + counts[CountKind::FlowGraphEdgesSecondaryNonLibrary]) as f64,
        );
    similarity += 0.25 * counts[CountKind::BasicBlockMatchesNonLibrary] as f64
        / f64::max(
            1.0,
            0.5 * (counts[CountKind::BasicBlocksPrimaryNonLibrary]
                + counts[CountKind::BasicBlocksSecondaryNonLibrary]) as f64,
        );
    similarity += 0.10 * counts[CountKind::FunctionMatchesNonLibrary] as f64
        / f64::max(
            1.0,
            0.5 * (counts[CountKind::FunctionsPrimaryNonLibrary]
                + counts[CountKind::FunctionsSecondaryNonLibrary]) as f64,
        );
    similarity += 0.10 * counts[CountKind::InstructionMatchesNonLibrary] as f64
        / f64::max(
            1.0,
            0.5 * (counts[CountKind::InstructionsPrimaryNonLibrary]
                + counts[CountKind::InstructionsSecondaryNonLibrary]) as f64,
        );
    similarity += 0.20 * md_index_consistency(primary.md_index(), secondary.md_index());
    similarity = similarity.min(1.0);
    similarity * confidence(histogram, confidences)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_of_empty_histogram_is_zero() {
        assert_eq!(confidence(&Histogram::new(), &Confidences::new()), 0.0);
    }

    #[test]
    fn confidence_squashes_through_sigmoid() {
        let mut histogram = Histogram::new();
        histogram.insert("step", 4);
        let mut confidences = Confidences::new();
        confidences.insert("step", 1.0);
        let high = confidence(&histogram, &confidences);
        confidences.insert("step", 0.5);
        let neutral = confidence(&histogram, &confidences);
        confidences.insert("step", 0.0);
        let low = confidence(&histogram, &confidences);
        assert!(high > 0.99);
        assert!((neutral - 0.5).abs() < 1e-12);
        assert!(low < 0.01);
    }

    #[test]
    fn md_index_consistency_is_one_for_equal_indices() {
        assert_eq!(md_index_consistency(2.5, 2.5), 1.0);
        assert!(md_index_consistency(1.0, 3.0) < 1.0);
    }

    #[test]
    fn count_entries_expose_display_names() {
        let counts = Counts::default();
        let (name, value) = counts.entry(0).unwrap();
        assert_eq!(name, "Basic Block Matches (Library)");
        assert_eq!(value, 0);
        assert!(counts.entry(CountKind::COUNT).is_none());
    }
}

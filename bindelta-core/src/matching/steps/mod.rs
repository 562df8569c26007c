//! Matching steps
//!
//! A matching step is a named recipe for proposing candidate pairings.
//! Call-graph steps pair functions; flow-graph steps pair basic blocks
//! within one matched function. Steps are stateless behind `&self` so the
//! driver may re-enter them from propagation and drill-down.
//!
//! # Uniqueness rule
//! Bucketing steps only commit a pair when the feature bucket holds exactly
//! one function on each side and the step's extra conditions pass.
//! Ambiguous buckets are handed to the next step of the remaining list
//! ("drill-down") restricted to the bucket's members.

pub mod basic_block;
pub mod function;
pub mod function_edges;

use std::collections::{BTreeMap, BTreeSet};

use log::warn;

use crate::config::MatchingConfig;
use crate::differ::Program;
use crate::graph::flow_graph::FlowGraph;
use crate::matching::context::MatchingContext;
use crate::matching::fixed_points::FixedPointKey;
use crate::statistics::Confidences;

/// Stable step names; persisted in results and used as histogram buckets.
pub mod names {
    pub const FUNCTION_MD_INDEX_TOP_DOWN: &str = "function: MD index (top-down)";
    pub const FUNCTION_MD_INDEX_BOTTOM_UP: &str = "function: MD index (bottom-up)";
    pub const FUNCTION_HASH: &str = "function: hash matching";
    pub const FUNCTION_PRIME_SIGNATURE: &str = "function: prime signature";
    pub const FUNCTION_EDGE_MD_INDEX_TOP_DOWN: &str = "function: edge MD index (top-down)";
    pub const FUNCTION_EDGE_MD_INDEX_BOTTOM_UP: &str = "function: edge MD index (bottom-up)";
    pub const FUNCTION_STRING_REFERENCES: &str = "function: string references";
    pub const FUNCTION_CALL_SEQUENCE: &str = "function: call sequence";
    pub const FUNCTION_ADDRESS_SEQUENCE: &str = "function: address sequence";
    pub const FUNCTION_NAME_HASH: &str = "function: name hash matching";
    pub const FUNCTION_MANUAL: &str = "function: manual";
    pub const FUNCTION_CALL_REFERENCE: &str = "function: call reference matching";

    pub const BASIC_BLOCK_PRIME_SIGNATURE: &str = "basic block: prime signature";
    pub const BASIC_BLOCK_MD_INDEX: &str = "basic block: MD index";
    pub const BASIC_BLOCK_HASH: &str = "basic block: hash matching";
    pub const BASIC_BLOCK_ENTRY_POINT: &str = "basic block: entry point";
    pub const BASIC_BLOCK_EXIT_POINT: &str = "basic block: exit point";
    pub const BASIC_BLOCK_INSTRUCTION_COUNT: &str = "basic block: instruction count";
    pub const BASIC_BLOCK_PROPAGATION: &str = "basic block: propagation";

    /// Maps a persisted step name back to its interned static form.
    pub fn resolve(name: &str) -> Option<&'static str> {
        const ALL: [&str; 19] = [
            FUNCTION_MD_INDEX_TOP_DOWN,
            FUNCTION_MD_INDEX_BOTTOM_UP,
            FUNCTION_HASH,
            FUNCTION_PRIME_SIGNATURE,
            FUNCTION_EDGE_MD_INDEX_TOP_DOWN,
            FUNCTION_EDGE_MD_INDEX_BOTTOM_UP,
            FUNCTION_STRING_REFERENCES,
            FUNCTION_CALL_SEQUENCE,
            FUNCTION_ADDRESS_SEQUENCE,
            FUNCTION_NAME_HASH,
            FUNCTION_MANUAL,
            FUNCTION_CALL_REFERENCE,
            BASIC_BLOCK_PRIME_SIGNATURE,
            BASIC_BLOCK_MD_INDEX,
            BASIC_BLOCK_HASH,
            BASIC_BLOCK_ENTRY_POINT,
            BASIC_BLOCK_EXIT_POINT,
            BASIC_BLOCK_INSTRUCTION_COUNT,
            BASIC_BLOCK_PROPAGATION,
        ];
        ALL.iter().find(|&&known| known == name).copied()
    }
}

/// A call-graph (function-level) matching step.
pub trait FunctionStep {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn confidence(&self) -> f64;
    fn strict(&self) -> bool {
        false
    }

    /// Proposes pairings among the given candidates, committing unique
    /// ones. Returns true when at least one new fixed point was added.
    fn find_fixed_points(
        &self,
        primary_candidates: &BTreeSet<u32>,
        secondary_candidates: &BTreeSet<u32>,
        context: &mut MatchingContext,
        remaining: &[Box<dyn FunctionStep>],
        basic_block_steps: &[Box<dyn BasicBlockStep>],
    ) -> bool;
}

/// A flow-graph (basic-block-level) matching step.
pub trait BasicBlockStep {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn confidence(&self) -> f64;
    fn strict(&self) -> bool {
        false
    }

    /// Proposes basic-block pairings inside the function fixed point
    /// `key`. Candidate sets hold vertices not yet consumed by the pair.
    fn find_basic_block_fixed_points(
        &self,
        key: FixedPointKey,
        context: &mut MatchingContext,
        primary_candidates: &BTreeSet<u32>,
        secondary_candidates: &BTreeSet<u32>,
        remaining: &[Box<dyn BasicBlockStep>],
    ) -> bool;
}

/// Which program of the pair a candidate id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Primary,
    Secondary,
}

/// Total-ordered f64 wrapper for use as a bucket key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatKey(pub f64);

impl Eq for FloatKey {}

impl Ord for FloatKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for FloatKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

fn is_unmatched(context: &MatchingContext, side: Side, flow_graph: u32) -> bool {
    let entry = match side {
        Side::Primary => context.primary.flow_graph(flow_graph).entry_point(),
        Side::Secondary => context.secondary.flow_graph(flow_graph).entry_point(),
    };
    match side {
        Side::Primary => !context.fixed_points.is_primary_matched(entry),
        Side::Secondary => !context.fixed_points.is_secondary_matched(entry),
    }
}

/// Buckets the still-unmatched candidates of one side by a feature.
/// Functions without the feature (`None`) do not participate. Empty
/// (stub) flow graphs only participate when `allow_empty` is set.
pub(crate) fn bucket_candidates<K: Ord>(
    context: &MatchingContext,
    side: Side,
    candidates: &BTreeSet<u32>,
    allow_empty: bool,
    mut feature: impl FnMut(&FlowGraph) -> Option<K>,
) -> BTreeMap<K, Vec<u32>> {
    let program: &Program = match side {
        Side::Primary => context.primary,
        Side::Secondary => context.secondary,
    };
    let mut buckets: BTreeMap<K, Vec<u32>> = BTreeMap::new();
    for &candidate in candidates {
        let flow_graph = program.flow_graph(candidate);
        if !allow_empty && flow_graph.basic_block_count() == 0 {
            continue;
        }
        if !is_unmatched(context, side, candidate) {
            continue;
        }
        if let Some(key) = feature(flow_graph) {
            buckets.entry(key).or_default().push(candidate);
        }
    }
    buckets
}

/// Step-specific commit conditions checked on a uniquely bucketed pair.
fn check_extra_conditions(
    context: &MatchingContext,
    primary: u32,
    secondary: u32,
    step: &dyn FunctionStep,
) -> bool {
    let primary_fg = context.primary.flow_graph(primary);
    let secondary_fg = context.secondary.flow_graph(secondary);
    match step.name() {
        names::FUNCTION_HASH => {
            let minimum = context.config.min_function_instructions as usize;
            primary_fg.total_instruction_count() >= minimum
                && secondary_fg.total_instruction_count() >= minimum
        }
        names::FUNCTION_ADDRESS_SEQUENCE => {
            primary_fg.basic_block_count() == secondary_fg.basic_block_count()
                && primary_fg.total_instruction_count() == secondary_fg.total_instruction_count()
        }
        _ => true,
    }
}

/// Shared unique-bucket commit loop with drill-down into the remaining
/// step list on ambiguous buckets.
pub(crate) fn match_unique_buckets<K: Ord>(
    step: &dyn FunctionStep,
    primary_buckets: &BTreeMap<K, Vec<u32>>,
    secondary_buckets: &BTreeMap<K, Vec<u32>>,
    context: &mut MatchingContext,
    remaining: &[Box<dyn FunctionStep>],
    basic_block_steps: &[Box<dyn BasicBlockStep>],
) -> bool {
    let mut discovered = false;
    for (key, primary_ids) in primary_buckets {
        let Some(secondary_ids) = secondary_buckets.get(key) else {
            continue;
        };
        if primary_ids.len() > 1 || secondary_ids.len() > 1 {
            let Some((next, rest)) = remaining.split_first() else {
                continue;
            };
            let primary_set: BTreeSet<u32> = primary_ids
                .iter()
                .copied()
                .filter(|&id| is_unmatched(context, Side::Primary, id))
                .collect();
            let secondary_set: BTreeSet<u32> = secondary_ids
                .iter()
                .copied()
                .filter(|&id| is_unmatched(context, Side::Secondary, id))
                .collect();
            if !primary_set.is_empty() && !secondary_set.is_empty() {
                discovered |= next.find_fixed_points(
                    &primary_set,
                    &secondary_set,
                    context,
                    rest,
                    basic_block_steps,
                );
            }
            continue;
        }

        // Feature is unique on both sides.
        let (primary, secondary) = (primary_ids[0], secondary_ids[0]);
        if !check_extra_conditions(context, primary, secondary, step) {
            continue;
        }
        let Some(fixed_point) = context.add_fixed_point(primary, secondary, step.name()) else {
            continue;
        };
        basic_block::match_basic_blocks(fixed_point, context, basic_block_steps);
        context.refresh_scores(fixed_point);
        discovered = true;
    }
    discovered
}

fn default_confidence(name: &str) -> f64 {
    match name {
        names::FUNCTION_MD_INDEX_TOP_DOWN => 0.9,
        names::FUNCTION_MD_INDEX_BOTTOM_UP => 0.85,
        names::FUNCTION_HASH => 1.0,
        names::FUNCTION_PRIME_SIGNATURE => 0.9,
        names::FUNCTION_EDGE_MD_INDEX_TOP_DOWN => 0.7,
        names::FUNCTION_EDGE_MD_INDEX_BOTTOM_UP => 0.65,
        names::FUNCTION_STRING_REFERENCES => 0.5,
        names::FUNCTION_CALL_SEQUENCE => 0.6,
        names::FUNCTION_ADDRESS_SEQUENCE => 0.1,
        names::FUNCTION_NAME_HASH => 1.0,
        names::FUNCTION_MANUAL => 1.0,
        names::FUNCTION_CALL_REFERENCE => 0.75,
        names::BASIC_BLOCK_PRIME_SIGNATURE => 0.9,
        names::BASIC_BLOCK_MD_INDEX => 0.8,
        names::BASIC_BLOCK_HASH => 1.0,
        names::BASIC_BLOCK_ENTRY_POINT => 0.8,
        names::BASIC_BLOCK_EXIT_POINT => 0.7,
        names::BASIC_BLOCK_INSTRUCTION_COUNT => 0.4,
        names::BASIC_BLOCK_PROPAGATION => 0.0,
        _ => 0.0,
    }
}

/// Builds the ordered function step list declared by the config. Unknown
/// step names are skipped with a warning.
pub fn function_steps(config: &MatchingConfig) -> Vec<Box<dyn FunctionStep>> {
    let mut steps: Vec<Box<dyn FunctionStep>> = Vec::new();
    for declared in &config.function_matching {
        let confidence = declared
            .confidence
            .unwrap_or_else(|| default_confidence(&declared.name));
        match function::make_step(&declared.name, confidence) {
            Some(step) => steps.push(step),
            None => warn!("unknown function matching step '{}'", declared.name),
        }
    }
    steps
}

/// Builds the ordered basic-block step list declared by the config.
pub fn basic_block_steps(config: &MatchingConfig) -> Vec<Box<dyn BasicBlockStep>> {
    let mut steps: Vec<Box<dyn BasicBlockStep>> = Vec::new();
    for declared in &config.basic_block_matching {
        let confidence = declared
            .confidence
            .unwrap_or_else(|| default_confidence(&declared.name));
        match basic_block::make_step(&declared.name, confidence) {
            Some(step) => steps.push(step),
            None => warn!("unknown basic block matching step '{}'", declared.name),
        }
    }
    steps
}

/// Per-step confidence weights for scoring: every declared step plus the
/// pinned special cases (propagation 0.0, call reference 0.75, manual
/// 1.0).
pub fn step_confidences(config: &MatchingConfig) -> Confidences {
    let mut confidences = Confidences::new();
    for step in function_steps(config) {
        confidences.insert(step.name(), step.confidence());
    }
    for step in basic_block_steps(config) {
        confidences.insert(step.name(), step.confidence());
    }
    confidences.insert(names::BASIC_BLOCK_PROPAGATION, 0.0);
    confidences.insert(names::FUNCTION_CALL_REFERENCE, 0.75);
    confidences.insert(names::FUNCTION_MANUAL, 1.0);
    confidences
}

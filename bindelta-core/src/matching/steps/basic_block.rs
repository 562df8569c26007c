//! Basic-block matching steps
//!
//! The same unique-bucket scheme as the function level, one level down:
//! inside a committed function pair, unmatched basic blocks of both CFGs
//! are bucketed by per-block features and unique buckets become nested
//! basic-block fixed points. The terminal propagation step pairs leftover
//! blocks whose matched neighbors pin them down uniquely.

use std::collections::{BTreeMap, BTreeSet};

use crate::graph::digraph::DiGraph;
use crate::matching::context::MatchingContext;
use crate::matching::fixed_points::{FixedPoint, FixedPointKey};
use crate::matching::steps::{names, BasicBlockStep, FloatKey};

/// Builds one basic-block step by its stable name.
pub(super) fn make_step(name: &str, confidence: f64) -> Option<Box<dyn BasicBlockStep>> {
    match name {
        names::BASIC_BLOCK_PRIME_SIGNATURE => Some(Box::new(PrimeSignatureStep { confidence })),
        names::BASIC_BLOCK_MD_INDEX => Some(Box::new(MdIndexStep { confidence })),
        names::BASIC_BLOCK_HASH => Some(Box::new(HashStep { confidence })),
        names::BASIC_BLOCK_ENTRY_POINT => Some(Box::new(EntryPointStep { confidence })),
        names::BASIC_BLOCK_EXIT_POINT => Some(Box::new(ExitPointStep { confidence })),
        names::BASIC_BLOCK_INSTRUCTION_COUNT => {
            Some(Box::new(InstructionCountStep { confidence }))
        }
        names::BASIC_BLOCK_PROPAGATION => Some(Box::new(PropagationStep { confidence })),
        _ => None,
    }
}

/// Runs the flow-graph step list over one function fixed point.
pub fn match_basic_blocks(
    key: FixedPointKey,
    context: &mut MatchingContext,
    steps: &[Box<dyn BasicBlockStep>],
) {
    for index in 0..steps.len() {
        let Some((primary_candidates, secondary_candidates)) = unmatched_vertices(context, key)
        else {
            return;
        };
        if primary_candidates.is_empty() || secondary_candidates.is_empty() {
            return;
        }
        steps[index].find_basic_block_fixed_points(
            key,
            context,
            &primary_candidates,
            &secondary_candidates,
            &steps[index + 1..],
        );
    }
}

fn unmatched_vertices(
    context: &MatchingContext,
    key: FixedPointKey,
) -> Option<(BTreeSet<u32>, BTreeSet<u32>)> {
    let fixed_point = context.fixed_points.get(key)?;
    let primary = context.primary.flow_graph(fixed_point.primary());
    let secondary = context.secondary.flow_graph(fixed_point.secondary());
    let primary_candidates = (0..primary.basic_block_count() as u32)
        .filter(|&vertex| fixed_point.secondary_vertex_for(vertex).is_none())
        .collect();
    let secondary_candidates = (0..secondary.basic_block_count() as u32)
        .filter(|&vertex| fixed_point.primary_vertex_for(vertex).is_none())
        .collect();
    Some((primary_candidates, secondary_candidates))
}

/// Commits one basic-block pair, computing its instruction LCS. Returns
/// false when either vertex is already consumed.
pub(crate) fn add_basic_block(
    context: &mut MatchingContext,
    key: FixedPointKey,
    primary_vertex: u32,
    secondary_vertex: u32,
    step_name: &'static str,
    strict: bool,
) -> bool {
    let Some(fixed_point) = context.fixed_points.get(key) else {
        return false;
    };
    let (primary_id, secondary_id) = (fixed_point.primary(), fixed_point.secondary());
    let primary_program = context.primary;
    let secondary_program = context.secondary;
    let primary = primary_program.flow_graph(primary_id);
    let secondary = secondary_program.flow_graph(secondary_id);
    let Some(fixed_point) = context.fixed_points.get_mut(key) else {
        return false;
    };
    fixed_point.add_basic_block(
        primary,
        secondary,
        primary_vertex,
        secondary_vertex,
        step_name,
        strict,
    )
}

/// Shared unique-bucket commit loop with drill-down, basic-block flavor.
fn match_unique_buckets<K: Ord>(
    step: &dyn BasicBlockStep,
    key: FixedPointKey,
    primary_buckets: &BTreeMap<K, Vec<u32>>,
    secondary_buckets: &BTreeMap<K, Vec<u32>>,
    context: &mut MatchingContext,
    remaining: &[Box<dyn BasicBlockStep>],
) -> bool {
    let mut discovered = false;
    for (feature, primary_vertices) in primary_buckets {
        let Some(secondary_vertices) = secondary_buckets.get(feature) else {
            continue;
        };
        if primary_vertices.len() > 1 || secondary_vertices.len() > 1 {
            let Some((next, rest)) = remaining.split_first() else {
                continue;
            };
            let Some(fixed_point) = context.fixed_points.get(key) else {
                continue;
            };
            let primary_set: BTreeSet<u32> = primary_vertices
                .iter()
                .copied()
                .filter(|&vertex| fixed_point.secondary_vertex_for(vertex).is_none())
                .collect();
            let secondary_set: BTreeSet<u32> = secondary_vertices
                .iter()
                .copied()
                .filter(|&vertex| fixed_point.primary_vertex_for(vertex).is_none())
                .collect();
            if !primary_set.is_empty() && !secondary_set.is_empty() {
                discovered |= next.find_basic_block_fixed_points(
                    key,
                    context,
                    &primary_set,
                    &secondary_set,
                    rest,
                );
            }
            continue;
        }
        discovered |= add_basic_block(
            context,
            key,
            primary_vertices[0],
            secondary_vertices[0],
            step.name(),
            step.strict(),
        );
    }
    discovered
}

/// Buckets candidate vertices of one side by a per-block feature.
fn bucket_vertices<K: Ord>(
    flow_graph: &crate::graph::flow_graph::FlowGraph,
    candidates: &BTreeSet<u32>,
    mut feature: impl FnMut(&crate::graph::flow_graph::FlowGraph, u32) -> Option<K>,
) -> BTreeMap<K, Vec<u32>> {
    let mut buckets: BTreeMap<K, Vec<u32>> = BTreeMap::new();
    for &vertex in candidates {
        if let Some(key) = feature(flow_graph, vertex) {
            buckets.entry(key).or_default().push(vertex);
        }
    }
    buckets
}

/// Resolves the two flow graphs of a fixed point.
fn flow_graphs<'p>(
    context: &MatchingContext<'p>,
    key: FixedPointKey,
) -> Option<(
    &'p crate::graph::flow_graph::FlowGraph,
    &'p crate::graph::flow_graph::FlowGraph,
)> {
    let fixed_point = context.fixed_points.get(key)?;
    let primary_program = context.primary;
    let secondary_program = context.secondary;
    Some((
        primary_program.flow_graph(fixed_point.primary()),
        secondary_program.flow_graph(fixed_point.secondary()),
    ))
}

macro_rules! bucketing_step {
    ($type:ident, $name:expr, $display:expr, $strict:expr, $feature:expr) => {
        struct $type {
            confidence: f64,
        }

        impl BasicBlockStep for $type {
            fn name(&self) -> &'static str {
                $name
            }

            fn display_name(&self) -> &'static str {
                $display
            }

            fn confidence(&self) -> f64 {
                self.confidence
            }

            fn strict(&self) -> bool {
                $strict
            }

            fn find_basic_block_fixed_points(
                &self,
                key: FixedPointKey,
                context: &mut MatchingContext,
                primary_candidates: &BTreeSet<u32>,
                secondary_candidates: &BTreeSet<u32>,
                remaining: &[Box<dyn BasicBlockStep>],
            ) -> bool {
                let Some((primary, secondary)) = flow_graphs(context, key) else {
                    return false;
                };
                let feature = $feature(context);
                let primary_buckets = bucket_vertices(primary, primary_candidates, &feature);
                let secondary_buckets = bucket_vertices(secondary, secondary_candidates, &feature);
                match_unique_buckets(
                    self,
                    key,
                    &primary_buckets,
                    &secondary_buckets,
                    context,
                    remaining,
                )
            }
        }
    };
}

bucketing_step!(
    PrimeSignatureStep,
    names::BASIC_BLOCK_PRIME_SIGNATURE,
    "Basic Block: Prime Signature",
    false,
    |_context: &MatchingContext| {
        |fg: &crate::graph::flow_graph::FlowGraph, vertex: u32| fg.basic_block_prime_signature(vertex)
    }
);

bucketing_step!(
    MdIndexStep,
    names::BASIC_BLOCK_MD_INDEX,
    "Basic Block: MD Index",
    false,
    |_context: &MatchingContext| {
        |fg: &crate::graph::flow_graph::FlowGraph, vertex: u32| {
            let value = fg.basic_block_md_index(vertex);
            (value != 0.0).then_some(FloatKey(value))
        }
    }
);

bucketing_step!(
    HashStep,
    names::BASIC_BLOCK_HASH,
    "Basic Block: Hash",
    true,
    |context: &MatchingContext| {
        let minimum = context.config.min_basic_block_instructions as usize;
        move |fg: &crate::graph::flow_graph::FlowGraph, vertex: u32| {
            if fg.instruction_count(vertex) < minimum {
                return None;
            }
            fg.basic_block_byte_hash(vertex)
        }
    }
);

bucketing_step!(
    EntryPointStep,
    names::BASIC_BLOCK_ENTRY_POINT,
    "Basic Block: Entry Point",
    false,
    |_context: &MatchingContext| {
        |fg: &crate::graph::flow_graph::FlowGraph, vertex: u32| {
            (vertex == fg.entry_vertex()).then_some(1u8)
        }
    }
);

bucketing_step!(
    ExitPointStep,
    names::BASIC_BLOCK_EXIT_POINT,
    "Basic Block: Exit Point",
    false,
    |_context: &MatchingContext| {
        |fg: &crate::graph::flow_graph::FlowGraph, vertex: u32| {
            (fg.graph().out_degree(vertex) == 0).then_some(1u8)
        }
    }
);

bucketing_step!(
    InstructionCountStep,
    names::BASIC_BLOCK_INSTRUCTION_COUNT,
    "Basic Block: Instruction Count",
    false,
    |_context: &MatchingContext| {
        |fg: &crate::graph::flow_graph::FlowGraph, vertex: u32| {
            let count = fg.instruction_count(vertex);
            (count > 0).then_some(count as u64)
        }
    }
);

/// Terminal step: repeatedly pairs blocks that are the single unmatched
/// successor (or predecessor) of an already matched pair on both sides.
struct PropagationStep {
    confidence: f64,
}

/// The single unmatched proper neighbor of `vertex`, if it is unique.
/// Duplicate edges and self-loops do not contribute.
fn sole_unmatched_neighbor(
    graph: &DiGraph,
    fixed_point: &FixedPoint,
    vertex: u32,
    primary_side: bool,
    successors: bool,
) -> Option<u32> {
    let edges = if successors {
        graph.out_edges(vertex)
    } else {
        graph.in_edges(vertex)
    };
    let mut unmatched: Option<u32> = None;
    for &edge in edges {
        if graph.is_duplicate(edge) || graph.is_circular(edge) {
            continue;
        }
        let neighbor = if successors {
            graph.target(edge)
        } else {
            graph.source(edge)
        };
        let consumed = if primary_side {
            fixed_point.secondary_vertex_for(neighbor).is_some()
        } else {
            fixed_point.primary_vertex_for(neighbor).is_some()
        };
        if consumed {
            continue;
        }
        match unmatched {
            None => unmatched = Some(neighbor),
            Some(existing) if existing == neighbor => {}
            Some(_) => return None,
        }
    }
    unmatched
}

impl BasicBlockStep for PropagationStep {
    fn name(&self) -> &'static str {
        names::BASIC_BLOCK_PROPAGATION
    }

    fn display_name(&self) -> &'static str {
        "Basic Block: Propagation"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_basic_block_fixed_points(
        &self,
        key: FixedPointKey,
        context: &mut MatchingContext,
        _primary_candidates: &BTreeSet<u32>,
        _secondary_candidates: &BTreeSet<u32>,
        _remaining: &[Box<dyn BasicBlockStep>],
    ) -> bool {
        let mut discovered = false;
        loop {
            let mut additions: Vec<(u32, u32)> = Vec::new();
            {
                let Some(fixed_point) = context.fixed_points.get(key) else {
                    break;
                };
                let Some((primary, secondary)) = flow_graphs(context, key) else {
                    break;
                };
                for basic_block in fixed_point.basic_blocks() {
                    for successors in [true, false] {
                        let candidate_primary = sole_unmatched_neighbor(
                            primary.graph(),
                            fixed_point,
                            basic_block.primary_vertex,
                            true,
                            successors,
                        );
                        let candidate_secondary = sole_unmatched_neighbor(
                            secondary.graph(),
                            fixed_point,
                            basic_block.secondary_vertex,
                            false,
                            successors,
                        );
                        if let (Some(primary_vertex), Some(secondary_vertex)) =
                            (candidate_primary, candidate_secondary)
                        {
                            additions.push((primary_vertex, secondary_vertex));
                        }
                    }
                }
            }
            let mut added = false;
            for (primary_vertex, secondary_vertex) in additions {
                added |= add_basic_block(
                    context,
                    key,
                    primary_vertex,
                    secondary_vertex,
                    names::BASIC_BLOCK_PROPAGATION,
                    false,
                );
            }
            if !added {
                break;
            }
            discovered = true;
        }
        discovered
    }
}

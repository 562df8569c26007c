//! Matching driver
//!
//! The outer loop consumes the configured step list front-to-back. Each
//! step first runs over the full unmatched function sets, then a
//! propagation loop re-applies it to the unmatched children and parents of
//! *all* fixed points until no new match appears: committing a match can
//! disambiguate sibling sets that were ambiguous before, so every pass may
//! extract further matches. Finally, call-reference matching runs over the
//! fixed points the step discovered, and the classifier labels every match
//! once the step list is exhausted.

use std::collections::BTreeSet;

use crate::change_classifier;
use crate::differ::Program;
use crate::graph::digraph::INVALID_VERTEX;
use crate::matching::context::MatchingContext;
use crate::matching::fixed_points::{FixedPointKey, FixedPointStore};
use crate::matching::steps::basic_block::match_basic_blocks;
use crate::matching::steps::{names, BasicBlockStep, FunctionStep, Side};

/// Runs the complete call-graph matching pipeline.
pub fn match_call_graphs(
    context: &mut MatchingContext,
    function_steps: &[Box<dyn FunctionStep>],
    basic_block_steps: &[Box<dyn BasicBlockStep>],
) {
    let primary_all: BTreeSet<u32> = (0..context.primary.flow_graph_count() as u32).collect();
    let secondary_all: BTreeSet<u32> = (0..context.secondary.flow_graph_count() as u32).collect();

    for index in 0..function_steps.len() {
        context.new_fixed_points.clear();
        let step = &function_steps[index];
        let remaining = &function_steps[index + 1..];

        step.find_fixed_points(
            &primary_all,
            &secondary_all,
            context,
            remaining,
            basic_block_steps,
        );

        // Propagation: iterate over all fixed points, children first, then
        // parents, until a full pass discovers nothing new.
        loop {
            let mut discovered = false;
            for parents in [false, true] {
                for key in context.fixed_points.keys() {
                    let Some((primary_relatives, secondary_relatives)) =
                        unmatched_relatives(context, key, parents)
                    else {
                        continue;
                    };
                    if primary_relatives.is_empty() || secondary_relatives.is_empty() {
                        continue;
                    }
                    discovered |= step.find_fixed_points(
                        &primary_relatives,
                        &secondary_relatives,
                        context,
                        remaining,
                        basic_block_steps,
                    );
                }
            }
            if !discovered {
                break;
            }
        }

        // Match callees through the call sites of the step's new fixed
        // points; these matches depend on context rather than intrinsic
        // features.
        let new_keys: Vec<FixedPointKey> = context.new_fixed_points.iter().copied().collect();
        for key in new_keys {
            find_call_reference_fixed_points(key, context, basic_block_steps);
        }
    }

    change_classifier::classify_changes(context);
}

/// Unmatched children (or parents) of both sides of a fixed point,
/// skipping duplicate call edges. Self-loops fall out naturally: the
/// function itself is already matched.
fn unmatched_relatives(
    context: &MatchingContext,
    key: FixedPointKey,
    parents: bool,
) -> Option<(BTreeSet<u32>, BTreeSet<u32>)> {
    let fixed_point = context.fixed_points.get(key)?;
    let primary = collect_relatives(
        context.primary,
        &context.fixed_points,
        Side::Primary,
        fixed_point.primary(),
        parents,
    );
    let secondary = collect_relatives(
        context.secondary,
        &context.fixed_points,
        Side::Secondary,
        fixed_point.secondary(),
        parents,
    );
    Some((primary, secondary))
}

fn collect_relatives(
    program: &Program,
    fixed_points: &FixedPointStore,
    side: Side,
    flow_graph: u32,
    parents: bool,
) -> BTreeSet<u32> {
    let mut relatives = BTreeSet::new();
    let vertex = program.flow_graph(flow_graph).call_graph_vertex();
    if vertex == INVALID_VERTEX {
        return relatives;
    }
    let call_graph = &program.call_graph;
    let graph = call_graph.graph();
    let edges = if parents {
        graph.in_edges(vertex)
    } else {
        graph.out_edges(vertex)
    };
    for &edge in edges {
        if call_graph.is_duplicate(edge) {
            continue;
        }
        let neighbor = if parents {
            graph.source(edge)
        } else {
            graph.target(edge)
        };
        let Some(relative) = call_graph.flow_graph(neighbor) else {
            continue;
        };
        let entry = program.flow_graph(relative).entry_point();
        let matched = match side {
            Side::Primary => fixed_points.is_primary_matched(entry),
            Side::Secondary => fixed_points.is_secondary_matched(entry),
        };
        if !matched {
            relatives.insert(relative);
        }
    }
    relatives
}

/// Pairs the callees reached from matched call sites of `key`.
///
/// Call targets are aligned positionally inside each matched basic block;
/// a pair commits when both callees are unmatched and their local features
/// agree (equal real names, equal prime signatures, or equal non-zero MD
/// indices).
pub fn find_call_reference_fixed_points(
    key: FixedPointKey,
    context: &mut MatchingContext,
    basic_block_steps: &[Box<dyn BasicBlockStep>],
) -> bool {
    let mut candidate_pairs: Vec<(u32, u32)> = Vec::new();
    {
        let Some(fixed_point) = context.fixed_points.get(key) else {
            return false;
        };
        let primary = context.primary.flow_graph(fixed_point.primary());
        let secondary = context.secondary.flow_graph(fixed_point.secondary());
        for basic_block in fixed_point.basic_blocks() {
            let primary_targets = primary.call_targets(basic_block.primary_vertex);
            let secondary_targets = secondary.call_targets(basic_block.secondary_vertex);
            if primary_targets.len() != secondary_targets.len() {
                continue;
            }
            for (&primary_callee, &secondary_callee) in
                primary_targets.iter().zip(secondary_targets.iter())
            {
                if context.fixed_points.is_primary_matched(primary_callee)
                    || context.fixed_points.is_secondary_matched(secondary_callee)
                {
                    continue;
                }
                let Some(primary_id) = context.primary.flow_graph_by_entry(primary_callee) else {
                    continue;
                };
                let Some(secondary_id) = context.secondary.flow_graph_by_entry(secondary_callee)
                else {
                    continue;
                };
                if callees_agree(context, primary_id, secondary_id) {
                    candidate_pairs.push((primary_id, secondary_id));
                }
            }
        }
    }

    let mut discovered = false;
    for (primary_id, secondary_id) in candidate_pairs {
        let Some(new_key) =
            context.add_fixed_point(primary_id, secondary_id, names::FUNCTION_CALL_REFERENCE)
        else {
            continue;
        };
        match_basic_blocks(new_key, context, basic_block_steps);
        context.refresh_scores(new_key);
        discovered = true;
    }
    discovered
}

fn callees_agree(context: &MatchingContext, primary_id: u32, secondary_id: u32) -> bool {
    let primary = context.primary.flow_graph(primary_id);
    let secondary = context.secondary.flow_graph(secondary_id);
    if primary.has_real_name() && secondary.has_real_name() && primary.name() == secondary.name()
    {
        return true;
    }
    if primary.prime_signature().is_some()
        && primary.prime_signature() == secondary.prime_signature()
    {
        return true;
    }
    primary.md_index() != 0.0 && primary.md_index() == secondary.md_index()
}

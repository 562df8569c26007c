//! Change classification
//!
//! Labels every matched function pair with the kinds of change observed
//! between the two versions. Classification is read-only on the store and
//! pure: recomputing it yields the same flags.
//!
//! The rendered mask is seven characters, `GIOJELC`, one position per
//! flag, `-` for absent.

use crate::differ::Program;
use crate::graph::flow_graph::FlowGraph;
use crate::matching::context::MatchingContext;
use crate::matching::fixed_points::{BasicBlockFixedPoint, FixedPoint, FixedPointStore};

/// Basic-block or edge counts differ, or a primary edge has an unmatched
/// endpoint.
pub const CHANGE_STRUCTURAL: u32 = 1 << 0;
/// Some matched basic block has unmatched instructions.
pub const CHANGE_INSTRUCTIONS: u32 = 1 << 1;
/// Reserved: operand-level changes are not diagnosed.
pub const CHANGE_OPERANDS: u32 = 1 << 2;
/// A conditional branch was inverted (`jz` <-> `jnz` and similar).
pub const CHANGE_BRANCH_INVERSION: u32 = 1 << 3;
/// The entry basic blocks are not matched together or differ.
pub const CHANGE_ENTRY_POINT: u32 = 1 << 4;
/// Loop counts differ.
pub const CHANGE_LOOPS: u32 = 1 << 5;
/// A matched call site resolves to callees that are not matched together.
pub const CHANGE_CALLS: u32 = 1 << 6;

pub const CHANGE_COUNT: usize = 7;

const CHANGE_LETTERS: [char; CHANGE_COUNT] = ['G', 'I', 'O', 'J', 'E', 'L', 'C'];

/// Renders the 7-character change mask.
pub fn change_description(flags: u32) -> String {
    CHANGE_LETTERS
        .iter()
        .enumerate()
        .map(|(bit, &letter)| {
            if flags & (1 << bit) != 0 {
                letter
            } else {
                '-'
            }
        })
        .collect()
}

/// Classifies every fixed point in the store.
pub fn classify_changes(context: &mut MatchingContext) {
    for key in context.fixed_points.keys() {
        let Some(fixed_point) = context.fixed_points.get(key) else {
            continue;
        };
        let primary = context.primary.flow_graph(fixed_point.primary());
        let secondary = context.secondary.flow_graph(fixed_point.secondary());
        let flags = classify_fixed_point(
            fixed_point,
            primary,
            secondary,
            &context.fixed_points,
            context.primary,
            context.secondary,
        );
        if let Some(fixed_point) = context.fixed_points.get_mut(key) {
            fixed_point.set_flags(flags);
        }
    }
}

fn instructions_changed(
    primary: &FlowGraph,
    secondary: &FlowGraph,
    basic_block: &BasicBlockFixedPoint,
) -> bool {
    let matched = basic_block.instruction_matches().len();
    primary.instruction_count(basic_block.primary_vertex) != matched
        || secondary.instruction_count(basic_block.secondary_vertex) != matched
}

fn is_branch_inversion(
    primary: &FlowGraph,
    secondary: &FlowGraph,
    basic_block: &BasicBlockFixedPoint,
) -> bool {
    let matches = basic_block.instruction_matches();
    let matched = matches.len() as i64;
    let primary_count = primary.instruction_count(basic_block.primary_vertex) as i64;
    let secondary_count = secondary.instruction_count(basic_block.secondary_vertex) as i64;
    if (secondary_count - matched).abs() > 1 || (primary_count - matched).abs() > 1 {
        return false;
    }

    let primary_block = primary.basic_block(basic_block.primary_vertex);
    let secondary_block = secondary.basic_block(basic_block.secondary_vertex);
    if !matches.is_empty() {
        // All matches but the last must align with the leading
        // instructions of both blocks; only the terminator may differ.
        for (offset, instruction_match) in matches[..matches.len() - 1].iter().enumerate() {
            if instruction_match.primary != primary_block.instruction_start + offset as u32
                || instruction_match.secondary
                    != secondary_block.instruction_start + offset as u32
            {
                return false;
            }
        }
        // A single match that is the terminator itself means the branch
        // survived and something else changed.
        if matches.len() == 1
            && matches[0].primary == primary_block.instruction_end.saturating_sub(1)
        {
            return false;
        }
    }

    let primary_out = primary.graph().out_degree(basic_block.primary_vertex);
    let secondary_out = secondary.graph().out_degree(basic_block.secondary_vertex);
    primary_out == secondary_out && primary_out >= 2
}

fn calls_changed(
    fixed_point: &FixedPoint,
    primary: &FlowGraph,
    secondary: &FlowGraph,
    fixed_points: &FixedPointStore,
    primary_program: &Program,
    secondary_program: &Program,
) -> bool {
    for basic_block in fixed_point.basic_blocks() {
        let primary_targets = primary.call_targets(basic_block.primary_vertex);
        let secondary_targets = secondary.call_targets(basic_block.secondary_vertex);
        if primary_targets.len() != secondary_targets.len() {
            // Differing call counts are diagnosed as structural or
            // instruction changes, not as call-target changes.
            continue;
        }
        for (&primary_callee, &secondary_callee) in
            primary_targets.iter().zip(secondary_targets.iter())
        {
            let primary_vertex = primary_program.call_graph.vertex_by_address(primary_callee);
            let secondary_vertex = secondary_program
                .call_graph
                .vertex_by_address(secondary_callee);
            if primary_vertex == crate::graph::digraph::INVALID_VERTEX
                || secondary_vertex == crate::graph::digraph::INVALID_VERTEX
            {
                continue;
            }
            let primary_target = primary_program.call_graph.flow_graph(primary_vertex);
            let secondary_target = secondary_program.call_graph.flow_graph(secondary_vertex);
            let (Some(primary_target), Some(secondary_target)) =
                (primary_target, secondary_target)
            else {
                return true;
            };
            let entry = primary_program.flow_graph(primary_target).entry_point();
            match fixed_points.by_primary(entry) {
                Some(target_fixed_point)
                    if target_fixed_point.secondary() == secondary_target => {}
                _ => return true,
            }
        }
    }
    false
}

/// Computes the change flags of one fixed point.
pub fn classify_fixed_point(
    fixed_point: &FixedPoint,
    primary: &FlowGraph,
    secondary: &FlowGraph,
    fixed_points: &FixedPointStore,
    primary_program: &Program,
    secondary_program: &Program,
) -> u32 {
    let mut flags = 0u32;

    if primary.basic_block_count() != secondary.basic_block_count()
        || primary.edge_count() != secondary.edge_count()
    {
        flags |= CHANGE_STRUCTURAL;
    }
    if flags & CHANGE_STRUCTURAL == 0 {
        // Counts are equal here, so checking primary edges suffices.
        let graph = primary.graph();
        for edge in 0..graph.edge_count() as u32 {
            if fixed_point.secondary_vertex_for(graph.source(edge)).is_none()
                || fixed_point.secondary_vertex_for(graph.target(edge)).is_none()
            {
                flags |= CHANGE_STRUCTURAL;
                break;
            }
        }
    }

    for basic_block in fixed_point.basic_blocks() {
        if instructions_changed(primary, secondary, basic_block) {
            flags |= CHANGE_INSTRUCTIONS;
            if flags & CHANGE_BRANCH_INVERSION == 0
                && is_branch_inversion(primary, secondary, basic_block)
            {
                flags |= CHANGE_BRANCH_INVERSION;
            }
        }
    }

    if calls_changed(
        fixed_point,
        primary,
        secondary,
        fixed_points,
        primary_program,
        secondary_program,
    ) {
        flags |= CHANGE_CALLS;
    }

    // Entry-point check; fires even when the difference is already covered
    // by other flags.
    if primary.basic_block_count() > 0 {
        let entry_vertex = primary.entry_vertex();
        match fixed_point.basic_block_by_primary(entry_vertex) {
            Some(entry_match) => {
                if secondary.entry_vertex() != entry_match.secondary_vertex
                    || instructions_changed(primary, secondary, entry_match)
                {
                    flags |= CHANGE_ENTRY_POINT;
                }
            }
            None => flags |= CHANGE_ENTRY_POINT,
        }
    }

    if primary.loop_count() != secondary.loop_count() {
        flags |= CHANGE_LOOPS;
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_has_fixed_width_and_alphabet() {
        assert_eq!(change_description(0), "-------");
        assert_eq!(change_description(CHANGE_STRUCTURAL), "G------");
        assert_eq!(
            change_description(CHANGE_INSTRUCTIONS | CHANGE_BRANCH_INVERSION),
            "-I-J---"
        );
        let all = (1 << CHANGE_COUNT) - 1;
        assert_eq!(change_description(all), "GIOJELC");
        for flags in [0u32, CHANGE_LOOPS, all] {
            let description = change_description(flags);
            assert_eq!(description.len(), CHANGE_COUNT);
            assert!(description
                .chars()
                .all(|c| "GIOJELC-".contains(c)));
        }
    }
}

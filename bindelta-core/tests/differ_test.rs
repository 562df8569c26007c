// End-to-end scenarios over small synthetic call graphs.
mod utils;

use bindelta_core::change_classifier::{change_description, CHANGE_STRUCTURAL};
use bindelta_core::config::MatchingConfig;
use bindelta_core::differ;
use bindelta_core::graph::flow_graph::FlowEdgeKind::{
    ConditionalFalse, ConditionalTrue, Unconditional,
};
use bindelta_core::matching::incremental;
use bindelta_core::matching::steps::{self, names};
use bindelta_core::payload::BasicBlockPayload;

use utils::{flow_graph, load_pair, payload, singleton_program, vertex};

#[test]
fn identical_singleton_matches_via_hash() {
    let (primary, secondary) = load_pair(
        singleton_program(0x1000, "entry", &["push", "mov", "ret"]),
        singleton_program(0x1000, "entry", &["push", "mov", "ret"]),
    );
    let config = MatchingConfig::default();
    let context = differ::diff(&primary, &secondary, &config).unwrap();

    assert_eq!(context.fixed_points.len(), 1);
    let fixed_point = context.fixed_points.by_primary(0x1000).unwrap();
    assert_eq!(fixed_point.secondary_entry(), 0x1000);
    assert_eq!(fixed_point.step(), names::FUNCTION_HASH);
    assert_eq!(fixed_point.similarity(), 1.0);
    assert!(fixed_point.confidence() > 0.0);

    let scores = differ::score(&context);
    assert!(scores.similarity > 0.0);
}

#[test]
fn renamed_function_still_matches_with_full_similarity() {
    let (primary, secondary) = load_pair(
        singleton_program(0x1000, "old_name", &["push", "mov", "ret"]),
        singleton_program(0x2000, "new_name", &["push", "mov", "ret"]),
    );
    let config = MatchingConfig::default();
    let context = differ::diff(&primary, &secondary, &config).unwrap();

    assert_eq!(context.fixed_points.len(), 1);
    let fixed_point = context.fixed_points.by_primary(0x1000).unwrap();
    assert_eq!(fixed_point.secondary_entry(), 0x2000);
    assert_eq!(fixed_point.step(), names::FUNCTION_HASH);
    assert_eq!(fixed_point.similarity(), 1.0);
}

/// jz -> jnz swap in a non-entry block with out-degree two.
#[test]
fn branch_inversion_is_flagged() {
    let shape: fn(&str) -> bindelta_core::payload::FlowGraphPayload = |branch| {
        flow_graph(
            0x1000,
            &[&["push"], &["cmp", branch], &["nop", "ret"], &["xor", "ret"]],
            &[
                (0, 1, Unconditional),
                (1, 2, ConditionalTrue),
                (1, 3, ConditionalFalse),
            ],
        )
    };
    let (primary, secondary) = load_pair(
        payload(vec![vertex(0x1000, Some("f"))], &[], vec![shape("jz")]),
        payload(vec![vertex(0x1000, Some("f"))], &[], vec![shape("jnz")]),
    );
    let config = MatchingConfig::default();
    let context = differ::diff(&primary, &secondary, &config).unwrap();

    assert_eq!(context.fixed_points.len(), 1);
    let fixed_point = context.fixed_points.by_primary(0x1000).unwrap();
    assert_eq!(fixed_point.basic_block_count(), 4);
    assert_eq!(change_description(fixed_point.flags()), "-I-J---");
}

#[test]
fn added_unreachable_block_is_structural() {
    let primary_payload = payload(
        vec![vertex(0x1000, Some("f"))],
        &[],
        vec![flow_graph(
            0x1000,
            &[&["push"], &["ret"]],
            &[(0, 1, Unconditional)],
        )],
    );
    let mut secondary_flow_graph = flow_graph(
        0x1000,
        &[&["push"], &["ret"]],
        &[(0, 1, Unconditional)],
    );
    secondary_flow_graph
        .instructions
        .push(utils::instruction(0x1002, "int3"));
    secondary_flow_graph.basic_blocks.push(BasicBlockPayload {
        address: 0x1002,
        instruction_start: 2,
        instruction_end: 3,
        call_targets: Vec::new(),
        string_refs: Vec::new(),
    });
    let secondary_payload = payload(
        vec![vertex(0x1000, Some("f"))],
        &[],
        vec![secondary_flow_graph],
    );

    let (primary, secondary) = load_pair(primary_payload, secondary_payload);
    let config = MatchingConfig::default();
    let context = differ::diff(&primary, &secondary, &config).unwrap();

    assert_eq!(context.fixed_points.len(), 1);
    let fixed_point = context.fixed_points.by_primary(0x1000).unwrap();
    assert!(fixed_point.has_flag(CHANGE_STRUCTURAL));
    assert!(fixed_point.similarity() > 0.0);
    assert!(fixed_point.similarity() < 1.0);
}

fn ambiguous_md_payloads() -> (
    bindelta_core::payload::ProgramPayload,
    bindelta_core::payload::ProgramPayload,
) {
    // Two functions per side with identical CFG topology (hence identical
    // MD indices) but different instruction bytes.
    let side = || {
        payload(
            vec![vertex(0x1000, None), vertex(0x2000, None)],
            &[],
            vec![
                flow_graph(0x1000, &[&["mov"], &["ret"]], &[(0, 1, Unconditional)]),
                flow_graph(0x2000, &[&["xor"], &["ret"]], &[(0, 1, Unconditional)]),
            ],
        )
    };
    (side(), side())
}

#[test]
fn ambiguous_md_index_bucket_is_resolved_by_hash() {
    let (primary_payload, secondary_payload) = ambiguous_md_payloads();
    let (primary, secondary) = load_pair(primary_payload, secondary_payload);
    let config = MatchingConfig::default();
    let context = differ::diff(&primary, &secondary, &config).unwrap();

    assert_eq!(context.fixed_points.len(), 2);
    let keys = context.fixed_points.keys();
    assert_eq!(keys, vec![(0x1000, 0x1000), (0x2000, 0x2000)]);
    for fixed_point in context.fixed_points.iter() {
        assert_eq!(fixed_point.step(), names::FUNCTION_HASH);
    }
}

#[test]
fn incremental_rematch_preserves_manual_fixed_points() {
    let (primary_payload, secondary_payload) = ambiguous_md_payloads();
    let (primary, secondary) = load_pair(primary_payload, secondary_payload);
    let config = MatchingConfig::default();
    let mut context = differ::diff(&primary, &secondary, &config).unwrap();

    context
        .fixed_points
        .get_mut((0x1000, 0x1000))
        .unwrap()
        .set_step(names::FUNCTION_MANUAL);

    let function_steps = steps::function_steps(&config);
    let basic_block_steps = steps::basic_block_steps(&config);
    incremental::rematch(&mut context, &function_steps, &basic_block_steps).unwrap();

    assert_eq!(context.fixed_points.len(), 2);
    let manual = context.fixed_points.by_primary(0x1000).unwrap();
    assert_eq!(manual.step(), names::FUNCTION_MANUAL);
    let rederived = context.fixed_points.by_primary(0x2000).unwrap();
    assert_eq!(rederived.secondary_entry(), 0x2000);
    assert_ne!(rederived.step(), names::FUNCTION_MANUAL);
    // With its sibling pinned, the leftover pair is unique for the first
    // step of the list again.
    assert_eq!(rederived.step(), names::FUNCTION_MD_INDEX_TOP_DOWN);

    let scores = differ::score(&context);
    assert_eq!(scores.histogram.get(names::FUNCTION_MANUAL), Some(&1));
    assert_eq!(
        scores.histogram.get(names::FUNCTION_MD_INDEX_TOP_DOWN),
        Some(&1)
    );
}

#[test]
fn incremental_rematch_without_manual_matches_is_cancelled() {
    let (primary, secondary) = load_pair(
        singleton_program(0x1000, "f", &["ret"]),
        singleton_program(0x1000, "f", &["ret"]),
    );
    let config = MatchingConfig::default();
    let mut context = differ::diff(&primary, &secondary, &config).unwrap();

    let function_steps = steps::function_steps(&config);
    let basic_block_steps = steps::basic_block_steps(&config);
    let result = incremental::rematch(&mut context, &function_steps, &basic_block_steps);
    assert!(matches!(
        result,
        Err(bindelta_core::DiffError::Cancelled(_))
    ));
    // The store is untouched.
    assert_eq!(context.fixed_points.len(), 1);
}

#[test]
fn call_reference_matching_pairs_feature_ambiguous_callees() {
    // main calls two byte-identical leaf functions; only the call sites
    // can tell them apart.
    let side = || {
        let mut main = flow_graph(0x1000, &[&["call", "call", "ret"]], &[]);
        main.basic_blocks[0].call_targets = vec![0x2000, 0x3000];
        payload(
            vec![
                vertex(0x1000, Some("main")),
                vertex(0x2000, None),
                vertex(0x3000, None),
            ],
            &[(0, 1), (0, 2)],
            vec![
                main,
                flow_graph(0x2000, &[&["inc", "ret"]], &[]),
                flow_graph(0x3000, &[&["inc", "ret"]], &[]),
            ],
        )
    };
    let (primary, secondary) = load_pair(side(), side());
    let config = MatchingConfig::default();
    let context = differ::diff(&primary, &secondary, &config).unwrap();

    assert_eq!(context.fixed_points.len(), 3);
    let first_leaf = context.fixed_points.by_primary(0x2000).unwrap();
    assert_eq!(first_leaf.secondary_entry(), 0x2000);
    assert_eq!(first_leaf.step(), names::FUNCTION_CALL_REFERENCE);
    let second_leaf = context.fixed_points.by_primary(0x3000).unwrap();
    assert_eq!(second_leaf.secondary_entry(), 0x3000);
}

#[test]
fn parallel_call_edges_and_self_loops_do_not_break_propagation() {
    // main calls helper twice (parallel edges); helper calls itself.
    let side = || {
        let mut main = flow_graph(0x1000, &[&["call", "call", "ret"]], &[]);
        main.basic_blocks[0].call_targets = vec![0x2000, 0x2000];
        let mut helper = flow_graph(0x2000, &[&["dec", "call", "ret"]], &[]);
        helper.basic_blocks[0].call_targets = vec![0x2000];
        payload(
            vec![vertex(0x1000, Some("main")), vertex(0x2000, Some("helper"))],
            &[(0, 1), (0, 1), (1, 1)],
            vec![main, helper],
        )
    };
    let (primary, secondary) = load_pair(side(), side());
    let config = MatchingConfig::default();
    let context = differ::diff(&primary, &secondary, &config).unwrap();

    assert_eq!(context.fixed_points.len(), 2);
    assert!(context.fixed_points.by_primary(0x1000).is_some());
    let helper = context.fixed_points.by_primary(0x2000).unwrap();
    assert_eq!(helper.secondary_entry(), 0x2000);
}

#[test]
fn diffing_twice_is_bit_identical() {
    let (primary_payload, secondary_payload) = ambiguous_md_payloads();
    let (primary, secondary) = load_pair(primary_payload, secondary_payload);
    let config = MatchingConfig::default();

    let first = differ::diff(&primary, &secondary, &config).unwrap();
    let second = differ::diff(&primary, &secondary, &config).unwrap();

    assert_eq!(first.fixed_points.keys(), second.fixed_points.keys());
    for (a, b) in first.fixed_points.iter().zip(second.fixed_points.iter()) {
        assert_eq!(a.step(), b.step());
        assert_eq!(a.similarity().to_bits(), b.similarity().to_bits());
        assert_eq!(a.confidence().to_bits(), b.confidence().to_bits());
        assert_eq!(a.flags(), b.flags());
    }
    let first_scores = differ::score(&first);
    let second_scores = differ::score(&second);
    assert_eq!(
        first_scores.similarity.to_bits(),
        second_scores.similarity.to_bits()
    );
    assert_eq!(
        first_scores.confidence.to_bits(),
        second_scores.confidence.to_bits()
    );
}

#[test]
fn empty_inputs_produce_an_empty_result() {
    let (primary, secondary) = load_pair(
        payload(Vec::new(), &[], Vec::new()),
        payload(Vec::new(), &[], Vec::new()),
    );
    let config = MatchingConfig::default();
    let context = differ::diff(&primary, &secondary, &config).unwrap();

    assert_eq!(context.fixed_points.len(), 0);
    let scores = differ::score(&context);
    assert_eq!(scores.similarity, 0.0);
    assert_eq!(scores.confidence, 0.0);
}

#[test]
fn classification_is_idempotent() {
    let (primary_payload, secondary_payload) = ambiguous_md_payloads();
    let (primary, secondary) = load_pair(primary_payload, secondary_payload);
    let config = MatchingConfig::default();
    let mut context = differ::diff(&primary, &secondary, &config).unwrap();

    let before: Vec<u32> = context.fixed_points.iter().map(|fp| fp.flags()).collect();
    bindelta_core::change_classifier::classify_changes(&mut context);
    let after: Vec<u32> = context.fixed_points.iter().map(|fp| fp.flags()).collect();
    assert_eq!(before, after);
}

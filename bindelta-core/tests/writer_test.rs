// Writer round trips over a small finished diff.
mod utils;

use std::fs;

use bindelta_core::config::MatchingConfig;
use bindelta_core::differ;
use bindelta_core::graph::flow_graph::FlowEdgeKind::Unconditional;
use bindelta_core::writers::database::{DatabaseReader, DatabaseWriter, ManualMatchDatabase};
use bindelta_core::writers::groundtruth_writer::GroundtruthWriter;
use bindelta_core::writers::log_writer::ResultsLogWriter;
use bindelta_core::writers::{ChainWriter, ResultWriter};

use utils::{flow_graph, load_pair, payload, vertex};

fn sample_pair() -> (
    bindelta_core::differ::Program,
    bindelta_core::differ::Program,
) {
    let side = || {
        payload(
            vec![vertex(0x1000, Some("alpha")), vertex(0x2000, Some("beta"))],
            &[(0, 1)],
            vec![
                flow_graph(
                    0x1000,
                    &[&["push", "mov"], &["call", "ret"]],
                    &[(0, 1, Unconditional)],
                ),
                flow_graph(0x2000, &[&["xor", "ret"]], &[]),
            ],
        )
    };
    load_pair(side(), side())
}

#[test]
fn log_writer_emits_the_expected_sections() {
    let (primary, secondary) = sample_pair();
    let config = MatchingConfig::default();
    let context = differ::diff(&primary, &secondary, &config).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.results");
    ResultsLogWriter::new(&path).write(&context).unwrap();

    let report = fs::read_to_string(&path).unwrap();
    assert!(report.contains("call graph1 MD index"));
    assert!(report.contains(" --------- statistics ---------"));
    assert!(report.contains("similarity: "));
    assert!(report.contains("confidence: "));
    assert!(report.contains("00001000\t00001000"));
    assert!(report.contains("\"alpha\""));
    assert!(report.contains(" --------- unmatched primary (0) ------------ "));
    assert!(report.contains(" --------- unmatched secondary (0) ------------ "));
}

#[test]
fn groundtruth_writer_emits_one_line_per_match() {
    let (primary, secondary) = sample_pair();
    let config = MatchingConfig::default();
    let context = differ::diff(&primary, &secondary, &config).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.truth");
    GroundtruthWriter::new(&path).write(&context).unwrap();

    let truth = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = truth.lines().collect();
    assert_eq!(lines.len(), context.fixed_points.len());
    assert_eq!(lines[0], "00001000 00001000 alpha alpha");
    assert_eq!(lines[1], "00002000 00002000 beta beta");
}

#[test]
fn database_round_trip_reproduces_every_fixed_point() {
    let (primary, secondary) = sample_pair();
    let config = MatchingConfig::default();
    let context = differ::diff(&primary, &secondary, &config).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.BinDelta");
    DatabaseWriter::new(&path).write(&context).unwrap();

    let reader = DatabaseReader::open(&path).unwrap();
    let restored = reader.read(&primary, &secondary).unwrap();

    assert_eq!(restored.keys(), context.fixed_points.keys());
    for (original, loaded) in context.fixed_points.iter().zip(restored.iter()) {
        assert_eq!(original.step(), loaded.step());
        assert_eq!(original.similarity(), loaded.similarity());
        assert_eq!(original.confidence(), loaded.confidence());
        assert_eq!(original.flags(), loaded.flags());
        assert_eq!(original.comments_ported(), loaded.comments_ported());
        assert_eq!(original.basic_block_count(), loaded.basic_block_count());
        for (original_bb, loaded_bb) in original.basic_blocks().zip(loaded.basic_blocks()) {
            assert_eq!(original_bb.primary_vertex, loaded_bb.primary_vertex);
            assert_eq!(original_bb.secondary_vertex, loaded_bb.secondary_vertex);
            assert_eq!(original_bb.step(), loaded_bb.step());
            assert_eq!(
                original_bb.instruction_matches(),
                loaded_bb.instruction_matches()
            );
        }
    }

    let (similarity, confidence) = reader.scores().unwrap();
    let scores = differ::score(&context);
    assert_eq!(similarity, scores.similarity);
    assert_eq!(confidence, scores.confidence);
}

#[test]
fn chain_writer_fans_out_to_all_sinks() {
    let (primary, secondary) = sample_pair();
    let config = MatchingConfig::default();
    let context = differ::diff(&primary, &secondary, &config).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("out.results");
    let truth_path = dir.path().join("out.truth");
    let mut chain = ChainWriter::new();
    assert!(chain.is_empty());
    chain.add(Box::new(ResultsLogWriter::new(&log_path)));
    chain.add(Box::new(GroundtruthWriter::new(&truth_path)));
    chain.write(&context).unwrap();

    assert!(log_path.exists());
    assert!(truth_path.exists());
}

#[test]
fn manual_match_database_replays_the_edit_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edits.tmp");
    let edits = ManualMatchDatabase::open(&path).unwrap();
    edits.record_add(0x1000, 0x2000).unwrap();
    edits.record_add(0x3000, 0x4000).unwrap();
    edits.record_remove(0x1000, 0x2000).unwrap();
    assert_eq!(edits.pending().unwrap(), vec![(0x3000, 0x4000)]);
}

//! Matching context
//!
//! Transient aggregate of everything one diff needs: the two programs, the
//! fixed-point store, the set of fixed points discovered by the current
//! step, and a small typed cache of per-step features keyed by a closed
//! enum. Cache entries die with the context.

use std::collections::BTreeSet;

use crate::config::MatchingConfig;
use crate::differ::Program;
use crate::error::{DiffError, Result};
use crate::graph::topology::Direction;
use crate::matching::fixed_points::{FixedPointKey, FixedPointStore};
use crate::matching::steps::{self, names};
use crate::statistics::{self, Confidences};

/// Cached per-edge feature used by the edge-keyed matching steps: the MD
/// indices of the flow graphs on both ends plus the call-graph edge's own
/// MD contribution.
#[derive(Debug, Clone, Copy)]
pub struct EdgeFeature {
    pub edge: u32,
    pub source_flow_graph: u32,
    pub target_flow_graph: u32,
    pub source_value: f64,
    pub target_value: f64,
    pub md_index: f64,
}

/// Closed set of cache slots; each consumer owns a distinct id so slots
/// never conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureId {
    EdgesTopDownPrimary = 0,
    EdgesTopDownSecondary = 1,
    EdgesBottomUpPrimary = 2,
    EdgesBottomUpSecondary = 3,
}

const FEATURE_SLOTS: usize = 4;

#[derive(Debug)]
enum CacheEntry {
    EdgeFeatures(Vec<EdgeFeature>),
}

/// Transient state of one diff.
pub struct MatchingContext<'p> {
    pub primary: &'p Program,
    pub secondary: &'p Program,
    pub config: &'p MatchingConfig,
    /// Per-step weights used for confidence scoring, resolved once from
    /// the config.
    pub confidences: Confidences,
    pub fixed_points: FixedPointStore,
    /// Fixed points discovered since the current step started; consumed by
    /// call-reference matching.
    pub new_fixed_points: BTreeSet<FixedPointKey>,
    features: [Option<CacheEntry>; FEATURE_SLOTS],
}

impl<'p> MatchingContext<'p> {
    pub fn new(primary: &'p Program, secondary: &'p Program, config: &'p MatchingConfig) -> Self {
        MatchingContext {
            primary,
            secondary,
            config,
            confidences: steps::step_confidences(config),
            fixed_points: FixedPointStore::new(),
            new_fixed_points: BTreeSet::new(),
            features: [None, None, None, None],
        }
    }

    /// Submits a candidate function pair to the store.
    ///
    /// Returns `None` when either side is already matched; on success the
    /// key is also recorded in `new_fixed_points`.
    pub fn add_fixed_point(
        &mut self,
        primary: u32,
        secondary: u32,
        step: &'static str,
    ) -> Option<FixedPointKey> {
        let primary_entry = self.primary.flow_graph(primary).entry_point();
        let secondary_entry = self.secondary.flow_graph(secondary).entry_point();
        let key = self
            .fixed_points
            .add(primary, secondary, primary_entry, secondary_entry, step)?;
        self.new_fixed_points.insert(key);
        Some(key)
    }

    /// Adds an externally asserted match with confidence 1.0 and runs the
    /// basic-block matcher on it.
    pub fn add_manual_fixed_point(
        &mut self,
        primary_entry: u64,
        secondary_entry: u64,
    ) -> Result<FixedPointKey> {
        let primary = self
            .primary
            .flow_graph_by_entry(primary_entry)
            .ok_or_else(|| {
                DiffError::OutOfDomain(format!("no primary function at {primary_entry:#x}"))
            })?;
        let secondary = self
            .secondary
            .flow_graph_by_entry(secondary_entry)
            .ok_or_else(|| {
                DiffError::OutOfDomain(format!("no secondary function at {secondary_entry:#x}"))
            })?;
        let key = self
            .add_fixed_point(primary, secondary, names::FUNCTION_MANUAL)
            .ok_or_else(|| {
                DiffError::InconsistentModel(format!(
                    "function already matched ({primary_entry:#x}, {secondary_entry:#x})"
                ))
            })?;
        let basic_block_steps = steps::basic_block_steps(self.config);
        steps::basic_block::match_basic_blocks(key, self, &basic_block_steps);
        if let Some(fixed_point) = self.fixed_points.get_mut(key) {
            fixed_point.set_similarity(1.0);
            fixed_point.set_confidence(1.0);
        }
        Ok(key)
    }

    /// Recomputes similarity and confidence of one fixed point from its
    /// own histogram and counts.
    pub fn refresh_scores(&mut self, key: FixedPointKey) {
        let Some(fixed_point) = self.fixed_points.get(key) else {
            return;
        };
        let primary = self.primary.flow_graph(fixed_point.primary());
        let secondary = self.secondary.flow_graph(fixed_point.secondary());
        let (counts, histogram) =
            statistics::pair_counts_and_histogram(fixed_point, primary, secondary);
        let confidence = statistics::confidence(&histogram, &self.confidences);
        let similarity = statistics::pair_similarity(
            primary,
            secondary,
            &histogram,
            &counts,
            &self.confidences,
        );
        if let Some(fixed_point) = self.fixed_points.get_mut(key) {
            fixed_point.set_confidence(confidence);
            fixed_point.set_similarity(similarity);
        }
    }

    /// Cached edge features for one side and direction, built on first
    /// use.
    pub fn edge_features(&mut self, id: FeatureId) -> &[EdgeFeature] {
        let slot = id as usize;
        if self.features[slot].is_none() {
            let (program, direction) = match id {
                FeatureId::EdgesTopDownPrimary => (self.primary, Direction::TopDown),
                FeatureId::EdgesTopDownSecondary => (self.secondary, Direction::TopDown),
                FeatureId::EdgesBottomUpPrimary => (self.primary, Direction::BottomUp),
                FeatureId::EdgesBottomUpSecondary => (self.secondary, Direction::BottomUp),
            };
            self.features[slot] = Some(CacheEntry::EdgeFeatures(build_edge_features(
                program, direction,
            )));
        }
        match &self.features[slot] {
            Some(CacheEntry::EdgeFeatures(features)) => features,
            None => &[],
        }
    }
}

/// Collects the edge features of every non-duplicate call edge whose both
/// endpoints carry a non-empty flow graph.
fn build_edge_features(program: &Program, direction: Direction) -> Vec<EdgeFeature> {
    let call_graph = &program.call_graph;
    let graph = call_graph.graph();
    let mut features = Vec::new();
    for edge in 0..graph.edge_count() as u32 {
        if call_graph.is_duplicate(edge) {
            continue;
        }
        let source = graph.source(edge);
        let target = graph.target(edge);
        let (Some(source_flow_graph), Some(target_flow_graph)) =
            (call_graph.flow_graph(source), call_graph.flow_graph(target))
        else {
            continue;
        };
        let source_fg = program.flow_graph(source_flow_graph);
        let target_fg = program.flow_graph(target_flow_graph);
        if source_fg.basic_block_count() == 0 || target_fg.basic_block_count() == 0 {
            continue;
        }
        let (source_value, target_value) = match direction {
            Direction::TopDown => (source_fg.md_index(), target_fg.md_index()),
            Direction::BottomUp => (source_fg.md_index_inverted(), target_fg.md_index_inverted()),
        };
        features.push(EdgeFeature {
            edge,
            source_flow_graph,
            target_flow_graph,
            source_value,
            target_value,
            md_index: call_graph.edge_md_index(edge, direction),
        });
    }
    features
}

//! Edge-keyed matching steps
//!
//! Instead of bucketing functions, these steps bucket call-graph edges by
//! the triple (MD index of the caller's CFG, MD index of the callee's CFG,
//! MD contribution of the call edge itself). A uniquely keyed edge commits
//! both endpoint pairs at once, which frequently resolves functions whose
//! intrinsic features are ambiguous.
//!
//! The per-edge feature vectors are computed once per graph and direction
//! and cached on the matching context; each invocation filters the cached
//! vector down to the currently relevant candidates.

use std::collections::{BTreeMap, BTreeSet};

use crate::graph::topology::Direction;
use crate::matching::context::{EdgeFeature, FeatureId, MatchingContext};
use crate::matching::steps::{
    basic_block, names, BasicBlockStep, FloatKey, FunctionStep, Side,
};

pub(super) struct EdgesMdIndexStep {
    direction: Direction,
    confidence: f64,
}

impl EdgesMdIndexStep {
    pub(super) fn new(direction: Direction, confidence: f64) -> Self {
        EdgesMdIndexStep {
            direction,
            confidence,
        }
    }

    fn feature_id(&self, side: Side) -> FeatureId {
        match (self.direction, side) {
            (Direction::TopDown, Side::Primary) => FeatureId::EdgesTopDownPrimary,
            (Direction::TopDown, Side::Secondary) => FeatureId::EdgesTopDownSecondary,
            (Direction::BottomUp, Side::Primary) => FeatureId::EdgesBottomUpPrimary,
            (Direction::BottomUp, Side::Secondary) => FeatureId::EdgesBottomUpSecondary,
        }
    }

    /// Restricts the cached feature vector to edges that still matter:
    /// both endpoints unmatched and at least one endpoint among the
    /// current candidates.
    fn relevant_features(
        context: &mut MatchingContext,
        id: FeatureId,
        side: Side,
        candidates: &BTreeSet<u32>,
    ) -> Vec<EdgeFeature> {
        let features: Vec<EdgeFeature> = context.edge_features(id).to_vec();
        features
            .into_iter()
            .filter(|feature| {
                let (source_entry, target_entry) = match side {
                    Side::Primary => (
                        context.primary.flow_graph(feature.source_flow_graph).entry_point(),
                        context.primary.flow_graph(feature.target_flow_graph).entry_point(),
                    ),
                    Side::Secondary => (
                        context
                            .secondary
                            .flow_graph(feature.source_flow_graph)
                            .entry_point(),
                        context
                            .secondary
                            .flow_graph(feature.target_flow_graph)
                            .entry_point(),
                    ),
                };
                let matched = match side {
                    Side::Primary => {
                        context.fixed_points.is_primary_matched(source_entry)
                            || context.fixed_points.is_primary_matched(target_entry)
                    }
                    Side::Secondary => {
                        context.fixed_points.is_secondary_matched(source_entry)
                            || context.fixed_points.is_secondary_matched(target_entry)
                    }
                };
                !matched
                    && (candidates.contains(&feature.source_flow_graph)
                        || candidates.contains(&feature.target_flow_graph))
            })
            .collect()
    }
}

type EdgeKey = (FloatKey, FloatKey, FloatKey);

fn bucket_edges(features: &[EdgeFeature]) -> BTreeMap<EdgeKey, Vec<&EdgeFeature>> {
    let mut buckets: BTreeMap<EdgeKey, Vec<&EdgeFeature>> = BTreeMap::new();
    for feature in features {
        let key = (
            FloatKey(feature.source_value),
            FloatKey(feature.target_value),
            FloatKey(feature.md_index),
        );
        buckets.entry(key).or_default().push(feature);
    }
    buckets
}

impl FunctionStep for EdgesMdIndexStep {
    fn name(&self) -> &'static str {
        match self.direction {
            Direction::TopDown => names::FUNCTION_EDGE_MD_INDEX_TOP_DOWN,
            Direction::BottomUp => names::FUNCTION_EDGE_MD_INDEX_BOTTOM_UP,
        }
    }

    fn display_name(&self) -> &'static str {
        match self.direction {
            Direction::TopDown => "Function: Edge MD Index (Top Down)",
            Direction::BottomUp => "Function: Edge MD Index (Bottom Up)",
        }
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary_candidates: &BTreeSet<u32>,
        secondary_candidates: &BTreeSet<u32>,
        context: &mut MatchingContext,
        _remaining: &[Box<dyn FunctionStep>],
        basic_block_steps: &[Box<dyn BasicBlockStep>],
    ) -> bool {
        let primary_features = Self::relevant_features(
            context,
            self.feature_id(Side::Primary),
            Side::Primary,
            primary_candidates,
        );
        let secondary_features = Self::relevant_features(
            context,
            self.feature_id(Side::Secondary),
            Side::Secondary,
            secondary_candidates,
        );
        let primary_buckets = bucket_edges(&primary_features);
        let secondary_buckets = bucket_edges(&secondary_features);

        let mut discovered = false;
        for (key, primary_edges) in &primary_buckets {
            let Some(secondary_edges) = secondary_buckets.get(key) else {
                continue;
            };
            // Edge buckets have no drill-down; ambiguity just means this
            // step stays silent on those edges.
            if primary_edges.len() != 1 || secondary_edges.len() != 1 {
                continue;
            }
            let primary_edge = primary_edges[0];
            let secondary_edge = secondary_edges[0];
            for (primary, secondary) in [
                (
                    primary_edge.source_flow_graph,
                    secondary_edge.source_flow_graph,
                ),
                (
                    primary_edge.target_flow_graph,
                    secondary_edge.target_flow_graph,
                ),
            ] {
                let Some(fixed_point) = context.add_fixed_point(primary, secondary, self.name())
                else {
                    continue;
                };
                basic_block::match_basic_blocks(fixed_point, context, basic_block_steps);
                context.refresh_scores(fixed_point);
                discovered = true;
            }
        }
        discovered
    }
}

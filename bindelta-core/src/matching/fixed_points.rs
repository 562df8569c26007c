//! Fixed-point store
//!
//! A fixed point asserts "these two functions are the same"; basic-block
//! fixed points nest inside it one level down, and instruction matches nest
//! inside those. The store is built up monotonically by the driver and
//! frozen before scoring.
//!
//! # Invariants
//! - Iteration order is lexicographic on (primary entry, secondary entry);
//!   basic-block fixed points order on (primary vertex, secondary vertex)
//! - Each function participates in at most one fixed point per side
//! - Within a fixed point, each basic-block vertex is consumed at most once

use std::collections::{BTreeMap, HashMap};

use crate::graph::flow_graph::FlowGraph;
use crate::matching::lcs::compute_lcs;
use crate::Address;

/// Store key: (primary entry point, secondary entry point).
pub type FixedPointKey = (Address, Address);

/// One aligned instruction pair, as absolute indices into the owning
/// functions' flat instruction arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionMatch {
    pub primary: u32,
    pub secondary: u32,
}

/// A matched pair of basic blocks with its LCS-aligned instructions.
#[derive(Debug, Clone)]
pub struct BasicBlockFixedPoint {
    pub primary_vertex: u32,
    pub secondary_vertex: u32,
    step: &'static str,
    instruction_matches: Vec<InstructionMatch>,
}

impl BasicBlockFixedPoint {
    pub fn step(&self) -> &'static str {
        self.step
    }

    pub fn set_step(&mut self, step: &'static str) {
        self.step = step;
    }

    pub fn instruction_matches(&self) -> &[InstructionMatch] {
        &self.instruction_matches
    }
}

/// A matched pair of functions.
#[derive(Debug, Clone)]
pub struct FixedPoint {
    primary: u32,
    secondary: u32,
    primary_entry: Address,
    secondary_entry: Address,
    step: &'static str,
    similarity: f64,
    confidence: f64,
    flags: u32,
    comments_ported: bool,
    basic_blocks: BTreeMap<(u32, u32), BasicBlockFixedPoint>,
    by_primary_vertex: HashMap<u32, u32>,
    by_secondary_vertex: HashMap<u32, u32>,
}

impl FixedPoint {
    fn new(
        primary: u32,
        secondary: u32,
        primary_entry: Address,
        secondary_entry: Address,
        step: &'static str,
    ) -> Self {
        FixedPoint {
            primary,
            secondary,
            primary_entry,
            secondary_entry,
            step,
            similarity: 0.0,
            confidence: 0.0,
            flags: 0,
            comments_ported: false,
            basic_blocks: BTreeMap::new(),
            by_primary_vertex: HashMap::new(),
            by_secondary_vertex: HashMap::new(),
        }
    }

    /// Index of the primary flow graph in its program.
    #[inline]
    pub fn primary(&self) -> u32 {
        self.primary
    }

    #[inline]
    pub fn secondary(&self) -> u32 {
        self.secondary
    }

    #[inline]
    pub fn primary_entry(&self) -> Address {
        self.primary_entry
    }

    #[inline]
    pub fn secondary_entry(&self) -> Address {
        self.secondary_entry
    }

    #[inline]
    pub fn key(&self) -> FixedPointKey {
        (self.primary_entry, self.secondary_entry)
    }

    pub fn step(&self) -> &'static str {
        self.step
    }

    pub fn set_step(&mut self, step: &'static str) {
        self.step = step;
    }

    pub fn similarity(&self) -> f64 {
        self.similarity
    }

    pub fn set_similarity(&mut self, similarity: f64) {
        self.similarity = similarity;
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = confidence;
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn comments_ported(&self) -> bool {
        self.comments_ported
    }

    pub fn set_comments_ported(&mut self, ported: bool) {
        self.comments_ported = ported;
    }

    /// Adds a basic-block match and computes its instruction LCS.
    ///
    /// Returns false without touching the store when either vertex is
    /// already consumed.
    pub fn add_basic_block(
        &mut self,
        primary_flow_graph: &FlowGraph,
        secondary_flow_graph: &FlowGraph,
        primary_vertex: u32,
        secondary_vertex: u32,
        step: &'static str,
        strict: bool,
    ) -> bool {
        if self.by_primary_vertex.contains_key(&primary_vertex)
            || self.by_secondary_vertex.contains_key(&secondary_vertex)
        {
            return false;
        }
        let primary_block = primary_flow_graph.basic_block(primary_vertex);
        let secondary_block = secondary_flow_graph.basic_block(secondary_vertex);
        let instruction_matches = compute_lcs(
            primary_flow_graph.instructions(primary_vertex),
            secondary_flow_graph.instructions(secondary_vertex),
            primary_block.instruction_start,
            secondary_block.instruction_start,
            strict,
        );
        self.basic_blocks.insert(
            (primary_vertex, secondary_vertex),
            BasicBlockFixedPoint {
                primary_vertex,
                secondary_vertex,
                step,
                instruction_matches,
            },
        );
        self.by_primary_vertex.insert(primary_vertex, secondary_vertex);
        self.by_secondary_vertex.insert(secondary_vertex, primary_vertex);
        true
    }

    /// Restores a basic-block match with precomputed instruction matches,
    /// used when loading persisted results.
    pub fn restore_basic_block(
        &mut self,
        primary_vertex: u32,
        secondary_vertex: u32,
        step: &'static str,
        instruction_matches: Vec<InstructionMatch>,
    ) -> bool {
        if self.by_primary_vertex.contains_key(&primary_vertex)
            || self.by_secondary_vertex.contains_key(&secondary_vertex)
        {
            return false;
        }
        self.basic_blocks.insert(
            (primary_vertex, secondary_vertex),
            BasicBlockFixedPoint {
                primary_vertex,
                secondary_vertex,
                step,
                instruction_matches,
            },
        );
        self.by_primary_vertex.insert(primary_vertex, secondary_vertex);
        self.by_secondary_vertex.insert(secondary_vertex, primary_vertex);
        true
    }

    /// Secondary vertex matched to a primary basic block, if any. O(1).
    pub fn secondary_vertex_for(&self, primary_vertex: u32) -> Option<u32> {
        self.by_primary_vertex.get(&primary_vertex).copied()
    }

    pub fn primary_vertex_for(&self, secondary_vertex: u32) -> Option<u32> {
        self.by_secondary_vertex.get(&secondary_vertex).copied()
    }

    pub fn basic_block_by_primary(&self, primary_vertex: u32) -> Option<&BasicBlockFixedPoint> {
        let secondary = self.secondary_vertex_for(primary_vertex)?;
        self.basic_blocks.get(&(primary_vertex, secondary))
    }

    /// Basic-block fixed points in (primary vertex, secondary vertex) order.
    pub fn basic_blocks(&self) -> impl Iterator<Item = &BasicBlockFixedPoint> {
        self.basic_blocks.values()
    }

    pub fn basic_block_count(&self) -> usize {
        self.basic_blocks.len()
    }
}

/// Ordered set of function fixed points with per-side address indexes.
#[derive(Debug, Default)]
pub struct FixedPointStore {
    entries: BTreeMap<FixedPointKey, FixedPoint>,
    by_primary: HashMap<Address, FixedPointKey>,
    by_secondary: HashMap<Address, FixedPointKey>,
}

impl FixedPointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new fixed point. Returns `None` when either function is
    /// already matched.
    pub fn add(
        &mut self,
        primary: u32,
        secondary: u32,
        primary_entry: Address,
        secondary_entry: Address,
        step: &'static str,
    ) -> Option<FixedPointKey> {
        if self.by_primary.contains_key(&primary_entry)
            || self.by_secondary.contains_key(&secondary_entry)
        {
            return None;
        }
        let key = (primary_entry, secondary_entry);
        self.entries.insert(
            key,
            FixedPoint::new(primary, secondary, primary_entry, secondary_entry, step),
        );
        self.by_primary.insert(primary_entry, key);
        self.by_secondary.insert(secondary_entry, key);
        Some(key)
    }

    pub fn get(&self, key: FixedPointKey) -> Option<&FixedPoint> {
        self.entries.get(&key)
    }

    pub fn get_mut(&mut self, key: FixedPointKey) -> Option<&mut FixedPoint> {
        self.entries.get_mut(&key)
    }

    pub fn by_primary(&self, entry: Address) -> Option<&FixedPoint> {
        self.by_primary.get(&entry).and_then(|key| self.entries.get(key))
    }

    pub fn by_secondary(&self, entry: Address) -> Option<&FixedPoint> {
        self.by_secondary
            .get(&entry)
            .and_then(|key| self.entries.get(key))
    }

    pub fn is_primary_matched(&self, entry: Address) -> bool {
        self.by_primary.contains_key(&entry)
    }

    pub fn is_secondary_matched(&self, entry: Address) -> bool {
        self.by_secondary.contains_key(&entry)
    }

    /// Removes a fixed point, releasing both sides for re-matching.
    pub fn remove(&mut self, key: FixedPointKey) -> Option<FixedPoint> {
        let removed = self.entries.remove(&key)?;
        self.by_primary.remove(&removed.primary_entry);
        self.by_secondary.remove(&removed.secondary_entry);
        Some(removed)
    }

    /// Ordered key snapshot; stable while the store is mutated afterwards.
    pub fn keys(&self) -> Vec<FixedPointKey> {
        self.entries.keys().copied().collect()
    }

    /// Fixed points in (primary entry, secondary entry) order.
    pub fn iter(&self) -> impl Iterator<Item = &FixedPoint> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FixedPoint> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_matching_is_rejected() {
        let mut store = FixedPointStore::new();
        assert!(store.add(0, 0, 0x1000, 0x2000, "step").is_some());
        assert!(store.add(0, 1, 0x1000, 0x3000, "step").is_none());
        assert!(store.add(1, 0, 0x1500, 0x2000, "step").is_none());
        assert!(store.add(1, 1, 0x1500, 0x3000, "step").is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn iteration_is_ordered_by_address_pair() {
        let mut store = FixedPointStore::new();
        store.add(2, 2, 0x3000, 0x1000, "step");
        store.add(0, 0, 0x1000, 0x2000, "step");
        store.add(1, 1, 0x2000, 0x3000, "step");
        let keys = store.keys();
        assert_eq!(keys, vec![(0x1000, 0x2000), (0x2000, 0x3000), (0x3000, 0x1000)]);
    }

    #[test]
    fn remove_releases_both_sides() {
        let mut store = FixedPointStore::new();
        let key = store.add(0, 0, 0x1000, 0x2000, "step").unwrap();
        store.remove(key);
        assert!(!store.is_primary_matched(0x1000));
        assert!(!store.is_secondary_matched(0x2000));
        assert!(store.add(0, 0, 0x1000, 0x2000, "step").is_some());
    }
}

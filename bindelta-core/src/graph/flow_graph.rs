//! Flow graph
//!
//! Control-flow graph of a single function: basic blocks as vertices,
//! branches as typed edges, plus a flat instruction array that every block
//! addresses by index range. Blocks are sorted by address like call-graph
//! vertices, so the same binary-search lookup applies.
//!
//! The graph is immutable once built. Name, library flag and call-graph
//! vertex are mirrored in from the call graph when the flow graph is
//! attached; the flow graph itself never knows the call graph.

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{DiffError, Result};
use crate::graph::digraph::{DiGraph, INVALID_VERTEX};
use crate::graph::instruction::{prime_signature, Instruction};
use crate::graph::topology::{
    self, compute_bfs_levels, compute_md_indices, Direction,
};
use crate::util::{hash64, hash64_words};
use crate::Address;

/// Branch edge categories, named as the front-end exports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FlowEdgeKind {
    #[serde(rename = "true")]
    ConditionalTrue = 0,
    #[serde(rename = "false")]
    ConditionalFalse = 1,
    #[serde(rename = "unconditional")]
    Unconditional = 2,
    #[serde(rename = "switch")]
    Switch = 3,
}

/// One basic block: an address plus an index range into the function's
/// flat instruction array.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub address: Address,
    pub instruction_start: u32,
    /// Exclusive end of the instruction range.
    pub instruction_end: u32,
    /// Call-site target addresses in instruction order.
    pub call_targets: SmallVec<[Address; 2]>,
    /// String-reference values of the block, as exported by the front-end.
    pub string_refs: SmallVec<[u64; 2]>,
}

/// Control-flow graph of one function.
#[derive(Debug, Default)]
pub struct FlowGraph {
    entry_point: Address,
    /// Mirrored from the call-graph vertex at attach time.
    name: String,
    demangled_name: String,
    has_real_name: bool,
    library: bool,
    call_graph_vertex: u32,
    graph: DiGraph,
    blocks: Vec<BasicBlock>,
    edge_kinds: Vec<FlowEdgeKind>,
    instructions: Vec<Instruction>,
    md_index: f64,
    md_index_inverted: f64,
    loop_count: u32,
}

impl FlowGraph {
    /// Builds a flow graph from sorted basic blocks, typed edges and the
    /// flat instruction array. Runs duplicate marking, BFS, MD indices and
    /// loop counting.
    ///
    /// # Errors
    /// `MalformedInput` when blocks are out of order, an instruction range
    /// is out of bounds, or a non-empty function has no block at its entry
    /// point. The offending address is carried in the error.
    pub fn new(
        entry_point: Address,
        blocks: Vec<BasicBlock>,
        edges: Vec<(u32, u32, FlowEdgeKind)>,
        instructions: Vec<Instruction>,
    ) -> Result<Self> {
        let mut last_address: Option<Address> = None;
        for block in &blocks {
            if let Some(last) = last_address {
                if block.address <= last {
                    return Err(DiffError::malformed(
                        "basic blocks not sorted",
                        block.address,
                    ));
                }
            }
            last_address = Some(block.address);
            if block.instruction_start > block.instruction_end
                || block.instruction_end as usize > instructions.len()
            {
                return Err(DiffError::malformed(
                    "basic block instruction range out of bounds",
                    block.address,
                ));
            }
        }
        if !blocks.is_empty()
            && blocks
                .binary_search_by_key(&entry_point, |block| block.address)
                .is_err()
        {
            return Err(DiffError::malformed(
                "no basic block at function entry point",
                entry_point,
            ));
        }

        let plain_edges: Vec<(u32, u32)> = edges.iter().map(|&(s, t, _)| (s, t)).collect();
        let edge_kinds: Vec<FlowEdgeKind> = edges.iter().map(|&(_, _, kind)| kind).collect();
        let mut graph = DiGraph::new(blocks.len(), &plain_edges);
        graph.mark_duplicate_edges();
        compute_bfs_levels(&mut graph);
        let (md_index, md_index_inverted) = compute_md_indices(&mut graph);
        let loop_count = count_back_edges(&graph);

        Ok(FlowGraph {
            entry_point,
            name: String::new(),
            demangled_name: String::new(),
            has_real_name: false,
            library: false,
            call_graph_vertex: INVALID_VERTEX,
            graph,
            blocks,
            edge_kinds,
            instructions,
            md_index,
            md_index_inverted,
            loop_count,
        })
    }

    /// Empty stub for call-graph vertices without exported code (imports,
    /// thunk targets).
    pub fn empty(entry_point: Address) -> Self {
        FlowGraph {
            entry_point,
            call_graph_vertex: INVALID_VERTEX,
            ..FlowGraph::default()
        }
    }

    /// Installs the call-graph mirror data. Called once during program
    /// assembly when the flow graph is attached to its vertex.
    pub fn set_attachment(
        &mut self,
        call_graph_vertex: u32,
        name: String,
        demangled_name: String,
        has_real_name: bool,
        library: bool,
    ) {
        self.call_graph_vertex = call_graph_vertex;
        self.name = name;
        self.demangled_name = demangled_name;
        self.has_real_name = has_real_name;
        self.library = library;
    }

    #[inline]
    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn demangled_name(&self) -> &str {
        &self.demangled_name
    }

    /// Demangled name if present, raw name otherwise.
    pub fn good_name(&self) -> &str {
        if self.demangled_name.is_empty() {
            &self.name
        } else {
            &self.demangled_name
        }
    }

    #[inline]
    pub fn has_real_name(&self) -> bool {
        self.has_real_name
    }

    #[inline]
    pub fn is_library(&self) -> bool {
        self.library
    }

    #[inline]
    pub fn call_graph_vertex(&self) -> u32 {
        self.call_graph_vertex
    }

    #[inline]
    pub fn graph(&self) -> &DiGraph {
        &self.graph
    }

    #[inline]
    pub fn basic_block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    #[inline]
    pub fn address(&self, vertex: u32) -> Address {
        self.blocks[vertex as usize].address
    }

    pub fn vertex_by_address(&self, address: Address) -> u32 {
        match self
            .blocks
            .binary_search_by_key(&address, |block| block.address)
        {
            Ok(index) => index as u32,
            Err(_) => INVALID_VERTEX,
        }
    }

    /// Vertex of the entry basic block; `INVALID_VERTEX` for stubs.
    pub fn entry_vertex(&self) -> u32 {
        if self.blocks.is_empty() {
            INVALID_VERTEX
        } else {
            self.vertex_by_address(self.entry_point)
        }
    }

    #[inline]
    pub fn basic_block(&self, vertex: u32) -> &BasicBlock {
        &self.blocks[vertex as usize]
    }

    pub fn edge_kind(&self, edge: u32) -> FlowEdgeKind {
        self.edge_kinds[edge as usize]
    }

    /// Instructions of one basic block.
    pub fn instructions(&self, vertex: u32) -> &[Instruction] {
        let block = &self.blocks[vertex as usize];
        &self.instructions[block.instruction_start as usize..block.instruction_end as usize]
    }

    pub fn instruction_count(&self, vertex: u32) -> usize {
        let block = &self.blocks[vertex as usize];
        (block.instruction_end - block.instruction_start) as usize
    }

    /// All instructions of the function, in layout order.
    pub fn all_instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn total_instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn call_targets(&self, vertex: u32) -> &[Address] {
        &self.blocks[vertex as usize].call_targets
    }

    /// Call targets of the whole function in block/instruction order.
    pub fn call_targets_in_order(&self) -> impl Iterator<Item = Address> + '_ {
        self.blocks
            .iter()
            .flat_map(|block| block.call_targets.iter().copied())
    }

    /// MD index of the function's CFG (top-down levels, full weights).
    #[inline]
    pub fn md_index(&self) -> f64 {
        self.md_index
    }

    /// MD index with bottom-up levels.
    #[inline]
    pub fn md_index_inverted(&self) -> f64 {
        self.md_index_inverted
    }

    /// Degree-only MD fingerprint of one basic block.
    pub fn basic_block_md_index(&self, vertex: u32) -> f64 {
        topology::vertex_md_index_local(&self.graph, vertex)
    }

    /// Stored MD contribution of one flow edge.
    pub fn edge_md_index(&self, edge: u32, direction: Direction) -> f64 {
        match direction {
            Direction::TopDown => self.graph.md_index_top_down[edge as usize],
            Direction::BottomUp => self.graph.md_index_bottom_up[edge as usize],
        }
    }

    /// Number of DFS back edges.
    #[inline]
    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    /// Wrapping prime product over all instructions; `None` for empty
    /// functions.
    pub fn prime_signature(&self) -> Option<u64> {
        if self.instructions.is_empty() {
            None
        } else {
            Some(prime_signature(&self.instructions))
        }
    }

    pub fn basic_block_prime_signature(&self, vertex: u32) -> Option<u64> {
        let instructions = self.instructions(vertex);
        if instructions.is_empty() {
            None
        } else {
            Some(prime_signature(instructions))
        }
    }

    /// Hash of the concatenated raw bytes of all instructions.
    pub fn byte_hash(&self) -> Option<u64> {
        if self.instructions.is_empty() {
            return None;
        }
        let mut bytes = Vec::new();
        for instruction in &self.instructions {
            bytes.extend_from_slice(&instruction.bytes);
        }
        Some(hash64(&bytes))
    }

    pub fn basic_block_byte_hash(&self, vertex: u32) -> Option<u64> {
        let instructions = self.instructions(vertex);
        if instructions.is_empty() {
            return None;
        }
        let mut bytes = Vec::new();
        for instruction in instructions {
            bytes.extend_from_slice(&instruction.bytes);
        }
        Some(hash64(&bytes))
    }

    /// Hash of the function's real name; `None` for auto-generated names.
    pub fn name_hash(&self) -> Option<u64> {
        if self.has_real_name {
            Some(hash64(self.name.as_bytes()))
        } else {
            None
        }
    }

    /// Hash of the sorted multiset of string-reference values; `None` when
    /// the function references no strings.
    pub fn string_refs_key(&self) -> Option<u64> {
        let mut refs: Vec<u64> = self
            .blocks
            .iter()
            .flat_map(|block| block.string_refs.iter().copied())
            .collect();
        if refs.is_empty() {
            return None;
        }
        refs.sort_unstable();
        Some(hash64_words(&refs))
    }
}

/// Counts DFS back edges over all components of `graph`.
///
/// A back edge is an edge whose target is on the current DFS stack;
/// self-loops count.
fn count_back_edges(graph: &DiGraph) -> u32 {
    let vertex_count = graph.vertex_count();
    if vertex_count == 0 {
        return 0;
    }
    let mut visited = bitvec![0; vertex_count];
    let mut on_stack = bitvec![0; vertex_count];
    let mut back_edges = 0u32;

    // Iterative DFS; frame = (vertex, next out-edge slot).
    let mut stack: Vec<(u32, usize)> = Vec::new();
    for root in 0..vertex_count as u32 {
        if visited[root as usize] {
            continue;
        }
        visited.set(root as usize, true);
        on_stack.set(root as usize, true);
        stack.push((root, 0));
        while let Some((vertex, slot)) = stack.pop() {
            let out = graph.out_edges(vertex);
            if slot < out.len() {
                let edge = out[slot];
                stack.push((vertex, slot + 1));
                let successor = graph.target(edge);
                if on_stack[successor as usize] {
                    back_edges += 1;
                } else if !visited[successor as usize] {
                    visited.set(successor as usize, true);
                    on_stack.set(successor as usize, true);
                    stack.push((successor, 0));
                }
            } else {
                on_stack.set(vertex as usize, false);
            }
        }
    }
    back_edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interner;

    fn block(address: Address, start: u32, end: u32) -> BasicBlock {
        BasicBlock {
            address,
            instruction_start: start,
            instruction_end: end,
            call_targets: SmallVec::new(),
            string_refs: SmallVec::new(),
        }
    }

    fn instructions(interner: &mut Interner, specs: &[(Address, &str, &[u8])]) -> Vec<Instruction> {
        specs
            .iter()
            .map(|&(address, mnemonic, bytes)| Instruction::new(interner, address, mnemonic, bytes))
            .collect()
    }

    fn looped() -> FlowGraph {
        let mut interner = Interner::new();
        let instructions = instructions(
            &mut interner,
            &[
                (0x1000, "push", &[0x55]),
                (0x1001, "cmp", &[0x39, 0xc8]),
                (0x1003, "jnz", &[0x75, 0xfb]),
                (0x1005, "ret", &[0xc3]),
            ],
        );
        FlowGraph::new(
            0x1000,
            vec![block(0x1000, 0, 1), block(0x1001, 1, 3), block(0x1005, 3, 4)],
            vec![
                (0, 1, FlowEdgeKind::Unconditional),
                (1, 1, FlowEdgeKind::ConditionalTrue),
                (1, 2, FlowEdgeKind::ConditionalFalse),
            ],
            instructions,
        )
        .unwrap()
    }

    #[test]
    fn entry_vertex_resolves_to_entry_block() {
        let flow_graph = looped();
        assert_eq!(flow_graph.entry_vertex(), 0);
        assert_eq!(flow_graph.address(flow_graph.entry_vertex()), 0x1000);
    }

    #[test]
    fn self_loop_counts_as_one_loop() {
        let flow_graph = looped();
        assert_eq!(flow_graph.loop_count(), 1);
    }

    #[test]
    fn unsorted_blocks_are_rejected() {
        let result = FlowGraph::new(
            0x2000,
            vec![block(0x2004, 0, 0), block(0x2000, 0, 0)],
            Vec::new(),
            Vec::new(),
        );
        assert!(matches!(result, Err(DiffError::MalformedInput { address: 0x2000, .. })));
    }

    #[test]
    fn missing_entry_block_is_rejected() {
        let result = FlowGraph::new(0x5000, vec![block(0x2000, 0, 0)], Vec::new(), Vec::new());
        assert!(matches!(result, Err(DiffError::MalformedInput { address: 0x5000, .. })));
    }

    #[test]
    fn hashes_and_signatures_cover_block_ranges() {
        let flow_graph = looped();
        assert!(flow_graph.prime_signature().is_some());
        assert!(flow_graph.byte_hash().is_some());
        assert_eq!(
            flow_graph.basic_block_prime_signature(0),
            Some(flow_graph.instructions(0)[0].prime)
        );
        assert!(flow_graph.basic_block_byte_hash(2).is_some());
    }

    #[test]
    fn stub_has_no_features() {
        let stub = FlowGraph::empty(0x4000);
        assert_eq!(stub.basic_block_count(), 0);
        assert_eq!(stub.entry_vertex(), INVALID_VERTEX);
        assert_eq!(stub.prime_signature(), None);
        assert_eq!(stub.byte_hash(), None);
        assert_eq!(stub.string_refs_key(), None);
    }
}

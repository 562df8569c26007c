//! Call graph
//!
//! Directed multigraph with one vertex per function and one edge per call
//! site. Vertices are stored sorted by entry-point address, which is the
//! primary key: address lookups are a binary search over the vertex vector.
//! Parallel call edges are legal and flagged so downstream matching only
//! sees one edge per (caller, callee) pair.
//!
//! # Invariants
//! - Vertex addresses strictly ascending
//! - Edges connect existing vertices
//! - Exactly one edge of every parallel bundle is non-duplicate
//! - BFS levels are 0 for vertices a sweep cannot reach

use std::cell::Cell;

use log::warn;

use crate::error::{DiffError, Result};
use crate::graph::comment::Comment;
use crate::graph::digraph::{DiGraph, INVALID_VERTEX};
use crate::graph::topology::{
    self, compute_bfs_levels, compute_md_indices, sorted_sum, Direction,
};
use crate::Address;

/// Vertex flag: function recognized as part of a known library.
pub const VERTEX_LIBRARY: u32 = 1 << 0;
/// Vertex flag: stub function (single jump or import thunk).
pub const VERTEX_STUB: u32 = 1 << 1;
/// Vertex flag: function has a real (non auto-generated) name.
pub const VERTEX_NAME: u32 = 1 << 2;
/// Vertex flag: a demangled name is present and differs from the raw name.
pub const VERTEX_DEMANGLED_NAME: u32 = 1 << 3;

/// Per-function vertex attributes.
#[derive(Debug, Clone, Default)]
pub struct VertexInfo {
    pub address: Address,
    pub name: String,
    /// Only set iff different from `name`.
    pub demangled_name: String,
    pub flags: u32,
    /// Attached flow graph, as an index into the owning program's flow
    /// graph vector. Non-owning.
    pub flow_graph: Option<u32>,
}

/// Call graph of one executable.
#[derive(Debug, Default)]
pub struct CallGraph {
    graph: DiGraph,
    vertices: Vec<VertexInfo>,
    md_index: f64,
    md_index_inverted: f64,
    /// Lazy proximity MD index per edge; negative means "not yet computed".
    proximity_md_index: Vec<Cell<f64>>,
    exe_filename: String,
    exe_hash: String,
    file_path: String,
    comments: Vec<Comment>,
}

impl CallGraph {
    /// Builds a call graph from sorted vertex records and an index-based
    /// edge list, then runs duplicate marking, both BFS sweeps and the MD
    /// index computation.
    ///
    /// # Errors
    /// `MalformedInput` when vertex addresses are not strictly ascending,
    /// carrying the first offending address.
    pub fn new(
        vertices: Vec<VertexInfo>,
        edges: Vec<(u32, u32)>,
        exe_filename: String,
        exe_hash: String,
        file_path: String,
        comments: Vec<Comment>,
    ) -> Result<Self> {
        let mut last_address: Option<Address> = None;
        for vertex in &vertices {
            if let Some(last) = last_address {
                if vertex.address <= last {
                    return Err(DiffError::malformed(
                        "call graph vertices not sorted",
                        vertex.address,
                    ));
                }
            }
            last_address = Some(vertex.address);
        }

        let mut graph = DiGraph::new(vertices.len(), &edges);
        graph.mark_duplicate_edges();
        compute_bfs_levels(&mut graph);
        let (md_index, md_index_inverted) = compute_md_indices(&mut graph);

        let proximity_md_index = (0..graph.edge_count())
            .map(|_| Cell::new(-1.0))
            .collect();

        Ok(CallGraph {
            graph,
            vertices,
            md_index,
            md_index_inverted,
            proximity_md_index,
            exe_filename,
            exe_hash,
            file_path,
            comments,
        })
    }

    #[inline]
    pub fn graph(&self) -> &DiGraph {
        &self.graph
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Binary search over the address-sorted vertex vector.
    ///
    /// Returns `INVALID_VERTEX` if no function starts at `address`.
    /// Complexity: O(log n).
    pub fn vertex_by_address(&self, address: Address) -> u32 {
        match self
            .vertices
            .binary_search_by_key(&address, |vertex| vertex.address)
        {
            Ok(index) => index as u32,
            Err(_) => INVALID_VERTEX,
        }
    }

    #[inline]
    pub fn address(&self, vertex: u32) -> Address {
        self.vertices[vertex as usize].address
    }

    pub fn name(&self, vertex: u32) -> &str {
        &self.vertices[vertex as usize].name
    }

    pub fn demangled_name(&self, vertex: u32) -> &str {
        &self.vertices[vertex as usize].demangled_name
    }

    /// Demangled name if available, raw name otherwise.
    pub fn good_name(&self, vertex: u32) -> &str {
        let info = &self.vertices[vertex as usize];
        if info.flags & VERTEX_DEMANGLED_NAME != 0 {
            &info.demangled_name
        } else {
            &info.name
        }
    }

    /// Whether the function carries a user-supplied name rather than an
    /// auto-generated `sub_XXXX` style placeholder.
    pub fn has_real_name(&self, vertex: u32) -> bool {
        self.vertices[vertex as usize].flags & VERTEX_NAME != 0
    }

    pub fn is_library(&self, vertex: u32) -> bool {
        self.vertices[vertex as usize].flags & VERTEX_LIBRARY != 0
    }

    pub fn set_library(&mut self, vertex: u32, library: bool) {
        let flags = &mut self.vertices[vertex as usize].flags;
        if library {
            *flags |= VERTEX_LIBRARY;
        } else {
            *flags &= !VERTEX_LIBRARY;
        }
    }

    pub fn is_stub(&self, vertex: u32) -> bool {
        self.vertices[vertex as usize].flags & VERTEX_STUB != 0
    }

    pub fn set_stub(&mut self, vertex: u32, stub: bool) {
        let flags = &mut self.vertices[vertex as usize].flags;
        if stub {
            *flags |= VERTEX_STUB;
        } else {
            *flags &= !VERTEX_STUB;
        }
    }

    #[inline]
    pub fn flow_graph(&self, vertex: u32) -> Option<u32> {
        self.vertices[vertex as usize].flow_graph
    }

    /// Associates a flow graph (by program-level index) with the vertex at
    /// `entry`. The call graph does not own the flow graph.
    ///
    /// # Errors
    /// - `MalformedInput` if no vertex exists at `entry`
    /// - `InconsistentModel` if the vertex already has a flow graph
    pub fn attach_flow_graph(&mut self, entry: Address, flow_graph: u32) -> Result<u32> {
        let vertex = self.vertex_by_address(entry);
        if vertex == INVALID_VERTEX {
            return Err(DiffError::malformed(
                "no call graph vertex for flow graph",
                entry,
            ));
        }
        let info = &mut self.vertices[vertex as usize];
        if info.flow_graph.is_some() {
            return Err(DiffError::InconsistentModel(format!(
                "flow graph already attached at {entry:#x}"
            )));
        }
        info.flow_graph = Some(flow_graph);
        Ok(vertex)
    }

    /// Removes the flow graph association of the vertex at `entry`.
    /// Idempotent: a missing vertex or an empty slot only logs a warning.
    pub fn detach_flow_graph(&mut self, entry: Address) {
        let vertex = self.vertex_by_address(entry);
        if vertex == INVALID_VERTEX {
            warn!("detach: no call graph vertex at {entry:#x}");
            return;
        }
        self.vertices[vertex as usize].flow_graph = None;
    }

    /// Cached MD index of the whole graph (top-down levels, full weights).
    #[inline]
    pub fn md_index(&self) -> f64 {
        self.md_index
    }

    #[inline]
    pub fn md_index_inverted(&self) -> f64 {
        self.md_index_inverted
    }

    /// Stored MD contribution of one edge.
    pub fn edge_md_index(&self, edge: u32, direction: Direction) -> f64 {
        match direction {
            Direction::TopDown => self.graph.md_index_top_down[edge as usize],
            Direction::BottomUp => self.graph.md_index_bottom_up[edge as usize],
        }
    }

    /// MD index of a vertex: sorted sum of its incident edge contributions.
    pub fn vertex_md_index(&self, vertex: u32, direction: Direction) -> f64 {
        topology::vertex_md_index(&self.graph, vertex, direction)
    }

    #[inline]
    pub fn is_duplicate(&self, edge: u32) -> bool {
        self.graph.is_duplicate(edge)
    }

    #[inline]
    pub fn is_circular(&self, edge: u32) -> bool {
        self.graph.is_circular(edge)
    }

    pub fn find_edge(&self, source: u32, target: u32) -> Option<u32> {
        self.graph.find_edge(source, target)
    }

    /// MD index of the ≤1-hop neighborhood of `edge`, memoized per edge.
    ///
    /// Degrees are truncated to the induced subgraph and the level terms
    /// are dropped, making the value resilient against non-local changes.
    /// Worst case is quadratic in the densest neighborhood, which is why
    /// the value is never computed eagerly.
    pub fn proximity_md_index(&self, edge: u32) -> f64 {
        let memo = &self.proximity_md_index[edge as usize];
        let cached = memo.get();
        if cached >= 0.0 {
            return cached;
        }
        let value = self.calculate_proximity_md_index(edge);
        memo.set(value);
        value
    }

    fn calculate_proximity_md_index(&self, edge: u32) -> f64 {
        let graph = &self.graph;
        let source = graph.source(edge);
        let target = graph.target(edge);

        // All vertices within distance one of either endpoint. The edge
        // itself puts both endpoints into the set.
        let mut neighbors: Vec<u32> = Vec::new();
        for &incident in graph.in_edges(source).iter().chain(graph.in_edges(target)) {
            neighbors.push(graph.source(incident));
        }
        for &incident in graph.out_edges(source).iter().chain(graph.out_edges(target)) {
            neighbors.push(graph.target(incident));
        }
        neighbors.sort_unstable();
        neighbors.dedup();

        // Truncated degrees count only neighbors inside the set; collect
        // the induced non-duplicate edges along the way.
        let mut in_degree = vec![0usize; neighbors.len()];
        let mut out_degree = vec![0usize; neighbors.len()];
        let mut induced_edges: Vec<u32> = Vec::new();
        for (slot, &vertex) in neighbors.iter().enumerate() {
            for &incident in graph.in_edges(vertex) {
                if neighbors.binary_search(&graph.source(incident)).is_ok() {
                    in_degree[slot] += 1;
                    if !graph.is_duplicate(incident) {
                        induced_edges.push(incident);
                    }
                }
            }
            for &incident in graph.out_edges(vertex) {
                if neighbors.binary_search(&graph.target(incident)).is_ok() {
                    out_degree[slot] += 1;
                    if !graph.is_duplicate(incident) {
                        induced_edges.push(incident);
                    }
                }
            }
        }
        induced_edges.sort_unstable();
        induced_edges.dedup();

        let mut values = Vec::with_capacity(induced_edges.len());
        for &induced in &induced_edges {
            let source_slot = neighbors
                .binary_search(&graph.source(induced))
                .unwrap_or(usize::MAX);
            let target_slot = neighbors
                .binary_search(&graph.target(induced))
                .unwrap_or(usize::MAX);
            if source_slot == usize::MAX || target_slot == usize::MAX {
                continue;
            }
            let ed = 2.0f64.sqrt() * in_degree[source_slot] as f64
                + 3.0f64.sqrt() * out_degree[source_slot] as f64
                + 5.0f64.sqrt() * in_degree[target_slot] as f64
                + 7.0f64.sqrt() * out_degree[target_slot] as f64;
            values.push(if ed != 0.0 { 1.0 / ed } else { 0.0 });
        }
        sorted_sum(values)
    }

    pub fn exe_filename(&self) -> &str {
        &self.exe_filename
    }

    pub fn exe_hash(&self) -> &str {
        &self.exe_hash
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Basename of the payload path without directory or extension, used
    /// for default output filenames.
    pub fn file_name(&self) -> String {
        let base = self
            .file_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.file_path.as_str());
        match base.rfind('.') {
            Some(dot) if dot > 0 => base[..dot].to_string(),
            _ => base.to_string(),
        }
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(address: Address, name: &str) -> VertexInfo {
        VertexInfo {
            address,
            name: name.to_string(),
            flags: VERTEX_NAME,
            ..VertexInfo::default()
        }
    }

    fn sample() -> CallGraph {
        CallGraph::new(
            vec![vertex(0x1000, "main"), vertex(0x2000, "helper"), vertex(0x3000, "leaf")],
            vec![(0, 1), (0, 1), (1, 2), (0, 2)],
            "sample.exe".to_string(),
            "da39a3ee".to_string(),
            "/tmp/sample.BinDelta.json".to_string(),
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn lookup_round_trips_every_vertex() {
        let call_graph = sample();
        for vertex in 0..call_graph.vertex_count() as u32 {
            let address = call_graph.address(vertex);
            assert_eq!(call_graph.vertex_by_address(address), vertex);
        }
        assert_eq!(call_graph.vertex_by_address(0x1234), INVALID_VERTEX);
    }

    #[test]
    fn unsorted_vertices_are_rejected_with_address() {
        let result = CallGraph::new(
            vec![vertex(0x2000, "a"), vertex(0x1000, "b")],
            Vec::new(),
            String::new(),
            String::new(),
            String::new(),
            Vec::new(),
        );
        match result {
            Err(DiffError::MalformedInput { address, .. }) => assert_eq!(address, 0x1000),
            other => panic!("expected MalformedInput, got {other:?}"),
        }
    }

    #[test]
    fn parallel_call_edges_are_flagged_once() {
        let call_graph = sample();
        let flagged: Vec<bool> = (0..call_graph.graph().edge_count() as u32)
            .map(|e| call_graph.is_duplicate(e))
            .collect();
        // Edges 0 and 1 are parallel; exactly one of them is a duplicate.
        assert_eq!(flagged.iter().filter(|&&d| d).count(), 1);
        assert!(flagged[0] != flagged[1]);
    }

    #[test]
    fn attach_is_exclusive_and_detach_idempotent() {
        let mut call_graph = sample();
        call_graph.attach_flow_graph(0x1000, 0).unwrap();
        assert!(matches!(
            call_graph.attach_flow_graph(0x1000, 1),
            Err(DiffError::InconsistentModel(_))
        ));
        assert!(matches!(
            call_graph.attach_flow_graph(0x9999, 2),
            Err(DiffError::MalformedInput { .. })
        ));
        call_graph.detach_flow_graph(0x1000);
        call_graph.detach_flow_graph(0x1000);
        assert_eq!(call_graph.flow_graph(call_graph.vertex_by_address(0x1000)), None);
    }

    #[test]
    fn proximity_md_index_is_memoized() {
        let call_graph = sample();
        let first = call_graph.proximity_md_index(2);
        let second = call_graph.proximity_md_index(2);
        assert_eq!(first.to_bits(), second.to_bits());
        assert!(first > 0.0);
    }

    #[test]
    fn file_name_strips_directory_and_extension() {
        let call_graph = sample();
        assert_eq!(call_graph.file_name(), "sample.BinDelta");
    }
}

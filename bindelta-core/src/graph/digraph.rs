//! Directed multigraph core
//!
//! Compressed-sparse-row representation shared by call graphs and flow
//! graphs: one edge record vector plus out- and in-adjacency index vectors,
//! all addressed by `u32` vertex and edge ids. Vertex attributes live with
//! the owning graph type; this core carries only what the topology engine
//! needs (degrees, BFS levels, per-edge MD indices, duplicate flags).
//!
//! # Graph Properties
//! - Directed, parallel edges and self-loops are legal
//! - Edge ids are stable (insertion order of the input edge list)
//! - Vertex count is fixed at construction; the structure is immutable
//!   afterwards except for the topology arrays populated at init

/// Sentinel for "no such vertex".
pub const INVALID_VERTEX: u32 = u32::MAX;

/// CSR-shaped directed multigraph.
#[derive(Debug, Clone, Default)]
pub struct DiGraph {
    vertex_count: usize,
    edge_source: Vec<u32>,
    edge_target: Vec<u32>,
    /// Out-adjacency: edge ids of vertex `v` are
    /// `out_edge_ids[out_offsets[v]..out_offsets[v + 1]]`.
    out_offsets: Vec<u32>,
    out_edge_ids: Vec<u32>,
    /// In-adjacency, same shape keyed by target vertex.
    in_offsets: Vec<u32>,
    in_edge_ids: Vec<u32>,
    /// Breadth-first levels, populated by the topology engine.
    pub(crate) bfs_top_down: Vec<u32>,
    pub(crate) bfs_bottom_up: Vec<u32>,
    /// Parallel-edge flags; exactly one edge of each parallel bundle stays
    /// unflagged.
    pub(crate) duplicate: Vec<bool>,
    /// Per-edge MD indices, populated by the topology engine.
    pub(crate) md_index_top_down: Vec<f64>,
    pub(crate) md_index_bottom_up: Vec<f64>,
}

impl DiGraph {
    /// Builds the CSR structure from an edge list.
    ///
    /// Endpoints must be valid vertex indices; callers validate against the
    /// payload before construction.
    pub fn new(vertex_count: usize, edges: &[(u32, u32)]) -> Self {
        let edge_count = edges.len();
        let mut edge_source = Vec::with_capacity(edge_count);
        let mut edge_target = Vec::with_capacity(edge_count);
        for &(source, target) in edges {
            debug_assert!((source as usize) < vertex_count);
            debug_assert!((target as usize) < vertex_count);
            edge_source.push(source);
            edge_target.push(target);
        }

        let out_offsets = Self::offsets(vertex_count, &edge_source);
        let in_offsets = Self::offsets(vertex_count, &edge_target);
        let out_edge_ids = Self::bucketed_ids(&out_offsets, &edge_source);
        let in_edge_ids = Self::bucketed_ids(&in_offsets, &edge_target);

        DiGraph {
            vertex_count,
            edge_source,
            edge_target,
            out_offsets,
            out_edge_ids,
            in_offsets,
            in_edge_ids,
            bfs_top_down: vec![0; vertex_count],
            bfs_bottom_up: vec![0; vertex_count],
            duplicate: vec![false; edge_count],
            md_index_top_down: vec![0.0; edge_count],
            md_index_bottom_up: vec![0.0; edge_count],
        }
    }

    fn offsets(vertex_count: usize, keys: &[u32]) -> Vec<u32> {
        let mut offsets = vec![0u32; vertex_count + 1];
        for &key in keys {
            offsets[key as usize + 1] += 1;
        }
        for i in 0..vertex_count {
            offsets[i + 1] += offsets[i];
        }
        offsets
    }

    fn bucketed_ids(offsets: &[u32], keys: &[u32]) -> Vec<u32> {
        let mut cursor: Vec<u32> = offsets[..offsets.len() - 1].to_vec();
        let mut ids = vec![0u32; keys.len()];
        for (edge_id, &key) in keys.iter().enumerate() {
            let slot = cursor[key as usize];
            ids[slot as usize] = edge_id as u32;
            cursor[key as usize] += 1;
        }
        ids
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    #[inline]
    pub fn edge_count(&self) -> usize {
        self.edge_source.len()
    }

    #[inline]
    pub fn source(&self, edge: u32) -> u32 {
        self.edge_source[edge as usize]
    }

    #[inline]
    pub fn target(&self, edge: u32) -> u32 {
        self.edge_target[edge as usize]
    }

    /// Edge ids leaving `vertex`.
    #[inline]
    pub fn out_edges(&self, vertex: u32) -> &[u32] {
        let start = self.out_offsets[vertex as usize] as usize;
        let end = self.out_offsets[vertex as usize + 1] as usize;
        &self.out_edge_ids[start..end]
    }

    /// Edge ids entering `vertex`.
    #[inline]
    pub fn in_edges(&self, vertex: u32) -> &[u32] {
        let start = self.in_offsets[vertex as usize] as usize;
        let end = self.in_offsets[vertex as usize + 1] as usize;
        &self.in_edge_ids[start..end]
    }

    #[inline]
    pub fn out_degree(&self, vertex: u32) -> usize {
        self.out_edges(vertex).len()
    }

    #[inline]
    pub fn in_degree(&self, vertex: u32) -> usize {
        self.in_edges(vertex).len()
    }

    /// True iff source and target of `edge` coincide.
    #[inline]
    pub fn is_circular(&self, edge: u32) -> bool {
        self.source(edge) == self.target(edge)
    }

    #[inline]
    pub fn is_duplicate(&self, edge: u32) -> bool {
        self.duplicate[edge as usize]
    }

    #[inline]
    pub fn bfs_top_down(&self, vertex: u32) -> u32 {
        self.bfs_top_down[vertex as usize]
    }

    #[inline]
    pub fn bfs_bottom_up(&self, vertex: u32) -> u32 {
        self.bfs_bottom_up[vertex as usize]
    }

    /// Returns the first edge from `source` to `target`, if any.
    ///
    /// Source lookup is O(1), the scan is O(out_degree(source)).
    pub fn find_edge(&self, source: u32, target: u32) -> Option<u32> {
        self.out_edges(source)
            .iter()
            .copied()
            .find(|&edge| self.target(edge) == target)
    }

    /// Flags every parallel edge beyond the first of each (source, target)
    /// bundle. Runs immediately after construction.
    pub fn mark_duplicate_edges(&mut self) {
        for edge in 0..self.edge_count() as u32 {
            if self.duplicate[edge as usize] {
                continue;
            }
            let source = self.source(edge);
            let target = self.target(edge);
            let others: Vec<u32> = self.out_edges(source).to_vec();
            for other in others {
                if other != edge && self.target(other) == target {
                    self.duplicate[other as usize] = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csr_adjacency_round_trips() {
        // 0 -> 1, 0 -> 2, 1 -> 2, 2 -> 0
        let graph = DiGraph::new(3, &[(0, 1), (0, 2), (1, 2), (2, 0)]);
        assert_eq!(graph.out_degree(0), 2);
        assert_eq!(graph.in_degree(2), 2);
        assert_eq!(graph.out_edges(2), &[3]);
        assert_eq!(graph.source(3), 2);
        assert_eq!(graph.target(3), 0);
        assert!(graph.find_edge(0, 2).is_some());
        assert!(graph.find_edge(2, 1).is_none());
    }

    #[test]
    fn exactly_one_parallel_edge_survives() {
        let mut graph = DiGraph::new(2, &[(0, 1), (0, 1), (0, 1)]);
        graph.mark_duplicate_edges();
        let unflagged = (0..graph.edge_count() as u32)
            .filter(|&e| !graph.is_duplicate(e))
            .count();
        assert_eq!(unflagged, 1);
    }

    #[test]
    fn self_loops_are_circular() {
        let graph = DiGraph::new(1, &[(0, 0)]);
        assert!(graph.is_circular(0));
    }
}

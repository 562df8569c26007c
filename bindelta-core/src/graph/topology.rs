//! Topology engine
//!
//! Breadth-first levels and the MD index, a numerical invariant that
//! summarizes graph topology as a single real number. Every directed edge
//! (u, v) contributes
//!
//! ```text
//! ed(u, v) = sqrt(p1)*in(u) + sqrt(p2)*out(u) + sqrt(p3)*in(v)
//!          + sqrt(p4)*out(v) + sqrt(p5)*lvl(u) + sqrt(p6)*lvl(v)
//! ```
//!
//! and the edge's MD contribution is `1 / ed` (0 when `ed` is 0). Weighting
//! with square roots of small primes makes distinct degree/level profiles
//! sum to distinct values under mild assumptions.
//!
//! Contributions are always sorted ascending before summation: floating
//! point addition is not commutative, and reproducible sums within one
//! implementation depend on a pinned order.

use crate::graph::digraph::DiGraph;

/// Weights used for whole-graph and function-level MD indices.
pub const GRAPH_WEIGHTS: [f64; 6] = [2.0, 3.0, 5.0, 7.0, 11.0, 13.0];

/// Vertex-local weights: BFS levels contribute nothing, so the resulting
/// index is a pure degree fingerprint that survives level perturbations
/// rippling across the graph.
pub const VERTEX_WEIGHTS: [f64; 6] = [2.0, 3.0, 5.0, 7.0, 0.0, 0.0];

/// Which BFS level array feeds the level terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    TopDown,
    BottomUp,
}

/// Sums `values` after sorting ascending.
pub fn sorted_sum(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    values.iter().sum()
}

/// Populates both BFS level arrays of `graph`.
///
/// The forward sweep starts from every vertex without a proper in-edge at
/// level 0 and assigns the next integer to each newly discovered vertex;
/// the reverse sweep mirrors this over in-edges. Vertices unreachable by a
/// sweep keep level 0. A self-loop does not disqualify a vertex from being
/// a seed.
pub fn compute_bfs_levels(graph: &mut DiGraph) {
    breadth_first_levels(graph, Direction::TopDown);
    breadth_first_levels(graph, Direction::BottomUp);
}

fn breadth_first_levels(graph: &mut DiGraph, direction: Direction) {
    use std::collections::VecDeque;

    let vertex_count = graph.vertex_count();
    let mut levels = vec![0u32; vertex_count];
    let mut next: VecDeque<u32> = VecDeque::new();
    for vertex in 0..vertex_count as u32 {
        let seed = match direction {
            Direction::TopDown => graph
                .in_edges(vertex)
                .iter()
                .all(|&edge| graph.is_circular(edge)),
            Direction::BottomUp => graph
                .out_edges(vertex)
                .iter()
                .all(|&edge| graph.is_circular(edge)),
        };
        if seed {
            next.push_back(vertex);
        }
    }

    while let Some(vertex) = next.pop_front() {
        let edges = match direction {
            Direction::TopDown => graph.out_edges(vertex),
            Direction::BottomUp => graph.in_edges(vertex),
        };
        let mut discovered = Vec::new();
        for &edge in edges {
            let neighbor = match direction {
                Direction::TopDown => graph.target(edge),
                Direction::BottomUp => graph.source(edge),
            };
            if levels[neighbor as usize] != 0 || neighbor == vertex {
                continue;
            }
            discovered.push(neighbor);
        }
        for neighbor in discovered {
            if levels[neighbor as usize] == 0 {
                levels[neighbor as usize] = levels[vertex as usize] + 1;
                next.push_back(neighbor);
            }
        }
    }

    match direction {
        Direction::TopDown => graph.bfs_top_down = levels,
        Direction::BottomUp => graph.bfs_bottom_up = levels,
    }
}

/// MD contribution of a single edge.
pub fn edge_md_index(
    graph: &DiGraph,
    edge: u32,
    direction: Direction,
    weights: &[f64; 6],
) -> f64 {
    let source = graph.source(edge);
    let target = graph.target(edge);
    let (level_source, level_target) = match direction {
        Direction::TopDown => (graph.bfs_top_down(source), graph.bfs_top_down(target)),
        Direction::BottomUp => (graph.bfs_bottom_up(source), graph.bfs_bottom_up(target)),
    };
    let ed = weights[0].sqrt() * graph.in_degree(source) as f64
        + weights[1].sqrt() * graph.out_degree(source) as f64
        + weights[2].sqrt() * graph.in_degree(target) as f64
        + weights[3].sqrt() * graph.out_degree(target) as f64
        + weights[4].sqrt() * f64::from(level_source)
        + weights[5].sqrt() * f64::from(level_target);
    if ed != 0.0 {
        1.0 / ed
    } else {
        0.0
    }
}

/// Computes both graph-level MD indices with full weights and stores the
/// per-edge contributions on the graph.
///
/// Precondition: `compute_bfs_levels` has run.
/// Returns (top-down, bottom-up) sums.
pub fn compute_md_indices(graph: &mut DiGraph) -> (f64, f64) {
    let edge_count = graph.edge_count();
    let mut top_down = Vec::with_capacity(edge_count);
    let mut bottom_up = Vec::with_capacity(edge_count);
    for edge in 0..edge_count as u32 {
        top_down.push(edge_md_index(graph, edge, Direction::TopDown, &GRAPH_WEIGHTS));
        bottom_up.push(edge_md_index(graph, edge, Direction::BottomUp, &GRAPH_WEIGHTS));
    }
    graph.md_index_top_down = top_down.clone();
    graph.md_index_bottom_up = bottom_up.clone();
    (sorted_sum(top_down), sorted_sum(bottom_up))
}

/// MD index of a vertex: sum of the stored contributions of its incident
/// edges, computed with full weights by `compute_md_indices`.
pub fn vertex_md_index(graph: &DiGraph, vertex: u32, direction: Direction) -> f64 {
    let stored = match direction {
        Direction::TopDown => &graph.md_index_top_down,
        Direction::BottomUp => &graph.md_index_bottom_up,
    };
    let mut values = Vec::with_capacity(graph.in_degree(vertex) + graph.out_degree(vertex));
    for &edge in graph.in_edges(vertex) {
        values.push(stored[edge as usize]);
    }
    for &edge in graph.out_edges(vertex) {
        values.push(stored[edge as usize]);
    }
    sorted_sum(values)
}

/// Degree-only MD fingerprint of a vertex, recomputed from its incident
/// edges with the vertex-local weights (no level terms).
pub fn vertex_md_index_local(graph: &DiGraph, vertex: u32) -> f64 {
    let mut values = Vec::with_capacity(graph.in_degree(vertex) + graph.out_degree(vertex));
    for &edge in graph.in_edges(vertex) {
        values.push(edge_md_index(graph, edge, Direction::TopDown, &VERTEX_WEIGHTS));
    }
    for &edge in graph.out_edges(vertex) {
        values.push(edge_md_index(graph, edge, Direction::TopDown, &VERTEX_WEIGHTS));
    }
    sorted_sum(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> DiGraph {
        // 0 -> {1, 2} -> 3
        let mut graph = DiGraph::new(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        graph.mark_duplicate_edges();
        compute_bfs_levels(&mut graph);
        graph
    }

    #[test]
    fn bfs_levels_forward_and_reverse() {
        let graph = diamond();
        assert_eq!(graph.bfs_top_down(0), 0);
        assert_eq!(graph.bfs_top_down(1), 1);
        assert_eq!(graph.bfs_top_down(2), 1);
        assert_eq!(graph.bfs_top_down(3), 2);
        assert_eq!(graph.bfs_bottom_up(3), 0);
        assert_eq!(graph.bfs_bottom_up(1), 1);
        assert_eq!(graph.bfs_bottom_up(0), 2);
    }

    #[test]
    fn lone_self_loop_vertex_is_a_seed() {
        let mut graph = DiGraph::new(2, &[(0, 0), (0, 1)]);
        compute_bfs_levels(&mut graph);
        assert_eq!(graph.bfs_top_down(0), 0);
        assert_eq!(graph.bfs_top_down(1), 1);
    }

    #[test]
    fn disconnected_vertices_keep_level_zero() {
        let mut graph = DiGraph::new(3, &[(0, 1)]);
        compute_bfs_levels(&mut graph);
        assert_eq!(graph.bfs_top_down(2), 0);
        assert_eq!(graph.bfs_bottom_up(2), 0);
    }

    #[test]
    fn md_index_is_deterministic() {
        let mut one = diamond();
        let mut two = diamond();
        let (td1, bu1) = compute_md_indices(&mut one);
        let (td2, bu2) = compute_md_indices(&mut two);
        assert_eq!(td1.to_bits(), td2.to_bits());
        assert_eq!(bu1.to_bits(), bu2.to_bits());
        assert!(td1 > 0.0);
    }

    #[test]
    fn empty_graph_has_zero_md_index() {
        let mut graph = DiGraph::new(0, &[]);
        compute_bfs_levels(&mut graph);
        let (td, bu) = compute_md_indices(&mut graph);
        assert_eq!(td, 0.0);
        assert_eq!(bu, 0.0);
    }

    #[test]
    fn vertex_md_index_sums_incident_edges() {
        let mut graph = diamond();
        compute_md_indices(&mut graph);
        let full: f64 = (0..graph.edge_count() as u32)
            .map(|e| graph.md_index_top_down[e as usize])
            .sum();
        // Vertex sums double-count every edge exactly once on each side.
        let per_vertex: f64 = (0..4).map(|v| vertex_md_index(&graph, v, Direction::TopDown)).sum();
        assert!((per_vertex - 2.0 * full).abs() < 1e-12);
    }
}

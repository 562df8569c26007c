//! Program assembly and whole-diff entry points
//!
//! Turns a decoded payload into the in-memory program model (call graph
//! plus flow graphs, stubs added for functions without exported code) and
//! orchestrates a complete diff: matching, classification and scoring.

use std::path::Path;

use log::warn;

use crate::config::MatchingConfig;
use crate::error::{DiffError, Result};
use crate::graph::call_graph::{
    CallGraph, VertexInfo, VERTEX_DEMANGLED_NAME, VERTEX_LIBRARY, VERTEX_NAME, VERTEX_STUB,
};
use crate::graph::digraph::INVALID_VERTEX;
use crate::graph::flow_graph::{BasicBlock, FlowGraph};
use crate::graph::instruction::Instruction;
use crate::intern::Interner;
use crate::matching::context::MatchingContext;
use crate::matching::driver;
use crate::matching::steps::{self, names};
use crate::payload::{FunctionKind, ProgramPayload};
use crate::statistics::{self, Counts, Histogram};

/// One executable: its call graph and the flow graphs of its functions,
/// sorted by entry point and addressed by index.
#[derive(Debug)]
pub struct Program {
    pub call_graph: CallGraph,
    flow_graphs: Vec<FlowGraph>,
}

impl Program {
    /// Assembles the program model from a decoded payload.
    ///
    /// Functions without an exported flow graph (imports, thunk targets)
    /// get an empty stub attached and their vertex is marked library+stub.
    /// A flow graph whose entry has no call-graph vertex is kept but only
    /// logged; it still participates in matching through its intrinsic
    /// features.
    pub fn from_payload(
        payload: ProgramPayload,
        file_path: &str,
        interner: &mut Interner,
        detect_library: bool,
    ) -> Result<Self> {
        let vertex_payloads = payload.call_graph.vertices;
        let mut vertices = Vec::with_capacity(vertex_payloads.len());
        for proto_vertex in &vertex_payloads {
            let mut info = VertexInfo {
                address: proto_vertex.address,
                ..VertexInfo::default()
            };
            if let Some(name) = &proto_vertex.mangled_name {
                info.flags |= VERTEX_NAME;
                info.name = name.clone();
            } else {
                // Dummy name for display.
                info.name = format!("sub_{:X}", proto_vertex.address);
            }
            if let Some(demangled) = &proto_vertex.demangled_name {
                info.flags |= VERTEX_NAME | VERTEX_DEMANGLED_NAME;
                info.demangled_name = demangled.clone();
            }
            match proto_vertex.kind {
                FunctionKind::Library => {
                    if detect_library {
                        info.flags |= VERTEX_LIBRARY;
                    }
                }
                FunctionKind::Thunk => info.flags |= VERTEX_STUB,
                _ => {}
            }
            vertices.push(info);
        }

        let mut edges = Vec::with_capacity(payload.call_graph.edges.len());
        for proto_edge in &payload.call_graph.edges {
            let vertex_count = vertices.len() as u32;
            if proto_edge.source >= vertex_count || proto_edge.target >= vertex_count {
                let address = vertices
                    .get(proto_edge.source as usize)
                    .map(|v| v.address)
                    .unwrap_or(0);
                return Err(DiffError::malformed(
                    format!(
                        "call edge endpoint out of range ({} -> {})",
                        proto_edge.source, proto_edge.target
                    ),
                    address,
                ));
            }
            edges.push((proto_edge.source, proto_edge.target));
        }

        let mut call_graph = CallGraph::new(
            vertices,
            edges,
            payload.meta.executable_name,
            payload.meta.executable_id,
            file_path.to_string(),
            payload.comments,
        )?;

        let mut flow_graphs: Vec<FlowGraph> = Vec::with_capacity(payload.flow_graphs.len());
        for proto_flow_graph in payload.flow_graphs {
            if proto_flow_graph.basic_blocks.is_empty() {
                continue;
            }
            let instructions: Vec<Instruction> = proto_flow_graph
                .instructions
                .iter()
                .map(|i| Instruction::new(interner, i.address, &i.mnemonic, &i.bytes))
                .collect();
            let blocks: Vec<BasicBlock> = proto_flow_graph
                .basic_blocks
                .iter()
                .map(|b| BasicBlock {
                    address: b.address,
                    instruction_start: b.instruction_start,
                    instruction_end: b.instruction_end,
                    call_targets: b.call_targets.iter().copied().collect(),
                    string_refs: b.string_refs.iter().copied().collect(),
                })
                .collect();
            let block_count = blocks.len() as u32;
            let mut typed_edges = Vec::with_capacity(proto_flow_graph.edges.len());
            for edge in &proto_flow_graph.edges {
                if edge.source >= block_count || edge.target >= block_count {
                    return Err(DiffError::malformed(
                        format!(
                            "flow edge endpoint out of range ({} -> {})",
                            edge.source, edge.target
                        ),
                        proto_flow_graph.entry,
                    ));
                }
                typed_edges.push((edge.source, edge.target, edge.kind));
            }
            flow_graphs.push(FlowGraph::new(
                proto_flow_graph.entry,
                blocks,
                typed_edges,
                instructions,
            )?);
        }

        // Stubs for call-graph vertices without exported code.
        let covered: std::collections::HashSet<u64> =
            flow_graphs.iter().map(|fg| fg.entry_point()).collect();
        let mut stub_vertices = Vec::new();
        for vertex in 0..call_graph.vertex_count() as u32 {
            let address = call_graph.address(vertex);
            if !covered.contains(&address) {
                flow_graphs.push(FlowGraph::empty(address));
                stub_vertices.push(vertex);
            }
        }
        for vertex in stub_vertices {
            call_graph.set_stub(vertex, true);
            if detect_library {
                call_graph.set_library(vertex, true);
            }
        }

        flow_graphs.sort_by_key(|fg| fg.entry_point());
        for window in flow_graphs.windows(2) {
            if window[0].entry_point() == window[1].entry_point() {
                return Err(DiffError::InconsistentModel(format!(
                    "a flow graph exists at {:#x}",
                    window[1].entry_point()
                )));
            }
        }

        for (id, flow_graph) in flow_graphs.iter_mut().enumerate() {
            let entry = flow_graph.entry_point();
            match call_graph.attach_flow_graph(entry, id as u32) {
                Ok(vertex) => {
                    flow_graph.set_attachment(
                        vertex,
                        call_graph.name(vertex).to_string(),
                        call_graph.demangled_name(vertex).to_string(),
                        call_graph.has_real_name(vertex),
                        call_graph.is_library(vertex),
                    );
                }
                Err(DiffError::MalformedInput { .. }) => {
                    warn!("no call graph vertex for flow graph at {entry:#x}");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(Program {
            call_graph,
            flow_graphs,
        })
    }

    /// Reads and assembles a payload file.
    pub fn read(
        path: impl AsRef<Path>,
        interner: &mut Interner,
        detect_library: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        let payload = ProgramPayload::read(path)?;
        Program::from_payload(
            payload,
            &path.to_string_lossy(),
            interner,
            detect_library,
        )
    }

    #[inline]
    pub fn flow_graph(&self, id: u32) -> &FlowGraph {
        &self.flow_graphs[id as usize]
    }

    #[inline]
    pub fn flow_graphs(&self) -> &[FlowGraph] {
        &self.flow_graphs
    }

    #[inline]
    pub fn flow_graph_count(&self) -> usize {
        self.flow_graphs.len()
    }

    /// Index of the flow graph whose entry point is `entry`.
    pub fn flow_graph_by_entry(&self, entry: u64) -> Option<u32> {
        self.flow_graphs
            .binary_search_by_key(&entry, |fg| fg.entry_point())
            .ok()
            .map(|index| index as u32)
    }

    /// Flow graph attached to a call-graph vertex.
    pub fn flow_graph_of_vertex(&self, vertex: u32) -> Option<u32> {
        if vertex == INVALID_VERTEX {
            return None;
        }
        self.call_graph.flow_graph(vertex)
    }
}

/// Aggregate scores of one finished diff.
#[derive(Debug, Clone)]
pub struct DiffScores {
    pub similarity: f64,
    pub confidence: f64,
    pub counts: Counts,
    pub histogram: Histogram,
}

/// Runs the full matching pipeline over two programs and returns the
/// populated context (fixed points classified, per-pair scores set).
pub fn diff<'p>(
    primary: &'p Program,
    secondary: &'p Program,
    config: &'p MatchingConfig,
) -> Result<MatchingContext<'p>> {
    let function_steps = steps::function_steps(config);
    let basic_block_steps = steps::basic_block_steps(config);
    let mut context = MatchingContext::new(primary, secondary, config);
    driver::match_call_graphs(&mut context, &function_steps, &basic_block_steps);
    Ok(context)
}

/// Computes the global counts, histogram, similarity and confidence of a
/// finished diff.
pub fn score(context: &MatchingContext<'_>) -> DiffScores {
    let mut counts = Counts::default();
    let mut histogram = Histogram::new();
    statistics::counts_and_histogram(
        context.primary,
        context.secondary,
        &context.fixed_points,
        &mut histogram,
        &mut counts,
    );
    let confidence = statistics::confidence(&histogram, &context.confidences);
    let similarity = statistics::global_similarity(
        &context.primary.call_graph,
        &context.secondary.call_graph,
        &histogram,
        &counts,
        &context.confidences,
    );
    DiffScores {
        similarity,
        confidence,
        counts,
        histogram,
    }
}

/// Re-exported manual step name for embedders adding manual matches.
pub const MANUAL_STEP: &str = names::FUNCTION_MANUAL;

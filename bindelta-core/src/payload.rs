//! Exported-program payload
//!
//! Serde data model of the container the disassembler front-end writes for
//! each executable. The matcher consumes only a small slice of what a
//! disassembler knows: the call graph, per-function flow graphs with flat
//! instruction arrays, and comments. Operand trees are accepted but
//! ignored.
//!
//! Unknown fields are tolerated so older readers keep working against
//! newer exports.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::comment::Comment;
use crate::graph::flow_graph::FlowEdgeKind;
use crate::Address;

/// Function categories as exported by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    #[default]
    Normal,
    Library,
    Thunk,
    Imported,
    Invalid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaInformation {
    #[serde(default)]
    pub executable_name: String,
    /// Hex encoded hash of the original input binary.
    #[serde(default)]
    pub executable_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallGraphVertexPayload {
    pub address: Address,
    #[serde(default)]
    pub mangled_name: Option<String>,
    #[serde(default)]
    pub demangled_name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: FunctionKind,
}

/// Call edge by vertex index into the sorted vertex list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CallGraphEdgePayload {
    pub source: u32,
    pub target: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallGraphPayload {
    #[serde(default)]
    pub vertices: Vec<CallGraphVertexPayload>,
    #[serde(default)]
    pub edges: Vec<CallGraphEdgePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlockPayload {
    pub address: Address,
    /// Index range `[start, end)` into the flow graph's instruction array.
    pub instruction_start: u32,
    pub instruction_end: u32,
    #[serde(default)]
    pub call_targets: Vec<Address>,
    #[serde(default)]
    pub string_refs: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdgePayload {
    pub source: u32,
    pub target: u32,
    #[serde(rename = "type")]
    pub kind: FlowEdgeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionPayload {
    pub address: Address,
    pub mnemonic: String,
    #[serde(default)]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowGraphPayload {
    /// Entry-point address; doubles as the key to the call-graph vertex.
    pub entry: Address,
    #[serde(default)]
    pub basic_blocks: Vec<BasicBlockPayload>,
    #[serde(default)]
    pub edges: Vec<FlowEdgePayload>,
    #[serde(default)]
    pub instructions: Vec<InstructionPayload>,
}

/// One exported executable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramPayload {
    #[serde(default)]
    pub meta: MetaInformation,
    #[serde(default)]
    pub call_graph: CallGraphPayload,
    #[serde(default)]
    pub flow_graphs: Vec<FlowGraphPayload>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl ProgramPayload {
    /// Reads and parses a payload file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let payload = serde_json::from_reader(BufReader::new(file))?;
        Ok(payload)
    }

    /// Parses a payload from an in-memory JSON slice.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_payload_parses_with_defaults() {
        let payload = ProgramPayload::from_slice(
            br#"{
                "call_graph": {
                    "vertices": [
                        {"address": 4096, "mangled_name": "main"},
                        {"address": 8192, "type": "library"}
                    ],
                    "edges": [{"source": 0, "target": 1}]
                },
                "flow_graphs": [{
                    "entry": 4096,
                    "basic_blocks": [
                        {"address": 4096, "instruction_start": 0, "instruction_end": 2}
                    ],
                    "edges": [{"source": 0, "target": 0, "type": "true"}],
                    "instructions": [
                        {"address": 4096, "mnemonic": "cmp", "bytes": [57, 200]},
                        {"address": 4098, "mnemonic": "jz"}
                    ]
                }],
                "future_field": 42
            }"#,
        )
        .unwrap();
        assert_eq!(payload.call_graph.vertices.len(), 2);
        assert_eq!(payload.call_graph.vertices[1].kind, FunctionKind::Library);
        assert_eq!(payload.flow_graphs[0].edges[0].kind, FlowEdgeKind::ConditionalTrue);
        assert!(payload.flow_graphs[0].instructions[1].bytes.is_empty());
        assert!(payload.meta.executable_name.is_empty());
    }
}

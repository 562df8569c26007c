//! Shared builders for integration tests: small payloads assembled by
//! hand, loaded through the same path production uses.

use bindelta_core::differ::Program;
use bindelta_core::graph::flow_graph::FlowEdgeKind;
use bindelta_core::intern::Interner;
use bindelta_core::payload::{
    BasicBlockPayload, CallGraphEdgePayload, CallGraphPayload, CallGraphVertexPayload,
    FlowEdgePayload, FlowGraphPayload, FunctionKind, InstructionPayload, MetaInformation,
    ProgramPayload,
};

pub fn vertex(address: u64, name: Option<&str>) -> CallGraphVertexPayload {
    CallGraphVertexPayload {
        address,
        mangled_name: name.map(str::to_string),
        demangled_name: None,
        kind: FunctionKind::Normal,
    }
}

pub fn instruction(address: u64, mnemonic: &str) -> InstructionPayload {
    InstructionPayload {
        address,
        mnemonic: mnemonic.to_string(),
        bytes: mnemonic.as_bytes().to_vec(),
    }
}

/// Builds a flow graph from per-block mnemonic lists; instruction
/// addresses are consecutive starting at `entry`, block addresses are
/// their first instruction's.
pub fn flow_graph(
    entry: u64,
    block_mnemonics: &[&[&str]],
    edges: &[(u32, u32, FlowEdgeKind)],
) -> FlowGraphPayload {
    let mut instructions = Vec::new();
    let mut basic_blocks = Vec::new();
    let mut address = entry;
    let mut index = 0u32;
    for mnemonics in block_mnemonics {
        let start = index;
        let block_address = address;
        for mnemonic in *mnemonics {
            instructions.push(instruction(address, mnemonic));
            address += 1;
            index += 1;
        }
        basic_blocks.push(BasicBlockPayload {
            address: block_address,
            instruction_start: start,
            instruction_end: index,
            call_targets: Vec::new(),
            string_refs: Vec::new(),
        });
    }
    FlowGraphPayload {
        entry,
        basic_blocks,
        edges: edges
            .iter()
            .map(|&(source, target, kind)| FlowEdgePayload {
                source,
                target,
                kind,
            })
            .collect(),
        instructions,
    }
}

pub fn payload(
    vertices: Vec<CallGraphVertexPayload>,
    edges: &[(u32, u32)],
    flow_graphs: Vec<FlowGraphPayload>,
) -> ProgramPayload {
    ProgramPayload {
        meta: MetaInformation {
            executable_name: "test.exe".to_string(),
            executable_id: "0123abcd".to_string(),
        },
        call_graph: CallGraphPayload {
            vertices,
            edges: edges
                .iter()
                .map(|&(source, target)| CallGraphEdgePayload { source, target })
                .collect(),
        },
        flow_graphs,
        comments: Vec::new(),
    }
}

/// Loads two payloads through one shared interner, as a real diff does.
pub fn load_pair(primary: ProgramPayload, secondary: ProgramPayload) -> (Program, Program) {
    let mut interner = Interner::new();
    let primary = Program::from_payload(primary, "primary.json", &mut interner, true)
        .expect("primary payload must assemble");
    let secondary = Program::from_payload(secondary, "secondary.json", &mut interner, true)
        .expect("secondary payload must assemble");
    (primary, secondary)
}

/// One function with a single basic block.
pub fn singleton_program(address: u64, name: &str, mnemonics: &[&str]) -> ProgramPayload {
    payload(
        vec![vertex(address, Some(name))],
        &[],
        vec![flow_graph(address, &[mnemonics], &[])],
    )
}

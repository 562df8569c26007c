//! Comment records
//!
//! Comments are stored on the call graph, keyed by address and operand
//! index, so shared basic blocks never carry them twice. The matcher does
//! not consume them; they ride along into the result database so a UI can
//! port them between binaries.

use serde::{Deserialize, Serialize};

use crate::Address;

/// Comment categories as exported by the disassembler front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CommentKind {
    Regular = 0,
    Enum = 1,
    Anterior = 2,
    Posterior = 3,
    Function = 4,
    Location = 5,
    GlobalReference = 6,
    LocalReference = 7,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub address: Address,
    #[serde(default)]
    pub operand_index: u32,
    pub text: String,
    pub kind: CommentKind,
    #[serde(default)]
    pub repeatable: bool,
}

//! bindelta-core — structural diffing engine for disassembled binaries
//!
//! Compares two previously disassembled executables and produces a mapping
//! between their functions, basic blocks and instructions, together with
//! per-match similarity/confidence scores and a global score for the pair.
//!
//! # Pipeline
//! 1. **Load**: decode the exported payload of each binary into a call
//!    graph plus per-function flow graphs ([`payload`], [`differ`])
//! 2. **Topology**: BFS levels and MD indices ([`graph::topology`])
//! 3. **Match**: the iterative driver applies the configured step list,
//!    propagates through call-graph neighbors and matches basic blocks
//!    inside every committed pair ([`matching`])
//! 4. **Classify and score**: change flags per match, counts, histogram
//!    and the similarity/confidence formulas ([`change_classifier`],
//!    [`statistics`])
//! 5. **Persist**: results database, text report, groundtruth file
//!    ([`writers`])
//!
//! The engine is single-threaded within one diff; batch parallelism lives
//! in the CLI crate, one independent diff per worker.

pub mod change_classifier;
pub mod config;
pub mod differ;
pub mod error;
pub mod graph;
pub mod intern;
pub mod matching;
pub mod payload;
pub mod statistics;
pub mod util;
pub mod writers;

/// Virtual address within a disassembled binary.
pub type Address = u64;

pub use error::{DiffError, Result};

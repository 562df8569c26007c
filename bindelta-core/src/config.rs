//! Configuration
//!
//! Hierarchical JSON configuration for the matching engine. Unknown keys
//! are ignored and missing keys fall back to defaults, so configs written
//! for newer versions keep loading.
//!
//! The declared step lists are ordered; the driver consumes them
//! front-to-back and the order matters (high-confidence steps first so
//! later low-signal steps only see what remains).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::matching::steps::names;

/// One declared matching step: its stable short name plus an optional
/// confidence override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl StepConfig {
    fn new(name: &str) -> Self {
        StepConfig {
            name: name.to_string(),
            confidence: None,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Ordered call-graph (function-level) step list.
    pub function_matching: Vec<StepConfig>,
    /// Ordered flow-graph (basic-block-level) step list.
    pub basic_block_matching: Vec<StepConfig>,
    /// Batch worker count; 0 selects the available parallelism.
    pub num_threads: usize,
    /// Functions below this instruction count are not hash-matched.
    pub min_function_instructions: u32,
    /// Basic blocks below this instruction count are not hash-matched.
    pub min_basic_block_instructions: u32,
    /// When false, library flags from the payload are discarded and every
    /// function participates in non-library statistics.
    pub detect_library_functions: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        MatchingConfig {
            function_matching: vec![
                StepConfig::new(names::FUNCTION_MD_INDEX_TOP_DOWN),
                StepConfig::new(names::FUNCTION_MD_INDEX_BOTTOM_UP),
                StepConfig::new(names::FUNCTION_HASH),
                StepConfig::new(names::FUNCTION_PRIME_SIGNATURE),
                StepConfig::new(names::FUNCTION_EDGE_MD_INDEX_TOP_DOWN),
                StepConfig::new(names::FUNCTION_EDGE_MD_INDEX_BOTTOM_UP),
                StepConfig::new(names::FUNCTION_STRING_REFERENCES),
                StepConfig::new(names::FUNCTION_CALL_SEQUENCE),
                StepConfig::new(names::FUNCTION_ADDRESS_SEQUENCE),
                StepConfig::new(names::FUNCTION_NAME_HASH),
            ],
            basic_block_matching: vec![
                StepConfig::new(names::BASIC_BLOCK_PRIME_SIGNATURE),
                StepConfig::new(names::BASIC_BLOCK_MD_INDEX),
                StepConfig::new(names::BASIC_BLOCK_HASH),
                StepConfig::new(names::BASIC_BLOCK_ENTRY_POINT),
                StepConfig::new(names::BASIC_BLOCK_EXIT_POINT),
                StepConfig::new(names::BASIC_BLOCK_INSTRUCTION_COUNT),
                StepConfig::new(names::BASIC_BLOCK_PROPAGATION),
            ],
            num_threads: 0,
            min_function_instructions: 1,
            min_basic_block_instructions: 4,
            detect_library_functions: true,
        }
    }
}

impl MatchingConfig {
    /// Loads a configuration file, falling back to defaults for anything
    /// the file does not mention.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let config = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_step_order_is_stable() {
        let config = MatchingConfig::default();
        assert_eq!(
            config.function_matching[0].name,
            names::FUNCTION_MD_INDEX_TOP_DOWN
        );
        assert_eq!(
            config.basic_block_matching.last().map(|s| s.name.as_str()),
            Some(names::BASIC_BLOCK_PROPAGATION)
        );
    }

    #[test]
    fn unknown_keys_are_ignored_and_missing_keys_defaulted() {
        let config: MatchingConfig = serde_json::from_str(
            r#"{"num_threads": 3, "some_future_knob": {"x": 1}}"#,
        )
        .unwrap();
        assert_eq!(config.num_threads, 3);
        assert_eq!(config.min_basic_block_instructions, 4);
        assert!(!config.function_matching.is_empty());
    }

    #[test]
    fn confidence_overrides_parse() {
        let config: MatchingConfig = serde_json::from_str(
            r#"{"function_matching": [{"name": "function: hash matching", "confidence": 0.5}]}"#,
        )
        .unwrap();
        assert_eq!(config.function_matching.len(), 1);
        assert_eq!(config.function_matching[0].confidence, Some(0.5));
    }
}

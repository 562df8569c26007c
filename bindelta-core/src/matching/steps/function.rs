//! Function-level matching steps keyed on intrinsic features
//!
//! Each step buckets the unmatched functions of both sides by one feature
//! value and commits unique buckets; see the module docs of
//! [`super`](crate::matching::steps) for the shared rules.

use std::collections::{BTreeMap, BTreeSet};

use crate::graph::topology::Direction;
use crate::matching::context::MatchingContext;
use crate::matching::steps::{
    bucket_candidates, function_edges, match_unique_buckets, names, BasicBlockStep, FloatKey,
    FunctionStep, Side,
};
use crate::util::hash64_words;

/// Builds one function step by its stable name.
pub(super) fn make_step(name: &str, confidence: f64) -> Option<Box<dyn FunctionStep>> {
    match name {
        names::FUNCTION_MD_INDEX_TOP_DOWN => Some(Box::new(MdIndexStep {
            direction: Direction::TopDown,
            confidence,
        })),
        names::FUNCTION_MD_INDEX_BOTTOM_UP => Some(Box::new(MdIndexStep {
            direction: Direction::BottomUp,
            confidence,
        })),
        names::FUNCTION_HASH => Some(Box::new(HashStep { confidence })),
        names::FUNCTION_PRIME_SIGNATURE => Some(Box::new(PrimeSignatureStep { confidence })),
        names::FUNCTION_EDGE_MD_INDEX_TOP_DOWN => Some(Box::new(
            function_edges::EdgesMdIndexStep::new(Direction::TopDown, confidence),
        )),
        names::FUNCTION_EDGE_MD_INDEX_BOTTOM_UP => Some(Box::new(
            function_edges::EdgesMdIndexStep::new(Direction::BottomUp, confidence),
        )),
        names::FUNCTION_STRING_REFERENCES => Some(Box::new(StringReferencesStep { confidence })),
        names::FUNCTION_CALL_SEQUENCE => Some(Box::new(CallSequenceStep { confidence })),
        names::FUNCTION_ADDRESS_SEQUENCE => Some(Box::new(AddressSequenceStep { confidence })),
        names::FUNCTION_NAME_HASH => Some(Box::new(NameHashStep { confidence })),
        names::FUNCTION_MANUAL => Some(Box::new(ManualStep { confidence })),
        _ => None,
    }
}

/// Keys functions by the MD index of their control flow graph. Functions
/// whose CFG has no edges carry an MD index of 0 and are excluded; a zero
/// bucket would pair unrelated straight-line functions.
struct MdIndexStep {
    direction: Direction,
    confidence: f64,
}

impl FunctionStep for MdIndexStep {
    fn name(&self) -> &'static str {
        match self.direction {
            Direction::TopDown => names::FUNCTION_MD_INDEX_TOP_DOWN,
            Direction::BottomUp => names::FUNCTION_MD_INDEX_BOTTOM_UP,
        }
    }

    fn display_name(&self) -> &'static str {
        match self.direction {
            Direction::TopDown => "Function: MD Index (Top Down)",
            Direction::BottomUp => "Function: MD Index (Bottom Up)",
        }
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary_candidates: &BTreeSet<u32>,
        secondary_candidates: &BTreeSet<u32>,
        context: &mut MatchingContext,
        remaining: &[Box<dyn FunctionStep>],
        basic_block_steps: &[Box<dyn BasicBlockStep>],
    ) -> bool {
        let direction = self.direction;
        let feature = |fg: &crate::graph::flow_graph::FlowGraph| {
            let value = match direction {
                Direction::TopDown => fg.md_index(),
                Direction::BottomUp => fg.md_index_inverted(),
            };
            (value != 0.0).then_some(FloatKey(value))
        };
        let primary = bucket_candidates(context, Side::Primary, primary_candidates, false, feature);
        let secondary =
            bucket_candidates(context, Side::Secondary, secondary_candidates, false, feature);
        match_unique_buckets(
            self,
            &primary,
            &secondary,
            context,
            remaining,
            basic_block_steps,
        )
    }
}

/// Keys functions by the hash of their concatenated instruction bytes.
/// Guarded by the configured minimum instruction count.
struct HashStep {
    confidence: f64,
}

impl FunctionStep for HashStep {
    fn name(&self) -> &'static str {
        names::FUNCTION_HASH
    }

    fn display_name(&self) -> &'static str {
        "Function: Hash"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn strict(&self) -> bool {
        true
    }

    fn find_fixed_points(
        &self,
        primary_candidates: &BTreeSet<u32>,
        secondary_candidates: &BTreeSet<u32>,
        context: &mut MatchingContext,
        remaining: &[Box<dyn FunctionStep>],
        basic_block_steps: &[Box<dyn BasicBlockStep>],
    ) -> bool {
        let minimum = context.config.min_function_instructions as usize;
        let feature = |fg: &crate::graph::flow_graph::FlowGraph| {
            if fg.total_instruction_count() < minimum {
                return None;
            }
            fg.byte_hash()
        };
        let primary = bucket_candidates(context, Side::Primary, primary_candidates, false, feature);
        let secondary =
            bucket_candidates(context, Side::Secondary, secondary_candidates, false, feature);
        match_unique_buckets(
            self,
            &primary,
            &secondary,
            context,
            remaining,
            basic_block_steps,
        )
    }
}

/// Keys functions by the modular product of their mnemonic primes.
struct PrimeSignatureStep {
    confidence: f64,
}

impl FunctionStep for PrimeSignatureStep {
    fn name(&self) -> &'static str {
        names::FUNCTION_PRIME_SIGNATURE
    }

    fn display_name(&self) -> &'static str {
        "Function: Prime Signature"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary_candidates: &BTreeSet<u32>,
        secondary_candidates: &BTreeSet<u32>,
        context: &mut MatchingContext,
        remaining: &[Box<dyn FunctionStep>],
        basic_block_steps: &[Box<dyn BasicBlockStep>],
    ) -> bool {
        let primary = bucket_candidates(context, Side::Primary, primary_candidates, false, |fg| {
            fg.prime_signature()
        });
        let secondary =
            bucket_candidates(context, Side::Secondary, secondary_candidates, false, |fg| {
                fg.prime_signature()
            });
        match_unique_buckets(
            self,
            &primary,
            &secondary,
            context,
            remaining,
            basic_block_steps,
        )
    }
}

/// Keys functions by the multiset of their string-reference values.
struct StringReferencesStep {
    confidence: f64,
}

impl FunctionStep for StringReferencesStep {
    fn name(&self) -> &'static str {
        names::FUNCTION_STRING_REFERENCES
    }

    fn display_name(&self) -> &'static str {
        "Function: String References"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary_candidates: &BTreeSet<u32>,
        secondary_candidates: &BTreeSet<u32>,
        context: &mut MatchingContext,
        remaining: &[Box<dyn FunctionStep>],
        basic_block_steps: &[Box<dyn BasicBlockStep>],
    ) -> bool {
        let primary = bucket_candidates(context, Side::Primary, primary_candidates, false, |fg| {
            fg.string_refs_key()
        });
        let secondary =
            bucket_candidates(context, Side::Secondary, secondary_candidates, false, |fg| {
                fg.string_refs_key()
            });
        match_unique_buckets(
            self,
            &primary,
            &secondary,
            context,
            remaining,
            basic_block_steps,
        )
    }
}

/// Keys functions by the order-preserving sequence of their matched
/// callees. Functions with no matched callee carry no feature, so the key
/// never degenerates to "same number of calls".
struct CallSequenceStep {
    confidence: f64,
}

impl CallSequenceStep {
    fn sequence_key(context: &MatchingContext, side: Side, flow_graph: u32) -> Option<u64> {
        let program = match side {
            Side::Primary => context.primary,
            Side::Secondary => context.secondary,
        };
        let fg = program.flow_graph(flow_graph);
        if fg.basic_block_count() == 0 {
            return None;
        }
        let mut words = Vec::new();
        let mut matched = 0usize;
        for callee in fg.call_targets_in_order() {
            // Identity of a matched callee is the primary entry point of
            // its fixed point, which is side-independent.
            let identity = match side {
                Side::Primary => context
                    .fixed_points
                    .by_primary(callee)
                    .map(|fp| fp.primary_entry()),
                Side::Secondary => context
                    .fixed_points
                    .by_secondary(callee)
                    .map(|fp| fp.primary_entry()),
            };
            match identity {
                Some(entry) => {
                    matched += 1;
                    words.push(entry);
                }
                None => words.push(0),
            }
        }
        if matched == 0 {
            None
        } else {
            Some(hash64_words(&words))
        }
    }
}

impl FunctionStep for CallSequenceStep {
    fn name(&self) -> &'static str {
        names::FUNCTION_CALL_SEQUENCE
    }

    fn display_name(&self) -> &'static str {
        "Function: Call Sequence"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary_candidates: &BTreeSet<u32>,
        secondary_candidates: &BTreeSet<u32>,
        context: &mut MatchingContext,
        remaining: &[Box<dyn FunctionStep>],
        basic_block_steps: &[Box<dyn BasicBlockStep>],
    ) -> bool {
        let mut primary: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
        for &candidate in primary_candidates {
            if let Some(key) = Self::sequence_key(context, Side::Primary, candidate) {
                primary.entry(key).or_default().push(candidate);
            }
        }
        let mut secondary: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
        for &candidate in secondary_candidates {
            if let Some(key) = Self::sequence_key(context, Side::Secondary, candidate) {
                secondary.entry(key).or_default().push(candidate);
            }
        }
        match_unique_buckets(
            self,
            &primary,
            &secondary,
            context,
            remaining,
            basic_block_steps,
        )
    }
}

/// Pairs the remaining functions positionally in address order. Only
/// applies when both candidate sets have the same size, and a pair only
/// commits when block and instruction counts agree; the step carries the
/// lowest confidence in the default list.
struct AddressSequenceStep {
    confidence: f64,
}

impl FunctionStep for AddressSequenceStep {
    fn name(&self) -> &'static str {
        names::FUNCTION_ADDRESS_SEQUENCE
    }

    fn display_name(&self) -> &'static str {
        "Function: Address Sequence"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary_candidates: &BTreeSet<u32>,
        secondary_candidates: &BTreeSet<u32>,
        context: &mut MatchingContext,
        remaining: &[Box<dyn FunctionStep>],
        basic_block_steps: &[Box<dyn BasicBlockStep>],
    ) -> bool {
        // Candidate ids ascend with addresses, so set order is address
        // order.
        let mut ordinal = 0u64;
        let primary = bucket_candidates(context, Side::Primary, primary_candidates, false, |_| {
            ordinal += 1;
            Some(ordinal)
        });
        let mut ordinal = 0u64;
        let secondary =
            bucket_candidates(context, Side::Secondary, secondary_candidates, false, |_| {
                ordinal += 1;
                Some(ordinal)
            });
        if primary.len() != secondary.len() {
            return false;
        }
        match_unique_buckets(
            self,
            &primary,
            &secondary,
            context,
            remaining,
            basic_block_steps,
        )
    }
}

/// Keys functions by the hash of their real name. Auto-generated names do
/// not participate. Stub functions are allowed so imports match by name.
struct NameHashStep {
    confidence: f64,
}

impl FunctionStep for NameHashStep {
    fn name(&self) -> &'static str {
        names::FUNCTION_NAME_HASH
    }

    fn display_name(&self) -> &'static str {
        "Function: Name Hash"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary_candidates: &BTreeSet<u32>,
        secondary_candidates: &BTreeSet<u32>,
        context: &mut MatchingContext,
        remaining: &[Box<dyn FunctionStep>],
        basic_block_steps: &[Box<dyn BasicBlockStep>],
    ) -> bool {
        let primary = bucket_candidates(context, Side::Primary, primary_candidates, true, |fg| {
            fg.name_hash()
        });
        let secondary =
            bucket_candidates(context, Side::Secondary, secondary_candidates, true, |fg| {
                fg.name_hash()
            });
        match_unique_buckets(
            self,
            &primary,
            &secondary,
            context,
            remaining,
            basic_block_steps,
        )
    }
}

/// Placeholder for externally asserted matches; never proposes pairings
/// itself.
struct ManualStep {
    confidence: f64,
}

impl FunctionStep for ManualStep {
    fn name(&self) -> &'static str {
        names::FUNCTION_MANUAL
    }

    fn display_name(&self) -> &'static str {
        "Function: Manual"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        _primary_candidates: &BTreeSet<u32>,
        _secondary_candidates: &BTreeSet<u32>,
        _context: &mut MatchingContext,
        _remaining: &[Box<dyn FunctionStep>],
        _basic_block_steps: &[Box<dyn BasicBlockStep>],
    ) -> bool {
        false
    }
}

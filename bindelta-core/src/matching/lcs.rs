//! Instruction sequence alignment
//!
//! Longest common subsequence over the instruction streams of two matched
//! basic blocks. Equality is mnemonic identity for regular steps and
//! byte-wise equality for strict ones, which is how a strict step detects
//! operand-only changes.

use crate::graph::instruction::Instruction;
use crate::matching::fixed_points::InstructionMatch;

fn equal(a: &Instruction, b: &Instruction, strict: bool) -> bool {
    if strict {
        a.bytes == b.bytes
    } else {
        a.mnemonic == b.mnemonic
    }
}

/// Aligns two instruction slices and returns the matched index pairs in
/// order. `primary_base`/`secondary_base` offset the pair indices into the
/// owning functions' flat instruction arrays.
pub fn compute_lcs(
    primary: &[Instruction],
    secondary: &[Instruction],
    primary_base: u32,
    secondary_base: u32,
    strict: bool,
) -> Vec<InstructionMatch> {
    let m = primary.len();
    let n = secondary.len();
    if m == 0 || n == 0 {
        return Vec::new();
    }

    // DP table of subsequence lengths, (m + 1) x (n + 1).
    let width = n + 1;
    let mut table = vec![0u32; (m + 1) * width];
    for i in 1..=m {
        for j in 1..=n {
            table[i * width + j] = if equal(&primary[i - 1], &secondary[j - 1], strict) {
                table[(i - 1) * width + (j - 1)] + 1
            } else {
                table[(i - 1) * width + j].max(table[i * width + (j - 1)])
            };
        }
    }

    // Backtrack, preferring the primary side on ties so results are
    // deterministic.
    let mut matches = Vec::with_capacity(table[m * width + n] as usize);
    let (mut i, mut j) = (m, n);
    while i > 0 && j > 0 {
        if equal(&primary[i - 1], &secondary[j - 1], strict) {
            matches.push(InstructionMatch {
                primary: primary_base + (i as u32 - 1),
                secondary: secondary_base + (j as u32 - 1),
            });
            i -= 1;
            j -= 1;
        } else if table[(i - 1) * width + j] >= table[i * width + (j - 1)] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    matches.reverse();
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interner;

    fn sequence(interner: &mut Interner, mnemonics: &[&str]) -> Vec<Instruction> {
        mnemonics
            .iter()
            .enumerate()
            .map(|(i, m)| Instruction::new(interner, i as u64, m, m.as_bytes()))
            .collect()
    }

    #[test]
    fn identical_sequences_match_fully() {
        let mut interner = Interner::new();
        let a = sequence(&mut interner, &["push", "mov", "ret"]);
        let b = sequence(&mut interner, &["push", "mov", "ret"]);
        let matches = compute_lcs(&a, &b, 0, 0, false);
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[2].primary, 2);
        assert_eq!(matches[2].secondary, 2);
    }

    #[test]
    fn insertion_leaves_a_gap() {
        let mut interner = Interner::new();
        let a = sequence(&mut interner, &["push", "mov", "ret"]);
        let b = sequence(&mut interner, &["push", "xor", "mov", "ret"]);
        let matches = compute_lcs(&a, &b, 0, 0, false);
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[1].secondary, 2);
    }

    #[test]
    fn strict_mode_compares_bytes() {
        let mut interner = Interner::new();
        let a = vec![Instruction::new(&mut interner, 0, "jz", &[0x74, 0x05])];
        let b = vec![Instruction::new(&mut interner, 0, "jz", &[0x74, 0x09])];
        assert_eq!(compute_lcs(&a, &b, 0, 0, false).len(), 1);
        assert_eq!(compute_lcs(&a, &b, 0, 0, true).len(), 0);
    }

    #[test]
    fn bases_offset_the_indices() {
        let mut interner = Interner::new();
        let a = sequence(&mut interner, &["ret"]);
        let b = sequence(&mut interner, &["ret"]);
        let matches = compute_lcs(&a, &b, 10, 20, false);
        assert_eq!(matches[0].primary, 10);
        assert_eq!(matches[0].secondary, 20);
    }
}

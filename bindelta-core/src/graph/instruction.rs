//! Instruction model
//!
//! Matching consumes only three instruction properties: the address, the
//! interned mnemonic and the raw byte string. Operand trees stay in the
//! payload; they are not needed for structural matching.
//!
//! Each instruction also caches the small prime assigned to its mnemonic.
//! Prime-signature steps multiply these primes in the wrapping `u64` ring,
//! giving an order-insensitive fingerprint of a function's or basic block's
//! instruction mix.

use std::sync::OnceLock;

use smallvec::SmallVec;

use crate::intern::{Interner, Symbol};
use crate::Address;

/// Number of primes in the mnemonic mapping table.
const PRIME_TABLE_SIZE: usize = 1024;

static PRIME_TABLE: OnceLock<Vec<u64>> = OnceLock::new();

fn prime_table() -> &'static [u64] {
    PRIME_TABLE.get_or_init(|| {
        let mut primes = Vec::with_capacity(PRIME_TABLE_SIZE);
        let mut candidate: u64 = 2;
        while primes.len() < PRIME_TABLE_SIZE {
            if primes.iter().all(|&p| candidate % p != 0) {
                primes.push(candidate);
            }
            candidate += 1;
        }
        primes
    })
}

/// Maps a mnemonic to a small prime via its CRC32.
///
/// Distinct mnemonics may collide on the same prime; that only widens a
/// bucket and can never produce a false unique match on its own.
pub fn mnemonic_prime(mnemonic: &str) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(mnemonic.as_bytes());
    let table = prime_table();
    table[hasher.finalize() as usize % table.len()]
}

/// One disassembled instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: Address,
    pub mnemonic: Symbol,
    /// Prime assigned to the mnemonic, cached at construction.
    pub prime: u64,
    /// Raw encoding; inline up to 16 bytes, which covers every fixed-width
    /// ISA and nearly all x86 encodings.
    pub bytes: SmallVec<[u8; 16]>,
}

impl Instruction {
    pub fn new(interner: &mut Interner, address: Address, mnemonic: &str, bytes: &[u8]) -> Self {
        Instruction {
            address,
            mnemonic: interner.intern(mnemonic),
            prime: mnemonic_prime(mnemonic),
            bytes: SmallVec::from_slice(bytes),
        }
    }
}

/// Wrapping product of the mnemonic primes of `instructions`.
///
/// Returns 1 for an empty slice; callers treat empty sequences as "no
/// feature" before bucketing.
pub fn prime_signature(instructions: &[Instruction]) -> u64 {
    instructions
        .iter()
        .fold(1u64, |product, instruction| product.wrapping_mul(instruction.prime))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonic_primes_are_stable_and_prime() {
        let p = mnemonic_prime("mov");
        assert_eq!(p, mnemonic_prime("mov"));
        assert!(p >= 2);
        for divisor in 2..p {
            assert_ne!(p % divisor, 0, "{p} is not prime");
        }
    }

    #[test]
    fn prime_signature_is_order_insensitive() {
        let mut interner = Interner::new();
        let a = Instruction::new(&mut interner, 0, "push", &[0x55]);
        let b = Instruction::new(&mut interner, 1, "mov", &[0x89, 0xe5]);
        let ab = prime_signature(&[a.clone(), b.clone()]);
        let ba = prime_signature(&[b, a]);
        assert_eq!(ab, ba);
    }
}

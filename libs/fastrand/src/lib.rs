// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Small, fast, non-cryptographic random number generator.
//!
//! Implements `splitmix64` (Steele, Lea & Flood, "Fast splittable
//! pseudorandom number generators", OOPSLA 2014; mixing constants from
//! Vigna's public-domain reference implementation at
//! <https://prng.di.unimi.it/splitmix64.c>). One word of state, a full
//! 2^64 period, and every seed — zero included — is valid, which is all the
//! runtime needs: unbiased select-case shuffles and a little id jitter.
//! Never use this for anything security-relevant.

#![cfg_attr(not(test), no_std)]

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Fast, non-cryptographic random number generator.
#[derive(Clone, Copy, Debug)]
pub struct FastRand {
    state: u64,
}

impl FastRand {
    /// Initializes a new generator from the provided seed.
    pub fn from_seed(seed: u64) -> FastRand {
        FastRand { state: seed }
    }

    /// Generate a random `u64`.
    pub fn next_u64(&mut self) -> u64 {
        // Weyl sequence step, then the fmix64-style finalizer.
        self.state = self.state.wrapping_add(GOLDEN_GAMMA);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Generate a random `u32`.
    #[expect(clippy::cast_possible_truncation, reason = "high half of the mixed output")]
    pub fn fastrand(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Generate a random `u32` in `0..n`.
    #[expect(clippy::cast_possible_truncation, reason = "high 32 bits of a 64-bit product")]
    pub fn fastrand_n(&mut self, n: u32) -> u32 {
        // This is similar to fastrand() % n, but faster.
        // See https://lemire.me/blog/2016/06/27/a-fast-alternative-to-the-modulo-reduction/
        let mul = u64::from(self.fastrand()).wrapping_mul(u64::from(n));
        (mul >> 32) as u32
    }

    /// Fisher-Yates shuffle of `slice`.
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        for i in (1..slice.len()).rev() {
            #[expect(clippy::cast_possible_truncation, reason = "i < u32::MAX")]
            let j = self.fastrand_n(i as u32 + 1) as usize;
            slice.swap(i, j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_the_reference_vectors() {
        // First three outputs of Vigna's splitmix64.c for seed 0.
        let mut rng = FastRand::from_seed(0);
        assert_eq!(rng.next_u64(), 0xE220_A839_7B1D_CDAF);
        assert_eq!(rng.next_u64(), 0x6E78_9E6A_A1B9_65F4);
        assert_eq!(rng.next_u64(), 0x06C4_5D18_8009_454F);
    }

    #[test]
    fn bounded_stays_in_range() {
        let mut rng = FastRand::from_seed(GOLDEN_GAMMA);
        for _ in 0..10_000 {
            assert!(rng.fastrand_n(7) < 7);
        }
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut rng = FastRand::from_seed(42);
        let mut v: Vec<u32> = (0..32).collect();
        rng.shuffle(&mut v);
        let mut sorted = v.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn zero_seed_still_generates() {
        let mut rng = FastRand::from_seed(0);
        let a = rng.fastrand();
        let b = rng.fastrand();
        assert!(a != 0 || b != 0);
    }
}

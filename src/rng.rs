//! Small deterministic generator for permutation draws.
//!
//! Every thread owns one [`Rng`] seeded with its thread index, so chase
//! construction is reproducible run-to-run on any host: same seed, same
//! arena layout. The generator is a splitmix64-seeded xorshift64*, which is
//! far past adequate for shuffling 2^29 elements (the largest arena the
//! chase tool targets: 64 GiB at 128-byte stride). It is not a
//! cryptographic generator and does not try to be.
//!
//! This replaces the historical pair of generators (a 32-bit LCRNG, later
//! glibc's `random_r`) with one that is reproducible across platforms, not
//! just across runs on one libc.

/// Deterministic 64-bit generator with bounded uniform draws.
#[derive(Clone, Debug)]
pub struct Rng {
    state: u64,
}

impl Rng {
    /// Creates a generator whose sequence is a pure function of `seed`.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        // splitmix64 scrambles dense seeds (0, 1, 2, ...) into well-spread
        // nonzero xorshift states.
        let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^= z >> 31;
        Self {
            state: if z == 0 { 0x9e37_79b9_7f4a_7c15 } else { z },
        }
    }

    /// Next raw 64-bit value (xorshift64*).
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Uniform draw from `[0, limit]`, inclusive on both ends.
    ///
    /// Uses the widening multiply-shift reduction instead of a modulo, so
    /// there is no low-bit bias from the weaker output bits.
    #[inline]
    pub fn next_int(&mut self, limit: u64) -> u64 {
        if limit == u64::MAX {
            return self.next_u64();
        }
        let range = limit + 1;
        (((self.next_u64() as u128) * (range as u128)) >> 64) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::Rng;

    #[test]
    fn deterministic_per_seed() {
        let a: Vec<u64> = {
            let mut r = Rng::new(3);
            (0..32).map(|_| r.next_u64()).collect()
        };
        let b: Vec<u64> = {
            let mut r = Rng::new(3);
            (0..32).map(|_| r.next_u64()).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn seeds_diverge() {
        let mut a = Rng::new(0);
        let mut b = Rng::new(1);
        let same = (0..16).filter(|_| a.next_u64() == b.next_u64()).count();
        assert_eq!(same, 0);
    }

    #[test]
    fn bounded_draws_stay_in_range() {
        let mut r = Rng::new(17);
        for limit in [0u64, 1, 2, 7, 100, 1 << 31] {
            for _ in 0..200 {
                assert!(r.next_int(limit) <= limit);
            }
        }
    }

    #[test]
    fn zero_limit_is_constant() {
        let mut r = Rng::new(5);
        for _ in 0..64 {
            assert_eq!(r.next_int(0), 0);
        }
    }

    #[test]
    fn small_limits_hit_every_value() {
        let mut r = Rng::new(9);
        let mut seen = [false; 8];
        for _ in 0..512 {
            seen[r.next_int(7) as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}

//! Permutations and the mixer table.
//!
//! The chase builder consumes two kinds of index sequences: full random
//! permutations (the default, one per TLB group) and the identity (the `-o`
//! ordered traversal). Both are expressed through [`PermKind`] so callers
//! never branch on which generator is in play.
//!
//! # The mixer
//! Suppose the stride is 256. If every chase cell sat at offset 0 into its
//! element, the whole walk would favour one bank/set/way of every indexed
//! structure in the memory system, and parallel chases would collide on the
//! same cell. The mixer assigns each (element, chase) pair an offset inside
//! the element: a table of per-slot permutations over the
//! `stride / base_object_size` possible cell positions, indexed by the low
//! bits of the element number. Because each slot's column is a permutation,
//! two different chases (`mixer_idx` values) can never land on the same
//! cell of the same element.
//!
//! The table is stored transposed — `table[j * nr_mixers + i]` is the
//! `j`-th mixer index of slot `i` — so one chase's lookups
//! (`j = mixer_idx` fixed, `i` varying) stream through one contiguous row.

use crate::rng::Rng;

/// Which index-sequence generator a run uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermKind {
    /// Uniform random permutation (Fisher–Yates).
    Random,
    /// Identity permutation, `out[i] = base + i`.
    Ordered,
}

impl PermKind {
    /// Fills `out` with a permutation of `{base, …, base + out.len() - 1}`.
    pub fn fill(self, rng: &mut Rng, out: &mut [usize], base: usize) {
        match self {
            Self::Random => gen_random_permutation(rng, out, base),
            Self::Ordered => gen_ordered_permutation(out, base),
        }
    }
}

/// Uniform random permutation of `{base, …, base + out.len() - 1}`.
///
/// Inside-out Fisher–Yates: each prefix of `out` is a uniform permutation
/// of the values placed so far, so the whole array is uniform when the
/// loop finishes.
pub fn gen_random_permutation(rng: &mut Rng, out: &mut [usize], base: usize) {
    for i in 0..out.len() {
        let t = rng.next_int(i as u64) as usize;
        out[i] = out[t];
        out[t] = base + i;
    }
}

/// Identity permutation, `out[i] = base + i`.
pub fn gen_ordered_permutation(out: &mut [usize], base: usize) {
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = base + i;
    }
}

/// Verifies that `perm` is a bijection onto `{0, …, perm.len() - 1}`.
///
/// Uses a word bitset: one pass sets a bit per value (rejecting range
/// violations and duplicates), which together with the length pigeonholes
/// the map into a bijection.
#[must_use]
pub fn is_a_permutation(perm: &[usize]) -> bool {
    let nr = perm.len();
    let mut seen = vec![0u64; nr.div_ceil(64)];
    for &v in perm {
        if v >= nr {
            return false;
        }
        let word = v / 64;
        let bit = 1u64 << (v % 64);
        if seen[word] & bit != 0 {
            return false;
        }
        seen[word] |= bit;
    }
    true
}

/// Per-slot offset permutations, transposed for streaming lookups.
///
/// # Invariants
/// - `nr_mixers` is a power of two, at least 64.
/// - For every slot `i`, `{table[j * nr_mixers + i] : j}` is a permutation
///   of `[0, nr_indices)`.
#[derive(Clone, Debug)]
pub struct Mixer {
    table: Vec<usize>,
    nr_mixers: usize,
    nr_indices: usize,
}

impl Mixer {
    /// Smallest slot count ever used; keeps the low-bit indexing useful
    /// even for single-thread single-chase runs.
    pub const MIN_SLOTS: usize = 64;

    /// Builds the mixer table.
    ///
    /// `nr_indices` is the number of cell positions per element
    /// (`stride / base_object_size`); `min_slots` is the number of
    /// distinct chases that must never collide (`nr_threads *
    /// parallelism`), rounded up internally to a power of two with a floor
    /// of [`Self::MIN_SLOTS`].
    #[must_use]
    pub fn generate(rng: &mut Rng, kind: PermKind, nr_indices: usize, min_slots: usize) -> Self {
        let nr_mixers = min_slots.max(Self::MIN_SLOTS).next_power_of_two();
        let mut table = vec![0usize; nr_indices * nr_mixers];
        let mut t = vec![0usize; nr_indices];
        for i in 0..nr_mixers {
            kind.fill(rng, &mut t, 0);
            for (j, &v) in t.iter().enumerate() {
                table[j * nr_mixers + i] = v;
            }
        }
        Self {
            table,
            nr_mixers,
            nr_indices,
        }
    }

    /// Number of mixer slots (power of two).
    #[inline]
    #[must_use]
    pub fn nr_mixers(&self) -> usize {
        self.nr_mixers
    }

    /// Number of cell positions per element.
    #[inline]
    #[must_use]
    pub fn nr_indices(&self) -> usize {
        self.nr_indices
    }

    /// The row used by chase `mixer_idx`: one offset index per slot.
    ///
    /// # Panics
    /// Panics if `mixer_idx >= nr_indices`.
    #[inline]
    #[must_use]
    pub fn row(&self, mixer_idx: usize) -> &[usize] {
        &self.table[mixer_idx * self.nr_mixers..(mixer_idx + 1) * self.nr_mixers]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_is_identity() {
        let mut out = vec![0usize; 9];
        gen_ordered_permutation(&mut out, 4);
        assert_eq!(out, (4..13).collect::<Vec<_>>());
    }

    #[test]
    fn random_is_a_permutation() {
        let mut rng = Rng::new(0);
        for nr in [1usize, 2, 3, 64, 65, 1000] {
            let mut out = vec![0usize; nr];
            gen_random_permutation(&mut rng, &mut out, 0);
            assert!(is_a_permutation(&out), "nr = {nr}");
        }
    }

    #[test]
    fn random_with_base_covers_biased_range() {
        let mut rng = Rng::new(1);
        let mut out = vec![0usize; 16];
        gen_random_permutation(&mut rng, &mut out, 100);
        let mut sorted = out.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (100..116).collect::<Vec<_>>());
    }

    #[test]
    fn permutation_check_rejects_bad_inputs() {
        assert!(is_a_permutation(&[0, 1, 2, 3]));
        assert!(!is_a_permutation(&[0, 1, 1, 3]));
        assert!(!is_a_permutation(&[0, 1, 2, 4]));
        assert!(is_a_permutation(&[]));
        // Word-boundary sizes.
        let id: Vec<usize> = (0..65).collect();
        assert!(is_a_permutation(&id));
    }

    #[test]
    fn mixer_columns_are_permutations() {
        // stride 256 with 8-byte cells: 32 positions per element.
        let mut rng = Rng::new(0);
        let mixer = Mixer::generate(&mut rng, PermKind::Random, 32, 3);
        assert_eq!(mixer.nr_mixers(), 64); // floor applies
        for slot in 0..mixer.nr_mixers() {
            let column: Vec<usize> = (0..32).map(|j| mixer.row(j)[slot]).collect();
            assert!(is_a_permutation(&column), "slot {slot}");
        }
    }

    #[test]
    fn mixer_rounds_slots_to_power_of_two() {
        let mut rng = Rng::new(0);
        let mixer = Mixer::generate(&mut rng, PermKind::Random, 4, 100);
        assert_eq!(mixer.nr_mixers(), 128);
        assert_eq!(mixer.row(0).len(), 128);
    }

    #[test]
    fn ordered_mixer_pins_every_chase_to_its_own_lane() {
        let mut rng = Rng::new(0);
        let mixer = Mixer::generate(&mut rng, PermKind::Ordered, 8, 2);
        for slot in 0..mixer.nr_mixers() {
            for j in 0..8 {
                assert_eq!(mixer.row(j)[slot], j);
            }
        }
    }
}

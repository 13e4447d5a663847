//! Property tests for permutation generation and chase construction.

use proptest::prelude::*;

use memlat::chase::graph::{cycle_len, generate_chase, ChaseArgs};
use memlat::permutation::{gen_random_permutation, is_a_permutation, Mixer, PermKind};
use memlat::rng::Rng;

/// Word-aligned zeroed backing store standing in for an arena.
fn buffer(bytes: usize) -> Vec<usize> {
    vec![0usize; bytes / std::mem::size_of::<usize>()]
}

fn chase_args(
    buf: &mut [usize],
    stride: usize,
    tlb_locality: usize,
    seed: u64,
    chases: usize,
) -> ChaseArgs {
    let nr_mixer_indices = stride / std::mem::size_of::<usize>();
    let mut rng = Rng::new(seed);
    ChaseArgs {
        base: buf.as_mut_ptr().cast(),
        total_memory: buf.len() * std::mem::size_of::<usize>(),
        stride,
        tlb_locality,
        perm_kind: PermKind::Random,
        nr_mixer_indices,
        mixer: Mixer::generate(&mut rng, PermKind::Random, nr_mixer_indices, chases),
    }
}

proptest! {
    /// Any size, any seed: the generator must produce a bijection.
    #[test]
    fn random_permutations_are_bijections(nr in 1usize..2048, seed in any::<u64>()) {
        let mut rng = Rng::new(seed);
        let mut out = vec![0usize; nr];
        gen_random_permutation(&mut rng, &mut out, 0);
        prop_assert!(is_a_permutation(&out));
    }

    /// Same seed, same size: identical output, run to run.
    #[test]
    fn permutations_are_seed_deterministic(nr in 1usize..512, seed in any::<u64>()) {
        let mut a = vec![0usize; nr];
        let mut b = vec![0usize; nr];
        gen_random_permutation(&mut Rng::new(seed), &mut a, 0);
        gen_random_permutation(&mut Rng::new(seed), &mut b, 0);
        prop_assert_eq!(a, b);
    }

    /// Following the cycle visits every element exactly once, never leaves
    /// the arena, and always lands inside an element's stride-byte slot.
    #[test]
    fn cycles_cover_the_arena(
        stride_words in 1usize..16,
        elts_per_group in 1usize..32,
        groups in 1usize..6,
        seed in any::<u64>(),
    ) {
        let word = std::mem::size_of::<usize>();
        let stride = stride_words * word;
        let tlb_locality = elts_per_group * stride;
        let mut buf = buffer(groups * tlb_locality);
        let args = chase_args(&mut buf, stride, tlb_locality, seed, 1);
        let nr_elts = args.nr_elts();

        let mut rng = Rng::new(seed);
        let head = unsafe { generate_chase(&args, 0, &mut rng) };

        let mut seen = vec![false; nr_elts];
        let mut p = head as *const u8;
        for _ in 0..nr_elts {
            let off = p as usize - args.base as usize;
            prop_assert!(off < args.total_memory, "walk left the arena");
            prop_assert_eq!(off % word, 0, "cell must be word aligned");
            let elt = off / stride;
            prop_assert!(!seen[elt], "element visited twice");
            seen[elt] = true;
            p = unsafe { p.cast::<usize>().read() } as *const u8;
        }
        prop_assert_eq!(p, head as *const u8, "cycle must close exactly");
        prop_assert_eq!(unsafe { cycle_len(head) }, nr_elts);
    }

    /// Parallel chases may never collide on a cell: distinct mixer rows
    /// give every element distinct offsets.
    #[test]
    fn mixer_rows_never_collide(
        nr_indices_pow in 1u32..6,
        chases in 2usize..8,
        seed in any::<u64>(),
    ) {
        let nr_indices = 1usize << nr_indices_pow;
        prop_assume!(chases <= nr_indices);
        let mut rng = Rng::new(seed);
        let mixer = Mixer::generate(&mut rng, PermKind::Random, nr_indices, chases);
        for slot in 0..mixer.nr_mixers() {
            for a in 0..chases {
                for b in (a + 1)..chases {
                    prop_assert_ne!(mixer.row(a)[slot], mixer.row(b)[slot]);
                }
            }
        }
    }

    /// Within any aligned tlb_locality window, the chase enters once and
    /// takes exactly window/stride consecutive steps before leaving.
    #[test]
    fn tlb_windows_are_visited_in_one_burst(
        stride_words in 1usize..8,
        elts_per_group in 2usize..16,
        groups in 2usize..8,
        seed in any::<u64>(),
    ) {
        let word = std::mem::size_of::<usize>();
        let stride = stride_words * word;
        let tlb_locality = elts_per_group * stride;
        let mut buf = buffer(groups * tlb_locality);
        let args = chase_args(&mut buf, stride, tlb_locality, seed, 1);

        let mut rng = Rng::new(seed);
        let head = unsafe { generate_chase(&args, 0, &mut rng) };

        let mut entries = vec![0usize; groups];
        let mut p = head as *const u8;
        let mut current = usize::MAX;
        let mut run = 0usize;
        for _ in 0..args.nr_elts() {
            let group = (p as usize - args.base as usize) / tlb_locality;
            if group != current {
                if current != usize::MAX {
                    prop_assert_eq!(run, elts_per_group, "left a window early");
                }
                entries[group] += 1;
                current = group;
                run = 0;
            }
            run += 1;
            p = unsafe { p.cast::<usize>().read() } as *const u8;
        }
        prop_assert_eq!(run, elts_per_group);
        prop_assert!(entries.iter().all(|&e| e == 1), "window entered more than once");
    }
}

/// The published interleave contract: 1 MiB at stride 256 with 64-page
/// groups builds a legal single cycle.
#[test]
fn megabyte_arena_default_geometry() {
    let stride = 256;
    let tlb_locality = 64 * 4096;
    let total = 1 << 20; // four 64-page groups
    let mut buf = buffer(total);
    let args = chase_args(&mut buf, stride, tlb_locality, 0, 1);
    let mut rng = Rng::new(0);
    let head = unsafe { generate_chase(&args, 0, &mut rng) };
    assert_eq!(unsafe { cycle_len(head) }, total / stride);
}

//! Cyclic pointer-graph construction.
//!
//! The arena is treated as `nr_elts = total_memory / stride` elements of
//! `stride` bytes. One cell per element — a machine word at a per-element,
//! per-chase offset chosen by the mixer — stores the absolute address of
//! the next element's cell, forming a single cycle over all elements.
//!
//! # Visit order
//! Element visit order is a permutation built in two levels: a random
//! permutation over the `total_memory / tlb_locality` TLB groups, then an
//! independent random permutation inside each group. Consecutive chase
//! steps therefore stay inside one `tlb_locality`-byte span for
//! `tlb_locality / stride` steps (amortizing TLB fills) while the span
//! order itself is random.
//!
//! # Parallel chases
//! Distinct `mixer_idx` values use distinct cell offsets inside every
//! element (the mixer column is a permutation), so several chases — across
//! threads or within one thread — share one arena without their writes or
//! walks ever touching the same cell.

use crate::permutation::{is_a_permutation, Mixer, PermKind};
use crate::rng::Rng;

/// Everything the graph builders need, shared read-only by all workers.
///
/// `base` already includes the user-requested start offset; the chase
/// occupies `base .. base + total_memory`.
///
/// # Invariants
/// - `stride` divides `tlb_locality`, `tlb_locality` divides
///   `total_memory` (the runner normalizes option values to enforce this).
/// - `nr_mixer_indices` divides `stride`.
#[derive(Debug)]
pub struct ChaseArgs {
    pub base: *mut u8,
    pub total_memory: usize,
    pub stride: usize,
    pub tlb_locality: usize,
    pub perm_kind: PermKind,
    pub nr_mixer_indices: usize,
    pub mixer: Mixer,
}

// SAFETY: workers write disjoint cells (distinct mixer columns never map
// the same element to the same offset); everything else here is read-only.
unsafe impl Send for ChaseArgs {}
unsafe impl Sync for ChaseArgs {}

impl ChaseArgs {
    /// Number of elements in the cycle.
    #[inline]
    #[must_use]
    pub fn nr_elts(&self) -> usize {
        self.total_memory / self.stride
    }

    /// Bytes between adjacent cell positions inside an element.
    #[inline]
    #[must_use]
    pub fn mixer_scale(&self) -> usize {
        self.stride / self.nr_mixer_indices
    }

    /// Byte offset of element `x`'s cell for the chase using `row`.
    #[inline]
    fn mixed(&self, row: &[usize], x: usize) -> usize {
        x * self.stride + row[x & (self.mixer.nr_mixers() - 1)] * self.mixer_scale()
    }

    /// Builds the two-level visit permutation for one cycle.
    fn visit_order(&self, rng: &mut Rng) -> Vec<usize> {
        let nr_tlb_groups = self.total_memory / self.tlb_locality;
        let nr_elts_per_tlb = self.tlb_locality / self.stride;

        let mut tlb_perm = vec![0usize; nr_tlb_groups];
        self.perm_kind.fill(rng, &mut tlb_perm, 0);

        let mut perm = vec![0usize; self.nr_elts()];
        for (i, &group) in tlb_perm.iter().enumerate() {
            self.perm_kind.fill(
                rng,
                &mut perm[i * nr_elts_per_tlb..(i + 1) * nr_elts_per_tlb],
                group * nr_elts_per_tlb,
            );
        }
        debug_assert!(is_a_permutation(&perm));
        perm
    }
}

/// Threads one cycle through the arena and returns its starting cell.
///
/// Visiting successors from the returned cell touches every element
/// exactly once before closing. Forward-linked: element `perm[i]`'s cell
/// points at element `perm[i+1 mod n]`'s cell.
///
/// # Safety
/// `args.base` must be valid for `args.total_memory` bytes, and no other
/// thread may concurrently build a chase with the same `mixer_idx`.
pub unsafe fn generate_chase(args: &ChaseArgs, mixer_idx: usize, rng: &mut Rng) -> *mut u8 {
    let perm = args.visit_order(rng);
    let nr_elts = perm.len();
    let row = args.mixer.row(mixer_idx);

    for i in 0..nr_elts {
        let next = if i + 1 == nr_elts { 0 } else { i + 1 };
        let cell = args.base.add(args.mixed(row, perm[i])).cast::<usize>();
        cell.write(args.base.add(args.mixed(row, perm[next])) as usize);
    }

    args.base.add(args.mixed(row, 0))
}

/// Threads a super-cycle that crosses `nr_mixer_indices / total_par`
/// independent permutations once each.
///
/// Each full pass over the arena uses a different mixer row, so a
/// prefetcher that learns per-cell successors during one pass is wrong on
/// the next. The super-cycle has `nr_iterations * nr_elts` steps.
///
/// # Safety
/// As [`generate_chase`]; additionally `mixer_idx < total_par` so the row
/// blocks of concurrent builders stay disjoint.
pub unsafe fn generate_chase_long(
    args: &ChaseArgs,
    mixer_idx: usize,
    total_par: usize,
    rng: &mut Rng,
) -> *mut u8 {
    let nr_iterations = args.nr_mixer_indices / total_par;
    let nr_elts = args.nr_elts();
    let row = |i: usize| args.mixer.row(mixer_idx * nr_iterations + i);

    // One two-level permutation per iteration, biased into its own value
    // band so the concatenation is a permutation of the super-cycle.
    let mut perm = Vec::with_capacity(nr_iterations * nr_elts);
    for j in 0..nr_iterations {
        let mut one = args.visit_order(rng);
        for v in &mut one {
            *v += j * nr_elts;
        }
        perm.extend_from_slice(&one);
    }
    debug_assert!(is_a_permutation(&perm));

    let total = nr_iterations * nr_elts;
    let mut cur = 0usize;
    for i in 0..nr_iterations {
        for j in 0..nr_elts {
            let next = if cur + 1 == total { 0 } else { cur + 1 };
            let i_next = if j + 1 == nr_elts {
                if next == 0 {
                    0
                } else {
                    i + 1
                }
            } else {
                i
            };
            let cell = args
                .base
                .add(args.mixed(row(i), perm[cur] % nr_elts))
                .cast::<usize>();
            cell.write(args.base.add(args.mixed(row(i_next), perm[next] % nr_elts)) as usize);
            cur += 1;
        }
    }

    args.base.add(args.mixed(row(0), 0))
}

/// Walks the cycle from `head` and counts steps until it closes.
///
/// # Safety
/// `head` must point at a cell of a well-formed cycle.
pub unsafe fn cycle_len(head: *const u8) -> usize {
    let mut count = 0usize;
    let mut p = head;
    loop {
        count += 1;
        p = p.cast::<usize>().read() as *const u8;
        if p == head {
            return count;
        }
    }
}

/// Plants a secondary pointer at `p + offset` of every element so a single
/// chase reads both the cell and its critical-word sibling each step.
///
/// After this rewrite the cycle alternates cell → sibling → next cell, so
/// its length doubles.
///
/// # Safety
/// `head` must be a well-formed cycle and every `cell + offset` must stay
/// inside the element's `stride` bytes.
pub unsafe fn plant_critword(head: *mut u8, offset: usize) {
    let mut p = head;
    loop {
        let next = p.cast::<usize>().read() as *mut u8;
        p.add(offset).cast::<usize>().write(next as usize);
        p.cast::<usize>().write(p.add(offset) as usize);
        p = next;
        if p == head {
            return;
        }
    }
}

/// Builds the shadow cycle for a two-head critical-word chase: for every
/// cell `p`, `p + offset` points at `next + offset`.
///
/// # Safety
/// As [`plant_critword`].
pub unsafe fn plant_critword2(head: *mut u8, offset: usize) {
    let mut p = head;
    loop {
        let next = p.cast::<usize>().read() as *mut u8;
        p.add(offset).cast::<usize>().write(next.add(offset) as usize);
        p = next;
        if p == head {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Word-aligned zeroed buffer standing in for an arena.
    fn buffer(bytes: usize) -> Vec<usize> {
        vec![0usize; bytes / std::mem::size_of::<usize>()]
    }

    fn args(buf: &mut [usize], stride: usize, tlb: usize, kind: PermKind, threads: usize) -> ChaseArgs {
        let total = buf.len() * std::mem::size_of::<usize>();
        let nr_mixer_indices = stride / std::mem::size_of::<usize>();
        let mut rng = Rng::new(0);
        ChaseArgs {
            base: buf.as_mut_ptr().cast(),
            total_memory: total,
            stride,
            tlb_locality: tlb,
            perm_kind: kind,
            nr_mixer_indices,
            mixer: Mixer::generate(&mut rng, kind, nr_mixer_indices, threads),
        }
    }

    #[test]
    fn ordered_word_cycle_is_sequential() {
        // 8 one-word elements, ordered: the cycle must be 0→1→…→7→0.
        let word = std::mem::size_of::<usize>();
        let mut buf = buffer(8 * word);
        let args = args(&mut buf, word, 8 * word, PermKind::Ordered, 1);
        let mut rng = Rng::new(0);
        let head = unsafe { generate_chase(&args, 0, &mut rng) };
        assert_eq!(head as usize, args.base as usize);
        let mut p = head;
        for i in 1..=8usize {
            p = unsafe { p.cast::<usize>().read() } as *mut u8;
            let expect = if i == 8 { 0 } else { i };
            assert_eq!(p as usize, args.base as usize + expect * word);
        }
        assert_eq!(unsafe { cycle_len(head) }, 8);
    }

    #[test]
    fn random_cycle_visits_every_element_once() {
        let mut buf = buffer(1 << 16);
        let args = args(&mut buf, 128, 1024, PermKind::Random, 1);
        let mut rng = Rng::new(7);
        let head = unsafe { generate_chase(&args, 0, &mut rng) };
        let nr_elts = args.nr_elts();

        let mut seen = vec![false; nr_elts];
        let mut p = head as *const u8;
        for _ in 0..nr_elts {
            let off = p as usize - args.base as usize;
            assert!(off < args.total_memory);
            let elt = off / args.stride;
            assert!(!seen[elt], "element {elt} visited twice");
            seen[elt] = true;
            p = unsafe { p.cast::<usize>().read() } as *const u8;
        }
        assert_eq!(p, head as *const u8, "cycle must close after nr_elts steps");
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn distinct_mixer_rows_use_disjoint_cells() {
        let mut buf = buffer(1 << 14);
        let args = args(&mut buf, 256, 4096, PermKind::Random, 4);
        let row_a = args.mixer.row(0);
        let row_b = args.mixer.row(1);
        for x in 0..args.nr_elts() {
            assert_ne!(args.mixed(row_a, x), args.mixed(row_b, x), "element {x}");
        }
    }

    #[test]
    fn tlb_groups_are_traversed_contiguously() {
        let mut buf = buffer(1 << 16);
        let stride = 64;
        let tlb = 512; // 8 elements per group
        let args = args(&mut buf, stride, tlb, PermKind::Random, 1);
        let mut rng = Rng::new(3);
        let head = unsafe { generate_chase(&args, 0, &mut rng) };

        let nr_elts = args.nr_elts();
        let per_group = tlb / stride;
        let mut entries = vec![0usize; args.total_memory / tlb];
        let mut p = head as *const u8;
        let mut run_group = usize::MAX;
        let mut run_len = 0usize;
        for _ in 0..nr_elts {
            let group = (p as usize - args.base as usize) / tlb;
            if group != run_group {
                if run_group != usize::MAX {
                    assert_eq!(run_len, per_group, "left group {run_group} early");
                }
                entries[group] += 1;
                run_group = group;
                run_len = 0;
            }
            run_len += 1;
            p = unsafe { p.cast::<usize>().read() } as *const u8;
        }
        assert_eq!(run_len, per_group);
        assert!(entries.iter().all(|&e| e == 1), "each group entered once");
    }

    #[test]
    fn long_chase_closes_after_every_pass() {
        let word = std::mem::size_of::<usize>();
        let stride = 8 * word; // 8 cell positions per element
        let mut buf = buffer(64 * stride);
        let args = args(&mut buf, stride, 8 * stride, PermKind::Random, 1);
        let mut rng = Rng::new(11);
        // total_par = 2 → 4 passes over 64 elements.
        let head = unsafe { generate_chase_long(&args, 0, 2, &mut rng) };
        assert_eq!(unsafe { cycle_len(head) }, 4 * args.nr_elts());
    }

    #[test]
    fn critword_doubles_the_cycle() {
        let mut buf = buffer(64 * 64);
        let args = args(&mut buf, 64, 64 * 64, PermKind::Random, 1);
        let mut rng = Rng::new(2);
        let head = unsafe { generate_chase(&args, 0, &mut rng) };
        let before = unsafe { cycle_len(head) };
        unsafe { plant_critword(head, 32) };
        assert_eq!(unsafe { cycle_len(head) }, 2 * before);
    }

    #[test]
    fn critword2_shadow_cycle_tracks_the_primary() {
        let mut buf = buffer(64 * 64);
        let args = args(&mut buf, 64, 64 * 64, PermKind::Random, 1);
        let mut rng = Rng::new(2);
        let head = unsafe { generate_chase(&args, 0, &mut rng) };
        unsafe { plant_critword2(head, 32) };
        let shadow = unsafe { head.add(32) };
        assert_eq!(unsafe { cycle_len(head) }, args.nr_elts());
        assert_eq!(unsafe { cycle_len(shadow) }, args.nr_elts());
        // Shadow steps mirror primary steps at the fixed offset.
        let mut p = head as *const u8;
        let mut q = shadow as *const u8;
        for _ in 0..args.nr_elts() {
            assert_eq!(q as usize, p as usize + 32);
            p = unsafe { p.cast::<usize>().read() } as *const u8;
            q = unsafe { q.cast::<usize>().read() } as *const u8;
        }
    }
}

//! Branch-chase rewriting: turn a pointer cycle into machine code.
//!
//! Each element's cell already holds the absolute address of its successor.
//! The rewriter overwrites the element's first bytes with a short sequence
//! that loads that same address into a scratch register and branches to it
//! — so following the cycle becomes executing it, and the measured
//! quantity shifts from the load pipeline to indirect-branch/fetch
//! behavior. Every `chunk_size` elements the sequence returns to the
//! caller with the next chunk's entry address instead of branching, which
//! bounds the time spent away from the measuring loop.
//!
//! Encodings are fixed-length per architecture:
//!
//! - x86-64, 12-byte slot: `48 B8 <imm64>` (`movabs rax, next`) then
//!   `FF E0` (`jmp rax`) or `C3` (`ret`).
//! - aarch64, 16-byte slot: `MOVZ x0, #lo16`, `MOVK x0, #mid16, LSL 16`,
//!   `MOVK x0, #hi16, LSL 32` (addresses are at most 48 bits), then
//!   `BR x0` or `RET`.
//!
//! The immediate-load's first 8 bytes overwrite the pointer word itself;
//! bytes `[8, code_len)` must still be zero from the arena mapping, which
//! is checked before anything is written.

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
use std::sync::atomic::Ordering;

use crate::chase::graph::cycle_len;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
use crate::chase::kernels::ChaseCtx;
use crate::errors::ChaseError;

/// Bytes of emitted code per element on this architecture.
#[cfg(target_arch = "x86_64")]
pub const BR_CODE_LEN: usize = 12;
/// Bytes of emitted code per element on this architecture.
#[cfg(target_arch = "aarch64")]
pub const BR_CODE_LEN: usize = 16;
/// Bytes of emitted code per element on this architecture.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const BR_CODE_LEN: usize = 0;

/// Chunk invocations per counter update in the branch kernel.
pub const BR_UNROLL: usize = 8;

/// Rewrites the cycle at `head` into branch chunks.
///
/// The effective chunk size is `cycle_len / 2^k` for the `k` that lands
/// closest to `chunk_size` (the whole cycle when it is shorter than the
/// request); it is returned so the kernel can credit steps per call.
///
/// # Safety
/// `head` must be a well-formed cycle of unmixed elements (cells at
/// element starts) with at least [`BR_CODE_LEN`] bytes of slack per
/// element, inside a mapping that is, or will be made, executable.
pub unsafe fn convert_pointers_to_branches(
    head: *mut u8,
    chunk_size: usize,
) -> Result<usize, ChaseError> {
    if BR_CODE_LEN == 0 {
        return Err(ChaseError::BranchUnsupported);
    }
    let nr_elts = cycle_len(head);
    let chunk_size = effective_chunk_size(nr_elts, chunk_size.max(1));

    let mut remain = nr_elts;
    let mut chunks_remaining = nr_elts / chunk_size;
    let mut chunk_count = 0usize;
    let mut element = 0usize;
    let mut p = head;
    loop {
        if chunk_count == 0 {
            // Redistribute any remainder across the chunks still to come.
            chunk_count = remain / chunks_remaining;
        }
        let next = p.cast::<usize>().read() as *mut u8;
        for byte in 8..BR_CODE_LEN {
            if p.add(byte).read() != 0 {
                return Err(ChaseError::BranchSlack { element, byte });
            }
        }
        remain -= 1;
        chunk_count -= 1;
        let terminal = chunk_count == 0;
        emit::element(p, next as u64, terminal);
        if terminal {
            chunks_remaining -= 1;
        }
        element += 1;
        p = next;
        if p == head {
            break;
        }
    }
    if remain != 0 || chunks_remaining != 0 {
        return Err(ChaseError::CycleMismatch {
            expected: nr_elts,
            walked: nr_elts - remain,
        });
    }
    Ok(chunk_size)
}

/// Power-of-two division of `nr_elts` closest to the requested size.
fn effective_chunk_size(nr_elts: usize, requested: usize) -> usize {
    if nr_elts < requested {
        return nr_elts;
    }
    let k = (nr_elts as f64 / requested as f64).log2().round() as u32;
    (nr_elts >> k).max(1)
}

/// Executes the rewritten cycle chunk by chunk.
///
/// Each call runs `chunk_len` emitted branches and returns the next
/// chunk's entry, so one call is `chunk_len` dependent steps.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub(crate) unsafe fn chase_branch(ctx: &ChaseCtx<'_>) -> ! {
    type Chunk = unsafe extern "C" fn() -> *const u8;
    let mut p = ctx.cycle[0];
    let steps = (BR_UNROLL * ctx.chunk_len) as u64;
    loop {
        for _ in 0..BR_UNROLL {
            let chunk: Chunk = std::mem::transmute(p);
            p = chunk();
        }
        ctx.shared.count.fetch_add(steps, Ordering::SeqCst);
    }
}

#[cfg(target_arch = "x86_64")]
mod emit {
    /// Emits `movabs rax, next` + (`jmp rax` | `ret`) at `p`.
    ///
    /// # Safety
    /// `p` must be writable for [`super::BR_CODE_LEN`] bytes.
    pub(super) unsafe fn element(p: *mut u8, next: u64, terminal: bool) {
        p.write(0x48);
        p.add(1).write(0xb8);
        for i in 0..8 {
            p.add(2 + i).write((next >> (8 * i)) as u8);
        }
        if terminal {
            p.add(10).write(0xc3); // ret
        } else {
            p.add(10).write(0xff); // jmp rax
            p.add(11).write(0xe0);
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod emit {
    const RET: u32 = 0xd65f_03c0;

    fn rbits(val: u64, bits: u32) -> u32 {
        (val & ((1u64 << bits) - 1)) as u32
    }

    fn movz(rd: u32, imm16: u32, hw: u32) -> u32 {
        (0b1101_0010_1 << 23) | (hw << 21) | (imm16 << 5) | rd
    }

    fn movk(rd: u32, imm16: u32, hw: u32) -> u32 {
        (0b1111_0010_1 << 23) | (hw << 21) | (imm16 << 5) | rd
    }

    fn br(rs: u32) -> u32 {
        0b1101_0110_0001_1111_0000_0000_0000_0000 | (rs << 5)
    }

    /// Emits `movz/movk/movk x0, next` + (`br x0` | `ret`) at `p`.
    ///
    /// Virtual addresses are at most 48 bits, so three 16-bit pieces
    /// reconstruct `next` exactly.
    ///
    /// # Safety
    /// `p` must be writable for [`super::BR_CODE_LEN`] bytes and 4-byte
    /// aligned.
    pub(super) unsafe fn element(p: *mut u8, next: u64, terminal: bool) {
        let insn = p.cast::<u32>();
        insn.write(movz(0, rbits(next, 16), 0));
        insn.add(1).write(movk(0, rbits(next >> 16, 16), 1));
        insn.add(2).write(movk(0, rbits(next >> 32, 16), 2));
        insn.add(3).write(if terminal { RET } else { br(0) });
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod emit {
    pub(super) unsafe fn element(_p: *mut u8, _next: u64, _terminal: bool) {
        unreachable!("branch chase is gated out of the registry on this architecture");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Links `nr` elements of `stride` bytes (as u64 words) into the
    /// sequential cycle 0→1→…→nr-1→0 and returns the element addresses.
    fn sequential_cycle(buf: &mut [u64], nr: usize, stride: usize) -> Vec<*mut u8> {
        let words = stride / 8;
        let base = buf.as_mut_ptr().cast::<u8>();
        let addrs: Vec<*mut u8> = (0..nr).map(|i| unsafe { base.add(i * stride) }) .collect();
        for i in 0..nr {
            buf[i * words] = addrs[(i + 1) % nr] as u64;
        }
        addrs
    }

    #[test]
    fn chunk_size_snaps_to_power_of_two_divisor() {
        assert_eq!(effective_chunk_size(4, 2), 2);
        assert_eq!(effective_chunk_size(4, 8), 4);
        assert_eq!(effective_chunk_size(1024, 100), 128);
        assert_eq!(effective_chunk_size(1024, 1), 1);
        assert_eq!(effective_chunk_size(7, 3), 3); // 7/2, integer division
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn dirty_slack_bytes_are_fatal() {
        let stride = 32;
        let mut buf = vec![0u64; 4 * stride / 8];
        let addrs = sequential_cycle(&mut buf, 4, stride);
        buf[1] = 0xff; // element 0, bytes [8, 16): inside the code slot
        let err = unsafe { convert_pointers_to_branches(addrs[0], 2) };
        assert!(matches!(err, Err(ChaseError::BranchSlack { element: 0, .. })));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn emitted_bytes_match_the_encoding() {
        let stride = 16;
        let mut buf = vec![0u64; 4 * stride / 8];
        let addrs = sequential_cycle(&mut buf, 4, stride);
        let chunk = unsafe { convert_pointers_to_branches(addrs[0], 2) }.unwrap();
        assert_eq!(chunk, 2);

        let bytes = |i: usize| unsafe { std::slice::from_raw_parts(addrs[i], stride) };
        for i in 0..4 {
            let code = bytes(i);
            assert_eq!(&code[..2], &[0x48, 0xb8], "movabs rax at element {i}");
            let imm = u64::from_le_bytes(code[2..10].try_into().unwrap());
            assert_eq!(imm, addrs[(i + 1) % 4] as u64, "immediate at element {i}");
            if i % 2 == 1 {
                assert_eq!(code[10], 0xc3, "chunk end at element {i} is ret");
            } else {
                assert_eq!(&code[10..12], &[0xff, 0xe0], "element {i} jumps");
            }
        }
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn emitted_words_match_the_encoding() {
        let stride = 16;
        let mut buf = vec![0u64; 4 * stride / 8];
        let addrs = sequential_cycle(&mut buf, 4, stride);
        let chunk = unsafe { convert_pointers_to_branches(addrs[0], 2) }.unwrap();
        assert_eq!(chunk, 2);

        for i in 0..4 {
            let insn =
                unsafe { std::slice::from_raw_parts(addrs[i].cast::<u32>(), 4) };
            let next = addrs[(i + 1) % 4] as u64;
            // Reassemble the immediate from the movz/movk pieces.
            let lo = (insn[0] >> 5) & 0xffff;
            let mid = (insn[1] >> 5) & 0xffff;
            let hi = (insn[2] >> 5) & 0xffff;
            let imm = u64::from(lo) | (u64::from(mid) << 16) | (u64::from(hi) << 32);
            assert_eq!(imm, next & 0xffff_ffff_ffff, "immediate at element {i}");
            if i % 2 == 1 {
                assert_eq!(insn[3], 0xd65f_03c0, "chunk end at element {i} is ret");
            } else {
                assert_eq!(insn[3], 0xd61f_0000, "element {i} is br x0");
            }
        }
    }

    // x86-64 only: its coherent instruction cache makes freshly written
    // code immediately executable; aarch64 would need an icache flush.
    #[cfg(target_arch = "x86_64")]
    #[test]
    fn rewritten_chunks_execute_the_cycle() {
        use crate::arena::{Arena, ArenaSpec};

        let stride = 64;
        let nr = 8;
        let spec = ArenaSpec {
            exec: true,
            ..ArenaSpec::plain(nr * stride)
        };
        let arena = Arena::alloc(&spec).unwrap();
        let addrs: Vec<*mut u8> = (0..nr).map(|i| unsafe { arena.base().add(i * stride) }).collect();
        for i in 0..nr {
            unsafe { addrs[i].cast::<usize>().write(addrs[(i + 1) % nr] as usize) };
        }
        let chunk = unsafe { convert_pointers_to_branches(addrs[0], 2) }.unwrap();
        assert_eq!(chunk, 2);

        // Each invocation runs one chunk and returns the next entry; after
        // nr / chunk invocations the walk is back at the head.
        type Chunk = unsafe extern "C" fn() -> *const u8;
        let mut p = addrs[0] as *const u8;
        for _ in 0..(nr / chunk) {
            let f: Chunk = unsafe { std::mem::transmute(p) };
            p = unsafe { f() };
        }
        assert_eq!(p, addrs[0] as *const u8);
    }
}

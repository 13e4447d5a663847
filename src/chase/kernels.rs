//! Chase inner loops and the workload registry.
//!
//! Every kernel runs an unbounded loop of dependent loads and, once per
//! unrolled block, adds the block's step count to the per-thread counter.
//! The sampler swaps that counter with zero to read progress; the kernels
//! themselves never exit — the process does.
//!
//! The dependent load goes through [`deref`], a single-instruction
//! `asm!` load on x86-64 and aarch64 (volatile on other targets), so the
//! compiler can neither elide, reorder, nor widen it: the address chain is
//! the only thing on the hot path between counter updates.

use std::sync::atomic::Ordering;

use crate::errors::ConfigError;
use crate::runner::SharedSlot;

/// Maximum number of parallel chases a single thread can advance.
pub const MAX_PARALLEL: usize = 10;

const WORD: usize = std::mem::size_of::<usize>();

/// Per-worker kernel inputs. Built by the worker after its cycles exist;
/// the kernel is the only reader.
pub struct ChaseCtx<'a> {
    /// Starting cells, one per parallel chase (unused tail is null).
    pub cycle: [*const u8; MAX_PARALLEL],
    /// Parsed `name:arg` value (work iterations, critword offset, …).
    pub extra: usize,
    /// Steps credited per emitted-code chunk call (branch chase only).
    pub chunk_len: usize,
    /// The worker's sampler-visible counters.
    pub shared: &'a SharedSlot,
}

/// A chase kernel. Runs forever.
///
/// # Safety
/// `ctx.cycle[..parallelism]` must point at well-formed cycles built for
/// this kernel's element layout.
pub type ChaseKernel = unsafe fn(&ChaseCtx<'_>) -> !;

// ============================================================================
// The dependent load
// ============================================================================

/// One dependent pointer load, opaque to the optimizer.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub(crate) unsafe fn deref(p: *const u8) -> *const u8 {
    let next: *const u8;
    core::arch::asm!(
        "mov {next}, qword ptr [{p}]",
        next = out(reg) next,
        p = in(reg) p,
        options(nostack, preserves_flags, readonly),
    );
    next
}

/// One dependent pointer load, opaque to the optimizer.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub(crate) unsafe fn deref(p: *const u8) -> *const u8 {
    let next: *const u8;
    core::arch::asm!(
        "ldr {next}, [{p}]",
        next = out(reg) next,
        p = in(reg) p,
        options(nostack, preserves_flags, readonly),
    );
    next
}

/// One dependent pointer load; volatile keeps it live on targets without
/// an asm path.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub(crate) unsafe fn deref(p: *const u8) -> *const u8 {
    p.cast::<*const u8>().read_volatile()
}

// ============================================================================
// Kernels
// ============================================================================

const SIMPLE_UNROLL: usize = 200;
const WORK_UNROLL: usize = 25;
const INCR_UNROLL: usize = 50;
const CRITWORD2_UNROLL: usize = 100;
#[cfg(target_arch = "x86_64")]
const SSE_UNROLL: usize = 100;

unsafe fn chase_simple(ctx: &ChaseCtx<'_>) -> ! {
    let mut p = ctx.cycle[0];
    loop {
        for _ in 0..SIMPLE_UNROLL {
            p = deref(p);
        }
        ctx.shared.count.fetch_add(SIMPLE_UNROLL as u64, Ordering::SeqCst);
    }
}

/// `N` independent chases advanced in lockstep; total unroll `N * U`.
unsafe fn chase_parallel<const N: usize, const U: usize>(ctx: &ChaseCtx<'_>) -> ! {
    let mut heads = [std::ptr::null::<u8>(); N];
    heads.copy_from_slice(&ctx.cycle[..N]);
    loop {
        for _ in 0..U {
            for head in heads.iter_mut() {
                *head = deref(*head);
            }
        }
        ctx.shared.count.fetch_add((N * U) as u64, Ordering::SeqCst);
    }
}

unsafe fn chase_work(ctx: &ChaseCtx<'_>) -> ! {
    let mut p = ctx.cycle[0];
    let extra_work = ctx.extra;
    let mut work = 0usize;
    // The extra work should overlap a dereference without letting the
    // compiler run ahead of it, so the pointer value is folded into the
    // accumulator before each load is issued.
    loop {
        for _ in 0..WORK_UNROLL {
            work = work.wrapping_add(p as usize);
            p = deref(p);
            for i in 0..extra_work {
                work ^= i;
            }
        }
        ctx.shared.count.fetch_add(WORK_UNROLL as u64, Ordering::SeqCst);
        std::hint::black_box(work);
    }
}

unsafe fn chase_incr(ctx: &ChaseCtx<'_>) -> ! {
    let mut p = ctx.cycle[0];
    loop {
        for _ in 0..INCR_UNROLL {
            let counter = p.add(WORD).cast::<u32>().cast_mut();
            counter.write_volatile(counter.read_volatile().wrapping_add(1));
            p = deref(p);
        }
        ctx.shared.count.fetch_add(INCR_UNROLL as u64, Ordering::SeqCst);
    }
}

unsafe fn chase_critword2(ctx: &ChaseCtx<'_>) -> ! {
    let mut p = ctx.cycle[0];
    let mut q = p.add(ctx.extra);
    loop {
        for _ in 0..CRITWORD2_UNROLL {
            p = deref(p);
            q = deref(q);
        }
        ctx.shared
            .count
            .fetch_add(CRITWORD2_UNROLL as u64, Ordering::SeqCst);
    }
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::*;
    use core::arch::x86_64::{
        _mm_prefetch, _MM_HINT_NTA, _MM_HINT_T0, _MM_HINT_T1, _MM_HINT_T2,
    };

    const PREFETCH_UNROLL: usize = 100;

    macro_rules! chase_prefetch {
        ($name:ident, $hint:ident) => {
            pub(super) unsafe fn $name(ctx: &ChaseCtx<'_>) -> ! {
                let mut p = ctx.cycle[0];
                loop {
                    for _ in 0..PREFETCH_UNROLL {
                        _mm_prefetch::<{ $hint }>(p.cast());
                        p = deref(p);
                    }
                    ctx.shared
                        .count
                        .fetch_add(PREFETCH_UNROLL as u64, Ordering::SeqCst);
                }
            }
        };
    }

    chase_prefetch!(chase_prefetch_t0, _MM_HINT_T0);
    chase_prefetch!(chase_prefetch_t1, _MM_HINT_T1);
    chase_prefetch!(chase_prefetch_t2, _MM_HINT_T2);
    chase_prefetch!(chase_prefetch_nta, _MM_HINT_NTA);

    /// Reads the whole 64-byte element with four 16-byte SIMD loads and
    /// folds the lanes so the low qword of the sum is the next address
    /// (the three trailing chunks are zero by the arena invariant).
    pub(super) unsafe fn chase_movdqa(ctx: &ChaseCtx<'_>) -> ! {
        let mut p = ctx.cycle[0];
        loop {
            for _ in 0..SSE_UNROLL {
                core::arch::asm!(
                    "movdqa xmm0, xmmword ptr [{p}]",
                    "movdqa xmm1, xmmword ptr [{p} + 16]",
                    "paddq xmm0, xmm1",
                    "movdqa xmm2, xmmword ptr [{p} + 32]",
                    "paddq xmm0, xmm2",
                    "movdqa xmm3, xmmword ptr [{p} + 48]",
                    "paddq xmm0, xmm3",
                    "movq {p}, xmm0",
                    p = inout(reg) p,
                    out("xmm0") _, out("xmm1") _, out("xmm2") _, out("xmm3") _,
                    options(nostack, readonly),
                );
            }
            ctx.shared.count.fetch_add(SSE_UNROLL as u64, Ordering::SeqCst);
        }
    }

    /// As [`chase_movdqa`] with non-temporal (streaming) loads.
    pub(super) unsafe fn chase_movntdqa(ctx: &ChaseCtx<'_>) -> ! {
        let mut p = ctx.cycle[0];
        loop {
            for _ in 0..SSE_UNROLL {
                core::arch::asm!(
                    "movntdqa xmm0, xmmword ptr [{p}]",
                    "movntdqa xmm1, xmmword ptr [{p} + 16]",
                    "paddq xmm0, xmm1",
                    "movntdqa xmm2, xmmword ptr [{p} + 32]",
                    "paddq xmm0, xmm2",
                    "movntdqa xmm3, xmmword ptr [{p} + 48]",
                    "paddq xmm0, xmm3",
                    "movq {p}, xmm0",
                    p = inout(reg) p,
                    out("xmm0") _, out("xmm1") _, out("xmm2") _, out("xmm3") _,
                    options(nostack, readonly),
                );
            }
            ctx.shared.count.fetch_add(SSE_UNROLL as u64, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// One selectable chase workload.
pub struct Workload {
    pub name: &'static str,
    pub usage: &'static str,
    pub about: &'static str,
    /// Cell granularity: `stride / base_object_size` cell positions per
    /// element feed the mixer.
    pub base_object_size: usize,
    pub requires_arg: bool,
    /// Independent chases per thread (at least 1).
    pub parallelism: usize,
    /// Steps credited to `count` per kernel block; the counter only ever
    /// grows in multiples of this.
    pub steps_per_update: u64,
    /// Build the cycle without mixing so the cell sits at the element
    /// start (branch chase: code is emitted over it).
    pub unmixed: bool,
    /// Arena must be mapped executable.
    pub needs_exec: bool,
    pub kernel: ChaseKernel,
}

macro_rules! parallel_workload {
    ($n:literal, $u:literal) => {
        Workload {
            name: concat!("parallel", $n),
            usage: concat!("parallel", $n),
            about: concat!("alternate ", $n, " non-dependent chases in each thread"),
            base_object_size: WORD,
            requires_arg: false,
            parallelism: $n,
            steps_per_update: $n * $u,
            unmixed: false,
            needs_exec: false,
            kernel: chase_parallel::<$n, $u>,
        }
    };
}

/// Workloads available on every architecture. The default must be first.
static PORTABLE_WORKLOADS: &[Workload] = &[
    Workload {
        name: "simple",
        usage: "simple",
        about: "no frills pointer dereferencing",
        base_object_size: WORD,
        requires_arg: false,
        parallelism: 1,
        steps_per_update: SIMPLE_UNROLL as u64,
        unmixed: false,
        needs_exec: false,
        kernel: chase_simple,
    },
    Workload {
        name: "chaseload",
        usage: "chaseload",
        about: "runs simple chase against -l memory bandwidth loads",
        base_object_size: WORD,
        requires_arg: false,
        parallelism: 1,
        steps_per_update: SIMPLE_UNROLL as u64,
        unmixed: false,
        needs_exec: false,
        kernel: chase_simple,
    },
    Workload {
        name: "work",
        usage: "work:N",
        about: "loop simple computation N times in between derefs",
        base_object_size: WORD,
        requires_arg: true,
        parallelism: 1,
        steps_per_update: WORK_UNROLL as u64,
        unmixed: false,
        needs_exec: false,
        kernel: chase_work,
    },
    Workload {
        name: "incr",
        usage: "incr",
        about: "modify the cache line after each deref",
        // Pointer plus a u32 counter, padded to word alignment.
        base_object_size: 2 * WORD,
        requires_arg: false,
        parallelism: 1,
        steps_per_update: INCR_UNROLL as u64,
        unmixed: false,
        needs_exec: false,
        kernel: chase_incr,
    },
    parallel_workload!(2, 100),
    parallel_workload!(3, 66),
    parallel_workload!(4, 50),
    parallel_workload!(5, 40),
    parallel_workload!(6, 32),
    parallel_workload!(7, 28),
    parallel_workload!(8, 24),
    parallel_workload!(9, 22),
    parallel_workload!(10, 20),
    Workload {
        name: "critword",
        usage: "critword:N",
        about: "a non-parallel chase which reads at X and X+N",
        base_object_size: 64,
        requires_arg: true,
        parallelism: 1,
        steps_per_update: SIMPLE_UNROLL as u64,
        unmixed: false,
        needs_exec: false,
        kernel: chase_simple,
    },
    Workload {
        name: "critword2",
        usage: "critword2:N",
        about: "a two-parallel chase which reads at X and X+N",
        base_object_size: 64,
        requires_arg: true,
        parallelism: 1,
        steps_per_update: CRITWORD2_UNROLL as u64,
        unmixed: false,
        needs_exec: false,
        kernel: chase_critword2,
    },
];

#[cfg(target_arch = "x86_64")]
static ARCH_WORKLOADS: &[Workload] = &[
    Workload {
        name: "t0",
        usage: "t0",
        about: "perform prefetcht0 before each deref",
        base_object_size: WORD,
        requires_arg: false,
        parallelism: 1,
        steps_per_update: 100,
        unmixed: false,
        needs_exec: false,
        kernel: x86::chase_prefetch_t0,
    },
    Workload {
        name: "t1",
        usage: "t1",
        about: "perform prefetcht1 before each deref",
        base_object_size: WORD,
        requires_arg: false,
        parallelism: 1,
        steps_per_update: 100,
        unmixed: false,
        needs_exec: false,
        kernel: x86::chase_prefetch_t1,
    },
    Workload {
        name: "t2",
        usage: "t2",
        about: "perform prefetcht2 before each deref",
        base_object_size: WORD,
        requires_arg: false,
        parallelism: 1,
        steps_per_update: 100,
        unmixed: false,
        needs_exec: false,
        kernel: x86::chase_prefetch_t2,
    },
    Workload {
        name: "nta",
        usage: "nta",
        about: "perform prefetchnta before each deref",
        base_object_size: WORD,
        requires_arg: false,
        parallelism: 1,
        steps_per_update: 100,
        unmixed: false,
        needs_exec: false,
        kernel: x86::chase_prefetch_nta,
    },
    Workload {
        name: "movdqa",
        usage: "movdqa",
        about: "use movdqa to read from memory",
        base_object_size: 64,
        requires_arg: false,
        parallelism: 1,
        steps_per_update: SSE_UNROLL as u64,
        unmixed: false,
        needs_exec: false,
        kernel: x86::chase_movdqa,
    },
    Workload {
        name: "movntdqa",
        usage: "movntdqa",
        about: "use movntdqa to read from memory",
        base_object_size: 64,
        requires_arg: false,
        parallelism: 1,
        steps_per_update: SSE_UNROLL as u64,
        unmixed: false,
        needs_exec: false,
        kernel: x86::chase_movntdqa,
    },
];

#[cfg(not(target_arch = "x86_64"))]
static ARCH_WORKLOADS: &[Workload] = &[];

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
static BRANCH_WORKLOADS: &[Workload] = &[Workload {
    name: "branch",
    usage: "branch:N",
    about: "rewrite the chase into branch chunks of about N elements",
    base_object_size: 0, // resolved to the stride: code sits at element starts
    requires_arg: true,
    parallelism: 1,
    steps_per_update: 0, // resolved at run time from the effective chunk size
    unmixed: true,
    needs_exec: true,
    kernel: super::branch::chase_branch,
}];

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
static BRANCH_WORKLOADS: &[Workload] = &[];

/// All workloads selectable on this architecture, default first.
pub fn workloads() -> impl Iterator<Item = &'static Workload> {
    PORTABLE_WORKLOADS
        .iter()
        .chain(ARCH_WORKLOADS.iter())
        .chain(BRANCH_WORKLOADS.iter())
}

/// The default workload (`simple`).
#[must_use]
pub fn default_workload() -> &'static Workload {
    &PORTABLE_WORKLOADS[0]
}

/// Looks a workload up by exact name.
#[must_use]
pub fn find_workload(name: &str) -> Option<&'static Workload> {
    workloads().find(|w| w.name == name)
}

/// Splits a `-c name[:arg]` spec and validates the argument rule.
pub fn parse_workload_spec(
    spec: &str,
) -> Result<(&'static Workload, Option<&str>), ConfigError> {
    let (name, arg) = match spec.split_once(':') {
        Some((name, arg)) => (name, Some(arg)),
        None => (spec, None),
    };
    let workload =
        find_workload(name).ok_or_else(|| ConfigError::UnknownWorkload(spec.to_owned()))?;
    if workload.requires_arg && arg.map_or(true, str::is_empty) {
        return Err(ConfigError::MissingWorkloadArg {
            name: workload.name,
            usage: workload.usage,
        });
    }
    if !workload.requires_arg && arg.is_some() {
        return Err(ConfigError::UnexpectedWorkloadArg {
            name: workload.name,
            usage: workload.usage,
        });
    }
    Ok((workload, arg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_simple() {
        assert_eq!(default_workload().name, "simple");
    }

    #[test]
    fn names_are_unique() {
        let names: Vec<&str> = workloads().map(|w| w.name).collect();
        let mut dedup = names.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(names.len(), dedup.len());
    }

    #[test]
    fn counter_steps_are_block_multiples() {
        for w in workloads() {
            if w.name == "branch" {
                continue; // chunk size only known at run time
            }
            assert!(w.parallelism >= 1);
            assert_eq!(
                w.steps_per_update % w.parallelism as u64,
                0,
                "{} must credit whole lockstep rounds",
                w.name
            );
        }
    }

    #[test]
    fn parallel_unrolls_stay_near_200() {
        for w in workloads().filter(|w| w.name.starts_with("parallel")) {
            assert!(
                (180..=220).contains(&(w.steps_per_update as usize)),
                "{}: {}",
                w.name,
                w.steps_per_update
            );
        }
    }

    #[test]
    fn spec_parsing_enforces_arg_rules() {
        assert!(matches!(
            parse_workload_spec("work"),
            Err(ConfigError::MissingWorkloadArg { .. })
        ));
        assert!(matches!(
            parse_workload_spec("work:"),
            Err(ConfigError::MissingWorkloadArg { .. })
        ));
        assert!(matches!(
            parse_workload_spec("simple:3"),
            Err(ConfigError::UnexpectedWorkloadArg { .. })
        ));
        assert!(matches!(
            parse_workload_spec("nonesuch"),
            Err(ConfigError::UnknownWorkload(_))
        ));
        let (w, arg) = parse_workload_spec("work:8").unwrap();
        assert_eq!(w.name, "work");
        assert_eq!(arg, Some("8"));
        let (w, arg) = parse_workload_spec("parallel4").unwrap();
        assert_eq!(w.name, "parallel4");
        assert_eq!(w.parallelism, 4);
        assert!(arg.is_none());
    }
}

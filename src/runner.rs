//! Thread launch, startup barrier, sampling, and aggregation.
//!
//! # Run shape
//! The runner spawns one worker per thread. Each worker seeds its own RNG
//! with its thread index, optionally pins itself to the matching CPU of
//! the process affinity mask, builds its own cycles (or its private load
//! buffer), optionally flushes the caches, and parks at a barrier of size
//! `nr_threads + 1`. Once the main thread joins the barrier, workers spin
//! in their kernels until the process exits; nothing ever joins them.
//!
//! # Sampling protocol
//! The only shared state between a worker and the sampler is the worker's
//! [`SharedSlot`]: the sampler swaps `count` with zero and measures the
//! wall-clock delta between swaps. Chase workers publish raw step counts;
//! load workers publish a finished MiB/s figure when the sampler bumps
//! `sample_no` (see [`crate::load`]). The first post-barrier sample is
//! always discarded — a thread may start with parts of its cycle still in
//! cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use crate::arena::{native_page_size, Arena, ArenaSpec, NumaWeights};
use crate::chase::branch::convert_pointers_to_branches;
use crate::chase::graph::{generate_chase, plant_critword, plant_critword2, ChaseArgs};
use crate::chase::kernels::{ChaseCtx, Workload, MAX_PARALLEL};
use crate::errors::{ConfigError, RunError};
use crate::load::{LoadCtx, MemLoad};
use crate::permutation::{Mixer, PermKind};
use crate::rng::Rng;
use crate::timer::{now_nsec, unix_seconds};

/// Padding for sampler-visible per-thread state; 1024 bytes is a safe
/// upper bound on destructive-interference granularity across current
/// architectures.
pub const AVOID_FALSE_SHARING: usize = 1024;

/// Sampler-visible per-thread state, padded so two threads' records never
/// share a cache line (or a prefetch pair of them).
#[repr(align(1024))]
pub struct SharedSlot {
    /// Steps (chase) or MiB/s (load) accumulated since the last swap.
    pub count: AtomicU64,
    /// Sampler → worker: the sample it should answer next (load kernels).
    pub sample_no: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<SharedSlot>() == AVOID_FALSE_SHARING);

impl SharedSlot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sample_no: AtomicU64::new(0),
        }
    }
}

impl Default for SharedSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable output/verbosity settings, built once by the CLI.
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
    pub verbosity: u8,
    pub print_timestamp: bool,
}

impl Config {
    fn stamp(&self) {
        if self.print_timestamp {
            print!("{:.6} ", unix_seconds());
        }
    }
}

/// What the run measures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Every thread chases.
    Chase,
    /// Every thread generates bandwidth.
    Bandwidth,
    /// Thread 0 chases, the rest generate bandwidth.
    ChaseLoaded,
}

/// Fully resolved run parameters.
#[derive(Clone)]
pub struct RunOptions {
    pub config: Config,
    pub mode: RunMode,
    pub workload: &'static Workload,
    pub memload: &'static MemLoad,
    /// The workload's `:arg`, still unparsed.
    pub extra_arg: Option<String>,
    pub nr_threads: usize,
    /// Timed samples; the discarded warm-up sample is extra. 0 = sample
    /// forever.
    pub nr_samples: usize,
    pub total_memory: usize,
    pub stride: usize,
    pub tlb_locality: usize,
    /// Shift of the chase start within the arena.
    pub offset: usize,
    pub page_size: usize,
    pub use_thp: bool,
    pub cache_flush_size: usize,
    pub perm_kind: PermKind,
    pub set_affinity: bool,
    pub sample_period: Duration,
    pub warmup: Duration,
    pub numa: Option<NumaWeights>,
}

impl RunOptions {
    /// Chase-tool defaults: 256 MiB arena, 256-byte stride, 64-page TLB
    /// groups, one thread, five 0.5 s samples, 64 MiB cache flush.
    #[must_use]
    pub fn new(workload: &'static Workload, memload: &'static MemLoad) -> Self {
        Self {
            config: Config::default(),
            mode: RunMode::Chase,
            workload,
            memload,
            extra_arg: None,
            nr_threads: 1,
            nr_samples: 5,
            total_memory: 256 << 20,
            stride: 256,
            tlb_locality: 64 * native_page_size(),
            offset: 0,
            page_size: native_page_size(),
            use_thp: false,
            cache_flush_size: 64 << 20,
            perm_kind: PermKind::Random,
            set_affinity: true,
            sample_period: Duration::from_millis(500),
            warmup: Duration::ZERO,
            numa: None,
        }
    }

    /// Element granularity for this run (`base_object_size` of the
    /// workload; the stride itself for unmixed workloads).
    fn base_object_size(&self) -> usize {
        if self.workload.base_object_size == 0 {
            self.stride
        } else {
            self.workload.base_object_size
        }
    }

    /// Rounds sizes into mutual consistency and validates the layout,
    /// exactly in this order: TLB locality snaps down to a stride
    /// multiple, then total memory snaps down to a TLB-locality multiple
    /// (or becomes a single group for tiny arenas).
    ///
    /// Returns `nr_mixer_indices`.
    pub fn normalize(&mut self) -> Result<usize, ConfigError> {
        let word = std::mem::size_of::<usize>();
        if self.stride < word {
            return Err(ConfigError::StrideTooSmall { min: word });
        }

        if self.tlb_locality < self.stride {
            self.tlb_locality = self.stride;
        } else {
            self.tlb_locality -= self.tlb_locality % self.stride;
        }

        if self.total_memory < self.tlb_locality {
            if self.total_memory < self.stride {
                self.total_memory = self.stride;
            } else {
                self.total_memory -= self.total_memory % self.stride;
            }
            self.tlb_locality = self.total_memory;
        } else {
            self.total_memory -= self.total_memory % self.tlb_locality;
        }

        if self.workload.unmixed && (self.stride % 16 != 0 || self.offset % 16 != 0) {
            return Err(ConfigError::BranchAlignment {
                stride: self.stride,
                offset: self.offset,
            });
        }

        let nr_mixer_indices = self.stride / self.base_object_size();
        let needed = self.nr_threads * self.workload.parallelism;
        let chase_slots = match self.mode {
            RunMode::Chase => needed,
            // Only thread 0 chases; the load threads don't consume slots.
            RunMode::ChaseLoaded | RunMode::Bandwidth => self.workload.parallelism,
        };
        if nr_mixer_indices < chase_slots.max(1) {
            return Err(ConfigError::StrideTooNarrow {
                needed_bytes: needed.max(1) * self.base_object_size(),
            });
        }
        Ok(nr_mixer_indices)
    }

    /// Parses the workload's `:arg` (work iterations, critword offset,
    /// branch chunk size).
    fn parse_extra(&self) -> Result<usize, ConfigError> {
        let Some(arg) = self.extra_arg.as_deref() else {
            return Ok(0);
        };
        let value: usize = arg.parse().map_err(|_| ConfigError::BadValue {
            flag: "-c",
            value: arg.to_owned(),
        })?;
        if self.workload.unmixed && value == 0 {
            return Err(ConfigError::BadValue {
                flag: "-c",
                value: arg.to_owned(),
            });
        }
        Ok(value)
    }
}

/// Latency aggregates in ns per step, already multiplied by the number of
/// chase threads.
#[derive(Clone, Copy, Debug)]
pub struct LatencyStats {
    pub best: f64,
    pub worst: f64,
    pub mean: f64,
    pub geomean: f64,
}

/// Aggregate bandwidth in MiB/s, summed over load threads per sample.
#[derive(Clone, Copy, Debug)]
pub struct LoadStats {
    pub mean: f64,
    pub max: f64,
    pub min: f64,
}

/// Everything the sampler learned.
#[derive(Clone, Debug)]
pub struct Report {
    /// Timed samples used (the discarded one excluded).
    pub nr_samples: usize,
    pub nr_chase_threads: usize,
    pub nr_load_threads: usize,
    /// Arena bytes per thread, for the summary line.
    pub bytes_per_thread: usize,
    pub latency: Option<LatencyStats>,
    pub load: Option<LoadStats>,
}

/// Latency formatted the way every sample line prints it: three decimals
/// under 100 ns, one above.
#[must_use]
pub fn format_ns(ns: f64) -> String {
    let precision = if ns < 100.0 { 3 } else { 1 };
    format!("{ns:6.precision$}")
}

// ============================================================================
// Worker
// ============================================================================

enum Role {
    Chase,
    Load,
}

struct WorkerSpec {
    thread_num: usize,
    role: Role,
    workload: &'static Workload,
    memload: &'static MemLoad,
    extra: usize,
    set_affinity: bool,
    verbosity: u8,
    chase_args: Option<Arc<ChaseArgs>>,
    /// Keeps the chase arena mapped for the life of the worker.
    _arena: Option<Arc<Arena>>,
    flush: Option<Arc<Arena>>,
    load_total_memory: usize,
    load_offset: usize,
    page_size: usize,
    use_thp: bool,
    numa: Option<NumaWeights>,
    shared: Arc<SharedSlot>,
    barrier: Arc<Barrier>,
}

/// Worker-side fatal error: the benchmark is invalid, take the process
/// down the way a setup failure on the main thread would.
fn die_worker(err: &dyn std::fmt::Display) -> ! {
    eprintln!("memlat worker: {err}");
    std::process::exit(1);
}

fn worker_main(spec: WorkerSpec) -> ! {
    let mut rng = Rng::new(spec.thread_num as u64);

    if spec.set_affinity {
        // Pin to the thread_num-th CPU the process may use, so taskset
        // controls placement.
        let cpus = match crate::cpu::process_cpus() {
            Ok(cpus) => cpus,
            Err(err) => die_worker(&err),
        };
        match cpus.get(spec.thread_num) {
            Some(&cpu) => {
                if let Err(err) = crate::cpu::pin_to_cpu(cpu) {
                    die_worker(&err);
                }
            }
            None => die_worker(&"more threads than cpus available"),
        }
    }

    let mut cycle = [std::ptr::null::<u8>(); MAX_PARALLEL];
    let mut chunk_len = 0usize;
    let mut load_arena = None;

    match spec.role {
        Role::Chase => {
            let args = spec.chase_args.as_ref().expect("chase worker needs args");
            // A different mixer column for every thread and for every
            // parallel chase within a thread.
            let parallelism = spec.workload.parallelism;
            for par in 0..parallelism {
                // SAFETY: the arena covers total_memory bytes and this
                // mixer column is used by no other builder.
                cycle[par] = unsafe {
                    generate_chase(args, parallelism * spec.thread_num + par, &mut rng)
                };
            }
            match spec.workload.name {
                // SAFETY: offset stays inside the 64-byte base object the
                // registry declares for these workloads.
                "critword" => unsafe { plant_critword(cycle[0].cast_mut(), spec.extra) },
                "critword2" => unsafe { plant_critword2(cycle[0].cast_mut(), spec.extra) },
                "branch" => {
                    // SAFETY: unmixed cycle in an executable arena.
                    match unsafe {
                        convert_pointers_to_branches(cycle[0].cast_mut(), spec.extra)
                    } {
                        Ok(len) => chunk_len = len,
                        Err(err) => die_worker(&err),
                    }
                }
                _ => {}
            }
            if let Some(flush) = &spec.flush {
                // Read the flush arena end to end to push the freshly
                // built chase out of the caches.
                let words = flush.len() / std::mem::size_of::<usize>();
                let mut sum = 0usize;
                // SAFETY: in-bounds reads of the flush mapping.
                unsafe {
                    let base = flush.base().cast::<usize>();
                    for i in 0..words {
                        sum = sum.wrapping_add(base.add(i).read());
                    }
                }
                std::hint::black_box(sum);
            }
        }
        Role::Load => {
            if spec.verbosity > 2 {
                println!("worker {}: allocating load buffer", spec.thread_num);
            }
            let spec_arena = ArenaSpec {
                page_size: spec.page_size,
                use_thp: spec.use_thp,
                size: spec.load_total_memory + spec.load_offset,
                exec: false,
                numa: spec.numa.as_ref(),
            };
            let arena = match Arena::alloc(&spec_arena) {
                Ok(arena) => arena,
                Err(err) => die_worker(&err),
            };
            arena.touch(1);
            load_arena = Some(arena);
        }
    }

    spec.barrier.wait();

    match spec.role {
        Role::Chase => {
            let ctx = ChaseCtx {
                cycle,
                extra: spec.extra,
                chunk_len,
                shared: &spec.shared,
            };
            // SAFETY: the cycles above were built for this workload's
            // element layout.
            unsafe { (spec.workload.kernel)(&ctx) }
        }
        Role::Load => {
            let arena = load_arena.as_ref().expect("load worker allocated above");
            let ctx = LoadCtx {
                // SAFETY: offset < mapped length by construction.
                base: unsafe { arena.base().add(spec.load_offset) },
                len: spec.load_total_memory,
                verbosity: spec.verbosity,
                shared: &spec.shared,
            };
            // SAFETY: the buffer is private to this worker.
            unsafe { (spec.memload.kernel)(&ctx) }
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Poll interval while waiting for load threads to answer a sample.
const LOAD_POLL: Duration = Duration::from_millis(10);

/// Runs the benchmark to completion and returns the aggregates.
///
/// Workers are left spinning; callers are expected to exit the process
/// after printing the report. With `nr_samples == 0` this never returns.
pub fn run(mut opts: RunOptions) -> Result<Report, RunError> {
    let nr_mixer_indices = opts.normalize()?;
    let extra = opts.parse_extra()?;
    let cfg = opts.config;

    if cfg.verbosity > 0 {
        println!("nr_threads = {}", opts.nr_threads);
        println!(
            "total_memory = {} ({:.1} MiB)",
            opts.total_memory,
            opts.total_memory as f64 / (1 << 20) as f64
        );
        println!("stride = {}", opts.stride);
        println!("tlb_locality = {}", opts.tlb_locality);
        println!("chase = {}", opts.workload.name);
        if opts.mode != RunMode::Chase {
            println!("memload = {}", opts.memload.name);
        }
    }

    // Chase construction state is shared by all chase workers; bandwidth
    // runs need none of it.
    let chase_args = if opts.mode == RunMode::Bandwidth {
        None
    } else {
        let mut rng = Rng::new(1);
        let mixer = Mixer::generate(
            &mut rng,
            opts.perm_kind,
            nr_mixer_indices,
            opts.nr_threads * opts.workload.parallelism,
        );
        if cfg.verbosity > 1 {
            println!("nr_mixers = {}", mixer.nr_mixers());
        }
        let arena = Arc::new(Arena::alloc(&ArenaSpec {
            page_size: opts.page_size,
            use_thp: opts.use_thp,
            size: opts.total_memory + opts.offset,
            exec: opts.workload.needs_exec,
            numa: opts.numa.as_ref(),
        })?);
        let args = ChaseArgs {
            // SAFETY: offset < mapped length (size included it).
            base: unsafe { arena.base().add(opts.offset) },
            total_memory: opts.total_memory,
            stride: opts.stride,
            tlb_locality: opts.tlb_locality,
            perm_kind: opts.perm_kind,
            nr_mixer_indices,
            mixer,
        };
        Some((Arc::new(args), arena))
    };

    let flush = if opts.cache_flush_size > 0 && opts.mode != RunMode::Bandwidth {
        let arena = Arena::alloc(&ArenaSpec::plain(opts.cache_flush_size))?;
        arena.touch(1);
        Some(Arc::new(arena))
    } else {
        None
    };

    let barrier = Arc::new(Barrier::new(opts.nr_threads + 1));
    let mut slots: Vec<Arc<SharedSlot>> = Vec::with_capacity(opts.nr_threads);
    let mut nr_chase_threads = 0usize;
    let mut nr_load_threads = 0usize;

    for thread_num in 0..opts.nr_threads {
        let role = match opts.mode {
            RunMode::Chase => Role::Chase,
            RunMode::Bandwidth => Role::Load,
            RunMode::ChaseLoaded => {
                if thread_num == 0 {
                    Role::Chase
                } else {
                    Role::Load
                }
            }
        };
        match role {
            Role::Chase => nr_chase_threads += 1,
            Role::Load => nr_load_threads += 1,
        }
        let shared = Arc::new(SharedSlot::new());
        slots.push(Arc::clone(&shared));
        let spec = WorkerSpec {
            thread_num,
            role,
            workload: opts.workload,
            memload: opts.memload,
            extra,
            set_affinity: opts.set_affinity,
            verbosity: cfg.verbosity,
            chase_args: chase_args.as_ref().map(|(args, _)| Arc::clone(args)),
            _arena: chase_args.as_ref().map(|(_, arena)| Arc::clone(arena)),
            flush: flush.clone(),
            load_total_memory: opts.total_memory,
            load_offset: opts.offset,
            page_size: opts.page_size,
            use_thp: opts.use_thp,
            numa: opts.numa.clone(),
            shared,
            barrier: Arc::clone(&barrier),
        };
        thread::Builder::new()
            .name(format!("worker-{thread_num}"))
            .spawn(move || worker_main(spec))
            .map_err(RunError::Spawn)?;
    }

    barrier.wait();
    if !opts.warmup.is_zero() {
        thread::sleep(opts.warmup);
    }

    let bytes_per_thread = opts.total_memory;
    let report = match opts.mode {
        RunMode::Chase => sample_chase(&opts, &slots, nr_chase_threads, bytes_per_thread),
        RunMode::Bandwidth | RunMode::ChaseLoaded => sample_with_handshake(
            &opts,
            &slots,
            nr_chase_threads,
            nr_load_threads,
            bytes_per_thread,
        ),
    };
    Ok(report)
}

/// Chase-only sampling: swap every counter each period and aggregate the
/// summed step rate.
fn sample_chase(
    opts: &RunOptions,
    slots: &[Arc<SharedSlot>],
    nr_chase_threads: usize,
    bytes_per_thread: usize,
) -> Report {
    let cfg = opts.config;
    let infinite = opts.nr_samples == 0;
    let total = opts.nr_samples + 1;
    let mut per_sample = Vec::with_capacity(opts.nr_samples);
    let mut last = now_nsec();

    if cfg.verbosity > 0 {
        println!("samples (one column per thread, one row per sample):");
    }
    let mut sample_no = 0usize;
    while infinite || sample_no < total {
        thread::sleep(opts.sample_period);

        let counts: Vec<u64> = slots
            .iter()
            .map(|slot| slot.count.swap(0, Ordering::SeqCst))
            .collect();
        let now = now_nsec();
        let delta_ns = (now - last) as f64;
        last = now;

        // A thread may begin with an unfair cache advantage; drop the
        // first interval entirely.
        if sample_no == 0 {
            sample_no += 1;
            continue;
        }

        let sum: u64 = counts.iter().sum();
        let t = delta_ns / sum as f64;
        if cfg.verbosity > 0 {
            cfg.stamp();
            for &count in &counts {
                print!(" {}", format_ns(delta_ns / count as f64));
            }
            println!("  avg={}", format_ns(t * nr_chase_threads as f64));
        }
        per_sample.push(t);
        sample_no += 1;
    }

    Report {
        nr_samples: per_sample.len(),
        nr_chase_threads,
        nr_load_threads: 0,
        bytes_per_thread,
        latency: latency_stats(&per_sample, nr_chase_threads),
        load: None,
    }
}

/// Bandwidth and loaded-latency sampling: request a sample via
/// `sample_no`, then poll until every thread has answered.
fn sample_with_handshake(
    opts: &RunOptions,
    slots: &[Arc<SharedSlot>],
    nr_chase_threads: usize,
    nr_load_threads: usize,
    bytes_per_thread: usize,
) -> Report {
    let cfg = opts.config;
    let infinite = opts.nr_samples == 0;
    let total = opts.nr_samples + 1;
    let mut chase_samples = Vec::with_capacity(opts.nr_samples);
    let mut load_samples = Vec::with_capacity(opts.nr_samples);
    let mut last = now_nsec();
    let mut delta_ns = 0f64;

    let mut sample_no = 0usize;
    while infinite || sample_no < total {
        thread::sleep(opts.sample_period);
        for slot in slots {
            slot.sample_no.store(sample_no as u64, Ordering::SeqCst);
        }
        // Chase threads update continuously; load threads need a moment
        // to notice the request.
        thread::sleep(LOAD_POLL);

        let mut counts = vec![0f64; slots.len()];
        for (i, slot) in slots.iter().enumerate() {
            loop {
                let v = slot.count.swap(0, Ordering::SeqCst);
                if v != 0 {
                    if i + 1 == nr_chase_threads {
                        // All chase counters are read; close their timing
                        // interval here, not after the load polls.
                        let now = now_nsec();
                        delta_ns = (now - last) as f64;
                        last = now;
                    }
                    counts[i] = v as f64;
                    break;
                }
                thread::sleep(LOAD_POLL);
            }
        }

        if sample_no == 0 {
            sample_no += 1;
            continue;
        }

        let chase_sum: f64 = counts[..nr_chase_threads].iter().sum();
        let load_sum: f64 = counts[nr_chase_threads..].iter().sum();

        if chase_sum > 0.0 {
            let t = delta_ns / chase_sum;
            if cfg.verbosity > 0 {
                cfg.stamp();
                println!(
                    "sample {}: chase avg={} ns",
                    sample_no,
                    format_ns(t * nr_chase_threads as f64)
                );
            }
            chase_samples.push(t);
        }
        if load_sum > 0.0 {
            if cfg.verbosity > 0 {
                cfg.stamp();
                println!(
                    "sample {}: load threads={} total={:.1} MiB/s per-thread={:.0}",
                    sample_no,
                    nr_load_threads,
                    load_sum,
                    load_sum / nr_load_threads as f64
                );
            }
            load_samples.push(load_sum);
        }
        sample_no += 1;
    }

    Report {
        nr_samples: chase_samples.len().max(load_samples.len()),
        nr_chase_threads,
        nr_load_threads,
        bytes_per_thread,
        latency: latency_stats(&chase_samples, nr_chase_threads),
        load: load_stats(&load_samples),
    }
}

fn latency_stats(per_sample: &[f64], nr_chase_threads: usize) -> Option<LatencyStats> {
    if per_sample.is_empty() {
        return None;
    }
    let scale = nr_chase_threads as f64;
    let n = per_sample.len() as f64;
    let best = per_sample.iter().copied().fold(f64::INFINITY, f64::min);
    let worst = per_sample.iter().copied().fold(0.0, f64::max);
    let mean = per_sample.iter().sum::<f64>() / n;
    let geomean = (per_sample.iter().map(|t| t.ln()).sum::<f64>() / n).exp();
    Some(LatencyStats {
        best: best * scale,
        worst: worst * scale,
        mean: mean * scale,
        geomean: geomean * scale,
    })
}

fn load_stats(samples: &[f64]) -> Option<LoadStats> {
    if samples.is_empty() {
        return None;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let max = samples.iter().copied().fold(0.0, f64::max);
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    Some(LoadStats { mean, max, min })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chase::kernels::default_workload;
    use crate::load::default_memload;

    fn opts() -> RunOptions {
        RunOptions::new(default_workload(), default_memload())
    }

    #[test]
    fn shared_slot_is_padded() {
        assert_eq!(std::mem::size_of::<SharedSlot>(), AVOID_FALSE_SHARING);
        assert_eq!(std::mem::align_of::<SharedSlot>(), AVOID_FALSE_SHARING);
    }

    #[test]
    fn normalize_rounds_like_the_original() {
        let mut o = opts();
        o.total_memory = 1 << 20;
        o.stride = 256;
        o.tlb_locality = 64 * 4096;
        let nr_mixer_indices = o.normalize().unwrap();
        assert_eq!(nr_mixer_indices, 32);
        assert_eq!(o.total_memory, 1 << 20);
        assert_eq!(o.tlb_locality, 64 * 4096);
    }

    #[test]
    fn normalize_snaps_tlb_to_stride_multiple() {
        let mut o = opts();
        o.stride = 256;
        o.tlb_locality = 1000;
        o.normalize().unwrap();
        assert_eq!(o.tlb_locality, 768);
        assert_eq!(o.total_memory % o.tlb_locality, 0);
    }

    #[test]
    fn normalize_shrinks_tiny_arenas_to_one_group() {
        let mut o = opts();
        o.total_memory = 4096 + 100;
        o.stride = 256;
        o.tlb_locality = 1 << 20;
        o.normalize().unwrap();
        assert_eq!(o.total_memory, 4096);
        assert_eq!(o.tlb_locality, 4096);
    }

    #[test]
    fn normalize_rejects_sub_word_stride() {
        let mut o = opts();
        o.stride = 4;
        assert!(matches!(
            o.normalize(),
            Err(ConfigError::StrideTooSmall { .. })
        ));
    }

    #[test]
    fn normalize_rejects_over_threaded_stride() {
        let mut o = opts();
        o.stride = 64; // 8 mixer indices
        o.nr_threads = 9;
        assert!(matches!(
            o.normalize(),
            Err(ConfigError::StrideTooNarrow { .. })
        ));
    }

    #[test]
    fn latency_aggregation() {
        let stats = latency_stats(&[10.0, 20.0, 40.0], 2).unwrap();
        assert_eq!(stats.best, 20.0);
        assert_eq!(stats.worst, 80.0);
        assert!((stats.mean - 2.0 * 70.0 / 3.0).abs() < 1e-9);
        assert!((stats.geomean - 40.0).abs() < 1e-9); // 2 * cbrt(8000)
        assert!(latency_stats(&[], 1).is_none());
    }
}

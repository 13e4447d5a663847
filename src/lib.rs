//! Memory-hierarchy micro-benchmarks.
//!
//! `memlat` characterizes a machine's memory system three ways:
//!
//! - **Chase latency**: dependent-load latency measured by walking a
//!   randomized cyclic pointer graph embedded in a large arena. Every step
//!   is one load whose address depends on the previous load, so the
//!   steady-state rate is the load-to-use latency at the chosen footprint.
//! - **Bandwidth**: sustained throughput of streaming kernels (memcpy,
//!   memset, STREAM copy/sum/triad) over per-thread buffers.
//! - **Loaded latency**: one chase thread competing with N bandwidth
//!   threads, reporting both the chase latency and the aggregate MiB/s.
//!
//! # Module map
//! - `units`: k/m/g size-suffix parsing for CLI values.
//! - `timer`: monotonic nanosecond clock and wall-clock stamps.
//! - `cpu`: CPU-set discovery, per-thread pinning, `cpu_relax`.
//! - `rng`: small per-thread deterministic generator used for all
//!   permutation draws.
//! - `permutation`: random/ordered permutations, the bijection check, and
//!   the mixer table that de-aliases intra-element offsets.
//! - `arena`: page-aligned anonymous memory with optional hugetlb pages,
//!   transparent-huge-page advice, and weighted NUMA interleave.
//! - `chase`: the pointer-graph builder, the chase kernels, and the
//!   branch-chase rewriter.
//! - `load`: bandwidth kernels and their registry.
//! - `runner`: thread launch, affinity, startup barrier, the sampling
//!   protocol, and report aggregation.
//!
//! # Concurrency model
//! Workers are spawned once, pin themselves, build their own cycles (or
//! buffers), meet the main thread at a barrier, and then spin in a kernel
//! forever; the process exits when the main thread finishes sampling. The
//! only worker/sampler shared state is a pair of 64-bit atomics per thread
//! (`count`, `sample_no`) on a 1024-byte-aligned record.

pub mod arena;
pub mod chase;
pub mod cpu;
pub mod errors;
pub mod load;
pub mod permutation;
pub mod rng;
pub mod runner;
pub mod timer;
pub mod units;

pub use arena::{Arena, ArenaSpec, NumaWeights};
pub use chase::graph::ChaseArgs;
pub use chase::kernels::{Workload, MAX_PARALLEL};
pub use errors::{ArenaError, ChaseError, ConfigError, RunError};
pub use load::MemLoad;
pub use permutation::{Mixer, PermKind};
pub use rng::Rng;
pub use runner::{Config, Report, RunMode, RunOptions};

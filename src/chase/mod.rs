//! Pointer-chase construction and execution.
//!
//! # Module map
//! - `graph`: threads arena elements into a single randomized cycle with
//!   TLB-grouped locality; also the post-hoc critword rewrites and the
//!   long-chase (prefetcher-defeating) variant.
//! - `kernels`: the tight inner loops that walk a cycle, one dependent
//!   load per step, plus the workload registry.
//! - `branch`: rewrites a cycle in place into branch-to-immediate machine
//!   code and the kernel that executes it.

pub mod branch;
pub mod graph;
pub mod kernels;

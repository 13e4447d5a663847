//! Error types for benchmark setup stages.
//!
//! Errors are stage-specific rather than one crate-wide enum: a
//! configuration problem wants usage text, an OS resource failure wants the
//! errno, and a layout/invariant violation wants the numbers that broke it.
//! All enums are `#[non_exhaustive]`. There is no recovery path anywhere:
//! the benchmark is either valid or it terminates with one of these.

use std::fmt;
use std::io;

/// Errors from resolving CLI options into a runnable configuration.
#[derive(Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// `-c` named no known workload.
    UnknownWorkload(String),
    /// `-l` named no known memory load.
    UnknownMemLoad(String),
    /// Workload requires a `:arg` and none was given.
    MissingWorkloadArg { name: &'static str, usage: &'static str },
    /// Workload takes no argument but one was given.
    UnexpectedWorkloadArg { name: &'static str, usage: &'static str },
    /// Stride is below the machine word size.
    StrideTooSmall { min: usize },
    /// Stride cannot interleave the requested threads * parallelism.
    StrideTooNarrow { needed_bytes: usize },
    /// `-l` was combined with a `-c` other than `chaseload`.
    LoadNeedsChaseload,
    /// Branch chase needs element starts aligned for code emission.
    BranchAlignment { stride: usize, offset: usize },
    /// A numeric flag failed to parse.
    BadValue { flag: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownWorkload(name) => write!(f, "not a recognized chase name: {name}"),
            Self::UnknownMemLoad(name) => write!(f, "not a recognized memload name: {name}"),
            Self::MissingWorkloadArg { name, usage } => {
                write!(f, "chase {name} requires an argument: -c {usage}")
            }
            Self::UnexpectedWorkloadArg { name, usage } => {
                write!(f, "chase {name} does not take an argument: -c {usage}")
            }
            Self::StrideTooSmall { min } => write!(f, "stride must be at least {min}"),
            Self::StrideTooNarrow { needed_bytes } => write!(
                f,
                "the stride is too small to interleave that many threads, \
                 need at least {needed_bytes} bytes"
            ),
            Self::LoadNeedsChaseload => write!(
                f,
                "when using -l memload, the only valid -c selection is chaseload"
            ),
            Self::BranchAlignment { stride, offset } => write!(
                f,
                "branch chase needs stride and offset to be multiples of 16 \
                 (stride = {stride}, offset = {offset})"
            ),
            Self::BadValue { flag, value } => write!(f, "invalid {flag}: '{value}'"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// OS-level failures while acquiring or placing the arena.
#[derive(Debug)]
#[non_exhaustive]
pub enum ArenaError {
    /// Anonymous mapping failed.
    Mmap(io::Error),
    /// `madvise(MADV_HUGEPAGE)` failed after THP policy was confirmed.
    Madvise(io::Error),
    /// Reading or writing the THP sysfs policy files failed.
    ThpSysfs { path: &'static str, source: io::Error },
    /// THP was requested together with an explicit hugetlb page size.
    ThpWithHugePages,
    /// Page size is not a power of two.
    BadPageSize { page_size: usize },
    /// `mbind` rejected a page placement.
    Mbind(io::Error),
    /// `/proc/meminfo` had no parseable default huge-page size.
    NoHugetlbDefault,
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mmap(err) => write!(f, "mmap: {err}"),
            Self::Madvise(err) => write!(f, "madvise: {err}"),
            Self::ThpSysfs { path, source } => write!(f, "{path}: {source}"),
            Self::ThpWithHugePages => write!(
                f,
                "transparent huge pages require the native page size (drop -p or -H)"
            ),
            Self::BadPageSize { page_size } => {
                write!(f, "page size {page_size} is not a power of two")
            }
            Self::Mbind(err) => write!(f, "mbind: {err}"),
            Self::NoHugetlbDefault => {
                write!(f, "no Hugepagesize line found in /proc/meminfo")
            }
        }
    }
}

impl std::error::Error for ArenaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Mmap(err) | Self::Madvise(err) | Self::Mbind(err) => Some(err),
            Self::ThpSysfs { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Layout and invariant violations while building or rewriting a chase.
#[derive(Debug)]
#[non_exhaustive]
pub enum ChaseError {
    /// An element had live bytes where branch code must be emitted.
    BranchSlack { element: usize, byte: usize },
    /// The walked cycle did not close where expected.
    CycleMismatch { expected: usize, walked: usize },
    /// Branch chase is not implemented for this architecture.
    BranchUnsupported,
}

impl fmt::Display for ChaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BranchSlack { element, byte } => write!(
                f,
                "not enough space to convert a pointer to branches \
                 (element {element}, live byte at offset {byte})"
            ),
            Self::CycleMismatch { expected, walked } => {
                write!(f, "cycle length {walked} does not match {expected} elements")
            }
            Self::BranchUnsupported => {
                write!(f, "branch chase is not implemented on this architecture")
            }
        }
    }
}

impl std::error::Error for ChaseError {}

/// Failures from the runner's setup phase.
///
/// Once all workers have passed the startup barrier nothing fails any more;
/// these cover everything before that point.
#[derive(Debug)]
#[non_exhaustive]
pub enum RunError {
    Config(ConfigError),
    Arena(ArenaError),
    /// Thread spawn failed.
    Spawn(io::Error),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => err.fmt(f),
            Self::Arena(err) => err.fmt(f),
            Self::Spawn(err) => write!(f, "pthread_create: {err}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Arena(err) => Some(err),
            Self::Spawn(err) => Some(err),
        }
    }
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<ArenaError> for RunError {
    fn from(err: ArenaError) -> Self {
        Self::Arena(err)
    }
}

//! Page-aligned anonymous memory for chases, loads, and flush buffers.
//!
//! The arena is the only allocation path in the suite: chase arenas, per
//! thread load buffers, and the cache-flush region all come from here so
//! that page size, THP policy, and NUMA placement are applied uniformly.
//!
//! # Page sizing
//! - Native page size (the default): the region is advised
//!   `MADV_NOHUGEPAGE` so transparent huge pages cannot quietly change the
//!   TLB behavior under test.
//! - Native page size with THP requested: the kernel policy files under
//!   `/sys/kernel/mm/transparent_hugepage/` are checked (and adjusted when
//!   writable) to permit madvise-driven THP, then the region is advised
//!   `MADV_HUGEPAGE`.
//! - Explicit hugetlb page size (`page_size` > native): the mapping uses
//!   `MAP_HUGETLB` with the encoded page-size log2. Combining this with
//!   THP is a configuration error.
//!
//! # NUMA placement
//! With weighted binding configured, each page is bound via `mbind(2)` to a
//! node drawn from the cumulative weight distribution and then touched so
//! the placement is realized immediately rather than at first kernel fault.
//!
//! The region is zero-filled by the kernel; graph builders rely on that for
//! the trailing bytes of every element.

use std::fs;
use std::io;
use std::ptr;

use crate::errors::{ArenaError, ConfigError};
use crate::rng::Rng;

/// Highest NUMA node id accepted by weighted binding, exclusive.
pub const MAX_MEM_NODES: usize = 64;

const THP_ENABLED: &str = "/sys/kernel/mm/transparent_hugepage/enabled";
const THP_DEFRAG: &str = "/sys/kernel/mm/transparent_hugepage/defrag";

const MPOL_BIND: i32 = 2;
const MPOL_MF_STRICT: u32 = 1;

/// Native page size reported by the kernel.
#[must_use]
pub fn native_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// Whether `page_size` requires a hugetlb mapping.
#[must_use]
pub fn page_size_is_huge(page_size: usize) -> bool {
    page_size > native_page_size()
}

/// Default hugetlb page size from `/proc/meminfo` (`Hugepagesize:` line).
pub fn default_hugetlb_page_size() -> Result<usize, ArenaError> {
    let meminfo = fs::read_to_string("/proc/meminfo").map_err(|source| ArenaError::ThpSysfs {
        path: "/proc/meminfo",
        source,
    })?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("Hugepagesize:") {
            let kb: usize = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .map_err(|_| ArenaError::NoHugetlbDefault)?;
            return Ok(kb * 1024);
        }
    }
    Err(ArenaError::NoHugetlbDefault)
}

/// Per-node weights for page-by-page NUMA binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumaWeights {
    weights: [u16; MAX_MEM_NODES],
}

impl NumaWeights {
    /// Parses a `node:weight,node:weight,…` list.
    ///
    /// `0:10,1:90` places pages on node 0 with probability 10% and node 1
    /// with probability 90%. At least one weight must be positive.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let bad = || ConfigError::BadValue {
            flag: "-W",
            value: list.to_owned(),
        };
        let mut weights = [0u16; MAX_MEM_NODES];
        for pair in list.split(',') {
            let (node, weight) = pair.split_once(':').ok_or_else(bad)?;
            let node: usize = node.trim().parse().map_err(|_| bad())?;
            let weight: u16 = weight.trim().parse().map_err(|_| bad())?;
            if node >= MAX_MEM_NODES {
                return Err(bad());
            }
            weights[node] = weight;
        }
        if weights.iter().all(|&w| w == 0) {
            return Err(bad());
        }
        Ok(Self { weights })
    }

    fn cumulative(&self) -> (Vec<i64>, i64) {
        // The cumulative sum starts at -1 so a draw r in [0, sum) hits
        // node i exactly when r <= cumsum[i], giving each node a band
        // proportional to its weight.
        let mut cumsum = Vec::with_capacity(MAX_MEM_NODES);
        let mut acc: i64 = -1;
        for &w in &self.weights {
            acc += i64::from(w);
            cumsum.push(acc);
        }
        (cumsum, acc + 1)
    }
}

/// Parameters for one arena allocation.
#[derive(Clone, Debug)]
pub struct ArenaSpec<'a> {
    /// Backing page size; must be a power of two. Values above the native
    /// page size select hugetlb pages.
    pub page_size: usize,
    /// Advise transparent huge pages (native page size only).
    pub use_thp: bool,
    /// Requested bytes; rounded up to the page size.
    pub size: usize,
    /// Map the region executable (the branch-chase rewriter emits code
    /// into it).
    pub exec: bool,
    /// Weighted per-page NUMA binding, if configured.
    pub numa: Option<&'a NumaWeights>,
}

impl<'a> ArenaSpec<'a> {
    /// Spec for a plain native-page region with no placement policy.
    #[must_use]
    pub fn plain(size: usize) -> Self {
        Self {
            page_size: native_page_size(),
            use_thp: false,
            size,
            exec: false,
            numa: None,
        }
    }
}

/// An anonymous mapping that lives until drop (in the tools: process exit).
///
/// # Invariants
/// - `base` is `page_size`-aligned and valid for `len` bytes.
/// - The mapping is readable and writable (and executable when requested).
///
/// `Arena` is `Send + Sync`; concurrent writers must target disjoint byte
/// ranges. The chase builders uphold that through the mixer contract, the
/// bandwidth kernels by owning their buffer outright.
#[derive(Debug)]
pub struct Arena {
    base: *mut u8,
    len: usize,
    page_size: usize,
}

// SAFETY: the mapping is plain memory; all mutation goes through raw
// pointers whose disjointness the writers themselves guarantee.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Maps a zeroed anonymous region per `spec`.
    pub fn alloc(spec: &ArenaSpec<'_>) -> Result<Self, ArenaError> {
        if !spec.page_size.is_power_of_two() {
            return Err(ArenaError::BadPageSize {
                page_size: spec.page_size,
            });
        }
        let huge = page_size_is_huge(spec.page_size);
        if huge && spec.use_thp {
            return Err(ArenaError::ThpWithHugePages);
        }

        let pagemask = spec.page_size - 1;
        let len = spec
            .size
            .checked_add(pagemask)
            .ok_or(ArenaError::BadPageSize {
                page_size: spec.page_size,
            })?
            & !pagemask;
        let len = len.max(spec.page_size);

        let mut prot = libc::PROT_READ | libc::PROT_WRITE;
        if spec.exec {
            prot |= libc::PROT_EXEC;
        }
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if huge {
            flags |= libc::MAP_HUGETLB
                | ((spec.page_size.trailing_zeros() as i32) << libc::MAP_HUGE_SHIFT);
        }

        // SAFETY: anonymous mapping with a null hint; the kernel picks the
        // address and the result is checked against MAP_FAILED.
        let base = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
        if base == libc::MAP_FAILED {
            return Err(ArenaError::Mmap(io::Error::last_os_error()));
        }
        let base = base.cast::<u8>();

        if !huge {
            if spec.use_thp {
                ensure_thp_policy()?;
                // SAFETY: base..base+len is our freshly mapped region.
                if unsafe { libc::madvise(base.cast(), len, libc::MADV_HUGEPAGE) } != 0 {
                    let err = io::Error::last_os_error();
                    unsafe { libc::munmap(base.cast(), len) };
                    return Err(ArenaError::Madvise(err));
                }
            } else {
                // Advisory only; some kernels build without THP entirely.
                // SAFETY: as above.
                let _ = unsafe { libc::madvise(base.cast(), len, libc::MADV_NOHUGEPAGE) };
            }
        }

        let arena = Self {
            base,
            len,
            page_size: spec.page_size,
        };
        if let Some(weights) = spec.numa {
            arena.weighted_mbind(weights)?;
        }
        Ok(arena)
    }

    /// Base address of the mapping.
    #[inline]
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Mapped length (the requested size rounded up to the page size).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True only for a zero-length request; the mapping itself is never
    /// empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing page size this arena was requested with.
    #[inline]
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Writes `byte` over the whole region, faulting every page in.
    pub fn touch(&self, byte: u8) {
        // SAFETY: base..base+len is mapped read/write.
        unsafe { ptr::write_bytes(self.base, byte, self.len) };
    }

    /// Binds each page to a node drawn from the weight distribution, then
    /// touches the page so the binding takes effect now.
    fn weighted_mbind(&self, weights: &NumaWeights) -> Result<(), ArenaError> {
        let (cumsum, weight_sum) = weights.cumulative();
        let page = self.page_size;
        let mut rng = Rng::new(1);
        let mut off = 0usize;
        while off < self.len {
            let r = (rng.next_int(1 << 31) % weight_sum as u64) as i64;
            let node = cumsum.iter().position(|&c| c >= r).unwrap_or(0);
            let mask: u64 = 1 << node;
            // SAFETY: the page at base+off is inside our mapping; the node
            // mask is a single u64 with maxnode = MAX_MEM_NODES bits.
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_mbind,
                    self.base.add(off),
                    page,
                    MPOL_BIND,
                    &mask as *const u64,
                    MAX_MEM_NODES,
                    MPOL_MF_STRICT,
                )
            };
            if rc != 0 {
                return Err(ArenaError::Mbind(io::Error::last_os_error()));
            }
            // SAFETY: in-bounds write realizes the binding.
            unsafe { self.base.add(off).write(0) };
            off += page;
        }
        Ok(())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: base/len came from mmap and are unmapped exactly once.
        unsafe { libc::munmap(self.base.cast(), self.len) };
    }
}

/// Checks (and adjusts when necessary) the system THP policy so that
/// `MADV_HUGEPAGE` can take effect.
fn ensure_thp_policy() -> Result<(), ArenaError> {
    ensure_policy_value(THP_ENABLED, &["always", "madvise"], "madvise")?;
    ensure_policy_value(
        THP_DEFRAG,
        &["always", "defer+madvise", "madvise"],
        "madvise",
    )
}

fn ensure_policy_value(
    path: &'static str,
    accepted: &[&str],
    fallback: &str,
) -> Result<(), ArenaError> {
    let contents =
        fs::read_to_string(path).map_err(|source| ArenaError::ThpSysfs { path, source })?;
    if let Some(active) = active_policy(&contents) {
        if accepted.contains(&active) {
            return Ok(());
        }
    }
    fs::write(path, fallback).map_err(|source| ArenaError::ThpSysfs { path, source })
}

/// Extracts the bracketed token from a sysfs policy line such as
/// `always defer [madvise] never`.
fn active_policy(contents: &str) -> Option<&str> {
    let start = contents.find('[')? + 1;
    let end = contents[start..].find(']')? + start;
    Some(&contents[start..end])
}

//! Bandwidth load kernels.
//!
//! Each load thread owns a private buffer and runs one of these streaming
//! loops forever. Unlike the chase kernels, which publish raw step counts,
//! a load kernel publishes a finished MiB/s figure: when the sampler bumps
//! `sample_no` (and has drained the previous figure to zero), the kernel
//! closes its timing window, computes
//! `loops * bytes_per_loop * 1e9 / (elapsed_ns * 2^20)`, adds it to
//! `count`, and starts the next window.
//!
//! Read:write ratios per kernel:
//!
//! | name         | loop                          | rd:wr |
//! |--------------|-------------------------------|-------|
//! | memcpy-libc  | block copy between halves     | 1:1   |
//! | memset-libc  | block write, nonzero          | 0:1   |
//! | memsetz-libc | block write, zero             | 0:1   |
//! | stream-copy  | `b[i] = a[i]`                 | 1:1   |
//! | stream-sum   | `s += a[i]`                   | 1:0   |
//! | stream-triad | `a[i] = b[i] + scalar * c[i]` | 2:1   |

use std::ptr;
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::errors::ConfigError;
use crate::runner::SharedSlot;

/// STREAM's traditional triad scalar.
const TRIAD_SCALAR: f64 = 3.0;

/// Per-worker load-kernel inputs.
pub struct LoadCtx<'a> {
    /// Private buffer, already touched so every page is resident.
    pub base: *mut u8,
    /// Buffer length in bytes.
    pub len: usize,
    pub verbosity: u8,
    /// The worker's sampler-visible counters.
    pub shared: &'a SharedSlot,
}

/// A bandwidth kernel. Runs forever.
///
/// # Safety
/// `ctx.base` must be valid for `ctx.len` writable bytes owned exclusively
/// by this thread.
pub type LoadKernel = unsafe fn(&LoadCtx<'_>) -> !;

/// The `sample_no`/`count` handshake shared by every load kernel.
struct SampleWindow<'a> {
    shared: &'a SharedSlot,
    loops: u64,
    cur_sample: u64,
    start: Instant,
}

impl<'a> SampleWindow<'a> {
    fn new(shared: &'a SharedSlot) -> Self {
        Self {
            shared,
            loops: 0,
            // Differs from any real sample number, so the first request is
            // answered immediately.
            cur_sample: u64::MAX,
            start: Instant::now(),
        }
    }

    /// Called once per pass over the buffer; `bytes_per_loop` is the
    /// traffic one pass generates.
    #[inline]
    fn tick(&mut self, bytes_per_loop: u64) {
        self.loops += 1;
        let next = self.shared.sample_no.load(Ordering::SeqCst);
        if self.cur_sample != next && self.shared.count.load(Ordering::SeqCst) == 0 {
            let elapsed_ns = self.start.elapsed().as_nanos() as f64;
            let mibps =
                (self.loops * bytes_per_loop) as f64 * 1e9 / (elapsed_ns * (1u64 << 20) as f64);
            self.shared.count.fetch_add(mibps as u64, Ordering::SeqCst);
            self.cur_sample = next;
            self.loops = 0;
            self.start = Instant::now();
        }
    }
}

// ============================================================================
// Kernels
// ============================================================================

unsafe fn load_memcpy_libc(ctx: &LoadCtx<'_>) -> ! {
    let half = ctx.len / 2;
    let bytes_per_loop = (half * 2) as u64;
    let mut a = ctx.base;
    let mut b = ctx.base.add(half);
    let mut window = SampleWindow::new(ctx.shared);
    loop {
        std::mem::swap(&mut a, &mut b);
        ptr::copy_nonoverlapping(b, a, half);
        window.tick(bytes_per_loop);
    }
}

unsafe fn load_memset_libc(ctx: &LoadCtx<'_>) -> ! {
    let bytes_per_loop = ctx.len as u64;
    let mut window = SampleWindow::new(ctx.shared);
    loop {
        ptr::write_bytes(ctx.base, 0xef, ctx.len);
        window.tick(bytes_per_loop);
    }
}

unsafe fn load_memsetz_libc(ctx: &LoadCtx<'_>) -> ! {
    let bytes_per_loop = ctx.len as u64;
    let mut window = SampleWindow::new(ctx.shared);
    loop {
        ptr::write_bytes(ctx.base, 0, ctx.len);
        window.tick(bytes_per_loop);
    }
}

unsafe fn load_stream_copy(ctx: &LoadCtx<'_>) -> ! {
    let n = ctx.len / 2 / std::mem::size_of::<f64>();
    let bytes_per_loop = (n * std::mem::size_of::<f64>() * 2) as u64;
    let mut a = ctx.base.cast::<f64>();
    let mut b = a.add(n);
    let mut window = SampleWindow::new(ctx.shared);
    loop {
        std::mem::swap(&mut a, &mut b);
        let src = std::slice::from_raw_parts(a, n);
        let dst = std::slice::from_raw_parts_mut(b, n);
        for i in 0..n {
            dst[i] = src[i];
        }
        window.tick(bytes_per_loop);
    }
}

unsafe fn load_stream_sum(ctx: &LoadCtx<'_>) -> ! {
    let n = ctx.len / std::mem::size_of::<u64>();
    let bytes_per_loop = (n * std::mem::size_of::<u64>()) as u64;
    let a = std::slice::from_raw_parts(ctx.base.cast::<u64>(), n);
    let mut sum = 0u64;
    let mut window = SampleWindow::new(ctx.shared);
    loop {
        for &v in a {
            sum = sum.wrapping_add(v);
        }
        window.tick(bytes_per_loop);
        std::hint::black_box(sum);
    }
}

unsafe fn load_stream_triad(ctx: &LoadCtx<'_>) -> ! {
    const ALIGN: usize = 16;
    // Three equal buffers carved out of the arena, each 16-byte aligned.
    let usable = ctx.len.saturating_sub(3 * ALIGN);
    let per_buffer = (usable / 3) & !(ALIGN - 1);
    let n = per_buffer / std::mem::size_of::<f64>();
    let bytes_per_loop = (n * std::mem::size_of::<f64>() * 3) as u64;
    let aligned = (ctx.base as usize + ALIGN - 1) & !(ALIGN - 1);
    let mut a = aligned as *mut f64;
    let mut b = a.add(n);
    let mut c = b.add(n);
    if ctx.verbosity > 1 {
        println!(
            "triad: base={:p} len={:#x} n={:#x} a={a:p} b={b:p} c={c:p}",
            ctx.base, ctx.len, n
        );
    }
    let mut window = SampleWindow::new(ctx.shared);
    loop {
        let tmp = a;
        a = b;
        b = c;
        c = tmp;
        let dst = std::slice::from_raw_parts_mut(a, n);
        let src_b = std::slice::from_raw_parts(b, n);
        let src_c = std::slice::from_raw_parts(c, n);
        for i in 0..n {
            dst[i] = src_b[i] + TRIAD_SCALAR * src_c[i];
        }
        window.tick(bytes_per_loop);
    }
}

// ============================================================================
// Registry
// ============================================================================

/// One selectable bandwidth load.
pub struct MemLoad {
    pub name: &'static str,
    pub usage: &'static str,
    pub about: &'static str,
    pub kernel: LoadKernel,
}

/// All bandwidth loads. The default must be first.
static MEMLOADS: &[MemLoad] = &[
    MemLoad {
        name: "memcpy-libc",
        usage: "memcpy-libc",
        about: "1:1 rd:wr - memcpy()",
        kernel: load_memcpy_libc,
    },
    MemLoad {
        name: "memset-libc",
        usage: "memset-libc",
        about: "0:1 rd:wr - memset() non-zero data",
        kernel: load_memset_libc,
    },
    MemLoad {
        name: "memsetz-libc",
        usage: "memsetz-libc",
        about: "0:1 rd:wr - memset() zero data",
        kernel: load_memsetz_libc,
    },
    MemLoad {
        name: "stream-copy",
        usage: "stream-copy",
        about: "1:1 rd:wr - lmbench stream copy",
        kernel: load_stream_copy,
    },
    MemLoad {
        name: "stream-sum",
        usage: "stream-sum",
        about: "1:0 rd:wr - lmbench stream sum",
        kernel: load_stream_sum,
    },
    MemLoad {
        name: "stream-triad",
        usage: "stream-triad",
        about: "2:1 rd:wr - lmbench stream triad a[i]=b[i]+(scalar*c[i])",
        kernel: load_stream_triad,
    },
];

/// All bandwidth loads, default first.
#[must_use]
pub fn memloads() -> &'static [MemLoad] {
    MEMLOADS
}

/// The default load (`memcpy-libc`).
#[must_use]
pub fn default_memload() -> &'static MemLoad {
    &MEMLOADS[0]
}

/// Looks a load up by exact name; loads take no `:arg`.
pub fn parse_memload_spec(spec: &str) -> Result<&'static MemLoad, ConfigError> {
    if spec.contains(':') {
        return Err(ConfigError::UnknownMemLoad(spec.to_owned()));
    }
    MEMLOADS
        .iter()
        .find(|m| m.name == spec)
        .ok_or_else(|| ConfigError::UnknownMemLoad(spec.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_memcpy() {
        assert_eq!(default_memload().name, "memcpy-libc");
    }

    #[test]
    fn lookups() {
        assert!(parse_memload_spec("stream-triad").is_ok());
        assert!(parse_memload_spec("stream-triad:4").is_err());
        assert!(parse_memload_spec("nonesuch").is_err());
    }

    #[test]
    fn window_answers_a_sample_request_once() {
        let shared = SharedSlot::new();
        let mut window = SampleWindow::new(&shared);
        // The sentinel differs from sample 0, so the very first tick
        // closes the (truncated) startup window.
        std::thread::sleep(std::time::Duration::from_millis(2));
        window.tick(1 << 20);
        let published = shared.count.swap(0, Ordering::SeqCst);
        assert!(published > 0, "a MiB/s figure must be published");
        // Sample 0 is answered; further ticks publish nothing.
        window.tick(1 << 20);
        window.tick(1 << 20);
        assert_eq!(shared.count.load(Ordering::SeqCst), 0);
        // A new request with the old figure drained gets an answer.
        shared.sample_no.store(1, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(2));
        window.tick(1 << 20);
        assert!(shared.count.load(Ordering::SeqCst) > 0);
    }
}

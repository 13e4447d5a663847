//! Pairwise cache-line exchange latency grid.
//!
//! For every pair of CPUs in the affinity mask, two threads bounce a
//! word between their caches and the tool reports the best observed
//! latency per handoff, in an upper-triangular grid. Three exchange
//! flavours are selectable:
//!
//! - `-l` locked: compare-and-swap handoff.
//! - `-u` unlocked: plain load/store handoff.
//! - `-x` xadd: both threads fetch-add distinct halves of a 64-bit word
//!   and the odd thread counts low-half changes.
//!
//! `-s` dirties an array of words after each successful handoff to
//! measure the cost of passing more modified data between caches. The
//! exchange word itself is mapped by the even thread so it is local to
//! that core's node.

use std::process;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use memlat::arena::{Arena, ArenaSpec};
use memlat::cpu::{cpu_relax, pin_to_cpu, process_cpus};

const NR_SAMPLES: usize = 5;
const SAMPLE_PERIOD: Duration = Duration::from_micros(250_000);
/// Handoffs batched locally before publishing to the shared tally.
const PUBLISH_BATCH: u32 = 10_000;

fn die(msg: &dyn std::fmt::Display) -> ! {
    eprintln!("fairness: {msg}");
    process::exit(1);
}

fn usage() -> ! {
    eprintln!(
        "usage: fairness [-l | -u | -x] [-r nr_relax] [-s nr_array_elts] [-c nr_tested_cores]"
    );
    process::exit(1);
}

#[derive(Clone, Copy, PartialEq)]
enum Kind {
    Locked,
    Unlocked,
    Xadd,
}

/// The page holding the exchanged word, mapped by the even thread.
struct ExchangePage {
    _arena: Arena,
    word: *const AtomicU64,
}

// SAFETY: `word` points into the arena mapping, which outlives both
// threads of the pair; all access is atomic.
unsafe impl Send for ExchangePage {}
unsafe impl Sync for ExchangePage {}

impl ExchangePage {
    fn map() -> Self {
        let arena = match Arena::alloc(&ArenaSpec::plain(1)) {
            Ok(arena) => arena,
            Err(err) => die(&err),
        };
        let word = arena.base().cast::<AtomicU64>();
        Self {
            _arena: arena,
            word: word.cast_const(),
        }
    }

    fn as_u64(&self) -> &AtomicU64 {
        // SAFETY: page-aligned, zeroed, lives as long as self.
        unsafe { &*self.word }
    }

    fn as_u32(&self) -> &AtomicU32 {
        // SAFETY: as above; an AtomicU32 view of the first four bytes.
        unsafe { &*self.word.cast::<AtomicU32>() }
    }
}

/// Array dirtied after each successful handoff.
///
/// Writes are non-atomic on purpose — the point is ordinary dirty lines —
/// and are ordered between the two threads by the exchange itself: a
/// thread only writes after winning the handoff that the previous owner
/// published with a SeqCst store.
struct DirtyArray {
    base: *mut u64,
    len: usize,
}

// SAFETY: see above; access alternates between threads under the
// exchange-word happens-before edge.
unsafe impl Send for DirtyArray {}
unsafe impl Sync for DirtyArray {}

impl DirtyArray {
    fn alloc(len: usize) -> Self {
        if len == 0 {
            return Self {
                base: std::ptr::null_mut(),
                len: 0,
            };
        }
        // 2 MiB alignment keeps the array inside as few huge pages as
        // possible, like the original tool's posix_memalign.
        let layout = std::alloc::Layout::from_size_align(len * 8, 1 << 21)
            .unwrap_or_else(|err| die(&err));
        // SAFETY: non-zero layout.
        let base = unsafe { std::alloc::alloc_zeroed(layout) }.cast::<u64>();
        if base.is_null() {
            die(&"failed to allocate the communication array");
        }
        Self { base, len }
    }

    #[inline]
    fn dirty(&self) {
        for i in 0..self.len {
            // SAFETY: in-bounds; ordering per the type-level contract.
            unsafe {
                let p = self.base.add(i);
                p.write(p.read().wrapping_add(1));
            }
        }
    }
}

impl Drop for DirtyArray {
    fn drop(&mut self) {
        if self.base.is_null() {
            return;
        }
        if let Ok(layout) = std::alloc::Layout::from_size_align(self.len * 8, 1 << 21) {
            // SAFETY: same layout the array was allocated with; both pair
            // threads have been joined by the time the context drops.
            unsafe { std::alloc::dealloc(self.base.cast(), layout) };
        }
    }
}

struct PairCtx {
    kind: Kind,
    nr_relax: usize,
    page: OnceLock<ExchangePage>,
    start: Barrier,
    tally: CachePadded<AtomicU32>,
    stop: AtomicBool,
    array: DirtyArray,
}

fn exchange_loop(ctx: &Arc<PairCtx>, me: u32, buddy: u32) {
    let page = ctx.page.get().expect("even thread maps before the barrier");
    let mut nr = 0u32;
    match ctx.kind {
        Kind::Locked | Kind::Unlocked => {
            let word = page.as_u32();
            loop {
                if ctx.stop.load(Ordering::SeqCst) {
                    return;
                }
                let won = if ctx.kind == Kind::Locked {
                    word.compare_exchange(me, buddy, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                } else if word.load(Ordering::SeqCst) == me {
                    word.store(buddy, Ordering::SeqCst);
                    true
                } else {
                    false
                };
                if won {
                    ctx.array.dirty();
                    // The atomic add costs too much to pay per handoff.
                    nr += 1;
                    if nr == PUBLISH_BATCH && me == 0 {
                        ctx.tally.fetch_add(2 * nr, Ordering::SeqCst);
                        nr = 0;
                    }
                }
                for _ in 0..ctx.nr_relax {
                    cpu_relax();
                }
            }
        }
        Kind::Xadd => {
            let word = page.as_u64();
            let add_amt: u64 = if me == 0 { 1 } else { 1 << 32 };
            let mut last_lo = 0u32;
            loop {
                if ctx.stop.load(Ordering::SeqCst) {
                    return;
                }
                let seen = word.fetch_add(add_amt, Ordering::SeqCst);
                if me == 1 && last_lo != seen as u32 {
                    last_lo = seen as u32;
                    nr += 1;
                    if nr == PUBLISH_BATCH {
                        ctx.tally.fetch_add(2 * nr, Ordering::SeqCst);
                        nr = 0;
                    }
                }
                for _ in 0..ctx.nr_relax {
                    cpu_relax();
                }
            }
        }
    }
}

fn pair_thread(ctx: Arc<PairCtx>, cpu: usize, me: u32, buddy: u32) {
    if let Err(err) = pin_to_cpu(cpu) {
        die(&err);
    }
    if me == 0 {
        // Map the exchange word from the even CPU so it is local to at
        // least one side of the pair.
        let _ = ctx.page.set(ExchangePage::map());
    }
    ctx.start.wait();
    exchange_loop(&ctx, me, buddy);
}

fn main() {
    let mut kind: Option<Kind> = None;
    let mut nr_relax = 10usize;
    let mut nr_array_elts = 0usize;
    let mut nr_tested_cores = usize::MAX;

    let pick = |kind: &mut Option<Kind>, k: Kind| {
        if kind.is_some() {
            die(&"must specify exactly one of -u, -l or -x");
        }
        *kind = Some(k);
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| -> String {
            args.next()
                .unwrap_or_else(|| die(&format!("{flag} requires a value")))
        };
        match arg.as_str() {
            "-l" => pick(&mut kind, Kind::Locked),
            "-u" => pick(&mut kind, Kind::Unlocked),
            "-x" => pick(&mut kind, Kind::Xadd),
            "-r" => {
                let v = value("-r");
                nr_relax = v
                    .parse()
                    .unwrap_or_else(|_| die(&format!("-r requires a number: '{v}'")));
            }
            "-s" => {
                let v = value("-s");
                nr_array_elts = v
                    .parse()
                    .unwrap_or_else(|_| die(&format!("-s requires a number: '{v}'")));
            }
            "-c" => {
                let v = value("-c");
                nr_tested_cores = v
                    .parse()
                    .unwrap_or_else(|_| die(&format!("-c requires a number: '{v}'")));
            }
            _ => usage(),
        }
    }
    let Some(kind) = kind else {
        die(&"must specify exactly one of -u, -l or -x");
    };

    let cpus = match process_cpus() {
        Ok(cpus) => cpus,
        Err(err) => die(&err),
    };
    if cpus.len() < 2 {
        die(&"need at least two cpus in the affinity mask");
    }

    println!("avg latency to communicate a modified line from one core to another");
    println!("times are in ns");
    println!();

    let last_cpu = *cpus.last().expect("nonempty");
    print!("   ");
    for &cpu in &cpus[1..] {
        print!("{cpu:8}");
    }
    println!();

    for (core, &i) in cpus.iter().enumerate() {
        if i == last_cpu || core >= nr_tested_cores {
            break;
        }
        print!("{i:2}:");
        // Leading blanks keep the grid upper-triangular.
        for &j in &cpus[1..] {
            if j <= i {
                print!("{:8}", "");
            }
        }
        for &j in cpus.iter().filter(|&&j| j > i) {
            let ctx = Arc::new(PairCtx {
                kind,
                nr_relax,
                page: OnceLock::new(),
                start: Barrier::new(2),
                tally: CachePadded::new(AtomicU32::new(0)),
                stop: AtomicBool::new(false),
                array: DirtyArray::alloc(nr_array_elts),
            });
            let even = {
                let ctx = Arc::clone(&ctx);
                thread::Builder::new()
                    .name(format!("even-{i}"))
                    .spawn(move || pair_thread(ctx, i, 0, 1))
                    .unwrap_or_else(|err| die(&err))
            };
            let odd = {
                let ctx = Arc::clone(&ctx);
                thread::Builder::new()
                    .name(format!("odd-{j}"))
                    .spawn(move || pair_thread(ctx, j, 1, 0))
                    .unwrap_or_else(|err| die(&err))
            };

            let mut best = f64::INFINITY;
            let mut last = Instant::now();
            for _ in 0..NR_SAMPLES {
                thread::sleep(SAMPLE_PERIOD);
                let handoffs = ctx.tally.swap(0, Ordering::SeqCst);
                let now = Instant::now();
                let sample = now.duration_since(last).as_nanos() as f64 / handoffs as f64;
                last = now;
                if sample < best {
                    best = sample;
                }
            }
            print!("{best:8.1}");

            ctx.stop.store(true, Ordering::SeqCst);
            if even.join().is_err() || odd.join().is_err() {
                die(&"pair thread panicked");
            }
        }
        println!();
    }
    println!();
    process::exit(0);
}

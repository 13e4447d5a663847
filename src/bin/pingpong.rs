//! Contended-increment sweep: every CPU hammers one shared counter.
//!
//! One thread per CPU in the process affinity mask performs atomic
//! increments on a single cache line while the main thread samples each
//! thread's progress. The per-thread latency spread exposes how fairly
//! the interconnect arbitrates a contended line. Results print twice: an
//! unrelaxed phase, then a phase with a `cpu_relax` between increments.
//!
//! The `-s` sweep walks the counter across distinct cache lines, which
//! shows whether arbitration depends on line placement. `-d` delays a
//! mask of CPUs by a second at each phase edge so their entry into the
//! contest is staggered.

use std::process;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use memlat::cpu::{cpu_relax, pin_to_cpu, process_cpus};
use memlat::runner::SharedSlot;

/// Cache lines available to the sweep.
const SWEEP_MAX: usize = 256;
/// Increments per progress-counter update.
const BURST: u32 = 50;
/// Samples per sweep cell; the first is discarded.
const SAMPLES_PER_CELL: usize = 6;

fn die(msg: &dyn std::fmt::Display) -> ! {
    eprintln!("pingpong: {msg}");
    process::exit(1);
}

fn usage() -> ! {
    eprintln!("usage: pingpong [-d delay_mask] [-s sweep_max] [-t time] [-S sep]");
    eprintln!("runs one thread on each cpu; use taskset(1) to restrict the set.");
    eprintln!("-d delay_mask  mask of cpus whose startup is delayed at phase edges");
    eprintln!("-s sweep_max   test across this many different cache lines");
    eprintln!("-t time        seconds between result polls (float)");
    eprintln!("-S sep         separator character; ',' selects CSV output");
    process::exit(1);
}

/// The contended state all workers share.
struct Contest {
    lines: Vec<CachePadded<AtomicU32>>,
    sweep_id: AtomicUsize,
    relaxed: AtomicBool,
}

fn parse_mask(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn worker(
    contest: Arc<Contest>,
    progress: Arc<SharedSlot>,
    barrier: Arc<Barrier>,
    cpu: usize,
    delay_mask: u64,
) {
    if let Err(err) = pin_to_cpu(cpu) {
        die(&err);
    }
    barrier.wait();

    let delayed = cpu < 64 && delay_mask & (1u64 << cpu) != 0;
    if delayed {
        thread::sleep(Duration::from_secs(1));
    }
    while !contest.relaxed.load(Ordering::SeqCst) {
        let target = &contest.lines[contest.sweep_id.load(Ordering::SeqCst)];
        for _ in 0..BURST {
            target.fetch_add(1, Ordering::SeqCst);
        }
        progress.count.fetch_add(u64::from(BURST), Ordering::SeqCst);
    }
    if delayed {
        thread::sleep(Duration::from_secs(1));
    }
    loop {
        let target = &contest.lines[contest.sweep_id.load(Ordering::SeqCst)];
        for _ in 0..BURST {
            target.fetch_add(1, Ordering::SeqCst);
            cpu_relax();
        }
        progress.count.fetch_add(u64::from(BURST), Ordering::SeqCst);
    }
}

fn main() {
    let mut delay_mask = 0u64;
    let mut sweep_max = 1usize;
    let mut time_slice = Duration::from_micros(500_000);
    let mut sep = ' ';

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| -> String {
            args.next()
                .unwrap_or_else(|| die(&format!("{flag} requires a value")))
        };
        match arg.as_str() {
            "-d" => {
                let v = value("-d");
                delay_mask = parse_mask(&v)
                    .unwrap_or_else(|| die(&format!("-d requires a numeric mask: '{v}'")));
            }
            "-s" => {
                let v = value("-s");
                sweep_max = match v.parse() {
                    Ok(n) if (1..=SWEEP_MAX).contains(&n) => n,
                    _ => die(&format!("-s must be in 1..={SWEEP_MAX}: '{v}'")),
                };
            }
            "-t" => {
                let v = value("-t");
                let secs: f64 = v
                    .parse()
                    .unwrap_or_else(|_| die(&format!("-t requires seconds: '{v}'")));
                time_slice = Duration::from_secs_f64(secs);
            }
            "-S" => {
                let v = value("-S");
                sep = v.chars().next().unwrap_or_else(|| usage());
            }
            _ => usage(),
        }
    }

    let cpus = match process_cpus() {
        Ok(cpus) => cpus,
        Err(err) => die(&err),
    };
    let nr_threads = cpus.len();

    let contest = Arc::new(Contest {
        lines: (0..SWEEP_MAX).map(|_| CachePadded::new(AtomicU32::new(0))).collect(),
        sweep_id: AtomicUsize::new(0),
        relaxed: AtomicBool::new(false),
    });
    let barrier = Arc::new(Barrier::new(nr_threads + 1));
    let mut progress: Vec<Arc<SharedSlot>> = Vec::with_capacity(nr_threads);

    for &cpu in &cpus {
        let slot = Arc::new(SharedSlot::new());
        progress.push(Arc::clone(&slot));
        let contest = Arc::clone(&contest);
        let barrier = Arc::clone(&barrier);
        if let Err(err) = thread::Builder::new()
            .name(format!("pingpong-{cpu}"))
            .spawn(move || worker(contest, slot, barrier, cpu, delay_mask))
        {
            die(&err);
        }
    }
    barrier.wait();

    println!("results are avg latency per locked increment in ns, one column per thread");
    if sep == ',' {
        print!("relaxed,sweep");
        for &cpu in &cpus {
            print!(",cpu-{cpu}");
        }
        println!(",avg,stdev,min,max");
    } else {
        print!("cpu:");
        for &cpu in &cpus {
            print!("{cpu:6}  ");
        }
        println!();
    }

    let mut samples = vec![0u64; nr_threads];
    for relaxed in 0..2u8 {
        if relaxed == 1 {
            contest.relaxed.store(true, Ordering::SeqCst);
        }
        if sep != ',' {
            println!("{}", if relaxed == 1 { "relaxed:" } else { "unrelaxed:" });
        }
        for sweep in 0..sweep_max {
            contest.sweep_id.store(sweep, Ordering::SeqCst);
            let mut last = Instant::now();
            for sample_nr in 0..SAMPLES_PER_CELL {
                thread::sleep(time_slice);
                for (slot, sample) in progress.iter().zip(samples.iter_mut()) {
                    *sample = slot.count.swap(0, Ordering::SeqCst);
                }
                let now = Instant::now();
                let delta = now.duration_since(last).as_nanos() as f64;
                last = now;

                // The first poll races the phase/sweep switch; drop it.
                if sample_nr == 0 {
                    continue;
                }
                if sep == ',' {
                    print!("{relaxed},{:p}", &contest.lines[sweep]);
                }
                let mut min = f64::INFINITY;
                let mut max = 0f64;
                let mut sum = 0f64;
                let mut sum_squared = 0f64;
                for &sample in &samples {
                    let per_op = delta / sample as f64;
                    if sep == ',' {
                        print!(",{per_op:.1}");
                    } else {
                        print!("  {per_op:6.1}");
                    }
                    min = min.min(per_op);
                    max = max.max(per_op);
                    sum += per_op;
                    sum_squared += per_op * per_op;
                }
                let n = nr_threads as f64;
                let stdev = if nr_threads > 1 {
                    ((sum_squared - sum * sum / n) / (n - 1.0)).max(0.0).sqrt()
                } else {
                    0.0
                };
                if sep == ',' {
                    println!(",{:.1},{stdev:.1},{min:.1},{max:.1}", sum / n);
                } else {
                    println!(
                        " : avg {:6.1}  sdev {stdev:6.1}  min {min:6.1}  max {max:6.1}",
                        sum / n
                    );
                }
            }
        }
    }
    process::exit(0);
}

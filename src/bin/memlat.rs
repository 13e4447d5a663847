//! Chase / bandwidth / loaded-latency CLI.
//!
//! Three ways to run:
//! - latency only: pick a chase with `-c` (not `chaseload`), no `-l`;
//! - bandwidth only: pick a load with `-l`, no chase;
//! - loaded latency: `-c chaseload -l <memload>` — thread 0 chases while
//!   the remaining threads generate bandwidth.

use std::process;
use std::time::Duration;

use memlat::arena::{default_hugetlb_page_size, NumaWeights};
use memlat::chase::kernels::{default_workload, parse_workload_spec, workloads, Workload};
use memlat::errors::ConfigError;
use memlat::load::{default_memload, memloads, parse_memload_spec, MemLoad};
use memlat::runner::{format_ns, run, Report, RunMode, RunOptions};
use memlat::timer::unix_seconds;
use memlat::units::parse_size;
use memlat::PermKind;

fn die(msg: &dyn std::fmt::Display) -> ! {
    eprintln!("memlat: {msg}");
    process::exit(1);
}

fn usage() -> ! {
    eprintln!("usage: memlat [options]");
    eprintln!("runs read latency, memory bandwidth, or loaded latency:");
    eprintln!("    latency only:   -c must not be chaseload, no -l");
    eprintln!("    bandwidth only: -l memload, no -c");
    eprintln!("    loaded latency: -c chaseload with -l memload");
    eprintln!("-a             print average latency (default is best)");
    eprintln!("-c chase       select one of several different chases:");
    for w in workloads() {
        eprintln!("   {:<12}{}", w.usage, w.about);
    }
    eprintln!("               default: {}", default_workload().name);
    eprintln!("-l memload     select one of several different memloads:");
    for m in memloads() {
        eprintln!("   {:<12}{}", m.usage, m.about);
    }
    eprintln!("               default: {}", default_memload().name);
    eprintln!("-m nnnn[kmg]   total memory size (default 256m)");
    eprintln!("               NOTE: memory size is rounded down to a multiple of -T");
    eprintln!("-n nr_samples  nr of 0.5 second samples (default 5, 0 = infinite)");
    eprintln!("-o             perform an ordered traversal (rather than random)");
    eprintln!("-O nnnn[kmg]   offset the entire chase by nnnn bytes");
    eprintln!("-p nnnn[kmg]   backing page size ('huge' = default hugetlb size)");
    eprintln!("-H             use transparent hugepages (native page size only)");
    eprintln!("-s nnnn[kmg]   stride size (default 256)");
    eprintln!("-T nnnn[kmg]   TLB locality in bytes (default 64 pages)");
    eprintln!("               NOTE: TLB locality is rounded down to a multiple of -s");
    eprintln!("-t nr_threads  number of threads (default 1)");
    eprintln!("-F nnnn[kmg]   amount of memory used to flush the caches after");
    eprintln!("               constructing the chase (default 64m, use with nta)");
    eprintln!("-W node:weight,...  NUMA weights for page placement");
    eprintln!("               0:10,1:90 weights pages 10% on node 0, 90% on node 1");
    eprintln!("-X             do not set thread affinity");
    eprintln!("-v             verbose output (repeat for more)");
    eprintln!("-y             print timestamp in front of each line");
    process::exit(1);
}

struct Cli {
    opts: RunOptions,
    chase_spec: String,
    memload_spec: Option<String>,
    print_average: bool,
}

fn parse_args() -> Cli {
    let mut workload: &'static Workload = default_workload();
    let mut memload: &'static MemLoad = default_memload();
    let mut chase_spec = workload.name.to_owned();
    let mut memload_spec = None;
    let mut mode = RunMode::Chase;
    let mut extra_arg: Option<String> = None;
    let mut opts = RunOptions::new(workload, memload);
    let mut print_average = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let Some(flags) = arg.strip_prefix('-') else {
            usage();
        };
        if flags.is_empty() {
            usage();
        }
        let mut k = 0;
        let bytes = flags.as_bytes();
        while k < bytes.len() {
            let c = bytes[k] as char;
            k += 1;
            // Value-taking flags consume the rest of the token or the
            // next argument, getopt style.
            let mut value = || -> String {
                if k < bytes.len() {
                    let v = flags[k..].to_owned();
                    v
                } else {
                    args.next().unwrap_or_else(|| usage())
                }
            };
            match c {
                'a' => print_average = true,
                'v' => opts.config.verbosity += 1,
                'y' => opts.config.print_timestamp = true,
                'o' => opts.perm_kind = PermKind::Ordered,
                'X' => opts.set_affinity = false,
                'H' => opts.use_thp = true,
                'c' => {
                    let spec = value();
                    k = bytes.len();
                    let (w, arg) = match parse_workload_spec(&spec) {
                        Ok(parsed) => parsed,
                        Err(err) => die(&err),
                    };
                    workload = w;
                    extra_arg = arg.map(str::to_owned);
                    chase_spec = spec;
                    if workload.name == "chaseload" {
                        mode = RunMode::ChaseLoaded;
                        if opts.config.verbosity > 0 {
                            println!(
                                "loaded-latency chase selected; -l picks the memory load"
                            );
                        }
                    } else if mode == RunMode::Bandwidth {
                        eprintln!("memlat: {}", ConfigError::LoadNeedsChaseload);
                        usage();
                    }
                }
                'l' => {
                    let spec = value();
                    k = bytes.len();
                    memload = match parse_memload_spec(&spec) {
                        Ok(m) => m,
                        Err(err) => die(&err),
                    };
                    memload_spec = Some(spec);
                    if mode != RunMode::ChaseLoaded {
                        mode = RunMode::Bandwidth;
                    }
                }
                'm' => {
                    let v = value();
                    k = bytes.len();
                    match parse_size(&v) {
                        Ok(n) if n > 0 => opts.total_memory = n,
                        _ => die(&format!("total_memory must be a positive size: '{v}'")),
                    }
                }
                'n' => {
                    let v = value();
                    k = bytes.len();
                    opts.nr_samples = v
                        .parse()
                        .unwrap_or_else(|_| die(&format!("nr_samples must be a number: '{v}'")));
                }
                'O' => {
                    let v = value();
                    k = bytes.len();
                    opts.offset = parse_size(&v).unwrap_or_else(|err| die(&err));
                }
                'p' => {
                    let v = value();
                    k = bytes.len();
                    opts.page_size = if v == "huge" {
                        default_hugetlb_page_size().unwrap_or_else(|err| die(&err))
                    } else {
                        parse_size(&v).unwrap_or_else(|err| die(&err))
                    };
                }
                's' => {
                    let v = value();
                    k = bytes.len();
                    opts.stride = parse_size(&v).unwrap_or_else(|err| die(&err));
                }
                'T' => {
                    let v = value();
                    k = bytes.len();
                    opts.tlb_locality = parse_size(&v).unwrap_or_else(|err| die(&err));
                }
                't' => {
                    let v = value();
                    k = bytes.len();
                    match v.parse() {
                        Ok(n) if n > 0 => opts.nr_threads = n,
                        _ => die(&format!("nr_threads must be a positive number: '{v}'")),
                    }
                }
                'F' => {
                    let v = value();
                    k = bytes.len();
                    opts.cache_flush_size = parse_size(&v).unwrap_or_else(|err| die(&err));
                }
                'W' => {
                    let v = value();
                    k = bytes.len();
                    opts.numa = Some(NumaWeights::parse(&v).unwrap_or_else(|err| die(&err)));
                }
                _ => usage(),
            }
        }
    }

    opts.mode = mode;
    opts.workload = workload;
    opts.memload = memload;
    opts.extra_arg = extra_arg;
    if mode != RunMode::Chase {
        // Load threads need the request/acknowledge cadence: long warm-up
        // so scheduler migrations settle, and a slower sample request
        // rate so each MiB/s window spans whole passes over the buffer.
        opts.warmup = Duration::from_secs(4);
        opts.sample_period = Duration::from_secs(2);
    }

    Cli {
        opts,
        chase_spec,
        memload_spec,
        print_average,
    }
}

fn print_chase_report(cli: &Cli, report: &Report) {
    let Some(latency) = report.latency else {
        die(&"no latency samples collected");
    };
    let res = if cli.print_average {
        latency.mean
    } else {
        latency.best
    };
    if cli.opts.config.print_timestamp {
        print!("{:.6} ", unix_seconds());
    }
    println!("{}", format_ns(res));
}

fn print_load_report(cli: &Cli, report: &Report) {
    let cfg = cli.opts.config;
    let word = std::mem::size_of::<usize>() as f64;
    let not_used = "--------";

    let (chase_ns, chase_mibps, chase_dev) = match report.latency {
        Some(lat) => {
            if cfg.verbosity > 0 {
                println!(
                    "chase avg={:.3} geo={:.3} best={:.3} worst={:.3}",
                    lat.mean, lat.geomean, lat.best, lat.worst
                );
            }
            let ns = if cli.print_average {
                lat.geomean
            } else {
                lat.best
            };
            let mibps =
                report.nr_chase_threads as f64 * (word / (ns / 1e9) / (1 << 20) as f64);
            (ns, mibps, (lat.worst - lat.best) / lat.mean)
        }
        None => (0.0, 0.0, 0.0),
    };
    let (load_avg, load_max, load_dev) = match report.load {
        Some(load) => {
            if cfg.verbosity > 0 {
                println!(
                    "load avg={:.1} max={:.1} min={:.1} MiB/s",
                    load.mean, load.max, load.min
                );
            }
            (load.mean, load.max, (load.max - load.min) / load.mean)
        }
        None => (0.0, 0.0, 0.0),
    };

    println!(
        "Samples\t, Byte/thd\t, ChaseThds\t, ChaseNS\t, ChaseMibs\t, \
         ChDeviate\t, LoadThds\t, LdMaxMibs\t, LdAvgMibs\t, LdDeviate\t, \
         ChaseArg\t, MemLdArg"
    );
    print!(
        "{:<6}\t, {:<11}\t, {:<8}\t, {:<8.3}\t, {:<8.0}\t, {:<8.3}\t, {:<8.0}\t, \
         {:<8.0}\t, {:<8.0}\t, {:<8.3}",
        report.nr_samples,
        report.bytes_per_thread,
        report.nr_chase_threads,
        chase_ns,
        chase_mibps,
        chase_dev,
        report.nr_load_threads as f64,
        load_max,
        load_avg,
        load_dev,
    );
    let memload_spec = cli.memload_spec.as_deref().unwrap_or(not_used);
    match cli.opts.mode {
        RunMode::ChaseLoaded => println!("\t, {}\t, {}", cli.chase_spec, memload_spec),
        RunMode::Bandwidth => println!("\t, {not_used}\t, {memload_spec}"),
        RunMode::Chase => println!("\t, {}\t, {not_used}", cli.chase_spec),
    }
    if cfg.print_timestamp {
        println!("{:.6}", unix_seconds());
    }
}

fn main() {
    let cli = parse_args();
    let mode = cli.opts.mode;

    let report = match run(cli.opts.clone()) {
        Ok(report) => report,
        Err(err) => die(&err),
    };

    match mode {
        RunMode::Chase => print_chase_report(&cli, &report),
        RunMode::Bandwidth | RunMode::ChaseLoaded => print_load_report(&cli, &report),
    }
    process::exit(0);
}

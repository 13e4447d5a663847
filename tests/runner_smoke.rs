//! End-to-end smoke tests for the runner.
//!
//! These spin real worker threads. Workers never exit by design — they
//! die with the test process — so each test keeps its footprint small and
//! its sampling window short.

use std::time::Duration;

use memlat::chase::kernels::find_workload;
use memlat::load::{default_memload, parse_memload_spec};
use memlat::runner::{run, RunMode, RunOptions};

fn small_opts(workload: &'static str) -> RunOptions {
    let workload = find_workload(workload).expect("registry entry");
    let mut opts = RunOptions::new(workload, default_memload());
    opts.total_memory = 1 << 20;
    opts.stride = 256;
    opts.tlb_locality = 16 * 4096;
    opts.cache_flush_size = 1 << 20;
    opts.nr_samples = 2;
    opts.sample_period = Duration::from_millis(50);
    // CI runners restrict affinity masks unpredictably.
    opts.set_affinity = false;
    opts
}

#[test]
fn single_thread_simple_chase_reports_latency() {
    let report = run(small_opts("simple")).expect("chase run");
    assert_eq!(report.nr_chase_threads, 1);
    assert_eq!(report.nr_load_threads, 0);
    // The discarded warm-up sample must not be counted.
    assert_eq!(report.nr_samples, 2);
    let latency = report.latency.expect("latency stats");
    assert!(latency.best.is_finite() && latency.best > 0.0);
    assert!(latency.mean >= latency.best);
    assert!(latency.worst >= latency.mean);
    assert!(latency.geomean > 0.0);
}

#[test]
fn parallel_chase_runs() {
    let report = run(small_opts("parallel2")).expect("parallel run");
    let latency = report.latency.expect("latency stats");
    assert!(latency.best.is_finite() && latency.best > 0.0);
}

#[test]
fn loaded_latency_reports_both_columns() {
    let mut opts = small_opts("chaseload");
    opts.mode = RunMode::ChaseLoaded;
    opts.memload = parse_memload_spec("memcpy-libc").expect("memload");
    opts.nr_threads = 2;
    opts.nr_samples = 2;
    opts.warmup = Duration::from_millis(100);
    opts.sample_period = Duration::from_millis(200);
    let report = run(opts).expect("loaded run");
    assert_eq!(report.nr_chase_threads, 1);
    assert_eq!(report.nr_load_threads, 1);
    let latency = report.latency.expect("chase column");
    assert!(latency.best.is_finite() && latency.best > 0.0);
    let load = report.load.expect("bandwidth column");
    assert!(load.mean > 0.0);
    assert!(load.max >= load.min);
}

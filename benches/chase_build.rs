//! Chase-construction throughput.
//!
//! Graph building is setup cost, not the measured quantity, but for big
//! arenas it dominates tool start-up; this tracks it per footprint.
//!
//! ```bash
//! cargo bench --bench chase_build
//! ```

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use memlat::arena::{Arena, ArenaSpec};
use memlat::chase::graph::{generate_chase, ChaseArgs};
use memlat::permutation::{Mixer, PermKind};
use memlat::rng::Rng;

fn bench_generate_chase(c: &mut Criterion) {
    let mut group = c.benchmark_group("generate_chase");
    for size in [1usize << 20, 8 << 20, 64 << 20] {
        let stride = 256;
        let nr_mixer_indices = stride / std::mem::size_of::<usize>();
        let arena = Arena::alloc(&ArenaSpec::plain(size)).expect("arena");
        let mut rng = Rng::new(1);
        let args = ChaseArgs {
            base: arena.base(),
            total_memory: size,
            stride,
            tlb_locality: 64 * 4096,
            perm_kind: PermKind::Random,
            nr_mixer_indices,
            mixer: Mixer::generate(&mut rng, PermKind::Random, nr_mixer_indices, 1),
        };
        group.throughput(Throughput::Elements((size / stride) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size >> 20), &args, |b, args| {
            let mut rng = Rng::new(0);
            b.iter(|| unsafe { generate_chase(args, 0, &mut rng) });
        });
    }
    group.finish();
}

fn bench_mixer(c: &mut Criterion) {
    c.bench_function("mixer_16k_slots", |b| {
        b.iter(|| {
            let mut rng = Rng::new(1);
            Mixer::generate(&mut rng, PermKind::Random, 32, 16384)
        });
    });
}

criterion_group!(benches, bench_generate_chase, bench_mixer);
criterion_main!(benches);

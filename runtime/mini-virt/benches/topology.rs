use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use mini_virt::{
    create_gic, find_machine_type, BootCollaborators, CpuModel, CpuSet, MachineOptions, MemoryMap,
    Region, SystemMemory, NUM_IRQS,
};
use std::hint::black_box;

fn bench_possible_cpu_ids(c: &mut Criterion) {
    c.bench_function("possible_cpu_arch_ids/512", |b| {
        b.iter(|| {
            let mut set = CpuSet::new(CpuModel::CortexA57);
            let ids = set.possible_cpu_arch_ids(black_box(512), 512).unwrap();
            black_box(ids.len())
        })
    });
}

fn bench_gic_wiring(c: &mut Criterion) {
    let map = MemoryMap::mini_virt();
    let dist = map.get(Region::GicDist).unwrap();
    let redist = map.get(Region::GicRedist).unwrap();
    let mut group = c.benchmark_group("create_gic");

    for count in [1u32, 16, 123] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let mut set = CpuSet::new(CpuModel::CortexA57);
                let mut sysmem = SystemMemory::new();
                set.build(count, 512).unwrap();
                let gic = create_gic(set.cpus_mut(), NUM_IRQS, dist, redist, &mut sysmem).unwrap();
                black_box(gic.config().num_irq)
            })
        });
    }
    group.finish();
}

fn bench_begin_construction(c: &mut Criterion) {
    let class = find_machine_type("mini-virt").unwrap();

    c.bench_function("begin_construction/4", |b| {
        b.iter(|| {
            let options = MachineOptions {
                cpus: 4,
                ..MachineOptions::default()
            };
            let pending = class
                .begin_construction(options, BootCollaborators::default())
                .unwrap();
            black_box(pending.events().len())
        })
    });
}

criterion_group!(
    benches,
    bench_possible_cpu_ids,
    bench_gic_wiring,
    bench_begin_construction
);
criterion_main!(benches);

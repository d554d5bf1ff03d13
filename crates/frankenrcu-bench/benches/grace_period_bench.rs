//! Grace-period latency benchmarks across tree shapes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use frankenrcu_core::{Flavor, RcuConfig, RcuState};

/// (cpus, fanout) pairs from a single node up to a four-level tree.
const SHAPES: &[(usize, usize)] = &[(4, 64), (16, 4), (64, 4), (256, 4)];

fn engine(cpus: usize, fanout: usize, flavor: Flavor) -> RcuState {
    RcuState::new(
        RcuConfig::with_cpus(cpus, fanout)
            .flavor(flavor)
            .scheduler_active(true)
            .fqs_interval(Duration::from_micros(50)),
    )
    .unwrap()
}

fn bench_synchronize_idle(c: &mut Criterion) {
    let mut group = c.benchmark_group("synchronize_idle");
    for &(cpus, fanout) in SHAPES {
        let rsp = engine(cpus, fanout, Flavor::Preemptible);
        group.bench_with_input(
            BenchmarkId::new(format!("levels_{}", rsp.levels()), cpus),
            &cpus,
            |b, _| b.iter(|| rsp.synchronize()),
        );
    }
    group.finish();
}

fn bench_expedited_idle(c: &mut Criterion) {
    let mut group = c.benchmark_group("synchronize_expedited_idle");
    for flavor in [Flavor::Preemptible, Flavor::Classic] {
        for &(cpus, fanout) in SHAPES {
            let rsp = engine(cpus, fanout, flavor);
            group.bench_with_input(BenchmarkId::new(flavor.as_str(), cpus), &cpus, |b, _| {
                b.iter(|| rsp.synchronize_expedited());
            });
        }
    }
    group.finish();
}

/// Every CPU runs a task and ticks once per grace period.
fn bench_busy_grace_period(c: &mut Criterion) {
    let mut group = c.benchmark_group("grace_period_busy");
    for &(cpus, fanout) in SHAPES {
        let rsp = engine(cpus, fanout, Flavor::Preemptible);
        for cpu in 0..cpus {
            rsp.switch_to(cpu, Some(rsp.spawn_task()));
        }
        group.throughput(Throughput::Elements(cpus as u64));
        group.bench_with_input(BenchmarkId::from_parameter(cpus), &cpus, |b, &n| {
            b.iter(|| {
                rsp.start_grace_period();
                for cpu in 0..n {
                    rsp.check_callbacks(cpu);
                    rsp.process_callbacks(cpu);
                }
                black_box(rsp.batches_completed());
            });
        });
    }
    group.finish();
}

fn bench_call_rcu_barrier(c: &mut Criterion) {
    let batches: &[u64] = &[16, 256];
    let mut group = c.benchmark_group("call_rcu_barrier");
    let rsp = engine(4, 2, Flavor::Preemptible);
    let ran = Arc::new(AtomicU64::new(0));

    for &n in batches {
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                for i in 0..n {
                    let ran = Arc::clone(&ran);
                    rsp.call_rcu((i % 4) as usize, move || {
                        ran.fetch_add(1, Ordering::Relaxed);
                    })
                    .unwrap();
                }
                rsp.barrier();
            });
        });
    }
    group.finish();
    black_box(ran.load(Ordering::Relaxed));
}

criterion_group!(
    benches,
    bench_synchronize_idle,
    bench_expedited_idle,
    bench_busy_grace_period,
    bench_call_rcu_barrier
);
criterion_main!(benches);

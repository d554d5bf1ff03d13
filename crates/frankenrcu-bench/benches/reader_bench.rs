//! Read-side fast path benchmarks.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use frankenrcu_core::{ExecContext, Flavor, RcuConfig, RcuState};

fn engine(flavor: Flavor) -> RcuState {
    RcuState::new(RcuConfig::with_cpus(4, 2).flavor(flavor)).unwrap()
}

fn bench_lock_unlock(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_lock_unlock");
    for flavor in [Flavor::Preemptible, Flavor::Classic] {
        let rsp = engine(flavor);
        let task = rsp.spawn_task();
        rsp.switch_to(0, Some(task.clone()));

        group.bench_function(BenchmarkId::new("explicit", flavor.as_str()), |b| {
            b.iter(|| {
                rsp.read_lock(&task);
                black_box(task.nesting());
                rsp.read_unlock(&task);
            });
        });
        group.bench_function(BenchmarkId::new("guard", flavor.as_str()), |b| {
            b.iter(|| {
                let guard = rsp.read(&task);
                black_box(&guard);
            });
        });
    }
    group.finish();
}

fn bench_nested(c: &mut Criterion) {
    let depths: &[u32] = &[1, 4, 16];
    let mut group = c.benchmark_group("read_nested");
    let rsp = engine(Flavor::Preemptible);
    let task = rsp.spawn_task();
    rsp.switch_to(0, Some(task.clone()));

    for &depth in depths {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &d| {
            b.iter(|| {
                for _ in 0..d {
                    rsp.read_lock(&task);
                }
                for _ in 0..d {
                    rsp.read_unlock(&task);
                }
            });
        });
    }
    group.finish();
}

/// Unlock after the engine asked the reader for a quiescent state: the slow
/// path that reports to the tree.
fn bench_unlock_slow_path(c: &mut Criterion) {
    let rsp = engine(Flavor::Preemptible);
    let task = rsp.spawn_task();
    rsp.switch_to(1, Some(task.clone()));

    c.bench_function("read_unlock_need_qs", |b| {
        b.iter(|| {
            rsp.read_lock(&task);
            rsp.start_grace_period();
            rsp.force_quiescent_state();
            rsp.read_unlock_in(&task, ExecContext::Task);
            rsp.force_quiescent_state();
            black_box(rsp.batches_completed());
        });
    });
}

criterion_group!(benches, bench_lock_unlock, bench_nested, bench_unlock_slow_path);
criterion_main!(benches);

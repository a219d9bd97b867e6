//! Load balancer selection benchmarks: selection must stay single-pass
//! and cheap with four-digit candidate pools.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashSet;
use std::sync::Arc;

use infermesh_core::balancer::LoadBalancer;
use infermesh_core::config::BalancerSettings;
use infermesh_core::metrics::MetricsCollector;
use infermesh_core::types::{ResourceVector, Task, TaskType, Worker, WorkerLoad};

fn pool(size: usize) -> Vec<Worker> {
    (0..size)
        .map(|i| {
            let mut worker = Worker::new(
                format!("worker-{i:04}"),
                format!("10.0.{}.{}:7070", i / 256, i % 256),
                HashSet::from(["gpu".to_string()]),
                ResourceVector {
                    cpu_cores: 16.0,
                    memory_bytes: 64 << 30,
                    gpu_cores: 4.0,
                    gpu_memory_bytes: 24 << 30,
                    disk_bytes: 1 << 40,
                },
            );
            worker.load = WorkerLoad {
                cpu_usage: (i % 97) as f32 / 100.0,
                memory_usage: (i % 89) as f32 / 100.0,
                gpu_usage: 0.0,
                active_tasks: i % 13,
                queued_tasks: 0,
            };
            worker
        })
        .collect()
}

fn balancer(algorithm: &str) -> Arc<LoadBalancer> {
    let settings = BalancerSettings {
        load_balance_algorithm: algorithm.to_string(),
        ..BalancerSettings::default()
    };
    LoadBalancer::new(&settings, Arc::new(MetricsCollector::new().unwrap())).unwrap()
}

fn selection_benchmarks(c: &mut Criterion) {
    let mut task = Task::new(TaskType::Inference, "llama-70b");
    task.requirements.cpu_cores = 2.0;
    task.requirements.gpu_cores = Some(1.0);

    let mut group = c.benchmark_group("selection");
    for algorithm in [
        "round_robin",
        "least_loaded",
        "weighted_round_robin",
        "resource_aware",
        "capability_based",
    ] {
        let balancer = balancer(algorithm);
        for size in [100usize, 1_000] {
            let candidates = pool(size);
            group.bench_with_input(
                BenchmarkId::new(algorithm, size),
                &candidates,
                |b, candidates| {
                    b.iter(|| {
                        let chosen = balancer.select(black_box(&task), black_box(candidates));
                        black_box(chosen).unwrap()
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, selection_benchmarks);
criterion_main!(benches);

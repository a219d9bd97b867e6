//! Property tests for the registry's capability index, the allocator's
//! capacity bound, and the queue's band ordering.

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

use infermesh_core::allocator::ResourceAllocator;
use infermesh_core::config::{QueueSettings, WorkerSettings};
use infermesh_core::metrics::MetricsCollector;
use infermesh_core::queue::{Band, TaskQueue};
use infermesh_core::registry::WorkerRegistry;
use infermesh_core::types::{
    AllocationStatus, ResourceVector, Task, TaskPriority, TaskType, WorkerId,
};
use infermesh_core::messages::WorkerRegistration;

const CAPABILITIES: [&str; 4] = ["gpu", "cpu", "avx512", "nvlink"];

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

#[derive(Debug, Clone)]
enum RegistryOp {
    Register { worker: u8, caps: Vec<u8> },
    Unregister { worker: u8 },
}

fn registry_op() -> impl Strategy<Value = RegistryOp> {
    prop_oneof![
        (0u8..6, proptest::collection::vec(0u8..4, 0..4))
            .prop_map(|(worker, caps)| RegistryOp::Register { worker, caps }),
        (0u8..6).prop_map(|worker| RegistryOp::Unregister { worker }),
    ]
}

fn worker_name(index: u8) -> WorkerId {
    format!("worker-{index}")
}

fn registration(worker: u8, caps: &[u8]) -> WorkerRegistration {
    WorkerRegistration {
        worker_id: worker_name(worker),
        address: "10.0.0.1:7000".to_string(),
        capabilities: caps
            .iter()
            .map(|c| CAPABILITIES[*c as usize].to_string())
            .collect(),
        total_capacity: ResourceVector {
            cpu_cores: 8.0,
            memory_bytes: 8 << 30,
            ..ResourceVector::zero()
        },
    }
}

proptest! {
    /// For any sequence of register/unregister, every posting list holds
    /// exactly the currently-registered workers declaring that capability.
    #[test]
    fn capability_index_stays_exact(ops in proptest::collection::vec(registry_op(), 1..40)) {
        runtime().block_on(async move {
            let registry = WorkerRegistry::new(WorkerSettings::default());
            for op in ops {
                match op {
                    RegistryOp::Register { worker, caps } => {
                        registry.register(registration(worker, &caps)).await.unwrap();
                    }
                    RegistryOp::Unregister { worker } => {
                        let _ = registry.unregister(&worker_name(worker)).await;
                    }
                }
            }

            let workers = registry.list().await;
            for capability in CAPABILITIES {
                let posted: HashSet<WorkerId> = registry
                    .by_capability(capability)
                    .await
                    .into_iter()
                    .map(|w| w.id)
                    .collect();
                let declared: HashSet<WorkerId> = workers
                    .iter()
                    .filter(|w| w.capabilities.contains(capability))
                    .map(|w| w.id.clone())
                    .collect();
                prop_assert_eq!(posted, declared);
            }
            Ok(())
        })?;
    }

    /// Register then unregister leaves the registry and the capability
    /// index exactly as they were.
    #[test]
    fn register_unregister_round_trips(
        existing in proptest::collection::vec(
            (0u8..4, proptest::collection::vec(0u8..4, 0..3)), 0..4),
        caps in proptest::collection::vec(0u8..4, 0..4),
    ) {
        runtime().block_on(async move {
            let registry = WorkerRegistry::new(WorkerSettings::default());
            for (worker, caps) in existing {
                registry.register(registration(worker, &caps)).await.unwrap();
            }

            let before_workers: HashSet<WorkerId> =
                registry.list().await.into_iter().map(|w| w.id).collect();
            let mut before_index = Vec::new();
            for capability in CAPABILITIES {
                let mut posted: Vec<WorkerId> = registry
                    .by_capability(capability)
                    .await
                    .into_iter()
                    .map(|w| w.id)
                    .collect();
                posted.sort();
                before_index.push(posted);
            }

            // the probe id is outside the existing worker id space
            registry.register(registration(99, &caps)).await.unwrap();
            registry.unregister(&worker_name(99)).await.unwrap();

            let after_workers: HashSet<WorkerId> =
                registry.list().await.into_iter().map(|w| w.id).collect();
            prop_assert_eq!(before_workers, after_workers);
            for (i, capability) in CAPABILITIES.iter().enumerate() {
                let mut posted: Vec<WorkerId> = registry
                    .by_capability(capability)
                    .await
                    .into_iter()
                    .map(|w| w.id)
                    .collect();
                posted.sort();
                prop_assert_eq!(&before_index[i], &posted);
            }
            Ok(())
        })?;
    }
}

#[derive(Debug, Clone)]
enum AllocatorOp {
    Reserve { task: u8, worker: u8, cpu: u8, gpu: u8 },
    Release { task: u8 },
}

fn allocator_op() -> impl Strategy<Value = AllocatorOp> {
    prop_oneof![
        (0u8..8, 0u8..3, 1u8..9, 0u8..3).prop_map(|(task, worker, cpu, gpu)| {
            AllocatorOp::Reserve { task, worker, cpu, gpu }
        }),
        (0u8..8).prop_map(|task| AllocatorOp::Release { task }),
    ]
}

fn task_uuid(index: u8) -> uuid::Uuid {
    uuid::Uuid::from_u128(0x5eed_0000_0000_0000_0000_0000_0000_0000 + index as u128)
}

proptest! {
    /// For any sequence of reserve/release, no worker's active total ever
    /// exceeds its capacity on any axis, and release stays idempotent.
    #[test]
    fn reservations_never_over_commit(ops in proptest::collection::vec(allocator_op(), 1..60)) {
        runtime().block_on(async move {
            let allocator = ResourceAllocator::new();
            let capacity = ResourceVector {
                cpu_cores: 8.0,
                memory_bytes: 16 << 30,
                gpu_cores: 2.0,
                gpu_memory_bytes: 8 << 30,
                disk_bytes: 100 << 30,
            };

            for op in ops {
                match op {
                    AllocatorOp::Reserve { task, worker, cpu, gpu } => {
                        let requested = ResourceVector {
                            cpu_cores: cpu as f64,
                            memory_bytes: 1 << 28,
                            gpu_cores: gpu as f64,
                            ..ResourceVector::zero()
                        };
                        let _ = allocator
                            .reserve(task_uuid(task), &worker_name(worker), requested, capacity)
                            .await;
                    }
                    AllocatorOp::Release { task } => {
                        let first = allocator
                            .release(task_uuid(task), AllocationStatus::Completed, None)
                            .await;
                        let second = allocator
                            .release(task_uuid(task), AllocationStatus::Completed, None)
                            .await;
                        prop_assert!(!(first && second), "double release must be a no-op");
                    }
                }

                for worker in 0u8..3 {
                    let active = allocator.active_for(&worker_name(worker)).await;
                    prop_assert!(active.fits_within(&capacity),
                        "worker {} over-committed: {:?}", worker, active);
                }
            }
            Ok(())
        })?;
    }
}

#[derive(Debug, Clone, Copy)]
enum AnyPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl From<AnyPriority> for TaskPriority {
    fn from(p: AnyPriority) -> TaskPriority {
        match p {
            AnyPriority::Low => TaskPriority::Low,
            AnyPriority::Normal => TaskPriority::Normal,
            AnyPriority::High => TaskPriority::High,
            AnyPriority::Critical => TaskPriority::Critical,
        }
    }
}

fn any_priority() -> impl Strategy<Value = AnyPriority> {
    prop_oneof![
        Just(AnyPriority::Low),
        Just(AnyPriority::Normal),
        Just(AnyPriority::High),
        Just(AnyPriority::Critical),
    ]
}

proptest! {
    /// The first dequeue always comes from the highest non-empty band, in
    /// FIFO order within that band, regardless of the enqueue mix.
    #[test]
    fn dequeue_respects_band_order(priorities in proptest::collection::vec(any_priority(), 1..20)) {
        runtime().block_on(async move {
            let queue = TaskQueue::new(
                QueueSettings {
                    max_queue_size: 100,
                    ..QueueSettings::default()
                },
                Arc::new(MetricsCollector::new().unwrap()),
            );

            let mut by_band: Vec<Vec<uuid::Uuid>> = vec![Vec::new(); 3];
            for priority in &priorities {
                let mut task = Task::new(TaskType::Inference, "llama-7b");
                task.priority = (*priority).into();
                let band = match Band::for_priority(task.priority) {
                    Band::High => 0,
                    Band::Normal => 1,
                    Band::Low => 2,
                };
                by_band[band].push(task.id);
                queue.enqueue(task).await.unwrap();
            }

            let expected = by_band
                .iter()
                .find(|band| !band.is_empty())
                .map(|band| band[0])
                .unwrap();
            let first = queue.dequeue().await.unwrap().unwrap();
            prop_assert_eq!(first.id, expected);

            // the queue size invariant holds after the dequeue
            prop_assert_eq!(
                queue.len(),
                queue.band_len(Band::High)
                    + queue.band_len(Band::Normal)
                    + queue.band_len(Band::Low)
            );
            Ok(())
        })?;
    }
}

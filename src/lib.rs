//! InferMesh scheduler core — distributed inference scheduling for a
//! multi-node LLM serving cluster.
//!
//! The core decides, for each incoming inference request, which worker
//! node(s) execute it and how the model's compute is partitioned across
//! them, while preserving liveness under node failures and bounded
//! queueing under load.
//!
//! ## Components
//!
//! - **[`manager::SchedulerManager`]**: lifecycle, leader gating, and the
//!   scheduling loops
//! - **[`queue::TaskQueue`]**: priority-classed bounded queue
//! - **[`registry::WorkerRegistry`]**: worker lifecycle, capability index,
//!   health sweeps
//! - **[`balancer::LoadBalancer`]**: worker selection under five algorithms
//! - **[`planner::PartitionPlanner`]**: strategy selection and plan
//!   synthesis
//! - **[`tracker::TaskTracker`]**: in-flight state, timeouts, result fan-in
//! - **[`advisor::AdaptiveAdvisor`]**: pattern-based learning and
//!   recommendation
//! - **[`allocator::ResourceAllocator`]**: reservation bookkeeping
//!
//! ## Control flow per request
//!
//! ```text
//! enqueue → (leader) dequeue → advisor → planner → balancer → reserve
//!        → track → dispatch → execute → result/timeout → release → learn
//! ```
//!
//! The consensus engine and the P2P transport are consumed through the
//! narrow contracts in [`consensus`] and [`transport`]; process-local
//! implementations of both ship for standalone deployments and tests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use infermesh_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SchedulerConfig::load()?;
//!     let consensus = Arc::new(LocalConsensus::new("scheduler-0"));
//!     let transport = Arc::new(LoopbackTransport::new());
//!     let manager = SchedulerManager::new(config, consensus, transport)?;
//!     manager.start().await?;
//!
//!     let task = Task::new(TaskType::Inference, "llama-7b");
//!     let task_id = manager.schedule(task).await?;
//!     println!("queued {task_id}");
//!
//!     manager.stop().await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod advisor;
pub mod allocator;
pub mod balancer;
pub mod config;
pub mod consensus;
pub mod manager;
pub mod messages;
pub mod metrics;
pub mod planner;
pub mod queue;
pub mod registry;
pub mod tracker;
pub mod transport;
pub mod types;

/// Version of the scheduler core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types, re-exported for convenience.
pub mod prelude {
    pub use crate::advisor::{AdaptiveAdvisor, PerformanceRecord, StrategyAdvice};
    pub use crate::allocator::ResourceAllocator;
    pub use crate::balancer::{BalanceAlgorithm, LoadBalancer};
    pub use crate::config::SchedulerConfig;
    pub use crate::consensus::{ClusterEvent, ConsensusHandle, LocalConsensus};
    pub use crate::manager::{
        CancelStatus, ManagerState, SchedulerManager, SchedulerMetrics, SchedulerState,
    };
    pub use crate::messages::{
        topics, Envelope, TaskAssignment, WorkerHeartbeat, WorkerRegistration,
    };
    pub use crate::metrics::{MetricsCollector, MetricsSnapshot};
    pub use crate::planner::{PartitionPlanner, PartitionStrategy};
    pub use crate::queue::TaskQueue;
    pub use crate::registry::WorkerRegistry;
    pub use crate::tracker::{TaskTracker, TrackedTask};
    pub use crate::transport::{LoopbackTransport, Transport};
    pub use crate::types::{
        PartitionPlan, ResourceRequirements, ResourceVector, SchedulerError, SchedulerResult,
        StrategyKind, Task, TaskPriority, TaskResult, TaskStatus, TaskType, Worker, WorkerId,
        WorkerStatus,
    };
}

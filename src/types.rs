//! Core type definitions for the scheduler core.
//!
//! This module defines the canonical data structures shared across the
//! scheduling pipeline: tasks and their lifecycle, workers and their
//! capacities, partition plans, resource allocations, and terminal results.
//! Every concept has exactly one definition here; component modules add only
//! their private bookkeeping types.
//!
//! All types serialize with serde for replication and cross-node messaging.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Unique identifier for tasks in the scheduling system
pub type TaskId = Uuid;

/// Stable peer identity of a worker node.
///
/// Worker ids are opaque strings handed to us by the transport layer.
/// They are totally ordered lexicographically, which every selection
/// algorithm uses as its deterministic tie-break.
pub type WorkerId = String;

/// Workload category of a task.
///
/// The task type participates in strategy selection and in the advisor's
/// pattern keys, so the wire names are stable identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Forward-pass inference over a loaded model
    Inference,
    /// Embedding extraction
    Embedding,
    /// Classification over a fixed label set
    Classification,
    /// Autoregressive generation
    Generation,
    /// Training or fine-tuning work (accepted but out of scheduling scope)
    Training,
    /// Caller-defined workload
    Custom,
}

impl TaskType {
    /// Stable identifier used in metrics labels and advisor pattern keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Inference => "inference",
            TaskType::Embedding => "embedding",
            TaskType::Classification => "classification",
            TaskType::Generation => "generation",
            TaskType::Training => "training",
            TaskType::Custom => "custom",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority classes for task scheduling.
///
/// Higher values are dequeued first. `Critical` and `High` share the high
/// queue band; `Normal` and `Low` each get their own band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Background work that can wait
    Low = 1,
    /// Standard priority for regular requests
    Normal = 5,
    /// Latency-sensitive requests
    High = 8,
    /// Must-run work that preempts queue order
    Critical = 10,
}

impl Ord for TaskPriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

impl PartialOrd for TaskPriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not yet accepted by the queue
    Pending,
    /// Waiting in a queue band
    Queued,
    /// Assigned to a worker, dispatch in flight
    Scheduled,
    /// Executing on a worker
    Running,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Cancelled before completion
    Cancelled,
    /// Failed transiently and re-entering the queue
    Retrying,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// One resource axis tracked by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAxis {
    /// CPU cores
    Cpu,
    /// Main memory in bytes
    Memory,
    /// GPU compute units
    Gpu,
    /// GPU memory in bytes
    GpuMemory,
    /// Disk in bytes
    Disk,
}

impl fmt::Display for ResourceAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceAxis::Cpu => "cpu",
            ResourceAxis::Memory => "memory",
            ResourceAxis::Gpu => "gpu",
            ResourceAxis::GpuMemory => "gpu_memory",
            ResourceAxis::Disk => "disk",
        };
        f.write_str(name)
    }
}

/// A quantity along all five resource axes.
///
/// Used uniformly for worker capacity, task requirements, and reservation
/// accounting so that capacity math is written once.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceVector {
    /// CPU cores (fractional cores allowed)
    pub cpu_cores: f64,
    /// Main memory in bytes
    pub memory_bytes: u64,
    /// GPU compute units (fractional allowed)
    pub gpu_cores: f64,
    /// GPU memory in bytes
    pub gpu_memory_bytes: u64,
    /// Disk in bytes
    pub disk_bytes: u64,
}

impl ResourceVector {
    /// The zero vector.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Component-wise addition.
    pub fn add(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_cores: self.cpu_cores + other.cpu_cores,
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            gpu_cores: self.gpu_cores + other.gpu_cores,
            gpu_memory_bytes: self.gpu_memory_bytes.saturating_add(other.gpu_memory_bytes),
            disk_bytes: self.disk_bytes.saturating_add(other.disk_bytes),
        }
    }

    /// Component-wise saturating subtraction.
    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_cores: (self.cpu_cores - other.cpu_cores).max(0.0),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            gpu_cores: (self.gpu_cores - other.gpu_cores).max(0.0),
            gpu_memory_bytes: self
                .gpu_memory_bytes
                .saturating_sub(other.gpu_memory_bytes),
            disk_bytes: self.disk_bytes.saturating_sub(other.disk_bytes),
        }
    }

    /// Returns the first axis on which `self` exceeds `capacity`, in the
    /// fixed order cpu, memory, gpu, gpu_memory, disk. `None` means the
    /// vector fits.
    pub fn first_exceeded_axis(&self, capacity: &ResourceVector) -> Option<ResourceAxis> {
        if self.cpu_cores > capacity.cpu_cores {
            Some(ResourceAxis::Cpu)
        } else if self.memory_bytes > capacity.memory_bytes {
            Some(ResourceAxis::Memory)
        } else if self.gpu_cores > capacity.gpu_cores {
            Some(ResourceAxis::Gpu)
        } else if self.gpu_memory_bytes > capacity.gpu_memory_bytes {
            Some(ResourceAxis::GpuMemory)
        } else if self.disk_bytes > capacity.disk_bytes {
            Some(ResourceAxis::Disk)
        } else {
            None
        }
    }

    /// Whether the vector fits entirely within `capacity`.
    pub fn fits_within(&self, capacity: &ResourceVector) -> bool {
        self.first_exceeded_axis(capacity).is_none()
    }

    /// Whether any axis is negative or non-finite. Requirements carrying
    /// such values are rejected as invalid before queueing.
    pub fn is_malformed(&self) -> bool {
        !self.cpu_cores.is_finite()
            || self.cpu_cores < 0.0
            || !self.gpu_cores.is_finite()
            || self.gpu_cores < 0.0
    }
}

/// Resource requirements declared by a task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceRequirements {
    /// CPU cores needed
    pub cpu_cores: f64,
    /// Main memory needed in bytes
    pub memory_bytes: u64,
    /// Disk needed in bytes
    pub disk_bytes: u64,
    /// GPU compute units needed, if any
    pub gpu_cores: Option<f64>,
    /// GPU memory needed in bytes, if any
    pub gpu_memory_bytes: Option<u64>,
    /// Hardware features the executing worker must declare (e.g. "gpu",
    /// "avx512")
    pub required_features: Vec<String>,
}

impl ResourceRequirements {
    /// The requirements as a reservation vector.
    pub fn to_vector(&self) -> ResourceVector {
        ResourceVector {
            cpu_cores: self.cpu_cores,
            memory_bytes: self.memory_bytes,
            gpu_cores: self.gpu_cores.unwrap_or(0.0),
            gpu_memory_bytes: self.gpu_memory_bytes.unwrap_or(0),
            disk_bytes: self.disk_bytes,
        }
    }
}

/// Placement constraints declared by a task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskConstraints {
    /// Hard cap on execution time in seconds
    pub max_execution_time_secs: Option<u64>,
    /// Workers to prefer when scores tie
    pub preferred_workers: Vec<WorkerId>,
    /// Workers that must not be selected
    pub excluded_workers: Vec<WorkerId>,
    /// Capabilities the worker must declare
    pub required_capabilities: Vec<String>,
    /// Free-form locality hint (e.g. a zone name)
    pub locality_hint: Option<String>,
}

/// A unit of scheduled work.
///
/// A task is exclusively owned by the queue until dequeued, then by the
/// tracker until it reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable identity, unique across the cluster
    pub id: TaskId,
    /// Workload category
    pub task_type: TaskType,
    /// Queue priority class
    pub priority: TaskPriority,
    /// Name of the model this task runs against
    pub model_name: String,
    /// Opaque request payload
    pub payload: serde_json::Value,
    /// Resources the task needs reserved before dispatch
    pub requirements: ResourceRequirements,
    /// Placement constraints
    pub constraints: TaskConstraints,
    /// Remaining retry budget consumed by transient failures
    pub max_retries: u32,
    /// Retries consumed so far
    pub retry_count: u32,
    /// Wall-clock deadline after which the task is expelled
    pub deadline: Option<SystemTime>,
    /// Free-form metadata (may override the balance algorithm via
    /// `balance_algorithm`)
    pub metadata: HashMap<String, String>,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Creation timestamp
    pub created_at: SystemTime,
    /// When the task entered its queue band
    pub enqueued_at: Option<SystemTime>,
    /// When a worker and plan were chosen
    pub scheduled_at: Option<SystemTime>,
    /// When the worker reported execution start
    pub started_at: Option<SystemTime>,
    /// When the task reached a terminal status
    pub completed_at: Option<SystemTime>,
}

impl Task {
    /// Create a task with defaults suitable for most callers.
    pub fn new<M: Into<String>>(task_type: TaskType, model_name: M) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            priority: TaskPriority::Normal,
            model_name: model_name.into(),
            payload: serde_json::Value::Null,
            requirements: ResourceRequirements::default(),
            constraints: TaskConstraints::default(),
            max_retries: 3,
            retry_count: 0,
            deadline: None,
            metadata: HashMap::new(),
            status: TaskStatus::Pending,
            created_at: SystemTime::now(),
            enqueued_at: None,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether the task's deadline has elapsed at `now`.
    pub fn deadline_elapsed(&self, now: SystemTime) -> bool {
        matches!(self.deadline, Some(d) if now >= d)
    }

    /// Whether the retry budget still has room for one more attempt.
    pub fn retry_budget_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Availability status of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Connected and accepting work
    Online,
    /// Connected with no active tasks
    Idle,
    /// Connected and at or near task capacity
    Busy,
    /// Missed its heartbeat window
    Offline,
    /// Administratively drained
    Maintenance,
    /// Reported an unrecoverable fault
    Error,
}

impl WorkerStatus {
    /// Whether a worker in this status may receive new assignments.
    pub fn accepts_work(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Online | WorkerStatus::Idle | WorkerStatus::Busy
        )
    }
}

/// Live load indicators reported by a worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct WorkerLoad {
    /// CPU utilization in [0, 1]
    pub cpu_usage: f32,
    /// Memory utilization in [0, 1]
    pub memory_usage: f32,
    /// GPU utilization in [0, 1]
    pub gpu_usage: f32,
    /// Tasks currently executing
    pub active_tasks: usize,
    /// Tasks queued locally on the worker
    pub queued_tasks: usize,
}

/// A compute node that executes assigned tasks.
///
/// Workers are shared state; only the registry mutates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Stable peer identity
    pub id: WorkerId,
    /// Network address the transport dials
    pub address: String,
    /// Availability status
    pub status: WorkerStatus,
    /// Declared capabilities used for hard filtering
    pub capabilities: HashSet<String>,
    /// Total capacity along all axes
    pub total_capacity: ResourceVector,
    /// Capacity currently available (total minus the worker's own view of
    /// usage, refreshed by heartbeats)
    pub available_capacity: ResourceVector,
    /// Live load indicators
    pub load: WorkerLoad,
    /// Health score in [0, 1]; decreases with missed heartbeats and with
    /// observed failure rate
    pub health_score: f64,
    /// Tasks completed successfully over the worker's lifetime
    pub tasks_completed: u64,
    /// Tasks failed over the worker's lifetime
    pub tasks_failed: u64,
    /// Rolling mean completion time in milliseconds
    pub avg_completion_ms: f64,
    /// Last heartbeat or load update
    pub last_seen: SystemTime,
}

impl Worker {
    /// Create a worker in `Idle` status with full availability.
    pub fn new<I, A>(id: I, address: A, capabilities: HashSet<String>, capacity: ResourceVector) -> Self
    where
        I: Into<WorkerId>,
        A: Into<String>,
    {
        Self {
            id: id.into(),
            address: address.into(),
            status: WorkerStatus::Idle,
            capabilities,
            total_capacity: capacity,
            available_capacity: capacity,
            load: WorkerLoad::default(),
            health_score: 1.0,
            tasks_completed: 0,
            tasks_failed: 0,
            avg_completion_ms: 0.0,
            last_seen: SystemTime::now(),
        }
    }

    /// Whether the worker declares every capability in `required`.
    pub fn has_capabilities<'a, I>(&self, required: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        required.into_iter().all(|c| self.capabilities.contains(c))
    }

    /// The worker's rolling failure ratio in [0, 1].
    pub fn failure_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            0.0
        } else {
            self.tasks_failed as f64 / total as f64
        }
    }

    /// Fold one completed task into the rolling statistics.
    pub fn record_outcome(&mut self, success: bool, duration: Duration) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        let total = (self.tasks_completed + self.tasks_failed) as f64;
        let ms = duration.as_secs_f64() * 1000.0;
        self.avg_completion_ms += (ms - self.avg_completion_ms) / total;
    }
}

/// Status of a resource reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// Reserved, dispatch not yet confirmed
    Pending,
    /// Reserved and backing a running task
    Active,
    /// Released after successful completion
    Completed,
    /// Released after failure
    Failed,
    /// Released by preemption or reconciliation
    Preempted,
}

impl AllocationStatus {
    /// Whether this allocation still counts against worker capacity.
    pub fn holds_capacity(&self) -> bool {
        matches!(self, AllocationStatus::Pending | AllocationStatus::Active)
    }
}

/// Observed resource consumption reported at task completion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ResourceUsage {
    /// CPU time consumed in seconds
    pub cpu_seconds: f64,
    /// Peak memory in bytes
    pub memory_peak_bytes: u64,
    /// GPU time consumed in seconds
    pub gpu_seconds: f64,
    /// Bytes transmitted
    pub network_tx_bytes: u64,
    /// Bytes received
    pub network_rx_bytes: u64,
}

/// An accounting entry linking a task to resources reserved on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// Allocation identity
    pub id: Uuid,
    /// Task the reservation backs
    pub task_id: TaskId,
    /// Worker whose capacity is claimed
    pub worker_id: WorkerId,
    /// Reserved quantity on each axis
    pub reserved: ResourceVector,
    /// Reservation status
    pub status: AllocationStatus,
    /// Actual usage telemetry, filled at release
    pub actual_usage: Option<ResourceUsage>,
    /// Creation timestamp
    pub created_at: SystemTime,
    /// Last status change
    pub updated_at: SystemTime,
}

/// Named partitioning technique.
///
/// The snake_case serializations are stable identifiers used as metrics
/// labels and advisor pattern keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Resolves to a concrete strategy at plan time via the advisor
    Adaptive,
    /// Attention heads split across workers
    AttentionParallelism,
    /// N equal data shards, no inter-dependencies
    DataSplit,
    /// Composed plan combining data shards with layer chains
    Hybrid,
    /// One partition per layer group, chained by dependency
    Layerwise,
    /// Stages chained across nodes, each dependent on the previous
    PipelineParallelism,
    /// Sequence chunks chained for long-context work
    SequenceParallelism,
    /// Independent sub-task partitions
    TaskParallelism,
    /// Per-tensor shards with no intra-stage dependencies
    TensorParallelism,
}

impl StrategyKind {
    /// Stable identifier, identical to the serde form.
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Adaptive => "adaptive",
            StrategyKind::AttentionParallelism => "attention_parallelism",
            StrategyKind::DataSplit => "data_split",
            StrategyKind::Hybrid => "hybrid",
            StrategyKind::Layerwise => "layerwise",
            StrategyKind::PipelineParallelism => "pipeline_parallelism",
            StrategyKind::SequenceParallelism => "sequence_parallelism",
            StrategyKind::TaskParallelism => "task_parallelism",
            StrategyKind::TensorParallelism => "tensor_parallelism",
        }
    }

    /// All concrete strategies, in stable alphabetical order. `Adaptive`
    /// is excluded because it only resolves to one of the others.
    pub fn concrete() -> &'static [StrategyKind] {
        &[
            StrategyKind::AttentionParallelism,
            StrategyKind::DataSplit,
            StrategyKind::Hybrid,
            StrategyKind::Layerwise,
            StrategyKind::PipelineParallelism,
            StrategyKind::SequenceParallelism,
            StrategyKind::TaskParallelism,
            StrategyKind::TensorParallelism,
        ]
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adaptive" => Ok(StrategyKind::Adaptive),
            "attention_parallelism" => Ok(StrategyKind::AttentionParallelism),
            "data_split" => Ok(StrategyKind::DataSplit),
            "hybrid" => Ok(StrategyKind::Hybrid),
            "layerwise" => Ok(StrategyKind::Layerwise),
            "pipeline_parallelism" => Ok(StrategyKind::PipelineParallelism),
            "sequence_parallelism" => Ok(StrategyKind::SequenceParallelism),
            "task_parallelism" => Ok(StrategyKind::TaskParallelism),
            "tensor_parallelism" => Ok(StrategyKind::TensorParallelism),
            other => Err(SchedulerError::Configuration(format!(
                "unknown partition strategy: {other}"
            ))),
        }
    }
}

/// Type tag of one partition within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionType {
    /// A contiguous range of model layers
    LayerRange,
    /// A shard of a wide tensor
    TensorShard,
    /// One stage of a pipeline
    PipelineStage,
    /// One shard of the input batch
    DataShard,
    /// A slice of attention heads
    AttentionSlice,
    /// A window of the input sequence
    SequenceWindow,
    /// An independent sub-task
    SubTask,
}

/// One piece of a model's compute, targeted at a specific worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    /// Position within the plan; dependency references index into the
    /// plan's partition list
    pub index: usize,
    /// Worker chosen to execute this partition
    pub worker_id: WorkerId,
    /// Partition type tag
    pub kind: PartitionType,
    /// Opaque shard descriptor the worker interprets
    pub shard: serde_json::Value,
    /// Indices of partitions that must emit before this one starts
    pub depends_on: Vec<usize>,
    /// Resources this partition reserves on its worker
    pub resources: ResourceVector,
    /// Estimated latency contribution in milliseconds
    pub estimated_latency_ms: f64,
    /// Estimated memory footprint in bytes
    pub estimated_memory_bytes: u64,
}

/// A named strategy plus an ordered list of partitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionPlan {
    /// Plan identity
    pub id: Uuid,
    /// Task the plan partitions
    pub task_id: TaskId,
    /// Strategy that produced the plan
    pub strategy: StrategyKind,
    /// Ordered partitions; dependencies reference earlier indices only
    pub partitions: Vec<Partition>,
    /// Critical-path latency estimate over the dependency DAG, ms
    pub estimated_latency_ms: f64,
    /// Sum of partition memory estimates in bytes
    pub estimated_memory_bytes: u64,
    /// Synthesis timestamp
    pub created_at: SystemTime,
}

impl PartitionPlan {
    /// Distinct workers the plan places partitions on.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .partitions
            .iter()
            .map(|p| p.worker_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Timing and outcome measurements for one completed assignment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// When the worker began executing
    pub started_at: SystemTime,
    /// When the terminal status was recorded
    pub finished_at: SystemTime,
    /// Total wall time from enqueue to terminal, ms
    pub duration_ms: f64,
    /// Time spent waiting in the queue, ms
    pub queue_time_ms: f64,
    /// Time spent executing, ms
    pub execution_time_ms: f64,
    /// Whether the task succeeded
    pub success: bool,
    /// Transient errors observed along the way (retries, dispatch failures)
    pub error_count: u32,
}

/// Terminal outcome of a tracked task, published on the results channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task identity
    pub task_id: TaskId,
    /// Worker that held the final assignment
    pub worker_id: WorkerId,
    /// Terminal status
    pub status: TaskStatus,
    /// Output payload on success
    pub payload: Option<serde_json::Value>,
    /// Human-readable reason on failure
    pub error: Option<String>,
    /// Timing and outcome measurements
    pub metrics: ExecutionMetrics,
    /// Completion timestamp
    pub completed_at: SystemTime,
}

/// Model characteristics the planner needs for strategy applicability.
///
/// Derived from the model name plus well-known metadata hints; absent
/// hints fall back to family defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Full model name as submitted
    pub name: String,
    /// Coarse family used in advisor pattern keys (e.g. "bert" for
    /// "bert-base")
    pub family: String,
    /// Transformer layer count
    pub layer_count: u32,
    /// Hidden dimension of the widest layer
    pub hidden_size: u32,
    /// Attention head count
    pub attention_heads: u32,
    /// Maximum context length in tokens
    pub context_length: u32,
}

impl ModelProfile {
    /// Extract the model family from a model name: the leading token up to
    /// the first `-`, `:`, `/`, or `.`.
    pub fn family_of(name: &str) -> String {
        name.split(['-', ':', '/', '.'])
            .next()
            .unwrap_or(name)
            .to_ascii_lowercase()
    }

    /// Build a profile from a task, reading `model_layers`, `model_hidden`,
    /// `model_heads`, and `model_context` metadata hints when present.
    pub fn from_task(task: &Task) -> Self {
        let hint = |key: &str, default: u32| -> u32 {
            task.metadata
                .get(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            name: task.model_name.clone(),
            family: Self::family_of(&task.model_name),
            layer_count: hint("model_layers", 24),
            hidden_size: hint("model_hidden", 2048),
            attention_heads: hint("model_heads", 16),
            context_length: hint("model_context", 4096),
        }
    }
}

/// Canonical error type for scheduler operations.
///
/// User-visible failures carry the task id, the kind, the last worker if
/// any, and a human-readable reason; internal detail never crosses the
/// interface boundary.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Task rejected before queueing; never retried
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// The target queue band was full for the whole enqueue deadline
    #[error("queue full")]
    QueueFull,

    /// The queue has been shut down
    #[error("queue stopped")]
    QueueStopped,

    /// No worker passed capability and constraint prefilters
    #[error("no suitable worker for task {task_id}")]
    NoSuitableWorker {
        /// Task that could not be placed
        task_id: TaskId,
    },

    /// Reservation raced with another allocation; transient
    #[error("reservation conflict on {axis} for worker {worker_id}")]
    ReservationConflict {
        /// Worker whose capacity was contended
        worker_id: WorkerId,
        /// First saturated axis
        axis: ResourceAxis,
    },

    /// The transport could not deliver an assignment
    #[error("dispatch to {worker_id} failed: {reason}")]
    DispatchFailed {
        /// Intended recipient
        worker_id: WorkerId,
        /// Transport-level reason
        reason: String,
    },

    /// Dispatch retries were exhausted
    #[error("delivery failed for task {task_id} after {attempts} attempts")]
    DeliveryFailed {
        /// Task whose assignment could not be delivered
        task_id: TaskId,
        /// Attempts made
        attempts: u32,
    },

    /// The tracker expired an assignment
    #[error("task timeout")]
    TaskTimeout,

    /// The assigned worker went offline mid-execution
    #[error("worker {worker_id} offline during execution")]
    WorkerOffline {
        /// Worker that disappeared
        worker_id: WorkerId,
    },

    /// The task's deadline elapsed before it could run
    #[error("deadline exceeded for task {task_id}")]
    DeadlineExceeded {
        /// Expired task
        task_id: TaskId,
    },

    /// The pool cannot host the plan
    #[error("plan infeasible: {axis} saturated")]
    Infeasible {
        /// First axis that saturated
        axis: ResourceAxis,
    },

    /// Operation requires leadership this node does not hold
    #[error("not the leader")]
    NotLeader,

    /// Leadership was lost while an operation was in flight
    #[error("leadership lost")]
    LeaderLost,

    /// Referenced task or worker does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// "task" or "worker"
        kind: &'static str,
        /// Identity that failed to resolve
        id: String,
    },

    /// Cancellation raced with completion
    #[error("task {task_id} already completed")]
    AlreadyCompleted {
        /// Completed task
        task_id: TaskId,
    },

    /// The scheduler is shutting down
    #[error("scheduler shutting down")]
    Shutdown,

    /// Invalid configuration detected at startup
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Consensus engine error
    #[error("consensus error: {0}")]
    Consensus(String),

    /// Unexpected internal condition
    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Whether the manager should re-queue the task rather than fail it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedulerError::NoSuitableWorker { .. }
                | SchedulerError::ReservationConflict { .. }
                | SchedulerError::DispatchFailed { .. }
                | SchedulerError::TaskTimeout
                | SchedulerError::WorkerOffline { .. }
                | SchedulerError::Infeasible { .. }
        )
    }
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Validate a task before it is accepted into the queue.
///
/// Rejections here are permanent: the caller gets `InvalidTask` and the
/// task is never retried.
pub fn validate_task(task: &Task) -> SchedulerResult<()> {
    if task.id.is_nil() {
        return Err(SchedulerError::InvalidTask("task id is nil".to_string()));
    }
    if task.model_name.trim().is_empty() {
        return Err(SchedulerError::InvalidTask(
            "model name is empty".to_string(),
        ));
    }
    let vector = task.requirements.to_vector();
    if vector.is_malformed() {
        return Err(SchedulerError::InvalidTask(
            "resource requirements are negative or non-finite".to_string(),
        ));
    }
    if let Some(gpu) = task.requirements.gpu_cores {
        if !gpu.is_finite() || gpu < 0.0 {
            return Err(SchedulerError::InvalidTask(
                "gpu requirement is negative or non-finite".to_string(),
            ));
        }
    }
    if task
        .constraints
        .max_execution_time_secs
        .is_some_and(|secs| secs == 0)
    {
        return Err(SchedulerError::InvalidTask(
            "max execution time must be positive".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn resource_vector_first_exceeded_axis_order() {
        let capacity = ResourceVector {
            cpu_cores: 8.0,
            memory_bytes: 1 << 30,
            gpu_cores: 2.0,
            gpu_memory_bytes: 1 << 30,
            disk_bytes: 1 << 34,
        };
        let fits = ResourceVector {
            cpu_cores: 4.0,
            memory_bytes: 1 << 20,
            ..ResourceVector::zero()
        };
        assert!(fits.fits_within(&capacity));

        let too_much_gpu = ResourceVector {
            gpu_cores: 4.0,
            ..fits
        };
        assert_eq!(
            too_much_gpu.first_exceeded_axis(&capacity),
            Some(ResourceAxis::Gpu)
        );

        // cpu is reported before gpu when both exceed
        let both = ResourceVector {
            cpu_cores: 16.0,
            gpu_cores: 4.0,
            ..fits
        };
        assert_eq!(both.first_exceeded_axis(&capacity), Some(ResourceAxis::Cpu));
    }

    #[test]
    fn validate_rejects_empty_model() {
        let task = Task::new(TaskType::Inference, "  ");
        assert!(matches!(
            validate_task(&task),
            Err(SchedulerError::InvalidTask(_))
        ));
    }

    #[test]
    fn validate_rejects_negative_requirements() {
        let mut task = Task::new(TaskType::Inference, "llama-7b");
        task.requirements.cpu_cores = -1.0;
        assert!(validate_task(&task).is_err());
    }

    #[test]
    fn model_family_extraction() {
        assert_eq!(ModelProfile::family_of("bert-base"), "bert");
        assert_eq!(ModelProfile::family_of("llama:70b"), "llama");
        assert_eq!(ModelProfile::family_of("GPT2"), "gpt2");
    }

    #[test]
    fn strategy_names_round_trip() {
        for kind in StrategyKind::concrete() {
            let parsed: StrategyKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, *kind);
        }
        assert!("no_such_strategy".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn worker_outcome_statistics() {
        let mut worker = Worker::new(
            "w1",
            "10.0.0.1:7070",
            HashSet::new(),
            ResourceVector::zero(),
        );
        worker.record_outcome(true, Duration::from_millis(100));
        worker.record_outcome(false, Duration::from_millis(300));
        assert_eq!(worker.tasks_completed, 1);
        assert_eq!(worker.tasks_failed, 1);
        assert!((worker.failure_rate() - 0.5).abs() < f64::EPSILON);
        assert!((worker.avg_completion_ms - 200.0).abs() < 1e-9);
    }
}

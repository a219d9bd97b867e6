//! Partition planner: chooses a partitioning strategy for a (task, model,
//! worker pool) and materializes the plan.
//!
//! ## Architecture
//!
//! Strategies share one seam: a [`PartitionStrategy`] declares its kind,
//! answers applicability for a task, and synthesizes a [`PartitionPlan`].
//! The eight concrete strategies register with the planner at startup; the
//! `adaptive` strategy is resolved by the planner itself to one of the
//! concrete ones at plan time using the advisor's advice.
//!
//! Selection is three stages: hard applicability filter, advisor-weighted
//! scoring, then the configured default on ties or missing history, with a
//! stable alphabetical tie-break on strategy name.
//!
//! Plan synthesis places partitions one at a time through the load
//! balancer against a working copy of the pool, subtracting each
//! placement's resources before the next, so a plan never promises
//! capacity the pool does not have. The plan's estimated latency is the
//! critical-path sum over its dependency DAG.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;
use uuid::Uuid;

use crate::advisor::StrategyAdvice;
use crate::balancer::LoadBalancer;
use crate::config::PartitionSettings;
use crate::types::{
    ModelProfile, Partition, PartitionPlan, PartitionType, ResourceAxis, ResourceVector,
    SchedulerError, SchedulerResult, StrategyKind, Task, Worker,
};

/// Rough per-layer forward latency used in estimates, milliseconds.
const PER_LAYER_MS: f64 = 2.0;

/// Collective-communication overhead added to sharded stages, ms.
const ALLREDUCE_MS: f64 = 3.0;

/// Hidden dimension at or above which a layer counts as wide.
const WIDE_HIDDEN_DIM: u32 = 4096;

/// Attention head count at or above which attention dominates.
const ATTENTION_HEAVY_HEADS: u32 = 32;

/// Context length above which sequence parallelism applies.
const LONG_CONTEXT_TOKENS: u32 = 8192;

/// Everything a strategy needs to synthesize a plan.
pub struct PlanContext<'a> {
    /// Task being partitioned
    pub task: &'a Task,
    /// Model characteristics
    pub profile: &'a ModelProfile,
    /// Workers that survived the manager's prefilter
    pub pool: &'a [Worker],
    /// Balancer used for partition-by-partition placement
    pub balancer: &'a LoadBalancer,
    /// Planner thresholds
    pub settings: &'a PartitionSettings,
}

/// Per-strategy plan counters.
#[derive(Default)]
pub struct StrategyStats {
    built: AtomicU64,
    infeasible: AtomicU64,
}

impl StrategyStats {
    fn record(&self, outcome: &SchedulerResult<PartitionPlan>) {
        match outcome {
            Ok(_) => self.built.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.infeasible.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self, kind: StrategyKind) -> StrategyMetrics {
        StrategyMetrics {
            strategy: kind,
            plans_built: self.built.load(Ordering::Relaxed),
            plans_infeasible: self.infeasible.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of one strategy's counters.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct StrategyMetrics {
    /// Strategy the counters belong to
    pub strategy: StrategyKind,
    /// Plans synthesized successfully
    pub plans_built: u64,
    /// Synthesis attempts that returned infeasible
    pub plans_infeasible: u64,
}

/// The shared capability set of a partitioning strategy. New strategies
/// are added by registering an implementation with the planner at startup.
pub trait PartitionStrategy: Send + Sync {
    /// Stable strategy identity.
    fn kind(&self) -> StrategyKind;

    /// Whether the strategy applies to this task, model, and pool.
    fn applicable(&self, ctx: &PlanContext<'_>) -> bool;

    /// Materialize a plan, or fail with `Infeasible` naming the first
    /// saturated axis.
    fn plan(&self, ctx: &PlanContext<'_>) -> SchedulerResult<PartitionPlan>;

    /// Plan counters.
    fn stats(&self) -> &StrategyStats;

    /// Snapshot of the plan counters.
    fn metrics(&self) -> StrategyMetrics {
        self.stats().snapshot(self.kind())
    }
}

/// Shape of one partition before placement.
struct PartitionSpec {
    kind: PartitionType,
    shard: serde_json::Value,
    depends_on: Vec<usize>,
    resources: ResourceVector,
    estimated_latency_ms: f64,
    estimated_memory_bytes: u64,
}

/// Divide a requirement vector across `parts` partitions.
fn split_resources(total: ResourceVector, parts: usize) -> ResourceVector {
    let n = parts.max(1) as f64;
    ResourceVector {
        cpu_cores: total.cpu_cores / n,
        memory_bytes: (total.memory_bytes as f64 / n).ceil() as u64,
        gpu_cores: total.gpu_cores / n,
        gpu_memory_bytes: (total.gpu_memory_bytes as f64 / n).ceil() as u64,
        disk_bytes: (total.disk_bytes as f64 / n).ceil() as u64,
    }
}

/// Approximate parameter bytes of one transformer layer.
fn layer_bytes(hidden: u32) -> u64 {
    12 * (hidden as u64) * (hidden as u64) * 4
}

/// The first axis on which no worker in the pool can host `requested`,
/// scanned in the fixed axis order. Falls back to the first exceeded axis
/// of the lexicographically-first worker when every axis is individually
/// coverable but no single worker fits.
fn first_saturated_axis(requested: &ResourceVector, pool: &[Worker]) -> ResourceAxis {
    let covers = |probe: ResourceVector| pool.iter().any(|w| probe.fits_within(&w.available_capacity));

    let axes = [
        (
            ResourceAxis::Cpu,
            ResourceVector {
                cpu_cores: requested.cpu_cores,
                ..ResourceVector::zero()
            },
        ),
        (
            ResourceAxis::Memory,
            ResourceVector {
                memory_bytes: requested.memory_bytes,
                ..ResourceVector::zero()
            },
        ),
        (
            ResourceAxis::Gpu,
            ResourceVector {
                gpu_cores: requested.gpu_cores,
                ..ResourceVector::zero()
            },
        ),
        (
            ResourceAxis::GpuMemory,
            ResourceVector {
                gpu_memory_bytes: requested.gpu_memory_bytes,
                ..ResourceVector::zero()
            },
        ),
        (
            ResourceAxis::Disk,
            ResourceVector {
                disk_bytes: requested.disk_bytes,
                ..ResourceVector::zero()
            },
        ),
    ];
    for (axis, probe) in axes {
        if !covers(probe) {
            return axis;
        }
    }

    let mut ordered: Vec<&Worker> = pool.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));
    ordered
        .first()
        .and_then(|w| requested.first_exceeded_axis(&w.available_capacity))
        .unwrap_or(ResourceAxis::Cpu)
}

/// Place specs one at a time: prefilter by fit, select through the
/// balancer, subtract the placement from the working pool.
fn place(ctx: &PlanContext<'_>, specs: Vec<PartitionSpec>) -> SchedulerResult<Vec<Partition>> {
    let mut working: Vec<Worker> = ctx.pool.to_vec();
    let mut partitions = Vec::with_capacity(specs.len());

    for (index, spec) in specs.into_iter().enumerate() {
        let candidates: Vec<Worker> = working
            .iter()
            .filter(|w| spec.resources.fits_within(&w.available_capacity))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(SchedulerError::Infeasible {
                axis: first_saturated_axis(&spec.resources, &working),
            });
        }
        let chosen = ctx.balancer.select(ctx.task, &candidates)?;
        if let Some(slot) = working.iter_mut().find(|w| w.id == chosen.id) {
            slot.available_capacity = slot.available_capacity.saturating_sub(&spec.resources);
            slot.load.active_tasks += 1;
        }
        partitions.push(Partition {
            index,
            worker_id: chosen.id,
            kind: spec.kind,
            shard: spec.shard,
            depends_on: spec.depends_on,
            resources: spec.resources,
            estimated_latency_ms: spec.estimated_latency_ms,
            estimated_memory_bytes: spec.estimated_memory_bytes,
        });
    }
    Ok(partitions)
}

/// Critical-path latency over the dependency DAG. Dependencies reference
/// earlier indices only, so one forward pass suffices.
fn critical_path_ms(partitions: &[Partition]) -> f64 {
    let mut finish = vec![0.0_f64; partitions.len()];
    let mut longest = 0.0_f64;
    for (i, partition) in partitions.iter().enumerate() {
        let ready = partition
            .depends_on
            .iter()
            .filter(|&&d| d < i)
            .map(|&d| finish[d])
            .fold(0.0_f64, f64::max);
        finish[i] = ready + partition.estimated_latency_ms;
        longest = longest.max(finish[i]);
    }
    longest
}

fn assemble(
    ctx: &PlanContext<'_>,
    strategy: StrategyKind,
    partitions: Vec<Partition>,
) -> PartitionPlan {
    let estimated_latency_ms = critical_path_ms(&partitions);
    let estimated_memory_bytes = partitions.iter().map(|p| p.estimated_memory_bytes).sum();
    PartitionPlan {
        id: Uuid::new_v4(),
        task_id: ctx.task.id,
        strategy,
        partitions,
        estimated_latency_ms,
        estimated_memory_bytes,
        created_at: SystemTime::now(),
    }
}

fn batch_hint(task: &Task) -> usize {
    if let Some(batch) = task.metadata.get("batch_size").and_then(|v| v.parse().ok()) {
        return batch;
    }
    match &task.payload {
        serde_json::Value::Array(items) => items.len(),
        serde_json::Value::Object(map) => map
            .get("inputs")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(1),
        _ => 1,
    }
}

// ---------------------------------------------------------------------------
// Concrete strategies
// ---------------------------------------------------------------------------

/// One partition per layer group, chained by dependency.
#[derive(Default)]
pub struct LayerwiseStrategy {
    stats: StrategyStats,
}

impl PartitionStrategy for LayerwiseStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Layerwise
    }

    fn applicable(&self, ctx: &PlanContext<'_>) -> bool {
        matches!(
            ctx.task.task_type,
            crate::types::TaskType::Inference | crate::types::TaskType::Generation
        ) && ctx.profile.layer_count > ctx.settings.layer_threshold
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> SchedulerResult<PartitionPlan> {
        let layers = ctx.profile.layer_count.max(1);
        let groups = ctx.pool.len().clamp(1, 8).min(layers as usize);
        let per_group = layers.div_ceil(groups as u32);
        let requested = ctx.task.requirements.to_vector();
        let shared = split_resources(requested, groups);

        let specs = (0..groups)
            .map(|g| {
                let start = g as u32 * per_group;
                let end = ((g as u32 + 1) * per_group).min(layers);
                let span = end.saturating_sub(start);
                PartitionSpec {
                    kind: PartitionType::LayerRange,
                    shard: serde_json::json!({ "start_layer": start, "end_layer": end }),
                    depends_on: if g == 0 { vec![] } else { vec![g - 1] },
                    resources: shared,
                    estimated_latency_ms: span as f64 * PER_LAYER_MS,
                    estimated_memory_bytes: span as u64 * layer_bytes(ctx.profile.hidden_size),
                }
            })
            .collect();

        let outcome = place(ctx, specs).map(|parts| assemble(ctx, self.kind(), parts));
        self.stats.record(&outcome);
        outcome
    }

    fn stats(&self) -> &StrategyStats {
        &self.stats
    }
}

/// Per-tensor shards within a stage, no inter-partition dependencies.
#[derive(Default)]
pub struct TensorParallelStrategy {
    stats: StrategyStats,
}

impl PartitionStrategy for TensorParallelStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TensorParallelism
    }

    fn applicable(&self, ctx: &PlanContext<'_>) -> bool {
        ctx.profile.hidden_size >= WIDE_HIDDEN_DIM
            && ctx
                .pool
                .iter()
                .filter(|w| w.total_capacity.gpu_cores >= 1.0)
                .count()
                >= 2
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> SchedulerResult<PartitionPlan> {
        let shards = ctx.pool.len().clamp(2, 8);
        let requested = ctx.task.requirements.to_vector();
        let shared = split_resources(requested, shards);
        let per_shard_latency =
            ctx.profile.layer_count as f64 * PER_LAYER_MS / shards as f64 + ALLREDUCE_MS;
        let total_bytes = ctx.profile.layer_count as u64 * layer_bytes(ctx.profile.hidden_size);

        let specs = (0..shards)
            .map(|s| PartitionSpec {
                kind: PartitionType::TensorShard,
                shard: serde_json::json!({ "shard": s, "of": shards }),
                depends_on: vec![],
                resources: shared,
                estimated_latency_ms: per_shard_latency,
                estimated_memory_bytes: total_bytes / shards as u64,
            })
            .collect();

        let outcome = place(ctx, specs).map(|parts| assemble(ctx, self.kind(), parts));
        self.stats.record(&outcome);
        outcome
    }

    fn stats(&self) -> &StrategyStats {
        &self.stats
    }
}

/// Stages chained across nodes, each dependent on the previous.
#[derive(Default)]
pub struct PipelineParallelStrategy {
    stats: StrategyStats,
}

impl PartitionStrategy for PipelineParallelStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PipelineParallelism
    }

    fn applicable(&self, ctx: &PlanContext<'_>) -> bool {
        ctx.profile.layer_count > ctx.settings.layer_threshold && ctx.pool.len() >= 2
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> SchedulerResult<PartitionPlan> {
        let stages = ctx.pool.len().clamp(2, 4);
        let layers = ctx.profile.layer_count.max(1);
        let per_stage = layers.div_ceil(stages as u32);
        let requested = ctx.task.requirements.to_vector();
        let shared = split_resources(requested, stages);

        let specs = (0..stages)
            .map(|s| PartitionSpec {
                kind: PartitionType::PipelineStage,
                shard: serde_json::json!({ "stage": s, "layers": per_stage }),
                depends_on: if s == 0 { vec![] } else { vec![s - 1] },
                resources: shared,
                estimated_latency_ms: per_stage as f64 * PER_LAYER_MS,
                estimated_memory_bytes: per_stage as u64 * layer_bytes(ctx.profile.hidden_size),
            })
            .collect();

        let outcome = place(ctx, specs).map(|parts| assemble(ctx, self.kind(), parts));
        self.stats.record(&outcome);
        outcome
    }

    fn stats(&self) -> &StrategyStats {
        &self.stats
    }
}

/// N equal data shards with no inter-dependencies.
#[derive(Default)]
pub struct DataSplitStrategy {
    stats: StrategyStats,
}

impl PartitionStrategy for DataSplitStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DataSplit
    }

    fn applicable(&self, ctx: &PlanContext<'_>) -> bool {
        ctx.task.task_type == crate::types::TaskType::Embedding || batch_hint(ctx.task) > 1
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> SchedulerResult<PartitionPlan> {
        let batch = batch_hint(ctx.task).max(1);
        let shards = batch
            .min(ctx.pool.len().max(1))
            .clamp(1, ctx.settings.batch_size_limit.max(1));
        let requested = ctx.task.requirements.to_vector();
        let shared = split_resources(requested, shards);
        let latency = ctx.profile.layer_count as f64 * PER_LAYER_MS;

        let specs = (0..shards)
            .map(|s| PartitionSpec {
                kind: PartitionType::DataShard,
                shard: serde_json::json!({ "shard": s, "of": shards }),
                depends_on: vec![],
                resources: shared,
                estimated_latency_ms: latency,
                estimated_memory_bytes: layer_bytes(ctx.profile.hidden_size),
            })
            .collect();

        let outcome = place(ctx, specs).map(|parts| assemble(ctx, self.kind(), parts));
        self.stats.record(&outcome);
        outcome
    }

    fn stats(&self) -> &StrategyStats {
        &self.stats
    }
}

/// Attention heads split per worker.
#[derive(Default)]
pub struct AttentionParallelStrategy {
    stats: StrategyStats,
}

impl PartitionStrategy for AttentionParallelStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AttentionParallelism
    }

    fn applicable(&self, ctx: &PlanContext<'_>) -> bool {
        ctx.profile.attention_heads >= ATTENTION_HEAVY_HEADS
            && matches!(
                ctx.task.task_type,
                crate::types::TaskType::Inference | crate::types::TaskType::Generation
            )
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> SchedulerResult<PartitionPlan> {
        let heads = ctx.profile.attention_heads.max(1);
        let slices = ctx.pool.len().clamp(2, 8).min(heads as usize);
        let per_slice = heads.div_ceil(slices as u32);
        let requested = ctx.task.requirements.to_vector();
        let shared = split_resources(requested, slices);

        let specs = (0..slices)
            .map(|s| PartitionSpec {
                kind: PartitionType::AttentionSlice,
                shard: serde_json::json!({
                    "head_start": s as u32 * per_slice,
                    "head_end": ((s as u32 + 1) * per_slice).min(heads),
                }),
                depends_on: vec![],
                resources: shared,
                estimated_latency_ms: ctx.profile.layer_count as f64 * PER_LAYER_MS
                    / slices as f64
                    + ALLREDUCE_MS,
                estimated_memory_bytes: layer_bytes(ctx.profile.hidden_size) / slices as u64,
            })
            .collect();

        let outcome = place(ctx, specs).map(|parts| assemble(ctx, self.kind(), parts));
        self.stats.record(&outcome);
        outcome
    }

    fn stats(&self) -> &StrategyStats {
        &self.stats
    }
}

/// Sequence chunks chained for long-context generation.
#[derive(Default)]
pub struct SequenceParallelStrategy {
    stats: StrategyStats,
}

impl PartitionStrategy for SequenceParallelStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SequenceParallelism
    }

    fn applicable(&self, ctx: &PlanContext<'_>) -> bool {
        ctx.task.task_type == crate::types::TaskType::Generation
            && ctx.profile.context_length > LONG_CONTEXT_TOKENS
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> SchedulerResult<PartitionPlan> {
        let context = ctx.profile.context_length.max(1);
        let chunks = (context.div_ceil(LONG_CONTEXT_TOKENS) as usize)
            .clamp(2, 8)
            .min(ctx.pool.len().max(1));
        let per_chunk = context.div_ceil(chunks as u32);
        let requested = ctx.task.requirements.to_vector();
        let shared = split_resources(requested, chunks);

        let specs = (0..chunks)
            .map(|c| PartitionSpec {
                kind: PartitionType::SequenceWindow,
                shard: serde_json::json!({
                    "token_start": c as u32 * per_chunk,
                    "token_end": ((c as u32 + 1) * per_chunk).min(context),
                }),
                depends_on: if c == 0 { vec![] } else { vec![c - 1] },
                resources: shared,
                estimated_latency_ms: per_chunk as f64 / 1000.0 * PER_LAYER_MS
                    * ctx.profile.layer_count as f64
                    / 10.0,
                estimated_memory_bytes: layer_bytes(ctx.profile.hidden_size),
            })
            .collect();

        let outcome = place(ctx, specs).map(|parts| assemble(ctx, self.kind(), parts));
        self.stats.record(&outcome);
        outcome
    }

    fn stats(&self) -> &StrategyStats {
        &self.stats
    }
}

/// Independent sub-task partitions.
#[derive(Default)]
pub struct TaskParallelStrategy {
    stats: StrategyStats,
}

impl PartitionStrategy for TaskParallelStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TaskParallelism
    }

    fn applicable(&self, ctx: &PlanContext<'_>) -> bool {
        matches!(
            ctx.task.task_type,
            crate::types::TaskType::Classification | crate::types::TaskType::Custom
        ) || ctx
            .task
            .payload
            .get("subtasks")
            .and_then(|v| v.as_array())
            .is_some()
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> SchedulerResult<PartitionPlan> {
        let declared = ctx
            .task
            .payload
            .get("subtasks")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let parts = if declared > 0 {
            declared.min(ctx.settings.batch_size_limit.max(1))
        } else {
            ctx.pool.len().clamp(1, 4)
        };
        let requested = ctx.task.requirements.to_vector();
        let shared = split_resources(requested, parts);
        let latency = ctx.profile.layer_count as f64 * PER_LAYER_MS;

        let specs = (0..parts)
            .map(|p| PartitionSpec {
                kind: PartitionType::SubTask,
                shard: serde_json::json!({ "subtask": p }),
                depends_on: vec![],
                resources: shared,
                estimated_latency_ms: latency,
                estimated_memory_bytes: layer_bytes(ctx.profile.hidden_size),
            })
            .collect();

        let outcome = place(ctx, specs).map(|parts| assemble(ctx, self.kind(), parts));
        self.stats.record(&outcome);
        outcome
    }

    fn stats(&self) -> &StrategyStats {
        &self.stats
    }
}

/// Composed plan: data shards on the outside, a layer chain within each.
#[derive(Default)]
pub struct HybridStrategy {
    stats: StrategyStats,
}

impl PartitionStrategy for HybridStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hybrid
    }

    fn applicable(&self, ctx: &PlanContext<'_>) -> bool {
        batch_hint(ctx.task) > 1
            && ctx.profile.layer_count > ctx.settings.layer_threshold
            && ctx.pool.len() >= 2
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> SchedulerResult<PartitionPlan> {
        let shards = batch_hint(ctx.task).min(ctx.pool.len()).clamp(2, 4);
        let chain_len = 2usize;
        let layers = ctx.profile.layer_count.max(1);
        let per_link = layers.div_ceil(chain_len as u32);
        let requested = ctx.task.requirements.to_vector();
        let shared = split_resources(requested, shards * chain_len);

        let mut specs = Vec::with_capacity(shards * chain_len);
        for shard in 0..shards {
            for link in 0..chain_len {
                let index = shard * chain_len + link;
                specs.push(PartitionSpec {
                    kind: if link == 0 {
                        PartitionType::DataShard
                    } else {
                        PartitionType::LayerRange
                    },
                    shard: serde_json::json!({
                        "shard": shard,
                        "of": shards,
                        "segment": link,
                    }),
                    depends_on: if link == 0 { vec![] } else { vec![index - 1] },
                    resources: shared,
                    estimated_latency_ms: per_link as f64 * PER_LAYER_MS,
                    estimated_memory_bytes: per_link as u64
                        * layer_bytes(ctx.profile.hidden_size)
                        / shards as u64,
                });
            }
        }

        let outcome = place(ctx, specs).map(|parts| assemble(ctx, self.kind(), parts));
        self.stats.record(&outcome);
        outcome
    }

    fn stats(&self) -> &StrategyStats {
        &self.stats
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Strategy selection plus plan synthesis.
pub struct PartitionPlanner {
    settings: PartitionSettings,
    strategies: Vec<Arc<dyn PartitionStrategy>>,
}

impl PartitionPlanner {
    /// Create a planner with the eight built-in strategies registered.
    pub fn new(settings: PartitionSettings) -> Self {
        let mut planner = Self {
            settings,
            strategies: Vec::new(),
        };
        planner.register(Arc::new(AttentionParallelStrategy::default()));
        planner.register(Arc::new(DataSplitStrategy::default()));
        planner.register(Arc::new(HybridStrategy::default()));
        planner.register(Arc::new(LayerwiseStrategy::default()));
        planner.register(Arc::new(PipelineParallelStrategy::default()));
        planner.register(Arc::new(SequenceParallelStrategy::default()));
        planner.register(Arc::new(TaskParallelStrategy::default()));
        planner.register(Arc::new(TensorParallelStrategy::default()));
        planner
    }

    /// Register a strategy. A registration with a kind already present
    /// replaces the earlier one.
    pub fn register(&mut self, strategy: Arc<dyn PartitionStrategy>) {
        self.strategies.retain(|s| s.kind() != strategy.kind());
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| s.kind());
    }

    /// Choose a strategy and synthesize a plan for the task over the pool.
    ///
    /// A task may pin a strategy through the `partition_strategy` metadata
    /// key; `adaptive` (pinned or recommended) resolves to the advisor's
    /// choice, falling back to the configured default.
    pub fn plan(
        &self,
        task: &Task,
        pool: &[Worker],
        balancer: &LoadBalancer,
        advice: &StrategyAdvice,
    ) -> SchedulerResult<PartitionPlan> {
        if pool.is_empty() {
            return Err(SchedulerError::NoSuitableWorker { task_id: task.id });
        }
        let profile = ModelProfile::from_task(task);
        let ctx = PlanContext {
            task,
            profile: &profile,
            pool,
            balancer,
            settings: &self.settings,
        };

        let chosen = self.select(&ctx, advice)?;
        debug!(task_id = %task.id, strategy = %chosen.kind(), "strategy selected");
        chosen.plan(&ctx)
    }

    /// Selection: hard applicability filter, advisor-weighted scoring,
    /// default fallback, alphabetical tie-break.
    fn select(
        &self,
        ctx: &PlanContext<'_>,
        advice: &StrategyAdvice,
    ) -> SchedulerResult<&Arc<dyn PartitionStrategy>> {
        if let Some(pinned) = ctx.task.metadata.get("partition_strategy") {
            let kind = self.resolve_kind(pinned.parse()?, advice);
            return self.by_kind(kind);
        }

        let applicable: Vec<&Arc<dyn PartitionStrategy>> = self
            .strategies
            .iter()
            .filter(|s| s.applicable(ctx))
            .collect();
        if applicable.is_empty() {
            return self.by_kind(self.settings.default_strategy);
        }

        // strategies list is kept sorted by kind, so equal scores resolve
        // to the alphabetically-first strategy
        let mut best: Option<(f64, &Arc<dyn PartitionStrategy>)> = None;
        let mut distinct_scores = false;
        for &strategy in &applicable {
            let score = advice.score_for(strategy.kind());
            match &best {
                None => best = Some((score, strategy)),
                Some((top, _)) => {
                    if (score - top).abs() > f64::EPSILON {
                        distinct_scores = true;
                    }
                    if score > *top {
                        best = Some((score, strategy));
                    }
                }
            }
        }

        match best {
            Some((score, strategy)) if score > 0.0 && distinct_scores => Ok(strategy),
            _ => {
                // tied or unavailable scores: configured default when it
                // applies, else the alphabetically-first applicable
                if let Some(default) = applicable
                    .iter()
                    .copied()
                    .find(|s| s.kind() == self.settings.default_strategy)
                {
                    Ok(default)
                } else {
                    Ok(applicable[0])
                }
            }
        }
    }

    fn resolve_kind(&self, kind: StrategyKind, advice: &StrategyAdvice) -> StrategyKind {
        if kind != StrategyKind::Adaptive {
            return kind;
        }
        if advice.strategy != StrategyKind::Adaptive && advice.confidence > 0.0 {
            advice.strategy
        } else {
            self.settings.default_strategy
        }
    }

    fn by_kind(&self, kind: StrategyKind) -> SchedulerResult<&Arc<dyn PartitionStrategy>> {
        self.strategies
            .iter()
            .find(|s| s.kind() == kind)
            .ok_or_else(|| {
                SchedulerError::Configuration(format!("strategy {kind} is not registered"))
            })
    }

    /// Counters for every registered strategy.
    pub fn metrics(&self) -> Vec<StrategyMetrics> {
        self.strategies.iter().map(|s| s.metrics()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalancerSettings;
    use crate::metrics::MetricsCollector;
    use crate::types::{TaskType, WorkerLoad};
    use std::collections::HashSet;

    fn worker(id: &str, cpu: f64, gpu: f64) -> Worker {
        let mut w = Worker::new(
            id,
            "10.0.0.1:7070",
            HashSet::from(["gpu".to_string()]),
            ResourceVector {
                cpu_cores: cpu,
                memory_bytes: 64 << 30,
                gpu_cores: gpu,
                gpu_memory_bytes: 16 << 30,
                disk_bytes: 500 << 30,
            },
        );
        w.load = WorkerLoad::default();
        w
    }

    fn balancer() -> Arc<LoadBalancer> {
        LoadBalancer::new(
            &BalancerSettings::default(),
            Arc::new(MetricsCollector::new().unwrap()),
        )
        .unwrap()
    }

    fn inference_task(layers: u32) -> Task {
        let mut task = Task::new(TaskType::Inference, "llama-70b");
        task.metadata
            .insert("model_layers".to_string(), layers.to_string());
        task.requirements.cpu_cores = 4.0;
        task.requirements.memory_bytes = 8 << 30;
        task
    }

    #[test]
    fn layerwise_chains_partitions() {
        let planner = PartitionPlanner::new(PartitionSettings::default());
        let balancer = balancer();
        let pool = vec![worker("w1", 16.0, 2.0), worker("w2", 16.0, 2.0)];
        let task = inference_task(48);

        let plan = planner
            .plan(
                &task,
                &pool,
                &balancer,
                &StrategyAdvice::fallback(StrategyKind::Layerwise),
            )
            .unwrap();
        assert_eq!(plan.strategy, StrategyKind::Layerwise);
        assert_eq!(plan.partitions.len(), 2);
        assert!(plan.partitions[0].depends_on.is_empty());
        assert_eq!(plan.partitions[1].depends_on, vec![0]);
        // chained plan: critical path is the sum of both partitions
        let sum: f64 = plan
            .partitions
            .iter()
            .map(|p| p.estimated_latency_ms)
            .sum();
        assert!((plan.estimated_latency_ms - sum).abs() < 1e-9);
    }

    #[test]
    fn data_split_has_no_dependencies() {
        let planner = PartitionPlanner::new(PartitionSettings::default());
        let balancer = balancer();
        let pool = vec![worker("w1", 16.0, 0.0), worker("w2", 16.0, 0.0)];
        let mut task = Task::new(TaskType::Embedding, "bert-base");
        task.metadata.insert("batch_size".to_string(), "8".to_string());

        let plan = planner
            .plan(
                &task,
                &pool,
                &balancer,
                &StrategyAdvice::fallback(StrategyKind::DataSplit),
            )
            .unwrap();
        assert_eq!(plan.strategy, StrategyKind::DataSplit);
        assert!(plan.partitions.iter().all(|p| p.depends_on.is_empty()));
        // parallel plan: critical path equals the slowest single partition
        let max = plan
            .partitions
            .iter()
            .map(|p| p.estimated_latency_ms)
            .fold(0.0, f64::max);
        assert!((plan.estimated_latency_ms - max).abs() < 1e-9);
    }

    #[test]
    fn placement_subtracts_resources() {
        let planner = PartitionPlanner::new(PartitionSettings::default());
        let balancer = balancer();
        // one worker with just enough cpu for both layer groups
        let pool = vec![worker("w1", 4.0, 0.0)];
        let task = inference_task(48);

        let plan = planner
            .plan(
                &task,
                &pool,
                &balancer,
                &StrategyAdvice::fallback(StrategyKind::Layerwise),
            )
            .unwrap();
        assert!(plan.partitions.iter().all(|p| p.worker_id == "w1"));
    }

    #[test]
    fn infeasible_names_first_saturated_axis() {
        let planner = PartitionPlanner::new(PartitionSettings::default());
        let balancer = balancer();
        let pool = vec![worker("w1", 1.0, 0.0)];
        let mut task = inference_task(48);
        task.requirements.cpu_cores = 64.0;

        let err = planner
            .plan(
                &task,
                &pool,
                &balancer,
                &StrategyAdvice::fallback(StrategyKind::Layerwise),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Infeasible {
                axis: ResourceAxis::Cpu
            }
        ));
    }

    #[test]
    fn pinned_strategy_wins() {
        let planner = PartitionPlanner::new(PartitionSettings::default());
        let balancer = balancer();
        let pool = vec![worker("w1", 16.0, 2.0), worker("w2", 16.0, 2.0)];
        let mut task = inference_task(48);
        task.metadata.insert(
            "partition_strategy".to_string(),
            "pipeline_parallelism".to_string(),
        );

        let plan = planner
            .plan(
                &task,
                &pool,
                &balancer,
                &StrategyAdvice::fallback(StrategyKind::Layerwise),
            )
            .unwrap();
        assert_eq!(plan.strategy, StrategyKind::PipelineParallelism);
    }

    #[test]
    fn adaptive_resolves_through_advice() {
        let planner = PartitionPlanner::new(PartitionSettings::default());
        let balancer = balancer();
        let pool = vec![worker("w1", 16.0, 2.0), worker("w2", 16.0, 2.0)];
        let mut task = inference_task(48);
        task.metadata
            .insert("partition_strategy".to_string(), "adaptive".to_string());

        let advice = StrategyAdvice {
            strategy: StrategyKind::PipelineParallelism,
            confidence: 0.9,
            scores: std::collections::HashMap::new(),
        };
        let plan = planner.plan(&task, &pool, &balancer, &advice).unwrap();
        assert_eq!(plan.strategy, StrategyKind::PipelineParallelism);
    }

    #[test]
    fn advice_scores_drive_selection() {
        let planner = PartitionPlanner::new(PartitionSettings::default());
        let balancer = balancer();
        let pool = vec![worker("w1", 16.0, 2.0), worker("w2", 16.0, 2.0)];
        // layerwise, pipeline, and hybrid all applicable for this shape
        let mut task = inference_task(48);
        task.metadata.insert("batch_size".to_string(), "4".to_string());

        let mut scores = std::collections::HashMap::new();
        scores.insert(StrategyKind::PipelineParallelism, 0.8);
        scores.insert(StrategyKind::Layerwise, 0.2);
        let advice = StrategyAdvice {
            strategy: StrategyKind::PipelineParallelism,
            confidence: 0.8,
            scores,
        };
        let plan = planner.plan(&task, &pool, &balancer, &advice).unwrap();
        assert_eq!(plan.strategy, StrategyKind::PipelineParallelism);
    }

    #[test]
    fn empty_scores_fall_back_to_default() {
        let planner = PartitionPlanner::new(PartitionSettings {
            default_strategy: StrategyKind::PipelineParallelism,
            ..PartitionSettings::default()
        });
        let balancer = balancer();
        let pool = vec![worker("w1", 16.0, 2.0), worker("w2", 16.0, 2.0)];
        let task = inference_task(48);

        let plan = planner
            .plan(
                &task,
                &pool,
                &balancer,
                &StrategyAdvice::fallback(StrategyKind::Layerwise),
            )
            .unwrap();
        assert_eq!(plan.strategy, StrategyKind::PipelineParallelism);
    }

    #[test]
    fn strategy_metrics_count_outcomes() {
        let planner = PartitionPlanner::new(PartitionSettings::default());
        let balancer = balancer();
        let pool = vec![worker("w1", 16.0, 2.0), worker("w2", 16.0, 2.0)];
        let task = inference_task(48);
        planner
            .plan(
                &task,
                &pool,
                &balancer,
                &StrategyAdvice::fallback(StrategyKind::Layerwise),
            )
            .unwrap();

        let built: u64 = planner.metrics().iter().map(|m| m.plans_built).sum();
        assert_eq!(built, 1);
    }
}

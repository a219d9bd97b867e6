//! Scheduler manager: top-level orchestrator for the scheduling core.
//!
//! ## Architecture
//!
//! The manager composes the queue, registry, allocator, balancer, planner,
//! tracker, and advisor, and runs the long-lived loops:
//!
//! - **Scheduler loop** — every ≤100 ms, leader only: dequeue one task,
//!   consult the advisor, synthesize a plan, reserve resources, dispatch.
//! - **Monitoring loop** — refresh aggregate state and gauges.
//! - **Result fan-in** — consume the tracker's results channel: release
//!   reservations, update worker statistics, feed the advisor, and
//!   re-queue transient failures.
//! - **Offline fan-in** — invalidate assignments of workers that missed
//!   their heartbeat window.
//! - **Replication apply** — followers fold committed cluster events into
//!   their local registry and ledger replicas.
//!
//! Every loop holds a child cancellation token from one root; stop is
//! two-phase (cancel, bounded drain, then forced abort). Leader gating is
//! the single coordination point: followers keep read replicas current and
//! take over on leader loss, at which point the incoming leader reconciles
//! the replicated ledger against what workers confirm within a grace
//! window.
//!
//! Locks are fine-grained and per-structure; when more than one is held
//! the order is queue, registry, capability index, allocation ledger,
//! tracker, advisor.

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::advisor::{AdaptiveAdvisor, PerformanceRecord};
use crate::allocator::ResourceAllocator;
use crate::balancer::LoadBalancer;
use crate::config::{RetrySettings, SchedulerConfig};
use crate::consensus::{ClusterEvent, ConsensusHandle};
use crate::messages::{
    topics, Envelope, ResourceUpdate, TaskAssignment, TaskStatusUpdate, WorkerHeartbeat,
    WorkerRegistration,
};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::planner::{PartitionPlanner, StrategyMetrics};
use crate::queue::{Band, TaskQueue};
use crate::registry::{RegistryStats, WorkerRegistry};
use crate::tracker::{TaskTracker, TrackerStats};
use crate::transport::Transport;
use crate::types::{
    AllocationStatus, ResourceVector, SchedulerError, SchedulerResult, StrategyKind, Task, TaskId,
    TaskResult, TaskStatus, WorkerId, validate_task,
};

/// Scheduler loop cadence.
const SCHEDULER_TICK: Duration = Duration::from_millis(100);

/// Drain window for two-phase shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// Window an incoming leader waits for workers to confirm replicated
/// allocations before releasing them.
const RECONCILE_GRACE: Duration = Duration::from_secs(30);

/// How long a failed worker stays excluded from a task's candidate set.
const SOFT_EXCLUSION: Duration = Duration::from_secs(60);

/// Lifecycle states of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    /// Not started, or stopped cleanly
    Stopped,
    /// Subcomponents starting
    Starting,
    /// Loops running
    Running,
    /// Two-phase shutdown in progress
    Stopping,
    /// A subcomponent failed to start; partial initialization rolled back
    Error,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStatus {
    /// The task was cancelled
    Cancelled,
    /// No queued or tracked task with that id
    NotFound,
    /// The task already reached a terminal status
    AlreadyCompleted,
}

/// Aggregate cluster-visible state.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerState {
    /// Manager lifecycle
    pub lifecycle: ManagerState,
    /// Whether this node holds leadership
    pub is_leader: bool,
    /// Total queued tasks
    pub queued: usize,
    /// Queued tasks in the high band
    pub queued_high: usize,
    /// Queued tasks in the normal band
    pub queued_normal: usize,
    /// Queued tasks in the low band
    pub queued_low: usize,
    /// Assignments in flight
    pub tracked: usize,
    /// Tasks holding reservations
    pub active_allocations: usize,
    /// Registry aggregates
    pub workers: RegistryStats,
    /// Monotonic state revision
    pub revision: u64,
    /// Snapshot time
    pub last_updated: SystemTime,
}

/// Aggregate metrics served through `metrics()`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerMetrics {
    /// Headline counters and means
    pub core: MetricsSnapshot,
    /// Tracker-derived counters
    pub tracker: TrackerStats,
    /// Per-strategy plan counters
    pub strategies: Vec<StrategyMetrics>,
}

struct InflightMeta {
    task: Task,
    strategy: StrategyKind,
    input_bytes: usize,
}

struct ManagerRuntime {
    token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

/// Top-level orchestrator.
pub struct SchedulerManager {
    config: SchedulerConfig,
    metrics: Arc<MetricsCollector>,
    queue: Arc<TaskQueue>,
    registry: Arc<WorkerRegistry>,
    allocator: Arc<ResourceAllocator>,
    balancer: Arc<LoadBalancer>,
    planner: Arc<PartitionPlanner>,
    tracker: Arc<TaskTracker>,
    advisor: Arc<AdaptiveAdvisor>,
    consensus: Arc<dyn ConsensusHandle>,
    transport: Arc<dyn Transport>,
    lifecycle: RwLock<ManagerState>,
    revision: AtomicU64,
    inflight: Mutex<HashMap<TaskId, InflightMeta>>,
    exclusions: Mutex<HashMap<TaskId, Vec<(WorkerId, Instant)>>>,
    // delivery attempts per task, accounted separately from the
    // execution retry budget
    dispatch_attempts: Mutex<HashMap<TaskId, u32>>,
    runtime: Mutex<Option<ManagerRuntime>>,
}

impl SchedulerManager {
    /// Build a manager from validated configuration and the consensus and
    /// transport contracts.
    pub fn new(
        config: SchedulerConfig,
        consensus: Arc<dyn ConsensusHandle>,
        transport: Arc<dyn Transport>,
    ) -> SchedulerResult<Arc<Self>> {
        config.validate()?;
        let metrics = Arc::new(MetricsCollector::new()?);
        let queue = TaskQueue::new(config.queue.clone(), Arc::clone(&metrics));
        let registry = WorkerRegistry::new(config.workers.clone());
        let allocator = ResourceAllocator::new();
        let balancer = LoadBalancer::new(&config.balancer, Arc::clone(&metrics))?;
        let planner = Arc::new(PartitionPlanner::new(config.partition.clone()));
        let tracker = TaskTracker::new(config.tracker.clone(), Arc::clone(&metrics));
        let advisor = AdaptiveAdvisor::new(
            config.advisor.clone(),
            config.partition.default_strategy,
            Arc::clone(&metrics),
        );

        Ok(Arc::new(Self {
            config,
            metrics,
            queue,
            registry,
            allocator,
            balancer,
            planner,
            tracker,
            advisor,
            consensus,
            transport,
            lifecycle: RwLock::new(ManagerState::Stopped),
            revision: AtomicU64::new(0),
            inflight: Mutex::new(HashMap::new()),
            exclusions: Mutex::new(HashMap::new()),
            dispatch_attempts: Mutex::new(HashMap::new()),
            runtime: Mutex::new(None),
        }))
    }

    /// Start every loop. A failure mid-start rolls back whatever was
    /// already spawned and leaves the manager in the error state.
    pub async fn start(self: &Arc<Self>) -> SchedulerResult<()> {
        {
            let mut lifecycle = self.lifecycle.write().await;
            if *lifecycle != ManagerState::Stopped {
                return Err(SchedulerError::Internal(format!(
                    "cannot start from {lifecycle:?}"
                )));
            }
            *lifecycle = ManagerState::Starting;
        }

        initialize_logging(&self.config);

        match self.start_inner().await {
            Ok(runtime) => {
                *self.runtime.lock().await = Some(runtime);
                *self.lifecycle.write().await = ManagerState::Running;
                info!("scheduler started");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "scheduler start failed, rolling back");
                if let Some(runtime) = self.runtime.lock().await.take() {
                    runtime.token.cancel();
                }
                *self.lifecycle.write().await = ManagerState::Error;
                Err(err)
            }
        }
    }

    async fn start_inner(self: &Arc<Self>) -> SchedulerResult<ManagerRuntime> {
        let root = CancellationToken::new();
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        self.register_handlers().await;

        handles.push((
            "registry-health",
            self.registry.spawn_health_loop(root.child_token()),
        ));
        for handle in self.tracker.spawn_loops(root.child_token()) {
            handles.push(("tracker", handle));
        }
        handles.push(("scheduler", self.spawn_scheduler_loop(root.child_token())));
        handles.push(("monitoring", self.spawn_monitoring_loop(root.child_token())));
        handles.push(("result-fan-in", self.spawn_result_loop(root.child_token())));
        handles.push(("offline-fan-in", self.spawn_offline_loop(root.child_token())));
        if self.config.cluster.enable_consensus {
            handles.push(("replication", self.spawn_apply_loop(root.child_token())));
        }

        Ok(ManagerRuntime {
            token: root,
            handles,
        })
    }

    /// Two-phase stop: cancel every loop, drain within the shutdown
    /// window, then abort stragglers and close the queue.
    pub async fn stop(&self) -> SchedulerResult<()> {
        {
            let mut lifecycle = self.lifecycle.write().await;
            match *lifecycle {
                ManagerState::Running | ManagerState::Error => {}
                ManagerState::Stopped => return Ok(()),
                other => {
                    return Err(SchedulerError::Internal(format!(
                        "cannot stop from {other:?}"
                    )))
                }
            }
            *lifecycle = ManagerState::Stopping;
        }

        if let Some(runtime) = self.runtime.lock().await.take() {
            runtime.token.cancel();
            let deadline = Instant::now() + SHUTDOWN_DRAIN;
            for (name, mut handle) in runtime.handles {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, &mut handle).await {
                    Ok(_) => debug!(task = name, "loop stopped"),
                    Err(_) => {
                        warn!(task = name, "loop missed the drain window, aborting");
                        handle.abort();
                    }
                }
            }
        }

        self.queue.stop();
        *self.lifecycle.write().await = ManagerState::Stopped;
        info!("scheduler stopped");
        Ok(())
    }

    /// Accept a task for scheduling.
    pub async fn schedule(&self, task: Task) -> SchedulerResult<TaskId> {
        validate_task(&task)?;
        if *self.lifecycle.read().await != ManagerState::Running {
            return Err(SchedulerError::Shutdown);
        }
        let task_id = task.id;
        self.queue.enqueue(task).await?;
        Ok(task_id)
    }

    /// Cancel a queued or in-flight task.
    pub async fn cancel(&self, task_id: TaskId) -> SchedulerResult<CancelStatus> {
        if self.queue.cancel(task_id).await {
            self.metrics.record_cancelled();
            return Ok(CancelStatus::Cancelled);
        }
        if self.tracker.is_tracked(task_id).await {
            // the result fan-in releases the reservation
            self.tracker.cancel(task_id).await?;
            return Ok(CancelStatus::Cancelled);
        }
        if self.tracker.recorded_result(task_id).await.is_some() {
            return Ok(CancelStatus::AlreadyCompleted);
        }
        Ok(CancelStatus::NotFound)
    }

    /// Whether this node currently holds leadership.
    pub fn is_leader(&self) -> bool {
        self.consensus.is_leader()
    }

    /// Aggregate state snapshot with a monotonic revision.
    pub async fn state(&self) -> SchedulerState {
        SchedulerState {
            lifecycle: *self.lifecycle.read().await,
            is_leader: self.consensus.is_leader(),
            queued: self.queue.len(),
            queued_high: self.queue.band_len(Band::High),
            queued_normal: self.queue.band_len(Band::Normal),
            queued_low: self.queue.band_len(Band::Low),
            tracked: self.tracker.active_count().await,
            active_allocations: self.allocator.active_count().await,
            workers: self.registry.stats().await,
            revision: self.revision.fetch_add(1, Ordering::Relaxed) + 1,
            last_updated: SystemTime::now(),
        }
    }

    /// Aggregate metrics snapshot.
    pub async fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            core: self.metrics.snapshot(),
            tracker: self.tracker.stats().await,
            strategies: self.planner.metrics(),
        }
    }

    /// Prometheus text encoding of every registered series.
    pub fn export_prometheus(&self) -> SchedulerResult<String> {
        self.metrics.export()
    }

    /// The worker registry (registration also arrives via the transport).
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// The task tracker, for result consumers.
    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    /// The resource allocator.
    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    /// The adaptive advisor.
    pub fn advisor(&self) -> &Arc<AdaptiveAdvisor> {
        &self.advisor
    }

    // -----------------------------------------------------------------
    // Transport handlers
    // -----------------------------------------------------------------

    async fn register_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.transport
            .register_handler(
                topics::TASK_RESULT,
                Arc::new(move |_from, envelope| {
                    let manager = Arc::clone(&manager);
                    Box::pin(async move {
                        let result: TaskResult = envelope.decode()?;
                        manager.apply_worker_result(result).await
                    })
                }),
            )
            .await;

        let manager = Arc::clone(self);
        self.transport
            .register_handler(
                topics::TASK_STATUS,
                Arc::new(move |_from, envelope| {
                    let manager = Arc::clone(&manager);
                    Box::pin(async move {
                        let update: TaskStatusUpdate = envelope.decode()?;
                        if manager
                            .tracker
                            .update_progress(update.task_id, update.progress)
                            .await
                            .is_ok()
                        {
                            manager.allocator.activate(update.task_id).await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;

        let manager = Arc::clone(self);
        self.transport
            .register_handler(
                topics::WORKER_REGISTER,
                Arc::new(move |_from, envelope| {
                    let manager = Arc::clone(&manager);
                    Box::pin(async move {
                        let registration: WorkerRegistration = envelope.decode()?;
                        manager.registry.register(registration.clone()).await?;
                        manager
                            .replicate(ClusterEvent::WorkerRegistered(registration))
                            .await;
                        Ok(())
                    })
                }),
            )
            .await;

        let manager = Arc::clone(self);
        self.transport
            .register_handler(
                topics::WORKER_HEARTBEAT,
                Arc::new(move |_from, envelope| {
                    let manager = Arc::clone(&manager);
                    Box::pin(async move {
                        let beat: WorkerHeartbeat = envelope.decode()?;
                        manager.registry.heartbeat(&beat).await?;
                        for task_id in &beat.active_task_ids {
                            // a heartbeat naming the task confirms it
                            let _ = manager.tracker.touch(*task_id).await;
                            manager.allocator.activate(*task_id).await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;

        let manager = Arc::clone(self);
        self.transport
            .register_handler(
                topics::RESOURCE_UPDATE,
                Arc::new(move |_from, envelope| {
                    let manager = Arc::clone(&manager);
                    Box::pin(async move {
                        let update: ResourceUpdate = envelope.decode()?;
                        manager
                            .registry
                            .update_available(&update.worker_id, update.available_capacity)
                            .await
                    })
                }),
            )
            .await;

        // this node schedules; assignments addressed to it are misrouted
        self.transport
            .register_handler(
                topics::TASK_ASSIGNMENT,
                Arc::new(move |from, _envelope| {
                    Box::pin(async move {
                        warn!(peer = %from, "ignoring task assignment addressed to the scheduler");
                        Ok(())
                    })
                }),
            )
            .await;
    }

    async fn apply_worker_result(&self, result: TaskResult) -> SchedulerResult<()> {
        match result.status {
            TaskStatus::Completed => {
                let payload = result.payload.unwrap_or(serde_json::Value::Null);
                let _ = self.tracker.complete(result.task_id, payload).await;
            }
            _ => {
                let reason = result.error.unwrap_or_else(|| "worker failure".to_string());
                let _ = self.tracker.fail(result.task_id, &reason).await;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------

    fn spawn_scheduler_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCHEDULER_TICK);
            let mut was_leader = manager.consensus.is_leader();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let leader = manager.consensus.is_leader();
                        if leader && !was_leader {
                            manager.spawn_reconcile(token.clone());
                        }
                        was_leader = leader;
                        if !leader {
                            continue;
                        }
                        match manager.queue.dequeue().await {
                            Ok(Some(task)) => manager.dispatch(task).await,
                            Ok(None) => {}
                            Err(_) => break,
                        }
                    }
                    _ = token.cancelled() => {
                        debug!("scheduler loop stopped");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_monitoring_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.cluster.monitoring_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.refresh_gauges().await;
                    }
                    _ = token.cancelled() => {
                        debug!("monitoring loop stopped");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_result_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let results = self.tracker.results();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = results.recv() => {
                        match received {
                            Ok(result) => manager.handle_result(result).await,
                            Err(_) => break,
                        }
                    }
                    _ = token.cancelled() => {
                        debug!("result fan-in stopped");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_offline_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let offline = self.registry.offline_notifications();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = offline.recv() => {
                        match received {
                            Ok(worker_id) => {
                                manager
                                    .replicate(ClusterEvent::WorkerStatusChanged {
                                        worker_id: worker_id.clone(),
                                        status: crate::types::WorkerStatus::Offline,
                                    })
                                    .await;
                                // terminal results flow through the fan-in,
                                // which releases reservations and re-queues
                                manager.tracker.invalidate_worker(&worker_id).await;
                            }
                            Err(_) => break,
                        }
                    }
                    _ = token.cancelled() => {
                        debug!("offline fan-in stopped");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_apply_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = self.consensus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => {
                        match received {
                            Ok(event) => {
                                // the leader already applied its own mutation
                                if manager.consensus.is_leader() {
                                    continue;
                                }
                                manager.apply_replicated(event).await;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "replication stream lagged");
                            }
                            Err(_) => break,
                        }
                    }
                    _ = token.cancelled() => {
                        debug!("replication apply loop stopped");
                        break;
                    }
                }
            }
        })
    }

    async fn apply_replicated(&self, event: ClusterEvent) {
        match &event {
            ClusterEvent::AllocationRecorded(allocation) => {
                self.allocator.apply_recorded(allocation.clone()).await;
            }
            ClusterEvent::AllocationReleased { task_id, status } => {
                self.allocator.release(*task_id, *status, None).await;
            }
            _ => {
                if let Err(err) = self.registry.apply_event(&event).await {
                    debug!(error = %err, "replicated event did not apply");
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Dispatch pipeline
    // -----------------------------------------------------------------

    async fn dispatch(self: &Arc<Self>, task: Task) {
        let now = SystemTime::now();
        if task.deadline_elapsed(now) {
            warn!(task_id = %task.id, "deadline elapsed while queued");
            self.tracker
                .record_unscheduled_failure(&task, TaskStatus::Failed, "deadline exceeded")
                .await;
            return;
        }

        let advice = self.advisor.recommend(&task).await;
        let available = self.registry.list_available().await;
        let excluded = self.excluded_for(task.id).await;
        let candidates = self.balancer.prefilter(&task, &available, &excluded);
        if candidates.is_empty() {
            let task_id = task.id;
            self.requeue(task, SchedulerError::NoSuitableWorker { task_id })
                .await;
            return;
        }

        let plan = match self.planner.plan(&task, &candidates, &self.balancer, &advice) {
            Ok(plan) => plan,
            Err(err) => {
                self.requeue(task, err).await;
                return;
            }
        };

        // reserve each partition's resources on its worker, atomically
        let demands: Vec<(WorkerId, ResourceVector)> = plan
            .partitions
            .iter()
            .map(|p| (p.worker_id.clone(), p.resources))
            .collect();
        let mut capacities = HashMap::new();
        for worker_id in plan.worker_ids() {
            if let Some(worker) = self.registry.get(&worker_id).await {
                capacities.insert(worker_id, worker.total_capacity);
            }
        }
        if let Err(err) = self
            .allocator
            .reserve_plan(task.id, &demands, &capacities)
            .await
        {
            self.requeue(task, err).await;
            return;
        }

        let primary = plan.partitions[0].worker_id.clone();
        if let Err(err) = self.tracker.track(task.clone(), primary.clone()).await {
            self.allocator
                .release(task.id, AllocationStatus::Preempted, None)
                .await;
            self.requeue(task, err).await;
            return;
        }

        // replicate the ledger entries before the assignment leaves
        if self.config.cluster.enable_consensus {
            for allocation in self.allocator.get(task.id).await {
                if let Err(err) = self
                    .consensus
                    .propose(ClusterEvent::AllocationRecorded(allocation))
                    .await
                {
                    warn!(task_id = %task.id, error = %err, "ledger replication failed, aborting dispatch");
                    self.tracker.untrack(task.id).await;
                    self.allocator
                        .release(task.id, AllocationStatus::Preempted, None)
                        .await;
                    self.requeue(task, SchedulerError::LeaderLost).await;
                    return;
                }
            }
        }

        if self.config.cluster.enable_p2p_messaging {
            let primary_resources = demands
                .iter()
                .filter(|(w, _)| *w == primary)
                .fold(ResourceVector::zero(), |acc, (_, v)| acc.add(v));
            let assignment = TaskAssignment {
                assignment_id: Uuid::new_v4(),
                task_id: task.id,
                worker_id: primary.clone(),
                plan: plan.clone(),
                deadline: task.deadline,
                resources: primary_resources,
            };
            let send = Envelope::new(topics::TASK_ASSIGNMENT, &assignment)
                .map(|envelope| (primary.clone(), envelope));
            let sent = match send {
                Ok((peer, envelope)) => self.transport.send(&peer, envelope).await,
                Err(err) => Err(err),
            };
            if let Err(err) = sent {
                self.metrics.record_dispatch_failure();
                self.tracker.untrack(task.id).await;
                self.allocator
                    .release(task.id, AllocationStatus::Preempted, None)
                    .await;
                self.replicate(ClusterEvent::AllocationReleased {
                    task_id: task.id,
                    status: AllocationStatus::Preempted,
                })
                .await;
                self.requeue_undelivered(task, err).await;
                return;
            }
        }
        self.dispatch_attempts.lock().await.remove(&task.id);

        let input_bytes = task.payload.to_string().len();
        self.inflight.lock().await.insert(
            task.id,
            InflightMeta {
                task: task.clone(),
                strategy: plan.strategy,
                input_bytes,
            },
        );
        self.metrics.record_scheduled();
        debug!(task_id = %task.id, worker = %primary, strategy = %plan.strategy, "task dispatched");
    }

    /// Return a task to its original band after a transient failure, or
    /// fail it when the deadline or retry budget is spent.
    async fn requeue(self: &Arc<Self>, mut task: Task, cause: SchedulerError) {
        let now = SystemTime::now();
        if task.deadline_elapsed(now) {
            self.tracker
                .record_unscheduled_failure(&task, TaskStatus::Failed, "deadline exceeded")
                .await;
            return;
        }
        if !task.retry_budget_remaining() {
            self.tracker
                .record_unscheduled_failure(&task, TaskStatus::Failed, &cause.to_string())
                .await;
            return;
        }

        task.retry_count += 1;
        task.status = TaskStatus::Retrying;
        self.metrics.record_requeued();
        debug!(task_id = %task.id, retry = task.retry_count, cause = %cause, "re-queueing task");

        let delay = backoff_delay(&self.config.retry, task.retry_count, task.deadline, now);
        self.spawn_reenqueue(task, delay);
    }

    /// Re-queue after a failed delivery. Dispatch attempts carry their own
    /// counter, separate from the execution retry budget; once it exceeds
    /// the task's retry limit the task fails as a delivery failure.
    async fn requeue_undelivered(self: &Arc<Self>, mut task: Task, cause: SchedulerError) {
        let now = SystemTime::now();
        if task.deadline_elapsed(now) {
            self.dispatch_attempts.lock().await.remove(&task.id);
            self.tracker
                .record_unscheduled_failure(&task, TaskStatus::Failed, "deadline exceeded")
                .await;
            return;
        }

        let attempts = {
            let mut attempts = self.dispatch_attempts.lock().await;
            let entry = attempts.entry(task.id).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempts > task.max_retries {
            self.dispatch_attempts.lock().await.remove(&task.id);
            let reason = SchedulerError::DeliveryFailed {
                task_id: task.id,
                attempts,
            }
            .to_string();
            self.tracker
                .record_unscheduled_failure(&task, TaskStatus::Failed, &reason)
                .await;
            return;
        }

        task.status = TaskStatus::Retrying;
        self.metrics.record_requeued();
        debug!(task_id = %task.id, attempts, cause = %cause, "re-queueing undelivered task");

        let delay = backoff_delay(&self.config.retry, attempts, task.deadline, now);
        self.spawn_reenqueue(task, delay);
    }

    /// Re-enter the task in its original band after the backoff delay.
    fn spawn_reenqueue(&self, task: Task, delay: Duration) {
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = queue.enqueue(task).await {
                warn!(error = %err, "re-enqueue failed");
            }
        });
    }

    // -----------------------------------------------------------------
    // Result fan-in
    // -----------------------------------------------------------------

    async fn handle_result(self: &Arc<Self>, result: TaskResult) {
        let meta = self.inflight.lock().await.remove(&result.task_id);
        self.dispatch_attempts.lock().await.remove(&result.task_id);

        let allocation_status = match result.status {
            TaskStatus::Completed => AllocationStatus::Completed,
            TaskStatus::Cancelled => AllocationStatus::Preempted,
            _ => AllocationStatus::Failed,
        };
        if self
            .allocator
            .release(result.task_id, allocation_status, None)
            .await
        {
            self.replicate(ClusterEvent::AllocationReleased {
                task_id: result.task_id,
                status: allocation_status,
            })
            .await;
        }

        if !result.worker_id.is_empty() {
            self.registry
                .record_outcome(
                    &result.worker_id,
                    result.metrics.success,
                    Duration::from_secs_f64(result.metrics.execution_time_ms / 1000.0),
                )
                .await;
        }

        let Some(meta) = meta else {
            return;
        };

        if self.config.advisor.enabled {
            self.advisor
                .observe(PerformanceRecord {
                    recorded_at: chrono::Utc::now(),
                    task_id: result.task_id,
                    model_name: meta.task.model_name.clone(),
                    task_type: meta.task.task_type,
                    strategy: meta.strategy,
                    latency_ms: result.metrics.execution_time_ms,
                    success: result.metrics.success,
                    input_bytes: meta.input_bytes,
                })
                .await;
        }

        if result.status == TaskStatus::Failed && Self::is_recoverable(result.error.as_deref()) {
            if result.error.as_deref().is_some_and(|e| e.contains("offline")) {
                self.exclude(meta.task.id, result.worker_id.clone()).await;
            }
            let cause = SchedulerError::WorkerOffline {
                worker_id: result.worker_id,
            };
            self.requeue(meta.task, cause).await;
        }
    }

    fn is_recoverable(error: Option<&str>) -> bool {
        error.is_some_and(|reason| {
            reason == "task timeout"
                || reason.contains("offline")
                || reason.contains("unconfirmed after leader change")
        })
    }

    async fn exclude(&self, task_id: TaskId, worker_id: WorkerId) {
        if worker_id.is_empty() {
            return;
        }
        let mut exclusions = self.exclusions.lock().await;
        exclusions
            .entry(task_id)
            .or_default()
            .push((worker_id, Instant::now() + SOFT_EXCLUSION));
    }

    async fn excluded_for(&self, task_id: TaskId) -> HashSet<WorkerId> {
        let now = Instant::now();
        let mut exclusions = self.exclusions.lock().await;
        let Some(entries) = exclusions.get_mut(&task_id) else {
            return HashSet::new();
        };
        entries.retain(|(_, expiry)| *expiry > now);
        let set = entries.iter().map(|(w, _)| w.clone()).collect();
        if entries.is_empty() {
            exclusions.remove(&task_id);
        }
        set
    }

    // -----------------------------------------------------------------
    // Leadership
    // -----------------------------------------------------------------

    /// Propose an event when this node leads and replication is enabled.
    async fn replicate(&self, event: ClusterEvent) {
        if !self.config.cluster.enable_consensus || !self.consensus.is_leader() {
            return;
        }
        if let Err(err) = self.consensus.propose(event).await {
            warn!(error = %err, "event replication failed");
        }
    }

    /// Incoming-leader reconciliation: give workers one grace window to
    /// confirm replicated allocations via heartbeat or progress, then
    /// release whatever stayed silent and re-queue the tasks this node
    /// still has bodies for.
    fn spawn_reconcile(self: &Arc<Self>, token: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!("leadership acquired, reconciling in-flight state");
            let takeover = SystemTime::now();
            tokio::select! {
                _ = tokio::time::sleep(RECONCILE_GRACE) => {}
                _ = token.cancelled() => return,
            }

            let tracked: HashMap<TaskId, SystemTime> = manager
                .tracker
                .all()
                .await
                .into_iter()
                .map(|t| (t.task.id, t.last_progress))
                .collect();

            let mut seen = HashSet::new();
            for allocation in manager.allocator.active_allocations().await {
                if !seen.insert(allocation.task_id) {
                    continue;
                }
                let confirmed = tracked
                    .get(&allocation.task_id)
                    .is_some_and(|last| *last >= takeover);
                if confirmed {
                    continue;
                }

                warn!(
                    task_id = %allocation.task_id,
                    worker = %allocation.worker_id,
                    "allocation unconfirmed after leader change, releasing"
                );
                if tracked.contains_key(&allocation.task_id) {
                    // the tracker fan-in releases and re-queues
                    let _ = manager
                        .tracker
                        .fail(allocation.task_id, "unconfirmed after leader change")
                        .await;
                } else {
                    manager
                        .allocator
                        .release(allocation.task_id, AllocationStatus::Preempted, None)
                        .await;
                    manager
                        .replicate(ClusterEvent::AllocationReleased {
                            task_id: allocation.task_id,
                            status: AllocationStatus::Preempted,
                        })
                        .await;
                    let meta = manager.inflight.lock().await.remove(&allocation.task_id);
                    match meta {
                        Some(meta) => manager.requeue(meta.task, SchedulerError::LeaderLost).await,
                        None => warn!(
                            task_id = %allocation.task_id,
                            "no local task body to re-queue, awaiting resubmission"
                        ),
                    }
                }
            }
        });
    }

    async fn refresh_gauges(&self) {
        self.metrics
            .set_queue_depth("high", self.queue.band_len(Band::High));
        self.metrics
            .set_queue_depth("normal", self.queue.band_len(Band::Normal));
        self.metrics
            .set_queue_depth("low", self.queue.band_len(Band::Low));
        let stats = self.registry.stats().await;
        self.metrics.set_workers("total", stats.total);
        self.metrics.set_workers("active", stats.active);
        self.metrics.set_workers("idle", stats.idle);
        self.metrics.set_workers("offline", stats.offline);
        self.metrics
            .set_active_allocations(self.allocator.active_count().await);
        self.metrics
            .set_tracked_tasks(self.tracker.active_count().await);
        self.revision.fetch_add(1, Ordering::Relaxed);
        self.allocator.compact(1_024).await;
    }
}

fn initialize_logging(config: &SchedulerConfig) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(config.cluster.log_level.as_str())
        .try_init();
}

/// Exponential backoff for re-queue attempt `attempt` (1-based): the base
/// delay grows by the configured multiplier per attempt, is capped at the
/// configured ceiling, carries ±20 % jitter, and never outlives the task's
/// remaining deadline budget.
fn backoff_delay(
    settings: &RetrySettings,
    attempt: u32,
    deadline: Option<SystemTime>,
    now: SystemTime,
) -> Duration {
    let base = settings.base_delay_ms as f64;
    let growth = settings
        .backoff_multiplier
        .powi(attempt.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    let capped = (base * growth * jitter).min(settings.max_delay_ms as f64);
    let mut delay = Duration::from_millis(capped as u64);
    if let Some(deadline) = deadline {
        let remaining = deadline.duration_since(now).unwrap_or(Duration::ZERO);
        delay = delay.min(remaining);
    }
    delay
}

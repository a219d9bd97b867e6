//! Task tracker: owns every assignment from dispatch to terminal status.
//!
//! ## Architecture
//!
//! The tracker holds the active-assignment map behind its own lock and
//! publishes every terminal outcome to a bounded results channel. The
//! manager's fan-in loop consumes that channel to release reservations,
//! update worker statistics, and feed the advisor, so the tracker itself
//! never reaches into other components.
//!
//! A timeout sweeper runs at the cleanup cadence and fails assignments
//! whose execution budget elapsed. A result that cannot be published
//! within five seconds is logged and dropped rather than deadlocking the
//! sweeper behind a full channel; consumers that need durability must
//! drain the channel promptly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TrackerSettings;
use crate::metrics::MetricsCollector;
use crate::types::{
    ExecutionMetrics, SchedulerError, SchedulerResult, Task, TaskId, TaskResult, TaskStatus,
    WorkerId,
};

/// Heartbeats retained per assignment; older entries are dropped.
const HEARTBEAT_CAP: usize = 10;

/// Deadline for publishing one result before it is dropped.
const RESULT_PUBLISH_DEADLINE: Duration = Duration::from_secs(5);

/// Terminal results retained in the in-memory history ring.
const HISTORY_CAP: usize = 1_000;

/// An assignment currently in flight.
#[derive(Debug, Clone)]
pub struct TrackedTask {
    /// The task under execution
    pub task: Task,
    /// Worker holding the assignment
    pub worker_id: WorkerId,
    /// Dispatch time
    pub started_at: SystemTime,
    /// Last progress or heartbeat time
    pub last_progress: SystemTime,
    /// Progress in [0, 1]
    pub progress: f64,
    /// Scheduled until the worker reports, then running
    pub status: TaskStatus,
    /// Rolling heartbeat history, newest last
    pub heartbeats: VecDeque<SystemTime>,
}

/// Derived tracker counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct TrackerStats {
    /// Assignments in flight
    pub active: usize,
    /// Terminal successes
    pub completed: u64,
    /// Terminal failures
    pub failed: u64,
    /// Cancellations
    pub cancelled: u64,
    /// completed / (completed + failed)
    pub success_rate: f64,
    /// Mean execution time, milliseconds
    pub avg_execution_ms: f64,
    /// Mean queue wait, milliseconds
    pub avg_queue_ms: f64,
}

/// In-flight assignment state and result fan-in.
pub struct TaskTracker {
    settings: TrackerSettings,
    active: RwLock<HashMap<TaskId, TrackedTask>>,
    history: Mutex<VecDeque<TaskResult>>,
    results_tx: async_channel::Sender<TaskResult>,
    results_rx: async_channel::Receiver<TaskResult>,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    execution_ms_sum: AtomicU64,
    queue_ms_sum: AtomicU64,
    metrics: Arc<MetricsCollector>,
}

impl TaskTracker {
    /// Create a tracker with a bounded results channel.
    pub fn new(settings: TrackerSettings, metrics: Arc<MetricsCollector>) -> Arc<Self> {
        let (results_tx, results_rx) = async_channel::bounded(settings.result_buffer_size.max(1));
        Arc::new(Self {
            settings,
            active: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            results_tx,
            results_rx,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            execution_ms_sum: AtomicU64::new(0),
            queue_ms_sum: AtomicU64::new(0),
            metrics,
        })
    }

    /// Receiver of terminal results, in completion order.
    pub fn results(&self) -> async_channel::Receiver<TaskResult> {
        self.results_rx.clone()
    }

    /// Begin tracking an assignment. A task id may be tracked at most
    /// once at a time.
    pub async fn track(&self, mut task: Task, worker_id: WorkerId) -> SchedulerResult<()> {
        let now = SystemTime::now();
        task.status = TaskStatus::Scheduled;
        task.scheduled_at = Some(now);
        let task_id = task.id;

        let mut active = self.active.write().await;
        if active.contains_key(&task_id) {
            return Err(SchedulerError::Internal(format!(
                "task {task_id} is already tracked"
            )));
        }
        active.insert(
            task_id,
            TrackedTask {
                task,
                worker_id: worker_id.clone(),
                started_at: now,
                last_progress: now,
                progress: 0.0,
                status: TaskStatus::Scheduled,
                heartbeats: VecDeque::with_capacity(HEARTBEAT_CAP),
            },
        );
        debug!(%task_id, worker = %worker_id, "tracking assignment");
        Ok(())
    }

    /// Stop tracking without producing a result, returning the tracker to
    /// its pre-track state for this id.
    pub async fn untrack(&self, task_id: TaskId) -> Option<TrackedTask> {
        self.active.write().await.remove(&task_id)
    }

    /// Record a progress report; refreshes the liveness timestamp and the
    /// bounded heartbeat history.
    pub async fn update_progress(&self, task_id: TaskId, fraction: f64) -> SchedulerResult<()> {
        let mut active = self.active.write().await;
        let tracked = active
            .get_mut(&task_id)
            .ok_or_else(|| SchedulerError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            })?;
        let now = SystemTime::now();
        tracked.progress = fraction.clamp(0.0, 1.0);
        tracked.last_progress = now;
        tracked.status = TaskStatus::Running;
        tracked.task.status = TaskStatus::Running;
        if tracked.task.started_at.is_none() {
            tracked.task.started_at = Some(now);
        }
        if tracked.heartbeats.len() >= HEARTBEAT_CAP {
            tracked.heartbeats.pop_front();
        }
        tracked.heartbeats.push_back(now);
        Ok(())
    }

    /// Refresh an assignment's liveness without changing its progress.
    /// Used when a heartbeat names the task without a progress figure.
    pub async fn touch(&self, task_id: TaskId) -> SchedulerResult<()> {
        let mut active = self.active.write().await;
        let tracked = active
            .get_mut(&task_id)
            .ok_or_else(|| SchedulerError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            })?;
        let now = SystemTime::now();
        tracked.last_progress = now;
        if tracked.heartbeats.len() >= HEARTBEAT_CAP {
            tracked.heartbeats.pop_front();
        }
        tracked.heartbeats.push_back(now);
        Ok(())
    }

    /// Record a terminal failure for a task that never reached dispatch
    /// (deadline expired in the queue, retries exhausted before placement).
    /// Keeps every task id accounted for in exactly one place.
    pub async fn record_unscheduled_failure(
        &self,
        task: &Task,
        status: TaskStatus,
        reason: &str,
    ) -> TaskResult {
        let now = SystemTime::now();
        let queue_time = task
            .enqueued_at
            .and_then(|t| now.duration_since(t).ok())
            .unwrap_or_default();
        let duration = now.duration_since(task.created_at).unwrap_or_default();
        let result = TaskResult {
            task_id: task.id,
            worker_id: WorkerId::new(),
            status,
            payload: None,
            error: Some(reason.to_string()),
            metrics: ExecutionMetrics {
                started_at: now,
                finished_at: now,
                duration_ms: duration.as_secs_f64() * 1000.0,
                queue_time_ms: queue_time.as_secs_f64() * 1000.0,
                execution_time_ms: 0.0,
                success: false,
                error_count: task.retry_count,
            },
            completed_at: now,
        };
        match status {
            TaskStatus::Cancelled => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_cancelled();
            }
            _ => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_terminal(false, Duration::ZERO);
            }
        }
        self.remember(result.clone()).await;
        self.publish(result.clone()).await;
        result
    }

    /// Finish an assignment successfully.
    pub async fn complete(
        &self,
        task_id: TaskId,
        payload: serde_json::Value,
    ) -> SchedulerResult<TaskResult> {
        self.finish(task_id, TaskStatus::Completed, Some(payload), None)
            .await
    }

    /// Finish an assignment unsuccessfully.
    pub async fn fail(&self, task_id: TaskId, reason: &str) -> SchedulerResult<TaskResult> {
        self.finish(task_id, TaskStatus::Failed, None, Some(reason.to_string()))
            .await
    }

    /// Finish an assignment as cancelled.
    pub async fn cancel(&self, task_id: TaskId) -> SchedulerResult<TaskResult> {
        self.finish(
            task_id,
            TaskStatus::Cancelled,
            None,
            Some("cancelled by caller".to_string()),
        )
        .await
    }

    async fn finish(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        payload: Option<serde_json::Value>,
        error: Option<String>,
    ) -> SchedulerResult<TaskResult> {
        let tracked = {
            let mut active = self.active.write().await;
            active
                .remove(&task_id)
                .ok_or_else(|| SchedulerError::NotFound {
                    kind: "task",
                    id: task_id.to_string(),
                })?
        };

        let now = SystemTime::now();
        let queue_time = tracked
            .task
            .enqueued_at
            .and_then(|t| tracked.started_at.duration_since(t).ok())
            .unwrap_or_default();
        let execution_time = now.duration_since(tracked.started_at).unwrap_or_default();
        let duration = now
            .duration_since(tracked.task.created_at)
            .unwrap_or_default();
        let success = status == TaskStatus::Completed;

        let result = TaskResult {
            task_id,
            worker_id: tracked.worker_id.clone(),
            status,
            payload,
            error,
            metrics: ExecutionMetrics {
                started_at: tracked.started_at,
                finished_at: now,
                duration_ms: duration.as_secs_f64() * 1000.0,
                queue_time_ms: queue_time.as_secs_f64() * 1000.0,
                execution_time_ms: execution_time.as_secs_f64() * 1000.0,
                success,
                error_count: tracked.task.retry_count,
            },
            completed_at: now,
        };

        match status {
            TaskStatus::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            TaskStatus::Cancelled => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_cancelled();
            }
            _ => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        if status != TaskStatus::Cancelled {
            self.metrics.record_terminal(success, execution_time);
        }
        self.execution_ms_sum
            .fetch_add(execution_time.as_millis() as u64, Ordering::Relaxed);
        self.queue_ms_sum
            .fetch_add(queue_time.as_millis() as u64, Ordering::Relaxed);

        self.remember(result.clone()).await;
        self.publish(result.clone()).await;
        Ok(result)
    }

    async fn remember(&self, result: TaskResult) {
        let mut history = self.history.lock().await;
        if history.len() >= HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(result);
    }

    /// Publish with a bounded deadline; a full channel past the deadline
    /// drops the result rather than wedging the caller.
    async fn publish(&self, result: TaskResult) {
        let task_id = result.task_id;
        let send = self.results_tx.send(result);
        if tokio::time::timeout(RESULT_PUBLISH_DEADLINE, send)
            .await
            .is_err()
        {
            warn!(%task_id, "results channel full past deadline, dropping result");
        }
    }

    /// Assignments held by one worker.
    pub async fn by_worker(&self, worker_id: &WorkerId) -> Vec<TrackedTask> {
        self.active
            .read()
            .await
            .values()
            .filter(|t| &t.worker_id == worker_id)
            .cloned()
            .collect()
    }

    /// Every in-flight assignment.
    pub async fn all(&self) -> Vec<TrackedTask> {
        self.active.read().await.values().cloned().collect()
    }

    /// Whether an id is currently tracked.
    pub async fn is_tracked(&self, task_id: TaskId) -> bool {
        self.active.read().await.contains_key(&task_id)
    }

    /// Terminal result recorded for an id, if still in the history ring.
    pub async fn recorded_result(&self, task_id: TaskId) -> Option<TaskResult> {
        self.history
            .lock()
            .await
            .iter()
            .rev()
            .find(|r| r.task_id == task_id)
            .cloned()
    }

    /// In-flight assignment count.
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// One sweep: fail every assignment whose execution budget elapsed.
    /// Returns the produced results.
    pub async fn sweep(&self, now: SystemTime) -> Vec<TaskResult> {
        let budget = self.settings.task_timeout();
        let expired: Vec<TaskId> = {
            let active = self.active.read().await;
            active
                .values()
                .filter(|t| {
                    now.duration_since(t.started_at)
                        .map(|elapsed| elapsed > budget)
                        .unwrap_or(false)
                })
                .map(|t| t.task.id)
                .collect()
        };

        let mut results = Vec::with_capacity(expired.len());
        for task_id in expired {
            warn!(%task_id, "task exceeded execution budget");
            if let Ok(result) = self.fail(task_id, "task timeout").await {
                results.push(result);
            }
        }
        results
    }

    /// Fail every assignment held by a worker that went offline.
    pub async fn invalidate_worker(&self, worker_id: &WorkerId) -> Vec<TaskResult> {
        let held: Vec<TaskId> = {
            let active = self.active.read().await;
            active
                .values()
                .filter(|t| &t.worker_id == worker_id)
                .map(|t| t.task.id)
                .collect()
        };

        let mut results = Vec::with_capacity(held.len());
        for task_id in held {
            warn!(%task_id, worker = %worker_id, "invalidating assignment, worker offline");
            if let Ok(result) = self
                .finish(
                    task_id,
                    TaskStatus::Failed,
                    None,
                    Some(format!("worker {worker_id} offline during execution")),
                )
                .await
            {
                results.push(result);
            }
        }
        results
    }

    /// Spawn the timeout sweeper and gauge refresher.
    pub fn spawn_loops(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let sweeper = {
            let tracker = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(tracker.settings.cleanup_interval());
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            tracker.sweep(SystemTime::now()).await;
                        }
                        _ = token.cancelled() => {
                            debug!("tracker sweeper stopped");
                            break;
                        }
                    }
                }
            })
        };

        let gauges = {
            let tracker = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(tracker.settings.cleanup_interval());
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let count = tracker.active_count().await;
                            tracker.metrics.set_tracked_tasks(count);
                        }
                        _ = token.cancelled() => {
                            debug!("tracker gauge loop stopped");
                            break;
                        }
                    }
                }
            })
        };

        vec![sweeper, gauges]
    }

    /// Derived counters.
    pub async fn stats(&self) -> TrackerStats {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let terminal = completed + failed;
        let all_terminal = terminal + self.cancelled.load(Ordering::Relaxed);
        TrackerStats {
            active: self.active_count().await,
            completed,
            failed,
            cancelled: self.cancelled.load(Ordering::Relaxed),
            success_rate: if terminal == 0 {
                1.0
            } else {
                completed as f64 / terminal as f64
            },
            avg_execution_ms: if all_terminal == 0 {
                0.0
            } else {
                self.execution_ms_sum.load(Ordering::Relaxed) as f64 / all_terminal as f64
            },
            avg_queue_ms: if all_terminal == 0 {
                0.0
            } else {
                self.queue_ms_sum.load(Ordering::Relaxed) as f64 / all_terminal as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;

    fn tracker() -> Arc<TaskTracker> {
        TaskTracker::new(
            TrackerSettings::default(),
            Arc::new(MetricsCollector::new().unwrap()),
        )
    }

    fn task() -> Task {
        let mut task = Task::new(TaskType::Inference, "llama-7b");
        task.enqueued_at = Some(SystemTime::now());
        task
    }

    #[tokio::test]
    async fn track_then_untrack_restores_state() {
        let tracker = tracker();
        let t = task();
        let id = t.id;
        assert_eq!(tracker.active_count().await, 0);
        tracker.track(t, "w1".to_string()).await.unwrap();
        assert_eq!(tracker.active_count().await, 1);
        let removed = tracker.untrack(id).await.unwrap();
        assert_eq!(removed.task.id, id);
        assert_eq!(tracker.active_count().await, 0);
        assert!(tracker.recorded_result(id).await.is_none());
    }

    #[tokio::test]
    async fn double_track_is_rejected() {
        let tracker = tracker();
        let t = task();
        tracker.track(t.clone(), "w1".to_string()).await.unwrap();
        assert!(tracker.track(t, "w2".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn complete_publishes_result() {
        let tracker = tracker();
        let t = task();
        let id = t.id;
        let results = tracker.results();

        tracker.track(t, "w1".to_string()).await.unwrap();
        tracker.update_progress(id, 0.5).await.unwrap();
        tracker
            .complete(id, serde_json::json!({"tokens": 42}))
            .await
            .unwrap();

        let result = results.recv().await.unwrap();
        assert_eq!(result.task_id, id);
        assert_eq!(result.status, TaskStatus::Completed);
        assert!(result.metrics.success);
        assert!(!tracker.is_tracked(id).await);
        assert!(tracker.recorded_result(id).await.is_some());
    }

    #[tokio::test]
    async fn heartbeat_history_is_capped() {
        let tracker = tracker();
        let t = task();
        let id = t.id;
        tracker.track(t, "w1".to_string()).await.unwrap();
        for i in 0..25 {
            tracker.update_progress(id, i as f64 / 25.0).await.unwrap();
        }
        let tracked = tracker.all().await.into_iter().next().unwrap();
        assert_eq!(tracked.heartbeats.len(), HEARTBEAT_CAP);
        assert!(tracked.progress > 0.9);
    }

    #[tokio::test]
    async fn sweep_fails_expired_tasks() {
        let tracker = TaskTracker::new(
            TrackerSettings {
                task_timeout_secs: 1,
                ..TrackerSettings::default()
            },
            Arc::new(MetricsCollector::new().unwrap()),
        );
        let t = task();
        let id = t.id;
        tracker.track(t, "w1".to_string()).await.unwrap();

        let later = SystemTime::now() + Duration::from_secs(5);
        let failed = tracker.sweep(later).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task_id, id);
        assert_eq!(failed[0].error.as_deref(), Some("task timeout"));
        assert!(!tracker.is_tracked(id).await);
    }

    #[tokio::test]
    async fn invalidate_worker_fails_only_its_tasks() {
        let tracker = tracker();
        let a = task();
        let b = task();
        let b_id = b.id;
        tracker.track(a, "w1".to_string()).await.unwrap();
        tracker.track(b, "w2".to_string()).await.unwrap();

        let invalidated = tracker.invalidate_worker(&"w1".to_string()).await;
        assert_eq!(invalidated.len(), 1);
        assert!(invalidated[0]
            .error
            .as_deref()
            .unwrap()
            .contains("offline"));
        assert!(tracker.is_tracked(b_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn full_results_channel_drops_instead_of_blocking() {
        let tracker = TaskTracker::new(
            TrackerSettings {
                result_buffer_size: 1,
                ..TrackerSettings::default()
            },
            Arc::new(MetricsCollector::new().unwrap()),
        );
        // nobody drains the channel; the first result fills it
        let first = task();
        tracker.track(first.clone(), "w1".to_string()).await.unwrap();
        tracker
            .complete(first.id, serde_json::Value::Null)
            .await
            .unwrap();

        let second = task();
        let second_id = second.id;
        tracker.track(second, "w1".to_string()).await.unwrap();
        let started = std::time::Instant::now();
        tracker.fail(second_id, "boom").await.unwrap();
        // returned after the publish deadline, not forever
        assert!(started.elapsed() < Duration::from_secs(10));
        // both outcomes are still counted even though one was dropped
        let stats = tracker.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
    }
}

//! Priority-classed task queue with bounded bands.
//!
//! ## Architecture
//!
//! Three bounded channels, one per priority band: high (critical + high),
//! normal, and low. Band capacities derive from the configured maximum size
//! and three ratios summing to 1. Bounded channels give natural
//! backpressure; dequeue polls the bands in strict priority order, which
//! keeps the ordering invariant simple — deadline-based expulsion in the
//! manager prevents silent indefinite retention of low-priority tasks.
//!
//! Enqueue blocks up to the configured timeout and fails with `queue_full`
//! on deadline or `queue_stopped` after shutdown. Dequeue never blocks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::QueueSettings;
use crate::metrics::MetricsCollector;
use crate::types::{SchedulerError, SchedulerResult, Task, TaskId, TaskPriority, TaskStatus};

/// The three priority bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// Critical and high priority tasks
    High,
    /// Normal priority tasks
    Normal,
    /// Low priority tasks
    Low,
}

impl Band {
    /// Band a priority class routes to.
    pub fn for_priority(priority: TaskPriority) -> Band {
        match priority {
            TaskPriority::Critical | TaskPriority::High => Band::High,
            TaskPriority::Normal => Band::Normal,
            TaskPriority::Low => Band::Low,
        }
    }

    /// Metrics label for the band.
    pub fn as_str(&self) -> &'static str {
        match self {
            Band::High => "high",
            Band::Normal => "normal",
            Band::Low => "low",
        }
    }
}

struct BandChannel {
    tx: async_channel::Sender<Task>,
    rx: async_channel::Receiver<Task>,
    len: AtomicUsize,
}

impl BandChannel {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            len: AtomicUsize::new(0),
        }
    }
}

/// Bounded priority queue shared between the API surface and the
/// scheduler loop.
pub struct TaskQueue {
    settings: QueueSettings,
    high: BandChannel,
    normal: BandChannel,
    low: BandChannel,
    cancelled: Mutex<HashSet<TaskId>>,
    queued_ids: Mutex<HashSet<TaskId>>,
    stopped: AtomicBool,
    metrics: Arc<MetricsCollector>,
}

impl TaskQueue {
    /// Create a queue with band capacities split by the configured ratios.
    pub fn new(settings: QueueSettings, metrics: Arc<MetricsCollector>) -> Arc<Self> {
        let ratios = settings.priority_ratios;
        let max = settings.max_queue_size;
        let high_cap = (max as f64 * ratios.high).floor() as usize;
        let normal_cap = (max as f64 * ratios.normal).floor() as usize;
        let low_cap = max.saturating_sub(high_cap + normal_cap);
        Arc::new(Self {
            settings,
            high: BandChannel::new(high_cap),
            normal: BandChannel::new(normal_cap),
            low: BandChannel::new(low_cap),
            cancelled: Mutex::new(HashSet::new()),
            queued_ids: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
            metrics,
        })
    }

    fn band(&self, band: Band) -> &BandChannel {
        match band {
            Band::High => &self.high,
            Band::Normal => &self.normal,
            Band::Low => &self.low,
        }
    }

    /// Route a task to its band, waiting up to the enqueue timeout for
    /// space. The task is stamped `Queued` with its enqueue time.
    pub async fn enqueue(&self, mut task: Task) -> SchedulerResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::QueueStopped);
        }

        let band = Band::for_priority(task.priority);
        task.status = TaskStatus::Queued;
        task.enqueued_at = Some(SystemTime::now());
        let task_id = task.id;

        let channel = self.band(band);
        let send = channel.tx.send(task);
        match tokio::time::timeout(self.settings.queue_timeout(), send).await {
            Ok(Ok(())) => {
                channel.len.fetch_add(1, Ordering::SeqCst);
                self.queued_ids.lock().await.insert(task_id);
                self.metrics.record_enqueued(band.as_str());
                debug!(%task_id, band = band.as_str(), "task enqueued");
                Ok(())
            }
            Ok(Err(_)) => Err(SchedulerError::QueueStopped),
            Err(_) => Err(SchedulerError::QueueFull),
        }
    }

    /// Pull the next task: high drains before normal drains before low.
    /// Never blocks; `None` means every band is empty. Cancelled tasks are
    /// skipped and dropped here.
    pub async fn dequeue(&self) -> SchedulerResult<Option<Task>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::QueueStopped);
        }
        for band in [Band::High, Band::Normal, Band::Low] {
            let channel = self.band(band);
            while let Ok(task) = channel.rx.try_recv() {
                channel.len.fetch_sub(1, Ordering::SeqCst);
                self.queued_ids.lock().await.remove(&task.id);
                if self.take_cancelled(task.id).await {
                    debug!(task_id = %task.id, "dropping cancelled task at dequeue");
                    continue;
                }
                if let Some(enqueued_at) = task.enqueued_at {
                    if let Ok(wait) = SystemTime::now().duration_since(enqueued_at) {
                        self.metrics.record_dequeued(wait);
                    }
                }
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Tombstone a queued task so it is dropped at dequeue. Returns false
    /// when the id is not currently queued.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        if !self.queued_ids.lock().await.remove(&task_id) {
            return false;
        }
        // Bounded by queue capacity: tombstones are consumed at dequeue and
        // a task id can occupy at most one band slot.
        self.cancelled.lock().await.insert(task_id)
    }

    /// Whether an id is currently queued.
    pub async fn contains(&self, task_id: TaskId) -> bool {
        self.queued_ids.lock().await.contains(&task_id)
    }

    async fn take_cancelled(&self, task_id: TaskId) -> bool {
        self.cancelled.lock().await.remove(&task_id)
    }

    /// Total queued tasks across all bands.
    pub fn len(&self) -> usize {
        self.band_len(Band::High) + self.band_len(Band::Normal) + self.band_len(Band::Low)
    }

    /// Whether every band is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued tasks in one band.
    pub fn band_len(&self, band: Band) -> usize {
        self.band(band).len.load(Ordering::SeqCst)
    }

    /// Whether the queue has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the queue: subsequent enqueues and dequeues fail with
    /// `queue_stopped`. Queued tasks remain drainable via [`Self::clear`].
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Best-effort drain of all bands; resets size counters and returns
    /// the drained tasks.
    pub async fn clear(&self) -> Vec<Task> {
        let mut drained = Vec::new();
        for band in [Band::High, Band::Normal, Band::Low] {
            let channel = self.band(band);
            while let Ok(task) = channel.rx.try_recv() {
                drained.push(task);
            }
            channel.len.store(0, Ordering::SeqCst);
        }
        self.cancelled.lock().await.clear();
        self.queued_ids.lock().await.clear();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;
    use std::time::Duration;

    fn queue_with(max: usize, timeout_ms: u64) -> Arc<TaskQueue> {
        let settings = QueueSettings {
            max_queue_size: max,
            queue_timeout_ms: timeout_ms,
            ..QueueSettings::default()
        };
        TaskQueue::new(settings, Arc::new(MetricsCollector::new().unwrap()))
    }

    fn task(priority: TaskPriority) -> Task {
        let mut task = Task::new(TaskType::Inference, "llama-7b");
        task.priority = priority;
        task
    }

    #[tokio::test]
    async fn strict_priority_order() {
        let queue = queue_with(30, 100);
        let low = task(TaskPriority::Low);
        let normal = task(TaskPriority::Normal);
        let critical = task(TaskPriority::Critical);
        queue.enqueue(low.clone()).await.unwrap();
        queue.enqueue(normal.clone()).await.unwrap();
        queue.enqueue(critical.clone()).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        let second = queue.dequeue().await.unwrap().unwrap();
        let third = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.id, critical.id);
        assert_eq!(second.id, normal.id);
        assert_eq!(third.id, low.id);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn size_equals_sum_of_bands() {
        let queue = queue_with(30, 100);
        queue.enqueue(task(TaskPriority::High)).await.unwrap();
        queue.enqueue(task(TaskPriority::Normal)).await.unwrap();
        queue.enqueue(task(TaskPriority::Normal)).await.unwrap();
        queue.enqueue(task(TaskPriority::Low)).await.unwrap();

        assert_eq!(queue.band_len(Band::High), 1);
        assert_eq!(queue.band_len(Band::Normal), 2);
        assert_eq!(queue.band_len(Band::Low), 1);
        assert_eq!(
            queue.len(),
            queue.band_len(Band::High) + queue.band_len(Band::Normal) + queue.band_len(Band::Low)
        );
    }

    #[tokio::test]
    async fn full_band_fails_within_timeout() {
        // 10 slots split 3/5/2; the normal band holds 5
        let queue = queue_with(10, 50);
        for _ in 0..5 {
            queue.enqueue(task(TaskPriority::Normal)).await.unwrap();
        }
        let started = std::time::Instant::now();
        let result = queue.enqueue(task(TaskPriority::Normal)).await;
        assert!(matches!(result, Err(SchedulerError::QueueFull)));
        assert!(started.elapsed() < Duration::from_millis(500));
        // other bands are unaffected
        queue.enqueue(task(TaskPriority::Critical)).await.unwrap();
    }

    #[tokio::test]
    async fn stopped_queue_rejects() {
        let queue = queue_with(10, 50);
        queue.stop();
        assert!(matches!(
            queue.enqueue(task(TaskPriority::Normal)).await,
            Err(SchedulerError::QueueStopped)
        ));
        assert!(matches!(
            queue.dequeue().await,
            Err(SchedulerError::QueueStopped)
        ));
    }

    #[tokio::test]
    async fn cancelled_task_is_dropped_at_dequeue() {
        let queue = queue_with(30, 100);
        let doomed = task(TaskPriority::Normal);
        let survivor = task(TaskPriority::Normal);
        queue.enqueue(doomed.clone()).await.unwrap();
        queue.enqueue(survivor.clone()).await.unwrap();
        queue.cancel(doomed.id).await;

        let next = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(next.id, survivor.id);
    }

    #[tokio::test]
    async fn clear_resets_counters() {
        let queue = queue_with(30, 100);
        queue.enqueue(task(TaskPriority::High)).await.unwrap();
        queue.enqueue(task(TaskPriority::Low)).await.unwrap();
        let drained = queue.clear().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.len(), 0);
    }
}

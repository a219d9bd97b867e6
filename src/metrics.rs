//! Scheduler metrics: prometheus counters, gauges, and histograms plus a
//! typed in-process snapshot.
//!
//! One collector is shared by every component. Counters and histograms are
//! updated inline on the hot paths; gauges are refreshed by the manager's
//! monitoring loop. The registry is exported as prometheus text through
//! [`MetricsCollector::export`] so an external scrape integration can serve
//! it without this crate owning an HTTP surface.

use prometheus::{
    histogram_opts, opts, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::{SchedulerError, SchedulerResult};

/// Shared metrics collector for the scheduler core.
pub struct MetricsCollector {
    registry: Registry,

    tasks_enqueued: IntCounterVec,
    tasks_dequeued: IntCounter,
    tasks_scheduled: IntCounter,
    tasks_completed: IntCounter,
    tasks_failed: IntCounter,
    tasks_cancelled: IntCounter,
    tasks_requeued: IntCounter,
    advisor_timeouts: IntCounter,
    dispatch_failures: IntCounter,

    queue_depth: IntGaugeVec,
    workers_by_status: IntGaugeVec,
    active_allocations: IntGauge,
    tracked_tasks: IntGauge,

    queue_wait: Histogram,
    selection_latency: Histogram,
    execution_time: Histogram,

    selections_total: IntCounterVec,
    selection_failures: IntCounter,

    // Running sums kept outside prometheus so the snapshot can report
    // means without scraping histogram buckets.
    execution_ms_sum: AtomicU64,
    execution_count: AtomicU64,
    queue_ms_sum: AtomicU64,
    queue_count: AtomicU64,
}

impl MetricsCollector {
    /// Create a collector with all series registered.
    pub fn new() -> SchedulerResult<Self> {
        let registry = Registry::new();

        let tasks_enqueued = IntCounterVec::new(
            opts!("scheduler_tasks_enqueued_total", "Tasks accepted per band"),
            &["band"],
        )?;
        let tasks_dequeued = IntCounter::with_opts(opts!(
            "scheduler_tasks_dequeued_total",
            "Tasks pulled off the queue"
        ))?;
        let tasks_scheduled = IntCounter::with_opts(opts!(
            "scheduler_tasks_scheduled_total",
            "Tasks dispatched with a plan and reservation"
        ))?;
        let tasks_completed = IntCounter::with_opts(opts!(
            "scheduler_tasks_completed_total",
            "Tasks finished successfully"
        ))?;
        let tasks_failed = IntCounter::with_opts(opts!(
            "scheduler_tasks_failed_total",
            "Tasks finished unsuccessfully"
        ))?;
        let tasks_cancelled = IntCounter::with_opts(opts!(
            "scheduler_tasks_cancelled_total",
            "Tasks cancelled before completion"
        ))?;
        let tasks_requeued = IntCounter::with_opts(opts!(
            "scheduler_tasks_requeued_total",
            "Tasks returned to their band after a transient failure"
        ))?;
        let advisor_timeouts = IntCounter::with_opts(opts!(
            "scheduler_advisor_timeouts_total",
            "Recommendations that exceeded the advisor decision budget"
        ))?;
        let dispatch_failures = IntCounter::with_opts(opts!(
            "scheduler_dispatch_failures_total",
            "Assignment sends the transport could not deliver"
        ))?;

        let queue_depth = IntGaugeVec::new(
            opts!("scheduler_queue_depth", "Queued tasks per band"),
            &["band"],
        )?;
        let workers_by_status = IntGaugeVec::new(
            opts!("scheduler_workers", "Registered workers per status"),
            &["status"],
        )?;
        let active_allocations = IntGauge::with_opts(opts!(
            "scheduler_active_allocations",
            "Reservations currently holding capacity"
        ))?;
        let tracked_tasks = IntGauge::with_opts(opts!(
            "scheduler_tracked_tasks",
            "Assignments currently in flight"
        ))?;

        let queue_wait = Histogram::with_opts(histogram_opts!(
            "scheduler_queue_wait_seconds",
            "Time from enqueue to dequeue",
            vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
        ))?;
        let selection_latency = Histogram::with_opts(histogram_opts!(
            "scheduler_selection_seconds",
            "Load balancer selection latency",
            vec![0.00001, 0.0001, 0.001, 0.01, 0.1]
        ))?;
        let execution_time = Histogram::with_opts(histogram_opts!(
            "scheduler_execution_seconds",
            "Task execution time as reported by workers",
            vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]
        ))?;

        let selections_total = IntCounterVec::new(
            opts!(
                "scheduler_selections_total",
                "Worker selections per algorithm"
            ),
            &["algorithm"],
        )?;
        let selection_failures = IntCounter::with_opts(opts!(
            "scheduler_selection_failures_total",
            "Selection calls that found no suitable worker"
        ))?;

        registry.register(Box::new(tasks_enqueued.clone()))?;
        registry.register(Box::new(tasks_dequeued.clone()))?;
        registry.register(Box::new(tasks_scheduled.clone()))?;
        registry.register(Box::new(tasks_completed.clone()))?;
        registry.register(Box::new(tasks_failed.clone()))?;
        registry.register(Box::new(tasks_cancelled.clone()))?;
        registry.register(Box::new(tasks_requeued.clone()))?;
        registry.register(Box::new(advisor_timeouts.clone()))?;
        registry.register(Box::new(dispatch_failures.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(workers_by_status.clone()))?;
        registry.register(Box::new(active_allocations.clone()))?;
        registry.register(Box::new(tracked_tasks.clone()))?;
        registry.register(Box::new(queue_wait.clone()))?;
        registry.register(Box::new(selection_latency.clone()))?;
        registry.register(Box::new(execution_time.clone()))?;
        registry.register(Box::new(selections_total.clone()))?;
        registry.register(Box::new(selection_failures.clone()))?;

        Ok(Self {
            registry,
            tasks_enqueued,
            tasks_dequeued,
            tasks_scheduled,
            tasks_completed,
            tasks_failed,
            tasks_cancelled,
            tasks_requeued,
            advisor_timeouts,
            dispatch_failures,
            queue_depth,
            workers_by_status,
            active_allocations,
            tracked_tasks,
            queue_wait,
            selection_latency,
            execution_time,
            selections_total,
            selection_failures,
            execution_ms_sum: AtomicU64::new(0),
            execution_count: AtomicU64::new(0),
            queue_ms_sum: AtomicU64::new(0),
            queue_count: AtomicU64::new(0),
        })
    }

    /// Record a task accepted into `band`.
    pub fn record_enqueued(&self, band: &str) {
        self.tasks_enqueued.with_label_values(&[band]).inc();
    }

    /// Record a dequeue along with the time the task waited.
    pub fn record_dequeued(&self, wait: Duration) {
        self.tasks_dequeued.inc();
        self.queue_wait.observe(wait.as_secs_f64());
        self.queue_ms_sum
            .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
        self.queue_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful dispatch.
    pub fn record_scheduled(&self) {
        self.tasks_scheduled.inc();
    }

    /// Record a terminal outcome along with its execution time.
    pub fn record_terminal(&self, success: bool, execution: Duration) {
        if success {
            self.tasks_completed.inc();
        } else {
            self.tasks_failed.inc();
        }
        self.execution_time.observe(execution.as_secs_f64());
        self.execution_ms_sum
            .fetch_add(execution.as_millis() as u64, Ordering::Relaxed);
        self.execution_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cancellation.
    pub fn record_cancelled(&self) {
        self.tasks_cancelled.inc();
    }

    /// Record a transient failure that returned a task to its band.
    pub fn record_requeued(&self) {
        self.tasks_requeued.inc();
    }

    /// Record an advisor recommendation that fell back on timeout.
    pub fn record_advisor_timeout(&self) {
        self.advisor_timeouts.inc();
    }

    /// Record a transport-level dispatch failure.
    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.inc();
    }

    /// Record one balancer selection.
    pub fn record_selection(&self, algorithm: &str, latency: Duration, found: bool) {
        self.selection_latency.observe(latency.as_secs_f64());
        if found {
            self.selections_total.with_label_values(&[algorithm]).inc();
        } else {
            self.selection_failures.inc();
        }
    }

    /// Refresh the depth gauge for one band.
    pub fn set_queue_depth(&self, band: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[band])
            .set(depth as i64);
    }

    /// Refresh the worker-count gauge for one status.
    pub fn set_workers(&self, status: &str, count: usize) {
        self.workers_by_status
            .with_label_values(&[status])
            .set(count as i64);
    }

    /// Refresh the active-allocation gauge.
    pub fn set_active_allocations(&self, count: usize) {
        self.active_allocations.set(count as i64);
    }

    /// Refresh the in-flight assignment gauge.
    pub fn set_tracked_tasks(&self, count: usize) {
        self.tracked_tasks.set(count as i64);
    }

    /// Typed snapshot of the headline counters and means.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.tasks_completed.get();
        let failed = self.tasks_failed.get();
        let terminal = completed + failed;
        let exec_count = self.execution_count.load(Ordering::Relaxed);
        let queue_count = self.queue_count.load(Ordering::Relaxed);

        MetricsSnapshot {
            tasks_scheduled: self.tasks_scheduled.get(),
            tasks_completed: completed,
            tasks_failed: failed,
            tasks_cancelled: self.tasks_cancelled.get(),
            tasks_requeued: self.tasks_requeued.get(),
            dispatch_failures: self.dispatch_failures.get(),
            advisor_timeouts: self.advisor_timeouts.get(),
            success_rate: if terminal == 0 {
                1.0
            } else {
                completed as f64 / terminal as f64
            },
            avg_execution_ms: if exec_count == 0 {
                0.0
            } else {
                self.execution_ms_sum.load(Ordering::Relaxed) as f64 / exec_count as f64
            },
            avg_queue_ms: if queue_count == 0 {
                0.0
            } else {
                self.queue_ms_sum.load(Ordering::Relaxed) as f64 / queue_count as f64
            },
        }
    }

    /// Encode every registered series as prometheus text.
    pub fn export(&self) -> SchedulerResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| SchedulerError::Internal(format!("metrics encode: {e}")))?;
        String::from_utf8(buffer).map_err(|e| SchedulerError::Internal(format!("metrics utf8: {e}")))
    }
}

impl From<prometheus::Error> for SchedulerError {
    fn from(err: prometheus::Error) -> Self {
        SchedulerError::Internal(format!("prometheus: {err}"))
    }
}

/// Headline counters and means, served through `metrics()`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Tasks dispatched with a plan and reservation
    pub tasks_scheduled: u64,
    /// Tasks finished successfully
    pub tasks_completed: u64,
    /// Tasks finished unsuccessfully
    pub tasks_failed: u64,
    /// Tasks cancelled before completion
    pub tasks_cancelled: u64,
    /// Transient re-queues
    pub tasks_requeued: u64,
    /// Assignment sends the transport could not deliver
    pub dispatch_failures: u64,
    /// Advisor decisions that fell back on timeout
    pub advisor_timeouts: u64,
    /// completed / (completed + failed); 1.0 when nothing terminal yet
    pub success_rate: f64,
    /// Mean execution time in milliseconds
    pub avg_execution_ms: f64,
    /// Mean queue wait in milliseconds
    pub avg_queue_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counts() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_scheduled();
        metrics.record_terminal(true, Duration::from_millis(100));
        metrics.record_terminal(false, Duration::from_millis(300));

        let snap = metrics.snapshot();
        assert_eq!(snap.tasks_scheduled, 1);
        assert_eq!(snap.tasks_completed, 1);
        assert_eq!(snap.tasks_failed, 1);
        assert!((snap.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((snap.avg_execution_ms - 200.0).abs() < 1.0);
    }

    #[test]
    fn export_produces_prometheus_text() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_enqueued("high");
        let text = metrics.export().unwrap();
        assert!(text.contains("scheduler_tasks_enqueued_total"));
    }
}

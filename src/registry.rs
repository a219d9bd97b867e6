//! Worker registry: worker lifecycle, the capability inverted index, and
//! liveness tracking.
//!
//! ## Architecture
//!
//! The registry keeps two structures behind separate locks:
//!
//! - `worker_id → Worker`, the authoritative worker map
//! - `capability → set of worker ids`, an inverted index giving O(1)
//!   capability queries
//!
//! The index is maintained on every register, unregister, and capability
//! change and must never hold a stale reference. A health sweep runs at the
//! worker-timeout cadence and marks silent workers offline exactly once;
//! offline transitions are published so the tracker can invalidate the
//! worker's in-flight assignments.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerSettings;
use crate::consensus::ClusterEvent;
use crate::messages::{WorkerHeartbeat, WorkerRegistration};
use crate::types::{
    ResourceVector, SchedulerError, SchedulerResult, Worker, WorkerId, WorkerLoad, WorkerStatus,
};

/// Aggregate registry counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct RegistryStats {
    /// Registered workers in any status
    pub total: usize,
    /// Workers with at least one active task
    pub active: usize,
    /// Workers online with no active tasks
    pub idle: usize,
    /// Workers marked offline
    pub offline: usize,
    /// Mean CPU load across non-offline workers
    pub avg_load: f64,
}

/// Worker lifecycle and capability index.
pub struct WorkerRegistry {
    settings: WorkerSettings,
    workers: RwLock<HashMap<WorkerId, Worker>>,
    capability_index: RwLock<HashMap<String, HashSet<WorkerId>>>,
    offline_tx: async_channel::Sender<WorkerId>,
    offline_rx: async_channel::Receiver<WorkerId>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    pub fn new(settings: WorkerSettings) -> Arc<Self> {
        let (offline_tx, offline_rx) = async_channel::bounded(1024);
        Arc::new(Self {
            settings,
            workers: RwLock::new(HashMap::new()),
            capability_index: RwLock::new(HashMap::new()),
            offline_tx,
            offline_rx,
        })
    }

    /// Receiver of worker ids as they transition to offline.
    pub fn offline_notifications(&self) -> async_channel::Receiver<WorkerId> {
        self.offline_rx.clone()
    }

    /// Register a worker from its registration message. Re-registration of
    /// a known id refreshes capabilities, address, and capacity.
    pub async fn register(&self, registration: WorkerRegistration) -> SchedulerResult<()> {
        let WorkerRegistration {
            worker_id,
            address,
            capabilities,
            total_capacity,
        } = registration;

        let mut workers = self.workers.write().await;
        if !workers.contains_key(&worker_id) && workers.len() >= self.settings.max_workers {
            return Err(SchedulerError::Configuration(format!(
                "worker limit {} reached",
                self.settings.max_workers
            )));
        }

        let capabilities: HashSet<String> = capabilities.into_iter().collect();
        let previous = workers.insert(
            worker_id.clone(),
            Worker::new(
                worker_id.clone(),
                address,
                capabilities.clone(),
                total_capacity,
            ),
        );
        drop(workers);

        // Scrub prior posting lists before re-insertion so a capability the
        // worker no longer declares cannot keep a stale reference.
        let mut index = self.capability_index.write().await;
        if let Some(previous) = previous {
            for capability in &previous.capabilities {
                if let Some(posting) = index.get_mut(capability) {
                    posting.remove(&worker_id);
                    if posting.is_empty() {
                        index.remove(capability);
                    }
                }
            }
        }
        for capability in &capabilities {
            index
                .entry(capability.clone())
                .or_default()
                .insert(worker_id.clone());
        }
        drop(index);

        info!(worker = %worker_id, "worker registered");
        Ok(())
    }

    /// Remove a worker and scrub it from every posting list.
    pub async fn unregister(&self, worker_id: &WorkerId) -> SchedulerResult<Worker> {
        let removed = {
            let mut workers = self.workers.write().await;
            workers.remove(worker_id)
        };
        let worker = removed.ok_or_else(|| SchedulerError::NotFound {
            kind: "worker",
            id: worker_id.clone(),
        })?;

        let mut index = self.capability_index.write().await;
        for capability in &worker.capabilities {
            if let Some(posting) = index.get_mut(capability) {
                posting.remove(worker_id);
                if posting.is_empty() {
                    index.remove(capability);
                }
            }
        }
        drop(index);

        info!(worker = %worker_id, "worker unregistered");
        Ok(worker)
    }

    /// Look up one worker.
    pub async fn get(&self, worker_id: &WorkerId) -> Option<Worker> {
        self.workers.read().await.get(worker_id).cloned()
    }

    /// All registered workers.
    pub async fn list(&self) -> Vec<Worker> {
        self.workers.read().await.values().cloned().collect()
    }

    /// Workers whose status accepts new assignments.
    pub async fn list_available(&self) -> Vec<Worker> {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.status.accepts_work())
            .cloned()
            .collect()
    }

    /// Workers declaring `capability`, via the inverted index.
    pub async fn by_capability(&self, capability: &str) -> Vec<Worker> {
        let ids: Vec<WorkerId> = {
            let index = self.capability_index.read().await;
            index
                .get(capability)
                .map(|posting| posting.iter().cloned().collect())
                .unwrap_or_default()
        };
        let workers = self.workers.read().await;
        ids.iter()
            .filter_map(|id| workers.get(id).cloned())
            .collect()
    }

    /// Set a worker's availability status. Returns the previous status.
    pub async fn update_status(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
    ) -> SchedulerResult<WorkerStatus> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::NotFound {
                kind: "worker",
                id: worker_id.clone(),
            })?;
        let previous = worker.status;
        worker.status = status;
        if status != WorkerStatus::Offline {
            worker.last_seen = SystemTime::now();
        }
        drop(workers);

        if status == WorkerStatus::Offline && previous != WorkerStatus::Offline {
            self.notify_offline(worker_id).await;
        }
        Ok(previous)
    }

    /// Fold a load report into a worker's live indicators.
    pub async fn update_load(
        &self,
        worker_id: &WorkerId,
        load: WorkerLoad,
        available: ResourceVector,
    ) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::NotFound {
                kind: "worker",
                id: worker_id.clone(),
            })?;
        worker.load = load;
        worker.available_capacity = available;
        worker.last_seen = SystemTime::now();
        worker.status = if load.active_tasks == 0 {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Busy
        };
        Self::refresh_health(worker, SystemTime::now(), self.settings.worker_timeout());
        Ok(())
    }

    /// Process a heartbeat: refresh liveness, load, and availability. An
    /// offline worker that heartbeats again comes back as idle or busy.
    pub async fn heartbeat(&self, beat: &WorkerHeartbeat) -> SchedulerResult<()> {
        self.update_load(&beat.worker_id, beat.load, beat.available_capacity)
            .await
    }

    /// Fold an out-of-band capacity report into a worker.
    pub async fn update_available(
        &self,
        worker_id: &WorkerId,
        available: ResourceVector,
    ) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::NotFound {
                kind: "worker",
                id: worker_id.clone(),
            })?;
        worker.available_capacity = available;
        worker.last_seen = SystemTime::now();
        Ok(())
    }

    /// Fold a task outcome into the worker's rolling statistics.
    pub async fn record_outcome(
        &self,
        worker_id: &WorkerId,
        success: bool,
        duration: std::time::Duration,
    ) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(worker_id) {
            worker.record_outcome(success, duration);
            Self::refresh_health(worker, SystemTime::now(), self.settings.worker_timeout());
        }
    }

    /// One pass of the health sweep: mark workers silent past the
    /// worker-timeout offline (exactly once), refresh health scores.
    /// Returns the ids newly marked offline.
    pub async fn sweep(&self, now: SystemTime) -> Vec<WorkerId> {
        let timeout = self.settings.worker_timeout();
        let mut newly_offline = Vec::new();

        {
            let mut workers = self.workers.write().await;
            for worker in workers.values_mut() {
                let silent = now
                    .duration_since(worker.last_seen)
                    .map(|elapsed| elapsed > timeout)
                    .unwrap_or(false);
                if silent && worker.status != WorkerStatus::Offline {
                    warn!(worker = %worker.id, "worker missed heartbeat window, marking offline");
                    worker.status = WorkerStatus::Offline;
                    newly_offline.push(worker.id.clone());
                }
                Self::refresh_health(worker, now, timeout);
            }
        }

        for worker_id in &newly_offline {
            self.notify_offline(worker_id).await;
        }
        newly_offline
    }

    /// Spawn the background health loop at the health-check cadence.
    pub fn spawn_health_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.settings.health_check_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep(SystemTime::now()).await;
                    }
                    _ = token.cancelled() => {
                        debug!("registry health loop stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Aggregate counters across the registry.
    pub async fn stats(&self) -> RegistryStats {
        let workers = self.workers.read().await;
        let total = workers.len();
        let mut active = 0;
        let mut idle = 0;
        let mut offline = 0;
        let mut load_sum = 0.0;
        let mut load_count = 0usize;
        for worker in workers.values() {
            match worker.status {
                WorkerStatus::Offline => offline += 1,
                WorkerStatus::Idle => idle += 1,
                _ if worker.load.active_tasks > 0 => active += 1,
                _ => idle += 1,
            }
            if worker.status != WorkerStatus::Offline {
                load_sum += worker.load.cpu_usage as f64;
                load_count += 1;
            }
        }
        RegistryStats {
            total,
            active,
            idle,
            offline,
            avg_load: if load_count == 0 {
                0.0
            } else {
                load_sum / load_count as f64
            },
        }
    }

    /// Apply a replicated cluster event on a follower.
    pub async fn apply_event(&self, event: &ClusterEvent) -> SchedulerResult<()> {
        match event {
            ClusterEvent::WorkerRegistered(registration) => {
                self.register(registration.clone()).await
            }
            ClusterEvent::WorkerUnregistered { worker_id } => {
                self.unregister(worker_id).await.map(|_| ())
            }
            ClusterEvent::WorkerStatusChanged { worker_id, status } => {
                self.update_status(worker_id, *status).await.map(|_| ())
            }
            // allocation events belong to the allocator replica
            ClusterEvent::AllocationRecorded(_) | ClusterEvent::AllocationReleased { .. } => Ok(()),
        }
    }

    async fn notify_offline(&self, worker_id: &WorkerId) {
        if self.offline_tx.try_send(worker_id.clone()).is_err() {
            warn!(worker = %worker_id, "offline notification channel full, dropping");
        }
    }

    /// Health is availability times reliability: availability starts at 1.0
    /// and loses 0.25 per missed heartbeat interval; reliability is one
    /// minus the rolling failure rate. Clamped to [0, 1].
    fn refresh_health(worker: &mut Worker, now: SystemTime, timeout: std::time::Duration) {
        let missed = now
            .duration_since(worker.last_seen)
            .map(|elapsed| (elapsed.as_secs_f64() / timeout.as_secs_f64()).floor())
            .unwrap_or(0.0);
        let availability = (1.0 - 0.25 * missed).max(0.0);
        worker.health_score = (availability * (1.0 - worker.failure_rate())).clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registration(id: &str, capabilities: &[&str]) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: id.to_string(),
            address: format!("10.0.0.1:{}", 7000),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            total_capacity: ResourceVector {
                cpu_cores: 8.0,
                memory_bytes: 16 << 30,
                ..ResourceVector::zero()
            },
        }
    }

    fn registry() -> Arc<WorkerRegistry> {
        WorkerRegistry::new(WorkerSettings::default())
    }

    #[tokio::test]
    async fn register_populates_capability_index() {
        let registry = registry();
        registry
            .register(registration("w1", &["gpu", "avx512"]))
            .await
            .unwrap();
        registry
            .register(registration("w2", &["gpu"]))
            .await
            .unwrap();

        let gpu_workers = registry.by_capability("gpu").await;
        assert_eq!(gpu_workers.len(), 2);
        let avx_workers = registry.by_capability("avx512").await;
        assert_eq!(avx_workers.len(), 1);
        assert_eq!(avx_workers[0].id, "w1");
    }

    #[tokio::test]
    async fn unregister_scrubs_posting_lists() {
        let registry = registry();
        registry
            .register(registration("w1", &["gpu"]))
            .await
            .unwrap();
        registry.unregister(&"w1".to_string()).await.unwrap();

        assert!(registry.by_capability("gpu").await.is_empty());
        assert!(registry.get(&"w1".to_string()).await.is_none());
    }

    #[tokio::test]
    async fn reregistration_drops_stale_capabilities() {
        let registry = registry();
        registry
            .register(registration("w1", &["gpu", "nvlink"]))
            .await
            .unwrap();
        registry
            .register(registration("w1", &["gpu"]))
            .await
            .unwrap();

        assert!(registry.by_capability("nvlink").await.is_empty());
        assert_eq!(registry.by_capability("gpu").await.len(), 1);
    }

    #[tokio::test]
    async fn sweep_marks_silent_workers_offline_once() {
        let registry = registry();
        registry.register(registration("w1", &[])).await.unwrap();

        let later = SystemTime::now() + Duration::from_secs(120);
        let first = registry.sweep(later).await;
        assert_eq!(first, vec!["w1".to_string()]);
        // a second sweep does not report the same worker again
        let second = registry.sweep(later + Duration::from_secs(60)).await;
        assert!(second.is_empty());

        let worker = registry.get(&"w1".to_string()).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Offline);
        let offline = registry.offline_notifications();
        assert_eq!(offline.recv().await.unwrap(), "w1");
    }

    #[tokio::test]
    async fn heartbeat_revives_offline_worker() {
        let registry = registry();
        registry.register(registration("w1", &[])).await.unwrap();
        registry
            .update_status(&"w1".to_string(), WorkerStatus::Offline)
            .await
            .unwrap();

        let beat = WorkerHeartbeat {
            worker_id: "w1".to_string(),
            load: WorkerLoad {
                active_tasks: 1,
                ..WorkerLoad::default()
            },
            available_capacity: ResourceVector::zero(),
            active_task_ids: vec![],
            timestamp: SystemTime::now(),
        };
        registry.heartbeat(&beat).await.unwrap();
        let worker = registry.get(&"w1".to_string()).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Busy);
    }

    #[tokio::test]
    async fn health_decreases_with_failures() {
        let registry = registry();
        registry.register(registration("w1", &[])).await.unwrap();
        let id = "w1".to_string();
        registry
            .record_outcome(&id, false, Duration::from_millis(50))
            .await;
        registry
            .record_outcome(&id, true, Duration::from_millis(50))
            .await;
        let worker = registry.get(&id).await.unwrap();
        assert!(worker.health_score < 1.0);
        assert!(worker.health_score > 0.0);
    }

    #[tokio::test]
    async fn worker_limit_enforced() {
        let registry = WorkerRegistry::new(WorkerSettings {
            max_workers: 1,
            ..WorkerSettings::default()
        });
        registry.register(registration("w1", &[])).await.unwrap();
        assert!(registry.register(registration("w2", &[])).await.is_err());
        // refreshing an existing worker is not limited
        registry.register(registration("w1", &["gpu"])).await.unwrap();
    }
}

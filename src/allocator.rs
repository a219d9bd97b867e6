//! Resource allocator: the sole authority for reservations.
//!
//! Reservations are made before dispatch and released exactly once, on
//! completion, failure, or timeout. A plan that spans workers holds one
//! ledger entry per worker, all reserved atomically. The ledger guarantees
//! that for every worker the sum of capacity-holding allocations never
//! exceeds that worker's total capacity on any axis.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{
    AllocationStatus, ResourceAllocation, ResourceUsage, ResourceVector, SchedulerError,
    SchedulerResult, TaskId, WorkerId,
};

/// Reservation ledger plus per-worker active totals.
///
/// One lock guards both maps because every mutation touches both; the
/// allocator's lock is independent of every other component's locks.
#[derive(Default)]
pub struct ResourceAllocator {
    state: RwLock<AllocatorState>,
}

#[derive(Default)]
struct AllocatorState {
    ledger: HashMap<TaskId, Vec<ResourceAllocation>>,
    active_totals: HashMap<WorkerId, ResourceVector>,
}

impl AllocatorState {
    fn holds_capacity(&self, task_id: &TaskId) -> bool {
        self.ledger
            .get(task_id)
            .is_some_and(|entries| entries.iter().any(|a| a.status.holds_capacity()))
    }
}

impl ResourceAllocator {
    /// Create an empty allocator.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve a plan's demands, all workers and axes or nothing.
    ///
    /// `demands` lists the vector each worker must supply; `capacities`
    /// holds each worker's total capacity. The first saturated worker axis
    /// fails the whole reservation with `ReservationConflict` and no
    /// partial state. A task may hold at most one reservation at a time.
    pub async fn reserve_plan(
        &self,
        task_id: TaskId,
        demands: &[(WorkerId, ResourceVector)],
        capacities: &HashMap<WorkerId, ResourceVector>,
    ) -> SchedulerResult<Vec<Uuid>> {
        if demands.is_empty() {
            return Err(SchedulerError::Internal(
                "reservation with no demands".to_string(),
            ));
        }
        let mut state = self.state.write().await;

        if state.holds_capacity(&task_id) {
            warn!(%task_id, "task already holds a reservation");
            return Err(SchedulerError::ReservationConflict {
                worker_id: demands[0].0.clone(),
                axis: crate::types::ResourceAxis::Cpu,
            });
        }

        // aggregate duplicates so one worker hosting several partitions is
        // checked against its capacity once
        let mut per_worker: HashMap<&WorkerId, ResourceVector> = HashMap::new();
        for (worker_id, vector) in demands {
            let entry = per_worker.entry(worker_id).or_default();
            *entry = entry.add(vector);
        }

        // validate everything before mutating anything
        for (worker_id, demand) in &per_worker {
            let capacity =
                capacities
                    .get(*worker_id)
                    .ok_or_else(|| SchedulerError::NotFound {
                        kind: "worker",
                        id: (*worker_id).clone(),
                    })?;
            let active = state
                .active_totals
                .get(*worker_id)
                .copied()
                .unwrap_or_default();
            if let Some(axis) = active.add(demand).first_exceeded_axis(capacity) {
                return Err(SchedulerError::ReservationConflict {
                    worker_id: (*worker_id).clone(),
                    axis,
                });
            }
        }

        let now = SystemTime::now();
        let mut ids = Vec::with_capacity(per_worker.len());
        let mut entries = Vec::with_capacity(per_worker.len());
        for (worker_id, demand) in per_worker {
            let allocation = ResourceAllocation {
                id: Uuid::new_v4(),
                task_id,
                worker_id: worker_id.clone(),
                reserved: demand,
                status: AllocationStatus::Pending,
                actual_usage: None,
                created_at: now,
                updated_at: now,
            };
            ids.push(allocation.id);
            let total = state.active_totals.entry(worker_id.clone()).or_default();
            *total = total.add(&demand);
            entries.push(allocation);
        }
        state.ledger.insert(task_id, entries);

        debug!(%task_id, workers = ids.len(), "reserved resources");
        Ok(ids)
    }

    /// Reserve a single-worker demand. Convenience over [`Self::reserve_plan`].
    pub async fn reserve(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        requested: ResourceVector,
        capacity: ResourceVector,
    ) -> SchedulerResult<Uuid> {
        let capacities = HashMap::from([(worker_id.clone(), capacity)]);
        let ids = self
            .reserve_plan(task_id, &[(worker_id.clone(), requested)], &capacities)
            .await?;
        Ok(ids[0])
    }

    /// Mark a pending reservation active once the worker confirms the
    /// assignment. No-op for unknown tasks.
    pub async fn activate(&self, task_id: TaskId) {
        let mut state = self.state.write().await;
        if let Some(entries) = state.ledger.get_mut(&task_id) {
            let now = SystemTime::now();
            for allocation in entries {
                if allocation.status == AllocationStatus::Pending {
                    allocation.status = AllocationStatus::Active;
                    allocation.updated_at = now;
                }
            }
        }
    }

    /// Release every reservation held by `task_id` with the given terminal
    /// status, optionally recording observed usage.
    ///
    /// Idempotent: releasing a task with no capacity-holding reservation is
    /// a no-op that returns `false`, never an underflow.
    pub async fn release(
        &self,
        task_id: TaskId,
        status: AllocationStatus,
        usage: Option<ResourceUsage>,
    ) -> bool {
        debug_assert!(!status.holds_capacity(), "release requires terminal status");
        let mut state = self.state.write().await;
        if !state.holds_capacity(&task_id) {
            return false;
        }

        let now = SystemTime::now();
        let mut released: Vec<(WorkerId, ResourceVector)> = Vec::new();
        if let Some(entries) = state.ledger.get_mut(&task_id) {
            for allocation in entries {
                if allocation.status.holds_capacity() {
                    allocation.status = status;
                    allocation.actual_usage = usage;
                    allocation.updated_at = now;
                    released.push((allocation.worker_id.clone(), allocation.reserved));
                }
            }
        }
        for (worker_id, reserved) in released {
            if let Some(total) = state.active_totals.get_mut(&worker_id) {
                *total = total.saturating_sub(&reserved);
            }
        }

        debug!(%task_id, ?status, "released reservation");
        true
    }

    /// Capacity currently held on `worker_id` by active reservations.
    pub async fn active_for(&self, worker_id: &WorkerId) -> ResourceVector {
        self.state
            .read()
            .await
            .active_totals
            .get(worker_id)
            .copied()
            .unwrap_or_default()
    }

    /// Ledger entries held by `task_id`, if any.
    pub async fn get(&self, task_id: TaskId) -> Vec<ResourceAllocation> {
        self.state
            .read()
            .await
            .ledger
            .get(&task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of tasks holding capacity.
    pub async fn active_count(&self) -> usize {
        let state = self.state.read().await;
        state
            .ledger
            .iter()
            .filter(|(task_id, _)| state.holds_capacity(task_id))
            .count()
    }

    /// Every capacity-holding allocation, for takeover reconciliation.
    pub async fn active_allocations(&self) -> Vec<ResourceAllocation> {
        self.state
            .read()
            .await
            .ledger
            .values()
            .flatten()
            .filter(|a| a.status.holds_capacity())
            .cloned()
            .collect()
    }

    /// Apply a replicated allocation record on a follower.
    pub async fn apply_recorded(&self, allocation: ResourceAllocation) {
        let mut state = self.state.write().await;
        if allocation.status.holds_capacity() {
            let total = state
                .active_totals
                .entry(allocation.worker_id.clone())
                .or_default();
            *total = total.add(&allocation.reserved);
        }
        state
            .ledger
            .entry(allocation.task_id)
            .or_default()
            .push(allocation);
    }

    /// Drop terminal ledger entries beyond `keep_terminal`, oldest first,
    /// keeping the ledger bounded on long-lived leaders.
    pub async fn compact(&self, keep_terminal: usize) {
        let mut state = self.state.write().await;
        let mut terminal: Vec<(TaskId, SystemTime)> = state
            .ledger
            .iter()
            .filter(|(task_id, _)| !state.holds_capacity(task_id))
            .map(|(id, entries)| {
                let updated = entries
                    .iter()
                    .map(|a| a.updated_at)
                    .max()
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (*id, updated)
            })
            .collect();
        if terminal.len() <= keep_terminal {
            return;
        }
        terminal.sort_by_key(|(_, updated)| *updated);
        let drop_count = terminal.len() - keep_terminal;
        for (task_id, _) in terminal.into_iter().take(drop_count) {
            state.ledger.remove(&task_id);
        }
    }
}

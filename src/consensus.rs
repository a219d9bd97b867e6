//! Consensus seam: the narrow contract the core consumes from the cluster's
//! consensus engine, plus a process-local single-node implementation used
//! for standalone deployments and tests.
//!
//! Only the leader mutates scheduling state; followers apply the replicated
//! [`ClusterEvent`] stream to their read-only registry and ledger replicas.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;

use crate::messages::WorkerRegistration;
use crate::types::{
    AllocationStatus, ResourceAllocation, SchedulerError, SchedulerResult, TaskId, WorkerId,
    WorkerStatus,
};

/// State changes replicated across the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// A worker joined the cluster
    WorkerRegistered(WorkerRegistration),
    /// A worker left or was removed
    WorkerUnregistered {
        /// Departing worker
        worker_id: WorkerId,
    },
    /// A worker's availability status changed
    WorkerStatusChanged {
        /// Affected worker
        worker_id: WorkerId,
        /// New status
        status: WorkerStatus,
    },
    /// The leader recorded a reservation
    AllocationRecorded(ResourceAllocation),
    /// The leader released a reservation
    AllocationReleased {
        /// Task whose reservation was released
        task_id: TaskId,
        /// Terminal allocation status
        status: AllocationStatus,
    },
}

/// Contract consumed from the consensus engine.
#[async_trait]
pub trait ConsensusHandle: Send + Sync {
    /// Whether this node currently holds leadership.
    fn is_leader(&self) -> bool;

    /// Identity of the current leader, if one is elected.
    fn leader_id(&self) -> Option<WorkerId>;

    /// Replicate an event; resolves once the event is committed.
    async fn propose(&self, event: ClusterEvent) -> SchedulerResult<()>;

    /// Subscribe to the committed event stream.
    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;
}

/// Single-node consensus: every propose commits locally and immediately.
///
/// Leadership is a settable flag so tests can exercise follower behavior
/// and leader hand-off without a real election.
pub struct LocalConsensus {
    node_id: WorkerId,
    leader: AtomicBool,
    leader_id: RwLock<Option<WorkerId>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl LocalConsensus {
    /// Create a handle for `node_id`, initially the leader.
    pub fn new<I: Into<WorkerId>>(node_id: I) -> Self {
        let node_id = node_id.into();
        let (events, _) = broadcast::channel(1024);
        Self {
            leader_id: RwLock::new(Some(node_id.clone())),
            node_id,
            leader: AtomicBool::new(true),
            events,
        }
    }

    /// Grant or revoke leadership (test and failover hook).
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
        let mut id = self.leader_id.write().expect("leader id lock");
        *id = leader.then(|| self.node_id.clone());
    }
}

#[async_trait]
impl ConsensusHandle for LocalConsensus {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn leader_id(&self) -> Option<WorkerId> {
        self.leader_id.read().expect("leader id lock").clone()
    }

    async fn propose(&self, event: ClusterEvent) -> SchedulerResult<()> {
        if !self.is_leader() {
            return Err(SchedulerError::NotLeader);
        }
        // No subscribers is fine; the event is still committed locally.
        let _ = self.events.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn follower_cannot_propose() {
        let consensus = LocalConsensus::new("node-a");
        consensus.set_leader(false);
        let result = consensus
            .propose(ClusterEvent::WorkerUnregistered {
                worker_id: "w1".to_string(),
            })
            .await;
        assert!(matches!(result, Err(SchedulerError::NotLeader)));
        assert_eq!(consensus.leader_id(), None);
    }

    #[tokio::test]
    async fn subscribers_see_committed_events() {
        let consensus = LocalConsensus::new("node-a");
        let mut stream = consensus.subscribe();
        consensus
            .propose(ClusterEvent::WorkerUnregistered {
                worker_id: "w1".to_string(),
            })
            .await
            .unwrap();
        let event = stream.recv().await.unwrap();
        assert!(matches!(
            event,
            ClusterEvent::WorkerUnregistered { worker_id } if worker_id == "w1"
        ));
    }
}

//! Wire message formats exchanged with worker nodes.
//!
//! The canonical field sets live here; the encoding on the wire is the
//! transport's concern. Messages travel inside an [`Envelope`] whose topic
//! selects the registered handler on the receiving side.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::SystemTime;

use crate::types::{
    PartitionPlan, ResourceVector, SchedulerError, SchedulerResult, TaskId, TaskResult, TaskStatus,
    WorkerId, WorkerLoad,
};

/// Topics the core registers handlers for and publishes on.
pub mod topics {
    /// Leader → worker: a task assignment with its plan
    pub const TASK_ASSIGNMENT: &str = "task-assignment";
    /// Worker → leader: terminal outcome of an assignment
    pub const TASK_RESULT: &str = "task-result";
    /// Worker → leader: progress update for a running task
    pub const TASK_STATUS: &str = "task-status";
    /// Worker → leader: initial registration
    pub const WORKER_REGISTER: &str = "worker-register";
    /// Worker → leader: periodic heartbeat
    pub const WORKER_HEARTBEAT: &str = "worker-heartbeat";
    /// Worker → leader: out-of-band capacity change
    pub const RESOURCE_UPDATE: &str = "resource-update";
}

/// A topic-tagged message as handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Handler-selection topic
    pub topic: String,
    /// Serialized message body
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wrap a message under `topic`.
    pub fn new<T: Serialize>(topic: &str, message: &T) -> SchedulerResult<Self> {
        Ok(Self {
            topic: topic.to_string(),
            payload: serde_json::to_value(message)
                .map_err(|e| SchedulerError::Internal(format!("encode {topic}: {e}")))?,
        })
    }

    /// Decode the body as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> SchedulerResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| SchedulerError::Internal(format!("decode {}: {e}", self.topic)))
    }
}

/// Leader → worker: execute a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// Identity of this assignment attempt (changes across retries)
    pub assignment_id: uuid::Uuid,
    /// Task being assigned
    pub task_id: TaskId,
    /// Worker the assignment is addressed to
    pub worker_id: WorkerId,
    /// Partition plan the worker coordinates or executes
    pub plan: PartitionPlan,
    /// Deadline after which the worker should abandon the task
    pub deadline: Option<SystemTime>,
    /// Resources reserved for this assignment on the addressed worker
    pub resources: ResourceVector,
}

/// Worker → leader: terminal outcome. The body is the canonical
/// [`TaskResult`]; a dedicated alias keeps the topic table readable.
pub type TaskResultMessage = TaskResult;

/// Worker → leader: progress for a running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    /// Task being reported on
    pub task_id: TaskId,
    /// Reporting worker
    pub worker_id: WorkerId,
    /// Current status from the worker's point of view
    pub status: TaskStatus,
    /// Progress in [0, 1]
    pub progress: f64,
    /// Report timestamp
    pub timestamp: SystemTime,
}

/// Worker → leader: initial registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    /// Stable peer identity
    pub worker_id: WorkerId,
    /// Dialable network address
    pub address: String,
    /// Declared capabilities
    pub capabilities: Vec<String>,
    /// Total capacity along all axes
    pub total_capacity: ResourceVector,
}

/// Worker → leader: periodic liveness and load report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    /// Reporting worker
    pub worker_id: WorkerId,
    /// Live load indicators
    pub load: WorkerLoad,
    /// Capacity currently available
    pub available_capacity: ResourceVector,
    /// Tasks the worker believes it is running
    pub active_task_ids: Vec<TaskId>,
    /// Report timestamp
    pub timestamp: SystemTime,
}

/// Worker → leader: out-of-band capacity change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUpdate {
    /// Reporting worker
    pub worker_id: WorkerId,
    /// New available capacity
    pub available_capacity: ResourceVector,
    /// Report timestamp
    pub timestamp: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceVector;

    #[test]
    fn envelope_round_trip() {
        let heartbeat = WorkerHeartbeat {
            worker_id: "w1".to_string(),
            load: WorkerLoad::default(),
            available_capacity: ResourceVector::zero(),
            active_task_ids: vec![],
            timestamp: SystemTime::now(),
        };
        let envelope = Envelope::new(topics::WORKER_HEARTBEAT, &heartbeat).unwrap();
        assert_eq!(envelope.topic, topics::WORKER_HEARTBEAT);
        let decoded: WorkerHeartbeat = envelope.decode().unwrap();
        assert_eq!(decoded.worker_id, "w1");
    }

    #[test]
    fn envelope_decode_rejects_wrong_shape() {
        let update = ResourceUpdate {
            worker_id: "w2".to_string(),
            available_capacity: ResourceVector::zero(),
            timestamp: SystemTime::now(),
        };
        let envelope = Envelope::new(topics::RESOURCE_UPDATE, &update).unwrap();
        assert!(envelope.decode::<WorkerRegistration>().is_err());
    }
}

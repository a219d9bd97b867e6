//! Load balancer: selects one worker per task (or per partition) from the
//! candidates that survive capability and constraint prefilters.
//!
//! ## Architecture
//!
//! Five algorithms are supported; the algorithm comes from configuration
//! and may be overridden per task through the `balance_algorithm` metadata
//! key. Every algorithm scores candidates in a single pass — no pairwise
//! comparisons — so selection stays cheap at four-digit worker counts.
//!
//! Ties always break lexicographically on worker id, giving deterministic
//! replay under identical inputs.

use rand::Rng;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

use crate::config::{BalanceWeights, BalancerSettings};
use crate::metrics::MetricsCollector;
use crate::types::{SchedulerError, SchedulerResult, Task, Worker, WorkerId};

/// Normalizer for the active-task component of load scores.
const TASK_LOAD_NORMALIZER: f64 = 16.0;

/// Worker selection algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceAlgorithm {
    /// Rotating index over the candidate list
    RoundRobin,
    /// Minimize the weighted load sum
    LeastLoaded,
    /// Sample proportionally to available capacity times health
    WeightedRoundRobin,
    /// Hard-filter on requirements, then maximize the availability score
    ResourceAware,
    /// Filter on required hardware features, then least-loaded
    CapabilityBased,
}

impl BalanceAlgorithm {
    /// Stable identifier used in configuration and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceAlgorithm::RoundRobin => "round_robin",
            BalanceAlgorithm::LeastLoaded => "least_loaded",
            BalanceAlgorithm::WeightedRoundRobin => "weighted_round_robin",
            BalanceAlgorithm::ResourceAware => "resource_aware",
            BalanceAlgorithm::CapabilityBased => "capability_based",
        }
    }
}

impl FromStr for BalanceAlgorithm {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(BalanceAlgorithm::RoundRobin),
            "least_loaded" => Ok(BalanceAlgorithm::LeastLoaded),
            "weighted_round_robin" => Ok(BalanceAlgorithm::WeightedRoundRobin),
            "resource_aware" => Ok(BalanceAlgorithm::ResourceAware),
            "capability_based" => Ok(BalanceAlgorithm::CapabilityBased),
            other => Err(SchedulerError::Configuration(format!(
                "unknown load balance algorithm: {other}"
            ))),
        }
    }
}

/// Per-task worker selection.
pub struct LoadBalancer {
    default_algorithm: BalanceAlgorithm,
    weights: BalanceWeights,
    rr_cursor: AtomicUsize,
    metrics: Arc<MetricsCollector>,
}

impl LoadBalancer {
    /// Create a balancer from validated settings.
    pub fn new(
        settings: &BalancerSettings,
        metrics: Arc<MetricsCollector>,
    ) -> SchedulerResult<Arc<Self>> {
        Ok(Arc::new(Self {
            default_algorithm: settings.algorithm()?,
            weights: settings.weights,
            rr_cursor: AtomicUsize::new(0),
            metrics,
        }))
    }

    /// Algorithm for one task: the metadata override when present and
    /// valid, otherwise the configured default.
    pub fn algorithm_for(&self, task: &Task) -> BalanceAlgorithm {
        task.metadata
            .get("balance_algorithm")
            .and_then(|name| name.parse().ok())
            .unwrap_or(self.default_algorithm)
    }

    /// Drop workers that fail hard constraints: status, declared
    /// capabilities, required hardware features, and exclusions (both the
    /// task's own and the caller-supplied soft exclusions).
    pub fn prefilter(
        &self,
        task: &Task,
        workers: &[Worker],
        soft_excluded: &HashSet<WorkerId>,
    ) -> Vec<Worker> {
        workers
            .iter()
            .filter(|w| w.status.accepts_work())
            .filter(|w| !task.constraints.excluded_workers.contains(&w.id))
            .filter(|w| !soft_excluded.contains(&w.id))
            .filter(|w| w.has_capabilities(&task.constraints.required_capabilities))
            .filter(|w| w.has_capabilities(&task.requirements.required_features))
            .cloned()
            .collect()
    }

    /// Select one worker from prefiltered candidates. Single pass,
    /// deterministic tie-break on worker id.
    pub fn select(&self, task: &Task, candidates: &[Worker]) -> SchedulerResult<Worker> {
        let algorithm = self.algorithm_for(task);
        let started = Instant::now();
        let choice = self.run(algorithm, task, candidates);
        self.metrics
            .record_selection(algorithm.as_str(), started.elapsed(), choice.is_some());

        choice.ok_or(SchedulerError::NoSuitableWorker { task_id: task.id })
    }

    fn run(
        &self,
        algorithm: BalanceAlgorithm,
        task: &Task,
        candidates: &[Worker],
    ) -> Option<Worker> {
        if candidates.is_empty() {
            return None;
        }
        let choice = match algorithm {
            BalanceAlgorithm::RoundRobin => self.round_robin(candidates),
            BalanceAlgorithm::LeastLoaded => self.least_loaded(candidates),
            BalanceAlgorithm::WeightedRoundRobin => self.weighted_round_robin(candidates),
            BalanceAlgorithm::ResourceAware => self.resource_aware(task, candidates),
            BalanceAlgorithm::CapabilityBased => self.capability_based(task, candidates),
        };
        if let Some(worker) = &choice {
            trace!(worker = %worker.id, algorithm = algorithm.as_str(), "worker selected");
        }
        choice
    }

    /// Rotating index modulo the candidate list. Candidates are visited in
    /// id order so the rotation is stable across identical inputs.
    fn round_robin(&self, candidates: &[Worker]) -> Option<Worker> {
        let mut ordered: Vec<&Worker> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));
        let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
        ordered.get(cursor % ordered.len()).map(|w| (*w).clone())
    }

    /// Minimize `w_cpu·cpu + w_mem·mem + w_tasks·(active/k)`.
    fn least_loaded(&self, candidates: &[Worker]) -> Option<Worker> {
        self.argmin(candidates, |w| {
            self.weights.cpu * w.load.cpu_usage as f64
                + self.weights.memory * w.load.memory_usage as f64
                + self.weights.tasks * (w.load.active_tasks as f64 / TASK_LOAD_NORMALIZER)
        })
    }

    /// Sample proportionally to `(avail_cpu + avail_mem) · health`.
    /// Zero-weight pools fall back to the least-loaded choice.
    fn weighted_round_robin(&self, candidates: &[Worker]) -> Option<Worker> {
        let weight = |w: &Worker| -> f64 {
            let cpu_ratio = if w.total_capacity.cpu_cores > 0.0 {
                w.available_capacity.cpu_cores / w.total_capacity.cpu_cores
            } else {
                0.0
            };
            let mem_ratio = if w.total_capacity.memory_bytes > 0 {
                w.available_capacity.memory_bytes as f64 / w.total_capacity.memory_bytes as f64
            } else {
                0.0
            };
            ((cpu_ratio + mem_ratio) * w.health_score).max(0.0)
        };

        let total: f64 = candidates.iter().map(weight).sum();
        if total <= 0.0 {
            return self.least_loaded(candidates);
        }

        let mut roll = rand::thread_rng().gen_range(0.0..total);
        // stable visit order keeps equal-weight draws deterministic per roll
        let mut ordered: Vec<&Worker> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));
        for worker in &ordered {
            roll -= weight(worker);
            if roll <= 0.0 {
                return Some((*worker).clone());
            }
        }
        ordered.last().map(|w| (*w).clone())
    }

    /// Reject candidates that cannot meet the task's absolute
    /// requirements; among survivors maximize the weighted score over
    /// cpu availability, memory availability, health, and inverse load.
    fn resource_aware(&self, task: &Task, candidates: &[Worker]) -> Option<Worker> {
        let requested = task.requirements.to_vector();
        self.argmax(
            candidates
                .iter()
                .filter(|w| requested.fits_within(&w.available_capacity)),
            |w| {
                let cpu_avail = 1.0 - w.load.cpu_usage as f64;
                let mem_avail = 1.0 - w.load.memory_usage as f64;
                let inverse_load =
                    1.0 - (w.load.active_tasks as f64 / TASK_LOAD_NORMALIZER).min(1.0);
                self.weights.cpu * cpu_avail
                    + self.weights.memory * mem_avail
                    + self.weights.health * w.health_score
                    + self.weights.tasks * inverse_load
            },
        )
    }

    /// Filter on required hardware features, then least-loaded. The
    /// prefilter already applies feature constraints when the manager
    /// drives selection; re-filtering here keeps the algorithm correct
    /// when invoked directly.
    fn capability_based(&self, task: &Task, candidates: &[Worker]) -> Option<Worker> {
        let survivors: Vec<Worker> = candidates
            .iter()
            .filter(|w| w.has_capabilities(&task.requirements.required_features))
            .cloned()
            .collect();
        self.least_loaded(&survivors)
    }

    fn argmin<F: Fn(&Worker) -> f64>(&self, candidates: &[Worker], score: F) -> Option<Worker> {
        let mut best: Option<(f64, &Worker)> = None;
        for worker in candidates {
            let s = score(worker);
            best = match best {
                None => Some((s, worker)),
                Some((bs, bw)) => {
                    if s < bs || (s == bs && worker.id < bw.id) {
                        Some((s, worker))
                    } else {
                        Some((bs, bw))
                    }
                }
            };
        }
        best.map(|(_, w)| w.clone())
    }

    fn argmax<'a, I, F>(&self, candidates: I, score: F) -> Option<Worker>
    where
        I: Iterator<Item = &'a Worker>,
        F: Fn(&Worker) -> f64,
    {
        let mut best: Option<(f64, &Worker)> = None;
        for worker in candidates {
            let s = score(worker);
            best = match best {
                None => Some((s, worker)),
                Some((bs, bw)) => {
                    if s > bs || (s == bs && worker.id < bw.id) {
                        Some((s, worker))
                    } else {
                        Some((bs, bw))
                    }
                }
            };
        }
        best.map(|(_, w)| w.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResourceVector, TaskType, WorkerLoad};
    use std::collections::HashSet as StdHashSet;

    fn worker(id: &str, capabilities: &[&str], cpu_usage: f32, active: usize) -> Worker {
        let mut w = Worker::new(
            id,
            "10.0.0.1:7070",
            capabilities.iter().map(|c| c.to_string()).collect(),
            ResourceVector {
                cpu_cores: 8.0,
                memory_bytes: 16 << 30,
                gpu_cores: 2.0,
                gpu_memory_bytes: 8 << 30,
                disk_bytes: 100 << 30,
            },
        );
        w.load = WorkerLoad {
            cpu_usage,
            memory_usage: cpu_usage,
            gpu_usage: 0.0,
            active_tasks: active,
            queued_tasks: 0,
        };
        w
    }

    fn balancer(algorithm: &str) -> Arc<LoadBalancer> {
        let settings = BalancerSettings {
            load_balance_algorithm: algorithm.to_string(),
            ..BalancerSettings::default()
        };
        LoadBalancer::new(&settings, Arc::new(MetricsCollector::new().unwrap())).unwrap()
    }

    #[test]
    fn required_features_filter_is_absolute() {
        let balancer = balancer("capability_based");
        let mut task = Task::new(TaskType::Inference, "llama-7b");
        task.requirements.required_features = vec!["gpu".to_string()];

        let w1 = worker("w1", &["gpu"], 0.9, 8);
        let w2 = worker("w2", &["cpu"], 0.0, 0);
        let pool = vec![w1, w2];

        for _ in 0..100 {
            let candidates = balancer.prefilter(&task, &pool, &StdHashSet::new());
            let chosen = balancer.select(&task, &candidates).unwrap();
            assert_eq!(chosen.id, "w1");
        }
    }

    #[test]
    fn least_loaded_prefers_quieter_worker() {
        let balancer = balancer("least_loaded");
        let task = Task::new(TaskType::Inference, "llama-7b");
        let pool = vec![
            worker("w1", &[], 0.8, 10),
            worker("w2", &[], 0.1, 1),
            worker("w3", &[], 0.5, 5),
        ];
        let chosen = balancer.select(&task, &pool).unwrap();
        assert_eq!(chosen.id, "w2");
    }

    #[test]
    fn ties_break_lexicographically() {
        let balancer = balancer("least_loaded");
        let task = Task::new(TaskType::Inference, "llama-7b");
        let pool = vec![
            worker("w-beta", &[], 0.3, 2),
            worker("w-alpha", &[], 0.3, 2),
        ];
        let chosen = balancer.select(&task, &pool).unwrap();
        assert_eq!(chosen.id, "w-alpha");
    }

    #[test]
    fn round_robin_rotates_in_id_order() {
        let balancer = balancer("round_robin");
        let task = Task::new(TaskType::Inference, "llama-7b");
        let pool = vec![worker("w2", &[], 0.0, 0), worker("w1", &[], 0.0, 0)];
        let first = balancer.select(&task, &pool).unwrap();
        let second = balancer.select(&task, &pool).unwrap();
        let third = balancer.select(&task, &pool).unwrap();
        assert_eq!(first.id, "w1");
        assert_eq!(second.id, "w2");
        assert_eq!(third.id, "w1");
    }

    #[test]
    fn resource_aware_rejects_insufficient_capacity() {
        let balancer = balancer("resource_aware");
        let mut task = Task::new(TaskType::Inference, "llama-7b");
        task.requirements.gpu_cores = Some(4.0);

        // every worker has only 2 gpu cores available
        let pool = vec![worker("w1", &[], 0.0, 0), worker("w2", &[], 0.0, 0)];
        assert!(balancer.select(&task, &pool).is_err());

        task.requirements.gpu_cores = Some(1.0);
        assert!(balancer.select(&task, &pool).is_ok());
    }

    #[test]
    fn metadata_overrides_algorithm() {
        let balancer = balancer("least_loaded");
        let mut task = Task::new(TaskType::Inference, "llama-7b");
        task.metadata.insert(
            "balance_algorithm".to_string(),
            "round_robin".to_string(),
        );
        assert_eq!(balancer.algorithm_for(&task), BalanceAlgorithm::RoundRobin);
    }

    #[test]
    fn excluded_workers_never_selected() {
        let balancer = balancer("least_loaded");
        let mut task = Task::new(TaskType::Inference, "llama-7b");
        task.constraints.excluded_workers = vec!["w1".to_string()];

        let pool = vec![worker("w1", &[], 0.0, 0), worker("w2", &[], 0.9, 9)];
        let candidates = balancer.prefilter(&task, &pool, &StdHashSet::new());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "w2");
    }
}

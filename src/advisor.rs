//! Adaptive advisor: learns (task type × model family) → strategy mappings
//! from completed tasks and recommends a strategy with a confidence score.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::config::AdvisorSettings;
use crate::metrics::MetricsCollector;
use crate::types::{ModelProfile, StrategyKind, Task, TaskId, TaskType};

/// Consecutive successes required before an unseen workload signature
/// becomes a pattern.
const PATTERN_SEED_STREAK: u32 = 3;

/// Patterns below this confidence with no recent updates are evicted.
const EVICTION_CONFIDENCE: f64 = 0.2;

/// Idle window after which low-confidence patterns are evicted.
const EVICTION_IDLE_SECS: i64 = 3_600;

/// An append entry produced at task completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRecord {
    /// Completion timestamp
    pub recorded_at: DateTime<Utc>,
    /// Completed task
    pub task_id: TaskId,
    /// Model the task ran against
    pub model_name: String,
    /// Workload category
    pub task_type: TaskType,
    /// Strategy the plan used
    pub strategy: StrategyKind,
    /// Observed end-to-end latency in milliseconds
    pub latency_ms: f64,
    /// Whether the task succeeded
    pub success: bool,
    /// Approximate input size in bytes, for bucketing
    pub input_bytes: usize,
}

/// Coarse input-size bucket used in pattern keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeBucket {
    /// Under 4 KiB
    Small,
    /// 4 KiB to 256 KiB
    Medium,
    /// Over 256 KiB
    Large,
}

impl SizeBucket {
    /// Bucket for an input of `bytes`.
    pub fn for_bytes(bytes: usize) -> Self {
        if bytes < 4 << 10 {
            SizeBucket::Small
        } else if bytes < 256 << 10 {
            SizeBucket::Medium
        } else {
            SizeBucket::Large
        }
    }
}

/// Workload signature a pattern is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternKey {
    /// Workload category
    pub task_type: TaskType,
    /// Model family (e.g. "bert" for "bert-base")
    pub model_family: String,
    /// Approximate input size bucket
    pub size_bucket: SizeBucket,
}

impl PatternKey {
    /// Key for a task about to be scheduled.
    pub fn for_task(task: &Task) -> Self {
        let input_bytes = task.payload.to_string().len();
        Self {
            task_type: task.task_type,
            model_family: ModelProfile::family_of(&task.model_name),
            size_bucket: SizeBucket::for_bytes(input_bytes),
        }
    }

    /// Key for a completed record.
    pub fn for_record(record: &PerformanceRecord) -> Self {
        Self {
            task_type: record.task_type,
            model_family: ModelProfile::family_of(&record.model_name),
            size_bucket: SizeBucket::for_bytes(record.input_bytes),
        }
    }
}

/// Rolling per-strategy outcome statistics inside a pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyOutcome {
    /// EMA of the success indicator
    pub success_rate: f64,
    /// EMA of observed latency in milliseconds
    pub avg_latency_ms: f64,
    /// Observations folded in
    pub samples: u64,
    /// Last observation time
    pub last_update: DateTime<Utc>,
}

/// A learned association between a workload signature and strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingPattern {
    /// Workload signature
    pub key: PatternKey,
    /// Outcome statistics per strategy observed under this signature
    pub strategies: HashMap<StrategyKind, StrategyOutcome>,
    /// Confidence in [0, 1], grows with sample count
    pub confidence: f64,
    /// Last time any strategy under this pattern was updated
    pub last_updated: DateTime<Utc>,
}

impl SchedulingPattern {
    fn total_samples(&self) -> u64 {
        self.strategies.values().map(|s| s.samples).sum()
    }

    fn refresh_confidence(&mut self) {
        let samples = self.total_samples() as f64;
        self.confidence = (samples / (samples + 10.0)).min(0.95);
    }
}

/// A recommendation handed to the planner: the winning strategy, its
/// confidence, and the per-strategy weights used to rank alternatives.
#[derive(Debug, Clone)]
pub struct StrategyAdvice {
    /// Highest-weighted strategy
    pub strategy: StrategyKind,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Normalized weight per strategy with observed history
    pub scores: HashMap<StrategyKind, f64>,
}

impl StrategyAdvice {
    /// Advice with no history behind it.
    pub fn fallback(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            confidence: 0.0,
            scores: HashMap::new(),
        }
    }

    /// Weight for one strategy; zero when unobserved.
    pub fn score_for(&self, kind: StrategyKind) -> f64 {
        self.scores.get(&kind).copied().unwrap_or(0.0)
    }
}

/// Pattern-based strategy advisor.
pub struct AdaptiveAdvisor {
    settings: AdvisorSettings,
    fallback: StrategyKind,
    history: Mutex<VecDeque<PerformanceRecord>>,
    patterns: RwLock<HashMap<PatternKey, SchedulingPattern>>,
    // streaks toward pattern insertion for unseen signatures
    pending: Mutex<HashMap<PatternKey, (StrategyKind, u32)>>,
    timeouts: AtomicU64,
    metrics: Arc<MetricsCollector>,
}

impl AdaptiveAdvisor {
    /// Create an advisor; `fallback` is the configured default strategy
    /// used when no task-type default applies.
    pub fn new(
        settings: AdvisorSettings,
        fallback: StrategyKind,
        metrics: Arc<MetricsCollector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            fallback,
            history: Mutex::new(VecDeque::new()),
            patterns: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            timeouts: AtomicU64::new(0),
            metrics,
        })
    }

    /// Hard-coded default per task type; other types use the configured
    /// default strategy.
    pub fn default_for(&self, task_type: TaskType) -> StrategyKind {
        match task_type {
            TaskType::Inference => StrategyKind::Layerwise,
            TaskType::Embedding => StrategyKind::DataSplit,
            TaskType::Classification => StrategyKind::TaskParallelism,
            _ => self.fallback,
        }
    }

    /// Recommend a strategy for `task` within the decision budget. A
    /// computation that exceeds the budget falls back to the task-type
    /// default and bumps the timed-out counter.
    pub async fn recommend(&self, task: &Task) -> StrategyAdvice {
        let default = self.default_for(task.task_type);
        if !self.settings.enabled {
            return StrategyAdvice::fallback(default);
        }

        let computation = self.compute_advice(task, default);
        match tokio::time::timeout(self.settings.decision_timeout(), computation).await {
            Ok(advice) => advice,
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_advisor_timeout();
                StrategyAdvice::fallback(default)
            }
        }
    }

    async fn compute_advice(&self, task: &Task, default: StrategyKind) -> StrategyAdvice {
        let key = PatternKey::for_task(task);
        let now = Utc::now();

        let patterns = self.patterns.read().await;
        let Some(pattern) = patterns.get(&key) else {
            return StrategyAdvice::fallback(default);
        };

        // weight = pattern confidence × success EMA × recency × latency
        // factor, where the fastest strategy under this pattern gets
        // latency factor 1.0
        let best_latency = pattern
            .strategies
            .values()
            .filter(|o| o.avg_latency_ms > 0.0)
            .map(|o| o.avg_latency_ms)
            .fold(f64::INFINITY, f64::min);

        let mut raw: Vec<(StrategyKind, f64)> = pattern
            .strategies
            .iter()
            .map(|(kind, outcome)| {
                let age_secs = (now - outcome.last_update).num_seconds().max(0) as f64;
                let recency = 0.5_f64.powf(age_secs / 3_600.0);
                let latency_factor = if best_latency.is_finite() && outcome.avg_latency_ms > 0.0 {
                    best_latency / outcome.avg_latency_ms
                } else {
                    1.0
                };
                (
                    *kind,
                    pattern.confidence * outcome.success_rate * recency * latency_factor,
                )
            })
            .collect();

        let total: f64 = raw.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return StrategyAdvice::fallback(default);
        }

        // highest weight wins; ties break on the stable strategy ordering
        raw.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        let (winner, weight) = raw[0];

        let scores: HashMap<StrategyKind, f64> =
            raw.iter().map(|(k, w)| (*k, w / total)).collect();
        StrategyAdvice {
            strategy: winner,
            confidence: (weight / total).clamp(0.0, 1.0),
            scores,
        }
    }

    /// Fold a terminal outcome into the history ring and pattern table.
    pub async fn observe(&self, record: PerformanceRecord) {
        let key = PatternKey::for_record(&record);

        {
            let mut history = self.history.lock().await;
            if history.len() >= self.settings.clamped_history() {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        let mut patterns = self.patterns.write().await;
        if let Some(pattern) = patterns.get_mut(&key) {
            Self::learn(pattern, &record, self.settings.learning_rate);
        } else {
            drop(patterns);
            if self.advance_streak(&key, &record).await {
                let mut patterns = self.patterns.write().await;
                let pattern = patterns.entry(key.clone()).or_insert(SchedulingPattern {
                    key: key.clone(),
                    strategies: HashMap::new(),
                    confidence: 0.0,
                    last_updated: record.recorded_at,
                });
                // seed with the streak that earned the pattern
                for _ in 0..PATTERN_SEED_STREAK {
                    Self::learn(pattern, &record, self.settings.learning_rate);
                }
                debug!(family = %key.model_family, task_type = %key.task_type, "pattern inserted");
            }
        }

        self.evict_stale(Utc::now()).await;
    }

    /// Streak bookkeeping for unseen signatures. Returns true when the
    /// streak reaches the insertion threshold.
    async fn advance_streak(&self, key: &PatternKey, record: &PerformanceRecord) -> bool {
        let mut pending = self.pending.lock().await;
        if !record.success {
            pending.remove(key);
            return false;
        }
        let entry = pending.entry(key.clone()).or_insert((record.strategy, 0));
        if entry.0 == record.strategy {
            entry.1 += 1;
        } else {
            *entry = (record.strategy, 1);
        }
        if entry.1 >= PATTERN_SEED_STREAK {
            pending.remove(key);
            true
        } else {
            false
        }
    }

    fn learn(pattern: &mut SchedulingPattern, record: &PerformanceRecord, rate: f64) {
        let outcome = pattern
            .strategies
            .entry(record.strategy)
            .or_insert(StrategyOutcome {
                success_rate: if record.success { 1.0 } else { 0.0 },
                avg_latency_ms: record.latency_ms,
                samples: 0,
                last_update: record.recorded_at,
            });
        let observed = if record.success { 1.0 } else { 0.0 };
        outcome.success_rate += rate * (observed - outcome.success_rate);
        outcome.avg_latency_ms += rate * (record.latency_ms - outcome.avg_latency_ms);
        outcome.samples += 1;
        outcome.last_update = record.recorded_at;
        pattern.last_updated = record.recorded_at;
        pattern.refresh_confidence();
    }

    /// Drop patterns with confidence below the eviction threshold and no
    /// updates within the idle window.
    pub async fn evict_stale(&self, now: DateTime<Utc>) {
        let mut patterns = self.patterns.write().await;
        patterns.retain(|_, p| {
            p.confidence >= EVICTION_CONFIDENCE
                || now - p.last_updated < ChronoDuration::seconds(EVICTION_IDLE_SECS)
        });
    }

    /// Recommendations that exceeded the decision budget.
    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Number of learned patterns.
    pub async fn pattern_count(&self) -> usize {
        self.patterns.read().await.len()
    }

    /// Copy of the bounded history ring, oldest first.
    pub async fn history(&self) -> Vec<PerformanceRecord> {
        self.history.lock().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;
    use uuid::Uuid;

    fn advisor() -> Arc<AdaptiveAdvisor> {
        AdaptiveAdvisor::new(
            AdvisorSettings::default(),
            StrategyKind::Layerwise,
            Arc::new(MetricsCollector::new().unwrap()),
        )
    }

    fn record(strategy: StrategyKind, latency_ms: f64, success: bool) -> PerformanceRecord {
        PerformanceRecord {
            recorded_at: Utc::now(),
            task_id: Uuid::new_v4(),
            model_name: "bert-base".to_string(),
            task_type: TaskType::Embedding,
            strategy,
            latency_ms,
            success,
            input_bytes: 512,
        }
    }

    fn embedding_task() -> Task {
        Task::new(TaskType::Embedding, "bert-base")
    }

    #[tokio::test]
    async fn defaults_when_no_pattern() {
        let advisor = advisor();
        let advice = advisor.recommend(&embedding_task()).await;
        assert_eq!(advice.strategy, StrategyKind::DataSplit);
        assert_eq!(advice.confidence, 0.0);
    }

    #[tokio::test]
    async fn pattern_requires_three_consecutive_successes() {
        let advisor = advisor();
        advisor.observe(record(StrategyKind::DataSplit, 80.0, true)).await;
        advisor.observe(record(StrategyKind::DataSplit, 80.0, true)).await;
        assert_eq!(advisor.pattern_count().await, 0);
        // a failure resets the streak
        advisor.observe(record(StrategyKind::DataSplit, 80.0, false)).await;
        advisor.observe(record(StrategyKind::DataSplit, 80.0, true)).await;
        advisor.observe(record(StrategyKind::DataSplit, 80.0, true)).await;
        assert_eq!(advisor.pattern_count().await, 0);
        advisor.observe(record(StrategyKind::DataSplit, 80.0, true)).await;
        assert_eq!(advisor.pattern_count().await, 1);
    }

    #[tokio::test]
    async fn converges_on_faster_strategy() {
        let advisor = advisor();
        for _ in 0..100 {
            advisor.observe(record(StrategyKind::DataSplit, 80.0, true)).await;
        }
        for _ in 0..100 {
            advisor.observe(record(StrategyKind::Layerwise, 400.0, true)).await;
        }

        let advice = advisor.recommend(&embedding_task()).await;
        assert_eq!(advice.strategy, StrategyKind::DataSplit);
        assert!(
            advice.confidence >= 0.7,
            "confidence {} below threshold",
            advice.confidence
        );
    }

    #[tokio::test]
    async fn failures_lower_strategy_weight() {
        let advisor = advisor();
        for _ in 0..10 {
            advisor.observe(record(StrategyKind::DataSplit, 80.0, true)).await;
        }
        for _ in 0..40 {
            advisor.observe(record(StrategyKind::DataSplit, 80.0, false)).await;
        }
        for _ in 0..10 {
            advisor
                .observe(record(StrategyKind::TensorParallelism, 90.0, true))
                .await;
        }
        let advice = advisor.recommend(&embedding_task()).await;
        assert_eq!(advice.strategy, StrategyKind::TensorParallelism);
    }

    #[tokio::test]
    async fn disabled_advisor_returns_default_immediately() {
        let advisor = AdaptiveAdvisor::new(
            AdvisorSettings {
                enabled: false,
                ..AdvisorSettings::default()
            },
            StrategyKind::DataSplit,
            Arc::new(MetricsCollector::new().unwrap()),
        );
        let advice = advisor.recommend(&embedding_task()).await;
        assert_eq!(advice.strategy, StrategyKind::DataSplit);
    }

    #[tokio::test]
    async fn history_ring_is_bounded() {
        let advisor = AdaptiveAdvisor::new(
            AdvisorSettings {
                history_size: 100,
                ..AdvisorSettings::default()
            },
            StrategyKind::Layerwise,
            Arc::new(MetricsCollector::new().unwrap()),
        );
        for _ in 0..250 {
            advisor.observe(record(StrategyKind::DataSplit, 80.0, true)).await;
        }
        assert_eq!(advisor.history().await.len(), 100);
    }
}

//! Scheduler configuration: every recognized key with a safe default,
//! layered loading from a TOML file plus environment overrides, and
//! fail-fast validation of invalid combinations at startup.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{SchedulerError, SchedulerResult, StrategyKind};

const DEFAULT_CONFIG_PATH: &str = "configs/scheduler.toml";
const ENV_PREFIX: &str = "INFERMESH";

/// Complete configuration of the scheduler core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Task queue sizing and deadlines
    pub queue: QueueSettings,
    /// Worker registry limits and health cadence
    pub workers: WorkerSettings,
    /// Load balancer algorithm and score weights
    pub balancer: BalancerSettings,
    /// Partition planner thresholds
    pub partition: PartitionSettings,
    /// Task tracker timeouts and buffers
    pub tracker: TrackerSettings,
    /// Adaptive advisor learning parameters
    pub advisor: AdvisorSettings,
    /// Re-queue backoff curve for transient failures
    pub retry: RetrySettings,
    /// Cluster integration toggles and loop cadences
    pub cluster: ClusterSettings,
}

impl SchedulerConfig {
    /// Load configuration from the default path (if present) overlaid with
    /// `INFERMESH__`-prefixed environment variables, then validate.
    pub fn load() -> SchedulerResult<Self> {
        Self::load_from_path(None::<PathBuf>)
    }

    /// Load configuration from an explicit file, the default path, and the
    /// environment. Invalid combinations fail here, before any component
    /// starts.
    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> SchedulerResult<Self> {
        let mut builder = Config::builder().add_source(
            File::from(PathBuf::from(DEFAULT_CONFIG_PATH))
                .format(FileFormat::Toml)
                .required(false),
        );

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.as_ref())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let config: SchedulerConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject invalid combinations: ratios and weights that do not sum to
    /// 1.0, zero capacities, and unknown algorithm or strategy names.
    pub fn validate(&self) -> SchedulerResult<()> {
        let ratios = &self.queue.priority_ratios;
        let ratio_sum = ratios.high + ratios.normal + ratios.low;
        if (ratio_sum - 1.0).abs() > 1e-6 {
            return Err(SchedulerError::Configuration(format!(
                "queue priority ratios must sum to 1.0, got {ratio_sum}"
            )));
        }
        if ratios.high <= 0.0 || ratios.normal <= 0.0 || ratios.low <= 0.0 {
            return Err(SchedulerError::Configuration(
                "queue priority ratios must all be positive".to_string(),
            ));
        }
        if self.queue.max_queue_size == 0 {
            return Err(SchedulerError::Configuration(
                "max_queue_size must be positive".to_string(),
            ));
        }

        let weights = &self.balancer.weights;
        let weight_sum = weights.cpu + weights.memory + weights.tasks + weights.health;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(SchedulerError::Configuration(format!(
                "load balance weights must sum to 1.0, got {weight_sum}"
            )));
        }
        self.balancer.algorithm()?;

        if self.workers.max_workers == 0 {
            return Err(SchedulerError::Configuration(
                "max_workers must be positive".to_string(),
            ));
        }
        if self.workers.worker_timeout_secs == 0 {
            return Err(SchedulerError::Configuration(
                "worker_timeout must be positive".to_string(),
            ));
        }

        if self.partition.default_strategy == StrategyKind::Adaptive {
            return Err(SchedulerError::Configuration(
                "partition_default_strategy must be a concrete strategy".to_string(),
            ));
        }

        if self.tracker.result_buffer_size == 0 {
            return Err(SchedulerError::Configuration(
                "result_buffer_size must be positive".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.advisor.learning_rate) || self.advisor.learning_rate == 0.0 {
            return Err(SchedulerError::Configuration(
                "advisor_learning_rate must be in (0, 1]".to_string(),
            ));
        }

        let retry = &self.retry;
        if retry.base_delay_ms == 0 || retry.max_delay_ms < retry.base_delay_ms {
            return Err(SchedulerError::Configuration(
                "retry delays must satisfy 0 < base_delay_ms <= max_delay_ms".to_string(),
            ));
        }
        if retry.backoff_multiplier < 1.0 || !retry.backoff_multiplier.is_finite() {
            return Err(SchedulerError::Configuration(
                "retry backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Task queue sizing and deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Total queued-task capacity across all bands; the backpressure
    /// threshold
    pub max_queue_size: usize,
    /// How long an enqueue may wait for band space before `queue_full`,
    /// in milliseconds
    pub queue_timeout_ms: u64,
    /// Split of `max_queue_size` across the three bands; must sum to 1.0
    pub priority_ratios: PriorityRatios,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            queue_timeout_ms: 1_000,
            priority_ratios: PriorityRatios::default(),
        }
    }
}

impl QueueSettings {
    /// Enqueue deadline as a duration.
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// Capacity split across priority bands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityRatios {
    /// Share of capacity for critical and high priority tasks
    pub high: f64,
    /// Share for normal priority
    pub normal: f64,
    /// Share for low priority
    pub low: f64,
}

impl Default for PriorityRatios {
    fn default() -> Self {
        Self {
            high: 0.3,
            normal: 0.5,
            low: 0.2,
        }
    }
}

/// Worker registry limits and health cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Maximum registered workers
    pub max_workers: usize,
    /// Silence window after which a worker is marked offline, seconds
    pub worker_timeout_secs: u64,
    /// Cadence of registry aggregate refresh, seconds
    pub health_check_interval_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_workers: 1_000,
            worker_timeout_secs: 30,
            health_check_interval_secs: 10,
        }
    }
}

impl WorkerSettings {
    /// Offline threshold as a duration.
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    /// Health sweep cadence as a duration.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Load balancer algorithm selection and score weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerSettings {
    /// Default selection algorithm; tasks may override via the
    /// `balance_algorithm` metadata key
    pub load_balance_algorithm: String,
    /// Weight factors for composite scores; must sum to 1.0
    pub weights: BalanceWeights,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            load_balance_algorithm: "least_loaded".to_string(),
            weights: BalanceWeights::default(),
        }
    }
}

impl BalancerSettings {
    /// Parse the configured algorithm name.
    pub fn algorithm(&self) -> SchedulerResult<crate::balancer::BalanceAlgorithm> {
        self.load_balance_algorithm.parse()
    }
}

/// Weight factors for composite worker scores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceWeights {
    /// Weight of CPU availability or usage
    pub cpu: f64,
    /// Weight of memory availability or usage
    pub memory: f64,
    /// Weight of the active-task component
    pub tasks: f64,
    /// Weight of the health score
    pub health: f64,
}

impl Default for BalanceWeights {
    fn default() -> Self {
        Self {
            cpu: 0.35,
            memory: 0.35,
            tasks: 0.2,
            health: 0.1,
        }
    }
}

/// Partition planner thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionSettings {
    /// Strategy used when selection ties or the advisor abstains
    pub default_strategy: StrategyKind,
    /// Layer count above which layerwise and pipeline plans apply
    pub layer_threshold: u32,
    /// Maximum shards a data-split plan may produce
    pub batch_size_limit: usize,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            default_strategy: StrategyKind::Layerwise,
            layer_threshold: 12,
            batch_size_limit: 32,
        }
    }
}

/// Task tracker timeouts and buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    /// Wall-clock execution budget before a tracked task times out, seconds
    pub task_timeout_secs: u64,
    /// Cadence of the timeout sweeper, seconds
    pub cleanup_interval_secs: u64,
    /// Capacity of the bounded results channel
    pub result_buffer_size: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            task_timeout_secs: 300,
            cleanup_interval_secs: 5,
            result_buffer_size: 1_024,
        }
    }
}

impl TrackerSettings {
    /// Task execution budget as a duration.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Sweeper cadence as a duration.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Adaptive advisor learning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorSettings {
    /// Whether recommendations are consulted at all
    pub enabled: bool,
    /// EMA learning rate for pattern success updates, in (0, 1]
    pub learning_rate: f64,
    /// Budget for one recommendation before falling back to the default,
    /// milliseconds
    pub decision_timeout_ms: u64,
    /// Capacity of the performance history ring; clamped to [100, 1000]
    pub history_size: usize,
}

impl Default for AdvisorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            learning_rate: 0.1,
            decision_timeout_ms: 50,
            history_size: 500,
        }
    }
}

impl AdvisorSettings {
    /// Decision budget as a duration.
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    /// History capacity clamped to the supported range.
    pub fn clamped_history(&self) -> usize {
        self.history_size.clamp(100, 1_000)
    }
}

/// Re-queue backoff curve for transient failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Delay before the first re-queue attempt, milliseconds
    pub base_delay_ms: u64,
    /// Ceiling on the backoff curve, milliseconds
    pub max_delay_ms: u64,
    /// Factor by which the delay grows per attempt; at least 1.0
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 50,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Cluster integration toggles and loop cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Replicate registry and ledger updates through the consensus engine
    pub enable_consensus: bool,
    /// Dispatch assignments over the P2P transport
    pub enable_p2p_messaging: bool,
    /// Cadence of the monitoring loop, seconds
    pub monitoring_interval_secs: u64,
    /// Log level handed to the tracing subscriber at start
    pub log_level: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            enable_consensus: true,
            enable_p2p_messaging: true,
            monitoring_interval_secs: 10,
            log_level: "info".to_string(),
        }
    }
}

impl ClusterSettings {
    /// Monitoring cadence as a duration.
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SchedulerConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_ratios_fail_fast() {
        let mut config = SchedulerConfig::default();
        config.queue.priority_ratios.high = 0.9;
        assert!(matches!(
            config.validate(),
            Err(SchedulerError::Configuration(_))
        ));
    }

    #[test]
    fn bad_weights_fail_fast() {
        let mut config = SchedulerConfig::default();
        config.balancer.weights.health = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_algorithm_fails_fast() {
        let mut config = SchedulerConfig::default();
        config.balancer.load_balance_algorithm = "coin_flip".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn degenerate_backoff_curve_fails_fast() {
        let mut config = SchedulerConfig::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.retry.max_delay_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn adaptive_default_strategy_is_rejected() {
        let mut config = SchedulerConfig::default();
        config.partition.default_strategy = StrategyKind::Adaptive;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.toml");
        std::fs::write(
            &path,
            r#"
[queue]
max_queue_size = 64
queue_timeout_ms = 250

[queue.priority_ratios]
high = 0.5
normal = 0.3
low = 0.2

[balancer]
load_balance_algorithm = "resource_aware"
"#,
        )
        .unwrap();

        let config = SchedulerConfig::load_from_path(Some(&path)).unwrap();
        assert_eq!(config.queue.max_queue_size, 64);
        assert_eq!(config.queue.queue_timeout_ms, 250);
        assert_eq!(config.balancer.load_balance_algorithm, "resource_aware");
        // untouched sections keep their defaults
        assert_eq!(config.workers.max_workers, 1_000);
    }

    #[test]
    fn load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.toml");
        std::fs::write(
            &path,
            r#"
[queue.priority_ratios]
high = 0.9
normal = 0.9
low = 0.9
"#,
        )
        .unwrap();
        assert!(SchedulerConfig::load_from_path(Some(&path)).is_err());
    }
}

// src/config.rs

//! # Engine Configuration
//!
//! A single JSON document describes the node pool, the mempool analytics pipeline,
//! the transaction monitor and the alert channels. Durations are expressed as
//! integer `*_ms` / `*_secs` fields. Every section has a `Default` and the whole
//! document is checked by [`EngineConfig::validate`], which rejects bad values
//! instead of clamping them.

use crate::errors::ConfigError;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

//================================================================================================//
//                                       Top-Level Config                                         //
//================================================================================================//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub log_level: String,
    /// Chain served by this engine. Nodes configured for other chains are registered but not used.
    pub chain: String,
    pub metrics: MetricsSettings,
    pub node_pool: NodePoolConfig,
    pub mempool: MempoolConfig,
    pub monitor: MonitorConfig,
    pub alerts: AlertConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            chain: "ethereum".to_string(),
            metrics: MetricsSettings::default(),
            node_pool: NodePoolConfig::default(),
            mempool: MempoolConfig::default(),
            monitor: MonitorConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reads, parses and validates a JSON configuration file.
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from JSON: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node_pool.validate()?;
        if !self.node_pool.nodes.iter().any(|n| n.chain == self.chain) {
            return Err(ConfigError::invalid(
                "chain",
                format!("no node is configured for chain {}", self.chain),
            ));
        }
        self.mempool.validate()?;
        self.monitor.validate()?;
        self.alerts.validate()?;
        if self.metrics.enabled {
            require_positive("metrics.port", self.metrics.port as u64)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 9100,
        }
    }
}

//================================================================================================//
//                                          Node Pool                                             //
//================================================================================================//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub provider: String,
    pub chain: String,
    pub url: String,
    /// When set, a health probe returning a different chain id is a failure.
    #[serde(default)]
    pub expected_chain_id: Option<u64>,
    /// Lower value wins ties between otherwise equal candidates.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_node_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub requests_per_second: Option<u32>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_priority() -> u32 {
    100
}
fn default_weight() -> u32 {
    1
}
fn default_max_in_flight() -> usize {
    64
}
fn default_node_timeout_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}

impl NodeConfig {
    pub fn new(id: &str, chain: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            provider: "generic".to_string(),
            chain: chain.to_string(),
            url: url.to_string(),
            expected_chain_id: None,
            priority: default_priority(),
            weight: default_weight(),
            max_in_flight: default_max_in_flight(),
            timeout_ms: default_node_timeout_ms(),
            requests_per_second: None,
            enabled: true,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = format!("node_pool.nodes[{}]", self.id);
        if self.id.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "node_pool.nodes[].id".to_string(),
            });
        }
        if self.url.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: format!("{prefix}.url"),
            });
        }
        if self.chain.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: format!("{prefix}.chain"),
            });
        }
        require_positive(&format!("{prefix}.weight"), self.weight as u64)?;
        require_positive(&format!("{prefix}.max_in_flight"), self.max_in_flight as u64)?;
        require_positive(&format!("{prefix}.timeout_ms"), self.timeout_ms)?;
        if let Some(rps) = self.requests_per_second {
            require_positive(&format!("{prefix}.requests_per_second"), rps as u64)?;
        }
        Ok(())
    }
}

/// A single liveness probe executed by the health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthProbe {
    #[serde(alias = "eth_chainId")]
    ChainId,
    #[serde(alias = "eth_blockNumber")]
    BlockNumber,
    #[serde(alias = "eth_syncing")]
    SyncStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_latency_ms: u64,
    pub probes: Vec<HealthProbe>,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 10_000,
            max_latency_ms: 5_000,
            probes: vec![
                HealthProbe::ChainId,
                HealthProbe::BlockNumber,
                HealthProbe::SyncStatus,
            ],
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("node_pool.health_check.interval_ms", self.interval_ms)?;
        require_positive("node_pool.health_check.timeout_ms", self.timeout_ms)?;
        require_positive("node_pool.health_check.max_latency_ms", self.max_latency_ms)?;
        require_positive(
            "node_pool.health_check.unhealthy_threshold",
            self.unhealthy_threshold as u64,
        )?;
        require_positive(
            "node_pool.health_check.healthy_threshold",
            self.healthy_threshold as u64,
        )?;
        if self.probes.is_empty() {
            return Err(ConfigError::Empty {
                field: "node_pool.health_check.probes".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LowestLatency,
}

impl FromStr for BalancingStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "weighted_round_robin" | "weighted" => Ok(Self::WeightedRoundRobin),
            "least_connections" => Ok(Self::LeastConnections),
            "lowest_latency" | "latency" => Ok(Self::LowestLatency),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

impl std::fmt::Display for BalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LeastConnections => "least_connections",
            Self::LowestLatency => "lowest_latency",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: BalancingStrategy,
    pub sticky_sessions: bool,
    pub session_timeout_secs: u64,
    /// Pool-wide cap on concurrent requests per node, on top of each node's own limit.
    pub max_requests_per_node: usize,
    /// Additional attempts on other nodes after the first one fails.
    pub max_retries: u32,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalancingStrategy::RoundRobin,
            sticky_sessions: true,
            session_timeout_secs: 300,
            max_requests_per_node: 100,
            max_retries: 3,
        }
    }
}

impl LoadBalancerConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_positive(
            "node_pool.load_balancer.session_timeout_secs",
            self.session_timeout_secs,
        )?;
        require_positive(
            "node_pool.load_balancer.max_requests_per_node",
            self.max_requests_per_node as u64,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodePoolConfig {
    pub nodes: Vec<NodeConfig>,
    pub health_check: HealthCheckConfig,
    pub load_balancer: LoadBalancerConfig,
}

impl NodePoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Empty {
                field: "node_pool.nodes".to_string(),
            });
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::DuplicateNode(node.id.clone()));
            }
        }
        self.health_check.validate()?;
        self.load_balancer.validate()
    }
}

//================================================================================================//
//                                      Mempool Analytics                                         //
//================================================================================================//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    pub update_interval_ms: u64,
    pub tracking_window_secs: u64,
    pub max_transactions: usize,
    pub percentiles: Vec<f64>,
    /// Relative band around zero inside which the half-window trend is `Stable`.
    pub trend_tolerance: f64,
    /// Poll the node pool for the pending-transaction feed on every cycle.
    pub poll_pending_feed: bool,
    pub congestion: CongestionConfig,
    pub predictor: PredictorConfig,
    pub estimator: EstimatorConfig,
    pub priority: PriorityConfig,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 10_000,
            tracking_window_secs: 3_600,
            max_transactions: 10_000,
            percentiles: vec![10.0, 25.0, 50.0, 75.0, 90.0, 95.0, 99.0],
            trend_tolerance: 0.05,
            poll_pending_feed: true,
            congestion: CongestionConfig::default(),
            predictor: PredictorConfig::default(),
            estimator: EstimatorConfig::default(),
            priority: PriorityConfig::default(),
        }
    }
}

impl MempoolConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn tracking_window(&self) -> Duration {
        Duration::from_secs(self.tracking_window_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("mempool.update_interval_ms", self.update_interval_ms)?;
        require_positive("mempool.tracking_window_secs", self.tracking_window_secs)?;
        require_positive("mempool.max_transactions", self.max_transactions as u64)?;
        if self.percentiles.is_empty() {
            return Err(ConfigError::Empty {
                field: "mempool.percentiles".to_string(),
            });
        }
        for p in &self.percentiles {
            require_range("mempool.percentiles", *p, 0.0, 100.0)?;
        }
        require_range("mempool.trend_tolerance", self.trend_tolerance, 0.0, 1.0)?;
        self.congestion.validate()?;
        self.predictor.validate()?;
        self.estimator.validate()?;
        self.priority.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionConfig {
    pub low_threshold: f64,
    pub medium_threshold: f64,
    pub high_threshold: f64,
    pub queue_weight: f64,
    pub spread_weight: f64,
    pub trend_weight: f64,
    /// Smoothing factor for the queue-depth baseline.
    pub baseline_alpha: f64,
    pub prediction_horizon_secs: u64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            low_threshold: 0.3,
            medium_threshold: 0.6,
            high_threshold: 0.8,
            queue_weight: 0.5,
            spread_weight: 0.3,
            trend_weight: 0.2,
            baseline_alpha: 0.1,
            prediction_horizon_secs: 300,
        }
    }
}

impl CongestionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_range("mempool.congestion.low_threshold", self.low_threshold, 0.0, 1.0)?;
        require_range("mempool.congestion.medium_threshold", self.medium_threshold, 0.0, 1.0)?;
        require_range("mempool.congestion.high_threshold", self.high_threshold, 0.0, 1.0)?;
        if !(self.low_threshold < self.medium_threshold && self.medium_threshold < self.high_threshold) {
            return Err(ConfigError::invalid(
                "mempool.congestion",
                "thresholds must be strictly increasing",
            ));
        }
        require_range("mempool.congestion.queue_weight", self.queue_weight, 0.0, 1.0)?;
        require_range("mempool.congestion.spread_weight", self.spread_weight, 0.0, 1.0)?;
        require_range("mempool.congestion.trend_weight", self.trend_weight, 0.0, 1.0)?;
        if self.queue_weight + self.spread_weight + self.trend_weight <= 0.0 {
            return Err(ConfigError::invalid(
                "mempool.congestion",
                "at least one weight must be positive",
            ));
        }
        require_range("mempool.congestion.baseline_alpha", self.baseline_alpha, 0.0, 1.0)?;
        require_positive(
            "mempool.congestion.prediction_horizon_secs",
            self.prediction_horizon_secs,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionMethod {
    MovingAverage,
    ExponentialSmoothing,
    LinearRegression,
    PolynomialRegression,
    Ensemble,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub methods: Vec<PredictionMethod>,
    pub horizons_secs: Vec<u64>,
    /// Two-sided confidence level of the reported price range.
    pub confidence_level: f64,
    /// Number of median samples kept as the forecasting series.
    pub history_size: usize,
    pub moving_average_window: usize,
    pub smoothing_alpha: f64,
    pub smoothing_beta: f64,
    /// Relative spread between member predictions above which the ensemble is discounted.
    pub ensemble_spread_tolerance: f64,
    /// Minimum confidence for a short-horizon prediction to influence the optimal price.
    pub blend_confidence: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            methods: vec![
                PredictionMethod::MovingAverage,
                PredictionMethod::ExponentialSmoothing,
                PredictionMethod::LinearRegression,
                PredictionMethod::PolynomialRegression,
                PredictionMethod::Ensemble,
            ],
            horizons_secs: vec![60, 300, 900],
            confidence_level: 0.95,
            history_size: 120,
            moving_average_window: 10,
            smoothing_alpha: 0.3,
            smoothing_beta: 0.1,
            ensemble_spread_tolerance: 0.1,
            blend_confidence: 0.8,
        }
    }
}

impl PredictorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.methods.is_empty() {
            return Err(ConfigError::Empty {
                field: "mempool.predictor.methods".to_string(),
            });
        }
        if self.horizons_secs.is_empty() {
            return Err(ConfigError::Empty {
                field: "mempool.predictor.horizons_secs".to_string(),
            });
        }
        for h in &self.horizons_secs {
            require_positive("mempool.predictor.horizons_secs", *h)?;
        }
        require_open_unit("mempool.predictor.confidence_level", self.confidence_level)?;
        require_positive("mempool.predictor.history_size", self.history_size as u64)?;
        require_positive(
            "mempool.predictor.moving_average_window",
            self.moving_average_window as u64,
        )?;
        require_open_unit("mempool.predictor.smoothing_alpha", self.smoothing_alpha)?;
        require_open_unit("mempool.predictor.smoothing_beta", self.smoothing_beta)?;
        require_range(
            "mempool.predictor.ensemble_spread_tolerance",
            self.ensemble_spread_tolerance,
            0.0,
            1.0,
        )?;
        require_range("mempool.predictor.blend_confidence", self.blend_confidence, 0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Maximum number of confirmation observations retained.
    pub history_window: usize,
    /// Width of a percentile-rank bucket, in percentile points.
    pub bucket_width: f64,
    pub block_time_secs: f64,
    /// Fallback curve: blocks to wait at rank 100 and at rank 0.
    pub min_blocks: f64,
    pub max_blocks: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            history_window: 5_000,
            bucket_width: 10.0,
            block_time_secs: 12.0,
            min_blocks: 1.0,
            max_blocks: 20.0,
        }
    }
}

impl EstimatorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("mempool.estimator.history_window", self.history_window as u64)?;
        require_range("mempool.estimator.bucket_width", self.bucket_width, f64::MIN_POSITIVE, 100.0)?;
        require_positive_f64("mempool.estimator.block_time_secs", self.block_time_secs)?;
        require_positive_f64("mempool.estimator.min_blocks", self.min_blocks)?;
        if self.max_blocks < self.min_blocks {
            return Err(ConfigError::invalid(
                "mempool.estimator.max_blocks",
                "must not be lower than min_blocks",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingPolicyKind {
    Static,
    Dynamic,
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub gas_price: f64,
    pub tip: f64,
    pub size: f64,
    pub age: f64,
    pub replacement: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            gas_price: 0.4,
            tip: 0.3,
            size: 0.1,
            age: 0.1,
            replacement: 0.1,
        }
    }
}

impl PriorityWeights {
    pub fn as_array(&self) -> [f64; 5] {
        [self.gas_price, self.tip, self.size, self.age, self.replacement]
    }

    pub fn from_array(values: [f64; 5]) -> Self {
        Self {
            gas_price: values[0],
            tip: values[1],
            size: values[2],
            age: values[3],
            replacement: values[4],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub policy: WeightingPolicyKind,
    pub weights: PriorityWeights,
    pub learning_rate: f64,
    /// Ages at or beyond this many seconds receive the full age factor.
    pub max_age_secs: u64,
    pub top_n: usize,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            policy: WeightingPolicyKind::Static,
            weights: PriorityWeights::default(),
            learning_rate: 0.05,
            max_age_secs: 600,
            top_n: 20,
        }
    }
}

impl PriorityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let w = self.weights.as_array();
        for value in w {
            require_range("mempool.priority.weights", value, 0.0, 1.0)?;
        }
        if w.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::invalid(
                "mempool.priority.weights",
                "at least one weight must be positive",
            ));
        }
        require_range("mempool.priority.learning_rate", self.learning_rate, 0.0, 1.0)?;
        require_positive("mempool.priority.max_age_secs", self.max_age_secs)?;
        require_positive("mempool.priority.top_n", self.top_n as u64)
    }
}

//================================================================================================//
//                                     Transaction Monitor                                        //
//================================================================================================//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub required_confirmations: u64,
    pub max_tracked_transactions: usize,
    pub max_concurrent_polls: usize,
    /// Unconfirmed transactions older than this are classified as failed.
    pub failure_age_threshold_secs: u64,
    /// Pending longer than this raises a stuck alert (once per transaction).
    pub stuck_threshold_secs: u64,
    /// Expected time to confirmation, used to scale alert severity.
    pub expected_confirmation_secs: u64,
    pub retention_period_secs: u64,
    pub cleanup_interval_secs: u64,
    pub shutdown_grace_ms: u64,
    pub retry: RetryConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 15_000,
            required_confirmations: 3,
            max_tracked_transactions: 10_000,
            max_concurrent_polls: 32,
            failure_age_threshold_secs: 3_600,
            stuck_threshold_secs: 1_800,
            expected_confirmation_secs: 180,
            retention_period_secs: 86_400,
            cleanup_interval_secs: 3_600,
            shutdown_grace_ms: 5_000,
            retry: RetryConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("monitor.poll_interval_ms", self.poll_interval_ms)?;
        require_positive("monitor.required_confirmations", self.required_confirmations)?;
        require_positive(
            "monitor.max_tracked_transactions",
            self.max_tracked_transactions as u64,
        )?;
        require_positive("monitor.max_concurrent_polls", self.max_concurrent_polls as u64)?;
        require_positive(
            "monitor.failure_age_threshold_secs",
            self.failure_age_threshold_secs,
        )?;
        require_positive("monitor.stuck_threshold_secs", self.stuck_threshold_secs)?;
        require_positive(
            "monitor.expected_confirmation_secs",
            self.expected_confirmation_secs,
        )?;
        require_positive("monitor.retention_period_secs", self.retention_period_secs)?;
        require_positive("monitor.cleanup_interval_secs", self.cleanup_interval_secs)?;
        require_positive("monitor.shutdown_grace_ms", self.shutdown_grace_ms)?;
        self.retry.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retry_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added or removed at random.
    pub jitter: f64,
    /// Minimum gas price increase per resubmission, in percent.
    pub gas_price_bump_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            base_delay_ms: 30_000,
            backoff_factor: 2.0,
            max_delay_ms: 600_000,
            jitter: 0.1,
            gas_price_bump_percent: 12.5,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("monitor.retry.max_retry_attempts", self.max_retry_attempts as u64)?;
        require_positive("monitor.retry.base_delay_ms", self.base_delay_ms)?;
        if self.backoff_factor < 1.0 || !self.backoff_factor.is_finite() {
            return Err(ConfigError::invalid(
                "monitor.retry.backoff_factor",
                format!("must be a finite value >= 1.0, got {}", self.backoff_factor),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::invalid(
                "monitor.retry.max_delay_ms",
                "must not be lower than base_delay_ms",
            ));
        }
        require_range("monitor.retry.jitter", self.jitter, 0.0, 1.0)?;
        require_range(
            "monitor.retry.gas_price_bump_percent",
            self.gas_price_bump_percent,
            f64::MIN_POSITIVE,
            100.0,
        )
    }
}

//================================================================================================//
//                                            Alerts                                              //
//================================================================================================//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Log {
        #[serde(default = "default_true")]
        enabled: bool,
    },
    Webhook {
        #[serde(default = "default_true")]
        enabled: bool,
        url: String,
    },
    Slack {
        #[serde(default = "default_true")]
        enabled: bool,
        webhook_url: String,
        #[serde(default)]
        channel: Option<String>,
    },
    Email {
        #[serde(default = "default_true")]
        enabled: bool,
        relay_url: String,
        from: String,
        to: Vec<String>,
    },
}

impl ChannelConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ChannelConfig::Log { .. } => Ok(()),
            ChannelConfig::Webhook { url, .. } => require_non_empty("alerts.channels.webhook.url", url),
            ChannelConfig::Slack { webhook_url, .. } => {
                require_non_empty("alerts.channels.slack.webhook_url", webhook_url)
            }
            ChannelConfig::Email { relay_url, to, .. } => {
                require_non_empty("alerts.channels.email.relay_url", relay_url)?;
                if to.is_empty() {
                    return Err(ConfigError::Empty {
                        field: "alerts.channels.email.to".to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub max_history: usize,
    pub channel_timeout_ms: u64,
    pub channels: Vec<ChannelConfig>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_history: 1_000,
            channel_timeout_ms: 5_000,
            channels: vec![ChannelConfig::Log { enabled: true }],
        }
    }
}

impl AlertConfig {
    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("alerts.max_history", self.max_history as u64)?;
        require_positive("alerts.channel_timeout_ms", self.channel_timeout_ms)?;
        for channel in &self.channels {
            channel.validate()?;
        }
        Ok(())
    }
}

//================================================================================================//
//                                          Validation                                            //
//================================================================================================//

fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::not_positive(field, value));
    }
    Ok(())
}

fn require_positive_f64(field: &str, value: f64) -> Result<(), ConfigError> {
    if !(value > 0.0) || !value.is_finite() {
        return Err(ConfigError::not_positive(field, value));
    }
    Ok(())
}

fn require_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if !(min..=max).contains(&value) {
        return Err(ConfigError::out_of_range(field, value, min, max));
    }
    Ok(())
}

fn require_open_unit(field: &str, value: f64) -> Result<(), ConfigError> {
    if !(value > 0.0 && value < 1.0) {
        return Err(ConfigError::out_of_range(field, value, 0.0, 1.0));
    }
    Ok(())
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Empty {
            field: field.to_string(),
        });
    }
    Ok(())
}

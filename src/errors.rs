//! # Centralized Error Handling
//!
//! One typed error enum per subsystem, wrapped by the top-level [`EngineError`].
//! Configuration problems surface at startup, node errors are classified so the
//! load balancer can decide whether to fail over, and monitor errors are returned
//! synchronously to callers of the tracking API.

use ethers::types::H256;
use thiserror::Error;

/// The top-level error type, encapsulating every failure the engine can report.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Node error: {0}")]
    Node(#[from] NodeError),
    #[error("Mempool error: {0}")]
    Mempool(#[from] MempoolError),
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),
    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),
    #[error("Engine is already running")]
    AlreadyRunning,
    #[error("Engine is not running")]
    NotRunning,
}

/// Invalid configuration. Never retryable; reported before any task is spawned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: String, value: String },
    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{field} must not be empty")]
    Empty { field: String },
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),
    #[error("Unknown node id: {0}")]
    UnknownNode(String),
    #[error("Unknown load balancing strategy: {0}")]
    UnknownStrategy(String),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn not_positive(field: &str, value: impl ToString) -> Self {
        ConfigError::NotPositive {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn out_of_range(field: &str, value: f64, min: f64, max: f64) -> Self {
        ConfigError::OutOfRange {
            field: field.to_string(),
            value,
            min,
            max,
        }
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while talking to RPC nodes or selecting one.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out after {0} ms")]
    Timeout(u64),
    #[error("Rate limit error: {0}")]
    RateLimited(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("Chain id mismatch: expected {expected}, got {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },
    #[error("Node is syncing")]
    Syncing,
    #[error("Latency {latency_ms} ms exceeds limit of {limit_ms} ms")]
    TooSlow { latency_ms: u64, limit_ms: u64 },
    #[error("No healthy node available")]
    NoHealthyNode,
    #[error("All {attempts} attempts failed, last error: {last}")]
    PoolExhausted { attempts: usize, last: Box<NodeError> },
    #[error("Cancelled")]
    Cancelled,
}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "too many requests",
    "429",
    "-32005",
    "exceeded",
];

impl NodeError {
    /// Maps a provider error string onto the transient/explicit-RPC split.
    pub fn from_provider_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let lower = msg.to_lowercase();
        if RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
            NodeError::RateLimited(msg)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            NodeError::Timeout(0)
        } else if lower.contains("connection") || lower.contains("dns") || lower.contains("refused") {
            NodeError::Network(msg)
        } else {
            NodeError::Rpc(msg)
        }
    }

    /// Whether the load balancer should try another node after this error.
    pub fn is_failover(&self) -> bool {
        match self {
            NodeError::NoHealthyNode | NodeError::Cancelled | NodeError::PoolExhausted { .. } => false,
            NodeError::Rpc(_) => !self.is_transaction_rejection(),
            _ => true,
        }
    }

    /// Transport-level trouble that says something about the node itself.
    pub fn counts_against_node(&self) -> bool {
        matches!(
            self,
            NodeError::Network(_)
                | NodeError::Timeout(_)
                | NodeError::RateLimited(_)
                | NodeError::ChainIdMismatch { .. }
                | NodeError::Syncing
                | NodeError::TooSlow { .. }
        )
    }

    /// The node answered, but rejected the transaction itself. Another node would too.
    pub fn is_transaction_rejection(&self) -> bool {
        match self {
            NodeError::Rpc(msg) => {
                let lower = msg.to_lowercase();
                TX_REJECTION_PATTERNS.iter().any(|p| lower.contains(p))
            }
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, NodeError::Timeout(_))
    }
}

const TX_REJECTION_PATTERNS: &[&str] = &[
    "nonce too low",
    "already known",
    "underpriced",
    "insufficient funds",
    "intrinsic gas too low",
    "exceeds block gas limit",
];

/// Errors from the gas statistics and mempool analysis pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MempoolError {
    #[error("Tracking window is empty, keeping previous analysis")]
    EmptyWindow,
    #[error("No analysis has been published yet")]
    NoAnalysis,
    #[error("Pending transaction source failed: {0}")]
    Source(#[from] NodeError),
    #[error("Analyzer is already running")]
    AlreadyRunning,
}

/// Errors returned by the transaction monitor's public API and retry manager.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("Transaction {0:?} is already being tracked")]
    AlreadyTracked(H256),
    #[error("Transaction {0:?} is not being tracked")]
    NotTracked(H256),
    #[error("Tracking capacity of {0} transactions exceeded")]
    CapacityExceeded(usize),
    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Retry budget exhausted after {0} attempts")]
    RetryBudgetExhausted(u32),
    #[error("Transaction is not retryable: {0}")]
    NotRetryable(String),
    #[error("Replacement signing failed: {0}")]
    Signer(String),
    #[error("Submission failed: {0}")]
    Submission(#[from] NodeError),
    #[error("Monitor is already running")]
    AlreadyRunning,
}

/// Alert delivery failures. Logged per channel, never propagated to the monitor loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlertError {
    #[error("Channel {channel} is disabled")]
    Disabled { channel: String },
    #[error("Delivery through {channel} failed: {reason}")]
    Delivery { channel: String, reason: String },
    #[error("Delivery through {channel} timed out")]
    Timeout { channel: String },
    #[error("Unknown alert id: {0}")]
    UnknownAlert(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_messages_are_classified() {
        assert!(matches!(
            NodeError::from_provider_message("HTTP 429 Too Many Requests"),
            NodeError::RateLimited(_)
        ));
        assert!(matches!(
            NodeError::from_provider_message("request timed out"),
            NodeError::Timeout(_)
        ));
        assert!(matches!(
            NodeError::from_provider_message("connection refused"),
            NodeError::Network(_)
        ));
        assert!(matches!(
            NodeError::from_provider_message("execution reverted"),
            NodeError::Rpc(_)
        ));
    }

    #[test]
    fn no_healthy_node_is_not_a_failover_error() {
        assert!(!NodeError::NoHealthyNode.is_failover());
        assert!(NodeError::Timeout(100).is_failover());
        assert!(NodeError::Rpc("boom".into()).is_failover());
    }

    #[test]
    fn transaction_rejections_do_not_fail_over() {
        let err = NodeError::Rpc("nonce too low: next nonce 5".into());
        assert!(err.is_transaction_rejection());
        assert!(!err.is_failover());
        assert!(!err.counts_against_node());
        assert!(NodeError::Timeout(10).counts_against_node());
    }
}

// src/monitor/failure.rs

//! Classifies tracked transactions as failed, and failures as retryable or terminal.

use super::{TrackedTransaction, TransactionStatus};
use crate::clock::elapsed_between;
use crate::config::MonitorConfig;
use crate::errors::NodeError;
use crate::providers::ReceiptInfo;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Unconfirmed past the failure age threshold.
    Timeout,
    Reverted,
    OutOfGas,
    NonceTooLow,
    Underpriced,
    /// Any other rejection from the node at submission time.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureAnalysis {
    pub is_failed: bool,
    pub is_retryable: bool,
    pub reason: String,
    pub kind: Option<FailureKind>,
}

impl FailureAnalysis {
    pub fn healthy() -> Self {
        Self {
            is_failed: false,
            is_retryable: false,
            reason: String::new(),
            kind: None,
        }
    }

    pub fn failed(kind: FailureKind, retryable: bool, reason: impl Into<String>) -> Self {
        Self {
            is_failed: true,
            is_retryable: retryable,
            reason: reason.into(),
            kind: Some(kind),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureDetector {
    failure_age: Duration,
    stuck_after: Duration,
}

impl FailureDetector {
    pub fn new(failure_age: Duration, stuck_after: Duration) -> Self {
        Self {
            failure_age,
            stuck_after,
        }
    }

    pub fn from_config(cfg: &MonitorConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.failure_age_threshold_secs),
            Duration::from_secs(cfg.stuck_threshold_secs),
        )
    }

    /// A mined receipt with a failed status. Running out of gas is recognised
    /// by the gas used reaching the gas limit.
    pub fn analyze_receipt(&self, tx: &TrackedTransaction, receipt: &ReceiptInfo) -> FailureAnalysis {
        if receipt.success {
            return FailureAnalysis::healthy();
        }
        match receipt.gas_used {
            Some(used) if !tx.gas_limit.is_zero() && ethers::types::U256::from(used) >= tx.gas_limit => {
                FailureAnalysis::failed(
                    FailureKind::OutOfGas,
                    false,
                    format!("out of gas: used {} of {}", used, tx.gas_limit),
                )
            }
            _ => FailureAnalysis::failed(FailureKind::Reverted, false, "execution reverted"),
        }
    }

    /// Unconfirmed for longer than the failure age since the latest submission.
    pub fn analyze_age(&self, tx: &TrackedTransaction, now: DateTime<Utc>) -> FailureAnalysis {
        if !matches!(tx.status, TransactionStatus::Pending | TransactionStatus::Confirming) {
            return FailureAnalysis::healthy();
        }
        let age = elapsed_between(tx.last_submitted_at(), now);
        if age > self.failure_age {
            FailureAnalysis::failed(
                FailureKind::Timeout,
                true,
                format!(
                    "not confirmed after {}s (threshold {}s)",
                    age.as_secs(),
                    self.failure_age.as_secs()
                ),
            )
        } else {
            FailureAnalysis::healthy()
        }
    }

    /// Classifies a rejection returned when (re)submitting.
    pub fn analyze_submission_error(&self, err: &NodeError) -> FailureAnalysis {
        let message = err.to_string().to_lowercase();
        if message.contains("nonce too low") {
            FailureAnalysis::failed(FailureKind::NonceTooLow, false, "nonce too low")
        } else if message.contains("underpriced") || message.contains("replacement") {
            FailureAnalysis::failed(FailureKind::Underpriced, true, err.to_string())
        } else if err.is_transaction_rejection() {
            FailureAnalysis::failed(FailureKind::Rejected, false, err.to_string())
        } else {
            FailureAnalysis::failed(FailureKind::Rejected, true, err.to_string())
        }
    }

    /// Pending past the stuck threshold and not yet reported.
    pub fn is_stuck(&self, tx: &TrackedTransaction, now: DateTime<Utc>) -> bool {
        tx.status == TransactionStatus::Pending
            && !tx.stuck_alerted
            && elapsed_between(tx.last_submitted_at(), now) > self.stuck_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::gwei;
    use ethers::types::{H256, U256};

    fn detector() -> FailureDetector {
        FailureDetector::new(Duration::from_secs(3_600), Duration::from_secs(1_800))
    }

    fn pending(submitted: DateTime<Utc>) -> TrackedTransaction {
        TrackedTransaction::new(H256::repeat_byte(1), gwei(20), U256::from(21_000u64), submitted)
    }

    #[test]
    fn two_hours_pending_is_a_retryable_failure() {
        let now = Utc::now();
        let tx = pending(now - chrono::Duration::hours(2));
        let analysis = detector().analyze_age(&tx, now);
        assert!(analysis.is_failed);
        assert!(analysis.is_retryable);
        assert_eq!(analysis.kind, Some(FailureKind::Timeout));

        let fresh = pending(now - chrono::Duration::minutes(10));
        assert!(!detector().analyze_age(&fresh, now).is_failed);
    }

    #[test]
    fn failed_receipts_are_terminal() {
        let tx = pending(Utc::now());
        let receipt = |gas_used| ReceiptInfo {
            transaction_hash: tx.hash,
            block_number: Some(10),
            success: false,
            gas_used: Some(gas_used),
        };
        let oog = detector().analyze_receipt(&tx, &receipt(21_000));
        assert_eq!(oog.kind, Some(FailureKind::OutOfGas));
        assert!(!oog.is_retryable);
        let reverted = detector().analyze_receipt(&tx, &receipt(15_000));
        assert_eq!(reverted.kind, Some(FailureKind::Reverted));
    }

    #[test]
    fn submission_errors_are_classified() {
        let d = detector();
        let nonce = d.analyze_submission_error(&NodeError::Rpc("nonce too low".into()));
        assert_eq!(nonce.kind, Some(FailureKind::NonceTooLow));
        assert!(!nonce.is_retryable);
        let cheap = d.analyze_submission_error(&NodeError::Rpc("replacement transaction underpriced".into()));
        assert!(cheap.is_retryable);
        let funds = d.analyze_submission_error(&NodeError::Rpc("insufficient funds for gas".into()));
        assert!(!funds.is_retryable);
        assert!(d.analyze_submission_error(&NodeError::NoHealthyNode).is_retryable);
    }

    #[test]
    fn stuck_is_reported_once() {
        let now = Utc::now();
        let mut tx = pending(now - chrono::Duration::minutes(31));
        assert!(detector().is_stuck(&tx, now));
        tx.stuck_alerted = true;
        assert!(!detector().is_stuck(&tx, now));
    }
}

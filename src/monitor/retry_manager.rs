// src/monitor/retry_manager.rs

//! # Retry Manager
//!
//! Decides whether a failed transaction gets another attempt and performs the
//! resubmission. The new gas price is the larger of the oracle's current
//! optimal price and the prior price bumped by `gas_price_bump_percent`. With a
//! [`ReplacementSigner`] the transaction is re-signed at that price; without
//! one the original signed bytes are rebroadcast unchanged, at their original
//! price.

use super::failure::{FailureAnalysis, FailureDetector};
use super::{TrackedTransaction, TransactionStatus};
use crate::config::RetryConfig;
use crate::errors::MonitorError;
use crate::gas_oracle::GasPriceOracle;
use crate::metrics::TRANSACTION_RETRIES_TOTAL;
use crate::providers::ChainGateway;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Bytes, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Re-signs a tracked transaction at a new gas price, same nonce.
#[async_trait]
pub trait ReplacementSigner: Send + Sync {
    async fn resign(&self, tx: &TrackedTransaction, gas_price: U256) -> Result<Bytes, MonitorError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub attempt: u32,
    pub hash: H256,
    /// Price of the bytes actually broadcast.
    pub gas_price: U256,
    /// False when the original bytes were rebroadcast.
    pub resigned: bool,
}

pub struct RetryManager {
    config: RetryConfig,
    policy: RetryPolicy,
    gateway: Arc<dyn ChainGateway>,
    oracle: Option<Arc<dyn GasPriceOracle>>,
    signer: Option<Arc<dyn ReplacementSigner>>,
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("config", &self.config)
            .field("has_oracle", &self.oracle.is_some())
            .field("has_signer", &self.signer.is_some())
            .finish()
    }
}

impl RetryManager {
    pub fn new(
        config: RetryConfig,
        gateway: Arc<dyn ChainGateway>,
        oracle: Option<Arc<dyn GasPriceOracle>>,
        signer: Option<Arc<dyn ReplacementSigner>>,
    ) -> Self {
        Self {
            policy: RetryPolicy::from_config(&config),
            config,
            gateway,
            oracle,
            signer,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_retry_attempts
    }

    pub fn should_retry(&self, tx: &TrackedTransaction, failure: &FailureAnalysis) -> bool {
        failure.is_failed && failure.is_retryable && tx.retry_attempts < self.config.max_retry_attempts
    }

    /// Wait between a failure and the next attempt, given the attempts made so far.
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        self.policy.delay_for(attempts_made + 1)
    }

    /// `prior * (1 + bump%)`, rounded up so a non-zero price always moves.
    pub fn bump(&self, prior: U256) -> U256 {
        let bps = U256::from((self.config.gas_price_bump_percent * 100.0).round() as u64);
        let increase = (prior * bps + U256::from(9_999u64)) / U256::from(10_000u64);
        prior.saturating_add(increase)
    }

    pub async fn next_gas_price(&self, prior: U256) -> U256 {
        let bumped = self.bump(prior);
        let optimal = match &self.oracle {
            Some(oracle) => match oracle.optimal_gas_price().await {
                Ok(price) => price,
                Err(e) => {
                    debug!(error = %e, "No optimal gas price available, using bump only");
                    U256::zero()
                }
            },
            None => U256::zero(),
        };
        bumped.max(optimal)
    }

    /// Moves a failed transaction through `Retrying` back to `Pending` and
    /// resubmits it. Signing happens first and a signer error consumes no
    /// attempt. A failed submission still counts, and marks the transaction
    /// failed again.
    pub async fn schedule_retry(
        &self,
        tx: &mut TrackedTransaction,
        detector: &FailureDetector,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, MonitorError> {
        if tx.retry_attempts >= self.config.max_retry_attempts {
            TRANSACTION_RETRIES_TOTAL.with_label_values(&["refused"]).inc();
            return Err(MonitorError::RetryBudgetExhausted(tx.retry_attempts));
        }
        if tx.status != TransactionStatus::Failed {
            return Err(MonitorError::InvalidTransition {
                from: tx.status.to_string(),
                to: TransactionStatus::Retrying.to_string(),
            });
        }
        if let Some(failure) = &tx.failure {
            if !failure.is_retryable {
                return Err(MonitorError::NotRetryable(failure.reason.clone()));
            }
        }
        let (raw, gas_price, resigned) = match &self.signer {
            Some(signer) => {
                let gas_price = self.next_gas_price(tx.gas_price).await;
                let raw = signer.resign(tx, gas_price).await.map_err(|e| {
                    TRANSACTION_RETRIES_TOTAL.with_label_values(&["signer_error"]).inc();
                    e
                })?;
                (raw, gas_price, true)
            }
            None => {
                let raw = tx.raw.clone().ok_or_else(|| {
                    MonitorError::NotRetryable("no signed payload to rebroadcast".to_string())
                })?;
                warn!(
                    tx = ?tx.hash,
                    gas_price = %tx.gas_price,
                    "No replacement signer, rebroadcasting at the original gas price"
                );
                (raw, tx.gas_price, false)
            }
        };

        tx.transition(TransactionStatus::Retrying, now)?;
        tx.retry_attempts += 1;
        tx.last_retry_at = Some(now);
        tx.next_retry_at = None;
        let attempt = tx.retry_attempts;

        let submitted = self.gateway.submit(raw.clone()).await;
        tx.transition(TransactionStatus::Pending, now)?;
        match submitted {
            Ok(hash) => {
                tx.record_resubmission(hash, raw, Some(gas_price));
                TRANSACTION_RETRIES_TOTAL.with_label_values(&["submitted"]).inc();
                info!(
                    tx = ?tx.hash,
                    current = ?hash,
                    attempt,
                    gas_price = %gas_price,
                    resigned,
                    "Transaction resubmitted"
                );
                Ok(RetryOutcome {
                    attempt,
                    hash,
                    gas_price,
                    resigned,
                })
            }
            Err(e) if e.to_string().to_lowercase().contains("already known") => {
                TRANSACTION_RETRIES_TOTAL.with_label_values(&["already_known"]).inc();
                debug!(tx = ?tx.hash, attempt, "Node already knows the resubmitted transaction");
                Ok(RetryOutcome {
                    attempt,
                    hash: tx.current_hash,
                    gas_price,
                    resigned,
                })
            }
            Err(e) => {
                warn!(tx = ?tx.hash, attempt, error = %e, "Resubmission failed");
                TRANSACTION_RETRIES_TOTAL.with_label_values(&["submit_error"]).inc();
                tx.mark_failed(detector.analyze_submission_error(&e), now)?;
                Err(MonitorError::Submission(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{MempoolError, NodeError};
    use crate::mempool::gwei;
    use crate::monitor::failure::FailureKind;
    use crate::providers::{ReceiptInfo, TransactionBroadcaster};
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct Gateway {
        submitted: Mutex<Vec<Bytes>>,
        reject_with: Mutex<Option<NodeError>>,
    }

    #[async_trait]
    impl TransactionBroadcaster for Gateway {
        async fn submit(&self, raw: Bytes) -> Result<H256, NodeError> {
            if let Some(e) = self.reject_with.lock().clone() {
                return Err(e);
            }
            self.submitted.lock().push(raw);
            Ok(H256::repeat_byte(0x22))
        }
    }

    #[async_trait]
    impl ChainGateway for Gateway {
        async fn transaction_receipt(&self, _hash: H256) -> Result<Option<ReceiptInfo>, NodeError> {
            Ok(None)
        }
        async fn block_number(&self) -> Result<u64, NodeError> {
            Ok(1)
        }
    }

    #[derive(Debug)]
    struct FixedOracle(U256);

    #[async_trait]
    impl GasPriceOracle for FixedOracle {
        async fn optimal_gas_price(&self) -> Result<U256, MempoolError> {
            Ok(self.0)
        }
    }

    struct BumpSigner;

    #[async_trait]
    impl ReplacementSigner for BumpSigner {
        async fn resign(&self, _tx: &TrackedTransaction, gas_price: U256) -> Result<Bytes, MonitorError> {
            Ok(Bytes::from(gas_price.as_u64().to_be_bytes().to_vec()))
        }
    }

    fn detector() -> FailureDetector {
        FailureDetector::new(Duration::from_secs(3_600), Duration::from_secs(1_800))
    }

    fn failed_tx(now: DateTime<Utc>) -> TrackedTransaction {
        let mut tx = TrackedTransaction::new(H256::repeat_byte(1), gwei(20), U256::from(21_000u64), now)
            .with_raw(Bytes::from(vec![1, 2, 3]));
        tx.mark_failed(FailureAnalysis::failed(FailureKind::Timeout, true, "old"), now)
            .unwrap();
        tx
    }

    #[test]
    fn bump_rounds_up() {
        let manager = RetryManager::new(RetryConfig::default(), Arc::new(Gateway::default()), None, None);
        assert_eq!(manager.bump(gwei(20)), gwei(20) + gwei(20) / 8);
        assert_eq!(manager.bump(U256::from(1u64)), U256::from(2u64));
    }

    #[tokio::test]
    async fn retry_never_lowers_gas_price() {
        let now = Utc::now();
        let gateway = Arc::new(Gateway::default());
        let manager = RetryManager::new(
            RetryConfig::default(),
            gateway.clone(),
            Some(Arc::new(FixedOracle(gwei(50)))),
            Some(Arc::new(BumpSigner)),
        );
        let mut tx = failed_tx(now);
        let outcome = manager.schedule_retry(&mut tx, &detector(), now).await.unwrap();
        assert_eq!(outcome.gas_price, gwei(50));
        assert!(outcome.gas_price >= gwei(20));
        assert!(outcome.resigned);
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.retry_attempts, 1);
        assert_eq!(tx.gas_price, gwei(50));
        assert_eq!(tx.current_hash, H256::repeat_byte(0x22));
        assert_eq!(tx.previous_hashes, vec![H256::repeat_byte(1)]);
    }

    #[tokio::test]
    async fn rebroadcast_reports_the_price_actually_sent() {
        let now = Utc::now();
        let gateway = Arc::new(Gateway::default());
        let manager = RetryManager::new(
            RetryConfig::default(),
            gateway.clone(),
            Some(Arc::new(FixedOracle(gwei(50)))),
            None,
        );
        let mut tx = failed_tx(now);
        let outcome = manager.schedule_retry(&mut tx, &detector(), now).await.unwrap();
        assert!(!outcome.resigned);
        assert_eq!(outcome.gas_price, gwei(20));
        assert_eq!(gateway.submitted.lock()[0], Bytes::from(vec![1, 2, 3]));
        assert_eq!(tx.gas_price, outcome.gas_price);
        assert_eq!(tx.current_hash, outcome.hash);
    }

    #[tokio::test]
    async fn refused_once_budget_is_spent() {
        let now = Utc::now();
        let config = RetryConfig {
            max_retry_attempts: 2,
            ..RetryConfig::default()
        };
        let manager = RetryManager::new(config, Arc::new(Gateway::default()), None, None);
        let mut tx = failed_tx(now);
        for _ in 0..2 {
            manager.schedule_retry(&mut tx, &detector(), now).await.unwrap();
            tx.mark_failed(FailureAnalysis::failed(FailureKind::Timeout, true, "old"), now)
                .unwrap();
        }
        assert_eq!(
            manager.schedule_retry(&mut tx, &detector(), now).await,
            Err(MonitorError::RetryBudgetExhausted(2))
        );
        assert_eq!(tx.retry_attempts, 2);
        assert!(!manager.should_retry(&tx, tx.failure.as_ref().unwrap()));
    }

    #[tokio::test]
    async fn failed_resubmission_counts_and_marks_failed() {
        let now = Utc::now();
        let gateway = Arc::new(Gateway::default());
        *gateway.reject_with.lock() = Some(NodeError::Rpc("nonce too low".into()));
        let manager = RetryManager::new(RetryConfig::default(), gateway, None, None);
        let mut tx = failed_tx(now);
        let result = manager.schedule_retry(&mut tx, &detector(), now).await;
        assert!(matches!(result, Err(MonitorError::Submission(_))));
        assert_eq!(tx.retry_attempts, 1);
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert!(!tx.failure.as_ref().unwrap().is_retryable);
    }
}

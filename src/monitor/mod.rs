// src/monitor/mod.rs

//! # Transaction Monitor
//!
//! Tracks submitted transactions until they reach a terminal state.
//!
//! ```text
//! Pending ──► Confirming ──► Confirmed
//!   │  │          │
//!   │  └──────────┴──► Failed ──► Retrying ──► Pending
//!   └──► Cancelled
//! ```
//!
//! Each tracked transaction has an async operation lock, so a confirmation
//! poll and a retry for the same hash can never interleave. A writer works on
//! a private copy while it talks to the chain and publishes the result into a
//! snapshot afterwards. Status queries and summaries read only the snapshot
//! and never wait behind network I/O. Different hashes are polled
//! concurrently, bounded by `max_concurrent_polls`. Chain access goes through
//! a [`ChainGateway`]; the monitor never picks nodes itself.

pub mod alerts;
pub mod failure;
pub mod retry_manager;

pub use alerts::{
    channels_from_config, Alert, AlertManager, AlertSeverity, AlertSpec, AlertType, NotificationChannel,
};
pub use failure::{FailureAnalysis, FailureDetector, FailureKind};
pub use retry_manager::{ReplacementSigner, RetryManager, RetryOutcome};

use crate::clock::{elapsed_between, Clock};
use crate::config::MonitorConfig;
use crate::errors::MonitorError;
use crate::metrics::{CONFIRMATION_TIME_SECONDS, TRACKED_TRANSACTIONS, TRANSACTION_TRANSITIONS_TOTAL};
use crate::providers::{ChainGateway, ReceiptInfo};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::{Bytes, H256, U256};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const HIGH_GAS_USAGE_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirming,
    Confirmed,
    Failed,
    Retrying,
    Cancelled,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 6] = [
        TransactionStatus::Pending,
        TransactionStatus::Confirming,
        TransactionStatus::Confirmed,
        TransactionStatus::Failed,
        TransactionStatus::Retrying,
        TransactionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Confirming => "confirming",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Retrying => "retrying",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    /// Edges of the lifecycle graph.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Confirming)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Confirming, Confirmed)
                | (Confirming, Failed)
                | (Failed, Retrying)
                | (Retrying, Pending)
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedTransaction {
    /// Hash the transaction was first tracked under.
    pub hash: H256,
    /// Hash of the latest submission.
    pub current_hash: H256,
    pub previous_hashes: Vec<H256>,
    #[serde(skip)]
    pub raw: Option<Bytes>,
    pub gas_price: U256,
    pub gas_limit: U256,
    pub nonce: Option<U256>,
    pub status: TransactionStatus,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmations: u64,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_attempts: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub failure: Option<FailureAnalysis>,
    pub stuck_alerted: bool,
    pub last_error: Option<String>,
}

impl TrackedTransaction {
    pub fn new(hash: H256, gas_price: U256, gas_limit: U256, submitted_at: DateTime<Utc>) -> Self {
        Self {
            hash,
            current_hash: hash,
            previous_hashes: Vec::new(),
            raw: None,
            gas_price,
            gas_limit,
            nonce: None,
            status: TransactionStatus::Pending,
            submitted_at,
            updated_at: submitted_at,
            confirmations: 0,
            block_number: None,
            gas_used: None,
            confirmed_at: None,
            failed_at: None,
            retry_attempts: 0,
            last_retry_at: None,
            next_retry_at: None,
            metadata: HashMap::new(),
            failure: None,
            stuck_alerted: false,
            last_error: None,
        }
    }

    pub fn with_raw(mut self, raw: Bytes) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_nonce(mut self, nonce: U256) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Start of the current submission, used for age-based failure.
    pub fn last_submitted_at(&self) -> DateTime<Utc> {
        self.last_retry_at.unwrap_or(self.submitted_at)
    }

    /// Confirmed, cancelled, or failed without a way forward.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TransactionStatus::Confirmed | TransactionStatus::Cancelled => true,
            TransactionStatus::Failed => self.failure.as_ref().map_or(true, |f| !f.is_retryable),
            _ => false,
        }
    }

    pub fn transition(&mut self, to: TransactionStatus, now: DateTime<Utc>) -> Result<(), MonitorError> {
        if !self.status.can_transition_to(to) {
            return Err(MonitorError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        TRANSACTION_TRANSITIONS_TOTAL
            .with_label_values(&[self.status.as_str(), to.as_str()])
            .inc();
        debug!(tx = ?self.hash, from = %self.status, to = %to, "Transaction status changed");
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(&mut self, failure: FailureAnalysis, now: DateTime<Utc>) -> Result<(), MonitorError> {
        self.transition(TransactionStatus::Failed, now)?;
        self.failed_at = Some(now);
        self.last_error = Some(failure.reason.clone());
        self.failure = Some(failure);
        Ok(())
    }

    /// A fresh submission: confirmation counting restarts on the new hash.
    pub fn record_resubmission(&mut self, hash: H256, raw: Bytes, gas_price: Option<U256>) {
        if hash != self.current_hash {
            self.previous_hashes.push(self.current_hash);
            self.current_hash = hash;
        }
        self.raw = Some(raw);
        if let Some(price) = gas_price {
            self.gas_price = price;
        }
        self.confirmations = 0;
        self.block_number = None;
        self.failure = None;
        self.failed_at = None;
        self.stuck_alerted = false;
    }

    /// One successful receipt poll. Counts at most up to `required`.
    pub fn record_confirmation(
        &mut self,
        receipt: &ReceiptInfo,
        required: u64,
        now: DateTime<Utc>,
    ) -> Result<(), MonitorError> {
        if self.status == TransactionStatus::Confirmed || self.confirmations >= required {
            return Ok(());
        }
        if self.status == TransactionStatus::Pending {
            self.transition(TransactionStatus::Confirming, now)?;
        }
        self.confirmations += 1;
        self.block_number = receipt.block_number.or(self.block_number);
        self.gas_used = receipt.gas_used.or(self.gas_used);
        if self.confirmations >= required {
            self.transition(TransactionStatus::Confirmed, now)?;
            self.confirmed_at = Some(now);
            CONFIRMATION_TIME_SECONDS
                .with_label_values(&[if self.retry_attempts > 0 { "true" } else { "false" }])
                .observe(elapsed_between(self.submitted_at, now).as_secs_f64());
        }
        Ok(())
    }

    fn terminal_since(&self) -> DateTime<Utc> {
        self.confirmed_at.or(self.failed_at).unwrap_or(self.updated_at)
    }
}

/// Counts and aggregates over everything tracked.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitoringSummary {
    pub total_tracked: usize,
    pub by_status: BTreeMap<String, usize>,
    pub average_confirmation_secs: Option<f64>,
    /// Confirmed over all terminal transactions.
    pub success_rate: Option<f64>,
    pub retries: u64,
    pub active_alerts: usize,
}

/// One tracked transaction: `op` serializes writers, `state` is the last
/// published snapshot.
#[derive(Debug)]
struct TrackedEntry {
    op: AsyncMutex<()>,
    state: RwLock<TrackedTransaction>,
}

impl TrackedEntry {
    fn new(tx: TrackedTransaction) -> Self {
        Self {
            op: AsyncMutex::new(()),
            state: RwLock::new(tx),
        }
    }

    fn snapshot(&self) -> TrackedTransaction {
        self.state.read().clone()
    }

    fn publish(&self, tx: &TrackedTransaction) {
        *self.state.write() = tx.clone();
    }
}

type Entry = Arc<TrackedEntry>;

pub struct TransactionMonitor {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn ChainGateway>,
    detector: FailureDetector,
    retries: RetryManager,
    alerts: Arc<AlertManager>,
    tracked: DashMap<H256, Entry>,
    admission: parking_lot::Mutex<()>,
    poll_permits: Arc<Semaphore>,
    running: parking_lot::Mutex<Option<CancellationToken>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TransactionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionMonitor")
            .field("tracked", &self.tracked.len())
            .field("retries", &self.retries)
            .finish()
    }
}

impl TransactionMonitor {
    pub fn new(
        config: MonitorConfig,
        gateway: Arc<dyn ChainGateway>,
        retries: RetryManager,
        alerts: Arc<AlertManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            detector: FailureDetector::from_config(&config),
            poll_permits: Arc::new(Semaphore::new(config.max_concurrent_polls.max(1))),
            config,
            clock,
            gateway,
            retries,
            alerts,
            tracked: DashMap::new(),
            admission: parking_lot::Mutex::new(()),
            running: parking_lot::Mutex::new(None),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.retries
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Starts tracking. At capacity, the oldest terminal entries are evicted
    /// first; if none can go the call fails.
    pub fn track_transaction(&self, tx: TrackedTransaction) -> Result<(), MonitorError> {
        let _admission = self.admission.lock();
        if self.tracked.contains_key(&tx.hash) {
            return Err(MonitorError::AlreadyTracked(tx.hash));
        }
        let max = self.config.max_tracked_transactions;
        if self.tracked.len() >= max {
            self.evict_terminal(self.tracked.len() + 1 - max);
            if self.tracked.len() >= max {
                warn!(max, "Tracking capacity exceeded");
                return Err(MonitorError::CapacityExceeded(max));
            }
        }
        info!(tx = ?tx.hash, gas_price = %tx.gas_price, "Started tracking transaction");
        self.tracked.insert(tx.hash, Arc::new(TrackedEntry::new(tx)));
        self.publish_counts();
        Ok(())
    }

    /// Drops up to `count` terminal entries, oldest submission first.
    fn evict_terminal(&self, count: usize) -> usize {
        let mut terminal: Vec<(DateTime<Utc>, H256)> = self
            .tracked
            .iter()
            .filter_map(|entry| {
                let tx = entry.value().state.read();
                tx.is_terminal().then_some((tx.submitted_at, tx.hash))
            })
            .collect();
        terminal.sort();
        let evicted = terminal
            .into_iter()
            .take(count)
            .filter(|(_, hash)| self.tracked.remove(hash).is_some())
            .count();
        if evicted > 0 {
            debug!(evicted, "Evicted terminal transactions to make room");
        }
        evicted
    }

    pub fn stop_tracking(&self, hash: H256) -> Result<(), MonitorError> {
        self.tracked
            .remove(&hash)
            .map(|_| {
                info!(tx = ?hash, "Stopped tracking transaction");
                self.publish_counts();
            })
            .ok_or(MonitorError::NotTracked(hash))
    }

    fn entry(&self, hash: H256) -> Result<Entry, MonitorError> {
        self.tracked
            .get(&hash)
            .map(|e| Arc::clone(e.value()))
            .ok_or(MonitorError::NotTracked(hash))
    }

    /// Last published state. Never waits for an in-flight poll or retry.
    pub async fn get_transaction_status(&self, hash: H256) -> Result<TrackedTransaction, MonitorError> {
        Ok(self.entry(hash)?.snapshot())
    }

    /// Explicit cancel; only a pending transaction can be cancelled.
    pub async fn cancel(&self, hash: H256) -> Result<TrackedTransaction, MonitorError> {
        let entry = self.entry(hash)?;
        let _op = entry.op.lock().await;
        let mut tx = entry.snapshot();
        tx.transition(TransactionStatus::Cancelled, self.clock.now())?;
        entry.publish(&tx);
        info!(tx = ?hash, "Transaction cancelled");
        self.publish_counts();
        Ok(tx)
    }

    /// Manual retry of a failed transaction.
    pub async fn schedule_retry(&self, hash: H256) -> Result<RetryOutcome, MonitorError> {
        let entry = self.entry(hash)?;
        let _op = entry.op.lock().await;
        let mut tx = entry.snapshot();
        let result = self.retry_locked(&mut tx).await;
        entry.publish(&tx);
        self.publish_counts();
        result
    }

    /// One monitoring step for one transaction, serialized per hash.
    #[instrument(skip(self), level = "debug")]
    pub async fn poll_transaction(&self, hash: H256) -> Result<TrackedTransaction, MonitorError> {
        let entry = self.entry(hash)?;
        let _op = entry.op.lock().await;
        let mut tx = entry.snapshot();
        let now = self.clock.now();
        let status = tx.status;

        let result = match status {
            TransactionStatus::Pending | TransactionStatus::Confirming => self.check_chain(&mut tx, now).await,
            TransactionStatus::Failed if !tx.is_terminal() => {
                let due = tx.next_retry_at.map_or(true, |at| now >= at);
                if due {
                    if let Err(e) = self.retry_locked(&mut tx).await {
                        debug!(tx = ?hash, error = %e, "Scheduled retry did not go through");
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        };
        entry.publish(&tx);
        result.map(|_| tx)
    }

    async fn check_chain(&self, tx: &mut TrackedTransaction, now: DateTime<Utc>) -> Result<(), MonitorError> {
        match self.find_receipt(tx).await {
            Ok(Some(receipt)) if receipt.success => {
                tx.record_confirmation(&receipt, self.config.required_confirmations, now)?;
                if tx.status == TransactionStatus::Confirmed {
                    info!(tx = ?tx.hash, confirmations = tx.confirmations, "Transaction confirmed");
                    self.check_gas_usage(tx);
                }
                return Ok(());
            }
            Ok(Some(receipt)) => {
                tx.gas_used = receipt.gas_used;
                tx.block_number = receipt.block_number;
                let failure = self.detector.analyze_receipt(tx, &receipt);
                return self.handle_failure(tx, failure, now);
            }
            Ok(None) => {}
            Err(e) => {
                // Node trouble is accounted for by the pool; only age makes it a failure.
                debug!(tx = ?tx.hash, error = %e, "Receipt lookup failed");
                tx.last_error = Some(e.to_string());
            }
        }

        let failure = self.detector.analyze_age(tx, now);
        if failure.is_failed {
            return self.handle_failure(tx, failure, now);
        }
        if self.detector.is_stuck(tx, now) {
            tx.stuck_alerted = true;
            let pending_for = elapsed_between(tx.last_submitted_at(), now);
            warn!(tx = ?tx.hash, pending_secs = pending_for.as_secs(), "Transaction appears to be stuck");
            self.alerts.raise(
                AlertSpec::new(
                    tx.hash,
                    AlertType::Stuck,
                    self.overdue_severity(pending_for).max(AlertSeverity::Warning),
                    "Transaction stuck",
                    format!("Transaction pending for {}s without confirmation", pending_for.as_secs()),
                )
                .with_actions(["Consider resubmitting with a higher gas price"])
                .with_metadata("gas_price", serde_json::json!(tx.gas_price.to_string())),
            );
        }
        Ok(())
    }

    /// Receipt for the current hash, falling back to earlier submissions.
    async fn find_receipt(&self, tx: &TrackedTransaction) -> Result<Option<ReceiptInfo>, crate::errors::NodeError> {
        if let Some(receipt) = self.gateway.transaction_receipt(tx.current_hash).await? {
            return Ok(Some(receipt));
        }
        for hash in tx.previous_hashes.iter().rev() {
            if let Some(receipt) = self.gateway.transaction_receipt(*hash).await? {
                return Ok(Some(receipt));
            }
        }
        Ok(None)
    }

    fn overdue_severity(&self, elapsed: Duration) -> AlertSeverity {
        AlertSeverity::for_overdue(elapsed, Duration::from_secs(self.config.expected_confirmation_secs))
    }

    fn handle_failure(
        &self,
        tx: &mut TrackedTransaction,
        failure: FailureAnalysis,
        now: DateTime<Utc>,
    ) -> Result<(), MonitorError> {
        let will_retry = self.retries.should_retry(tx, &failure);
        let reason = failure.reason.clone();
        tx.mark_failed(failure, now)?;
        let age = elapsed_between(tx.submitted_at, now);

        if will_retry {
            let delay = self.retries.backoff(tx.retry_attempts);
            tx.next_retry_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
            warn!(tx = ?tx.hash, %reason, retry_in_ms = delay.as_millis() as u64, "Transaction failed, retry scheduled");
            self.alerts.raise(
                AlertSpec::new(
                    tx.hash,
                    AlertType::TransactionFailed,
                    self.overdue_severity(age).max(AlertSeverity::Warning),
                    "Transaction failed",
                    format!("Transaction failed: {}; retrying", reason),
                )
                .with_metadata("retry_attempts", serde_json::json!(tx.retry_attempts)),
            );
        } else if tx.failure.as_ref().map_or(false, |f| f.is_retryable) {
            self.exhaust(tx, &reason);
        } else {
            error!(tx = ?tx.hash, %reason, "Transaction failed permanently");
            self.alerts.raise(
                AlertSpec::new(
                    tx.hash,
                    AlertType::TransactionFailed,
                    self.overdue_severity(age).max(AlertSeverity::Error),
                    "Transaction failed",
                    format!("Transaction failed permanently: {}", reason),
                )
                .with_actions(["Inspect the transaction and submit a corrected one"]),
            );
        }
        Ok(())
    }

    /// Retry budget spent: the failure becomes terminal with a critical alert.
    fn exhaust(&self, tx: &mut TrackedTransaction, reason: &str) {
        if let Some(failure) = tx.failure.as_mut() {
            failure.is_retryable = false;
        }
        tx.next_retry_at = None;
        error!(tx = ?tx.hash, attempts = tx.retry_attempts, %reason, "Retry budget exhausted");
        self.alerts.raise(
            AlertSpec::new(
                tx.hash,
                AlertType::RetryExhausted,
                AlertSeverity::Critical,
                "Retry budget exhausted",
                format!(
                    "Transaction failed after {} retries: {}",
                    tx.retry_attempts, reason
                ),
            )
            .with_actions([
                "Check the sender balance and nonce",
                "Resubmit manually with a higher gas price",
            ]),
        );
    }

    async fn retry_locked(&self, tx: &mut TrackedTransaction) -> Result<RetryOutcome, MonitorError> {
        let now = self.clock.now();
        match self.retries.schedule_retry(tx, &self.detector, now).await {
            Ok(outcome) => {
                let message = if outcome.resigned {
                    format!(
                        "Retry {} of {} submitted at {} wei",
                        outcome.attempt,
                        self.retries.max_attempts(),
                        outcome.gas_price
                    )
                } else {
                    format!(
                        "Retry {} of {} rebroadcast unchanged at {} wei; no signer to bump the gas price",
                        outcome.attempt,
                        self.retries.max_attempts(),
                        outcome.gas_price
                    )
                };
                let mut spec = AlertSpec::new(
                    tx.hash,
                    AlertType::RetryScheduled,
                    AlertSeverity::Warning,
                    "Transaction resubmitted",
                    message,
                )
                .with_metadata("hash", serde_json::json!(format!("{:?}", outcome.hash)))
                .with_metadata("resigned", serde_json::json!(outcome.resigned));
                if !outcome.resigned {
                    spec = spec.with_actions(["Configure a replacement signer so retries can raise the gas price"]);
                }
                self.alerts.raise(spec);
                Ok(outcome)
            }
            Err(MonitorError::RetryBudgetExhausted(attempts)) => {
                if tx.status == TransactionStatus::Failed && !tx.is_terminal() {
                    let reason = tx.last_error.clone().unwrap_or_default();
                    self.exhaust(tx, &reason);
                }
                Err(MonitorError::RetryBudgetExhausted(attempts))
            }
            Err(e) => {
                if tx.status == TransactionStatus::Failed && !tx.is_terminal() {
                    if self.retries.should_retry(tx, tx.failure.as_ref().unwrap_or(&FailureAnalysis::healthy())) {
                        let delay = self.retries.backoff(tx.retry_attempts);
                        tx.next_retry_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
                    } else if tx.retry_attempts >= self.retries.max_attempts() {
                        let reason = tx.last_error.clone().unwrap_or_default();
                        self.exhaust(tx, &reason);
                    }
                }
                Err(e)
            }
        }
    }

    fn check_gas_usage(&self, tx: &TrackedTransaction) {
        let (Some(used), false) = (tx.gas_used, tx.gas_limit.is_zero()) else {
            return;
        };
        if tx.gas_limit > U256::from(u64::MAX) {
            return;
        }
        let ratio = used as f64 / tx.gas_limit.as_u64() as f64;
        if ratio > HIGH_GAS_USAGE_RATIO {
            self.alerts.raise(AlertSpec::new(
                tx.hash,
                AlertType::HighGasUsage,
                AlertSeverity::Info,
                "High gas usage",
                format!("Transaction used {:.1}% of gas limit", ratio * 100.0),
            ));
        }
    }

    /// Polls every non-terminal transaction once, bounded by the poll permits.
    pub async fn poll_all(self: &Arc<Self>) {
        let hashes: Vec<H256> = self
            .tracked
            .iter()
            .filter(|entry| !entry.value().state.read().is_terminal())
            .map(|entry| *entry.key())
            .collect();
        if hashes.is_empty() {
            return;
        }

        let mut polls = JoinSet::new();
        for hash in hashes {
            let permits = Arc::clone(&self.poll_permits);
            let this = Arc::clone(self);
            polls.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if let Err(e) = this.poll_transaction(hash).await {
                    debug!(tx = ?hash, error = %e, "Poll skipped");
                }
            });
        }
        while polls.join_next().await.is_some() {}
        self.publish_counts();
    }

    /// Drops terminal transactions that finished before the retention period.
    pub fn cleanup(&self) -> usize {
        let retention = chrono::Duration::from_std(Duration::from_secs(self.config.retention_period_secs))
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = self.clock.now() - retention;
        let expired: Vec<H256> = self
            .tracked
            .iter()
            .filter_map(|entry| {
                let tx = entry.value().state.read();
                (tx.is_terminal() && tx.terminal_since() < cutoff).then_some(tx.hash)
            })
            .collect();
        for hash in &expired {
            self.tracked.remove(hash);
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "Cleaned up finished transactions");
            self.publish_counts();
        }
        expired.len()
    }

    pub fn start(self: &Arc<Self>, parent: &CancellationToken) -> Result<(), MonitorError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }
        let cancel = parent.child_token();
        let token = cancel.clone();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut poll = tokio::time::interval(this.config.poll_interval());
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cleanup = tokio::time::interval(Duration::from_secs(this.config.cleanup_interval_secs));
            cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = poll.tick() => this.poll_all().await,
                    _ = cleanup.tick() => { this.cleanup(); }
                }
            }
            debug!("Transaction monitor loop exited");
        });
        *self.task.lock() = Some(handle);
        *running = Some(cancel);
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            required_confirmations = self.config.required_confirmations,
            "Transaction monitor started"
        );
        Ok(())
    }

    /// Stops the loop, waiting up to the configured grace period for in-flight polls.
    pub async fn stop(&self) {
        let Some(cancel) = self.running.lock().take() else {
            return;
        };
        cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.config.shutdown_grace(), handle).await.is_err() {
                warn!("Monitor polls did not finish within the grace period, abandoning them");
                abort.abort();
            }
        }
        info!("Transaction monitor stopped");
    }

    /// Per-status counts plus confirmation and success aggregates, taken from
    /// the published snapshots.
    pub fn summary(&self) -> MonitoringSummary {
        let mut summary = MonitoringSummary {
            total_tracked: self.tracked.len(),
            active_alerts: self.alerts.active_alerts().len(),
            ..MonitoringSummary::default()
        };
        for status in TransactionStatus::ALL {
            summary.by_status.insert(status.as_str().to_string(), 0);
        }
        let mut confirmation_secs = Vec::new();
        let (mut confirmed, mut terminal) = (0usize, 0usize);
        for entry in self.tracked.iter() {
            let tx = entry.value().state.read();
            *summary.by_status.entry(tx.status.as_str().to_string()).or_default() += 1;
            summary.retries += u64::from(tx.retry_attempts);
            if tx.is_terminal() {
                terminal += 1;
            }
            if let Some(at) = tx.confirmed_at {
                confirmed += 1;
                confirmation_secs.push(elapsed_between(tx.submitted_at, at).as_secs_f64());
            }
        }
        if !confirmation_secs.is_empty() {
            summary.average_confirmation_secs = Some(crate::stats::mean(&confirmation_secs));
        }
        if terminal > 0 {
            summary.success_rate = Some(confirmed as f64 / terminal as f64);
        }
        summary
    }

    fn publish_counts(&self) {
        for (status, count) in self.summary().by_status {
            TRACKED_TRANSACTIONS.with_label_values(&[&status]).set(count as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{AlertConfig, RetryConfig};
    use crate::errors::NodeError;
    use crate::mempool::gwei;
    use crate::providers::TransactionBroadcaster;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct ScriptedGateway {
        receipt: Mutex<Option<ReceiptInfo>>,
        fail_lookups: Mutex<bool>,
        lookup_delay: Mutex<Option<Duration>>,
        submissions: Mutex<usize>,
    }

    #[async_trait]
    impl TransactionBroadcaster for ScriptedGateway {
        async fn submit(&self, _raw: Bytes) -> Result<H256, NodeError> {
            *self.submissions.lock() += 1;
            Ok(H256::repeat_byte(0xbb))
        }
    }

    #[async_trait]
    impl ChainGateway for ScriptedGateway {
        async fn transaction_receipt(&self, _hash: H256) -> Result<Option<ReceiptInfo>, NodeError> {
            let delay = *self.lookup_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if *self.fail_lookups.lock() {
                return Err(NodeError::Timeout(100));
            }
            Ok(self.receipt.lock().clone())
        }
        async fn block_number(&self) -> Result<u64, NodeError> {
            Ok(100)
        }
    }

    fn monitor(gateway: Arc<ScriptedGateway>, clock: Arc<ManualClock>, config: MonitorConfig) -> Arc<TransactionMonitor> {
        let alerts = Arc::new(AlertManager::new(&AlertConfig::default(), Vec::new(), clock.clone()));
        let retries = RetryManager::new(config.retry.clone(), gateway.clone(), None, None);
        Arc::new(TransactionMonitor::new(config, gateway, retries, alerts, clock))
    }

    fn success_receipt() -> ReceiptInfo {
        ReceiptInfo {
            transaction_hash: H256::repeat_byte(1),
            block_number: Some(42),
            success: true,
            gas_used: Some(21_000),
        }
    }

    fn tracked(clock: &ManualClock) -> TrackedTransaction {
        TrackedTransaction::new(H256::repeat_byte(1), gwei(20), U256::from(21_000u64), clock.now())
            .with_raw(Bytes::from(vec![0xde, 0xad]))
    }

    #[test]
    fn transition_graph_rejects_skips() {
        use TransactionStatus::*;
        assert!(Pending.can_transition_to(Confirming));
        assert!(!Pending.can_transition_to(Confirmed));
        assert!(!Confirming.can_transition_to(Cancelled));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Retrying));
        assert!(!Retrying.can_transition_to(Confirmed));
    }

    #[tokio::test]
    async fn duplicate_and_capacity_are_rejected() {
        let clock = Arc::new(ManualClock::default());
        let config = MonitorConfig {
            max_tracked_transactions: 1,
            ..MonitorConfig::default()
        };
        let monitor = monitor(Arc::new(ScriptedGateway::default()), clock.clone(), config);
        monitor.track_transaction(tracked(&clock)).unwrap();
        assert_eq!(
            monitor.track_transaction(tracked(&clock)),
            Err(MonitorError::AlreadyTracked(H256::repeat_byte(1)))
        );
        let other = TrackedTransaction::new(H256::repeat_byte(2), gwei(20), U256::zero(), clock.now());
        assert_eq!(
            monitor.track_transaction(other.clone()),
            Err(MonitorError::CapacityExceeded(1))
        );

        monitor.cancel(H256::repeat_byte(1)).await.unwrap();
        monitor.track_transaction(other).unwrap();
        assert_eq!(monitor.len(), 1);
        assert_eq!(
            monitor.stop_tracking(H256::repeat_byte(1)),
            Err(MonitorError::NotTracked(H256::repeat_byte(1)))
        );
    }

    #[tokio::test]
    async fn confirms_after_required_polls_and_stops_counting() {
        let clock = Arc::new(ManualClock::default());
        let gateway = Arc::new(ScriptedGateway::default());
        *gateway.receipt.lock() = Some(success_receipt());
        let monitor = monitor(gateway, clock.clone(), MonitorConfig::default());
        let hash = H256::repeat_byte(1);
        monitor.track_transaction(tracked(&clock)).unwrap();

        let first = monitor.poll_transaction(hash).await.unwrap();
        assert_eq!(first.status, TransactionStatus::Confirming);
        assert_eq!(first.confirmations, 1);
        monitor.poll_transaction(hash).await.unwrap();
        let third = monitor.poll_transaction(hash).await.unwrap();
        assert_eq!(third.status, TransactionStatus::Confirmed);
        assert_eq!(third.confirmations, 3);
        assert!(third.confirmed_at.is_some());

        let fourth = monitor.poll_transaction(hash).await.unwrap();
        assert_eq!(fourth.confirmations, 3);
        assert_eq!(fourth.status, TransactionStatus::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reads_do_not_wait_for_a_slow_poll() {
        let clock = Arc::new(ManualClock::default());
        let gateway = Arc::new(ScriptedGateway::default());
        *gateway.receipt.lock() = Some(success_receipt());
        *gateway.lookup_delay.lock() = Some(Duration::from_secs(10));
        let monitor = monitor(gateway, clock.clone(), MonitorConfig::default());
        let hash = H256::repeat_byte(1);
        monitor.track_transaction(tracked(&clock)).unwrap();

        let poller = Arc::clone(&monitor);
        let poll = tokio::spawn(async move { poller.poll_transaction(hash).await });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!poll.is_finished());

        let during = tokio::time::timeout(Duration::from_millis(100), monitor.get_transaction_status(hash))
            .await
            .expect("status query blocked behind the receipt lookup")
            .unwrap();
        assert_eq!(during.status, TransactionStatus::Pending);
        let summary = monitor.summary();
        assert_eq!(summary.total_tracked, 1);
        assert_eq!(summary.by_status["pending"], 1);

        let polled = poll.await.unwrap().unwrap();
        assert_eq!(polled.status, TransactionStatus::Confirming);
        let after = monitor.get_transaction_status(hash).await.unwrap();
        assert_eq!(after, polled);
        assert_eq!(monitor.summary().by_status["confirming"], 1);
    }

    #[tokio::test]
    async fn lookup_errors_are_not_transaction_failures() {
        let clock = Arc::new(ManualClock::default());
        let gateway = Arc::new(ScriptedGateway::default());
        *gateway.fail_lookups.lock() = true;
        let monitor = monitor(gateway, clock.clone(), MonitorConfig::default());
        let hash = H256::repeat_byte(1);
        monitor.track_transaction(tracked(&clock)).unwrap();

        let tx = monitor.poll_transaction(hash).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert!(tx.last_error.is_some());
    }

    #[tokio::test]
    async fn aged_transaction_fails_then_retries_after_backoff() {
        let clock = Arc::new(ManualClock::default());
        let gateway = Arc::new(ScriptedGateway::default());
        let monitor = monitor(gateway.clone(), clock.clone(), MonitorConfig::default());
        let hash = H256::repeat_byte(1);
        monitor.track_transaction(tracked(&clock)).unwrap();

        clock.advance(Duration::from_secs(2 * 3_600));
        let failed = monitor.poll_transaction(hash).await.unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);
        let failure = failed.failure.clone().unwrap();
        assert!(failure.is_failed && failure.is_retryable);
        assert!(failed.next_retry_at.is_some());
        assert!(!monitor.alerts().alerts_for(hash).is_empty());

        let waiting = monitor.poll_transaction(hash).await.unwrap();
        assert_eq!(waiting.status, TransactionStatus::Failed);

        clock.advance(Duration::from_secs(3_600));
        let retried = monitor.poll_transaction(hash).await.unwrap();
        assert_eq!(retried.status, TransactionStatus::Pending);
        assert_eq!(retried.retry_attempts, 1);
        assert_eq!(retried.gas_price, gwei(20));
        assert_eq!(retried.current_hash, H256::repeat_byte(0xbb));
        assert_eq!(*gateway.submissions.lock(), 1);

        let scheduled: Vec<Alert> = monitor
            .alerts()
            .alerts_for(hash)
            .into_iter()
            .filter(|a| a.alert_type == AlertType::RetryScheduled)
            .collect();
        assert_eq!(scheduled.len(), 1);
        assert!(scheduled[0].message.contains("rebroadcast unchanged at 20000000000 wei"));
        assert!(!scheduled[0].recommended_actions.is_empty());
    }

    #[tokio::test]
    async fn exhausted_budget_becomes_terminal_with_critical_alert() {
        let clock = Arc::new(ManualClock::default());
        let config = MonitorConfig {
            retry: RetryConfig {
                max_retry_attempts: 1,
                base_delay_ms: 1,
                max_delay_ms: 1,
                ..RetryConfig::default()
            },
            ..MonitorConfig::default()
        };
        let monitor = monitor(Arc::new(ScriptedGateway::default()), clock.clone(), config);
        let hash = H256::repeat_byte(1);
        monitor.track_transaction(tracked(&clock)).unwrap();

        clock.advance(Duration::from_secs(2 * 3_600));
        monitor.poll_transaction(hash).await.unwrap();
        clock.advance(Duration::from_secs(1));
        assert_eq!(monitor.poll_transaction(hash).await.unwrap().retry_attempts, 1);

        clock.advance(Duration::from_secs(2 * 3_600));
        let last = monitor.poll_transaction(hash).await.unwrap();
        assert_eq!(last.status, TransactionStatus::Failed);
        assert!(last.is_terminal());
        assert_eq!(
            monitor.schedule_retry(hash).await,
            Err(MonitorError::RetryBudgetExhausted(1))
        );
        assert!(monitor
            .alerts()
            .alerts_for(hash)
            .iter()
            .any(|a| a.alert_type == AlertType::RetryExhausted && a.severity == AlertSeverity::Critical));
    }

    #[tokio::test]
    async fn reverted_receipt_is_terminal() {
        let clock = Arc::new(ManualClock::default());
        let gateway = Arc::new(ScriptedGateway::default());
        *gateway.receipt.lock() = Some(ReceiptInfo {
            success: false,
            gas_used: Some(15_000),
            ..success_receipt()
        });
        let monitor = monitor(gateway, clock.clone(), MonitorConfig::default());
        let hash = H256::repeat_byte(1);
        monitor.track_transaction(tracked(&clock)).unwrap();
        let tx = monitor.poll_transaction(hash).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.failure.unwrap().kind, Some(FailureKind::Reverted));
        assert!(matches!(
            monitor.schedule_retry(hash).await,
            Err(MonitorError::NotRetryable(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_drops_old_terminal_entries() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor(Arc::new(ScriptedGateway::default()), clock.clone(), MonitorConfig::default());
        monitor.track_transaction(tracked(&clock)).unwrap();
        monitor.cancel(H256::repeat_byte(1)).await.unwrap();
        assert_eq!(monitor.cleanup(), 0);
        clock.advance(Duration::from_secs(86_401));
        assert_eq!(monitor.cleanup(), 1);
        assert!(monitor.is_empty());
        assert_eq!(monitor.summary().total_tracked, 0);
    }
}

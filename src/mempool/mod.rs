// src/mempool/mod.rs

//! # Mempool Analyzer
//!
//! Runs the periodic analysis cycle over the pending-transaction window:
//! statistics, congestion, price forecasts, confirmation estimates and the
//! ranked top-N. Each successful cycle publishes an immutable
//! [`MempoolAnalysis`] that replaces the previous one. A cycle over an empty
//! window publishes nothing, so readers keep the last snapshot.
//!
//! All model state sits behind one mutex that is only held for CPU work; the
//! pending feed is fetched before the lock is taken.

pub mod estimator;
pub mod priority;
pub mod source;

pub use estimator::{ConfirmationEstimate, ConfirmationEstimator};
pub use priority::{PriorityAnalyzer, PriorityFactors, WeightingPolicy};
pub use source::{BalancedPendingFeed, PendingTransactionSource};

use crate::clock::{elapsed_between, Clock};
use crate::config::MempoolConfig;
use crate::errors::MempoolError;
use crate::gas_oracle::{
    gwei_to_wei, wei_to_gwei, CongestionLevel, CongestionModel, CongestionReading, GasPrediction,
    GasPriceOracle, GasPricePredictor,
};
use crate::mempool_stats::{GasStatistics, GasStatisticsEngine, GasWindowSettings, ObserveOutcome, Trend};
use crate::metrics::{
    ANALYSIS_CYCLES_TOTAL, CONGESTION_SCORE_PERMILLE, MEMPOOL_WINDOW_SIZE, OPTIMAL_GAS_PRICE_GWEI,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Transaction, H256, U256};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const DEFAULT_TX_SIZE: usize = 110;

/// Gas price helper: `n` gwei in wei.
pub fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::exp10(9)
}

/// A transaction observed in the pending pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingTransaction {
    pub hash: H256,
    pub from: Address,
    pub nonce: U256,
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub gas_limit: U256,
    pub value: U256,
    /// Encoded size in bytes.
    pub size: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub priority_score: f64,
    pub is_replacement: bool,
    pub replacement_count: u32,
    /// Percentile rank of the price at the first cycle that saw it.
    pub observed_rank: Option<f64>,
    #[serde(skip)]
    pub priority_factors: Option<PriorityFactors>,
}

impl PendingTransaction {
    pub fn from_transaction(tx: &Transaction, seen_at: DateTime<Utc>) -> Self {
        Self {
            hash: tx.hash,
            from: tx.from,
            nonce: tx.nonce,
            gas_price: if tx.max_fee_per_gas.is_some() { None } else { tx.gas_price },
            max_fee_per_gas: tx.max_fee_per_gas,
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
            gas_limit: tx.gas,
            value: tx.value,
            size: tx.rlp().len(),
            first_seen: seen_at,
            last_seen: seen_at,
            priority_score: 0.0,
            is_replacement: false,
            replacement_count: 0,
            observed_rank: None,
            priority_factors: None,
        }
    }

    /// A legacy-priced transaction with placeholder sender fields.
    pub fn legacy(hash: H256, gas_price: U256, seen_at: DateTime<Utc>) -> Self {
        Self {
            hash,
            from: Address::zero(),
            nonce: U256::zero(),
            gas_price: Some(gas_price),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            gas_limit: U256::from(21_000u64),
            value: U256::zero(),
            size: DEFAULT_TX_SIZE,
            first_seen: seen_at,
            last_seen: seen_at,
            priority_score: 0.0,
            is_replacement: false,
            replacement_count: 0,
            observed_rank: None,
            priority_factors: None,
        }
    }

    /// Legacy gas price, or the fee cap for fee-market transactions.
    pub fn effective_gas_price(&self) -> U256 {
        self.gas_price.or(self.max_fee_per_gas).unwrap_or_default()
    }

    /// Priority fee, or the whole gas price for legacy transactions.
    pub fn tip(&self) -> U256 {
        self.max_priority_fee_per_gas
            .or(self.gas_price)
            .unwrap_or_default()
    }

    pub fn price_gwei(&self) -> f64 {
        wei_to_gwei(self.effective_gas_price())
    }

    pub fn tip_gwei(&self) -> f64 {
        wei_to_gwei(self.tip())
    }
}

/// Why a transaction left the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxExit {
    Mined,
    Dropped,
    Replaced,
}

/// Output of one analysis cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MempoolAnalysis {
    pub timestamp: DateTime<Utc>,
    /// Transactions observed since the analyzer was created.
    pub total_transactions: u64,
    /// Transactions currently in the window.
    pub pending_transactions: usize,
    pub congestion: CongestionReading,
    pub optimal_gas_price: U256,
    pub optimal_gas_price_gwei: f64,
    pub estimated_wait: ConfirmationEstimate,
    pub gas_statistics: GasStatistics,
    /// Served prediction per horizon in seconds.
    pub predictions: BTreeMap<u64, GasPrediction>,
    pub top_transactions: Vec<PendingTransaction>,
    pub recommendations: Vec<String>,
    pub stale: bool,
}

impl MempoolAnalysis {
    pub fn congestion_level(&self) -> CongestionLevel {
        self.congestion.level
    }
}

/// Recommended price from the latest analysis, with the same staleness rule
/// as [`MempoolAnalyzer::get_mempool_analysis`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OptimalGasPrice {
    pub price: U256,
    pub price_gwei: f64,
    pub computed_at: DateTime<Utc>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MempoolMetrics {
    pub window_size: usize,
    pub observed_total: u64,
    pub cycles_published: u64,
    pub cycles_skipped: u64,
    pub last_analysis_at: Option<DateTime<Utc>>,
    pub estimator_samples: usize,
    pub predictor_samples: usize,
}

#[derive(Debug)]
struct ModelState {
    window: GasStatisticsEngine,
    congestion: CongestionModel,
    predictor: GasPricePredictor,
    estimator: ConfirmationEstimator,
    priority: PriorityAnalyzer,
    last_statistics: Option<GasStatistics>,
}

pub struct MempoolAnalyzer {
    config: MempoolConfig,
    clock: Arc<dyn Clock>,
    source: Option<Arc<dyn PendingTransactionSource>>,
    state: Mutex<ModelState>,
    latest: RwLock<Option<Arc<MempoolAnalysis>>>,
    observed_total: AtomicU64,
    cycles_published: AtomicU64,
    cycles_skipped: AtomicU64,
    running: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MempoolAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MempoolAnalyzer")
            .field("window", &self.state.lock().window.len())
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

impl MempoolAnalyzer {
    pub fn new(
        config: MempoolConfig,
        clock: Arc<dyn Clock>,
        source: Option<Arc<dyn PendingTransactionSource>>,
    ) -> Self {
        let state = ModelState {
            window: GasStatisticsEngine::new(GasWindowSettings::from(&config)),
            congestion: CongestionModel::new(config.congestion.clone()),
            predictor: GasPricePredictor::new(config.predictor.clone()),
            estimator: ConfirmationEstimator::new(config.estimator.clone()),
            priority: PriorityAnalyzer::new(&config.priority),
            last_statistics: None,
        };
        Self {
            config,
            clock,
            source,
            state: Mutex::new(state),
            latest: RwLock::new(None),
            observed_total: AtomicU64::new(0),
            cycles_published: AtomicU64::new(0),
            cycles_skipped: AtomicU64::new(0),
            running: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    /// Adds observed transactions to the window.
    pub fn ingest<I>(&self, txs: I) -> usize
    where
        I: IntoIterator<Item = PendingTransaction>,
    {
        let mut state = self.state.lock();
        let mut inserted = 0;
        for mut tx in txs {
            if tx.observed_rank.is_none() {
                if let Some(stats) = &state.last_statistics {
                    tx.observed_rank = Some(estimator::rank_of(tx.price_gwei(), stats));
                }
            }
            match state.window.observe(tx) {
                ObserveOutcome::Inserted | ObserveOutcome::Replaced { .. } => inserted += 1,
                ObserveOutcome::Refreshed | ObserveOutcome::Repriced | ObserveOutcome::Ignored => {}
            }
        }
        self.observed_total.fetch_add(inserted as u64, Ordering::Relaxed);
        MEMPOOL_WINDOW_SIZE.set(state.window.len() as i64);
        inserted
    }

    /// Removes a transaction that left the pool. Mined transactions feed the
    /// confirmation history and the adaptive priority policy.
    pub fn remove_transaction(&self, hash: &H256, exit: TxExit) -> Option<PendingTransaction> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let tx = state.window.remove(hash)?;
        if exit == TxExit::Mined {
            let wait = elapsed_between(tx.first_seen, now);
            if let Some(rank) = tx.observed_rank {
                state.estimator.record(rank, wait, now);
            }
            state.priority.record_inclusion(&tx, wait);
        }
        MEMPOOL_WINDOW_SIZE.set(state.window.len() as i64);
        Some(tx)
    }

    /// Runs one analysis cycle and publishes the result.
    #[instrument(skip(self), level = "debug")]
    pub fn run_cycle(&self) -> Result<Arc<MempoolAnalysis>, MempoolError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.window.prune(now);
        MEMPOOL_WINDOW_SIZE.set(state.window.len() as i64);

        let Some(gas) = state.window.compute(now) else {
            drop(state);
            self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
            ANALYSIS_CYCLES_TOTAL.with_label_values(&["skipped"]).inc();
            debug!("Tracking window empty, keeping previous analysis");
            return Err(MempoolError::EmptyWindow);
        };

        for tx in state.window.transactions_mut() {
            if tx.observed_rank.is_none() {
                tx.observed_rank = Some(estimator::rank_of(tx.price_gwei(), &gas));
            }
        }

        state.predictor.observe(now, gas.median);
        let predictions: BTreeMap<u64, GasPrediction> = state
            .predictor
            .forecast(now)
            .into_iter()
            .map(|(horizon, forecast)| (horizon, forecast.served))
            .collect();

        let pending = state.window.len();
        let congestion = state.congestion.assess(pending, &gas, now);
        let optimal_gwei = self.optimal_price_gwei(&gas, &congestion, &predictions);
        let estimated_wait = state.estimator.estimate(optimal_gwei, &gas);

        let snapshot: Vec<PendingTransaction> = state.window.transactions().cloned().collect();
        let top_transactions = state.priority.top(snapshot, now);
        state.last_statistics = Some(gas.clone());
        drop(state);

        let analysis = Arc::new(MempoolAnalysis {
            timestamp: now,
            total_transactions: self.observed_total.load(Ordering::Relaxed),
            pending_transactions: pending,
            recommendations: recommendations(&congestion, &gas),
            congestion,
            optimal_gas_price: gwei_to_wei(optimal_gwei),
            optimal_gas_price_gwei: optimal_gwei,
            estimated_wait,
            gas_statistics: gas,
            predictions,
            top_transactions,
            stale: false,
        });

        *self.latest.write() = Some(analysis.clone());
        self.cycles_published.fetch_add(1, Ordering::Relaxed);
        ANALYSIS_CYCLES_TOTAL.with_label_values(&["published"]).inc();
        OPTIMAL_GAS_PRICE_GWEI.set(optimal_gwei.round() as i64);
        CONGESTION_SCORE_PERMILLE.set((analysis.congestion.score * 1000.0).round() as i64);
        debug!(
            pending,
            level = %analysis.congestion.level,
            optimal_gwei,
            "Mempool analysis published"
        );
        Ok(analysis)
    }

    /// Median adjusted by congestion, averaged with the shortest-horizon
    /// prediction when that prediction is confident enough.
    fn optimal_price_gwei(
        &self,
        gas: &GasStatistics,
        congestion: &CongestionReading,
        predictions: &BTreeMap<u64, GasPrediction>,
    ) -> f64 {
        let factor = match congestion.level {
            CongestionLevel::Low => 0.9,
            CongestionLevel::Medium => 1.0,
            CongestionLevel::High if congestion.critical => 1.3,
            CongestionLevel::High => 1.2,
        };
        let adjusted = gas.median * factor;
        match predictions.values().next() {
            Some(p) if p.confidence > self.config.predictor.blend_confidence => {
                (adjusted + p.predicted_price) / 2.0
            }
            _ => adjusted,
        }
    }

    /// Latest published analysis, marked stale when older than one update interval.
    pub fn get_mempool_analysis(&self) -> Result<MempoolAnalysis, MempoolError> {
        let latest = self.latest.read().clone().ok_or(MempoolError::NoAnalysis)?;
        let mut analysis = (*latest).clone();
        let now = self.clock.now();
        let max_age = self.config.update_interval();
        analysis.stale = elapsed_between(analysis.timestamp, now) > max_age;
        for prediction in analysis.predictions.values_mut() {
            prediction.mark_stale(now, max_age);
        }
        Ok(analysis)
    }

    pub fn get_optimal_gas_price(&self) -> Result<OptimalGasPrice, MempoolError> {
        let latest = self.latest.read();
        let analysis = latest.as_ref().ok_or(MempoolError::NoAnalysis)?;
        Ok(OptimalGasPrice {
            price: analysis.optimal_gas_price,
            price_gwei: analysis.optimal_gas_price_gwei,
            computed_at: analysis.timestamp,
            stale: elapsed_between(analysis.timestamp, self.clock.now()) > self.config.update_interval(),
        })
    }

    /// Expected wait for a candidate price against the latest distribution.
    pub fn estimate_confirmation_time(&self, gas_price: U256) -> Result<ConfirmationEstimate, MempoolError> {
        let state = self.state.lock();
        let gas = state.last_statistics.as_ref().ok_or(MempoolError::NoAnalysis)?;
        Ok(state.estimator.estimate(wei_to_gwei(gas_price), gas))
    }

    pub fn get_metrics(&self) -> MempoolMetrics {
        let state = self.state.lock();
        MempoolMetrics {
            window_size: state.window.len(),
            observed_total: self.observed_total.load(Ordering::Relaxed),
            cycles_published: self.cycles_published.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            last_analysis_at: self.latest.read().as_ref().map(|a| a.timestamp),
            estimator_samples: state.estimator.samples(),
            predictor_samples: state.predictor.len(),
        }
    }

    /// Pulls one snapshot from the pending feed. Window entries missing from a
    /// snapshot have left the pool and are recorded as mined.
    pub async fn poll_source(&self) -> Result<usize, MempoolError> {
        let Some(source) = &self.source else {
            return Ok(0);
        };
        let fetched = source.fetch_pending().await?;
        let now = self.clock.now();
        let seen: HashSet<H256> = fetched.iter().map(|tx| tx.hash).collect();
        let departed: Vec<H256> = {
            let state = self.state.lock();
            state
                .window
                .transactions()
                .map(|tx| tx.hash)
                .filter(|hash| !seen.contains(hash))
                .collect()
        };
        if !fetched.is_empty() {
            for hash in &departed {
                self.remove_transaction(hash, TxExit::Mined);
            }
        }
        let inserted = self.ingest(
            fetched
                .iter()
                .map(|tx| PendingTransaction::from_transaction(tx, now)),
        );
        debug!(fetched = fetched.len(), inserted, departed = departed.len(), "Pending feed polled");
        Ok(inserted)
    }

    /// Spawns the periodic poll-and-analyse loop.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) -> Result<(), MempoolError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(MempoolError::AlreadyRunning);
        }
        let cancel = parent.child_token();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.update_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => this.tick(&token).await,
                }
            }
            debug!("Mempool analysis loop exited");
        });
        *self.task.lock() = Some(handle);
        *running = Some(cancel);
        info!(interval_ms = self.config.update_interval_ms, "Mempool analysis started");
        Ok(())
    }

    async fn tick(&self, cancel: &CancellationToken) {
        if self.config.poll_pending_feed && self.source.is_some() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.poll_source() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Pending feed poll failed");
                    }
                }
            }
        }
        match self.run_cycle() {
            Ok(_) | Err(MempoolError::EmptyWindow) => {}
            Err(e) => warn!(error = %e, "Mempool analysis cycle failed"),
        }
    }

    /// Cancels the analysis loop without waiting for it.
    pub(crate) fn abort(&self) {
        if let Some(cancel) = self.running.lock().take() {
            cancel.cancel();
        }
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    pub async fn stop(&self, grace: Duration) {
        let Some(cancel) = self.running.lock().take() else {
            return;
        };
        cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("Mempool analysis did not stop within the grace period, aborting");
                abort.abort();
            }
        }
        info!("Mempool analysis stopped");
    }
}

#[async_trait]
impl GasPriceOracle for MempoolAnalyzer {
    async fn optimal_gas_price(&self) -> Result<U256, MempoolError> {
        let optimal = self.get_optimal_gas_price()?;
        if optimal.stale {
            debug!(computed_at = %optimal.computed_at, "Serving a stale optimal gas price");
        }
        Ok(optimal.price)
    }
}

fn recommendations(congestion: &CongestionReading, gas: &GasStatistics) -> Vec<String> {
    let mut out: Vec<String> = match congestion.level {
        CongestionLevel::Low => vec![
            "Network congestion is low - good time for transactions".into(),
            "Consider using lower gas prices for non-urgent transactions".into(),
        ],
        CongestionLevel::Medium => vec![
            "Moderate network congestion - use standard gas prices".into(),
            "Monitor gas prices for potential increases".into(),
        ],
        CongestionLevel::High => vec![
            "High network congestion - expect delays and higher fees".into(),
            "Consider delaying non-urgent transactions".into(),
            "Use higher gas prices for time-sensitive transactions".into(),
        ],
    };
    match gas.trend {
        Trend::Increasing => out.push("Gas prices are trending upward - consider submitting soon".into()),
        Trend::Decreasing => {
            out.push("Gas prices are trending downward - non-urgent transactions can wait".into())
        }
        Trend::Stable => {}
    }
    if congestion.forecast_level > congestion.level {
        out.push("Congestion is expected to rise shortly - submit time-sensitive transactions now".into());
    }
    out
}

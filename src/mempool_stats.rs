// src/mempool_stats.rs

//! # Gas Statistics Engine
//!
//! Owns the rolling window of pending transactions observed in the mempool and
//! turns it into an immutable [`GasStatistics`] snapshot on demand. The window is
//! bounded both in time (`tracking_window`) and in size (`max_transactions`,
//! oldest first-seen evicted first). An empty window yields no snapshot at all,
//! so callers keep whatever they published last.

use crate::config::MempoolConfig;
use crate::mempool::PendingTransaction;
use crate::stats;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Trend::Increasing => "increasing",
            Trend::Decreasing => "decreasing",
            Trend::Stable => "stable",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PercentilePoint {
    pub percentile: f64,
    /// Gas price in gwei.
    pub price: f64,
}

/// Distribution of effective gas prices (gwei) across the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GasStatistics {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub trend: Trend,
    /// Relative change of the second-half mean over the first-half mean.
    pub trend_change: f64,
    /// Standard deviation normalised by the mean.
    pub volatility: f64,
    /// Ascending by percentile.
    pub percentiles: Vec<PercentilePoint>,
    pub sample_count: usize,
    pub computed_at: DateTime<Utc>,
}

impl GasStatistics {
    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|point| (point.percentile - p).abs() < f64::EPSILON)
            .map(|point| point.price)
    }

    /// Interquantile spread relative to the median, using the outermost
    /// configured percentiles inside [10, 90] when present.
    pub fn relative_spread(&self) -> f64 {
        if self.median <= 0.0 || self.percentiles.len() < 2 {
            return 0.0;
        }
        let inner: Vec<&PercentilePoint> = self
            .percentiles
            .iter()
            .filter(|p| p.percentile >= 10.0 && p.percentile <= 90.0)
            .collect();
        let (low, high) = match (inner.first(), inner.last()) {
            (Some(l), Some(h)) if inner.len() >= 2 => (l.price, h.price),
            _ => (
                self.percentiles[0].price,
                self.percentiles[self.percentiles.len() - 1].price,
            ),
        };
        (high - low).max(0.0) / self.median
    }
}

/// What happened to the window when a transaction was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    Inserted,
    /// Same hash seen again; `last_seen` refreshed.
    Refreshed,
    /// Same hash seen again at a higher price.
    Repriced,
    /// A different hash took over the sender's nonce at a higher price.
    Replaced { previous: H256 },
    /// A lower-priced duplicate of a known sender nonce.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct GasWindowSettings {
    pub tracking_window: Duration,
    pub max_transactions: usize,
    pub percentiles: Vec<f64>,
    pub trend_tolerance: f64,
}

impl From<&MempoolConfig> for GasWindowSettings {
    fn from(cfg: &MempoolConfig) -> Self {
        let mut percentiles = cfg.percentiles.clone();
        percentiles.sort_by(|a, b| a.total_cmp(b));
        percentiles.dedup();
        Self {
            tracking_window: cfg.tracking_window(),
            max_transactions: cfg.max_transactions,
            percentiles,
            trend_tolerance: cfg.trend_tolerance,
        }
    }
}

#[derive(Debug)]
pub struct GasStatisticsEngine {
    settings: GasWindowSettings,
    window: HashMap<H256, PendingTransaction>,
    by_sender_nonce: HashMap<(Address, U256), H256>,
}

impl GasStatisticsEngine {
    pub fn new(settings: GasWindowSettings) -> Self {
        Self {
            settings,
            window: HashMap::new(),
            by_sender_nonce: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn get(&self, hash: &H256) -> Option<&PendingTransaction> {
        self.window.get(hash)
    }

    pub fn transactions(&self) -> impl Iterator<Item = &PendingTransaction> {
        self.window.values()
    }

    pub fn transactions_mut(&mut self) -> impl Iterator<Item = &mut PendingTransaction> {
        self.window.values_mut()
    }

    /// Adds or refreshes a transaction, detecting fee-bump replacements.
    pub fn observe(&mut self, mut tx: PendingTransaction) -> ObserveOutcome {
        if let Some(existing) = self.window.get_mut(&tx.hash) {
            existing.last_seen = tx.last_seen;
            if tx.effective_gas_price() > existing.effective_gas_price() {
                existing.gas_price = tx.gas_price;
                existing.max_fee_per_gas = tx.max_fee_per_gas;
                existing.max_priority_fee_per_gas = tx.max_priority_fee_per_gas;
                existing.is_replacement = true;
                existing.replacement_count += 1;
                return ObserveOutcome::Repriced;
            }
            return ObserveOutcome::Refreshed;
        }

        let key = (tx.from, tx.nonce);
        let mut outcome = ObserveOutcome::Inserted;
        if let Some(previous_hash) = self.by_sender_nonce.get(&key).copied() {
            if let Some(previous) = self.window.get(&previous_hash) {
                if tx.effective_gas_price() <= previous.effective_gas_price() {
                    trace!(hash = ?tx.hash, "Ignoring lower-priced duplicate nonce");
                    return ObserveOutcome::Ignored;
                }
                tx.is_replacement = true;
                tx.replacement_count = previous.replacement_count + 1;
                tx.first_seen = tx.first_seen.min(previous.first_seen);
            }
            self.window.remove(&previous_hash);
            outcome = ObserveOutcome::Replaced {
                previous: previous_hash,
            };
        }

        self.by_sender_nonce.insert(key, tx.hash);
        self.window.insert(tx.hash, tx);
        self.enforce_capacity();
        outcome
    }

    pub fn remove(&mut self, hash: &H256) -> Option<PendingTransaction> {
        let tx = self.window.remove(hash)?;
        let key = (tx.from, tx.nonce);
        if self.by_sender_nonce.get(&key) == Some(hash) {
            self.by_sender_nonce.remove(&key);
        }
        Some(tx)
    }

    /// Drops transactions first seen before `now - tracking_window`.
    pub fn prune(&mut self, now: DateTime<Utc>) -> Vec<PendingTransaction> {
        let window = chrono::Duration::from_std(self.settings.tracking_window)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = now - window;
        let expired: Vec<H256> = self
            .window
            .values()
            .filter(|tx| tx.first_seen < cutoff)
            .map(|tx| tx.hash)
            .collect();
        let removed: Vec<PendingTransaction> =
            expired.iter().filter_map(|hash| self.remove(hash)).collect();
        if !removed.is_empty() {
            debug!(count = removed.len(), "Pruned transactions outside the tracking window");
        }
        removed
    }

    fn enforce_capacity(&mut self) {
        let excess = self.window.len().saturating_sub(self.settings.max_transactions);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<(DateTime<Utc>, H256)> =
            self.window.values().map(|tx| (tx.first_seen, tx.hash)).collect();
        by_age.sort();
        for (_, hash) in by_age.into_iter().take(excess) {
            self.remove(&hash);
        }
        trace!(evicted = excess, "Evicted oldest transactions over capacity");
    }

    /// Recomputes the distribution over the current window. `None` when empty.
    pub fn compute(&self, now: DateTime<Utc>) -> Option<GasStatistics> {
        if self.window.is_empty() {
            return None;
        }

        let mut chronological: Vec<(DateTime<Utc>, H256, f64)> = self
            .window
            .values()
            .map(|tx| (tx.first_seen, tx.hash, tx.price_gwei()))
            .collect();
        chronological.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut sorted: Vec<f64> = chronological.iter().map(|(_, _, p)| *p).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mean = stats::mean(&sorted);
        let std_dev = stats::standard_deviation(&sorted, Some(mean));
        let median = stats::median(&sorted).unwrap_or(0.0);
        let percentiles = self
            .settings
            .percentiles
            .iter()
            .filter_map(|&p| {
                stats::percentile(&sorted, p).map(|price| PercentilePoint {
                    percentile: p,
                    price,
                })
            })
            .collect();

        let ordered: Vec<f64> = chronological.iter().map(|(_, _, p)| *p).collect();
        let (trend, trend_change) = half_window_trend(&ordered, self.settings.trend_tolerance);

        Some(GasStatistics {
            mean,
            median,
            std_dev,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            trend,
            trend_change,
            volatility: if mean > 0.0 { std_dev / mean } else { 0.0 },
            percentiles,
            sample_count: sorted.len(),
            computed_at: now,
        })
    }
}

/// Compares the mean of the older half of the window with the newer half.
fn half_window_trend(chronological: &[f64], tolerance: f64) -> (Trend, f64) {
    if chronological.len() < 2 {
        return (Trend::Stable, 0.0);
    }
    let half = chronological.len() / 2;
    let first = stats::mean(&chronological[..half]);
    let second = stats::mean(&chronological[half..]);
    if first <= 0.0 {
        return (Trend::Stable, 0.0);
    }
    let change = (second - first) / first;
    let trend = if change > tolerance {
        Trend::Increasing
    } else if change < -tolerance {
        Trend::Decreasing
    } else {
        Trend::Stable
    };
    (trend, change)
}

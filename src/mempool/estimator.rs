// src/mempool/estimator.rs

//! # Confirmation Time Estimator
//!
//! Maps a gas price to an expected wait by locating it on the current
//! percentile curve and reading the historical median wait of transactions
//! that were observed at a similar rank. Ranks are grouped into buckets of
//! `bucket_width` percentile points; empty buckets are interpolated from their
//! nearest populated neighbours. Without any history the estimate falls back
//! to a linear block-count curve.

use crate::config::EstimatorConfig;
use crate::mempool_stats::GasStatistics;
use crate::stats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfirmationObservation {
    /// Percentile rank of the price when the transaction was first analysed.
    pub rank: f64,
    pub wait: Duration,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfirmationEstimate {
    pub rank: f64,
    pub expected_wait: Duration,
    /// False when the block-time fallback curve was used.
    pub from_history: bool,
    pub samples: usize,
}

/// Percentile rank of `price` on the curve, linearly interpolated between
/// neighbouring percentile points. Below the lowest point the rank scales
/// towards zero; above the highest it interpolates towards the window maximum.
pub fn rank_of(price: f64, gas: &GasStatistics) -> f64 {
    let curve = &gas.percentiles;
    let Some(first) = curve.first() else {
        return 50.0;
    };
    if price < first.price {
        if first.price <= 0.0 {
            return 0.0;
        }
        return (first.percentile * price / first.price).clamp(0.0, 100.0);
    }

    let lower = curve.iter().rposition(|p| p.price <= price).unwrap_or(0);
    let lo = curve[lower];
    let (hi_pct, hi_price) = match curve.get(lower + 1) {
        Some(next) => (next.percentile, next.price),
        None if gas.max > lo.price => (100.0, gas.max),
        None => return if price > lo.price { 100.0 } else { lo.percentile },
    };
    if price >= hi_price {
        return hi_pct;
    }
    let t = (price - lo.price) / (hi_price - lo.price);
    (lo.percentile + (hi_pct - lo.percentile) * t).clamp(0.0, 100.0)
}

#[derive(Debug)]
pub struct ConfirmationEstimator {
    config: EstimatorConfig,
    history: VecDeque<ConfirmationObservation>,
}

impl ConfirmationEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
        }
    }

    pub fn samples(&self) -> usize {
        self.history.len()
    }

    pub fn record(&mut self, rank: f64, wait: Duration, recorded_at: DateTime<Utc>) {
        while self.history.len() >= self.config.history_window {
            self.history.pop_front();
        }
        self.history.push_back(ConfirmationObservation {
            rank: rank.clamp(0.0, 100.0),
            wait,
            recorded_at,
        });
    }

    pub fn estimate(&self, price_gwei: f64, gas: &GasStatistics) -> ConfirmationEstimate {
        self.estimate_rank(rank_of(price_gwei, gas))
    }

    pub fn estimate_rank(&self, rank: f64) -> ConfirmationEstimate {
        let rank = rank.clamp(0.0, 100.0);
        match self.historical_wait(rank) {
            Some(secs) => ConfirmationEstimate {
                rank,
                expected_wait: Duration::from_secs_f64(secs.max(0.0)),
                from_history: true,
                samples: self.history.len(),
            },
            None => ConfirmationEstimate {
                rank,
                expected_wait: self.fallback_wait(rank),
                from_history: false,
                samples: 0,
            },
        }
    }

    fn fallback_wait(&self, rank: f64) -> Duration {
        let cfg = &self.config;
        let blocks = cfg.max_blocks - (cfg.max_blocks - cfg.min_blocks) * rank / 100.0;
        Duration::from_secs_f64(blocks.max(cfg.min_blocks) * cfg.block_time_secs)
    }

    fn bucket_count(&self) -> usize {
        ((100.0 / self.config.bucket_width).ceil() as usize).max(1)
    }

    fn bucket_of(&self, rank: f64) -> usize {
        ((rank / self.config.bucket_width).floor() as usize).min(self.bucket_count() - 1)
    }

    /// Median wait (seconds) per bucket, `None` where no observation landed.
    fn bucket_medians(&self) -> Vec<Option<f64>> {
        let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); self.bucket_count()];
        for obs in &self.history {
            buckets[self.bucket_of(obs.rank)].push(obs.wait.as_secs_f64());
        }
        buckets
            .into_iter()
            .map(|mut waits| {
                waits.sort_by(|a, b| a.total_cmp(b));
                stats::median(&waits)
            })
            .collect()
    }

    fn historical_wait(&self, rank: f64) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        let medians = self.bucket_medians();
        let idx = self.bucket_of(rank);
        if let Some(wait) = medians[idx] {
            return Some(wait);
        }
        let below = (0..idx).rev().find_map(|i| medians[i].map(|w| (i, w)));
        let above = (idx + 1..medians.len()).find_map(|i| medians[i].map(|w| (i, w)));
        match (below, above) {
            (Some((lo, lo_wait)), Some((hi, hi_wait))) => {
                let width = self.config.bucket_width;
                let lo_center = (lo as f64 + 0.5) * width;
                let hi_center = (hi as f64 + 0.5) * width;
                let t = ((rank - lo_center) / (hi_center - lo_center)).clamp(0.0, 1.0);
                Some(lo_wait + (hi_wait - lo_wait) * t)
            }
            (Some((_, wait)), None) | (None, Some((_, wait))) => Some(wait),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool_stats::{PercentilePoint, Trend};

    fn curve() -> GasStatistics {
        let points = [(10.0, 20.0), (50.0, 50.0), (90.0, 90.0)];
        GasStatistics {
            mean: 52.0,
            median: 50.0,
            std_dev: 20.0,
            min: 10.0,
            max: 120.0,
            trend: Trend::Stable,
            trend_change: 0.0,
            volatility: 0.4,
            percentiles: points
                .iter()
                .map(|&(percentile, price)| PercentilePoint { percentile, price })
                .collect(),
            sample_count: 100,
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn rank_interpolates_along_the_curve() {
        let gas = curve();
        assert_eq!(rank_of(20.0, &gas), 10.0);
        assert_eq!(rank_of(35.0, &gas), 30.0);
        assert_eq!(rank_of(10.0, &gas), 5.0);
        assert_eq!(rank_of(105.0, &gas), 95.0);
        assert_eq!(rank_of(500.0, &gas), 100.0);
    }

    #[test]
    fn falls_back_to_block_curve_without_history() {
        let estimator = ConfirmationEstimator::new(EstimatorConfig::default());
        let top = estimator.estimate_rank(100.0);
        let bottom = estimator.estimate_rank(0.0);
        assert!(!top.from_history);
        assert_eq!(top.expected_wait, Duration::from_secs(12));
        assert_eq!(bottom.expected_wait, Duration::from_secs(240));
    }

    #[test]
    fn cheaper_prices_wait_longer() {
        let estimator = ConfirmationEstimator::new(EstimatorConfig::default());
        let gas = curve();
        let cheap = estimator.estimate(20.0, &gas);
        let median = estimator.estimate(50.0, &gas);
        assert!(cheap.expected_wait > median.expected_wait);
    }

    #[test]
    fn uses_bucket_median_and_interpolates_gaps() {
        let mut estimator = ConfirmationEstimator::new(EstimatorConfig::default());
        let now = Utc::now();
        for secs in [100, 120, 140] {
            estimator.record(15.0, Duration::from_secs(secs), now);
        }
        estimator.record(95.0, Duration::from_secs(20), now);

        let low = estimator.estimate_rank(12.0);
        assert!(low.from_history);
        assert_eq!(low.expected_wait, Duration::from_secs(120));
        assert_eq!(low.samples, 4);

        // Halfway between bucket centres 15 and 95.
        let mid = estimator.estimate_rank(55.0);
        assert_eq!(mid.expected_wait, Duration::from_secs(70));
    }

    #[test]
    fn history_is_bounded() {
        let mut estimator = ConfirmationEstimator::new(EstimatorConfig {
            history_window: 2,
            ..EstimatorConfig::default()
        });
        for _ in 0..5 {
            estimator.record(50.0, Duration::from_secs(1), Utc::now());
        }
        assert_eq!(estimator.samples(), 2);
    }
}

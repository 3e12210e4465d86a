// src/gas_oracle/congestion.rs

//! # Congestion Model
//!
//! Folds queue depth, price dispersion and price trend into a single score in
//! `[0, 1]`, buckets it into a [`CongestionLevel`], and extrapolates the recent
//! score trajectory over the configured horizon.

use crate::config::CongestionConfig;
use crate::mempool_stats::GasStatistics;
use crate::stats::{self, ExponentialMovingAverage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

const SCORE_HISTORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for CongestionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CongestionLevel::Low => "low",
            CongestionLevel::Medium => "medium",
            CongestionLevel::High => "high",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CongestionReading {
    pub level: CongestionLevel,
    pub score: f64,
    /// Score at or above the high threshold.
    pub critical: bool,
    pub forecast_score: f64,
    pub forecast_level: CongestionLevel,
    /// Pending count relative to the smoothed baseline before this reading.
    pub queue_ratio: f64,
}

#[derive(Debug)]
pub struct CongestionModel {
    config: CongestionConfig,
    baseline: ExponentialMovingAverage,
    history: VecDeque<(DateTime<Utc>, f64)>,
}

impl CongestionModel {
    pub fn new(config: CongestionConfig) -> Self {
        let baseline = ExponentialMovingAverage::with_alpha(config.baseline_alpha);
        Self {
            config,
            baseline,
            history: VecDeque::with_capacity(SCORE_HISTORY),
        }
    }

    pub fn level_for(&self, score: f64) -> CongestionLevel {
        if score < self.config.low_threshold {
            CongestionLevel::Low
        } else if score < self.config.medium_threshold {
            CongestionLevel::Medium
        } else {
            CongestionLevel::High
        }
    }

    pub fn assess(&mut self, pending: usize, gas: &GasStatistics, now: DateTime<Utc>) -> CongestionReading {
        let pending = pending as f64;
        let queue_ratio = match self.baseline.current() {
            Some(baseline) if baseline > 0.0 => pending / baseline,
            _ => 1.0,
        };
        self.baseline.add(pending);

        let queue = queue_ratio / (1.0 + queue_ratio);
        let spread = gas.relative_spread().clamp(0.0, 1.0);
        let trend = (0.5 + gas.trend_change * 5.0).clamp(0.0, 1.0);

        let cfg = &self.config;
        let total_weight = cfg.queue_weight + cfg.spread_weight + cfg.trend_weight;
        let score = if total_weight > 0.0 {
            ((cfg.queue_weight * queue + cfg.spread_weight * spread + cfg.trend_weight * trend)
                / total_weight)
                .clamp(0.0, 1.0)
        } else {
            0.0
        };

        if self.history.len() == SCORE_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back((now, score));
        let forecast_score = self.forecast(score);

        debug!(score, queue, spread, trend, forecast_score, "Congestion assessed");
        CongestionReading {
            level: self.level_for(score),
            score,
            critical: score >= cfg.high_threshold,
            forecast_score,
            forecast_level: self.level_for(forecast_score),
            queue_ratio,
        }
    }

    fn forecast(&self, current: f64) -> f64 {
        let Some(&(origin, _)) = self.history.front() else {
            return current;
        };
        let xs: Vec<f64> = self
            .history
            .iter()
            .map(|(t, _)| (*t - origin).num_milliseconds() as f64 / 1000.0)
            .collect();
        let ys: Vec<f64> = self.history.iter().map(|(_, s)| *s).collect();
        match stats::linear_regression(&xs, &ys) {
            Some((slope, _)) => {
                (current + slope * self.config.prediction_horizon_secs as f64).clamp(0.0, 1.0)
            }
            None => current,
        }
    }
}

// src/mempool/priority.rs

//! # Priority Analyzer
//!
//! Scores pending transactions as a weighted sum of normalised factors and
//! ranks them most urgent first. Scores only compare within one window: the
//! price, tip and size factors are mid-ranks against the other transactions in
//! the same window.
//!
//! The weighting policy is pluggable:
//! - **Static** uses the configured weights as-is.
//! - **Dynamic** boosts factors that currently discriminate between
//!   transactions (higher dispersion) and renormalises.
//! - **Adaptive** nudges weights online from observed inclusions, towards the
//!   factors that were high on transactions mined faster than usual.

use super::PendingTransaction;
use crate::config::{PriorityConfig, PriorityWeights, WeightingPolicyKind};
use crate::stats::{self, ExponentialMovingAverage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::time::Duration;
use tracing::trace;

const MIN_ADAPTIVE_WEIGHT: f64 = 0.01;
const FULL_REPLACEMENT_BUMPS: f64 = 3.0;

/// Factor values, each in `[0, 1]` with higher meaning more urgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PriorityFactors {
    pub gas_price: f64,
    pub tip: f64,
    pub size: f64,
    pub age: f64,
    pub replacement: f64,
}

impl PriorityFactors {
    pub fn as_array(&self) -> [f64; 5] {
        [self.gas_price, self.tip, self.size, self.age, self.replacement]
    }

    pub fn score(&self, weights: &PriorityWeights) -> f64 {
        self.as_array()
            .iter()
            .zip(weights.as_array())
            .map(|(f, w)| f * w)
            .sum()
    }
}

pub trait WeightingPolicy: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> WeightingPolicyKind;

    /// Weights to apply to the given window of factors.
    fn weights(&self, window: &[PriorityFactors]) -> PriorityWeights;

    /// Feedback from a mined transaction; `fast` when it waited less than usual.
    fn observe_inclusion(&mut self, _factors: &PriorityFactors, _fast: bool) {}
}

#[derive(Debug, Clone)]
pub struct StaticWeights(pub PriorityWeights);

impl WeightingPolicy for StaticWeights {
    fn kind(&self) -> WeightingPolicyKind {
        WeightingPolicyKind::Static
    }

    fn weights(&self, _window: &[PriorityFactors]) -> PriorityWeights {
        self.0
    }
}

/// Scales each base weight by `0.5 + stddev` of that factor across the window,
/// then renormalises to the base total.
#[derive(Debug, Clone)]
pub struct DynamicWeights {
    base: PriorityWeights,
}

impl DynamicWeights {
    pub fn new(base: PriorityWeights) -> Self {
        Self { base }
    }
}

impl WeightingPolicy for DynamicWeights {
    fn kind(&self) -> WeightingPolicyKind {
        WeightingPolicyKind::Dynamic
    }

    fn weights(&self, window: &[PriorityFactors]) -> PriorityWeights {
        if window.len() < 2 {
            return self.base;
        }
        let base = self.base.as_array();
        let mut scaled = [0.0; 5];
        for (i, slot) in scaled.iter_mut().enumerate() {
            let column: Vec<f64> = window.iter().map(|f| f.as_array()[i]).collect();
            *slot = base[i] * (0.5 + stats::standard_deviation(&column, None));
        }
        PriorityWeights::from_array(renormalise(scaled, base.iter().sum()))
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveWeights {
    current: PriorityWeights,
    learning_rate: f64,
}

impl AdaptiveWeights {
    pub fn new(initial: PriorityWeights, learning_rate: f64) -> Self {
        let total: f64 = initial.as_array().iter().sum();
        Self {
            current: PriorityWeights::from_array(renormalise(initial.as_array(), total)),
            learning_rate,
        }
    }
}

impl WeightingPolicy for AdaptiveWeights {
    fn kind(&self) -> WeightingPolicyKind {
        WeightingPolicyKind::Adaptive
    }

    fn weights(&self, _window: &[PriorityFactors]) -> PriorityWeights {
        self.current
    }

    fn observe_inclusion(&mut self, factors: &PriorityFactors, fast: bool) {
        let direction = if fast { 1.0 } else { -1.0 };
        let total: f64 = self.current.as_array().iter().sum();
        let mut next = self.current.as_array();
        for (w, f) in next.iter_mut().zip(factors.as_array()) {
            *w = (*w + self.learning_rate * (f - 0.5) * direction).max(MIN_ADAPTIVE_WEIGHT);
        }
        self.current = PriorityWeights::from_array(renormalise(next, total));
        trace!(weights = ?self.current, fast, "Adaptive priority weights updated");
    }
}

fn renormalise(values: [f64; 5], target_total: f64) -> [f64; 5] {
    let sum: f64 = values.iter().sum();
    if sum <= 0.0 {
        return values;
    }
    values.map(|v| v * target_total / sum)
}

pub fn policy_from_config(cfg: &PriorityConfig) -> Box<dyn WeightingPolicy> {
    match cfg.policy {
        WeightingPolicyKind::Static => Box::new(StaticWeights(cfg.weights)),
        WeightingPolicyKind::Dynamic => Box::new(DynamicWeights::new(cfg.weights)),
        WeightingPolicyKind::Adaptive => Box::new(AdaptiveWeights::new(cfg.weights, cfg.learning_rate)),
    }
}

/// Fraction of `values` strictly below `x` plus half of those equal to it.
fn mid_rank(values: &[f64], x: f64) -> f64 {
    if values.is_empty() {
        return 0.5;
    }
    let below = values.iter().filter(|v| **v < x).count() as f64;
    let equal = values.iter().filter(|v| **v == x).count() as f64;
    (below + 0.5 * equal) / values.len() as f64
}

#[derive(Debug)]
pub struct PriorityAnalyzer {
    policy: Box<dyn WeightingPolicy>,
    max_age: Duration,
    top_n: usize,
    typical_wait: ExponentialMovingAverage,
}

impl PriorityAnalyzer {
    pub fn new(cfg: &PriorityConfig) -> Self {
        Self::with_policy(cfg, policy_from_config(cfg))
    }

    pub fn with_policy(cfg: &PriorityConfig, policy: Box<dyn WeightingPolicy>) -> Self {
        Self {
            policy,
            max_age: Duration::from_secs(cfg.max_age_secs),
            top_n: cfg.top_n,
            typical_wait: ExponentialMovingAverage::with_alpha(0.1),
        }
    }

    pub fn policy_kind(&self) -> WeightingPolicyKind {
        self.policy.kind()
    }

    pub fn current_weights(&self, window: &[PriorityFactors]) -> PriorityWeights {
        self.policy.weights(window)
    }

    pub fn factors(&self, txs: &[PendingTransaction], now: DateTime<Utc>) -> Vec<PriorityFactors> {
        let prices: Vec<f64> = txs.iter().map(|t| t.price_gwei()).collect();
        let tips: Vec<f64> = txs.iter().map(|t| t.tip_gwei()).collect();
        let sizes: Vec<f64> = txs.iter().map(|t| t.size as f64).collect();
        let max_age = self.max_age.as_secs_f64().max(1.0);

        txs.iter()
            .zip(prices.iter().zip(&tips))
            .map(|(tx, (&price, &tip))| {
                let age = crate::clock::elapsed_between(tx.first_seen, now).as_secs_f64();
                PriorityFactors {
                    gas_price: mid_rank(&prices, price),
                    tip: mid_rank(&tips, tip),
                    size: 1.0 - mid_rank(&sizes, tx.size as f64),
                    age: (age / max_age).min(1.0),
                    replacement: if tx.is_replacement {
                        (f64::from(tx.replacement_count.max(1)) / FULL_REPLACEMENT_BUMPS).min(1.0)
                    } else {
                        0.0
                    },
                }
            })
            .collect()
    }

    /// Scores every transaction and returns them most urgent first. Equal
    /// scores keep the younger transaction first; the sort is stable.
    pub fn rank(&self, mut txs: Vec<PendingTransaction>, now: DateTime<Utc>) -> Vec<PendingTransaction> {
        let factors = self.factors(&txs, now);
        let weights = self.policy.weights(&factors);
        for (tx, f) in txs.iter_mut().zip(&factors) {
            tx.priority_score = f.score(&weights);
            tx.priority_factors = Some(*f);
        }
        txs.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.first_seen.cmp(&a.first_seen))
        });
        txs
    }

    pub fn top(&self, txs: Vec<PendingTransaction>, now: DateTime<Utc>) -> Vec<PendingTransaction> {
        let mut ranked = self.rank(txs, now);
        ranked.truncate(self.top_n);
        ranked
    }

    /// Feeds a mined transaction back to the policy.
    pub fn record_inclusion(&mut self, tx: &PendingTransaction, wait: Duration) {
        let secs = wait.as_secs_f64();
        let fast = self.typical_wait.current().map_or(true, |typical| secs <= typical);
        self.typical_wait.add(secs);
        if let Some(factors) = tx.priority_factors {
            self.policy.observe_inclusion(&factors, fast);
        }
    }
}

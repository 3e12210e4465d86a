// src/gas_oracle/mod.rs

use crate::errors::MempoolError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::Serialize;
use std::time::Duration;

pub mod congestion;
pub mod predictor;

pub use congestion::{CongestionLevel, CongestionModel, CongestionReading};
pub use predictor::GasPricePredictor;

/// Confidence band around a predicted price, in gwei.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceRange {
    pub low: f64,
    pub high: f64,
}

impl PriceRange {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.low && price <= self.high
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }
}

/// A point forecast for one horizon produced by one method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GasPrediction {
    pub method: crate::config::PredictionMethod,
    pub horizon_secs: u64,
    /// Gwei.
    pub predicted_price: f64,
    /// In [0, 1].
    pub confidence: f64,
    pub range: PriceRange,
    pub generated_at: DateTime<Utc>,
    pub stale: bool,
}

impl GasPrediction {
    pub fn horizon(&self) -> Duration {
        Duration::from_secs(self.horizon_secs)
    }

    /// Marks the prediction stale when it is older than `max_age` at `now`.
    pub fn mark_stale(&mut self, now: DateTime<Utc>, max_age: Duration) {
        self.stale = crate::clock::elapsed_between(self.generated_at, now) > max_age;
    }
}

/// Source of the current optimal gas price, consumed by the retry manager.
#[async_trait]
pub trait GasPriceOracle: Send + Sync + std::fmt::Debug {
    async fn optimal_gas_price(&self) -> Result<U256, MempoolError>;
}

const WEI_PER_GWEI: f64 = 1_000_000_000.0;

/// Converts wei to gwei, saturating for values beyond `u128`.
pub fn wei_to_gwei(wei: U256) -> f64 {
    if wei > U256::from(u128::MAX) {
        return f64::MAX;
    }
    wei.as_u128() as f64 / WEI_PER_GWEI
}

/// Converts gwei to wei, rounding to the nearest wei. Negative input is zero.
pub fn gwei_to_wei(gwei: f64) -> U256 {
    if !gwei.is_finite() || gwei <= 0.0 {
        return U256::zero();
    }
    U256::from((gwei * WEI_PER_GWEI).round() as u128)
}

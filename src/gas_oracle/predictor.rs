// src/gas_oracle/predictor.rs

//! # Gas Price Predictor
//!
//! Forecasts the median gas price over several horizons from the series of
//! per-cycle medians. Every enabled method fits the same series independently;
//! the ensemble combines them weighted by confidence and is discounted when
//! the members disagree.
//!
//! Confidence of a single method is `1 / (1 + rmse / mean)` scaled by
//! `span / (span + horizon)`, so noisy fits and long extrapolations both lower
//! it. The reported range is `z(confidence_level) * rmse` widened by the number
//! of sampling steps the horizon covers.

use super::{GasPrediction, PriceRange};
use crate::config::{PredictionMethod, PredictorConfig};
use crate::stats;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};

const BASE_METHODS: [PredictionMethod; 4] = [
    PredictionMethod::MovingAverage,
    PredictionMethod::ExponentialSmoothing,
    PredictionMethod::LinearRegression,
    PredictionMethod::PolynomialRegression,
];

/// Everything forecast for one horizon.
#[derive(Debug, Clone, PartialEq)]
pub struct HorizonForecast {
    /// The ensemble when enabled, otherwise the most confident member.
    pub served: GasPrediction,
    pub members: Vec<GasPrediction>,
}

/// Point estimate and residual error of one fitted method.
#[derive(Debug, Clone, Copy)]
struct Fit {
    price: f64,
    rmse: f64,
}

/// Series view shared by all methods for one forecast round.
struct Series<'a> {
    xs: Vec<f64>,
    ys: Vec<f64>,
    span: f64,
    step: f64,
    mean: f64,
    config: &'a PredictorConfig,
}

impl Series<'_> {
    fn last_x(&self) -> f64 {
        self.xs.last().copied().unwrap_or(0.0)
    }

    fn moving_average(&self) -> Option<Fit> {
        let window = self.config.moving_average_window.min(self.ys.len());
        if window == 0 {
            return None;
        }
        let tail = &self.ys[self.ys.len() - window..];
        let price = stats::mean(tail);
        Some(Fit {
            price,
            rmse: stats::standard_deviation(tail, Some(price)),
        })
    }

    /// Holt's linear method; one-step-ahead errors give the rmse.
    fn exponential_smoothing(&self, horizon: f64) -> Option<Fit> {
        if self.ys.len() < 2 {
            return None;
        }
        let (alpha, beta) = (self.config.smoothing_alpha, self.config.smoothing_beta);
        let mut level = self.ys[0];
        let mut trend = self.ys[1] - self.ys[0];
        let mut sq_err = 0.0;
        for &y in &self.ys[1..] {
            let forecast = level + trend;
            sq_err += (y - forecast).powi(2);
            let next_level = alpha * y + (1.0 - alpha) * (level + trend);
            trend = beta * (next_level - level) + (1.0 - beta) * trend;
            level = next_level;
        }
        let steps = horizon / self.step;
        Some(Fit {
            price: level + trend * steps,
            rmse: (sq_err / (self.ys.len() - 1) as f64).sqrt(),
        })
    }

    fn linear_regression(&self, horizon: f64) -> Option<Fit> {
        let (slope, intercept) = stats::linear_regression(&self.xs, &self.ys)?;
        let fitted: Vec<f64> = self.xs.iter().map(|x| slope * x + intercept).collect();
        Some(Fit {
            price: slope * (self.last_x() + horizon) + intercept,
            rmse: stats::rmse(&self.ys, &fitted),
        })
    }

    /// Quadratic fit on time normalised to the series span.
    fn polynomial_regression(&self, horizon: f64) -> Option<Fit> {
        if self.span <= 0.0 {
            return None;
        }
        let scaled: Vec<f64> = self.xs.iter().map(|x| x / self.span).collect();
        let [c0, c1, c2] = stats::quadratic_regression(&scaled, &self.ys)?;
        let eval = |x: f64| c0 + c1 * x + c2 * x * x;
        let fitted: Vec<f64> = scaled.iter().map(|&x| eval(x)).collect();
        Some(Fit {
            price: eval((self.last_x() + horizon) / self.span),
            rmse: stats::rmse(&self.ys, &fitted),
        })
    }

    fn fit(&self, method: PredictionMethod, horizon: f64) -> Option<Fit> {
        match method {
            PredictionMethod::MovingAverage => self.moving_average(),
            PredictionMethod::ExponentialSmoothing => self.exponential_smoothing(horizon),
            PredictionMethod::LinearRegression => self.linear_regression(horizon),
            PredictionMethod::PolynomialRegression => self.polynomial_regression(horizon),
            PredictionMethod::Ensemble => None,
        }
    }

    fn confidence(&self, rmse: f64, horizon: f64) -> f64 {
        if self.mean <= 0.0 || self.span <= 0.0 {
            return 0.0;
        }
        let fit_quality = 1.0 / (1.0 + rmse / self.mean);
        let reach = self.span / (self.span + horizon);
        (fit_quality * reach).clamp(0.0, 1.0)
    }

    fn range(&self, price: f64, rmse: f64, horizon: f64) -> PriceRange {
        let half_width =
            stats::z_score(self.config.confidence_level) * rmse * (horizon / self.step).max(1.0).sqrt();
        PriceRange {
            low: (price - half_width).max(0.0),
            high: price + half_width,
        }
    }
}

#[derive(Debug)]
pub struct GasPricePredictor {
    config: PredictorConfig,
    series: VecDeque<(DateTime<Utc>, f64)>,
}

impl GasPricePredictor {
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            series: VecDeque::with_capacity(config.history_size),
            config,
        }
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Appends one median observation (gwei), dropping the oldest beyond `history_size`.
    pub fn observe(&mut self, at: DateTime<Utc>, median_gwei: f64) {
        if !median_gwei.is_finite() {
            return;
        }
        while self.series.len() >= self.config.history_size {
            self.series.pop_front();
        }
        self.series.push_back((at, median_gwei));
    }

    fn series_view(&self) -> Option<Series<'_>> {
        if self.series.len() < 2 {
            return None;
        }
        let origin = self.series.front()?.0;
        let xs: Vec<f64> = self
            .series
            .iter()
            .map(|(t, _)| (*t - origin).num_milliseconds() as f64 / 1000.0)
            .collect();
        let ys: Vec<f64> = self.series.iter().map(|(_, y)| *y).collect();
        let span = xs.last().copied().unwrap_or(0.0);
        let step = if span > 0.0 {
            span / (xs.len() - 1) as f64
        } else {
            1.0
        };
        let mean = stats::mean(&ys);
        Some(Series {
            xs,
            ys,
            span,
            step,
            mean,
            config: &self.config,
        })
    }

    /// Base methods feeding the ensemble: the other enabled methods, or all
    /// of them when the ensemble is the only method configured.
    fn ensemble_members(&self) -> Vec<PredictionMethod> {
        let enabled: Vec<PredictionMethod> = self
            .config
            .methods
            .iter()
            .copied()
            .filter(|m| *m != PredictionMethod::Ensemble)
            .collect();
        if enabled.is_empty() {
            BASE_METHODS.to_vec()
        } else {
            enabled
        }
    }

    /// Forecasts every configured horizon. Empty when the series is too short.
    pub fn forecast(&self, now: DateTime<Utc>) -> BTreeMap<u64, HorizonForecast> {
        let mut out = BTreeMap::new();
        let Some(series) = self.series_view() else {
            trace!(samples = self.series.len(), "Not enough history to forecast");
            return out;
        };
        let ensemble_enabled = self.config.methods.contains(&PredictionMethod::Ensemble);
        let methods = if ensemble_enabled {
            self.ensemble_members()
        } else {
            self.config.methods.clone()
        };

        for &horizon_secs in &self.config.horizons_secs {
            let horizon = horizon_secs as f64;
            let members: Vec<GasPrediction> = methods
                .iter()
                .filter_map(|&method| {
                    let fit = series.fit(method, horizon)?;
                    let price = fit.price.max(0.0);
                    Some(GasPrediction {
                        method,
                        horizon_secs,
                        predicted_price: price,
                        confidence: series.confidence(fit.rmse, horizon),
                        range: series.range(price, fit.rmse, horizon),
                        generated_at: now,
                        stale: false,
                    })
                })
                .collect();
            if members.is_empty() {
                continue;
            }

            let served = if ensemble_enabled {
                combine(&members, self.config.ensemble_spread_tolerance, horizon_secs, now)
            } else {
                members
                    .iter()
                    .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
                    .cloned()
            };
            if let Some(served) = served {
                out.insert(horizon_secs, HorizonForecast { served, members });
            }
        }
        debug!(horizons = out.len(), samples = self.series.len(), "Gas price forecast updated");
        out
    }
}

/// Confidence-weighted combination of member predictions.
///
/// The ensemble confidence is the confidence-weighted mean of member
/// confidences, scaled down by `tolerance / disagreement` once the weighted
/// mean relative deviation from the combined price exceeds `tolerance`. It is
/// therefore never above the most confident member.
pub fn combine(
    members: &[GasPrediction],
    tolerance: f64,
    horizon_secs: u64,
    now: DateTime<Utc>,
) -> Option<GasPrediction> {
    if members.is_empty() {
        return None;
    }
    let total: f64 = members.iter().map(|m| m.confidence).sum();
    let weight = |m: &GasPrediction| {
        if total > 0.0 {
            m.confidence / total
        } else {
            1.0 / members.len() as f64
        }
    };

    let price: f64 = members.iter().map(|m| weight(m) * m.predicted_price).sum();
    let weighted_confidence: f64 = members.iter().map(|m| weight(m) * m.confidence).sum();
    let disagreement = if price > 0.0 {
        members
            .iter()
            .map(|m| weight(m) * (m.predicted_price - price).abs() / price)
            .sum()
    } else {
        0.0
    };
    let discount = if disagreement <= tolerance {
        1.0
    } else {
        tolerance / disagreement
    };

    let low = members
        .iter()
        .map(|m| weight(m) * m.range.low)
        .sum::<f64>()
        .min(members.iter().map(|m| m.predicted_price).fold(f64::INFINITY, f64::min));
    let high = members
        .iter()
        .map(|m| weight(m) * m.range.high)
        .sum::<f64>()
        .max(members.iter().map(|m| m.predicted_price).fold(f64::NEG_INFINITY, f64::max));

    Some(GasPrediction {
        method: PredictionMethod::Ensemble,
        horizon_secs,
        predicted_price: price,
        confidence: (weighted_confidence * discount).clamp(0.0, 1.0),
        range: PriceRange { low: low.max(0.0), high },
        generated_at: now,
        stale: false,
    })
}

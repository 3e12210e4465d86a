// src/stats.rs

//! Small numeric helpers shared by the gas statistics, congestion and prediction code.

/// Arithmetic mean; `0.0` for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
///
/// # Arguments
/// * `values` - The data points
/// * `mean_value` - Optional pre-calculated mean to avoid recalculation
pub fn standard_deviation(values: &[f64], mean_value: Option<f64>) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = mean_value.unwrap_or_else(|| mean(values));
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Nearest-rank percentile over an ascending slice: index `floor(n * p / 100)`,
/// capped at the last element.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = ((sorted.len() as f64 * p / 100.0).floor() as usize).min(sorted.len() - 1);
    Some(sorted[idx])
}

/// Median of an ascending slice, averaging the two middle elements for even lengths.
pub fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if n % 2 == 0 {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    } else {
        Some(sorted[n / 2])
    }
}

/// Ordinary least squares fit `y = slope * x + intercept`.
pub fn linear_regression(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let mx = mean(xs);
    let my = mean(ys);
    let mut num = 0.0;
    let mut den = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        num += (x - mx) * (y - my);
        den += (x - mx).powi(2);
    }
    if den.abs() < f64::EPSILON {
        return None;
    }
    let slope = num / den;
    Some((slope, my - slope * mx))
}

/// Least squares fit of `y = c0 + c1 x + c2 x^2`, returned as `[c0, c1, c2]`.
pub fn quadratic_regression(xs: &[f64], ys: &[f64]) -> Option<[f64; 3]> {
    if xs.len() != ys.len() || xs.len() < 3 {
        return None;
    }
    // Normal equations: sums of x^k for k in 0..=4 and x^k * y for k in 0..=2.
    let mut sx = [0.0f64; 5];
    let mut sxy = [0.0f64; 3];
    for (x, y) in xs.iter().zip(ys) {
        let mut pow = 1.0;
        for (k, slot) in sx.iter_mut().enumerate() {
            *slot += pow;
            if k < 3 {
                sxy[k] += pow * y;
            }
            pow *= x;
        }
    }
    let m = [
        [sx[0], sx[1], sx[2]],
        [sx[1], sx[2], sx[3]],
        [sx[2], sx[3], sx[4]],
    ];
    let det = det3(&m);
    if det.abs() < 1e-9 {
        return None;
    }
    let mut coeffs = [0.0; 3];
    for (col, coeff) in coeffs.iter_mut().enumerate() {
        let mut replaced = m;
        for row in 0..3 {
            replaced[row][col] = sxy[row];
        }
        *coeff = det3(&replaced) / det;
    }
    Some(coeffs)
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Root mean squared error between two equally long series.
pub fn rmse(actual: &[f64], fitted: &[f64]) -> f64 {
    if actual.is_empty() || actual.len() != fitted.len() {
        return 0.0;
    }
    let sse: f64 = actual.iter().zip(fitted).map(|(a, f)| (a - f).powi(2)).sum();
    (sse / actual.len() as f64).sqrt()
}

/// Two-sided standard normal quantile for a confidence level in (0, 1).
/// Abramowitz & Stegun 26.2.23, absolute error below 4.5e-4.
pub fn z_score(confidence_level: f64) -> f64 {
    let level = confidence_level.clamp(1e-6, 1.0 - 1e-9);
    let tail = (1.0 - level) / 2.0;
    let t = (-2.0 * tail.ln()).sqrt();
    let (c0, c1, c2) = (2.515517, 0.802853, 0.010328);
    let (d1, d2, d3) = (1.432788, 0.189269, 0.001308);
    t - (c0 + c1 * t + c2 * t * t) / (1.0 + d1 * t + d2 * t * t + d3 * t * t * t)
}

/// Exponentially weighted moving average with an explicit smoothing factor.
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    current_value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn with_alpha(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            current_value: None,
        }
    }

    pub fn add(&mut self, value: f64) -> f64 {
        let next = match self.current_value {
            Some(current) => self.alpha * value + (1.0 - self.alpha) * current,
            None => value,
        };
        self.current_value = Some(next);
        next
    }

    pub fn current(&self) -> Option<f64> {
        self.current_value
    }
}

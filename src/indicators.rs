//! Technical indicators
//!
//! Least-squares fits, correlation measures and the stochastic oscillator
//! used by the channel analyzer. All regressions run against the bar index
//! (0, 1, 2, ...) so results do not depend on the candle timestamps.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Calculate Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());
    if period == 0 {
        result.resize(values.len(), None);
        return result;
    }

    for i in 0..values.len() {
        if i + 1 < period {
            result.push(None);
        } else {
            let sum: f64 = values[i + 1 - period..=i].iter().sum();
            result.push(Some(sum / period as f64));
        }
    }

    result
}

/// Ordinary least-squares line `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearFit {
    pub fn at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Fit `values[i]` against `i`.
///
/// Returns `None` when the index variance is zero (fewer than two points).
pub fn linear_regression(values: &[f64]) -> Option<LinearFit> {
    let n = values.len() as f64;
    let (sum_x, sum_y, sum_xy, sum_x2) = values.iter().enumerate().fold(
        (0.0, 0.0, 0.0, 0.0),
        |(sx, sy, sxy, sx2), (i, &y)| {
            let x = i as f64;
            (sx + x, sy + y, sxy + x * y, sx2 + x * x)
        },
    );

    let denom = n * sum_x2 - sum_x * sum_x;
    if values.len() < 2 || denom == 0.0 {
        return None;
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    Some(LinearFit { slope, intercept })
}

/// Population standard deviation of the residuals `values[i] - fit(i)`
pub fn residual_std(values: &[f64], fit: &LinearFit) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values
        .iter()
        .enumerate()
        .map(|(i, &y)| y - fit.at(i as f64))
        .population_std_dev()
}

/// Pearson correlation between the bar index and `values`.
///
/// A constant series has no defined correlation and yields 0.
pub fn pearson(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }

    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2, mut sum_y2) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (i, &y) in values.iter().enumerate() {
        let x = i as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_x2 += x * x;
        sum_y2 += y * y;
    }

    let numerator = n * sum_xy - sum_x * sum_y;
    let variance_product = (n * sum_x2 - sum_x * sum_x) * (n * sum_y2 - sum_y * sum_y);
    if variance_product <= 0.0 {
        return 0.0;
    }
    (numerator / variance_product.sqrt()).clamp(-1.0, 1.0)
}

/// Coefficient of determination of `fit` over `values`
///
/// Zero when the series has no variance.
pub fn r_squared(values: &[f64], fit: &LinearFit) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().mean();
    let (ss_res, ss_tot) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(res, tot), (i, &y)| {
            let predicted = fit.at(i as f64);
            (res + (y - predicted).powi(2), tot + (y - mean).powi(2))
        });

    if ss_tot == 0.0 {
        return 0.0;
    }
    1.0 - ss_res / ss_tot
}

/// Scale-free trend angle in degrees.
///
/// The slope is multiplied by the window length and divided by the value
/// range, so a line that crosses the whole range over the window sits at 45°.
pub fn trend_angle_degrees(slope: f64, values: &[f64]) -> f64 {
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if values.is_empty() || range == 0.0 {
        return 0.0;
    }
    (slope * values.len() as f64 / range).atan().to_degrees()
}

/// Stochastic oscillator value pair, both in [0, 100]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OscillatorReading {
    pub k: f64,
    pub d: f64,
}

impl OscillatorReading {
    pub const NEUTRAL: OscillatorReading = OscillatorReading { k: 50.0, d: 50.0 };

    pub fn is_oversold(&self, threshold: f64) -> bool {
        self.k <= threshold && self.d <= threshold
    }

    pub fn is_overbought(&self, threshold: f64) -> bool {
        self.k >= threshold && self.d >= threshold
    }
}

impl Default for OscillatorReading {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

/// Stochastic oscillator with SMA-smoothed %K and %D
///
/// Raw %K over `period` bars is smoothed by `k_smoothing`; %D is the mean of
/// the last `d_smoothing` smoothed %K values. Returns the neutral 50/50
/// reading whenever the history is too short.
pub fn stochastic(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    period: usize,
    k_smoothing: usize,
    d_smoothing: usize,
) -> OscillatorReading {
    let len = close.len().min(high.len()).min(low.len());
    if period == 0 || k_smoothing == 0 || d_smoothing == 0 || len < period {
        return OscillatorReading::NEUTRAL;
    }

    let raw_k: Vec<f64> = (period - 1..len)
        .map(|i| {
            let window = i + 1 - period..=i;
            let highest = high[window.clone()]
                .iter()
                .fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            let lowest = low[window].iter().fold(f64::INFINITY, |a, &b| a.min(b));
            if highest == lowest {
                50.0
            } else {
                (100.0 * (close[i] - lowest) / (highest - lowest)).clamp(0.0, 100.0)
            }
        })
        .collect();

    let smoothed: Vec<f64> = sma(&raw_k, k_smoothing).into_iter().flatten().collect();
    if smoothed.len() < d_smoothing {
        return OscillatorReading::NEUTRAL;
    }

    let k = smoothed[smoothed.len() - 1];
    let d = smoothed[smoothed.len() - d_smoothing..].iter().sum::<f64>() / d_smoothing as f64;
    OscillatorReading { k, d }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sma() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = sma(&values, 3);

        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert_eq!(result[2], Some(2.0));
        assert_eq!(result[3], Some(3.0));
        assert_eq!(result[4], Some(4.0));
    }

    #[test]
    fn test_linear_regression_exact_line() {
        let values: Vec<f64> = (0..10).map(|i| 3.0 + 2.0 * i as f64).collect();
        let fit = linear_regression(&values).unwrap();
        assert_relative_eq!(fit.slope, 2.0, epsilon = 1e-9);
        assert_relative_eq!(fit.intercept, 3.0, epsilon = 1e-9);
        assert_relative_eq!(residual_std(&values, &fit), 0.0, epsilon = 1e-9);
        assert_relative_eq!(r_squared(&values, &fit), 1.0, epsilon = 1e-9);
        assert_relative_eq!(pearson(&values), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_linear_regression_degenerate() {
        assert!(linear_regression(&[]).is_none());
        assert!(linear_regression(&[5.0]).is_none());
    }

    #[test]
    fn test_residual_std_is_population() {
        // residuals of a flat fit over [1, 3] are -1 and +1
        let fit = LinearFit {
            slope: 0.0,
            intercept: 2.0,
        };
        assert_relative_eq!(residual_std(&[1.0, 3.0], &fit), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_flat_series_is_neutral() {
        let flat = vec![100.0; 20];
        assert_eq!(pearson(&flat), 0.0);
        assert_eq!(trend_angle_degrees(0.0, &flat), 0.0);
        let fit = linear_regression(&flat).unwrap();
        assert_eq!(r_squared(&flat, &fit), 0.0);
    }

    #[test]
    fn test_trend_angle_sign_follows_slope() {
        let rising: Vec<f64> = (0..50).map(|i| 100.0 + i as f64).collect();
        let fit = linear_regression(&rising).unwrap();
        let angle = trend_angle_degrees(fit.slope, &rising);
        assert!(angle > 0.0);
        // slope 1 over 50 bars spanning a range of 49
        assert_relative_eq!(angle, (50.0f64 / 49.0).atan().to_degrees(), epsilon = 1e-9);

        let falling: Vec<f64> = rising.iter().rev().copied().collect();
        let fit = linear_regression(&falling).unwrap();
        assert!(trend_angle_degrees(fit.slope, &falling) < 0.0);
        assert!(pearson(&falling) < -0.99);
    }

    #[test]
    fn test_stochastic_insufficient_history_is_neutral() {
        let values = vec![1.0; 10];
        let reading = stochastic(&values, &values, &values, 14, 3, 3);
        assert_eq!(reading, OscillatorReading::NEUTRAL);
    }

    #[test]
    fn test_stochastic_extremes() {
        // closes pinned to the lows of a falling market
        let n = 30;
        let high: Vec<f64> = (0..n).map(|i| 200.0 - i as f64).collect();
        let low: Vec<f64> = high.iter().map(|h| h - 2.0).collect();
        let close = low.clone();
        let reading = stochastic(&high, &low, &close, 14, 3, 3);
        assert_relative_eq!(reading.k, 0.0, epsilon = 1e-9);
        assert_relative_eq!(reading.d, 0.0, epsilon = 1e-9);
        assert!(reading.is_oversold(30.0));

        let high: Vec<f64> = (0..n).map(|i| 100.0 + i as f64).collect();
        let low: Vec<f64> = high.iter().map(|h| h - 2.0).collect();
        let close = high.clone();
        let reading = stochastic(&high, &low, &close, 14, 3, 3);
        assert_relative_eq!(reading.k, 100.0, epsilon = 1e-9);
        assert!(reading.is_overbought(70.0));
    }

    #[test]
    fn test_stochastic_flat_window_is_fifty() {
        let values = vec![10.0; 20];
        let reading = stochastic(&values, &values, &values, 14, 3, 3);
        assert_relative_eq!(reading.k, 50.0);
        assert_relative_eq!(reading.d, 50.0);
    }
}

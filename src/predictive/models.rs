//! Short-horizon request forecasts.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::profile::ClientBehaviorProfile;
use crate::error::{RampartError, Result};

/// Buckets used by the bucketed models.
const SERIES_BUCKETS: usize = 10;
/// Smoothing factor for exponential smoothing.
const ALPHA: f64 = 0.3;
/// Client share of the seasonal blend.
const SEASONAL_CLIENT_WEIGHT: f64 = 0.6;

/// Forecast algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionModel {
    MovingAverage,
    ExponentialSmoothing,
    LinearRegression,
    Seasonal,
    AdaptiveThreshold,
}

impl PredictionModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionModel::MovingAverage => "moving_average",
            PredictionModel::ExponentialSmoothing => "exponential_smoothing",
            PredictionModel::LinearRegression => "linear_regression",
            PredictionModel::Seasonal => "seasonal",
            PredictionModel::AdaptiveThreshold => "adaptive_threshold",
        }
    }
}

/// Expected requests in the next window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted: f64,
    /// In `[0, 1]`
    pub confidence: f64,
}

impl Prediction {
    /// Used whenever a model cannot produce a forecast.
    pub fn fallback() -> Self {
        Self {
            predicted: 0.0,
            confidence: 0.1,
        }
    }

    fn new(predicted: f64, confidence: f64) -> Self {
        Self {
            predicted: predicted.max(0.0),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// What a model can see.
pub struct ModelInput<'a> {
    pub profile: &'a ClientBehaviorProfile,
    pub now: DateTime<Utc>,
    /// Forecast horizon
    pub window: Duration,
    /// Series bucket width
    pub bucket: Duration,
    /// Recent per-minute rate of the category, per active client
    pub category_rate: f64,
}

impl ModelInput<'_> {
    fn window_minutes(&self) -> f64 {
        self.window.num_milliseconds() as f64 / 60_000.0
    }

    fn buckets_per_window(&self) -> f64 {
        self.window.num_milliseconds() as f64 / self.bucket.num_milliseconds().max(1) as f64
    }

    fn rate_per_minute(&self, minutes: i64) -> f64 {
        let cutoff = self.now - Duration::minutes(minutes);
        self.profile.count_since(cutoff) as f64 / minutes as f64
    }

    fn series(&self) -> Vec<f64> {
        self.profile
            .bucket_counts(self.now, self.bucket, SERIES_BUCKETS)
    }
}

/// Run a model.
pub fn predict(model: PredictionModel, input: &ModelInput<'_>) -> Result<Prediction> {
    match model {
        PredictionModel::MovingAverage => moving_average(input),
        PredictionModel::ExponentialSmoothing => exponential_smoothing(input),
        PredictionModel::LinearRegression => linear_regression(input),
        PredictionModel::Seasonal => seasonal(input),
        PredictionModel::AdaptiveThreshold => adaptive_threshold(input),
    }
}

fn insufficient(model: PredictionModel, detail: &str) -> RampartError {
    RampartError::Prediction(format!("{}: {}", model.as_str(), detail))
}

/// 5, 10 and 30 minute rates weighted 3:2:1.
fn moving_average(input: &ModelInput<'_>) -> Result<Prediction> {
    let recent = input.profile.count_since(input.now - Duration::minutes(30));
    if recent == 0 {
        return Err(insufficient(PredictionModel::MovingAverage, "no recent requests"));
    }

    let rate = (3.0 * input.rate_per_minute(5)
        + 2.0 * input.rate_per_minute(10)
        + input.rate_per_minute(30))
        / 6.0;
    let confidence = (0.3 + recent as f64 / 50.0).min(0.9);
    Ok(Prediction::new(rate * input.window_minutes(), confidence))
}

fn exponential_smoothing(input: &ModelInput<'_>) -> Result<Prediction> {
    let series = input.series();
    if series.iter().all(|c| *c == 0.0) {
        return Err(insufficient(
            PredictionModel::ExponentialSmoothing,
            "empty series",
        ));
    }

    let mut level = series[0];
    let mut abs_error = 0.0;
    for value in &series[1..] {
        abs_error += (value - level).abs();
        level = ALPHA * value + (1.0 - ALPHA) * level;
    }

    let mean = series.iter().sum::<f64>() / series.len() as f64;
    let mae = abs_error / (series.len() - 1) as f64;
    let confidence = (1.0 - mae / (mean + 1.0)).clamp(0.1, 0.9);
    Ok(Prediction::new(level * input.buckets_per_window(), confidence))
}

/// Ordinary least squares over the bucket series, extrapolated one bucket.
fn linear_regression(input: &ModelInput<'_>) -> Result<Prediction> {
    let series = input.series();
    let active = series.iter().filter(|c| **c > 0.0).count();
    if active < 3 {
        return Err(insufficient(
            PredictionModel::LinearRegression,
            "fewer than 3 active buckets",
        ));
    }

    let n = series.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = series.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, y) in series.iter().enumerate() {
        let dx = i as f64 - mean_x;
        sxy += dx * (y - mean_y);
        sxx += dx * dx;
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let residual_variance = series
        .iter()
        .enumerate()
        .map(|(i, y)| (y - (intercept + slope * i as f64)).powi(2))
        .sum::<f64>()
        / (n - 2.0);

    let next = intercept + slope * n;
    let confidence = (1.0 / (1.0 + residual_variance / (mean_y + 1.0))).clamp(0.1, 0.9);
    Ok(Prediction::new(next * input.buckets_per_window(), confidence))
}

/// The client's rate for this hour and weekday blended with the category's
/// recent rate.
fn seasonal(input: &ModelInput<'_>) -> Result<Prediction> {
    let profile = input.profile;
    if profile.days_observed == 0 {
        return Err(insufficient(PredictionModel::Seasonal, "no observed days"));
    }

    let days = profile.days_observed as f64;
    let weeks = (days / 7.0).max(1.0);
    let hour_rate = profile.hourly[input.now.hour() as usize] as f64 / (days * 60.0);
    let day_rate =
        profile.daily[input.now.weekday().num_days_from_monday() as usize] as f64 / (weeks * 1440.0);
    let client_rate = (hour_rate + day_rate) / 2.0;

    let rate =
        SEASONAL_CLIENT_WEIGHT * client_rate + (1.0 - SEASONAL_CLIENT_WEIGHT) * input.category_rate;
    let confidence = (0.2 + 0.1 * days).min(0.8);
    Ok(Prediction::new(rate * input.window_minutes(), confidence))
}

/// Window over mean interval, adjusted up to 30% by interval dispersion.
fn adaptive_threshold(input: &ModelInput<'_>) -> Result<Prediction> {
    let stats = input
        .profile
        .interval_stats(2)
        .ok_or_else(|| insufficient(PredictionModel::AdaptiveThreshold, "too few intervals"))?;
    if stats.mean <= 0.0 {
        return Err(insufficient(
            PredictionModel::AdaptiveThreshold,
            "zero mean interval",
        ));
    }

    let cov = stats.cov();
    let expected = input.window.num_milliseconds() as f64 / 1000.0 / stats.mean;
    let factor = 1.0 + 0.3 * (cov - 1.0).clamp(-1.0, 1.0);
    let confidence = (1.0 / (1.0 + cov)).clamp(0.1, 0.9);
    Ok(Prediction::new(expected * factor, confidence))
}

//! Fallible statistics over a window of readings.
//!
//! Each function returns [`StatsError`] instead of a non-finite number so the
//! aggregator can substitute a neutral value for the one statistic that
//! failed without discarding the rest of the snapshot.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum StatsError {
    #[error("insufficient data: need {needed} samples, have {have}")]
    InsufficientData { needed: usize, have: usize },

    #[error("{0} is not finite")]
    NonFinite(&'static str),

    #[error("regression is degenerate (zero variance in x)")]
    Degenerate,
}

fn finite(name: &'static str, value: f64) -> Result<f64, StatsError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(StatsError::NonFinite(name))
    }
}

fn non_empty(data: &[f64]) -> Result<(), StatsError> {
    if data.is_empty() {
        return Err(StatsError::InsufficientData { needed: 1, have: 0 });
    }
    Ok(())
}

pub fn mean(data: &[f64]) -> Result<f64, StatsError> {
    non_empty(data)?;
    finite("mean", data.iter().sum::<f64>() / data.len() as f64)
}

/// Population standard deviation.
pub fn std_dev(data: &[f64]) -> Result<f64, StatsError> {
    let m = mean(data)?;
    let variance = data.iter().map(|&x| (x - m).powi(2)).sum::<f64>() / data.len() as f64;
    finite("std", variance.sqrt())
}

/// Sample (n - 1) standard deviation.
pub fn sample_std_dev(data: &[f64]) -> Result<f64, StatsError> {
    if data.len() < 2 {
        return Err(StatsError::InsufficientData {
            needed: 2,
            have: data.len(),
        });
    }
    let m = mean(data)?;
    let variance = data.iter().map(|&x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    finite("sample std", variance.sqrt())
}

pub fn min(data: &[f64]) -> Result<f64, StatsError> {
    non_empty(data)?;
    finite("min", data.iter().copied().fold(f64::INFINITY, f64::min))
}

pub fn max(data: &[f64]) -> Result<f64, StatsError> {
    non_empty(data)?;
    finite("max", data.iter().copied().fold(f64::NEG_INFINITY, f64::max))
}

pub fn rms(data: &[f64]) -> Result<f64, StatsError> {
    non_empty(data)?;
    let mean_sq = data.iter().map(|&x| x * x).sum::<f64>() / data.len() as f64;
    finite("rms", mean_sq.sqrt())
}

/// Sort a copy of `data` for repeated percentile lookups.
pub fn sorted(data: &[f64]) -> Vec<f64> {
    let mut v = data.to_vec();
    v.sort_by(f64::total_cmp);
    v
}

/// Percentile `q` in `[0, 100]` of already-sorted data, with linear
/// interpolation between closest ranks.
pub fn percentile_sorted(sorted: &[f64], q: f64) -> Result<f64, StatsError> {
    non_empty(sorted)?;
    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    finite("percentile", sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn percentile(data: &[f64], q: f64) -> Result<f64, StatsError> {
    percentile_sorted(&sorted(data), q)
}

/// Least-squares slope of the readings against their index.
pub fn trend(data: &[f64]) -> Result<f64, StatsError> {
    let n = data.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for (i, &y) in data.iter().enumerate() {
        let x = i as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }
    let denom = n * sum_xx - sum_x * sum_x;
    if denom == 0.0 {
        return Err(StatsError::Degenerate);
    }
    finite("trend", (n * sum_xy - sum_x * sum_y) / denom)
}

/// Mean of the population standard deviations of consecutive sub-windows of
/// length `min(10, n / 2)`.
pub fn volatility(data: &[f64]) -> Result<f64, StatsError> {
    if data.len() < 5 {
        return Ok(0.0);
    }
    let width = (data.len() / 2).min(10);
    let mut total = 0.0;
    let mut count = 0usize;
    for end in width..data.len() {
        total += std_dev(&data[end - width..end])?;
        count += 1;
    }
    if count == 0 {
        return Ok(0.0);
    }
    finite("volatility", total / count as f64)
}

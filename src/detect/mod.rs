//! Online anomaly detection.
//!
//! The detector keeps one state per sensor and blends up to three scores:
//! a statistical score over the sensor's recent readings, an isolation-forest
//! score once enough samples have been collected, and a score relative to the
//! latest window snapshot.

pub mod detector;
pub mod forest;
pub mod scorer;

pub use detector::{AnomalyDetector, DetectionCounters};
pub use forest::IsolationForestScorer;
pub use scorer::{OutlierScorer, StatisticalScorer};

use thiserror::Error;

use crate::window::stats::StatsError;

#[derive(Debug, Error, PartialEq)]
pub enum DetectError {
    #[error("insufficient baseline data: need {needed} samples, have {have}")]
    InsufficientBaseline { needed: usize, have: usize },

    #[error("scorer has not been fitted")]
    NotFitted,

    #[error("non-finite input: {0}")]
    NonFinite(f64),

    #[error(transparent)]
    Stats(#[from] StatsError),
}

/// Lifecycle of a sensor inside the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorPhase {
    /// No reading seen yet.
    Uninitialized,
    /// Gathering samples; only the statistical score is available.
    Collecting,
    /// The trainable scorer has been fitted at least once.
    Active,
}

use crate::detect::DetectError;
use crate::window::stats;

/// Something that can be fitted to a baseline and then score single readings.
///
/// Scores are in `[0, 1]`, higher meaning more anomalous.
pub trait OutlierScorer: Send {
    fn fit(&mut self, samples: &[f64]) -> Result<(), DetectError>;

    fn score(&self, value: f64) -> Result<f64, DetectError>;
}

/// Z-score plus interquartile-range fence. Refitting is a single pass over
/// the baseline, so it is refreshed on every reading.
#[derive(Debug, Clone)]
pub struct StatisticalScorer {
    z_threshold: f64,
    iqr_factor: f64,
    baseline: Option<Baseline>,
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    mean: f64,
    std_dev: f64,
    lower_fence: f64,
    upper_fence: f64,
}

impl StatisticalScorer {
    /// Samples needed before a score is produced.
    pub const MIN_SAMPLES: usize = 10;

    pub fn new(z_threshold: f64, iqr_factor: f64) -> Self {
        Self {
            z_threshold,
            iqr_factor,
            baseline: None,
        }
    }
}

impl Default for StatisticalScorer {
    fn default() -> Self {
        Self::new(3.0, 1.5)
    }
}

impl OutlierScorer for StatisticalScorer {
    fn fit(&mut self, samples: &[f64]) -> Result<(), DetectError> {
        if samples.len() < Self::MIN_SAMPLES {
            self.baseline = None;
            return Err(DetectError::InsufficientBaseline {
                needed: Self::MIN_SAMPLES,
                have: samples.len(),
            });
        }
        let mean = stats::mean(samples)?;
        let std_dev = stats::sample_std_dev(samples)?;
        let sorted = stats::sorted(samples);
        let q1 = stats::percentile_sorted(&sorted, 25.0)?;
        let q3 = stats::percentile_sorted(&sorted, 75.0)?;
        let iqr = q3 - q1;

        self.baseline = Some(Baseline {
            mean,
            std_dev,
            lower_fence: q1 - self.iqr_factor * iqr,
            upper_fence: q3 + self.iqr_factor * iqr,
        });
        Ok(())
    }

    fn score(&self, value: f64) -> Result<f64, DetectError> {
        let b = self.baseline.ok_or(DetectError::NotFitted)?;
        if !value.is_finite() {
            return Err(DetectError::NonFinite(value));
        }
        let z = if b.std_dev > 0.0 {
            (value - b.mean).abs() / b.std_dev
        } else {
            0.0
        };
        let outside_fence = value < b.lower_fence || value > b.upper_fence;
        let fence_score = if outside_fence { 1.0 } else { 0.0 };
        Ok((z / self.z_threshold).min(1.0) * 0.7 + fence_score * 0.3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> Vec<f64> {
        (0..100).map(|i| (i % 10) as f64).collect()
    }

    #[test]
    fn test_unfitted_scorer_errors() {
        let scorer = StatisticalScorer::default();
        assert_eq!(scorer.score(1.0), Err(DetectError::NotFitted));
    }

    #[test]
    fn test_needs_ten_samples() {
        let mut scorer = StatisticalScorer::default();
        assert!(matches!(
            scorer.fit(&[1.0; 9]),
            Err(DetectError::InsufficientBaseline { needed: 10, have: 9 })
        ));
        assert!(scorer.fit(&[1.0; 10]).is_ok());
    }

    #[test]
    fn test_typical_value_scores_low() {
        let mut scorer = StatisticalScorer::default();
        scorer.fit(&baseline()).unwrap();
        let s = scorer.score(4.5).unwrap();
        assert!(s < 0.05, "score {s}");
    }

    #[test]
    fn test_extreme_value_scores_one() {
        let mut scorer = StatisticalScorer::default();
        scorer.fit(&baseline()).unwrap();
        assert_eq!(scorer.score(100.0).unwrap(), 1.0);
    }

    #[test]
    fn test_constant_baseline_has_no_z_component() {
        let mut scorer = StatisticalScorer::default();
        scorer.fit(&[2.0; 20]).unwrap();
        assert_eq!(scorer.score(2.0).unwrap(), 0.0);
        // Outside the zero-width fence, but std is zero.
        assert_eq!(scorer.score(3.0).unwrap(), 0.3);
    }
}

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DetectorConfig;
use crate::data::StreamData;
use crate::detect::forest::IsolationForestScorer;
use crate::detect::scorer::{OutlierScorer, StatisticalScorer};
use crate::detect::{DetectError, DetectorPhase};
use crate::window::{WindowStatistics, WindowStatsReport};

const INITIAL_THRESHOLD: f64 = 0.6;
const MIN_THRESHOLD: f64 = 0.3;
const MAX_THRESHOLD: f64 = 0.9;
const THRESHOLD_STEP: f64 = 0.1;
/// Readings per sensor before the threshold starts adapting.
const CALIBRATION_MIN_POINTS: u64 = 100;
/// Seed used for model construction when none is configured.
const DEFAULT_MODEL_SEED: u64 = 42;

/// Per-sensor detection counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionCounters {
    pub total_points: u64,
    pub anomalies_detected: u64,
    pub threshold: f64,
    pub phase: DetectorPhase,
}

struct DetectorState {
    training: VecDeque<f64>,
    samples_seen: u64,
    /// Readings appended since the last fit attempt.
    samples_since_fit: usize,
    statistical: StatisticalScorer,
    model: Option<Box<dyn OutlierScorer>>,
    model_fitted: bool,
    threshold: f64,
    total_points: u64,
    anomalies_detected: u64,
}

impl DetectorState {
    fn new(window_size: usize, model: Option<Box<dyn OutlierScorer>>) -> Self {
        Self {
            training: VecDeque::with_capacity(window_size),
            samples_seen: 0,
            samples_since_fit: 0,
            statistical: StatisticalScorer::default(),
            model,
            model_fitted: false,
            threshold: INITIAL_THRESHOLD,
            total_points: 0,
            anomalies_detected: 0,
        }
    }

    fn phase(&self, min_training_samples: usize) -> DetectorPhase {
        let ready = match self.model {
            Some(_) => self.model_fitted,
            None => self.training.len() >= min_training_samples,
        };
        if ready {
            DetectorPhase::Active
        } else {
            DetectorPhase::Collecting
        }
    }

    fn counters(&self, min_training_samples: usize) -> DetectionCounters {
        DetectionCounters {
            total_points: self.total_points,
            anomalies_detected: self.anomalies_detected,
            threshold: self.threshold,
            phase: self.phase(min_training_samples),
        }
    }

    /// Nudge the threshold toward the configured contamination rate.
    fn recalibrate(&mut self, contamination: f64) {
        if self.total_points <= CALIBRATION_MIN_POINTS {
            return;
        }
        let rate = self.anomalies_detected as f64 / self.total_points as f64;
        if rate > contamination * 2.0 {
            self.threshold = (self.threshold + THRESHOLD_STEP).min(MAX_THRESHOLD);
        } else if rate < contamination * 0.5 {
            self.threshold = (self.threshold - THRESHOLD_STEP).max(MIN_THRESHOLD);
        }
    }
}

/// Ensemble anomaly detector with one state per sensor.
pub struct AnomalyDetector {
    contamination: f64,
    window_size: usize,
    min_training_samples: usize,
    retrain_interval: usize,
    model_scorer: bool,
    seed: u64,
    states: RwLock<HashMap<String, Arc<Mutex<DetectorState>>>>,
}

impl AnomalyDetector {
    pub fn new(config: &DetectorConfig, window_size: usize, seed: Option<u64>) -> Self {
        Self {
            contamination: config.contamination,
            window_size,
            min_training_samples: config.min_training_samples,
            retrain_interval: config.retrain_interval,
            model_scorer: config.model_scorer,
            seed: seed.unwrap_or(DEFAULT_MODEL_SEED),
            states: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, sensor_id: &str) -> Arc<Mutex<DetectorState>> {
        if let Some(state) = self
            .states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sensor_id)
        {
            return Arc::clone(state);
        }

        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(sensor_id.to_string()).or_insert_with(|| {
            debug!(sensor_id, "initializing detector state");
            let model = self.model_scorer.then(|| {
                let seed = self.seed ^ sensor_seed(sensor_id);
                Box::new(IsolationForestScorer::new(self.contamination, seed))
                    as Box<dyn OutlierScorer>
            });
            Arc::new(Mutex::new(DetectorState::new(self.window_size, model)))
        });
        Arc::clone(state)
    }

    /// Score a reading and decide whether it is anomalous.
    ///
    /// Sub-scorer failures contribute 0.0 and are logged; this never fails.
    pub fn detect_anomaly(
        &self,
        data: &StreamData,
        window_stats: Option<&WindowStatsReport>,
    ) -> (bool, f64) {
        let entry = self.entry(&data.sensor_id);
        let mut guard = entry.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        let sensor_id = data.sensor_id.as_str();
        let value = data.value;

        self.observe(sensor_id, state, value);

        let mut scores: Vec<f64> = Vec::with_capacity(3);

        if state.training.len() >= StatisticalScorer::MIN_SAMPLES {
            let samples = state.training.make_contiguous();
            let result = state
                .statistical
                .fit(samples)
                .and_then(|_| state.statistical.score(value));
            scores.push(contribution(sensor_id, "statistical", result));
        }

        if let Some(model) = state.model.as_ref().filter(|_| state.model_fitted) {
            scores.push(contribution(sensor_id, "model", model.score(value)));
        }

        if let Some(report) = window_stats {
            scores.push(contribution(
                sensor_id,
                "window",
                window_score(value, &report.statistics),
            ));
        }

        let score = if scores.is_empty() {
            0.0
        } else {
            (scores.iter().sum::<f64>() / scores.len() as f64).clamp(0.0, 1.0)
        };

        state.recalibrate(self.contamination);
        let is_anomaly = score > state.threshold;

        state.total_points += 1;
        if is_anomaly {
            state.anomalies_detected += 1;
        }

        (is_anomaly, score)
    }

    /// Append to the training buffer and (re)fit the trainable scorer when due.
    fn observe(&self, sensor_id: &str, state: &mut DetectorState, value: f64) {
        if !value.is_finite() {
            warn!(sensor_id, value, "non-finite reading excluded from training data");
        } else {
            if state.training.len() == self.window_size {
                state.training.pop_front();
            }
            state.training.push_back(value);
            state.samples_seen += 1;
            state.samples_since_fit += 1;
        }

        let Some(model) = state.model.as_mut() else {
            return;
        };

        let due = if state.model_fitted {
            state.samples_seen >= self.window_size as u64
                && state.samples_since_fit >= self.retrain_interval
        } else {
            state.samples_since_fit >= self.min_training_samples
        };
        if !due {
            return;
        }

        state.samples_since_fit = 0;
        let samples = state.training.make_contiguous();
        match model.fit(samples) {
            Ok(()) => {
                if !state.model_fitted {
                    info!(sensor_id, samples = samples.len(), "detector model trained");
                } else {
                    debug!(sensor_id, samples = samples.len(), "detector model retrained");
                }
                state.model_fitted = true;
            }
            Err(e) => {
                warn!(sensor_id, error = %e, "detector model training failed");
            }
        }
    }

    pub fn phase(&self, sensor_id: &str) -> DetectorPhase {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
        match states.get(sensor_id) {
            Some(state) => state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .phase(self.min_training_samples),
            None => DetectorPhase::Uninitialized,
        }
    }

    pub fn threshold(&self, sensor_id: &str) -> Option<f64> {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
        let state = states.get(sensor_id)?;
        let threshold = state.lock().unwrap_or_else(PoisonError::into_inner).threshold;
        Some(threshold)
    }

    /// Counters for every sensor seen so far, ordered by sensor id.
    pub fn detection_statistics(&self) -> BTreeMap<String, DetectionCounters> {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
        states
            .iter()
            .map(|(id, state)| {
                let counters = state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .counters(self.min_training_samples);
                (id.clone(), counters)
            })
            .collect()
    }
}

fn contribution(sensor_id: &str, scorer: &'static str, result: Result<f64, DetectError>) -> f64 {
    match result {
        Ok(score) => score.clamp(0.0, 1.0),
        Err(e) => {
            warn!(sensor_id, scorer, error = %e, "anomaly sub-scorer failed, contributing 0.0");
            0.0
        }
    }
}

/// Deviation from the latest window snapshot, blended with how far the
/// reading falls outside the window's range.
fn window_score(value: f64, stats: &WindowStatistics) -> Result<f64, DetectError> {
    if !value.is_finite() {
        return Err(DetectError::NonFinite(value));
    }
    let deviation = if stats.std > 0.0 {
        (value - stats.mean).abs() / stats.std / 3.0
    } else {
        0.0
    };
    let range = stats.max - stats.min;
    let out_of_range = if range > 0.0 && (value < stats.min || value > stats.max) {
        (value - stats.min).abs().min((value - stats.max).abs()) / range
    } else {
        0.0
    };
    Ok((deviation * 0.8 + out_of_range * 0.2).min(1.0))
}

/// FNV-1a over the sensor id, so each sensor's forest gets its own stream.
fn sensor_seed(sensor_id: &str) -> u64 {
    sensor_id.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn detector(model_scorer: bool) -> AnomalyDetector {
        let config = DetectorConfig {
            model_scorer,
            ..DetectorConfig::default()
        };
        AnomalyDetector::new(&config, 1000, Some(42))
    }

    fn reading(value: f64) -> StreamData {
        StreamData::new("displacement_1", value)
    }

    #[test]
    fn test_phase_transitions() {
        let det = detector(true);
        assert_eq!(det.phase("displacement_1"), DetectorPhase::Uninitialized);

        for i in 0..49 {
            det.detect_anomaly(&reading((i % 7) as f64), None);
        }
        assert_eq!(det.phase("displacement_1"), DetectorPhase::Collecting);

        det.detect_anomaly(&reading(3.0), None);
        assert_eq!(det.phase("displacement_1"), DetectorPhase::Active);
    }

    #[test]
    fn test_no_score_before_ten_samples() {
        let det = detector(true);
        for _ in 0..9 {
            let (is_anomaly, score) = det.detect_anomaly(&reading(1e9), None);
            assert!(!is_anomaly);
            assert_eq!(score, 0.0);
        }
    }

    #[test]
    fn test_statistical_only_when_model_disabled() {
        let det = detector(false);
        let baseline: Vec<f64> = (0..100).map(|i| (i % 10) as f64).collect();
        for &v in &baseline {
            det.detect_anomaly(&reading(v), None);
        }
        let (is_anomaly, score) = det.detect_anomaly(&reading(500.0), None);
        assert!(is_anomaly);
        assert_eq!(score, 1.0);
        assert_eq!(det.phase("displacement_1"), DetectorPhase::Active);
    }

    #[test]
    fn test_detects_injected_outlier() {
        let det = detector(true);
        let mut rng = StdRng::seed_from_u64(5);
        let normal = Normal::new(0.0, 1.0).unwrap();
        for _ in 0..300 {
            det.detect_anomaly(&reading(normal.sample(&mut rng)), None);
        }
        let (is_anomaly, score) = det.detect_anomaly(&reading(25.0), None);
        assert!(is_anomaly, "score {score}");
        assert!(score > 0.5);

        let (is_anomaly, score) = det.detect_anomaly(&reading(0.1), None);
        assert!(!is_anomaly, "score {score}");
    }

    #[test]
    fn test_threshold_bounded_for_all_normal_stream() {
        let det = detector(true);
        let mut rng = StdRng::seed_from_u64(11);
        let normal = Normal::new(0.0, 1.0).unwrap();
        for _ in 0..1500 {
            det.detect_anomaly(&reading(normal.sample(&mut rng)), None);
            let t = det.threshold("displacement_1").unwrap();
            assert!((MIN_THRESHOLD..=MAX_THRESHOLD).contains(&t), "threshold {t}");
        }
        // Almost nothing is flagged, so the threshold relaxes to its floor.
        assert!((det.threshold("displacement_1").unwrap() - MIN_THRESHOLD).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_bounded_for_all_anomalous_stream() {
        let det = detector(false);
        // Every reading is a new extreme.
        for i in 0..150 {
            det.detect_anomaly(&reading(1.5f64.powi(i)), None);
            let t = det.threshold("displacement_1").unwrap();
            assert!((MIN_THRESHOLD..=MAX_THRESHOLD).contains(&t), "threshold {t}");
        }
        assert_eq!(det.threshold("displacement_1").unwrap(), MAX_THRESHOLD);
        let stats = det.detection_statistics();
        let counters = &stats["displacement_1"];
        assert_eq!(counters.total_points, 150);
        assert!(counters.anomalies_detected > 100);
    }

    #[test]
    fn test_window_score_joins_ensemble() {
        let det = detector(false);
        for i in 0..20 {
            det.detect_anomaly(&reading((i % 4) as f64), None);
        }
        let report = WindowStatsReport {
            sensor_id: "displacement_1".into(),
            timestamp: Utc::now(),
            window_len: 20,
            statistics: WindowStatistics {
                mean: 1.5,
                std: 1.0,
                min: 0.0,
                max: 3.0,
                ..WindowStatistics::default()
            },
        };
        let (_, without) = det.detect_anomaly(&reading(1.5), None);
        let (_, with) = det.detect_anomaly(&reading(1.5), Some(&report));
        // Window score is zero at the mean, so averaging it in halves the score.
        assert!((with - without / 2.0).abs() < 0.05);
    }

    #[test]
    fn test_window_score_formula() {
        let stats = WindowStatistics {
            mean: 0.0,
            std: 1.0,
            min: -2.0,
            max: 2.0,
            ..WindowStatistics::default()
        };
        // 0.8 * (1.5 / 3)
        assert!((window_score(1.5, &stats).unwrap() - 0.4).abs() < 1e-12);
        assert_eq!(window_score(100.0, &stats).unwrap(), 1.0);
        assert!(window_score(f64::NAN, &stats).is_err());
    }

    #[test]
    fn test_non_finite_reading_is_contained() {
        let det = detector(true);
        for i in 0..60 {
            det.detect_anomaly(&reading(i as f64), None);
        }
        let (is_anomaly, score) = det.detect_anomaly(&reading(f64::NAN), None);
        assert!(!is_anomaly);
        assert_eq!(score, 0.0);
        // The NaN never entered the baseline.
        let (_, score) = det.detect_anomaly(&reading(30.0), None);
        assert!(score.is_finite());
    }

    #[test]
    fn test_concurrent_updates_are_serialized() {
        let det = Arc::new(detector(true));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let det = Arc::clone(&det);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        det.detect_anomaly(&reading(((t + i) % 13) as f64), None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = det.detection_statistics();
        assert_eq!(stats["displacement_1"].total_points, 1000);
    }
}

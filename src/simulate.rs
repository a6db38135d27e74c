//! Seeded synthetic sensor streams.
//!
//! Readings are drawn from N(0, 1) with a configurable fraction replaced by
//! N(0, 10) outliers. Injected outliers carry `injected = "outlier"` in their
//! metadata so detection quality can be measured afterwards.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, NormalError};
use serde::Serialize;
use thiserror::Error;

use crate::data::{ProcessingResult, StreamData};

/// Sensor ids of the deep-excavation monitoring demo.
pub const EXCAVATION_SENSORS: [&str; 7] = [
    "displacement_sensor_1",
    "displacement_sensor_2",
    "inclinometer_1",
    "strain_gauge_1",
    "piezometer_1",
    "settlement_marker_1",
    "temperature_sensor_1",
];

pub const INJECTED_KEY: &str = "injected";
pub const INJECTED_OUTLIER: &str = "outlier";

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("outlier rate must be within [0, 1], got {0}")]
    InvalidOutlierRate(f64),

    #[error("at least one sensor id is required")]
    NoSensors,

    #[error(transparent)]
    Distribution(#[from] NormalError),
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub points: usize,
    pub sensors: Vec<String>,
    pub outlier_rate: f64,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            points: 10_000,
            sensors: EXCAVATION_SENSORS.iter().map(|s| s.to_string()).collect(),
            outlier_rate: 0.05,
            seed: 42,
        }
    }
}

/// Iterator over synthetic readings, sensors taken round-robin.
pub struct SensorStream {
    rng: StdRng,
    normal: Normal<f64>,
    spike: Normal<f64>,
    sensors: Vec<String>,
    outlier_rate: f64,
    emitted: usize,
    total: usize,
}

impl SensorStream {
    pub fn new(config: &SimulationConfig) -> Result<Self, SimulationError> {
        if !(0.0..=1.0).contains(&config.outlier_rate) {
            return Err(SimulationError::InvalidOutlierRate(config.outlier_rate));
        }
        if config.sensors.is_empty() {
            return Err(SimulationError::NoSensors);
        }
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            normal: Normal::new(0.0, 1.0)?,
            spike: Normal::new(0.0, 10.0)?,
            sensors: config.sensors.clone(),
            outlier_rate: config.outlier_rate,
            emitted: 0,
            total: config.points,
        })
    }
}

impl Iterator for SensorStream {
    type Item = StreamData;

    fn next(&mut self) -> Option<StreamData> {
        if self.emitted >= self.total {
            return None;
        }
        let sensor_id = &self.sensors[self.emitted % self.sensors.len()];
        self.emitted += 1;

        let data = if self.rng.gen_bool(self.outlier_rate) {
            StreamData::new(sensor_id.as_str(), self.spike.sample(&mut self.rng))
                .with_metadata(INJECTED_KEY, INJECTED_OUTLIER)
        } else {
            StreamData::new(sensor_id.as_str(), self.normal.sample(&mut self.rng))
        };
        Some(data)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.emitted;
        (left, Some(left))
    }
}

pub fn generate(config: &SimulationConfig) -> Result<Vec<StreamData>, SimulationError> {
    Ok(SensorStream::new(config)?.collect())
}

pub fn is_injected(data: &StreamData) -> bool {
    data.metadata.get(INJECTED_KEY).map(String::as_str) == Some(INJECTED_OUTLIER)
}

/// Confusion counts of flagged results against injected outliers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DetectionQuality {
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub true_negatives: u64,
}

impl DetectionQuality {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a ProcessingResult>) -> Self {
        let mut q = Self::default();
        for r in results {
            match (is_injected(&r.data), r.is_anomaly) {
                (true, true) => q.true_positives += 1,
                (false, true) => q.false_positives += 1,
                (true, false) => q.false_negatives += 1,
                (false, false) => q.true_negatives += 1,
            }
        }
        q
    }

    pub fn precision(&self) -> f64 {
        let flagged = self.true_positives + self.false_positives;
        if flagged == 0 {
            return 0.0;
        }
        self.true_positives as f64 / flagged as f64
    }

    pub fn recall(&self) -> f64 {
        let injected = self.true_positives + self.false_negatives;
        if injected == 0 {
            return 0.0;
        }
        self.true_positives as f64 / injected as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::data::ResultStage;

    #[test]
    fn test_stream_is_seeded() {
        let config = SimulationConfig {
            points: 200,
            ..SimulationConfig::default()
        };
        let a: Vec<(String, f64)> = generate(&config)
            .unwrap()
            .into_iter()
            .map(|d| (d.sensor_id, d.value))
            .collect();
        let b: Vec<(String, f64)> = generate(&config)
            .unwrap()
            .into_iter()
            .map(|d| (d.sensor_id, d.value))
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_round_robin_and_outlier_share() {
        let config = SimulationConfig::default();
        let data = generate(&config).unwrap();
        assert_eq!(data.len(), 10_000);

        let mut per_sensor: HashMap<&str, usize> = HashMap::new();
        for d in &data {
            *per_sensor.entry(d.sensor_id.as_str()).or_default() += 1;
        }
        assert_eq!(per_sensor.len(), 7);
        assert!(per_sensor.values().all(|&n| n == 1428 || n == 1429));

        let injected = data.iter().filter(|d| is_injected(d)).count();
        assert!((350..650).contains(&injected), "injected {injected}");
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let bad_rate = SimulationConfig {
            outlier_rate: 1.5,
            ..SimulationConfig::default()
        };
        assert!(matches!(
            SensorStream::new(&bad_rate),
            Err(SimulationError::InvalidOutlierRate(_))
        ));

        let no_sensors = SimulationConfig {
            sensors: Vec::new(),
            ..SimulationConfig::default()
        };
        assert!(matches!(
            SensorStream::new(&no_sensors),
            Err(SimulationError::NoSensors)
        ));
    }

    #[test]
    fn test_detection_quality() {
        let result = |injected: bool, is_anomaly: bool| {
            let mut data = StreamData::new("s", 0.0);
            if injected {
                data = data.with_metadata(INJECTED_KEY, INJECTED_OUTLIER);
            }
            ProcessingResult {
                data,
                processed_value: 0.0,
                anomaly_score: 0.0,
                is_anomaly,
                processing_time: Duration::ZERO,
                stage: ResultStage::Complete,
            }
        };
        let results = vec![
            result(true, true),
            result(true, false),
            result(false, true),
            result(false, false),
            result(false, false),
        ];
        let q = DetectionQuality::from_results(&results);
        assert_eq!(q.true_positives, 1);
        assert_eq!(q.true_negatives, 2);
        assert!((q.precision() - 0.5).abs() < 1e-12);
        assert!((q.recall() - 0.5).abs() < 1e-12);
    }
}

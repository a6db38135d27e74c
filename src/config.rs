//! TOML configuration for the stream processor.
//!
//! Every field is optional and falls back to a compiled-in default. Sections
//! map one-to-one onto the pipeline components: `[window]`, `[detector]`,
//! `[flow]`, `[workers]` and `[accel]`. A top-level `seed` makes every random
//! source in the pipeline reproducible.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming a config file to load.
pub const CONFIG_ENV_VAR: &str = "TELEMETRY_STREAM_CONFIG";

/// Invalid constructor parameters. Raised once, at construction.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("{field} must be within ({min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("{field} must be a finite number of seconds, got {value}")]
    InvalidDuration { field: &'static str, value: f64 },

    #[error("priority weight for '{sensor_type}' must be within (0, 1], got {weight}")]
    InvalidPriority { sensor_type: String, weight: f64 },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a [`crate::processor::StreamProcessor`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Seed for admission sampling and model construction. `None` draws from
    /// OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub accel: AccelConfig,
}

impl ProcessorConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded processor configuration");
        Ok(config)
    }

    /// Load from the file named by `TELEMETRY_STREAM_CONFIG`, falling back to
    /// compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{} set but file could not be loaded, using defaults",
                        CONFIG_ENV_VAR
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Preset for deep-excavation monitoring: lower anomaly tolerance, a
    /// stricter latency budget and a priority table covering the geotechnical
    /// instruments found on site.
    pub fn excavation() -> Self {
        let mut cfg = Self::default();
        cfg.detector.contamination = 0.05;
        cfg.flow.latency_threshold_secs = 0.05;
        cfg.flow.priority_weights.extend(
            [
                ("inclinometer", 0.95),
                ("crack", 0.95),
                ("settlement", 0.9),
                ("piezometer", 0.85),
                ("load_cell", 0.8),
                ("temperature", 0.4),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v)),
        );
        cfg
    }

    /// Check every parameter. Called by the processor constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive_usize("window.window_size", self.window.window_size)?;
        positive_usize("window.stride", self.window.stride)?;

        in_range("detector.contamination", self.detector.contamination, 0.0, 0.5)?;
        positive_usize(
            "detector.min_training_samples",
            self.detector.min_training_samples,
        )?;
        positive_usize("detector.retrain_interval", self.detector.retrain_interval)?;

        positive_f64("flow.max_throughput", self.flow.max_throughput)?;
        duration_secs("flow.latency_threshold_secs", self.flow.latency_threshold_secs)?;
        duration_secs(
            "flow.adaptation_interval_secs",
            self.flow.adaptation_interval_secs,
        )?;
        in_range("flow.default_priority", self.flow.default_priority, 0.0, 1.0)?;
        for (sensor_type, &weight) in &self.flow.priority_weights {
            if !(weight > 0.0 && weight <= 1.0) {
                return Err(ConfigError::InvalidPriority {
                    sensor_type: sensor_type.clone(),
                    weight,
                });
            }
        }

        positive_usize("workers.num_workers", self.workers.num_workers)?;
        positive_usize("workers.buffer_size", self.workers.buffer_size)?;
        Ok(())
    }
}

fn positive_usize(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive { field });
    }
    Ok(())
}

fn positive_f64(field: &'static str, value: f64) -> Result<(), ConfigError> {
    // NaN fails this comparison too.
    if !(value > 0.0) {
        return Err(ConfigError::NotPositive { field });
    }
    Ok(())
}

/// Positive and representable as a `Duration`.
fn duration_secs(field: &'static str, value: f64) -> Result<(), ConfigError> {
    positive_f64(field, value)?;
    if Duration::try_from_secs_f64(value).is_err() {
        return Err(ConfigError::InvalidDuration { field, value });
    }
    Ok(())
}

fn in_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if !(value > min && value <= max) {
        return Err(ConfigError::OutOfRange {
            field,
            min,
            max,
            value,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// Sliding-window aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Number of readings retained per sensor.
    pub window_size: usize,
    /// A snapshot is emitted every `stride` readings once the window is full.
    pub stride: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            stride: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Online anomaly detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Expected fraction of anomalous readings in a nominal stream.
    pub contamination: f64,
    /// Whether the trainable isolation-forest scorer joins the ensemble.
    pub model_scorer: bool,
    /// Samples required before the trainable scorer is first fitted.
    pub min_training_samples: usize,
    /// New samples between refits once a full window has been seen.
    pub retrain_interval: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            contamination: 0.1,
            model_scorer: true,
            min_training_samples: 50,
            retrain_interval: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Flow control
// ---------------------------------------------------------------------------

/// Admission control and backpressure settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Target ceiling on completed records per second.
    pub max_throughput: f64,
    /// Per-record latency budget (seconds).
    pub latency_threshold_secs: f64,
    /// How often the backpressure factor is re-tuned (seconds).
    pub adaptation_interval_secs: f64,
    /// Priority for sensors that match no entry in `priority_weights`.
    pub default_priority: f64,
    /// Sensor type substring -> admission weight.
    pub priority_weights: BTreeMap<String, f64>,
}

impl FlowConfig {
    pub fn latency_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.latency_threshold_secs)
    }

    pub fn adaptation_interval(&self) -> Duration {
        Duration::from_secs_f64(self.adaptation_interval_secs)
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        let priority_weights = [
            ("displacement", 1.0),
            ("strain", 0.9),
            ("pressure", 0.8),
            ("temperature", 0.5),
            ("humidity", 0.3),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            max_throughput: 10_000.0,
            latency_threshold_secs: 0.1,
            adaptation_interval_secs: 1.0,
            default_priority: 0.7,
            priority_weights,
        }
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Worker pool and queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub num_workers: usize,
    /// Capacity of the input queue and of the output queue.
    pub buffer_size: usize,
    /// How long `submit` waits for a result.
    pub result_timeout_ms: u64,
    /// Period of the statistics reporter.
    pub stats_interval_secs: u64,
    /// Overall budget for joining workers on stop.
    pub shutdown_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            buffer_size: 10_000,
            result_timeout_ms: 5_000,
            stats_interval_secs: 5,
            shutdown_timeout_secs: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Acceleration
// ---------------------------------------------------------------------------

/// Which value-cleaning backend to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// Pick the best backend the host supports.
    #[default]
    Auto,
    Scalar,
    Simd,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    pub backend: BackendPreference,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = ProcessorConfig::default();

        assert_eq!(cfg.seed, None);
        assert_eq!(cfg.window.window_size, 1000);
        assert_eq!(cfg.window.stride, 100);
        assert_eq!(cfg.detector.contamination, 0.1);
        assert!(cfg.detector.model_scorer);
        assert_eq!(cfg.flow.max_throughput, 10_000.0);
        assert_eq!(cfg.flow.latency_threshold_secs, 0.1);
        assert_eq!(cfg.flow.adaptation_interval_secs, 1.0);
        assert_eq!(cfg.flow.default_priority, 0.7);
        assert_eq!(cfg.flow.priority_weights.get("displacement"), Some(&1.0));
        assert_eq!(cfg.flow.priority_weights.get("humidity"), Some(&0.3));
        assert_eq!(cfg.workers.num_workers, 4);
        assert_eq!(cfg.workers.buffer_size, 10_000);
        assert_eq!(cfg.accel.backend, BackendPreference::Auto);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
seed = 7

[window]
window_size = 500
stride = 50

[detector]
contamination = 0.05
model_scorer = false

[flow]
max_throughput = 2000.0
latency_threshold_secs = 0.02

[flow.priority_weights]
tiltmeter = 0.95

[workers]
num_workers = 6
buffer_size = 5000

[accel]
backend = "scalar"
"#;

        let cfg: ProcessorConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.seed, Some(7));
        assert_eq!(cfg.window.window_size, 500);
        assert_eq!(cfg.window.stride, 50);
        assert_eq!(cfg.detector.contamination, 0.05);
        assert!(!cfg.detector.model_scorer);
        // Unset fields keep their defaults.
        assert_eq!(cfg.detector.retrain_interval, 500);
        assert_eq!(cfg.flow.max_throughput, 2000.0);
        assert_eq!(cfg.flow.adaptation_interval_secs, 1.0);
        // A table in the file replaces the default table.
        assert_eq!(cfg.flow.priority_weights.len(), 1);
        assert_eq!(cfg.workers.num_workers, 6);
        assert_eq!(cfg.workers.result_timeout_ms, 5000);
        assert_eq!(cfg.accel.backend, BackendPreference::Scalar);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[workers]\nnum_workers = 2").unwrap();

        let cfg = ProcessorConfig::load(file.path()).unwrap();
        assert_eq!(cfg.workers.num_workers, 2);
        assert_eq!(cfg.window.window_size, 1000);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = ProcessorConfig::load(Path::new("/nonexistent/telemetry.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let mut cfg = ProcessorConfig::default();
        cfg.window.window_size = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::NotPositive {
                field: "window.window_size"
            })
        );

        let mut cfg = ProcessorConfig::default();
        cfg.detector.contamination = 0.7;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange {
                field: "detector.contamination",
                ..
            })
        ));

        let mut cfg = ProcessorConfig::default();
        cfg.flow.latency_threshold_secs = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = ProcessorConfig::default();
        cfg.flow.latency_threshold_secs = f64::INFINITY;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::InvalidDuration {
                field: "flow.latency_threshold_secs",
                value: f64::INFINITY,
            })
        );

        let mut cfg = ProcessorConfig::default();
        cfg.flow.adaptation_interval_secs = 1e30;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidDuration {
                field: "flow.adaptation_interval_secs",
                ..
            })
        ));

        let mut cfg = ProcessorConfig::default();
        cfg.flow.priority_weights.insert("vibration".into(), 1.5);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidPriority { .. })
        ));

        let mut cfg = ProcessorConfig::default();
        cfg.workers.num_workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_excavation_preset() {
        let cfg = ProcessorConfig::excavation();
        assert_eq!(cfg.detector.contamination, 0.05);
        assert_eq!(cfg.flow.latency_threshold_secs, 0.05);
        assert_eq!(cfg.flow.priority_weights.get("inclinometer"), Some(&0.95));
        assert_eq!(cfg.flow.priority_weights.get("temperature"), Some(&0.4));
        assert_eq!(cfg.flow.priority_weights.get("displacement"), Some(&1.0));
        assert!(cfg.validate().is_ok());
    }
}

//! Values flowing through the pipeline.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single sensor reading as produced by the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamData {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl StreamData {
    /// A reading stamped with the current time and no metadata.
    pub fn new(sensor_id: impl Into<String>, value: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp: Utc::now(),
            value,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Which point of the pipeline produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStage {
    /// All stages ran.
    Complete,
    /// All stages ran and the reading closed a window snapshot.
    WindowSnapshot,
}

/// Pipeline output for one admitted reading.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub data: StreamData,
    pub processed_value: f64,
    /// Ensemble score in `[0, 1]`.
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    /// Time spent in the pipeline stages, excluding queueing.
    pub processing_time: Duration,
    pub stage: ResultStage,
}

//! Per-sensor sliding windows and rolling statistics.
//!
//! Each sensor owns a fixed-capacity ring buffer behind its own mutex. The
//! map of sensors sits behind an `RwLock` that is only held long enough to
//! find or create an entry, so workers handling different sensors never wait
//! on each other while computing statistics.

pub mod stats;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::WindowConfig;
use crate::data::StreamData;
use stats::StatsError;

/// Minimum samples before trend and volatility are reported.
const TREND_MIN_SAMPLES: usize = 10;

/// Rolling statistics for one full window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStatistics {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub p95: f64,
    pub rms: f64,
    /// Least-squares slope against sample index.
    pub trend: Option<f64>,
    pub volatility: Option<f64>,
}

/// A snapshot emitted on a stride boundary.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStatsReport {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub window_len: usize,
    pub statistics: WindowStatistics,
}

/// Ring buffer and last snapshot for a single sensor.
#[derive(Debug)]
pub struct WindowState {
    buffer: VecDeque<f64>,
    capacity: usize,
    total_seen: u64,
    statistics: Option<WindowStatistics>,
    last_update: Option<DateTime<Utc>>,
}

impl WindowState {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            total_seen: 0,
            statistics: None,
            last_update: None,
        }
    }

    fn push(&mut self, value: f64, at: DateTime<Utc>) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(value);
        self.total_seen += 1;
        self.last_update = Some(at);
    }

    fn view(&self) -> WindowStateView {
        WindowStateView {
            len: self.buffer.len(),
            capacity: self.capacity,
            total_seen: self.total_seen,
            statistics: self.statistics.clone(),
            last_update: self.last_update,
        }
    }
}

/// Read-only diagnostics for a sensor window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStateView {
    pub len: usize,
    pub capacity: usize,
    pub total_seen: u64,
    pub statistics: Option<WindowStatistics>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Maintains one [`WindowState`] per sensor.
pub struct WindowAggregator {
    window_size: usize,
    stride: usize,
    windows: RwLock<HashMap<String, Arc<Mutex<WindowState>>>>,
}

impl WindowAggregator {
    pub fn new(config: &WindowConfig) -> Self {
        Self {
            window_size: config.window_size,
            stride: config.stride,
            windows: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, sensor_id: &str) -> Arc<Mutex<WindowState>> {
        if let Some(state) = self
            .windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sensor_id)
        {
            return Arc::clone(state);
        }

        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        let state = windows.entry(sensor_id.to_string()).or_insert_with(|| {
            debug!(sensor_id, capacity = self.window_size, "creating sensor window");
            Arc::new(Mutex::new(WindowState::new(self.window_size)))
        });
        Arc::clone(state)
    }

    /// Append a reading. Returns a report when the window is full and the
    /// sensor's running count lands on a stride boundary.
    pub fn add_data_point(&self, data: &StreamData) -> Option<WindowStatsReport> {
        let entry = self.entry(&data.sensor_id);
        let mut window = entry.lock().unwrap_or_else(PoisonError::into_inner);

        window.push(data.value, data.timestamp);

        let due = window.buffer.len() == self.window_size
            && window.total_seen % self.stride as u64 == 0;
        if !due {
            return None;
        }

        let values: Vec<f64> = window.buffer.iter().copied().collect();
        let statistics = compute_statistics(&data.sensor_id, &values);
        window.statistics = Some(statistics.clone());

        Some(WindowStatsReport {
            sensor_id: data.sensor_id.clone(),
            timestamp: data.timestamp,
            window_len: values.len(),
            statistics,
        })
    }

    pub fn get_window_state(&self, sensor_id: &str) -> Option<WindowStateView> {
        let windows = self.windows.read().unwrap_or_else(PoisonError::into_inner);
        let state = windows.get(sensor_id)?;
        let view = state.lock().unwrap_or_else(PoisonError::into_inner).view();
        Some(view)
    }

    pub fn sensor_count(&self) -> usize {
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Substitute 0.0 for a failed statistic and log it.
fn or_zero(sensor_id: &str, name: &'static str, result: Result<f64, StatsError>) -> f64 {
    result.unwrap_or_else(|e| {
        warn!(sensor_id, statistic = name, error = %e, "window statistic failed, using 0.0");
        0.0
    })
}

fn compute_statistics(sensor_id: &str, values: &[f64]) -> WindowStatistics {
    let sorted = stats::sorted(values);

    let mut out = WindowStatistics {
        mean: or_zero(sensor_id, "mean", stats::mean(values)),
        std: or_zero(sensor_id, "std", stats::std_dev(values)),
        min: or_zero(sensor_id, "min", stats::min(values)),
        max: or_zero(sensor_id, "max", stats::max(values)),
        median: or_zero(sensor_id, "median", stats::percentile_sorted(&sorted, 50.0)),
        p95: or_zero(sensor_id, "p95", stats::percentile_sorted(&sorted, 95.0)),
        rms: or_zero(sensor_id, "rms", stats::rms(values)),
        trend: None,
        volatility: None,
    };

    if values.len() >= TREND_MIN_SAMPLES {
        out.trend = Some(or_zero(sensor_id, "trend", stats::trend(values)));
        out.volatility = Some(or_zero(sensor_id, "volatility", stats::volatility(values)));
    }
    out
}

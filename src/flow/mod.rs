//! Priority-aware probabilistic admission control.
//!
//! Every reading is admitted with a probability derived from the current
//! latency and throughput, the sensor's priority and a backpressure factor.
//! The factor is re-tuned once per adaptation interval from rolling means of
//! the observed latency, so overload degrades the admitted fraction smoothly
//! instead of cutting traffic off.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, trace};

use crate::config::FlowConfig;
use crate::data::StreamData;

const HISTORY_LEN: usize = 100;
const MIN_ADMISSION: f64 = 0.1;
const MAX_LATENCY_PENALTY: f64 = 0.5;
const THROUGHPUT_PENALTY: f64 = 0.3;
const THROUGHPUT_HEADROOM: f64 = 0.9;
const BACKPRESSURE_FLOOR: f64 = 0.5;
const BACKPRESSURE_DECREASE: f64 = 0.1;
const BACKPRESSURE_INCREASE: f64 = 0.05;

/// Sensor priority lookup: exact per-sensor overrides, then the longest
/// sensor-type substring found in the id, then the default.
#[derive(Debug, Clone)]
pub struct PriorityTable {
    by_type: Vec<(String, f64)>,
    overrides: HashMap<String, f64>,
    default: f64,
}

impl PriorityTable {
    pub fn new(weights: &BTreeMap<String, f64>, default: f64) -> Self {
        let mut by_type: Vec<(String, f64)> = weights
            .iter()
            .map(|(k, &v)| (k.to_lowercase(), v))
            .collect();
        by_type.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self {
            by_type,
            overrides: HashMap::new(),
            default,
        }
    }

    pub fn priority(&self, sensor_id: &str) -> f64 {
        if let Some(&weight) = self.overrides.get(sensor_id) {
            return weight;
        }
        let id = sensor_id.to_lowercase();
        self.by_type
            .iter()
            .find(|(sensor_type, _)| id.contains(sensor_type.as_str()))
            .map(|&(_, weight)| weight)
            .unwrap_or(self.default)
    }
}

/// Shared admission state, re-tuned every adaptation interval.
#[derive(Debug, Clone)]
pub struct FlowControlState {
    pub current_throughput: f64,
    /// Seconds.
    pub current_latency: f64,
    pub current_queue_depth: usize,
    pub backpressure_factor: f64,
    pub drop_rate: f64,
    latency_history: VecDeque<f64>,
    throughput_history: VecDeque<f64>,
    completions: u64,
    last_adaptation: Instant,
}

impl FlowControlState {
    fn new(now: Instant) -> Self {
        Self {
            current_throughput: 0.0,
            current_latency: 0.0,
            current_queue_depth: 0,
            backpressure_factor: 1.0,
            drop_rate: 0.0,
            latency_history: VecDeque::with_capacity(HISTORY_LEN),
            throughput_history: VecDeque::with_capacity(HISTORY_LEN),
            completions: 0,
            last_adaptation: now,
        }
    }
}

/// Point-in-time view of the flow controller.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSnapshot {
    pub current_throughput: f64,
    pub current_latency_secs: f64,
    pub current_queue_depth: usize,
    pub backpressure_factor: f64,
    pub drop_rate: f64,
    pub avg_latency_secs: f64,
    pub avg_throughput: f64,
}

pub struct FlowController {
    max_throughput: f64,
    latency_threshold: f64,
    adaptation_interval: Duration,
    state: Mutex<FlowControlState>,
    priorities: RwLock<PriorityTable>,
    rng: Mutex<StdRng>,
}

impl FlowController {
    pub fn new(config: &FlowConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            max_throughput: config.max_throughput,
            latency_threshold: config.latency_threshold().as_secs_f64(),
            adaptation_interval: config.adaptation_interval(),
            state: Mutex::new(FlowControlState::new(Instant::now())),
            priorities: RwLock::new(PriorityTable::new(
                &config.priority_weights,
                config.default_priority,
            )),
            rng: Mutex::new(rng),
        }
    }

    /// Probabilistic admission decision for one reading.
    pub fn should_process(&self, data: &StreamData) -> bool {
        let probability = self.admission_probability(&data.sensor_id);
        let draw: f64 = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen();
        let admit = draw < probability;
        if !admit {
            trace!(sensor_id = %data.sensor_id, probability, "reading not admitted");
        }
        admit
    }

    pub fn admission_probability(&self, sensor_id: &str) -> f64 {
        let priority = self.sensor_priority(sensor_id);
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        admission_probability(
            state.current_latency,
            self.latency_threshold,
            state.current_throughput,
            self.max_throughput,
            priority,
            state.backpressure_factor,
        )
    }

    pub fn sensor_priority(&self, sensor_id: &str) -> f64 {
        self.priorities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .priority(sensor_id)
    }

    /// Pin a specific sensor's priority, overriding the type table.
    pub fn set_sensor_priority(&self, sensor_id: impl Into<String>, weight: f64) {
        let sensor_id = sensor_id.into();
        info!(%sensor_id, weight, "sensor priority override");
        self.priorities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .overrides
            .insert(sensor_id, weight.clamp(0.0, 1.0));
    }

    /// Feed back one completed record.
    pub fn update_metrics(&self, processing_time: Duration, queue_size: usize) {
        self.record(processing_time.as_secs_f64(), queue_size, Instant::now());
    }

    fn record(&self, latency: f64, queue_size: usize, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        state.current_latency = latency;
        state.current_queue_depth = queue_size;
        push_bounded(&mut state.latency_history, latency);
        state.completions += 1;

        let elapsed = now.saturating_duration_since(state.last_adaptation);
        if elapsed < self.adaptation_interval {
            return;
        }

        let rate = state.completions as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        state.current_throughput = rate.min(self.max_throughput);
        let throughput = state.current_throughput;
        push_bounded(&mut state.throughput_history, throughput);
        state.completions = 0;
        state.last_adaptation = now;

        self.adapt(&mut state);
    }

    fn adapt(&self, state: &mut FlowControlState) {
        let avg_latency = mean(&state.latency_history);
        let avg_throughput = mean(&state.throughput_history);

        if avg_latency > self.latency_threshold * 1.2 {
            state.backpressure_factor =
                (state.backpressure_factor - BACKPRESSURE_DECREASE).max(BACKPRESSURE_FLOOR);
            info!(
                avg_latency,
                avg_throughput,
                backpressure_factor = state.backpressure_factor,
                "latency above target, tightening admission"
            );
        } else if avg_latency < self.latency_threshold * 0.8 && state.backpressure_factor < 1.0 {
            state.backpressure_factor =
                (state.backpressure_factor + BACKPRESSURE_INCREASE).min(1.0);
            info!(
                avg_latency,
                avg_throughput,
                backpressure_factor = state.backpressure_factor,
                "latency within target, relaxing admission"
            );
        }
        state.drop_rate = 1.0 - state.backpressure_factor;
    }

    pub fn backpressure_factor(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .backpressure_factor
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        FlowSnapshot {
            current_throughput: state.current_throughput,
            current_latency_secs: state.current_latency,
            current_queue_depth: state.current_queue_depth,
            backpressure_factor: state.backpressure_factor,
            drop_rate: state.drop_rate,
            avg_latency_secs: mean(&state.latency_history),
            avg_throughput: mean(&state.throughput_history),
        }
    }
}

/// `clamp(1 - latency_penalty - throughput_penalty, 0.1, 1) * priority * backpressure`
pub fn admission_probability(
    latency: f64,
    latency_threshold: f64,
    throughput: f64,
    max_throughput: f64,
    priority: f64,
    backpressure_factor: f64,
) -> f64 {
    let latency_penalty = if latency > latency_threshold {
        ((latency - latency_threshold) / latency_threshold).min(MAX_LATENCY_PENALTY)
    } else {
        0.0
    };
    let throughput_penalty = if throughput > max_throughput * THROUGHPUT_HEADROOM {
        THROUGHPUT_PENALTY
    } else {
        0.0
    };
    let base = (1.0 - latency_penalty - throughput_penalty).clamp(MIN_ADMISSION, 1.0);
    base * priority * backpressure_factor
}

fn push_bounded(history: &mut VecDeque<f64>, value: f64) {
    if history.len() == HISTORY_LEN {
        history.pop_front();
    }
    history.push_back(value);
}

fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

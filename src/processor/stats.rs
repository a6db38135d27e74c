//! Process-wide counters shared by every worker.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::detect::DetectionCounters;
use crate::flow::FlowSnapshot;
use crate::window::stats;

/// Processing times kept for the timing summary.
const TIMING_HISTORY_LEN: usize = 1000;

/// Why a reading never produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Rejected by the flow controller.
    Admission,
    /// Input queue was full.
    QueueFull,
    /// Submitted while the processor was not running, or still queued at stop.
    Stopped,
    /// A pipeline stage panicked.
    PipelineFault,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropBreakdown {
    pub admission: u64,
    pub queue_full: u64,
    pub stopped: u64,
    pub pipeline_fault: u64,
}

impl DropBreakdown {
    pub fn total(&self) -> u64 {
        self.admission + self.queue_full + self.stopped + self.pipeline_fault
    }
}

/// Processing-time summary in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimingSummary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
}

/// Shared pipeline counters.
#[derive(Debug)]
pub struct SystemStats {
    total_processed: AtomicU64,
    total_anomalies: AtomicU64,
    dropped_admission: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_stopped: AtomicU64,
    dropped_pipeline_fault: AtomicU64,
    results_discarded: AtomicU64,
    processing_times: Mutex<VecDeque<f64>>,
    /// Start of the current run and `total_processed` at that instant.
    run_start: Mutex<(Instant, u64)>,
}

impl Default for SystemStats {
    fn default() -> Self {
        Self {
            total_processed: AtomicU64::new(0),
            total_anomalies: AtomicU64::new(0),
            dropped_admission: AtomicU64::new(0),
            dropped_queue_full: AtomicU64::new(0),
            dropped_stopped: AtomicU64::new(0),
            dropped_pipeline_fault: AtomicU64::new(0),
            results_discarded: AtomicU64::new(0),
            processing_times: Mutex::new(VecDeque::with_capacity(TIMING_HISTORY_LEN)),
            run_start: Mutex::new((Instant::now(), 0)),
        }
    }
}

impl SystemStats {
    pub fn record_result(&self, processing_time: Duration, is_anomaly: bool) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        if is_anomaly {
            self.total_anomalies.fetch_add(1, Ordering::Relaxed);
        }
        let mut times = self
            .processing_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if times.len() == TIMING_HISTORY_LEN {
            times.pop_front();
        }
        times.push_back(processing_time.as_secs_f64());
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Admission => &self.dropped_admission,
            DropReason::QueueFull => &self.dropped_queue_full,
            DropReason::Stopped => &self.dropped_stopped,
            DropReason::PipelineFault => &self.dropped_pipeline_fault,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A result was produced but the output queue had no room for it.
    pub fn record_discarded(&self) {
        self.results_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Start a new run. Lifetime counters keep counting; throughput only
    /// covers readings processed since this call.
    pub fn reset_clock(&self) {
        let mut run_start = self.run_start.lock().unwrap_or_else(PoisonError::into_inner);
        *run_start = (Instant::now(), self.total_processed());
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed.load(Ordering::Relaxed)
    }

    pub fn drops(&self) -> DropBreakdown {
        DropBreakdown {
            admission: self.dropped_admission.load(Ordering::Relaxed),
            queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            stopped: self.dropped_stopped.load(Ordering::Relaxed),
            pipeline_fault: self.dropped_pipeline_fault.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let (run_started, run_baseline) =
            *self.run_start.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed_secs = run_started.elapsed().as_secs_f64();
        let times: Vec<f64> = self
            .processing_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();

        let total_processed = self.total_processed();
        let total_anomalies = self.total_anomalies.load(Ordering::Relaxed);
        let drops = self.drops();
        let total_dropped = drops.total();
        let attempted = total_processed + total_dropped;

        StatsSnapshot {
            elapsed_secs,
            throughput: if elapsed_secs > 0.0 {
                total_processed.saturating_sub(run_baseline) as f64 / elapsed_secs
            } else {
                0.0
            },
            total_processed,
            total_anomalies,
            total_dropped,
            drops,
            results_discarded: self.results_discarded.load(Ordering::Relaxed),
            anomaly_rate: ratio(total_anomalies, total_processed),
            drop_rate: ratio(total_dropped, attempted),
            processing_time: summarize(&times),
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn summarize(times: &[f64]) -> TimingSummary {
    if times.is_empty() {
        return TimingSummary::default();
    }
    TimingSummary {
        avg: stats::mean(times).unwrap_or(0.0),
        min: stats::min(times).unwrap_or(0.0),
        max: stats::max(times).unwrap_or(0.0),
        p95: stats::percentile(times, 95.0).unwrap_or(0.0),
    }
}

/// Counter values at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Seconds since the current run started.
    pub elapsed_secs: f64,
    /// Readings processed in the current run, per second.
    pub throughput: f64,
    pub total_processed: u64,
    pub total_anomalies: u64,
    pub total_dropped: u64,
    pub drops: DropBreakdown,
    pub results_discarded: u64,
    pub anomaly_rate: f64,
    pub drop_rate: f64,
    pub processing_time: TimingSummary,
}

/// Everything `get_performance_statistics` reports.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStatistics {
    #[serde(flatten)]
    pub system: StatsSnapshot,
    pub flow: FlowSnapshot,
    pub sensors: BTreeMap<String, DetectionCounters>,
}

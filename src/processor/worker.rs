//! Worker and reporter tasks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accel::AccelerationManager;
use crate::config::ProcessorConfig;
use crate::data::{ProcessingResult, ResultStage, StreamData};
use crate::detect::AnomalyDetector;
use crate::flow::FlowController;
use crate::processor::stats::{DropReason, SystemStats};
use crate::window::WindowAggregator;

/// A queued reading.
#[derive(Debug)]
pub(crate) struct Job {
    pub data: StreamData,
    pub enqueued_at: Instant,
}

impl Job {
    pub fn new(data: StreamData) -> Self {
        Self {
            data,
            enqueued_at: Instant::now(),
        }
    }
}

/// Components shared by every worker.
pub(crate) struct Pipeline {
    pub aggregator: WindowAggregator,
    pub detector: AnomalyDetector,
    pub flow: FlowController,
    pub accel: AccelerationManager,
    pub stats: SystemStats,
}

impl Pipeline {
    pub fn new(config: &ProcessorConfig) -> Self {
        Self {
            aggregator: WindowAggregator::new(&config.window),
            detector: AnomalyDetector::new(
                &config.detector,
                config.window.window_size,
                config.seed,
            ),
            flow: FlowController::new(&config.flow, config.seed),
            accel: AccelerationManager::new(config.accel.backend),
            stats: SystemStats::default(),
        }
    }

    /// Window, detect, clean.
    pub fn process(&self, data: StreamData) -> ProcessingResult {
        let started = Instant::now();

        let report = self.aggregator.add_data_point(&data);
        let (is_anomaly, anomaly_score) = self.detector.detect_anomaly(&data, report.as_ref());
        let processed_value = self.accel.clean(data.value);

        let stage = if report.is_some() {
            ResultStage::WindowSnapshot
        } else {
            ResultStage::Complete
        };

        ProcessingResult {
            data,
            processed_value,
            anomaly_score,
            is_anomaly,
            processing_time: started.elapsed(),
            stage,
        }
    }
}

/// Queue endpoints handed to each worker.
pub(crate) struct WorkerQueues {
    pub input: Arc<AsyncMutex<Receiver<Job>>>,
    /// Used only to read the input queue depth.
    pub input_probe: Sender<Job>,
    pub output: Sender<ProcessingResult>,
}

/// Dequeue and process until cancelled. A record already dequeued always
/// runs to completion.
pub(crate) async fn run(
    id: usize,
    pipeline: Arc<Pipeline>,
    queues: WorkerQueues,
    cancel: CancellationToken,
) {
    debug!(worker = id, "worker started");

    loop {
        // Cancellation wins over queued work so nothing is dequeued after stop.
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            job = async { queues.input.lock().await.recv().await } => job,
        };
        let Some(job) = next else {
            break;
        };

        let sensor_id = job.data.sensor_id.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| pipeline.process(job.data)));

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                pipeline.stats.record_drop(DropReason::PipelineFault);
                error!(worker = id, %sensor_id, "pipeline stage panicked, reading dropped");
                continue;
            }
        };

        pipeline
            .stats
            .record_result(result.processing_time, result.is_anomaly);

        let depth = queues.input_probe.max_capacity() - queues.input_probe.capacity();
        pipeline.flow.update_metrics(job.enqueued_at.elapsed(), depth);

        match queues.output.try_send(result) {
            Ok(()) => {}
            Err(TrySendError::Full(result)) => {
                pipeline.stats.record_discarded();
                warn!(
                    worker = id,
                    sensor_id = %result.data.sensor_id,
                    "output queue full, discarding result"
                );
            }
            Err(TrySendError::Closed(_)) => {
                pipeline.stats.record_discarded();
                debug!(worker = id, "output queue closed");
            }
        }
    }

    debug!(worker = id, "worker exiting");
}

/// Log aggregate statistics on a fixed interval until cancelled.
pub(crate) async fn report_stats(
    pipeline: Arc<Pipeline>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    // First tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let snap = pipeline.stats.snapshot();
                let flow = pipeline.flow.snapshot();
                info!(
                    processed = snap.total_processed,
                    anomalies = snap.total_anomalies,
                    dropped = snap.total_dropped,
                    throughput = %format!("{:.1}", snap.throughput),
                    avg_processing_ms = %format!("{:.3}", snap.processing_time.avg * 1000.0),
                    backpressure = flow.backpressure_factor,
                    "pipeline statistics"
                );
            }
        }
    }
}

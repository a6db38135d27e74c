//! Stream processor: bounded queues, a fixed worker pool and the public
//! submit/retrieve API.
//!
//! Readings pass admission control, then go through a non-blocking enqueue
//! onto the bounded input queue. Workers run window aggregation, anomaly
//! detection and value cleaning, then publish onto the bounded output queue.
//! Every reading that does not produce a result is counted as a drop with a
//! reason. Callers never see an error from `submit`.

pub mod health;
pub mod stats;
pub(crate) mod worker;

pub use health::{HealthAssessment, HealthGrade, HealthInputs, HealthReport};
pub use stats::{DropBreakdown, DropReason, PerformanceStatistics, StatsSnapshot, TimingSummary};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accel::Backend;
use crate::config::{ConfigError, ProcessorConfig};
use crate::data::{ProcessingResult, StreamData};
use crate::flow::FlowController;
use crate::window::WindowStateView;
use worker::{Job, Pipeline, WorkerQueues};

/// How long `stop` waits for the input receiver before draining.
const DRAIN_LOCK_TIMEOUT: Duration = Duration::from_millis(250);

/// Input side of a running processor.
#[derive(Clone)]
struct InputQueue {
    tx: Sender<Job>,
    rx: Arc<AsyncMutex<Receiver<Job>>>,
}

struct OutputQueue {
    /// Kept for depth reporting.
    tx: Sender<ProcessingResult>,
    rx: Arc<AsyncMutex<Receiver<ProcessingResult>>>,
}

struct Tasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct StreamProcessor {
    config: ProcessorConfig,
    pipeline: Arc<Pipeline>,
    running: AtomicBool,
    input: RwLock<Option<InputQueue>>,
    output: RwLock<Option<OutputQueue>>,
    tasks: AsyncMutex<Option<Tasks>>,
}

impl StreamProcessor {
    /// Build a stopped processor. Invalid configuration is rejected here and
    /// nowhere else.
    pub fn new(config: ProcessorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let pipeline = Arc::new(Pipeline::new(&config));

        info!(
            window_size = config.window.window_size,
            stride = config.window.stride,
            workers = config.workers.num_workers,
            buffer_size = config.workers.buffer_size,
            backend = ?pipeline.accel.backend(),
            "stream processor created"
        );

        Ok(Self {
            config,
            pipeline,
            running: AtomicBool::new(false),
            input: RwLock::new(None),
            output: RwLock::new(None),
            tasks: AsyncMutex::new(None),
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the worker pool and the statistics reporter. Calling this while
    /// running only logs a warning.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            warn!("stream processor already running");
            return;
        }

        let buffer_size = self.config.workers.buffer_size;
        let (input_tx, input_rx) = mpsc::channel::<Job>(buffer_size);
        let (output_tx, output_rx) = mpsc::channel::<ProcessingResult>(buffer_size);
        let input_rx = Arc::new(AsyncMutex::new(input_rx));
        let cancel = CancellationToken::new();

        self.pipeline.stats.reset_clock();

        let mut handles: Vec<JoinHandle<()>> = (0..self.config.workers.num_workers)
            .map(|id| {
                let queues = WorkerQueues {
                    input: Arc::clone(&input_rx),
                    input_probe: input_tx.clone(),
                    output: output_tx.clone(),
                };
                tokio::spawn(worker::run(
                    id,
                    Arc::clone(&self.pipeline),
                    queues,
                    cancel.clone(),
                ))
            })
            .collect();
        handles.push(tokio::spawn(worker::report_stats(
            Arc::clone(&self.pipeline),
            self.config.workers.stats_interval(),
            cancel.clone(),
        )));

        *self.output.write().unwrap_or_else(PoisonError::into_inner) = Some(OutputQueue {
            tx: output_tx,
            rx: Arc::new(AsyncMutex::new(output_rx)),
        });
        *self.input.write().unwrap_or_else(PoisonError::into_inner) = Some(InputQueue {
            tx: input_tx,
            rx: input_rx,
        });
        self.running.store(true, Ordering::Release);
        *tasks = Some(Tasks { cancel, handles });

        info!(
            workers = self.config.workers.num_workers,
            "stream processor started"
        );
    }

    /// Signal workers to finish, join them under the shutdown timeout and
    /// count any still-queued readings as dropped.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            debug!("stream processor already stopped");
            return;
        };

        self.running.store(false, Ordering::Release);
        let input = self
            .input
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        tasks.cancel.cancel();
        let timeout = self.config.workers.shutdown_timeout();
        match tokio::time::timeout(timeout, join_all(tasks.handles)).await {
            Ok(results) => {
                for err in results.into_iter().filter_map(Result::err) {
                    error!(error = %err, "worker task failed");
                }
            }
            Err(_) => {
                error!(
                    timeout_secs = timeout.as_secs(),
                    "workers did not exit within the shutdown timeout, detaching"
                );
            }
        }

        if let Some(input) = input {
            self.drain_leftover(&input).await;
        }

        let snap = self.pipeline.stats.snapshot();
        info!(
            processed = snap.total_processed,
            anomalies = snap.total_anomalies,
            dropped = snap.total_dropped,
            "stream processor stopped"
        );
    }

    /// Count readings still queued after the workers exit as `stopped`.
    ///
    /// Workers never dequeue once cancelled, so when the receiver lock cannot
    /// be had in time the queue depth is still an exact count.
    async fn drain_leftover(&self, input: &InputQueue) {
        let mut leftover = 0u64;
        match tokio::time::timeout(DRAIN_LOCK_TIMEOUT, input.rx.lock()).await {
            Ok(mut rx) => {
                rx.close();
                while rx.try_recv().is_ok() {
                    self.pipeline.stats.record_drop(DropReason::Stopped);
                    leftover += 1;
                }
            }
            Err(_) => {
                let queued = input.tx.max_capacity() - input.tx.capacity();
                for _ in 0..queued {
                    self.pipeline.stats.record_drop(DropReason::Stopped);
                }
                leftover = queued as u64;
                warn!(
                    queued,
                    "input queue still locked at shutdown, counting queued readings as dropped"
                );
            }
        }
        if leftover > 0 {
            warn!(leftover, "readings still queued at shutdown were dropped");
        }
    }

    /// Admit and enqueue a reading without waiting for its result.
    ///
    /// Returns `false` when the reading was dropped.
    pub fn enqueue(&self, data: StreamData) -> bool {
        if !self.is_running() {
            self.pipeline.stats.record_drop(DropReason::Stopped);
            debug!(sensor_id = %data.sensor_id, "processor not running, reading dropped");
            return false;
        }

        if !self.pipeline.flow.should_process(&data) {
            self.pipeline.stats.record_drop(DropReason::Admission);
            return false;
        }

        let tx = self
            .input
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|q| q.tx.clone());
        let Some(tx) = tx else {
            self.pipeline.stats.record_drop(DropReason::Stopped);
            return false;
        };

        match tx.try_send(Job::new(data)) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                self.pipeline.stats.record_drop(DropReason::QueueFull);
                warn!(sensor_id = %job.data.sensor_id, "input queue full, dropping reading");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.pipeline.stats.record_drop(DropReason::Stopped);
                false
            }
        }
    }

    /// Wait up to `wait` for the next result. `None` on timeout.
    pub async fn next_result(&self, wait: Duration) -> Option<ProcessingResult> {
        let rx = self
            .output
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|q| Arc::clone(&q.rx))?;

        tokio::time::timeout(wait, async { rx.lock().await.recv().await })
            .await
            .ok()
            .flatten()
    }

    /// Enqueue a reading and wait for the next available result.
    ///
    /// `None` when the reading was dropped or no result arrived within the
    /// configured result timeout.
    pub async fn submit(&self, data: StreamData) -> Option<ProcessingResult> {
        if !self.enqueue(data) {
            return None;
        }
        self.next_result(self.config.workers.result_timeout()).await
    }

    pub fn get_performance_statistics(&self) -> PerformanceStatistics {
        PerformanceStatistics {
            system: self.pipeline.stats.snapshot(),
            flow: self.pipeline.flow.snapshot(),
            sensors: self.pipeline.detector.detection_statistics(),
        }
    }

    pub fn get_system_health(&self) -> HealthReport {
        let snap = self.pipeline.stats.snapshot();
        let assessment = health::assess(&HealthInputs {
            avg_latency_secs: snap.processing_time.avg,
            drop_rate: snap.drop_rate,
            anomaly_rate: snap.anomaly_rate,
            throughput: snap.throughput,
        });

        let (input_queue_depth, output_queue_depth) = self.queue_depths();

        HealthReport {
            health_score: assessment.score,
            grade: assessment.grade,
            is_running: self.is_running(),
            worker_count: self.config.workers.num_workers,
            input_queue_depth,
            output_queue_depth,
            recommendations: assessment.recommendations,
        }
    }

    fn queue_depths(&self) -> (usize, usize) {
        let input = self
            .input
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|q| q.tx.max_capacity() - q.tx.capacity())
            .unwrap_or(0);
        let output = self
            .output
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|q| q.tx.max_capacity() - q.tx.capacity())
            .unwrap_or(0);
        (input, output)
    }

    pub fn flow_controller(&self) -> &FlowController {
        &self.pipeline.flow
    }

    pub fn window_state(&self, sensor_id: &str) -> Option<WindowStateView> {
        self.pipeline.aggregator.get_window_state(sensor_id)
    }

    pub fn accel_backend(&self) -> Backend {
        self.pipeline.accel.backend()
    }

    /// Apply the value-cleaning rule to a buffered batch in place, using the
    /// backend selected at construction.
    pub fn clean_batch(&self, values: &mut [f64]) {
        self.pipeline.accel.clean_batch(values);
    }
}

impl Drop for StreamProcessor {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().as_ref() {
            tasks.cancel.cancel();
        }
    }
}

//! telemetry-stream -- Real-time sensor telemetry processing.
//!
//! This crate provides sliding-window statistics, online anomaly detection,
//! adaptive admission control and a bounded worker-pool processor that ties
//! them together.

pub mod accel;
pub mod config;
pub mod data;
pub mod detect;
pub mod flow;
pub mod processor;
pub mod simulate;
pub mod window;

pub use config::{ConfigError, ProcessorConfig};
pub use data::{ProcessingResult, ResultStage, StreamData};
pub use detect::AnomalyDetector;
pub use flow::FlowController;
pub use processor::{HealthGrade, HealthReport, PerformanceStatistics, StreamProcessor};
pub use window::WindowAggregator;
